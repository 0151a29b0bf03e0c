use parking_lot::Mutex;

/// Monotonic byte counter shared between a job's output reader and the job
/// itself.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: Mutex<u64>,
}

impl AtomicCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    /// Add `n` and return the new total.
    pub fn increment(&self, n: u64) -> u64 {
        let mut value = self.value.lock();
        *value = value.saturating_add(n);
        *value
    }

    pub fn value(&self) -> u64 {
        *self.value.lock()
    }
}
