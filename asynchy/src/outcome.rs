//! Tagged success/failure values for results that cross task boundaries.
//!
//! Worker results travel from a pool task, through a completion callback, to
//! the driver loop. `Outcome` keeps the failure cause as a plain value at every
//! hop; [`Outcome::get_or_raise`] is where it turns back into a `Result`.

use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Failure(TransferError),
}

impl<T> Outcome<T> {
    /// Run `f` and wrap its result: `Ok` becomes `Success`, `Err` becomes
    /// `Failure`.
    pub fn attempt<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<TransferError>,
    {
        match f() {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failure(e.into()),
        }
    }

    /// Attempt `f` on the success value. A failing `f` yields a `Failure`;
    /// an existing `Failure` is passed through and `f` is never called.
    pub fn map<U, F, E>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> Result<U, E>,
        E: Into<TransferError>,
    {
        match self {
            Outcome::Success(value) => Outcome::attempt(|| f(value)),
            Outcome::Failure(cause) => Outcome::Failure(cause),
        }
    }

    /// Return the success value or the captured cause.
    pub fn get_or_raise(self) -> Result<T, TransferError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(cause) => Err(cause),
        }
    }

    /// Attempt to recover from a failure. `f` is never called on a `Success`.
    pub fn handle_error<F, E>(self, f: F) -> Outcome<T>
    where
        F: FnOnce(TransferError) -> Result<T, E>,
        E: Into<TransferError>,
    {
        match self {
            Outcome::Success(value) => Outcome::Success(value),
            Outcome::Failure(cause) => Outcome::attempt(|| f(cause)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn cause(&self) -> Option<&TransferError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(cause) => Some(cause),
        }
    }

    pub fn as_ref(&self) -> Outcome<&T> {
        match self {
            Outcome::Success(value) => Outcome::Success(value),
            Outcome::Failure(cause) => Outcome::Failure(cause.clone()),
        }
    }
}

impl<T> From<Result<T, TransferError>> for Outcome<T> {
    fn from(result: Result<T, TransferError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(cause) => Outcome::Failure(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn greeting(name: &str) -> Result<String, TransferError> {
        if name == "Joe" {
            Err(TransferError::Worker {
                reason: "no greeting for Joe".to_string(),
            })
        } else {
            Ok(format!("Hello, {}", name))
        }
    }

    #[test]
    fn test_attempt() {
        let hello = Outcome::attempt(|| greeting("Tracy"));
        assert_eq!(hello.get_or_raise().unwrap(), "Hello, Tracy");

        let joe = Outcome::attempt(|| greeting("Joe"));
        assert!(joe.is_failure());
        assert!(matches!(joe.get_or_raise(), Err(TransferError::Worker { .. })));
    }

    #[test]
    fn test_map_skips_failure() {
        let called = Cell::new(false);
        let failed: Outcome<u64> = Outcome::Failure(TransferError::Cancelled);

        let mapped = failed.map(|v| {
            called.set(true);
            Ok::<_, TransferError>(v + 1)
        });

        assert!(!called.get());
        assert_eq!(mapped, Outcome::Failure(TransferError::Cancelled));
    }

    #[test]
    fn test_map_captures_failing_transform() {
        let mapped = Outcome::Success(5u64).map(|_| Err::<u64, _>(TransferError::PoolClosed));
        assert_eq!(mapped.cause(), Some(&TransferError::PoolClosed));

        let doubled = Outcome::Success(5u64).map(|v| Ok::<_, TransferError>(v * 2));
        assert_eq!(doubled, Outcome::Success(10));
    }

    #[test]
    fn test_handle_error_skips_success() {
        let called = Cell::new(false);
        let ok = Outcome::Success(3u64).handle_error(|_| {
            called.set(true);
            Ok::<_, TransferError>(0)
        });

        assert!(!called.get());
        assert_eq!(ok, Outcome::Success(3));
    }

    #[test]
    fn test_handle_error_recovers() {
        let recovered: Outcome<u64> = Outcome::Failure(TransferError::Failed { exit_code: 23 })
            .handle_error(|cause| match cause {
                TransferError::Failed { exit_code } => Ok::<_, TransferError>(exit_code as u64),
                other => Err(other),
            });
        assert_eq!(recovered, Outcome::Success(23));

        let still_failed: Outcome<u64> = Outcome::Failure(TransferError::Cancelled)
            .handle_error(|cause| Err::<u64, _>(cause));
        assert_eq!(still_failed.cause(), Some(&TransferError::Cancelled));
    }

    #[test]
    fn test_from_result() {
        let outcome: Outcome<u8> = Err(TransferError::PoolClosed).into();
        assert!(outcome.is_failure());
        let outcome: Outcome<u8> = Ok(1).into();
        assert!(outcome.is_success());
        assert_eq!(outcome.as_ref(), Outcome::Success(&1));
    }
}
