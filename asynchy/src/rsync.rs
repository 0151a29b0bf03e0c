//! Transfers that shell out to rsync.

use crate::config::TransferConfig;
use crate::counter::AtomicCounter;
use crate::error::{AsynchyResult, TransferError};
use crate::outcome::Outcome;
use crate::pool::{JobContext, JobPool, Progress, ProgressSender, TransferHandle};
use crate::transfer::{Transfer, TransferResult};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn, Instrument};

/// Parsed lines are forwarded to the progress channel in batches of this many.
const PROGRESS_BATCH_LINES: usize = 50;

/// One line of `--out-format=%-10l`: the entry length, left aligned.
fn byte_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\s*$").expect("valid regex"))
}

/// Parse the byte count from one line of rsync output.
pub fn parse_byte_count(line: &str) -> Result<u64, TransferError> {
    let parse_error = || TransferError::OutputParse {
        line: line.to_string(),
    };

    if !byte_line_pattern().is_match(line) {
        return Err(parse_error());
    }
    line.trim_end().parse::<u64>().map_err(|_| parse_error())
}

/// Quote `value` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(value: &str) -> String {
    let is_plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));

    if is_plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'"'"'"#))
    }
}

/// A single source to copy into a destination directory.
#[derive(Debug, Clone)]
pub struct Job {
    pub source: String,
    pub destination: PathBuf,
    pub config: Arc<TransferConfig>,
}

impl Job {
    /// Arguments passed to the rsync executable.
    ///
    /// rsync itself is started without a shell. The `-e` string is split by
    /// rsync, so its values are quoted; `--protect-args` keeps the remote
    /// shell from splitting the source path.
    pub fn args(&self) -> Vec<String> {
        let config = &self.config;
        let mut args = vec!["-rt".to_string()];

        if config.compress {
            args.push("-z".to_string());
        }

        if let Some(remote) = &config.remote {
            args.push("-e".to_string());
            args.push(format!(
                "ssh -p {} -i {} -o BatchMode=yes -o ConnectionAttempts={}",
                shell_quote(&remote.port.to_string()),
                shell_quote(&remote.keypath.to_string_lossy()),
                shell_quote(&(config.retry + 1).to_string()),
            ));
            args.push("--protect-args".to_string());
        }

        if config.partial {
            args.push("--partial".to_string());
        }

        args.push("--out-format=%-10l".to_string());
        // Keys and destinations may start with '-'.
        args.push("--".to_string());

        match &config.remote {
            Some(remote) => args.push(format!("{}@{}:{}", remote.user, remote.host, self.source)),
            None => args.push(self.source.clone()),
        }
        args.push(self.destination.to_string_lossy().into_owned());

        args
    }

    /// The invocation as a copy-pasteable shell line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.config.program.as_str())
            .map(shell_quote)
            .chain(self.args().iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Run one rsync job to completion or cancellation.
pub async fn run_job(job: Job, ctx: JobContext) -> Outcome<TransferResult> {
    let span = info_span!("job", id = %ctx.id, source = %job.source);
    execute(job, ctx).instrument(span).await
}

async fn execute(job: Job, ctx: JobContext) -> Outcome<TransferResult> {
    info!("Starting transfer to {}", job.destination.display());
    debug!("Running: {}", job.command_line());

    let mut command = Command::new(&job.config.program);
    command
        .args(job.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group: a terminal Ctrl-C reaches only the orchestrator,
    // which then cancels jobs through the token.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Outcome::Failure(TransferError::Spawn {
                program: job.config.program.clone(),
                reason: e.to_string(),
            })
        }
    };

    let bytes_transferred = Arc::new(AtomicCounter::default());
    let stdout_reader = child.stdout.take().map(|stdout| {
        tokio::spawn(
            read_progress(stdout, bytes_transferred.clone(), ctx.progress.clone()).in_current_span(),
        )
    });
    let stderr_reader = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(log_stderr(stderr).in_current_span()));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = ctx.cancel.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            terminate(&mut child, job.config.terminate_grace).await;
            for reader in stdout_reader.into_iter().chain(stderr_reader) {
                reader.abort();
            }
            info!("Transfer cancelled");
            return Outcome::Failure(TransferError::Cancelled);
        }
    };

    // Let the readers drain whatever rsync wrote before exiting.
    for reader in stdout_reader.into_iter().chain(stderr_reader) {
        let _ = reader.await;
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return Outcome::Failure(TransferError::Worker {
                reason: format!("failed to wait for rsync: {}", e),
            })
        }
    };

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        warn!("Transfer failed with exit code {}", exit_code);
        return Outcome::Failure(TransferError::Failed { exit_code });
    }

    let result = TransferResult {
        source: job.source,
        destination: job.destination,
        bytes_transferred: bytes_transferred.value(),
    };
    info!("Transfer complete: {} bytes", result.bytes_transferred);
    Outcome::Success(result)
}

async fn read_progress<R>(stdout: R, counter: Arc<AtomicCounter>, progress: ProgressSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    let mut parsed = 0usize;
    let mut pending = 0u64;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => match parse_byte_count(&String::from_utf8_lossy(&line)) {
                Ok(bytes) => {
                    counter.increment(bytes);
                    pending += bytes;
                    parsed += 1;
                    if parsed % PROGRESS_BATCH_LINES == 0 {
                        progress.send(pending);
                        pending = 0;
                    }
                }
                Err(e) => debug!("Failed to parse bytes transferred: {}", e),
            },
            Err(e) => {
                warn!("Failed to read rsync output: {}", e);
                break;
            }
        }
    }

    progress.send(pending);
}

async fn log_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => warn!("rsync: {}", line.trim_end()),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading rsync stderr: {}", e);
                break;
            }
        }
    }
}

/// Ask rsync (and its ssh child) to stop, then kill it if it lingers.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                    warn!("rsync did not exit within {:?} of SIGTERM; killing it", grace);
                }
                Err(e) => debug!("Failed to signal rsync process group: {}", e),
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill rsync: {}", e);
    }
}

/// Check that `program` can be executed.
pub fn check_tool(program: &str) -> Result<(), TransferError> {
    let status = std::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(TransferError::ToolNotFound {
            program: program.to_string(),
        }),
    }
}

/// [`Transfer`] backed by rsync processes on a [`JobPool`].
///
/// Clones share the pool; use a [`TransferRegistry`] to share one instance per
/// transfer target.
#[derive(Clone)]
pub struct RsyncTransfer {
    config: Arc<TransferConfig>,
    pool: JobPool,
}

impl RsyncTransfer {
    /// Validate `config`, check that rsync is installed and start the pool.
    pub fn new(config: TransferConfig) -> AsynchyResult<Self> {
        config.validate()?;
        check_tool(&config.program)?;
        let pool = JobPool::new(config.threads)?;

        info!(
            "Created rsync transfer for {} with {} workers",
            config.target_key(),
            config.threads
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn pool(&self) -> &JobPool {
        &self.pool
    }

    fn job(&self, source: &str, destination: &Path) -> Job {
        Job {
            source: source.to_string(),
            destination: destination.to_path_buf(),
            config: self.config.clone(),
        }
    }
}

impl Transfer for RsyncTransfer {
    fn transfer<C>(&self, source: &str, destination: &Path, callback: C) -> TransferHandle<TransferResult>
    where
        C: FnOnce(&Outcome<TransferResult>) + Send + 'static,
    {
        let job = self.job(source, destination);
        self.pool.submit(move |ctx: JobContext| run_job(job, ctx), callback)
    }

    fn transfer_batch<C>(
        &self,
        sources: &[String],
        destination: &Path,
        callback: C,
    ) -> TransferHandle<Vec<Outcome<TransferResult>>>
    where
        C: FnOnce(&Outcome<Vec<Outcome<TransferResult>>>) + Send + 'static,
    {
        let works = sources
            .iter()
            .map(|source| {
                let job = self.job(source, destination);
                move |ctx: JobContext| run_job(job, ctx)
            })
            .collect();
        self.pool.submit_batch(works, callback)
    }

    fn progress(&self) -> Progress {
        self.pool.progress()
    }

    async fn cancel(&self) -> bool {
        self.pool.shutdown().await
    }
}

/// Hands out one [`RsyncTransfer`] per transfer target, so repeated
/// construction in a long-running loop reuses the same pool.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: Mutex<HashMap<String, RsyncTransfer>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live transfer for `config`'s target, creating it if there is
    /// none. A transfer that has been cancelled is replaced.
    pub fn get_or_create(&self, config: &TransferConfig) -> AsynchyResult<RsyncTransfer> {
        let key = config.target_key();
        let mut transfers = self.transfers.lock();

        if let Some(existing) = transfers.get(&key) {
            if !existing.pool().is_cancelled() {
                debug!("Reusing transfer pool for {}", key);
                return Ok(existing.clone());
            }
            debug!("Transfer pool for {} was cancelled; starting a new one", key);
        }

        let transfer = RsyncTransfer::new(config.clone())?;
        transfers.insert(key, transfer.clone());
        Ok(transfer)
    }

    pub fn len(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
