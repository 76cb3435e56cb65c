// src/exec/procman.rs

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RuntimeError;

/// Combined output retained per attempt for retry-pattern matching.
const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

/// Bounded buffer holding the last [`OUTPUT_TAIL_LIMIT`] bytes written to
/// a subprocess's stdout and stderr. Discarded after the retry decision.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: Vec<u8>,
}

impl TailBuffer {
    fn push_line(&mut self, line: &str) {
        self.bytes.extend_from_slice(line.as_bytes());
        self.bytes.push(b'\n');
        if self.bytes.len() > OUTPUT_TAIL_LIMIT {
            let excess = self.bytes.len() - OUTPUT_TAIL_LIMIT;
            self.bytes.drain(..excess);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Removes a process-table entry when the owning run ends or is dropped.
struct TableGuard<'a> {
    table: &'a Mutex<HashMap<u64, oneshot::Sender<()>>>,
    handle: u64,
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().unwrap().remove(&self.handle);
    }
}

/// Registry of live subprocesses.
///
/// Every spawn is tracked under a monotonically increasing handle while
/// the child is alive; handles are never reused. [`ProcManager::stop`]
/// cancels all registered subprocesses and refuses further spawns.
#[derive(Debug, Default)]
pub struct ProcManager {
    table: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_handle: AtomicU64,
    stopped: AtomicBool,
}

impl ProcManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a subprocess to completion, streaming its output through
    /// `tracing` and capturing a bounded tail. Returns the tail on
    /// success; failures carry the exit code and tail.
    ///
    /// `stdin` is written to the child's stdin and then closed.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<String, RuntimeError> {
        debug_assert!(!argv.is_empty());

        if self.stopped.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let argv0 = argv[0].clone();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            argv0: argv0.clone(),
            source,
        })?;

        if let Some(text) = stdin {
            if let Some(mut sink) = child.stdin.take() {
                let text = text.to_string();
                tokio::spawn(async move {
                    if let Err(err) = sink.write_all(text.as_bytes()).await {
                        debug!(error = %err, "writing to subprocess stdin failed");
                    }
                    // Dropping the sink closes the pipe.
                });
            }
        }

        let tail = Arc::new(Mutex::new(TailBuffer::default()));
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let tail = Arc::clone(&tail);
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("{line}");
                    tail.lock().unwrap().push_line(&line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&tail);
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(stream = "stderr", "{line}");
                    tail.lock().unwrap().push_line(&line);
                }
            }));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel();
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.table.lock().unwrap().insert(handle, kill_tx);
        // Deregisters even when a per-step timeout drops this future;
        // the child itself dies through kill_on_drop.
        let _registration = TableGuard {
            table: &self.table,
            handle,
        };

        // Either the process exits on its own, the caller's token is
        // cancelled, or stop() sends a kill through the table.
        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
            _ = &mut kill_rx => None,
        };

        let status = match exit {
            Some(Ok(status)) => status,
            Some(Err(source)) => {
                for reader in readers {
                    reader.abort();
                }
                return Err(RuntimeError::Wait { argv0, source });
            }
            None => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill cancelled subprocess");
                }
                for reader in readers {
                    let _ = reader.await;
                }
                return Err(RuntimeError::Cancelled);
            }
        };

        // Drain the readers so the tail is complete before matching.
        for reader in readers {
            let _ = reader.await;
        }
        let tail = Arc::try_unwrap(tail)
            .map(|b| b.into_inner().unwrap())
            .unwrap_or_default()
            .into_string();

        if status.success() {
            Ok(tail)
        } else {
            Err(RuntimeError::Subprocess {
                argv0,
                code: status.code().unwrap_or(-1),
                tail,
            })
        }
    }

    /// Run with up to `retries` additional attempts.
    ///
    /// A failed attempt is retried only when `retry_patterns` is empty or
    /// the attempt's combined output contains one of the patterns as a
    /// substring. Cancellation is never retried. Sleeps `retry_delay`
    /// seconds between attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_with_retries(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        retries: u32,
        retry_patterns: &[String],
        retry_delay: u64,
        id: &str,
    ) -> Result<(), RuntimeError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.run(cancel, argv, stdin, cwd).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt > retries || !should_retry(&err, retry_patterns) {
                        return Err(err);
                    }
                    warn!(
                        id,
                        attempt,
                        remaining = retries - attempt + 1,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(retry_delay)) => {}
                        _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                    }
                }
            }
        }
    }

    /// Run with retries, then require `repeat` additional successful
    /// series. Any failure in the repeat series is fatal; each iteration
    /// retries independently.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_repeat_with_retries(
        &self,
        cancel: &CancellationToken,
        argv: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        retries: u32,
        retry_patterns: &[String],
        retry_delay: u64,
        id: &str,
        repeat: u32,
    ) -> Result<(), RuntimeError> {
        self.run_with_retries(cancel, argv, stdin, cwd, retries, retry_patterns, retry_delay, id)
            .await?;

        for iteration in 0..repeat {
            debug!(id, iteration = iteration + 1, repeat, "repeating");
            self.run_with_retries(cancel, argv, stdin, cwd, retries, retry_patterns, retry_delay, id)
                .await?;
        }

        Ok(())
    }

    /// Cancel all registered subprocesses and refuse further spawns.
    /// Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let drained: Vec<(u64, oneshot::Sender<()>)> =
            self.table.lock().unwrap().drain().collect();
        for (handle, kill) in drained {
            debug!(handle, "stopping subprocess");
            let _ = kill.send(());
        }
    }
}

fn should_retry(err: &RuntimeError, patterns: &[String]) -> bool {
    if matches!(err, RuntimeError::Cancelled) {
        return false;
    }
    if patterns.is_empty() {
        return true;
    }
    match err.output_tail() {
        Some(tail) => patterns.iter().any(|p| tail.contains(p.as_str())),
        None => false,
    }
}
