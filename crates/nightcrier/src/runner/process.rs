use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RunnerError;

/// How long a gracefully-terminated subprocess gets before the kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How the subprocess ended.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    /// Exit code when the process returned one; None after a signal,
    /// a timeout kill, or a shutdown cancellation.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Where to write the captured streams, when debug capture is enabled.
#[derive(Debug, Clone)]
pub struct LogCapture {
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub full_log: PathBuf,
}

/// Run the agent subprocess to completion.
///
/// stdout/stderr are pumped concurrently so the subprocess never blocks
/// on a full pipe; with `capture` set they land in the per-stream logs
/// plus a timestamped interleaved log, otherwise they are discarded.
/// `timeout` is the hard wall clock; `force_cancel` is the shutdown
/// override. Both paths terminate gracefully first, then kill.
pub async fn execute(
    mut command: Command,
    timeout: Duration,
    capture: Option<LogCapture>,
    mut force_cancel: watch::Receiver<bool>,
) -> Result<ProcessOutcome, RunnerError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
        command: program.clone(),
        source,
    })?;
    debug!(command = %program, pid = child.id(), "Agent subprocess started");

    let full_log = match &capture {
        Some(c) => Some(Arc::new(Mutex::new(open_append(&c.full_log).await?))),
        None => None,
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = spawn_pump(
        stdout,
        "stdout",
        capture.as_ref().map(|c| c.stdout_log.clone()),
        full_log.clone(),
    );
    let stderr_task = spawn_pump(
        stderr,
        "stderr",
        capture.as_ref().map(|c| c.stderr_log.clone()),
        full_log.clone(),
    );

    let outcome = tokio::select! {
        status = child.wait() => {
            let status = status?;
            ProcessOutcome {
                exit_code: status.code(),
                timed_out: false,
                cancelled: false,
            }
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(command = %program, "Agent subprocess hit the wall-clock timeout");
            terminate(&mut child).await?;
            ProcessOutcome { exit_code: None, timed_out: true, cancelled: false }
        }
        _ = cancelled(&mut force_cancel) => {
            warn!(command = %program, "Agent subprocess cancelled by shutdown");
            terminate(&mut child).await?;
            ProcessOutcome { exit_code: None, timed_out: false, cancelled: true }
        }
    };

    // The pipes are at EOF once the child is gone; drain the pumps so
    // captured logs are complete before the outcome is classified.
    join_pump(stdout_task, "stdout").await;
    join_pump(stderr_task, "stderr").await;

    Ok(outcome)
}

/// Resolves once a shutdown force-cancel is observed; never resolves
/// when the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Graceful termination first, kill after the grace period.
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a child we own and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(waited) = tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
            waited?;
            debug!(pid, "Agent subprocess exited after SIGTERM");
            return Ok(());
        }
        warn!(pid, "Agent subprocess ignored SIGTERM, killing");
    }

    child.kill().await
}

fn spawn_pump(
    reader: Option<impl AsyncRead + Unpin + Send + 'static>,
    stream_name: &'static str,
    own_log: Option<PathBuf>,
    full_log: Option<Arc<Mutex<tokio::fs::File>>>,
) -> Option<JoinHandle<std::io::Result<()>>> {
    let reader = reader?;
    Some(tokio::spawn(pump(reader, stream_name, own_log, full_log)))
}

/// Copy one stream line-by-line into its logs, or just drain it.
async fn pump(
    reader: impl AsyncRead + Unpin,
    stream_name: &'static str,
    own_log: Option<PathBuf>,
    full_log: Option<Arc<Mutex<tokio::fs::File>>>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(reader).lines();
    let mut own = match own_log {
        Some(path) => Some(open_append(&path).await?),
        None => None,
    };

    while let Some(line) = lines.next_line().await? {
        if let Some(file) = own.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        if let Some(full) = &full_log {
            let stamped = format!(
                "{} [{}] {}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                stream_name,
                line
            );
            let mut file = full.lock().await;
            file.write_all(stamped.as_bytes()).await?;
        }
    }

    if let Some(file) = own.as_mut() {
        file.flush().await?;
    }
    if let Some(full) = &full_log {
        full.lock().await.flush().await?;
    }
    Ok(())
}

async fn join_pump(task: Option<JoinHandle<std::io::Result<()>>>, stream_name: &'static str) {
    if let Some(task) = task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stream = stream_name, error = %e, "Log capture failed"),
            Err(e) => warn!(stream = stream_name, error = %e, "Log pump task failed"),
        }
    }
}

async fn open_append(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
