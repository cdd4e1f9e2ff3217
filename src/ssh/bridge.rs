//! Binds an accepted `exec` request to a delegate process.
//!
//! The delegate runs with an empty environment.  Channel data is copied into
//! its stdin (closed when the client sends EOF), its stdout is copied back as
//! channel data, and its stderr goes to the gateway's own stderr.  russh
//! exposes no file descriptor for a channel, so both directions are pumped
//! explicitly.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, info};

use super::channel::SessionChannel;
use super::command::Operation;
use crate::config::{ArgumentStyle, DispatchConfig};
use crate::shutdown::ShutdownListener;

/// The only failure text a client ever sees from a delegate.
pub const INTERNAL_ERROR_MESSAGE: &[u8] =
    b"Internal server error. Try again later. Administrators should read the logs.\n";

const OUTPUT_CHUNK: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("delegate stdio was not captured")]
    MissingPipe,
    #[error("failed to wait for delegate: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to forward delegate output: {0}")]
    Output(#[source] io::Error),
    #[error("delegate exited with {0}")]
    Exited(ExitStatus),
    #[error("delegate still running after {0:?}")]
    TimedOut(Duration),
    #[error("delegate stopped for server shutdown")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Locate the program for `operation`: inside `delegate_dir` when one is
/// configured, otherwise on the gateway's own `PATH` (the delegate itself
/// gets no `PATH`).
pub fn program_path(config: &DispatchConfig, operation: Operation) -> PathBuf {
    match &config.delegate_dir {
        Some(dir) => dir.join(operation.name()),
        None => which::which(operation.name()).unwrap_or_else(|_| PathBuf::from(operation.name())),
    }
}

/// Build the delegate command for `operation` against `repo_path`.
pub fn delegate_command(config: &DispatchConfig, operation: Operation, repo_path: &Path) -> Command {
    let mut cmd = Command::new(program_path(config, operation));
    match config.argument_style {
        ArgumentStyle::ExplicitPath => {
            cmd.arg(repo_path);
        }
        ArgumentStyle::WorkingDirectory => {
            cmd.arg(".").current_dir(repo_path);
        }
    }

    // Nothing from the gateway's environment reaches the delegate.
    cmd.env_clear();

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Accept the pending `exec` request and run `operation` to completion.
///
/// The success reply goes out before the process is spawned.  On a clean
/// exit an `exit-status` of zero follows when configured.  Any error is
/// returned for the caller to report; the delegate is killed if it is still
/// running.
pub async fn run_delegate<C: SessionChannel>(
    channel: &mut C,
    config: &DispatchConfig,
    mut shutdown: ShutdownListener,
    operation: Operation,
    repo_path: &Path,
) -> Result<(), DelegateError> {
    let _ = channel.reply(true).await;

    let mut cmd = delegate_command(config, operation, repo_path);
    let mut child = cmd.spawn().map_err(|source| DelegateError::Spawn {
        program: operation.name().to_string(),
        source,
    })?;
    info!(pid = ?child.id(), path = %repo_path.display(), "delegate started");

    let mut stdin = child.stdin.take().ok_or(DelegateError::MissingPipe)?;
    let stdout = child.stdout.take().ok_or(DelegateError::MissingPipe)?;

    let feed = channel.take_input().map(|mut input| {
        tokio::spawn(async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await;
            // Client EOF: let the delegate see the end of its input.
            let _ = stdin.shutdown().await;
            match copied {
                Ok(bytes) => debug!(bytes, "channel input finished"),
                Err(e) => debug!(error = %e, "stopped forwarding channel input"),
            }
        })
    });

    let channel: &C = channel;
    let exchange = async {
        let (forwarded, status) = tokio::join!(forward_output(stdout, channel), child.wait());
        let status = status.map_err(DelegateError::Wait)?;
        let bytes = forwarded.map_err(DelegateError::Output)?;
        debug!(bytes, %status, "delegate output drained");
        Ok::<_, DelegateError>(status)
    };
    let bounded = async {
        match config.delegate_timeout() {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or(Err(DelegateError::TimedOut(limit))),
            None => exchange.await,
        }
    };
    let outcome = tokio::select! {
        outcome = bounded => outcome,
        () = shutdown.wait() => Err(DelegateError::Cancelled),
    };

    if let Some(feed) = feed {
        feed.abort();
    }

    let status = match outcome {
        Ok(status) => status,
        Err(err) => {
            if matches!(err, DelegateError::TimedOut(_) | DelegateError::Cancelled) {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "failed to kill delegate");
                }
            }
            return Err(err);
        }
    };

    if !status.success() {
        return Err(DelegateError::Exited(status));
    }

    info!("delegate finished");
    if config.send_exit_status && channel.exit_status(0).await.is_err() {
        debug!("channel closed before exit-status could be sent");
    }
    Ok(())
}

/// Copy the delegate's stdout to the channel until EOF.  Takes the pipe by
/// value so the delegate sees a broken pipe if the channel goes away.
async fn forward_output<C: SessionChannel>(mut stdout: ChildStdout, channel: &C) -> io::Result<u64> {
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    let mut total = 0u64;
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        channel
            .data(&buf[..n])
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        total += n as u64;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
