//! Per-channel request loop.
//!
//! A channel is single-shot: the first `exec` that names a valid command,
//! any `shell` request, or any request type we do not know ends the loop and
//! the channel is closed.  Malformed `exec` payloads are refused without
//! ending the loop so the client can try again.
//!
//! Every request is answered before anything else is written to the
//! channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn, Instrument};

use super::bridge::{self, INTERNAL_ERROR_MESSAGE};
use super::channel::{RequestKind, SessionChannel};
use super::command::{self, CommandError, Operation};
use crate::config::DispatchConfig;
use crate::metrics::{ExecOutcome, MetricsRegistry, OperationLabels};
use crate::shutdown::ShutdownListener;

pub const SHELL_REFUSED_MESSAGE: &[u8] =
    b"You are trying to open a shell on a Git server, which is not supported.\n";

pub const UNSUPPORTED_REQUEST_MESSAGE: &[u8] = b"Unsupported protocol feature. Exiting.\n";

/// Everything a channel worker needs, shared read-only by all workers.
pub struct DispatchContext {
    pub config: DispatchConfig,
    pub repository_root: PathBuf,
    pub metrics: MetricsRegistry,
    pub shutdown: ShutdownListener,
}

/// Whether the request loop keeps reading after an `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// Serve one accepted channel until it is done, then close it.
pub async fn serve_channel<C: SessionChannel>(ctx: Arc<DispatchContext>, mut channel: C) {
    route_requests(&ctx, &mut channel).await;
    if let Err(e) = channel.close().await {
        debug!(error = %e, "channel was already closed");
    }
}

async fn route_requests<C: SessionChannel>(ctx: &DispatchContext, channel: &mut C) {
    while let Some(request) = channel.next_request().await {
        match request.kind {
            RequestKind::Exec => {
                if handle_exec(ctx, channel, &request.payload).await == Flow::Finished {
                    return;
                }
            }
            RequestKind::Shell => {
                info!("client requested an interactive session, which is not supported");
                let _ = channel.reply(false).await;
                let _ = channel.stderr(SHELL_REFUSED_MESSAGE).await;
                if ctx.config.send_exit_status {
                    let _ = channel.exit_status(0).await;
                }
                return;
            }
            RequestKind::Other(kind) => {
                warn!(request = %kind, "client sent an unsupported channel request");
                let _ = channel.reply(false).await;
                let _ = channel.stderr(UNSUPPORTED_REQUEST_MESSAGE).await;
                return;
            }
        }
    }
    debug!("client closed the channel");
}

async fn handle_exec<C: SessionChannel>(ctx: &DispatchContext, channel: &mut C, payload: &[u8]) -> Flow {
    let metrics = &ctx.metrics.metrics;

    let cmd = match command::parse_exec_payload(payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(error = %e, "refusing malformed exec request");
            metrics.record_exec(ExecOutcome::Malformed);
            let _ = channel.reply(false).await;
            return Flow::Continue;
        }
    };

    let resolved = Operation::from_name(cmd.operation()).and_then(|operation| {
        command::resolve_repository(
            &ctx.repository_root,
            cmd.repository(),
            ctx.config.strict_repository_ids,
        )
        .map(|path| (operation, path))
    });
    let (operation, repo_path) = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            let outcome = match e {
                CommandError::InvalidRepository(_) => ExecOutcome::InvalidRepository,
                _ => ExecOutcome::Unsupported,
            };
            warn!(command = %cmd.operation(), repository = %cmd.repository(), "{e}");
            metrics.record_exec(outcome);
            let _ = channel.reply(false).await;
            let _ = channel.stderr(format!("{e}\n").as_bytes()).await;
            return if ctx.config.close_on_unsupported {
                Flow::Finished
            } else {
                Flow::Continue
            };
        }
    };

    if !cmd.extra_args().is_empty() {
        debug!(ignored = ?cmd.extra_args(), "ignoring trailing exec arguments");
    }

    // This request is the channel's last; anything queued behind it is
    // refused.
    channel.stop_requests();

    let span = info_span!("exec", operation = %operation, repository = %cmd.repository());
    let started = Instant::now();
    let result = bridge::run_delegate(
        channel,
        &ctx.config,
        ctx.shutdown.clone(),
        operation,
        &repo_path,
    )
    .instrument(span.clone())
    .await;
    metrics
        .delegate_duration_seconds
        .get_or_create(&OperationLabels {
            operation: operation.name().to_string(),
        })
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => metrics.record_exec(ExecOutcome::Completed),
        Err(e) => {
            span.in_scope(|| error!(error = %e, "failed to run delegate"));
            metrics.record_exec(ExecOutcome::DelegateFailed);
            let _ = channel.stderr(INTERNAL_ERROR_MESSAGE).await;
            // Not delivered over SSH when the success reply already went out.
            let _ = channel.reply(false).await;
        }
    }
    Flow::Finished
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
