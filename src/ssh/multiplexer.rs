//! Per-connection channel multiplexer.
//!
//! Runs one [`router::serve_channel`] worker per accepted `session` channel.
//! Once the connection's channel stream ends, every worker is awaited before
//! the connection is closed, exactly once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info_span, warn, Instrument};

use super::channel::{
    ConnectionHandle, NewChannel, SessionChannel, TeardownError, SESSION_CHANNEL,
    UNSUPPORTED_CHANNEL_TYPE,
};
use super::router::{self, DispatchContext};

pub async fn run<C, H>(ctx: Arc<DispatchContext>, mut channels: mpsc::Receiver<NewChannel<C>>, connection: H)
where
    C: SessionChannel,
    H: ConnectionHandle,
{
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = workers.join_next(), if !workers.is_empty() => log_worker_exit(joined),
            next = channels.recv() => match next {
                Some(new_channel) => {
                    if new_channel.kind() != SESSION_CHANNEL {
                        ctx.metrics.metrics.channels_rejected_total.inc();
                        debug!(kind = %new_channel.kind(), reason = UNSUPPORTED_CHANNEL_TYPE, "rejecting channel");
                        new_channel.reject();
                        continue;
                    }
                    let channel = new_channel.accept();
                    let span = info_span!("channel", channel = %channel.id());
                    workers.spawn(router::serve_channel(Arc::clone(&ctx), channel).instrument(span));
                }
                None => break,
            },
        }
    }

    debug!(in_flight = workers.len(), "channel stream closed; waiting for workers");
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }

    match connection.close().await {
        Ok(()) => debug!(peer = %connection.peer(), "connection closed"),
        Err(TeardownError::AlreadyClosed) => {
            debug!(peer = %connection.peer(), "connection was already closed")
        }
        Err(e) => warn!(peer = %connection.peer(), error = %e, "failed to close connection"),
    }
}

fn log_worker_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "channel worker panicked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
