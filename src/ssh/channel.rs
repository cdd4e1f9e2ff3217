//! Transport-facing abstractions consumed by the dispatch core.
//!
//! The router and the multiplexer never touch russh directly: they see a
//! stream of [`NewChannel`]s, each carrying a [`SessionChannel`] with its own
//! sequential request stream, plus a [`ConnectionHandle`] used for teardown.
//! [`super::session`] implements these over russh; `super::testing` provides
//! in-memory doubles.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// The only channel type the gateway serves.
pub const SESSION_CHANNEL: &str = "session";

/// Logged when any other channel type is refused.  russh answers the
/// client with its own fixed reason.
pub const UNSUPPORTED_CHANNEL_TYPE: &str = "unsupported channel type";

/// Bytes the client writes on a channel, in order, ending at client EOF.
pub type ChannelInput = Box<dyn AsyncRead + Send + Sync + Unpin>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Exec,
    Shell,
    Other(String),
}

impl RequestKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "exec" => Self::Exec,
            "shell" => Self::Shell,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exec => "exec",
            Self::Shell => "shell",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One out-of-band channel request.  For `exec` the payload is the SSH wire
/// encoding of the command line (length-prefixed string).
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    pub payload: Bytes,
}

impl Request {
    pub fn new(kind: RequestKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The peer or the transport has already torn the channel down.
#[derive(Debug, Clone, Copy, Error)]
#[error("channel is closed")]
pub struct ChannelClosed;

/// Failure while closing a connection.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// Closed earlier, by us or by the peer.  Not worth surfacing.
    #[error("connection already closed")]
    AlreadyClosed,
    #[error("failed to close connection: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An accepted `session` channel.
///
/// Requests are pulled one at a time with [`next_request`].  [`reply`]
/// answers the request most recently pulled; only the first reply to a
/// request is delivered, and a request pulled without a reply is answered
/// with failure.
///
/// [`next_request`]: SessionChannel::next_request
/// [`reply`]: SessionChannel::reply
#[async_trait]
pub trait SessionChannel: Send + Sync + 'static {
    /// Identifier used in log fields.
    fn id(&self) -> String;

    /// The next request, or `None` once the client closed the channel.
    async fn next_request(&mut self) -> Option<Request>;

    /// Take the client-to-server byte stream.  Returns `None` after the
    /// first call.
    fn take_input(&mut self) -> Option<ChannelInput>;

    /// Answer every request not yet pulled, and every later one, with
    /// failure.
    fn stop_requests(&mut self);

    async fn reply(&self, success: bool) -> Result<(), ChannelClosed>;

    async fn data(&self, bytes: &[u8]) -> Result<(), ChannelClosed>;

    /// Write to the extended-data (stderr) stream.
    async fn stderr(&self, bytes: &[u8]) -> Result<(), ChannelClosed>;

    async fn exit_status(&self, code: u32) -> Result<(), ChannelClosed>;

    /// Send EOF followed by CLOSE.
    async fn close(&self) -> Result<(), ChannelClosed>;
}

/// The authenticated connection as seen by the multiplexer.
#[async_trait]
pub trait ConnectionHandle: Send + Sync + 'static {
    fn peer(&self) -> String;

    /// Close the connection.  Must be safe to call after the peer went away.
    async fn close(&self) -> Result<(), TeardownError>;
}

// ---------------------------------------------------------------------------
// Channel-open requests
// ---------------------------------------------------------------------------

/// A channel-open request waiting for the multiplexer's verdict.
pub struct NewChannel<C> {
    kind: String,
    channel: C,
    decision: oneshot::Sender<bool>,
}

impl<C> NewChannel<C> {
    /// Wrap `channel`; the receiver resolves to `true` once it is accepted.
    pub fn new(kind: impl Into<String>, channel: C) -> (Self, oneshot::Receiver<bool>) {
        let (decision, verdict) = oneshot::channel();
        let new_channel = Self {
            kind: kind.into(),
            channel,
            decision,
        };
        (new_channel, verdict)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn accept(self) -> C {
        let _ = self.decision.send(true);
        self.channel
    }

    pub fn reject(self) {
        let _ = self.decision.send(false);
    }
}
