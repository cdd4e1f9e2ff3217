//! russh [`Handler`] that adapts russh's callback API to the gateway's
//! channel abstractions.
//!
//! Each inbound SSH connection is served by a dedicated [`GatewaySession`].
//! Channel-open callbacks are forwarded to the connection's multiplexer as
//! [`NewChannel`]s and wait for its verdict.  A refused channel is reported
//! to the client by russh with its fixed `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`
//! failure.
//!
//! Channel requests are queued on the channel's request stream together with
//! a one-shot reply slot, and the request callback waits for the worker's
//! answer before returning.  russh tracks a single pending reply per
//! channel, so answering inside the callback is the only way to keep replies
//! matched to pipelined requests.  Channel data goes onto the input stream.
//! Output goes back through a cloned russh [`Handle`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, Pty};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::channel::{
    ChannelClosed, ChannelInput, ConnectionHandle, NewChannel, Request, RequestKind,
    SessionChannel, TeardownError, SESSION_CHANNEL,
};
use super::command::encode_exec_payload;

/// Extended-data type code for stderr (RFC 4254 §5.2).
const STDERR: u32 = 1;

type InputSender = mpsc::UnboundedSender<io::Result<Bytes>>;

/// A request plus the slot its answer goes back through.
struct QueuedRequest {
    request: Request,
    reply: oneshot::Sender<bool>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Senders feeding an accepted channel's worker.
struct ChannelPorts {
    requests: mpsc::UnboundedSender<QueuedRequest>,
    /// Dropped on client EOF.
    input: Option<InputSender>,
}

/// Per-connection SSH handler.
pub struct GatewaySession {
    peer_addr: Option<SocketAddr>,
    channels: mpsc::Sender<NewChannel<RusshChannel>>,
    authenticated: Option<oneshot::Sender<()>>,
    open: HashMap<ChannelId, ChannelPorts>,
}

impl GatewaySession {
    /// `authenticated` fires once the client has finished key exchange and
    /// authentication.
    pub fn new(
        peer_addr: Option<SocketAddr>,
        channels: mpsc::Sender<NewChannel<RusshChannel>>,
        authenticated: oneshot::Sender<()>,
    ) -> Self {
        Self {
            peer_addr,
            channels,
            authenticated: Some(authenticated),
            open: HashMap::new(),
        }
    }

    /// Offer a freshly opened channel to the multiplexer and wait for its
    /// verdict.
    async fn offer_channel(
        &mut self,
        kind: &str,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, anyhow::Error> {
        let id = channel.id();
        // Everything flows through the handler callbacks; the russh-side
        // receiver is not read.
        drop(channel);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let input: ChannelInput = Box::new(StreamReader::new(UnboundedReceiverStream::new(input_rx)));
        let gateway_channel = RusshChannel {
            id,
            handle: session.handle(),
            requests: requests_rx,
            pending_reply: Mutex::new(None),
            input: Some(input),
        };

        let (new_channel, verdict) = NewChannel::new(kind, gateway_channel);
        if self.channels.send(new_channel).await.is_err() {
            return Ok(false);
        }
        let accepted = verdict.await.unwrap_or(false);
        if accepted {
            self.open.insert(
                id,
                ChannelPorts {
                    requests: requests_tx,
                    input: Some(input_tx),
                },
            );
        } else {
            debug!(channel = ?id, kind, "channel refused");
        }
        Ok(accepted)
    }

    /// Hand a request to the channel's worker and answer it with the
    /// worker's verdict.  Requests for channels whose worker no longer takes
    /// requests are refused here.
    async fn answer_request(&mut self, id: ChannelId, request: Request, session: &mut Session) {
        let (reply, verdict) = oneshot::channel();
        let queued = self
            .open
            .get(&id)
            .is_some_and(|ports| ports.requests.send(QueuedRequest { request, reply }).is_ok());

        let success = if queued {
            verdict.await.unwrap_or(false)
        } else {
            debug!(channel = ?id, "request on a channel that takes no more requests");
            false
        };
        if success {
            let _ = session.channel_success(id);
        } else {
            let _ = session.channel_failure(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for GatewaySession {
    type Error = anyhow::Error;

    /// Client authentication is not enforced.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user, "accepting client without authentication");
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        info!(
            peer = ?self.peer_addr,
            client_version = %client_version,
            "new SSH connection"
        );
        if let Some(authenticated) = self.authenticated.take() {
            let _ = authenticated.send(());
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel(SESSION_CHANNEL, channel, session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel("direct-tcpip", channel, session).await
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel("forwarded-tcpip", channel, session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel("x11", channel, session).await
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender ends the input stream, which closes the
        // delegate's stdin.
        if let Some(ports) = self.open.get_mut(&channel) {
            ports.input.take();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.open.remove(&channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ports) = self.open.get_mut(&channel) {
            let delivered = ports
                .input
                .as_ref()
                .is_some_and(|input| input.send(Ok(Bytes::copy_from_slice(data))).is_ok());
            if !delivered {
                // No delegate is reading any more.
                ports.input.take();
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // russh strips the SSH string framing; restore it so the request
        // carries the wire payload.
        let request = Request::new(RequestKind::Exec, encode_exec_payload(data));
        self.answer_request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(channel, Request::new(RequestKind::Shell, Bytes::new()), session)
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(variable = variable_name, "client sent env request");
        self.answer_request(channel, Request::new(RequestKind::from_name("env"), Bytes::new()), session)
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(
            channel,
            Request::new(RequestKind::from_name("pty-req"), Bytes::new()),
            session,
        )
        .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(subsystem = name, "client requested a subsystem");
        self.answer_request(
            channel,
            Request::new(RequestKind::from_name("subsystem"), Bytes::new()),
            session,
        )
        .await;
        Ok(())
    }

    /// Global requests are discarded.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(address, port = *port, "discarding tcpip-forward request");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(address, port, "discarding cancel-tcpip-forward request");
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// An accepted russh channel as seen by a worker.
pub struct RusshChannel {
    id: ChannelId,
    handle: Handle,
    requests: mpsc::UnboundedReceiver<QueuedRequest>,
    /// Reply slot of the request most recently pulled.
    pending_reply: Mutex<Option<oneshot::Sender<bool>>>,
    input: Option<ChannelInput>,
}

#[async_trait]
impl SessionChannel for RusshChannel {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn next_request(&mut self) -> Option<Request> {
        let QueuedRequest { request, reply } = self.requests.recv().await?;
        // An unanswered predecessor is dropped here and so refused.
        *self
            .pending_reply
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = Some(reply);
        Some(request)
    }

    fn take_input(&mut self) -> Option<ChannelInput> {
        self.input.take()
    }

    fn stop_requests(&mut self) {
        self.requests.close();
        while self.requests.try_recv().is_ok() {}
    }

    async fn reply(&self, success: bool) -> Result<(), ChannelClosed> {
        let pending = self
            .pending_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(reply) => reply.send(success).map_err(|_| ChannelClosed),
            None => {
                debug!(success, "request already answered");
                Ok(())
            }
        }
    }

    async fn data(&self, bytes: &[u8]) -> Result<(), ChannelClosed> {
        self.handle
            .data(self.id, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn stderr(&self, bytes: &[u8]) -> Result<(), ChannelClosed> {
        self.handle
            .extended_data(self.id, STDERR, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| ChannelClosed)
    }

    async fn exit_status(&self, code: u32) -> Result<(), ChannelClosed> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| ChannelClosed)
    }

    /// EOF then CLOSE, the order git's SSH transport expects (RFC 4254).
    async fn close(&self) -> Result<(), ChannelClosed> {
        self.handle.eof(self.id).await.map_err(|_| ChannelClosed)?;
        self.handle.close(self.id).await.map_err(|_| ChannelClosed)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Teardown handle for one russh session.
pub struct RusshConnection {
    peer_addr: Option<SocketAddr>,
    handle: Handle,
    closed: AtomicBool,
}

impl RusshConnection {
    pub fn new(peer_addr: Option<SocketAddr>, handle: Handle) -> Self {
        Self {
            peer_addr,
            handle,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConnectionHandle for RusshConnection {
    fn peer(&self) -> String {
        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn close(&self) -> Result<(), TeardownError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TeardownError::AlreadyClosed);
        }
        match self
            .handle
            .disconnect(Disconnect::ByApplication, "closing".to_string(), "en".to_string())
            .await
        {
            Ok(()) => Ok(()),
            // The session task is gone: the peer hung up first.
            Err(russh::Error::SendError) => Err(TeardownError::AlreadyClosed),
            Err(e) => {
                warn!(error = %e, "SSH disconnect failed");
                Err(TeardownError::Transport(e.to_string()))
            }
        }
    }
}
