//! In-memory channel and connection doubles for exercising the dispatch core
//! without a network.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::channel::{
    ChannelClosed, ChannelInput, ConnectionHandle, Request, RequestKind, SessionChannel,
    TeardownError,
};
use super::command::encode_exec_payload;
use super::router::DispatchContext;
use crate::config::DispatchConfig;
use crate::metrics::MetricsRegistry;
use crate::shutdown::{self, ShutdownTrigger};

/// What the server sent back on a channel, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reply(bool),
    Data(Vec<u8>),
    Stderr(String),
    ExitStatus(u32),
    Closed,
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn replies(&self) -> Vec<bool> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Reply(ok) => Some(ok),
                _ => None,
            })
            .collect()
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Data(bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn stderr(&self) -> String {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Stderr(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn exit_statuses(&self) -> Vec<u32> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::ExitStatus(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> bool {
        self.snapshot().contains(&Event::Closed)
    }
}

// ---------------------------------------------------------------------------
// Channel double
// ---------------------------------------------------------------------------

pub struct FakeChannel {
    id: u32,
    requests: mpsc::UnboundedReceiver<Request>,
    input: Option<ChannelInput>,
    log: EventLog,
}

/// The client's end of a [`FakeChannel`].
pub struct FakeClient {
    requests: Option<mpsc::UnboundedSender<Request>>,
    input: Option<DuplexStream>,
    pub log: EventLog,
}

pub fn fake_channel(id: u32) -> (FakeChannel, FakeClient) {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let log = EventLog::default();
    let channel = FakeChannel {
        id,
        requests: requests_rx,
        input: Some(Box::new(server_end)),
        log: log.clone(),
    };
    let client = FakeClient {
        requests: Some(requests_tx),
        input: Some(client_end),
        log,
    };
    (channel, client)
}

impl FakeClient {
    pub fn send(&self, request: Request) {
        if let Some(requests) = &self.requests {
            let _ = requests.send(request);
        }
    }

    pub fn exec(&self, command_line: &str) {
        self.send(Request::new(
            RequestKind::Exec,
            encode_exec_payload(command_line.as_bytes()),
        ));
    }

    /// End the request stream, as when the client closes the channel.
    pub fn hang_up(&mut self) {
        self.requests = None;
    }

    pub async fn write_input(&mut self, bytes: &[u8]) {
        if let Some(input) = &mut self.input {
            input.write_all(bytes).await.unwrap();
        }
    }

    /// Whether the worker has stopped taking requests.
    pub fn requests_refused(&self) -> bool {
        self.requests
            .as_ref()
            .map_or(true, |requests| requests.is_closed())
    }

    /// Send EOF on the channel's data stream.
    pub fn finish_input(&mut self) {
        self.input = None;
    }
}

#[async_trait]
impl SessionChannel for FakeChannel {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn next_request(&mut self) -> Option<Request> {
        self.requests.recv().await
    }

    fn take_input(&mut self) -> Option<ChannelInput> {
        self.input.take()
    }

    fn stop_requests(&mut self) {
        self.requests.close();
        while self.requests.try_recv().is_ok() {}
    }

    async fn reply(&self, success: bool) -> Result<(), ChannelClosed> {
        self.log.push(Event::Reply(success));
        Ok(())
    }

    async fn data(&self, bytes: &[u8]) -> Result<(), ChannelClosed> {
        self.log.push(Event::Data(bytes.to_vec()));
        Ok(())
    }

    async fn stderr(&self, bytes: &[u8]) -> Result<(), ChannelClosed> {
        self.log
            .push(Event::Stderr(String::from_utf8_lossy(bytes).into_owned()));
        Ok(())
    }

    async fn exit_status(&self, code: u32) -> Result<(), ChannelClosed> {
        self.log.push(Event::ExitStatus(code));
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelClosed> {
        self.log.push(Event::Closed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection double
// ---------------------------------------------------------------------------

/// Counts close attempts; every attempt after the first, or every attempt
/// once the peer is gone, reports `AlreadyClosed`.
#[derive(Clone, Default)]
pub struct FakeConnection {
    closes: Arc<AtomicUsize>,
    peer_gone: bool,
}

impl FakeConnection {
    pub fn peer_gone() -> Self {
        Self {
            peer_gone: true,
            ..Self::default()
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionHandle for FakeConnection {
    fn peer(&self) -> String {
        "fake-peer".to_string()
    }

    async fn close(&self) -> Result<(), TeardownError> {
        let attempt = self.closes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.peer_gone || attempt > 1 {
            return Err(TeardownError::AlreadyClosed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Dispatch context rooted at `repository_root` with delegates taken from
/// `delegate_dir`.  Keep the trigger alive for the duration of the test.
pub fn test_context(
    repository_root: &Path,
    delegate_dir: &Path,
    config: DispatchConfig,
) -> (Arc<DispatchContext>, ShutdownTrigger) {
    let (trigger, listener) = shutdown::channel();
    let ctx = DispatchContext {
        config: DispatchConfig {
            delegate_dir: Some(delegate_dir.to_path_buf()),
            ..config
        },
        repository_root: repository_root.to_path_buf(),
        metrics: MetricsRegistry::new(),
        shutdown: listener,
    };
    (Arc::new(ctx), trigger)
}

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_delegate(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
