//! SSH listener bootstrap and per-connection lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::{Disconnect, MethodSet};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::multiplexer;
use super::router::DispatchContext;
use super::session::{GatewaySession, RusshConnection};
use crate::config::Config;
use crate::AppState;

/// Channel-open requests buffered between the russh session and its
/// multiplexer.
const CHANNEL_BACKLOG: usize = 16;

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the host key from `host_key_path`.  When the file is missing and
/// `generate_host_key` is set, fall back to an ephemeral Ed25519 key.
fn load_host_key(config: &Config) -> Result<KeyPair> {
    let path = &config.host_key_path;
    if path.exists() || !config.generate_host_key {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key from {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    warn!(
        path = %path.display(),
        "SSH host key not found; generating ephemeral Ed25519 key",
    );
    Ok(KeyPair::generate_ed25519())
}

fn russh_config(config: &Config, host_key: KeyPair) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::NONE,
        inactivity_timeout: Some(config.inactivity_timeout()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Runs until shutdown is triggered and every open
/// connection has finished.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.listen_addr()?;

    // -- Build russh server config ----------------------------------------

    let host_key = load_host_key(&state.config)?;
    let russh_config = Arc::new(russh_config(&state.config, host_key));

    let ctx = Arc::new(DispatchContext {
        config: state.config.dispatch.clone(),
        repository_root: state.config.repository_root.clone(),
        metrics: state.metrics.clone(),
        shutdown: state.shutdown.clone(),
    });

    // -- Start serving ----------------------------------------------------

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;
    info!(address = %listen_addr, "SSH server listening");

    accept_loop(listener, russh_config, ctx, state.config.handshake_timeout()).await;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    russh_config: Arc<server::Config>,
    ctx: Arc<DispatchContext>,
    handshake_timeout: Duration,
) {
    let mut shutdown = ctx.shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task panicked");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    let span = info_span!("connection", peer = %peer_addr);
                    connections.spawn(
                        serve_connection(
                            socket,
                            Some(peer_addr),
                            Arc::clone(&russh_config),
                            Arc::clone(&ctx),
                            handshake_timeout,
                        )
                        .instrument(span),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept SSH connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    info!(
        in_flight = connections.len(),
        "SSH listener stopped; waiting for open connections",
    );
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "connection task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Run the SSH handshake on `socket`, then serve the connection's channels
/// until the client disconnects or shutdown is triggered.
async fn serve_connection(
    socket: TcpStream,
    peer_addr: Option<SocketAddr>,
    russh_config: Arc<server::Config>,
    ctx: Arc<DispatchContext>,
    handshake_timeout: Duration,
) {
    let metrics = &ctx.metrics.metrics;
    let deadline = Instant::now() + handshake_timeout;

    let (channels_tx, channels_rx) = mpsc::channel(CHANNEL_BACKLOG);
    let (authenticated_tx, authenticated_rx) = oneshot::channel();
    let handler = GatewaySession::new(peer_addr, channels_tx, authenticated_tx);

    // -- Handshake --------------------------------------------------------

    let running = match tokio::time::timeout_at(
        deadline,
        server::run_stream(russh_config, socket, handler),
    )
    .await
    {
        Ok(Ok(running)) => running,
        Ok(Err(e)) => {
            metrics.handshake_failures_total.inc();
            info!(error = %e, "SSH handshake failed");
            return;
        }
        Err(_) => {
            metrics.handshake_failures_total.inc();
            info!("SSH handshake timed out");
            return;
        }
    };

    match tokio::time::timeout_at(deadline, authenticated_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            metrics.handshake_failures_total.inc();
            info!("client disconnected during SSH handshake");
            if let Err(e) = running.await {
                debug!(error = %e, "SSH session ended with error");
            }
            return;
        }
        Err(_) => {
            metrics.handshake_failures_total.inc();
            info!("SSH handshake timed out");
            let _ = running
                .handle()
                .disconnect(
                    Disconnect::ByApplication,
                    "handshake timed out".to_string(),
                    "en".to_string(),
                )
                .await;
            return;
        }
    }

    // -- Serve ------------------------------------------------------------

    metrics.connections_total.inc();
    metrics.active_connections.inc();

    let handle = running.handle();
    let connection = RusshConnection::new(peer_addr, handle.clone());
    let mux = tokio::spawn(
        multiplexer::run(Arc::clone(&ctx), channels_rx, connection).in_current_span(),
    );

    let mut shutdown = ctx.shutdown.clone();
    tokio::pin!(running);
    let finished = tokio::select! {
        result = &mut running => Some(result),
        () = shutdown.wait() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            debug!("shutting down; disconnecting client");
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "server shutting down".to_string(),
                    "en".to_string(),
                )
                .await;
            running.await
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "SSH session ended with error");
    }

    if let Err(e) = mux.await {
        error!(error = %e, "multiplexer task panicked");
    }
    metrics.active_connections.dec();
    info!("SSH connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use russh::{client, ChannelMsg};

    use super::*;
    use crate::config::DispatchConfig;
    use crate::ssh::router::SHELL_REFUSED_MESSAGE;
    use crate::ssh::testing::{test_context, write_delegate};

    #[test]
    fn missing_host_key_is_an_error_unless_generation_is_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            host_key_path: dir.path().join("missing_key"),
            ..Config::default()
        };
        assert!(load_host_key(&config).is_err());

        config.generate_host_key = true;
        assert!(load_host_key(&config).is_ok());
    }

    #[test]
    fn unreadable_host_key_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("id_ed25519");
        std::fs::write(&path, "not a key").unwrap();
        let config = Config {
            host_key_path: path,
            generate_host_key: true,
            ..Config::default()
        };
        assert!(load_host_key(&config).is_err());
    }

    #[tokio::test]
    async fn silent_client_counts_as_handshake_failure() {
        let repos = tempfile::tempdir().unwrap();
        let (ctx, _trigger) = test_context(repos.path(), repos.path(), DispatchConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (socket, peer_addr) = listener.accept().await.unwrap();

        let russh_config = Arc::new(russh_config(&Config::default(), KeyPair::generate_ed25519()));
        tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(
                socket,
                Some(peer_addr),
                russh_config,
                Arc::clone(&ctx),
                Duration::from_millis(200),
            ),
        )
        .await
        .expect("handshake timeout was not enforced");

        let text = ctx.metrics.encode().unwrap();
        assert!(text.contains("gitgate_handshake_failures_total 1"));
        assert!(text.contains("gitgate_connections_total 0"));
        drop(client);
    }

    #[tokio::test]
    async fn accept_loop_stops_on_shutdown() {
        let repos = tempfile::tempdir().unwrap();
        let (ctx, trigger) = test_context(repos.path(), repos.path(), DispatchConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let russh_config = Arc::new(russh_config(&Config::default(), KeyPair::generate_ed25519()));

        let server = tokio::spawn(accept_loop(
            listener,
            russh_config,
            ctx,
            Duration::from_secs(30),
        ));
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    // -- Loopback client --------------------------------------------------

    struct TestClient;

    #[async_trait::async_trait]
    impl client::Handler for TestClient {
        type Error = anyhow::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &russh_keys::key::PublicKey,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    /// What the client saw on one channel, in arrival order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Success,
        Failure,
        Stdout(Vec<u8>),
        Stderr(Vec<u8>),
        ExitStatus(u32),
        Eof,
        Close,
    }

    fn replies(seen: &[Seen]) -> Vec<Seen> {
        seen.iter()
            .filter(|s| matches!(s, Seen::Success | Seen::Failure))
            .cloned()
            .collect()
    }

    fn stdout(seen: &[Seen]) -> String {
        let bytes: Vec<u8> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Stdout(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    fn stderr(seen: &[Seen]) -> String {
        let bytes: Vec<u8> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Stderr(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    fn exit_statuses(seen: &[Seen]) -> Vec<u32> {
        seen.iter()
            .filter_map(|s| match s {
                Seen::ExitStatus(code) => Some(*code),
                _ => None,
            })
            .collect()
    }

    async fn start_gateway(ctx: Arc<DispatchContext>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let russh_config = Arc::new(russh_config(&Config::default(), KeyPair::generate_ed25519()));
        tokio::spawn(accept_loop(listener, russh_config, ctx, Duration::from_secs(5)));
        addr
    }

    async fn connect(addr: SocketAddr) -> client::Handle<TestClient> {
        let mut session = client::connect(Arc::new(client::Config::default()), addr, TestClient)
            .await
            .unwrap();
        assert!(session.authenticate_none("git").await.unwrap());
        session
    }

    /// Read channel messages until the server closes the channel.
    async fn collect(channel: &mut russh::Channel<client::Msg>) -> Vec<Seen> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Success => seen.push(Seen::Success),
                    ChannelMsg::Failure => seen.push(Seen::Failure),
                    ChannelMsg::Data { data } => seen.push(Seen::Stdout(data.to_vec())),
                    ChannelMsg::ExtendedData { data, ext: 1 } => {
                        seen.push(Seen::Stderr(data.to_vec()))
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        seen.push(Seen::ExitStatus(exit_status))
                    }
                    ChannelMsg::Eof => seen.push(Seen::Eof),
                    ChannelMsg::Close => {
                        seen.push(Seen::Close);
                        break;
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("server did not close the channel");
        seen
    }

    #[tokio::test]
    async fn pipelined_requests_each_get_their_own_reply() {
        let bin = tempfile::tempdir().unwrap();
        let repos = tempfile::tempdir().unwrap();
        write_delegate(bin.path(), "git-upload-pack", "echo \"arg=$1\"\n");
        let (ctx, _trigger) = test_context(repos.path(), bin.path(), DispatchConfig::default());
        let addr = start_gateway(Arc::clone(&ctx)).await;

        let session = connect(addr).await;
        let mut channel = session.channel_open_session().await.unwrap();
        // None of these wait for the previous reply.
        channel.exec(true, "git-upload-pack").await.unwrap();
        channel.exec(true, "rm -rf /").await.unwrap();
        channel.exec(true, "git-upload-pack repoA").await.unwrap();
        channel.exec(true, "git-upload-pack repoA").await.unwrap();
        let seen = collect(&mut channel).await;

        assert_eq!(
            replies(&seen),
            [Seen::Failure, Seen::Failure, Seen::Success, Seen::Failure]
        );
        assert_eq!(stderr(&seen), "'rm' is not a supported command\n");
        assert_eq!(
            stdout(&seen),
            format!("arg={}\n", repos.path().join("repoA").display())
        );
        assert_eq!(exit_statuses(&seen), [0]);
        let eof = seen.iter().position(|s| *s == Seen::Eof).unwrap();
        assert_eq!(eof, seen.len() - 2);
        assert_eq!(seen.last(), Some(&Seen::Close));

        let text = ctx.metrics.encode().unwrap();
        assert!(text.contains("gitgate_connections_total 1"));
        assert!(text.contains("gitgate_exec_requests_total{outcome=\"Malformed\"} 1"));
        assert!(text.contains("gitgate_exec_requests_total{outcome=\"Unsupported\"} 1"));
        assert!(text.contains("gitgate_exec_requests_total{outcome=\"Completed\"} 1"));
    }

    #[tokio::test]
    async fn client_eof_ends_delegate_input() {
        let bin = tempfile::tempdir().unwrap();
        let repos = tempfile::tempdir().unwrap();
        write_delegate(bin.path(), "git-receive-pack", "cat\n");
        let (ctx, _trigger) = test_context(repos.path(), bin.path(), DispatchConfig::default());
        let addr = start_gateway(ctx).await;

        let session = connect(addr).await;
        let mut channel = session.channel_open_session().await.unwrap();
        channel.exec(true, "git-receive-pack 'my repo'").await.unwrap();
        channel.data(&b"0032want 0000"[..]).await.unwrap();
        channel.eof().await.unwrap();
        let seen = collect(&mut channel).await;

        assert_eq!(replies(&seen), [Seen::Success]);
        assert_eq!(stdout(&seen), "0032want 0000");
        assert_eq!(exit_statuses(&seen), [0]);
        assert_eq!(seen.last(), Some(&Seen::Close));
    }

    #[tokio::test]
    async fn only_session_channels_are_opened() {
        let repos = tempfile::tempdir().unwrap();
        let (ctx, _trigger) = test_context(repos.path(), repos.path(), DispatchConfig::default());
        let addr = start_gateway(Arc::clone(&ctx)).await;

        let session = connect(addr).await;
        let refused = session
            .channel_open_direct_tcpip("localhost", 22, "127.0.0.1", 40000)
            .await;
        assert!(refused.is_err());

        let mut channel = session.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();
        let seen = collect(&mut channel).await;

        assert_eq!(replies(&seen), [Seen::Failure]);
        assert_eq!(
            stderr(&seen).as_bytes(),
            SHELL_REFUSED_MESSAGE
        );
        assert_eq!(exit_statuses(&seen), [0]);
        assert!(ctx
            .metrics
            .encode()
            .unwrap()
            .contains("gitgate_channels_rejected_total 1"));
    }
}
