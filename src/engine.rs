use std::sync::Arc;
use std::time::Duration;

use log::warn;
use russh::client::Handle;
use russh_keys::key;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BastionSpec;
use crate::credentials::{load_key, BastionHandler};
use crate::dns::DnsClient;
use crate::error::{MoguraError, MoguraResult};
use crate::hosted_zone::SharedHostedZoneResolver;
use crate::ssh_stream::SshChannelStream;
use crate::target::Target;

const RESOLVE_PERIOD: Duration = Duration::from_secs(10);
const RESOLVER_RETRY_THRESHOLD: u32 = 3;
const ERROR_SINK_CAPACITY: usize = 64;

pub type ErrorSink = mpsc::Sender<MoguraError>;
type SessionCell = Arc<RwLock<Arc<Mutex<Handle<BastionHandler>>>>>;

/// Creates a bounded error sink. The supervisor drains the receiving end to
/// the log; `publish` below drops the newest error under sustained overflow
/// rather than evicting the oldest buffered one (see DESIGN.md).
pub fn error_sink() -> (ErrorSink, mpsc::Receiver<MoguraError>) {
    mpsc::channel(ERROR_SINK_CAPACITY)
}

fn publish(sink: &ErrorSink, err: MoguraError) {
    if let Err(mpsc::error::TrySendError::Full(dropped)) = sink.try_send(err) {
        warn!(target: "mogura::engine", "error sink full, dropping: {}", dropped);
    }
}

/// Owns one SSH session and one local listener: the accept loop, the
/// periodic resolver, and orderly shutdown of both.
pub struct TunnelEngine {
    name: String,
    session: SessionCell,
    target: Arc<Mutex<Target>>,
    local_done: CancellationToken,
    remote_done: CancellationToken,
    closed: Arc<Mutex<bool>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    resolver_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        name: String,
        bastion: BastionSpec,
        local_bind_port: u16,
        target: Target,
        forwarding_timeout: Duration,
        dns: Option<DnsClient>,
        hosted_zone: Option<SharedHostedZoneResolver>,
        error_tx: ErrorSink,
    ) -> MoguraResult<Self> {
        let key = load_key(&bastion.key_path, bastion.passphrase.as_deref())?;
        Self::start_with_key(
            name,
            bastion,
            local_bind_port,
            target,
            forwarding_timeout,
            dns,
            hosted_zone,
            error_tx,
            key,
        )
        .await
    }

    /// Does the real work of `start`, parameterized by an already-loaded
    /// client key so callers (production and tests) load the key exactly
    /// once regardless of how many dial attempts follow.
    #[allow(clippy::too_many_arguments)]
    async fn start_with_key(
        name: String,
        bastion: BastionSpec,
        local_bind_port: u16,
        mut target: Target,
        forwarding_timeout: Duration,
        dns: Option<DnsClient>,
        hosted_zone: Option<SharedHostedZoneResolver>,
        error_tx: ErrorSink,
        key: key::KeyPair,
    ) -> MoguraResult<Self> {
        let key = Arc::new(key);
        let session_handle = dial_and_authenticate(&bastion, key.clone()).await?;
        let session: Arc<Mutex<Handle<BastionHandler>>> = Arc::new(Mutex::new(session_handle));

        let listener = match TcpListener::bind(("127.0.0.1", local_bind_port)).await {
            Ok(l) => l,
            Err(e) => {
                close_session(&session).await;
                return Err(MoguraError::ListenerBind(format!("{}: {}", name, e)));
            }
        };

        if let Err(e) = target
            .resolve(&session, dns.as_ref(), hosted_zone.as_ref())
            .await
        {
            close_session(&session).await;
            drop(listener);
            return Err(e);
        }

        let test_dial = {
            let guard = session.lock().await;
            guard
                .channel_open_direct_tcpip(
                    &target.resolved_host,
                    target.resolved_port as u32,
                    "127.0.0.1",
                    0,
                )
                .await
        };
        match test_dial {
            Ok(channel) => {
                let _ = channel.close().await;
            }
            Err(e) => {
                close_session(&session).await;
                drop(listener);
                let text = e.to_string();
                if is_administratively_prohibited(&text) {
                    return Err(MoguraError::ForwardingProhibited(format!(
                        "{}: {}",
                        name, text
                    )));
                }
                return Err(MoguraError::DialFailed(format!("{}: {}", name, text)));
            }
        }

        let session_cell: SessionCell = Arc::new(RwLock::new(session));
        let target_cell = Arc::new(Mutex::new(target));
        let local_done = CancellationToken::new();
        let remote_done = CancellationToken::new();
        let closed = Arc::new(Mutex::new(false));

        let resolver_handle = tokio::spawn(resolver_loop(
            name.clone(),
            target_cell.clone(),
            session_cell.clone(),
            dns,
            hosted_zone,
            error_tx.clone(),
            bastion.clone(),
            key.clone(),
            remote_done.clone(),
        ));

        let accept_handle = tokio::spawn(accept_loop(
            name.clone(),
            listener,
            session_cell.clone(),
            target_cell.clone(),
            forwarding_timeout,
            error_tx.clone(),
            local_done.clone(),
            remote_done.clone(),
            bastion,
            key,
            closed.clone(),
        ));

        Ok(Self {
            name,
            session: session_cell,
            target: target_cell,
            local_done,
            remote_done,
            closed,
            accept_handle: Mutex::new(Some(accept_handle)),
            resolver_handle: Mutex::new(Some(resolver_handle)),
        })
    }

    /// Fires both shutdown signals, waits for the accept/resolver tasks to
    /// observe them, and disconnects the SSH session. Idempotent: a second
    /// call is a no-op and publishes nothing. If `accept_loop` already
    /// disconnected the session itself (administratively-prohibited path),
    /// this still cancels/joins unconditionally but skips the redundant
    /// disconnect.
    pub async fn close(&self) -> MoguraResult<()> {
        let mut closed = self.closed.lock().await;
        let already_closed = *closed;
        *closed = true;
        drop(closed);

        self.local_done.cancel();
        self.remote_done.cancel();

        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.resolver_handle.lock().await.take() {
            let _ = handle.await;
        }

        if already_closed {
            return Ok(());
        }

        let session = self.session.read().await.clone();
        let mut errors = Vec::new();
        {
            let guard = session.lock().await;
            if let Err(e) = guard
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MoguraError::CloseFailed(format!(
                "{}: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }
}

async fn close_session(session: &Arc<Mutex<Handle<BastionHandler>>>) {
    let guard = session.lock().await;
    let _ = guard
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
}

fn is_administratively_prohibited(text: &str) -> bool {
    text.to_lowercase().contains("administratively prohibited")
}

async fn dial_and_authenticate(
    bastion: &BastionSpec,
    key: Arc<key::KeyPair>,
) -> MoguraResult<Handle<BastionHandler>> {
    let config = Arc::new(russh::client::Config::default());
    let mut session = russh::client::connect(config, (bastion.host.as_str(), bastion.port), BastionHandler)
        .await
        .map_err(|e| MoguraError::SshDial(format!("{}:{}: {}", bastion.host, bastion.port, e)))?;

    let authenticated = session
        .authenticate_publickey(&bastion.user, key)
        .await
        .map_err(|e| MoguraError::SshDial(format!("authentication error: {}", e)))?;

    if !authenticated {
        return Err(MoguraError::SshDial(
            "publickey authentication rejected".to_string(),
        ));
    }

    Ok(session)
}

/// Best-effort reconnect: dial and authenticate a fresh session, then
/// atomically swap it in under the session cell's write lock, closing the
/// previous session once the new one is installed. Concurrent accepts
/// holding a clone of the old `Arc` simply fail their dial and retry
/// through this same path.
async fn reconnect(
    bastion: &BastionSpec,
    session: &SessionCell,
    key: Arc<key::KeyPair>,
) -> MoguraResult<()> {
    let new_session = dial_and_authenticate(bastion, key).await?;
    let previous = {
        let mut guard = session.write().await;
        std::mem::replace(&mut *guard, Arc::new(Mutex::new(new_session)))
    };
    close_session(&previous).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    name: String,
    listener: TcpListener,
    session: SessionCell,
    target: Arc<Mutex<Target>>,
    forwarding_timeout: Duration,
    error_tx: ErrorSink,
    local_done: CancellationToken,
    remote_done: CancellationToken,
    bastion: BastionSpec,
    key: Arc<key::KeyPair>,
    closed: Arc<Mutex<bool>>,
) {
    loop {
        tokio::select! {
            _ = local_done.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let (host, port) = {
                            let t = target.lock().await;
                            (t.resolved_host.clone(), t.resolved_port)
                        };

                        let current_session = session.read().await.clone();
                        let dial_result = {
                            let guard = current_session.lock().await;
                            guard.channel_open_direct_tcpip(&host, port as u32, "127.0.0.1", 0).await
                        };

                        match dial_result {
                            Ok(channel) => {
                                tokio::spawn(forward(
                                    stream,
                                    channel,
                                    forwarding_timeout,
                                    error_tx.clone(),
                                    name.clone(),
                                ));
                            }
                            Err(e) => {
                                let text = e.to_string();
                                drop(stream);
                                if is_administratively_prohibited(&text) {
                                    publish(&error_tx, MoguraError::ForwardingProhibited(format!("{}: {}", name, text)));
                                    let mut closed_guard = closed.lock().await;
                                    if !*closed_guard {
                                        *closed_guard = true;
                                        drop(closed_guard);
                                        close_session(&current_session).await;
                                    }
                                    local_done.cancel();
                                    remote_done.cancel();
                                    break;
                                }
                                publish(&error_tx, MoguraError::DialFailed(format!("{}: {}", name, text)));
                                if let Err(reconnect_err) = reconnect(&bastion, &session, key.clone()).await {
                                    publish(&error_tx, MoguraError::SshReconnectFailed(format!("{}: {}", name, reconnect_err)));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if local_done.is_cancelled() {
                            break;
                        }
                        publish(&error_tx, MoguraError::AcceptFailed(format!("{}: {}", name, e)));
                    }
                }
            }
        }
    }
}

async fn resolver_loop(
    name: String,
    target: Arc<Mutex<Target>>,
    session: SessionCell,
    dns: Option<DnsClient>,
    hosted_zone: Option<SharedHostedZoneResolver>,
    error_tx: ErrorSink,
    bastion: BastionSpec,
    key: Arc<key::KeyPair>,
    remote_done: CancellationToken,
) {
    let mut retry_count: u32 = 0;
    loop {
        tokio::select! {
            _ = remote_done.cancelled() => break,
            _ = tokio::time::sleep(RESOLVE_PERIOD) => {
                let current_session = session.read().await.clone();
                let result = {
                    let mut t = target.lock().await;
                    t.resolve(&current_session, dns.as_ref(), hosted_zone.as_ref()).await
                };

                match result {
                    Ok(()) => {
                        retry_count = 0;
                    }
                    Err(e) => {
                        retry_count += 1;
                        publish(&error_tx, MoguraError::ResolverFailed(format!("{}: {}", name, e)));
                        if retry_count > RESOLVER_RETRY_THRESHOLD {
                            publish(&error_tx, MoguraError::ResolverRetryThresholdExceeded(name.clone()));
                        }
                        if let Err(reconnect_err) = reconnect(&bastion, &session, key.clone()).await {
                            publish(&error_tx, MoguraError::SshReconnectFailed(format!("{}: {}", name, reconnect_err)));
                        }
                    }
                }
            }
        }
    }
}

/// Spawns two concurrent copy tasks (`local -> ssh`, `ssh -> local`) and
/// races "both complete" against `timeout`. A clean EOF on either direction
/// is a normal forwarder exit, not an error (see DESIGN.md); only a genuine
/// I/O error is published as `copy-failed`.
async fn forward(
    local: TcpStream,
    channel: russh::Channel<russh::client::Msg>,
    timeout: Duration,
    error_tx: ErrorSink,
    tunnel_name: String,
) {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let ssh_stream = SshChannelStream::new(channel);
    let (mut ssh_read, mut ssh_write) = tokio::io::split(ssh_stream);

    let to_ssh = tokio::spawn(async move { tokio::io::copy(&mut local_read, &mut ssh_write).await });
    let to_local = tokio::spawn(async move { tokio::io::copy(&mut ssh_read, &mut local_write).await });

    let to_ssh_abort = to_ssh.abort_handle();
    let to_local_abort = to_local.abort_handle();

    let both_complete = async {
        let r1 = to_ssh.await;
        let r2 = to_local.await;
        (r1, r2)
    };

    tokio::select! {
        (r1, r2) = both_complete => {
            report_copy_outcome(r1, &error_tx, &tunnel_name, "local->ssh");
            report_copy_outcome(r2, &error_tx, &tunnel_name, "ssh->local");
        }
        _ = tokio::time::sleep(timeout) => {
            to_ssh_abort.abort();
            to_local_abort.abort();
        }
    }
}

fn report_copy_outcome(
    result: Result<std::io::Result<u64>, tokio::task::JoinError>,
    error_tx: &ErrorSink,
    tunnel_name: &str,
    direction: &str,
) {
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => publish(
            error_tx,
            MoguraError::CopyFailed(format!("{} [{}]: {}", tunnel_name, direction, e)),
        ),
        Err(e) if e.is_cancelled() => {}
        Err(e) => publish(
            error_tx,
            MoguraError::CopyFailed(format!("{} [{}]: {}", tunnel_name, direction, e)),
        ),
    }
}

/// In-process fake SSH bastion exercising `TunnelEngine` end to end, grounded
/// on `tunnl`'s `Server`/`Handler` split (adapted here to the 0.45
/// `russh::server` API this crate's Cargo.toml pins; `tunnl` itself pins a
/// newer 0.48 API, so the method signatures below follow 0.45's shape, not
/// that file literally). `channel_open_direct_tcpip` has no server-side
/// counterpart anywhere in the retrieved examples, so this Handler impl is
/// written directly against the trait.
#[cfg(test)]
mod fake_bastion_tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use russh::server::{Auth, Msg as ServerMsg, Server as RusshServer, Session};
    use russh::{Channel as ServerChannel, ChannelId};
    use russh_keys::key::{KeyPair, PublicKey};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc as tmpsc;

    use super::*;
    use crate::target::{Target, TargetType};

    #[derive(Clone)]
    struct FakeBastion {
        forbidden_port: Option<u16>,
    }

    impl RusshServer for FakeBastion {
        type Handler = FakeBastionHandler;

        fn new_client(&mut self, _peer_addr: Option<SocketAddr>) -> Self::Handler {
            FakeBastionHandler {
                forbidden_port: self.forbidden_port,
                channels: HashMap::new(),
            }
        }
    }

    struct FakeBastionHandler {
        forbidden_port: Option<u16>,
        channels: HashMap<ChannelId, tmpsc::UnboundedSender<Vec<u8>>>,
    }

    #[async_trait]
    impl russh::server::Handler for FakeBastionHandler {
        type Error = russh::Error;

        async fn auth_publickey(
            &mut self,
            _user: &str,
            _public_key: &PublicKey,
        ) -> Result<Auth, Self::Error> {
            Ok(Auth::Accept)
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: ServerChannel<ServerMsg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            session: &mut Session,
        ) -> Result<bool, Self::Error> {
            // Returning Ok(false) denies the channel open; russh reports
            // SSH_OPEN_ADMINISTRATIVELY_PROHIBITED for a denied direct-tcpip
            // open per RFC 4254, matching `is_administratively_prohibited`.
            if self.forbidden_port == Some(port_to_connect as u16) {
                return Ok(false);
            }

            let target = match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
                Ok(s) => s,
                Err(_) => return Ok(false),
            };

            let channel_id = channel.id();
            let (tx, mut rx) = tmpsc::unbounded_channel::<Vec<u8>>();
            self.channels.insert(channel_id, tx);

            let (mut target_read, mut target_write) = target.into_split();
            let handle = session.handle();

            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if target_write.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match target_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if handle.data(channel_id, buf[..n].to_vec().into()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(true)
        }

        async fn data(
            &mut self,
            channel: ChannelId,
            data: &[u8],
            _session: &mut Session,
        ) -> Result<(), Self::Error> {
            if let Some(tx) = self.channels.get(&channel) {
                let _ = tx.send(data.to_vec());
            }
            Ok(())
        }
    }

    async fn free_tcp_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn spawn_fake_bastion(forbidden_port: Option<u16>) -> u16 {
        let port = free_tcp_port().await;
        let key = KeyPair::generate_ed25519().expect("ed25519 keygen");
        let config = russh::server::Config {
            keys: vec![key],
            ..Default::default()
        };
        let mut server = FakeBastion { forbidden_port };
        let config = Arc::new(config);
        tokio::spawn(async move {
            let _ = server.run_on_address(config, ("127.0.0.1", port)).await;
        });
        // Give the listener a moment to come up before the client dials it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    async fn spawn_echo_server() -> u16 {
        let port = free_tcp_port().await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    fn test_bastion(port: u16) -> BastionSpec {
        BastionSpec {
            host: "127.0.0.1".to_string(),
            port,
            user: "test".to_string(),
            key_path: std::path::PathBuf::new(),
            passphrase: None,
            remote_dns: None,
        }
    }

    #[tokio::test]
    async fn static_host_port_round_trip() {
        let echo_port = spawn_echo_server().await;
        let bastion_port = spawn_fake_bastion(None).await;
        let local_bind_port = free_tcp_port().await;

        let (error_tx, _error_rx) = error_sink();
        let target = Target::new("t", TargetType::HostPort, "127.0.0.1", echo_port).unwrap();
        let key = KeyPair::generate_ed25519().expect("ed25519 keygen");

        let engine = TunnelEngine::start_with_key(
            "t".to_string(),
            test_bastion(bastion_port),
            local_bind_port,
            target,
            Duration::from_secs(5),
            None,
            None,
            error_tx,
            key,
        )
        .await
        .expect("engine should start");

        let mut client = TcpStream::connect(("127.0.0.1", local_bind_port))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn listener_closes_after_close_with_no_accept_failed_error() {
        let echo_port = spawn_echo_server().await;
        let bastion_port = spawn_fake_bastion(None).await;
        let local_bind_port = free_tcp_port().await;

        let (error_tx, mut error_rx) = error_sink();
        let target = Target::new("t", TargetType::HostPort, "127.0.0.1", echo_port).unwrap();
        let key = KeyPair::generate_ed25519().expect("ed25519 keygen");

        let engine = TunnelEngine::start_with_key(
            "t".to_string(),
            test_bastion(bastion_port),
            local_bind_port,
            target,
            Duration::from_secs(5),
            None,
            None,
            error_tx,
            key,
        )
        .await
        .expect("engine should start");

        engine.close().await.unwrap();

        let dial = TcpStream::connect(("127.0.0.1", local_bind_port)).await;
        assert!(dial.is_err(), "local bind port should be released after close");

        error_rx.close();
        while let Some(err) = error_rx.recv().await {
            assert!(!matches!(err, MoguraError::AcceptFailed(_)));
        }
    }

    #[tokio::test]
    async fn idle_connection_is_torn_down_within_forwarding_timeout() {
        let echo_port = spawn_echo_server().await;
        let bastion_port = spawn_fake_bastion(None).await;
        let local_bind_port = free_tcp_port().await;

        let (error_tx, _error_rx) = error_sink();
        let target = Target::new("t", TargetType::HostPort, "127.0.0.1", echo_port).unwrap();
        let key = KeyPair::generate_ed25519().expect("ed25519 keygen");

        let engine = TunnelEngine::start_with_key(
            "t".to_string(),
            test_bastion(bastion_port),
            local_bind_port,
            target,
            Duration::from_millis(100),
            None,
            None,
            error_tx,
            key,
        )
        .await
        .expect("engine should start");

        let mut client = TcpStream::connect(("127.0.0.1", local_bind_port))
            .await
            .unwrap();

        // Stay idle; the forwarder should tear the connection down within
        // 200ms of accept per the 100ms timeout.
        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await;
        match result {
            Ok(Ok(n)) => assert_eq!(n, 0, "connection should be closed, not yield data"),
            Ok(Err(_)) => {}
            Err(_) => panic!("connection was not torn down within 200ms of the 100ms timeout"),
        }

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn administratively_prohibited_start_fails_with_no_listener_bound() {
        let echo_port = spawn_echo_server().await;
        let bastion_port = spawn_fake_bastion(Some(echo_port)).await;
        let local_bind_port = free_tcp_port().await;

        let (error_tx, _error_rx) = error_sink();
        let target = Target::new("t", TargetType::HostPort, "127.0.0.1", echo_port).unwrap();
        let key = KeyPair::generate_ed25519().expect("ed25519 keygen");

        let err = TunnelEngine::start_with_key(
            "t".to_string(),
            test_bastion(bastion_port),
            local_bind_port,
            target,
            Duration::from_secs(5),
            None,
            None,
            error_tx,
            key,
        )
        .await
        .expect_err("start should fail on administratively-prohibited test dial");

        assert!(matches!(err, MoguraError::ForwardingProhibited(_)));

        let dial = TcpStream::connect(("127.0.0.1", local_bind_port)).await;
        assert!(dial.is_err(), "no listener should remain bound after a failed start");
    }
}
