//! Transport Manager: connects to an SSH server, authenticates, and keeps
//! the resulting [`russh::client::Handle`] healthy with a keepalive ticker
//! and latency sampler.
//!
//! One [`Transport`] owns one authenticated connection. Shells, SFTP
//! sessions and port-forward rules all open their own channels on
//! [`Transport::handle`]; the Transport itself is only responsible for
//! getting to `connected` and noticing when the connection dies.

pub mod handler;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{Config, Handle, Msg};
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::Preferred;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config as algo_config;
use crate::error::ConnectError;
use crate::events::{ConnectionStatus, Event, EventBus};
use crate::hostkey::{VerifyDecision, VerifyStatus};
use crate::ids::ConnectionId;
use crate::stores::{Credential, HostKeyStore};
use handler::{ForwardedChannel, SupervisorHandler};

const LATENCY_WINDOW: usize = 60;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX_MISSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Secure,
    Balanced,
    LegacyCompatible,
}

impl SecurityLevel {
    pub fn preferred(self) -> Preferred {
        match self {
            SecurityLevel::Secure => Preferred {
                kex: std::borrow::Cow::Borrowed(algo_config::SECURE_KEX_ORDER),
                key: std::borrow::Cow::Borrowed(algo_config::SECURE_KEY_TYPES),
                cipher: std::borrow::Cow::Borrowed(algo_config::SECURE_CIPHERS),
                mac: std::borrow::Cow::Borrowed(algo_config::SECURE_MAC_ALGORITHMS),
                compression: std::borrow::Cow::Borrowed(algo_config::SECURE_COMPRESSION_ALGORITHMS),
                ..Preferred::default()
            },
            SecurityLevel::Balanced => Preferred {
                kex: std::borrow::Cow::Borrowed(algo_config::BALANCED_KEX_ORDER),
                key: std::borrow::Cow::Borrowed(algo_config::BALANCED_KEY_TYPES),
                cipher: std::borrow::Cow::Borrowed(algo_config::BALANCED_CIPHERS),
                mac: std::borrow::Cow::Borrowed(algo_config::BALANCED_MAC_ALGORITHMS),
                compression: std::borrow::Cow::Borrowed(
                    algo_config::BALANCED_COMPRESSION_ALGORITHMS,
                ),
                ..Preferred::default()
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: std::borrow::Cow::Borrowed(algo_config::LEGACY_KEX_ORDER),
                key: std::borrow::Cow::Borrowed(algo_config::LEGACY_KEY_TYPES),
                cipher: std::borrow::Cow::Borrowed(algo_config::LEGACY_CIPHERS),
                mac: std::borrow::Cow::Borrowed(algo_config::LEGACY_MAC_ALGORITHMS),
                compression: std::borrow::Cow::Borrowed(algo_config::LEGACY_COMPRESSION_ALGORITHMS),
                ..Preferred::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProxyConfig {
    None,
    Socks5 { host: String, port: u16 },
    Http { host: String, port: u16 },
}

/// `auth.initialMethod` plus the material for whichever methods are
/// configured; the manager tries the server-advertised methods in order,
/// starting with `initial_method`.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub initial_method: AuthMethodKind,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub private_key_data: Option<String>,
    pub passphrase: Option<String>,
    pub use_agent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethodKind {
    PublicKey,
    Password,
    KeyboardInteractive,
    Agent,
    None,
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthConfig,
    pub proxy: ProxyConfig,
    pub security: SecurityLevel,
    pub connection_timeout: Duration,
    pub terminal_type: String,
    pub shell_command: Option<String>,
    pub environment_variables: Vec<(String, String)>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthConfig {
                initial_method: AuthMethodKind::Password,
                password: None,
                private_key_path: None,
                private_key_data: None,
                passphrase: None,
                use_agent: false,
            },
            proxy: ProxyConfig::None,
            security: SecurityLevel::Balanced,
            connection_timeout: Duration::from_secs(30),
            terminal_type: "xterm-256color".to_string(),
            shell_command: None,
            environment_variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportHealth {
    pub connected_at: Option<u64>,
    pub latency_ms: Option<u64>,
    pub latency_history: VecDeque<u64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub server_info: Option<String>,
}

impl Default for TransportHealth {
    fn default() -> Self {
        TransportHealth {
            connected_at: None,
            latency_ms: None,
            latency_history: VecDeque::with_capacity(LATENCY_WINDOW),
            bytes_in: 0,
            bytes_out: 0,
            server_info: None,
        }
    }
}

/// One authenticated SSH connection and everything that keeps it alive.
pub struct Transport {
    pub connection_id: ConnectionId,
    pub handle: Arc<RwLock<Handle<SupervisorHandler>>>,
    pub health: Arc<RwLock<TransportHealth>>,
    pub bytes_in: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
    forwarded_channels: Option<mpsc::UnboundedReceiver<ForwardedChannel>>,
    keepalive_stop: Option<oneshot::Sender<()>>,
}

/// Prompts from one keyboard-interactive round, as received from the server.
#[derive(Debug, Clone)]
pub struct KbdiRound {
    pub name: Option<String>,
    pub instruction: Option<String>,
    pub prompts: Vec<(String, bool)>,
}

/// Invoked once per KBDI round; resolves to the responses the presentation
/// layer posts back on `ssh.kbdi-response:<connectionId>`. A second round
/// starting before the first is answered supersedes it: callers construct a
/// fresh oneshot per round, so the previous receiver is simply left unawaited.
pub type KbdiRespond =
    Arc<dyn Fn(KbdiRound) -> oneshot::Receiver<Vec<String>> + Send + Sync>;

/// Connects to `config.host:config.port` and authenticates, returning a
/// live [`Transport`] once status would be `connected`. `hostkey_decide` is
/// called once per `check_server_key` invocation (normally at most once, at
/// most twice across a reconnect) and must resolve to a decision posted by
/// the presentation layer in response to `hostkey:verify-request`.
pub async fn connect(
    connection_id: ConnectionId,
    cfg: ConnectConfig,
    credential: Option<Credential>,
    events: EventBus,
    hostkey_store: Arc<dyn HostKeyStore>,
    hostkey_decide: Arc<
        dyn Fn(VerifyStatus, String) -> oneshot::Receiver<VerifyDecision> + Send + Sync,
    >,
    kbdi_respond: KbdiRespond,
) -> Result<Transport, ConnectError> {
    events
        .publish(Event::SshStatusChange {
            connection_id: connection_id.clone(),
            status: ConnectionStatus::Connecting,
        })
        .await;

    let stream = dial(&cfg).await?;

    let russh_config = Arc::new(Config {
        preferred: cfg.security.preferred(),
        inactivity_timeout: Some(cfg.connection_timeout),
        ..Default::default()
    });

    let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();

    let handler = SupervisorHandler {
        connection_id: connection_id.clone(),
        host: cfg.host.clone(),
        port: cfg.port,
        events: events.clone(),
        hostkey_store,
        verify_decision: hostkey_decide,
        forwarded_channels: forwarded_tx,
    };

    let mut handle = tokio::time::timeout(
        cfg.connection_timeout,
        russh::client::connect_stream(russh_config, stream, handler),
    )
    .await
    .map_err(|_| ConnectError::Timeout("SSH handshake timed out".to_string()))??;

    events
        .publish(Event::SshStatusChange {
            connection_id: connection_id.clone(),
            status: ConnectionStatus::Authenticating,
        })
        .await;

    // Connect failures (dial, handshake, host-key, auth) are all reported
    // once as `ssh:error` by the caller, which owns the full connect
    // pipeline including the reconnect path; see `supervisor::connect`.
    authenticate(
        &mut handle,
        &cfg,
        credential,
        &events,
        &connection_id,
        kbdi_respond,
        cfg.connection_timeout,
    )
    .await?;

    events
        .publish(Event::SshStatusChange {
            connection_id: connection_id.clone(),
            status: ConnectionStatus::Connected,
        })
        .await;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let health = Arc::new(RwLock::new(TransportHealth {
        connected_at: Some(now),
        ..Default::default()
    }));

    let handle = Arc::new(RwLock::new(handle));
    let bytes_in = Arc::new(AtomicU64::new(0));
    let bytes_out = Arc::new(AtomicU64::new(0));

    let (keepalive_stop_tx, keepalive_stop_rx) = oneshot::channel();
    spawn_keepalive(
        connection_id.clone(),
        handle.clone(),
        health.clone(),
        events.clone(),
        keepalive_stop_rx,
    );

    Ok(Transport {
        connection_id,
        handle,
        health,
        bytes_in,
        bytes_out,
        forwarded_channels: Some(forwarded_rx),
        keepalive_stop: Some(keepalive_stop_tx),
    })
}

async fn dial(cfg: &ConnectConfig) -> Result<TcpStream, ConnectError> {
    let connect_fut = async {
        match &cfg.proxy {
            ProxyConfig::None => TcpStream::connect((cfg.host.as_str(), cfg.port))
                .await
                .map_err(ConnectError::Io),
            ProxyConfig::Socks5 { host, port } => {
                crate::portforward::socks5::dial_via_socks5(host, *port, &cfg.host, cfg.port).await
            }
            ProxyConfig::Http { host, port } => {
                crate::portforward::socks5::dial_via_http_connect(host, *port, &cfg.host, cfg.port)
                    .await
            }
        }
    };

    tokio::time::timeout(cfg.connection_timeout, connect_fut)
        .await
        .map_err(|_| ConnectError::Timeout("TCP dial timed out".to_string()))?
        .map_err(|e| ConnectError::Network(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
async fn authenticate(
    handle: &mut Handle<SupervisorHandler>,
    cfg: &ConnectConfig,
    credential: Option<Credential>,
    events: &EventBus,
    connection_id: &ConnectionId,
    kbdi_respond: KbdiRespond,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let order = [
        cfg.auth.initial_method,
        AuthMethodKind::PublicKey,
        AuthMethodKind::Password,
        AuthMethodKind::KeyboardInteractive,
        AuthMethodKind::Agent,
        AuthMethodKind::None,
    ];

    let mut last_err: Option<ConnectError> = None;
    for method in order {
        let attempted: Option<Result<bool, ConnectError>> = match method {
            AuthMethodKind::Password => {
                let password = match (&credential, &cfg.auth.password) {
                    (Some(Credential::Password(p)), _) => Some(p.clone()),
                    (_, Some(p)) => Some(p.clone()),
                    _ => None,
                };
                match password {
                    Some(p) => Some(
                        handle
                            .authenticate_password(&cfg.username, &p)
                            .await
                            .map_err(ConnectError::from)
                            .map(|r| r.success()),
                    ),
                    None => None,
                }
            }
            AuthMethodKind::PublicKey => {
                let key_data = match &credential {
                    Some(Credential::PrivateKey { pem, passphrase }) => {
                        Some((pem.clone(), passphrase.clone()))
                    }
                    _ => cfg
                        .auth
                        .private_key_data
                        .clone()
                        .map(|pem| (pem, cfg.auth.passphrase.clone())),
                };
                match key_data {
                    Some((pem, passphrase)) => {
                        let key = keys::decode_secret_key(&pem, passphrase.as_deref())
                            .map_err(|e| ConnectError::Auth(format!("invalid private key: {e}")))?;
                        let key_with_hash =
                            PrivateKeyWithHashAlg::new(Arc::new(key), handle.best_supported_rsa_hash().await.ok().flatten());
                        Some(
                            handle
                                .authenticate_publickey(&cfg.username, key_with_hash)
                                .await
                                .map_err(ConnectError::from)
                                .map(|r| r.success()),
                        )
                    }
                    None => None,
                }
            }
            AuthMethodKind::KeyboardInteractive => {
                Some(
                    authenticate_kbdi(
                        handle,
                        &cfg.username,
                        events,
                        connection_id,
                        kbdi_respond.clone(),
                        timeout,
                    )
                    .await,
                )
            }
            AuthMethodKind::Agent => {
                if cfg.auth.use_agent {
                    Some(authenticate_agent(handle, &cfg.username).await)
                } else {
                    None
                }
            }
            AuthMethodKind::None => {
                // `none` is only meaningful as the configured initial method
                // against servers that allow unauthenticated session setup
                // (rare, but part of the advertised-methods set in §4.1).
                None
            }
        };

        match attempted {
            Some(Ok(true)) => return Ok(()),
            Some(Ok(false)) => {
                last_err = Some(ConnectError::Auth(format!("{method:?} rejected")));
            }
            Some(Err(e)) => last_err = Some(e),
            None => {}
        }
    }

    Err(last_err.unwrap_or_else(|| ConnectError::Auth("no acceptable authentication method".to_string())))
}

/// Drives a keyboard-interactive round-trip: start the exchange, and for
/// every `InfoRequest` the server sends, publish `ssh:kbdi-prompt` and emit
/// the prompt set through `kbdi_respond`, feeding the presentation's answers
/// back. A timeout here aborts with `ConnectError::Timeout` per §4.1a.
async fn authenticate_kbdi(
    handle: &mut Handle<SupervisorHandler>,
    username: &str,
    events: &EventBus,
    connection_id: &ConnectionId,
    kbdi_respond: KbdiRespond,
    timeout: Duration,
) -> Result<bool, ConnectError> {
    use russh::client::KeyboardInteractiveAuthResponse as Kbdi;

    tokio::time::timeout(timeout, async move {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None)
            .await?;
        loop {
            match response {
                Kbdi::Success => return Ok(true),
                Kbdi::Failure => return Ok(false),
                Kbdi::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let round = KbdiRound {
                        name: (!name.is_empty()).then_some(name),
                        instruction: (!instructions.is_empty()).then_some(instructions),
                        prompts: prompts.iter().map(|p| (p.prompt.clone(), p.echo)).collect(),
                    };
                    events
                        .publish(Event::SshKbdiPrompt {
                            connection_id: connection_id.clone(),
                            name: round.name.clone(),
                            instruction: round.instruction.clone(),
                            prompts: round
                                .prompts
                                .iter()
                                .map(|(prompt, echo)| crate::events::KbdiPrompt {
                                    prompt: prompt.clone(),
                                    echo: *echo,
                                })
                                .collect(),
                        })
                        .await;
                    let answers = kbdi_respond(round)
                        .await
                        .map_err(|_| ConnectError::Timeout("kbdi response slot dropped".into()))?;
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    })
    .await
    .map_err(|_| ConnectError::Timeout("keyboard-interactive authentication timed out".into()))?
}

/// Tries every identity offered by the running `ssh-agent`, in the order the
/// agent lists them, stopping at the first the server accepts.
async fn authenticate_agent(
    handle: &mut Handle<SupervisorHandler>,
    username: &str,
) -> Result<bool, ConnectError> {
    let mut agent = keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| ConnectError::Auth(format!("could not reach ssh-agent: {e}")))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectError::Auth(format!("could not list ssh-agent identities: {e}")))?;

    for key in identities {
        match handle
            .authenticate_publickey_with(username, key, None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(_) => continue,
        }
    }

    Ok(false)
}

fn spawn_keepalive(
    connection_id: ConnectionId,
    handle: Arc<RwLock<Handle<SupervisorHandler>>>,
    health: Arc<RwLock<TransportHealth>>,
    events: EventBus,
    mut stop: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut misses: u32 = 0;
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut stop => return,
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    let ok = {
                        let h = handle.read().await;
                        h.send_keepalive(true).await.is_ok()
                    };
                    if ok {
                        misses = 0;
                        let latency_ms = started.elapsed().as_millis() as u64;
                        let mut h = health.write().await;
                        h.latency_ms = Some(latency_ms);
                        h.latency_history.push_back(latency_ms);
                        while h.latency_history.len() > LATENCY_WINDOW {
                            h.latency_history.pop_front();
                        }
                    } else {
                        misses += 1;
                        if misses >= KEEPALIVE_MAX_MISSES {
                            events
                                .publish(Event::SshStatusChange {
                                    connection_id: connection_id.clone(),
                                    status: ConnectionStatus::Disconnected,
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    });
}

impl Transport {
    /// Takes ownership of the channel of server-initiated forwarded-tcpip
    /// channels. Returns `None` if already taken (at most one consumer, the
    /// port-forwarding manager's REMOTE-rule router, ever calls this).
    pub fn take_forwarded_channels(&mut self) -> Option<mpsc::UnboundedReceiver<ForwardedChannel>> {
        self.forwarded_channels.take()
    }

    pub async fn is_connected(&self) -> bool {
        !self.handle.read().await.is_closed()
    }

    pub async fn health_snapshot(&self) -> TransportHealth {
        let mut snap = self.health.read().await.clone();
        snap.bytes_in = self.bytes_in.load(Ordering::Relaxed);
        snap.bytes_out = self.bytes_out.load(Ordering::Relaxed);
        snap
    }

    /// Idempotent. Stops the keepalive ticker and closes the handle, which
    /// causes every channel's read pump to observe EOF.
    pub async fn disconnect(&mut self) {
        if let Some(stop) = self.keepalive_stop.take() {
            let _ = stop.send(());
        }
        let _ = self
            .handle
            .read()
            .await
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
    }
}
