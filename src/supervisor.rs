//! Connection Supervisor: the crate's public facade.
//!
//! One [`ConnectionSupervisor`] owns every live connection. Each connection
//! is a [`ConnectionActor`] bundling a [`Transport`], a [`ShellMultiplexer`],
//! a [`PortForwardManager`] and, once requested, an [`SftpEngine`] — plus the
//! [`ReconnectController`] that redials on an unexpected drop. The top-level
//! registry is a lock-free [`DashMap`] keyed by [`ConnectionId`], grounded in
//! the teacher's own per-session `dashmap` registry, generalized from one
//! command queue to the handful of subsystems a connection now owns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};

use crate::error::ConnectError;
use crate::events::{ConnectionStatus, Event, EventBus};
use crate::hostkey::{VerifyDecision, VerifyStatus};
use crate::ids::{ConnectionId, RuleId, ShellId, TransferId};
use crate::portforward::{ForwardKind, ForwardRule, PortForwardManager};
use crate::reconnect::{ReconnectConfig, ReconnectController, ReconnectSnapshot};
use crate::sftp::transfer::{TransferItem, TransferRequest};
use crate::sftp::{DirEntry, SftpEngine};
use crate::shell::{ShellConfig, ShellMultiplexer};
use crate::stores::{Credential, HostKeyStore};
use crate::transport::{self, ConnectConfig, KbdiRespond, KbdiRound, Transport, TransportHealth};

/// Transport health plus the reconnect controller's state, the shape
/// `ssh.getHealth` replies with.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionHealth {
    pub transport: Option<TransportHealth>,
    pub reconnect: Option<ReconnectSnapshot>,
}

struct ConnectionActor {
    transport: RwLock<Option<Transport>>,
    shell: RwLock<Option<ShellMultiplexer>>,
    portforward: RwLock<Option<PortForwardManager>>,
    sftp: RwLock<Option<SftpEngine>>,
    reconnect: RwLock<Option<ReconnectController>>,
    explicit_disconnect: AtomicBool,
    pending_hostkey: Arc<std::sync::Mutex<Option<oneshot::Sender<VerifyDecision>>>>,
    pending_kbdi: Arc<std::sync::Mutex<Option<oneshot::Sender<Vec<String>>>>>,
}

impl ConnectionActor {
    fn new() -> Self {
        ConnectionActor {
            transport: RwLock::new(None),
            shell: RwLock::new(None),
            portforward: RwLock::new(None),
            sftp: RwLock::new(None),
            reconnect: RwLock::new(None),
            explicit_disconnect: AtomicBool::new(false),
            pending_hostkey: Arc::new(std::sync::Mutex::new(None)),
            pending_kbdi: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

pub struct ConnectionSupervisor {
    events: EventBus,
    hostkey_store: Arc<dyn HostKeyStore>,
    sftp_concurrency: usize,
    sftp_bandwidth_limit_kbps: u64,
    reconnect_config: ReconnectConfig,
    connections: Arc<DashMap<ConnectionId, Arc<ConnectionActor>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        events: EventBus,
        hostkey_store: Arc<dyn HostKeyStore>,
        sftp_concurrency: usize,
        sftp_bandwidth_limit_kbps: u64,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        ConnectionSupervisor {
            events,
            hostkey_store,
            sftp_concurrency,
            sftp_bandwidth_limit_kbps,
            reconnect_config,
            connections: Arc::new(DashMap::new()),
        }
    }

    fn actor(&self, connection_id: &ConnectionId) -> Arc<ConnectionActor> {
        self.connections
            .entry(connection_id.clone())
            .or_insert_with(|| Arc::new(ConnectionActor::new()))
            .clone()
    }

    fn existing_actor(&self, connection_id: &ConnectionId) -> Result<Arc<ConnectionActor>, ConnectError> {
        self.connections
            .get(connection_id)
            .map(|e| e.clone())
            .ok_or_else(|| ConnectError::NotConnected(format!("no connection {connection_id}")))
    }

    /// Connects and authenticates, then starts the reconnect watcher. Fails
    /// once, the way every connect failure does, and also surfaces as
    /// `ssh:error` (the Transport's connect pipeline publishes status
    /// changes; this is the single place that turns a failure into the
    /// `ssh:error` event per §7).
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        cfg: ConnectConfig,
        credential: Option<Credential>,
    ) -> Result<(), ConnectError> {
        let actor = self.actor(&connection_id);
        actor.explicit_disconnect.store(false, Ordering::SeqCst);

        let hostkey_decide = make_hostkey_decide(actor.pending_hostkey.clone());
        let kbdi_respond = make_kbdi_respond(actor.pending_kbdi.clone());

        let result = establish(
            &self.events,
            &self.hostkey_store,
            &actor,
            &connection_id,
            &cfg,
            &credential,
            hostkey_decide,
            kbdi_respond,
        )
        .await;

        if let Err(e) = &result {
            self.events
                .publish(Event::SshError {
                    connection_id: connection_id.clone(),
                    error: e.wire_message(),
                })
                .await;
            return result;
        }

        self.spawn_reconnect(connection_id, cfg, credential, actor);
        Ok(())
    }

    fn spawn_reconnect(
        &self,
        connection_id: ConnectionId,
        cfg: ConnectConfig,
        credential: Option<Credential>,
        actor: Arc<ConnectionActor>,
    ) {
        let events = self.events.clone();
        let hostkey_store = self.hostkey_store.clone();
        let reconnect_actor = actor.clone();
        let reconnect_connection_id = connection_id.clone();

        let connect_fn: crate::reconnect::ConnectFn = Arc::new(move || {
            let events = events.clone();
            let hostkey_store = hostkey_store.clone();
            let actor = reconnect_actor.clone();
            let connection_id = reconnect_connection_id.clone();
            let cfg = cfg.clone();
            let credential = credential.clone();
            Box::pin(async move {
                let hostkey_decide = make_hostkey_decide(actor.pending_hostkey.clone());
                let kbdi_respond = make_kbdi_respond(actor.pending_kbdi.clone());
                establish(
                    &events,
                    &hostkey_store,
                    &actor,
                    &connection_id,
                    &cfg,
                    &credential,
                    hostkey_decide,
                    kbdi_respond,
                )
                .await
            })
        });

        let controller = ReconnectController::spawn(
            connection_id.clone(),
            self.events.clone(),
            self.reconnect_config,
            connect_fn,
        );

        tokio::spawn({
            let controller = controller.clone();
            let actor = actor.clone();
            let connection_id = connection_id.clone();
            let events = self.events.clone();
            async move {
                let (_sub, mut rx) = events.subscribe().await;
                while let Ok(event) = rx.recv().await {
                    if let Event::SshStatusChange { connection_id: id, status: ConnectionStatus::Disconnected } = event {
                        if id == connection_id && !actor.explicit_disconnect.load(Ordering::SeqCst) {
                            controller.notify_dropped();
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            *actor.reconnect.write().await = Some(controller);
        });
    }

    /// Idempotent: a second call on an already-disconnected connection is a
    /// no-op that emits nothing further.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let Some(actor) = self.connections.get(connection_id).map(|e| e.clone()) else {
            return Ok(());
        };
        actor.explicit_disconnect.store(true, Ordering::SeqCst);

        if let Some(reconnect) = actor.reconnect.read().await.as_ref() {
            reconnect.cancel();
        }
        if let Some(shell) = actor.shell.write().await.take() {
            shell.close_all().await;
        }
        if let Some(portforward) = actor.portforward.write().await.take() {
            for rule in portforward.list_rules().await {
                let _ = portforward.remove_rule(&rule.id).await;
            }
        }
        actor.sftp.write().await.take();

        let transport = actor.transport.write().await.take();
        if let Some(mut transport) = transport {
            transport.disconnect().await;
            self.events
                .publish(Event::SshStatusChange {
                    connection_id: connection_id.clone(),
                    status: ConnectionStatus::Disconnected,
                })
                .await;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) -> Result<(), ConnectError> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await?;
        }
        Ok(())
    }

    pub async fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        match self.connections.get(connection_id) {
            Some(actor) => match actor.transport.read().await.as_ref() {
                Some(t) => t.is_connected().await,
                None => false,
            },
            None => false,
        }
    }

    pub async fn get_health(&self, connection_id: &ConnectionId) -> Result<ConnectionHealth, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let transport = match actor.transport.read().await.as_ref() {
            Some(t) => Some(t.health_snapshot().await),
            None => None,
        };
        let reconnect = match actor.reconnect.read().await.as_ref() {
            Some(r) => Some(r.snapshot().await),
            None => None,
        };
        Ok(ConnectionHealth { transport, reconnect })
    }

    pub async fn reconnect_retry_now(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(r) = actor.reconnect.read().await.as_ref() {
            r.retry_now();
        }
        Ok(())
    }

    pub async fn reconnect_pause(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(r) = actor.reconnect.read().await.as_ref() {
            r.pause();
        }
        Ok(())
    }

    pub async fn reconnect_resume(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(r) = actor.reconnect.read().await.as_ref() {
            r.resume();
        }
        Ok(())
    }

    pub async fn reconnect_cancel(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(r) = actor.reconnect.read().await.as_ref() {
            r.cancel();
        }
        Ok(())
    }

    pub async fn kbdi_response(&self, connection_id: &ConnectionId, responses: Vec<String>) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(tx) = actor.pending_kbdi.lock().unwrap().take() {
            let _ = tx.send(responses);
        }
        Ok(())
    }

    pub async fn hostkey_verify_response(&self, connection_id: &ConnectionId, decision: VerifyDecision) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if let Some(tx) = actor.pending_hostkey.lock().unwrap().take() {
            let _ = tx.send(decision);
        }
        Ok(())
    }

    // --- Shell Multiplexer ---

    pub async fn open_shell(&self, connection_id: &ConnectionId, shell_id: ShellId, cfg: ShellConfig) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.shell.read().await;
        let shell = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        shell.open_shell(shell_id, cfg).await
    }

    pub async fn write_shell(&self, connection_id: &ConnectionId, shell_id: &ShellId, data: Vec<u8>) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.shell.read().await;
        let shell = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        shell.write_shell(shell_id, data).await
    }

    pub async fn resize_shell(&self, connection_id: &ConnectionId, shell_id: &ShellId, cols: u32, rows: u32) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.shell.read().await;
        let shell = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        shell.resize_shell(shell_id, cols, rows).await
    }

    pub async fn close_shell(&self, connection_id: &ConnectionId, shell_id: &ShellId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.shell.read().await;
        let shell = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        shell.close_shell(shell_id).await
    }

    // --- SFTP Engine ---

    pub async fn sftp_open(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        if actor.sftp.read().await.is_some() {
            return Ok(());
        }
        let handle = {
            let guard = actor.transport.read().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
            transport.handle.clone()
        };
        let engine = SftpEngine::open(
            connection_id.clone(),
            handle,
            self.events.clone(),
            self.sftp_concurrency,
            self.sftp_bandwidth_limit_kbps,
        )
        .await?;
        *actor.sftp.write().await = Some(engine);
        Ok(())
    }

    pub async fn sftp_close(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        actor.sftp.write().await.take();
        Ok(())
    }

    async fn with_sftp<T>(
        &self,
        connection_id: &ConnectionId,
        f: impl for<'a> FnOnce(&'a SftpEngine) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ConnectError>> + Send + 'a>>,
    ) -> Result<T, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.sftp.read().await;
        let engine = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no open SFTP session")))?;
        f(engine).await
    }

    pub async fn sftp_readdir(&self, connection_id: &ConnectionId, path: String) -> Result<Vec<DirEntry>, ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.readdir(&path).await })).await
    }

    pub async fn sftp_stat(&self, connection_id: &ConnectionId, path: String) -> Result<DirEntry, ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.stat(&path).await })).await
    }

    pub async fn sftp_realpath(&self, connection_id: &ConnectionId, path: String) -> Result<String, ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.realpath(&path).await })).await
    }

    pub async fn sftp_mkdir(&self, connection_id: &ConnectionId, path: String) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.mkdir(&path).await })).await
    }

    pub async fn sftp_unlink(&self, connection_id: &ConnectionId, path: String) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.unlink(&path).await })).await
    }

    pub async fn sftp_rmdir(&self, connection_id: &ConnectionId, path: String, recursive: bool) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.rmdir(&path, recursive).await })).await
    }

    pub async fn sftp_rename(&self, connection_id: &ConnectionId, from: String, to: String) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.rename(&from, &to).await })).await
    }

    pub async fn sftp_chmod(&self, connection_id: &ConnectionId, path: String, mode: u32, recursive: bool) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.chmod(&path, mode, recursive).await })).await
    }

    pub async fn sftp_read_file(&self, connection_id: &ConnectionId, path: String) -> Result<Vec<u8>, ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.read_file(&path, None).await })).await
    }

    pub async fn sftp_write_file(&self, connection_id: &ConnectionId, path: String, data: Vec<u8>) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.write_file(&path, &data).await })).await
    }

    pub async fn sftp_symlink(&self, connection_id: &ConnectionId, path: String, target: String) -> Result<(), ConnectError> {
        self.with_sftp(connection_id, |engine| Box::pin(async move { engine.symlink(&path, &target).await })).await
    }

    pub async fn sftp_download(&self, connection_id: &ConnectionId, remote_path: String, local_path: PathBuf) -> Result<TransferId, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.sftp.read().await;
        let engine = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no open SFTP session")))?;
        Ok(engine.transfers.enqueue(TransferRequest {
            local_path,
            remote_path,
            direction: crate::sftp::transfer::TransferDirection::Download,
            keep_partial: false,
        }))
    }

    pub async fn sftp_upload(&self, connection_id: &ConnectionId, local_path: PathBuf, remote_path: String) -> Result<TransferId, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.sftp.read().await;
        let engine = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no open SFTP session")))?;
        Ok(engine.transfers.enqueue(TransferRequest {
            local_path,
            remote_path,
            direction: crate::sftp::transfer::TransferDirection::Upload,
            keep_partial: false,
        }))
    }

    pub async fn sftp_transfer_pause(&self, connection_id: &ConnectionId, transfer_id: &TransferId) -> Result<(), ConnectError> {
        self.with_transfers(connection_id, |t| t.pause(transfer_id)).await
    }

    pub async fn sftp_transfer_resume(&self, connection_id: &ConnectionId, transfer_id: &TransferId) -> Result<(), ConnectError> {
        self.with_transfers(connection_id, |t| t.resume(transfer_id)).await
    }

    pub async fn sftp_transfer_cancel(&self, connection_id: &ConnectionId, transfer_id: &TransferId) -> Result<(), ConnectError> {
        self.with_transfers(connection_id, |t| t.cancel(transfer_id)).await
    }

    pub async fn sftp_transfer_retry(&self, connection_id: &ConnectionId, transfer_id: &TransferId) -> Result<(), ConnectError> {
        self.with_transfers(connection_id, |t| t.retry(transfer_id)).await
    }

    pub async fn sftp_transfer_list(&self, connection_id: &ConnectionId) -> Result<Vec<TransferItem>, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.sftp.read().await;
        let engine = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no open SFTP session")))?;
        Ok(engine.transfers.list())
    }

    async fn with_transfers(
        &self,
        connection_id: &ConnectionId,
        f: impl FnOnce(&crate::sftp::transfer::TransferEngine) -> Result<(), ConnectError>,
    ) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.sftp.read().await;
        let engine = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no open SFTP session")))?;
        f(&engine.transfers)
    }

    // --- Port Forwarding Manager ---

    pub async fn portforward_add(&self, connection_id: &ConnectionId, kind: ForwardKind) -> Result<ForwardRule, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.portforward.read().await;
        let manager = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        manager.add_rule(kind).await
    }

    pub async fn portforward_remove(&self, connection_id: &ConnectionId, rule_id: &RuleId) -> Result<(), ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.portforward.read().await;
        let manager = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        manager.remove_rule(rule_id).await
    }

    pub async fn portforward_list(&self, connection_id: &ConnectionId) -> Result<Vec<ForwardRule>, ConnectError> {
        let actor = self.existing_actor(connection_id)?;
        let guard = actor.portforward.read().await;
        let manager = guard
            .as_ref()
            .ok_or_else(|| ConnectError::NotConnected(format!("{connection_id} has no live transport")))?;
        Ok(manager.list_rules().await)
    }
}

fn make_hostkey_decide(
    pending: Arc<std::sync::Mutex<Option<oneshot::Sender<VerifyDecision>>>>,
) -> Arc<dyn Fn(VerifyStatus, String) -> oneshot::Receiver<VerifyDecision> + Send + Sync> {
    Arc::new(move |_status, _fingerprint| {
        let (tx, rx) = oneshot::channel();
        *pending.lock().unwrap() = Some(tx);
        rx
    })
}

fn make_kbdi_respond(pending: Arc<std::sync::Mutex<Option<oneshot::Sender<Vec<String>>>>>) -> KbdiRespond {
    Arc::new(move |_round: KbdiRound| {
        let (tx, rx) = oneshot::channel();
        *pending.lock().unwrap() = Some(tx);
        rx
    })
}

#[allow(clippy::too_many_arguments)]
async fn establish(
    events: &EventBus,
    hostkey_store: &Arc<dyn HostKeyStore>,
    actor: &Arc<ConnectionActor>,
    connection_id: &ConnectionId,
    cfg: &ConnectConfig,
    credential: &Option<Credential>,
    hostkey_decide: Arc<dyn Fn(VerifyStatus, String) -> oneshot::Receiver<VerifyDecision> + Send + Sync>,
    kbdi_respond: KbdiRespond,
) -> Result<(), ConnectError> {
    let mut transport = transport::connect(
        connection_id.clone(),
        cfg.clone(),
        credential.clone(),
        events.clone(),
        hostkey_store.clone(),
        hostkey_decide,
        kbdi_respond,
    )
    .await?;

    let handle = transport.handle.clone();
    let bytes_in = transport.bytes_in.clone();
    let bytes_out = transport.bytes_out.clone();
    let forwarded = transport.take_forwarded_channels();

    let shell = ShellMultiplexer::new(connection_id.clone(), handle.clone(), events.clone(), bytes_in, bytes_out);
    let portforward = PortForwardManager::new(connection_id.clone(), handle, events.clone(), forwarded);

    *actor.transport.write().await = Some(transport);
    *actor.shell.write().await = Some(shell);
    *actor.portforward.write().await = Some(portforward);
    actor.sftp.write().await.take();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryHostKeyStore;

    #[tokio::test]
    async fn disconnect_on_unknown_connection_is_a_no_op() {
        let supervisor = ConnectionSupervisor::new(
            EventBus::new(),
            Arc::new(MemoryHostKeyStore::new()),
            3,
            0,
            ReconnectConfig::default(),
        );
        supervisor.disconnect(&ConnectionId::from("missing")).await.unwrap();
        assert!(!supervisor.is_connected(&ConnectionId::from("missing")).await);
    }

    #[tokio::test]
    async fn get_health_on_unknown_connection_is_not_connected() {
        let supervisor = ConnectionSupervisor::new(
            EventBus::new(),
            Arc::new(MemoryHostKeyStore::new()),
            3,
            0,
            ReconnectConfig::default(),
        );
        let err = supervisor.get_health(&ConnectionId::from("missing")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotConnected);
    }
}
