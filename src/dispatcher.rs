//! Request Dispatcher: the single entry point a presentation layer calls
//! through, reifying the request surface of §6 as one tagged [`Request`]
//! enum instead of the nested namespaces of closure-backed handlers the
//! source used. [`dispatch`] validates nothing the type system hasn't
//! already enforced, resolves the target [`ConnectionSupervisor`] method by
//! the request's own [`ConnectionId`], and shapes every reply as the
//! uniform `{success, data?, error?}` envelope from §6/§7 — the "reply slot"
//! design note, generalized from a bespoke oneshot per dynamic channel name
//! to one return value per call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectError;
use crate::hostkey::VerifyDecision;
use crate::ids::{ConnectionId, RuleId, ShellId, TransferId};
use crate::portforward::ForwardKind;
use crate::shell::ShellConfig;
use crate::stores::Credential;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::ConnectConfig;

/// Every request the dispatcher accepts, tagged by operation family to match
/// the `ssh.*` / `terminal.*` / `sftp.*` / `portforward.*` naming in §6.
/// Families the spec scopes out of the core (window, theme, settings,
/// dialogs, fs, log, clientkey, snippets, sql) have no variant here; they
/// never reach this dispatcher because they never reach the core.
#[derive(Debug, Clone)]
pub enum Request {
    SshConnect {
        connection_id: ConnectionId,
        config: ConnectConfig,
        credential: Option<Credential>,
    },
    SshDisconnect {
        connection_id: ConnectionId,
    },
    SshDisconnectAll,
    SshIsConnected {
        connection_id: ConnectionId,
    },
    SshGetHealth {
        connection_id: ConnectionId,
    },
    SshReconnectRetryNow {
        connection_id: ConnectionId,
    },
    SshReconnectPause {
        connection_id: ConnectionId,
    },
    SshReconnectResume {
        connection_id: ConnectionId,
    },
    SshReconnectCancel {
        connection_id: ConnectionId,
    },
    SshKbdiResponse {
        connection_id: ConnectionId,
        responses: Vec<String>,
    },
    HostkeyVerifyResponse {
        connection_id: ConnectionId,
        decision: VerifyDecision,
    },
    TerminalOpen {
        connection_id: ConnectionId,
        shell_id: ShellId,
        config: ShellConfig,
    },
    TerminalWrite {
        connection_id: ConnectionId,
        shell_id: ShellId,
        data: Vec<u8>,
    },
    TerminalResize {
        connection_id: ConnectionId,
        shell_id: ShellId,
        cols: u32,
        rows: u32,
    },
    TerminalClose {
        connection_id: ConnectionId,
        shell_id: ShellId,
    },
    SftpOpen {
        connection_id: ConnectionId,
    },
    SftpClose {
        connection_id: ConnectionId,
    },
    SftpReaddir {
        connection_id: ConnectionId,
        path: String,
    },
    SftpStat {
        connection_id: ConnectionId,
        path: String,
    },
    SftpRealpath {
        connection_id: ConnectionId,
        path: String,
    },
    SftpMkdir {
        connection_id: ConnectionId,
        path: String,
    },
    SftpUnlink {
        connection_id: ConnectionId,
        path: String,
    },
    SftpRmdir {
        connection_id: ConnectionId,
        path: String,
        recursive: bool,
    },
    SftpRename {
        connection_id: ConnectionId,
        from: String,
        to: String,
    },
    SftpChmod {
        connection_id: ConnectionId,
        path: String,
        mode: u32,
        recursive: bool,
    },
    SftpReadFile {
        connection_id: ConnectionId,
        path: String,
    },
    SftpWriteFile {
        connection_id: ConnectionId,
        path: String,
        data: Vec<u8>,
    },
    SftpSymlink {
        connection_id: ConnectionId,
        path: String,
        target: String,
    },
    SftpDownload {
        connection_id: ConnectionId,
        remote_path: String,
        local_path: std::path::PathBuf,
    },
    SftpUpload {
        connection_id: ConnectionId,
        local_path: std::path::PathBuf,
        remote_path: String,
    },
    SftpTransferPause {
        connection_id: ConnectionId,
        transfer_id: TransferId,
    },
    SftpTransferResume {
        connection_id: ConnectionId,
        transfer_id: TransferId,
    },
    SftpTransferCancel {
        connection_id: ConnectionId,
        transfer_id: TransferId,
    },
    SftpTransferRetry {
        connection_id: ConnectionId,
        transfer_id: TransferId,
    },
    SftpTransferList {
        connection_id: ConnectionId,
    },
    PortforwardAdd {
        connection_id: ConnectionId,
        rule: ForwardKind,
    },
    PortforwardRemove {
        connection_id: ConnectionId,
        rule_id: RuleId,
    },
    PortforwardList {
        connection_id: ConnectionId,
    },
    /// Local filesystem helpers for the presentation's file picker; no
    /// connection involved, so unlike every other variant these never touch
    /// the supervisor's connection table.
    SftpLocalReaddir {
        path: String,
    },
    SftpLocalHomedir,
}

/// The uniform reply envelope every request resolves to, per §6/§7: either
/// `data` is set (possibly to `Value::Null` for operations with no return
/// value) or `error` carries the `<kind>: <message>` wire string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    fn ok(data: impl Serialize) -> Self {
        Reply {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            error: None,
        }
    }

    fn ok_unit() -> Self {
        Reply {
            success: true,
            data: Some(Value::Null),
            error: None,
        }
    }

    fn err(e: ConnectError) -> Self {
        Reply {
            success: false,
            data: None,
            error: Some(e.wire_message()),
        }
    }
}

/// Routes one [`Request`] to the matching [`ConnectionSupervisor`] method
/// and shapes its result as a [`Reply`]. This is the "central function" the
/// design notes ask for in place of nested namespaces of closures; every
/// request still resolves to a plain, typed future underneath, so the
/// per-connection actor (owned inside the supervisor) is where the real
/// single-owner-per-key guarantee lives.
pub async fn dispatch(supervisor: &ConnectionSupervisor, request: Request) -> Reply {
    match request {
        Request::SshConnect {
            connection_id,
            config,
            credential,
        } => match supervisor.connect(connection_id, config, credential).await {
            Ok(()) => Reply::ok_unit(),
            Err(e) => Reply::err(e),
        },
        Request::SshDisconnect { connection_id } => {
            reply_unit(supervisor.disconnect(&connection_id).await)
        }
        Request::SshDisconnectAll => reply_unit(supervisor.disconnect_all().await),
        Request::SshIsConnected { connection_id } => {
            Reply::ok(supervisor.is_connected(&connection_id).await)
        }
        Request::SshGetHealth { connection_id } => {
            match supervisor.get_health(&connection_id).await {
                Ok(health) => Reply::ok(health),
                Err(e) => Reply::err(e),
            }
        }
        Request::SshReconnectRetryNow { connection_id } => {
            reply_unit(supervisor.reconnect_retry_now(&connection_id).await)
        }
        Request::SshReconnectPause { connection_id } => {
            reply_unit(supervisor.reconnect_pause(&connection_id).await)
        }
        Request::SshReconnectResume { connection_id } => {
            reply_unit(supervisor.reconnect_resume(&connection_id).await)
        }
        Request::SshReconnectCancel { connection_id } => {
            reply_unit(supervisor.reconnect_cancel(&connection_id).await)
        }
        Request::SshKbdiResponse {
            connection_id,
            responses,
        } => reply_unit(supervisor.kbdi_response(&connection_id, responses).await),
        Request::HostkeyVerifyResponse {
            connection_id,
            decision,
        } => reply_unit(
            supervisor
                .hostkey_verify_response(&connection_id, decision)
                .await,
        ),
        Request::TerminalOpen {
            connection_id,
            shell_id,
            config,
        } => reply_unit(supervisor.open_shell(&connection_id, shell_id, config).await),
        Request::TerminalWrite {
            connection_id,
            shell_id,
            data,
        } => reply_unit(supervisor.write_shell(&connection_id, &shell_id, data).await),
        Request::TerminalResize {
            connection_id,
            shell_id,
            cols,
            rows,
        } => reply_unit(
            supervisor
                .resize_shell(&connection_id, &shell_id, cols, rows)
                .await,
        ),
        Request::TerminalClose {
            connection_id,
            shell_id,
        } => reply_unit(supervisor.close_shell(&connection_id, &shell_id).await),
        Request::SftpOpen { connection_id } => {
            reply_unit(supervisor.sftp_open(&connection_id).await)
        }
        Request::SftpClose { connection_id } => {
            reply_unit(supervisor.sftp_close(&connection_id).await)
        }
        Request::SftpReaddir { connection_id, path } => {
            reply_value(supervisor.sftp_readdir(&connection_id, path).await)
        }
        Request::SftpStat { connection_id, path } => {
            reply_value(supervisor.sftp_stat(&connection_id, path).await)
        }
        Request::SftpRealpath { connection_id, path } => {
            reply_value(supervisor.sftp_realpath(&connection_id, path).await)
        }
        Request::SftpMkdir { connection_id, path } => {
            reply_unit(supervisor.sftp_mkdir(&connection_id, path).await)
        }
        Request::SftpUnlink { connection_id, path } => {
            reply_unit(supervisor.sftp_unlink(&connection_id, path).await)
        }
        Request::SftpRmdir {
            connection_id,
            path,
            recursive,
        } => reply_unit(supervisor.sftp_rmdir(&connection_id, path, recursive).await),
        Request::SftpRename {
            connection_id,
            from,
            to,
        } => reply_unit(supervisor.sftp_rename(&connection_id, from, to).await),
        Request::SftpChmod {
            connection_id,
            path,
            mode,
            recursive,
        } => reply_unit(
            supervisor
                .sftp_chmod(&connection_id, path, mode, recursive)
                .await,
        ),
        Request::SftpReadFile { connection_id, path } => {
            reply_value(supervisor.sftp_read_file(&connection_id, path).await)
        }
        Request::SftpWriteFile {
            connection_id,
            path,
            data,
        } => reply_unit(supervisor.sftp_write_file(&connection_id, path, data).await),
        Request::SftpSymlink {
            connection_id,
            path,
            target,
        } => reply_unit(supervisor.sftp_symlink(&connection_id, path, target).await),
        Request::SftpDownload {
            connection_id,
            remote_path,
            local_path,
        } => reply_value(
            supervisor
                .sftp_download(&connection_id, remote_path, local_path)
                .await,
        ),
        Request::SftpUpload {
            connection_id,
            local_path,
            remote_path,
        } => reply_value(
            supervisor
                .sftp_upload(&connection_id, local_path, remote_path)
                .await,
        ),
        Request::SftpTransferPause {
            connection_id,
            transfer_id,
        } => reply_unit(
            supervisor
                .sftp_transfer_pause(&connection_id, &transfer_id)
                .await,
        ),
        Request::SftpTransferResume {
            connection_id,
            transfer_id,
        } => reply_unit(
            supervisor
                .sftp_transfer_resume(&connection_id, &transfer_id)
                .await,
        ),
        Request::SftpTransferCancel {
            connection_id,
            transfer_id,
        } => reply_unit(
            supervisor
                .sftp_transfer_cancel(&connection_id, &transfer_id)
                .await,
        ),
        Request::SftpTransferRetry {
            connection_id,
            transfer_id,
        } => reply_unit(
            supervisor
                .sftp_transfer_retry(&connection_id, &transfer_id)
                .await,
        ),
        Request::SftpTransferList { connection_id } => {
            reply_value(supervisor.sftp_transfer_list(&connection_id).await)
        }
        Request::PortforwardAdd { connection_id, rule } => {
            reply_value(supervisor.portforward_add(&connection_id, rule).await)
        }
        Request::PortforwardRemove {
            connection_id,
            rule_id,
        } => reply_unit(supervisor.portforward_remove(&connection_id, &rule_id).await),
        Request::PortforwardList { connection_id } => {
            reply_value(supervisor.portforward_list(&connection_id).await)
        }
        Request::SftpLocalReaddir { path } => {
            reply_value(crate::sftp::local_readdir(&path).await)
        }
        Request::SftpLocalHomedir => Reply::ok(crate::sftp::local_homedir()),
    }
}

fn reply_unit(result: Result<(), ConnectError>) -> Reply {
    match result {
        Ok(()) => Reply::ok_unit(),
        Err(e) => Reply::err(e),
    }
}

fn reply_value<T: Serialize>(result: Result<T, ConnectError>) -> Reply {
    match result {
        Ok(v) => Reply::ok(v),
        Err(e) => Reply::err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::reconnect::ReconnectConfig;
    use crate::stores::MemoryHostKeyStore;
    use std::sync::Arc;

    fn fresh_supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            EventBus::new(),
            Arc::new(MemoryHostKeyStore::new()),
            3,
            0,
            ReconnectConfig::default(),
        )
    }

    #[tokio::test]
    async fn unknown_connection_is_not_connected_reply() {
        let supervisor = fresh_supervisor();
        let reply = dispatch(
            &supervisor,
            Request::SshIsConnected {
                connection_id: ConnectionId::from("missing"),
            },
        )
        .await;
        assert!(reply.success);
        assert_eq!(reply.data, Some(Value::Bool(false)));
    }

    #[tokio::test]
    async fn get_health_on_unknown_connection_fails_not_connected() {
        let supervisor = fresh_supervisor();
        let reply = dispatch(
            &supervisor,
            Request::SshGetHealth {
                connection_id: ConnectionId::from("missing"),
            },
        )
        .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().starts_with("not-connected"));
    }

    #[tokio::test]
    async fn disconnect_all_on_empty_supervisor_succeeds() {
        let supervisor = fresh_supervisor();
        let reply = dispatch(&supervisor, Request::SshDisconnectAll).await;
        assert!(reply.success);
    }

    #[tokio::test]
    async fn local_readdir_lists_a_temp_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let supervisor = fresh_supervisor();
        let reply = dispatch(
            &supervisor,
            Request::SftpLocalReaddir {
                path: dir.path().to_string_lossy().to_string(),
            },
        )
        .await;
        assert!(reply.success);
        let entries = reply.data.unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_readdir_on_a_missing_path_fails_not_found() {
        let supervisor = fresh_supervisor();
        let reply = dispatch(
            &supervisor,
            Request::SftpLocalReaddir {
                path: "/no/such/path/here".to_string(),
            },
        )
        .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().starts_with("not-found"));
    }

    #[tokio::test]
    async fn local_homedir_reply_always_succeeds() {
        let supervisor = fresh_supervisor();
        let reply = dispatch(&supervisor, Request::SftpLocalHomedir).await;
        assert!(reply.success);
        assert!(reply.data.is_some());
    }
}
