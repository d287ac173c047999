//! Drives the tagged request/reply surface end to end against a supervisor
//! with no live connections, the same boundary a presentation layer hits
//! the moment a user clicks "disconnect" twice or queries a connection
//! that was never opened.

use conn_supervisor::dispatcher::{dispatch, Request};
use conn_supervisor::events::EventBus;
use conn_supervisor::ids::ConnectionId;
use conn_supervisor::reconnect::ReconnectConfig;
use conn_supervisor::stores::MemoryHostKeyStore;
use conn_supervisor::supervisor::ConnectionSupervisor;
use std::sync::Arc;

fn fresh_supervisor() -> ConnectionSupervisor {
    let _ = env_logger::try_init();
    ConnectionSupervisor::new(
        EventBus::new(),
        Arc::new(MemoryHostKeyStore::new()),
        3,
        0,
        ReconnectConfig::default(),
    )
}

#[tokio::test]
async fn disconnect_on_unknown_connection_succeeds_through_the_dispatcher() {
    let supervisor = fresh_supervisor();
    let reply = dispatch(
        &supervisor,
        Request::SshDisconnect {
            connection_id: ConnectionId::from("ghost"),
        },
    )
    .await;
    assert!(reply.success);
    assert_eq!(reply.data, Some(serde_json::Value::Null));
}

#[tokio::test]
async fn sftp_operations_on_a_connection_with_no_open_sftp_session_fail_not_connected() {
    let supervisor = fresh_supervisor();
    let reply = dispatch(
        &supervisor,
        Request::SftpReaddir {
            connection_id: ConnectionId::from("ghost"),
            path: "/tmp".to_string(),
        },
    )
    .await;
    assert!(!reply.success);
    assert!(reply.error.unwrap().starts_with("not-connected"));
}

#[tokio::test]
async fn portforward_list_on_unknown_connection_fails_not_connected() {
    let supervisor = fresh_supervisor();
    let reply = dispatch(
        &supervisor,
        Request::PortforwardList {
            connection_id: ConnectionId::from("ghost"),
        },
    )
    .await;
    assert!(!reply.success);
    assert!(reply.error.unwrap().starts_with("not-connected"));
}

#[tokio::test]
async fn kbdi_response_on_a_connection_that_was_never_opened_fails_not_connected() {
    let supervisor = fresh_supervisor();
    let reply = dispatch(
        &supervisor,
        Request::SshKbdiResponse {
            connection_id: ConnectionId::from("ghost"),
            responses: vec!["password123".to_string()],
        },
    )
    .await;
    assert!(!reply.success);
    assert!(reply.error.unwrap().starts_with("not-connected"));
}
