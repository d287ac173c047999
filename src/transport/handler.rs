//! The `russh::client::Handler` implementation.
//!
//! Everything the server can push at us unprompted — the host key to
//! verify, a banner, a forwarded-tcpip channel open for REMOTE port
//! forwarding — lands here and is handed off to the rest of the crate
//! through plain channels so this type stays a thin adapter.

use std::sync::Arc;

use base64::Engine;
use russh::client::Msg;
use russh::keys::ssh_key::PublicKey;
use russh::{Channel, ChannelId};
use tokio::sync::{mpsc, oneshot};

use crate::events::{Event, EventBus};
use crate::hostkey::{self, VerifyDecision, VerifyOutcome};
use crate::ids::ConnectionId;
use crate::stores::HostKeyStore;

/// A forwarded-tcpip channel the server opened on our behalf, handed to the
/// REMOTE port-forwarding rule that requested it. `connected_address`/
/// `connected_port` identify which `tcpip-forward` request this channel
/// answers (the address/port the rule asked the server to listen on);
/// `originator_*` describe the remote peer that connected to it.
pub struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

pub struct SupervisorHandler {
    pub connection_id: ConnectionId,
    pub host: String,
    pub port: u16,
    pub events: EventBus,
    pub hostkey_store: Arc<dyn HostKeyStore>,
    /// Set by the transport once it starts listening for
    /// `hostkey:verify-response`; the handler blocks on it during
    /// `check_server_key`.
    pub verify_decision: Arc<dyn Fn(hostkey::VerifyStatus, String) -> oneshot::Receiver<VerifyDecision> + Send + Sync>,
    /// Forwarded channels opened for REMOTE rules, routed by the rule that
    /// registered interest in (remote_addr, remote_port).
    pub forwarded_channels: mpsc::UnboundedSender<ForwardedChannel>,
}

#[async_trait::async_trait]
impl russh::client::Handler for SupervisorHandler {
    type Error = crate::error::ConnectError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let key_type = server_public_key.algorithm().to_string();
        let encoded = server_public_key.to_bytes().map_err(|e| {
            crate::error::ConnectError::Protocol(format!("could not encode host key: {e}"))
        })?;

        let outcome = hostkey::verify(
            self.hostkey_store.as_ref(),
            &self.host,
            self.port,
            &key_type,
            &encoded,
        )
        .await?;

        if let VerifyOutcome::Trusted = outcome {
            return Ok(true);
        }

        let (status, fingerprint, previous_fingerprint, previous_trusted_at) = match &outcome {
            VerifyOutcome::Trusted => unreachable!(),
            VerifyOutcome::New { fingerprint } => {
                (hostkey::VerifyStatus::New, fingerprint.clone(), None, None)
            }
            VerifyOutcome::Changed {
                fingerprint,
                previous_fingerprint,
                previous_trusted_at,
            } => (
                hostkey::VerifyStatus::Changed,
                fingerprint.clone(),
                Some(previous_fingerprint.clone()),
                Some(*previous_trusted_at),
            ),
        };

        self.events
            .publish(Event::HostKeyVerifyRequest {
                connection_id: self.connection_id.clone(),
                request: crate::events::HostKeyVerifyRequest {
                    host: self.host.clone(),
                    port: self.port,
                    key_type: key_type.clone(),
                    fingerprint: fingerprint.clone(),
                    public_key_base64: base64::engine::general_purpose::STANDARD.encode(&encoded),
                    status,
                    previous_fingerprint,
                    previous_trusted_at,
                },
            })
            .await;

        let decision_rx = (self.verify_decision)(status, fingerprint.clone());
        let decision = decision_rx.await.unwrap_or(VerifyDecision::Disconnect);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        hostkey::apply_decision(
            self.hostkey_store.as_ref(),
            &self.host,
            self.port,
            &key_type,
            &encoded,
            &outcome,
            decision,
            now,
        )
        .await?;

        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        self.events
            .publish(Event::SshBanner {
                connection_id: self.connection_id.clone(),
                message: banner.to_string(),
            })
            .await;
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded_channels.send(ForwardedChannel {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        _data: &[u8],
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        // Per-channel data is read by the channel's own owner (Shell, SFTP
        // session, or forward splice task) via `Channel::wait`, not here.
        Ok(())
    }
}
