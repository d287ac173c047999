//! Host-key verification: fingerprinting and trust-on-first-use policy.
//!
//! [`fingerprint`] turns raw public-key bytes into the `SHA256:<base64>`
//! form used on the wire and in [`crate::stores::HostKeyRecord`]. [`verify`]
//! implements the TOFU/changed-key decision described for the transport
//! handshake: look the key up, and if it is unknown or has changed, block
//! on a caller-supplied decision channel instead of silently accepting or
//! rejecting.

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{ConnectError, ErrorKind};
use crate::stores::{HostKeyRecord, HostKeyStore};

/// Computes the `SHA256:<base64-no-pad>` fingerprint of a public key, the
/// same form OpenSSH prints for `ssh-keygen -lf`.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{encoded}")
}

/// What the presentation layer decided in response to a
/// `hostkey:verify-request` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyDecision {
    TrustOnce,
    TrustSave,
    AcceptNew,
    Disconnect,
}

/// The status reported to the presentation layer in a
/// `hostkey:verify-request` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyStatus {
    New,
    Changed,
}

/// What [`verify`] found when comparing the presented key against the store,
/// before any decision has been made. `Trusted` short-circuits without
/// consulting the caller; the other two variants carry the information a
/// `hostkey:verify-request` event needs.
pub enum VerifyOutcome {
    Trusted,
    New {
        fingerprint: String,
    },
    Changed {
        fingerprint: String,
        previous_fingerprint: String,
        previous_trusted_at: u64,
    },
}

/// Looks up `(host, port, key_type)` in `store` and compares fingerprints.
/// Does not itself prompt the user; callers inspect the outcome, emit
/// `hostkey:verify-request` if needed, await a decision, then call
/// [`apply_decision`].
pub async fn verify(
    store: &dyn HostKeyStore,
    host: &str,
    port: u16,
    key_type: &str,
    public_key: &[u8],
) -> Result<VerifyOutcome, ConnectError> {
    let presented = fingerprint(public_key);
    match store.get(host, port, key_type).await? {
        None => Ok(VerifyOutcome::New {
            fingerprint: presented,
        }),
        Some(record) if record.fingerprint == presented => Ok(VerifyOutcome::Trusted),
        Some(record) => Ok(VerifyOutcome::Changed {
            fingerprint: presented,
            previous_fingerprint: record.fingerprint,
            previous_trusted_at: record.trusted_at,
        }),
    }
}

/// Applies a [`VerifyDecision`] to `outcome`. Returns `Ok(())` if the
/// handshake may proceed, persisting a new record to `store` when the
/// decision calls for it. Returns a `hostkey` error for `disconnect` or for
/// a decision that is not valid for this outcome (`trust-once`/`trust-save`
/// on a changed key).
pub async fn apply_decision(
    store: &dyn HostKeyStore,
    host: &str,
    port: u16,
    key_type: &str,
    public_key: &[u8],
    outcome: &VerifyOutcome,
    decision: VerifyDecision,
    now: u64,
) -> Result<(), ConnectError> {
    match (outcome, decision) {
        (_, VerifyDecision::Disconnect) => Err(ConnectError::HostKey(
            "host key rejected by user".to_string(),
        )),
        (VerifyOutcome::New { .. }, VerifyDecision::TrustOnce) => Ok(()),
        (VerifyOutcome::New { fingerprint }, VerifyDecision::TrustSave) => {
            store
                .put(HostKeyRecord {
                    id: crate::ids::new_id(),
                    host: host.to_string(),
                    port,
                    key_type: key_type.to_string(),
                    public_key: public_key.to_vec(),
                    fingerprint: fingerprint.clone(),
                    trusted_at: now,
                    comment: None,
                })
                .await
        }
        (VerifyOutcome::Changed { fingerprint, .. }, VerifyDecision::AcceptNew) => {
            store
                .put(HostKeyRecord {
                    id: crate::ids::new_id(),
                    host: host.to_string(),
                    port,
                    key_type: key_type.to_string(),
                    public_key: public_key.to_vec(),
                    fingerprint: fingerprint.clone(),
                    trusted_at: now,
                    comment: None,
                })
                .await
        }
        (VerifyOutcome::Changed { .. }, VerifyDecision::TrustOnce | VerifyDecision::TrustSave) => {
            Err(ConnectError::HostKey(
                "trust-once/trust-save are not accepted for a changed host key".to_string(),
            ))
        }
        _ => Err(ConnectError::InvalidArgument(
            "decision not valid for this host-key outcome".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryHostKeyStore;

    #[test]
    fn fingerprint_matches_known_vector() {
        // SHA-256 of the empty string, base64-no-pad.
        let fp = fingerprint(b"");
        assert_eq!(
            fp,
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[tokio::test]
    async fn new_key_then_trust_save_persists_record() {
        let store = MemoryHostKeyStore::new();
        let outcome = verify(&store, "h", 22, "ssh-ed25519", b"key-bytes")
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::New { .. }));
        apply_decision(
            &store,
            "h",
            22,
            "ssh-ed25519",
            b"key-bytes",
            &outcome,
            VerifyDecision::TrustSave,
            1000,
        )
        .await
        .unwrap();

        let again = verify(&store, "h", 22, "ssh-ed25519", b"key-bytes")
            .await
            .unwrap();
        assert!(matches!(again, VerifyOutcome::Trusted));
    }

    #[tokio::test]
    async fn changed_key_rejects_trust_once() {
        let store = MemoryHostKeyStore::new();
        let first = verify(&store, "h", 22, "ssh-ed25519", b"key-a")
            .await
            .unwrap();
        apply_decision(
            &store,
            "h",
            22,
            "ssh-ed25519",
            b"key-a",
            &first,
            VerifyDecision::TrustSave,
            1000,
        )
        .await
        .unwrap();

        let changed = verify(&store, "h", 22, "ssh-ed25519", b"key-b")
            .await
            .unwrap();
        assert!(matches!(changed, VerifyOutcome::Changed { .. }));

        let err = apply_decision(
            &store,
            "h",
            22,
            "ssh-ed25519",
            b"key-b",
            &changed,
            VerifyDecision::TrustOnce,
            2000,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostKey);
    }

    #[tokio::test]
    async fn changed_key_disconnect_does_not_mutate_store() {
        let store = MemoryHostKeyStore::new();
        let first = verify(&store, "h", 22, "ssh-ed25519", b"key-a")
            .await
            .unwrap();
        apply_decision(
            &store,
            "h",
            22,
            "ssh-ed25519",
            b"key-a",
            &first,
            VerifyDecision::TrustSave,
            1000,
        )
        .await
        .unwrap();

        let changed = verify(&store, "h", 22, "ssh-ed25519", b"key-b")
            .await
            .unwrap();
        let err = apply_decision(
            &store,
            "h",
            22,
            "ssh-ed25519",
            b"key-b",
            &changed,
            VerifyDecision::Disconnect,
            2000,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostKey);

        let record = store.get("h", 22, "ssh-ed25519").await.unwrap().unwrap();
        assert_eq!(record.fingerprint, fingerprint(b"key-a"));
    }
}
