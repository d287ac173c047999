//! External store interfaces.
//!
//! Saved sessions, credentials and trusted host keys all live outside this
//! crate; the supervisor only consumes them through these narrow,
//! `#[async_trait]` interfaces. Production builds wire a real implementation
//! (backed by an OS keychain, a settings file, whatever the host app uses);
//! the in-memory implementations here exist so the rest of the crate can be
//! tested without one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::ConnectError;

/// A trusted host key, as persisted by a [`HostKeyStore`].
///
/// Uniqueness key is `(host, port, key_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct HostKeyRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    pub trusted_at: u64,
    pub comment: Option<String>,
}

/// Atomic get/put/delete access to trusted host keys.
#[async_trait]
pub trait HostKeyStore: Send + Sync {
    async fn get(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
    ) -> Result<Option<HostKeyRecord>, ConnectError>;

    async fn put(&self, record: HostKeyRecord) -> Result<(), ConnectError>;

    async fn delete(&self, host: &str, port: u16, key_type: &str) -> Result<(), ConnectError>;
}

/// Opaque, already-decrypted credential material keyed by an id the caller
/// chooses (typically a saved-session id). The core never persists these;
/// it only reads them on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    Password(String),
    PrivateKey { pem: String, passphrase: Option<String> },
    Agent,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Credential>, ConnectError>;
}

/// Per-session connection configuration (host, port, user, security level,
/// keepalive interval, and so on) that outlives a single process run.
/// Treated as an opaque JSON blob by the core; the presentation layer owns
/// the schema.
#[async_trait]
pub trait SessionConfigStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<serde_json::Value>, ConnectError>;

    async fn put(&self, session_id: &str, config: serde_json::Value) -> Result<(), ConnectError>;
}

/// In-memory [`HostKeyStore`] for tests and for hosts that don't need
/// cross-restart persistence.
#[derive(Default)]
pub struct MemoryHostKeyStore {
    records: RwLock<HashMap<(String, u16, String), HostKeyRecord>>,
}

impl MemoryHostKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostKeyStore for MemoryHostKeyStore {
    async fn get(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
    ) -> Result<Option<HostKeyRecord>, ConnectError> {
        let key = (host.to_string(), port, key_type.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn put(&self, record: HostKeyRecord) -> Result<(), ConnectError> {
        let key = (record.host.clone(), record.port, record.key_type.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, host: &str, port: u16, key_type: &str) -> Result<(), ConnectError> {
        let key = (host.to_string(), port, key_type.to_string());
        self.records.write().await.remove(&key);
        Ok(())
    }
}

/// In-memory [`CredentialStore`] for tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, session_id: impl Into<String>, cred: Credential) {
        self.entries.write().await.insert(session_id.into(), cred);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, session_id: &str) -> Result<Option<Credential>, ConnectError> {
        Ok(self.entries.read().await.get(session_id).cloned())
    }
}

/// In-memory [`SessionConfigStore`] for tests.
#[derive(Default)]
pub struct MemorySessionConfigStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemorySessionConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionConfigStore for MemorySessionConfigStore {
    async fn get(&self, session_id: &str) -> Result<Option<serde_json::Value>, ConnectError> {
        Ok(self.entries.read().await.get(session_id).cloned())
    }

    async fn put(&self, session_id: &str, config: serde_json::Value) -> Result<(), ConnectError> {
        self.entries
            .write()
            .await
            .insert(session_id.to_string(), config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(fingerprint: &str) -> HostKeyRecord {
        HostKeyRecord {
            id: "1".into(),
            host: "h".into(),
            port: 22,
            key_type: "ssh-ed25519".into(),
            public_key: vec![1, 2, 3],
            fingerprint: fingerprint.to_string(),
            trusted_at: 0,
            comment: None,
        }
    }

    #[tokio::test]
    async fn memory_hostkey_store_round_trips() {
        let store = MemoryHostKeyStore::new();
        assert!(store.get("h", 22, "ssh-ed25519").await.unwrap().is_none());
        store.put(sample_record("SHA256:AAA")).await.unwrap();
        let got = store.get("h", 22, "ssh-ed25519").await.unwrap().unwrap();
        assert_eq!(got.fingerprint, "SHA256:AAA");
    }

    #[tokio::test]
    async fn memory_hostkey_store_delete() {
        let store = MemoryHostKeyStore::new();
        store.put(sample_record("SHA256:AAA")).await.unwrap();
        store.delete("h", 22, "ssh-ed25519").await.unwrap();
        assert!(store.get("h", 22, "ssh-ed25519").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_credential_store_round_trips() {
        let store = MemoryCredentialStore::new();
        store.set("s1", Credential::Password("hunter2".into())).await;
        match store.get("s1").await.unwrap() {
            Some(Credential::Password(p)) => assert_eq!(p, "hunter2"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }
}
