//! Opaque identifier newtypes used throughout the connection supervisor.
//!
//! Each wraps a `String` so call sites cannot accidentally pass a
//! [`ConnectionId`] where a [`TransferId`] is expected. Callers may supply
//! their own id (useful for idempotent retries); when none is given the
//! crate mints one with [`new_id`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Mints a fresh, random id of this kind.
            pub fn generate() -> Self {
                $name(new_id())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

id_type!(ConnectionId, "Identifies one transport (SSH connection).");
id_type!(ShellId, "Identifies one interactive shell channel on a transport.");
id_type!(TransferId, "Identifies one queued or in-flight SFTP transfer.");
id_type!(RuleId, "Identifies one active port-forwarding rule.");
id_type!(SubscriptionId, "Identifies one event-bus subscriber.");

/// Mints a random v4 UUID string, used as the default id for newly created
/// connections, shells, transfers, rules and subscriptions.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn from_str_round_trips() {
        let id = ConnectionId::from("fixed-id");
        assert_eq!(id.as_str(), "fixed-id");
        assert_eq!(id.to_string(), "fixed-id");
    }
}
