//! Error types for the connection supervisor.
//!
//! Every operation the dispatcher exposes fails, if it fails, with one of
//! these variants. [`ConnectError::kind`] maps each variant onto the small,
//! stable [`ErrorKind`] taxonomy the presentation layer switches on, so
//! request replies never need to string-match an error message.

use thiserror::Error;

/// The stable error-kind taxonomy surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Network,
    Auth,
    HostKey,
    Timeout,
    Protocol,
    Permission,
    NotFound,
    Exists,
    TooLarge,
    Cancelled,
    Stalled,
    NotConnected,
    InvalidArgument,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::HostKey => "hostkey",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Exists => "exists",
            ErrorKind::TooLarge => "too-large",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Stalled => "stalled",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::InvalidArgument => "invalid-argument",
        };
        f.write_str(s)
    }
}

/// Errors that can occur anywhere in the connection supervisor.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("transfer stalled: {0}")]
    Stalled(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    #[error("russh key error: {0}")]
    RusshKeys(#[from] russh::keys::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// The stable error kind this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Network(_) => ErrorKind::Network,
            ConnectError::Auth(_) => ErrorKind::Auth,
            ConnectError::HostKey(_) => ErrorKind::HostKey,
            ConnectError::Timeout(_) => ErrorKind::Timeout,
            ConnectError::Protocol(_) => ErrorKind::Protocol,
            ConnectError::Permission(_) => ErrorKind::Permission,
            ConnectError::NotFound(_) => ErrorKind::NotFound,
            ConnectError::Exists(_) => ErrorKind::Exists,
            ConnectError::TooLarge(_) => ErrorKind::TooLarge,
            ConnectError::Cancelled(_) => ErrorKind::Cancelled,
            ConnectError::Stalled(_) => ErrorKind::Stalled,
            ConnectError::NotConnected(_) => ErrorKind::NotConnected,
            ConnectError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConnectError::Russh(_) => ErrorKind::Network,
            ConnectError::RusshKeys(_) => ErrorKind::Auth,
            ConnectError::Sftp(e) => match e {
                russh_sftp::client::error::Error::Status(status) => match status.status_code {
                    russh_sftp::protocol::StatusCode::PermissionDenied => ErrorKind::Permission,
                    russh_sftp::protocol::StatusCode::NoSuchFile => ErrorKind::NotFound,
                    russh_sftp::protocol::StatusCode::FileAlreadyExists => ErrorKind::Exists,
                    _ => ErrorKind::Protocol,
                },
                _ => ErrorKind::Protocol,
            },
            ConnectError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                std::io::ErrorKind::AlreadyExists => ErrorKind::Exists,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Protocol,
            },
        }
    }

    /// Renders the `{error: "<kind>: <message>"}` wire shape from §6/§7.
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_prefixes_kind() {
        let err = ConnectError::NotFound("/etc/missing".to_string());
        assert_eq!(err.wire_message(), "not-found: not found: /etc/missing");
    }

    #[test]
    fn io_not_found_maps_to_not_found_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: ConnectError = io.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
