//! SFTP Engine: filesystem operations plus the transfer queue, opened as a
//! subsystem channel over a [`crate::transport::Transport`] the same way the
//! teacher opens a shell channel (`channel.request_pty`/`request_shell` →
//! here, `channel.request_subsystem(true, "sftp")`).

pub mod transfer;

use std::sync::Arc;

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ConnectError;
use crate::events::EventBus;
use crate::ids::ConnectionId;
use crate::transport::handler::SupervisorHandler;
use transfer::TransferEngine;

/// Default cap on `readFile`; larger files must be streamed via `download`.
const DEFAULT_READ_FILE_CAP: u64 = 10 * 1024 * 1024;
/// How many directory-walk packets (remove/chmod calls) may be in flight at
/// once during a recursive `rmdir`/`chmod`.
const WALK_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub mtime: Option<u32>,
}

fn to_dir_entry(name: String, attrs: &FileAttributes) -> DirEntry {
    DirEntry {
        name,
        is_dir: attrs.is_dir(),
        is_symlink: attrs.is_symlink(),
        size: attrs.size,
        permissions: attrs.permissions,
        mtime: attrs.mtime,
    }
}

/// One SFTP subsystem channel and everything built on top of it: filesystem
/// operations and the transfer queue.
pub struct SftpEngine {
    sftp: Arc<SftpSession>,
    pub transfers: TransferEngine,
}

impl SftpEngine {
    pub async fn open(
        connection_id: ConnectionId,
        handle: Arc<tokio::sync::RwLock<russh::client::Handle<SupervisorHandler>>>,
        events: EventBus,
        concurrency: usize,
        bandwidth_limit_kbps: u64,
    ) -> Result<Self, ConnectError> {
        let channel = {
            let h = handle.read().await;
            h.channel_open_session().await?
        };
        channel.request_subsystem(true, "sftp").await?;
        let sftp = Arc::new(SftpSession::new(channel.into_stream()).await?);

        let transfers = TransferEngine::new(
            connection_id,
            sftp.clone(),
            events,
            concurrency,
            bandwidth_limit_kbps,
        );

        Ok(SftpEngine { sftp, transfers })
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, ConnectError> {
        let entries = self.sftp.read_dir(path).await.map_err(ConnectError::from)?;
        Ok(entries
            .into_iter()
            .map(|entry| to_dir_entry(entry.file_name(), entry.metadata()))
            .collect())
    }

    pub async fn stat(&self, path: &str) -> Result<DirEntry, ConnectError> {
        let attrs = self.sftp.metadata(path).await.map_err(ConnectError::from)?;
        Ok(to_dir_entry(path.to_string(), &attrs))
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), ConnectError> {
        self.sftp.create_dir(path).await.map_err(ConnectError::from)
    }

    pub async fn unlink(&self, path: &str) -> Result<(), ConnectError> {
        self.sftp.remove_file(path).await.map_err(ConnectError::from)
    }

    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), ConnectError> {
        if !recursive {
            return self.sftp.remove_dir(path).await.map_err(ConnectError::from);
        }
        let semaphore = Arc::new(Semaphore::new(WALK_CONCURRENCY));
        remove_dir_recursive(self.sftp.clone(), path.to_string(), semaphore).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), ConnectError> {
        self.sftp.rename(from, to).await.map_err(ConnectError::from)
    }

    pub async fn chmod(&self, path: &str, mode: u32, recursive: bool) -> Result<(), ConnectError> {
        if !recursive {
            return self.chmod_one(path, mode).await;
        }
        let semaphore = Arc::new(Semaphore::new(WALK_CONCURRENCY));
        chmod_recursive(self.sftp.clone(), path.to_string(), mode, semaphore).await
    }

    async fn chmod_one(&self, path: &str, mode: u32) -> Result<(), ConnectError> {
        chmod_one(&self.sftp, path, mode).await
    }

    pub async fn read_file(&self, path: &str, max_bytes: Option<u64>) -> Result<Vec<u8>, ConnectError> {
        let cap = max_bytes.unwrap_or(DEFAULT_READ_FILE_CAP);
        let attrs = self.sftp.metadata(path).await.map_err(ConnectError::from)?;
        if let Some(size) = attrs.size {
            if size > cap {
                return Err(ConnectError::TooLarge(format!(
                    "{path} is {size} bytes, exceeds the {cap}-byte readFile cap"
                )));
            }
        }
        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(ConnectError::from)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(ConnectError::Io)?;
        Ok(buf)
    }

    /// Writes `data` atomically: the full content lands in `${path}.tmp`,
    /// then an SFTP rename replaces `path`.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ConnectError> {
        let tmp_path = format!("{path}.tmp");
        {
            let mut file = self
                .sftp
                .open_with_flags(
                    &tmp_path,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                )
                .await
                .map_err(ConnectError::from)?;
            file.write_all(data).await.map_err(ConnectError::Io)?;
            file.flush().await.map_err(ConnectError::Io)?;
        }
        // Best-effort: some servers reject rename onto an existing file.
        let _ = self.sftp.remove_file(path).await;
        self.sftp
            .rename(&tmp_path, path)
            .await
            .map_err(ConnectError::from)
    }

    pub async fn symlink(&self, path: &str, target: &str) -> Result<(), ConnectError> {
        self.sftp.symlink(path, target).await.map_err(ConnectError::from)
    }

    pub async fn realpath(&self, path: &str) -> Result<String, ConnectError> {
        self.sftp.canonicalize(path).await.map_err(ConnectError::from)
    }
}

async fn chmod_one(sftp: &SftpSession, path: &str, mode: u32) -> Result<(), ConnectError> {
    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    sftp.set_metadata(path, attrs).await.map_err(ConnectError::from)
}

async fn acquire_walk_permit(
    semaphore: &Arc<Semaphore>,
) -> Result<tokio::sync::OwnedSemaphorePermit, ConnectError> {
    semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ConnectError::Protocol("directory-walk semaphore closed".to_string()))
}

async fn join_walk_tasks(mut tasks: JoinSet<Result<(), ConnectError>>) -> Result<(), ConnectError> {
    while let Some(result) = tasks.join_next().await {
        result.map_err(|e| ConnectError::Protocol(format!("directory-walk task panicked: {e}")))??;
    }
    Ok(())
}

/// Breadth-first `rmdir -r`: every directory's children are removed through
/// tasks spawned onto `semaphore`, so up to [`WALK_CONCURRENCY`] remove
/// packets are genuinely in flight at once instead of one at a time.
fn remove_dir_recursive(
    sftp: Arc<SftpSession>,
    path: String,
    semaphore: Arc<Semaphore>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ConnectError>> + Send>> {
    Box::pin(async move {
        let entries = sftp.read_dir(&path).await.map_err(ConnectError::from)?;
        let mut tasks = JoinSet::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child_path = format!("{}/{}", path.trim_end_matches('/'), name);
            if entry.metadata().is_dir() {
                tasks.spawn(remove_dir_recursive(sftp.clone(), child_path, semaphore.clone()));
            } else {
                let sftp = sftp.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = acquire_walk_permit(&semaphore).await?;
                    sftp.remove_file(&child_path).await.map_err(ConnectError::from)
                });
            }
        }
        join_walk_tasks(tasks).await?;
        sftp.remove_dir(&path).await.map_err(ConnectError::from)
    })
}

/// Breadth-first recursive `chmod`, with the same bounded-concurrency shape
/// as [`remove_dir_recursive`]: each entry's `setstat` runs as its own task
/// gated by `semaphore`.
fn chmod_recursive(
    sftp: Arc<SftpSession>,
    path: String,
    mode: u32,
    semaphore: Arc<Semaphore>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ConnectError>> + Send>> {
    Box::pin(async move {
        {
            let _permit = acquire_walk_permit(&semaphore).await?;
            chmod_one(&sftp, &path, mode).await?;
        }
        let entries = sftp.read_dir(&path).await.map_err(ConnectError::from)?;
        let mut tasks = JoinSet::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child_path = format!("{}/{}", path.trim_end_matches('/'), name);
            if entry.metadata().is_dir() {
                tasks.spawn(chmod_recursive(
                    sftp.clone(),
                    child_path,
                    mode,
                    semaphore.clone(),
                ));
            } else {
                let sftp = sftp.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = acquire_walk_permit(&semaphore).await?;
                    chmod_one(&sftp, &child_path, mode).await
                });
            }
        }
        join_walk_tasks(tasks).await
    })
}

/// Lists entries of a local directory, for the presentation's file-picker
/// side panel. Not SFTP — plain local filesystem access.
pub async fn local_readdir(path: &str) -> Result<Vec<DirEntry>, ConnectError> {
    let mut out = Vec::new();
    let mut read_dir = tokio::fs::read_dir(path).await.map_err(ConnectError::Io)?;
    while let Some(entry) = read_dir.next_entry().await.map_err(ConnectError::Io)? {
        let metadata = entry.metadata().await.map_err(ConnectError::Io)?;
        out.push(DirEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            size: Some(metadata.len()),
            permissions: None,
            mtime: None,
        });
    }
    Ok(out)
}

/// The local user's home directory, for the presentation's default-path
/// suggestions.
pub fn local_homedir() -> Option<String> {
    dirs::home_dir().map(|p| p.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_reads_common_fields_from_attributes() {
        let attrs = FileAttributes {
            size: Some(42),
            permissions: Some(0o644),
            ..Default::default()
        };
        let entry = to_dir_entry("file.txt".to_string(), &attrs);
        assert_eq!(entry.name, "file.txt");
        assert_eq!(entry.size, Some(42));
        assert_eq!(entry.permissions, Some(0o644));
    }
}
