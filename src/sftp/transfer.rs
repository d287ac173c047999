//! The Transfer Engine: a FIFO queue of upload/download jobs drained by a
//! bounded worker pool, each job independently pausable, resumable and
//! cancellable, reporting throttled progress and a terminal completion
//! event.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::error::ConnectError;
use crate::events::{Event, EventBus};
use crate::ids::{ConnectionId, TransferId};

const CHUNK_SIZE: usize = 32 * 1024;
const STALL_TIMEOUT: Duration = Duration::from_secs(60);
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(100);
/// Smoothing factor for the exponential moving average of transfer speed.
const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub direction: TransferDirection,
    /// If false (the default), cancelling a download deletes the partial
    /// local file; if true, the `.part` file is left behind for a later
    /// manual resume.
    #[serde(default)]
    pub keep_partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: TransferId,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    pub speed_bytes_per_sec: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub keep_partial: bool,
}

/// Signals a running transfer task can receive. `Cancel` is terminal and
/// survives a concurrent `Pause` (the task checks for it on every chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

struct TransferHandle {
    item: Arc<std::sync::RwLock<TransferItem>>,
    control: watch::Sender<ControlSignal>,
}

/// Runs queued SFTP transfers with a bounded worker concurrency, a per-item
/// pause/resume/cancel control channel, and a shared bandwidth cap.
#[derive(Clone)]
pub struct TransferEngine {
    connection_id: ConnectionId,
    sftp: Arc<SftpSession>,
    events: EventBus,
    handles: Arc<DashMap<TransferId, TransferHandle>>,
    queue_tx: mpsc::UnboundedSender<TransferId>,
    bandwidth_limit_bytes_per_sec: Arc<AtomicU64>,
}

impl TransferEngine {
    pub fn new(
        connection_id: ConnectionId,
        sftp: Arc<SftpSession>,
        events: EventBus,
        concurrency: usize,
        bandwidth_limit_kbps: u64,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine {
            connection_id,
            sftp,
            events,
            handles: Arc::new(DashMap::new()),
            queue_tx,
            bandwidth_limit_bytes_per_sec: Arc::new(AtomicU64::new(bandwidth_limit_kbps * 1024)),
        };
        spawn_dispatcher(engine.clone(), queue_rx, concurrency.max(1));
        engine
    }

    pub fn set_bandwidth_limit_kbps(&self, kbps: u64) {
        self.bandwidth_limit_bytes_per_sec
            .store(kbps * 1024, Ordering::Relaxed);
    }

    /// Enqueues a new transfer and returns its id immediately; the job runs
    /// once a worker slot frees up.
    pub fn enqueue(&self, request: TransferRequest) -> TransferId {
        let id = TransferId::generate();
        let item = TransferItem {
            id: id.clone(),
            local_path: request.local_path,
            remote_path: request.remote_path,
            direction: request.direction,
            status: TransferStatus::Queued,
            bytes_total: None,
            bytes_transferred: 0,
            speed_bytes_per_sec: 0.0,
            error: None,
            keep_partial: request.keep_partial,
        };
        let (control, _) = watch::channel(ControlSignal::Run);
        self.handles.insert(
            id.clone(),
            TransferHandle {
                item: Arc::new(std::sync::RwLock::new(item)),
                control,
            },
        );
        let _ = self.queue_tx.send(id.clone());
        id
    }

    pub fn list(&self) -> Vec<TransferItem> {
        self.handles
            .iter()
            .map(|entry| entry.value().item.read().unwrap().clone())
            .collect()
    }

    pub fn get(&self, id: &TransferId) -> Option<TransferItem> {
        self.handles.get(id).map(|h| h.item.read().unwrap().clone())
    }

    pub fn pause(&self, id: &TransferId) -> Result<(), ConnectError> {
        let handle = self
            .handles
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(format!("transfer {id}")))?;
        handle.control.send(ControlSignal::Pause).ok();
        let mut item = handle.item.write().unwrap();
        if item.status == TransferStatus::Active {
            item.status = TransferStatus::Paused;
        }
        Ok(())
    }

    pub fn resume(&self, id: &TransferId) -> Result<(), ConnectError> {
        let handle = self
            .handles
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(format!("transfer {id}")))?;
        handle.control.send(ControlSignal::Run).ok();
        let mut item = handle.item.write().unwrap();
        if item.status == TransferStatus::Paused {
            item.status = TransferStatus::Active;
        }
        Ok(())
    }

    pub fn cancel(&self, id: &TransferId) -> Result<(), ConnectError> {
        let handle = self
            .handles
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(format!("transfer {id}")))?;
        handle.control.send(ControlSignal::Cancel).ok();
        Ok(())
    }

    /// Re-queues a finished transfer. Rejected once the transfer has already
    /// reached `completed` — retry is for failed or cancelled jobs only.
    pub fn retry(&self, id: &TransferId) -> Result<(), ConnectError> {
        let handle = self
            .handles
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(format!("transfer {id}")))?;
        {
            let mut item = handle.item.write().unwrap();
            if item.status == TransferStatus::Completed {
                return Err(ConnectError::InvalidArgument(format!(
                    "transfer {id} already completed"
                )));
            }
            item.status = TransferStatus::Queued;
            item.bytes_transferred = 0;
            item.error = None;
        }
        handle.control.send(ControlSignal::Run).ok();
        let _ = self.queue_tx.send(id.clone());
        Ok(())
    }
}

fn spawn_dispatcher(
    engine: TransferEngine,
    mut queue_rx: mpsc::UnboundedReceiver<TransferId>,
    concurrency: usize,
) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        while let Some(id) = queue_rx.recv().await {
            let Some(handle) = engine.handles.get(&id).map(|h| h.control.subscribe()) else {
                continue;
            };
            if *handle.borrow() == ControlSignal::Cancel {
                continue;
            }
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_transfer(&engine, &id).await;
            });
        }
    });
}

async fn run_transfer(engine: &TransferEngine, id: &TransferId) {
    let Some(handle_ref) = engine.handles.get(id) else {
        return;
    };
    let control = handle_ref.control.subscribe();
    let item_arc = handle_ref.item.clone();
    drop(handle_ref);

    {
        let mut item = item_arc.write().unwrap();
        item.status = TransferStatus::Active;
    }

    let (direction, local_path, remote_path) = {
        let item = item_arc.read().unwrap();
        (item.direction, item.local_path.clone(), item.remote_path.clone())
    };

    let result = match direction {
        TransferDirection::Download => {
            download(engine, &item_arc, control.clone(), &local_path, &remote_path).await
        }
        TransferDirection::Upload => {
            upload(engine, &item_arc, control.clone(), &local_path, &remote_path).await
        }
    };

    let cancelled = *control.borrow() == ControlSignal::Cancel;
    let final_status = match &result {
        Ok(()) if cancelled => TransferStatus::Cancelled,
        Ok(()) => TransferStatus::Completed,
        Err(_) if cancelled => TransferStatus::Cancelled,
        Err(_) => TransferStatus::Failed,
    };

    if cancelled && direction == TransferDirection::Download {
        let keep_partial = item_arc.read().unwrap().keep_partial;
        if !keep_partial {
            let _ = tokio::fs::remove_file(part_path_for(&local_path)).await;
            let _ = tokio::fs::remove_file(resume_header_path_for(&local_path)).await;
        }
    }

    {
        let mut item = item_arc.write().unwrap();
        item.status = final_status;
        if let Err(e) = &result {
            item.error = Some(e.to_string());
        }
    }

    publish_complete(engine, &item_arc).await;
}

/// Downloads into a `.part` sibling file, resuming from its current length
/// iff a sidecar header recorded alongside it matches the source's current
/// `mtime` (otherwise the source changed since the last attempt and the
/// `.part` file's bytes can no longer be trusted, so the transfer restarts
/// at zero), then renames it onto the final local path.
async fn download(
    engine: &TransferEngine,
    item_arc: &Arc<std::sync::RwLock<TransferItem>>,
    mut control: watch::Receiver<ControlSignal>,
    local_path: &PathBuf,
    remote_path: &str,
) -> Result<(), ConnectError> {
    let attrs = engine.sftp.metadata(remote_path).await.map_err(ConnectError::from)?;
    let total = attrs.size;
    {
        let mut item = item_arc.write().unwrap();
        item.bytes_total = total;
    }

    let part_path = part_path_for(local_path);
    let header_path = resume_header_path_for(local_path);
    let recorded_mtime = read_resume_header(&header_path).await;
    let can_resume = recorded_mtime.is_some() && recorded_mtime == attrs.mtime;

    let mut offset = if can_resume {
        match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    } else {
        0
    };
    if let Some(mtime) = attrs.mtime {
        write_resume_header(&header_path, mtime).await;
    }

    let mut remote_file = engine
        .sftp
        .open_with_flags(remote_path, OpenFlags::READ)
        .await
        .map_err(ConnectError::from)?;
    remote_file
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(ConnectError::Io)?;

    let mut local_file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(!can_resume)
        .open(&part_path)
        .await
        .map_err(ConnectError::Io)?;
    local_file
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(ConnectError::Io)?;

    {
        let mut item = item_arc.write().unwrap();
        item.bytes_transferred = offset;
    }

    let mut speed = SpeedTracker::new();
    let mut last_event = Instant::now() - PROGRESS_EVENT_INTERVAL;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        if let Some(total) = total {
            if offset >= total {
                break;
            }
        }
        if wait_while_paused(&mut control).await == ControlSignal::Cancel {
            return Ok(());
        }

        let read = tokio::time::timeout(STALL_TIMEOUT, remote_file.read(&mut buf))
            .await
            .map_err(|_| ConnectError::Stalled(format!("no data from {remote_path} for 60s")))?
            .map_err(ConnectError::Io)?;
        if read == 0 {
            break;
        }
        local_file.write_all(&buf[..read]).await.map_err(ConnectError::Io)?;
        offset += read as u64;
        speed.record(read as u64);
        throttle(engine, read as u64).await;

        {
            let mut item = item_arc.write().unwrap();
            item.bytes_transferred = offset;
            item.speed_bytes_per_sec = speed.current();
        }
        if last_event.elapsed() >= PROGRESS_EVENT_INTERVAL {
            publish_update(engine, item_arc).await;
            last_event = Instant::now();
        }
    }

    local_file.flush().await.map_err(ConnectError::Io)?;
    drop(local_file);
    tokio::fs::rename(&part_path, local_path).await.map_err(ConnectError::Io)?;
    let _ = tokio::fs::remove_file(&header_path).await;
    Ok(())
}

async fn upload(
    engine: &TransferEngine,
    item_arc: &Arc<std::sync::RwLock<TransferItem>>,
    mut control: watch::Receiver<ControlSignal>,
    local_path: &PathBuf,
    remote_path: &str,
) -> Result<(), ConnectError> {
    let local_meta = tokio::fs::metadata(local_path).await.map_err(ConnectError::Io)?;
    let total = local_meta.len();
    {
        let mut item = item_arc.write().unwrap();
        item.bytes_total = Some(total);
    }

    let tmp_remote = format!("{remote_path}.part");
    let mut offset = match engine.sftp.metadata(&tmp_remote).await {
        Ok(attrs) => attrs.size.unwrap_or(0),
        Err(_) => 0,
    };

    let mut local_file = tokio::fs::File::open(local_path).await.map_err(ConnectError::Io)?;
    local_file
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(ConnectError::Io)?;

    let mut remote_file = engine
        .sftp
        .open_with_flags(&tmp_remote, OpenFlags::WRITE | OpenFlags::CREATE)
        .await
        .map_err(ConnectError::from)?;
    remote_file
        .seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(ConnectError::Io)?;

    {
        let mut item = item_arc.write().unwrap();
        item.bytes_transferred = offset;
    }

    let mut speed = SpeedTracker::new();
    let mut last_event = Instant::now() - PROGRESS_EVENT_INTERVAL;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        if offset >= total {
            break;
        }
        if wait_while_paused(&mut control).await == ControlSignal::Cancel {
            return Ok(());
        }

        let read = local_file.read(&mut buf).await.map_err(ConnectError::Io)?;
        if read == 0 {
            break;
        }
        tokio::time::timeout(STALL_TIMEOUT, remote_file.write_all(&buf[..read]))
            .await
            .map_err(|_| ConnectError::Stalled(format!("no progress writing {remote_path} for 60s")))?
            .map_err(ConnectError::Io)?;
        offset += read as u64;
        speed.record(read as u64);
        throttle(engine, read as u64).await;

        {
            let mut item = item_arc.write().unwrap();
            item.bytes_transferred = offset;
            item.speed_bytes_per_sec = speed.current();
        }
        if last_event.elapsed() >= PROGRESS_EVENT_INTERVAL {
            publish_update(engine, item_arc).await;
            last_event = Instant::now();
        }
    }

    remote_file.flush().await.map_err(ConnectError::Io)?;
    drop(remote_file);
    let _ = engine.sftp.remove_file(remote_path).await;
    engine
        .sftp
        .rename(&tmp_remote, remote_path)
        .await
        .map_err(ConnectError::from)?;
    Ok(())
}

fn part_path_for(local_path: &PathBuf) -> PathBuf {
    let mut part = local_path.clone().into_os_string();
    part.push(".part");
    PathBuf::from(part)
}

/// Path of the sidecar file recording the remote `mtime` a `.part` file was
/// started against, so a later resume can tell whether the source changed
/// underneath it.
fn resume_header_path_for(local_path: &PathBuf) -> PathBuf {
    let mut header = local_path.clone().into_os_string();
    header.push(".part.meta");
    PathBuf::from(header)
}

async fn read_resume_header(header_path: &PathBuf) -> Option<u32> {
    let bytes = tokio::fs::read(header_path).await.ok()?;
    let raw: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

async fn write_resume_header(header_path: &PathBuf, mtime: u32) {
    let _ = tokio::fs::write(header_path, mtime.to_le_bytes()).await;
}

/// Blocks while the control channel reads `Pause`, returning as soon as it
/// becomes `Run` or `Cancel`.
async fn wait_while_paused(control: &mut watch::Receiver<ControlSignal>) -> ControlSignal {
    loop {
        let signal = *control.borrow();
        match signal {
            ControlSignal::Run | ControlSignal::Cancel => return signal,
            ControlSignal::Pause => {
                if control.changed().await.is_err() {
                    return ControlSignal::Cancel;
                }
            }
        }
    }
}

async fn throttle(engine: &TransferEngine, bytes: u64) {
    let limit = engine.bandwidth_limit_bytes_per_sec.load(Ordering::Relaxed);
    if limit == 0 {
        return;
    }
    let seconds = bytes as f64 / limit as f64;
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

async fn publish_update(engine: &TransferEngine, item_arc: &Arc<std::sync::RwLock<TransferItem>>) {
    let item = item_arc.read().unwrap().clone();
    let value = serde_json::to_value(&item).unwrap_or(serde_json::Value::Null);
    engine
        .events
        .publish(Event::TransferUpdate {
            connection_id: engine.connection_id.clone(),
            transfer_id: item.id,
            item: value,
        })
        .await;
}

async fn publish_complete(engine: &TransferEngine, item_arc: &Arc<std::sync::RwLock<TransferItem>>) {
    let item = item_arc.read().unwrap().clone();
    let value = serde_json::to_value(&item).unwrap_or(serde_json::Value::Null);
    engine
        .events
        .publish(Event::TransferComplete {
            connection_id: engine.connection_id.clone(),
            transfer_id: item.id,
            item: value,
        })
        .await;
}

/// Exponential moving average of bytes/sec, sampled once per chunk.
struct SpeedTracker {
    last_sample: Instant,
    ewma: f64,
    started: AtomicBool,
}

impl SpeedTracker {
    fn new() -> Self {
        SpeedTracker {
            last_sample: Instant::now(),
            ewma: 0.0,
            started: AtomicBool::new(false),
        }
    }

    fn record(&mut self, bytes: u64) {
        let elapsed = self.last_sample.elapsed().as_secs_f64().max(0.001);
        let instantaneous = bytes as f64 / elapsed;
        if self.started.swap(true, Ordering::Relaxed) {
            self.ewma = EWMA_ALPHA * instantaneous + (1.0 - EWMA_ALPHA) * self.ewma;
        } else {
            self.ewma = instantaneous;
        }
        self.last_sample = Instant::now();
    }

    fn current(&self) -> f64 {
        self.ewma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_tracker_converges_toward_steady_rate() {
        let mut tracker = SpeedTracker::new();
        tracker.record(1000);
        std::thread::sleep(Duration::from_millis(5));
        tracker.record(1000);
        assert!(tracker.current() > 0.0);
    }

    #[test]
    fn part_path_appends_suffix() {
        let path = PathBuf::from("/tmp/file.bin");
        assert_eq!(part_path_for(&path), PathBuf::from("/tmp/file.bin.part"));
    }

    #[tokio::test]
    async fn resume_header_round_trips_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let header_path = dir.path().join("download.bin.part.meta");
        assert!(read_resume_header(&header_path).await.is_none());

        write_resume_header(&header_path, 1_700_000_000).await;
        assert_eq!(read_resume_header(&header_path).await, Some(1_700_000_000));
    }
}
