//! Shell Multiplexer: interactive PTY channels over a [`crate::transport::Transport`].
//!
//! Each shell is a single owner task pumping one `russh` channel: an
//! `in-pump` forwards `writeShell`/resize/close commands sent over an mpsc
//! channel, an `out-pump` is the same task's `channel.wait()` arm, turning
//! `ChannelMsg::Data`/`ExitStatus` into [`crate::events::Event::TerminalData`]/
//! `TerminalExit`. This is the teacher's `session/client.rs` I/O task shape
//! (one task, `tokio::select!` over an inbound mpsc and `channel.wait()`),
//! generalized from line-oriented device I/O to raw byte passthrough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use russh::client::{Handle, Msg};
use russh::ChannelMsg;
use tokio::sync::{mpsc, RwLock};

use crate::error::ConnectError;
use crate::events::{Event, EventBus};
use crate::ids::{ConnectionId, ShellId};
use crate::transport::handler::SupervisorHandler;

const MIN_DIMENSION: u32 = 1;
const MAX_DIMENSION: u32 = 1000;
const ENV_ALLOW_LIST: &[&str] = &["LANG", "LC_ALL", "TERM"];

/// One startup command run against a freshly opened shell: written after
/// `delay_ms`, optionally waiting for output to go quiet before the next one
/// starts. Reified as data per Design Note §9 rather than timers living in
/// the dispatcher.
#[derive(Debug, Clone)]
pub struct StartupCommand {
    pub command: String,
    pub delay_ms: u64,
    pub wait_for_prompt: bool,
}

/// How long an output pause must last before a `wait_for_prompt` startup
/// command is considered answered.
const PROMPT_QUIET_WINDOW: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub cols: u32,
    pub rows: u32,
    pub terminal_type: String,
    pub environment_variables: Vec<(String, String)>,
    pub shell_command: Option<String>,
    pub startup_commands: Vec<StartupCommand>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            cols: 80,
            rows: 24,
            terminal_type: "xterm-256color".to_string(),
            environment_variables: Vec::new(),
            shell_command: None,
            startup_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStatus {
    Opening,
    Open,
    Closed,
}

enum ShellCmd {
    Write(Vec<u8>),
    Resize(u32, u32),
    Close,
}

struct ShellHandle {
    cmd_tx: mpsc::Sender<ShellCmd>,
    status: Arc<RwLock<ShellStatus>>,
}

/// Clamps a requested PTY dimension into `[1, 1000]`, per §4.2: out-of-range
/// values are silently clamped rather than rejected.
pub fn clamp_dimension(value: u32) -> u32 {
    value.clamp(MIN_DIMENSION, MAX_DIMENSION)
}

/// Filters `vars` down to the conservative allow-list: `LANG`/`LC_ALL`/`TERM`,
/// plus any user-supplied pair whose name and value contain no control
/// characters.
pub fn filter_environment(vars: &[(String, String)]) -> Vec<(String, String)> {
    vars.iter()
        .filter(|(name, value)| {
            ENV_ALLOW_LIST.contains(&name.as_str())
                || (!has_control_chars(name) && !has_control_chars(value))
        })
        .cloned()
        .collect()
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// Owns every open shell for one connection.
pub struct ShellMultiplexer {
    connection_id: ConnectionId,
    handle: Arc<RwLock<Handle<SupervisorHandler>>>,
    events: EventBus,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    shells: Arc<DashMap<ShellId, ShellHandle>>,
}

impl ShellMultiplexer {
    pub fn new(
        connection_id: ConnectionId,
        handle: Arc<RwLock<Handle<SupervisorHandler>>>,
        events: EventBus,
        bytes_in: Arc<AtomicU64>,
        bytes_out: Arc<AtomicU64>,
    ) -> Self {
        ShellMultiplexer {
            connection_id,
            handle,
            events,
            bytes_in,
            bytes_out,
            shells: Arc::new(DashMap::new()),
        }
    }

    pub async fn open_shell(
        &self,
        shell_id: ShellId,
        cfg: ShellConfig,
    ) -> Result<(), ConnectError> {
        let status = Arc::new(RwLock::new(ShellStatus::Opening));
        let mut channel = {
            let h = self.handle.read().await;
            h.channel_open_session().await?
        };

        let cols = clamp_dimension(cfg.cols);
        let rows = clamp_dimension(cfg.rows);

        channel
            .request_pty(false, &cfg.terminal_type, cols, rows, 0, 0, &[])
            .await?;

        for (name, value) in filter_environment(&cfg.environment_variables) {
            // Not every server accepts SetEnv; a rejection is not fatal to
            // opening the shell.
            let _ = channel.set_env(false, &name, &value).await;
        }

        match &cfg.shell_command {
            Some(command) => channel.exec(false, command.as_str()).await?,
            None => channel.request_shell(false).await?,
        }

        *status.write().await = ShellStatus::Open;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        self.shells.insert(
            shell_id.clone(),
            ShellHandle {
                cmd_tx: cmd_tx.clone(),
                status: status.clone(),
            },
        );

        spawn_pump(
            shell_id.clone(),
            channel,
            cmd_rx,
            self.events.clone(),
            status.clone(),
            self.bytes_in.clone(),
            self.bytes_out.clone(),
        );

        if !cfg.startup_commands.is_empty() {
            spawn_startup_runner(shell_id, cfg.startup_commands, cmd_tx, self.events.clone());
        }

        Ok(())
    }

    pub async fn write_shell(&self, shell_id: &ShellId, data: Vec<u8>) -> Result<(), ConnectError> {
        let entry = self
            .shells
            .get(shell_id)
            .ok_or_else(|| ConnectError::NotFound(format!("no shell {shell_id}")))?;
        entry
            .cmd_tx
            .send(ShellCmd::Write(data))
            .await
            .map_err(|_| ConnectError::NotConnected(format!("shell {shell_id} pump stopped")))
    }

    pub async fn resize_shell(&self, shell_id: &ShellId, cols: u32, rows: u32) -> Result<(), ConnectError> {
        let entry = self
            .shells
            .get(shell_id)
            .ok_or_else(|| ConnectError::NotFound(format!("no shell {shell_id}")))?;
        if *entry.status.read().await != ShellStatus::Open {
            return Ok(());
        }
        let _ = entry
            .cmd_tx
            .send(ShellCmd::Resize(clamp_dimension(cols), clamp_dimension(rows)))
            .await;
        Ok(())
    }

    pub async fn close_shell(&self, shell_id: &ShellId) -> Result<(), ConnectError> {
        if let Some((_, entry)) = self.shells.remove(shell_id) {
            let _ = entry.cmd_tx.send(ShellCmd::Close).await;
        }
        Ok(())
    }

    /// Closes every open shell, used when the parent Transport disconnects.
    pub async fn close_all(&self) {
        for entry in self.shells.iter() {
            let _ = entry.value().cmd_tx.send(ShellCmd::Close).await;
        }
        self.shells.clear();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_pump(
    shell_id: ShellId,
    mut channel: russh::Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCmd>,
    events: EventBus,
    status: Arc<RwLock<ShellStatus>>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShellCmd::Write(data)) => {
                            bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
                            if channel.data(&data[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(ShellCmd::Resize(cols, rows)) => {
                            let _ = channel.window_change(cols, rows, 0, 0).await;
                        }
                        Some(ShellCmd::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            events
                                .publish(Event::TerminalData {
                                    shell_id: shell_id.clone(),
                                    data: data.to_vec(),
                                })
                                .await;
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            events
                                .publish(Event::TerminalData {
                                    shell_id: shell_id.clone(),
                                    data: data.to_vec(),
                                })
                                .await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            events
                                .publish(Event::TerminalExit {
                                    shell_id: shell_id.clone(),
                                    code: Some(exit_status as i32),
                                })
                                .await;
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        _ => {}
                    }
                }
            }
        }
        *status.write().await = ShellStatus::Closed;
        events
            .publish(Event::TerminalExit {
                shell_id: shell_id.clone(),
                code: None,
            })
            .await;
    });
}

/// Drives the ordered startup-command state machine: for each command, wait
/// `delay_ms`, write `command\n`, and if `wait_for_prompt`, subscribe to the
/// event bus and wait for `PROMPT_QUIET_WINDOW` of silence on this shell's
/// `terminal:data` events before moving on.
fn spawn_startup_runner(
    shell_id: ShellId,
    commands: Vec<StartupCommand>,
    cmd_tx: mpsc::Sender<ShellCmd>,
    events: EventBus,
) {
    tokio::spawn(async move {
        for step in commands {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;

            let mut line = step.command.clone();
            line.push('\n');
            if cmd_tx.send(ShellCmd::Write(line.into_bytes())).await.is_err() {
                return;
            }

            if step.wait_for_prompt {
                wait_for_quiet(&shell_id, &events).await;
            }
        }
    });
}

async fn wait_for_quiet(shell_id: &ShellId, events: &EventBus) {
    let (_sub_id, mut rx) = events.subscribe().await;
    loop {
        match tokio::time::timeout(PROMPT_QUIET_WINDOW, rx.recv()).await {
            Ok(Ok(Event::TerminalData { shell_id: id, .. })) if &id == shell_id => continue,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => return,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_dimension_clamps_to_valid_range() {
        assert_eq!(clamp_dimension(0), 1);
        assert_eq!(clamp_dimension(1), 1);
        assert_eq!(clamp_dimension(1000), 1000);
        assert_eq!(clamp_dimension(5000), 1000);
        assert_eq!(clamp_dimension(80), 80);
    }

    #[test]
    fn filter_environment_keeps_allow_listed_and_clean_pairs() {
        let vars = vec![
            ("TERM".to_string(), "xterm".to_string()),
            ("MY_VAR".to_string(), "value".to_string()),
            ("BAD\u{7}".to_string(), "x".to_string()),
            ("OK".to_string(), "has\ncontrol".to_string()),
        ];
        let filtered = filter_environment(&vars);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().any(|(n, _)| n == "TERM"));
        assert!(filtered.iter().any(|(n, _)| n == "MY_VAR"));
    }
}
