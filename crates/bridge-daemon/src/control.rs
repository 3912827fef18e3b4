//! Player control: play/pause, skip, seek and volume, plus the two status
//! queries the bridge needs at connect time.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bridge_proto::config::{BackendKind, PlayerConfig};
use futures_util::future::BoxFuture;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ControlError;

const DBUS_SEND: &str = "dbus-send";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const MPRIS_PLAYER: &str = "org.mpris.MediaPlayer2.Player";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlAction {
    PlayPause,
    Next,
    Previous,
    /// Absolute position in milliseconds.
    Seek(u64),
    /// Linear volume in `[0, 1]`.
    SetVolume(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Stopped,
}

pub trait ControlBackend: Send + Sync {
    fn execute(&self, action: ControlAction) -> BoxFuture<'_, Result<(), ControlError>>;
    fn query_volume(&self) -> BoxFuture<'_, Option<f64>>;
    fn query_status(&self) -> BoxFuture<'_, Option<PlayerStatus>>;
}

pub fn backend_for(config: &PlayerConfig) -> Arc<dyn ControlBackend> {
    match config.backend {
        BackendKind::Mpris => Arc::new(MprisBackend::new(config.mpris_destination())),
        BackendKind::Disabled => Arc::new(UnsupportedBackend),
    }
}

// ── MPRIS over dbus-send ──────────────────────────────────────────────────────

pub struct MprisBackend {
    destination: String,
}

impl MprisBackend {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    /// Method-call arguments following `--dest` and the object path.
    fn action_args(action: ControlAction) -> Vec<String> {
        match action {
            ControlAction::PlayPause => vec![format!("{}.PlayPause", MPRIS_PLAYER)],
            ControlAction::Next => vec![format!("{}.Next", MPRIS_PLAYER)],
            ControlAction::Previous => vec![format!("{}.Previous", MPRIS_PLAYER)],
            // SetPosition takes microseconds; the track id is not checked by the player
            ControlAction::Seek(ms) => vec![
                format!("{}.SetPosition", MPRIS_PLAYER),
                "objpath:/not/used".to_string(),
                format!("int64:{}", ms.saturating_mul(1000)),
            ],
            ControlAction::SetVolume(volume) => vec![
                "org.freedesktop.DBus.Properties.Set".to_string(),
                format!("string:{}", MPRIS_PLAYER),
                "string:Volume".to_string(),
                format!("variant:double:{}", volume),
            ],
        }
    }

    fn property_args(name: &str) -> Vec<String> {
        vec![
            "org.freedesktop.DBus.Properties.Get".to_string(),
            format!("string:{}", MPRIS_PLAYER),
            format!("string:{}", name),
        ]
    }

    async fn dbus_send(&self, args: Vec<String>) -> Result<String, ControlError> {
        let mut command = Command::new(DBUS_SEND);
        command
            .arg("--print-reply")
            .arg(format!("--dest={}", self.destination))
            .arg(MPRIS_PATH)
            .args(&args)
            .kill_on_drop(true);
        debug!("control: {} {}", DBUS_SEND, args.join(" "));

        let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| ControlError::Timeout(DBUS_SEND))?
            .map_err(|source| ControlError::Spawn {
                program: DBUS_SEND,
                source,
            })?;

        if !output.status.success() {
            return Err(ControlError::Failed {
                program: DBUS_SEND,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn property(&self, name: &str) -> Option<String> {
        match self.dbus_send(Self::property_args(name)).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("control: reading {} failed: {}", name, e);
                None
            }
        }
    }
}

impl ControlBackend for MprisBackend {
    fn execute(&self, action: ControlAction) -> BoxFuture<'_, Result<(), ControlError>> {
        Box::pin(async move {
            self.dbus_send(Self::action_args(action)).await?;
            Ok(())
        })
    }

    fn query_volume(&self) -> BoxFuture<'_, Option<f64>> {
        Box::pin(async move { parse_volume_reply(&self.property("Volume").await?) })
    }

    fn query_status(&self) -> BoxFuture<'_, Option<PlayerStatus>> {
        Box::pin(async move { parse_status_reply(&self.property("PlaybackStatus").await?) })
    }
}

/// Extract the value of a `variant double 0.45` reply.
pub fn parse_volume_reply(reply: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"double\s+([0-9.]+)").expect("volume pattern is valid"));
    re.captures(reply)?.get(1)?.as_str().parse().ok()
}

/// Extract the value of a `variant string "Playing"` reply.
pub fn parse_status_reply(reply: &str) -> Option<PlayerStatus> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"string\s+"(\w+)""#).expect("status pattern is valid"));
    match re.captures(reply)?.get(1)?.as_str() {
        "Playing" => Some(PlayerStatus::Playing),
        "Paused" => Some(PlayerStatus::Paused),
        "Stopped" => Some(PlayerStatus::Stopped),
        _ => None,
    }
}

// ── unsupported platforms ─────────────────────────────────────────────────────

pub struct UnsupportedBackend;

impl ControlBackend for UnsupportedBackend {
    fn execute(&self, action: ControlAction) -> BoxFuture<'_, Result<(), ControlError>> {
        Box::pin(async move {
            info!("control: ignoring {:?}, no backend configured", action);
            Err(ControlError::Unsupported)
        })
    }

    fn query_volume(&self) -> BoxFuture<'_, Option<f64>> {
        Box::pin(async { None })
    }

    fn query_status(&self) -> BoxFuture<'_, Option<PlayerStatus>> {
        Box::pin(async { None })
    }
}

// ── worker task ───────────────────────────────────────────────────────────────

/// Spawn the task that runs control actions one at a time, in arrival order.
/// Dropping every sender ends the task.
pub fn spawn_worker(backend: Arc<dyn ControlBackend>) -> (mpsc::Sender<ControlAction>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(WORKER_QUEUE);
    let handle = tokio::spawn(worker_task(backend, rx));
    (tx, handle)
}

async fn worker_task(backend: Arc<dyn ControlBackend>, mut rx: mpsc::Receiver<ControlAction>) {
    while let Some(action) = rx.recv().await {
        match backend.execute(action).await {
            Ok(()) => debug!("control: {:?} done", action),
            Err(ControlError::Unsupported) => {}
            Err(e) => warn!("control: {:?} failed: {}", action, e),
        }
    }
    debug!("control worker: task exiting");
}
