use std::process::ExitStatus;
use thiserror::Error;

/// Why a display session ended.  Every variant leads to the same reconnect
/// path; the distinction only matters for logging.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by display")]
    Closed,
    #[error("outbound queue closed")]
    OutboundClosed,
    #[error("session task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Soft failure of a player or lyric request.  Never leaves `fetch`; it is
/// logged and turned into "no result".
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("player control is not available on this platform")]
    Unsupported,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} did not finish in time")]
    Timeout(&'static str),
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: ExitStatus,
        stderr: String,
    },
}
