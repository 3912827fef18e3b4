//! Lyric arbitration.
//!
//! Every configured source is fetched concurrently for a track.  The first
//! usable result goes to the display at once; a later result replaces it
//! only if its source ranks strictly higher.  When a higher rank supersedes
//! something already shown, an empty `SetLyric` clears the display first.
//!
//! A round is guarded by a cancellation token plus a mutex around the
//! claim-and-emit step.  `RoundHandle::cancel` cancels the token and then
//! takes the mutex, so once it returns no task of that round can emit.

use std::sync::Arc;

use bridge_proto::config::{LyricFormat, LyricSourceConfig};
use bridge_proto::lyric::{attach_companion, parse_lrc, parse_yrc, with_credit, Companion};
use bridge_proto::protocol::{LyricLine, Message};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::DataSource;

pub struct LyricArbitrator {
    sources: Arc<[LyricSourceConfig]>,
    fetcher: Arc<dyn DataSource>,
    outbound: mpsc::Sender<Message>,
    top_rank: Option<u8>,
}

#[derive(Default)]
struct RoundState {
    /// Rank of the source currently on the display, if any.
    shown: Option<u8>,
}

/// One fetch round.  Dropping the handle cancels the round but does not
/// wait for an in-flight emission; use [`RoundHandle::cancel`] for that.
pub struct RoundHandle {
    track_id: u64,
    token: CancellationToken,
    state: Arc<Mutex<RoundState>>,
    tasks: JoinSet<()>,
}

impl LyricArbitrator {
    pub fn new(
        sources: Vec<LyricSourceConfig>,
        fetcher: Arc<dyn DataSource>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        let top_rank = sources.iter().map(|s| s.rank).max();
        Self {
            sources: sources.into(),
            fetcher,
            outbound,
            top_rank,
        }
    }

    pub fn start_round(&self, track_id: u64) -> RoundHandle {
        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(RoundState::default()));
        let mut tasks = JoinSet::new();

        for source in self.sources.iter() {
            let task = SourceTask {
                track_id,
                source: source.clone(),
                is_top: Some(source.rank) == self.top_rank,
                fetcher: self.fetcher.clone(),
                outbound: self.outbound.clone(),
                state: state.clone(),
                token: token.clone(),
            };
            tasks.spawn(task.run());
        }
        debug!("lyrics: round for track {} started ({} sources)", track_id, self.sources.len());

        RoundHandle {
            track_id,
            token,
            state,
            tasks,
        }
    }
}

impl RoundHandle {
    pub fn track_id(&self) -> u64 {
        self.track_id
    }

    /// Stop the round.  Returns only once no task can emit anymore.
    pub async fn cancel(mut self) {
        self.token.cancel();
        // an emission in progress finishes before the lock is ours
        let _guard = self.state.lock().await;
        self.tasks.abort_all();
        debug!("lyrics: round for track {} cancelled", self.track_id);
    }

    /// Stop the round without waiting on an emission in progress.  For use
    /// once the outbound queue has no reader left to unblock it.
    pub fn abort(mut self) {
        self.token.cancel();
        self.tasks.abort_all();
        debug!("lyrics: round for track {} aborted", self.track_id);
    }

    /// Wait for every source task to finish.
    pub async fn wait(mut self) {
        while self.tasks.join_next().await.is_some() {}
        let shown = self.state.lock().await.shown;
        match shown {
            Some(rank) => info!("lyrics: track {} settled on rank {}", self.track_id, rank),
            None => info!("lyrics: no source had lyrics for track {}", self.track_id),
        }
    }
}

impl Drop for RoundHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ── source tasks ──────────────────────────────────────────────────────────────

enum Payload {
    Lines(Vec<LyricLine>),
    Ttml(String),
}

impl Payload {
    fn into_message(self) -> Message {
        match self {
            Payload::Lines(data) => Message::SetLyric { data },
            Payload::Ttml(data) => Message::SetLyricFromTtml { data },
        }
    }
}

struct SourceTask {
    track_id: u64,
    source: LyricSourceConfig,
    is_top: bool,
    fetcher: Arc<dyn DataSource>,
    outbound: mpsc::Sender<Message>,
    state: Arc<Mutex<RoundState>>,
    token: CancellationToken,
}

impl SourceTask {
    async fn run(self) {
        let payload = tokio::select! {
            _ = self.token.cancelled() => return,
            payload = self.fetch() => payload,
        };
        match payload {
            Some(message) => self.claim(message).await,
            None => debug!(
                "lyrics: {:?} (rank {}) had nothing for track {}",
                self.source.format, self.source.rank, self.track_id
            ),
        }
    }

    /// First usable result across the source's URLs.  A result the wire
    /// format cannot carry counts as no result.
    async fn fetch(&self) -> Option<Message> {
        for url in self.source.urls_for(self.track_id) {
            let payload = match self.source.format {
                LyricFormat::Ttml => self
                    .fetcher
                    .fetch_text(&url)
                    .await
                    .filter(|body| !body.trim().is_empty())
                    .map(Payload::Ttml),
                format => self
                    .fetcher
                    .fetch_json(&url)
                    .await
                    .and_then(|json| lines_from_json(format, &json))
                    .map(|lines| match &self.source.credit {
                        Some(credit) => with_credit(lines, credit),
                        None => lines,
                    })
                    .map(Payload::Lines),
            };
            let Some(message) = payload.map(Payload::into_message) else {
                continue;
            };
            match message.encode() {
                Ok(_) => return Some(message),
                Err(e) => warn!(
                    "lyrics: {:?} result from {} is unusable: {}",
                    self.source.format, url, e
                ),
            }
        }
        None
    }

    async fn claim(&self, message: Message) {
        let mut state = self.state.lock().await;
        if self.token.is_cancelled() {
            return;
        }
        let rank = self.source.rank;
        if state.shown.is_some_and(|shown| rank <= shown) {
            debug!(
                "lyrics: dropping rank {} for track {}, rank {:?} already shown",
                rank, self.track_id, state.shown
            );
            return;
        }

        // the receiver only goes away with the connection
        if state.shown.is_some() {
            let clear = Message::SetLyric { data: Vec::new() };
            if self.outbound.send(clear).await.is_err() {
                return;
            }
        }
        if self.outbound.send(message).await.is_err() {
            return;
        }
        state.shown = Some(rank);
        info!(
            "lyrics: showing {:?} (rank {}) for track {}",
            self.source.format, rank, self.track_id
        );

        // nothing can outrank this one
        if self.is_top {
            self.token.cancel();
        }
    }
}

fn lyric_text<'a>(json: &'a Value, key: &str) -> Option<&'a str> {
    json.get(key)?
        .get("lyric")?
        .as_str()
        .filter(|text| !text.trim().is_empty())
}

/// Parse a NetEase-style lyric document into lines with companions attached.
/// `None` when the primary track is absent or yields no lines.
fn lines_from_json(format: LyricFormat, json: &Value) -> Option<Vec<LyricLine>> {
    let (mut lines, translation_keys, roman_keys) = match format {
        LyricFormat::Lrc => (
            parse_lrc(lyric_text(json, "lrc")?),
            &["tlyric"][..],
            &["romalrc"][..],
        ),
        LyricFormat::Yrc => (
            parse_yrc(lyric_text(json, "yrc")?),
            &["ytlrc", "tlyric"][..],
            &["yromalrc", "romalrc"][..],
        ),
        LyricFormat::Ttml => return None,
    };
    if lines.is_empty() {
        return None;
    }

    if let Some(text) = translation_keys.iter().find_map(|key| lyric_text(json, key)) {
        attach_companion(&mut lines, &parse_lrc(text), Companion::Translation);
    }
    if let Some(text) = roman_keys.iter().find_map(|key| lyric_text(json, key)) {
        attach_companion(&mut lines, &parse_lrc(text), Companion::Romanization);
    }
    Some(lines)
}
