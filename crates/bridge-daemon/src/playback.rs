//! Playback inference.
//!
//! The player API only reports a progress value and the current track; it
//! never says whether it is playing.  `PlayerState` derives play/pause
//! edges from how the progress moves, interpolates progress between polls
//! and reacts to commands coming back from the display.  Transitions are
//! pure: the poll loop feeds snapshots and the clock in and executes the
//! returned effects.

use std::time::Duration;

use bridge_proto::protocol::{Artist, Message, MusicInfo};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::control::ControlAction;

pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(1200);

// ── player snapshots ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub id: u64,
    pub name: String,
    pub album_id: u64,
    pub album_name: String,
    pub artists: Vec<Artist>,
    pub duration_ms: u64,
    pub cover_url: Option<String>,
}

impl TrackInfo {
    pub fn to_message(&self) -> Message {
        Message::SetMusicInfo(MusicInfo {
            music_id: self.id.to_string(),
            music_name: self.name.clone(),
            album_id: self.album_id.to_string(),
            album_name: self.album_name.clone(),
            artists: self.artists.clone(),
            duration: self.duration_ms,
        })
    }
}

/// One successful poll of the player API.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub track: Option<TrackInfo>,
    pub progress_secs: f64,
    pub sampled_at: Instant,
}

impl PlaybackSnapshot {
    /// Parse the player's `{progress, currentTrack}` document.  Returns `None`
    /// (and logs) when `progress` is missing or the body has the wrong shape.
    pub fn from_player_json(value: Value, sampled_at: Instant) -> Option<Self> {
        let raw: RawPlayer = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("player: unexpected response shape: {}", e);
                return None;
            }
        };
        let Some(progress_secs) = raw.progress else {
            warn!("player: response has no progress");
            return None;
        };
        Some(Self {
            track: raw.current_track.and_then(RawTrack::into_track),
            progress_secs,
            sampled_at,
        })
    }

    pub fn progress_ms(&self) -> u64 {
        secs_to_ms(self.progress_secs)
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    // saturating cast: negatives and NaN become 0
    (secs * 1000.0).round() as u64
}

#[derive(Deserialize)]
struct RawPlayer {
    progress: Option<f64>,
    #[serde(rename = "currentTrack")]
    current_track: Option<RawTrack>,
}

#[derive(Deserialize)]
struct RawTrack {
    id: Option<u64>,
    name: Option<String>,
    dt: Option<f64>,
    al: Option<RawAlbum>,
    ar: Option<Vec<RawArtist>>,
}

#[derive(Deserialize)]
struct RawAlbum {
    id: Option<u64>,
    name: Option<String>,
    #[serde(rename = "picUrl")]
    pic_url: Option<String>,
}

#[derive(Deserialize)]
struct RawArtist {
    id: Option<u64>,
    name: Option<String>,
}

impl RawTrack {
    fn into_track(self) -> Option<TrackInfo> {
        let id = self.id?;
        let album = self.al;
        let (album_id, album_name, cover_url) = match album {
            Some(al) => (al.id.unwrap_or(0), al.name.unwrap_or_default(), al.pic_url),
            None => (0, String::new(), None),
        };
        Some(TrackInfo {
            id,
            name: self.name.unwrap_or_default(),
            album_id,
            album_name,
            artists: self
                .ar
                .unwrap_or_default()
                .into_iter()
                .map(|a| Artist {
                    id: a.id.unwrap_or(0).to_string(),
                    name: a.name.unwrap_or_default(),
                })
                .collect(),
            duration_ms: self.dt.map(|dt| dt.max(0.0).round() as u64).unwrap_or(0),
            cover_url: cover_url.filter(|url| !url.is_empty()),
        })
    }
}

// ── commands and effects ──────────────────────────────────────────────────────

/// A control command sent by the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteCommand {
    Pause,
    Resume,
    Next,
    Previous,
    Seek(u64),
    SetVolume(f64),
}

impl RemoteCommand {
    pub fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Pause => Some(Self::Pause),
            Message::Resume => Some(Self::Resume),
            Message::ForwardSong => Some(Self::Next),
            Message::BackwardSong => Some(Self::Previous),
            Message::SeekPlayProgress { progress } => Some(Self::Seek(*progress)),
            Message::SetVolume { volume } => Some(Self::SetVolume(*volume)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Resumed { progress_ms: u64 },
    Paused,
    Progress { progress_ms: u64 },
    TrackChanged(TrackInfo),
    AlbumCover(String),
    RefreshVolume,
    Control(ControlAction),
    StartLyrics { track_id: u64 },
    CancelLyrics,
}

impl Effect {
    /// Wire messages this effect produces directly.  Effects that need I/O
    /// beyond the socket produce none.
    pub fn messages(&self) -> Vec<Message> {
        match self {
            Effect::Resumed { progress_ms } => vec![
                Message::OnResumed,
                Message::OnPlayProgress {
                    progress: *progress_ms,
                },
            ],
            Effect::Paused => vec![Message::OnPaused],
            Effect::Progress { progress_ms } => vec![Message::OnPlayProgress {
                progress: *progress_ms,
            }],
            Effect::TrackChanged(track) => vec![track.to_message()],
            Effect::AlbumCover(url) => vec![Message::SetMusicAlbumCoverImageUri {
                img_url: url.clone(),
            }],
            Effect::RefreshVolume
            | Effect::Control(_)
            | Effect::StartLyrics { .. }
            | Effect::CancelLyrics => Vec::new(),
        }
    }
}

// ── state machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    progress_ms: u64,
    at: Instant,
}

#[derive(Debug, Clone)]
pub struct PlayerState {
    stall_threshold: Duration,
    playing: bool,
    pending_resume: bool,
    pending_pause: bool,
    /// The display paused us; the next progress change is the player
    /// catching up, not a resume.
    ui_suppressed_pause: bool,
    force_refresh: bool,
    anchor: Option<Anchor>,
    current_track: Option<u64>,
    last_cover_url: Option<String>,
    last_lyric_track: Option<u64>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_THRESHOLD)
    }
}

impl PlayerState {
    pub fn new(stall_threshold: Duration) -> Self {
        Self {
            stall_threshold,
            playing: false,
            pending_resume: false,
            pending_pause: false,
            ui_suppressed_pause: false,
            force_refresh: false,
            anchor: None,
            current_track: None,
            last_cover_url: None,
            last_lyric_track: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn current_track(&self) -> Option<u64> {
        self.current_track
    }

    /// A display command is waiting to be confirmed against fresh player
    /// data; the poll loop should refetch now.
    pub fn wants_resync(&self) -> bool {
        self.force_refresh
    }

    /// Anchor the progress clock without producing a resume edge.
    pub fn seed(&mut self, progress_ms: u64, now: Instant) {
        self.anchor = Some(Anchor {
            progress_ms,
            at: now,
        });
    }

    /// Forget the current track so the next snapshot re-announces it.
    pub fn reset(&mut self) {
        self.current_track = None;
        self.last_cover_url = None;
        self.last_lyric_track = None;
    }

    fn raw_progress(&self) -> u64 {
        self.anchor.map(|a| a.progress_ms).unwrap_or(0)
    }

    fn interpolated(&self, now: Instant) -> u64 {
        match self.anchor {
            Some(a) => {
                let elapsed = now.saturating_duration_since(a.at).as_millis() as u64;
                a.progress_ms.saturating_add(elapsed)
            }
            None => 0,
        }
    }

    pub fn tick(mut self, snapshot: Option<PlaybackSnapshot>, now: Instant) -> (Self, Vec<Effect>) {
        let mut effects = Vec::new();
        let mut moved = false;

        // progress was true when the player was sampled, not when we got here
        match (&snapshot, self.anchor) {
            // first sample after a failed seed: anchor silently
            (Some(snap), None) => self.seed(snap.progress_ms(), snap.sampled_at.min(now)),
            (Some(snap), Some(anchor)) if snap.progress_ms() != anchor.progress_ms => {
                self.seed(snap.progress_ms(), snap.sampled_at.min(now));
                moved = true;
                if !self.playing && !self.ui_suppressed_pause {
                    self.pending_resume = true;
                }
                self.ui_suppressed_pause = false;
            }
            (_, Some(anchor)) => {
                if self.playing && now.saturating_duration_since(anchor.at) > self.stall_threshold {
                    self.pending_pause = true;
                }
            }
            (None, None) => {}
        }

        if self.pending_resume {
            self.pending_resume = false;
            self.playing = true;
            // a display-initiated resume finds the anchor as old as the pause;
            // restart the clock from the paused position
            if !moved {
                let progress_ms = self.raw_progress();
                self.seed(progress_ms, now);
            }
            effects.push(Effect::Resumed {
                progress_ms: self.interpolated(now),
            });
            effects.push(Effect::RefreshVolume);
        }

        if self.pending_pause {
            self.pending_pause = false;
            self.playing = false;
            effects.push(Effect::Paused);
        }

        if self.playing {
            let progress_ms = if self.force_refresh {
                self.raw_progress()
            } else {
                self.interpolated(now)
            };
            effects.push(Effect::Progress { progress_ms });
        }

        if self.force_refresh {
            self.force_refresh = false;
            effects.push(Effect::Progress {
                progress_ms: self.raw_progress(),
            });
        }

        if let Some(snap) = snapshot {
            self.observe_track(snap, &mut effects);
        }

        (self, effects)
    }

    fn observe_track(&mut self, snap: PlaybackSnapshot, effects: &mut Vec<Effect>) {
        let progress_ms = snap.progress_ms();
        match snap.track {
            None => {
                if self.current_track.is_some() {
                    self.reset();
                    effects.push(Effect::CancelLyrics);
                }
            }
            Some(track) if self.current_track != Some(track.id) => {
                self.reset();
                self.current_track = Some(track.id);

                let cover = track.cover_url.clone();
                let track_id = track.id;
                effects.push(Effect::TrackChanged(track));

                if let Some(url) = cover {
                    if self.last_cover_url.as_deref() != Some(url.as_str()) {
                        self.last_cover_url = Some(url.clone());
                        effects.push(Effect::AlbumCover(url));
                    }
                }

                if self.last_lyric_track != Some(track_id) {
                    self.last_lyric_track = Some(track_id);
                    effects.push(Effect::StartLyrics { track_id });
                }

                effects.push(Effect::Progress { progress_ms });
            }
            Some(_) => {}
        }
    }

    pub fn apply_remote(mut self, command: RemoteCommand) -> (Self, Vec<Effect>) {
        let action = match command {
            RemoteCommand::Pause => {
                self.force_refresh = true;
                self.ui_suppressed_pause = true;
                self.pending_pause = true;
                ControlAction::PlayPause
            }
            RemoteCommand::Resume => {
                self.force_refresh = true;
                self.pending_resume = true;
                ControlAction::PlayPause
            }
            RemoteCommand::Next => ControlAction::Next,
            RemoteCommand::Previous => ControlAction::Previous,
            RemoteCommand::Seek(ms) => ControlAction::Seek(ms),
            RemoteCommand::SetVolume(volume) => ControlAction::SetVolume(volume.clamp(0.0, 1.0)),
        };
        (self, vec![Effect::Control(action)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(progress_secs: f64, track: Option<TrackInfo>, at: Instant) -> PlaybackSnapshot {
        PlaybackSnapshot {
            track,
            progress_secs,
            sampled_at: at,
        }
    }

    fn track(id: u64, cover: Option<&str>) -> TrackInfo {
        TrackInfo {
            id,
            name: format!("track {}", id),
            album_id: 7,
            album_name: "album".into(),
            artists: vec![Artist {
                id: "3".into(),
                name: "artist".into(),
            }],
            duration_ms: 200_000,
            cover_url: cover.map(str::to_string),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn playing_state(t0: Instant) -> PlayerState {
        let mut state = PlayerState::default();
        state.seed(10_000, t0);
        let (state, effects) = state.tick(Some(snapshot(10.001, None, t0)), t0);
        assert!(state.is_playing());
        assert!(matches!(effects[0], Effect::Resumed { .. }));
        state
    }

    #[test]
    fn test_player_json_parsing() {
        let t0 = Instant::now();
        let body = json!({
            "playing": true,
            "progress": 83.25,
            "currentTrack": {
                "id": 1_868_553,
                "name": "Song",
                "dt": 215_000.0,
                "al": { "id": 99, "name": "Album", "picUrl": "https://img/c.jpg" },
                "ar": [{ "id": 5, "name": "A" }, { "id": 6, "name": null }]
            }
        });
        let snap = PlaybackSnapshot::from_player_json(body, t0).unwrap();
        assert_eq!(snap.progress_ms(), 83_250);
        let track = snap.track.unwrap();
        assert_eq!(track.id, 1_868_553);
        assert_eq!(track.duration_ms, 215_000);
        assert_eq!(track.cover_url.as_deref(), Some("https://img/c.jpg"));
        assert_eq!(track.artists[1].name, "");

        match track.to_message() {
            Message::SetMusicInfo(info) => {
                assert_eq!(info.music_id, "1868553");
                assert_eq!(info.album_id, "99");
                assert_eq!(info.artists[0].id, "5");
            }
            other => panic!("unexpected {:?}", other),
        }

        let no_track = PlaybackSnapshot::from_player_json(json!({"progress": 0}), t0).unwrap();
        assert!(no_track.track.is_none());
        assert!(PlaybackSnapshot::from_player_json(json!({"currentTrack": null}), t0).is_none());
        assert!(PlaybackSnapshot::from_player_json(json!("offline"), t0).is_none());
    }

    #[test]
    fn test_stall_emits_single_pause() {
        let t0 = Instant::now();
        let state = playing_state(t0);

        let mut paused = 0;
        let mut state = state;
        for step in [500, 1000, 1500, 2000] {
            let now = t0 + ms(step);
            let (next, effects) = state.tick(Some(snapshot(10.001, None, now)), now);
            state = next;
            let pauses = effects.iter().filter(|e| **e == Effect::Paused).count();
            if step == 1500 {
                assert_eq!(pauses, 1, "pause expected at {}ms", step);
            } else {
                assert_eq!(pauses, 0, "no pause expected at {}ms", step);
            }
            paused += pauses;
        }
        assert_eq!(paused, 1);
        assert!(!state.is_playing());
    }

    #[test]
    fn test_stall_detected_without_fresh_snapshot() {
        let t0 = Instant::now();
        let state = playing_state(t0);
        let (state, effects) = state.tick(None, t0 + ms(1300));
        assert_eq!(effects, vec![Effect::Paused]);
        assert!(!state.is_playing());
    }

    #[test]
    fn test_progress_interpolates_between_polls() {
        let t0 = Instant::now();
        let state = playing_state(t0);
        let (_, effects) = state.tick(None, t0 + ms(40));
        assert_eq!(effects, vec![Effect::Progress { progress_ms: 10_041 }]);
    }

    #[test]
    fn test_progress_change_resumes() {
        let t0 = Instant::now();
        let mut state = PlayerState::default();
        state.seed(10_000, t0);

        let now = t0 + ms(100);
        let (state, effects) = state.tick(Some(snapshot(10.5, None, now)), now);
        assert!(state.is_playing());
        assert_eq!(
            effects,
            vec![
                Effect::Resumed { progress_ms: 10_500 },
                Effect::RefreshVolume,
                Effect::Progress { progress_ms: 10_500 },
            ]
        );
    }

    #[test]
    fn test_anchor_uses_sample_time() {
        let t0 = Instant::now();
        let mut state = PlayerState::default();
        state.seed(10_000, t0);

        // the poll took 30ms to come back
        let now = t0 + ms(100);
        let (state, effects) = state.tick(Some(snapshot(10.5, None, t0 + ms(70))), now);
        assert_eq!(
            effects,
            vec![
                Effect::Resumed { progress_ms: 10_530 },
                Effect::RefreshVolume,
                Effect::Progress { progress_ms: 10_530 },
            ]
        );

        let (_, effects) = state.tick(None, now + ms(10));
        assert_eq!(effects, vec![Effect::Progress { progress_ms: 10_540 }]);
    }

    #[test]
    fn test_remote_pause_is_not_mistaken_for_resume() {
        let t0 = Instant::now();
        let state = playing_state(t0);

        let (state, effects) = state.apply_remote(RemoteCommand::Pause);
        assert_eq!(effects, vec![Effect::Control(ControlAction::PlayPause)]);
        assert!(state.wants_resync());

        // the player was still moving when it got the command
        let now = t0 + ms(100);
        let (state, effects) = state.tick(Some(snapshot(10.1, None, now)), now);
        assert_eq!(
            effects,
            vec![Effect::Paused, Effect::Progress { progress_ms: 10_100 }]
        );
        assert!(!state.is_playing());
        assert!(!state.wants_resync());

        let now = t0 + ms(200);
        let (state, effects) = state.tick(Some(snapshot(10.1, None, now)), now);
        assert!(effects.is_empty());
        assert!(!state.is_playing());
    }

    #[test]
    fn test_remote_resume_restarts_clock() {
        let t0 = Instant::now();
        let state = playing_state(t0);
        let (state, _) = state.tick(None, t0 + ms(1300));
        assert!(!state.is_playing());

        let (state, effects) = state.apply_remote(RemoteCommand::Resume);
        assert_eq!(effects, vec![Effect::Control(ControlAction::PlayPause)]);

        let now = t0 + ms(60_000);
        let (state, effects) = state.tick(None, now);
        assert_eq!(
            effects,
            vec![
                Effect::Resumed { progress_ms: 10_001 },
                Effect::RefreshVolume,
                Effect::Progress { progress_ms: 10_001 },
                Effect::Progress { progress_ms: 10_001 },
            ]
        );

        // the player gets a full stall window to start moving again
        let (state, effects) = state.tick(None, now + ms(1000));
        assert_eq!(effects, vec![Effect::Progress { progress_ms: 11_001 }]);
        assert!(state.is_playing());
    }

    #[test]
    fn test_track_change_announces_once() {
        let t0 = Instant::now();
        let mut state = PlayerState::default();
        state.seed(0, t0);

        let cover = Some("https://img/a.jpg");
        let (state, effects) = state.tick(Some(snapshot(0.0, Some(track(1, cover)), t0)), t0);
        assert_eq!(
            effects,
            vec![
                Effect::TrackChanged(track(1, cover)),
                Effect::AlbumCover("https://img/a.jpg".into()),
                Effect::StartLyrics { track_id: 1 },
                Effect::Progress { progress_ms: 0 },
            ]
        );
        assert_eq!(state.current_track(), Some(1));

        let now = t0 + ms(100);
        let (state, effects) = state.tick(Some(snapshot(0.0, Some(track(1, cover)), now)), now);
        assert!(effects.is_empty());

        let now = t0 + ms(200);
        let (state, effects) = state.tick(Some(snapshot(0.0, Some(track(2, None)), now)), now);
        assert_eq!(
            effects,
            vec![
                Effect::TrackChanged(track(2, None)),
                Effect::StartLyrics { track_id: 2 },
                Effect::Progress { progress_ms: 0 },
            ]
        );

        let now = t0 + ms(300);
        let (state, effects) = state.tick(Some(snapshot(0.0, None, now)), now);
        assert_eq!(effects, vec![Effect::CancelLyrics]);
        assert_eq!(state.current_track(), None);
    }

    #[test]
    fn test_remote_commands_forwarded() {
        let cases = [
            (RemoteCommand::Next, ControlAction::Next),
            (RemoteCommand::Previous, ControlAction::Previous),
            (RemoteCommand::Seek(42_000), ControlAction::Seek(42_000)),
            (RemoteCommand::SetVolume(1.7), ControlAction::SetVolume(1.0)),
            (RemoteCommand::SetVolume(-0.2), ControlAction::SetVolume(0.0)),
        ];
        for (command, action) in cases {
            let (state, effects) = PlayerState::default().apply_remote(command);
            assert_eq!(effects, vec![Effect::Control(action)]);
            assert!(!state.wants_resync());
        }
    }

    #[test]
    fn test_remote_command_mapping() {
        assert_eq!(
            RemoteCommand::from_message(&Message::SeekPlayProgress { progress: 9 }),
            Some(RemoteCommand::Seek(9))
        );
        assert_eq!(
            RemoteCommand::from_message(&Message::ForwardSong),
            Some(RemoteCommand::Next)
        );
        assert_eq!(RemoteCommand::from_message(&Message::OnPaused), None);
        assert_eq!(RemoteCommand::from_message(&Message::Ping), None);
    }

    #[test]
    fn test_resumed_effect_messages() {
        assert_eq!(
            Effect::Resumed { progress_ms: 5 }.messages(),
            vec![Message::OnResumed, Message::OnPlayProgress { progress: 5 }]
        );
        assert!(Effect::RefreshVolume.messages().is_empty());
    }
}
