//! Display connection lifecycle.
//!
//! The supervisor owns one WebSocket session at a time.  A session runs
//! three tasks: the writer (sole owner of the sink), the listener (decodes
//! inbound frames) and the poll loop (player polling plus the state
//! machine).  When any of them ends the session is torn down and, after a
//! fixed delay, a new one is attempted.  This never gives up.

use std::sync::Arc;

use bridge_proto::config::{Config, PlayerConfig};
use bridge_proto::protocol::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, trace, warn};

use crate::control::{self, ControlAction, ControlBackend, PlayerStatus};
use crate::error::ConnectionError;
use crate::fetch::DataSource;
use crate::lyrics::{LyricArbitrator, RoundHandle};
use crate::playback::{Effect, PlaybackSnapshot, PlayerState, RemoteCommand};

const OUTBOUND_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    TearingDown,
}

pub struct Supervisor {
    config: Config,
    fetcher: Arc<dyn DataSource>,
    control: Arc<dyn ControlBackend>,
    phase: ConnectionPhase,
}

impl Supervisor {
    pub fn new(config: Config, fetcher: Arc<dyn DataSource>, control: Arc<dyn ControlBackend>) -> Self {
        Self {
            config,
            fetcher,
            control,
            phase: ConnectionPhase::Disconnected,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    fn transition(&mut self, next: ConnectionPhase) {
        info!("connection: {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Connect, serve, tear down, wait, repeat.
    pub async fn run(mut self) {
        let delay = self.config.bridge.reconnect_delay();
        loop {
            self.transition(ConnectionPhase::Connecting);
            match self.run_session().await {
                ConnectionError::Closed => info!("connection: display went away"),
                e @ ConnectionError::WebSocket(_) if self.phase == ConnectionPhase::Connecting => {
                    error!("connection: could not reach {}: {}", self.config.bridge.endpoint, e)
                }
                e => warn!("connection: session ended: {}", e),
            }
            self.transition(ConnectionPhase::Disconnected);
            info!("connection: retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&mut self) -> ConnectionError {
        let endpoint = self.config.bridge.endpoint.clone();
        let ws = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => return e.into(),
        };
        self.transition(ConnectionPhase::Connected);

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel::<RemoteCommand>(COMMAND_QUEUE);

        let mut writer = tokio::spawn(writer_task(sink, out_rx));
        let mut listener = tokio::spawn(listener_task(stream, out_tx.clone(), cmd_tx));
        let (control_tx, control_worker) = control::spawn_worker(self.control.clone());

        let mut poll = PollLoop {
            player: self.config.player.clone(),
            fetcher: self.fetcher.clone(),
            control: self.control.clone(),
            control_tx,
            arbitrator: LyricArbitrator::new(
                self.config.lyrics.sources.clone(),
                self.fetcher.clone(),
                out_tx.clone(),
            ),
            outbound: out_tx,
            state: PlayerState::new(self.config.player.stall_threshold()),
            round: None,
        };

        let reason = tokio::select! {
            res = &mut listener => res.unwrap_or_else(ConnectionError::from),
            res = &mut writer => res.unwrap_or_else(ConnectionError::from),
            reason = poll.run(cmd_rx) => reason,
        };

        self.transition(ConnectionPhase::TearingDown);
        writer.abort();
        listener.abort();
        control_worker.abort();
        // a claim may be parked on the outbound queue, which nobody drains now
        poll.abandon_round();
        reason
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<S>(mut sink: S, mut rx: mpsc::Receiver<Message>) -> ConnectionError
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    while let Some(message) = rx.recv().await {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("writer: dropping {}: {}", message.name(), e);
                continue;
            }
        };
        trace!("writer: -> {} ({} bytes)", message.name(), bytes.len());
        if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
            warn!("writer: send failed: {}", e);
            return e.into();
        }
    }
    debug!("writer: task exiting");
    ConnectionError::OutboundClosed
}

// ── listener task ─────────────────────────────────────────────────────────────

async fn listener_task<S>(
    mut stream: S,
    outbound: mpsc::Sender<Message>,
    commands: mpsc::Sender<RemoteCommand>,
) -> ConnectionError
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return e.into(),
        };
        match frame {
            WsMessage::Binary(bytes) => handle_frame(&bytes, &outbound, &commands).await,
            WsMessage::Close(close) => {
                debug!("listener: close frame {:?}", close);
                return ConnectionError::Closed;
            }
            WsMessage::Text(text) => debug!("listener: ignoring text frame ({} bytes)", text.len()),
            // tungstenite answers pings itself
            _ => {}
        }
    }
    ConnectionError::Closed
}

async fn handle_frame(bytes: &[u8], outbound: &mpsc::Sender<Message>, commands: &mpsc::Sender<RemoteCommand>) {
    let message = match Message::decode(bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!("listener: dropping undecodable frame: {}", e);
            return;
        }
    };
    trace!("listener: <- {}", message.name());

    if message == Message::Ping {
        let _ = outbound.send(Message::Pong).await;
        return;
    }
    match RemoteCommand::from_message(&message) {
        Some(command) => {
            let _ = commands.send(command).await;
        }
        None => debug!("listener: ignoring {} from display", message.name()),
    }
}

// ── poll loop ─────────────────────────────────────────────────────────────────

struct PollLoop {
    player: PlayerConfig,
    fetcher: Arc<dyn DataSource>,
    control: Arc<dyn ControlBackend>,
    control_tx: mpsc::Sender<ControlAction>,
    arbitrator: LyricArbitrator,
    outbound: mpsc::Sender<Message>,
    state: PlayerState,
    round: Option<RoundHandle>,
}

impl PollLoop {
    /// Runs until the outbound queue closes.
    async fn run(&mut self, mut commands: mpsc::Receiver<RemoteCommand>) -> ConnectionError {
        if let Err(e) = self.on_connected().await {
            return e;
        }

        let mut ticker = tokio::time::interval(self.player.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let refetch = self.player.refetch_interval();
        let mut last_fetch: Option<Instant> = None;

        loop {
            let effects = tokio::select! {
                Some(command) = commands.recv() => {
                    info!("display: {:?}", command);
                    let (state, effects) = std::mem::take(&mut self.state).apply_remote(command);
                    self.state = state;
                    effects
                }
                _ = ticker.tick() => {
                    let due = last_fetch.map_or(true, |at| at.elapsed() >= refetch);
                    let snapshot = if due || self.state.wants_resync() {
                        last_fetch = Some(Instant::now());
                        self.fetch_snapshot().await
                    } else {
                        None
                    };
                    let (state, effects) = std::mem::take(&mut self.state).tick(snapshot, Instant::now());
                    self.state = state;
                    effects
                }
            };
            if let Err(e) = self.apply(effects).await {
                return e;
            }
        }
    }

    async fn on_connected(&mut self) -> Result<(), ConnectionError> {
        if let Some(volume) = self.control.query_volume().await {
            self.send(Message::OnVolumeChanged { volume }).await?;
        }
        match self.control.query_status().await {
            Some(PlayerStatus::Playing) | None => {}
            Some(status) => {
                info!("player: {:?} at connect", status);
                self.send(Message::OnPaused).await?;
            }
        }
        if let Some(snapshot) = self.fetch_snapshot().await {
            let progress = snapshot.progress_ms();
            self.send(Message::OnPlayProgress { progress }).await?;
            self.state.seed(progress, Instant::now());
        }
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Option<PlaybackSnapshot> {
        let body = self.fetcher.fetch_json(&self.player.api_url).await?;
        PlaybackSnapshot::from_player_json(body, Instant::now())
    }

    async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ConnectionError::OutboundClosed)
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), ConnectionError> {
        for effect in effects {
            for message in effect.messages() {
                self.send(message).await?;
            }
            match effect {
                Effect::TrackChanged(track) => {
                    info!("player: now playing {:?} (id {})", track.name, track.id)
                }
                Effect::Paused => debug!("player: paused"),
                Effect::Resumed { progress_ms } => debug!("player: resumed at {}ms", progress_ms),
                Effect::RefreshVolume => self.refresh_volume(),
                Effect::Control(action) => {
                    if self.control_tx.send(action).await.is_err() {
                        warn!("control worker is gone, dropping {:?}", action);
                    }
                }
                Effect::StartLyrics { track_id } => {
                    self.cancel_round().await;
                    self.round = Some(self.arbitrator.start_round(track_id));
                }
                Effect::CancelLyrics => self.cancel_round().await,
                Effect::Progress { .. } | Effect::AlbumCover(_) => {}
            }
        }
        Ok(())
    }

    /// Volume lookups shell out; keep them off the emit loop.
    fn refresh_volume(&self) {
        let control = self.control.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            if let Some(volume) = control.query_volume().await {
                let _ = outbound.send(Message::OnVolumeChanged { volume }).await;
            }
        });
    }

    async fn cancel_round(&mut self) {
        if let Some(round) = self.round.take() {
            round.cancel().await;
        }
    }

    fn abandon_round(&mut self) {
        if let Some(round) = self.round.take() {
            round.abort();
        }
    }
}
