//! The playback drift supervisor: a dedicated thread that polls the player
//! once per second while playing, advances the comment window, renders
//! newly revealed comments and appends them to the shared display buffer.
//!
//! The supervisor owns the mutable session state (comment stream, display
//! buffer, playback state) and is its only writer. The UI thread reads
//! buffer snapshots and talks back over the command channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, unbounded, Receiver, Sender};
use parking_lot::RwLock;

use crate::api::BadgeCatalog;
use crate::chat::{CommentStream, WindowState};
use crate::data::CommentService;
use crate::emotes::EmoteIndex;
use crate::media;
use crate::player::{debug_log, Player, PlayerEvent};
use crate::render::{self, DisplayBuffer, MessageSpan, RenderOptions, RenderedMessage};
use crate::timeline::{PlaybackState, Timeline};

/// Poll cadence while playing.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// The presentation layer reports whether the viewer is near the bottom
    /// of the message list; appends only auto-scroll while true.
    SetFollow(bool),
    SetUserDelay(f64),
    NudgeUserDelay(f64),
    SetPart(usize),
    SetOptions(RenderOptions),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Appended { count: usize, autoscroll: bool },
    Cleared,
    State(SupervisorState),
    Window(WindowState),
    UserDelay(f64),
}

pub struct Options {
    pub player: Arc<dyn Player>,
    pub player_events: Receiver<PlayerEvent>,
    pub comments: Arc<dyn CommentService>,
    pub vod_id: String,
    pub timeline: Timeline,
    pub emotes: EmoteIndex,
    pub badges: BadgeCatalog,
    pub render: RenderOptions,
    pub user_delay_secs: f64,
    pub initial_part: usize,
    pub media: Option<media::Handle>,
}

pub struct Supervisor {
    command_tx: Sender<Command>,
    feed_events_rx: Receiver<FeedEvent>,
    feed: Arc<RwLock<DisplayBuffer>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn(opts: Options) -> Self {
        let (command_tx, command_rx) = unbounded();
        let (feed_tx, feed_events_rx) = unbounded();
        let feed = Arc::new(RwLock::new(DisplayBuffer::default()));

        let session = Session {
            player: opts.player,
            stream: CommentStream::new(opts.comments, opts.vod_id),
            timeline: opts.timeline,
            emotes: opts.emotes,
            badges: opts.badges,
            options: opts.render,
            playback: PlaybackState {
                part: opts.initial_part.max(1),
                timestamp_secs: 0.0,
                playing: false,
            },
            user_delay_secs: opts.user_delay_secs,
            follow: true,
            state: SupervisorState::Stopped,
            last_window_state: WindowState::Empty,
            next_tick: None,
            feed: feed.clone(),
            feed_tx,
            media: opts.media,
            seen_art: HashSet::new(),
        };

        let player_events = opts.player_events;
        let handle = thread::spawn(move || session.run(command_rx, player_events));

        Self {
            command_tx,
            feed_events_rx,
            feed,
            handle: Some(handle),
        }
    }

    /// Shared read view of the display buffer. Only the supervisor thread
    /// writes to it.
    pub fn feed(&self) -> Arc<RwLock<DisplayBuffer>> {
        self.feed.clone()
    }

    pub fn feed_events(&self) -> Receiver<FeedEvent> {
        self.feed_events_rx.clone()
    }

    pub fn send(&self, command: Command) {
        let _ = self.command_tx.send(command);
    }

    pub fn set_follow(&self, follow: bool) {
        self.send(Command::SetFollow(follow));
    }

    pub fn nudge_user_delay(&self, delta_secs: f64) {
        self.send(Command::NudgeUserDelay(delta_secs));
    }

    pub fn set_options(&self, options: RenderOptions) {
        self.send(Command::SetOptions(options));
    }

    pub fn set_part(&self, part: usize) {
        self.send(Command::SetPart(part));
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// All mutable session state, confined to the supervisor thread.
struct Session {
    player: Arc<dyn Player>,
    stream: CommentStream,
    timeline: Timeline,
    emotes: EmoteIndex,
    badges: BadgeCatalog,
    options: RenderOptions,
    playback: PlaybackState,
    user_delay_secs: f64,
    follow: bool,
    state: SupervisorState,
    last_window_state: WindowState,
    /// The single pending tick; replaced, never accumulated.
    next_tick: Option<Instant>,
    feed: Arc<RwLock<DisplayBuffer>>,
    feed_tx: Sender<FeedEvent>,
    media: Option<media::Handle>,
    seen_art: HashSet<String>,
}

impl Session {
    fn run(mut self, commands: Receiver<Command>, mut events: Receiver<PlayerEvent>) {
        if matches!(self.player.is_paused(), Ok(false)) {
            self.enter_running(Instant::now());
        }

        loop {
            let timeout = self.next_wakeup();
            crossbeam_channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle_player_event(event),
                    Err(_) => {
                        // Player gone; stop polling but keep serving reads.
                        self.enter_stopped();
                        events = never();
                    }
                },
                default(timeout) => self.on_timer(),
            }
        }
    }

    fn next_wakeup(&self) -> Duration {
        if self.state != SupervisorState::Running {
            return Duration::from_millis(250);
        }
        let now = Instant::now();
        let mut deadline = self.next_tick;
        if let Some(resync) = self.stream.next_deadline() {
            deadline = Some(deadline.map_or(resync, |t| t.min(resync)));
        }
        deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(TICK_INTERVAL)
    }

    fn on_timer(&mut self) {
        if self.state != SupervisorState::Running {
            return;
        }
        let now = Instant::now();
        let tick_due = self.next_tick.map(|t| now >= t).unwrap_or(false);
        let resync_due = self
            .stream
            .next_deadline()
            .map(|d| now >= d)
            .unwrap_or(false);
        if !tick_due && !resync_due {
            return;
        }
        if tick_due {
            self.next_tick = Some(now + TICK_INTERVAL);
        }
        self.tick(now);
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SetFollow(follow) => {
                self.follow = follow;
            }
            Command::SetUserDelay(secs) => {
                self.user_delay_secs = secs;
                let _ = self.feed_tx.send(FeedEvent::UserDelay(self.user_delay_secs));
            }
            Command::NudgeUserDelay(delta) => {
                self.user_delay_secs += delta;
                let _ = self.feed_tx.send(FeedEvent::UserDelay(self.user_delay_secs));
            }
            Command::SetPart(part) => {
                self.playback.part = part.max(1);
                self.reanchor(Instant::now());
            }
            Command::SetOptions(options) => {
                self.options = options;
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn handle_player_event(&mut self, event: PlayerEvent) {
        debug_log(format!("player event: {event:?}"));
        match event {
            PlayerEvent::Play => {
                self.enter_running(Instant::now());
            }
            PlayerEvent::Pause | PlayerEvent::Ended => {
                self.enter_stopped();
            }
            PlayerEvent::Seek => {
                self.reanchor(Instant::now());
            }
        }
    }

    /// (Re-)enter RUNNING. Any prior pending tick is replaced, so at most
    /// one timer is ever armed.
    fn enter_running(&mut self, now: Instant) {
        self.next_tick = Some(now);
        self.playback.playing = true;
        if self.state != SupervisorState::Running {
            self.state = SupervisorState::Running;
            let _ = self.feed_tx.send(FeedEvent::State(self.state));
        }
        self.reanchor(now);
    }

    fn enter_stopped(&mut self) {
        self.next_tick = None;
        self.playback.playing = false;
        if self.state != SupervisorState::Stopped {
            self.state = SupervisorState::Stopped;
            let _ = self.feed_tx.send(FeedEvent::State(self.state));
        }
    }

    /// Feed the current offset to the window's resync policy after a seek,
    /// part change or play.
    fn reanchor(&mut self, now: Instant) {
        let Some(offset) = self.current_offset() else {
            return;
        };
        self.stream.on_seek(offset, now);
        if self.state == SupervisorState::Running {
            self.next_tick = Some(now);
        }
    }

    fn current_offset(&mut self) -> Option<f64> {
        match self.player.position_secs() {
            Ok(position) => {
                self.playback.timestamp_secs = position;
                Some(
                    self.timeline
                        .offset_at(self.playback.part, position, self.user_delay_secs),
                )
            }
            Err(err) => {
                debug_log(format!("player position query failed: {err:#}"));
                None
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        if matches!(self.player.is_paused(), Ok(true)) {
            return;
        }
        // Part transitions (mpv playlist advancing) move the absolute
        // offset discontinuously; treat them like a seek.
        if let Some(part) = self.player.current_part() {
            if part != self.playback.part {
                self.playback.part = part;
                self.reanchor(now);
            }
        }
        let Some(offset) = self.current_offset() else {
            return;
        };

        let outcome = self.stream.tick(offset, now);
        for notice in &outcome.notices {
            debug_log(format!("sync: {notice}"));
        }

        let window_state = self.stream.state();
        if window_state != self.last_window_state {
            self.last_window_state = window_state;
            let _ = self.feed_tx.send(FeedEvent::Window(window_state));
        }

        if outcome.cleared {
            self.feed.write().clear();
            let _ = self.feed_tx.send(FeedEvent::Cleared);
        }

        if outcome.revealed.is_empty() {
            return;
        }
        let rendered =
            render::render_batch(&outcome.revealed, &self.emotes, &self.badges, self.options);
        if rendered.is_empty() {
            return;
        }
        self.prefetch_art(&rendered);
        let count = rendered.len();
        self.feed.write().append(rendered);
        let _ = self.feed_tx.send(FeedEvent::Appended {
            count,
            autoscroll: self.follow,
        });
    }

    /// Queue first-seen emote and badge art for the preservation cache.
    fn prefetch_art(&mut self, rendered: &[RenderedMessage]) {
        let Some(media) = &self.media else {
            return;
        };
        for message in rendered {
            for span in &message.spans {
                let url = match span {
                    MessageSpan::TwitchEmote { url, .. } => url.clone(),
                    MessageSpan::ProviderEmote(descriptor) => descriptor.image_url(1),
                    _ => continue,
                };
                if self.seen_art.insert(url.clone()) {
                    media.prefetch(url);
                }
            }
            for badge in &message.badges {
                let url = badge.art.image_url_1x.clone();
                if !url.is_empty() && self.seen_art.insert(url.clone()) {
                    media.prefetch(url);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Comment, CommentPage, Fragment};
    use crate::player::ManualPlayer;
    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    struct ScriptedService {
        pages: Mutex<Vec<CommentPage>>,
    }

    impl CommentService for ScriptedService {
        fn page_at(&self, _vod_id: &str, _offset_secs: f64) -> Result<CommentPage> {
            let mut pages = self.pages.lock();
            if pages.is_empty() {
                bail!("no scripted page");
            }
            Ok(pages.remove(0))
        }

        fn page_after(&self, _vod_id: &str, _cursor: &str) -> Result<CommentPage> {
            bail!("no scripted next page");
        }
    }

    fn page(offsets: &[f64]) -> CommentPage {
        CommentPage {
            comments: offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| Comment {
                    id: format!("c{i}"),
                    content_offset_seconds: *offset,
                    display_name: "viewer".into(),
                    user_color: None,
                    user_badges: Vec::new(),
                    message: vec![Fragment::Text { text: "hi".into() }],
                })
                .collect(),
            cursor: None,
        }
    }

    fn wait_for<F: Fn(&FeedEvent) -> bool>(
        events: &Receiver<FeedEvent>,
        deadline: Duration,
        pred: F,
    ) -> bool {
        let until = Instant::now() + deadline;
        while let Some(remaining) = until.checked_duration_since(Instant::now()) {
            match events.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return true,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        false
    }

    #[test]
    fn play_fetches_and_appends_then_seek_resyncs() {
        let player = ManualPlayer::default();
        let service = Arc::new(ScriptedService {
            pages: Mutex::new(vec![page(&[9.0, 10.5, 11.5]), page(&[499.0, 500.5])]),
        });

        let supervisor = Supervisor::spawn(Options {
            player: Arc::new(player.clone()),
            player_events: player.events(),
            comments: service,
            vod_id: "vod1".into(),
            timeline: Timeline::single_part(0.0),
            emotes: EmoteIndex::default(),
            badges: BadgeCatalog::default(),
            render: RenderOptions::default(),
            user_delay_secs: 0.0,
            initial_part: 1,
            media: None,
        });
        let events = supervisor.feed_events();

        player.set_position(10.0);
        player.play();

        assert!(
            wait_for(&events, Duration::from_secs(5), |e| matches!(
                e,
                FeedEvent::Appended { .. }
            )),
            "expected appended messages after play"
        );
        assert!(!supervisor.feed().read().is_empty());

        // Seek far outside the loaded window: buffer clears, fresh page lands.
        player.seek(500.0);
        assert!(
            wait_for(&events, Duration::from_secs(5), |e| matches!(
                e,
                FeedEvent::Cleared
            )),
            "expected buffer clear after out-of-window seek"
        );
        assert!(
            wait_for(&events, Duration::from_secs(5), |e| matches!(
                e,
                FeedEvent::Appended { .. }
            )),
            "expected appended messages after resync"
        );
        let feed = supervisor.feed();
        let snapshot = feed.read();
        assert!(snapshot.iter().any(|m| m.offset_secs >= 499.0));
    }

    #[test]
    fn pause_stops_polling() {
        let player = ManualPlayer::default();
        let service = Arc::new(ScriptedService {
            pages: Mutex::new(vec![page(&[0.5, 1.0])]),
        });
        let supervisor = Supervisor::spawn(Options {
            player: Arc::new(player.clone()),
            player_events: player.events(),
            comments: service,
            vod_id: "vod1".into(),
            timeline: Timeline::single_part(0.0),
            emotes: EmoteIndex::default(),
            badges: BadgeCatalog::default(),
            render: RenderOptions::default(),
            user_delay_secs: 0.0,
            initial_part: 1,
            media: None,
        });
        let events = supervisor.feed_events();

        player.set_position(1.0);
        player.play();
        assert!(wait_for(&events, Duration::from_secs(5), |e| matches!(
            e,
            FeedEvent::State(SupervisorState::Running)
        )));

        player.pause();
        assert!(wait_for(&events, Duration::from_secs(5), |e| matches!(
            e,
            FeedEvent::State(SupervisorState::Stopped)
        )));
    }
}
