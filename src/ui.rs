use std::env;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use parking_lot::RwLock;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, Terminal};
use semver::Version;
use unicode_width::UnicodeWidthStr;

use crate::api;
use crate::chat::WindowState;
use crate::color::hex_to_rgb;
use crate::player::MpvPlayer;
use crate::render::{DisplayBuffer, MessageSpan, RenderOptions, RenderedMessage};
use crate::storage::{self, ChatPrefs};
use crate::supervisor::{FeedEvent, Supervisor, SupervisorState};
use crate::update;

/// Scrolled up less than this many lines still counts as "at the bottom".
const BOTTOM_THRESHOLD_ROWS: usize = 3;
const SEEK_STEP_SECS: f64 = 10.0;
const DELAY_STEP_SECS: f64 = 0.5;
/// Continuation indent for wrapped chat lines.
const WRAP_INDENT: &str = "  ";

struct Spinner {
    frames: &'static [&'static str],
    index: usize,
    last_advance: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            frames: &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"],
            index: 0,
            last_advance: Instant::now(),
        }
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_advance) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % self.frames.len();
            self.last_advance = now;
            return true;
        }
        false
    }

    fn frame(&self) -> &'static str {
        self.frames[self.index]
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_advance = Instant::now();
    }
}

enum AsyncResponse {
    Update {
        result: Result<Option<update::UpdateInfo>>,
    },
}

pub struct Options {
    pub status_message: String,
    pub channel: String,
    pub vod: api::Vod,
    pub supervisor: Supervisor,
    pub controls: Option<Arc<MpvPlayer>>,
    pub store: Arc<storage::Store>,
    pub prefs: ChatPrefs,
    /// Base of the web archive, used for shareable timestamp links.
    pub share_base_url: String,
}

pub struct Model {
    status_message: String,
    channel: String,
    vod: api::Vod,
    supervisor: Supervisor,
    feed: Arc<RwLock<DisplayBuffer>>,
    feed_events: Receiver<FeedEvent>,
    controls: Option<Arc<MpvPlayer>>,
    store: Arc<storage::Store>,
    prefs: ChatPrefs,
    share_base_url: String,
    follow: bool,
    scroll_offset: usize,
    supervisor_state: SupervisorState,
    window_state: WindowState,
    last_revision: Option<u64>,
    needs_redraw: bool,
    spinner: Spinner,
    update_notice: Option<update::UpdateInfo>,
    update_checked: bool,
    current_version: Version,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let feed = opts.supervisor.feed();
        let feed_events = opts.supervisor.feed_events();
        let (response_tx, response_rx) = unbounded();
        Self {
            status_message: opts.status_message,
            channel: opts.channel,
            vod: opts.vod,
            supervisor: opts.supervisor,
            feed,
            feed_events,
            controls: opts.controls,
            store: opts.store,
            prefs: opts.prefs,
            share_base_url: opts.share_base_url,
            follow: true,
            scroll_offset: 0,
            supervisor_state: SupervisorState::Stopped,
            window_state: WindowState::Empty,
            last_revision: None,
            needs_redraw: true,
            spinner: Spinner::new(),
            update_notice: None,
            update_checked: false,
            current_version: Version::parse(crate::VERSION).expect("crate version"),
            response_tx,
            response_rx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        self.queue_update_check();
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_async() {
                self.needs_redraw = true;
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                                self.needs_redraw = true;
                            }
                        }
                    }
                }
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.is_loading() {
                    if self.spinner.advance() {
                        self.needs_redraw = true;
                    }
                } else {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn is_loading(&self) -> bool {
        matches!(
            self.window_state,
            WindowState::LoadingInitial | WindowState::Resyncing
        )
    }

    fn queue_update_check(&mut self) {
        if self.update_checked {
            return;
        }
        if cfg!(test) || env::var(update::SKIP_UPDATE_ENV).is_ok() {
            self.update_checked = true;
            return;
        }
        self.update_checked = true;
        let tx = self.response_tx.clone();
        let version = self.current_version.clone();
        thread::spawn(move || {
            let result = update::check_for_update(&version);
            let _ = tx.send(AsyncResponse::Update { result });
        });
    }

    fn poll_async(&mut self) -> bool {
        let mut changed = false;

        while let Ok(event) = self.feed_events.try_recv() {
            changed = true;
            match event {
                FeedEvent::Appended { autoscroll, .. } => {
                    if autoscroll && self.follow {
                        self.scroll_offset = 0;
                    }
                }
                FeedEvent::Cleared => {
                    self.scroll_offset = 0;
                }
                FeedEvent::State(state) => {
                    self.supervisor_state = state;
                }
                FeedEvent::Window(state) => {
                    self.window_state = state;
                }
                FeedEvent::UserDelay(delay) => {
                    self.prefs.user_delay_secs = delay;
                    if let Err(err) = self.store.save_chat_prefs(&self.prefs) {
                        self.status_message = format!("Error: {}", err);
                    } else {
                        self.status_message = format!("Chat delay {delay:+.1}s");
                    }
                }
            }
        }

        while let Ok(response) = self.response_rx.try_recv() {
            changed = true;
            match response {
                AsyncResponse::Update { result } => {
                    if let Ok(Some(info)) = result {
                        self.status_message =
                            format!("Update available: {} -> {}", self.current_version, info.version);
                        self.update_notice = Some(info);
                    }
                }
            }
        }

        let revision = self.feed.read().revision();
        if Some(revision) != self.last_revision {
            self.last_revision = Some(revision);
            changed = true;
        }

        changed
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char(' ') => {
                if let Some(controls) = &self.controls {
                    controls.toggle_pause().context("toggle playback")?;
                }
            }
            KeyCode::Left => {
                if let Some(controls) = &self.controls {
                    controls
                        .seek_relative(-SEEK_STEP_SECS)
                        .context("seek backward")?;
                }
            }
            KeyCode::Right => {
                if let Some(controls) = &self.controls {
                    controls
                        .seek_relative(SEEK_STEP_SECS)
                        .context("seek forward")?;
                }
            }
            KeyCode::Char('[') => {
                if let Some(controls) = &self.controls {
                    controls.playlist_prev().context("previous part")?;
                }
            }
            KeyCode::Char(']') => {
                if let Some(controls) = &self.controls {
                    controls.playlist_next().context("next part")?;
                }
            }
            KeyCode::Char('+') | KeyCode::Char('=') => {
                self.supervisor.nudge_user_delay(DELAY_STEP_SECS);
            }
            KeyCode::Char('-') => {
                self.supervisor.nudge_user_delay(-DELAY_STEP_SECS);
            }
            KeyCode::Char('t') => {
                self.prefs.show_timestamp = !self.prefs.show_timestamp;
                self.apply_render_options()?;
            }
            KeyCode::Char('b') => {
                self.prefs.alternate_bg = !self.prefs.alternate_bg;
                self.apply_render_options()?;
            }
            KeyCode::Up | KeyCode::Char('k') => self.scroll_by(1),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_by(-1),
            KeyCode::PageUp => self.scroll_by(10),
            KeyCode::PageDown => self.scroll_by(-10),
            KeyCode::Char('G') | KeyCode::End => self.scroll_to_bottom(),
            KeyCode::Char('o') => self.open_latest_link(),
            KeyCode::Char('c') => self.copy_timestamp_link()?,
            _ => {}
        }
        self.needs_redraw = true;
        Ok(false)
    }

    fn apply_render_options(&mut self) -> Result<()> {
        self.store
            .save_chat_prefs(&self.prefs)
            .context("save chat preferences")?;
        self.supervisor.set_options(RenderOptions {
            show_timestamp: self.prefs.show_timestamp,
            alternate_bg: self.prefs.alternate_bg,
        });
        self.status_message = format!(
            "Timestamps {}, alternate background {}",
            on_off(self.prefs.show_timestamp),
            on_off(self.prefs.alternate_bg)
        );
        Ok(())
    }

    fn scroll_by(&mut self, delta: isize) {
        if delta > 0 {
            self.scroll_offset = self.scroll_offset.saturating_add(delta as usize);
        } else {
            self.scroll_offset = self.scroll_offset.saturating_sub((-delta) as usize);
        }
        self.sync_follow();
    }

    fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
        self.sync_follow();
    }

    /// Reports the near-bottom state to the supervisor whenever it flips;
    /// appends only auto-scroll while the viewer is at the bottom.
    fn sync_follow(&mut self) {
        let near_bottom = self.scroll_offset <= BOTTOM_THRESHOLD_ROWS;
        if near_bottom != self.follow {
            self.follow = near_bottom;
            self.supervisor.set_follow(near_bottom);
        }
        if near_bottom {
            self.scroll_offset = 0;
        }
    }

    fn newest_offset_secs(&self) -> Option<f64> {
        self.feed.read().iter().last().map(|m| m.offset_secs)
    }

    fn open_latest_link(&mut self) {
        let feed = self.feed.read();
        let link = feed.iter().rev().find_map(|message| {
            message.spans.iter().rev().find_map(|span| match span {
                MessageSpan::Link { url, .. } => Some(url.clone()),
                _ => None,
            })
        });
        drop(feed);
        match link {
            Some(url) => {
                if webbrowser::open(&url).is_ok() {
                    self.status_message = format!("Opened {url}");
                } else {
                    self.status_message = format!("Could not open {url}");
                }
            }
            None => {
                self.status_message = "No links in chat yet.".to_string();
            }
        }
    }

    fn copy_timestamp_link(&mut self) -> Result<()> {
        let Some(offset) = self.newest_offset_secs() else {
            self.status_message = "Nothing to copy yet.".to_string();
            return Ok(());
        };
        let url = format!(
            "{}/vods/{}?t={}",
            self.share_base_url.trim_end_matches('/'),
            self.vod.id,
            hms_url(offset)
        );
        let mut clipboard = arboard::Clipboard::new().context("open clipboard")?;
        clipboard
            .set_text(url.clone())
            .context("copy timestamp link")?;
        self.status_message = format!("Copied {url}");
        Ok(())
    }

    fn draw(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(frame.size());

        // Header: channel, title, current chapter.
        let mut header_spans = vec![
            Span::styled(
                format!(" {} ", self.channel),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw(self.vod.title.clone()),
        ];
        if let Some(chapter) = self
            .newest_offset_secs()
            .and_then(|offset| self.vod.chapter_at(offset))
        {
            header_spans.push(Span::styled(
                format!("  ▸ {}", chapter.name),
                Style::default().fg(Color::DarkGray),
            ));
        }
        if let Some(notice) = &self.update_notice {
            header_spans.push(Span::styled(
                format!("  ⬆ v{} available", notice.version),
                Style::default().fg(Color::Green),
            ));
        }
        frame.render_widget(Paragraph::new(Line::from(header_spans)), chunks[0]);

        // Message list.
        let block = Block::default().borders(Borders::NONE);
        let area = chunks[1];
        let width = area.width.max(1) as usize;
        let height = area.height as usize;

        let feed = self.feed.read();
        let mut lines: Vec<Line<'static>> = Vec::new();
        for (row, message) in feed.iter().enumerate() {
            lines.extend(message_lines(message, width, row));
        }
        drop(feed);

        let total = lines.len();
        let max_scroll = total.saturating_sub(height);
        if self.scroll_offset > max_scroll {
            self.scroll_offset = max_scroll;
        }
        let end = total - self.scroll_offset.min(total);
        let start = end.saturating_sub(height);
        let visible: Vec<Line> = lines[start..end].to_vec();
        frame.render_widget(Paragraph::new(visible).block(block), area);

        if !self.follow {
            let paused = Line::from(Span::styled(
                " ⏸ Chat paused — press G to resume ",
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Gray)
                    .add_modifier(Modifier::BOLD),
            ));
            let mut overlay = area;
            overlay.y = area.y + area.height.saturating_sub(1);
            overlay.height = 1;
            frame.render_widget(Paragraph::new(paused), overlay);
        }

        // Status bar.
        let state = match self.supervisor_state {
            SupervisorState::Running => "playing",
            SupervisorState::Stopped => "paused",
        };
        let loading = if self.is_loading() {
            format!("{} loading chat ", self.spinner.frame())
        } else {
            String::new()
        };
        let status = Line::from(vec![
            Span::styled(
                format!(" {state} "),
                Style::default().add_modifier(Modifier::REVERSED),
            ),
            Span::raw(format!(
                " {loading}{}  delay {:+.1}s  ",
                self.status_message, self.prefs.user_delay_secs
            )),
            Span::styled(
                "space:play/pause  ←/→:seek  +/-:delay  t:timestamps  q:quit",
                Style::default().fg(Color::DarkGray),
            ),
        ]);
        frame.render_widget(Paragraph::new(status), chunks[2]);
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// `?t=` form of an offset, e.g. `1h02m03s` → `1h2m3s`.
fn hms_url(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}h{}m{}s", total / 3600, (total % 3600) / 60, total % 60)
}

fn span_color(hex: &str) -> Color {
    match hex_to_rgb(hex) {
        Some(rgb) => Color::Rgb(rgb.r, rgb.g, rgb.b),
        None => Color::White,
    }
}

/// Lays one rendered message out as word-wrapped terminal lines.
fn message_lines(message: &RenderedMessage, width: usize, row: usize) -> Vec<Line<'static>> {
    let row_style = if message.alternate_bg && row % 2 == 1 {
        Style::default().bg(Color::Rgb(26, 26, 28))
    } else {
        Style::default()
    };

    let mut spans: Vec<Span<'static>> = Vec::new();
    if message.show_timestamp {
        spans.push(Span::styled(
            format!("{} ", message.timestamp),
            row_style.fg(Color::DarkGray),
        ));
    }
    for badge in &message.badges {
        spans.push(Span::styled(
            format!("[{}] ", badge.set_id),
            row_style.fg(Color::Yellow),
        ));
    }
    spans.push(Span::styled(
        message.display_name.clone(),
        row_style
            .fg(span_color(&message.name_color))
            .add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled(": ", row_style));

    for fragment in &message.spans {
        match fragment {
            MessageSpan::Text(text) => {
                for word in text.split(' ') {
                    spans.push(Span::styled(format!("{word} "), row_style));
                }
            }
            MessageSpan::Link { label, .. } => {
                spans.push(Span::styled(
                    format!("{label} "),
                    row_style
                        .fg(Color::LightMagenta)
                        .add_modifier(Modifier::UNDERLINED),
                ));
            }
            MessageSpan::TwitchEmote { text, .. } => {
                spans.push(Span::styled(
                    format!("{text} "),
                    row_style.fg(Color::Cyan).add_modifier(Modifier::ITALIC),
                ));
            }
            MessageSpan::ProviderEmote(descriptor) => {
                spans.push(Span::styled(
                    format!("{} ", descriptor.name),
                    row_style.fg(Color::Cyan).add_modifier(Modifier::ITALIC),
                ));
            }
        }
    }

    wrap_spans(spans, width)
}

/// Greedy span-level wrapping; spans are word-sized so this is word wrap.
fn wrap_spans(spans: Vec<Span<'static>>, width: usize) -> Vec<Line<'static>> {
    let width = width.max(4);
    let mut lines = Vec::new();
    let mut current: Vec<Span<'static>> = Vec::new();
    let mut current_width = 0usize;

    for span in spans {
        let span_width = UnicodeWidthStr::width(span.content.as_ref());
        if current_width + span_width > width && !current.is_empty() {
            lines.push(Line::from(std::mem::take(&mut current)));
            current.push(Span::raw(WRAP_INDENT));
            current_width = WRAP_INDENT.len();
        }
        current_width += span_width;
        current.push(span);
    }
    if !current.is_empty() {
        lines.push(Line::from(current));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(words: &[&str]) -> Vec<Span<'static>> {
        words
            .iter()
            .map(|w| Span::raw(format!("{w} ")))
            .collect()
    }

    #[test]
    fn hms_url_formats_offsets() {
        assert_eq!(hms_url(0.0), "0h0m0s");
        assert_eq!(hms_url(3723.0), "1h2m3s");
        assert_eq!(hms_url(-5.0), "0h0m0s");
    }

    #[test]
    fn wrap_keeps_short_messages_on_one_line() {
        let lines = wrap_spans(plain(&["hello", "world"]), 40);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn wrap_breaks_at_width_with_indent() {
        let lines = wrap_spans(plain(&["aaaa", "bbbb", "cccc", "dddd"]), 12);
        assert!(lines.len() >= 2);
        // Continuation lines start with the indent.
        assert_eq!(lines[1].spans[0].content.as_ref(), WRAP_INDENT);
    }

    #[test]
    fn wrap_tolerates_spans_wider_than_the_view() {
        let long = Span::raw("a".repeat(64));
        let lines = wrap_spans(vec![Span::raw("x "), long], 10);
        // Oversized span lands on its own line instead of looping.
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn span_color_falls_back_to_white() {
        assert_eq!(span_color("#ff0000"), Color::Rgb(255, 0, 0));
        assert_eq!(span_color("garbage"), Color::White);
    }
}
