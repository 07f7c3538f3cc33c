//! Comment windowing: the sliding window of fetched chat, the reveal
//! cursor that follows playback, pagination, and the resync policy.
//!
//! The window holds exactly one fetched page at a time. `advance` walks the
//! reveal cursor forward as playback progresses; reaching the end of the
//! page triggers a cursor-keyed background fetch that replaces the page
//! wholesale. A seek outside the loaded span discards the window and
//! re-anchors with a debounced fresh fetch.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::api::{Comment, CommentPage};
use crate::data::CommentService;

/// Playback may run this far past the last loaded comment before the
/// window counts as stale.
pub const CONTAINMENT_SLACK_SECS: f64 = 30.0;

/// A forward jump inside the loaded window larger than this skips the
/// backlog instead of replaying it instantly.
pub const FORWARD_JUMP_SECS: f64 = 4.0;

/// Rapid seeks (scrubbing) collapse into one fetch this long after the
/// last seek settles.
pub const SEEK_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    LoadingInitial,
    Active,
    LoadingNextPage,
    Resyncing,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("comment fetch failed: {0}")]
    Fetch(String),
}

/// The fetched page plus the reveal cursor.
#[derive(Debug, Default)]
pub struct CommentWindow {
    comments: Vec<Comment>,
    cursor: Option<String>,
    stopped_at: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Containment {
    /// Offset sits inside the loaded span; advance incrementally.
    Inside,
    /// Offset left the loaded span; a full resync is needed.
    Outside,
    Empty,
}

impl CommentWindow {
    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn stopped_at(&self) -> usize {
        self.stopped_at
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    /// Wholesale page replacement; the reveal cursor restarts at 0.
    pub fn replace(&mut self, page: CommentPage) {
        self.comments = page.comments;
        self.cursor = page.cursor;
        self.stopped_at = 0;
    }

    pub fn clear(&mut self) {
        self.comments.clear();
        self.cursor = None;
        self.stopped_at = 0;
    }

    /// Rewind the reveal cursor without touching the loaded page.
    pub fn rewind(&mut self) {
        self.stopped_at = 0;
    }

    /// Moves the reveal boundary to the first comment past `offset` and
    /// returns the comments it stepped over, in order.
    pub fn advance(&mut self, offset_secs: f64) -> Vec<Comment> {
        let mut boundary = self.comments.len();
        for (i, comment) in self.comments.iter().enumerate().skip(self.stopped_at) {
            if comment.content_offset_seconds > offset_secs {
                boundary = i;
                break;
            }
        }
        if boundary <= self.stopped_at {
            return Vec::new();
        }
        let revealed = self.comments[self.stopped_at..boundary].to_vec();
        self.stopped_at = boundary;
        revealed
    }

    /// Cursor for the next page once the reveal boundary has reached the
    /// last loaded comment.
    pub fn wants_next_page(&self) -> Option<&str> {
        if self.comments.is_empty() || self.stopped_at < self.comments.len() - 1 {
            return None;
        }
        self.cursor.as_deref()
    }

    fn containment(&self, offset_secs: f64) -> Containment {
        let (Some(first), Some(last)) = (self.comments.first(), self.comments.last()) else {
            return Containment::Empty;
        };
        if offset_secs - last.content_offset_seconds <= CONTAINMENT_SLACK_SECS
            && offset_secs > first.content_offset_seconds
        {
            Containment::Inside
        } else {
            Containment::Outside
        }
    }

    /// True when the next unrevealed comment sits far enough ahead of the
    /// offset that replaying up to it would dump a backlog at once.
    fn forward_jump(&self, offset_secs: f64) -> bool {
        self.comments
            .get(self.stopped_at)
            .map(|c| c.content_offset_seconds - offset_secs >= FORWARD_JUMP_SECS)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Initial,
    NextPage,
}

struct FetchResponse {
    request_id: u64,
    generation: u64,
    kind: FetchKind,
    result: Result<CommentPage, FeedError>,
}

struct PendingFetch {
    request_id: u64,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct ResyncSchedule {
    anchor_secs: f64,
    deadline: Instant,
}

/// What one playback tick produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub revealed: Vec<Comment>,
    /// The display buffer must be reset before appending `revealed`.
    pub cleared: bool,
    /// Diagnostics for the caller's debug log.
    pub notices: Vec<String>,
}

/// Drives a [`CommentWindow`] against a [`CommentService`].
///
/// Fetches run on short-lived worker threads; every window-mutating fetch
/// carries the generation current at dispatch, and responses from older
/// generations are discarded, so a slow superseded request can never clobber
/// a fresher window.
pub struct CommentStream {
    service: Arc<dyn CommentService>,
    vod_id: String,
    window: CommentWindow,
    state: WindowState,
    generation: u64,
    next_request_id: u64,
    pending: Option<PendingFetch>,
    resync: Option<ResyncSchedule>,
    response_tx: Sender<FetchResponse>,
    response_rx: Receiver<FetchResponse>,
}

impl CommentStream {
    pub fn new(service: Arc<dyn CommentService>, vod_id: impl Into<String>) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            vod_id: vod_id.into(),
            window: CommentWindow::default(),
            state: WindowState::Empty,
            generation: 0,
            next_request_id: 0,
            pending: None,
            resync: None,
            response_tx,
            response_rx,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Deadline of the pending debounced resync, if one is scheduled. The
    /// caller can use it to wake up early instead of waiting a full tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.resync.map(|r| r.deadline)
    }

    pub fn window(&self) -> &CommentWindow {
        &self.window
    }

    /// Registers a seek (or a play after a seek). Seeks landing inside the
    /// loaded window are served incrementally by the next tick; anything
    /// else schedules a debounced full resync, and repeated calls while
    /// scrubbing keep pushing the deadline out.
    pub fn on_seek(&mut self, offset_secs: f64, now: Instant) {
        if self.window.containment(offset_secs) == Containment::Inside {
            // Scrubbed back into the loaded span before the debounce fired;
            // the pending resync is moot.
            if self.resync.take().is_some() {
                self.state = WindowState::Active;
            }
            return;
        }
        self.resync = Some(ResyncSchedule {
            anchor_secs: offset_secs,
            deadline: now + SEEK_DEBOUNCE,
        });
        self.state = WindowState::Resyncing;
    }

    /// One playback tick at the given absolute offset.
    pub fn tick(&mut self, offset_secs: f64, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        self.drain_responses(&mut outcome);

        if let Some(resync) = self.resync {
            if now >= resync.deadline {
                self.resync = None;
                self.begin_initial_fetch(resync.anchor_secs, &mut outcome);
            }
            // Keep serving nothing while the debounce settles; the stale
            // window was already off-span when the resync was scheduled.
            return outcome;
        }

        match self.window.containment(offset_secs) {
            Containment::Empty => {}
            Containment::Outside => {
                // Drift detected mid-playback with no seek event observed.
                self.on_seek(offset_secs, now);
                outcome
                    .notices
                    .push(format!("drift outside window at {offset_secs:.1}s, resyncing"));
            }
            Containment::Inside => {
                if self.window.forward_jump(offset_secs) {
                    self.window.rewind();
                    outcome.cleared = true;
                }
                outcome.revealed = self.window.advance(offset_secs);
                if self.pending.is_none() && self.state != WindowState::LoadingNextPage {
                    if let Some(cursor) = self.window.wants_next_page() {
                        let cursor = cursor.to_string();
                        self.begin_next_page_fetch(cursor);
                    }
                }
            }
        }

        outcome
    }

    fn drain_responses(&mut self, outcome: &mut TickOutcome) {
        while let Ok(response) = self.response_rx.try_recv() {
            self.apply_response(response, outcome);
        }
    }

    fn apply_response(&mut self, response: FetchResponse, outcome: &mut TickOutcome) {
        if response.generation != self.generation {
            outcome.notices.push(format!(
                "discarded stale comment fetch (generation {} < {})",
                response.generation, self.generation
            ));
            return;
        }
        if self
            .pending
            .as_ref()
            .map(|p| p.request_id != response.request_id)
            .unwrap_or(true)
        {
            return;
        }
        self.pending = None;

        match response.result {
            Ok(page) => match response.kind {
                FetchKind::Initial => {
                    self.window.replace(page);
                    self.state = if self.window.is_empty() {
                        WindowState::Empty
                    } else {
                        WindowState::Active
                    };
                }
                FetchKind::NextPage => {
                    if page.comments.is_empty() {
                        // End of data; keep serving the current page.
                        self.window.cursor = None;
                        outcome
                            .notices
                            .push("empty comment page, pagination stopped".into());
                    } else {
                        self.window.replace(page);
                    }
                    self.state = WindowState::Active;
                }
            },
            Err(err) => {
                // Window keeps its last-known state; no retry here.
                self.state = if self.window.is_empty() {
                    WindowState::Empty
                } else {
                    WindowState::Active
                };
                outcome.notices.push(err.to_string());
            }
        }
    }

    fn begin_initial_fetch(&mut self, anchor_secs: f64, outcome: &mut TickOutcome) {
        self.generation += 1;
        self.window.clear();
        outcome.cleared = true;
        self.state = WindowState::LoadingInitial;
        let anchor = anchor_secs.max(0.0);
        self.dispatch(FetchKind::Initial, move |service, vod_id| {
            service.page_at(&vod_id, anchor)
        });
    }

    fn begin_next_page_fetch(&mut self, cursor: String) {
        self.state = WindowState::LoadingNextPage;
        self.dispatch(FetchKind::NextPage, move |service, vod_id| {
            service.page_after(&vod_id, &cursor)
        });
    }

    fn dispatch<F>(&mut self, kind: FetchKind, fetch: F)
    where
        F: FnOnce(Arc<dyn CommentService>, String) -> anyhow::Result<CommentPage>
            + Send
            + 'static,
    {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let generation = self.generation;
        self.pending = Some(PendingFetch {
            request_id,
            generation,
        });

        let service = self.service.clone();
        let vod_id = self.vod_id.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result =
                fetch(service, vod_id).map_err(|err| FeedError::Fetch(format!("{err:#}")));
            let _ = tx.send(FetchResponse {
                request_id,
                generation,
                kind,
                result,
            });
        });
    }

    /// Blocks until the in-flight fetch (if any) has responded and been
    /// applied. Test-only; production code drains responses on ticks.
    #[cfg(test)]
    fn settle(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.pending.is_some() {
            if let Ok(response) = self.response_rx.recv_timeout(Duration::from_secs(2)) {
                self.apply_response(response, &mut outcome);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Fragment;
    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    fn comment(id: &str, offset: f64) -> Comment {
        Comment {
            id: id.into(),
            content_offset_seconds: offset,
            display_name: "viewer".into(),
            user_color: None,
            user_badges: Vec::new(),
            message: vec![Fragment::Text { text: "hi".into() }],
        }
    }

    fn page(offsets: &[f64], cursor: Option<&str>) -> CommentPage {
        CommentPage {
            comments: offsets
                .iter()
                .enumerate()
                .map(|(i, o)| comment(&format!("c{i}"), *o))
                .collect(),
            cursor: cursor.map(Into::into),
        }
    }

    fn window(offsets: &[f64], cursor: Option<&str>) -> CommentWindow {
        let mut w = CommentWindow::default();
        w.replace(page(offsets, cursor));
        w
    }

    #[test]
    fn advance_reveals_in_order_and_once() {
        let mut w = window(&[0.0, 5.0, 12.0], None);

        let first = w.advance(0.0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].content_offset_seconds, 0.0);

        let second = w.advance(6.0);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content_offset_seconds, 5.0);

        let third = w.advance(13.0);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].content_offset_seconds, 12.0);

        // Last loaded comment reached with no cursor: nothing to fetch.
        assert!(w.wants_next_page().is_none());
    }

    #[test]
    fn advance_is_idempotent_at_fixed_offset() {
        let mut w = window(&[1.0, 2.0, 3.0], None);
        assert_eq!(w.advance(2.5).len(), 2);
        assert!(w.advance(2.5).is_empty());
        assert!(w.advance(2.5).is_empty());
    }

    #[test]
    fn stopped_at_is_monotone_under_nondecreasing_offsets() {
        let mut w = window(&[1.0, 3.0, 5.0, 7.0, 9.0], None);
        let mut previous = 0;
        for offset in [0.0, 2.0, 2.0, 4.0, 8.0, 20.0] {
            w.advance(offset);
            assert!(w.stopped_at() >= previous);
            previous = w.stopped_at();
        }
        assert_eq!(previous, 5);
    }

    #[test]
    fn pagination_wanted_only_at_page_end_with_cursor() {
        let mut w = window(&[1.0, 2.0, 3.0], Some("next-token"));
        assert!(w.wants_next_page().is_none());
        w.advance(2.5);
        assert_eq!(w.wants_next_page(), Some("next-token"));
        w.advance(10.0);
        assert_eq!(w.wants_next_page(), Some("next-token"));
    }

    #[test]
    fn replace_resets_reveal_cursor() {
        let mut w = window(&[1.0, 2.0], Some("a"));
        w.advance(5.0);
        assert_eq!(w.stopped_at(), 2);
        w.replace(page(&[10.0, 11.0], None));
        assert_eq!(w.stopped_at(), 0);
        assert!(w.cursor().is_none());
    }

    #[test]
    fn forward_jump_detected_only_past_threshold() {
        let w = window(&[10.0, 20.0], None);
        assert!(w.forward_jump(5.0));
        assert!(!w.forward_jump(7.0));
    }

    struct ScriptedService {
        pages: Mutex<Vec<Result<CommentPage>>>,
        next_pages: Mutex<Vec<Result<CommentPage>>>,
    }

    impl ScriptedService {
        fn new(pages: Vec<Result<CommentPage>>, next_pages: Vec<Result<CommentPage>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                next_pages: Mutex::new(next_pages),
            }
        }
    }

    impl CommentService for ScriptedService {
        fn page_at(&self, _vod_id: &str, _offset_secs: f64) -> Result<CommentPage> {
            let mut pages = self.pages.lock();
            if pages.is_empty() {
                bail!("no scripted page");
            }
            pages.remove(0)
        }

        fn page_after(&self, _vod_id: &str, _cursor: &str) -> Result<CommentPage> {
            let mut pages = self.next_pages.lock();
            if pages.is_empty() {
                bail!("no scripted next page");
            }
            pages.remove(0)
        }
    }

    #[test]
    fn seek_outside_window_debounces_then_refetches() {
        let service = Arc::new(ScriptedService::new(
            vec![Ok(page(&[30.0, 40.0, 50.0], None)), Ok(page(&[5.0, 6.0], None))],
            vec![],
        ));
        let mut stream = CommentStream::new(service, "vod1");
        let t0 = Instant::now();

        // Initial load anchored at 30.
        stream.on_seek(30.0, t0);
        let outcome = stream.tick(30.0, t0 + SEEK_DEBOUNCE);
        assert!(outcome.cleared);
        assert_eq!(stream.state(), WindowState::LoadingInitial);
        stream.settle();
        assert_eq!(stream.state(), WindowState::Active);

        // Reveal at 40, then seek back to 5 (outside [30, 50+30]).
        let outcome = stream.tick(40.5, t0 + SEEK_DEBOUNCE);
        assert_eq!(outcome.revealed.len(), 2);

        stream.on_seek(5.0, t0 + Duration::from_secs(1));
        assert_eq!(stream.state(), WindowState::Resyncing);

        // Before the debounce settles nothing is fetched.
        let outcome = stream.tick(5.0, t0 + Duration::from_secs(1) + Duration::from_millis(100));
        assert!(!outcome.cleared);

        // A second rapid seek pushes the deadline; the fetch happens once.
        stream.on_seek(5.0, t0 + Duration::from_secs(1) + Duration::from_millis(200));
        let outcome = stream.tick(5.0, t0 + Duration::from_secs(2));
        assert!(outcome.cleared, "full resync clears the display buffer");
        stream.settle();
        assert_eq!(stream.window().comments()[0].content_offset_seconds, 5.0);
    }

    #[test]
    fn page_end_triggers_exactly_one_fetch_and_replaces_wholesale() {
        let service = Arc::new(ScriptedService::new(
            vec![Ok(page(&[1.0, 2.0], Some("cur-1")))],
            vec![Ok(page(&[3.0, 4.0], Some("cur-2")))],
        ));
        let mut stream = CommentStream::new(service, "vod1");
        let t0 = Instant::now();

        stream.on_seek(0.0, t0);
        stream.tick(0.0, t0 + SEEK_DEBOUNCE);
        stream.settle();

        let outcome = stream.tick(2.5, t0 + SEEK_DEBOUNCE);
        assert_eq!(outcome.revealed.len(), 2);
        assert_eq!(stream.state(), WindowState::LoadingNextPage);
        stream.settle();
        assert_eq!(stream.state(), WindowState::Active);

        let window = stream.window();
        assert_eq!(window.comments().len(), 2);
        assert_eq!(window.comments()[0].content_offset_seconds, 3.0);
        assert_eq!(window.stopped_at(), 0);
        assert_eq!(window.cursor(), Some("cur-2"));
    }

    #[test]
    fn empty_next_page_stops_pagination() {
        let service = Arc::new(ScriptedService::new(
            vec![Ok(page(&[1.0, 2.0], Some("cur-1")))],
            vec![Ok(CommentPage::default())],
        ));
        let mut stream = CommentStream::new(service, "vod1");
        let t0 = Instant::now();

        stream.on_seek(0.0, t0);
        stream.tick(0.0, t0 + SEEK_DEBOUNCE);
        stream.settle();
        stream.tick(2.5, t0 + SEEK_DEBOUNCE);
        stream.settle();

        // Old page survives, cursor is gone, no further fetches wanted.
        assert_eq!(stream.window().comments().len(), 2);
        assert!(stream.window().cursor().is_none());
        assert!(stream.window().wants_next_page().is_none());
    }

    #[test]
    fn fetch_failure_leaves_window_untouched() {
        let service = Arc::new(ScriptedService::new(
            vec![Ok(page(&[1.0, 2.0], Some("cur-1")))],
            vec![Err(anyhow::anyhow!("connection reset"))],
        ));
        let mut stream = CommentStream::new(service, "vod1");
        let t0 = Instant::now();

        stream.on_seek(0.0, t0);
        stream.tick(0.0, t0 + SEEK_DEBOUNCE);
        stream.settle();
        stream.tick(2.5, t0 + SEEK_DEBOUNCE);
        let outcome = stream.settle();

        assert!(outcome
            .notices
            .iter()
            .any(|n| n.contains("connection reset")));
        assert_eq!(stream.window().comments().len(), 2);
        assert_eq!(stream.state(), WindowState::Active);
    }

    #[test]
    fn forward_jump_inside_window_rewinds_and_clears() {
        let service = Arc::new(ScriptedService::new(
            vec![Ok(page(&[10.0, 11.0, 25.0], None))],
            vec![],
        ));
        let mut stream = CommentStream::new(service, "vod1");
        let t0 = Instant::now();

        stream.on_seek(10.0, t0);
        stream.tick(10.5, t0 + SEEK_DEBOUNCE);
        stream.settle();
        stream.tick(11.5, t0 + SEEK_DEBOUNCE);

        // Jump to 20: still inside the window, but the next unrevealed
        // comment (25) sits 5s ahead, so the reveal cursor rewinds.
        let outcome = stream.tick(20.0, t0 + SEEK_DEBOUNCE);
        assert!(outcome.cleared);
        // Rewound to 0, everything up to 20 replays in one batch.
        assert_eq!(outcome.revealed.len(), 2);
    }
}
