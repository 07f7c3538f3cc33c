//! Native player abstraction. The sync core only ever sees
//! [`Player::position_secs`]/[`Player::is_paused`] plus the event stream, so
//! an mpv process, a YouTube stream through mpv's ytdl hook, or a scripted
//! test player are interchangeable.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use once_cell::sync::OnceCell;
use serde_json::json;

#[cfg(unix)]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

fn sync_debug_enabled() -> bool {
    static FLAG: OnceCell<bool> = OnceCell::new();
    *FLAG.get_or_init(|| {
        std::env::var("VODCHAT_DEBUG")
            .map(|val| {
                let trimmed = val.trim();
                !(trimmed.is_empty()
                    || trimmed.eq_ignore_ascii_case("0")
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed.eq_ignore_ascii_case("no")
                    || trimmed.eq_ignore_ascii_case("off"))
            })
            .unwrap_or(false)
    })
}

fn sync_debug_writer() -> Option<&'static Mutex<std::fs::File>> {
    static WRITER: OnceCell<Option<Mutex<std::fs::File>>> = OnceCell::new();
    WRITER
        .get_or_init(|| {
            std::env::var("VODCHAT_DEBUG_LOG").ok().and_then(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(Mutex::new)
                    .ok()
            })
        })
        .as_ref()
}

/// Env-gated diagnostics shared by the player and the drift supervisor.
pub fn debug_log(message: impl AsRef<str>) {
    if !sync_debug_enabled() {
        return;
    }
    if let Some(writer) = sync_debug_writer() {
        if let Ok(mut file) = writer.lock() {
            let _ = writeln!(file, "{}", message.as_ref());
            return;
        }
    }
    eprintln!("{}", message.as_ref());
}

/// Playback transitions the sync core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Play,
    Pause,
    Seek,
    Ended,
}

pub trait Player: Send + Sync {
    /// Seconds into the current part. Changes continuously while playing;
    /// never cache it.
    fn position_secs(&self) -> Result<f64>;
    fn is_paused(&self) -> Result<bool>;
    /// 1-based part index for multi-part playback; `None` when the player
    /// has a single source.
    fn current_part(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOptions<'a> {
    pub mpv_path: &'a str,
    /// Local file paths or URLs (YouTube URLs go through mpv's ytdl hook).
    /// More than one target becomes an mpv playlist, one entry per part.
    pub targets: &'a [String],
    pub title: &'a str,
    pub start_secs: f64,
    pub extra_args: &'a [String],
}

/// Local playback through an mpv process controlled over its JSON IPC
/// socket.
pub struct MpvPlayer {
    ipc_path: Arc<String>,
    kill_tx: Sender<()>,
    status_rx: Receiver<Result<ExitStatus>>,
    events_rx: Receiver<PlayerEvent>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MpvPlayer {
    pub fn launch(opts: LaunchOptions<'_>) -> Result<Self> {
        if opts.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(anyhow!("player target missing"));
        }
        let ipc_path =
            unique_ipc_path().ok_or_else(|| anyhow!("mpv IPC is not supported on this platform"))?;
        #[cfg(unix)]
        if let Err(err) = fs::remove_file(&ipc_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug_log(format!("failed to remove stale mpv ipc path {ipc_path}: {err}"));
            }
        }

        let (kill_tx, kill_rx) = bounded::<()>(1);
        let (status_tx, status_rx) = bounded::<Result<ExitStatus>>(1);
        let (events_tx, events_rx) = unbounded::<PlayerEvent>();

        let mut args: Vec<String> = opts.targets.to_vec();
        args.push(format!("--input-ipc-server={ipc_path}"));
        args.push(format!("--start={}", opts.start_secs.max(0.0)));
        args.push("--force-window=yes".to_string());
        args.push("--keep-open=yes".to_string());
        args.push("--really-quiet".to_string());
        args.push("--osd-level=1".to_string());
        if !opts.title.is_empty() {
            args.push(format!("--force-media-title={}", opts.title));
        }
        args.extend(opts.extra_args.iter().cloned());
        debug_log(format!("spawning mpv ipc={ipc_path} args={args:?}"));

        let mpv_path = opts.mpv_path.to_string();
        let target = opts.targets.first().cloned().unwrap_or_default();
        let ipc_for_watchers = ipc_path.clone();
        let handle = thread::spawn(move || {
            let ipc_cleanup = ipc_for_watchers.clone();
            let result = (|| -> Result<ExitStatus> {
                let mut command = Command::new(&mpv_path);
                for arg in &args {
                    command.arg(arg);
                }
                command.stdin(Stdio::null());
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());

                let mut child = command
                    .spawn()
                    .with_context(|| format!("launch mpv to play {target}"))?;

                spawn_event_observer(ipc_for_watchers.clone(), events_tx);

                loop {
                    if kill_rx.try_recv().is_ok() {
                        let _ = child.kill();
                        let status = child.wait().context("wait for mpv after stop request")?;
                        return Ok(status);
                    }
                    match child.try_wait() {
                        Ok(Some(status)) => return Ok(status),
                        Ok(None) => thread::sleep(Duration::from_millis(30)),
                        Err(err) => return Err(anyhow!(err)).context("poll mpv status"),
                    }
                }
            })();
            cleanup_ipc_path(&ipc_cleanup);
            let _ = status_tx.send(result);
        });

        Ok(Self {
            ipc_path: Arc::new(ipc_path),
            kill_tx,
            status_rx,
            events_rx,
            handle: Some(handle),
        })
    }

    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    pub fn toggle_pause(&self) -> Result<()> {
        send_command(&self.ipc_path, json!(["cycle", "pause"]))
    }

    pub fn seek_relative(&self, offset_secs: f64) -> Result<()> {
        send_command(&self.ipc_path, json!(["seek", offset_secs, "relative"]))
    }

    pub fn seek_absolute(&self, position_secs: f64) -> Result<()> {
        send_command(
            &self.ipc_path,
            json!(["seek", position_secs.max(0.0), "absolute"]),
        )
    }

    pub fn playlist_next(&self) -> Result<()> {
        send_command(&self.ipc_path, json!(["playlist-next", "weak"]))
    }

    pub fn playlist_prev(&self) -> Result<()> {
        send_command(&self.ipc_path, json!(["playlist-prev", "weak"]))
    }

    fn finalize(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Non-blocking exit probe; `Some` once mpv has quit.
    pub fn try_status(&mut self) -> Option<Result<ExitStatus>> {
        match self.status_rx.try_recv() {
            Ok(res) => {
                self.finalize();
                Some(res)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finalize();
                Some(Err(anyhow!("player session closed unexpectedly")))
            }
        }
    }

    pub fn stop_blocking(mut self) -> Option<Result<ExitStatus>> {
        let _ = self.kill_tx.send(());
        let res = self.status_rx.recv().ok();
        self.finalize();
        res
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.kill_tx.send(());
            let _ = self.status_rx.recv().ok();
            self.finalize();
        }
    }
}

impl Player for MpvPlayer {
    fn position_secs(&self) -> Result<f64> {
        let value = get_property(&self.ipc_path, "time-pos")?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    fn is_paused(&self) -> Result<bool> {
        let value = get_property(&self.ipc_path, "pause")?;
        Ok(value.as_bool().unwrap_or(true))
    }

    fn current_part(&self) -> Option<usize> {
        let value = get_property(&self.ipc_path, "playlist-pos").ok()?;
        let pos = value.as_i64()?;
        if pos < 0 {
            return None;
        }
        Some(pos as usize + 1)
    }
}

/// Reads mpv's event stream on a dedicated connection and forwards the
/// transitions the supervisor cares about. The socket appears shortly after
/// mpv starts, so connection attempts retry briefly.
fn spawn_event_observer(ipc_path: String, events_tx: Sender<PlayerEvent>) {
    thread::spawn(move || {
        let stream = match connect_with_retry(&ipc_path, 40, Duration::from_millis(100)) {
            Ok(stream) => stream,
            Err(err) => {
                debug_log(format!("mpv event observer failed to connect: {err:#}"));
                return;
            }
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let event = match payload.get("event").and_then(|e| e.as_str()) {
                Some("unpause") => Some(PlayerEvent::Play),
                Some("pause") => Some(PlayerEvent::Pause),
                Some("seek") => Some(PlayerEvent::Seek),
                Some("playback-restart") => Some(PlayerEvent::Play),
                Some("end-file") => Some(PlayerEvent::Ended),
                _ => None,
            };
            if let Some(event) = event {
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        }
        debug_log("mpv event stream closed");
    });
}

#[cfg(unix)]
fn connect_with_retry(path: &str, attempts: usize, delay: Duration) -> Result<UnixStream> {
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..attempts {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
                thread::sleep(delay);
            }
        }
    }
    let detail = last_err
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no attempts made".to_string());
    Err(anyhow!("connect to mpv IPC socket {path}: {detail}"))
}

#[cfg(not(unix))]
fn connect_with_retry(
    _path: &str,
    _attempts: usize,
    _delay: Duration,
) -> Result<std::net::TcpStream> {
    Err(anyhow!("mpv IPC is not supported on this platform"))
}

fn send_command(path: &str, command: serde_json::Value) -> Result<()> {
    let payload = json!({ "command": command });
    let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
    send_command_inner(path, &serialized)
}

#[cfg(unix)]
fn send_command_inner(path: &str, serialized: &str) -> Result<()> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .write_all(serialized.as_bytes())
        .context("write mpv IPC command")?;
    stream
        .write_all(b"\n")
        .context("write mpv IPC command terminator")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_command_inner(_path: &str, _serialized: &str) -> Result<()> {
    Err(anyhow!("mpv IPC is not supported on this platform"))
}

/// One-shot property query over its own connection; the reply is matched by
/// request id so interleaved event lines are skipped.
#[cfg(unix)]
fn get_property(path: &str, property: &str) -> Result<serde_json::Value> {
    const REQUEST_ID: i64 = 1;

    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .context("set mpv IPC read timeout")?;
    let payload = json!({
        "command": ["get_property", property],
        "request_id": REQUEST_ID,
    });
    let serialized = serde_json::to_string(&payload).context("serialize mpv property query")?;
    stream
        .write_all(serialized.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .context("write mpv property query")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .context("read mpv property reply")?;
        if read == 0 {
            return Err(anyhow!("mpv IPC socket closed during property query"));
        }
        let Ok(reply) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if reply.get("request_id").and_then(|id| id.as_i64()) != Some(REQUEST_ID) {
            continue;
        }
        let error = reply.get("error").and_then(|e| e.as_str()).unwrap_or("");
        if error != "success" {
            return Err(anyhow!("mpv property {property}: {error}"));
        }
        return Ok(reply.get("data").cloned().unwrap_or(serde_json::Value::Null));
    }
}

#[cfg(not(unix))]
fn get_property(_path: &str, _property: &str) -> Result<serde_json::Value> {
    Err(anyhow!("mpv IPC is not supported on this platform"))
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("vodchat-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(not(unix))]
fn unique_ipc_path() -> Option<String> {
    None
}

#[cfg(unix)]
fn cleanup_ipc_path(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug_log(format!("failed to remove mpv ipc path {path}: {err}"));
        }
    }
}

#[cfg(not(unix))]
fn cleanup_ipc_path(_path: &str) {}

#[derive(Debug, Default)]
struct ManualState {
    position_secs: f64,
    paused: bool,
}

/// Scripted player for tests and the offline demo: position and pause state
/// are set directly, emitting the same events a real player would.
#[derive(Clone)]
pub struct ManualPlayer {
    state: Arc<parking_lot::Mutex<ManualState>>,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
}

impl Default for ManualPlayer {
    fn default() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            state: Arc::new(parking_lot::Mutex::new(ManualState {
                position_secs: 0.0,
                paused: true,
            })),
            events_tx,
            events_rx,
        }
    }
}

impl ManualPlayer {
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    pub fn set_position(&self, position_secs: f64) {
        self.state.lock().position_secs = position_secs;
    }

    pub fn seek(&self, position_secs: f64) {
        self.set_position(position_secs);
        let _ = self.events_tx.send(PlayerEvent::Seek);
    }

    pub fn play(&self) {
        self.state.lock().paused = false;
        let _ = self.events_tx.send(PlayerEvent::Play);
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
        let _ = self.events_tx.send(PlayerEvent::Pause);
    }

    pub fn end(&self) {
        self.state.lock().paused = true;
        let _ = self.events_tx.send(PlayerEvent::Ended);
    }
}

impl Player for ManualPlayer {
    fn position_secs(&self) -> Result<f64> {
        Ok(self.state.lock().position_secs)
    }

    fn is_paused(&self) -> Result<bool> {
        Ok(self.state.lock().paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_player_reports_scripted_state() {
        let player = ManualPlayer::default();
        assert!(player.is_paused().unwrap());
        player.play();
        player.set_position(42.5);
        assert!(!player.is_paused().unwrap());
        assert_eq!(player.position_secs().unwrap(), 42.5);

        let events = player.events();
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::Play);
        player.seek(10.0);
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::Seek);
        player.end();
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::Ended);
    }

    #[cfg(unix)]
    #[test]
    fn ipc_paths_are_unique() {
        let a = unique_ipc_path().unwrap();
        let b = unique_ipc_path().unwrap();
        assert_ne!(a, b);
        assert!(a.contains("vodchat-mpv"));
    }
}
