use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::api;
use crate::config;
use crate::data::{
    self, BadgeService, CommentService, EmoteService, VodService,
};
use crate::emotes::EmoteIndex;
use crate::media;
use crate::player::{LaunchOptions, ManualPlayer, MpvPlayer, Player};
use crate::providers;
use crate::render::RenderOptions;
use crate::storage;
use crate::supervisor::{Options as SupervisorOptions, Supervisor};
use crate::timeline::{self, PartLayout, Timeline};
use crate::ui;

pub struct RunOptions {
    pub vod_id: Option<String>,
    /// Optional local recording to play instead of a mirror.
    pub local_file: Option<PathBuf>,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let Some(vod_id) = opts.vod_id else {
        bail!("usage: vodchat <vod-id> [local-file]  (use `vodchat demo` for an offline demo)");
    };

    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
    let prefs = store.load_chat_prefs().unwrap_or_default();

    if vod_id == "demo" {
        return run_demo(cfg, store, prefs);
    }

    let archive = Arc::new(
        api::Client::new(api::ClientConfig {
            user_agent: cfg.api.user_agent.clone(),
            base_url: Some(cfg.api.base_url.clone()),
            http_client: None,
        })
        .context("build archive client")?,
    );
    let provider_client = Arc::new(
        providers::Client::new(providers::ClientConfig {
            user_agent: cfg.api.user_agent.clone(),
            http_client: None,
        })
        .context("build emote provider client")?,
    );

    let vod_service = data::ArchiveVodService::new(archive.clone());
    let comment_service: Arc<dyn CommentService> =
        Arc::new(data::ArchiveCommentService::new(archive.clone()));
    let badge_service = data::ArchiveBadgeService::new(archive.clone());
    let emote_service = data::ArchiveEmoteService::new(archive.clone(), provider_client);

    let vod = vod_service.load_vod(&vod_id).context("load vod")?;

    // Chat degrades without badges or third-party emotes; it never blocks
    // playback.
    let badges = badge_service.load_badges().unwrap_or_default();
    let snapshot = emote_service
        .load_emotes(&vod_id, &cfg.api.twitch_id)
        .unwrap_or_default();
    let emotes = EmoteIndex::build(&snapshot);

    let (timeline, targets) = plan_playback(&vod, &cfg, opts.local_file)?;

    let media_manager = media::Manager::new(
        store.clone(),
        media::Config {
            cache_dir: cfg.media.cache_dir.clone(),
            max_size_bytes: cfg.media.max_size_bytes,
            default_ttl: cfg.media.default_ttl,
            workers: cfg.media.workers,
            http_client: None,
        },
    )
    .ok();
    let media_handle = media_manager.as_ref().map(|manager| manager.handle());

    let title = format!("{} — {}", cfg.api.channel, vod.title);
    let player = Arc::new(
        MpvPlayer::launch(LaunchOptions {
            mpv_path: &cfg.player.mpv_path,
            targets: &targets,
            title: &title,
            start_secs: 0.0,
            extra_args: &cfg.player.extra_args,
        })
        .context("launch mpv")?,
    );

    let supervisor = Supervisor::spawn(SupervisorOptions {
        player: player.clone(),
        player_events: player.events(),
        comments: comment_service,
        vod_id: vod_id.clone(),
        timeline,
        emotes,
        badges,
        render: RenderOptions {
            show_timestamp: prefs.show_timestamp,
            alternate_bg: prefs.alternate_bg,
        },
        user_delay_secs: prefs.user_delay_secs,
        initial_part: 1,
        media: media_handle,
    });

    let mut model = ui::Model::new(ui::Options {
        status_message: format!("Replaying {vod_id} — space toggles playback."),
        channel: cfg.api.channel.clone(),
        vod,
        supervisor,
        controls: Some(player.clone()),
        store,
        prefs,
        share_base_url: cfg.api.share_base_url.clone(),
    });
    model.run()?;

    drop(model);
    drop(media_manager);

    Ok(())
}

/// Builds the part timeline and the mpv playlist for a VOD: a local file
/// when one is given, otherwise the archived YouTube mirror (preferring the
/// live cut when both exist).
fn plan_playback(
    vod: &api::Vod,
    cfg: &config::Config,
    local_file: Option<PathBuf>,
) -> Result<(Timeline, Vec<String>)> {
    if let Some(file) = local_file {
        if !file.exists() {
            bail!("local file {} does not exist", file.display());
        }
        // A single recording covering the whole VOD; chat is assumed to be
        // aligned and any residual drift is handled with the user delay.
        return Ok((
            Timeline::single_part(0.0),
            vec![file.to_string_lossy().to_string()],
        ));
    }

    let cut = if vod.youtube.iter().any(|part| part.kind == "live") {
        "live"
    } else {
        "vod"
    };
    let parts: Vec<&api::YoutubePart> = vod
        .youtube
        .iter()
        .filter(|part| part.kind == cut)
        .collect();

    if parts.is_empty() {
        if !vod.games.is_empty() {
            // Game-chapter captures carry absolute start offsets.
            let starts = vod.games.iter().map(|game| game.start_time).collect();
            let targets = vod
                .games
                .iter()
                .map(|game| format!("https://www.youtube.com/watch?v={}", game.game_id))
                .collect();
            return Ok((
                Timeline::new(
                    PartLayout::Anchored(starts),
                    0.0,
                    cfg.timeline.default_part_secs,
                ),
                targets,
            ));
        }
        bail!("vod {} has no playable mirror; pass a local file", vod.id);
    }

    let durations: Vec<Option<f64>> = parts.iter().map(|part| part.duration).collect();
    let vod_duration = timeline::parse_hms(&vod.duration).unwrap_or(0.0);
    let fixed_delay =
        timeline::fixed_delay_secs(vod_duration, &durations, cfg.timeline.default_part_secs);
    let targets = parts
        .iter()
        .map(|part| format!("https://www.youtube.com/watch?v={}", part.id))
        .collect();

    Ok((
        Timeline::new(
            PartLayout::Sequential(durations),
            fixed_delay,
            cfg.timeline.default_part_secs,
        ),
        targets,
    ))
}

/// Offline demo: a scripted player advancing on a timer against the mock
/// services, so the replay pipeline can be exercised without network or mpv.
fn run_demo(
    cfg: config::Config,
    store: Arc<storage::Store>,
    prefs: storage::ChatPrefs,
) -> Result<()> {
    let player = ManualPlayer::default();
    let driver = player.clone();
    thread::spawn(move || loop {
        thread::sleep(Duration::from_millis(250));
        if let (Ok(false), Ok(position)) = (driver.is_paused(), driver.position_secs()) {
            driver.set_position(position + 0.25);
        }
    });

    let vod = api::Vod {
        id: "demo".into(),
        title: "Offline demo".into(),
        duration: "01:00:00".into(),
        youtube: Vec::new(),
        games: Vec::new(),
        chapters: Vec::new(),
        drive: Vec::new(),
    };

    let supervisor = Supervisor::spawn(SupervisorOptions {
        player: Arc::new(player.clone()),
        player_events: player.events(),
        comments: Arc::new(data::MockCommentService),
        vod_id: "demo".into(),
        timeline: Timeline::single_part(0.0),
        emotes: EmoteIndex::build(
            &data::MockEmoteService
                .load_emotes("demo", &cfg.api.twitch_id)
                .unwrap_or_default(),
        ),
        badges: data::MockBadgeService.load_badges().unwrap_or_default(),
        render: RenderOptions {
            show_timestamp: prefs.show_timestamp,
            alternate_bg: prefs.alternate_bg,
        },
        user_delay_secs: prefs.user_delay_secs,
        initial_part: 1,
        media: None,
    });

    player.play();

    let mut model = ui::Model::new(ui::Options {
        status_message: "Offline demo — sample chat replays against a scripted player.".into(),
        channel: cfg.api.channel.clone(),
        vod,
        supervisor,
        controls: None,
        store,
        prefs,
        share_base_url: cfg.api.share_base_url.clone(),
    });
    model.run()
}
