use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api;
use crate::providers;

pub trait VodService: Send + Sync {
    fn load_vod(&self, vod_id: &str) -> Result<api::Vod>;
}

pub trait CommentService: Send + Sync {
    /// First page at or after an absolute offset.
    fn page_at(&self, vod_id: &str, offset_secs: f64) -> Result<api::CommentPage>;
    /// Follow-up page keyed by cursor.
    fn page_after(&self, vod_id: &str, cursor: &str) -> Result<api::CommentPage>;
}

pub trait BadgeService: Send + Sync {
    fn load_badges(&self) -> Result<api::BadgeCatalog>;
}

pub trait EmoteService: Send + Sync {
    fn load_emotes(&self, vod_id: &str, twitch_id: &str) -> Result<api::EmoteSnapshot>;
}

pub struct ArchiveVodService {
    client: Arc<api::Client>,
}

impl ArchiveVodService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl VodService for ArchiveVodService {
    fn load_vod(&self, vod_id: &str) -> Result<api::Vod> {
        self.client.vod(vod_id).context("fetch vod metadata")
    }
}

pub struct ArchiveCommentService {
    client: Arc<api::Client>,
}

impl ArchiveCommentService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl CommentService for ArchiveCommentService {
    fn page_at(&self, vod_id: &str, offset_secs: f64) -> Result<api::CommentPage> {
        self.client
            .comments_at(vod_id, offset_secs)
            .context("fetch comment page by offset")
    }

    fn page_after(&self, vod_id: &str, cursor: &str) -> Result<api::CommentPage> {
        self.client
            .comments_after(vod_id, cursor)
            .context("fetch comment page by cursor")
    }
}

pub struct ArchiveBadgeService {
    client: Arc<api::Client>,
}

impl ArchiveBadgeService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl BadgeService for ArchiveBadgeService {
    fn load_badges(&self) -> Result<api::BadgeCatalog> {
        self.client.badges().context("fetch badge catalog")
    }
}

/// Prefers the archive's per-VOD snapshot and falls back to the live
/// provider APIs when none exists. The 7TV global set is appended either
/// way; snapshots never include it.
pub struct ArchiveEmoteService {
    archive: Arc<api::Client>,
    providers: Arc<providers::Client>,
}

impl ArchiveEmoteService {
    pub fn new(archive: Arc<api::Client>, providers: Arc<providers::Client>) -> Self {
        Self { archive, providers }
    }
}

impl EmoteService for ArchiveEmoteService {
    fn load_emotes(&self, vod_id: &str, twitch_id: &str) -> Result<api::EmoteSnapshot> {
        match self.archive.emote_snapshot(vod_id) {
            Ok(Some(mut snapshot)) => {
                if let Ok(global) = self.providers.seventv_global() {
                    snapshot.seventv.extend(global);
                }
                Ok(snapshot)
            }
            Ok(None) | Err(_) => Ok(self.providers.assemble_fallback(twitch_id)),
        }
    }
}

#[derive(Default)]
pub struct MockCommentService;

impl CommentService for MockCommentService {
    fn page_at(&self, _vod_id: &str, offset_secs: f64) -> Result<api::CommentPage> {
        let comments = (0..5)
            .map(|i| api::Comment {
                id: format!("mock-{i}"),
                content_offset_seconds: offset_secs + (i as f64) * 2.0,
                display_name: "vodchat".into(),
                user_color: Some("#e5e7eb".into()),
                user_badges: Vec::new(),
                message: vec![api::Fragment::Text {
                    text: format!("sample message {i}"),
                }],
            })
            .collect();
        Ok(api::CommentPage {
            comments,
            cursor: None,
        })
    }

    fn page_after(&self, _vod_id: &str, _cursor: &str) -> Result<api::CommentPage> {
        Ok(api::CommentPage::default())
    }
}

#[derive(Default)]
pub struct MockBadgeService;

impl BadgeService for MockBadgeService {
    fn load_badges(&self) -> Result<api::BadgeCatalog> {
        Ok(api::BadgeCatalog::default())
    }
}

#[derive(Default)]
pub struct MockEmoteService;

impl EmoteService for MockEmoteService {
    fn load_emotes(&self, _vod_id: &str, _twitch_id: &str) -> Result<api::EmoteSnapshot> {
        Ok(api::EmoteSnapshot::default())
    }
}
