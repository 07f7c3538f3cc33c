//! Turns raw comments into renderable messages and maintains the capped
//! display buffer they accumulate into.

use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::api::{BadgeCatalog, BadgeVersion, Comment, Fragment};
use crate::color;
use crate::emotes::{twitch_emote_url, EmoteDescriptor, EmoteIndex};
use crate::timeline;

/// Display buffer capacity; oldest messages fall off the front.
pub const DISPLAY_BUFFER_CAP: usize = 200;

static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://)?([a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}(:[0-9]+)?(/[^\s]*)?$")
        .expect("url regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub show_timestamp: bool,
    pub alternate_bg: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageSpan {
    Text(String),
    Link { label: String, url: String },
    /// Twitch-native emote or emoticon, rendered straight from fragment
    /// data.
    TwitchEmote { text: String, url: String },
    ProviderEmote(EmoteDescriptor),
}

#[derive(Debug, Clone)]
pub struct ResolvedBadge {
    pub set_id: String,
    pub art: BadgeVersion,
}

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub id: String,
    pub offset_secs: f64,
    /// `HH:MM:SS` into the VOD, shown when the timestamp toggle is on.
    pub timestamp: String,
    pub show_timestamp: bool,
    pub alternate_bg: bool,
    pub display_name: String,
    /// Hex color guaranteed readable on the chat background.
    pub name_color: String,
    pub badges: Vec<ResolvedBadge>,
    pub spans: Vec<MessageSpan>,
}

/// Renders one comment against a frozen snapshot of the emote index, badge
/// catalog and display options. Comments without message fragments are
/// skipped.
pub fn render_comment(
    comment: &Comment,
    emotes: &EmoteIndex,
    badges: &BadgeCatalog,
    options: RenderOptions,
) -> Option<RenderedMessage> {
    if comment.message.is_empty() {
        return None;
    }

    let resolved_badges = comment
        .user_badges
        .iter()
        .filter_map(|badge| {
            badges
                .resolve(&badge.set_id, &badge.version)
                .map(|art| ResolvedBadge {
                    set_id: badge.set_id.clone(),
                    art: art.clone(),
                })
        })
        .collect();

    let mut spans = Vec::new();
    for fragment in &comment.message {
        match fragment {
            Fragment::Emote { id, text } | Fragment::Emoticon { id, text } => {
                spans.push(MessageSpan::TwitchEmote {
                    text: text.clone(),
                    url: twitch_emote_url(id, "1.0"),
                });
            }
            Fragment::Text { text } => render_text_fragment(text, emotes, &mut spans),
        }
    }

    Some(RenderedMessage {
        id: comment.id.clone(),
        offset_secs: comment.content_offset_seconds,
        timestamp: timeline::format_hms(comment.content_offset_seconds),
        show_timestamp: options.show_timestamp,
        alternate_bg: options.alternate_bg,
        display_name: comment.display_name.clone(),
        name_color: color::ensure_accessible_text_color(comment.user_color.as_deref()),
        badges: resolved_badges,
        spans,
    })
}

pub fn render_batch(
    comments: &[Comment],
    emotes: &EmoteIndex,
    badges: &BadgeCatalog,
    options: RenderOptions,
) -> Vec<RenderedMessage> {
    comments
        .iter()
        .filter_map(|comment| render_comment(comment, emotes, badges, options))
        .collect()
}

fn render_text_fragment(text: &str, emotes: &EmoteIndex, spans: &mut Vec<MessageSpan>) {
    let mut literal = String::new();
    for token in text.split_whitespace() {
        if let Some(descriptor) = emotes.lookup(token) {
            flush_literal(&mut literal, spans);
            spans.push(MessageSpan::ProviderEmote(descriptor.clone()));
            continue;
        }
        if URL_REGEX.is_match(token) {
            flush_literal(&mut literal, spans);
            let url = if token.starts_with("http") {
                token.to_string()
            } else {
                format!("https://{token}")
            };
            spans.push(MessageSpan::Link {
                label: token.to_string(),
                url,
            });
            continue;
        }
        if !literal.is_empty() {
            literal.push(' ');
        }
        literal.push_str(token);
    }
    flush_literal(&mut literal, spans);
}

fn flush_literal(literal: &mut String, spans: &mut Vec<MessageSpan>) {
    if !literal.is_empty() {
        spans.push(MessageSpan::Text(std::mem::take(literal)));
    }
}

/// Capped, ordered, append-only buffer of rendered messages.
#[derive(Debug, Default)]
pub struct DisplayBuffer {
    entries: VecDeque<RenderedMessage>,
    revision: u64,
}

impl DisplayBuffer {
    /// Appends a batch, trimming just enough from the front to get back
    /// under capacity. Never trims more than the batch added.
    pub fn append(&mut self, batch: Vec<RenderedMessage>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let added = batch.len();
        self.entries.extend(batch);
        let overflow = self.entries.len().saturating_sub(DISPLAY_BUFFER_CAP);
        let trim = overflow.min(added);
        self.entries.drain(..trim);
        self.revision += 1;
        trim
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.revision += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped on every mutation; lets readers skip unchanged snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &RenderedMessage> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BadgeRef, EmoteSnapshot, RawEmote};
    use crate::color::FALLBACK_TEXT_COLOR;
    use crate::emotes::Provider;

    fn comment(fragments: Vec<Fragment>) -> Comment {
        Comment {
            id: "c1".into(),
            content_offset_seconds: 63.0,
            display_name: "viewer".into(),
            user_color: Some("#000000".into()),
            user_badges: vec![BadgeRef {
                set_id: "moderator".into(),
                version: "1".into(),
            }],
            message: fragments,
        }
    }

    fn index_with(seventv: &[&str], ffz: &[&str], bttv: &[&str]) -> EmoteIndex {
        let raw = |id: &str, name: &str| RawEmote {
            id: id.into(),
            name: Some(name.into()),
            code: None,
        };
        EmoteIndex::build(&EmoteSnapshot {
            seventv: seventv.iter().map(|n| raw("s", n)).collect(),
            ffz: ffz.iter().map(|n| raw("f", n)).collect(),
            bttv: bttv.iter().map(|n| raw("b", n)).collect(),
        })
    }

    fn catalog() -> BadgeCatalog {
        serde_json::from_str(
            r#"{"channel":[{"set_id":"moderator","versions":[{"id":"1","image_url_1x":"mod.png"}]}],"global":[]}"#,
        )
        .unwrap()
    }

    fn message(n: usize) -> RenderedMessage {
        RenderedMessage {
            id: format!("m{n}"),
            offset_secs: n as f64,
            timestamp: timeline::format_hms(n as f64),
            show_timestamp: false,
            alternate_bg: false,
            display_name: "viewer".into(),
            name_color: FALLBACK_TEXT_COLOR.into(),
            badges: Vec::new(),
            spans: vec![MessageSpan::Text(format!("msg {n}"))],
        }
    }

    #[test]
    fn skips_comment_without_fragments() {
        let rendered = render_comment(
            &comment(vec![]),
            &EmoteIndex::default(),
            &BadgeCatalog::default(),
            RenderOptions::default(),
        );
        assert!(rendered.is_none());
    }

    #[test]
    fn resolves_badges_and_substitutes_name_color() {
        let rendered = render_comment(
            &comment(vec![Fragment::Text { text: "hi".into() }]),
            &EmoteIndex::default(),
            &catalog(),
            RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(rendered.badges.len(), 1);
        assert_eq!(rendered.badges[0].art.image_url_1x, "mod.png");
        // Black fails AA on the dark background.
        assert_eq!(rendered.name_color, FALLBACK_TEXT_COLOR);
        assert_eq!(rendered.timestamp, "00:01:03");
    }

    #[test]
    fn seventv_wins_when_token_matches_multiple_providers() {
        let index = index_with(&["peepoHappy"], &["peepoHappy"], &[]);
        let rendered = render_comment(
            &comment(vec![Fragment::Text {
                text: "peepoHappy".into(),
            }]),
            &index,
            &BadgeCatalog::default(),
            RenderOptions::default(),
        )
        .unwrap();
        match &rendered.spans[0] {
            MessageSpan::ProviderEmote(descriptor) => {
                assert_eq!(descriptor.provider, Provider::SevenTv)
            }
            other => panic!("expected provider emote, got {other:?}"),
        }
    }

    #[test]
    fn text_tokens_split_into_emotes_links_and_literals() {
        let index = index_with(&[], &[], &["catJAM"]);
        let rendered = render_comment(
            &comment(vec![Fragment::Text {
                text: "hello catJAM check clips.twitch.tv/abc now".into(),
            }]),
            &index,
            &BadgeCatalog::default(),
            RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(rendered.spans.len(), 4);
        assert_eq!(rendered.spans[0], MessageSpan::Text("hello".into()));
        assert!(matches!(rendered.spans[1], MessageSpan::ProviderEmote(_)));
        assert_eq!(
            rendered.spans[2],
            MessageSpan::Link {
                label: "clips.twitch.tv/abc".into(),
                url: "https://clips.twitch.tv/abc".into(),
            }
        );
        assert_eq!(rendered.spans[3], MessageSpan::Text("now".into()));
    }

    #[test]
    fn twitch_emote_fragment_renders_directly() {
        let rendered = render_comment(
            &comment(vec![Fragment::Emote {
                id: "25".into(),
                text: "Kappa".into(),
            }]),
            &EmoteIndex::default(),
            &BadgeCatalog::default(),
            RenderOptions::default(),
        )
        .unwrap();
        assert_eq!(
            rendered.spans[0],
            MessageSpan::TwitchEmote {
                text: "Kappa".into(),
                url: "https://static-cdn.jtvnw.net/emoticons/v2/25/default/dark/1.0".into(),
            }
        );
    }

    #[test]
    fn buffer_never_exceeds_cap() {
        let mut buffer = DisplayBuffer::default();
        for n in 0..450 {
            buffer.append(vec![message(n)]);
            assert!(buffer.len() <= DISPLAY_BUFFER_CAP);
        }
        assert_eq!(buffer.len(), DISPLAY_BUFFER_CAP);
        // Oldest entries were the ones evicted.
        assert_eq!(buffer.iter().next().unwrap().id, "m250");
    }

    #[test]
    fn trim_is_proportional_to_batch() {
        let mut buffer = DisplayBuffer::default();
        buffer.append((0..198).map(message).collect());
        let trimmed = buffer.append((198..203).map(message).collect());
        assert_eq!(trimmed, 3);
        assert_eq!(buffer.len(), DISPLAY_BUFFER_CAP);

        // A single oversized batch still lands within the cap.
        let mut buffer = DisplayBuffer::default();
        let trimmed = buffer.append((0..250).map(message).collect());
        assert_eq!(trimmed, 50);
        assert_eq!(buffer.len(), DISPLAY_BUFFER_CAP);
    }

    #[test]
    fn revision_tracks_mutations() {
        let mut buffer = DisplayBuffer::default();
        let r0 = buffer.revision();
        buffer.append(vec![message(1)]);
        assert!(buffer.revision() > r0);
        buffer.append(Vec::new());
        assert_eq!(buffer.revision(), r0 + 1);
        buffer.clear();
        assert_eq!(buffer.revision(), r0 + 2);
    }
}
