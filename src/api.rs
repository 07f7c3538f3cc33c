use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.vods.pokelawls.com/";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("vods client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn vod(&self, vod_id: &str) -> Result<Vod> {
        self.get_json(&format!("/vods/{vod_id}"), &[])
    }

    /// First page of comments at or after the given absolute offset.
    pub fn comments_at(&self, vod_id: &str, offset_secs: f64) -> Result<CommentPage> {
        self.get_json(
            &format!("/v1/vods/{vod_id}/comments"),
            &[(
                "content_offset_seconds".to_string(),
                format!("{}", offset_secs.max(0.0)),
            )],
        )
    }

    /// Next page of comments keyed by the opaque cursor from the last page.
    pub fn comments_after(&self, vod_id: &str, cursor: &str) -> Result<CommentPage> {
        self.get_json(
            &format!("/v1/vods/{vod_id}/comments"),
            &[("cursor".to_string(), cursor.to_string())],
        )
    }

    pub fn badges(&self) -> Result<BadgeCatalog> {
        self.get_json("/v2/badges", &[])
    }

    /// Per-VOD emote snapshot captured at archive time. `None` when the
    /// backend has no snapshot and the caller should fall back to the live
    /// provider APIs.
    pub fn emote_snapshot(&self, vod_id: &str) -> Result<Option<EmoteSnapshot>> {
        let response: EmoteSnapshotResponse = self.get_json(
            "/emotes",
            &[("vod_id".to_string(), vod_id.to_string())],
        )?;
        Ok(response.data.into_iter().next())
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(path, params)?;
        Ok(resp.json()?)
    }

    fn request(&self, path: &str, params: &[(String, String)]) -> Result<Response> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()?;

        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            match status.as_u16() {
                404 => Err(anyhow!("vods api: not found")),
                429 => Err(anyhow!("vods api: rate limited: {}", body)),
                _ => Err(anyhow!("vods api: error {}: {}", status, body)),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vod {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// `"HH:MM:SS"` as reported by the archive.
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub youtube: Vec<YoutubePart>,
    #[serde(default)]
    pub games: Vec<GameSegment>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub drive: Vec<DriveFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoutubePart {
    pub id: String,
    #[serde(default)]
    pub part: Option<u32>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// `"vod"` or `"live"`; mirrors of the same VOD can exist in both cuts.
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSegment {
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub start_time: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub end_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub start: f64,
    /// Chapter length in seconds, not an absolute end offset.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub end: f64,
}

impl Vod {
    /// Chapter covering the given absolute offset.
    pub fn chapter_at(&self, offset_secs: f64) -> Option<&Chapter> {
        self.chapters
            .iter()
            .find(|ch| offset_secs > ch.start && offset_secs < ch.start + ch.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveFile {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommentPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: String,
    pub content_offset_seconds: f64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub user_color: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_badges: Vec<BadgeRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: Vec<Fragment>,
}

/// Badge worn by the commenter; the archive emits either `_id` (old dumps)
/// or `setID` for the set identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeRef {
    #[serde(default, alias = "_id", alias = "setID")]
    pub set_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
}

/// One unit of a chat message. The wire shape is `{text, emote?, emoticon?}`
/// with the variant implied by which key is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Fragment {
    Emote { id: String, text: String },
    Emoticon { id: String, text: String },
    Text { text: String },
}

impl Fragment {
    pub fn text(&self) -> &str {
        match self {
            Fragment::Emote { text, .. }
            | Fragment::Emoticon { text, .. }
            | Fragment::Text { text } => text,
        }
    }
}

impl<'de> Deserialize<'de> for Fragment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct EmoteRef {
            #[serde(alias = "emoteID", alias = "emote_id", alias = "_id")]
            id: String,
        }

        #[derive(Deserialize)]
        struct EmoticonRef {
            #[serde(alias = "emoticon_id", alias = "_id")]
            id: String,
        }

        #[derive(Deserialize)]
        struct FragmentHelper {
            #[serde(default)]
            text: String,
            #[serde(default)]
            emote: Option<EmoteRef>,
            #[serde(default)]
            emoticon: Option<EmoticonRef>,
        }

        let helper = FragmentHelper::deserialize(deserializer)?;
        if let Some(emote) = helper.emote {
            Ok(Fragment::Emote {
                id: emote.id,
                text: helper.text,
            })
        } else if let Some(emoticon) = helper.emoticon {
            Ok(Fragment::Emoticon {
                id: emoticon.id,
                text: helper.text,
            })
        } else {
            Ok(Fragment::Text { text: helper.text })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BadgeCatalog {
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel: Vec<BadgeSet>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub global: Vec<BadgeSet>,
}

impl BadgeCatalog {
    /// Resolves a worn badge to its art, preferring the channel-specific
    /// set over the global one.
    pub fn resolve(&self, set_id: &str, version: &str) -> Option<&BadgeVersion> {
        Self::find_in(&self.channel, set_id, version)
            .or_else(|| Self::find_in(&self.global, set_id, version))
    }

    fn find_in<'a>(sets: &'a [BadgeSet], set_id: &str, version: &str) -> Option<&'a BadgeVersion> {
        sets.iter()
            .find(|set| set.set_id == set_id)?
            .versions
            .iter()
            .find(|v| v.id == version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeSet {
    pub set_id: String,
    #[serde(default)]
    pub versions: Vec<BadgeVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BadgeVersion {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub image_url_1x: String,
    #[serde(default)]
    pub image_url_2x: String,
    #[serde(default)]
    pub image_url_4x: String,
}

/// Raw per-provider emote lists as captured at archive time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmoteSnapshot {
    #[serde(default, rename = "ffz_emotes", deserialize_with = "null_as_default")]
    pub ffz: Vec<RawEmote>,
    #[serde(default, rename = "bttv_emotes", deserialize_with = "null_as_default")]
    pub bttv: Vec<RawEmote>,
    #[serde(default, rename = "7tv_emotes", deserialize_with = "null_as_default")]
    pub seventv: Vec<RawEmote>,
}

/// Provider emote as it appears on the wire; BTTV uses `code`, FFZ and 7TV
/// use `name`, FFZ ids are numeric.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawEmote {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmoteSnapshotResponse {
    #[serde(default)]
    data: Vec<EmoteSnapshot>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Int(i64),
        Float(f64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Int(n) => n.to_string(),
        StringOrNumber::Float(n) => n.to_string(),
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Float(f64),
        String(String),
    }

    Ok(match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Float(n) => n,
        NumberOrString::String(s) => s.trim().parse().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_variants_from_wire_shape() {
        let emote: Fragment =
            serde_json::from_str(r#"{"text":"pokeL","emote":{"emoteID":"e123"}}"#).unwrap();
        assert_eq!(
            emote,
            Fragment::Emote {
                id: "e123".into(),
                text: "pokeL".into()
            }
        );

        let emoticon: Fragment =
            serde_json::from_str(r#"{"text":"Kappa","emoticon":{"emoticon_id":"25"}}"#).unwrap();
        assert_eq!(
            emoticon,
            Fragment::Emoticon {
                id: "25".into(),
                text: "Kappa".into()
            }
        );

        let text: Fragment = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(text, Fragment::Text { text: "hello".into() });
    }

    #[test]
    fn badge_ref_accepts_both_set_keys() {
        let old: BadgeRef = serde_json::from_str(r#"{"_id":"moderator","version":1}"#).unwrap();
        assert_eq!(old.set_id, "moderator");
        assert_eq!(old.version, "1");

        let new: BadgeRef =
            serde_json::from_str(r#"{"setID":"subscriber","version":"12"}"#).unwrap();
        assert_eq!(new.set_id, "subscriber");
        assert_eq!(new.version, "12");
    }

    #[test]
    fn badge_catalog_prefers_channel_sets() {
        let catalog: BadgeCatalog = serde_json::from_str(
            r#"{
                "channel": [{"set_id":"subscriber","versions":[{"id":"1","image_url_1x":"chan.png"}]}],
                "global": [{"set_id":"subscriber","versions":[{"id":"1","image_url_1x":"glob.png"}]}]
            }"#,
        )
        .unwrap();
        assert_eq!(
            catalog.resolve("subscriber", "1").unwrap().image_url_1x,
            "chan.png"
        );
        assert!(catalog.resolve("subscriber", "99").is_none());
    }

    #[test]
    fn comment_tolerates_null_message() {
        let comment: Comment = serde_json::from_str(
            r#"{"id":"c1","content_offset_seconds":5.5,"display_name":"viewer","message":null}"#,
        )
        .unwrap();
        assert!(comment.message.is_empty());
        assert!(comment.user_badges.is_empty());
    }

    #[test]
    fn game_segment_parses_string_start_time() {
        let segment: GameSegment =
            serde_json::from_str(r#"{"game_id":"g1","start_time":"3600.5"}"#).unwrap();
        assert_eq!(segment.start_time, 3600.5);
    }
}
