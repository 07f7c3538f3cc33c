use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::Deserialize;

use crate::api::{EmoteSnapshot, RawEmote};

pub const BASE_BTTV_EMOTE_API: &str = "https://api.betterttv.net/3";
pub const BASE_FFZ_EMOTE_API: &str = "https://api.frankerfacez.com/v1";
pub const BASE_7TV_EMOTE_API: &str = "https://7tv.io/v3";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

/// Client for the three public emote provider APIs, used when the archive
/// has no per-VOD emote snapshot.
pub struct Client {
    http: HttpClient,
    user_agent: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("emote provider client user agent required");
        }
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
        })
    }

    pub fn bttv_global(&self) -> Result<Vec<RawEmote>> {
        let emotes: Vec<BttvEmote> =
            self.get_json(&format!("{BASE_BTTV_EMOTE_API}/cached/emotes/global"))?;
        Ok(emotes.into_iter().map(BttvEmote::into_raw).collect())
    }

    pub fn bttv_channel(&self, twitch_id: &str) -> Result<Vec<RawEmote>> {
        let user: BttvUser = self.get_json(&format!(
            "{BASE_BTTV_EMOTE_API}/cached/users/twitch/{twitch_id}"
        ))?;
        Ok(user
            .shared_emotes
            .into_iter()
            .chain(user.channel_emotes)
            .map(BttvEmote::into_raw)
            .collect())
    }

    pub fn ffz_channel(&self, twitch_id: &str) -> Result<Vec<RawEmote>> {
        let room: FfzRoom = self.get_json(&format!("{BASE_FFZ_EMOTE_API}/room/id/{twitch_id}"))?;
        let set_id = room.room.set.to_string();
        let Some(set) = room.sets.get(&set_id) else {
            bail!("ffz: room set {set_id} missing from response");
        };
        Ok(set
            .emoticons
            .iter()
            .map(|emote| RawEmote {
                id: emote.id.to_string(),
                name: Some(emote.name.clone()),
                code: None,
            })
            .collect())
    }

    pub fn seventv_channel(&self, twitch_id: &str) -> Result<Vec<RawEmote>> {
        let user: SevenTvUser =
            self.get_json(&format!("{BASE_7TV_EMOTE_API}/users/twitch/{twitch_id}"))?;
        Ok(user
            .emote_set
            .map(|set| set.emotes)
            .unwrap_or_default()
            .into_iter()
            .map(SevenTvEmote::into_raw)
            .collect())
    }

    pub fn seventv_global(&self) -> Result<Vec<RawEmote>> {
        let set: SevenTvEmoteSet =
            self.get_json(&format!("{BASE_7TV_EMOTE_API}/emote-sets/global"))?;
        Ok(set.emotes.into_iter().map(SevenTvEmote::into_raw).collect())
    }

    /// Builds a snapshot-shaped catalog from the live provider APIs.
    /// Individual provider failures leave that provider's list empty; chat
    /// replay degrades to fewer third-party emotes rather than failing.
    pub fn assemble_fallback(&self, twitch_id: &str) -> EmoteSnapshot {
        let mut snapshot = EmoteSnapshot::default();

        if let Ok(mut emotes) = self.bttv_global() {
            if let Ok(channel) = self.bttv_channel(twitch_id) {
                emotes.extend(channel);
            }
            snapshot.bttv = emotes;
        }
        if let Ok(emotes) = self.ffz_channel(twitch_id) {
            snapshot.ffz = emotes;
        }
        if let Ok(emotes) = self.seventv_channel(twitch_id) {
            snapshot.seventv = emotes;
        }
        if let Ok(global) = self.seventv_global() {
            snapshot.seventv.extend(global);
        }

        snapshot
    }

    fn get_json<T>(&self, url: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()?;
        if !resp.status().is_success() {
            bail!("emote provider: {} returned {}", url, resp.status());
        }
        Ok(resp.json()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BttvEmote {
    id: String,
    code: String,
}

impl BttvEmote {
    fn into_raw(self) -> RawEmote {
        RawEmote {
            id: self.id,
            name: None,
            code: Some(self.code),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BttvUser {
    #[serde(default, rename = "channelEmotes")]
    channel_emotes: Vec<BttvEmote>,
    #[serde(default, rename = "sharedEmotes")]
    shared_emotes: Vec<BttvEmote>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfzRoom {
    room: FfzRoomInfo,
    #[serde(default)]
    sets: std::collections::HashMap<String, FfzSet>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfzRoomInfo {
    set: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct FfzSet {
    #[serde(default)]
    emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfzEmote {
    id: i64,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SevenTvUser {
    #[serde(default)]
    emote_set: Option<SevenTvEmoteSet>,
}

#[derive(Debug, Clone, Deserialize)]
struct SevenTvEmoteSet {
    #[serde(default)]
    emotes: Vec<SevenTvEmote>,
}

#[derive(Debug, Clone, Deserialize)]
struct SevenTvEmote {
    id: String,
    name: String,
}

impl SevenTvEmote {
    fn into_raw(self) -> RawEmote {
        RawEmote {
            id: self.id,
            name: Some(self.name),
            code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffz_room_set_resolution() {
        let payload = r#"{
            "room": {"set": 341402},
            "sets": {"341402": {"emoticons": [{"id": 720507, "name": "pokeD"}]}}
        }"#;
        let room: FfzRoom = serde_json::from_str(payload).unwrap();
        let set = room.sets.get(&room.room.set.to_string()).unwrap();
        assert_eq!(set.emoticons[0].name, "pokeD");
    }

    #[test]
    fn bttv_user_merges_shared_and_channel() {
        let payload = r#"{
            "channelEmotes": [{"id": "c1", "code": "chanEmote"}],
            "sharedEmotes": [{"id": "s1", "code": "sharedEmote"}]
        }"#;
        let user: BttvUser = serde_json::from_str(payload).unwrap();
        let raw: Vec<RawEmote> = user
            .shared_emotes
            .into_iter()
            .chain(user.channel_emotes)
            .map(BttvEmote::into_raw)
            .collect();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].code.as_deref(), Some("sharedEmote"));
    }

    #[test]
    fn seventv_user_without_emote_set_is_empty() {
        let user: SevenTvUser = serde_json::from_str("{}").unwrap();
        assert!(user.emote_set.is_none());
    }
}
