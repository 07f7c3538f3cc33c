use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::{EmoteSnapshot, RawEmote};

pub const BASE_TWITCH_CDN: &str = "https://static-cdn.jtvnw.net";
pub const BASE_FFZ_EMOTE_CDN: &str = "https://cdn.frankerfacez.com/emote";
pub const BASE_BTTV_EMOTE_CDN: &str = "https://emotes.overpowered.tv/bttv";
pub const BASE_7TV_EMOTE_CDN: &str = "https://cdn.7tv.app/emote";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "7tv")]
    SevenTv,
    Ffz,
    Bttv,
}

/// Token resolution order; first match wins.
pub const LOOKUP_ORDER: [Provider; 3] = [Provider::SevenTv, Provider::Ffz, Provider::Bttv];

impl Provider {
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::SevenTv => "7TV",
            Provider::Ffz => "FFZ",
            Provider::Bttv => "BTTV",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteDescriptor {
    pub id: String,
    pub name: String,
    pub provider: Provider,
}

impl EmoteDescriptor {
    /// CDN image URL at the given scale (1, 2 or 4).
    pub fn image_url(&self, scale: u8) -> String {
        match self.provider {
            Provider::SevenTv => format!("{}/{}/{}x.webp", BASE_7TV_EMOTE_CDN, self.id, scale),
            Provider::Ffz => format!("{}/{}/{}", BASE_FFZ_EMOTE_CDN, self.id, scale),
            Provider::Bttv => format!("{}/{}/{}x", BASE_BTTV_EMOTE_CDN, self.id, scale),
        }
    }
}

/// Twitch-native emotes render straight from fragment data and never go
/// through the index.
pub fn twitch_emote_url(emote_id: &str, scale: &str) -> String {
    format!("{BASE_TWITCH_CDN}/emoticons/v2/{emote_id}/default/dark/{scale}")
}

/// Case-insensitive lookup tables over the provider catalogs.
///
/// Always rebuilt in full from the source lists whenever any catalog
/// changes; the tables are never patched in place.
#[derive(Debug, Clone, Default)]
pub struct EmoteIndex {
    tables: HashMap<Provider, HashMap<String, EmoteDescriptor>>,
}

impl EmoteIndex {
    pub fn build(snapshot: &EmoteSnapshot) -> Self {
        let mut index = EmoteIndex::default();
        index.insert_all(Provider::SevenTv, &snapshot.seventv);
        index.insert_all(Provider::Ffz, &snapshot.ffz);
        index.insert_all(Provider::Bttv, &snapshot.bttv);
        index
    }

    fn insert_all(&mut self, provider: Provider, emotes: &[RawEmote]) {
        let table = self.tables.entry(provider).or_default();
        for emote in emotes {
            // Both keys point at the same descriptor; providers disagree on
            // which field carries the code.
            let descriptor = EmoteDescriptor {
                id: emote.id.clone(),
                name: emote
                    .name
                    .clone()
                    .or_else(|| emote.code.clone())
                    .unwrap_or_default(),
                provider,
            };
            if let Some(name) = &emote.name {
                table.insert(name.to_lowercase(), descriptor.clone());
            }
            if let Some(code) = &emote.code {
                table.insert(code.to_lowercase(), descriptor.clone());
            }
        }
    }

    /// Resolves a whitespace-delimited token, checking providers in
    /// `LOOKUP_ORDER`.
    pub fn lookup(&self, token: &str) -> Option<&EmoteDescriptor> {
        let key = token.to_lowercase();
        LOOKUP_ORDER
            .iter()
            .find_map(|provider| self.tables.get(provider)?.get(&key))
    }

    pub fn lookup_in(&self, provider: Provider, token: &str) -> Option<&EmoteDescriptor> {
        self.tables.get(&provider)?.get(&token.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(HashMap::is_empty)
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, name: Option<&str>, code: Option<&str>) -> RawEmote {
        RawEmote {
            id: id.into(),
            name: name.map(Into::into),
            code: code.map(Into::into),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let snapshot = EmoteSnapshot {
            seventv: vec![raw("s1", Some("PagMan"), None)],
            ..EmoteSnapshot::default()
        };
        let index = EmoteIndex::build(&snapshot);
        assert_eq!(index.lookup("pagman").unwrap().id, "s1");
        assert_eq!(index.lookup("PAGMAN").unwrap().id, "s1");
        assert!(index.lookup("pagman2").is_none());
    }

    #[test]
    fn seventv_wins_over_ffz_and_bttv() {
        let snapshot = EmoteSnapshot {
            seventv: vec![raw("s1", Some("peepoHappy"), None)],
            ffz: vec![raw("f1", Some("peepoHappy"), None)],
            bttv: vec![raw("b1", None, Some("peepoHappy"))],
        };
        let index = EmoteIndex::build(&snapshot);
        let hit = index.lookup("peepohappy").unwrap();
        assert_eq!(hit.provider, Provider::SevenTv);
        assert_eq!(hit.id, "s1");
        // Lower-priority entries are still reachable directly.
        assert_eq!(index.lookup_in(Provider::Ffz, "peepoHappy").unwrap().id, "f1");
    }

    #[test]
    fn rebuild_replaces_previous_tables() {
        let first = EmoteIndex::build(&EmoteSnapshot {
            bttv: vec![raw("b1", None, Some("monkaS"))],
            ..EmoteSnapshot::default()
        });
        assert_eq!(first.len(), 1);

        let second = EmoteIndex::build(&EmoteSnapshot::default());
        assert!(second.is_empty());
        assert!(second.lookup("monkaS").is_none());
    }

    #[test]
    fn both_name_and_code_keys_resolve() {
        let snapshot = EmoteSnapshot {
            bttv: vec![RawEmote {
                id: "b9".into(),
                name: Some("catJAM".into()),
                code: Some("catJAMcode".into()),
            }],
            ..EmoteSnapshot::default()
        };
        let index = EmoteIndex::build(&snapshot);
        assert_eq!(index.lookup("catjam").unwrap().id, "b9");
        assert_eq!(index.lookup("catjamcode").unwrap().id, "b9");
    }

    #[test]
    fn cdn_urls_follow_provider_layout() {
        let seventv = EmoteDescriptor {
            id: "abc".into(),
            name: "x".into(),
            provider: Provider::SevenTv,
        };
        assert_eq!(seventv.image_url(1), "https://cdn.7tv.app/emote/abc/1x.webp");
        let ffz = EmoteDescriptor {
            id: "42".into(),
            name: "x".into(),
            provider: Provider::Ffz,
        };
        assert_eq!(ffz.image_url(4), "https://cdn.frankerfacez.com/emote/42/4");
        assert_eq!(
            twitch_emote_url("25", "1.0"),
            "https://static-cdn.jtvnw.net/emoticons/v2/25/default/dark/1.0"
        );
    }
}
