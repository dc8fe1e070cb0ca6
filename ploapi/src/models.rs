//! Data models for the station schedule wire format
//!
//! Schedules arrive as a JSON array of spins, each embedding its audio
//! block. Dates are ISO-8601 with millisecond precision and a numeric
//! timezone offset (`yyyy-MM-dd'T'HH:mm:ss.SSSZ`). Unknown fields are
//! ignored; missing optional fields decode as absent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Duration in milliseconds
pub type Milliseconds = i64;

/// Serde helpers for the API date format.
pub mod playola_date {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

    pub fn parse(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
        DateTime::parse_from_str(s, FORMAT)
            .or_else(|_| DateTime::parse_from_rfc3339(s))
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Same format, for optional fields.
    pub mod option {
        use super::*;

        pub fn serialize<S>(
            date: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt = Option::<String>::deserialize(deserializer)?;
            match opt {
                None => Ok(None),
                Some(s) if s.is_empty() => Ok(None),
                Some(s) => super::parse(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

/// Kind of content carried by an audio block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Song,
    CommercialBlock,
    AudioImage,
    VoiceTrack,
    /// Anything the server may add later
    #[serde(other)]
    #[default]
    Other,
}

/// Immutable content descriptor played by a spin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioBlock {
    pub id: String,
    pub title: String,
    pub artist: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: BlockKind,

    /// Total length of the audio file
    #[serde(rename = "durationMS")]
    pub duration_ms: Milliseconds,

    /// Moment the next item may begin; defines the scheduling length
    #[serde(rename = "endOfMessageMS")]
    pub end_of_message_ms: Milliseconds,

    /// Informational for UIs; the scheduler does not use it
    #[serde(rename = "beginningOfOutroMS", default)]
    pub beginning_of_outro_ms: Milliseconds,

    /// Informational for UIs; the scheduler does not use it
    #[serde(rename = "endOfIntroMS", default)]
    pub end_of_intro_ms: Milliseconds,

    /// Informational for UIs; the scheduler does not use it
    #[serde(rename = "lengthOfOutroMS", default)]
    pub length_of_outro_ms: Milliseconds,

    pub download_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Volume automation set-point inside a spin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fade {
    /// Offset from the spin airtime
    #[serde(rename = "atMS")]
    pub at_ms: Milliseconds,

    /// Target volume in [0, 1]
    pub to_volume: f32,
}

/// Free-form text attached to a spin (lyrics, promos); UI material only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedText {
    pub title: String,
    pub body: String,
}

/// One scheduled broadcast of an audio block at a specific instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spin {
    pub id: String,
    pub station_id: String,

    #[serde(with = "playola_date")]
    pub airtime: DateTime<Utc>,

    #[serde(default = "default_starting_volume")]
    pub starting_volume: f32,

    pub audio_block: AudioBlock,

    /// Volume automation, ordered by `at_ms` ascending
    #[serde(default)]
    pub fades: Vec<Fade>,

    #[serde(
        default,
        with = "playola_date::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(
        default,
        with = "playola_date::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_texts: Vec<RelatedText>,
}

fn default_starting_volume() -> f32 {
    1.0
}

impl Spin {
    /// Earliest instant the next item may begin.
    ///
    /// Exact to the millisecond: `airtime + end_of_message_ms`.
    pub fn endtime(&self) -> DateTime<Utc> {
        self.airtime + Duration::milliseconds(self.audio_block.end_of_message_ms)
    }

    /// Airtime through the historical-offset view transformation.
    pub fn airtime_shifted(&self, offset: Duration) -> DateTime<Utc> {
        self.airtime - offset
    }

    /// Endtime through the historical-offset view transformation.
    pub fn endtime_shifted(&self, offset: Duration) -> DateTime<Utc> {
        self.endtime() - offset
    }

    /// A spin is airing at `t` iff `airtime <= t < endtime` (start
    /// inclusive, end exclusive).
    pub fn is_airing(&self, t: DateTime<Utc>) -> bool {
        self.is_airing_shifted(t, Duration::zero())
    }

    /// Airing test through the historical-offset view.
    pub fn is_airing_shifted(&self, t: DateTime<Utc>, offset: Duration) -> bool {
        self.airtime_shifted(offset) <= t && t < self.endtime_shifted(offset)
    }

    /// Fades sorted by offset ascending, as the automation consumes them.
    pub fn sorted_fades(&self) -> Vec<Fade> {
        let mut fades = self.fades.clone();
        fades.sort_by_key(|f| f.at_ms);
        fades
    }
}

/// Per-station schedule snapshot
#[derive(Debug, Clone)]
pub struct Schedule {
    pub station_id: String,
    /// Sorted by airtime ascending (id as secondary key)
    pub spins: Vec<Spin>,
    pub fetched_at: DateTime<Utc>,
}

impl Schedule {
    /// Builds a snapshot, normalizing spin and fade ordering.
    pub fn new(station_id: String, mut spins: Vec<Spin>, fetched_at: DateTime<Utc>) -> Self {
        spins.sort_by(|a, b| a.airtime.cmp(&b.airtime).then_with(|| a.id.cmp(&b.id)));
        Self {
            station_id,
            spins,
            fetched_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spins.is_empty()
    }

    /// Spins still relevant at `t`: everything whose shifted endtime is
    /// after `t`, ascending by shifted airtime.
    pub fn current(&self, t: DateTime<Utc>, offset: Duration) -> Vec<&Spin> {
        self.spins
            .iter()
            .filter(|s| s.endtime_shifted(offset) > t)
            .collect()
    }

    /// The spin airing at `t`, if any.
    ///
    /// Overlapping spins tie-break by latest shifted airtime (most
    /// recently started wins), then by largest id, so the choice is
    /// deterministic.
    pub fn now_playing(&self, t: DateTime<Utc>, offset: Duration) -> Option<&Spin> {
        self.spins
            .iter()
            .filter(|s| s.is_airing_shifted(t, offset))
            .max_by(|a, b| {
                a.airtime_shifted(offset)
                    .cmp(&b.airtime_shifted(offset))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}
