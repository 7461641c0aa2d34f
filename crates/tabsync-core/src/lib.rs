//! Core domain model for tabsync: feed snapshots, per-event records and the error taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "tabsync-core";

/// Wall-clock format used for `norm_time`, capture stamps and odds history keys.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Date format reported by the schedule endpoint.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("malformed feed data: {0}")]
    MalformedFeedData(String),
    #[error("unknown event {event_id}")]
    UnknownEvent { event_id: String },
    #[error("unknown entry {entry_number} in event {event_id}")]
    UnknownEntry {
        event_id: String,
        entry_number: String,
    },
}

impl SyncError {
    /// Per-item consistency faults are reported and skipped; everything else aborts a cycle.
    pub fn is_item_fault(&self) -> bool {
        matches!(self, Self::UnknownEvent { .. } | Self::UnknownEntry { .. })
    }
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, SyncError> {
    NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT)
        .map_err(|e| SyncError::MalformedFeedData(format!("bad timestamp {value:?}: {e}")))
}

/// Serde adapter keeping timestamps in the persisted `YYYY-MM-DD HH:MM:SS` shape.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Name of one day's collection: an underscore followed by the 8-digit date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKey(String);

impl CollectionKey {
    pub fn for_date(date: NaiveDate) -> Self {
        Self(format!("_{}", date.format("%Y%m%d")))
    }

    /// Builds the key from the schedule endpoint's `date` field (`YYYY-MM-DD`).
    pub fn from_feed_date(date: &str) -> Result<Self, SyncError> {
        let parsed = NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
            .map_err(|e| SyncError::MalformedFeedData(format!("bad schedule date {date:?}: {e}")))?;
        Ok(Self::for_date(parsed))
    }

    /// Accepts an existing collection name; anything not shaped `_YYYYMMDD` is rejected.
    pub fn parse(name: &str) -> Option<Self> {
        let digits = name.strip_prefix('_')?;
        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDate::parse_from_str(digits, "%Y%m%d").ok()?;
        Some(Self(name.to_string()))
    }

    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.0.trim_start_matches('_'), "%Y%m%d").ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn decode<T: DeserializeOwned>(what: &str, value: JsonValue) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::MalformedFeedData(format!("{what}: {e}")))
}

fn non_empty(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ---- schedule ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub date: String,
    pub meetings: Vec<ScheduleMeeting>,
}

impl ScheduleSnapshot {
    pub fn from_json(value: JsonValue) -> Result<Self, SyncError> {
        decode("schedule snapshot", value)
    }

    pub fn collection_key(&self) -> Result<CollectionKey, SyncError> {
        CollectionKey::from_feed_date(&self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMeeting {
    pub name: String,
    pub number: u32,
    pub code: String,
    pub races: Vec<ScheduleEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub id: String,
    pub name: String,
    pub number: u32,
    pub norm_time: String,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    pub entries: Vec<ScheduleEntry>,
}

/// A runner as listed by the schedule. Fields beyond the number and scratched flag
/// are carried through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub number: u32,
    #[serde(default)]
    pub scratched: bool,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

// ---- odds ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub meetings: Vec<OddsMeeting>,
}

impl OddsSnapshot {
    pub fn from_json(value: JsonValue) -> Result<Self, SyncError> {
        decode("odds snapshot", value)
    }

    pub fn events(&self) -> impl Iterator<Item = &OddsEvent> {
        self.meetings.iter().flat_map(|m| m.races.iter())
    }

    pub fn find_event(&self, event_id: &str) -> Option<&OddsEvent> {
        self.events().find(|e| e.event_id() == Some(event_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsMeeting {
    #[serde(default)]
    pub races: Vec<OddsEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub entries: Vec<OddsEntry>,
}

impl OddsEvent {
    pub fn event_id(&self) -> Option<&str> {
        non_empty(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsEntry {
    pub number: u32,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl OddsEntry {
    /// The full per-entry payload as observed, number included.
    pub fn payload(&self) -> JsonValue {
        let mut map = self.fields.clone();
        map.insert("number".to_string(), JsonValue::from(self.number));
        JsonValue::Object(map)
    }
}

// ---- results ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSnapshot {
    pub meetings: Vec<ResultsMeeting>,
}

impl ResultsSnapshot {
    pub fn from_json(value: JsonValue) -> Result<Self, SyncError> {
        decode("results snapshot", value)
    }

    pub fn events(&self) -> impl Iterator<Item = &ResultsEvent> {
        self.meetings.iter().flat_map(|m| m.races.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsMeeting {
    #[serde(default)]
    pub races: Vec<ResultsEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub placings: Vec<Placing>,
    #[serde(default)]
    pub also_ran: Vec<AlsoRan>,
}

impl ResultsEvent {
    pub fn event_id(&self) -> Option<&str> {
        non_empty(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placing {
    pub number: u32,
    #[serde(default)]
    pub distance: JsonValue,
    #[serde(default)]
    pub favouritism: Option<u32>,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlsoRan {
    pub number: u32,
    #[serde(default)]
    pub distance: JsonValue,
    pub finish_position: u32,
}

// ---- persisted records ----

/// Capture timestamp (`YYYY-MM-DD HH:MM:SS`) to the odds payload seen at that instant.
pub type OddsHistory = BTreeMap<String, JsonValue>;

/// One event's document for a day. Identity fields never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "_id")]
    pub event_id: String,
    pub meeting_name: String,
    pub meeting_number: u32,
    pub meeting_code: String,
    #[serde(rename = "race_name")]
    pub event_name: String,
    #[serde(rename = "race_number")]
    pub event_number: u32,
    #[serde(with = "timestamp")]
    pub norm_time: NaiveDateTime,
    #[serde(rename = "race_length", default)]
    pub length: Option<u32>,
    #[serde(rename = "race_track", default)]
    pub venue: Option<String>,
    #[serde(rename = "race_weather", default)]
    pub weather: Option<String>,
    #[serde(alias = "got_results", default)]
    pub results_finalized: bool,
    #[serde(with = "timestamp")]
    pub time_schedule_pulled: NaiveDateTime,
    #[serde(default)]
    pub entries: BTreeMap<String, EntryRecord>,
}

/// One runner inside an event document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub number: u32,
    #[serde(default)]
    pub scratched: bool,
    #[serde(default)]
    pub results_plc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_distance: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_favouritism: Option<u32>,
    #[serde(default)]
    pub odds: OddsHistory,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl EntryRecord {
    pub fn key(&self) -> String {
        self.number.to_string()
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(JsonValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_key_formats_and_parses() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();
        let key = CollectionKey::for_date(date);
        assert_eq!(key.as_str(), "_20241217");
        assert_eq!(CollectionKey::from_feed_date("2024-12-17").unwrap(), key);
        assert_eq!(CollectionKey::parse("_20241217"), Some(key.clone()));
        assert_eq!(key.date(), Some(date));
        assert!(CollectionKey::parse("20241217").is_none());
        assert!(CollectionKey::parse("_2024121").is_none());
        assert!(CollectionKey::parse("_20241399").is_none());
        assert!(matches!(
            CollectionKey::from_feed_date("17/12/2024"),
            Err(SyncError::MalformedFeedData(_))
        ));
    }

    #[test]
    fn schedule_missing_required_key_is_malformed() {
        let raw = json!({
            "date": "2024-12-17",
            "meetings": [{"name": "Ellerslie", "number": 1, "races": []}]
        });
        let err = ScheduleSnapshot::from_json(raw).unwrap_err();
        match err {
            SyncError::MalformedFeedData(msg) => assert!(msg.contains("code"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn schedule_entry_keeps_feed_fields_verbatim() {
        let raw = json!({
            "date": "2024-12-17",
            "meetings": [{
                "name": "Ellerslie", "number": 1, "code": "ELL",
                "races": [{
                    "id": "R1", "name": "Maiden", "number": 1,
                    "norm_time": "2024-12-17 14:00:00",
                    "entries": [{"number": 3, "name": "Fast Horse", "jockey": "J Smith", "scratched": true}]
                }]
            }]
        });
        let snapshot = ScheduleSnapshot::from_json(raw).unwrap();
        let entry = &snapshot.meetings[0].races[0].entries[0];
        assert!(entry.scratched);
        assert_eq!(entry.fields.get("jockey"), Some(&json!("J Smith")));
        assert_eq!(entry.fields.get("name"), Some(&json!("Fast Horse")));
        assert!(snapshot.meetings[0].races[0].weather.is_none());
    }

    #[test]
    fn blank_ids_read_as_absent() {
        let odds = OddsSnapshot::from_json(json!({
            "meetings": [{"races": [{"id": "", "entries": []}, {"id": "R9", "entries": []}]}]
        }))
        .unwrap();
        let ids: Vec<_> = odds.events().map(OddsEvent::event_id).collect();
        assert_eq!(ids, vec![None, Some("R9")]);
        assert!(odds.find_event("R9").is_some());
    }

    #[test]
    fn event_record_reads_legacy_got_results_documents() {
        let doc = json!({
            "_id": "R1",
            "meeting_name": "Ellerslie",
            "meeting_number": 1,
            "meeting_code": "ELL",
            "race_name": "Maiden",
            "race_number": 1,
            "norm_time": "2024-12-17 14:00:00",
            "race_length": 1200,
            "race_track": "Good4",
            "race_weather": "Fine",
            "got_results": true,
            "time_schedule_pulled": "2024-12-17 00:05:00",
            "entries": {
                "1": {
                    "number": 1, "name": "Fast Horse", "scratched": false,
                    "results_plc": true, "results_rank": 1,
                    "odds": {"2024-12-17 13:58:00": {"number": 1, "win": 2.4}}
                }
            }
        });
        let record: EventRecord = serde_json::from_value(doc).unwrap();
        assert!(record.results_finalized);
        assert_eq!(record.venue.as_deref(), Some("Good4"));
        let entry = &record.entries["1"];
        assert_eq!(entry.name(), Some("Fast Horse"));
        assert_eq!(entry.results_rank, Some(1));
        assert_eq!(entry.odds.len(), 1);
        assert!(!entry.fields.contains_key("odds"));

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["results_finalized"], json!(true));
        assert_eq!(written["norm_time"], json!("2024-12-17 14:00:00"));
        assert_eq!(written["entries"]["1"]["name"], json!("Fast Horse"));
        assert!(written["entries"]["1"].get("results_favouritism").is_none());
    }

    #[test]
    fn odds_payload_includes_number() {
        let entry: OddsEntry = serde_json::from_value(json!({"number": 4, "win": 3.1, "plc": 1.4})).unwrap();
        assert_eq!(entry.payload(), json!({"number": 4, "win": 3.1, "plc": 1.4}));
    }

    #[test]
    fn item_faults_are_distinguished_from_cycle_failures() {
        assert!(SyncError::UnknownEvent { event_id: "R1".into() }.is_item_fault());
        assert!(!SyncError::FeedUnavailable("timeout".into()).is_item_fault());
    }
}
