use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tabsync_core::{
    parse_timestamp, EntryRecord, EventRecord, OddsHistory, ScheduleSnapshot, SyncError,
};

/// Keys owned by the merge engine; a feed entry carrying any of them would shadow merged state.
const RESERVED_ENTRY_KEYS: [&str; 5] = [
    "odds",
    "results_plc",
    "results_distance",
    "results_rank",
    "results_favouritism",
];

/// Builds the day's canonical records from a schedule snapshot.
///
/// Every event starts unfinalized with empty odds histories and `now` as its capture
/// stamp. Any structural problem fails the whole call; a partial schedule is never
/// returned.
pub fn normalize(
    schedule: &ScheduleSnapshot,
    now: NaiveDateTime,
) -> Result<BTreeMap<String, EventRecord>, SyncError> {
    let mut records = BTreeMap::new();

    for meeting in &schedule.meetings {
        for event in &meeting.races {
            let event_id = event.id.trim();
            if event_id.is_empty() {
                return Err(SyncError::MalformedFeedData(format!(
                    "meeting {} race {} has an empty id",
                    meeting.code, event.number
                )));
            }
            let norm_time = parse_timestamp(&event.norm_time).map_err(|err| {
                SyncError::MalformedFeedData(format!("event {event_id}: {err}"))
            })?;

            let mut entries = BTreeMap::new();
            for entry in &event.entries {
                let mut fields = entry.fields.clone();
                for key in RESERVED_ENTRY_KEYS {
                    fields.remove(key);
                }
                let record = EntryRecord {
                    number: entry.number,
                    scratched: entry.scratched,
                    results_plc: false,
                    results_distance: None,
                    results_rank: None,
                    results_favouritism: None,
                    odds: OddsHistory::new(),
                    fields,
                };
                if entries.insert(record.key(), record).is_some() {
                    return Err(SyncError::MalformedFeedData(format!(
                        "event {event_id} lists entry {} twice",
                        entry.number
                    )));
                }
            }

            let record = EventRecord {
                event_id: event_id.to_string(),
                meeting_name: meeting.name.clone(),
                meeting_number: meeting.number,
                meeting_code: meeting.code.clone(),
                event_name: event.name.clone(),
                event_number: event.number,
                norm_time,
                length: event.length,
                venue: event.track.clone(),
                weather: event.weather.clone(),
                results_finalized: false,
                time_schedule_pulled: now,
                entries,
            };
            if records.insert(event_id.to_string(), record).is_some() {
                return Err(SyncError::MalformedFeedData(format!(
                    "event id {event_id} appears twice in the schedule"
                )));
            }
        }
    }

    Ok(records)
}
