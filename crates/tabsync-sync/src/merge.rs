use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDateTime};
use tabsync_core::{format_timestamp, EventRecord, OddsSnapshot, ResultsSnapshot, SyncError};
use tracing::{debug, info, warn};

/// Proximity-to-start gate deciding whether an event takes an odds write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OddsWindow {
    /// Everything from `lead` before the start onwards. Used on the first pull of a day.
    Wide { lead: Duration },
    /// Only within `radius` either side of the start, edges included.
    Narrow { radius: Duration },
}

impl OddsWindow {
    pub fn wide() -> Self {
        Self::Wide {
            lead: Duration::hours(2),
        }
    }

    pub fn narrow() -> Self {
        Self::Narrow {
            radius: Duration::minutes(5),
        }
    }

    /// Bounds that fall outside the representable calendar are treated as unbounded.
    pub fn admits(&self, now: NaiveDateTime, start: NaiveDateTime) -> bool {
        let opens_by = |span| start.checked_sub_signed(span).map_or(true, |open| now >= open);
        match *self {
            Self::Wide { lead } => opens_by(lead),
            Self::Narrow { radius } => {
                opens_by(radius) && start.checked_add_signed(radius).map_or(true, |close| now <= close)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct OddsMergeOutcome {
    /// Events that received at least one odds history key.
    pub touched: BTreeSet<String>,
    pub appended: usize,
    /// Events the snapshot knows about but the stored schedule does not.
    pub unknown_event_ids: Vec<String>,
    pub faults: Vec<SyncError>,
}

impl OddsMergeOutcome {
    pub fn schedule_is_stale(&self) -> bool {
        !self.unknown_event_ids.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResultsMergeOutcome {
    pub finalized: Vec<String>,
    pub faults: Vec<SyncError>,
}

/// Appends the snapshot's odds, stamped `now`, to every eligible entry in `records`.
///
/// Finalized events, events outside `window` and scratched entries are left alone.
/// Re-applying within the same second overwrites only that second's key.
pub fn merge_odds(
    snapshot: &OddsSnapshot,
    records: &mut BTreeMap<String, EventRecord>,
    window: OddsWindow,
    now: NaiveDateTime,
) -> OddsMergeOutcome {
    let stamp = format_timestamp(now);
    let mut outcome = OddsMergeOutcome::default();

    for event in snapshot.events() {
        let Some(event_id) = event.event_id() else {
            continue;
        };
        let Some(record) = records.get_mut(event_id) else {
            info!(event_id, "odds for an event missing from the stored schedule");
            if !outcome.unknown_event_ids.iter().any(|id| id == event_id) {
                outcome.unknown_event_ids.push(event_id.to_string());
            }
            continue;
        };
        if record.results_finalized {
            continue;
        }
        if !window.admits(now, record.norm_time) {
            continue;
        }

        debug!(event_id, entries = event.entries.len(), "merging odds");
        for entry in &event.entries {
            let key = entry.number.to_string();
            match record.entries.get_mut(&key) {
                None => {
                    warn!(event_id, entry = %key, "odds for an entry the event does not list");
                    outcome.faults.push(SyncError::UnknownEntry {
                        event_id: event_id.to_string(),
                        entry_number: key,
                    });
                }
                Some(stored) if stored.scratched => {}
                Some(stored) => {
                    stored.odds.insert(stamp.clone(), entry.payload());
                    outcome.appended += 1;
                    outcome.touched.insert(event_id.to_string());
                }
            }
        }
    }

    outcome
}

/// Records placings for every event whose results have landed, exactly once per event.
pub fn merge_results(
    snapshot: &ResultsSnapshot,
    records: &mut BTreeMap<String, EventRecord>,
) -> ResultsMergeOutcome {
    let mut outcome = ResultsMergeOutcome::default();

    for event in snapshot.events() {
        let Some(event_id) = event.event_id() else {
            continue;
        };
        let Some(record) = records.get_mut(event_id) else {
            warn!(event_id, "results for an event missing from the stored schedule");
            outcome.faults.push(SyncError::UnknownEvent {
                event_id: event_id.to_string(),
            });
            continue;
        };
        if record.results_finalized || event.placings.is_empty() {
            continue;
        }

        for placed in &event.placings {
            let key = placed.number.to_string();
            let Some(entry) = record.entries.get_mut(&key) else {
                warn!(event_id, entry = %key, "placing for an entry the event does not list");
                outcome.faults.push(SyncError::UnknownEntry {
                    event_id: event_id.to_string(),
                    entry_number: key,
                });
                continue;
            };
            if entry.results_plc {
                continue;
            }
            entry.results_distance = Some(placed.distance.clone());
            entry.results_favouritism = placed.favouritism;
            entry.results_rank = Some(placed.rank);
            entry.results_plc = true;
        }

        for also_ran in &event.also_ran {
            let key = also_ran.number.to_string();
            let Some(entry) = record.entries.get_mut(&key) else {
                warn!(event_id, entry = %key, "also-ran for an entry the event does not list");
                outcome.faults.push(SyncError::UnknownEntry {
                    event_id: event_id.to_string(),
                    entry_number: key,
                });
                continue;
            };
            if entry.results_plc {
                continue;
            }
            entry.results_distance = Some(also_ran.distance.clone());
            entry.results_rank = Some(also_ran.finish_position);
        }

        record.results_finalized = true;
        info!(event_id, placings = event.placings.len(), "results finalized");
        outcome.finalized.push(event_id.to_string());
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::test_support::{odds_with, results_with, schedule_with, ts};
    use serde_json::json;

    fn day() -> BTreeMap<String, EventRecord> {
        let schedule = schedule_with(json!([
            {
                "id": "R1", "name": "Maiden", "number": 1, "norm_time": "2024-12-17 14:00:00",
                "entries": [{"number": 1, "name": "Swift Kiwi"}, {"number": 2, "name": "Harbour Lights", "scratched": true}]
            },
            {
                "id": "R2", "name": "Handicap", "number": 2, "norm_time": "2024-12-17 17:00:00",
                "entries": [{"number": 1}]
            }
        ]));
        normalize(&schedule, ts("2024-12-17 00:05:00")).unwrap()
    }

    fn r1_odds(win: f64) -> OddsSnapshot {
        odds_with(json!([{
            "id": "R1",
            "entries": [{"number": 1, "win": win}, {"number": 2, "win": 0.0}]
        }]))
    }

    #[test]
    fn odds_history_is_append_only() {
        let mut records = day();
        merge_odds(&r1_odds(2.4), &mut records, OddsWindow::narrow(), ts("2024-12-17 13:57:00"));
        let before = records["R1"].entries["1"].odds.clone();

        let outcome = merge_odds(&r1_odds(2.1), &mut records, OddsWindow::narrow(), ts("2024-12-17 13:58:00"));
        assert_eq!(outcome.appended, 1);

        let history = &records["R1"].entries["1"].odds;
        assert_eq!(history.len(), 2);
        for (stamp, payload) in &before {
            assert_eq!(history.get(stamp), Some(payload));
        }
        assert_eq!(history["2024-12-17 13:58:00"], json!({"number": 1, "win": 2.1}));
    }

    #[test]
    fn same_second_rerun_overwrites_only_that_key() {
        let mut records = day();
        let now = ts("2024-12-17 13:58:00");
        merge_odds(&r1_odds(2.4), &mut records, OddsWindow::narrow(), now);
        merge_odds(&r1_odds(2.2), &mut records, OddsWindow::narrow(), now);
        let history = &records["R1"].entries["1"].odds;
        assert_eq!(history.len(), 1);
        assert_eq!(history["2024-12-17 13:58:00"]["win"], json!(2.2));
    }

    #[test]
    fn scratched_entries_never_take_odds() {
        let mut records = day();
        for minute in 55..60 {
            let now = ts(&format!("2024-12-17 13:{minute}:00"));
            merge_odds(&r1_odds(3.0), &mut records, OddsWindow::narrow(), now);
            merge_odds(&r1_odds(3.0), &mut records, OddsWindow::wide(), now);
        }
        assert!(records["R1"].entries["2"].odds.is_empty());
        assert_eq!(records["R1"].entries["1"].odds.len(), 5);
    }

    #[test]
    fn window_gating() {
        let start = ts("2024-12-17 14:00:00");
        let three_hours_out = ts("2024-12-17 11:00:00");
        assert!(!OddsWindow::wide().admits(three_hours_out, start));
        assert!(!OddsWindow::narrow().admits(three_hours_out, start));

        assert!(OddsWindow::wide().admits(ts("2024-12-17 12:00:00"), start));
        assert!(OddsWindow::wide().admits(ts("2024-12-17 15:30:00"), start));
        assert!(!OddsWindow::narrow().admits(ts("2024-12-17 13:54:59"), start));
        assert!(OddsWindow::narrow().admits(ts("2024-12-17 13:55:00"), start));
        assert!(OddsWindow::narrow().admits(ts("2024-12-17 14:05:00"), start));
        assert!(!OddsWindow::narrow().admits(ts("2024-12-17 14:05:01"), start));

        let huge = Duration::days(1_000_000_000);
        assert!(OddsWindow::Wide { lead: huge }.admits(three_hours_out, start));
        assert!(OddsWindow::Narrow { radius: huge }.admits(three_hours_out, start));

        let mut records = day();
        let outcome = merge_odds(&r1_odds(2.0), &mut records, OddsWindow::wide(), three_hours_out);
        assert!(outcome.touched.is_empty());
        assert!(records["R1"].entries["1"].odds.is_empty());
    }

    #[test]
    fn unknown_events_are_reported_not_raised() {
        let mut records = day();
        let snapshot = odds_with(json!([
            {"id": "R7", "entries": [{"number": 1, "win": 4.0}]},
            {"id": "R7", "entries": []},
            {"id": "", "entries": []}
        ]));
        let outcome = merge_odds(&snapshot, &mut records, OddsWindow::wide(), ts("2024-12-17 13:58:00"));
        assert_eq!(outcome.unknown_event_ids, vec!["R7".to_string()]);
        assert!(outcome.schedule_is_stale());
        assert!(outcome.faults.is_empty());
    }

    #[test]
    fn unknown_entry_faults_without_dropping_the_rest() {
        let mut records = day();
        let snapshot = odds_with(json!([{
            "id": "R1",
            "entries": [{"number": 9, "win": 8.0}, {"number": 1, "win": 2.0}]
        }]));
        let outcome = merge_odds(&snapshot, &mut records, OddsWindow::narrow(), ts("2024-12-17 14:00:00"));
        assert_eq!(
            outcome.faults,
            vec![SyncError::UnknownEntry {
                event_id: "R1".into(),
                entry_number: "9".into()
            }]
        );
        assert_eq!(records["R1"].entries["1"].odds.len(), 1);
    }

    #[test]
    fn finalized_events_stop_taking_odds() {
        let mut records = day();
        records.get_mut("R1").unwrap().results_finalized = true;
        let outcome = merge_odds(&r1_odds(2.0), &mut records, OddsWindow::narrow(), ts("2024-12-17 14:01:00"));
        assert!(outcome.touched.is_empty());
        assert!(records["R1"].entries["1"].odds.is_empty());
    }

    #[test]
    fn results_land_exactly_once() {
        let mut records = day();
        let first = results_with(json!([{
            "id": "R1",
            "placings": [{"number": 1, "distance": 0, "favouritism": 1, "rank": 1}],
            "also_ran": [{"number": 2, "distance": 3, "finish_position": 2}]
        }]));
        let outcome = merge_results(&first, &mut records);
        assert_eq!(outcome.finalized, vec!["R1".to_string()]);
        let snapshot_after_first = records.clone();

        let revised = results_with(json!([{
            "id": "R1",
            "placings": [{"number": 2, "distance": 0, "favouritism": 5, "rank": 1}],
            "also_ran": [{"number": 1, "distance": 1, "finish_position": 2}]
        }]));
        let outcome = merge_results(&revised, &mut records);
        assert!(outcome.finalized.is_empty());
        assert_eq!(records, snapshot_after_first);
    }

    #[test]
    fn placeholder_and_pending_results_are_skipped() {
        let mut records = day();
        let snapshot = results_with(json!([
            {"id": null, "placings": [{"number": 1, "distance": 0, "rank": 1}]},
            {"id": "R2", "placings": [], "also_ran": []}
        ]));
        let outcome = merge_results(&snapshot, &mut records);
        assert!(outcome.finalized.is_empty());
        assert!(outcome.faults.is_empty());
        assert!(!records["R2"].results_finalized);
    }

    #[test]
    fn unknown_result_event_faults_and_others_continue() {
        let mut records = day();
        let snapshot = results_with(json!([
            {"id": "R404", "placings": [{"number": 1, "distance": 0, "rank": 1}]},
            {"id": "R2", "placings": [{"number": 1, "distance": 0, "favouritism": 1, "rank": 1}]}
        ]));
        let outcome = merge_results(&snapshot, &mut records);
        assert_eq!(
            outcome.faults,
            vec![SyncError::UnknownEvent {
                event_id: "R404".into()
            }]
        );
        assert_eq!(outcome.finalized, vec!["R2".to_string()]);
        assert_eq!(records["R2"].entries["1"].results_rank, Some(1));
    }
}
