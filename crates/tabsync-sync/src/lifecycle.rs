use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use tabsync_adapters::FeedClient;
use tabsync_core::{CollectionKey, EventRecord, ResultsSnapshot, ScheduleSnapshot, SyncError};
use tabsync_storage::DocumentStore;
use tokio::sync::Mutex;
use tracing::{debug, field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merge::{merge_odds, merge_results, OddsWindow};
use crate::normalize::normalize;

/// When a steady-state cycle also pulls results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsCadence {
    /// At least `every` since this process last pulled results; the first cycle always pulls.
    Interval { every: Duration },
    /// Within `grace` after the top of each hour, edge included.
    TopOfHour { grace: Duration },
}

impl ResultsCadence {
    pub fn is_due(&self, now: NaiveDateTime, last_pull: Option<NaiveDateTime>) -> bool {
        match *self {
            Self::Interval { every } => match last_pull {
                None => true,
                Some(last) => now - last >= every,
            },
            Self::TopOfHour { grace } => {
                let since_hour = i64::from(now.minute() * 60 + now.second());
                since_hour <= grace.num_seconds()
            }
        }
    }
}

/// Local time-of-day span during which the feed may already report the next racing day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl RolloverWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub wide: OddsWindow,
    pub narrow: OddsWindow,
    pub results: ResultsCadence,
    pub rollover: RolloverWindow,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            wide: OddsWindow::wide(),
            narrow: OddsWindow::narrow(),
            results: ResultsCadence::Interval {
                every: Duration::hours(1),
            },
            rollover: RolloverWindow {
                start: NaiveTime::MIN,
                end: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    FirstPull,
    SteadyState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub collection: CollectionKey,
    pub phase: CyclePhase,
    pub events_written: usize,
    pub events_inserted: usize,
    pub events_finalized: usize,
    pub odds_appended: usize,
    pub unknown_events: usize,
    pub faults: usize,
    pub results_pulled: bool,
}

/// Drives one day's collection through `ABSENT -> FIRST_PULL -> STEADY_STATE`.
pub struct SyncPipeline {
    settings: PipelineSettings,
    feed: Arc<dyn FeedClient>,
    store: Arc<dyn DocumentStore>,
    day_locks: Mutex<HashMap<CollectionKey, Arc<Mutex<()>>>>,
    last_results_pull: Mutex<Option<NaiveDateTime>>,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        feed: Arc<dyn FeedClient>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            settings,
            feed,
            store,
            day_locks: Mutex::new(HashMap::new()),
            last_results_pull: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary, SyncError> {
        self.run_cycle_at(Local::now().naive_local()).await
    }

    /// One poll cycle against the local wall-clock instant `now`.
    pub async fn run_cycle_at(&self, now: NaiveDateTime) -> Result<CycleSummary, SyncError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %cycle_id, collection = field::Empty);
        self.cycle(cycle_id, now).instrument(span).await
    }

    async fn cycle(&self, cycle_id: Uuid, now: NaiveDateTime) -> Result<CycleSummary, SyncError> {
        let (key, prefetched) = self.resolve_collection(now).await?;
        tracing::Span::current().record("collection", key.as_str());

        let lock = self.day_lock(&key).await;
        let _guard = lock.lock().await;

        let summary = if self.store.collection_exists(&key).await? {
            self.steady_state(cycle_id, key, prefetched, now).await?
        } else {
            self.first_pull(cycle_id, key, prefetched, now).await?
        };

        info!(
            phase = ?summary.phase,
            written = summary.events_written,
            inserted = summary.events_inserted,
            finalized = summary.events_finalized,
            appended = summary.odds_appended,
            unknown = summary.unknown_events,
            faults = summary.faults,
            results_pulled = summary.results_pulled,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Picks the collection this cycle works on. The feed's own date wins whenever the
    /// local collection is missing or the clock sits inside the rollover window.
    pub async fn resolve_collection(
        &self,
        now: NaiveDateTime,
    ) -> Result<(CollectionKey, Option<ScheduleSnapshot>), SyncError> {
        let local_key = CollectionKey::for_date(now.date());
        let in_rollover = self.settings.rollover.contains(now.time());
        if !in_rollover && self.store.collection_exists(&local_key).await? {
            return Ok((local_key, None));
        }

        let schedule = self.feed.fetch_schedule().await?;
        let feed_key = schedule.collection_key()?;
        if feed_key != local_key {
            info!(local = %local_key, feed = %feed_key, in_rollover, "feed reports a different racing day");
        }
        Ok((feed_key, Some(schedule)))
    }

    async fn day_lock(&self, key: &CollectionKey) -> Arc<Mutex<()>> {
        let mut locks = self.day_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn first_pull(
        &self,
        cycle_id: Uuid,
        key: CollectionKey,
        prefetched: Option<ScheduleSnapshot>,
        now: NaiveDateTime,
    ) -> Result<CycleSummary, SyncError> {
        let schedule = match prefetched {
            Some(schedule) => schedule,
            None => self.feed.fetch_schedule().await?,
        };
        let odds = self.feed.fetch_odds().await?;
        let results = self.feed.fetch_results().await?;

        let mut records = normalize(&schedule, now)?;
        let results_outcome = merge_results(&results, &mut records);
        let odds_outcome = merge_odds(&odds, &mut records, self.settings.wide, now);

        let faults = item_faults(&results_outcome.faults)? + item_faults(&odds_outcome.faults)?;
        let documents: Vec<EventRecord> = records.values().cloned().collect();
        self.store.create_collection(&key, &documents).await?;
        *self.last_results_pull.lock().await = Some(now);
        info!(events = records.len(), "created day collection");

        Ok(CycleSummary {
            cycle_id,
            collection: key,
            phase: CyclePhase::FirstPull,
            events_written: 0,
            events_inserted: records.len(),
            events_finalized: results_outcome.finalized.len(),
            odds_appended: odds_outcome.appended,
            unknown_events: odds_outcome.unknown_event_ids.len(),
            faults,
            results_pulled: true,
        })
    }

    async fn steady_state(
        &self,
        cycle_id: Uuid,
        key: CollectionKey,
        prefetched: Option<ScheduleSnapshot>,
        now: NaiveDateTime,
    ) -> Result<CycleSummary, SyncError> {
        let results_due = {
            let last = self.last_results_pull.lock().await;
            self.settings.results.is_due(now, *last)
        };

        let odds = self.feed.fetch_odds().await?;
        let results: Option<ResultsSnapshot> = if results_due {
            Some(self.feed.fetch_results().await?)
        } else {
            None
        };
        let mut records = self.store.read_all(&key).await?;
        debug!(events = records.len(), results_due, "loaded stored records");

        let mut dirty = BTreeSet::new();
        let mut faults = 0usize;
        let mut finalized = 0usize;
        if let Some(results) = &results {
            let outcome = merge_results(results, &mut records);
            finalized = outcome.finalized.len();
            faults += item_faults(&outcome.faults)?;
            dirty.extend(outcome.finalized);
        }

        let odds_outcome = merge_odds(&odds, &mut records, self.settings.narrow, now);
        faults += item_faults(&odds_outcome.faults)?;
        let unknown_events = odds_outcome.unknown_event_ids.len();
        let odds_appended = odds_outcome.appended;
        let stale = odds_outcome.schedule_is_stale();
        dirty.extend(odds_outcome.touched);

        let missing = if stale {
            let schedule = match prefetched {
                Some(schedule) => schedule,
                None => self.feed.fetch_schedule().await?,
            };
            self.missing_events(&key, &schedule, now).await?
        } else {
            Vec::new()
        };

        for event_id in &dirty {
            if let Some(record) = records.get(event_id) {
                self.store.replace(&key, event_id, record, false).await?;
            }
        }
        for record in &missing {
            self.store.insert(&key, record).await?;
            info!(event_id = %record.event_id, "inserted event missing from the stored schedule");
        }
        if results.is_some() {
            *self.last_results_pull.lock().await = Some(now);
        }

        Ok(CycleSummary {
            cycle_id,
            collection: key,
            phase: CyclePhase::SteadyState,
            events_written: dirty.len(),
            events_inserted: missing.len(),
            events_finalized: finalized,
            odds_appended,
            unknown_events,
            faults,
            results_pulled: results.is_some(),
        })
    }

    /// Normalized schedule events not yet stored under `key`. Stored documents are never
    /// candidates, so reconciliation cannot overwrite them.
    async fn missing_events(
        &self,
        key: &CollectionKey,
        schedule: &ScheduleSnapshot,
        now: NaiveDateTime,
    ) -> Result<Vec<EventRecord>, SyncError> {
        let schedule_key = schedule.collection_key()?;
        if &schedule_key != key {
            warn!(
                schedule = %schedule_key,
                collection = %key,
                "schedule is for another day; skipping reconciliation"
            );
            return Ok(Vec::new());
        }

        let normalized: BTreeMap<String, EventRecord> = normalize(schedule, now)?;
        let stored = self.store.list_event_ids(key).await?;
        Ok(normalized
            .into_values()
            .filter(|record| !stored.contains(&record.event_id))
            .collect())
    }
}

/// Counts per-item faults; any other error aborts the cycle.
fn item_faults(faults: &[SyncError]) -> Result<usize, SyncError> {
    match faults.iter().find(|fault| !fault.is_item_fault()) {
        Some(fatal) => Err(fatal.clone()),
        None => Ok(faults.len()),
    }
}
