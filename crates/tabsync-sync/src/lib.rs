//! Synchronization engine: schedule normalization, odds/results merging, the per-day
//! collection lifecycle and the one-shot trigger scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, NaiveDateTime};
use tabsync_adapters::{FeedClient, FixtureFeedClient, TabFeedClient};
use tabsync_core::{CollectionKey, SyncError};
use tabsync_storage::{
    DocumentStore, FileDocumentStore, HttpClientConfig, HttpFetcher, MemoryDocumentStore,
    PayloadArchive, PgDocumentStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod config;
pub mod lifecycle;
pub mod merge;
pub mod normalize;
pub mod trigger;

pub use config::{ResultsMode, StoreKind, SyncConfig};
pub use lifecycle::{
    CyclePhase, CycleSummary, PipelineSettings, ResultsCadence, RolloverWindow, SyncPipeline,
};
pub use merge::{merge_odds, merge_results, OddsMergeOutcome, OddsWindow, ResultsMergeOutcome};
pub use normalize::normalize;
pub use trigger::{
    ArchivingDecisionHook, DecisionHook, LiveOddsHandler, NoopDecisionHook, TriggerExit,
    TriggerHandler, TriggerJob, TriggerRunSummary, TriggerScheduler, TriggerSettings,
    TriggerTable,
};

pub const CRATE_NAME: &str = "tabsync-sync";

/// How far back `active_collection` looks for an existing day.
pub const ACTIVE_LOOKBACK_DAYS: u64 = 14;

pub async fn build_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryDocumentStore::new()),
        StoreKind::File => Arc::new(FileDocumentStore::new(config.data_dir.clone())),
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for the postgres store")?;
            Arc::new(
                PgDocumentStore::connect(url)
                    .await
                    .context("connecting to postgres document store")?,
            )
        }
    };
    Ok(store)
}

pub fn build_feed(config: &SyncConfig) -> Result<Arc<dyn FeedClient>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture feed");
        return Ok(Arc::new(FixtureFeedClient::new(dir.clone())));
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let mut client = TabFeedClient::new(http, config.feed_base_url.clone());
    if let Some(dir) = &config.archive_dir {
        client = client.with_archive(PayloadArchive::new(dir.clone()));
    }
    Ok(Arc::new(client))
}

pub async fn build_pipeline(config: &SyncConfig) -> Result<SyncPipeline> {
    let store = build_store(config).await?;
    let feed = build_feed(config)?;
    Ok(SyncPipeline::new(config.pipeline_settings(), feed, store))
}

pub async fn run_sync_once_from_config(config: &SyncConfig) -> Result<CycleSummary> {
    let pipeline = build_pipeline(config).await?;
    let summary = pipeline.run_cycle().await.context("sync cycle failed")?;
    Ok(summary)
}

pub fn build_trigger_scheduler(config: &SyncConfig) -> Result<TriggerScheduler> {
    let feed = build_feed(config)?;
    let mut handler = LiveOddsHandler::new(feed.clone());
    if let Some(dir) = &config.archive_dir {
        handler = handler.with_hook(Arc::new(ArchivingDecisionHook::new(PayloadArchive::new(
            dir.clone(),
        ))));
    }
    Ok(TriggerScheduler::new(
        feed,
        Arc::new(handler),
        config.trigger_settings(),
    ))
}

/// One async job on `cron` running a cycle per tick. A failed cycle is logged and the
/// next tick tries again.
pub async fn build_poll_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.run_cycle().await {
                warn!(error = %err, "scheduled sync cycle failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn latest_collection(store: &dyn DocumentStore) -> Result<Option<CollectionKey>, SyncError> {
    Ok(store.list_collections().await?.into_iter().max())
}

/// Most recent existing collection at or before `today`, looking back a bounded number of days.
pub async fn active_collection(
    store: &dyn DocumentStore,
    today: NaiveDate,
) -> Result<Option<CollectionKey>, SyncError> {
    for back in 0..=ACTIVE_LOOKBACK_DAYS {
        let Some(day) = today.checked_sub_days(Days::new(back)) else {
            break;
        };
        let key = CollectionKey::for_date(day);
        if store.collection_exists(&key).await? {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

/// Scheduled start of the day's last event.
pub async fn final_start_time(
    store: &dyn DocumentStore,
    key: &CollectionKey,
) -> Result<Option<NaiveDateTime>, SyncError> {
    let records = store.read_all(key).await?;
    Ok(records.values().map(|r| r.norm_time).max())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use serde_json::{json, Value as JsonValue};
    use tabsync_adapters::FeedClient;
    use tabsync_core::{
        parse_timestamp, OddsSnapshot, ResultsSnapshot, ScheduleSnapshot, SyncError,
    };

    pub fn ts(value: &str) -> NaiveDateTime {
        parse_timestamp(value).unwrap()
    }

    pub fn schedule_json(date: &str, races: JsonValue) -> JsonValue {
        json!({
            "date": date,
            "meetings": [{"name": "Ellerslie", "number": 1, "code": "ELL", "races": races}]
        })
    }

    pub fn schedule_with(races: JsonValue) -> ScheduleSnapshot {
        ScheduleSnapshot::from_json(schedule_json("2024-12-17", races)).unwrap()
    }

    pub fn odds_with(races: JsonValue) -> OddsSnapshot {
        OddsSnapshot::from_json(json!({"meetings": [{"races": races}]})).unwrap()
    }

    pub fn results_with(races: JsonValue) -> ResultsSnapshot {
        ResultsSnapshot::from_json(json!({"meetings": [{"races": races}]})).unwrap()
    }

    /// Serves in-memory JSON documents; individual feeds can be switched to fail.
    pub struct StaticFeed {
        schedule: Mutex<JsonValue>,
        odds: Mutex<JsonValue>,
        results: Mutex<JsonValue>,
        schedule_down: AtomicBool,
        odds_down: AtomicBool,
    }

    impl StaticFeed {
        pub fn new(schedule: JsonValue, odds: JsonValue, results: JsonValue) -> Self {
            Self {
                schedule: Mutex::new(schedule),
                odds: Mutex::new(odds),
                results: Mutex::new(results),
                schedule_down: AtomicBool::new(false),
                odds_down: AtomicBool::new(false),
            }
        }

        pub fn from_fixtures() -> Self {
            let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/tab");
            let read = |name: &str| -> JsonValue {
                let text = std::fs::read_to_string(dir.join(name)).unwrap();
                serde_json::from_str(&text).unwrap()
            };
            Self::new(read("schedule.json"), read("odds.json"), read("results.json"))
        }

        pub fn fail_schedule(&self, down: bool) {
            self.schedule_down.store(down, Ordering::SeqCst);
        }

        pub fn fail_odds(&self, down: bool) {
            self.odds_down.store(down, Ordering::SeqCst);
        }

        /// Adds a race to the first meeting of the schedule and quotes odds for its entries.
        pub fn push_race(&self, race: JsonValue) {
            let entries: Vec<JsonValue> = race["entries"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| json!({"number": e["number"], "win": 5.0}))
                .collect();
            let odds_race = json!({"id": race["id"], "entries": entries});

            self.schedule.lock().unwrap()["meetings"][0]["races"]
                .as_array_mut()
                .unwrap()
                .push(race);
            self.odds.lock().unwrap()["meetings"][0]["races"]
                .as_array_mut()
                .unwrap()
                .push(odds_race);
        }
    }

    #[async_trait]
    impl FeedClient for StaticFeed {
        async fn fetch_schedule(&self) -> Result<ScheduleSnapshot, SyncError> {
            if self.schedule_down.load(Ordering::SeqCst) {
                return Err(SyncError::FeedUnavailable("schedule down".into()));
            }
            let value = self.schedule.lock().unwrap().clone();
            ScheduleSnapshot::from_json(value)
        }

        async fn fetch_odds(&self) -> Result<OddsSnapshot, SyncError> {
            if self.odds_down.load(Ordering::SeqCst) {
                return Err(SyncError::FeedUnavailable("odds down".into()));
            }
            let value = self.odds.lock().unwrap().clone();
            OddsSnapshot::from_json(value)
        }

        async fn fetch_results(&self) -> Result<ResultsSnapshot, SyncError> {
            let value = self.results.lock().unwrap().clone();
            ResultsSnapshot::from_json(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ts, StaticFeed};
    use std::path::PathBuf;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn latest_and_active_collections() {
        let store = MemoryDocumentStore::new();
        assert_eq!(latest_collection(&store).await.unwrap(), None);

        for key in ["_20241215", "_20241217", "_20241203"] {
            store
                .create_collection(&CollectionKey::parse(key).unwrap(), &[])
                .await
                .unwrap();
        }
        assert_eq!(
            latest_collection(&store).await.unwrap(),
            CollectionKey::parse("_20241217")
        );
        assert_eq!(
            active_collection(&store, day("2024-12-16")).await.unwrap(),
            CollectionKey::parse("_20241215")
        );
        assert_eq!(
            active_collection(&store, day("2024-12-17")).await.unwrap(),
            CollectionKey::parse("_20241217")
        );
        // every stored day is more than two weeks back
        assert_eq!(
            active_collection(&store, day("2025-01-20")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn final_start_time_is_the_last_event() {
        let store: Arc<MemoryDocumentStore> = Arc::new(MemoryDocumentStore::new());
        let pipeline = SyncPipeline::new(
            PipelineSettings::default(),
            Arc::new(StaticFeed::from_fixtures()),
            store.clone(),
        );
        let summary = pipeline.run_cycle_at(ts("2024-12-17 08:00:00")).await.unwrap();
        assert_eq!(
            final_start_time(store.as_ref(), &summary.collection).await.unwrap(),
            Some(ts("2024-12-17 14:35:00"))
        );
    }

    #[tokio::test]
    async fn builds_memory_and_file_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig {
            store: StoreKind::Memory,
            ..Default::default()
        };
        assert!(build_store(&config).await.is_ok());

        config.store = StoreKind::File;
        config.data_dir = dir.path().to_path_buf();
        let store = build_store(&config).await.unwrap();
        let key = CollectionKey::parse("_20241217").unwrap();
        store.create_collection(&key, &[]).await.unwrap();
        assert!(dir.path().join("_20241217").is_dir());

        config.store = StoreKind::Postgres;
        assert!(build_store(&config).await.is_err());
    }

    #[tokio::test]
    async fn fixture_config_runs_one_cycle() {
        let config = SyncConfig {
            store: StoreKind::Memory,
            fixtures_dir: Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/tab")),
            ..Default::default()
        };
        let pipeline = build_pipeline(&config).await.unwrap();
        let summary = pipeline.run_cycle_at(ts("2024-12-17 13:58:00")).await.unwrap();
        assert_eq!(summary.phase, CyclePhase::FirstPull);
        assert_eq!(summary.events_inserted, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn poll_scheduler_rejects_bad_cron() {
        let pipeline = Arc::new(build_pipeline(&SyncConfig {
            store: StoreKind::Memory,
            fixtures_dir: Some(PathBuf::from("fixtures/tab")),
            ..Default::default()
        })
        .await
        .unwrap());
        assert!(build_poll_scheduler(pipeline.clone(), "0 * * * * *").await.is_ok());
        assert!(build_poll_scheduler(pipeline, "every minute please").await.is_err());
    }
}
