//! Same-day one-shot wake-ups, one per event, fired a fixed offset before the scheduled start.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime};
use serde::Serialize;
use tabsync_adapters::FeedClient;
use tabsync_core::{format_timestamp, EventRecord, OddsEvent, SyncError};
use tabsync_storage::PayloadArchive;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::normalize::normalize;

/// Ordered by fire time first, so the table's head is always the next job due.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TriggerJob {
    pub fire_at: NaiveDateTime,
    pub event_id: String,
}

#[derive(Debug, Default, Clone)]
pub struct TriggerTable {
    jobs: BTreeSet<TriggerJob>,
}

impl TriggerTable {
    /// Discards every installed job, then installs one per event whose fire time is still ahead of `now`.
    pub fn rebuild(
        &mut self,
        records: &BTreeMap<String, EventRecord>,
        offset: Duration,
        now: NaiveDateTime,
    ) -> usize {
        self.jobs.clear();
        for record in records.values() {
            let Some(fire_at) = record.norm_time.checked_sub_signed(offset) else {
                continue;
            };
            if fire_at > now {
                self.jobs.insert(TriggerJob {
                    fire_at,
                    event_id: record.event_id.clone(),
                });
            }
        }
        self.jobs.len()
    }

    /// Removes and returns every job due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<TriggerJob> {
        let mut due = Vec::new();
        while self.jobs.first().is_some_and(|job| job.fire_at <= now) {
            if let Some(job) = self.jobs.pop_first() {
                due.push(job);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn next_fire_at(&self) -> Option<NaiveDateTime> {
        self.jobs.first().map(|job| job.fire_at)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &TriggerJob> {
        self.jobs.iter()
    }
}

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self, event_id: &str) -> Result<()>;
}

/// Receives the live odds captured at trigger time. What it does with them is up to the implementor.
#[async_trait]
pub trait DecisionHook: Send + Sync {
    async fn decide(&self, event_id: &str, odds: Option<&OddsEvent>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopDecisionHook;

#[async_trait]
impl DecisionHook for NoopDecisionHook {
    async fn decide(&self, event_id: &str, odds: Option<&OddsEvent>) -> Result<()> {
        info!(
            event_id,
            entries = odds.map(|o| o.entries.len()).unwrap_or(0),
            "trigger fired"
        );
        Ok(())
    }
}

/// Keeps each trigger-time odds payload in the raw payload archive under the `trigger` feed.
#[derive(Debug, Clone)]
pub struct ArchivingDecisionHook {
    archive: PayloadArchive,
}

impl ArchivingDecisionHook {
    pub fn new(archive: PayloadArchive) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl DecisionHook for ArchivingDecisionHook {
    async fn decide(&self, event_id: &str, odds: Option<&OddsEvent>) -> Result<()> {
        let Some(odds) = odds else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(odds).context("encoding trigger odds")?;
        let stored = self
            .archive
            .archive(Local::now().naive_local(), "trigger", "json", &body)
            .await
            .with_context(|| format!("archiving trigger odds for {event_id}"))?;
        debug!(event_id, path = %stored.relative_path.display(), "archived trigger odds");
        Ok(())
    }
}

/// Default handler: pulls live odds for the one event and passes them to a [`DecisionHook`].
pub struct LiveOddsHandler {
    feed: Arc<dyn FeedClient>,
    hook: Arc<dyn DecisionHook>,
}

impl LiveOddsHandler {
    pub fn new(feed: Arc<dyn FeedClient>) -> Self {
        Self {
            feed,
            hook: Arc::new(NoopDecisionHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn DecisionHook>) -> Self {
        self.hook = hook;
        self
    }
}

#[async_trait]
impl TriggerHandler for LiveOddsHandler {
    async fn on_trigger(&self, event_id: &str) -> Result<()> {
        let odds = self.feed.fetch_event_odds(event_id).await?;
        if odds.is_none() {
            warn!(event_id, "no live odds for triggered event");
        }
        self.hook.decide(event_id, odds.as_ref()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    /// How long before the scheduled start a job fires.
    pub offset: Duration,
    pub refresh_every: StdDuration,
    pub tick: StdDuration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            offset: Duration::seconds(10),
            refresh_every: StdDuration::from_secs(600),
            tick: StdDuration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerExit {
    NoUpcomingEvents,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerRunSummary {
    pub refreshes: usize,
    pub failed_refreshes: usize,
    pub fired: usize,
    pub exit: TriggerExit,
}

/// Sole owner of the trigger table; refreshes and ticks share one task.
pub struct TriggerScheduler {
    feed: Arc<dyn FeedClient>,
    handler: Arc<dyn TriggerHandler>,
    settings: TriggerSettings,
    table: TriggerTable,
}

impl TriggerScheduler {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        handler: Arc<dyn TriggerHandler>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            feed,
            handler,
            settings,
            table: TriggerTable::default(),
        }
    }

    pub fn table(&self) -> &TriggerTable {
        &self.table
    }

    /// Rebuilds the table from a fresh schedule. On error the current table is left as it was.
    pub async fn refresh(&mut self, now: NaiveDateTime) -> Result<usize, SyncError> {
        let schedule = self.feed.fetch_schedule().await?;
        let records = normalize(&schedule, now)?;
        let installed = self.table.rebuild(&records, self.settings.offset, now);
        info!(
            installed,
            next = ?self.table.next_fire_at().map(format_timestamp),
            "trigger table rebuilt"
        );
        Ok(installed)
    }

    /// Fires and removes every job due at `now`. Handler failures are logged only.
    pub async fn fire_due(&mut self, now: NaiveDateTime) -> usize {
        let due = self.table.take_due(now);
        for job in &due {
            info!(event_id = %job.event_id, fire_at = %format_timestamp(job.fire_at), "firing trigger");
            if let Err(err) = self.handler.on_trigger(&job.event_id).await {
                warn!(event_id = %job.event_id, error = %err, "trigger handler failed");
            }
        }
        due.len()
    }

    /// Runs until a successful refresh leaves no upcoming jobs, or `shutdown` flips to true.
    /// Only the initial refresh is fatal.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<TriggerRunSummary, SyncError> {
        let mut summary = TriggerRunSummary {
            refreshes: 0,
            failed_refreshes: 0,
            fired: 0,
            exit: TriggerExit::NoUpcomingEvents,
        };

        self.refresh(Local::now().naive_local()).await?;
        summary.refreshes += 1;
        if self.table.is_empty() {
            info!("no upcoming events to trigger");
            return Ok(summary);
        }

        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_refresh = Instant::now();

        loop {
            if *shutdown.borrow() {
                summary.exit = TriggerExit::Shutdown;
                break;
            }
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        summary.exit = TriggerExit::Shutdown;
                        break;
                    }
                    continue;
                }
            }

            let now = Local::now().naive_local();
            summary.fired += self.fire_due(now).await;

            if last_refresh.elapsed() >= self.settings.refresh_every {
                last_refresh = Instant::now();
                match self.refresh(now).await {
                    Ok(_) => {
                        summary.refreshes += 1;
                        if self.table.is_empty() {
                            info!("no upcoming events left; trigger loop exiting");
                            summary.exit = TriggerExit::NoUpcomingEvents;
                            break;
                        }
                    }
                    Err(err) => {
                        summary.failed_refreshes += 1;
                        warn!(error = %err, jobs = self.table.len(), "trigger refresh failed; keeping current table");
                    }
                }
            }
        }

        info!(
            fired = summary.fired,
            refreshes = summary.refreshes,
            exit = ?summary.exit,
            "trigger loop stopped"
        );
        Ok(summary)
    }
}
