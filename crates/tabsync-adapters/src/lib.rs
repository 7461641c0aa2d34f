//! Feed client contract plus the live TAB JSON client and a fixture-directory client.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use serde_json::Value as JsonValue;
use tabsync_core::{OddsEvent, OddsSnapshot, ResultsSnapshot, ScheduleSnapshot, SyncError};
use tabsync_storage::{HttpFetcher, PayloadArchive};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabsync-adapters";

pub const DEFAULT_BASE_URL: &str = "https://json.tab.co.nz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEndpoint {
    Schedule,
    Odds,
    Results,
}

impl FeedEndpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Odds => "odds",
            Self::Results => "results",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::Schedule => "/schedule/",
            Self::Odds => "/odds/",
            Self::Results => "/results/",
        }
    }

    pub fn fixture_file(self) -> String {
        format!("{}.json", self.name())
    }
}

/// Source of schedule, odds and results snapshots.
///
/// Transport failures surface as `FeedUnavailable`; bodies that do not match the
/// expected shape surface as `MalformedFeedData`.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_schedule(&self) -> Result<ScheduleSnapshot, SyncError>;

    async fn fetch_odds(&self) -> Result<OddsSnapshot, SyncError>;

    async fn fetch_results(&self) -> Result<ResultsSnapshot, SyncError>;

    /// Live odds for a single event, pulled from a fresh odds snapshot.
    async fn fetch_event_odds(&self, event_id: &str) -> Result<Option<OddsEvent>, SyncError> {
        let odds = self.fetch_odds().await?;
        Ok(odds.find_event(event_id).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct TabFeedClient {
    http: HttpFetcher,
    base_url: String,
    archive: Option<PayloadArchive>,
}

impl TabFeedClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            archive: None,
        }
    }

    /// Keep a copy of every raw body under the archive root.
    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn endpoint_url(&self, endpoint: FeedEndpoint) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), endpoint.path())
    }

    async fn fetch_json(&self, endpoint: FeedEndpoint) -> Result<JsonValue, SyncError> {
        let url = self.endpoint_url(endpoint);
        let resp = self.http.fetch_bytes(Uuid::new_v4(), &url).await?;

        if let Some(archive) = &self.archive {
            match archive
                .archive(Local::now().naive_local(), endpoint.name(), "json", &resp.body)
                .await
            {
                Ok(stored) => debug!(path = %stored.relative_path.display(), "archived feed payload"),
                Err(err) => warn!(feed = endpoint.name(), error = %err, "failed to archive feed payload"),
            }
        }

        serde_json::from_slice(&resp.body)
            .map_err(|e| SyncError::FeedUnavailable(format!("{url} returned non-JSON body: {e}")))
    }
}

#[async_trait]
impl FeedClient for TabFeedClient {
    async fn fetch_schedule(&self) -> Result<ScheduleSnapshot, SyncError> {
        ScheduleSnapshot::from_json(self.fetch_json(FeedEndpoint::Schedule).await?)
    }

    async fn fetch_odds(&self) -> Result<OddsSnapshot, SyncError> {
        OddsSnapshot::from_json(self.fetch_json(FeedEndpoint::Odds).await?)
    }

    async fn fetch_results(&self) -> Result<ResultsSnapshot, SyncError> {
        ResultsSnapshot::from_json(self.fetch_json(FeedEndpoint::Results).await?)
    }
}

/// Serves snapshots from `schedule.json`, `odds.json` and `results.json` in one directory.
#[derive(Debug, Clone)]
pub struct FixtureFeedClient {
    dir: PathBuf,
}

impl FixtureFeedClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_json(&self, endpoint: FeedEndpoint) -> Result<JsonValue, SyncError> {
        let path = self.dir.join(endpoint.fixture_file());
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::FeedUnavailable(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::FeedUnavailable(format!("parsing {}: {e}", path.display())))
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    async fn fetch_schedule(&self) -> Result<ScheduleSnapshot, SyncError> {
        ScheduleSnapshot::from_json(self.read_json(FeedEndpoint::Schedule).await?)
    }

    async fn fetch_odds(&self) -> Result<OddsSnapshot, SyncError> {
        OddsSnapshot::from_json(self.read_json(FeedEndpoint::Odds).await?)
    }

    async fn fetch_results(&self) -> Result<ResultsSnapshot, SyncError> {
        ResultsSnapshot::from_json(self.read_json(FeedEndpoint::Results).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tabsync_storage::HttpClientConfig;
    use tempfile::tempdir;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/tab")
    }

    #[tokio::test]
    async fn fixture_client_decodes_all_three_feeds() {
        let feed = FixtureFeedClient::new(fixtures_dir());

        let schedule = feed.fetch_schedule().await.expect("schedule");
        assert_eq!(schedule.date, "2024-12-17");
        assert_eq!(schedule.collection_key().unwrap().as_str(), "_20241217");
        assert_eq!(schedule.meetings[0].races.len(), 2);

        let odds = feed.fetch_odds().await.expect("odds");
        assert_eq!(odds.events().count(), 3);

        let results = feed.fetch_results().await.expect("results");
        let finished: Vec<_> = results
            .events()
            .filter(|e| !e.placings.is_empty())
            .filter_map(|e| e.event_id())
            .collect();
        assert_eq!(finished, vec!["R1"]);
    }

    #[tokio::test]
    async fn event_odds_selects_one_event() {
        let feed = FixtureFeedClient::new(fixtures_dir());
        let r2 = feed.fetch_event_odds("R2").await.unwrap().expect("R2 odds");
        assert_eq!(r2.entries.len(), 2);
        assert!(feed.fetch_event_odds("R404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_or_garbled_fixture_is_feed_unavailable() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("odds.json"), "<html>maintenance</html>").unwrap();
        let feed = FixtureFeedClient::new(dir.path());

        assert!(matches!(
            feed.fetch_schedule().await,
            Err(SyncError::FeedUnavailable(_))
        ));
        assert!(matches!(feed.fetch_odds().await, Err(SyncError::FeedUnavailable(_))));
    }

    #[tokio::test]
    async fn wrong_shape_is_malformed() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("schedule.json"), r#"{"meetings": []}"#).unwrap();
        let feed = FixtureFeedClient::new(dir.path());
        assert!(matches!(
            feed.fetch_schedule().await,
            Err(SyncError::MalformedFeedData(_))
        ));
    }

    #[test]
    fn endpoint_urls_join_cleanly() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let feed = TabFeedClient::new(http, "https://json.tab.co.nz/");
        assert_eq!(
            feed.endpoint_url(FeedEndpoint::Results),
            "https://json.tab.co.nz/results/"
        );
    }
}
