use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, NaiveTime};
use serde::Deserialize;
use tabsync_adapters::DEFAULT_BASE_URL;

use crate::lifecycle::{PipelineSettings, ResultsCadence, RolloverWindow};
use crate::merge::OddsWindow;
use crate::trigger::TriggerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    File,
    Postgres,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => bail!("unknown store kind {other:?} (expected memory, file or postgres)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsMode {
    Interval,
    TopOfHour,
}

impl FromStr for ResultsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Self::Interval),
            "top_of_hour" | "top-of-hour" => Ok(Self::TopOfHour),
            other => bail!("unknown results mode {other:?} (expected interval or top_of_hour)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed_base_url: String,
    pub fixtures_dir: Option<PathBuf>,
    pub store: StoreKind,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub poll_cron: String,
    pub wide_window_secs: i64,
    pub narrow_window_secs: i64,
    pub results_mode: ResultsMode,
    pub results_every_secs: i64,
    pub results_grace_secs: i64,
    pub rollover_start: NaiveTime,
    pub rollover_end: NaiveTime,
    pub trigger_offset_secs: i64,
    pub trigger_refresh_secs: u64,
    pub trigger_tick_millis: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_base_url: DEFAULT_BASE_URL.to_string(),
            fixtures_dir: None,
            store: StoreKind::File,
            data_dir: PathBuf::from("./data"),
            database_url: None,
            archive_dir: None,
            user_agent: format!("tabsync/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            poll_cron: "0 * * * * *".to_string(),
            wide_window_secs: 2 * 60 * 60,
            narrow_window_secs: 5 * 60,
            results_mode: ResultsMode::Interval,
            results_every_secs: 60 * 60,
            results_grace_secs: 10,
            rollover_start: NaiveTime::MIN,
            rollover_end: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN),
            trigger_offset_secs: 10,
            trigger_refresh_secs: 600,
            trigger_tick_millis: 1000,
        }
    }
}

/// YAML overlay; every key is optional and only present keys override the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    feed_base_url: Option<String>,
    fixtures_dir: Option<PathBuf>,
    store: Option<StoreKind>,
    data_dir: Option<PathBuf>,
    database_url: Option<String>,
    archive_dir: Option<PathBuf>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    poll_cron: Option<String>,
    wide_window_secs: Option<i64>,
    narrow_window_secs: Option<i64>,
    results_mode: Option<ResultsMode>,
    results_every_secs: Option<i64>,
    results_grace_secs: Option<i64>,
    rollover_start: Option<String>,
    rollover_end: Option<String>,
    trigger_offset_secs: Option<i64>,
    trigger_refresh_secs: Option<u64>,
    trigger_tick_millis: Option<u64>,
}

/// Seconds as a signed span, clamped to what `Duration` can hold.
fn span(secs: i64) -> Duration {
    const LIMIT: i64 = i64::MAX / 1_000;
    Duration::seconds(secs.clamp(-LIMIT, LIMIT))
}

fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
        .map_err(|e| anyhow!("invalid time of day {value:?}: {e}"))
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{name}={value:?}: {e}"))
}

impl SyncConfig {
    /// Defaults, then the YAML file (explicit path or `TABSYNC_CONFIG`), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let env_path = std::env::var("TABSYNC_CONFIG").ok().map(PathBuf::from);
        if let Some(path) = path.map(Path::to_path_buf).or(env_path) {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            config
                .apply_yaml(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
        }
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects time spans the engine cannot use. Every window and offset must fit in one day.
    pub fn validate(&self) -> Result<()> {
        const DAY: i64 = 24 * 60 * 60;
        let spans = [
            ("wide_window_secs", self.wide_window_secs, 0, DAY),
            ("narrow_window_secs", self.narrow_window_secs, 0, DAY),
            ("results_every_secs", self.results_every_secs, 1, DAY),
            ("results_grace_secs", self.results_grace_secs, 0, 60 * 60 - 1),
            ("trigger_offset_secs", self.trigger_offset_secs, 0, DAY),
        ];
        for (name, value, min, max) in spans {
            if !(min..=max).contains(&value) {
                bail!("{name}={value} is out of range ({min}..={max})");
            }
        }
        if self.trigger_refresh_secs == 0 {
            bail!("trigger_refresh_secs must be positive");
        }
        Ok(())
    }

    pub fn apply_yaml(&mut self, text: &str) -> Result<()> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        if let Some(v) = file.feed_base_url {
            self.feed_base_url = v;
        }
        if let Some(v) = file.fixtures_dir {
            self.fixtures_dir = Some(v);
        }
        if let Some(v) = file.store {
            self.store = v;
        }
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.database_url {
            self.database_url = Some(v);
        }
        if let Some(v) = file.archive_dir {
            self.archive_dir = Some(v);
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.poll_cron {
            self.poll_cron = v;
        }
        if let Some(v) = file.wide_window_secs {
            self.wide_window_secs = v;
        }
        if let Some(v) = file.narrow_window_secs {
            self.narrow_window_secs = v;
        }
        if let Some(v) = file.results_mode {
            self.results_mode = v;
        }
        if let Some(v) = file.results_every_secs {
            self.results_every_secs = v;
        }
        if let Some(v) = file.results_grace_secs {
            self.results_grace_secs = v;
        }
        if let Some(v) = file.rollover_start {
            self.rollover_start = parse_time_of_day(&v)?;
        }
        if let Some(v) = file.rollover_end {
            self.rollover_end = parse_time_of_day(&v)?;
        }
        if let Some(v) = file.trigger_offset_secs {
            self.trigger_offset_secs = v;
        }
        if let Some(v) = file.trigger_refresh_secs {
            self.trigger_refresh_secs = v;
        }
        if let Some(v) = file.trigger_tick_millis {
            self.trigger_tick_millis = v;
        }
        Ok(())
    }

    /// Overrides from `TABSYNC_*` variables (plus `DATABASE_URL`) resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TABSYNC_FEED_BASE_URL") {
            self.feed_base_url = v;
        }
        if let Some(v) = lookup("TABSYNC_FIXTURES_DIR") {
            self.fixtures_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TABSYNC_STORE") {
            self.store = v.parse()?;
        }
        if let Some(v) = lookup("TABSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("TABSYNC_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TABSYNC_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("TABSYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_var("TABSYNC_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_POLL_CRON") {
            self.poll_cron = v;
        }
        if let Some(v) = lookup("TABSYNC_WIDE_WINDOW_SECS") {
            self.wide_window_secs = parse_var("TABSYNC_WIDE_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_NARROW_WINDOW_SECS") {
            self.narrow_window_secs = parse_var("TABSYNC_NARROW_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_RESULTS_MODE") {
            self.results_mode = v.parse()?;
        }
        if let Some(v) = lookup("TABSYNC_RESULTS_EVERY_SECS") {
            self.results_every_secs = parse_var("TABSYNC_RESULTS_EVERY_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_RESULTS_GRACE_SECS") {
            self.results_grace_secs = parse_var("TABSYNC_RESULTS_GRACE_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_ROLLOVER_START") {
            self.rollover_start = parse_time_of_day(&v)?;
        }
        if let Some(v) = lookup("TABSYNC_ROLLOVER_END") {
            self.rollover_end = parse_time_of_day(&v)?;
        }
        if let Some(v) = lookup("TABSYNC_TRIGGER_OFFSET_SECS") {
            self.trigger_offset_secs = parse_var("TABSYNC_TRIGGER_OFFSET_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_TRIGGER_REFRESH_SECS") {
            self.trigger_refresh_secs = parse_var("TABSYNC_TRIGGER_REFRESH_SECS", &v)?;
        }
        if let Some(v) = lookup("TABSYNC_TRIGGER_TICK_MILLIS") {
            self.trigger_tick_millis = parse_var("TABSYNC_TRIGGER_TICK_MILLIS", &v)?;
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let results = match self.results_mode {
            ResultsMode::Interval => ResultsCadence::Interval {
                every: span(self.results_every_secs),
            },
            ResultsMode::TopOfHour => ResultsCadence::TopOfHour {
                grace: span(self.results_grace_secs),
            },
        };
        PipelineSettings {
            wide: OddsWindow::Wide {
                lead: span(self.wide_window_secs),
            },
            narrow: OddsWindow::Narrow {
                radius: span(self.narrow_window_secs),
            },
            results,
            rollover: RolloverWindow {
                start: self.rollover_start,
                end: self.rollover_end,
            },
        }
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            offset: span(self.trigger_offset_secs),
            refresh_every: StdDuration::from_secs(self.trigger_refresh_secs),
            tick: StdDuration::from_millis(self.trigger_tick_millis.max(1)),
        }
    }
}
