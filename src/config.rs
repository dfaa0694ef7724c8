use crate::date::{Period, DAY_SECS};
use crate::fetcher::FetchCfg;
use crate::retry::RetryPolicy;
use crate::thread::DEFAULT_MAX_ROUNDS;
use crate::window::PlannerCfg;
use crate::writer::DEFAULT_BATCH_SIZE;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Harvest options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct HarvestOptions {
    pub parallelism: usize,           // worker threads; caps outstanding API requests
    pub page_size: usize,             // items requested per listing page
    pub listing_cap: usize,           // API's per-listing item cap
    pub batch_size: usize,            // rows per write transaction
    pub retry: RetryPolicy,
    pub planner: PlannerCfg,
    pub continuation_rounds: usize,   // placeholder resolution round cap
    pub continuation_threshold: i64,  // skip placeholders announcing fewer replies; 0 expands all
    pub include_deleted: bool,        // keep deleted replies without surviving descendants
    pub progress: bool,               // render progress bars
}

impl Default for HarvestOptions {
    fn default() -> Self {
        let fetch = FetchCfg::default();
        Self {
            parallelism: 4,
            page_size: fetch.page_size,
            listing_cap: fetch.listing_cap,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            planner: PlannerCfg::default(),
            continuation_rounds: DEFAULT_MAX_ROUNDS,
            continuation_threshold: 0,
            include_deleted: true,
            progress: false,
        }
    }
}

impl HarvestOptions {
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads.max(1);
        self
    }
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }
    pub fn with_listing_cap(mut self, n: usize) -> Self {
        self.listing_cap = n.max(1);
        self
    }
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.retry.max_retries = n;
        self
    }
    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.retry = RetryPolicy::new(self.retry.max_retries, d, self.retry.multiplier, self.retry.max_delay, self.retry.jitter_pct);
        self
    }
    pub fn with_safe_recency_days(mut self, days: i64) -> Self {
        self.planner.safe_recency_secs = days * DAY_SECS;
        self
    }
    pub fn with_period(mut self, period: Period) -> Self {
        self.planner.period = period;
        self
    }
    pub fn with_overlap(mut self, secs: i64) -> Self {
        self.planner.overlap_secs = secs;
        self
    }
    pub fn with_continuation_rounds(mut self, rounds: usize) -> Self {
        self.continuation_rounds = rounds;
        self
    }
    pub fn with_continuation_threshold(mut self, min_count: i64) -> Self {
        self.continuation_threshold = min_count.max(0);
        self
    }
    pub fn with_include_deleted(mut self, yes: bool) -> Self {
        self.include_deleted = yes;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    pub fn fetch_cfg(&self) -> FetchCfg {
        FetchCfg { page_size: self.page_size, listing_cap: self.listing_cap }
    }

    /// Defaults overlaid with `RFETCH_*` environment variables:
    /// - RFETCH_PARALLELISM, RFETCH_PAGE_SIZE, RFETCH_LISTING_CAP, RFETCH_BATCH_SIZE
    /// - RFETCH_MAX_RETRIES, RFETCH_BASE_DELAY_MS
    /// - RFETCH_SAFE_RECENCY_DAYS, RFETCH_PERIOD (day|week|month)
    /// - RFETCH_CONTINUATION_ROUNDS, RFETCH_CONTINUATION_THRESHOLD
    /// - RFETCH_INCLUDE_DELETED, RFETCH_PROGRESS (1/true/yes)
    pub fn from_env() -> Result<Self> {
        let mut o = Self::default();
        if let Some(n) = env_parse::<usize>("RFETCH_PARALLELISM")? { o = o.with_parallelism(n); }
        if let Some(n) = env_parse::<usize>("RFETCH_PAGE_SIZE")? { o = o.with_page_size(n); }
        if let Some(n) = env_parse::<usize>("RFETCH_LISTING_CAP")? { o = o.with_listing_cap(n); }
        if let Some(n) = env_parse::<usize>("RFETCH_BATCH_SIZE")? { o = o.with_batch_size(n); }
        if let Some(n) = env_parse::<usize>("RFETCH_MAX_RETRIES")? { o = o.with_max_retries(n); }
        if let Some(ms) = env_parse::<u64>("RFETCH_BASE_DELAY_MS")? { o = o.with_base_delay(Duration::from_millis(ms)); }
        if let Some(d) = env_parse::<i64>("RFETCH_SAFE_RECENCY_DAYS")? { o = o.with_safe_recency_days(d); }
        if let Some(p) = env_parse::<Period>("RFETCH_PERIOD")? { o = o.with_period(p); }
        if let Some(n) = env_parse::<usize>("RFETCH_CONTINUATION_ROUNDS")? { o = o.with_continuation_rounds(n); }
        if let Some(n) = env_parse::<i64>("RFETCH_CONTINUATION_THRESHOLD")? { o = o.with_continuation_threshold(n); }
        if let Ok(v) = std::env::var("RFETCH_INCLUDE_DELETED") {
            o.include_deleted = env_flag(&v);
        }
        if let Ok(v) = std::env::var("RFETCH_PROGRESS") {
            o.progress = env_flag(&v);
        }
        Ok(o)
    }
}

fn env_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {key}={v:?}")),
        _ => Ok(None),
    }
}
