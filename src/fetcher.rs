//! Paginated fetching for one (strategy, window) pair, plus reply-tree and placeholder
//! fetches. Every API call goes through the shared credit budget and the retry policy.

use crate::api::{ListingApi, ListingRequest, RateHint, ReplyPage};
use crate::concurrency::{CancelToken, CreditBudget};
use crate::date::{now_ts, TimeFilter, HOUR_SECS};
use crate::error::FetchError;
use crate::model::{ChildRecord, Continuation, ParentRecord};
use crate::retry::{retry, RetryPolicy};
use crate::window::PlannedWindow;
use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct FetchCfg {
    /// Items requested per page.
    pub page_size: usize,
    /// Hard per-listing item cap imposed by the API.
    pub listing_cap: usize,
}

impl Default for FetchCfg {
    fn default() -> Self {
        Self { page_size: 100, listing_cap: 1000 }
    }
}

pub struct PaginatedFetcher<'a> {
    api: &'a dyn ListingApi,
    retry: &'a RetryPolicy,
    credits: &'a CreditBudget,
    cancel: &'a CancelToken,
    cfg: FetchCfg,
    clock: Option<i64>,
}

/// Validated replies from one tree fetch or placeholder expansion.
#[derive(Debug, Default)]
pub struct Replies {
    pub children: Vec<ChildRecord>,
    pub continuations: Vec<Continuation>,
    /// Raw items rejected at the boundary.
    pub invalid: usize,
}

impl<'a> PaginatedFetcher<'a> {
    pub fn new(
        api: &'a dyn ListingApi,
        retry: &'a RetryPolicy,
        credits: &'a CreditBudget,
        cancel: &'a CancelToken,
        cfg: FetchCfg,
    ) -> Self {
        let cfg = FetchCfg { page_size: cfg.page_size.max(1), listing_cap: cfg.listing_cap.max(1) };
        Self { api, retry, credits, cancel, cfg, clock: None }
    }

    /// Pin the instant ranked-listing time filters are measured from.
    pub fn with_clock(mut self, now: i64) -> Self {
        self.clock = Some(now);
        self
    }

    /// Filter for a ranked listing over `planned`; the slack covers time spent paging.
    fn time_filter(&self, planned: &PlannedWindow) -> Option<TimeFilter> {
        if planned.strategy.newest_first() {
            return None;
        }
        let now = self.clock.unwrap_or_else(now_ts);
        let age = now.saturating_sub(planned.window.start).saturating_add(HOUR_SECS);
        Some(TimeFilter::covering(age))
    }

    /// Lazy record stream for one window. Not restartable.
    pub fn window<'f>(&'f self, source: &'f str, planned: PlannedWindow) -> WindowPages<'f, 'a> {
        WindowPages {
            fetcher: self,
            source,
            time_filter: self.time_filter(&planned),
            planned,
            after: None,
            buffer: VecDeque::new(),
            pulled: 0,
            pages: 0,
            invalid: 0,
            stop: None,
        }
    }

    pub fn replies(&self, source: &str, parent_id: &str) -> Result<Replies, FetchError> {
        let what = format!("replies for {parent_id}");
        let page = self.call(&what, || self.api.fetch_replies(source, parent_id), |p: &ReplyPage| p.rate)?;
        Ok(validate_replies(page, parent_id))
    }

    pub fn expand(&self, source: &str, more: &Continuation) -> Result<Replies, FetchError> {
        let what = format!("placeholder {} under {}", more.id, more.parent_ref.fullname());
        let page = self.call(&what, || self.api.expand_continuation(source, more), |p: &ReplyPage| p.rate)?;
        Ok(validate_replies(page, &more.link_id))
    }

    fn call<T>(
        &self,
        what: &str,
        op: impl Fn() -> Result<T, FetchError>,
        rate: impl Fn(&T) -> Option<RateHint>,
    ) -> Result<T, FetchError> {
        retry(self.retry, what, |_| {
            self.credits
                .try_acquire()
                .map_err(|wait| FetchError::rate_limited(wait, "request credits exhausted"))?;
            let out = op()?;
            if let Some(hint) = rate(&out) {
                self.credits.observe(&hint);
            }
            Ok(out)
        })
    }
}

fn validate_replies(page: ReplyPage, link_id: &str) -> Replies {
    let retrieved_at = now_ts();
    let mut out = Replies::default();
    for raw in page.comments {
        match ChildRecord::from_raw(raw, link_id, retrieved_at) {
            Ok(c) => out.children.push(c),
            Err(e) => {
                out.invalid += 1;
                tracing::warn!("skipping reply under {link_id}: {e}");
            }
        }
    }
    for raw in page.continuations {
        match Continuation::from_raw(raw, link_id) {
            Ok(m) => out.continuations.push(m),
            Err(e) => {
                out.invalid += 1;
                tracing::warn!("skipping placeholder under {link_id}: {e}");
            }
        }
    }
    out
}

/// Why a window stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Newest-first listing passed the window's lower bound.
    Boundary,
    /// API reported no further pages.
    Exhausted,
    /// Listing item cap reached; older items may be missing.
    Cap,
    Cancelled,
    Failed,
}

/// Iterator over validated parents inside one window.
pub struct WindowPages<'f, 'a> {
    fetcher: &'f PaginatedFetcher<'a>,
    source: &'f str,
    planned: PlannedWindow,
    time_filter: Option<TimeFilter>,
    after: Option<String>,
    buffer: VecDeque<ParentRecord>,
    pulled: usize,
    pages: usize,
    invalid: usize,
    stop: Option<StopReason>,
}

impl WindowPages<'_, '_> {
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Items pulled from the listing, in or out of the window.
    pub fn pulled(&self) -> usize {
        self.pulled
    }

    pub fn invalid(&self) -> usize {
        self.invalid
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    pub fn time_filter(&self) -> Option<TimeFilter> {
        self.time_filter
    }

    pub fn truncated(&self) -> bool {
        self.stop == Some(StopReason::Cap)
    }

    fn fill(&mut self) -> Result<(), FetchError> {
        let fetcher = self.fetcher;
        if fetcher.cancel.is_cancelled() {
            self.stop = Some(StopReason::Cancelled);
            return Ok(());
        }
        let cap = fetcher.cfg.listing_cap;
        let limit = fetcher.cfg.page_size.min(cap.saturating_sub(self.pulled)).max(1);
        let req = ListingRequest {
            source: self.source,
            strategy: self.planned.strategy,
            window: self.planned.window,
            time_filter: self.time_filter,
            after: self.after.as_deref(),
            limit,
        };
        let what = format!("{} listing page {} for {}", req.strategy.listing(), self.pages + 1, req.window);
        let page = fetcher.call(&what, || fetcher.api.list_parents(&req), |p| p.rate)?;
        self.pages += 1;

        if page.items.is_empty() {
            self.stop = Some(StopReason::Exhausted);
            return Ok(());
        }
        self.pulled += page.items.len();

        let retrieved_at = now_ts();
        let window = self.planned.window;
        for raw in page.items {
            let rec = match ParentRecord::from_raw(raw, self.source, retrieved_at) {
                Ok(r) => r,
                Err(e) => {
                    self.invalid += 1;
                    tracing::warn!("skipping post in {}: {e}", self.source);
                    continue;
                }
            };
            if window.contains(rec.created_utc) {
                self.buffer.push_back(rec);
            } else if self.planned.strategy.newest_first() && rec.created_utc < window.start && !rec.stickied {
                self.stop = Some(StopReason::Boundary);
                break;
            }
        }

        if self.stop.is_none() {
            match page.after {
                Some(after) => self.after = Some(after),
                None => self.stop = Some(StopReason::Exhausted),
            }
        }
        if self.stop.is_none() && self.pulled >= cap {
            match self.time_filter {
                Some(t) if t > TimeFilter::Week => tracing::warn!(
                    "top listing for {} hit the {cap}-item cap under t={t}; ranking spans more than the window, older items may be missing",
                    window
                ),
                _ => tracing::warn!(
                    "{} listing for {} hit the {cap}-item cap; window may be truncated",
                    self.planned.strategy.listing(),
                    window
                ),
            }
            self.stop = Some(StopReason::Cap);
        }
        tracing::debug!("page {} of {}: {} buffered, {} pulled", self.pages, window, self.buffer.len(), self.pulled);
        Ok(())
    }
}

impl Iterator for WindowPages<'_, '_> {
    type Item = Result<ParentRecord, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.buffer.pop_front() {
                return Some(Ok(rec));
            }
            if self.stop.is_some() {
                return None;
            }
            if let Err(e) = self.fill() {
                self.stop = Some(StopReason::Failed);
                return Some(Err(e));
            }
        }
    }
}
