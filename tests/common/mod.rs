#![allow(dead_code)]

use rfetch::{
    Actor, CancelToken, ChildRecord, Continuation, FetchError, HarvestOptions, ListingApi, ListingPage,
    ListingRequest, ParentRecord, ParentStats, RawComment, RawContinuation, RawPost, RecordSink, ReplyPage,
    RetryPolicy, SqliteStore, Strategy, TimeFilter, WriteError,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;

/// Monday 2024-01-01 00:00:00 UTC, so weekly windows start on a boundary.
pub const T0: i64 = 1_704_067_200;
pub const HOUR: i64 = 3_600;
pub const DAY: i64 = 86_400;

pub fn at(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap()
}

/// Millisecond backoff, no jitter: retries stay fast and deterministic.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(4), 0.0)
}

pub fn fast_opts() -> HarvestOptions {
    HarvestOptions::default().with_parallelism(4).with_retry(fast_retry()).with_progress(false)
}

pub fn post(id: &str, created: i64, author: Option<&str>, score: i64) -> RawPost {
    RawPost {
        id: Some(id.to_string()),
        name: Some(format!("t3_{id}")),
        author: Some(author.unwrap_or("[deleted]").to_string()),
        author_fullname: author.map(|a| format!("t2_{a}")),
        created_utc: Some(created as f64),
        title: Some(format!("post {id}")),
        selftext: Some(String::new()),
        score: Some(score),
        num_comments: Some(0),
        permalink: Some(format!("/r/alpha/comments/{id}/")),
        ..Default::default()
    }
}

/// Reply `id` under `parent` (a `t3_`/`t1_` fullname) in the thread of post `link`.
pub fn comment(id: &str, parent: &str, link: &str, created: i64, author: Option<&str>) -> RawComment {
    RawComment {
        id: Some(id.to_string()),
        name: Some(format!("t1_{id}")),
        parent_id: Some(parent.to_string()),
        link_id: Some(format!("t3_{link}")),
        author: Some(author.unwrap_or("[deleted]").to_string()),
        author_fullname: author.map(|a| format!("t2_{a}")),
        body: Some(if author.is_some() { format!("reply {id}") } else { "[deleted]".to_string() }),
        score: Some(1),
        created_utc: Some(created as f64),
        ..Default::default()
    }
}

pub fn more(id: &str, parent: &str, children: &[&str]) -> RawContinuation {
    RawContinuation {
        id: Some(id.to_string()),
        parent_id: Some(parent.to_string()),
        count: Some(children.len() as i64),
        children: children.iter().map(|c| c.to_string()).collect(),
        depth: None,
    }
}

pub fn child_record(raw: RawComment) -> ChildRecord {
    ChildRecord::from_raw(raw, "unused", T0).unwrap()
}

#[derive(Clone, Default)]
pub struct Thread {
    pub comments: Vec<RawComment>,
    pub more: Vec<RawContinuation>,
}

/// In-memory listing API.
/// - `new` listings return every post newest-first
/// - `top` listings return posts inside the requested window, highest score first; with
///   `ranked_from` set they return posts within the time filter's span before that instant
/// - `after` is the fullname of the last item of the previous page
#[derive(Default)]
pub struct FakeApi {
    pub posts: Vec<RawPost>,
    pub threads: HashMap<String, Thread>,
    /// Placeholder ID -> what expanding it returns.
    pub expansions: HashMap<String, Thread>,
    /// Fail this many upcoming calls (of any kind) with a 503.
    pub fail_next: AtomicUsize,
    /// Listing requests whose window contains this timestamp fail with a 403.
    pub fatal_window_containing: Option<i64>,
    /// Answer `top` listings the way the live API does, counting the filter back from here.
    pub ranked_from: Option<i64>,
    /// Time filter of every listing request, in arrival order.
    pub time_filters: Mutex<Vec<Option<TimeFilter>>>,
    /// Cancel the token once this many listing calls have been served.
    pub cancel_after_listings: Mutex<Option<(usize, CancelToken)>>,
    pub listing_calls: AtomicUsize,
    pub reply_calls: AtomicUsize,
    pub expand_calls: AtomicUsize,
}

impl FakeApi {
    pub fn with_posts(posts: Vec<RawPost>) -> Self {
        Self { posts, ..Default::default() }
    }

    fn take_failure(&self) -> Option<FetchError> {
        let taken = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        taken.then(|| FetchError::from_status(503, None, "service unavailable"))
    }

    fn thread_page(t: Option<&Thread>) -> ReplyPage {
        t.map(|t| ReplyPage { comments: t.comments.clone(), continuations: t.more.clone(), rate: None })
            .unwrap_or_default()
    }
}

impl ListingApi for FakeApi {
    fn list_parents(&self, req: &ListingRequest<'_>) -> Result<ListingPage, FetchError> {
        let served = self.listing_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.time_filters.lock().unwrap().push(req.time_filter);
        if let Some((n, token)) = self.cancel_after_listings.lock().unwrap().as_ref() {
            if served >= *n {
                token.cancel();
            }
        }
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        if self.fatal_window_containing.is_some_and(|ts| req.window.contains(ts)) {
            return Err(FetchError::from_status(403, None, "forbidden"));
        }

        let mut listing: Vec<&RawPost> = match req.strategy {
            Strategy::New => {
                let mut v: Vec<&RawPost> = self.posts.iter().collect();
                v.sort_by(|a, b| b.created_utc.partial_cmp(&a.created_utc).unwrap());
                v
            }
            Strategy::Top(_) => {
                let ranked = |c: i64| match self.ranked_from {
                    Some(now) => {
                        let span = req.time_filter.and_then(TimeFilter::span_secs).unwrap_or(i64::MAX);
                        c <= now && now - c <= span
                    }
                    None => req.window.contains(c),
                };
                let mut v: Vec<&RawPost> =
                    self.posts.iter().filter(|p| p.created_utc.is_some_and(|c| ranked(c as i64))).collect();
                v.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
                v
            }
        };
        let start = match req.after {
            Some(after) => listing.iter().position(|p| p.name.as_deref() == Some(after)).map_or(listing.len(), |i| i + 1),
            None => 0,
        };
        let rest = listing.split_off(start.min(listing.len()));
        let page: Vec<RawPost> = rest.iter().take(req.limit).map(|p| (*p).clone()).collect();
        let after = if rest.len() > page.len() { page.last().and_then(|p| p.name.clone()) } else { None };
        Ok(ListingPage { items: page, after, rate: None })
    }

    fn fetch_replies(&self, _source: &str, parent_id: &str) -> Result<ReplyPage, FetchError> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(Self::thread_page(self.threads.get(parent_id)))
    }

    fn expand_continuation(&self, _source: &str, more: &Continuation) -> Result<ReplyPage, FetchError> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(Self::thread_page(self.expansions.get(&more.id)))
    }
}

pub fn alpha_post_id(i: usize) -> String {
    format!("p{i:03}")
}

pub fn alpha_created(i: usize) -> i64 {
    T0 + i as i64 * 9 * HOUR + HOUR
}

/// Scenario "alpha": 120 posts spread over 45 days with 300 nested replies.
/// - posts `p000..p119` every 9 hours, authors `user0..user6`
/// - posts below 60 carry a 3-reply chain `a <- b <- c`, the rest a 2-reply chain `a <- b`
/// - reply authors cycle through `user0..user8`; every 15th thread's first reply is deleted
/// - threads 10, 30, 40, 50 withhold `c` behind a placeholder
/// - thread 0 withholds `b` behind a placeholder whose expansion withholds `c` behind another
/// - thread 20 withholds `b` and `c` behind one placeholder that returns them out of order
pub fn alpha_api() -> FakeApi {
    let mut api = FakeApi::default();
    for i in 0..120usize {
        let id = alpha_post_id(i);
        let created = alpha_created(i);
        let author = format!("user{}", i % 7);
        api.posts.push(post(&id, created, Some(&author), ((i * 37) % 101) as i64));

        let depth = if i < 60 { 3 } else { 2 };
        let mut chain = Vec::new();
        for k in 0..depth {
            let cid = format!("c{i:03}{}", ['a', 'b', 'c'][k]);
            let parent = if k == 0 { format!("t3_{id}") } else { format!("t1_c{i:03}{}", ['a', 'b', 'c'][k - 1]) };
            let user = format!("user{}", (i + k) % 9);
            let author = if k == 0 && i % 15 == 0 { None } else { Some(user.as_str()) };
            chain.push(comment(&cid, &parent, &id, created + (k as i64 + 1) * 60, author));
        }

        let thread = match i {
            0 => {
                let m0 = more("m000", "t1_c000a", &["c000b"]);
                let m0x = more("m000x", "t1_c000b", &["c000c"]);
                api.expansions.insert("m000".into(), Thread { comments: vec![chain[1].clone()], more: vec![m0x] });
                api.expansions.insert("m000x".into(), Thread { comments: vec![chain[2].clone()], more: vec![] });
                Thread { comments: vec![chain[0].clone()], more: vec![m0] }
            }
            20 => {
                let m = more("m020", "t1_c020a", &["c020b", "c020c"]);
                api.expansions
                    .insert("m020".into(), Thread { comments: vec![chain[2].clone(), chain[1].clone()], more: vec![] });
                Thread { comments: vec![chain[0].clone()], more: vec![m] }
            }
            10 | 30 | 40 | 50 => {
                let mid = format!("m{i:03}");
                let m = more(&mid, &format!("t1_c{i:03}b"), &[format!("c{i:03}c").as_str()]);
                api.expansions.insert(mid, Thread { comments: vec![chain[2].clone()], more: vec![] });
                Thread { comments: chain[..2].to_vec(), more: vec![m] }
            }
            _ => Thread { comments: chain, more: vec![] },
        };
        api.threads.insert(id, thread);
    }
    api
}

/// `RecordSink` over a real store that rejects chosen parent batches and can fail the
/// first few child batches transiently.
pub struct FlakySink {
    pub inner: SqliteStore,
    /// Any parent batch containing one of these IDs always fails.
    pub poison_parents: HashSet<String>,
    /// Child batch attempts that fail before the store is reached.
    pub child_failures: AtomicUsize,
    pub parent_attempts: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: SqliteStore) -> Self {
        Self { inner, poison_parents: HashSet::new(), child_failures: AtomicUsize::new(0), parent_attempts: AtomicUsize::new(0) }
    }
}

impl RecordSink for FlakySink {
    fn upsert_actors(&self, batch: &[Actor]) -> Result<usize, WriteError> {
        self.inner.upsert_actors(batch)
    }

    fn upsert_parents(&self, batch: &[ParentRecord]) -> Result<usize, WriteError> {
        self.parent_attempts.fetch_add(1, Ordering::SeqCst);
        if batch.iter().any(|p| self.poison_parents.contains(&p.id)) {
            return Err(WriteError::failure("disk I/O error"));
        }
        self.inner.upsert_parents(batch)
    }

    fn upsert_children(&self, batch: &[ChildRecord]) -> Result<usize, WriteError> {
        let failed = self
            .child_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(WriteError::failure("database is locked"));
        }
        self.inner.upsert_children(batch)
    }

    fn upsert_thread_stats(&self, batch: &[ParentStats]) -> Result<usize, WriteError> {
        self.inner.upsert_thread_stats(batch)
    }
}

pub fn edited_post(id: &str, created: i64, author: Option<&str>, edited: i64, title: &str) -> RawPost {
    let mut p = post(id, created, author, 1);
    p.edited = Some(json!(edited as f64));
    p.title = Some(title.to_string());
    p
}
