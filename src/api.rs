//! Remote listing API: raw wire types, the `ListingApi` seam, and a blocking HTTP client.
//!
//! Raw types mirror the JSON listing objects. Everything optional stays optional here;
//! `model` decides what is required.

use crate::date::TimeFilter;
use crate::error::FetchError;
use crate::model::{Continuation, ThingPrefix};
use crate::window::{Strategy, Window};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Post as returned by a listing. Unknown fields are kept in `extra`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawPost {
    pub id: Option<String>,
    pub name: Option<String>,
    pub author: Option<String>,
    pub author_fullname: Option<String>,
    pub created_utc: Option<f64>,
    pub edited: Option<Value>,
    pub title: Option<String>,
    pub selftext: Option<String>,
    pub score: Option<i64>,
    pub num_comments: Option<i64>,
    pub url: Option<String>,
    pub permalink: Option<String>,
    #[serde(default)]
    pub stickied: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reply as returned inside a comment tree (nested `replies` already flattened away).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawComment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub link_id: Option<String>,
    pub author: Option<String>,
    pub author_fullname: Option<String>,
    pub body: Option<String>,
    pub score: Option<i64>,
    pub ups: Option<i64>,
    pub downs: Option<i64>,
    pub created_utc: Option<f64>,
    pub edited: Option<Value>,
    pub gilded: Option<i64>,
    #[serde(default)]
    pub stickied: bool,
    pub distinguished: Option<String>,
    #[serde(default)]
    pub is_submitter: bool,
    #[serde(default)]
    pub collapsed: bool,
    pub collapsed_reason: Option<String>,
    pub controversiality: Option<i64>,
    pub permalink: Option<String>,
    pub depth: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `more` placeholder object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawContinuation {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub count: Option<i64>,
    #[serde(default)]
    pub children: Vec<String>,
    pub depth: Option<i64>,
}

/// Server view of the shared request budget.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateHint {
    pub remaining: f64,
    pub reset_after: Duration,
}

/// One page request for a parent listing.
#[derive(Clone, Debug)]
pub struct ListingRequest<'a> {
    pub source: &'a str,
    pub strategy: Strategy,
    pub window: Window,
    /// Ranked listings only. Wide enough to reach back to `window.start`.
    pub time_filter: Option<TimeFilter>,
    pub after: Option<&'a str>,
    pub limit: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    pub items: Vec<RawPost>,
    /// Cursor for the next page; `None` means the listing is exhausted.
    pub after: Option<String>,
    pub rate: Option<RateHint>,
}

/// Replies and placeholders for one post or one expanded placeholder.
#[derive(Clone, Debug, Default)]
pub struct ReplyPage {
    pub comments: Vec<RawComment>,
    pub continuations: Vec<RawContinuation>,
    pub rate: Option<RateHint>,
}

/// Remote API seam.
pub trait ListingApi: Send + Sync {
    fn list_parents(&self, req: &ListingRequest<'_>) -> Result<ListingPage, FetchError>;
    fn fetch_replies(&self, source: &str, parent_id: &str) -> Result<ReplyPage, FetchError>;
    fn expand_continuation(&self, source: &str, more: &Continuation) -> Result<ReplyPage, FetchError>;
}

/// HTTP client settings. The access token is treated as opaque.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_agent: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://oauth.reddit.com".to_string(),
            user_agent: concat!("rfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    /// Overlay `RFETCH_API_BASE`, `RFETCH_USER_AGENT`, `RFETCH_ACCESS_TOKEN` and
    /// `RFETCH_HTTP_TIMEOUT_SECS` on the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("RFETCH_API_BASE") {
            if !v.trim().is_empty() { cfg.base_url = v.trim().to_string(); }
        }
        if let Ok(v) = std::env::var("RFETCH_USER_AGENT") {
            if !v.trim().is_empty() { cfg.user_agent = v.trim().to_string(); }
        }
        if let Ok(v) = std::env::var("RFETCH_ACCESS_TOKEN") {
            if !v.trim().is_empty() { cfg.access_token = Some(v.trim().to_string()); }
        }
        match std::env::var("RFETCH_HTTP_TIMEOUT_SECS").ok().map(|v| v.trim().parse::<u64>()) {
            Some(Ok(secs)) => cfg.timeout = Duration::from_secs(secs.max(1)),
            Some(Err(_)) => tracing::warn!("RFETCH_HTTP_TIMEOUT_SECS is not a number; using {:?}", cfg.timeout),
            None => {}
        }
        cfg
    }
}

// morechildren accepts at most this many IDs per call.
const MORE_CHILDREN_MAX: usize = 100;

pub struct HttpListingApi {
    cfg: ApiConfig,
    agent: ureq::Agent,
}

impl HttpListingApi {
    pub fn new(cfg: ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(cfg.timeout)
            .timeout_connect(cfg.connect_timeout)
            .user_agent(&cfg.user_agent)
            .build();
        Self { cfg, agent }
    }

    fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<(Value, Option<RateHint>), FetchError> {
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);
        let mut req = self.agent.get(&url);
        for (k, v) in query {
            req = req.query(k, v);
        }
        if let Some(token) = &self.cfg.access_token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        tracing::debug!("GET {url} {:?}", query);
        match req.call() {
            Ok(resp) => {
                let rate = rate_hint(&resp);
                let v: Value = resp
                    .into_json()
                    .map_err(|e| FetchError::network(format!("decode {url}: {e}")))?;
                Ok((v, rate))
            }
            Err(ureq::Error::Status(code, resp)) => {
                let wait = retry_after(&resp);
                Err(FetchError::from_status(code, wait, format!("GET {url} returned {code}")))
            }
            Err(ureq::Error::Transport(t)) => Err(FetchError::network(format!("GET {url}: {t}"))),
        }
    }
}

impl ListingApi for HttpListingApi {
    fn list_parents(&self, req: &ListingRequest<'_>) -> Result<ListingPage, FetchError> {
        let path = format!("/r/{}/{}.json", req.source, req.strategy.listing());
        let mut query = vec![("limit", req.limit.to_string()), ("raw_json", "1".to_string())];
        if let Some(t) = req.time_filter {
            query.push(("t", t.api_name().to_string()));
        }
        if let Some(after) = req.after {
            query.push(("after", after.to_string()));
        }
        let (v, rate) = self.get_json(&path, &query)?;

        let mut page = ListingPage { rate, ..Default::default() };
        for child in v.pointer("/data/children").and_then(Value::as_array).into_iter().flatten() {
            if child.get("kind").and_then(Value::as_str) != Some("t3") {
                continue;
            }
            match serde_json::from_value::<RawPost>(child.get("data").cloned().unwrap_or(Value::Null)) {
                Ok(p) => page.items.push(p),
                Err(e) => tracing::warn!("skipping undecodable post in r/{}: {e}", req.source),
            }
        }
        page.after = v.pointer("/data/after").and_then(Value::as_str).map(str::to_string);
        Ok(page)
    }

    fn fetch_replies(&self, source: &str, parent_id: &str) -> Result<ReplyPage, FetchError> {
        let path = format!("/r/{source}/comments/{parent_id}.json");
        let query = [("limit", "500".to_string()), ("raw_json", "1".to_string())];
        let (v, rate) = self.get_json(&path, &query)?;
        let mut page = ReplyPage { rate, ..Default::default() };
        // [post listing, comment listing]
        if let Some(listing) = v.get(1) {
            collect_listing(listing, &mut page);
        }
        Ok(page)
    }

    fn expand_continuation(&self, source: &str, more: &Continuation) -> Result<ReplyPage, FetchError> {
        if more.children.is_empty() {
            // "continue this thread": re-root the tree at the placeholder's parent reply.
            let path = format!("/r/{source}/comments/{}.json", more.link_id);
            let query = [
                ("comment", more.parent_ref.id().to_string()),
                ("limit", "500".to_string()),
                ("raw_json", "1".to_string()),
            ];
            let (v, rate) = self.get_json(&path, &query)?;
            let mut page = ReplyPage { rate, ..Default::default() };
            if let Some(listing) = v.get(1) {
                collect_listing(listing, &mut page);
            }
            return Ok(page);
        }

        let (batch, rest) = more.children.split_at(more.children.len().min(MORE_CHILDREN_MAX));
        let query = [
            ("link_id", ThingPrefix::Link.fullname(&more.link_id)),
            ("children", batch.join(",")),
            ("api_type", "json".to_string()),
            ("limit_children", "false".to_string()),
            ("raw_json", "1".to_string()),
        ];
        let (v, rate) = self.get_json("/api/morechildren.json", &query)?;
        let mut page = ReplyPage { rate, ..Default::default() };
        for thing in v.pointer("/json/data/things").and_then(Value::as_array).into_iter().flatten() {
            collect_thing(thing, &mut page);
        }
        if !rest.is_empty() {
            page.continuations.push(RawContinuation {
                id: Some(format!("{}+{}", more.id, batch.len())),
                parent_id: Some(more.parent_ref.fullname()),
                count: Some(rest.len() as i64),
                children: rest.to_vec(),
                depth: None,
            });
        }
        Ok(page)
    }
}

fn collect_listing(listing: &Value, out: &mut ReplyPage) {
    for thing in listing.pointer("/data/children").and_then(Value::as_array).into_iter().flatten() {
        collect_thing(thing, out);
    }
}

/// Flatten one `t1`/`more` thing (and any nested replies) into `out`.
fn collect_thing(thing: &Value, out: &mut ReplyPage) {
    let mut data = thing.get("data").cloned().unwrap_or(Value::Null);
    match thing.get("kind").and_then(Value::as_str) {
        Some("t1") => {
            let replies = data.as_object_mut().and_then(|m| m.remove("replies"));
            match serde_json::from_value::<RawComment>(data) {
                Ok(c) => out.comments.push(c),
                Err(e) => tracing::warn!("skipping undecodable reply: {e}"),
            }
            // `replies` is "" when empty, else a nested listing.
            if let Some(nested) = replies.filter(Value::is_object) {
                collect_listing(&nested, out);
            }
        }
        Some("more") => match serde_json::from_value::<RawContinuation>(data) {
            Ok(m) => out.continuations.push(m),
            Err(e) => tracing::warn!("skipping undecodable placeholder: {e}"),
        },
        _ => {}
    }
}

fn header_secs(resp: &ureq::Response, name: &str) -> Option<f64> {
    resp.header(name).and_then(|v| v.trim().parse::<f64>().ok()).filter(|s| s.is_finite() && *s >= 0.0)
}

fn rate_hint(resp: &ureq::Response) -> Option<RateHint> {
    let remaining = header_secs(resp, "x-ratelimit-remaining")?;
    let reset = header_secs(resp, "x-ratelimit-reset")?;
    Some(RateHint { remaining, reset_after: Duration::from_secs_f64(reset) })
}

fn retry_after(resp: &ureq::Response) -> Option<Duration> {
    header_secs(resp, "retry-after")
        .or_else(|| header_secs(resp, "x-ratelimit-reset"))
        .map(Duration::from_secs_f64)
}
