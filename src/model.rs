//! Typed records validated at the API boundary: parents (posts), children (replies),
//! actors (authors) and continuation placeholders.

use crate::api::{RawComment, RawContinuation, RawPost};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

pub const DELETED_BODY: &str = "[deleted]";
pub const REMOVED_BODY: &str = "[removed]";
const PERMALINK_HOST: &str = "https://reddit.com";

/// Type prefixes of API fullnames (`t3_abc123`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThingPrefix {
    Comment,
    Account,
    Link,
    Message,
    Subreddit,
    Award,
}

impl ThingPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            ThingPrefix::Comment => "t1_",
            ThingPrefix::Account => "t2_",
            ThingPrefix::Link => "t3_",
            ThingPrefix::Message => "t4_",
            ThingPrefix::Subreddit => "t5_",
            ThingPrefix::Award => "t6_",
        }
    }

    pub fn strip(self, fullname: &str) -> Option<&str> {
        fullname.strip_prefix(self.as_str()).filter(|s| !s.is_empty())
    }

    pub fn fullname(self, id: &str) -> String {
        format!("{}{}", self.as_str(), id)
    }
}

/// What a reply hangs off: the post itself or another reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    Parent(String),
    Child(String),
}

impl ParentRef {
    /// Parse a `t3_`/`t1_` fullname.
    pub fn parse(fullname: &str) -> Option<Self> {
        if let Some(id) = ThingPrefix::Link.strip(fullname) {
            Some(ParentRef::Parent(id.to_string()))
        } else {
            ThingPrefix::Comment.strip(fullname).map(|id| ParentRef::Child(id.to_string()))
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ParentRef::Parent(id) | ParentRef::Child(id) => id,
        }
    }

    pub fn fullname(&self) -> String {
        match self {
            ParentRef::Parent(id) => ThingPrefix::Link.fullname(id),
            ParentRef::Child(id) => ThingPrefix::Comment.fullname(id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Distinguished {
    Moderator,
    Admin,
    Special,
}

impl Distinguished {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "moderator" => Some(Distinguished::Moderator),
            "admin" => Some(Distinguished::Admin),
            "special" => Some(Distinguished::Special),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Distinguished::Moderator => "moderator",
            Distinguished::Admin => "admin",
            Distinguished::Special => "special",
        }
    }
}

/// Distinct author identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
}

impl Actor {
    /// Actor for an author field; `None` for deleted or missing authors.
    /// The account fullname is the identity when present, else the name.
    pub fn from_author(name: Option<&str>, fullname: Option<&str>) -> Option<Self> {
        let name = name.map(str::trim).filter(|n| !n.is_empty())?;
        if name == DELETED_BODY || name == REMOVED_BODY {
            return None;
        }
        let id = fullname.map(str::trim).filter(|f| !f.is_empty()).unwrap_or(name);
        Some(Self { id: id.to_string(), name: name.to_string() })
    }
}

/// Top-level post.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParentRecord {
    pub id: String,
    pub source: String,
    pub created_utc: i64,
    pub edited_at: Option<i64>,
    pub author_ref: Option<String>,
    pub author_name: Option<String>,
    pub title: String,
    pub selftext: Option<String>,
    pub score: i64,
    pub num_comments: i64,
    pub url: Option<String>,
    pub permalink: Option<String>,
    pub stickied: bool,
    pub retrieved_at: i64,
    /// Full raw object as returned by the API.
    pub payload: Value,
}

impl ParentRecord {
    pub fn from_raw(raw: RawPost, source: &str, retrieved_at: i64) -> Result<Self, ValidationError> {
        let payload = serde_json::to_value(&raw).unwrap_or(Value::Null);
        let id = required_id(raw.id.as_deref(), raw.name.as_deref(), ThingPrefix::Link)?;
        let created_utc = raw.created_utc.ok_or(ValidationError::MissingField("created_utc"))? as i64;
        let actor = Actor::from_author(raw.author.as_deref(), raw.author_fullname.as_deref());
        Ok(Self {
            id,
            source: source.to_string(),
            created_utc,
            edited_at: parse_edited(raw.edited.as_ref()),
            author_ref: actor.map(|a| a.id),
            author_name: raw.author,
            title: raw.title.unwrap_or_default(),
            selftext: raw.selftext,
            score: raw.score.unwrap_or(0),
            num_comments: raw.num_comments.unwrap_or(0),
            url: raw.url,
            permalink: raw.permalink.map(absolute_permalink),
            stickied: raw.stickied,
            retrieved_at,
            payload,
        })
    }

    pub fn fullname(&self) -> String {
        ThingPrefix::Link.fullname(&self.id)
    }

    pub fn actor(&self) -> Option<Actor> {
        let fullname = self.payload.get("author_fullname").and_then(Value::as_str);
        Actor::from_author(self.author_name.as_deref(), fullname)
    }
}

/// Reply. `depth` is recomputed by the thread assembler; `api_depth` is kept
/// only as what the API claimed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChildRecord {
    pub id: String,
    /// Root post this reply belongs to.
    pub parent_id: String,
    pub parent_ref: ParentRef,
    pub depth: u32,
    pub api_depth: Option<i64>,
    pub created_utc: i64,
    pub edited_at: Option<i64>,
    pub author_ref: Option<String>,
    pub author_name: Option<String>,
    pub body: String,
    pub score: i64,
    pub ups: i64,
    pub downs: i64,
    pub gilded: i64,
    pub stickied: bool,
    pub distinguished: Option<Distinguished>,
    pub is_submitter: bool,
    pub collapsed: bool,
    pub collapsed_reason: Option<String>,
    pub controversiality: i64,
    pub permalink: Option<String>,
    pub retrieved_at: i64,
    pub is_deleted: bool,
    pub is_removed: bool,
    pub payload: Value,
}

impl ChildRecord {
    /// `link_id` is the root post when the raw item omits it.
    pub fn from_raw(raw: RawComment, link_id: &str, retrieved_at: i64) -> Result<Self, ValidationError> {
        let payload = serde_json::to_value(&raw).unwrap_or(Value::Null);
        let id = required_id(raw.id.as_deref(), raw.name.as_deref(), ThingPrefix::Comment)?;
        let parent_full = raw.parent_id.as_deref().ok_or(ValidationError::MissingField("parent_id"))?;
        let parent_ref =
            ParentRef::parse(parent_full).ok_or_else(|| ValidationError::BadReference(parent_full.to_string()))?;
        let parent_id = match raw.link_id.as_deref() {
            Some(link) => ThingPrefix::Link
                .strip(link)
                .ok_or_else(|| ValidationError::BadReference(link.to_string()))?
                .to_string(),
            None => link_id.to_string(),
        };
        let created_utc = raw.created_utc.ok_or(ValidationError::MissingField("created_utc"))? as i64;
        let body = raw.body.unwrap_or_default();
        let author_gone = raw.author.as_deref().map_or(true, |a| a == DELETED_BODY);
        let is_deleted = author_gone && body == DELETED_BODY;
        let is_removed = body == REMOVED_BODY;
        let actor = Actor::from_author(raw.author.as_deref(), raw.author_fullname.as_deref());
        Ok(Self {
            id,
            parent_id,
            parent_ref,
            depth: 0,
            api_depth: raw.depth,
            created_utc,
            edited_at: parse_edited(raw.edited.as_ref()),
            author_ref: actor.map(|a| a.id),
            author_name: raw.author,
            body,
            score: raw.score.unwrap_or(0),
            ups: raw.ups.unwrap_or(0),
            downs: raw.downs.unwrap_or(0),
            gilded: raw.gilded.unwrap_or(0),
            stickied: raw.stickied,
            distinguished: raw.distinguished.as_deref().and_then(Distinguished::parse),
            is_submitter: raw.is_submitter,
            collapsed: raw.collapsed,
            collapsed_reason: raw.collapsed_reason,
            controversiality: raw.controversiality.unwrap_or(0),
            permalink: raw.permalink.map(absolute_permalink),
            retrieved_at,
            is_deleted,
            is_removed,
            payload,
        })
    }

    pub fn actor(&self) -> Option<Actor> {
        let fullname = self.payload.get("author_fullname").and_then(Value::as_str);
        Actor::from_author(self.author_name.as_deref(), fullname)
    }
}

/// Placeholder for replies the API left out of a tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Continuation {
    pub id: String,
    /// Root post the omitted replies belong to.
    pub link_id: String,
    pub parent_ref: ParentRef,
    /// IDs of omitted replies. Empty means "continue this thread" below `parent_ref`.
    pub children: Vec<String>,
    pub count: i64,
}

impl Continuation {
    pub fn from_raw(raw: RawContinuation, link_id: &str) -> Result<Self, ValidationError> {
        let parent_full = raw.parent_id.as_deref().ok_or(ValidationError::MissingField("parent_id"))?;
        let parent_ref =
            ParentRef::parse(parent_full).ok_or_else(|| ValidationError::BadReference(parent_full.to_string()))?;
        Ok(Self {
            id: raw.id.unwrap_or_else(|| "_".to_string()),
            link_id: link_id.to_string(),
            parent_ref,
            children: raw.children,
            count: raw.count.unwrap_or(0),
        })
    }

    /// Placeholder IDs are not unique ("_" for thread continuations), so key on position too.
    pub fn key(&self) -> String {
        format!("{}:{}:{}:{}", self.link_id, self.parent_ref.fullname(), self.id, self.children.join(","))
    }
}

/// Raw item rejected at the API boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    MissingField(&'static str),
    BadReference(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "missing required field '{field}'"),
            ValidationError::BadReference(r) => write!(f, "unrecognized reference '{r}'"),
        }
    }
}

impl std::error::Error for ValidationError {}

fn required_id(id: Option<&str>, fullname: Option<&str>, prefix: ThingPrefix) -> Result<String, ValidationError> {
    id.map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| fullname.and_then(|f| prefix.strip(f)))
        .map(str::to_string)
        .ok_or(ValidationError::MissingField("id"))
}

/// `edited` is `false` or an epoch timestamp.
pub fn parse_edited(v: Option<&Value>) -> Option<i64> {
    v.and_then(Value::as_f64).map(|ts| ts as i64)
}

fn absolute_permalink(p: String) -> String {
    if p.starts_with('/') { format!("{PERMALINK_HOST}{p}") } else { p }
}
