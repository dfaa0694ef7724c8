mod config;
mod date;
mod error;
mod model;
mod api;

mod window;
mod retry;
mod concurrency;
mod fetcher;
mod dedupe;
mod thread;
mod aggregate;

mod checkpoint;
mod writer;
mod store;
mod progress;
mod util;
mod pipeline;

pub use crate::config::HarvestOptions;
pub use crate::date::{format_ts, now_ts, parse_timestamp, to_datetime, Period, TimeFilter, DAY_SECS, HOUR_SECS, WEEK_SECS};
pub use crate::pipeline::{Harvester, RunSummary};

// error taxonomy
pub use crate::error::{ErrorKind, FetchError, PlanError, Retryable, RunError, TransientKind, WriteError};

// records and the API seam
pub use crate::model::{Actor, ChildRecord, Continuation, Distinguished, ParentRecord, ParentRef, ThingPrefix, ValidationError};
pub use crate::api::{
    ApiConfig, HttpListingApi, ListingApi, ListingPage, ListingRequest, RateHint, RawComment, RawContinuation, RawPost,
    ReplyPage,
};

// planning, fetching, assembly
pub use crate::window::{PlannedWindow, PlannerCfg, Strategy, Window, WindowPlanner};
pub use crate::retry::{retry, RetryPolicy};
pub use crate::concurrency::{CancelToken, CreditBudget, WorkerPool};
pub use crate::fetcher::{FetchCfg, PaginatedFetcher, Replies, StopReason, WindowPages};
pub use crate::dedupe::{DedupeStats, Deduplicator, Keyed, Offer, SeenIds};
pub use crate::thread::{Assembly, Orphan, OrphanReason, Resolution, ThreadAssembler};
pub use crate::aggregate::{aggregate_by_parent, thread_stats, Aggregator, ParentStats, ThreadAgg, ThreadStats};

// persistence
pub use crate::checkpoint::{Checkpoint, CheckpointStore, RunAudit, RunCounts, RunHandle, RunStatus};
pub use crate::writer::{DependencyOrderedWriter, RecordSink, Stage, WriteReport, WriteSet};
pub use crate::store::SqliteStore;

// telemetry and logging
pub use crate::progress::{make_count_progress, NoTelemetry, ProgressTelemetry, RunEvent, Telemetry, TracingTelemetry};
pub use crate::util::{init_tracing_once, normalize_source};
