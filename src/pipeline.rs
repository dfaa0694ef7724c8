//! Run orchestration: plan, fetch windows, fetch and assemble reply trees, write in
//! dependency order, then settle the checkpoint and the audit row.

use crate::aggregate::{thread_stats, ParentStats};
use crate::api::ListingApi;
use crate::checkpoint::{Checkpoint, CheckpointStore, RunCounts, RunHandle, RunStatus};
use crate::concurrency::{CancelToken, CreditBudget, WorkerPool};
use crate::config::HarvestOptions;
use crate::dedupe::Deduplicator;
use crate::error::{ErrorKind, FetchError, RunError};
use crate::fetcher::{PaginatedFetcher, Replies, StopReason};
use crate::model::{Actor, ChildRecord, Continuation, ParentRecord};
use crate::progress::{ProgressTelemetry, RunEvent, Telemetry, TracingTelemetry};
use crate::store::SqliteStore;
use crate::thread::{Orphan, OrphanReason, ThreadAssembler};
use crate::util::{init_tracing_once, normalize_source};
use crate::window::{PlannedWindow, Window, WindowPlanner};
use crate::writer::{DependencyOrderedWriter, RecordSink, WriteReport, WriteSet};
use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

/// Outcome of one `fetch_source_data` call.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub parents_written: u64,
    pub children_written: u64,
    pub actors_written: u64,
    pub aggregates_written: u64,
    pub parents_fetched: u64,
    pub children_fetched: u64,
    pub orphans: u64,
    pub windows_planned: usize,
    pub windows_failed: usize,
    /// Span actually planned (after applying the checkpoint).
    pub window: Option<Window>,
    /// Checkpoint in effect when the run finished.
    pub checkpoint: Option<Checkpoint>,
    pub errors: Vec<RunError>,
}

impl RunSummary {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            run_id: None,
            status: RunStatus::Succeeded,
            parents_written: 0,
            children_written: 0,
            actors_written: 0,
            aggregates_written: 0,
            parents_fetched: 0,
            children_fetched: 0,
            orphans: 0,
            windows_planned: 0,
            windows_failed: 0,
            window: None,
            checkpoint: None,
            errors: Vec::new(),
        }
    }

    fn failed(mut self, err: RunError) -> Self {
        self.status = RunStatus::Failed;
        self.errors.push(err);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn written(&self) -> u64 {
        self.parents_written + self.children_written + self.actors_written + self.aggregates_written
    }

    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &RunError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

struct WindowOutcome {
    parents: usize,
    error: Option<FetchError>,
    cancelled: bool,
}

struct ReplyOutcome {
    parent_id: String,
    result: Option<Result<Replies, FetchError>>,
}

pub struct Harvester {
    opts: HarvestOptions,
    api: Arc<dyn ListingApi>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    telemetry: Arc<dyn Telemetry>,
    pool: WorkerPool,
    credits: CreditBudget,
    cancel: CancelToken,
    planner: WindowPlanner,
    assembler: ThreadAssembler,
}

impl Harvester {
    pub fn new(
        opts: HarvestOptions,
        api: Arc<dyn ListingApi>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        init_tracing_once();
        let pool = WorkerPool::new(opts.parallelism)?;
        Ok(Self {
            planner: WindowPlanner::new(opts.planner.clone()),
            assembler: ThreadAssembler::new(opts.continuation_rounds).with_threshold(opts.continuation_threshold),
            opts,
            api,
            sink,
            checkpoints,
            telemetry,
            pool,
            credits: CreditBudget::new(),
            cancel: CancelToken::new(),
        })
    }

    /// Records and checkpoints both go to `store`.
    pub fn with_sqlite(
        opts: HarvestOptions,
        api: Arc<dyn ListingApi>,
        store: Arc<SqliteStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        let sink: Arc<dyn RecordSink> = store.clone();
        Self::new(opts, api, sink, store, telemetry)
    }

    /// Progress bars when `opts.progress` is set, log lines otherwise.
    pub fn default_telemetry(opts: &HarvestOptions) -> Arc<dyn Telemetry> {
        if opts.progress {
            Arc::new(ProgressTelemetry::new())
        } else {
            Arc::new(TracingTelemetry)
        }
    }

    pub fn options(&self) -> &HarvestOptions {
        &self.opts
    }

    /// Token checked between page fetches, reply fetches and write batches.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fetch `[start, end)` from `source` and persist it. `batch_size == 0` uses the
    /// configured batch size. With `incremental`, planning starts at the source's checkpoint.
    pub fn fetch_source_data(
        &self,
        source_name: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        include_replies: bool,
        batch_size: usize,
        incremental: bool,
    ) -> RunSummary {
        let source = normalize_source(source_name);
        let mut summary = RunSummary::new(&source);
        if source.is_empty() {
            return summary.failed(RunError::new(ErrorKind::PlannerMisconfiguration, "source name is empty"));
        }

        if let Err(e) = self.checkpoints.ensure_source(&source) {
            return summary.failed(RunError::new(ErrorKind::WriteFailure, format!("storage unavailable: {e:#}")));
        }
        let checkpoint = if incremental {
            match self.checkpoints.checkpoint(&source) {
                Ok(cp) => cp,
                Err(e) => {
                    return summary
                        .failed(RunError::new(ErrorKind::WriteFailure, format!("storage unavailable: {e:#}")))
                }
            }
        } else {
            None
        };
        summary.checkpoint = checkpoint.clone();

        let (start_ts, end_ts) = (start.unix_timestamp(), end.unix_timestamp());
        let plan = match self.planner.plan(start_ts, end_ts, checkpoint.as_ref().map(|c| c.at)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("{}: {}", source, e);
                return summary.failed(RunError::new(ErrorKind::PlannerMisconfiguration, e.to_string()));
            }
        };
        if plan.is_empty() {
            tracing::info!("{}: checkpoint already covers the requested range; nothing to fetch", source);
            self.telemetry.event(&RunEvent::Finished { source: source.clone(), status: RunStatus::Succeeded });
            return summary;
        }

        let span = Window::new(plan.iter().map(|p| p.window.start).min().unwrap_or(start_ts), end_ts);
        summary.window = Some(span);
        summary.windows_planned = plan.len();
        let handle = match self.checkpoints.record_run_start(&source, span) {
            Ok(h) => h,
            Err(e) => {
                return summary.failed(RunError::new(ErrorKind::WriteFailure, format!("storage unavailable: {e:#}")))
            }
        };
        summary.run_id = Some(handle.run_id.clone());
        tracing::info!("{}: run {} over {} in {} windows", source, handle.run_id, span, plan.len());
        self.telemetry.event(&RunEvent::Planned { source: source.clone(), windows: plan.len() });

        let fetcher = PaginatedFetcher::new(
            self.api.as_ref(),
            &self.opts.retry,
            &self.credits,
            &self.cancel,
            self.opts.fetch_cfg(),
        );

        // Listings
        let parents = self.fetch_windows(&fetcher, &source, &plan, &mut summary);

        // Reply trees
        let mut stats_excluded: AHashSet<String> = AHashSet::new();
        let (children, orphans) = if include_replies && !self.cancel.is_cancelled() {
            self.fetch_threads(&fetcher, &source, &parents, &mut stats_excluded, &mut summary)
        } else {
            (Vec::new(), Vec::new())
        };
        summary.orphans = orphans.len() as u64;
        report_orphans(&orphans, &mut summary);

        let stats: Vec<ParentStats> = if include_replies {
            thread_stats(&parents, &children)
                .into_iter()
                .filter(|s| !stats_excluded.contains(&s.parent_id))
                .collect()
        } else {
            Vec::new()
        };
        let actors = collect_actors(&parents, &children);
        let cursor = parents
            .iter()
            .max_by(|a, b| (a.created_utc, &a.id).cmp(&(b.created_utc, &b.id)))
            .map(ParentRecord::fullname);

        if self.cancel.is_cancelled() {
            summary.errors.push(RunError::new(ErrorKind::Cancelled, "run cancelled before writing"));
        } else {
            let batch_size = if batch_size == 0 { self.opts.batch_size } else { batch_size };
            let writer = DependencyOrderedWriter::new(
                self.sink.as_ref(),
                &self.opts.retry,
                &self.cancel,
                self.telemetry.as_ref(),
                batch_size,
            );
            let report = writer.write(WriteSet { actors, parents, children, stats });
            apply_write_report(report, &mut summary);
        }

        summary.status = decide_status(&summary, self.cancel.is_cancelled());
        if summary.status == RunStatus::Succeeded {
            self.settle_checkpoint(&source, Checkpoint { at: end_ts, cursor }, &mut summary);
        }
        self.close_run(&handle, &mut summary);
        summary
    }

    fn fetch_windows(
        &self,
        fetcher: &PaginatedFetcher<'_>,
        source: &str,
        plan: &[PlannedWindow],
        summary: &mut RunSummary,
    ) -> Vec<ParentRecord> {
        let dedup: Mutex<Deduplicator<ParentRecord>> = Mutex::new(Deduplicator::new());
        let outcomes = self.pool.map(plan, |pw| {
            let mut pages = fetcher.window(source, *pw);
            let mut out = WindowOutcome { parents: 0, error: None, cancelled: false };
            for item in pages.by_ref() {
                match item {
                    Ok(rec) => {
                        dedup.lock().offer(rec);
                        out.parents += 1;
                    }
                    Err(e) => out.error = Some(e),
                }
            }
            out.cancelled = pages.stop_reason() == Some(StopReason::Cancelled);
            match &out.error {
                Some(e) => self.telemetry.event(&RunEvent::WindowFailed { window: *pw, message: e.to_string() }),
                None => self.telemetry.event(&RunEvent::WindowFetched {
                    window: *pw,
                    parents: out.parents,
                    pages: pages.pages(),
                    truncated: pages.truncated(),
                }),
            }
            out
        });

        let mut cancelled = false;
        for (pw, out) in plan.iter().zip(outcomes) {
            cancelled |= out.cancelled;
            if let Some(e) = out.error {
                summary.windows_failed += 1;
                summary.errors.push(
                    RunError::new(e.kind(), format!("{} listing failed: {e}", pw.strategy.listing()))
                        .with_window(pw.window),
                );
            }
        }
        if cancelled {
            summary.errors.push(RunError::new(ErrorKind::Cancelled, "listing fetch cancelled"));
        }

        let dedup = dedup.into_inner();
        let st = dedup.stats();
        tracing::info!(
            "{}: {} unique parents ({} offered, {} replaced by later edits)",
            source,
            st.unique,
            st.offered,
            st.replaced
        );
        let mut parents = dedup.into_records();
        parents.sort_by(|a, b| (a.created_utc, &a.id).cmp(&(b.created_utc, &b.id)));
        summary.parents_fetched = parents.len() as u64;
        parents
    }

    /// Fetch every parent's reply tree, resolve placeholders, and assemble. Parents whose
    /// tree could not be fetched completely go into `incomplete`.
    fn fetch_threads(
        &self,
        fetcher: &PaginatedFetcher<'_>,
        source: &str,
        parents: &[ParentRecord],
        incomplete: &mut AHashSet<String>,
        summary: &mut RunSummary,
    ) -> (Vec<ChildRecord>, Vec<Orphan>) {
        let outcomes = self.pool.map(parents, |p| {
            if self.cancel.is_cancelled() {
                return ReplyOutcome { parent_id: p.id.clone(), result: None };
            }
            let result = fetcher.replies(source, &p.id);
            if let Ok(r) = &result {
                self.telemetry.event(&RunEvent::RepliesFetched { parent_id: p.id.clone(), replies: r.children.len() });
            }
            ReplyOutcome { parent_id: p.id.clone(), result: Some(result) }
        });

        let mut dedup: Deduplicator<ChildRecord> = Deduplicator::new();
        let mut pending: Vec<Continuation> = Vec::new();
        let mut skipped = 0usize;
        for out in outcomes {
            match out.result {
                Some(Ok(r)) => {
                    dedup.extend(r.children);
                    pending.extend(r.continuations);
                }
                Some(Err(e)) => {
                    summary.errors.push(
                        RunError::new(e.kind(), format!("reply tree fetch failed: {e}")).with_ids(vec![out.parent_id.clone()]),
                    );
                    incomplete.insert(out.parent_id);
                }
                None => {
                    skipped += 1;
                    incomplete.insert(out.parent_id);
                }
            }
        }
        if skipped > 0 {
            summary.errors.push(RunError::new(
                ErrorKind::Cancelled,
                format!("reply fetch cancelled with {skipped} threads outstanding"),
            ));
        }

        let resolution = self.assembler.resolve(&self.pool, &self.cancel, pending, |m| fetcher.expand(source, m));
        for (more, e) in resolution.failures {
            incomplete.insert(more.link_id.clone());
            summary.errors.push(
                RunError::new(e.kind(), format!("placeholder expansion under {} failed: {e}", more.parent_ref.fullname()))
                    .with_ids(more.children),
            );
        }
        if !resolution.unresolved.is_empty() && !resolution.cancelled {
            let ids: Vec<String> = resolution.unresolved.iter().flat_map(|m| m.children.iter().cloned()).collect();
            summary.errors.push(
                RunError::new(
                    ErrorKind::UnresolvedParent,
                    format!(
                        "{} placeholders still pending after {} resolution rounds",
                        resolution.unresolved.len(),
                        resolution.rounds
                    ),
                )
                .with_ids(ids),
            );
        }
        if !resolution.below_threshold.is_empty() {
            let ids: Vec<String> = resolution.below_threshold.iter().flat_map(|m| m.children.iter().cloned()).collect();
            summary.errors.push(
                RunError::new(
                    ErrorKind::UnresolvedParent,
                    format!(
                        "{} placeholders left unexpanded below the {}-reply threshold",
                        resolution.below_threshold.len(),
                        self.opts.continuation_threshold
                    ),
                )
                .with_ids(ids),
            );
        }
        if resolution.cancelled {
            for m in &resolution.unresolved {
                incomplete.insert(m.link_id.clone());
            }
            summary.errors.push(RunError::new(ErrorKind::Cancelled, "placeholder resolution cancelled"));
        }
        dedup.extend(resolution.children);

        let replies = dedup.into_records();
        summary.children_fetched = replies.len() as u64;
        let roots: AHashSet<String> = parents.iter().map(|p| p.id.clone()).collect();
        let assembly = self.assembler.assemble(&roots, replies);
        tracing::info!(
            "{}: {} replies assembled, {} orphaned, {} placeholder rounds",
            source,
            assembly.children.len(),
            assembly.orphans.len(),
            resolution.rounds
        );
        let children = if self.opts.include_deleted {
            assembly.children
        } else {
            let (kept, dropped) = self.assembler.prune_deleted(assembly.children);
            if dropped > 0 {
                tracing::info!("{}: {} deleted replies without surviving replies left out", source, dropped);
            }
            kept
        };
        (children, assembly.orphans)
    }

    fn settle_checkpoint(&self, source: &str, cp: Checkpoint, summary: &mut RunSummary) {
        match self.checkpoints.advance_checkpoint(source, &cp) {
            Ok(true) => summary.checkpoint = Some(cp),
            Ok(false) => {
                summary.checkpoint = self.checkpoints.checkpoint(source).ok().flatten();
            }
            Err(e) => {
                tracing::warn!("{}: checkpoint not advanced: {:#}", source, e);
                summary.status = RunStatus::Partial;
                summary.errors.push(RunError::new(ErrorKind::WriteFailure, format!("checkpoint not advanced: {e:#}")));
            }
        }
    }

    fn close_run(&self, handle: &RunHandle, summary: &mut RunSummary) {
        let counts = RunCounts {
            actors: summary.actors_written,
            parents: summary.parents_written,
            children: summary.children_written,
            aggregates: summary.aggregates_written,
            errors: summary.errors.len() as u64,
        };
        if let Err(e) = self.checkpoints.record_run_result(handle, summary.status, counts) {
            tracing::warn!("{}: audit row for run {} not written: {:#}", handle.source, handle.run_id, e);
            summary.errors.push(RunError::new(ErrorKind::WriteFailure, format!("audit row not written: {e:#}")));
        }
        tracing::info!(
            "{}: run {} {} ({} parents, {} children, {} actors, {} stats written; {} errors)",
            handle.source,
            handle.run_id,
            summary.status.as_str(),
            summary.parents_written,
            summary.children_written,
            summary.actors_written,
            summary.aggregates_written,
            summary.errors.len()
        );
        self.telemetry.event(&RunEvent::Finished { source: handle.source.clone(), status: summary.status });
    }
}

fn collect_actors(parents: &[ParentRecord], children: &[ChildRecord]) -> Vec<Actor> {
    let mut by_id: AHashMap<String, Actor> = AHashMap::new();
    let found = parents.iter().filter_map(ParentRecord::actor).chain(children.iter().filter_map(ChildRecord::actor));
    for a in found {
        by_id.entry(a.id.clone()).or_insert(a);
    }
    let mut actors: Vec<Actor> = by_id.into_values().collect();
    actors.sort_by(|a, b| a.id.cmp(&b.id));
    actors
}

fn report_orphans(orphans: &[Orphan], summary: &mut RunSummary) {
    for reason in [OrphanReason::MissingParent, OrphanReason::Cycle, OrphanReason::OrphanedAncestor] {
        let ids: Vec<String> = orphans.iter().filter(|o| o.reason == reason).map(|o| o.id.clone()).collect();
        if ids.is_empty() {
            continue;
        }
        summary.errors.push(
            RunError::new(ErrorKind::UnresolvedParent, format!("{} replies dropped: {}", ids.len(), reason.describe()))
                .with_ids(ids),
        );
    }
}

fn apply_write_report(report: WriteReport, summary: &mut RunSummary) {
    summary.actors_written = report.actors_written;
    summary.parents_written = report.parents_written;
    summary.children_written = report.children_written;
    summary.aggregates_written = report.aggregates_written;
    summary.errors.extend(report.errors);
}

fn decide_status(summary: &RunSummary, cancelled: bool) -> RunStatus {
    let windows_all_failed = summary.windows_planned > 0 && summary.windows_failed == summary.windows_planned;
    if windows_all_failed && summary.written() == 0 && !cancelled {
        return RunStatus::Failed;
    }
    let degraded = summary.errors.iter().any(|e| {
        matches!(
            e.kind,
            ErrorKind::TransientFetchError
                | ErrorKind::FatalFetchError
                | ErrorKind::WriteConflict
                | ErrorKind::WriteFailure
                | ErrorKind::Cancelled
        )
    });
    if cancelled || degraded {
        RunStatus::Partial
    } else {
        RunStatus::Succeeded
    }
}
