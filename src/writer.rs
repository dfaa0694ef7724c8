//! Dependency-ordered batch persistence: actors, then parents, then children, then
//! thread stats. Each stage finishes before the next starts.

use crate::aggregate::ParentStats;
use crate::concurrency::CancelToken;
use crate::error::{ErrorKind, RunError, WriteError};
use crate::model::{Actor, ChildRecord, ParentRecord, ParentRef};
use crate::progress::{RunEvent, Telemetry};
use crate::retry::{retry, RetryPolicy};
use ahash::AHashSet;
use serde::Serialize;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Storage seam. Each call is one transaction that either commits whole or not at all,
/// and returns the number of rows inserted or changed.
pub trait RecordSink: Send + Sync {
    fn upsert_actors(&self, batch: &[Actor]) -> Result<usize, WriteError>;
    fn upsert_parents(&self, batch: &[ParentRecord]) -> Result<usize, WriteError>;
    fn upsert_children(&self, batch: &[ChildRecord]) -> Result<usize, WriteError>;
    fn upsert_thread_stats(&self, batch: &[ParentStats]) -> Result<usize, WriteError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Actors,
    Parents,
    Children,
    Aggregates,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Actors => "actors",
            Stage::Parents => "parents",
            Stage::Children => "children",
            Stage::Aggregates => "aggregates",
        }
    }
}

/// Everything one run persists. Children must be ordered parents-first.
#[derive(Debug, Default)]
pub struct WriteSet {
    pub actors: Vec<Actor>,
    pub parents: Vec<ParentRecord>,
    pub children: Vec<ChildRecord>,
    pub stats: Vec<ParentStats>,
}

#[derive(Debug, Default)]
pub struct WriteReport {
    pub actors_written: u64,
    pub parents_written: u64,
    pub children_written: u64,
    pub aggregates_written: u64,
    pub batches_committed: usize,
    pub batches_failed: usize,
    /// Records left out because something they reference failed to persist.
    pub skipped: u64,
    pub cancelled: bool,
    pub errors: Vec<RunError>,
}

impl WriteReport {
    pub fn failed(&self) -> bool {
        self.batches_failed > 0 || self.skipped > 0
    }

    fn add_written(&mut self, stage: Stage, n: u64) {
        match stage {
            Stage::Actors => self.actors_written += n,
            Stage::Parents => self.parents_written += n,
            Stage::Children => self.children_written += n,
            Stage::Aggregates => self.aggregates_written += n,
        }
    }
}

pub struct DependencyOrderedWriter<'a> {
    sink: &'a dyn RecordSink,
    retry: &'a RetryPolicy,
    cancel: &'a CancelToken,
    telemetry: &'a dyn Telemetry,
    batch_size: usize,
}

impl<'a> DependencyOrderedWriter<'a> {
    pub fn new(
        sink: &'a dyn RecordSink,
        retry: &'a RetryPolicy,
        cancel: &'a CancelToken,
        telemetry: &'a dyn Telemetry,
        batch_size: usize,
    ) -> Self {
        Self { sink, retry, cancel, telemetry, batch_size: batch_size.max(1) }
    }

    /// Persist `set`. Committed batches stay committed when a later one fails.
    pub fn write(&self, set: WriteSet) -> WriteReport {
        let mut report = WriteReport::default();

        let mut failed_actors = AHashSet::new();
        self.stage(
            Stage::Actors,
            set.actors,
            |a| a.id.clone(),
            |_, _| false,
            |b| self.sink.upsert_actors(b),
            &mut failed_actors,
            &mut report,
        );

        let mut failed_parents = AHashSet::new();
        self.stage(
            Stage::Parents,
            set.parents,
            |p| p.id.clone(),
            |p, _| p.author_ref.as_ref().is_some_and(|a| failed_actors.contains(a)),
            |b| self.sink.upsert_parents(b),
            &mut failed_parents,
            &mut report,
        );

        let mut failed_children = AHashSet::new();
        self.stage(
            Stage::Children,
            set.children,
            |c| c.id.clone(),
            |c, failed| {
                failed_parents.contains(&c.parent_id)
                    || c.author_ref.as_ref().is_some_and(|a| failed_actors.contains(a))
                    || matches!(&c.parent_ref, ParentRef::Child(cid) if failed.contains(cid))
            },
            |b| self.sink.upsert_children(b),
            &mut failed_children,
            &mut report,
        );

        let mut failed_stats = AHashSet::new();
        self.stage(
            Stage::Aggregates,
            set.stats,
            |s| s.parent_id.clone(),
            |s, _| failed_parents.contains(&s.parent_id),
            |b| self.sink.upsert_thread_stats(b),
            &mut failed_stats,
            &mut report,
        );

        report
    }

    /// Batch and commit one stage. `blocked` sees the IDs failed so far in this stage, so
    /// a record whose in-stage dependency failed is skipped too. Skipped and failed IDs
    /// land in `failed`.
    #[allow(clippy::too_many_arguments)]
    fn stage<T>(
        &self,
        stage: Stage,
        items: Vec<T>,
        id_of: impl Fn(&T) -> String,
        blocked: impl Fn(&T, &AHashSet<String>) -> bool,
        commit: impl Fn(&[T]) -> Result<usize, WriteError>,
        failed: &mut AHashSet<String>,
        report: &mut WriteReport,
    ) {
        if report.cancelled || items.is_empty() {
            return;
        }
        let mut skipped: Vec<String> = Vec::new();
        let mut batch: Vec<T> = Vec::with_capacity(self.batch_size.min(items.len()));
        let mut batch_no = 0usize;

        let mut flush = |batch: &mut Vec<T>, failed: &mut AHashSet<String>, report: &mut WriteReport| -> bool {
            if batch.is_empty() {
                return true;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.errors.push(RunError::new(
                    ErrorKind::Cancelled,
                    format!("cancelled before {} batch {}", stage.as_str(), batch_no + 1),
                ));
                return false;
            }
            batch_no += 1;
            let what = format!("{} batch {}", stage.as_str(), batch_no);
            match retry(self.retry, &what, |_| commit(batch.as_slice())) {
                Ok(written) => {
                    report.add_written(stage, written as u64);
                    report.batches_committed += 1;
                    self.telemetry.event(&RunEvent::BatchCommitted { stage, rows: batch.len(), written });
                }
                Err(e) => {
                    let ids: Vec<String> = batch.iter().map(&id_of).collect();
                    tracing::warn!("{what} of {} rows failed: {e}", ids.len());
                    report.batches_failed += 1;
                    failed.extend(ids.iter().cloned());
                    report.errors.push(RunError::new(e.kind(), format!("{what} failed: {e}")).with_ids(ids));
                }
            }
            batch.clear();
            true
        };

        for item in items {
            if blocked(&item, failed) {
                let id = id_of(&item);
                failed.insert(id.clone());
                skipped.push(id);
                continue;
            }
            batch.push(item);
            if batch.len() >= self.batch_size && !flush(&mut batch, failed, report) {
                break;
            }
        }
        if !report.cancelled {
            flush(&mut batch, failed, report);
        }

        if !skipped.is_empty() {
            tracing::warn!("{} {} skipped: a record they reference failed to persist", skipped.len(), stage.as_str());
            report.skipped += skipped.len() as u64;
            report.errors.push(
                RunError::new(
                    ErrorKind::WriteFailure,
                    format!("{} {} skipped: dependency not persisted", skipped.len(), stage.as_str()),
                )
                .with_ids(skipped),
            );
        }
    }
}
