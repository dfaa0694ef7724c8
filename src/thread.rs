//! Reply-tree assembly: placeholder resolution rounds, then depth recomputation over an
//! index arena with visited-path cycle detection.

use crate::concurrency::{CancelToken, WorkerPool};
use crate::dedupe::SeenIds;
use crate::error::FetchError;
use crate::fetcher::Replies;
use crate::model::{ChildRecord, Continuation, ParentRef};
use ahash::{AHashMap, AHashSet};
use serde::Serialize;

pub const DEFAULT_MAX_ROUNDS: usize = 16;

#[derive(Clone, Debug)]
pub struct ThreadAssembler {
    max_rounds: usize,
    // placeholders announcing fewer replies than this are left unexpanded
    threshold: i64,
}

impl Default for ThreadAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

/// Output of placeholder resolution.
#[derive(Debug, Default)]
pub struct Resolution {
    pub children: Vec<ChildRecord>,
    pub rounds: usize,
    /// Placeholders still pending when the round cap or cancellation stopped resolution.
    pub unresolved: Vec<Continuation>,
    /// Placeholders skipped for announcing fewer replies than the threshold.
    pub below_threshold: Vec<Continuation>,
    pub failures: Vec<(Continuation, FetchError)>,
    pub invalid: usize,
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// Referenced parent was never fetched, or belongs to another thread.
    MissingParent,
    /// Parent chain loops back on itself.
    Cycle,
    /// Some ancestor is itself an orphan.
    OrphanedAncestor,
}

impl OrphanReason {
    pub fn describe(self) -> &'static str {
        match self {
            OrphanReason::MissingParent => "parent never fetched",
            OrphanReason::Cycle => "parent chain forms a cycle",
            OrphanReason::OrphanedAncestor => "ancestor unresolved",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Orphan {
    pub id: String,
    pub parent_id: String,
    pub parent_ref: ParentRef,
    pub reason: OrphanReason,
}

#[derive(Debug, Default)]
pub struct Assembly {
    /// Resolved replies ordered by (depth, created_utc, id).
    pub children: Vec<ChildRecord>,
    pub orphans: Vec<Orphan>,
}

#[derive(Clone, Copy)]
enum Mark {
    Unvisited,
    OnPath,
    Done(Result<u32, OrphanReason>),
}

enum Link {
    Root,
    Missing,
    Node(usize),
}

impl ThreadAssembler {
    pub fn new(max_rounds: usize) -> Self {
        Self { max_rounds, threshold: 0 }
    }

    pub fn with_threshold(mut self, min_count: i64) -> Self {
        self.threshold = min_count.max(0);
        self
    }

    /// Expand placeholders round by round; each round may yield further placeholders.
    /// Expansions within a round run on `pool`; results merge in placeholder order.
    pub fn resolve<F>(&self, pool: &WorkerPool, cancel: &CancelToken, pending: Vec<Continuation>, expand: F) -> Resolution
    where
        F: Fn(&Continuation) -> Result<Replies, FetchError> + Sync + Send,
    {
        let mut out = Resolution::default();
        let mut seen = SeenIds::new();
        let mut pending = pending;

        loop {
            pending.retain(|m| seen.first_sighting(&m.key()));
            let (keep, small): (Vec<_>, Vec<_>) = pending.into_iter().partition(|m| m.count >= self.threshold);
            out.below_threshold.extend(small);
            pending = keep;
            if pending.is_empty() {
                break;
            }
            if out.rounds >= self.max_rounds {
                tracing::warn!(
                    "placeholder resolution stopped after {} rounds with {} placeholders pending",
                    out.rounds,
                    pending.len()
                );
                out.unresolved = pending;
                break;
            }
            if cancel.is_cancelled() {
                out.cancelled = true;
                out.unresolved = pending;
                break;
            }

            out.rounds += 1;
            let results = pool.map(&pending, |m| expand(m));
            let mut next = Vec::new();
            for (more, res) in pending.into_iter().zip(results) {
                match res {
                    Ok(r) => {
                        out.invalid += r.invalid;
                        out.children.extend(r.children);
                        next.extend(r.continuations);
                    }
                    Err(e) => {
                        tracing::warn!("placeholder {} under {} failed: {e}", more.id, more.parent_ref.fullname());
                        out.failures.push((more, e));
                    }
                }
            }
            tracing::debug!("resolution round {}: {} replies so far, {} new placeholders", out.rounds, out.children.len(), next.len());
            pending = next;
        }
        if !out.below_threshold.is_empty() {
            tracing::debug!("{} placeholders below the {}-reply threshold left unexpanded", out.below_threshold.len(), self.threshold);
        }
        out
    }

    /// Drop deleted replies that have no surviving replies below them, so every kept reply
    /// still hangs off a kept parent. Expects `children` ordered parents-first, as `assemble`
    /// returns them. Returns the kept replies and how many were dropped.
    pub fn prune_deleted(&self, children: Vec<ChildRecord>) -> (Vec<ChildRecord>, usize) {
        let mut referenced: AHashSet<String> = AHashSet::new();
        let mut kept = Vec::with_capacity(children.len());
        let mut dropped = 0usize;
        for rec in children.into_iter().rev() {
            if rec.is_deleted && !referenced.contains(&rec.id) {
                dropped += 1;
                continue;
            }
            if let ParentRef::Child(cid) = &rec.parent_ref {
                referenced.insert(cid.clone());
            }
            kept.push(rec);
        }
        kept.reverse();
        (kept, dropped)
    }

    /// Recompute depths from resolved parent chains. `roots` holds the IDs of fetched
    /// parents. Replies with a missing parent, a cyclic chain or an orphaned ancestor are
    /// split out. Expects one record per reply ID; later duplicates are ignored.
    pub fn assemble(&self, roots: &AHashSet<String>, children: Vec<ChildRecord>) -> Assembly {
        let mut index: AHashMap<String, usize> = AHashMap::with_capacity(children.len());
        let mut arena: Vec<ChildRecord> = Vec::with_capacity(children.len());
        for c in children {
            if index.contains_key(&c.id) {
                continue;
            }
            index.insert(c.id.clone(), arena.len());
            arena.push(c);
        }

        let link = |i: usize| -> Link {
            let rec = &arena[i];
            match &rec.parent_ref {
                ParentRef::Parent(pid) if *pid == rec.parent_id && roots.contains(pid) => Link::Root,
                ParentRef::Parent(_) => Link::Missing,
                ParentRef::Child(cid) => match index.get(cid) {
                    Some(&j) if arena[j].parent_id == rec.parent_id => Link::Node(j),
                    _ => Link::Missing,
                },
            }
        };

        let mut state = vec![Mark::Unvisited; arena.len()];
        let mut path: Vec<usize> = Vec::new();
        for start in 0..arena.len() {
            if !matches!(state[start], Mark::Unvisited) {
                continue;
            }
            path.clear();
            let mut cur = start;
            // Result of the node just above the remaining path.
            let mut above: Result<u32, OrphanReason> = loop {
                match state[cur] {
                    Mark::Done(r) => break r,
                    Mark::OnPath => {
                        let pos = path.iter().position(|&p| p == cur).unwrap_or(0);
                        for &p in &path[pos..] {
                            state[p] = Mark::Done(Err(OrphanReason::Cycle));
                        }
                        path.truncate(pos);
                        break Err(OrphanReason::Cycle);
                    }
                    Mark::Unvisited => {
                        state[cur] = Mark::OnPath;
                        match link(cur) {
                            Link::Node(j) => {
                                path.push(cur);
                                cur = j;
                            }
                            Link::Root => {
                                state[cur] = Mark::Done(Ok(0));
                                break Ok(0);
                            }
                            Link::Missing => {
                                state[cur] = Mark::Done(Err(OrphanReason::MissingParent));
                                break Err(OrphanReason::MissingParent);
                            }
                        }
                    }
                }
            };
            while let Some(p) = path.pop() {
                let r = match above {
                    Ok(d) => Ok(d + 1),
                    Err(_) => Err(OrphanReason::OrphanedAncestor),
                };
                state[p] = Mark::Done(r);
                above = r;
            }
        }

        let mut out = Assembly::default();
        for (i, mut rec) in arena.into_iter().enumerate() {
            match state[i] {
                Mark::Done(Ok(depth)) => {
                    rec.depth = depth;
                    out.children.push(rec);
                }
                Mark::Done(Err(reason)) => out.orphans.push(Orphan {
                    id: rec.id,
                    parent_id: rec.parent_id,
                    parent_ref: rec.parent_ref,
                    reason,
                }),
                Mark::Unvisited | Mark::OnPath => {}
            }
        }
        out.children
            .sort_by(|a, b| (a.depth, a.created_utc, &a.id).cmp(&(b.depth, b.created_utc, &b.id)));
        out.orphans.sort_by(|a, b| a.id.cmp(&b.id));
        if !out.orphans.is_empty() {
            tracing::warn!("{} replies could not be attached to a resolved parent", out.orphans.len());
        }
        out
    }
}
