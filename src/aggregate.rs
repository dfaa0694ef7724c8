//! Per-thread statistics derived from assembled replies.
//! Implement `Aggregator` for an aggregation state and fold it with `aggregate_by_parent`.

use crate::model::{ChildRecord, ParentRecord};
use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use serde::Serialize;

pub trait Aggregator: Send + Default {
    type Item;
    fn ingest(&mut self, item: &Self::Item);
    fn merge(&mut self, other: Self);
}

/// Comment statistics for one parent.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThreadStats {
    pub total_comments: u64,
    pub unique_authors: u64,
    pub deleted_comments: u64,
    pub removed_comments: u64,
    pub average_score: f64,
    pub max_depth: u32,
    pub gilded_comments: u64,
}

/// Accumulator behind `ThreadStats`.
#[derive(Debug, Default)]
pub struct ThreadAgg {
    total: u64,
    authors: AHashSet<String>,
    deleted: u64,
    removed: u64,
    score_sum: i64,
    max_depth: u32,
    gilded: u64,
}

impl Aggregator for ThreadAgg {
    type Item = ChildRecord;

    fn ingest(&mut self, c: &ChildRecord) {
        self.total += 1;
        if let Some(a) = &c.author_ref {
            if !c.is_deleted {
                self.authors.insert(a.clone());
            }
        }
        if c.is_deleted {
            self.deleted += 1;
        }
        if c.is_removed {
            self.removed += 1;
        }
        self.score_sum += c.score;
        self.max_depth = self.max_depth.max(c.depth);
        self.gilded += c.gilded.max(0) as u64;
    }

    fn merge(&mut self, other: Self) {
        self.total += other.total;
        self.authors.extend(other.authors);
        self.deleted += other.deleted;
        self.removed += other.removed;
        self.score_sum += other.score_sum;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.gilded += other.gilded;
    }
}

impl ThreadAgg {
    pub fn finish(&self) -> ThreadStats {
        let average_score = if self.total == 0 { 0.0 } else { self.score_sum as f64 / self.total as f64 };
        ThreadStats {
            total_comments: self.total,
            unique_authors: self.authors.len() as u64,
            deleted_comments: self.deleted,
            removed_comments: self.removed,
            average_score,
            max_depth: self.max_depth,
            gilded_comments: self.gilded,
        }
    }
}

/// Stats row keyed by parent ID, as written to the store.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParentStats {
    pub parent_id: String,
    #[serde(flatten)]
    pub stats: ThreadStats,
}

/// Fold replies into one aggregate per parent. Every parent gets a row, so threads
/// without replies come out all-zero. Output follows `parents` order.
pub fn aggregate_by_parent<A, F, R>(parents: &[ParentRecord], children: &[ChildRecord], finish: F) -> Vec<(String, R)>
where
    A: Aggregator<Item = ChildRecord>,
    F: Fn(&A) -> R,
{
    let mut by_parent: AHashMap<String, A> = children
        .par_iter()
        .fold(AHashMap::<String, A>::new, |mut acc, c| {
            acc.entry(c.parent_id.clone()).or_default().ingest(c);
            acc
        })
        .reduce(AHashMap::new, |mut a, b| {
            for (k, v) in b {
                a.entry(k).or_default().merge(v);
            }
            a
        });

    parents
        .iter()
        .map(|p| {
            let agg = by_parent.remove(&p.id).unwrap_or_default();
            (p.id.clone(), finish(&agg))
        })
        .collect()
}

/// `ThreadStats` for every parent.
pub fn thread_stats(parents: &[ParentRecord], children: &[ChildRecord]) -> Vec<ParentStats> {
    aggregate_by_parent::<ThreadAgg, _, _>(parents, children, ThreadAgg::finish)
        .into_iter()
        .map(|(parent_id, stats)| ParentStats { parent_id, stats })
        .collect()
}
