//! Natural-key deduplication across overlapping windows and strategies.

use crate::model::{ChildRecord, ParentRecord};
use ahash::{AHashMap, AHashSet};

/// Record with a natural key and an optional edit timestamp.
pub trait Keyed {
    fn natural_id(&self) -> &str;
    fn edited_at(&self) -> Option<i64>;
}

impl Keyed for ParentRecord {
    fn natural_id(&self) -> &str { &self.id }
    fn edited_at(&self) -> Option<i64> { self.edited_at }
}

impl Keyed for ChildRecord {
    fn natural_id(&self) -> &str { &self.id }
    fn edited_at(&self) -> Option<i64> { self.edited_at }
}

/// Outcome of offering one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    New,
    /// Incoming copy carried a later edit and replaced the stored one.
    Replaced,
    /// Stored copy kept (same or later edit).
    Kept,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DedupeStats {
    pub offered: u64,
    pub unique: u64,
    pub replaced: u64,
    pub dropped: u64,
}

/// One record per natural ID for a single run's working set.
/// Later `edited_at` wins (no edit sorts before any edit); ties keep the first copy.
/// Output keeps first-seen order.
#[derive(Debug)]
pub struct Deduplicator<T> {
    index: AHashMap<String, usize>,
    records: Vec<T>,
    stats: DedupeStats,
}

impl<T: Keyed> Default for Deduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> Deduplicator<T> {
    pub fn new() -> Self {
        Self { index: AHashMap::new(), records: Vec::new(), stats: DedupeStats::default() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { index: AHashMap::with_capacity(n), records: Vec::with_capacity(n), stats: DedupeStats::default() }
    }

    pub fn offer(&mut self, rec: T) -> Offer {
        self.stats.offered += 1;
        let existing = self.index.get(rec.natural_id()).copied();
        match existing {
            Some(i) => {
                if rec.edited_at() > self.records[i].edited_at() {
                    self.records[i] = rec;
                    self.stats.replaced += 1;
                    Offer::Replaced
                } else {
                    self.stats.dropped += 1;
                    Offer::Kept
                }
            }
            None => {
                self.index.insert(rec.natural_id().to_string(), self.records.len());
                self.records.push(rec);
                self.stats.unique += 1;
                Offer::New
            }
        }
    }

    pub fn extend(&mut self, recs: impl IntoIterator<Item = T>) {
        for r in recs {
            self.offer(r);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> DedupeStats {
        self.stats
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

/// Membership-only ID set for bounded-memory skipping.
#[derive(Debug, Default)]
pub struct SeenIds {
    set: AHashSet<String>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is seen.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
