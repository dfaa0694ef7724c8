//! Concurrency helpers: bounded worker pool, shared rate-limit credit budget, and the
//! cooperative cancellation flag.

use crate::api::RateHint;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed-size pool; its size caps outstanding API requests.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("rfetch-worker-{i}"))
            .build()
            .context("build worker pool")?;
        Ok(Self { pool, size })
    }

    /// Run `f` over every task on the pool; results keep task order.
    pub fn map<T, R, F>(&self, tasks: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        if self.size <= 1 {
            return tasks.iter().map(f).collect();
        }
        self.pool.install(|| tasks.par_iter().map(f).collect())
    }
}

/// Shared request-credit counter fed by the API's remaining/reset hints.
/// Unknown until the first hint arrives, and unlimited while unknown.
#[derive(Debug, Default)]
pub struct CreditBudget {
    state: Mutex<CreditState>,
}

#[derive(Debug, Default)]
struct CreditState {
    remaining: Option<f64>,
    reset_at: Option<Instant>,
}

impl CreditBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one credit, or return how long until the budget resets.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut st = self.state.lock();
        let now = Instant::now();
        if matches!(st.reset_at, Some(reset) if now >= reset) {
            st.remaining = None;
            st.reset_at = None;
        }
        let remaining = st.remaining;
        match remaining {
            None => Ok(()),
            Some(r) if r >= 1.0 => {
                st.remaining = Some(r - 1.0);
                Ok(())
            }
            Some(_) => Err(st
                .reset_at
                .map(|reset| reset.saturating_duration_since(now))
                .unwrap_or(Duration::from_secs(1))),
        }
    }

    /// Replace the budget with the latest server view.
    pub fn observe(&self, hint: &RateHint) {
        let mut st = self.state.lock();
        st.remaining = Some(hint.remaining.max(0.0));
        st.reset_at = Some(Instant::now() + hint.reset_after);
    }

    pub fn remaining(&self) -> Option<f64> {
        self.state.lock().remaining
    }
}

/// Cooperative cancellation flag, checked between page fetches and write batches.
/// Once set it stays set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
