//! Run telemetry: structured events, a `tracing` sink and an `indicatif` progress sink.

use crate::checkpoint::RunStatus;
use crate::window::PlannedWindow;
use crate::writer::Stage;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::time::Duration;

/// Milestones emitted by a harvest run.
#[derive(Clone, Debug)]
pub enum RunEvent {
    Planned { source: String, windows: usize },
    WindowFetched { window: PlannedWindow, parents: usize, pages: usize, truncated: bool },
    WindowFailed { window: PlannedWindow, message: String },
    RepliesFetched { parent_id: String, replies: usize },
    BatchCommitted { stage: Stage, rows: usize, written: usize },
    Finished { source: String, status: RunStatus },
}

pub trait Telemetry: Send + Sync {
    fn event(&self, ev: &RunEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn event(&self, _ev: &RunEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn event(&self, ev: &RunEvent) {
        match ev {
            RunEvent::Planned { source, windows } => tracing::info!("{}: planned {} windows", source, windows),
            RunEvent::WindowFetched { window, parents, pages, truncated } => {
                tracing::info!(
                    "{} {}: {} parents in {} pages{}",
                    window.strategy.listing(),
                    window.window,
                    parents,
                    pages,
                    if *truncated { " (truncated)" } else { "" }
                )
            }
            RunEvent::WindowFailed { window, message } => {
                tracing::warn!("{} {} failed: {}", window.strategy.listing(), window.window, message)
            }
            RunEvent::RepliesFetched { parent_id, replies } => tracing::debug!("{}: {} replies", parent_id, replies),
            RunEvent::BatchCommitted { stage, rows, written } => {
                tracing::debug!("{} batch committed: {}/{} rows changed", stage.as_str(), written, rows)
            }
            RunEvent::Finished { source, status } => tracing::info!("{}: run {}", source, status.as_str()),
        }
    }
}

fn count_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
         it/s: {per_sec}  elapsed: {elapsed_precise}  eta: {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
}

/// Count-style bar with an optional label.
pub fn make_count_progress(mp: &MultiProgress, total: u64, label: &str) -> ProgressBar {
    let pb = mp.add(ProgressBar::new(total));
    pb.set_style(count_style());
    if !label.is_empty() {
        pb.set_message(label.to_string());
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Renders windows, reply fetches and write batches as progress bars.
/// Bars are created lazily as stages start.
pub struct ProgressTelemetry {
    mp: MultiProgress,
    windows: Mutex<Option<ProgressBar>>,
    replies: Mutex<Option<ProgressBar>>,
    writes: Mutex<Option<ProgressBar>>,
}

impl Default for ProgressTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTelemetry {
    pub fn new() -> Self {
        Self {
            mp: MultiProgress::new(),
            windows: Mutex::new(None),
            replies: Mutex::new(None),
            writes: Mutex::new(None),
        }
    }

    fn bump(&self, slot: &Mutex<Option<ProgressBar>>, label: &str, delta: u64) {
        let mut guard = slot.lock();
        let pb = guard.get_or_insert_with(|| {
            let pb = make_count_progress(&self.mp, 0, label);
            pb.set_length(0);
            pb
        });
        if pb.position() + delta > pb.length().unwrap_or(0) {
            pb.set_length(pb.position() + delta);
        }
        pb.inc(delta);
    }
}

impl Telemetry for ProgressTelemetry {
    fn event(&self, ev: &RunEvent) {
        match ev {
            RunEvent::Planned { source, windows } => {
                let pb = make_count_progress(&self.mp, *windows as u64, &format!("{source}: windows"));
                *self.windows.lock() = Some(pb);
            }
            RunEvent::WindowFetched { .. } | RunEvent::WindowFailed { .. } => {
                if let Some(pb) = self.windows.lock().as_ref() {
                    pb.inc(1);
                }
            }
            RunEvent::RepliesFetched { .. } => self.bump(&self.replies, "reply trees", 1),
            RunEvent::BatchCommitted { rows, .. } => self.bump(&self.writes, "rows written", *rows as u64),
            RunEvent::Finished { status, .. } => {
                for slot in [&self.windows, &self.replies, &self.writes] {
                    if let Some(pb) = slot.lock().take() {
                        pb.finish_with_message(format!("run {}", status.as_str()));
                    }
                }
            }
        }
    }
}
