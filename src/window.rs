//! Window planning: pick listing strategies and split a requested range into sub-windows
//! small enough that a listing's depth cap cannot silently truncate them.

use crate::date::{format_ts, Period, DAY_SECS, HOUR_SECS};
use crate::error::PlanError;
use serde::Serialize;

/// Listing order requested from the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "period", rename_all = "snake_case")]
pub enum Strategy {
    /// Newest-first. Only reaches recent items within the listing cap.
    New,
    /// Ranked by popularity, one sub-window per `Period`.
    Top(Period),
}

impl Strategy {
    pub fn newest_first(self) -> bool {
        matches!(self, Strategy::New)
    }

    pub fn listing(self) -> &'static str {
        match self {
            Strategy::New => "new",
            Strategy::Top(_) => "top",
        }
    }
}

/// Half-open time range `[start, end)` in epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn span_secs(&self) -> i64 {
        self.end - self.start
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", format_ts(self.start), format_ts(self.end))
    }
}

/// One unit of fetch work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedWindow {
    pub strategy: Strategy,
    pub window: Window,
}

/// Planner settings.
#[derive(Clone, Debug)]
pub struct PlannerCfg {
    /// Spans up to this length use a single newest-first listing.
    pub safe_recency_secs: i64,
    /// Alignment for sub-windows of longer spans.
    pub period: Period,
    /// How far each sub-window reaches past its period boundary.
    pub overlap_secs: i64,
}

impl Default for PlannerCfg {
    fn default() -> Self {
        Self {
            safe_recency_secs: 30 * DAY_SECS,
            period: Period::Week,
            overlap_secs: HOUR_SECS,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WindowPlanner {
    cfg: PlannerCfg,
}

impl WindowPlanner {
    pub fn new(cfg: PlannerCfg) -> Self {
        Self { cfg }
    }

    pub fn cfg(&self) -> &PlannerCfg {
        &self.cfg
    }

    /// Plan `[start, end)`. With a checkpoint, planning starts at `max(start, checkpoint)`
    /// and a checkpoint at or past `end` yields an empty plan.
    pub fn plan(&self, start: i64, end: i64, checkpoint: Option<i64>) -> Result<Vec<PlannedWindow>, PlanError> {
        if start >= end {
            return Err(PlanError(format!(
                "start {} is not before end {}",
                format_ts(start),
                format_ts(end)
            )));
        }
        if self.cfg.safe_recency_secs <= 0 {
            return Err(PlanError("safe recency threshold must be positive".into()));
        }
        if self.cfg.overlap_secs < 0 {
            return Err(PlanError("window overlap cannot be negative".into()));
        }

        let effective_start = match checkpoint {
            Some(cp) if cp >= end => {
                tracing::debug!("checkpoint {} already covers {}; nothing to plan", format_ts(cp), format_ts(end));
                return Ok(Vec::new());
            }
            Some(cp) => start.max(cp),
            None => start,
        };

        let span = Window::new(effective_start, end);
        if span.span_secs() <= self.cfg.safe_recency_secs {
            return Ok(vec![PlannedWindow { strategy: Strategy::New, window: span }]);
        }

        let period = self.cfg.period;
        let mut out = Vec::new();
        let mut cursor = effective_start;
        while cursor < end {
            // no boundary past the calendar limit: the last window runs to `end`
            let boundary = period.next_boundary(cursor).map_or(end, |b| b.min(end));
            if boundary <= cursor {
                return Err(PlanError(format!("no {period} boundary after {}", format_ts(cursor))));
            }
            let reach = boundary.saturating_add(self.cfg.overlap_secs).min(end);
            out.push(PlannedWindow {
                strategy: Strategy::Top(period),
                window: Window::new(cursor, reach),
            });
            cursor = boundary;
        }
        tracing::debug!("planned {} {}-aligned windows over {}", out.len(), period, span);
        Ok(out)
    }
}
