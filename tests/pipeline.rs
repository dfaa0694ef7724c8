#[path = "common/mod.rs"]
mod common;

use common::*;
use rfetch::{
    CheckpointStore, ErrorKind, Harvester, HarvestOptions, ListingApi, NoTelemetry, RecordSink, RunError, RunEvent,
    RunStatus, RunSummary, SqliteStore, Stage, Telemetry, Window,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

fn harvester(api: &Arc<FakeApi>, store: &Arc<SqliteStore>, opts: HarvestOptions) -> Harvester {
    let api: Arc<dyn ListingApi> = api.clone();
    Harvester::with_sqlite(opts, api, store.clone(), Arc::new(NoTelemetry)).unwrap()
}

fn run_alpha(h: &Harvester, days: i64, incremental: bool) -> RunSummary {
    h.fetch_source_data("alpha", at(T0), at(T0 + days * DAY), true, 0, incremental)
}

fn fresh() -> (Arc<FakeApi>, Arc<SqliteStore>) {
    (Arc::new(alpha_api()), Arc::new(SqliteStore::open_in_memory().unwrap()))
}

/// Collects every event.
#[derive(Default)]
struct Recorder(Mutex<Vec<RunEvent>>);

impl Telemetry for Recorder {
    fn event(&self, ev: &RunEvent) {
        self.0.lock().unwrap().push(ev.clone());
    }
}

/// A 45-day run splits into weekly windows, collapses the overlaps, resolves every
/// placeholder and persists everything in one clean pass.
#[test]
fn full_run_persists_everything() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert!(s.errors.is_empty());
    assert_eq!(s.windows_planned, 7);
    assert_eq!(s.windows_failed, 0);
    assert_eq!(s.parents_fetched, 120);
    assert_eq!(s.children_fetched, 300);
    assert_eq!(s.orphans, 0);
    assert_eq!(s.parents_written, 120);
    assert_eq!(s.children_written, 300);
    assert_eq!(s.actors_written, 9);
    assert_eq!(s.aggregates_written, 120);
    assert_eq!(s.window, Some(Window::new(T0, T0 + 45 * DAY)));
    assert_eq!(s.run_id.as_deref(), Some("alpha-000001"));

    let cp = s.checkpoint.clone().unwrap();
    assert_eq!(cp.at, T0 + 45 * DAY);
    assert_eq!(cp.cursor.as_deref(), Some("t3_p119"));
    assert_eq!(store.checkpoint("alpha").unwrap(), Some(cp));

    assert_eq!(store.table_count("parents").unwrap(), 120);
    assert_eq!(store.table_count("children").unwrap(), 300);
    assert_eq!(store.table_count("actors").unwrap(), 9);
    assert_eq!(store.table_count("thread_stats").unwrap(), 120);
    assert_eq!(store.table_count("fetch_runs").unwrap(), 1);
    // m000, m000x, m020 and four single-reply placeholders
    assert_eq!(api.expand_calls.load(Ordering::SeqCst), 7);
    assert_eq!(api.reply_calls.load(Ordering::SeqCst), 120);
}

/// Depths come from the resolved chains, including replies that arrived through nested
/// or out-of-order placeholder expansions.
#[test]
fn depths_and_stats_after_resolution() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    assert!(run_alpha(&h, 45, false).succeeded());

    assert_eq!(store.child_depth("c000a").unwrap(), Some(0));
    assert_eq!(store.child_depth("c000b").unwrap(), Some(1));
    assert_eq!(store.child_depth("c000c").unwrap(), Some(2));
    assert_eq!(store.child_depth("c020c").unwrap(), Some(2));
    assert_eq!(store.child_depth("c030c").unwrap(), Some(2));
    assert_eq!(store.child_depth("c100b").unwrap(), Some(1));

    let st = store.thread_stats("p015").unwrap().unwrap();
    assert_eq!(st.total_comments, 3);
    assert_eq!(st.deleted_comments, 1);
    assert_eq!(st.unique_authors, 2);
    assert_eq!(st.max_depth, 2);
    assert_eq!(st.average_score, 1.0);

    let st = store.thread_stats("p100").unwrap().unwrap();
    assert_eq!((st.total_comments, st.max_depth, st.deleted_comments), (2, 1, 0));
}

/// Repeating a run writes nothing new but still leaves an audit row.
#[test]
fn rerun_is_idempotent() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    assert!(run_alpha(&h, 45, false).succeeded());
    let again = run_alpha(&h, 45, false);

    assert_eq!(again.status, RunStatus::Succeeded);
    assert_eq!(again.written(), 0);
    assert_eq!(again.parents_fetched, 120);
    assert_eq!(again.run_id.as_deref(), Some("alpha-000002"));
    assert_eq!(store.table_count("parents").unwrap(), 120);
    assert_eq!(store.table_count("children").unwrap(), 300);

    let history = store.run_history("alpha").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].counts.parents, 120);
    assert_eq!(history[1].counts.parents, 0);
}

/// An incremental run over an already covered range does nothing at all; one reaching
/// past the checkpoint only plans the new stretch.
#[test]
fn incremental_runs_start_at_the_checkpoint() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    assert!(run_alpha(&h, 45, false).succeeded());
    let calls = api.listing_calls.load(Ordering::SeqCst);

    let noop = run_alpha(&h, 45, true);
    assert_eq!(noop.status, RunStatus::Succeeded);
    assert_eq!(noop.run_id, None);
    assert_eq!(noop.windows_planned, 0);
    assert_eq!(noop.checkpoint.as_ref().map(|c| c.at), Some(T0 + 45 * DAY));
    assert_eq!(api.listing_calls.load(Ordering::SeqCst), calls);
    assert_eq!(store.table_count("fetch_runs").unwrap(), 1);

    let ext = run_alpha(&h, 50, true);
    assert_eq!(ext.status, RunStatus::Succeeded, "{:?}", ext.errors);
    assert_eq!(ext.windows_planned, 1);
    assert_eq!(ext.window, Some(Window::new(T0 + 45 * DAY, T0 + 50 * DAY)));
    assert_eq!(ext.parents_fetched, 0);
    assert_eq!(ext.written(), 0);
    assert_eq!(store.checkpoint("alpha").unwrap().map(|c| c.at), Some(T0 + 50 * DAY));
}

/// Transient API failures within the retry budget leave no trace in the result.
#[test]
fn transient_failures_are_absorbed() {
    let (api, store) = fresh();
    api.fail_next.store(3, Ordering::SeqCst);
    let h = harvester(&api, &store, fast_opts());
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert_eq!((s.parents_written, s.children_written, s.actors_written, s.aggregates_written), (120, 300, 9, 120));
}

/// A window failing fatally is reported with its bounds; the other windows still land
/// and the checkpoint stays put.
#[test]
fn failed_window_makes_the_run_partial() {
    let mut raw = alpha_api();
    raw.fatal_window_containing = Some(T0 + 10 * DAY);
    let api = Arc::new(raw);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let h = harvester(&api, &store, fast_opts());
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Partial);
    assert_eq!(s.windows_failed, 1);
    assert_eq!(s.parents_written, 101);
    let fatal: Vec<_> = s.errors_of(ErrorKind::FatalFetchError).collect();
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].window, Some(Window::new(T0 + 7 * DAY, T0 + 14 * DAY + HOUR)));
    assert_eq!(s.checkpoint, None);
    assert_eq!(store.checkpoint("alpha").unwrap(), None);
    assert_eq!(store.run_history("alpha").unwrap()[0].status, RunStatus::Partial);
}

/// When every window fails and nothing is written the run fails outright.
#[test]
fn all_windows_failing_fails_the_run() {
    let mut raw = alpha_api();
    raw.fatal_window_containing = Some(T0 + DAY);
    let api = Arc::new(raw);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let h = harvester(&api, &store, fast_opts());
    let s = run_alpha(&h, 10, false);

    assert_eq!(s.status, RunStatus::Failed);
    assert_eq!(s.windows_failed, 1);
    assert_eq!(s.written(), 0);
    assert_eq!(store.run_history("alpha").unwrap()[0].status, RunStatus::Failed);
}

/// A parent batch that never commits blocks exactly the replies and stats that reference
/// it; everything else is committed.
#[test]
fn failed_parent_batch_skips_its_dependents() {
    let (api, store) = fresh();
    let mut sink = FlakySink::new((*store).clone());
    sink.poison_parents.insert("p060".into());
    let sink = Arc::new(sink);
    let dyn_api: Arc<dyn ListingApi> = api.clone();
    let h = Harvester::new(fast_opts().with_batch_size(50), dyn_api, sink.clone(), store.clone(), Arc::new(NoTelemetry))
        .unwrap();
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Partial);
    assert_eq!(s.parents_written, 70);
    assert_eq!(s.children_written, 190);
    assert_eq!(s.aggregates_written, 70);
    assert_eq!(s.actors_written, 9);
    // the poisoned batch is tried four times, the other two once each
    assert_eq!(sink.parent_attempts.load(Ordering::SeqCst), 6);

    let failures: Vec<_> = s.errors_of(ErrorKind::WriteFailure).collect();
    assert!(failures.iter().any(|e| e.record_ids.len() == 50 && e.record_ids.contains(&"p060".to_string())));
    assert!(failures.iter().any(|e| e.record_ids.len() == 110));
    assert_eq!(store.table_count("children").unwrap(), 190);
    assert_eq!(store.child_depth("c055a").unwrap(), None);
    assert_eq!(store.child_depth("c045a").unwrap(), Some(0));
    assert_eq!(store.checkpoint("alpha").unwrap(), None);
}

/// Transient batch failures are retried and do not show up in the result.
#[test]
fn transient_write_failures_are_retried() {
    let (api, store) = fresh();
    let sink = FlakySink::new((*store).clone());
    sink.child_failures.store(2, Ordering::SeqCst);
    let dyn_api: Arc<dyn ListingApi> = api.clone();
    let sink: Arc<dyn RecordSink> = Arc::new(sink);
    let h = Harvester::new(fast_opts(), dyn_api, sink, store.clone(), Arc::new(NoTelemetry)).unwrap();
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert_eq!(s.children_written, 300);
}

/// Cancelling mid-listing stops further pages, skips replies and writes, and closes the
/// run as partial without moving the checkpoint.
#[test]
fn cancellation_stops_the_run() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts().with_parallelism(1));
    *api.cancel_after_listings.lock().unwrap() = Some((1, h.cancel_token()));
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Partial);
    assert!(s.errors_of(ErrorKind::Cancelled).count() >= 1);
    assert_eq!(s.written(), 0);
    assert_eq!(api.listing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.reply_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.table_count("parents").unwrap(), 0);
    assert_eq!(store.checkpoint("alpha").unwrap(), None);

    let history = store.run_history("alpha").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Partial);
}

/// A later edit of an already stored parent replaces it; nothing else is rewritten.
#[test]
fn edited_parent_is_updated_on_rerun() {
    let (api, store) = fresh();
    assert!(run_alpha(&harvester(&api, &store, fast_opts()), 45, false).succeeded());

    let mut raw = alpha_api();
    raw.posts[5].edited = Some(json!((alpha_created(5) + DAY) as f64));
    raw.posts[5].title = Some("post p005 (edited)".into());
    let api = Arc::new(raw);
    let s = run_alpha(&harvester(&api, &store, fast_opts()), 45, false);

    assert_eq!(s.status, RunStatus::Succeeded);
    assert_eq!(s.parents_written, 1);
    assert_eq!((s.children_written, s.actors_written, s.aggregates_written), (0, 0, 0));
    assert_eq!(store.parent_title("p005").unwrap().as_deref(), Some("post p005 (edited)"));
}

/// Without replies only parents and their authors are written.
#[test]
fn parents_only_run() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    let s = h.fetch_source_data("alpha", at(T0), at(T0 + 45 * DAY), false, 25, false);

    assert_eq!(s.status, RunStatus::Succeeded);
    assert_eq!(s.parents_written, 120);
    assert_eq!(s.actors_written, 7);
    assert_eq!((s.children_written, s.aggregates_written), (0, 0));
    assert_eq!(api.reply_calls.load(Ordering::SeqCst), 0);
}

/// Source names are normalized before use.
#[test]
fn source_names_are_normalized() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());
    let s = h.fetch_source_data("/r/Alpha/", at(T0), at(T0 + 3 * DAY), false, 0, false);
    assert_eq!(s.source, "alpha");
    assert!(s.succeeded());
    let sources: i64 = store
        .with_conn(|c| c.query_row("SELECT COUNT(*) FROM parents WHERE source = 'alpha'", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(sources as u64, s.parents_written);
}

/// Bad requests fail before any fetch and leave no audit row.
#[test]
fn misconfigured_requests_fail_early() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts());

    let empty = h.fetch_source_data("  ", at(T0), at(T0 + DAY), true, 0, false);
    assert_eq!(empty.status, RunStatus::Failed);
    assert_eq!(empty.errors[0].kind, ErrorKind::PlannerMisconfiguration);

    let inverted = h.fetch_source_data("alpha", at(T0 + DAY), at(T0), true, 0, false);
    assert_eq!(inverted.status, RunStatus::Failed);
    assert_eq!(inverted.errors[0].kind, ErrorKind::PlannerMisconfiguration);

    assert_eq!(api.listing_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.table_count("fetch_runs").unwrap(), 0);
}

/// Alpha with the second reply of thread 61 deleted; it has nothing below it.
fn alpha_with_deleted_leaf() -> Arc<FakeApi> {
    let mut raw = alpha_api();
    let leaf = &mut raw.threads.get_mut("p061").unwrap().comments[1];
    leaf.author = Some("[deleted]".into());
    leaf.author_fullname = None;
    leaf.body = Some("[deleted]".into());
    Arc::new(raw)
}

/// Deleted replies are kept by default; with `include_deleted` off, only those without
/// surviving replies below them are left out.
#[test]
fn deleted_leaves_are_dropped_on_request() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let kept = run_alpha(&harvester(&alpha_with_deleted_leaf(), &store, fast_opts()), 45, false);
    assert_eq!(kept.status, RunStatus::Succeeded, "{:?}", kept.errors);
    assert_eq!(kept.children_written, 300);

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let opts = fast_opts().with_include_deleted(false);
    let s = run_alpha(&harvester(&alpha_with_deleted_leaf(), &store, opts), 45, false);
    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert_eq!(s.children_fetched, 300);
    assert_eq!(s.children_written, 299);
    assert_eq!(store.child_depth("c061b").unwrap(), None);
    // deleted, but its reply survives
    assert_eq!(store.child_depth("c060a").unwrap(), Some(0));
    assert_eq!(store.child_depth("c060b").unwrap(), Some(1));
    assert_eq!(store.thread_stats("p061").unwrap().unwrap().total_comments, 1);
}

/// Placeholders below the continuation threshold are reported, not expanded; the rest of
/// the run is unaffected.
#[test]
fn continuation_threshold_skips_small_placeholders() {
    let (api, store) = fresh();
    let h = harvester(&api, &store, fast_opts().with_continuation_threshold(2));
    let s = run_alpha(&h, 45, false);

    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert_eq!(api.expand_calls.load(Ordering::SeqCst), 1);
    assert_eq!(s.children_written, 294);
    let skipped: Vec<&RunError> = s.errors_of(ErrorKind::UnresolvedParent).collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].record_ids, vec!["c000b", "c010c", "c030c", "c040c", "c050c"]);
    assert_eq!(store.child_depth("c020c").unwrap(), Some(2));
    assert_eq!(store.thread_stats("p000").unwrap().unwrap().total_comments, 1);
    assert!(store.checkpoint("alpha").unwrap().is_some());
}

/// Scenario "beta": orphans, a cycle, and a placeholder chain longer than the round cap.
fn beta_api() -> FakeApi {
    let mut api = FakeApi::with_posts(vec![
        post("q0", T0 + DAY, Some("dave"), 5),
        post("q1", T0 + 2 * DAY, Some("erin"), 9),
    ]);
    let c = |id: &str, parent: &str, link: &str, n: i64| comment(id, parent, link, T0 + 3 * DAY + n, Some("carol"));
    api.threads.insert(
        "q0".into(),
        Thread {
            comments: vec![c("x1", "t3_q0", "q0", 1), c("x2", "t1_x1", "q0", 2), c("o1", "t1_ghost", "q0", 3), c("o2", "t1_o1", "q0", 4)],
            more: vec![],
        },
    );
    api.threads.insert(
        "q1".into(),
        Thread {
            comments: vec![c("y1", "t1_y2", "q1", 5), c("y2", "t1_y1", "q1", 6), c("z1", "t3_q1", "q1", 7)],
            more: vec![more("m1", "t1_z1", &["z2"])],
        },
    );
    api.expansions.insert(
        "m1".into(),
        Thread { comments: vec![c("z2", "t1_z1", "q1", 8)], more: vec![more("m2", "t1_z2", &["z3"])] },
    );
    api.expansions.insert(
        "m2".into(),
        Thread {
            comments: vec![c("z3", "t1_z2", "q1", 9), c("z5", "t1_z4", "q1", 11)],
            more: vec![more("m3", "t1_z3", &["z4"])],
        },
    );
    api
}

/// Replies that cannot be attached are reported by cause and left out; the resolvable
/// part of each thread is written and the run still succeeds.
#[test]
fn unattachable_replies_are_reported() {
    let api = Arc::new(beta_api());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let recorder = Arc::new(Recorder::default());
    let dyn_api: Arc<dyn ListingApi> = api.clone();
    let h = Harvester::with_sqlite(fast_opts().with_continuation_rounds(2), dyn_api, store.clone(), recorder.clone())
        .unwrap();
    let s = h.fetch_source_data("beta", at(T0), at(T0 + 10 * DAY), true, 0, false);

    assert_eq!(s.status, RunStatus::Succeeded, "{:?}", s.errors);
    assert_eq!(s.parents_written, 2);
    assert_eq!(s.children_written, 5);
    assert_eq!(s.orphans, 5);
    assert_eq!(s.checkpoint.as_ref().map(|c| c.at), Some(T0 + 10 * DAY));

    let unresolved: Vec<Vec<String>> = s.errors_of(ErrorKind::UnresolvedParent).map(|e| e.record_ids.clone()).collect();
    assert!(unresolved.contains(&vec!["z4".to_string()]));
    assert!(unresolved.contains(&vec!["o1".to_string(), "z5".to_string()]));
    assert!(unresolved.contains(&vec!["y1".to_string(), "y2".to_string()]));
    assert!(unresolved.contains(&vec!["o2".to_string()]));
    assert_eq!(unresolved.len(), 4);
    assert_eq!(api.expand_calls.load(Ordering::SeqCst), 2);

    assert_eq!(store.child_depth("z3").unwrap(), Some(2));
    assert_eq!(store.child_depth("o1").unwrap(), None);
    assert_eq!(store.thread_stats("q0").unwrap().unwrap().total_comments, 2);
    assert_eq!(store.thread_stats("q1").unwrap().unwrap().max_depth, 2);

    let events = recorder.0.lock().unwrap();
    assert!(matches!(events.first(), Some(RunEvent::Planned { windows: 1, .. })));
    assert!(matches!(events.last(), Some(RunEvent::Finished { status: RunStatus::Succeeded, .. })));
    let replies = events.iter().filter(|e| matches!(e, RunEvent::RepliesFetched { .. })).count();
    assert_eq!(replies, 2);
    assert!(events.iter().any(|e| matches!(e, RunEvent::BatchCommitted { stage: Stage::Children, written: 5, .. })));
}
