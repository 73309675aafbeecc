// End-to-end runs against in-memory storage, a scripted transport and a
// manual clock.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use gridfeed_core::{DataSource, JobErrorKind, JobStatus, ScrapeJob};
use gridfeed_storage::{
    Clock, InMemoryJobLedger, InMemoryMeasurementStore, JobLedger, LedgerError, ManualClock,
    MeasurementQuery, MeasurementStore, ScriptedReply, ScriptedTransport,
};

use crate::{
    BackfillError, BackfillRequest, IngestServices, RegistryError, RunError, RunReport,
    SourceRegistry, SyncConfig,
};

const CATALOG: &str = r#"
sources:
  - source_id: rt-lbmp
    report_code: P-24A
    display_name: Real-time zonal LBMP
    url_template: "http://mis.test/realtime/{YYYYMMDD}realtime_zone.csv"
    archive_template: "http://mis.test/realtime/{YYYYMM01}realtime_zone_csv.zip"
    frequency: five-minute
    parser: zonal_price
  - source_id: da-lbmp
    report_code: P-2A
    display_name: Day-ahead zonal LBMP
    url_template: "http://mis.test/damlbmp/{YYYYMMDD}damlbmp_zone.csv"
    frequency: daily
    parser: zonal_price
"#;

const RT_ARCHIVE: &str = "http://mis.test/realtime/20251101realtime_zone_csv.zip";

struct Harness {
    transport: Arc<ScriptedTransport>,
    store: Arc<InMemoryMeasurementStore>,
    ledger: Arc<InMemoryJobLedger>,
    clock: Arc<ManualClock>,
    services: IngestServices,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    fn with_config(config: SyncConfig) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(InMemoryMeasurementStore::new());
        let ledger = Arc::new(InMemoryJobLedger::new());
        // 10:00 in New York.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 11, 10, 15, 0, 0).single().expect("ts"),
        ));
        let registry = SourceRegistry::from_yaml_str(CATALOG).expect("catalog");
        let services = IngestServices::new(
            config,
            registry,
            transport.clone(),
            store.clone(),
            ledger.clone(),
            clock.clone(),
        );
        Self {
            transport,
            store,
            ledger,
            clock,
            services,
        }
    }

    fn source(&self, source_id: &str) -> Arc<DataSource> {
        self.services.registry.get(source_id).cloned().expect("source")
    }

    fn serve(&self, source_id: &str, date: NaiveDate, body: String) {
        let url = self.source(source_id).primary_url(date);
        self.transport.script(url, vec![ScriptedReply::ok(body)]);
    }

    async fn run(&self, source_id: &str, date: NaiveDate) -> RunReport {
        let source = self.source(source_id);
        self.services.pipeline.run(&source, date).await.expect("run")
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, d).expect("date")
}

/// Zonal price report with `rows` distinct (zone, interval) rows; indices in
/// `bad` carry a non-numeric price.
fn price_report(date: NaiveDate, rows: usize, bad: &[usize]) -> String {
    let mut body = String::from(
        "\"Time Stamp\",\"Name\",\"PTID\",\"LBMP ($/MWHr)\",\"Marginal Cost Losses ($/MWHr)\",\"Marginal Cost Congestion ($/MWHr)\"\r\n",
    );
    let midnight = date.and_time(NaiveTime::default());
    for i in 0..rows {
        let at = midnight + chrono::Duration::minutes(5 * (i / 15) as i64);
        let lbmp = if bad.contains(&i) {
            "n/a".to_string()
        } else {
            format!("{:.2}", 20.0 + i as f64 / 10.0)
        };
        body.push_str(&format!(
            "\"{}\",\"Z{:02}\",{},{},0.50,-1.25\r\n",
            at.format("%m/%d/%Y %H:%M:%S"),
            i % 15,
            61700 + i % 15,
            lbmp
        ));
    }
    body
}

fn zip_of(name: &str, body: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::SimpleFileOptions::default())
        .expect("start entry");
    writer.write_all(body.as_bytes()).expect("write entry");
    writer.finish().expect("finish zip").into_inner()
}

fn finished(report: RunReport) -> ScrapeJob {
    match report {
        RunReport::Finished(job) => job,
        RunReport::Contended => panic!("run was unexpectedly contended"),
    }
}

#[tokio::test]
async fn reingesting_the_same_report_only_counts_duplicates() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 300, &[]));

    let first = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(first.status, JobStatus::Success);
    assert_eq!(first.rows_inserted, 300);
    assert_eq!(first.rows_duplicate, 0);
    assert!(!first.fallback_used);
    assert!(first.content_hash.is_some());

    let second = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(second.status, JobStatus::Success);
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(second.rows_duplicate, 300);
    assert_eq!(second.content_hash, first.content_hash);

    assert_eq!(h.store.len(), 300);
    assert_eq!(h.ledger.jobs().len(), 2);
}

#[tokio::test]
async fn malformed_rows_make_a_partial_run() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 100, &[10, 50, 99]));

    let job = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Partial);
    assert_eq!(job.rows_inserted, 97);
    assert_eq!(job.rows_skipped, 3);
    assert!(job.error_detail.is_some());
    assert!(job.is_complete());
    assert_eq!(h.store.len(), 97);
}

#[tokio::test]
async fn missing_daily_file_is_recovered_from_the_monthly_archive() {
    let h = Harness::new();
    h.transport.script(
        RT_ARCHIVE,
        vec![ScriptedReply::ok(zip_of(
            "20251110realtime_zone.csv",
            &price_report(day(10), 45, &[]),
        ))],
    );

    let job = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.fallback_used);
    assert_eq!(job.rows_inserted, 45);

    let primary = h.source("rt-lbmp").primary_url(day(10));
    assert_eq!(h.transport.request_count(&primary), 1);
    assert_eq!(h.transport.request_count(RT_ARCHIVE), 1);

    let direct = Harness::new();
    direct.serve("rt-lbmp", day(10), price_report(day(10), 45, &[]));
    let direct_job = finished(direct.run("rt-lbmp", day(10)).await);
    assert!(!direct_job.fallback_used);

    let query = MeasurementQuery::for_source("rt-lbmp");
    let via_archive = h.store.query(&query).await.expect("query");
    let via_primary = direct.store.query(&query).await.expect("query");
    assert_eq!(via_archive.len(), 45);
    assert_eq!(via_archive, via_primary);
}

#[tokio::test]
async fn failed_write_leaves_nothing_and_a_retry_recovers() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 1000, &[]));
    h.store.fail_after(500);

    let failed = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::Storage));
    assert_eq!(failed.rows_inserted, 0);
    assert!(h.store.is_empty());

    let retried = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(retried.status, JobStatus::Success);
    assert_eq!(retried.rows_inserted, 1000);
    assert_eq!(h.store.len(), 1000);
}

#[tokio::test]
async fn unpublished_report_without_archive_is_not_yet_available() {
    let h = Harness::new();

    let job = finished(h.run("da-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(JobErrorKind::NotYetAvailable));
    assert!(!h
        .services
        .pipeline
        .ledger()
        .is_complete("da-lbmp", day(10))
        .await
        .expect("ledger"));
}

#[tokio::test]
async fn report_with_only_bad_rows_fails_as_parse_error() {
    let h = Harness::new();
    h.serve("da-lbmp", day(10), price_report(day(10), 4, &[0, 1, 2, 3]));

    let job = finished(h.run("da-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(JobErrorKind::Parse));
    assert_eq!(job.rows_skipped, 4);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn empty_report_succeeds_but_is_not_complete() {
    let h = Harness::new();
    h.serve("da-lbmp", day(10), price_report(day(10), 0, &[]));

    let job = finished(h.run("da-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.rows_inserted, 0);
    assert!(!job.is_complete());
}

#[tokio::test]
async fn exhausted_retries_fail_as_transient() {
    let h = Harness::new();
    let url = h.source("da-lbmp").primary_url(day(10));
    h.transport.script(url.clone(), vec![ScriptedReply::status(503)]);

    let job = finished(h.run("da-lbmp", day(10)).await);
    assert_eq!(job.error_kind, Some(JobErrorKind::Transient));
    assert_eq!(h.transport.request_count(&url), 3);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test]
async fn pair_held_in_process_is_skipped() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));

    let held = h
        .services
        .pipeline
        .locks()
        .try_acquire("rt-lbmp", day(10))
        .expect("lock");
    assert!(matches!(h.run("rt-lbmp", day(10)).await, RunReport::Contended));
    assert!(h.ledger.jobs().is_empty());

    drop(held);
    assert_eq!(finished(h.run("rt-lbmp", day(10)).await).rows_inserted, 15);
}

#[tokio::test]
async fn live_run_in_the_ledger_blocks_until_it_goes_stale() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));
    h.ledger
        .insert(ScrapeJob::started("rt-lbmp", day(10), h.clock.now()));

    assert!(matches!(h.run("rt-lbmp", day(10)).await, RunReport::Contended));

    h.clock.advance(chrono::Duration::minutes(31));
    let job = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Success);

    let jobs = h.ledger.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs
        .iter()
        .any(|j| j.error_kind == Some(JobErrorKind::Abandoned)));
}

#[tokio::test(start_paused = true)]
async fn run_over_budget_is_failed_and_releases_its_lock() {
    let h = Harness::with_config(SyncConfig {
        run_budget: Duration::from_millis(50),
        ..SyncConfig::default()
    });
    let url = h.source("rt-lbmp").primary_url(day(10));
    h.transport.script(url, vec![ScriptedReply::Hang]);

    let job = finished(h.run("rt-lbmp", day(10)).await);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(JobErrorKind::Timeout));
    assert!(!h.services.pipeline.locks().is_held("rt-lbmp", day(10)));
}

#[tokio::test(start_paused = true)]
async fn simultaneous_runs_of_one_pair_execute_once() {
    let h = Harness::with_config(SyncConfig {
        run_budget: Duration::from_secs(5),
        ..SyncConfig::default()
    });
    let url = h.source("rt-lbmp").primary_url(day(10));
    h.transport.script(url.clone(), vec![ScriptedReply::Hang]);

    let source = h.source("rt-lbmp");
    let (a, b) = tokio::join!(
        h.services.pipeline.run(&source, day(10)),
        h.services.pipeline.run(&source, day(10)),
    );
    let reports = [a.expect("run"), b.expect("run")];
    let contended = reports
        .iter()
        .filter(|report| matches!(report, RunReport::Contended))
        .count();
    assert_eq!(contended, 1);
    assert_eq!(h.ledger.jobs().len(), 1);
    assert_eq!(h.transport.request_count(&url), 1);
}

#[tokio::test(start_paused = true)]
async fn backfill_and_tick_on_the_same_day_do_not_double_ingest() {
    let h = Harness::with_config(SyncConfig {
        run_budget: Duration::from_secs(5),
        ..SyncConfig::default()
    });
    let url = h.source("rt-lbmp").primary_url(day(10));
    h.transport.script(url.clone(), vec![ScriptedReply::Hang]);
    let scheduler = h.services.scheduler();
    let backfill = h.services.backfill();
    let request = BackfillRequest {
        from: day(10),
        to: None,
        source_ids: vec!["rt-lbmp".to_string()],
        force: false,
    };

    let (backfilled, ticked) = tokio::join!(backfill.run(&request), scheduler.tick());
    let backfilled = backfilled.expect("backfill");
    assert_eq!(backfilled.tally.contended + ticked.tally.contended, 1);

    let rt_jobs: Vec<ScrapeJob> = h
        .ledger
        .jobs()
        .into_iter()
        .filter(|job| job.source_id == "rt-lbmp")
        .collect();
    assert_eq!(rt_jobs.len(), 1);
    assert_eq!(rt_jobs[0].error_kind, Some(JobErrorKind::Timeout));
    assert_eq!(h.transport.request_count(&url), 1);
}

#[tokio::test]
async fn unrecorded_finish_surfaces_an_error_and_blocks_until_stale() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));
    h.ledger.set_finalize_unavailable(true);

    let source = h.source("rt-lbmp");
    let result = h.services.pipeline.run(&source, day(10)).await;
    assert!(matches!(result, Err(RunError::Ledger(LedgerError::Unavailable(_)))));
    assert_eq!(h.ledger.jobs()[0].status, JobStatus::Running);
    assert!(!h.services.pipeline.locks().is_held("rt-lbmp", day(10)));

    h.ledger.set_finalize_unavailable(false);
    assert!(matches!(h.run("rt-lbmp", day(10)).await, RunReport::Contended));

    h.clock.advance(chrono::Duration::minutes(31));
    assert_eq!(finished(h.run("rt-lbmp", day(10)).await).status, JobStatus::Success);
}

#[tokio::test]
async fn startup_reconcile_fails_abandoned_runs() {
    let h = Harness::new();
    h.ledger
        .insert(ScrapeJob::started("rt-lbmp", day(9), h.clock.now()));
    h.clock.advance(chrono::Duration::hours(1));

    assert_eq!(h.services.pipeline.reconcile_stale().await.expect("reconcile"), 1);
    assert_eq!(h.ledger.jobs()[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn scheduler_runs_due_sources_and_waits_for_the_next_boundary() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 30, &[]));
    h.serve("da-lbmp", day(10), price_report(day(10), 15, &[]));
    let scheduler = h.services.scheduler();

    let first = scheduler.tick().await;
    assert_eq!(first.due, 2);
    assert_eq!(first.tally.succeeded, 2);
    assert_eq!(first.tally.rows_inserted, 45);

    let ten_oh_five = day(10).and_hms_opt(10, 5, 0).expect("ts");
    assert_eq!(scheduler.next_due("rt-lbmp"), Some(ten_oh_five));
    assert_eq!(
        scheduler.next_due("da-lbmp"),
        day(11).and_hms_opt(0, 0, 0)
    );

    assert_eq!(scheduler.tick().await.due, 0);

    h.clock.advance(chrono::Duration::minutes(5));
    let later = scheduler.tick().await;
    assert_eq!(later.due, 1);
    assert_eq!(later.tally.rows_duplicate, 30);
}

#[tokio::test]
async fn failed_source_stays_due() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));
    let scheduler = h.services.scheduler();

    let first = scheduler.tick().await;
    assert_eq!(first.tally.succeeded, 1);
    assert_eq!(first.tally.not_yet_available, 1);
    assert_eq!(scheduler.next_due("da-lbmp"), None);

    let second = scheduler.tick().await;
    assert_eq!(second.due, 1);
    assert_eq!(scheduler.due_sources(scheduler.publisher_now())[0].source_id, "da-lbmp");
}

/// One zone per listed interval of `date`, each `HH:MM`.
fn late_intervals(date: NaiveDate, times: &[&str]) -> String {
    let mut body = String::from("\"Time Stamp\",\"Name\",\"PTID\",\"LBMP ($/MWHr)\"\r\n");
    for time in times {
        body.push_str(&format!(
            "\"{} {}:00\",\"N.Y.C.\",61761,42.10\r\n",
            date.format("%m/%d/%Y"),
            time
        ));
    }
    body
}

#[tokio::test]
async fn intervals_posted_after_the_last_tick_of_a_day_are_picked_up_after_midnight() {
    let h = Harness::new();
    // 23:56 in New York on the 10th.
    h.clock
        .set(Utc.with_ymd_and_hms(2025, 11, 11, 4, 56, 0).single().expect("ts"));
    h.serve("rt-lbmp", day(10), late_intervals(day(10), &["23:45", "23:50"]));
    let scheduler = h.services.scheduler();

    let before_midnight = scheduler.tick().await;
    assert_eq!(before_midnight.catch_up, 0);
    assert_eq!(before_midnight.tally.rows_inserted, 2);

    h.serve(
        "rt-lbmp",
        day(10),
        late_intervals(day(10), &["23:45", "23:50", "23:55"]),
    );
    h.clock.advance(chrono::Duration::minutes(5));
    let after_midnight = scheduler.tick().await;
    assert_eq!(after_midnight.catch_up, 2);
    assert_eq!(after_midnight.tally.rows_inserted, 1);
    assert_eq!(h.store.len(), 3);

    // Caught up until the source's next boundary; da-lbmp is still missing.
    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(scheduler.catch_up_sources(scheduler.publisher_now()).len(), 1);
    h.clock.advance(chrono::Duration::hours(1));
    assert!(scheduler.catch_up_sources(scheduler.publisher_now()).is_empty());

    let summary = h
        .services
        .backfill()
        .run(&BackfillRequest {
            from: day(10),
            to: Some(day(10)),
            source_ids: vec!["rt-lbmp".to_string()],
            force: false,
        })
        .await
        .expect("backfill");
    assert_eq!(summary.skipped_complete, 1);
    assert_eq!(h.store.len(), 3);
}

#[tokio::test]
async fn housekeeping_prunes_old_measurements_and_jobs() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));
    h.run("rt-lbmp", day(10)).await;
    let scheduler = h.services.scheduler();

    let kept = scheduler.prune(1).await.expect("prune");
    assert_eq!((kept.measurements, kept.jobs), (0, 0));

    h.clock.advance(chrono::Duration::days(3));
    let pruned = scheduler.prune(1).await.expect("prune");
    assert_eq!((pruned.measurements, pruned.jobs), (15, 1));
    let left = h
        .store
        .query(&MeasurementQuery::for_source("rt-lbmp"))
        .await
        .expect("query");
    assert!(left.is_empty());
}

#[tokio::test]
async fn backfill_skips_complete_pairs_unless_forced() {
    let h = Harness::new();
    for d in 7..=9 {
        h.serve("rt-lbmp", day(d), price_report(day(d), 15, &[]));
    }
    h.run("rt-lbmp", day(8)).await;

    let request = BackfillRequest {
        from: day(7),
        to: Some(day(9)),
        source_ids: vec!["rt-lbmp".to_string()],
        force: false,
    };
    let summary = h.services.backfill().run(&request).await.expect("backfill");
    assert_eq!(summary.pairs, 3);
    assert_eq!(summary.skipped_complete, 1);
    assert_eq!(summary.tally.succeeded, 2);
    assert_eq!(summary.tally.rows_inserted, 30);

    let forced = BackfillRequest {
        force: true,
        ..request
    };
    let summary = h.services.backfill().run(&forced).await.expect("backfill");
    assert_eq!(summary.skipped_complete, 0);
    assert_eq!(summary.tally.succeeded, 3);
    assert_eq!(summary.tally.rows_duplicate, 45);
}

#[tokio::test]
async fn backfill_always_reruns_the_current_day() {
    let h = Harness::new();
    h.serve("rt-lbmp", day(10), price_report(day(10), 15, &[]));
    h.run("rt-lbmp", day(10)).await;

    let summary = h
        .services
        .backfill()
        .run(&BackfillRequest {
            from: day(10),
            to: None,
            source_ids: vec!["rt-lbmp".to_string()],
            force: false,
        })
        .await
        .expect("backfill");
    assert_eq!(summary.skipped_complete, 0);
    assert_eq!(summary.tally.succeeded, 1);
}

#[tokio::test]
async fn backfill_rejects_bad_requests() {
    let h = Harness::new();
    let backfill = h.services.backfill();

    let inverted = backfill
        .run(&BackfillRequest {
            from: day(9),
            to: Some(day(7)),
            source_ids: Vec::new(),
            force: false,
        })
        .await;
    assert!(matches!(inverted, Err(BackfillError::InvertedRange { .. })));

    let unknown = backfill
        .run(&BackfillRequest {
            from: day(7),
            to: Some(day(7)),
            source_ids: vec!["nope".to_string()],
            force: false,
        })
        .await;
    assert!(matches!(
        unknown,
        Err(BackfillError::Registry(RegistryError::UnknownSource(_)))
    ));
}
