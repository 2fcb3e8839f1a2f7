//! Proxy pool and checker integration tests

mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::TestDb;
use pricewatch_core::config::JobsConfig;
use pricewatch_core::jobs::{JobKind, JobStatus};
use pricewatch_core::proxy::{ProxyRecord, ProxyStatus};
use pricewatch_core::worker::{ProxyChecker, ProxyProbe};
use pricewatch_core::{PipelineError, WorkerId};
use serde_json::json;
use serial_test::serial;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Endpoints whose last octet is even answer; odd ones do not
struct ParityProbe {
    probed: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ParityProbe {
    fn new() -> Self {
        Self {
            probed: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProxyProbe for ParityProbe {
    async fn probe(&self, proxy: &ProxyRecord) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.probed.lock().unwrap().push(proxy.endpoint.clone());
        tokio::task::yield_now().await;
        let host = proxy.endpoint.split(':').next().unwrap_or_default();
        let last: u32 = host.rsplit('.').next().and_then(|o| o.parse().ok()).unwrap_or(1);
        last % 2 == 0
    }
}

fn endpoints(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("10.0.{}.{}:3128", i / 200, i % 200 + 1)).collect()
}

#[tokio::test]
async fn test_import_normalizes_and_dedups() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();

    let summary = pool
        .import([
            "http://10.1.1.1:8080/",
            "10.1.1.1:8080",
            "  10.1.1.2:3128  ",
            "# comment",
            "",
            "not a proxy",
            "10.1.1.3:99999",
        ])
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.invalid, 2);

    let again = pool.import(["10.1.1.2:3128", "10.1.1.4:3128"]).await.unwrap();
    assert_eq!(again.inserted, 1);
    assert_eq!(again.already_known, 1);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.unchecked, 3);
    assert_eq!(stats.total(), 3);

    let record = pool.get("10.1.1.1:8080").await.unwrap().unwrap();
    assert_eq!(record.status, ProxyStatus::Unchecked);
}

#[tokio::test]
#[serial]
async fn test_proxy_check_jobs_processed_once_across_checkers() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    let list = endpoints(100);
    assert_eq!(pool.import(&list).await.unwrap().inserted, 100);

    let coordinator = db.coordinator_with(JobsConfig {
        lease_secs: 30,
        batch_size: 10,
        ..common::jobs_config()
    });
    for endpoint in &list {
        coordinator
            .enqueue(JobKind::ProxyCheck, json!({ "endpoint": endpoint }))
            .await
            .unwrap();
    }

    let probe = Arc::new(ParityProbe::new());
    let mut handles = Vec::new();
    for n in 0..5 {
        let checker = ProxyChecker::new(
            WorkerId::new(format!("checker-{}", n)).unwrap(),
            pool.clone(),
            probe.clone(),
            common::proxy_config(),
            common::fast_worker_config(),
            10,
        );
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            checker.process_check_jobs(&coordinator).await.unwrap()
        }));
    }

    let mut checked = 0;
    for handle in handles {
        checked += handle.await.unwrap().checked;
    }
    assert_eq!(checked, 100);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 100);

    let probed: HashSet<_> = probe.probed.lock().unwrap().iter().cloned().collect();
    assert_eq!(probed.len(), 100, "an endpoint was probed twice");

    let stats = coordinator.stats(JobKind::ProxyCheck).await.unwrap();
    assert_eq!(stats.done, 100);
    assert!(stats.is_drained());

    let proxy_stats = pool.stats().await.unwrap();
    assert_eq!(proxy_stats.unchecked, 0);
    assert_eq!(proxy_stats.working + proxy_stats.dead, 100);
}

#[tokio::test]
async fn test_check_once_leases_are_disjoint() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    pool.import(endpoints(40)).await.unwrap();

    let probe = Arc::new(ParityProbe::new());
    let mut handles = Vec::new();
    for n in 0..4 {
        let checker = ProxyChecker::new(
            WorkerId::new(format!("table-checker-{}", n)).unwrap(),
            pool.clone(),
            probe.clone(),
            common::proxy_config(),
            common::fast_worker_config(),
            5,
        );
        handles.push(tokio::spawn(async move { checker.run_until_idle().await.unwrap() }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().checked;
    }
    assert_eq!(total, 40);
    assert_eq!(pool.stats().await.unwrap().unchecked, 0);

    // Nothing is due again until the recheck interval passes
    let checker = ProxyChecker::new(
        WorkerId::new("late").unwrap(),
        pool.clone(),
        probe.clone(),
        common::proxy_config(),
        common::fast_worker_config(),
        50,
    );
    assert_eq!(checker.check_once().await.unwrap().checked, 0);
    db.clock
        .advance(Duration::seconds(common::proxy_config().recheck_secs + 1));
    assert_eq!(checker.check_once().await.unwrap().checked, 40);
}

#[tokio::test]
async fn test_status_transitions_follow_reports() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    pool.import(["10.2.0.1:8080", "10.2.0.2:8080"]).await.unwrap();

    // Unchecked fails straight to dead
    assert_eq!(pool.report("10.2.0.1:8080", false).await.unwrap(), ProxyStatus::Dead);

    // Working tolerates failures below the threshold
    assert_eq!(pool.report("10.2.0.2:8080", true).await.unwrap(), ProxyStatus::Working);
    let threshold = common::proxy_config().failure_threshold;
    for _ in 1..threshold {
        assert_eq!(pool.report("10.2.0.2:8080", false).await.unwrap(), ProxyStatus::Working);
    }
    assert_eq!(pool.report("10.2.0.2:8080", false).await.unwrap(), ProxyStatus::Dead);

    // A dead proxy that answers again is brought back
    assert_eq!(pool.report("10.2.0.2:8080", true).await.unwrap(), ProxyStatus::Working);
    let record = pool.get("10.2.0.2:8080").await.unwrap().unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.success_count, 2);
    assert_eq!(record.failure_count, threshold as i64);
    assert!(record.last_checked_at.is_some());
}

#[tokio::test]
async fn test_acquire_working_without_healthy_proxies() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();

    let err = pool.acquire_working(1).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoHealthyProxies));

    pool.import(["10.3.0.1:8080"]).await.unwrap();
    let err = pool.acquire_working(1).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoHealthyProxies));

    pool.report("10.3.0.1:8080", false).await.unwrap();
    let err = pool.acquire_working(1).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoHealthyProxies));
}

#[tokio::test]
async fn test_acquire_working_rotates_least_recently_used() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    let list = ["10.4.0.1:8080", "10.4.0.2:8080", "10.4.0.3:8080"];
    pool.import(list).await.unwrap();
    for endpoint in list {
        pool.report(endpoint, true).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        db.clock.advance(Duration::seconds(1));
        let got = pool.acquire_working(1).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, ProxyStatus::Working);
        order.push(got[0].endpoint.clone());
    }
    let distinct: HashSet<_> = order.iter().collect();
    assert_eq!(distinct.len(), 3);

    // The oldest use comes round again
    db.clock.advance(Duration::seconds(1));
    let next = pool.acquire_working(1).await.unwrap();
    assert_eq!(next[0].endpoint, order[0]);
}

#[tokio::test]
async fn test_ban_excludes_proxy_for_that_source_only() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    pool.import(["10.5.0.1:8080"]).await.unwrap();
    pool.report("10.5.0.1:8080", true).await.unwrap();

    assert_eq!(
        pool.report_ban("10.5.0.1:8080", "greenspark").await.unwrap(),
        ProxyStatus::Working
    );
    let err = pool.acquire_working_for("greenspark", 1).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoHealthyProxies));

    let other = pool.acquire_working_for("moba", 1).await.unwrap();
    assert_eq!(other[0].endpoint, "10.5.0.1:8080");
    assert!(other[0].is_banned_by("greenspark"));

    // Banning twice by one source counts once
    pool.report_ban("10.5.0.1:8080", "greenspark").await.unwrap();
    let record = pool.get("10.5.0.1:8080").await.unwrap().unwrap();
    assert_eq!(record.banned_sources, vec!["greenspark".to_string()]);
}

#[tokio::test]
async fn test_ban_limit_kills_proxy() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    pool.import(["10.6.0.1:8080"]).await.unwrap();
    pool.report("10.6.0.1:8080", true).await.unwrap();

    let limit = common::proxy_config().ban_limit;
    let mut status = ProxyStatus::Working;
    for n in 0..limit {
        status = pool
            .report_ban("10.6.0.1:8080", &format!("source-{}", n))
            .await
            .unwrap();
    }
    assert_eq!(status, ProxyStatus::Dead);
    assert!(pool.acquire_working(1).await.is_err());
}

#[tokio::test]
async fn test_unknown_endpoint_check_job_fails() {
    let Some(db) = TestDb::connect().await else { return };
    let coordinator = db.coordinator_with(JobsConfig {
        max_attempts: 1,
        ..common::jobs_config()
    });
    let id = coordinator
        .enqueue(JobKind::ProxyCheck, json!({ "endpoint": "10.9.9.9:1" }))
        .await
        .unwrap();

    let checker = ProxyChecker::new(
        WorkerId::new("checker").unwrap(),
        db.proxies(),
        Arc::new(ParityProbe::new()),
        common::proxy_config(),
        common::fast_worker_config(),
        10,
    );
    let summary = checker.process_check_jobs(&coordinator).await.unwrap();
    assert_eq!(summary.checked, 0);

    let job = coordinator.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_late_check_report_keeps_newer_lease() {
    let Some(db) = TestDb::connect().await else { return };
    let pool = db.proxies();
    pool.import(["10.10.0.1:8080"]).await.unwrap();
    let lease = common::proxy_config().lease();

    let slow = WorkerId::new("checker-slow").unwrap();
    let fresh = WorkerId::new("checker-fresh").unwrap();
    assert_eq!(pool.check_batch(&slow, 1, lease).await.unwrap().len(), 1);

    // The first lease runs out and the endpoint goes to another checker
    db.clock.advance(lease + Duration::seconds(1));
    assert_eq!(pool.check_batch(&fresh, 1, lease).await.unwrap().len(), 1);

    pool.report_check("10.10.0.1:8080", &slow, true).await.unwrap();
    let record = pool.get("10.10.0.1:8080").await.unwrap().unwrap();
    assert_eq!(record.status, ProxyStatus::Working);
    assert_eq!(record.check_claimed_by.as_deref(), Some("checker-fresh"));
    assert!(record.check_lease_expires_at.is_some());

    // A crawl report leaves a live check lease in place too
    pool.report("10.10.0.1:8080", true).await.unwrap();
    let record = pool.get("10.10.0.1:8080").await.unwrap().unwrap();
    assert_eq!(record.check_claimed_by.as_deref(), Some("checker-fresh"));

    pool.report_check("10.10.0.1:8080", &fresh, true).await.unwrap();
    let record = pool.get("10.10.0.1:8080").await.unwrap().unwrap();
    assert!(record.check_claimed_by.is_none());
    assert!(record.check_lease_expires_at.is_none());
}
