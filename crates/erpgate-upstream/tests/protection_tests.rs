//! Protected calls against the mock ERP

use erpgate_upstream::{
    ErpClient, ErpOperation, MockErp, ProtectionConfig, RateGovernor, GovernorConfig,
    GovernorLimits, RetryPolicy, UpstreamError, UpstreamGuard,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn unavailable() -> UpstreamError {
    UpstreamError::Status {
        status: 503,
        body: "Service Unavailable".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_503_503_200_returns_third_result() {
    let erp = MockErp::new();
    erp.fail_times(ErpOperation::GetCustomer, 2, unavailable())
        .await;

    let guard = UpstreamGuard::new(ProtectionConfig {
        retry: RetryPolicy::default().without_jitter(),
        ..ProtectionConfig::default()
    });

    let started = Instant::now();
    let customer = guard
        .protect(ErpOperation::GetCustomer.as_str(), || erp.get_customer("C001"))
        .await
        .unwrap();

    assert_eq!(customer[0]["CustomerID"]["value"], "C001");
    assert_eq!(erp.calls_for(ErpOperation::GetCustomer).await.len(), 3);
    // Two backoff delays: 300ms then 600ms
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted_surfaces_last_error() {
    let erp = MockErp::new();
    erp.fail_times(ErpOperation::GetOpportunity, 5, unavailable())
        .await;
    let guard = UpstreamGuard::new(ProtectionConfig {
        retry: RetryPolicy::default().without_jitter(),
        ..ProtectionConfig::default()
    });

    let err = guard
        .protect(ErpOperation::GetOpportunity.as_str(), || {
            erp.get_opportunity("OP1")
        })
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(503));
    assert_eq!(erp.calls().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_erp_times_out_like_a_504() {
    let erp = MockErp::new().with_latency(Duration::from_secs(30));
    let guard = UpstreamGuard::new(ProtectionConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        ..ProtectionConfig::default()
    });

    let err = guard
        .protect(ErpOperation::GetCustomer.as_str(), || erp.get_customer("C1"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout { .. }));
    assert_eq!(err.status_code(), Some(504));
    assert!(err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_governed_calls_never_exceed_caps() {
    let erp = Arc::new(MockErp::new().with_latency(Duration::from_millis(40)));
    let governor = Arc::new(RateGovernor::new(GovernorConfig {
        global: GovernorLimits {
            max_concurrency: 4,
            max_rpm: 6000,
        },
        scoped: GovernorLimits {
            max_concurrency: 2,
            max_rpm: 6000,
        },
        slow_wait_threshold: Duration::from_millis(250),
    }));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..20 {
        let (erp, governor, active, peak) =
            (erp.clone(), governor.clone(), active.clone(), peak.clone());
        handles.push(tokio::spawn(async move {
            let _permit = governor.acquire("specbooks").await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            erp.get_customer(&format!("C{n}")).await.unwrap();
            active.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(erp.calls().await.len(), 20);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(governor.global_available(), 4);
}
