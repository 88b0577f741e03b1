#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{
    AgentStatus, ConductorError, ConductorResult, ExecutionRecord, HeartbeatSnapshot, Message,
    NullPlatform, PlatformFacade, Priority, ResultSummary,
};
use conductor_orchestrator::*;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_heartbeat_timeout(Duration::from_millis(20))
        .with_stop_grace_period(Duration::from_millis(200))
        .with_bus_sweep_interval(Duration::from_millis(10))
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(fast_settings(), Arc::new(NullPlatform)).unwrap()
}

fn fast(name: &str) -> AgentConfig {
    AgentConfig::new(name)
        .with_interval(Duration::from_millis(20))
        .with_timeout(Duration::from_millis(15))
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Platform that rejects every heartbeat.
struct UnreachablePlatform;

#[async_trait]
impl PlatformFacade for UnreachablePlatform {
    async fn heartbeat(&self, _agent: &str, _snapshot: &HeartbeatSnapshot) -> ConductorResult<()> {
        Err(ConductorError::Platform("dashboard unreachable".into()))
    }
    async fn log_execution(&self, _agent: &str, _record: &ExecutionRecord) -> ConductorResult<()> {
        Ok(())
    }
    async fn check_dependency(&self, _name: &str) -> ConductorResult<bool> {
        Ok(false)
    }
    async fn get_data(&self, _t: &str, _f: &serde_json::Value) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    async fn execute_action(&self, _a: &str, _p: &serde_json::Value) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// 1. Concurrent manual triggers: exactly one proceeds, the rest are busy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_manual_triggers_are_single_flight() {
    let orch = orchestrator();
    orch.register_agent(
        AgentConfig::new("catalog").with_timeout(Duration::from_secs(5)),
        work_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ResultSummary::text("synced"))
        }),
    )
    .unwrap();

    let results = join_all((0..5).map(|_| orch.execute_now("catalog", serde_json::Value::Null))).await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_busy()))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(busy, 4);
    assert_eq!(orch.get_metrics("catalog").unwrap().total_executions, 1);
}

// ---------------------------------------------------------------------------
// 2. Always-failing agent: three failures, then quarantined
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_agent_is_counted_exactly_and_quarantined() {
    let orch = orchestrator();
    orch.register_agent(
        fast("A").with_max_retries(2),
        work_fn(|_ctx| async { Err(ConductorError::Execution("payment gateway down".into())) }),
    )
    .unwrap();
    orch.start_agent("A").unwrap();

    assert!(wait_until(Duration::from_secs(2), || orch.get_status("A").unwrap().state.quarantined).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let metrics = orch.get_metrics("A").unwrap();
    assert_eq!(metrics.total_executions, 3);
    assert_eq!(metrics.failed_executions, 3);
    assert_eq!(metrics.error_rate(), 100.0);
    assert_eq!(
        metrics.last_error_message.as_deref(),
        Some("Execution error: payment gateway down")
    );
    assert_eq!(orch.get_status("A").unwrap().state.status, AgentStatus::Error);

    let errors = orch.get_logs("A", 10, Some(LogLevel::Error)).unwrap();
    assert!(errors[0].message.contains("quarantined"));
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Timeout cancels the work before its side effect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_cancels_in_flight_work() {
    let orch = orchestrator();
    let side_effect = Arc::new(AtomicBool::new(false));
    let flag = side_effect.clone();
    orch.register_agent(
        AgentConfig::new("slow").with_timeout(Duration::from_millis(50)),
        work_fn(move |_ctx| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(ResultSummary::text("too late"))
            }
        }),
    )
    .unwrap();

    let started = Instant::now();
    let outcome = orch.execute_now("slow", serde_json::Value::Null).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind.as_deref(), Some("timeout"));
    assert_eq!(orch.get_status("slow").unwrap().state.status, AgentStatus::Error);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!side_effect.load(Ordering::SeqCst));
    assert_eq!(orch.get_metrics("slow").unwrap().successful_executions, 0);
}

// ---------------------------------------------------------------------------
// 4. Dependency gating: B waits for A
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependent_agent_waits_for_dependency() {
    let orch = orchestrator();
    let b_runs = Arc::new(AtomicU32::new(0));
    let counter = b_runs.clone();
    orch.register_agent(
        fast("B").with_dependency("A"),
        work_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(ResultSummary::text("b")) }
        }),
    )
    .unwrap();
    orch.start_agent("B").unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(b_runs.load(Ordering::SeqCst), 0);
    assert_eq!(orch.get_metrics("B").unwrap().total_executions, 0);
    assert_eq!(orch.get_status("B").unwrap().state.status, AgentStatus::Idle);
    assert!(!orch.get_logs("B", 5, Some(LogLevel::Warn)).unwrap().is_empty());

    orch.register_agent(fast("A"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.start_agent("A").unwrap();
    assert!(wait_until(Duration::from_secs(2), || b_runs.load(Ordering::SeqCst) > 0).await);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Heartbeat failures flag the agent without touching its status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_heartbeats_mark_agent_degraded() {
    let orch = Orchestrator::new(fast_settings(), Arc::new(UnreachablePlatform)).unwrap();
    orch.register_agent(fast("pricing"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.start_agent("pricing").unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            !orch.list_agents(&AgentFilter::heartbeat_degraded()).is_empty()
        })
        .await
    );
    let report = orch.get_status("pricing").unwrap();
    assert!(report.state.heartbeat_degraded);
    assert_ne!(report.state.status, AgentStatus::Error);
    assert!(report.metrics.successful_executions > 0);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Message bus: response timeout and expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_request_reports_once() {
    let orch = orchestrator();
    orch.register_agent(AgentConfig::new("orders"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.register_agent(AgentConfig::new("fraud"), BuiltinAgent::Noop.into_work())
        .unwrap();

    let request = Message::command("orders", "fraud", "score", serde_json::json!({"order": 42}))
        .require_response(Duration::from_millis(30));
    let id = orch.bus().send(request).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let notices = orch.bus().poll_batch("orders", 10);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].sender, SYSTEM_SENDER);
    assert_eq!(notices[0].subject, DELIVERY_FAILED_SUBJECT);
    assert_eq!(notices[0].correlation_id, Some(id));
    assert_eq!(notices[0].content["reason"], "response_timeout");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(orch.bus().poll_batch("orders", 10).is_empty());
}

#[tokio::test]
async fn expired_message_is_never_polled() {
    let orch = orchestrator();
    orch.register_agent(AgentConfig::new("marketing"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.register_agent(AgentConfig::new("catalog"), BuiltinAgent::Noop.into_work())
        .unwrap();

    let stale = Message::data("catalog", "marketing", "new-products", serde_json::json!([]))
        .with_priority(Priority::Critical)
        .expires_at(Utc::now() - chrono::Duration::seconds(1));
    orch.bus().send(stale).unwrap();

    assert_eq!(orch.bus().queue_len("marketing"), 0);
    assert!(orch.bus().poll_batch("marketing", 10).is_empty());
}

// ---------------------------------------------------------------------------
// 7. Inbox agent answers a request through the running orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbox_agent_answers_requests() {
    let orch = orchestrator();
    orch.register_agent(AgentConfig::new("orders"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.register_agent(fast("inventory"), BuiltinAgent::Inbox { max_messages: 10 }.into_work())
        .unwrap();
    orch.start_agent("inventory").unwrap();

    let request = Message::command("orders", "inventory", "reserve", serde_json::json!({"sku": "A-1"}))
        .require_response(Duration::from_secs(5));
    let id = orch.bus().send(request).unwrap();

    let mut replies = Vec::new();
    assert!(
        wait_until(Duration::from_secs(2), || {
            replies.extend(orch.bus().poll_batch("orders", 10));
            !replies.is_empty()
        })
        .await
    );
    assert_eq!(replies[0].correlation_id, Some(id));
    assert_eq!(orch.bus().stats().awaiting_response, 0);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Deregistration and re-registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reregistered_agent_starts_from_zero() {
    let orch = orchestrator();
    orch.register_agent(fast("sync"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.register_agent(AgentConfig::new("ops"), BuiltinAgent::Noop.into_work())
        .unwrap();
    orch.start_agent("sync").unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            orch.get_metrics("sync").unwrap().total_executions >= 2
        })
        .await
    );
    orch.bus()
        .send(Message::notification("ops", "sync", "reindex", serde_json::Value::Null))
        .unwrap();

    orch.deregister_agent("sync").await.unwrap();
    assert!(matches!(
        orch.get_metrics("sync"),
        Err(ConductorError::AgentNotFound(_))
    ));
    let notices = orch.bus().poll_batch("ops", 10);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].content["reason"], "recipient_deregistered");

    orch.register_agent(fast("sync"), BuiltinAgent::Noop.into_work())
        .unwrap();
    assert_eq!(orch.get_metrics("sync").unwrap().total_executions, 0);
    assert_eq!(
        orch.get_status("sync").unwrap().state.status,
        AgentStatus::Initializing
    );
}

// ---------------------------------------------------------------------------
// 9. Start-all follows priority order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_all_in_priority_order() {
    let orch = orchestrator();
    for (name, priority) in [
        ("marketing", Priority::Low),
        ("orders", Priority::Critical),
        ("pricing", Priority::Normal),
        ("inventory", Priority::High),
        ("catalog", Priority::Critical),
    ] {
        orch.register_agent(
            AgentConfig::new(name).with_priority(priority),
            BuiltinAgent::Noop.into_work(),
        )
        .unwrap();
    }

    let started = orch.start_all_agents();
    assert_eq!(
        started,
        vec!["catalog", "orders", "inventory", "pricing", "marketing"]
    );

    let stopped = orch.stop_all_agents().await;
    assert_eq!(stopped.len(), 5);
    assert!(orch
        .list_agents(&AgentFilter::all())
        .iter()
        .all(|r| r.state.status == AgentStatus::Stopped));
}
