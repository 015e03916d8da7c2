//! 健康监控：周期探测、状态机与熔断
//!
//! 每个组件 UNKNOWN → HEALTHY | DEGRADED | FAILED；状态来自两条路径：周期探测（组件的 health_check）
//! 和外部上报（report_service_issue / report_service_healthy）。
//! 防探测风暴：距上次探测不足最小间隔、或同一组件正在进行的评估层数超过上限时跳过。
//! FAILED 转换计入全局熔断器；熔断打开时跳过所有探测，并升级为整体重启。
//! 总线消息以组件名为 receiver，不同组件的同类事件不会被去重窗口合并。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerState, CircuitBreaker};
use crate::bus::{kinds, OrderedMessageBus};
use crate::config::HealthSection;
use crate::recovery::{ComponentRegistry, RecoveryCause, RecoveryCoordinator};

const BUS_SENDER: &str = "health";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

/// 每个登记组件一条，进程生命周期内一直存在
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealthRecord {
    pub name: String,
    pub status: HealthStatus,
    pub failure_count: u32,
    pub last_probe: Option<Instant>,
    pub essential: bool,
    pub last_issue: Option<String>,
}

impl ServiceHealthRecord {
    fn new(name: &str, essential: bool) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            failure_count: 0,
            last_probe: None,
            essential,
            last_issue: None,
        }
    }
}

/// 健康状态回调
pub trait HealthListener: Send + Sync {
    fn on_service_health_changed(&self, _name: &str, _old: HealthStatus, _new: HealthStatus) {}

    fn on_service_recovered(&self, _name: &str) {}

    fn on_service_failed(&self, _name: &str, _cause: &str) {}
}

/// 同一组件并发评估层数的计数守卫
struct DepthGuard {
    depths: Arc<StdMutex<HashMap<String, u32>>>,
    name: String,
}

impl DepthGuard {
    fn enter(depths: &Arc<StdMutex<HashMap<String, u32>>>, name: &str, max: u32) -> Option<Self> {
        let mut map = depths.lock().unwrap_or_else(PoisonError::into_inner);
        let depth = map.entry(name.to_string()).or_insert(0);
        if *depth >= max {
            return None;
        }
        *depth += 1;
        Some(Self {
            depths: Arc::clone(depths),
            name: name.to_string(),
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let mut map = self.depths.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(depth) = map.get_mut(&self.name) {
            *depth = depth.saturating_sub(1);
        }
    }
}

/// 单次评估的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Evaluated(HealthStatus),
    /// 熔断打开
    SkippedBreakerOpen,
    /// 距上次探测太近
    SkippedTooSoon,
    /// 评估层数超限
    SkippedDepth,
    /// 组件没有可用的探测（状态只由上报驱动）
    NoProbe,
    UnknownService,
}

pub struct HealthMonitor {
    probe_interval: Duration,
    min_probe_interval: Duration,
    max_probe_depth: u32,
    probe_timeout: Duration,
    failed_after_issues: u32,
    records: Mutex<HashMap<String, ServiceHealthRecord>>,
    depths: Arc<StdMutex<HashMap<String, u32>>>,
    breaker: Mutex<CircuitBreaker>,
    registry: Arc<ComponentRegistry>,
    recovery: Option<Arc<RecoveryCoordinator>>,
    bus: Option<Arc<OrderedMessageBus>>,
    listeners: RwLock<Vec<Arc<dyn HealthListener>>>,
    probes_skipped: AtomicU64,
}

impl HealthMonitor {
    pub fn new(cfg: &HealthSection, registry: Arc<ComponentRegistry>) -> Self {
        Self {
            probe_interval: cfg.probe_interval(),
            min_probe_interval: cfg.min_probe_interval(),
            max_probe_depth: cfg.max_probe_depth.max(1),
            probe_timeout: cfg.probe_timeout(),
            failed_after_issues: cfg.failed_after_issues.max(1),
            records: Mutex::new(HashMap::new()),
            depths: Arc::new(StdMutex::new(HashMap::new())),
            breaker: Mutex::new(CircuitBreaker::new(
                cfg.breaker_threshold,
                cfg.breaker_window(),
                cfg.breaker_cooldown(),
            )),
            registry,
            recovery: None,
            bus: None,
            listeners: RwLock::new(Vec::new()),
            probes_skipped: AtomicU64::new(0),
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryCoordinator>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_bus(mut self, bus: Arc<OrderedMessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn add_listener(&self, listener: Arc<dyn HealthListener>) {
        self.listeners.write().await.push(listener);
    }

    /// 登记组件；重复登记只更新 essential 标记
    pub async fn register_service(&self, name: &str, essential: bool) {
        let mut records = self.records.lock().await;
        records
            .entry(name.to_string())
            .and_modify(|r| r.essential = essential)
            .or_insert_with(|| ServiceHealthRecord::new(name, essential));
        tracing::debug!("Registered service '{}' (essential={})", name, essential);
    }

    /// 上报组件问题：累计失败次数，未达阈值为 DEGRADED，达到阈值为 FAILED
    pub async fn report_service_issue(&self, name: &str, issue: &str) -> HealthStatus {
        let (old, new, failure_count, essential) = {
            let mut records = self.records.lock().await;
            let record = records.entry(name.to_string()).or_insert_with(|| {
                tracing::warn!("Issue reported for unregistered service '{}'", name);
                ServiceHealthRecord::new(name, false)
            });
            let old = record.status;
            record.failure_count += 1;
            record.last_issue = Some(issue.to_string());
            record.status = if record.failure_count >= self.failed_after_issues {
                HealthStatus::Failed
            } else {
                HealthStatus::Degraded
            };
            (old, record.status, record.failure_count, record.essential)
        };

        tracing::warn!("Service '{}' issue ({}): {}", name, failure_count, issue);
        self.after_transition(name, old, new, failure_count, essential, issue)
            .await;
        new
    }

    /// 上报组件恢复健康：清零失败次数
    pub async fn report_service_healthy(&self, name: &str) -> HealthStatus {
        let old = {
            let mut records = self.records.lock().await;
            let record = records
                .entry(name.to_string())
                .or_insert_with(|| ServiceHealthRecord::new(name, false));
            let old = record.status;
            record.failure_count = 0;
            record.last_issue = None;
            record.status = HealthStatus::Healthy;
            old
        };
        self.after_transition(name, old, HealthStatus::Healthy, 0, false, "")
            .await;
        HealthStatus::Healthy
    }

    async fn after_transition(
        &self,
        name: &str,
        old: HealthStatus,
        new: HealthStatus,
        failure_count: u32,
        essential: bool,
        cause: &str,
    ) {
        let listeners = self.listeners.read().await.clone();

        if old != new {
            for l in &listeners {
                l.on_service_health_changed(name, old, new);
            }
            self.publish(
                name,
                kinds::HEALTH_CHANGED,
                json!({ "service": name, "old": old, "new": new }),
            )
            .await;
        }

        match new {
            HealthStatus::Failed => {
                if old != HealthStatus::Failed {
                    tracing::error!("Service '{}' FAILED: {}", name, cause);
                    for l in &listeners {
                        l.on_service_failed(name, cause);
                    }
                    self.publish(
                        name,
                        kinds::SERVICE_FAILED,
                        json!({ "service": name, "cause": cause }),
                    )
                    .await;

                    let opened = self.breaker.lock().await.record_failure(Instant::now());
                    if opened {
                        tracing::error!("Circuit breaker opened, probing suspended");
                        if let Some(recovery) = &self.recovery {
                            recovery.escalate("circuit breaker opened");
                        }
                        return;
                    }
                }
                self.delegate_recovery(name, failure_count, essential, cause);
            }
            HealthStatus::Healthy
                if matches!(old, HealthStatus::Degraded | HealthStatus::Failed) =>
            {
                tracing::info!("Service '{}' recovered", name);
                for l in &listeners {
                    l.on_service_recovered(name);
                }
                self.publish(name, kinds::SERVICE_RECOVERED, json!({ "service": name }))
                    .await;
                if let Some(recovery) = &self.recovery {
                    recovery.reset_attempts(name).await;
                }
            }
            _ => {}
        }
    }

    /// 进入 FAILED 之后的失败评估次数仍在恢复预算内时，把关键组件交给恢复协调器（后台执行）
    fn delegate_recovery(&self, name: &str, failure_count: u32, essential: bool, cause: &str) {
        let Some(recovery) = &self.recovery else { return };
        if !essential {
            return;
        }
        let failed_evaluations = failure_count.saturating_sub(self.failed_after_issues) + 1;
        if failed_evaluations > recovery.max_attempts() {
            tracing::warn!("Service '{}' persistently failed, not delegating recovery", name);
            return;
        }
        let recovery = Arc::clone(recovery);
        let name = name.to_string();
        let cause = RecoveryCause::failure(cause);
        tokio::spawn(async move {
            if let Err(e) = recovery.recover_detailed(&name, cause).await.into_result(&name) {
                tracing::debug!("Delegated recovery did not succeed: {}", e);
            }
        });
    }

    /// 探测单个组件
    ///
    /// 先占用评估层数，再检查最小间隔；last_probe 在评估结束后才记录，
    /// 因此 health_check 内部重入同一组件的探测由层数上限拦截。
    pub async fn probe_service(&self, name: &str) -> ProbeResult {
        let now = Instant::now();
        if self.breaker.lock().await.is_open(now) {
            self.probes_skipped.fetch_add(1, Ordering::Relaxed);
            return ProbeResult::SkippedBreakerOpen;
        }

        let last_probe = match self.records.lock().await.get(name) {
            Some(record) => record.last_probe,
            None => return ProbeResult::UnknownService,
        };

        let Some(_guard) = DepthGuard::enter(&self.depths, name, self.max_probe_depth) else {
            self.probes_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Probe depth exceeded for '{}'", name);
            return ProbeResult::SkippedDepth;
        };

        if let Some(last) = last_probe {
            if now.duration_since(last) < self.min_probe_interval {
                self.probes_skipped.fetch_add(1, Ordering::Relaxed);
                return ProbeResult::SkippedTooSoon;
            }
        }

        let Some(component) = self.registry.get(name).await else {
            self.stamp_probe(name, now).await;
            return ProbeResult::NoProbe;
        };

        let status = match tokio::time::timeout(self.probe_timeout, component.health_check()).await {
            Ok(Ok(())) => self.report_service_healthy(name).await,
            Ok(Err(e)) => self.report_service_issue(name, &format!("probe failed: {e:#}")).await,
            Err(_) => self.report_service_issue(name, "probe timed out").await,
        };
        self.stamp_probe(name, now).await;
        ProbeResult::Evaluated(status)
    }

    async fn stamp_probe(&self, name: &str, at: Instant) {
        if let Some(record) = self.records.lock().await.get_mut(name) {
            record.last_probe = Some(at);
        }
    }

    /// 探测所有登记的组件；熔断打开时全部跳过
    pub async fn probe_all(&self) -> Vec<(String, ProbeResult)> {
        if self.breaker.lock().await.is_open(Instant::now()) {
            self.probes_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Circuit breaker open, skipping probe round");
            return Vec::new();
        }
        let names: Vec<String> = self.records.lock().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.probe_service(&name).await;
            results.push((name, result));
        }
        results
    }

    /// 启动周期探测任务
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Health monitor started ({:?} period)", monitor.probe_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.probe_all().await;
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }

    pub async fn status(&self, name: &str) -> Option<HealthStatus> {
        self.records.lock().await.get(name).map(|r| r.status)
    }

    pub async fn record(&self, name: &str) -> Option<ServiceHealthRecord> {
        self.records.lock().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ServiceHealthRecord> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().await.state(Instant::now())
    }

    /// 熔断器累计打开次数
    pub async fn breaker_trips(&self) -> u64 {
        self.breaker.lock().await.trips()
    }

    pub fn probes_skipped(&self) -> u64 {
        self.probes_skipped.load(Ordering::Relaxed)
    }

    async fn publish(&self, service: &str, msg_type: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.send(BUS_SENDER, service, msg_type, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoverySection;
    use crate::core::SessionSupervisor;
    use crate::recovery::{BufferTracker, ComponentCategory, ManagedComponent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Toggle {
        name: &'static str,
        healthy: AtomicBool,
        starts: AtomicUsize,
    }

    impl Toggle {
        fn new(name: &'static str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy: AtomicBool::new(healthy),
                starts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ManagedComponent for Toggle {
        fn name(&self) -> &str {
            self.name
        }
        fn category(&self) -> ComponentCategory {
            ComponentCategory::Service
        }
        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> anyhow::Result<()> {
            anyhow::ensure!(self.healthy.load(Ordering::SeqCst), "unhealthy");
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl HealthListener for Recorder {
        fn on_service_health_changed(&self, name: &str, old: HealthStatus, new: HealthStatus) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{name}:{old:?}->{new:?}"));
        }
        fn on_service_recovered(&self, name: &str) {
            self.events.lock().unwrap().push(format!("{name}:recovered"));
        }
        fn on_service_failed(&self, name: &str, _cause: &str) {
            self.events.lock().unwrap().push(format!("{name}:failed"));
        }
    }

    fn health_config() -> HealthSection {
        HealthSection {
            min_probe_interval_ms: 1000,
            failed_after_issues: 1,
            ..HealthSection::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_escalation_and_recovery_notification() {
        let cfg = HealthSection {
            failed_after_issues: 3,
            ..HealthSection::default()
        };
        let monitor = HealthMonitor::new(&cfg, Arc::new(ComponentRegistry::new()));
        let recorder = Arc::new(Recorder::default());
        monitor.add_listener(recorder.clone()).await;
        monitor.register_service("capture", true).await;

        assert_eq!(monitor.report_service_issue("capture", "slow").await, HealthStatus::Degraded);
        assert_eq!(monitor.report_service_issue("capture", "slow").await, HealthStatus::Degraded);
        assert_eq!(monitor.report_service_issue("capture", "dead").await, HealthStatus::Failed);
        monitor.report_service_healthy("capture").await;

        let record = monitor.record("capture").await.unwrap();
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "capture:Unknown->Degraded",
                "capture:Degraded->Failed",
                "capture:failed",
                "capture:Failed->Healthy",
                "capture:recovered",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_blocks_probes_until_cooldown() {
        let registry = Arc::new(ComponentRegistry::new());
        let svc = Toggle::new("svc", true);
        registry.register(svc.clone()).await;
        let monitor = HealthMonitor::new(&health_config(), registry);
        for name in ["svc", "a", "b", "c"] {
            monitor.register_service(name, false).await;
        }

        monitor.report_service_issue("a", "x").await;
        monitor.report_service_issue("b", "x").await;
        assert_eq!(monitor.breaker_state().await, BreakerState::Closed);
        monitor.report_service_issue("c", "x").await;
        assert_eq!(monitor.breaker_state().await, BreakerState::Open);
        assert_eq!(monitor.breaker_trips().await, 1);

        assert_eq!(monitor.probe_service("svc").await, ProbeResult::SkippedBreakerOpen);
        assert!(monitor.probe_all().await.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.breaker_state().await, BreakerState::Closed);
        assert_eq!(
            monitor.probe_service("svc").await,
            ProbeResult::Evaluated(HealthStatus::Healthy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_probe_interval() {
        let registry = Arc::new(ComponentRegistry::new());
        registry.register(Toggle::new("svc", true)).await;
        let monitor = HealthMonitor::new(&health_config(), registry);
        monitor.register_service("svc", true).await;

        assert!(matches!(monitor.probe_service("svc").await, ProbeResult::Evaluated(_)));
        assert_eq!(monitor.probe_service("svc").await, ProbeResult::SkippedTooSoon);
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(matches!(monitor.probe_service("svc").await, ProbeResult::Evaluated(_)));
        assert_eq!(monitor.probes_skipped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_guard_limits_reentrant_evaluation() {
        let depths = Arc::new(StdMutex::new(HashMap::new()));
        let first = DepthGuard::enter(&depths, "svc", 2);
        let second = DepthGuard::enter(&depths, "svc", 2);
        assert!(first.is_some() && second.is_some());
        assert!(DepthGuard::enter(&depths, "svc", 2).is_none());
        assert!(DepthGuard::enter(&depths, "other", 2).is_some());
        drop(second);
        assert!(DepthGuard::enter(&depths, "svc", 2).is_some());
    }

    /// health_check 内部再次探测自己的组件
    struct Reentrant {
        monitor: std::sync::OnceLock<Arc<HealthMonitor>>,
        nested: StdMutex<Vec<ProbeResult>>,
    }

    #[async_trait]
    impl ManagedComponent for Reentrant {
        fn name(&self) -> &str {
            "loop"
        }
        fn category(&self) -> ComponentCategory {
            ComponentCategory::Service
        }
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> anyhow::Result<()> {
            if let Some(monitor) = self.monitor.get() {
                let result = monitor.probe_service("loop").await;
                self.nested.lock().unwrap().push(result);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_evaluation_is_cut_by_depth_limit() {
        let registry = Arc::new(ComponentRegistry::new());
        let component = Arc::new(Reentrant {
            monitor: std::sync::OnceLock::new(),
            nested: StdMutex::new(Vec::new()),
        });
        registry.register(component.clone()).await;
        let monitor = Arc::new(HealthMonitor::new(&health_config(), registry));
        let _ = component.monitor.set(monitor.clone());
        monitor.register_service("loop", true).await;

        assert_eq!(
            monitor.probe_service("loop").await,
            ProbeResult::Evaluated(HealthStatus::Healthy)
        );
        // 第二层照常评估，第三层被层数上限拦下
        assert_eq!(
            *component.nested.lock().unwrap(),
            vec![
                ProbeResult::SkippedDepth,
                ProbeResult::Evaluated(HealthStatus::Healthy),
            ]
        );
        assert_eq!(monitor.probe_service("loop").await, ProbeResult::SkippedTooSoon);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_of_distinct_services_all_reach_bus() {
        let bus = Arc::new(OrderedMessageBus::new(
            Duration::from_millis(100),
            Duration::from_millis(1),
        ));
        let failed = Arc::new(StdMutex::new(Vec::new()));
        let sink = failed.clone();
        bus.subscribe_fn(kinds::SERVICE_FAILED, move |m| {
            sink.lock()
                .unwrap()
                .push(m.payload["service"].as_str().unwrap_or_default().to_string());
            Ok(())
        })
        .await;
        let token = CancellationToken::new();
        let drainer = bus.start(token.clone()).await.unwrap();

        let monitor = HealthMonitor::new(&health_config(), Arc::new(ComponentRegistry::new()))
            .with_bus(bus.clone());
        monitor.register_service("a", true).await;
        monitor.register_service("b", true).await;
        monitor.report_service_issue("a", "down").await;
        monitor.report_service_issue("b", "down").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        drainer.await.unwrap();
        assert_eq!(*failed.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(bus.stats().duplicates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_delegates_recovery_for_essential_service() {
        let registry = Arc::new(ComponentRegistry::new());
        let svc = Toggle::new("svc", false);
        registry.register(svc.clone()).await;
        let recovery = Arc::new(RecoveryCoordinator::new(
            &RecoverySection {
                restart_delay_ms: 10,
                ..RecoverySection::default()
            },
            Arc::clone(&registry),
            BufferTracker::new(1024),
            SessionSupervisor::new(),
        ));
        let monitor = HealthMonitor::new(&health_config(), registry).with_recovery(recovery.clone());
        monitor.register_service("svc", true).await;

        assert_eq!(
            monitor.probe_service("svc").await,
            ProbeResult::Evaluated(HealthStatus::Failed)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.attempt_record("svc").await.unwrap().attempts, 1);

        // 恢复后探测通过：尝试计数清零
        svc.healthy.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            monitor.probe_service("svc").await,
            ProbeResult::Evaluated(HealthStatus::Healthy)
        );
        assert!(recovery.attempt_record("svc").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_essential_service_is_not_recovered() {
        let registry = Arc::new(ComponentRegistry::new());
        let svc = Toggle::new("overlay", false);
        registry.register(svc.clone()).await;
        let recovery = Arc::new(RecoveryCoordinator::new(
            &RecoverySection::default(),
            Arc::clone(&registry),
            BufferTracker::new(1024),
            SessionSupervisor::new(),
        ));
        let monitor = HealthMonitor::new(&health_config(), registry).with_recovery(recovery.clone());
        monitor.register_service("overlay", false).await;

        monitor.probe_service("overlay").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.starts.load(Ordering::SeqCst), 0);
        assert!(recovery.attempt_record("overlay").await.is_none());
    }
}
