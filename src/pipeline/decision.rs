//! 决策同步：单飞的融合周期
//!
//! trigger_decision 非阻塞：已有周期在执行时直接返回 None。周期在读锁下取状态快照，
//! 查询所有策略并融合；融合失败、panic 或超时都降级为置信度 0 的 None 动作，
//! 决策仍然发布，并且标记位一定被清除。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::Listeners;
use super::learning::LearningLoop;
use super::stats::PipelineStats;
use crate::bus::{kinds, OrderedMessageBus};
use crate::config::DecisionSection;
use crate::core::{GameState, PilotError, SharedGameState, TaskKind, TaskScheduler};
use crate::health::HealthMonitor;
use crate::perception::Actuator;
use crate::policy::{fuse_votes, GameAction, Policy, PolicyEnsemble, PolicyVote};

const BUS_SENDER: &str = "decision";
const BUS_RECEIVER: &str = "actuator";
const ACTUATOR_SERVICE: &str = "actuator";

/// 已发布的决策，发布后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub id: Uuid,
    pub action: GameAction,
    pub confidence: f32,
    /// 胜出的策略；降级决策为 None
    pub source: Option<String>,
    /// 各策略的有效投票
    pub votes: BTreeMap<String, PolicyVote>,
    pub frame_seq: u64,
    pub decided_at_ms: i64,
    pub degraded: bool,
}

impl Decision {
    /// 降级决策：不动作，置信度 0
    pub fn degraded(frame_seq: u64, reason: &str) -> Self {
        tracing::debug!("Degraded decision for frame {}: {}", frame_seq, reason);
        Self {
            id: Uuid::new_v4(),
            action: GameAction::None,
            confidence: 0.0,
            source: None,
            votes: BTreeMap::new(),
            frame_seq,
            decided_at_ms: chrono::Utc::now().timestamp_millis(),
            degraded: true,
        }
    }
}

pub struct DecisionSynchronizer {
    state: Arc<SharedGameState>,
    scheduler: Arc<TaskScheduler>,
    ensemble: OnceLock<PolicyEnsemble>,
    confidence_floor: f32,
    decision_timeout: Duration,
    learning_enabled: bool,
    learning: Arc<LearningLoop>,
    actuator: Option<Arc<dyn Actuator>>,
    health: Option<Arc<HealthMonitor>>,
    bus: Option<Arc<OrderedMessageBus>>,
    listeners: Listeners,
    stats: Arc<PipelineStats>,
    /// 上一次成功决策及其依据的状态，与下一次的状态组成学习转移
    previous: Mutex<Option<(GameState, Decision)>>,
    latest: RwLock<Option<Decision>>,
}

impl DecisionSynchronizer {
    pub fn new(
        cfg: &DecisionSection,
        state: Arc<SharedGameState>,
        scheduler: Arc<TaskScheduler>,
        learning: Arc<LearningLoop>,
        listeners: Listeners,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            state,
            scheduler,
            ensemble: OnceLock::new(),
            confidence_floor: cfg.confidence_floor,
            decision_timeout: cfg.decision_timeout(),
            learning_enabled: cfg.learning_enabled,
            learning,
            actuator: None,
            health: None,
            bus: None,
            listeners,
            stats,
            previous: Mutex::new(None),
            latest: RwLock::new(None),
        }
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_bus(mut self, bus: Arc<OrderedMessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// 注册策略集合，只能调用一次
    pub async fn register_components(
        &self,
        policies: Vec<Arc<dyn Policy>>,
    ) -> Result<(), PilotError> {
        let count = policies.len();
        self.ensemble
            .set(PolicyEnsemble::new(policies))
            .map_err(|_| PilotError::AlreadyRegistered)?;
        tracing::info!("Decision components registered ({} policies)", count);
        self.listeners.components_ready().await;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ensemble.get().is_some()
    }

    pub fn policies(&self) -> Option<&PolicyEnsemble> {
        self.ensemble.get()
    }

    pub async fn latest_decision(&self) -> Option<Decision> {
        self.latest.read().await.clone()
    }

    /// 请求一次决策；已有周期在执行或尚未注册策略时返回 None
    pub fn trigger_decision(self: &Arc<Self>) -> Option<JoinHandle<Decision>> {
        if !self.is_ready() {
            tracing::debug!("Decision requested before components were registered");
            return None;
        }
        let Some(permit) = self.scheduler.try_acquire(TaskKind::Decision) else {
            tracing::trace!("Decision cycle already active, request ignored");
            return None;
        };

        let sync = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _permit = permit;
            sync.run_cycle().await
        }))
    }

    async fn run_cycle(&self) -> Decision {
        let fused = AssertUnwindSafe(tokio::time::timeout(self.decision_timeout, self.fuse()))
            .catch_unwind()
            .await;

        let (snapshot, decision) = match fused {
            Ok(Ok(Ok((snapshot, decision)))) => (Some(snapshot), decision),
            Ok(Ok(Err(e))) => {
                self.listeners
                    .synchronization_error(&format!("decision fusion failed: {e}"))
                    .await;
                (None, Decision::degraded(0, &e.to_string()))
            }
            Ok(Err(_)) => {
                let e = PilotError::DecisionTimeout(self.decision_timeout.as_millis() as u64);
                self.listeners.synchronization_error(&e.to_string()).await;
                (None, Decision::degraded(0, &e.to_string()))
            }
            Err(_) => {
                self.listeners
                    .synchronization_error("decision fusion panicked")
                    .await;
                (None, Decision::degraded(0, "panic"))
            }
        };

        self.publish(&decision).await;
        self.actuate(&decision).await;

        if let Some(snapshot) = snapshot {
            self.hand_off_learning(snapshot, decision.clone()).await;
        }
        decision
    }

    /// 读锁下取快照，查询全部策略并按融合规则选出动作
    async fn fuse(&self) -> Result<(GameState, Decision), PilotError> {
        let ensemble = self.ensemble.get().ok_or(PilotError::NotReady)?;
        let snapshot = self.state.snapshot().await.ok_or(PilotError::NotReady)?;

        let votes = ensemble.query(&snapshot.features, &snapshot).await;
        let mut valid = BTreeMap::new();
        for vote in &votes {
            match &vote.result {
                Ok(v) => {
                    valid.insert(vote.source.clone(), v.clone());
                }
                Err(e) => {
                    tracing::warn!("Policy '{}' failed to vote: {}", vote.source, e);
                    if let Some(health) = &self.health {
                        health.report_service_issue(&vote.source, &e.to_string()).await;
                    }
                }
            }
        }

        let fused = fuse_votes(&votes, self.confidence_floor)
            .ok_or_else(|| PilotError::policy("ensemble", "no usable votes"))?;

        let decision = Decision {
            id: Uuid::new_v4(),
            action: fused.vote.action,
            confidence: fused.vote.confidence,
            source: Some(fused.source),
            votes: valid,
            frame_seq: snapshot.frame_seq,
            decided_at_ms: chrono::Utc::now().timestamp_millis(),
            degraded: false,
        };
        Ok((snapshot, decision))
    }

    async fn publish(&self, decision: &Decision) {
        *self.latest.write().await = Some(decision.clone());
        self.stats.decision_published(decision.degraded);
        tracing::debug!(
            "Decision {} for frame {}: {} ({:.2}) from {:?}",
            decision.id,
            decision.frame_seq,
            decision.action,
            decision.confidence,
            decision.source
        );
        self.listeners
            .decision_ready(decision.action, decision.confidence)
            .await;
        if let Some(bus) = &self.bus {
            let payload = serde_json::to_value(decision).unwrap_or_default();
            bus.send(BUS_SENDER, BUS_RECEIVER, kinds::DECISION, payload)
                .await;
        }
    }

    /// 执行决策；None 动作不产生输入。执行器拒绝与报错同样按瞬时失败上报
    async fn actuate(&self, decision: &Decision) {
        let Some(actuator) = &self.actuator else { return };
        if decision.action == GameAction::None {
            return;
        }
        let failure = match actuator.execute(decision.action).await {
            Ok(true) => None,
            Ok(false) => Some(format!("actuator refused {}", decision.action.as_str())),
            Err(e) => Some(e.to_string()),
        };
        match failure {
            None => {
                if let Some(health) = &self.health {
                    health.report_service_healthy(ACTUATOR_SERVICE).await;
                }
            }
            Some(reason) => {
                self.stats.actuation_failed();
                self.listeners
                    .synchronization_error(&format!("actuation failed: {reason}"))
                    .await;
                if let Some(health) = &self.health {
                    health
                        .report_service_issue(ACTUATOR_SERVICE, &reason)
                        .await;
                }
            }
        }
    }

    /// 与上一次决策组成转移交给学习池；池满时丢弃这次学习
    async fn hand_off_learning(&self, snapshot: GameState, decision: Decision) {
        let previous = self
            .previous
            .lock()
            .await
            .replace((snapshot.clone(), decision));
        if !self.learning_enabled {
            return;
        }
        let Some((prior, prior_decision)) = previous else { return };
        let Some(ensemble) = self.ensemble.get().cloned() else { return };

        let Some(permit) = self.scheduler.try_acquire(TaskKind::Learning) else {
            self.stats.learning_shed();
            tracing::debug!("Learning pool full, shedding transition");
            return;
        };
        let learning = Arc::clone(&self.learning);
        tokio::spawn(async move {
            let _permit = permit;
            learning
                .learn(&ensemble, &prior, &prior_decision, &snapshot)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BoundingBox, DetectedEntity, FeatureVector};
    use crate::pipeline::events::RecordingListener;
    use crate::pipeline::learning::RewardShaping;
    use crate::policy::{Experience, HeuristicPolicy, PolicyKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定投票的学习策略，可选延迟与失败
    struct FixedPolicy {
        id: &'static str,
        vote: PolicyVote,
        delay: Duration,
        fail: bool,
        trained: AtomicUsize,
    }

    impl FixedPolicy {
        fn new(id: &'static str, action: GameAction, confidence: f32) -> Self {
            Self {
                id,
                vote: PolicyVote::new(action, confidence),
                delay: Duration::ZERO,
                fail: false,
                trained: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Policy for FixedPolicy {
        fn id(&self) -> &str {
            self.id
        }
        fn kind(&self) -> PolicyKind {
            PolicyKind::Learned
        }
        async fn select_action(
            &self,
            _features: &FeatureVector,
            _state: &GameState,
        ) -> Result<PolicyVote, PilotError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(PilotError::policy(self.id, "model released"));
            }
            Ok(self.vote.clone())
        }
        async fn train(&self, _experience: &Experience) -> Result<(), PilotError> {
            self.trained.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        sync: Arc<DecisionSynchronizer>,
        state: Arc<SharedGameState>,
        listener: Arc<RecordingListener>,
        stats: Arc<PipelineStats>,
    }

    async fn fixture(cfg: DecisionSection, learning_workers: usize) -> Fixture {
        let state = Arc::new(SharedGameState::new());
        let stats = Arc::new(PipelineStats::new());
        let listeners = Listeners::new();
        let listener = RecordingListener::new();
        let learning = Arc::new(LearningLoop::new(RewardShaping::default(), stats.clone()));
        let sync = Arc::new(DecisionSynchronizer::new(
            &cfg,
            state.clone(),
            Arc::new(TaskScheduler::new(learning_workers)),
            learning,
            listeners.clone(),
            stats.clone(),
        ));
        listeners.add(listener.clone()).await;
        Fixture {
            sync,
            state,
            listener,
            stats,
        }
    }

    fn target_state(ts: i64, seq: u64) -> GameState {
        GameState::new(
            vec![DetectedEntity::new(
                "target",
                BoundingBox::new(0.4, 0.4, 0.2, 0.2),
                0.8,
            )],
            ts,
            seq,
        )
    }

    #[tokio::test]
    async fn test_higher_confidence_policy_wins() {
        let f = fixture(DecisionSection::default(), 2).await;
        f.sync
            .register_components(vec![
                Arc::new(FixedPolicy::new("q", GameAction::Tap, 0.9)),
                Arc::new(FixedPolicy::new("pg", GameAction::Wait, 0.4)),
                Arc::new(HeuristicPolicy::new()),
            ])
            .await
            .unwrap();
        f.state.replace(target_state(1_000, 1)).await;

        let decision = f.sync.trigger_decision().unwrap().await.unwrap();
        assert_eq!(decision.action, GameAction::Tap);
        assert!((decision.confidence - 0.9).abs() < 1e-6);
        assert_eq!(decision.source.as_deref(), Some("q"));
        assert_eq!(decision.votes.len(), 3);
        assert!(!decision.degraded);
        assert_eq!(f.listener.decisions(), vec![(GameAction::Tap, 0.9)]);
        assert_eq!(f.sync.latest_decision().await, Some(decision));
    }

    #[tokio::test]
    async fn test_register_twice_is_rejected() {
        let f = fixture(DecisionSection::default(), 2).await;
        f.sync
            .register_components(vec![Arc::new(HeuristicPolicy::new())])
            .await
            .unwrap();
        let second = f
            .sync
            .register_components(vec![Arc::new(HeuristicPolicy::new())])
            .await;
        assert!(matches!(second, Err(PilotError::AlreadyRegistered)));
    }

    #[tokio::test]
    async fn test_trigger_before_registration_is_noop() {
        let f = fixture(DecisionSection::default(), 2).await;
        assert!(f.sync.trigger_decision().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let f = fixture(DecisionSection::default(), 2).await;
        let mut slow = FixedPolicy::new("slow", GameAction::Tap, 0.9);
        slow.delay = Duration::from_millis(100);
        f.sync
            .register_components(vec![Arc::new(slow)])
            .await
            .unwrap();
        f.state.replace(target_state(1_000, 1)).await;

        let first = f.sync.trigger_decision().unwrap();
        tokio::task::yield_now().await;
        assert!(f.sync.trigger_decision().is_none());

        first.await.unwrap();
        assert_eq!(f.stats.snapshot().decisions_published, 1);
        // 标记位已清除，可以再次触发
        assert!(f.sync.trigger_decision().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_none() {
        let cfg = DecisionSection {
            decision_timeout_ms: 50,
            ..DecisionSection::default()
        };
        let f = fixture(cfg, 2).await;
        let mut stuck = FixedPolicy::new("stuck", GameAction::Tap, 0.9);
        stuck.delay = Duration::from_secs(10);
        f.sync
            .register_components(vec![Arc::new(stuck)])
            .await
            .unwrap();
        f.state.replace(target_state(1_000, 1)).await;

        let decision = f.sync.trigger_decision().unwrap().await.unwrap();
        assert_eq!(decision.action, GameAction::None);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.degraded);
        assert_eq!(f.listener.errors().len(), 1);
        assert_eq!(f.stats.snapshot().decisions_degraded, 1);
        assert!(f.sync.trigger_decision().is_some());
    }

    #[tokio::test]
    async fn test_all_policies_failing_degrades() {
        let f = fixture(DecisionSection::default(), 2).await;
        let mut broken = FixedPolicy::new("broken", GameAction::Tap, 0.9);
        broken.fail = true;
        f.sync
            .register_components(vec![Arc::new(broken)])
            .await
            .unwrap();
        f.state.replace(target_state(1_000, 1)).await;

        let decision = f.sync.trigger_decision().unwrap().await.unwrap();
        assert!(decision.degraded);
        assert_eq!(decision.action, GameAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_decisions_feed_learning() {
        let f = fixture(DecisionSection::default(), 2).await;
        let policy = Arc::new(FixedPolicy::new("q", GameAction::Tap, 0.9));
        f.sync
            .register_components(vec![policy.clone()])
            .await
            .unwrap();

        f.state.replace(target_state(1_000, 1)).await;
        f.sync.trigger_decision().unwrap().await.unwrap();
        // 第一次决策没有前序状态，不学习
        assert_eq!(f.stats.snapshot().learning_runs, 0);

        f.state.replace(target_state(1_100, 2)).await;
        f.sync.trigger_decision().unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snap = f.stats.snapshot();
        assert_eq!(snap.learning_runs, 1);
        assert!((snap.cumulative_reward - 0.3).abs() < 1e-6);
        assert_eq!(policy.trained.load(Ordering::SeqCst), 1);
    }

    /// 对所有动作都返回 false 的执行器
    struct RefusingActuator;

    #[async_trait]
    impl Actuator for RefusingActuator {
        async fn execute(&self, _action: GameAction) -> Result<bool, PilotError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_refused_actuation_is_reported() {
        use crate::config::HealthSection;
        use crate::health::HealthStatus;
        use crate::recovery::ComponentRegistry;

        let state = Arc::new(SharedGameState::new());
        let stats = Arc::new(PipelineStats::new());
        let listeners = Listeners::new();
        let listener = RecordingListener::new();
        listeners.add(listener.clone()).await;
        let health = Arc::new(HealthMonitor::new(
            &HealthSection::default(),
            Arc::new(ComponentRegistry::new()),
        ));
        health.register_service(ACTUATOR_SERVICE, false).await;
        let sync = Arc::new(
            DecisionSynchronizer::new(
                &DecisionSection::default(),
                state.clone(),
                Arc::new(TaskScheduler::new(2)),
                Arc::new(LearningLoop::new(RewardShaping::default(), stats.clone())),
                listeners,
                stats.clone(),
            )
            .with_actuator(Arc::new(RefusingActuator))
            .with_health(health.clone()),
        );
        sync.register_components(vec![Arc::new(FixedPolicy::new("q", GameAction::Tap, 0.95))])
            .await
            .unwrap();
        state.replace(target_state(1_000, 1)).await;

        let decision = sync.trigger_decision().unwrap().await.unwrap();
        // 决策照常发布，拒绝执行按瞬时错误上报
        assert_eq!(decision.action, GameAction::Tap);
        assert_eq!(listener.decisions(), vec![(GameAction::Tap, 0.95)]);
        assert_eq!(listener.errors().len(), 1);
        assert!(listener.errors()[0].contains("refused tap"));
        assert_eq!(health.status(ACTUATOR_SERVICE).await, Some(HealthStatus::Degraded));
        assert_eq!(stats.snapshot().actuation_failures, 1);
    }

    #[tokio::test]
    async fn test_learning_disabled() {
        let cfg = DecisionSection {
            learning_enabled: false,
            ..DecisionSection::default()
        };
        let f = fixture(cfg, 2).await;
        let policy = Arc::new(FixedPolicy::new("q", GameAction::Tap, 0.9));
        f.sync
            .register_components(vec![policy.clone()])
            .await
            .unwrap();
        for seq in 1..=3 {
            f.state.replace(target_state(seq as i64 * 100, seq)).await;
            f.sync.trigger_decision().unwrap().await.unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(policy.trained.load(Ordering::SeqCst), 0);
    }
}
