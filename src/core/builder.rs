//! 管线构建器：统一的初始化与生命周期
//!
//! PilotBuilder 收集外部协作者（帧来源、检测器、执行器、策略），构建时把共享状态、调度器、
//! 总线、注册表、恢复协调器、健康监控和管线一次性接好；PilotContext 负责启动与优雅关闭。

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::shutdown::{
    BufferPurge, ComponentShutdown, ShutdownCoordinator, ShutdownManager, ShutdownReason, TaskDrain,
};
use super::{PilotError, SessionSupervisor, SharedGameState, TaskScheduler};
use crate::bus::OrderedMessageBus;
use crate::config::AppConfig;
use crate::health::{HealthListener, HealthMonitor};
use crate::perception::{Actuator, Capture, CaptureLoop, Detector, FrameBuffer, CAPTURE_SERVICE};
use crate::pipeline::{
    DecisionSynchronizer, FramePipeline, FrameRejected, LearningLoop, Listeners,
    PipelineListener, PipelineStats, RewardShaping, DETECTOR_SERVICE, MEMORY_SERVICE,
};
use crate::policy::{HeuristicPolicy, LinearQPolicy, Policy, SoftmaxPolicy};
use crate::recovery::{
    BufferTracker, ComponentRegistry, ManagedComponent, PolicyComponent, RecoveryCoordinator,
    StartupTier,
};

const ACTUATOR_SERVICE: &str = "actuator";

pub struct PilotBuilder {
    config: AppConfig,
    capture: Option<Arc<dyn Capture>>,
    detector: Option<Arc<dyn Detector>>,
    actuator: Option<Arc<dyn Actuator>>,
    policies: Vec<Arc<dyn Policy>>,
    components: Vec<(Arc<dyn ManagedComponent>, bool)>,
    shutdown: Option<Arc<ShutdownManager>>,
}

impl PilotBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            capture: None,
            detector: None,
            actuator: None,
            policies: Vec::new(),
            components: Vec::new(),
            shutdown: None,
        }
    }

    /// 设置帧来源；不设置时只能通过 submit_frame 手动喂帧
    pub fn with_capture(mut self, capture: Arc<dyn Capture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    /// 追加一个策略；注册顺序即融合时的并列仲裁顺序
    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// 默认策略组合：Q 学习、策略梯度、启发式
    pub fn with_default_policies(mut self) -> Self {
        let lc = &self.config.learning;
        self.policies = vec![
            Arc::new(LinearQPolicy::new("q_learning", lc.learning_rate, lc.discount)),
            Arc::new(SoftmaxPolicy::new("policy_gradient", lc.learning_rate)),
            Arc::new(HeuristicPolicy::new()),
        ];
        self
    }

    /// 额外的受管组件（例如持久化服务）
    pub fn with_component(mut self, component: Arc<dyn ManagedComponent>, essential: bool) -> Self {
        self.components.push((component, essential));
        self
    }

    pub fn with_shutdown_manager(mut self, manager: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(manager);
        self
    }

    pub async fn build(self) -> Result<PilotContext, PilotError> {
        let config = self.config;
        let detector = self
            .detector
            .ok_or_else(|| PilotError::ConfigError("no detector configured".to_string()))?;
        if self.policies.is_empty() {
            return Err(PilotError::ConfigError("no policies configured".to_string()));
        }
        let policies = self.policies;

        let shutdown = self.shutdown.unwrap_or_else(|| Arc::new(ShutdownManager::new()));
        let supervisor = SessionSupervisor::with_token(shutdown.token());
        let bus = Arc::new(OrderedMessageBus::from_config(&config.bus));
        let state = Arc::new(SharedGameState::new());
        let scheduler = Arc::new(TaskScheduler::new(config.decision.learning_workers));
        let stats = Arc::new(PipelineStats::new());
        let listeners = Listeners::new();
        let registry = Arc::new(ComponentRegistry::new());
        let memory = BufferTracker::new(config.pipeline.memory_limit_bytes);

        let recovery = Arc::new(
            RecoveryCoordinator::new(
                &config.recovery,
                registry.clone(),
                memory.clone(),
                supervisor.clone(),
            )
            .with_bus(bus.clone()),
        );
        let health = Arc::new(
            HealthMonitor::new(&config.health, registry.clone())
                .with_recovery(recovery.clone())
                .with_bus(bus.clone()),
        );

        let learning = Arc::new(
            LearningLoop::new(RewardShaping::from(&config.learning), stats.clone())
                .with_health(health.clone()),
        );
        let mut decisions = DecisionSynchronizer::new(
            &config.decision,
            state.clone(),
            scheduler.clone(),
            learning,
            listeners.clone(),
            stats.clone(),
        )
        .with_health(health.clone())
        .with_bus(bus.clone());
        if let Some(actuator) = self.actuator {
            decisions = decisions.with_actuator(actuator);
            health.register_service(ACTUATOR_SERVICE, false).await;
        }
        let decisions = Arc::new(decisions);

        let pipeline = Arc::new(
            FramePipeline::new(
                detector,
                state.clone(),
                scheduler,
                decisions.clone(),
                memory.clone(),
                supervisor.clone(),
                listeners.clone(),
                stats,
            )
            .with_health(health.clone())
            .with_recovery(recovery.clone())
            .with_bus(bus.clone()),
        );

        for policy in &policies {
            registry
                .register(Arc::new(PolicyComponent::new(policy.clone())))
                .await;
            health.register_service(policy.id(), true).await;
        }
        health.register_service(DETECTOR_SERVICE, false).await;
        health.register_service(MEMORY_SERVICE, false).await;

        let capture = match self.capture {
            Some(source) => {
                let capture = Arc::new(
                    CaptureLoop::new(&config.pipeline, source, pipeline.clone(), supervisor.clone())
                        .with_health(health.clone()),
                );
                registry.register(capture.clone()).await;
                health.register_service(CAPTURE_SERVICE, true).await;
                Some(capture)
            }
            None => None,
        };

        for (component, essential) in self.components {
            health.register_service(component.name(), essential).await;
            registry.register(component).await;
        }

        decisions.register_components(policies).await?;
        tracing::info!(
            "Pipeline built: {} components registered",
            registry.len().await
        );

        Ok(PilotContext {
            config,
            shutdown,
            supervisor,
            bus,
            state,
            registry,
            memory,
            recovery,
            health,
            decisions,
            pipeline,
            capture,
            listeners,
            probe_tasks: Arc::new(Mutex::new(Vec::new())),
            bus_token: CancellationToken::new(),
            bus_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// 构建完成的管线：持有所有共享组件
pub struct PilotContext {
    pub config: AppConfig,
    pub shutdown: Arc<ShutdownManager>,
    pub supervisor: SessionSupervisor,
    pub bus: Arc<OrderedMessageBus>,
    pub state: Arc<SharedGameState>,
    pub registry: Arc<ComponentRegistry>,
    pub memory: Arc<BufferTracker>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub health: Arc<HealthMonitor>,
    pub decisions: Arc<DecisionSynchronizer>,
    pub pipeline: Arc<FramePipeline>,
    pub capture: Option<Arc<CaptureLoop>>,
    listeners: Listeners,
    probe_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// 总线在组件停止之后才关闭，停止过程中发出的状态消息仍能送达
    bus_token: CancellationToken,
    bus_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PilotContext {
    pub async fn add_listener(&self, listener: Arc<dyn PipelineListener>) {
        self.listeners.add(listener).await;
    }

    pub async fn add_health_listener(&self, listener: Arc<dyn HealthListener>) {
        self.health.add_listener(listener).await;
    }

    /// 启动总线出队任务、按层级启动组件（Manual 层除外）、启动周期探测
    pub async fn start(&self) -> Result<(), PilotError> {
        if let Some(handle) = self.bus.start(self.bus_token.clone()).await {
            self.bus_tasks.lock().await.push(handle);
        }

        for component in self.registry.in_start_order().await {
            if component.tier() == StartupTier::Manual {
                continue;
            }
            component
                .start()
                .await
                .map_err(|e| PilotError::ComponentFailed {
                    component: component.name().to_string(),
                    reason: format!("{e:#}"),
                })?;
        }

        let probe = self.health.spawn(self.supervisor.cancel_token());
        self.probe_tasks.lock().await.push(probe);
        tracing::info!("Pipeline started");
        Ok(())
    }

    /// 手动提交一帧
    pub fn submit_frame(&self, frame: FrameBuffer) -> Result<JoinHandle<()>, FrameRejected> {
        self.pipeline.submit(frame)
    }

    pub fn stats(&self) -> crate::pipeline::StatsSnapshot {
        self.pipeline.stats().snapshot()
    }

    /// 触发关闭并执行清理：停止组件 → 等待探测任务 → 关闭总线（处理完剩余消息）→ 释放缓冲
    pub async fn shutdown(&self, reason: ShutdownReason) {
        self.shutdown.shutdown(reason);

        let mut coordinator = ShutdownCoordinator::new(self.shutdown.clone())
            .with_timeout(self.config.app.shutdown_timeout_secs);
        coordinator.register(ComponentShutdown::new(self.registry.clone()));
        coordinator.register(TaskDrain::new("HealthProbe", self.probe_tasks.clone()));
        coordinator.register(
            TaskDrain::new("MessageBus", self.bus_tasks.clone()).with_cancel(self.bus_token.clone()),
        );
        coordinator.register(BufferPurge::new(self.memory.clone()));
        coordinator.run_cleanup().await;
        self.state.clear().await;
    }
}
