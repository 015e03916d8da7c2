//! 恢复协调器：有界重试的单组件恢复与整体重启
//!
//! 每个组件在一个冷却窗口内最多尝试 max_attempts 次；距上次尝试超过冷却时间后窗口重新开始。
//! 尝试计数只在组件被确认恢复健康（reset_attempts）或整体重启成功后清零。
//! 预算耗尽的组件数达到 escalation_threshold 时触发整体重启。
//! 总线消息的 receiver 是组件名或重启阶段，避免不同主体的事件在去重窗口内互相覆盖。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::component::{ComponentCategory, ComponentRegistry, ManagedComponent};
use super::memory::BufferTracker;
use crate::bus::{kinds, OrderedMessageBus};
use crate::config::RecoverySection;
use crate::core::{PilotError, SessionSupervisor};
use crate::policy::ModelProfile;

const BUS_SENDER: &str = "recovery";

/// 触发恢复的原因
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RecoveryCause {
    ComponentFailure(String),
    MemoryExhausted(String),
}

impl RecoveryCause {
    pub fn failure(detail: impl Into<String>) -> Self {
        RecoveryCause::ComponentFailure(detail.into())
    }
}

impl From<&PilotError> for RecoveryCause {
    fn from(err: &PilotError) -> Self {
        match err {
            PilotError::ResourceExhausted(detail) => RecoveryCause::MemoryExhausted(detail.clone()),
            other => RecoveryCause::ComponentFailure(other.to_string()),
        }
    }
}

/// 拒绝恢复的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    UnknownComponent,
    AttemptsExhausted,
    InProgress,
    Restarting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    ActionFailed(String),
    Refused(RefusalReason),
}

impl RecoveryOutcome {
    pub fn attempted(&self) -> bool {
        !matches!(self, RecoveryOutcome::Refused(_))
    }

    /// 转成错误：动作失败是组件故障，拒绝是 RecoveryRefused
    pub fn into_result(self, key: &str) -> Result<(), PilotError> {
        match self {
            RecoveryOutcome::Recovered => Ok(()),
            RecoveryOutcome::ActionFailed(reason) => Err(PilotError::ComponentFailed {
                component: key.to_string(),
                reason,
            }),
            RecoveryOutcome::Refused(reason) => Err(PilotError::RecoveryRefused(format!(
                "{key}: {reason:?}"
            ))),
        }
    }
}

/// 单个组件的尝试记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAttemptRecord {
    pub key: String,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

impl RecoveryAttemptRecord {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            attempts: 0,
            last_attempt: None,
        }
    }
}

#[derive(Debug, Default)]
struct AttemptBook {
    records: HashMap<String, RecoveryAttemptRecord>,
    in_progress: HashSet<String>,
    exhausted: HashSet<String>,
}

pub struct RecoveryCoordinator {
    max_attempts: u32,
    cooldown: Duration,
    restart_delay: Duration,
    stabilization_delay: Duration,
    escalation_threshold: usize,
    registry: Arc<ComponentRegistry>,
    memory: Arc<BufferTracker>,
    supervisor: SessionSupervisor,
    bus: Option<Arc<OrderedMessageBus>>,
    book: Mutex<AttemptBook>,
    /// 单组件恢复持读锁执行动作，整体重启持写锁：两者不会交错操作同一组件
    restart_gate: RwLock<()>,
    restarting: AtomicBool,
    full_restarts: AtomicU64,
}

impl RecoveryCoordinator {
    pub fn new(
        cfg: &RecoverySection,
        registry: Arc<ComponentRegistry>,
        memory: Arc<BufferTracker>,
        supervisor: SessionSupervisor,
    ) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            cooldown: cfg.cooldown(),
            restart_delay: cfg.restart_delay(),
            stabilization_delay: cfg.stabilization_delay(),
            escalation_threshold: cfg.escalation_threshold.max(1),
            registry,
            memory,
            supervisor,
            bus: None,
            book: Mutex::new(AttemptBook::default()),
            restart_gate: RwLock::new(()),
            restarting: AtomicBool::new(false),
            full_restarts: AtomicU64::new(0),
        }
    }

    pub fn with_bus(mut self, bus: Arc<OrderedMessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 尝试恢复组件，返回是否真正执行了恢复动作
    pub async fn recover(self: &Arc<Self>, key: &str, cause: RecoveryCause) -> bool {
        self.recover_detailed(key, cause).await.attempted()
    }

    pub async fn recover_detailed(
        self: &Arc<Self>,
        key: &str,
        cause: RecoveryCause,
    ) -> RecoveryOutcome {
        if self.is_restarting() {
            return self.refuse(key, RefusalReason::Restarting).await;
        }
        // 整体重启先置标记再等写锁：进门后再查一次，已进门的恢复会被等到结束
        let _gate = self.restart_gate.read().await;
        if self.is_restarting() {
            return self.refuse(key, RefusalReason::Restarting).await;
        }

        let component = self.registry.get(key).await;
        let memory_cause = matches!(cause, RecoveryCause::MemoryExhausted(_));
        if component.is_none() && !memory_cause {
            return self.refuse(key, RefusalReason::UnknownComponent).await;
        }

        let now = Instant::now();
        let escalate = {
            let mut book = self.book.lock().await;
            if book.in_progress.contains(key) {
                drop(book);
                return self.refuse(key, RefusalReason::InProgress).await;
            }

            let record = book
                .records
                .entry(key.to_string())
                .or_insert_with(|| RecoveryAttemptRecord::new(key));
            if let Some(last) = record.last_attempt {
                if now.duration_since(last) >= self.cooldown {
                    record.attempts = 0;
                }
            }

            if record.attempts >= self.max_attempts {
                book.exhausted.insert(key.to_string());
                Some(book.exhausted.len() >= self.escalation_threshold)
            } else {
                record.attempts += 1;
                record.last_attempt = Some(now);
                let attempts = record.attempts;
                book.in_progress.insert(key.to_string());
                book.exhausted.remove(key);
                tracing::info!(
                    "Recovering '{}' (attempt {}/{}): {:?}",
                    key,
                    attempts,
                    self.max_attempts,
                    cause
                );
                None
            }
        };

        if let Some(escalate) = escalate {
            tracing::warn!("Recovery budget exhausted for '{}'", key);
            if escalate {
                self.escalate("recovery budgets exhausted");
            }
            return self.refuse(key, RefusalReason::AttemptsExhausted).await;
        }

        let result = self.run_action(component, &cause).await;
        self.book.lock().await.in_progress.remove(key);

        let outcome = match result {
            Ok(()) => RecoveryOutcome::Recovered,
            Err(e) => {
                tracing::warn!("Recovery action for '{}' failed: {:#}", key, e);
                RecoveryOutcome::ActionFailed(e.to_string())
            }
        };
        self.publish(key, kinds::RECOVERY, json!({ "component": key, "cause": cause, "result": outcome }))
            .await;
        outcome
    }

    async fn refuse(&self, key: &str, reason: RefusalReason) -> RecoveryOutcome {
        tracing::debug!("Recovery refused for '{}': {:?}", key, reason);
        let outcome = RecoveryOutcome::Refused(reason);
        self.publish(key, kinds::RECOVERY, json!({ "component": key, "result": outcome }))
            .await;
        outcome
    }

    /// 按原因与组件类别执行恢复动作
    async fn run_action(
        &self,
        component: Option<Arc<dyn ManagedComponent>>,
        cause: &RecoveryCause,
    ) -> anyhow::Result<()> {
        if let RecoveryCause::MemoryExhausted(_) = cause {
            let freed = self.memory.purge_all();
            tracing::info!("Purged {} bytes of tracked buffers", freed);
            if let Some(component) = &component {
                if component.category() == ComponentCategory::Model {
                    component.release().await;
                    component.reinitialize(ModelProfile::Reduced).await?;
                }
            }
            return Ok(());
        }

        let Some(component) = component else {
            return Ok(());
        };
        match component.category() {
            ComponentCategory::Service => {
                if let Err(e) = component.stop().await {
                    tracing::warn!("Stopping '{}' failed: {:#}", component.name(), e);
                }
                tokio::time::sleep(self.restart_delay).await;
                component.start().await
            }
            ComponentCategory::Model => {
                component.release().await;
                component.reinitialize(ModelProfile::Reduced).await
            }
            ComponentCategory::Persistence => component.health_check().await,
        }
    }

    /// 组件被确认恢复健康后清零它的尝试计数
    pub async fn reset_attempts(&self, key: &str) {
        let mut book = self.book.lock().await;
        book.records.remove(key);
        book.exhausted.remove(key);
    }

    pub async fn attempt_record(&self, key: &str) -> Option<RecoveryAttemptRecord> {
        self.book.lock().await.records.get(key).cloned()
    }

    pub async fn exhausted_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.book.lock().await.exhausted.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn full_restart_count(&self) -> u64 {
        self.full_restarts.load(Ordering::SeqCst)
    }

    /// 在后台执行整体重启，不阻塞调用方
    pub fn escalate(self: &Arc<Self>, reason: &str) {
        tracing::error!("Escalating to full restart: {}", reason);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.full_restart().await {
                tracing::error!("Full restart failed: {}", e);
            }
        });
    }

    /// 整体重启：停止所有组件、释放模型、清理缓冲、等待稳定，再按层级依次启动
    pub async fn full_restart(&self) -> Result<(), PilotError> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Full restart already in progress");
            return Ok(());
        }

        let _gate = self.restart_gate.write().await;
        self.supervisor.set_paused(true);
        self.publish("begin", kinds::FULL_RESTART, json!({ "phase": "begin" }))
            .await;

        let order = self.registry.in_start_order().await;
        for component in order.iter().rev() {
            if let Err(e) = component.stop().await {
                tracing::warn!("Stopping '{}' during restart failed: {:#}", component.name(), e);
            }
        }
        for component in order
            .iter()
            .filter(|c| c.category() == ComponentCategory::Model)
        {
            component.release().await;
        }
        let freed = self.memory.purge_all();
        tracing::info!("Full restart: components stopped, {} bytes purged", freed);

        tokio::time::sleep(self.stabilization_delay).await;

        let mut failed = Vec::new();
        for component in &order {
            if let Err(e) = component.start().await {
                tracing::error!("Starting '{}' during restart failed: {:#}", component.name(), e);
                failed.push(component.name().to_string());
            }
        }

        let result = if failed.is_empty() {
            let mut book = self.book.lock().await;
            book.records.clear();
            book.exhausted.clear();
            self.full_restarts.fetch_add(1, Ordering::SeqCst);
            tracing::info!("Full restart completed ({} components)", order.len());
            Ok(())
        } else {
            Err(PilotError::Cascading(format!(
                "components failed to start: {}",
                failed.join(", ")
            )))
        };

        self.publish(
            "end",
            kinds::FULL_RESTART,
            json!({ "phase": "end", "ok": result.is_ok(), "failed": failed }),
        )
        .await;
        self.supervisor.set_paused(false);
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn publish(&self, subject: &str, msg_type: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.send(BUS_SENDER, subject, msg_type, payload).await;
        }
    }
}
