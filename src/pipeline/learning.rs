//! 在线学习：奖励塑形与按策略隔离的训练
//!
//! 每次决策周期结束后，上一次的 (状态, 决策) 与当前状态组成一条转移，
//! 由学习池中的任务交给每个策略训练。单个策略训练失败或 panic 不影响其他策略。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;

use super::decision::Decision;
use super::stats::PipelineStats;
use crate::config::LearningSection;
use crate::core::GameState;
use crate::health::HealthMonitor;
use crate::policy::{Experience, PolicyEnsemble};

/// 奖励塑形参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardShaping {
    pub base: f32,
    pub entity_bonus: f32,
    pub latency_penalty: f32,
    pub latency_threshold_ms: i64,
}

impl Default for RewardShaping {
    fn default() -> Self {
        Self::from(&LearningSection::default())
    }
}

impl From<&LearningSection> for RewardShaping {
    fn from(cfg: &LearningSection) -> Self {
        Self {
            base: cfg.base_reward,
            entity_bonus: cfg.entity_bonus,
            latency_penalty: cfg.latency_penalty,
            latency_threshold_ms: cfg.latency_threshold_ms,
        }
    }
}

impl RewardShaping {
    /// 基础奖励，新状态有实体时加分，两个状态间隔超过阈值时扣分，结果截断到 [0, 1]
    pub fn reward(&self, prior: &GameState, new: &GameState) -> f32 {
        let mut reward = self.base;
        if !new.entities.is_empty() {
            reward += self.entity_bonus;
        }
        if new.timestamp_ms - prior.timestamp_ms > self.latency_threshold_ms {
            reward -= self.latency_penalty;
        }
        reward.clamp(0.0, 1.0)
    }
}

/// 一次学习的结果
#[derive(Debug, Clone, PartialEq)]
pub struct LearningReport {
    pub reward: f32,
    pub trained: Vec<String>,
    pub failed: Vec<String>,
}

pub struct LearningLoop {
    shaping: RewardShaping,
    stats: Arc<PipelineStats>,
    health: Option<Arc<HealthMonitor>>,
}

impl LearningLoop {
    pub fn new(shaping: RewardShaping, stats: Arc<PipelineStats>) -> Self {
        Self {
            shaping,
            stats,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn compute_reward(&self, prior: &GameState, new: &GameState) -> f32 {
        self.shaping.reward(prior, new)
    }

    /// 用一条转移训练所有策略；各策略并发训练，互不等待对方的失败
    pub async fn learn(
        &self,
        policies: &PolicyEnsemble,
        prior: &GameState,
        decision: &Decision,
        new: &GameState,
    ) -> LearningReport {
        let reward = self.compute_reward(prior, new);
        let experience = Experience {
            state: prior.features,
            action_index: decision.action.index(),
            reward,
            next_state: new.features,
            terminal: false,
        };

        let runs = policies.members().iter().map(|policy| {
            let experience = &experience;
            async move {
                let outcome = AssertUnwindSafe(policy.train(experience))
                    .catch_unwind()
                    .await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("training panicked".to_string()),
                };
                (policy.id().to_string(), failure)
            }
        });

        let mut report = LearningReport {
            reward,
            trained: Vec::new(),
            failed: Vec::new(),
        };
        for (id, failure) in join_all(runs).await {
            match failure {
                None => report.trained.push(id),
                Some(reason) => {
                    tracing::warn!("Training '{}' failed: {}", id, reason);
                    if let Some(health) = &self.health {
                        health.report_service_issue(&id, &reason).await;
                    }
                    report.failed.push(id);
                }
            }
        }

        self.stats.learning_run(reward);
        tracing::debug!(
            "Learned from frame {} -> {}: reward {:.2}, {} trained, {} failed",
            prior.frame_seq,
            new.frame_seq,
            reward,
            report.trained.len(),
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BoundingBox, DetectedEntity, FeatureVector, PilotError};
    use crate::policy::{GameAction, Policy, PolicyKind, PolicyVote};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state_at(ts: i64, entities: usize) -> GameState {
        let entities = (0..entities)
            .map(|_| DetectedEntity::new("target", BoundingBox::new(0.1, 0.1, 0.1, 0.1), 0.9))
            .collect();
        GameState::new(entities, ts, ts as u64)
    }

    #[test]
    fn test_reward_shaping() {
        let shaping = RewardShaping::default();
        // 无实体、无延迟：只有基础奖励
        assert!((shaping.reward(&state_at(0, 0), &state_at(100, 0)) - 0.1).abs() < 1e-6);
        // 有实体
        assert!((shaping.reward(&state_at(0, 0), &state_at(100, 2)) - 0.3).abs() < 1e-6);
        // 无实体且间隔超过阈值，截断到 0
        assert!(shaping.reward(&state_at(0, 0), &state_at(1500, 0)).abs() < 1e-6);
        // 恰好等于阈值不扣分
        assert!((shaping.reward(&state_at(0, 0), &state_at(1000, 0)) - 0.1).abs() < 1e-6);
    }

    struct CountingPolicy {
        id: &'static str,
        trained: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Policy for CountingPolicy {
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
            Ok(PolicyVote::new(GameAction::Wait, 0.5))
        }
        async fn train(&self, _experience: &Experience) -> Result<(), PilotError> {
            if self.fail {
                panic!("diverged");
            }
            self.trained.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_policy_does_not_block_others() {
        let good = Arc::new(CountingPolicy {
            id: "good",
            trained: AtomicUsize::new(0),
            fail: false,
        });
        let bad = Arc::new(CountingPolicy {
            id: "bad",
            trained: AtomicUsize::new(0),
            fail: true,
        });
        let ensemble = PolicyEnsemble::new(vec![bad.clone() as Arc<dyn Policy>, good.clone()]);
        let stats = Arc::new(PipelineStats::new());
        let learning = LearningLoop::new(RewardShaping::default(), stats.clone());

        let decision = Decision::degraded(0, "test");
        let report = learning
            .learn(&ensemble, &state_at(0, 0), &decision, &state_at(100, 1))
            .await;

        assert_eq!(report.trained, vec!["good".to_string()]);
        assert_eq!(report.failed, vec!["bad".to_string()]);
        assert_eq!(good.trained.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().learning_runs, 1);
        assert!((report.reward - 0.3).abs() < 1e-6);
    }
}
