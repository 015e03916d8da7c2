//! 两个独立学习的策略：线性 Q 函数（单步 TD）与线性 softmax 策略（带基线的奖励加权梯度）
//!
//! 参数放在 RwLock<Option<..>> 中：release 后为 None，select_action 返回错误，直到 reinitialize。

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Experience, GameAction, ModelProfile, Policy, PolicyKind, PolicyVote};
use crate::core::{FeatureVector, GameState, PilotError, FEATURE_LEN};

/// TD 误差裁剪范围
const TD_CLIP: f32 = 1.0;
/// 基线的指数滑动系数
const BASELINE_DECAY: f32 = 0.1;

type Weights = [[f32; FEATURE_LEN]; GameAction::COUNT];

#[derive(Debug, Clone)]
struct LinearModel {
    weights: Weights,
    learning_rate: f32,
}

impl LinearModel {
    fn new(learning_rate: f32) -> Self {
        Self {
            weights: [[0.0; FEATURE_LEN]; GameAction::COUNT],
            learning_rate,
        }
    }

    fn scores(&self, features: &FeatureVector) -> [f32; GameAction::COUNT] {
        let mut out = [0.0; GameAction::COUNT];
        for (score, row) in out.iter_mut().zip(self.weights.iter()) {
            *score = row.iter().zip(features.iter()).map(|(w, x)| w * x).sum();
        }
        out
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().flatten().all(|w| w.is_finite())
    }
}

fn softmax(scores: &[f32; GameAction::COUNT]) -> [f32; GameAction::COUNT] {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = [0.0; GameAction::COUNT];
    let mut sum = 0.0;
    for (o, s) in out.iter_mut().zip(scores.iter()) {
        *o = (s - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
    out
}

/// 最大分数对应的动作；并列时取索引较小者
fn argmax(scores: &[f32; GameAction::COUNT]) -> usize {
    let mut best = 0;
    for (i, s) in scores.iter().enumerate() {
        if *s > scores[best] {
            best = i;
        }
    }
    best
}

fn profile_rate(base: f32, profile: ModelProfile) -> f32 {
    match profile {
        ModelProfile::Standard => base,
        ModelProfile::Reduced => base * 0.5,
    }
}

fn vote_from_scores(scores: &[f32; GameAction::COUNT]) -> PolicyVote {
    let probs = softmax(scores);
    let best = argmax(scores);
    let action = GameAction::from_index(best).unwrap_or(GameAction::None);
    PolicyVote::new(action, probs[best])
}

/// 线性动作价值函数，单步 TD(0) 更新
#[derive(Debug)]
pub struct LinearQPolicy {
    id: String,
    base_rate: f32,
    discount: f32,
    model: RwLock<Option<LinearModel>>,
}

impl LinearQPolicy {
    pub fn new(id: impl Into<String>, learning_rate: f32, discount: f32) -> Self {
        Self {
            id: id.into(),
            base_rate: learning_rate,
            discount,
            model: RwLock::new(Some(LinearModel::new(learning_rate))),
        }
    }
}

#[async_trait]
impl Policy for LinearQPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Learned
    }

    async fn select_action(
        &self,
        features: &FeatureVector,
        _state: &GameState,
    ) -> Result<PolicyVote, PilotError> {
        let guard = self.model.read().await;
        let model = guard
            .as_ref()
            .ok_or_else(|| PilotError::policy(&self.id, "model released"))?;
        Ok(vote_from_scores(&model.scores(features)))
    }

    async fn train(&self, experience: &Experience) -> Result<(), PilotError> {
        let mut guard = self.model.write().await;
        let model = guard
            .as_mut()
            .ok_or_else(|| PilotError::policy(&self.id, "model released"))?;

        let a = experience.action_index;
        if a >= GameAction::COUNT {
            return Err(PilotError::policy(&self.id, format!("action index {a} out of range")));
        }

        let q = model.scores(&experience.state)[a];
        let bootstrap = if experience.terminal {
            0.0
        } else {
            let next = model.scores(&experience.next_state);
            next[argmax(&next)]
        };
        let td = (experience.reward + self.discount * bootstrap - q).clamp(-TD_CLIP, TD_CLIP);
        let lr = model.learning_rate;
        for (w, x) in model.weights[a].iter_mut().zip(experience.state.iter()) {
            *w += lr * td * x;
        }

        if !model.is_finite() {
            return Err(PilotError::policy(&self.id, "weights diverged"));
        }
        Ok(())
    }

    async fn release(&self) {
        *self.model.write().await = None;
    }

    async fn reinitialize(&self, profile: ModelProfile) -> Result<(), PilotError> {
        let rate = profile_rate(self.base_rate, profile);
        *self.model.write().await = Some(LinearModel::new(rate));
        tracing::info!("Policy '{}' reinitialized ({:?}, lr={})", self.id, profile, rate);
        Ok(())
    }
}

#[derive(Debug)]
struct SoftmaxState {
    model: LinearModel,
    baseline: f32,
}

/// 线性 softmax 策略，奖励减去滑动基线作为优势
#[derive(Debug)]
pub struct SoftmaxPolicy {
    id: String,
    base_rate: f32,
    state: RwLock<Option<SoftmaxState>>,
}

impl SoftmaxPolicy {
    pub fn new(id: impl Into<String>, learning_rate: f32) -> Self {
        Self {
            id: id.into(),
            base_rate: learning_rate,
            state: RwLock::new(Some(SoftmaxState {
                model: LinearModel::new(learning_rate),
                baseline: 0.0,
            })),
        }
    }
}

#[async_trait]
impl Policy for SoftmaxPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Learned
    }

    async fn select_action(
        &self,
        features: &FeatureVector,
        _state: &GameState,
    ) -> Result<PolicyVote, PilotError> {
        let guard = self.state.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| PilotError::policy(&self.id, "model released"))?;
        Ok(vote_from_scores(&state.model.scores(features)))
    }

    async fn train(&self, experience: &Experience) -> Result<(), PilotError> {
        let mut guard = self.state.write().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| PilotError::policy(&self.id, "model released"))?;

        let taken = experience.action_index;
        if taken >= GameAction::COUNT {
            return Err(PilotError::policy(&self.id, format!("action index {taken} out of range")));
        }

        let probs = softmax(&state.model.scores(&experience.state));
        let advantage = experience.reward - state.baseline;
        let lr = state.model.learning_rate;
        for (a, row) in state.model.weights.iter_mut().enumerate() {
            let indicator = if a == taken { 1.0 } else { 0.0 };
            let grad = advantage * (indicator - probs[a]);
            for (w, x) in row.iter_mut().zip(experience.state.iter()) {
                *w += lr * grad * x;
            }
        }
        state.baseline += BASELINE_DECAY * (experience.reward - state.baseline);

        if !state.model.is_finite() || !state.baseline.is_finite() {
            return Err(PilotError::policy(&self.id, "weights diverged"));
        }
        Ok(())
    }

    async fn release(&self) {
        *self.state.write().await = None;
    }

    async fn reinitialize(&self, profile: ModelProfile) -> Result<(), PilotError> {
        let rate = profile_rate(self.base_rate, profile);
        *self.state.write().await = Some(SoftmaxState {
            model: LinearModel::new(rate),
            baseline: 0.0,
        });
        tracing::info!("Policy '{}' reinitialized ({:?}, lr={})", self.id, profile, rate);
        Ok(())
    }
}
