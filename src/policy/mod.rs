//! 决策策略：启发式策略与两个独立学习的策略，以及它们的融合
//!
//! 所有策略实现 Policy trait（select_action / train / release / reinitialize）；
//! 内部结构对上层不透明，上层只依赖这一集成契约。

pub mod ensemble;
pub mod heuristic;
pub mod learned;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{FeatureVector, GameState, PilotError};

pub use ensemble::{fuse_votes, FusedVote, PolicyEnsemble, SourceVote};
pub use heuristic::HeuristicPolicy;
pub use learned::{LinearQPolicy, SoftmaxPolicy};

/// 固定动作空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameAction {
    /// 安全空操作（降级时使用）
    None,
    Wait,
    Tap,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
}

impl GameAction {
    pub const ALL: [GameAction; 7] = [
        GameAction::None,
        GameAction::Wait,
        GameAction::Tap,
        GameAction::SwipeLeft,
        GameAction::SwipeRight,
        GameAction::SwipeUp,
        GameAction::SwipeDown,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameAction::None => "none",
            GameAction::Wait => "wait",
            GameAction::Tap => "tap",
            GameAction::SwipeLeft => "swipe_left",
            GameAction::SwipeRight => "swipe_right",
            GameAction::SwipeUp => "swipe_up",
            GameAction::SwipeDown => "swipe_down",
        }
    }
}

impl std::fmt::Display for GameAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 策略类型：启发式投票仅作参考，学习策略之间按置信度仲裁
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Heuristic,
    Learned,
}

/// 单个策略的投票
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVote {
    pub action: GameAction,
    pub confidence: f32,
}

impl PolicyVote {
    pub fn new(action: GameAction, confidence: f32) -> Self {
        Self { action, confidence }
    }
}

/// 重新初始化时使用的模型规格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelProfile {
    #[default]
    Standard,
    /// 降级规格：更小的步长、重置参数，用于故障或内存压力后的回退
    Reduced,
}

/// 一次状态转移的训练样本；每个策略消费一次后丢弃
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub state: FeatureVector,
    pub action_index: usize,
    pub reward: f32,
    pub next_state: FeatureVector,
    pub terminal: bool,
}

/// 策略 trait：选择动作与训练
#[async_trait]
pub trait Policy: Send + Sync {
    /// 策略 ID（融合投票与健康记录中的键）
    fn id(&self) -> &str;

    fn kind(&self) -> PolicyKind;

    async fn select_action(
        &self,
        features: &FeatureVector,
        state: &GameState,
    ) -> Result<PolicyVote, PilotError>;

    async fn train(&self, experience: &Experience) -> Result<(), PilotError>;

    /// 释放模型占用的资源
    async fn release(&self) {}

    /// 按给定规格重新初始化
    async fn reinitialize(&self, _profile: ModelProfile) -> Result<(), PilotError> {
        Ok(())
    }
}
