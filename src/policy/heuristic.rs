//! 启发式策略：有实体就点最强的那个，否则等待

use async_trait::async_trait;

use super::{Experience, GameAction, Policy, PolicyKind, PolicyVote};
use crate::core::{FeatureVector, GameState, PilotError};

/// 没有检测到实体时等待的置信度
const IDLE_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Default)]
pub struct HeuristicPolicy;

impl HeuristicPolicy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Policy for HeuristicPolicy {
    fn id(&self) -> &str {
        "heuristic"
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Heuristic
    }

    async fn select_action(
        &self,
        _features: &FeatureVector,
        state: &GameState,
    ) -> Result<PolicyVote, PilotError> {
        Ok(match state.strongest() {
            Some(entity) => PolicyVote::new(GameAction::Tap, entity.confidence.clamp(0.0, 1.0)),
            None => PolicyVote::new(GameAction::Wait, IDLE_CONFIDENCE),
        })
    }

    async fn train(&self, _experience: &Experience) -> Result<(), PilotError> {
        Ok(())
    }
}
