//! 策略集合与融合规则
//!
//! 融合规则：学习策略之间按置信度仲裁，只有严格更高的置信度才能胜出，并列归先注册者；
//! 启发式投票仅在所有学习策略置信度都低于下限（或都没有给出投票）时接管。

use std::sync::Arc;

use super::{Policy, PolicyKind, PolicyVote};
use crate::core::{FeatureVector, GameState, PilotError};

/// 一个来源的查询结果
#[derive(Debug, Clone)]
pub struct SourceVote {
    pub source: String,
    pub kind: PolicyKind,
    pub result: Result<PolicyVote, PilotError>,
}

/// 融合结果：胜出的来源与投票
#[derive(Debug, Clone, PartialEq)]
pub struct FusedVote {
    pub source: String,
    pub vote: PolicyVote,
}

/// 按注册顺序保存的固定策略集合
#[derive(Clone, Default)]
pub struct PolicyEnsemble {
    members: Vec<Arc<dyn Policy>>,
}

impl PolicyEnsemble {
    pub fn new(members: Vec<Arc<dyn Policy>>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[Arc<dyn Policy>] {
        &self.members
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Policy>> {
        self.members.iter().find(|p| p.id() == id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 依次查询每个成员；单个成员失败只体现在它自己的结果里
    pub async fn query(&self, features: &FeatureVector, state: &GameState) -> Vec<SourceVote> {
        let mut votes = Vec::with_capacity(self.members.len());
        for policy in &self.members {
            let result = policy.select_action(features, state).await.and_then(|vote| {
                if vote.confidence.is_finite() {
                    Ok(PolicyVote::new(vote.action, vote.confidence.clamp(0.0, 1.0)))
                } else {
                    Err(PilotError::policy(policy.id(), "non-finite confidence"))
                }
            });
            votes.push(SourceVote {
                source: policy.id().to_string(),
                kind: policy.kind(),
                result,
            });
        }
        votes
    }
}

/// 按融合规则从各来源投票中选出一个；没有任何可用投票时返回 None
pub fn fuse_votes(votes: &[SourceVote], confidence_floor: f32) -> Option<FusedVote> {
    let mut best_learned: Option<(&str, &PolicyVote)> = None;
    let mut heuristic: Option<(&str, &PolicyVote)> = None;

    for sv in votes {
        let Ok(vote) = &sv.result else { continue };
        match sv.kind {
            PolicyKind::Learned => match best_learned {
                Some((_, best)) if vote.confidence <= best.confidence => {}
                _ => best_learned = Some((&sv.source, vote)),
            },
            PolicyKind::Heuristic => {
                if heuristic.is_none() {
                    heuristic = Some((&sv.source, vote));
                }
            }
        }
    }

    let chosen = match (best_learned, heuristic) {
        (Some(best), _) if best.1.confidence >= confidence_floor => Some(best),
        (_, Some(h)) => Some(h),
        (best, None) => best,
    };

    chosen.map(|(source, vote)| FusedVote {
        source: source.to_string(),
        vote: vote.clone(),
    })
}
