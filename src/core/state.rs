//! 共享游戏状态：最新感知到的世界快照
//!
//! 只有 FramePipeline 的工作任务在写锁下整体替换快照；DecisionSynchronizer 在读锁下克隆快照后立即释放。
//! 首帧到达前为空（惰性创建），关闭时丢弃。

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 特征向量长度（策略输入维度）
pub const FEATURE_LEN: usize = 8;

/// 固定长度的特征向量
pub type FeatureVector = [f32; FEATURE_LEN];

/// 归一化坐标下的检测框（0.0 ~ 1.0）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.width * self.height).max(0.0)
    }
}

/// 检测器输出的单个实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub label: String,
    pub region: BoundingBox,
    pub confidence: f32,
}

impl DetectedEntity {
    pub fn new(label: impl Into<String>, region: BoundingBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            region,
            confidence,
        }
    }
}

/// 一帧对应的世界快照：实体集合、派生特征、时间戳
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameState {
    pub entities: Vec<DetectedEntity>,
    pub features: FeatureVector,
    /// 采集时间（毫秒时间戳）
    pub timestamp_ms: i64,
    /// 产生该快照的帧序号
    pub frame_seq: u64,
}

impl GameState {
    pub fn new(entities: Vec<DetectedEntity>, timestamp_ms: i64, frame_seq: u64) -> Self {
        let features = derive_features(&entities);
        Self {
            entities,
            features,
            timestamp_ms,
            frame_seq,
        }
    }

    pub fn empty(timestamp_ms: i64) -> Self {
        Self::new(Vec::new(), timestamp_ms, 0)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// 置信度最高的实体
    pub fn strongest(&self) -> Option<&DetectedEntity> {
        self.entities
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// 从实体集合派生固定长度特征
///
/// 布局：[数量(归一化), 平均置信度, 最高置信度, 最强实体中心 x, 最强实体中心 y,
/// 最强实体面积, 所有实体中心 x 均值, 偏置 1.0]
pub fn derive_features(entities: &[DetectedEntity]) -> FeatureVector {
    let mut features = [0.0; FEATURE_LEN];
    features[FEATURE_LEN - 1] = 1.0;
    if entities.is_empty() {
        return features;
    }

    let n = entities.len() as f32;
    features[0] = (n / 10.0).min(1.0);
    features[1] = entities.iter().map(|e| e.confidence).sum::<f32>() / n;

    if let Some(best) = entities
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    {
        let (cx, cy) = best.region.center();
        features[2] = best.confidence;
        features[3] = cx;
        features[4] = cy;
        features[5] = best.region.area();
    }
    features[6] = entities.iter().map(|e| e.region.center().0).sum::<f32>() / n;
    features
}

/// 进程内唯一的共享状态：单写多读
#[derive(Debug, Default)]
pub struct SharedGameState {
    inner: RwLock<Option<GameState>>,
}

impl SharedGameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在写锁下整体替换快照（不追加），返回新快照的副本
    pub async fn replace(&self, state: GameState) -> GameState {
        let mut guard = self.inner.write().await;
        *guard = Some(state.clone());
        state
    }

    /// 在读锁下克隆当前快照；首帧之前返回 None
    pub async fn snapshot(&self) -> Option<GameState> {
        self.inner.read().await.clone()
    }

    /// 关闭或整体重启时丢弃快照
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entity(label: &str, confidence: f32) -> DetectedEntity {
        DetectedEntity::new(label, BoundingBox::new(0.2, 0.4, 0.2, 0.2), confidence)
    }

    #[test]
    fn test_features_of_empty_state() {
        let state = GameState::empty(0);
        assert_eq!(state.features[0], 0.0);
        assert_eq!(state.features[FEATURE_LEN - 1], 1.0);
        assert!(state.strongest().is_none());
    }

    #[test]
    fn test_features_follow_strongest_entity() {
        let state = GameState::new(vec![entity("coin", 0.4), entity("enemy", 0.9)], 10, 1);
        assert_eq!(state.strongest().unwrap().label, "enemy");
        assert!((state.features[2] - 0.9).abs() < 1e-6);
        assert!((state.features[3] - 0.3).abs() < 1e-6);
        assert!((state.features[4] - 0.5).abs() < 1e-6);
        assert!((state.features[1] - 0.65).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_snapshot_is_lazy_and_replaced() {
        let shared = SharedGameState::new();
        assert!(shared.snapshot().await.is_none());

        shared.replace(GameState::new(vec![entity("a", 0.5)], 1, 1)).await;
        shared.replace(GameState::new(vec![], 2, 2)).await;

        let snap = shared.snapshot().await.unwrap();
        assert_eq!(snap.timestamp_ms, 2);
        assert_eq!(snap.entity_count(), 0);

        shared.clear().await;
        assert!(shared.snapshot().await.is_none());
    }

    /// 写者让实体数量等于时间戳，读者永远不应看到二者不一致的快照
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_never_see_torn_state() {
        let shared = Arc::new(SharedGameState::new());
        let mut handles = Vec::new();

        for writer in 0..4u64 {
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(async move {
                for i in 0..200u64 {
                    let n = ((writer * 200 + i) % 7) as usize;
                    let entities = (0..n).map(|_| entity("x", 0.5)).collect();
                    shared.replace(GameState::new(entities, n as i64, i)).await;
                }
            }));
        }

        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(async move {
                for _ in 0..400 {
                    if let Some(snap) = shared.snapshot().await {
                        assert_eq!(snap.entity_count() as i64, snap.timestamp_ms);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
    }
}
