//! 管线事件回调
//!
//! 回调在管线自己的任务上同步调用，监听者不应在回调中长时间阻塞。

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::GameState;
use crate::policy::GameAction;

pub trait PipelineListener: Send + Sync {
    /// 策略集合注册完成
    fn on_components_ready(&self) {}

    fn on_decision_ready(&self, _action: GameAction, _confidence: f32) {}

    fn on_game_state_updated(&self, _state: &GameState) {}

    fn on_synchronization_error(&self, _message: &str) {}
}

/// 监听者列表，可在各阶段之间共享
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn PipelineListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, listener: Arc<dyn PipelineListener>) {
        self.inner.write().await.push(listener);
    }

    async fn snapshot(&self) -> Vec<Arc<dyn PipelineListener>> {
        self.inner.read().await.clone()
    }

    pub async fn components_ready(&self) {
        for l in self.snapshot().await {
            l.on_components_ready();
        }
    }

    pub async fn decision_ready(&self, action: GameAction, confidence: f32) {
        for l in self.snapshot().await {
            l.on_decision_ready(action, confidence);
        }
    }

    pub async fn state_updated(&self, state: &GameState) {
        for l in self.snapshot().await {
            l.on_game_state_updated(state);
        }
    }

    pub async fn synchronization_error(&self, message: &str) {
        tracing::warn!("Pipeline synchronization error: {}", message);
        for l in self.snapshot().await {
            l.on_synchronization_error(message);
        }
    }
}

/// 记录所有事件的监听者，测试与演示用
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ComponentsReady,
    Decision { action: GameAction, confidence: f32 },
    StateUpdated { frame_seq: u64, entities: usize },
    SyncError(String),
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn decisions(&self) -> Vec<(GameAction, f32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Decision { action, confidence } => Some((action, confidence)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::SyncError(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

impl PipelineListener for RecordingListener {
    fn on_components_ready(&self) {
        self.push(PipelineEvent::ComponentsReady);
    }

    fn on_decision_ready(&self, action: GameAction, confidence: f32) {
        self.push(PipelineEvent::Decision { action, confidence });
    }

    fn on_game_state_updated(&self, state: &GameState) {
        self.push(PipelineEvent::StateUpdated {
            frame_seq: state.frame_seq,
            entities: state.entity_count(),
        });
    }

    fn on_synchronization_error(&self, message: &str) {
        self.push(PipelineEvent::SyncError(message.to_string()));
    }
}
