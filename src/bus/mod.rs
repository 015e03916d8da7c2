//! 有序消息总线
//!
//! send 在去重窗口内丢弃相同 (sender, receiver, type) 的重复消息，其余分配序号后入队；
//! 唯一的出队任务严格按 FIFO 处理，每条消息之间短暂停顿，按 type 分发给已注册的处理器。
//! 处理器返回错误或 panic 只记录日志，不会停止出队任务。

pub mod message;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BusSection;

pub use message::{kinds, DedupKey, PendingMessage, SendOutcome, ANY_TYPE};

/// 去重表超过该大小时清理过期键
const DEDUP_PRUNE_THRESHOLD: usize = 256;

/// 消息处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &PendingMessage) -> anyhow::Result<()>;
}

/// 把同步闭包包装为处理器
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&PendingMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &PendingMessage) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// 总线计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub queued: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub handler_errors: u64,
}

pub struct OrderedMessageBus {
    dedup_window: Duration,
    inter_message_pause: Duration,
    next_seq: AtomicU64,
    /// 去重表；同时串行化「分配序号 + 入队」，保证出队顺序与序号一致
    recent: Mutex<HashMap<DedupKey, Instant>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    tx: mpsc::UnboundedSender<PendingMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<PendingMessage>>>,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

impl OrderedMessageBus {
    pub fn new(dedup_window: Duration, inter_message_pause: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            dedup_window,
            inter_message_pause,
            next_seq: AtomicU64::new(1),
            recent: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            duplicates: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &BusSection) -> Self {
        Self::new(cfg.dedup_window(), cfg.inter_message_pause())
    }

    /// 注册某类型的处理器；类型为 ANY_TYPE 时接收全部消息
    pub async fn subscribe(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .await
            .entry(msg_type.to_string())
            .or_default()
            .push(handler);
    }

    pub async fn subscribe_fn<F>(&self, msg_type: &str, f: F)
    where
        F: Fn(&PendingMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(msg_type, Arc::new(FnHandler(f))).await;
    }

    /// 发送消息：去重窗口内的重复键被丢弃，否则分配序号并入队
    pub async fn send(
        &self,
        sender: &str,
        receiver: &str,
        msg_type: &str,
        payload: serde_json::Value,
    ) -> SendOutcome {
        let key = DedupKey::new(sender, receiver, msg_type);
        let now = Instant::now();

        let mut recent = self.recent.lock().await;
        if let Some(last) = recent.get(&key) {
            if now.duration_since(*last) < self.dedup_window {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping duplicate '{}' from {} to {}", msg_type, sender, receiver);
                return SendOutcome::Duplicate;
            }
        }

        if recent.len() >= DEDUP_PRUNE_THRESHOLD {
            let window = self.dedup_window;
            recent.retain(|_, t| now.duration_since(*t) < window);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let message = PendingMessage {
            seq,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            msg_type: msg_type.to_string(),
            payload,
            enqueued_at: now,
        };
        if self.tx.send(message).is_err() {
            return SendOutcome::Closed;
        }
        recent.insert(key, now);
        SendOutcome::Queued { seq }
    }

    /// 启动唯一的出队任务；重复调用返回 None
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().await.take()?;
        let bus = Arc::clone(self);

        Some(tokio::spawn(async move {
            tracing::info!("Message bus drainer started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        // 关闭前把已入队的消息处理完，保持「恰好一次」
                        while let Ok(message) = rx.try_recv() {
                            bus.dispatch(&message).await;
                        }
                        break;
                    }
                    next = rx.recv() => {
                        let Some(message) = next else { break };
                        bus.dispatch(&message).await;
                        if !bus.inter_message_pause.is_zero() {
                            tokio::time::sleep(bus.inter_message_pause).await;
                        }
                    }
                }
            }
            tracing::info!("Message bus drainer stopped");
        }))
    }

    async fn dispatch(&self, message: &PendingMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let map = self.handlers.read().await;
            map.get(&message.msg_type)
                .into_iter()
                .chain(map.get(ANY_TYPE))
                .flatten()
                .cloned()
                .collect()
        };

        for handler in handlers {
            match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Handler for '{}' (seq {}) failed: {}", message.msg_type, message.seq, e);
                }
                Err(_) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Handler for '{}' (seq {}) panicked", message.msg_type, message.seq);
                }
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            queued: self.next_seq.load(Ordering::SeqCst) - 1,
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}
