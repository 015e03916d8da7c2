//! 瞬时缓冲跟踪
//!
//! 每帧的缓冲在处理期间由 BufferLease 租借登记，租约 drop 即释放；
//! 超出预算时拒绝登记并返回 ResourceExhausted，purge_all 强制释放所有登记的缓冲。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::PilotError;

#[derive(Debug, Default)]
struct TrackerInner {
    buffers: HashMap<u64, Arc<[u8]>>,
    bytes: usize,
}

/// 缓冲跟踪器；锁只在登记/释放的瞬间持有（租约在 Drop 中释放，因此使用同步锁）
#[derive(Debug)]
pub struct BufferTracker {
    limit_bytes: usize,
    next_id: AtomicU64,
    inner: Mutex<TrackerInner>,
}

impl BufferTracker {
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(TrackerInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记一块缓冲，返回租约；超出预算时拒绝
    pub fn retain(self: &Arc<Self>, data: Arc<[u8]>) -> Result<BufferLease, PilotError> {
        let len = data.len();
        let mut inner = self.lock();
        if inner.bytes + len > self.limit_bytes {
            return Err(PilotError::ResourceExhausted(format!(
                "tracked buffers {} + {} bytes exceed budget {}",
                inner.bytes, len, self.limit_bytes
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        inner.buffers.insert(id, data);
        inner.bytes += len;
        Ok(BufferLease {
            id,
            tracker: Arc::clone(self),
        })
    }

    fn release(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(buf) = inner.buffers.remove(&id) {
            inner.bytes -= buf.len();
        }
    }

    /// 强制释放全部登记的缓冲，返回释放的字节数
    pub fn purge_all(&self) -> usize {
        let mut inner = self.lock();
        let freed = inner.bytes;
        inner.buffers.clear();
        inner.buffers.shrink_to_fit();
        inner.bytes = 0;
        freed
    }

    pub fn tracked_bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// 预算内剩余可登记的字节数
    pub fn available_bytes(&self) -> usize {
        self.limit_bytes.saturating_sub(self.lock().bytes)
    }
}

/// 一帧处理期间的缓冲租约
#[derive(Debug)]
pub struct BufferLease {
    id: u64,
    tracker: Arc<BufferTracker>,
}

impl BufferLease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}
