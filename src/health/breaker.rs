//! 全局熔断器
//!
//! 统计尾随窗口内的 FAILED 转换次数，达到阈值即打开；打开期间跳过所有探测，
//! 冷却时间过后自动关闭，不需要外部干预。

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            cooldown,
            failures: VecDeque::new(),
            opened_at: None,
            trips: 0,
        }
    }

    /// 记录一次 FAILED 转换；返回这次记录是否让熔断器打开
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.is_open(now) {
            return false;
        }
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.failures.len() >= self.threshold {
            self.opened_at = Some(now);
            self.failures.clear();
            self.trips += 1;
            return true;
        }
        false
    }

    /// 是否处于打开状态；冷却结束时顺带自动关闭
    pub fn is_open(&mut self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) >= self.cooldown => {
                self.opened_at = None;
                tracing::info!("Circuit breaker closed after cooldown");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn state(&mut self, now: Instant) -> BreakerState {
        if self.is_open(now) {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    /// 累计打开次数
    pub fn trips(&self) -> u64 {
        self.trips
    }
}
