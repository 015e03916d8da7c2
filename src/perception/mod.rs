//! 外部协作者：帧来源、检测器、执行器
//!
//! 采集机制、检测模型与输入执行协议都不在本 crate 内实现，只约定 trait；
//! mock 子模块提供演示与测试用的模拟实现，capture_loop 把帧来源接到 FramePipeline。

pub mod capture_loop;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{DetectedEntity, PilotError};
use crate::policy::GameAction;

pub use capture_loop::{CaptureLoop, CAPTURE_SERVICE};
pub use mock::{LoggingActuator, ScriptedDetector, SyntheticCapture};

/// 采集到的一帧原始图像
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// 引用计数缓冲：管线按帧租借，帧处理结束即释放
    pub data: Arc<[u8]>,
    /// 采集时间（毫秒时间戳）
    pub captured_at_ms: i64,
}

impl FrameBuffer {
    pub fn new(seq: u64, width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            seq,
            width,
            height,
            data: data.into(),
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 降采样到不超过 max_bytes 的副本：宽高每次减半，按步长取像素。
    /// 检测结果使用归一化坐标，因此降采样后的帧可以直接送检；1x1 仍放不下时返回 None
    pub fn downscaled(&self, max_bytes: usize) -> Option<FrameBuffer> {
        let (src_w, src_h) = (self.width as usize, self.height as usize);
        let pixels = src_w * src_h;
        if pixels == 0 || max_bytes == 0 {
            return None;
        }
        let bpp = (self.data.len() / pixels).max(1);

        let (mut width, mut height, mut step) = (self.width, self.height, 1usize);
        while width as usize * height as usize * bpp > max_bytes {
            if width == 1 && height == 1 {
                return None;
            }
            width = width.div_ceil(2);
            height = height.div_ceil(2);
            step *= 2;
        }

        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height as usize {
            let row = (y * step).min(src_h - 1);
            for x in 0..width as usize {
                let col = (x * step).min(src_w - 1);
                let start = (row * src_w + col) * bpp;
                data.extend_from_slice(self.data.get(start..start + bpp)?);
            }
        }
        Some(FrameBuffer {
            seq: self.seq,
            width,
            height,
            data: data.into(),
            captured_at_ms: self.captured_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downscaled_fits_budget() {
        let data: Vec<u8> = (0..64).collect();
        let frame = FrameBuffer::new(7, 8, 8, data);

        let small = frame.downscaled(32).unwrap();
        assert_eq!((small.width, small.height), (4, 4));
        assert_eq!(small.len(), 16);
        assert_eq!(small.seq, 7);
        // 每隔一行一列取样
        assert_eq!(&small.data[..4], &[0, 2, 4, 6]);
        assert_eq!(small.data[4], 16);

        assert_eq!(frame.downscaled(1).unwrap().len(), 1);
        assert!(frame.downscaled(0).is_none());
    }

    #[test]
    fn test_downscaled_keeps_pixel_width() {
        // 每像素 4 字节
        let frame = FrameBuffer::new(1, 4, 2, vec![9u8; 32]);
        let small = frame.downscaled(10).unwrap();
        assert_eq!((small.width, small.height), (2, 1));
        assert_eq!(small.len(), 8);
        assert!(frame.downscaled(3).is_none());
    }
}

/// 帧来源
#[async_trait]
pub trait Capture: Send + Sync {
    async fn next_frame(&self) -> Result<FrameBuffer, PilotError>;
}

/// 感知：一帧 → 带标签的区域列表
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &FrameBuffer) -> Result<Vec<DetectedEntity>, PilotError>;
}

/// 执行器：把动作变成实际输入，返回是否执行成功
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn execute(&self, action: GameAction) -> Result<bool, PilotError>;
}
