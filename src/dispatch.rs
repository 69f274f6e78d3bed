// 该文件是 Kanhuo （看货） 项目的一部分。
// src/dispatch.rs - 帧分发与背压
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # 帧分发
//!
//! 单槽背压：任意时刻最多一个推理在进行，推理期间到达的帧直接丢弃，
//! 不排队也不重试。帧回调只做一次原子比较交换和一次 `spawn`，立即返回。

use std::sync::{
  Arc,
  atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
  camera::FrameHandler,
  frame::PixelBuffer,
  model::{Detect, DetectionCandidate, ModelError},
};

/// 推理完成回调，参数为帧序号和推理结果
pub type ResultSink = Arc<dyn Fn(u64, Result<Vec<DetectionCandidate>, ModelError>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
  pub received: u64,
  pub accepted: u64,
  pub dropped: u64,
  pub failures: u64,
  /// 完成时已被 [`FrameDispatcher::reset`] 作废的结果
  pub discarded: u64,
}

#[derive(Default)]
struct Counters {
  received: AtomicU64,
  accepted: AtomicU64,
  dropped: AtomicU64,
  failures: AtomicU64,
  discarded: AtomicU64,
}

struct Inner {
  detector: Arc<dyn Detect>,
  runtime: Handle,
  processing: AtomicBool,
  epoch: AtomicU64,
  sink: ResultSink,
  counters: Counters,
}

/// 推理结束时（包括任务被取消或 panic）复位处理标志
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

#[derive(Clone)]
pub struct FrameDispatcher {
  inner: Arc<Inner>,
}

impl FrameDispatcher {
  pub fn new(detector: Arc<dyn Detect>, runtime: Handle, sink: ResultSink) -> Self {
    Self {
      inner: Arc::new(Inner {
        detector,
        runtime,
        processing: AtomicBool::new(false),
        epoch: AtomicU64::new(0),
        sink,
        counters: Counters::default(),
      }),
    }
  }

  /// 处理一帧，返回该帧是否被送去推理
  pub fn handle_frame(&self, frame: PixelBuffer) -> bool {
    let counters = &self.inner.counters;
    counters.received.fetch_add(1, Ordering::Relaxed);

    if self
      .inner
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      counters.dropped.fetch_add(1, Ordering::Relaxed);
      debug!("推理进行中，丢弃第 {} 帧", frame.sequence());
      return false;
    }
    counters.accepted.fetch_add(1, Ordering::Relaxed);

    let epoch = self.inner.epoch.load(Ordering::Acquire);
    let inner = Arc::clone(&self.inner);
    self.inner.runtime.spawn(async move {
      let sequence = frame.sequence();
      let result = {
        let _guard = ProcessingGuard(&inner.processing);
        inner.detector.detect(frame).await
      };

      if let Err(e) = &result {
        inner.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!("第 {} 帧检测失败: {}", sequence, e);
      }
      if inner.epoch.load(Ordering::Acquire) != epoch {
        inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("第 {} 帧的结果已过期，丢弃", sequence);
        return;
      }
      (inner.sink)(sequence, result);
    });
    true
  }

  /// 供采集会话使用的帧回调
  pub fn frame_handler(&self) -> FrameHandler {
    let dispatcher = self.clone();
    Arc::new(move |frame| {
      dispatcher.handle_frame(frame);
    })
  }

  /// 作废所有进行中的推理结果；处理标志仍在推理结束时复位
  pub fn reset(&self) {
    self.inner.epoch.fetch_add(1, Ordering::AcqRel);
  }

  pub fn is_processing(&self) -> bool {
    self.inner.processing.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> DispatchStats {
    let counters = &self.inner.counters;
    DispatchStats {
      received: counters.received.load(Ordering::Relaxed),
      accepted: counters.accepted.load(Ordering::Relaxed),
      dropped: counters.dropped.load(Ordering::Relaxed),
      failures: counters.failures.load(Ordering::Relaxed),
      discarded: counters.discarded.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use tokio::sync::{Semaphore, mpsc};

  use super::*;
  use crate::frame::{NormalizedRect, PixelFormat};

  /// 每次推理都要等测试放行一个许可
  struct GatedDetector {
    gate: Semaphore,
    active: AtomicU64,
    peak: AtomicU64,
  }

  #[async_trait]
  impl Detect for GatedDetector {
    async fn detect(&self, frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
      let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      if let Ok(permit) = self.gate.acquire().await {
        permit.forget();
      }
      self.active.fetch_sub(1, Ordering::SeqCst);

      if frame.sequence() % 2 == 0 {
        return Err(ModelError::InvalidModel("even frame".to_string()));
      }
      Ok(vec![DetectionCandidate {
        label: "Avocado".to_string(),
        confidence: 0.9,
        bounding_box: NormalizedRect::new(0.1, 0.1, 0.2, 0.2),
      }])
    }
  }

  fn frame(sequence: u64) -> PixelBuffer {
    PixelBuffer::filled(2, 2, PixelFormat::Rgb8, 0)
      .unwrap()
      .with_sequence(sequence)
  }

  #[tokio::test]
  async fn drops_frames_while_busy() {
    let detector = Arc::new(GatedDetector {
      gate: Semaphore::new(0),
      active: AtomicU64::new(0),
      peak: AtomicU64::new(0),
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = FrameDispatcher::new(
      detector.clone(),
      Handle::current(),
      Arc::new(move |sequence: u64, result: Result<Vec<DetectionCandidate>, ModelError>| {
        let _ = tx.send((sequence, result.is_ok()));
      }),
    );

    assert!(dispatcher.handle_frame(frame(1)));
    for sequence in 2..=5 {
      assert!(!dispatcher.handle_frame(frame(sequence)));
    }
    assert!(dispatcher.is_processing());

    detector.gate.add_permits(1);
    assert_eq!(rx.recv().await, Some((1, true)));
    assert!(!dispatcher.is_processing());

    assert!(dispatcher.handle_frame(frame(6)));
    detector.gate.add_permits(1);
    assert_eq!(rx.recv().await, Some((6, false)));

    assert_eq!(
      dispatcher.stats(),
      DispatchStats {
        received: 6,
        accepted: 2,
        dropped: 4,
        failures: 1,
        discarded: 0,
      }
    );
    assert_eq!(detector.peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn reset_discards_in_flight_result() {
    let detector = Arc::new(GatedDetector {
      gate: Semaphore::new(0),
      active: AtomicU64::new(0),
      peak: AtomicU64::new(0),
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = FrameDispatcher::new(
      detector.clone(),
      Handle::current(),
      Arc::new(move |sequence: u64, _: Result<Vec<DetectionCandidate>, ModelError>| {
        let _ = tx.send(sequence);
      }),
    );

    assert!(dispatcher.handle_frame(frame(1)));
    dispatcher.reset();
    detector.gate.add_permits(1);
    while dispatcher.stats().discarded == 0 {
      tokio::task::yield_now().await;
    }
    assert!(!dispatcher.is_processing());
    assert!(rx.try_recv().is_err());

    assert!(dispatcher.handle_frame(frame(3)));
    detector.gate.add_permits(1);
    assert_eq!(rx.recv().await, Some(3));
  }
}
