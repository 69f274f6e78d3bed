#![allow(dead_code)]

use std::{
  collections::VecDeque,
  io,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use async_trait::async_trait;
use kanhuo::{
  frame::{NormalizedRect, PixelBuffer},
  model::{Detect, DetectionCandidate, ModelError},
};
use tokio::sync::Semaphore;

pub fn candidate(label: &str, confidence: f32) -> DetectionCandidate {
  DetectionCandidate {
    label: label.to_string(),
    confidence,
    bounding_box: NormalizedRect::new(0.25, 0.25, 0.5, 0.5),
  }
}

pub fn loader(
  detector: Arc<dyn Detect>,
) -> impl Fn() -> Result<Arc<dyn Detect>, ModelError> + Send + Sync {
  move || Ok(Arc::clone(&detector))
}

/// 每次推理都要等测试放行
pub struct GatedDetector {
  gate: Semaphore,
  pub calls: AtomicUsize,
  active: AtomicUsize,
  pub peak: AtomicUsize,
}

impl GatedDetector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      gate: Semaphore::new(0),
      calls: AtomicUsize::new(0),
      active: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    })
  }

  pub fn release(&self) {
    self.gate.add_permits(1);
  }
}

#[async_trait]
impl Detect for GatedDetector {
  async fn detect(&self, _frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    if let Ok(permit) = self.gate.acquire().await {
      permit.forget();
    }
    self.active.fetch_sub(1, Ordering::SeqCst);
    Ok(vec![candidate("Avocado", 0.9)])
  }
}

/// 按脚本依次返回结果：`Ok(置信度)` 产生一个检测框，`Err(信息)` 推理失败
pub struct ScriptedDetector {
  script: Mutex<VecDeque<Result<f32, String>>>,
}

impl ScriptedDetector {
  pub fn new(script: Vec<Result<f32, String>>) -> Arc<Self> {
    Arc::new(Self {
      script: Mutex::new(script.into()),
    })
  }
}

#[async_trait]
impl Detect for ScriptedDetector {
  async fn detect(&self, _frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
    let next = self.script.lock().unwrap().pop_front();
    match next {
      Some(Ok(confidence)) => Ok(vec![candidate("Milk Carton", confidence)]),
      Some(Err(message)) => Err(ModelError::prediction(io::Error::other(message))),
      None => Ok(Vec::new()),
    }
  }
}
