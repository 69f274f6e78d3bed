// 该文件是 Kanhuo （看货） 项目的一部分。
// src/model.rs - 检测模型适配层
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

//! # 检测模型适配层
//!
//! 推理运行时只需实现同步的 [`Model`]，[`DetectionAdapter`] 负责：
//! - 把推理放到阻塞线程池上执行，不阻塞帧回调
//! - 把模型原始输出统一为左上角原点、(0,0)-(1,1) 的归一化坐标
//! - 类别编号到展示标签的映射
//!
//! 坐标只在这里转换一次，分发循环与视图层不再翻转。

use std::{
  error::Error as StdError,
  path::{Path, PathBuf},
  sync::Arc,
  time::Instant,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::frame::{NormalizedRect, PixelBuffer};

pub mod labels;
pub mod yolo26;
pub use self::yolo26::Yolo26Decoder;

#[cfg(feature = "backend-tract")]
mod tract_backend;
#[cfg(feature = "backend-tract")]
pub use self::tract_backend::{Yolo26Onnx, Yolo26OnnxBuilder};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("model artifact not found: {}", .0.display())]
  NotFound(PathBuf),
  #[error("failed to load model: {0}")]
  LoadFailed(String),
  #[error("invalid model: {0}")]
  InvalidModel(String),
  #[error("prediction failed: {0}")]
  PredictionFailed(Box<dyn StdError + Send + Sync>),
}

impl ModelError {
  pub fn prediction<E: StdError + Send + Sync + 'static>(err: E) -> Self {
    ModelError::PredictionFailed(Box::new(err))
  }
}

/// 原始检测框的坐标原点约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxOrigin {
  TopLeft,
  BottomLeft,
}

#[derive(Debug, Clone)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// 模型原始输出，只在适配层内部存在
#[derive(Debug, Clone)]
pub struct InferenceResult {
  pub items: Box<[DetectItem]>,
  pub origin: BoxOrigin,
}

impl InferenceResult {
  pub fn top_left(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
      origin: BoxOrigin::TopLeft,
    }
  }
}

/// 归一化后的单个检测候选
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCandidate {
  pub label: String,
  pub confidence: f32,
  pub bounding_box: NormalizedRect,
}

#[async_trait]
pub trait Detect: Send + Sync {
  async fn detect(&self, frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError>;
}

pub struct DetectionAdapter<M> {
  model: Arc<M>,
  labels: Arc<[String]>,
}

impl<M> DetectionAdapter<M> {
  pub fn new(model: M, labels: Arc<[String]>) -> Self {
    Self {
      model: Arc::new(model),
      labels,
    }
  }

  fn label_for(&self, class_id: u32) -> String {
    self
      .labels
      .get(class_id as usize)
      .map(|label| labels::title_case(label))
      .filter(|label| !label.is_empty())
      .unwrap_or_else(|| labels::UNKNOWN_LABEL.to_string())
  }

  fn normalize(&self, result: InferenceResult) -> Vec<DetectionCandidate> {
    result
      .items
      .iter()
      .map(|item| {
        let [x_min, y_min, x_max, y_max] = item.bbox;
        let bounding_box = match result.origin {
          BoxOrigin::TopLeft => NormalizedRect::from_corners(item.bbox),
          BoxOrigin::BottomLeft => {
            NormalizedRect::from_bottom_left_origin(x_min, y_min, x_max - x_min, y_max - y_min)
          }
        };
        let confidence = if item.score.is_finite() {
          item.score.clamp(0.0, 1.0)
        } else {
          0.0
        };
        DetectionCandidate {
          label: self.label_for(item.class_id),
          confidence,
          bounding_box,
        }
      })
      .collect()
  }
}

#[async_trait]
impl<M> Detect for DetectionAdapter<M>
where
  M: Model<Input = PixelBuffer, Output = InferenceResult> + Send + Sync + 'static,
  M::Error: StdError + Send + Sync + 'static,
{
  async fn detect(&self, frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
    let model = Arc::clone(&self.model);
    let sequence = frame.sequence();
    let result = tokio::task::spawn_blocking(move || {
      let now = Instant::now();
      let result = model.infer(&frame);
      debug!("第 {} 帧推理完成，耗时: {:.2?}", sequence, now.elapsed());
      result
    })
    .await
    .map_err(ModelError::prediction)?
    .map_err(|e| {
      error!("第 {} 帧推理失败: {}", sequence, e);
      ModelError::prediction(e)
    })?;

    debug!("第 {} 帧检测到 {} 个物体", sequence, result.items.len());
    Ok(self.normalize(result))
  }
}

/// 延迟加载检测器，视图层在首次启动时调用且只调用一次
pub trait LoadDetector: Send + Sync {
  fn load(&self) -> Result<Arc<dyn Detect>, ModelError>;
}

impl<F> LoadDetector for F
where
  F: Fn() -> Result<Arc<dyn Detect>, ModelError> + Send + Sync,
{
  fn load(&self) -> Result<Arc<dyn Detect>, ModelError> {
    self()
  }
}

/// 模型文件定位
///
/// 优先使用配置的路径；不存在时尝试同名、后备扩展名的文件。
/// 两者都不存在时返回 [`ModelError::NotFound`]，不会退化为假数据。
#[derive(Debug, Clone)]
pub struct ModelLoader {
  path: PathBuf,
  fallback_extension: Option<String>,
  labels: Arc<[String]>,
}

impl ModelLoader {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      fallback_extension: None,
      labels: labels::coco_labels(),
    }
  }

  pub fn fallback_extension(mut self, extension: &str) -> Self {
    self.fallback_extension = Some(extension.to_string());
    self
  }

  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels.into();
    self
  }

  pub fn resolve(&self) -> Result<PathBuf, ModelError> {
    if self.path.exists() {
      return Ok(self.path.clone());
    }

    if let Some(extension) = &self.fallback_extension {
      let fallback = self.path.with_extension(extension);
      if fallback.exists() {
        info!("使用后备模型文件: {}", fallback.display());
        return Ok(fallback);
      }
    }

    error!("模型文件不存在: {}", self.path.display());
    Err(ModelError::NotFound(self.path.clone()))
  }

  pub fn load<M, F>(&self, open: F) -> Result<DetectionAdapter<M>, ModelError>
  where
    F: FnOnce(&Path) -> Result<M, ModelError>,
  {
    let path = self.resolve()?;
    info!("加载模型文件: {}", path.display());
    let model = open(&path)?;
    info!("模型加载完成");
    Ok(DetectionAdapter::new(model, Arc::clone(&self.labels)))
  }
}

#[cfg(test)]
mod tests {
  use std::convert::Infallible;

  use super::*;
  use crate::frame::PixelFormat;

  struct FixedModel {
    result: InferenceResult,
  }

  impl Model for FixedModel {
    type Input = PixelBuffer;
    type Output = InferenceResult;
    type Error = Infallible;

    fn infer(&self, _input: &PixelBuffer) -> Result<InferenceResult, Infallible> {
      Ok(self.result.clone())
    }
  }

  #[derive(Debug, Error)]
  #[error("tensor mismatch")]
  struct TensorMismatch;

  struct BrokenModel;

  impl Model for BrokenModel {
    type Input = PixelBuffer;
    type Output = InferenceResult;
    type Error = TensorMismatch;

    fn infer(&self, _input: &PixelBuffer) -> Result<InferenceResult, TensorMismatch> {
      Err(TensorMismatch)
    }
  }

  fn frame() -> PixelBuffer {
    PixelBuffer::filled(4, 4, PixelFormat::Bgra8, 0).unwrap()
  }

  fn labels() -> Arc<[String]> {
    vec!["milk carton".to_string(), "avocado".to_string()].into()
  }

  #[tokio::test]
  async fn maps_labels_and_clamps_scores() {
    let adapter = DetectionAdapter::new(
      FixedModel {
        result: InferenceResult::top_left(vec![
          DetectItem {
            class_id: 0,
            score: 1.4,
            bbox: [0.1, 0.2, 0.5, 0.6],
          },
          DetectItem {
            class_id: 9,
            score: 0.3,
            bbox: [0.0, 0.0, 1.2, 1.0],
          },
        ]),
      },
      labels(),
    );

    let candidates = adapter.detect(frame()).await.unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].label, "Milk Carton");
    assert_eq!(candidates[0].confidence, 1.0);
    assert!((candidates[0].bounding_box.y - 0.2).abs() < 1e-6);
    assert_eq!(candidates[1].label, labels::UNKNOWN_LABEL);
    assert!((candidates[1].bounding_box.width - 1.0).abs() < 1e-6);
  }

  #[tokio::test]
  async fn bottom_left_boxes_are_flipped_once() {
    let adapter = DetectionAdapter::new(
      FixedModel {
        result: InferenceResult {
          items: vec![DetectItem {
            class_id: 1,
            score: 0.8,
            bbox: [0.1, 0.1, 0.3, 0.4],
          }]
          .into_boxed_slice(),
          origin: BoxOrigin::BottomLeft,
        },
      },
      labels(),
    );

    let candidates = adapter.detect(frame()).await.unwrap();
    let rect = candidates[0].bounding_box;
    assert!((rect.y - 0.6).abs() < 1e-6);
    assert!((rect.height - 0.3).abs() < 1e-6);
  }

  #[tokio::test]
  async fn inference_error_becomes_prediction_failed() {
    let adapter = DetectionAdapter::new(BrokenModel, labels());
    let err = adapter.detect(frame()).await.unwrap_err();
    assert!(matches!(err, ModelError::PredictionFailed(_)));
    assert_eq!(err.to_string(), "prediction failed: tensor mismatch");
  }

  #[test]
  fn missing_artifact_is_not_found() {
    let loader =
      ModelLoader::new("/nonexistent/kanhuo/model.mlmodelc").fallback_extension("onnx");
    let result = loader.load(|_| Ok(BrokenModel));
    assert!(matches!(result, Err(ModelError::NotFound(_))));
  }

  #[test]
  fn fallback_extension_is_used() {
    let dir = std::env::temp_dir().join(format!("kanhuo-model-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let raw = dir.join("detector.onnx");
    std::fs::write(&raw, b"onnx").unwrap();

    let loader = ModelLoader::new(dir.join("detector.mlmodelc")).fallback_extension("onnx");
    assert_eq!(loader.resolve().unwrap(), raw);

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
