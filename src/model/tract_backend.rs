// 该文件是 Kanhuo （看货） 项目的一部分。
// src/model/tract_backend.rs - 基于 tract 的 ONNX 推理
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

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::PixelBuffer,
  model::{InferenceResult, Model, ModelError, ModelLoader, Yolo26Decoder},
};

#[derive(Error, Debug)]
pub enum Yolo26OnnxError {
  #[error("tract error: {0}")]
  Tract(String),
  #[error("model produced {actual} outputs, expected {expected}")]
  OutputCount { expected: usize, actual: usize },
}

impl From<TractError> for Yolo26OnnxError {
  fn from(err: TractError) -> Self {
    Yolo26OnnxError::Tract(err.to_string())
  }
}

/// YOLO26 ONNX 模型
///
/// 输入为 `1 x 3 x H x W` 的 f32 张量，帧按最近邻拉伸填满输入尺寸。
pub struct Yolo26Onnx {
  plan: TypedRunnableModel<TypedModel>,
  decoder: Yolo26Decoder,
}

impl Yolo26Onnx {
  pub fn load(path: &Path, decoder: Yolo26Decoder) -> Result<Self, ModelError> {
    let width = decoder.input_w as usize;
    let height = decoder.input_h as usize;

    let plan = tract_onnx::onnx()
      .model_for_path(path)
      .and_then(|model| {
        model.with_input_fact(
          0,
          InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height, width)),
        )
      })
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(|e| ModelError::LoadFailed(format!("{}: {}", path.display(), e)))?;

    let num_outputs = plan
      .model()
      .output_outlets()
      .map_err(|e| ModelError::InvalidModel(e.to_string()))?
      .len();
    if num_outputs != decoder.num_outputs() {
      return Err(ModelError::InvalidModel(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        decoder.num_outputs(),
        num_outputs
      )));
    }
    debug!("模型输出数量: {}", num_outputs);

    Ok(Self { plan, decoder })
  }

  fn build_input(&self, frame: &PixelBuffer) -> Tensor {
    let width = self.decoder.input_w as usize;
    let height = self.decoder.input_h as usize;
    let src_w = frame.width() as usize;
    let src_h = frame.height() as usize;
    let rgb = frame.to_rgb_nhwc();

    tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, channel, y, x)| {
      let sx = (x * src_w / width).min(src_w - 1);
      let sy = (y * src_h / height).min(src_h - 1);
      rgb[(sy * src_w + sx) * 3 + channel] as f32 / 255.0
    })
    .into_tensor()
  }
}

impl Model for Yolo26Onnx {
  type Input = PixelBuffer;
  type Output = InferenceResult;
  type Error = Yolo26OnnxError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let tensor = self.build_input(input);
    let outputs = self.plan.run(tvec!(tensor.into()))?;
    if outputs.len() != self.decoder.num_outputs() {
      return Err(Yolo26OnnxError::OutputCount {
        expected: self.decoder.num_outputs(),
        actual: outputs.len(),
      });
    }

    let slices = outputs
      .iter()
      .map(|t| t.as_slice::<f32>())
      .collect::<TractResult<Vec<&[f32]>>>()?;
    Ok(self.decoder.decode(&slices))
  }
}

pub struct Yolo26OnnxBuilder {
  loader: ModelLoader,
  decoder: Yolo26Decoder,
}

impl FromUrlWithScheme for Yolo26OnnxBuilder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26OnnxBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::LoadFailed(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut decoder = Yolo26Decoder::default();
    if let Some(threshold) = url
      .query_pairs()
      .find(|(k, _)| k == "threshold")
      .and_then(|(_, v)| v.parse::<f32>().ok())
    {
      decoder = decoder.with_threshold(threshold);
    }

    Ok(Self {
      loader: ModelLoader::new(url.path()),
      decoder,
    })
  }
}

impl Yolo26OnnxBuilder {
  pub fn loader(mut self, loader: ModelLoader) -> Self {
    self.loader = loader;
    self
  }

  pub fn build(self) -> Result<crate::model::DetectionAdapter<Yolo26Onnx>, ModelError> {
    let decoder = self.decoder;
    let adapter = self.loader.load(|path| Yolo26Onnx::load(path, decoder))?;
    info!("YOLO26 ONNX 模型就绪");
    Ok(adapter)
  }
}
