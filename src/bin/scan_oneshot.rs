// 该文件是 Kanhuo （看货） 项目的一部分。
// src/bin/scan_oneshot.rs - 单张图像检测
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use image::ImageReader;
use url::Url;

use kanhuo::{
  FromUrl,
  frame::PixelBuffer,
  model::{ModelLoader, Yolo26OnnxBuilder},
  task::{OneShotTask, candidates_to_json},
};
use tracing::info;

/// Kanhuo 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，如 yolo26:///models/yolo26n.onnx?threshold=0.4
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 模型文件不存在时尝试的扩展名
  #[arg(long, value_name = "EXT")]
  pub fallback_extension: Option<String>,
  /// 输入图像文件
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 叠加检测框后的输出图像，如 image:///tmp/overlay.png
  #[cfg(feature = "save_image_file")]
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入图像: {}", args.image.display());

  let mut loader = ModelLoader::new(args.model.path());
  if let Some(extension) = &args.fallback_extension {
    loader = loader.fallback_extension(extension);
  }
  let builder = Yolo26OnnxBuilder::from_url(&args.model)?.loader(loader);
  let detector = tokio::task::spawn_blocking(move || builder.build()).await??;

  let frame = PixelBuffer::from(ImageReader::open(&args.image)?.decode()?.to_rgb8());

  let task = OneShotTask::default();
  #[cfg(feature = "save_image_file")]
  let task = task.with_output(
    args
      .output
      .as_ref()
      .map(kanhuo::output::SaveImageFileOutput::from_url)
      .transpose()?,
  );

  let candidates = task.run(frame, &detector).await?;
  println!("{}", serde_json::to_string_pretty(&candidates_to_json(&candidates))?);

  Ok(())
}
