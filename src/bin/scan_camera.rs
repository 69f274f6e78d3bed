// 该文件是 Kanhuo （看货） 项目的一部分。
// src/bin/scan_camera.rs - 实时扫描
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

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use kanhuo::{
  FromUrl, FromUrlWithScheme,
  camera::{CaptureSession, SimulatedCamera},
  config::ScannerConfig,
  model::{Detect, ModelError, Yolo26OnnxBuilder},
  task::ContinuousTask,
  view::ScannerViewModel,
};
use tracing::info;

/// Kanhuo 实时扫描
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，如 yolo26:///models/yolo26n.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 相机来源：sim://?fps=15 或 gst://camera/dev/video0
  #[arg(long, value_name = "CAMERA", default_value = "sim://?fps=15")]
  pub camera: Url,
  /// 推理指定帧数后退出，0 表示直到 Ctrl-C
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
}

fn open_session(url: &Url) -> Result<CaptureSession> {
  let session = match url.scheme() {
    scheme if scheme == SimulatedCamera::SCHEME => {
      CaptureSession::new(SimulatedCamera::from_url(url)?)?
    }
    #[cfg(feature = "gstreamer_camera")]
    scheme if scheme == kanhuo::camera::GStreamerCamera::SCHEME => {
      CaptureSession::new(kanhuo::camera::GStreamerCamera::from_url(url)?)?
    }
    scheme => bail!("不支持的相机来源: {}", scheme),
  };
  Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("相机来源: {}", args.camera);

  let session = open_session(&args.camera)?;
  let model = args.model.clone();
  let loader = move || -> Result<Arc<dyn Detect>, ModelError> {
    let adapter = Yolo26OnnxBuilder::from_url(&model)?.build()?;
    Ok(Arc::new(adapter))
  };

  let view = ScannerViewModel::new(session, loader, ScannerConfig::default());
  ContinuousTask::default()
    .with_frame_number(Some(args.frame_number))
    .run(view)
    .await
}
