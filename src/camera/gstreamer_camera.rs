// 该文件是 Kanhuo （看货） 项目的一部分。
// src/camera/gstreamer_camera.rs - 基于 GStreamer 的相机后端
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

//! 本模块把 V4L2 摄像头包装为 [`CameraBackend`]。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## URL
//!
//! ```text
//! gst://camera/dev/video0?front=/dev/video2&width=640&height=480&fps=30
//! ```
//!
//! 路径为后置镜头的设备节点，`front` 参数为可选的前置镜头。
//! V4L2 设备不提供手电筒控制。每个加入会话的输入对应一条独立管道：
//!
//! ```text
//! v4l2src device=... ! video/x-raw,width=..,height=..,framerate=../1
//!   ! videoconvert ! video/x-raw,format=RGB ! appsink max-buffers=2 drop=true name=sink
//! ```

use std::{collections::HashMap, io::ErrorKind, path::Path};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  camera::{
    AccessReply, AuthorizationState, CameraBackend, CameraError, DeviceInfo, DevicePosition,
    FrameHandler,
  },
  frame::{PixelBuffer, PixelFormat},
};

#[derive(Error, Debug)]
pub enum GStreamerCameraError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

impl From<GStreamerCameraError> for CameraError {
  fn from(err: GStreamerCameraError) -> Self {
    CameraError::Backend(err.to_string())
  }
}

struct ActiveInput {
  device: DeviceInfo,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

pub struct GStreamerCamera {
  back: Option<String>,
  front: Option<String>,
  width: u32,
  height: u32,
  fps: u32,
  input: Option<ActiveInput>,
  handler: Option<FrameHandler>,
  running: bool,
}

impl GStreamerCamera {
  fn pipeline_description(&self, device: &str) -> String {
    format!(
      "v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1 \
       ! videoconvert ! video/x-raw,format=RGB ! appsink max-buffers=2 drop=true name=sink",
      device, self.width, self.height, self.fps
    )
  }

  fn build_pipeline(
    &self,
    device: &str,
  ) -> Result<(gst::Pipeline, gst_app::AppSink), GStreamerCameraError> {
    gst::init()?;

    let description = self.pipeline_description(device);
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerCameraError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerCameraError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerCameraError::AppSinkConversionFailed)?;

    Ok((pipeline, appsink))
  }

  fn install_handler(appsink: &gst_app::AppSink, handler: FrameHandler) {
    let mut sequence = 0u64;
    appsink.set_callbacks(
      gst_app::AppSinkCallbacks::builder()
        .new_sample(move |sink| {
          let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
          sequence += 1;
          match convert_sample(sample) {
            Ok(frame) => handler(frame.with_sequence(sequence)),
            Err(e) => error!("Failed to fetch sample: {}", e),
          }
          Ok(gst::FlowSuccess::Ok)
        })
        .build(),
    );
  }

  fn device_path(&self, position: DevicePosition) -> Option<&str> {
    match position {
      DevicePosition::Back => self.back.as_deref(),
      DevicePosition::Front => self.front.as_deref(),
    }
  }
}

impl CameraBackend for GStreamerCamera {
  fn authorization_status(&self) -> AuthorizationState {
    let Some(path) = self.back.as_deref().or(self.front.as_deref()) else {
      return AuthorizationState::Authorized;
    };
    match std::fs::File::open(path) {
      Ok(_) => AuthorizationState::Authorized,
      Err(e) if e.kind() == ErrorKind::PermissionDenied => AuthorizationState::Denied,
      // 设备不存在时交给配置阶段报告
      Err(_) => AuthorizationState::Authorized,
    }
  }

  fn request_access(&mut self, reply: AccessReply) {
    // 设备节点权限由系统管理，无法在运行时申请
    reply(self.authorization_status() == AuthorizationState::Authorized);
  }

  fn devices(&self) -> Vec<DeviceInfo> {
    [DevicePosition::Back, DevicePosition::Front]
      .into_iter()
      .filter_map(|position| {
        let path = self.device_path(position)?;
        Path::new(path).exists().then(|| DeviceInfo {
          id: path.to_string(),
          position,
          has_torch: false,
        })
      })
      .collect()
  }

  fn add_input(&mut self, device: &DeviceInfo) -> Result<(), CameraError> {
    if self.input.is_some() {
      return Err(CameraError::InvalidInput("an input is already attached".to_string()));
    }
    let (pipeline, appsink) = self
      .build_pipeline(&device.id)
      .map_err(|e| CameraError::InvalidInput(e.to_string()))?;
    if let Some(handler) = &self.handler {
      Self::install_handler(&appsink, handler.clone());
    }
    self.input = Some(ActiveInput {
      device: device.clone(),
      pipeline,
      appsink,
    });
    debug!("已加入输入: {}", device.id);
    Ok(())
  }

  fn remove_input(&mut self, device: &DeviceInfo) {
    if self
      .input
      .as_ref()
      .is_some_and(|input| input.device.id == device.id)
      && let Some(input) = self.input.take()
      && let Err(e) = input.pipeline.set_state(gst::State::Null)
    {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }

  fn has_output(&self) -> bool {
    self.handler.is_some()
  }

  fn add_output(&mut self, handler: FrameHandler) -> Result<(), CameraError> {
    if let Some(input) = &self.input {
      Self::install_handler(&input.appsink, handler.clone());
    }
    self.handler = Some(handler);
    Ok(())
  }

  fn set_mirrored(&mut self, mirrored: bool) {
    // 前置画面由显示层镜像，管道内不翻转
    debug!("mirrored = {}", mirrored);
  }

  fn lock_for_configuration(&mut self, _device: &DeviceInfo) -> Result<(), CameraError> {
    Ok(())
  }

  fn unlock_for_configuration(&mut self, _device: &DeviceInfo) {}

  fn set_torch(&mut self, _device: &DeviceInfo, _on: bool) -> Result<(), CameraError> {
    Err(CameraError::TorchNotAvailable)
  }

  fn start_running(&mut self) -> Result<(), CameraError> {
    let input = self
      .input
      .as_ref()
      .ok_or_else(|| CameraError::ConfigurationFailed("no input attached".to_string()))?;
    input
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(GStreamerCameraError::from)?;
    self.running = true;
    Ok(())
  }

  fn stop_running(&mut self) {
    if let Some(input) = &self.input
      && let Err(e) = input.pipeline.set_state(gst::State::Paused)
    {
      warn!("Failed to pause GStreamer pipeline: {}", e);
    }
    self.running = false;
  }

  fn is_running(&self) -> bool {
    self.running
      && self
        .input
        .as_ref()
        .is_some_and(|input| input.pipeline.current_state() == gst::State::Playing)
  }
}

impl Drop for GStreamerCamera {
  fn drop(&mut self) {
    if let Some(input) = self.input.take()
      && let Err(e) = input.pipeline.set_state(gst::State::Null)
    {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl FromUrlWithScheme for GStreamerCamera {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerCamera {
  type Error = GStreamerCameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME || url.host_str() != Some("camera") {
      return Err(GStreamerCameraError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    let back = Some(url.path().to_string()).filter(|p| p.len() > 1);
    Ok(GStreamerCamera {
      back,
      front: query.get("front").cloned(),
      width: number("width", 640),
      height: number("height", 480),
      fps: number("fps", 15),
      input: None,
      handler: None,
      running: false,
    })
  }
}

fn convert_sample(sample: gst::Sample) -> Result<PixelBuffer, GStreamerCameraError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerCameraError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerCameraError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerCameraError::VideoInfoError)?;
  let format = match video_info.format() {
    gst_video::VideoFormat::Rgb => PixelFormat::Rgb8,
    gst_video::VideoFormat::Bgr => PixelFormat::Bgr8,
    gst_video::VideoFormat::Bgra => PixelFormat::Bgra8,
    _ => return Err(GStreamerCameraError::UnsupportedFormat),
  };

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let row = width * format.bytes_per_pixel();
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerCameraError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();
  if height == 0 || stride < row || data.len() < stride * (height - 1) + row {
    return Err(GStreamerCameraError::PipelineError(format!(
      "buffer too small: {} bytes for {}x{}",
      data.len(),
      width,
      height
    )));
  }

  // 去掉行尾填充
  let mut packed = Vec::with_capacity(row * height);
  for h in 0..height {
    packed.extend_from_slice(&data[h * stride..h * stride + row]);
  }

  PixelBuffer::new(video_info.width(), video_info.height(), format, packed)
    .map_err(|e| GStreamerCameraError::PipelineError(e.to_string()))
}
