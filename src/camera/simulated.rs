// 该文件是 Kanhuo （看货） 项目的一部分。
// src/camera/simulated.rs - 模拟相机
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

//! 进程内模拟相机，用于没有真实硬件的开发环境和测试
//!
//! ```text
//! sim://?fps=30&width=640&height=480&devices=back,front&torch=back&auth=authorized
//! sim://?auth=prompt&grant=false
//! sim://?image=/path/to/shelf.jpg&fps=15
//! ```

use std::{
  collections::HashSet,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

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
pub enum SimulatedCameraError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Invalid query parameter {key}={value}")]
  InvalidParameter { key: String, value: String },
  #[cfg(feature = "read_image_file")]
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

#[derive(Default)]
struct Shared {
  inputs: Mutex<Vec<String>>,
  max_inputs: AtomicUsize,
  handler: Mutex<Option<FrameHandler>>,
  running: AtomicBool,
  torch: AtomicBool,
  mirrored: AtomicBool,
  locked: Mutex<Option<String>>,
  sequence: AtomicU64,
  log: Mutex<Vec<String>>,
}

impl Shared {
  fn record(&self, entry: String) {
    self.log.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
  }
}

#[derive(Clone)]
struct FrameTemplate {
  width: u32,
  height: u32,
  format: PixelFormat,
  data: Arc<[u8]>,
}

impl FrameTemplate {
  fn solid(width: u32, height: u32) -> Self {
    let format = PixelFormat::Bgra8;
    let size = width as usize * height as usize * format.bytes_per_pixel();
    Self {
      width,
      height,
      format,
      data: vec![0x80; size].into(),
    }
  }

  fn render(&self, sequence: u64) -> Option<PixelBuffer> {
    PixelBuffer::new(self.width, self.height, self.format, self.data.to_vec())
      .map(|frame| frame.with_sequence(sequence))
      .map_err(|e| error!("模拟帧无效: {}", e))
      .ok()
  }
}

/// 模拟相机
///
/// 默认带一个有手电筒的后置镜头和一个没有手电筒的前置镜头，权限已授予，
/// 不自动出帧（`fps = 0`），通过 [`SimulatedCameraProbe::emit_frame`] 手动推帧。
pub struct SimulatedCamera {
  devices: Vec<DeviceInfo>,
  authorization: AuthorizationState,
  grant_on_request: bool,
  refused: HashSet<DevicePosition>,
  reconfigure_delay: Duration,
  stop_on_input_change: bool,
  start_limit: Option<usize>,
  starts: usize,
  fps: u32,
  template: FrameTemplate,
  shared: Arc<Shared>,
  pump: Option<JoinHandle<()>>,
}

impl Default for SimulatedCamera {
  fn default() -> Self {
    Self::new()
  }
}

impl SimulatedCamera {
  pub fn new() -> Self {
    Self {
      devices: vec![
        DeviceInfo {
          id: "back".to_string(),
          position: DevicePosition::Back,
          has_torch: true,
        },
        DeviceInfo {
          id: "front".to_string(),
          position: DevicePosition::Front,
          has_torch: false,
        },
      ],
      authorization: AuthorizationState::Authorized,
      grant_on_request: true,
      refused: HashSet::new(),
      reconfigure_delay: Duration::ZERO,
      stop_on_input_change: false,
      start_limit: None,
      starts: 0,
      fps: 0,
      template: FrameTemplate::solid(640, 480),
      shared: Arc::new(Shared::default()),
      pump: None,
    }
  }

  pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
    self.devices = devices;
    self
  }

  pub fn with_authorization(mut self, state: AuthorizationState) -> Self {
    self.authorization = state;
    self
  }

  /// 权限未决定时，用户的模拟选择
  pub fn grant_on_request(mut self, grant: bool) -> Self {
    self.grant_on_request = grant;
    self
  }

  /// 该位置的镜头无法作为输入加入会话
  pub fn refuse_input(mut self, position: DevicePosition) -> Self {
    self.refused.insert(position);
    self
  }

  /// 每次增删输入耗时，用于观察重配置是否交错
  pub fn with_reconfigure_delay(mut self, delay: Duration) -> Self {
    self.reconfigure_delay = delay;
    self
  }

  /// 移除输入时停止采集，像某些平台那样需要重新启动
  pub fn stops_on_input_change(mut self) -> Self {
    self.stop_on_input_change = true;
    self
  }

  /// 成功启动 `starts` 次之后，再次启动采集失败
  pub fn fail_starts_after(mut self, starts: usize) -> Self {
    self.start_limit = Some(starts);
    self
  }

  pub fn with_fps(mut self, fps: u32) -> Self {
    self.fps = fps;
    self
  }

  pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
    self.template = FrameTemplate::solid(width.max(1), height.max(1));
    self
  }

  #[cfg(feature = "read_image_file")]
  pub fn with_image(mut self, path: &str) -> Result<Self, SimulatedCameraError> {
    let image = image::ImageReader::open(path)
      .map_err(image::ImageError::IoError)?
      .decode()?
      .to_rgb8();
    let (width, height) = image.dimensions();
    self.template = FrameTemplate {
      width,
      height,
      format: PixelFormat::Rgb8,
      data: image.into_raw().into(),
    };
    Ok(self)
  }

  pub fn probe(&self) -> SimulatedCameraProbe {
    SimulatedCameraProbe {
      shared: Arc::clone(&self.shared),
      template: self.template.clone(),
    }
  }

  fn device_known(&self, device: &DeviceInfo) -> bool {
    self.devices.iter().any(|d| d.id == device.id)
  }

  fn spawn_pump(&mut self) {
    if self.fps == 0 || self.pump.is_some() {
      return;
    }
    let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
    let probe = self.probe();
    let spawned = thread::Builder::new()
      .name("kanhuo-sim-frames".to_string())
      .spawn(move || {
        while probe.shared.running.load(Ordering::Acquire) {
          probe.emit_frame();
          thread::sleep(interval);
        }
        debug!("模拟出帧线程退出");
      });
    match spawned {
      Ok(handle) => self.pump = Some(handle),
      Err(e) => error!("无法启动模拟出帧线程: {}", e),
    }
  }
}

impl CameraBackend for SimulatedCamera {
  fn authorization_status(&self) -> AuthorizationState {
    self.authorization
  }

  fn request_access(&mut self, reply: AccessReply) {
    let granted = self.grant_on_request;
    self.authorization = if granted {
      AuthorizationState::Authorized
    } else {
      AuthorizationState::Denied
    };
    // 模拟系统弹窗：在另一个线程上答复
    thread::spawn(move || reply(granted));
  }

  fn devices(&self) -> Vec<DeviceInfo> {
    self.devices.clone()
  }

  fn add_input(&mut self, device: &DeviceInfo) -> Result<(), CameraError> {
    thread::sleep(self.reconfigure_delay);
    if !self.device_known(device) || self.refused.contains(&device.position) {
      return Err(CameraError::InvalidInput(format!(
        "cannot add input {}",
        device.id
      )));
    }

    let mut inputs = self.shared.inputs.lock().unwrap_or_else(PoisonError::into_inner);
    inputs.push(device.id.clone());
    self.shared.max_inputs.fetch_max(inputs.len(), Ordering::AcqRel);
    self.shared.record(format!("add:{}", device.id));
    Ok(())
  }

  fn remove_input(&mut self, device: &DeviceInfo) {
    thread::sleep(self.reconfigure_delay);
    self
      .shared
      .inputs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .retain(|id| id != &device.id);
    self.shared.record(format!("remove:{}", device.id));
    if self.stop_on_input_change && self.is_running() {
      self.stop_running();
    }
  }

  fn has_output(&self) -> bool {
    self
      .shared
      .handler
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  fn add_output(&mut self, handler: FrameHandler) -> Result<(), CameraError> {
    *self.shared.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    Ok(())
  }

  fn set_mirrored(&mut self, mirrored: bool) {
    self.shared.mirrored.store(mirrored, Ordering::Release);
  }

  fn lock_for_configuration(&mut self, device: &DeviceInfo) -> Result<(), CameraError> {
    let mut locked = self.shared.locked.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(owner) = locked.as_ref() {
      return Err(CameraError::Backend(format!("{} is already locked", owner)));
    }
    *locked = Some(device.id.clone());
    Ok(())
  }

  fn unlock_for_configuration(&mut self, device: &DeviceInfo) {
    let mut locked = self.shared.locked.lock().unwrap_or_else(PoisonError::into_inner);
    if locked.as_deref() == Some(device.id.as_str()) {
      *locked = None;
    }
  }

  fn set_torch(&mut self, device: &DeviceInfo, on: bool) -> Result<(), CameraError> {
    if !device.has_torch {
      return Err(CameraError::TorchNotAvailable);
    }
    let locked = self.shared.locked.lock().unwrap_or_else(PoisonError::into_inner);
    if locked.as_deref() != Some(device.id.as_str()) {
      return Err(CameraError::Backend(format!(
        "{} is not locked for configuration",
        device.id
      )));
    }
    let attached = self
      .shared
      .inputs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(&device.id);
    if !attached {
      return Err(CameraError::InvalidInput(format!("{} is not attached", device.id)));
    }
    self.shared.torch.store(on, Ordering::Release);
    self.shared.record(format!("torch:{}", if on { "on" } else { "off" }));
    Ok(())
  }

  fn start_running(&mut self) -> Result<(), CameraError> {
    if self.start_limit.is_some_and(|limit| self.starts >= limit) {
      return Err(CameraError::Backend("simulated capture failed to start".to_string()));
    }
    self.starts += 1;
    self.shared.running.store(true, Ordering::Release);
    self.shared.record("start".to_string());
    self.spawn_pump();
    Ok(())
  }

  fn stop_running(&mut self) {
    self.shared.running.store(false, Ordering::Release);
    self.shared.record("stop".to_string());
    if let Some(pump) = self.pump.take()
      && pump.join().is_err()
    {
      warn!("模拟出帧线程异常退出");
    }
  }

  fn is_running(&self) -> bool {
    self.shared.running.load(Ordering::Acquire)
  }
}

impl Drop for SimulatedCamera {
  fn drop(&mut self) {
    self.shared.running.store(false, Ordering::Release);
    if let Some(pump) = self.pump.take() {
      let _ = pump.join();
    }
  }
}

/// 从外部观察并驱动模拟相机
#[derive(Clone)]
pub struct SimulatedCameraProbe {
  shared: Arc<Shared>,
  template: FrameTemplate,
}

impl SimulatedCameraProbe {
  /// 在调用线程上推送一帧；会话未运行或未挂接输出时返回 false
  pub fn emit_frame(&self) -> bool {
    if !self.shared.running.load(Ordering::Acquire) {
      return false;
    }
    let handler = self
      .shared
      .handler
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    let Some(handler) = handler else {
      return false;
    };
    let sequence = self.shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
    match self.template.render(sequence) {
      Some(frame) => {
        handler(frame);
        true
      }
      None => false,
    }
  }

  pub fn attached_inputs(&self) -> Vec<String> {
    self
      .shared
      .inputs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 任意时刻同时挂接的输入数量的最大值
  pub fn max_concurrent_inputs(&self) -> usize {
    self.shared.max_inputs.load(Ordering::Acquire)
  }

  pub fn torch_on(&self) -> bool {
    self.shared.torch.load(Ordering::Acquire)
  }

  pub fn is_running(&self) -> bool {
    self.shared.running.load(Ordering::Acquire)
  }

  pub fn is_mirrored(&self) -> bool {
    self.shared.mirrored.load(Ordering::Acquire)
  }

  /// 硬件操作记录，如 `add:back`、`remove:back`、`torch:on`
  pub fn log(&self) -> Vec<String> {
    self.shared.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

impl FromUrlWithScheme for SimulatedCamera {
  const SCHEME: &'static str = "sim";
}

impl FromUrl for SimulatedCamera {
  type Error = SimulatedCameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SimulatedCameraError::SchemeMismatch);
    }

    let invalid = |key: &str, value: &str| SimulatedCameraError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    };

    let mut camera = SimulatedCamera::new();
    let mut width = 640u32;
    let mut height = 480u32;
    let mut positions: Option<Vec<DevicePosition>> = None;
    let mut torch: Option<Vec<DevicePosition>> = None;

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "fps" => camera.fps = value.parse().map_err(|_| invalid(&key, &value))?,
        "width" => width = value.parse().map_err(|_| invalid(&key, &value))?,
        "height" => height = value.parse().map_err(|_| invalid(&key, &value))?,
        "devices" => {
          positions = Some(parse_positions(&value).ok_or_else(|| invalid(&key, &value))?)
        }
        "torch" => torch = Some(parse_positions(&value).ok_or_else(|| invalid(&key, &value))?),
        "auth" => {
          camera.authorization = match value.as_ref() {
            "authorized" => AuthorizationState::Authorized,
            "denied" => AuthorizationState::Denied,
            "restricted" => AuthorizationState::Restricted,
            "prompt" => AuthorizationState::NotDetermined,
            _ => return Err(invalid(&key, &value)),
          }
        }
        "grant" => camera.grant_on_request = value.parse().map_err(|_| invalid(&key, &value))?,
        #[cfg(feature = "read_image_file")]
        "image" => camera = camera.with_image(&value)?,
        _ => warn!("忽略未知参数: {}={}", key, value),
      }
    }

    if camera.template.format == PixelFormat::Bgra8 {
      camera = camera.with_frame_size(width, height);
    }

    if let Some(positions) = positions {
      let torch = torch.unwrap_or_else(|| vec![DevicePosition::Back]);
      camera.devices = positions
        .into_iter()
        .map(|position| DeviceInfo {
          id: position.to_string(),
          position,
          has_torch: torch.contains(&position),
        })
        .collect();
    } else if let Some(torch) = torch {
      for device in camera.devices.iter_mut() {
        device.has_torch = torch.contains(&device.position);
      }
    }

    info!(
      "模拟相机: {} 个镜头, {} fps, 权限 {:?}",
      camera.devices.len(),
      camera.fps,
      camera.authorization
    );
    Ok(camera)
  }
}

fn parse_positions(value: &str) -> Option<Vec<DevicePosition>> {
  value
    .split(',')
    .filter(|s| !s.is_empty())
    .map(|s| match s.trim() {
      "front" => Some(DevicePosition::Front),
      "back" => Some(DevicePosition::Back),
      _ => None,
    })
    .collect()
}
