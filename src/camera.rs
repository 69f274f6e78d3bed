// 该文件是 Kanhuo （看货） 项目的一部分。
// src/camera.rs - 采集会话管理
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

//! # 采集会话管理
//!
//! [`CaptureSession`] 是相机硬件的唯一所有者。后端对象被移动到一个专用线程上，
//! 所有改变硬件状态的操作（配置、切换镜头、手电筒、启停）都以命令的形式进入同一个
//! 先进先出队列，逐个执行，互不交错。
//!
//! 帧回调由后端在自己的线程上触发，经 [`CaptureSession::set_frame_handler`]
//! 设置的处理函数转发出去，不经过命令队列。

use std::{
  fmt,
  sync::{Arc, PoisonError, RwLock, mpsc},
  thread,
};

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::frame::PixelBuffer;

pub mod simulated;
pub use self::simulated::{SimulatedCamera, SimulatedCameraProbe};

#[cfg(feature = "gstreamer_camera")]
mod gstreamer_camera;
#[cfg(feature = "gstreamer_camera")]
pub use self::gstreamer_camera::{GStreamerCamera, GStreamerCameraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
  NotDetermined,
  Authorized,
  Denied,
  Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevicePosition {
  Front,
  Back,
}

impl DevicePosition {
  pub fn toggled(self) -> Self {
    match self {
      DevicePosition::Front => DevicePosition::Back,
      DevicePosition::Back => DevicePosition::Front,
    }
  }
}

impl fmt::Display for DevicePosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DevicePosition::Front => write!(f, "front"),
      DevicePosition::Back => write!(f, "back"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
  pub id: String,
  pub position: DevicePosition,
  pub has_torch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDeviceState {
  pub position: DevicePosition,
  pub torch_enabled: bool,
  pub is_configured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Unconfigured,
  Configuring,
  Running,
  Stopped,
  Failed,
}

impl SessionState {
  pub fn is_configured(self) -> bool {
    matches!(self, SessionState::Running | SessionState::Stopped)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStatus {
  pub state: SessionState,
  pub device: CaptureDeviceState,
}

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("camera configuration failed: {0}")]
  ConfigurationFailed(String),
  #[error("invalid camera input: {0}")]
  InvalidInput(String),
  #[error("torch is not available on the active camera")]
  TorchNotAvailable,
  #[error("no {0} camera available")]
  MissingCaptureDevice(DevicePosition),
  #[error("camera access is not authorized")]
  Unauthorized,
  #[error("capture session is closed")]
  SessionClosed,
  #[error("camera backend error: {0}")]
  Backend(String),
}

pub type FrameHandler = Arc<dyn Fn(PixelBuffer) + Send + Sync>;
pub type AccessReply = Box<dyn FnOnce(bool) + Send>;

/// 平台相机抽象
///
/// 实现只会在采集会话的专用线程上被调用，无需自行加锁。
/// `start_running` 可以阻塞。
pub trait CameraBackend: Send + 'static {
  fn authorization_status(&self) -> AuthorizationState;
  /// 向用户申请权限，用户作出选择后调用 `reply`，调用可发生在任意线程
  fn request_access(&mut self, reply: AccessReply);

  fn devices(&self) -> Vec<DeviceInfo>;
  fn add_input(&mut self, device: &DeviceInfo) -> Result<(), CameraError>;
  fn remove_input(&mut self, device: &DeviceInfo);
  fn has_output(&self) -> bool;
  fn add_output(&mut self, handler: FrameHandler) -> Result<(), CameraError>;
  fn set_mirrored(&mut self, mirrored: bool);

  fn lock_for_configuration(&mut self, device: &DeviceInfo) -> Result<(), CameraError>;
  fn unlock_for_configuration(&mut self, device: &DeviceInfo);
  fn set_torch(&mut self, device: &DeviceInfo, on: bool) -> Result<(), CameraError>;

  fn start_running(&mut self) -> Result<(), CameraError>;
  fn stop_running(&mut self);
  fn is_running(&self) -> bool;
}

enum Command {
  RequestPermission(oneshot::Sender<AuthorizationState>),
  Configure(oneshot::Sender<Result<(), CameraError>>),
  Start(oneshot::Sender<Result<(), CameraError>>),
  Stop(oneshot::Sender<()>),
  SwitchPosition(oneshot::Sender<Result<DevicePosition, CameraError>>),
  ToggleTorch(oneshot::Sender<Result<bool, CameraError>>),
}

type HandlerSlot = Arc<RwLock<Option<FrameHandler>>>;

/// 采集会话句柄，可克隆；所有克隆共享同一个硬件线程
#[derive(Clone)]
pub struct CaptureSession {
  commands: mpsc::Sender<Command>,
  frame_handler: HandlerSlot,
  status: watch::Receiver<CaptureStatus>,
}

impl CaptureSession {
  pub fn new<B: CameraBackend>(backend: B) -> Result<Self, CameraError> {
    let (commands, queue) = mpsc::channel();
    let frame_handler: HandlerSlot = Arc::new(RwLock::new(None));

    let position = initial_position(&backend.devices());
    let initial = CaptureStatus {
      state: SessionState::Unconfigured,
      device: CaptureDeviceState {
        position,
        torch_enabled: false,
        is_configured: false,
      },
    };
    let (status_tx, status) = watch::channel(initial);

    let actor = SessionActor {
      backend,
      state: SessionState::Unconfigured,
      position,
      device: None,
      torch_enabled: false,
      frame_handler: Arc::clone(&frame_handler),
      status: status_tx,
    };

    thread::Builder::new()
      .name("kanhuo-capture-session".to_string())
      .spawn(move || actor.run(queue))
      .map_err(|e| CameraError::Backend(e.to_string()))?;

    info!("采集会话已创建，初始镜头: {}", position);
    Ok(Self {
      commands,
      frame_handler,
      status,
    })
  }

  /// 设置帧回调；回调运行在后端的帧线程上，必须立即返回
  pub fn set_frame_handler(&self, handler: FrameHandler) {
    *self
      .frame_handler
      .write()
      .unwrap_or_else(PoisonError::into_inner) = Some(handler);
  }

  pub fn clear_frame_handler(&self) {
    *self
      .frame_handler
      .write()
      .unwrap_or_else(PoisonError::into_inner) = None;
  }

  pub fn status(&self) -> CaptureStatus {
    *self.status.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<CaptureStatus> {
    self.status.clone()
  }

  /// 申请相机权限；未决定时挂起直到用户作出选择
  pub async fn request_permission(&self) -> AuthorizationState {
    match self.call(Command::RequestPermission).await {
      Ok(state) => state,
      Err(e) => {
        warn!("权限请求未得到答复: {}", e);
        AuthorizationState::Denied
      }
    }
  }

  pub async fn configure(&self) -> Result<(), CameraError> {
    self.call(Command::Configure).await?
  }

  pub async fn start(&self) -> Result<(), CameraError> {
    self.call(Command::Start).await?
  }

  pub async fn stop(&self) -> Result<(), CameraError> {
    self.call(Command::Stop).await
  }

  pub async fn switch_position(&self) -> Result<DevicePosition, CameraError> {
    self.call(Command::SwitchPosition).await?
  }

  pub async fn toggle_torch(&self) -> Result<bool, CameraError> {
    self.call(Command::ToggleTorch).await?
  }

  async fn call<T>(
    &self,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
  ) -> Result<T, CameraError> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(command(tx))
      .map_err(|_| CameraError::SessionClosed)?;
    rx.await.map_err(|_| CameraError::SessionClosed)
  }
}

/// 没有后置镜头但有前置镜头时从前置开始
fn initial_position(devices: &[DeviceInfo]) -> DevicePosition {
  let has = |p: DevicePosition| devices.iter().any(|d| d.position == p);
  if !has(DevicePosition::Back) && has(DevicePosition::Front) {
    DevicePosition::Front
  } else {
    DevicePosition::Back
  }
}

struct SessionActor<B> {
  backend: B,
  state: SessionState,
  position: DevicePosition,
  device: Option<DeviceInfo>,
  torch_enabled: bool,
  frame_handler: HandlerSlot,
  status: watch::Sender<CaptureStatus>,
}

impl<B: CameraBackend> SessionActor<B> {
  fn run(mut self, queue: mpsc::Receiver<Command>) {
    while let Ok(command) = queue.recv() {
      match command {
        Command::RequestPermission(reply) => self.request_permission(reply),
        Command::Configure(reply) => {
          let result = self.configure();
          self.respond(reply, result);
        }
        Command::Start(reply) => {
          let result = self.start();
          self.respond(reply, result);
        }
        Command::Stop(reply) => {
          self.stop();
          self.respond(reply, ());
        }
        Command::SwitchPosition(reply) => {
          let result = self.switch_position();
          self.respond(reply, result);
        }
        Command::ToggleTorch(reply) => {
          let result = self.toggle_torch();
          self.respond(reply, result);
        }
      }
    }

    debug!("采集会话句柄全部释放，关闭硬件");
    self.stop();
  }

  /// 先发布状态再答复，调用方拿到结果时状态已是最新
  fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
    self.publish();
    let _ = reply.send(value);
  }

  fn publish(&self) {
    self.status.send_replace(CaptureStatus {
      state: self.state,
      device: CaptureDeviceState {
        position: self.position,
        torch_enabled: self.torch_enabled,
        is_configured: self.state.is_configured(),
      },
    });
  }

  fn request_permission(&mut self, reply: oneshot::Sender<AuthorizationState>) {
    match self.backend.authorization_status() {
      AuthorizationState::NotDetermined => {
        info!("等待用户授予相机权限");
        self.backend.request_access(Box::new(move |granted| {
          let state = if granted {
            AuthorizationState::Authorized
          } else {
            AuthorizationState::Denied
          };
          let _ = reply.send(state);
        }));
      }
      state => {
        let _ = reply.send(state);
      }
    }
  }

  fn select_device(&self, position: DevicePosition) -> Option<DeviceInfo> {
    let devices = self.backend.devices();
    devices
      .iter()
      .find(|d| d.position == position)
      .or_else(|| devices.first())
      .cloned()
  }

  fn forwarding_handler(&self) -> FrameHandler {
    let slot = Arc::clone(&self.frame_handler);
    Arc::new(move |frame| {
      let handler = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
      if let Some(handler) = handler {
        handler(frame);
      }
    })
  }

  fn fail(&mut self, reason: String) -> Result<(), CameraError> {
    error!("相机配置失败: {}", reason);
    self.state = SessionState::Failed;
    Err(CameraError::ConfigurationFailed(reason))
  }

  fn configure(&mut self) -> Result<(), CameraError> {
    if self.state.is_configured() {
      debug!("采集会话已配置，跳过");
      return Ok(());
    }

    self.state = SessionState::Configuring;
    self.publish();

    let Some(device) = self.select_device(self.position) else {
      return self.fail("no capture device available".to_string());
    };

    if let Err(e) = self.backend.add_input(&device) {
      return self.fail(e.to_string());
    }

    if !self.backend.has_output() {
      let handler = self.forwarding_handler();
      if let Err(e) = self.backend.add_output(handler) {
        self.backend.remove_input(&device);
        return self.fail(e.to_string());
      }
    }

    self.position = device.position;
    self.backend.set_mirrored(device.position == DevicePosition::Front);
    info!("相机已配置: {} ({})", device.id, device.position);
    self.device = Some(device);
    self.state = SessionState::Stopped;
    Ok(())
  }

  fn start(&mut self) -> Result<(), CameraError> {
    match self.state {
      SessionState::Running => Ok(()),
      SessionState::Stopped => {
        self.backend.start_running()?;
        self.state = SessionState::Running;
        info!("采集会话已启动");
        Ok(())
      }
      _ => Err(CameraError::ConfigurationFailed(
        "session is not configured".to_string(),
      )),
    }
  }

  fn stop(&mut self) {
    if self.state == SessionState::Running {
      self.backend.stop_running();
      self.state = SessionState::Stopped;
      info!("采集会话已停止");
    }
    self.torch_off();
  }

  fn torch_off(&mut self) {
    if !self.torch_enabled {
      return;
    }
    let Some(device) = self.device.clone() else {
      self.torch_enabled = false;
      return;
    };

    match self.backend.lock_for_configuration(&device) {
      Ok(()) => {
        if let Err(e) = self.backend.set_torch(&device, false) {
          warn!("关闭手电筒失败: {}", e);
        }
        self.backend.unlock_for_configuration(&device);
      }
      Err(e) => warn!("锁定设备失败，无法关闭手电筒: {}", e),
    }
    self.torch_enabled = false;
  }

  fn switch_position(&mut self) -> Result<DevicePosition, CameraError> {
    let target = self.position.toggled();

    let Some(current) = self.device.clone() else {
      // 尚未配置，只记住下次配置时使用的镜头
      self.position = target;
      return Ok(target);
    };

    let Some(next) = self
      .backend
      .devices()
      .into_iter()
      .find(|d| d.position == target)
    else {
      warn!("没有可用的{}镜头", target);
      return Err(CameraError::InvalidInput(
        CameraError::MissingCaptureDevice(target).to_string(),
      ));
    };

    self.torch_off();
    self.backend.remove_input(&current);
    if let Err(e) = self.backend.add_input(&next) {
      warn!("无法切换到 {}: {}，恢复原镜头", next.id, e);
      if let Err(e) = self.backend.add_input(&current) {
        error!("恢复原镜头 {} 失败: {}", current.id, e);
      }
      self.resume_after_input_change()?;
      return Err(CameraError::InvalidInput(e.to_string()));
    }

    self.backend.set_mirrored(target == DevicePosition::Front);
    self.position = target;
    self.device = Some(next);
    self.resume_after_input_change()?;

    info!("已切换到{}镜头", target);
    Ok(target)
  }

  /// 增删输入可能让后端停止采集；会话处于运行状态时重新启动
  fn resume_after_input_change(&mut self) -> Result<(), CameraError> {
    if self.state != SessionState::Running || self.backend.is_running() {
      return Ok(());
    }
    if let Err(e) = self.backend.start_running() {
      error!("切换镜头后无法重新启动采集: {}", e);
      self.state = SessionState::Stopped;
      return Err(e);
    }
    Ok(())
  }

  fn toggle_torch(&mut self) -> Result<bool, CameraError> {
    let device = match &self.device {
      Some(device) if device.has_torch => device.clone(),
      _ => return Err(CameraError::TorchNotAvailable),
    };

    self.backend.lock_for_configuration(&device)?;
    let target = !self.torch_enabled;
    let result = self.backend.set_torch(&device, target);
    self.backend.unlock_for_configuration(&device);
    result?;

    self.torch_enabled = target;
    info!("手电筒已{}", if target { "打开" } else { "关闭" });
    Ok(target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn device(id: &str, position: DevicePosition, has_torch: bool) -> DeviceInfo {
    DeviceInfo {
      id: id.to_string(),
      position,
      has_torch,
    }
  }

  #[test]
  fn front_only_hardware_starts_at_front() {
    let devices = vec![device("front", DevicePosition::Front, false)];
    assert_eq!(initial_position(&devices), DevicePosition::Front);
    assert_eq!(initial_position(&[]), DevicePosition::Back);
  }

  #[tokio::test]
  async fn configure_is_idempotent_and_start_stop_toggle() {
    let camera = SimulatedCamera::new();
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();

    assert!(session.start().await.is_err());
    session.configure().await.unwrap();
    session.configure().await.unwrap();
    assert_eq!(probe.attached_inputs().len(), 1);
    assert_eq!(session.status().state, SessionState::Stopped);

    session.start().await.unwrap();
    session.start().await.unwrap();
    assert!(probe.is_running());
    assert_eq!(session.status().state, SessionState::Running);

    session.stop().await.unwrap();
    session.stop().await.unwrap();
    assert!(!probe.is_running());
    assert_eq!(session.status().state, SessionState::Stopped);
  }

  #[tokio::test]
  async fn configure_without_devices_fails_and_can_retry() {
    let camera = SimulatedCamera::new().with_devices(Vec::new());
    let session = CaptureSession::new(camera).unwrap();

    let err = session.configure().await.unwrap_err();
    assert!(matches!(err, CameraError::ConfigurationFailed(_)));
    assert_eq!(session.status().state, SessionState::Failed);

    let err = session.configure().await.unwrap_err();
    assert!(matches!(err, CameraError::ConfigurationFailed(_)));
  }

  #[tokio::test]
  async fn configure_falls_back_to_any_device() {
    let camera =
      SimulatedCamera::new().with_devices(vec![device("only", DevicePosition::Front, false)]);
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    assert_eq!(probe.attached_inputs(), vec!["only".to_string()]);
    assert_eq!(session.status().device.position, DevicePosition::Front);
    assert!(probe.is_mirrored());
  }

  #[tokio::test]
  async fn torch_requires_capable_device() {
    let camera = SimulatedCamera::new();
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();

    assert!(matches!(
      session.toggle_torch().await,
      Err(CameraError::TorchNotAvailable)
    ));

    session.configure().await.unwrap();
    assert!(session.toggle_torch().await.unwrap());
    assert!(probe.torch_on());
    assert!(session.status().device.torch_enabled);

    session.switch_position().await.unwrap();
    assert!(matches!(
      session.toggle_torch().await,
      Err(CameraError::TorchNotAvailable)
    ));
  }

  #[tokio::test]
  async fn failed_switch_keeps_previous_input() {
    let camera = SimulatedCamera::new().refuse_input(DevicePosition::Front);
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();

    let err = session.switch_position().await.unwrap_err();
    assert!(matches!(err, CameraError::InvalidInput(_)));
    assert_eq!(probe.attached_inputs(), vec!["back".to_string()]);
    assert_eq!(session.status().device.position, DevicePosition::Back);
  }

  #[tokio::test]
  async fn stop_turns_torch_off() {
    let camera = SimulatedCamera::new();
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    session.start().await.unwrap();
    session.toggle_torch().await.unwrap();

    session.stop().await.unwrap();
    assert!(!probe.torch_on());
    assert!(!session.status().device.torch_enabled);
  }

  #[tokio::test]
  async fn pending_permission_is_resolved_by_user() {
    let camera = SimulatedCamera::new()
      .with_authorization(AuthorizationState::NotDetermined)
      .grant_on_request(true);
    let session = CaptureSession::new(camera).unwrap();
    assert_eq!(
      session.request_permission().await,
      AuthorizationState::Authorized
    );
  }

  #[tokio::test]
  async fn switch_without_target_lens_keeps_torch() {
    let camera =
      SimulatedCamera::new().with_devices(vec![device("back", DevicePosition::Back, true)]);
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    session.start().await.unwrap();
    assert!(session.toggle_torch().await.unwrap());

    let err = session.switch_position().await.unwrap_err();
    assert!(matches!(err, CameraError::InvalidInput(_)));
    assert!(probe.torch_on());
    assert!(session.status().device.torch_enabled);
    assert_eq!(probe.attached_inputs(), vec!["back".to_string()]);
    assert!(!probe.log().iter().any(|e| e == "torch:off" || e == "remove:back"));
  }

  #[tokio::test]
  async fn switch_restarts_capture_stopped_by_input_change() {
    let camera = SimulatedCamera::new().stops_on_input_change();
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    session.start().await.unwrap();

    assert_eq!(session.switch_position().await.unwrap(), DevicePosition::Front);
    assert!(probe.is_running());
    assert_eq!(session.status().state, SessionState::Running);
  }

  #[tokio::test]
  async fn failed_restart_after_switch_reports_stopped() {
    let camera = SimulatedCamera::new()
      .stops_on_input_change()
      .fail_starts_after(1);
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    session.start().await.unwrap();

    let err = session.switch_position().await.unwrap_err();
    assert!(matches!(err, CameraError::Backend(_)));
    assert!(!probe.is_running());
    let status = session.status();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.device.position, DevicePosition::Front);

    session.stop().await.unwrap();
    assert_eq!(session.status().state, SessionState::Stopped);
  }

  #[tokio::test]
  async fn refused_switch_restarts_the_previous_input() {
    let camera = SimulatedCamera::new()
      .stops_on_input_change()
      .refuse_input(DevicePosition::Front);
    let probe = camera.probe();
    let session = CaptureSession::new(camera).unwrap();
    session.configure().await.unwrap();
    session.start().await.unwrap();

    let err = session.switch_position().await.unwrap_err();
    assert!(matches!(err, CameraError::InvalidInput(_)));
    assert!(probe.is_running());
    assert_eq!(probe.attached_inputs(), vec!["back".to_string()]);
    assert_eq!(session.status().state, SessionState::Running);
  }
}

