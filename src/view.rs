// 该文件是 Kanhuo （看货） 项目的一部分。
// src/view.rs - 扫描视图状态
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

//! # 扫描视图状态
//!
//! [`ScannerViewModel`] 汇总检测结果、提示语和错误信息，以 [`ScanSnapshot`]
//! 的形式通过 `watch` 通道发布给界面层；用户确认某个检测框时通过 `broadcast`
//! 通道发出 [`ScanEvent`]。
//!
//! 所有状态修改都在 `watch` 发送端的锁内完成，`stop()` 之后完成的推理
//! 不会重新填充检测列表。

use std::{
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
  runtime::Handle,
  sync::{OnceCell, broadcast, watch},
  task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  camera::{AuthorizationState, CameraError, CaptureSession, DevicePosition},
  config::ScannerConfig,
  dispatch::{DispatchStats, FrameDispatcher},
  frame::NormalizedRect,
  model::{Detect, DetectionCandidate, LoadDetector, ModelError},
};

/// 界面上的一个检测框，每轮推理重新生成
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub id: Uuid,
  pub label: String,
  pub confidence: f32,
  pub bounding_box: NormalizedRect,
}

impl From<DetectionCandidate> for Detection {
  fn from(candidate: DetectionCandidate) -> Self {
    Self {
      id: Uuid::new_v4(),
      label: candidate.label,
      confidence: candidate.confidence,
      bounding_box: candidate.bounding_box,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSnapshot {
  pub detections: Arc<[Detection]>,
  pub hint_message: String,
  pub error_message: Option<String>,
  pub authorization: AuthorizationState,
  pub is_flashlight_on: bool,
  pub is_front_camera: bool,
  pub is_scanning: bool,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
  ItemConfirmed {
    detection: Detection,
    confirmed_at: DateTime<Utc>,
  },
}

#[derive(Error, Debug)]
pub enum ScanError {
  #[error("camera access not granted ({0:?})")]
  PermissionDenied(AuthorizationState),
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Camera(#[from] CameraError),
}

struct Inner {
  config: ScannerConfig,
  session: CaptureSession,
  loader: Arc<dyn LoadDetector>,
  detector: OnceCell<Arc<dyn Detect>>,
  dispatcher: Mutex<Option<FrameDispatcher>>,
  state: watch::Sender<ScanSnapshot>,
  events: broadcast::Sender<ScanEvent>,
  active: AtomicBool,
  error_token: AtomicU64,
  error_clear: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
  /// 修改快照，并重新推导提示语
  fn update(&self, modify: impl FnOnce(&mut ScanSnapshot)) {
    self.state.send_modify(|snapshot| {
      modify(snapshot);
      snapshot.hint_message = self
        .config
        .hint_for(!snapshot.detections.is_empty())
        .to_string();
    });
  }

  fn refresh_device_status(&self) {
    let status = self.session.status();
    self.update(|snapshot| {
      snapshot.is_flashlight_on = status.device.torch_enabled;
      snapshot.is_front_camera = status.device.position == DevicePosition::Front;
    });
  }

  /// 显示错误；临时错误在延迟后自动清除，除非期间出现了新的错误
  ///
  /// 编号递增、写入错误和替换计时器都在 `error_clear` 锁内完成，
  /// 最后写入的错误总是持有最新的编号和计时器。
  fn show_error(self: &Arc<Self>, message: String, transient: bool) {
    let mut pending = self
      .error_clear
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let token = self.error_token.fetch_add(1, Ordering::AcqRel) + 1;
    self.update(|snapshot| snapshot.error_message = Some(message));

    if let Some(previous) = pending.take() {
      previous.abort();
    }
    *pending = transient.then(|| {
      let inner = Arc::downgrade(self);
      let delay = self.config.error_clear_delay;
      tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
          inner.clear_error(token);
        }
      })
    });
  }

  fn clear_error(&self, token: u64) {
    self.state.send_if_modified(|snapshot| {
      if self.error_token.load(Ordering::Acquire) != token || snapshot.error_message.is_none() {
        return false;
      }
      debug!("自动清除错误信息");
      snapshot.error_message = None;
      true
    });
  }

  fn dismiss_error(&self) {
    let mut pending = self
      .error_clear
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    self.error_token.fetch_add(1, Ordering::AcqRel);
    if let Some(previous) = pending.take() {
      previous.abort();
    }
    self.update(|snapshot| snapshot.error_message = None);
  }

  fn on_result(
    self: &Arc<Self>,
    sequence: u64,
    result: Result<Vec<DetectionCandidate>, ModelError>,
  ) {
    match result {
      Ok(candidates) => {
        let detections: Arc<[Detection]> = candidates.into_iter().map(Detection::from).collect();
        let count = detections.len();
        let published = self.state.send_if_modified(|snapshot| {
          if !self.active.load(Ordering::Acquire) {
            return false;
          }
          snapshot.detections = detections;
          snapshot.hint_message = self.config.hint_for(count > 0).to_string();
          true
        });
        if published {
          debug!("第 {} 帧: 发布 {} 个检测结果", sequence, count);
        } else {
          debug!("扫描已停止，丢弃第 {} 帧的结果", sequence);
        }
      }
      Err(e) => {
        if self.active.load(Ordering::Acquire) {
          self.show_error(format!("Detection failed: {}", e), true);
        }
      }
    }
  }
}

/// 扫描界面的状态与操作
///
/// 克隆得到的句柄共享同一份状态。
#[derive(Clone)]
pub struct ScannerViewModel {
  inner: Arc<Inner>,
}

impl ScannerViewModel {
  pub fn new(
    session: CaptureSession,
    loader: impl LoadDetector + 'static,
    config: ScannerConfig,
  ) -> Self {
    let status = session.status();
    let snapshot = ScanSnapshot {
      detections: Arc::new([]),
      hint_message: config.hint_for(false).to_string(),
      error_message: None,
      authorization: AuthorizationState::NotDetermined,
      is_flashlight_on: status.device.torch_enabled,
      is_front_camera: status.device.position == DevicePosition::Front,
      is_scanning: false,
    };
    let (state, _) = watch::channel(snapshot);
    let (events, _) = broadcast::channel(config.event_capacity.max(1));

    Self {
      inner: Arc::new(Inner {
        config,
        session,
        loader: Arc::new(loader),
        detector: OnceCell::new(),
        dispatcher: Mutex::new(None),
        state,
        events,
        active: AtomicBool::new(false),
        error_token: AtomicU64::new(0),
        error_clear: Mutex::new(None),
      }),
    }
  }

  pub fn snapshot(&self) -> ScanSnapshot {
    self.inner.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ScanSnapshot> {
    self.inner.state.subscribe()
  }

  pub fn events(&self) -> broadcast::Receiver<ScanEvent> {
    self.inner.events.subscribe()
  }

  pub fn detections(&self) -> Arc<[Detection]> {
    Arc::clone(&self.inner.state.borrow().detections)
  }

  pub fn hint_message(&self) -> String {
    self.inner.state.borrow().hint_message.clone()
  }

  pub fn error_message(&self) -> Option<String> {
    self.inner.state.borrow().error_message.clone()
  }

  pub fn session(&self) -> &CaptureSession {
    &self.inner.session
  }

  pub fn dispatch_stats(&self) -> Option<DispatchStats> {
    self
      .inner
      .dispatcher
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(FrameDispatcher::stats)
  }

  /// 申请权限、加载模型、配置并启动相机
  ///
  /// 失败时错误信息写入快照并持续显示，同时返回给调用方。
  pub async fn start(&self) -> Result<(), ScanError> {
    let authorization = self.inner.session.request_permission().await;
    self
      .inner
      .update(|snapshot| snapshot.authorization = authorization);

    if authorization != AuthorizationState::Authorized {
      warn!("相机权限未授予: {:?}", authorization);
      self
        .inner
        .show_error(self.inner.config.permission_message.clone(), false);
      return Err(ScanError::PermissionDenied(authorization));
    }

    if let Err(e) = self.launch().await {
      error!("启动扫描失败: {}", e);
      self
        .inner
        .show_error(format!("Failed to start camera or load model: {}", e), false);
      return Err(e);
    }
    Ok(())
  }

  async fn launch(&self) -> Result<(), ScanError> {
    let detector = self.detector().await?;
    let dispatcher = self.dispatcher(detector);
    self
      .inner
      .session
      .set_frame_handler(dispatcher.frame_handler());

    self.inner.session.configure().await?;
    self.inner.session.start().await?;

    self.inner.active.store(true, Ordering::Release);
    self.inner.dismiss_error();
    self.inner.update(|snapshot| snapshot.is_scanning = true);
    self.inner.refresh_device_status();
    info!("扫描已启动");
    Ok(())
  }

  async fn detector(&self) -> Result<Arc<dyn Detect>, ModelError> {
    let loader = Arc::clone(&self.inner.loader);
    self
      .inner
      .detector
      .get_or_try_init(|| async move {
        info!("加载检测模型");
        tokio::task::spawn_blocking(move || loader.load())
          .await
          .map_err(|e| ModelError::LoadFailed(e.to_string()))?
      })
      .await
      .cloned()
  }

  fn dispatcher(&self, detector: Arc<dyn Detect>) -> FrameDispatcher {
    let mut slot = self
      .inner
      .dispatcher
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    slot
      .get_or_insert_with(|| {
        let inner = Arc::downgrade(&self.inner);
        FrameDispatcher::new(
          detector,
          Handle::current(),
          Arc::new(
            move |sequence: u64, result: Result<Vec<DetectionCandidate>, ModelError>| {
              if let Some(inner) = inner.upgrade() {
                inner.on_result(sequence, result);
              }
            },
          ),
        )
      })
      .clone()
  }

  /// 停止相机并清空检测结果；进行中的推理结果会被丢弃
  pub async fn stop(&self) {
    self.inner.active.store(false, Ordering::Release);
    if let Some(dispatcher) = self
      .inner
      .dispatcher
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
    {
      dispatcher.reset();
    }
    self.inner.session.clear_frame_handler();

    if let Err(e) = self.inner.session.stop().await {
      warn!("停止采集会话失败: {}", e);
    }

    self.inner.update(|snapshot| {
      snapshot.detections = Arc::new([]);
      snapshot.is_scanning = false;
    });
    self.inner.refresh_device_status();
    info!("扫描已停止");
  }

  pub async fn switch_camera(&self) -> Result<DevicePosition, ScanError> {
    let result = self.inner.session.switch_position().await;
    self.inner.refresh_device_status();
    match result {
      Ok(position) => Ok(position),
      Err(e) => {
        warn!("切换镜头失败: {}", e);
        self
          .inner
          .show_error(format!("Failed to switch camera: {}", e), true);
        Err(e.into())
      }
    }
  }

  pub async fn toggle_flashlight(&self) -> Result<bool, ScanError> {
    let result = self.inner.session.toggle_torch().await;
    self.inner.refresh_device_status();
    match result {
      Ok(on) => Ok(on),
      Err(e) => {
        warn!("切换手电筒失败: {}", e);
        self
          .inner
          .show_error(format!("Failed to toggle flashlight: {}", e), true);
        Err(e.into())
      }
    }
  }

  /// 用户点击检测框确认商品；未知的编号返回 false
  pub fn confirm(&self, id: Uuid) -> bool {
    let detection = self
      .inner
      .state
      .borrow()
      .detections
      .iter()
      .find(|detection| detection.id == id)
      .cloned();
    let Some(detection) = detection else {
      debug!("检测框 {} 已不存在", id);
      return false;
    };

    info!("确认商品: {} ({:.2})", detection.label, detection.confidence);
    if self
      .inner
      .events
      .send(ScanEvent::ItemConfirmed {
        detection,
        confirmed_at: Utc::now(),
      })
      .is_err()
    {
      debug!("没有事件订阅者");
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Barrier, thread, time::Duration};

  use async_trait::async_trait;

  use super::*;
  use crate::{camera::SimulatedCamera, frame::PixelBuffer};

  struct OneBox;

  #[async_trait]
  impl Detect for OneBox {
    async fn detect(&self, _frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
      Ok(vec![DetectionCandidate {
        label: "Avocado".to_string(),
        confidence: 0.92,
        bounding_box: NormalizedRect::new(0.2, 0.2, 0.3, 0.3),
      }])
    }
  }

  fn view_model(camera: SimulatedCamera) -> ScannerViewModel {
    let session = CaptureSession::new(camera).unwrap();
    ScannerViewModel::new(
      session,
      || -> Result<Arc<dyn Detect>, ModelError> { Ok(Arc::new(OneBox)) },
      ScannerConfig::default(),
    )
  }

  #[tokio::test]
  async fn hint_follows_detections() {
    let camera = SimulatedCamera::new();
    let probe = camera.probe();
    let view = view_model(camera);
    let mut snapshots = view.subscribe();
    assert_eq!(view.hint_message(), "Align items within the frame");

    view.start().await.unwrap();
    assert!(probe.emit_frame());
    let snapshot = snapshots
      .wait_for(|s| !s.detections.is_empty())
      .await
      .unwrap()
      .clone();
    assert_eq!(snapshot.hint_message, "Tap a box to confirm item");
    assert_eq!(snapshot.detections[0].label, "Avocado");

    view.stop().await;
    assert_eq!(view.hint_message(), "Align items within the frame");
  }

  #[tokio::test]
  async fn confirm_emits_event_for_known_detection() {
    let camera = SimulatedCamera::new();
    let probe = camera.probe();
    let view = view_model(camera);
    let mut events = view.events();
    let mut snapshots = view.subscribe();

    assert!(!view.confirm(Uuid::new_v4()));

    view.start().await.unwrap();
    probe.emit_frame();
    let id = snapshots
      .wait_for(|s| !s.detections.is_empty())
      .await
      .unwrap()
      .detections[0]
      .id;

    assert!(view.confirm(id));
    let ScanEvent::ItemConfirmed { detection, .. } = events.recv().await.unwrap();
    assert_eq!(detection.id, id);
    assert_eq!(detection.label, "Avocado");
  }

  #[tokio::test]
  async fn missing_model_is_a_persistent_error() {
    let session = CaptureSession::new(SimulatedCamera::new()).unwrap();
    let view = ScannerViewModel::new(
      session,
      || -> Result<Arc<dyn Detect>, ModelError> {
        Err(ModelError::NotFound("/models/detector.onnx".into()))
      },
      ScannerConfig::default(),
    );

    let err = view.start().await.unwrap_err();
    assert!(matches!(err, ScanError::Model(ModelError::NotFound(_))));
    assert_eq!(
      view.error_message().as_deref(),
      Some(concat!(
        "Failed to start camera or load model: ",
        "model artifact not found: /models/detector.onnx"
      ))
    );
    assert!(!view.snapshot().is_scanning);
  }

  #[tokio::test]
  async fn flashlight_and_lens_status_are_published() {
    let view = view_model(SimulatedCamera::new());
    view.start().await.unwrap();

    assert!(view.toggle_flashlight().await.unwrap());
    assert!(view.snapshot().is_flashlight_on);

    assert_eq!(view.switch_camera().await.unwrap(), DevicePosition::Front);
    let snapshot = view.snapshot();
    assert!(snapshot.is_front_camera);
    assert!(!snapshot.is_flashlight_on);

    assert!(matches!(
      view.toggle_flashlight().await,
      Err(ScanError::Camera(CameraError::TorchNotAvailable))
    ));
    assert_eq!(
      view.error_message().as_deref(),
      Some("Failed to toggle flashlight: torch is not available on the active camera")
    );
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn simultaneous_transient_errors_still_clear() {
    let session = CaptureSession::new(SimulatedCamera::new()).unwrap();
    let view = ScannerViewModel::new(
      session,
      || -> Result<Arc<dyn Detect>, ModelError> { Ok(Arc::new(OneBox)) },
      ScannerConfig::default().with_error_clear_delay(Duration::from_millis(20)),
    );

    for round in 0..60 {
      let barrier = Arc::new(Barrier::new(2));
      let threads: Vec<_> = ["Detection failed", "Failed to switch camera"]
        .into_iter()
        .map(|prefix| {
          let inner = Arc::clone(&view.inner);
          let barrier = Arc::clone(&barrier);
          let runtime = Handle::current();
          thread::spawn(move || {
            let _guard = runtime.enter();
            barrier.wait();
            inner.show_error(format!("{}: round {}", prefix, round), true);
          })
        })
        .collect();
      for handle in threads {
        handle.join().unwrap();
      }

      tokio::time::sleep(Duration::from_millis(60)).await;
      assert_eq!(view.error_message(), None, "round {}", round);
    }
  }

  #[tokio::test]
  async fn successful_start_dismisses_pending_error() {
    let view = view_model(SimulatedCamera::new());
    view.inner.show_error("Failed to switch camera: busy".to_string(), true);
    assert!(view.error_message().is_some());

    view.start().await.unwrap();
    assert_eq!(view.error_message(), None);
    assert!(
      view
        .inner
        .error_clear
        .lock()
        .unwrap()
        .is_none()
    );
  }
}
