// 该文件是 Kanhuo （看货） 项目的一部分。
// src/task.rs - 命令行任务
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

use std::{thread, time::Duration};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
  frame::PixelBuffer,
  model::{Detect, DetectionCandidate},
  view::{ScanSnapshot, ScannerViewModel},
};

#[cfg(feature = "save_image_file")]
use crate::output::{Render, SaveImageFileOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn candidates_to_json(candidates: &[DetectionCandidate]) -> Value {
  Value::Array(
    candidates
      .iter()
      .map(|c| {
        json!({
          "label": c.label,
          "confidence": c.confidence,
          "bounding_box": {
            "x": c.bounding_box.x,
            "y": c.bounding_box.y,
            "width": c.bounding_box.width,
            "height": c.bounding_box.height,
          },
        })
      })
      .collect(),
  )
}

pub fn snapshot_to_json(snapshot: &ScanSnapshot) -> Value {
  let detections: Vec<Value> = snapshot
    .detections
    .iter()
    .map(|d| {
      let rect = d.bounding_box;
      json!({
        "id": d.id.to_string(),
        "label": d.label,
        "confidence": d.confidence,
        "bounding_box": [rect.x, rect.y, rect.width, rect.height],
      })
    })
    .collect();

  json!({
    "detections": detections,
    "hint_message": snapshot.hint_message,
    "error_message": snapshot.error_message,
    "is_flashlight_on": snapshot.is_flashlight_on,
    "is_front_camera": snapshot.is_front_camera,
  })
}

/// 对单帧图像推理一次
#[derive(Default)]
pub struct OneShotTask {
  #[cfg(feature = "save_image_file")]
  output: Option<SaveImageFileOutput>,
}

impl OneShotTask {
  #[cfg(feature = "save_image_file")]
  pub fn with_output(mut self, output: Option<SaveImageFileOutput>) -> Self {
    self.output = output;
    self
  }

  pub async fn run(
    self,
    frame: PixelBuffer,
    detector: &dyn Detect,
  ) -> anyhow::Result<Vec<DetectionCandidate>> {
    info!("开始任务...");
    info!("输入帧 {}x{}，开始推理...", frame.width(), frame.height());

    #[cfg(feature = "save_image_file")]
    let overlay = self.output.and_then(|output| match frame.to_rgb_image() {
      Some(image) => Some((output, image)),
      None => {
        warn!("输入帧无法转换为 RGB 图像，跳过结果输出");
        None
      }
    });

    let now = std::time::Instant::now();
    let candidates = detector.detect(frame).await?;
    info!("推理完成，耗时: {:.2?}，检测到 {} 个物体", now.elapsed(), candidates.len());

    #[cfg(feature = "save_image_file")]
    if let Some((output, image)) = overlay {
      output.render_result(&image, &candidates)?;
    }

    Ok(candidates)
  }
}

/// 驱动扫描视图直到收到 Ctrl-C 或处理完指定帧数
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number.filter(|&n| n > 0);
    self
  }

  pub async fn run(self, view: ScannerViewModel) -> anyhow::Result<()> {
    info!("开始任务...");
    let (tx, mut rx) = mpsc::unbounded_channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let mut snapshots = view.subscribe();
    view.start().await?;

    loop {
      tokio::select! {
        changed = snapshots.changed() => {
          if changed.is_err() {
            break;
          }
          let snapshot = snapshots.borrow_and_update().clone();
          info!("{}", snapshot_to_json(&snapshot));
        }
        _ = rx.recv() => {
          warn!("中断信号接收，退出任务循环");
          break;
        }
        _ = tokio::time::sleep(POLL_INTERVAL) => {}
      }

      if let (Some(limit), Some(stats)) = (self.frame_number, view.dispatch_stats())
        && stats.accepted >= limit
      {
        info!("达到指定帧数 {}, 退出任务循环", limit);
        break;
      }
    }

    view.stop().await;
    if let Some(stats) = view.dispatch_stats() {
      info!(
        "共收到 {} 帧，推理 {} 帧，丢弃 {} 帧，失败 {} 次",
        stats.received, stats.accepted, stats.dropped, stats.failures
      );
    }
    info!("任务完成，退出");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;

  use super::*;
  #[cfg(feature = "save_image_file")]
  use crate::FromUrl;
  use crate::{
    frame::{NormalizedRect, PixelFormat},
    model::ModelError,
  };

  struct Shelf;

  #[async_trait]
  impl Detect for Shelf {
    async fn detect(&self, frame: PixelBuffer) -> Result<Vec<DetectionCandidate>, ModelError> {
      assert_eq!(frame.width(), 8);
      Ok(vec![DetectionCandidate {
        label: "Milk Carton".to_string(),
        confidence: 0.5,
        bounding_box: NormalizedRect::new(0.0, 0.25, 0.5, 0.5),
      }])
    }
  }

  #[tokio::test]
  async fn one_shot_returns_candidates() {
    let frame = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 10).unwrap();
    let candidates = OneShotTask::default().run(frame, &Shelf).await.unwrap();
    assert_eq!(candidates.len(), 1);

    let json = candidates_to_json(&candidates);
    assert_eq!(json[0]["label"], "Milk Carton");
    assert_eq!(json[0]["bounding_box"]["y"], 0.25);
  }

  #[cfg(feature = "save_image_file")]
  #[tokio::test]
  async fn one_shot_writes_overlay_image() {
    let path = std::env::temp_dir().join(format!("kanhuo-overlay-{}.png", std::process::id()));
    let url = url::Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let frame = PixelBuffer::filled(8, 8, PixelFormat::Bgra8, 10).unwrap();
    let candidates = OneShotTask::default()
      .with_output(Some(output))
      .run(frame, &Shelf)
      .await
      .unwrap();
    assert_eq!(candidates.len(), 1);

    let overlay = image::open(&path).unwrap().to_rgb8();
    assert_eq!(overlay.dimensions(), (8, 8));
    std::fs::remove_file(&path).unwrap();
  }
}
