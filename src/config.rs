// 该文件是 Kanhuo （看货） 项目的一部分。
// src/config.rs - 扫描界面配置
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

use std::time::Duration;

const IDLE_HINT: &str = "Align items within the frame";
const ACTIVE_HINT: &str = "Tap a box to confirm item";
const PERMISSION_MESSAGE: &str = "Camera access is required to scan items.";
const ERROR_CLEAR_DELAY: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
  /// 没有检测结果时的提示
  pub idle_hint: String,
  /// 有检测结果时的提示
  pub active_hint: String,
  pub permission_message: String,
  /// 临时错误自动清除前的停留时间
  pub error_clear_delay: Duration,
  pub event_capacity: usize,
}

impl Default for ScannerConfig {
  fn default() -> Self {
    Self {
      idle_hint: IDLE_HINT.to_string(),
      active_hint: ACTIVE_HINT.to_string(),
      permission_message: PERMISSION_MESSAGE.to_string(),
      error_clear_delay: ERROR_CLEAR_DELAY,
      event_capacity: EVENT_CAPACITY,
    }
  }
}

impl ScannerConfig {
  pub fn with_error_clear_delay(mut self, delay: Duration) -> Self {
    self.error_clear_delay = delay;
    self
  }

  pub fn hint_for(&self, has_detections: bool) -> &str {
    if has_detections {
      &self.active_hint
    } else {
      &self.idle_hint
    }
  }
}
