// 该文件是 Kanhuo （看货） 项目的一部分。
// src/frame.rs - 相机帧与归一化坐标定义
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

use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  Rgb8,
  Bgr8,
  Bgra8,
}

impl PixelFormat {
  pub fn bytes_per_pixel(self) -> usize {
    match self {
      PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
      PixelFormat::Bgra8 => 4,
    }
  }

  /// 每个像素中 R、G、B 的字节偏移
  fn rgb_offsets(self) -> [usize; 3] {
    match self {
      PixelFormat::Rgb8 => [0, 1, 2],
      PixelFormat::Bgr8 | PixelFormat::Bgra8 => [2, 1, 0],
    }
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
}

/// 单帧相机图像
///
/// 帧不可克隆：所有权从采集端转移到分发循环，再转移到推理，
/// 推理结束或被丢弃时即释放。
#[derive(Debug)]
pub struct PixelBuffer {
  width: u32,
  height: u32,
  format: PixelFormat,
  data: Box<[u8]>,
  sequence: u64,
  captured_at: Instant,
}

impl PixelBuffer {
  pub fn new(
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    let expected = width as usize * height as usize * format.bytes_per_pixel();
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      format,
      data: data.into_boxed_slice(),
      sequence: 0,
      captured_at: Instant::now(),
    })
  }

  /// 纯色帧，模拟相机和测试使用
  pub fn filled(
    width: u32,
    height: u32,
    format: PixelFormat,
    value: u8,
  ) -> Result<Self, FrameError> {
    let size = width as usize * height as usize * format.bytes_per_pixel();
    Self::new(width, height, format, vec![value; size])
  }

  pub fn with_sequence(mut self, sequence: u64) -> Self {
    self.sequence = sequence;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn captured_at(&self) -> Instant {
    self.captured_at
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 转换为紧凑排列的 RGB NHWC 数据
  pub fn to_rgb_nhwc(&self) -> Vec<u8> {
    if self.format == PixelFormat::Rgb8 {
      return self.data.to_vec();
    }

    let bpp = self.format.bytes_per_pixel();
    let [r, g, b] = self.format.rgb_offsets();
    let pixels = self.width as usize * self.height as usize;
    let mut out = Vec::with_capacity(pixels * 3);
    for px in self.data.chunks_exact(bpp) {
      out.extend_from_slice(&[px[r], px[g], px[b]]);
    }
    out
  }

  #[cfg(any(feature = "read_image_file", feature = "save_image_file"))]
  pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
    image::RgbImage::from_raw(self.width, self.height, self.to_rgb_nhwc())
  }
}

#[cfg(any(feature = "read_image_file", feature = "save_image_file"))]
impl From<image::RgbImage> for PixelBuffer {
  fn from(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      format: PixelFormat::Rgb8,
      data: image.into_raw().into_boxed_slice(),
      sequence: 0,
      captured_at: Instant::now(),
    }
  }
}

/// 归一化矩形，坐标原点在左上角，取值范围 (0,0)-(1,1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl NormalizedRect {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
    .clamped()
  }

  /// 由 [x_min, y_min, x_max, y_max] 构造
  pub fn from_corners(corners: [f32; 4]) -> Self {
    let [x_min, y_min, x_max, y_max] = corners;
    Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
  }

  /// 由左下角原点的矩形转换，只在模型边界处调用一次
  pub fn from_bottom_left_origin(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self::new(x, 1.0 - y - height, width, height)
  }

  pub fn max_x(&self) -> f32 {
    self.x + self.width
  }

  pub fn max_y(&self) -> f32 {
    self.y + self.height
  }

  pub fn clamped(self) -> Self {
    let sanitize = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let x = sanitize(self.x);
    let y = sanitize(self.y);
    let max_x = sanitize(self.x + self.width).max(x);
    let max_y = sanitize(self.y + self.height).max(y);
    Self {
      x,
      y,
      width: max_x - x,
      height: max_y - y,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_mismatched_buffer() {
    let err = PixelBuffer::new(2, 2, PixelFormat::Bgra8, vec![0; 12]).unwrap_err();
    assert!(matches!(
      err,
      FrameError::SizeMismatch {
        expected: 16,
        actual: 12
      }
    ));
  }

  #[test]
  fn bgra_converts_to_rgb() {
    let frame =
      PixelBuffer::new(1, 2, PixelFormat::Bgra8, vec![1, 2, 3, 255, 4, 5, 6, 255]).unwrap();
    assert_eq!(frame.to_rgb_nhwc(), vec![3, 2, 1, 6, 5, 4]);
  }

  #[test]
  fn bottom_left_origin_is_flipped() {
    let rect = NormalizedRect::from_bottom_left_origin(0.1, 0.2, 0.3, 0.4);
    assert!((rect.y - 0.4).abs() < 1e-6);
    assert!((rect.height - 0.4).abs() < 1e-6);
    assert!((rect.x - 0.1).abs() < 1e-6);
  }

  #[test]
  fn rect_is_clamped_to_unit_square() {
    let rect = NormalizedRect::new(-0.2, 0.5, 0.6, 0.9);
    assert_eq!(rect.x, 0.0);
    assert!((rect.width - 0.4).abs() < 1e-6);
    assert!((rect.max_y() - 1.0).abs() < 1e-6);

    let nan = NormalizedRect::new(f32::NAN, 0.0, 0.5, 0.5);
    assert_eq!(nan.x, 0.0);
  }
}
