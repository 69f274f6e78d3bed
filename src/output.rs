// 该文件是 Kanhuo （看货） 项目的一部分。
// src/output.rs - 检测结果输出
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

use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::NormalizedRect,
  model::DetectionCandidate,
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

const BOX_THICKNESS: i32 = 2;
const CONFIDENCE_BAR_HEIGHT: u32 = 4;
const PALETTE: [[u8; 3]; 6] = [
  [0, 0, 255],
  [255, 64, 64],
  [0, 200, 0],
  [255, 160, 0],
  [200, 0, 200],
  [0, 200, 200],
];

/// 在图像上画检测框，框上方的色条长度表示置信度
#[derive(Debug, Clone)]
pub struct Draw {
  thickness: i32,
  bar_height: u32,
  palette: Vec<[u8; 3]>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      bar_height: CONFIDENCE_BAR_HEIGHT,
      palette: PALETTE.to_vec(),
    }
  }
}

impl Draw {
  /// 同一标签总是同一种颜色
  fn color_for(&self, label: &str) -> Rgb<u8> {
    let hash = label
      .bytes()
      .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    Rgb(self.palette[hash % self.palette.len()])
  }

  fn pixel_rect(image: &RgbImage, rect: &NormalizedRect) -> Option<(i32, i32, u32, u32)> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x_min = (rect.x * w).floor() as i32;
    let y_min = (rect.y * h).floor() as i32;
    let x_max = ((rect.max_x() * w).ceil() as i32).min(image.width() as i32 - 1);
    let y_max = ((rect.max_y() * h).ceil() as i32).min(image.height() as i32 - 1);
    if x_min >= x_max || y_min >= y_max {
      return None;
    }
    Some((
      x_min,
      y_min,
      (x_max - x_min + 1) as u32,
      (y_max - y_min + 1) as u32,
    ))
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[DetectionCandidate]) {
    for detection in detections {
      let Some((x, y, width, height)) = Self::pixel_rect(image, &detection.bounding_box) else {
        continue;
      };
      let color = self.color_for(&detection.label);

      for t in 0..self.thickness {
        let (w, h) = (width as i32 - 2 * t, height as i32 - 2 * t);
        if w <= 0 || h <= 0 {
          break;
        }
        draw_hollow_rect_mut(image, Rect::at(x + t, y + t).of_size(w as u32, h as u32), color);
      }

      let bar_width = (width as f32 * detection.confidence).round() as u32;
      let bar_y = (y - self.bar_height as i32).max(0);
      if bar_width > 0 {
        draw_filled_rect_mut(
          image,
          Rect::at(x, bar_y).of_size(bar_width, self.bar_height),
          color,
        );
      }
    }
  }
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 保存带检测框的图像，`image:///path/to/overlay.png`
pub struct SaveImageFileOutput {
  path: String,
  draw: Draw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      draw: Draw::default(),
    })
  }
}

impl SaveImageFileOutput {
  fn save_image(&self, image: RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    info!("保存图像到文件: {}", self.path);
    Ok(())
  }
}

impl Render<RgbImage, Vec<DetectionCandidate>> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &RgbImage,
    result: &Vec<DetectionCandidate>,
  ) -> Result<(), Self::Error> {
    let mut image = frame.clone();
    self.draw.draw_detections(&mut image, result);
    self.save_image(image)
  }
}
