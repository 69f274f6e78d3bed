// 该文件是 Kanhuo （看货） 项目的一部分。
// src/model/yolo26.rs - YOLO26 输出解码
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

use tracing::{debug, error};

use crate::model::{DetectItem, InferenceResult};

const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const YOLO26_OBJECT_THRESH: f32 = 0.5;

/// 单个检测头：特征图尺寸与步长
#[derive(Debug, Clone, Copy)]
pub struct Yolo26Head {
  pub map_h: usize,
  pub map_w: usize,
  pub stride: f32,
}

/// YOLO26 无 NMS 输出的解码器
///
/// 每个检测头输出一对张量：回归 `4 x H x W` 与分类 `C x H x W`，
/// 两者的先后顺序依运行时而定，按张量大小区分。
#[derive(Debug, Clone)]
pub struct Yolo26Decoder {
  pub class_num: usize,
  pub input_w: f32,
  pub input_h: f32,
  pub heads: Vec<Yolo26Head>,
  pub object_thresh: f32,
}

impl Default for Yolo26Decoder {
  fn default() -> Self {
    Self {
      class_num: YOLO26_CLASS_NUM,
      input_w: YOLO26_INPUT_W,
      input_h: YOLO26_INPUT_H,
      heads: YOLO26_HEAD_SIZES
        .iter()
        .zip(YOLO26_STRIDES)
        .map(|(&(map_h, map_w), stride)| Yolo26Head {
          map_h,
          map_w,
          stride,
        })
        .collect(),
      object_thresh: YOLO26_OBJECT_THRESH,
    }
  }
}

impl Yolo26Decoder {
  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.object_thresh = threshold;
    self
  }

  /// 模型应有的输出张量个数
  pub fn num_outputs(&self) -> usize {
    self.heads.len() * 2
  }

  /// 解码全部检测头，坐标归一化到 [0, 1]，原点在左上角
  pub fn decode(&self, outputs: &[&[f32]]) -> InferenceResult {
    debug!("后处理模型输出");
    let mut items = Vec::new();

    for (head_idx, head) in self.heads.iter().enumerate() {
      let spatial = head.map_h * head.map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = self.class_num * spatial;

      let output_idx1 = head_idx * 2;
      let output_idx2 = head_idx * 2 + 1;
      let (Some(tensor1), Some(tensor2)) = (outputs.get(output_idx1), outputs.get(output_idx2))
      else {
        error!("检测头 {}: 缺少第 {} / {} 个输出", head_idx, output_idx1, output_idx2);
        continue;
      };

      let Some((reg, cls)) = match_reg_cls_tensors(
        tensor1,
        tensor2,
        reg_expected,
        cls_expected,
        head_idx,
      ) else {
        continue;
      };

      self.decode_head(head, reg, cls, &mut items);
    }

    debug!("检测到 {} 个物体", items.len());
    InferenceResult::top_left(items)
  }

  fn decode_head(&self, head: &Yolo26Head, reg: &[f32], cls: &[f32], items: &mut Vec<DetectItem>) {
    let spatial = head.map_h * head.map_w;

    for h in 0..head.map_h {
      for w in 0..head.map_w {
        let idx = h * head.map_w + w;

        let (score, class_id) = {
          let mut max_logit = f32::MIN;
          let mut cls_idx = 0usize;
          for c in 0..self.class_num {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              cls_idx = c;
            }
          }
          (sigmoid(max_logit), cls_idx as u32)
        };

        if score <= self.object_thresh {
          continue;
        }

        let cx = reg[idx];
        let cy = reg[spatial + idx];
        let cw = reg[2 * spatial + idx];
        let ch = reg[3 * spatial + idx];

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - cx) * head.stride).clamp(0.0, self.input_w);
        let ymin = ((grid_y - cy) * head.stride).clamp(0.0, self.input_h);
        let xmax = ((grid_x + cw) * head.stride).clamp(0.0, self.input_w);
        let ymax = ((grid_y + ch) * head.stride).clamp(0.0, self.input_h);

        if xmax <= xmin || ymax <= ymin {
          continue;
        }

        items.push(DetectItem {
          class_id,
          score,
          bbox: [
            xmin / self.input_w,
            ymin / self.input_h,
            xmax / self.input_w,
            ymax / self.input_h,
          ],
        });
      }
    }
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果大小不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
  head_idx: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((tensor2, tensor1))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx,
      tensor1.len(),
      tensor2.len(),
      reg_expected,
      cls_expected
    );
    None
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
