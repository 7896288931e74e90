// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/yolo.rs - YOLO 输出张量解码
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

use thiserror::Error;
use tracing::debug;

use crate::model::InferenceError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 检测头输出排列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
  /// [1, N, 5 + C]：cx, cy, w, h, objectness, 各类别分数
  Anchor,
  /// [1, 4 + C, N]：cx, cy, w, h, 各类别分数
  AnchorFree,
}

impl OutputLayout {
  /// 根据输出维度判断排列方式，候选框数量总是远大于特征数
  pub fn resolve(dims: &[i64]) -> Option<Self> {
    match dims {
      [_, a, b] if *a > 0 && *b > 0 => Some(if a < b {
        OutputLayout::AnchorFree
      } else {
        OutputLayout::Anchor
      }),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
}

impl Default for DecodeOptions {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
    }
  }
}

/// 解码后的候选框，坐标仍在模型输入空间
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub score: f32,
  pub class_id: usize,
}

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("输出维度无效: {0:?}")]
  InvalidShape(Vec<i64>),
  #[error("输出数据长度不匹配: 期望 {expected}, 实际 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

impl From<DecodeError> for InferenceError {
  fn from(err: DecodeError) -> Self {
    InferenceError::Backend(err.to_string())
  }
}

/// 解码检测头输出并执行 NMS，结果按置信度降序
pub fn decode(
  layout: OutputLayout,
  dims: &[i64],
  data: &[f32],
  options: &DecodeOptions,
) -> Result<Vec<Candidate>, DecodeError> {
  let (rows, features) = match (layout, dims) {
    (OutputLayout::Anchor, [_, n, f]) if *n >= 0 && *f >= 6 => (*n as usize, *f as usize),
    (OutputLayout::AnchorFree, [_, f, n]) if *n >= 0 && *f >= 5 => (*n as usize, *f as usize),
    _ => return Err(DecodeError::InvalidShape(dims.to_vec())),
  };

  let expected = rows * features;
  if data.len() < expected {
    return Err(DecodeError::LengthMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 只取第一个批次
  let value = |row: usize, feature: usize| match layout {
    OutputLayout::Anchor => data[row * features + feature],
    OutputLayout::AnchorFree => data[feature * rows + row],
  };
  let class_offset = match layout {
    OutputLayout::Anchor => 5,
    OutputLayout::AnchorFree => 4,
  };

  let mut candidates = Vec::new();
  for row in 0..rows {
    let objectness = match layout {
      OutputLayout::Anchor => value(row, 4),
      OutputLayout::AnchorFree => 1.0,
    };
    if objectness < options.confidence_threshold {
      continue;
    }

    // 找到最高类别分数
    let mut max_class_score = f32::MIN;
    let mut max_class_id = 0usize;
    for class_id in 0..(features - class_offset) {
      let score = value(row, class_offset + class_id);
      if score > max_class_score {
        max_class_score = score;
        max_class_id = class_id;
      }
    }

    let score = objectness * max_class_score;
    if score < options.confidence_threshold {
      continue;
    }

    let (cx, cy, w, h) = (value(row, 0), value(row, 1), value(row, 2), value(row, 3));
    candidates.push(Candidate {
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      score,
      class_id: max_class_id,
    });
  }

  debug!("NMS 前候选框数量: {}", candidates.len());
  Ok(nms(candidates, options.iou_threshold))
}

/// 按类别的非极大值抑制
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  // 按置信度降序排序
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == candidate.class_id && iou(kept, &candidate) >= iou_threshold);
    if !suppressed {
      result.push(candidate);
    }
  }

  result
}

/// 计算两个边界框的 IoU
fn iou(a: &Candidate, b: &Candidate) -> f32 {
  let x1 = a.bbox[0].max(b.bbox[0]);
  let y1 = a.bbox[1].max(b.bbox[1]);
  let x2 = a.bbox[2].min(b.bbox[2]);
  let y2 = a.bbox[3].min(b.bbox[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a.bbox[2] - a.bbox[0]) * (a.bbox[3] - a.bbox[1]);
  let area_b = (b.bbox[2] - b.bbox[0]) * (b.bbox[3] - b.bbox[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // 两个类别的 anchor 排列：cx, cy, w, h, obj, c0, c1
  fn anchor_rows(rows: &[[f32; 7]]) -> (Vec<i64>, Vec<f32>) {
    (
      vec![1, rows.len() as i64, 7],
      rows.iter().flatten().copied().collect(),
    )
  }

  #[test]
  fn resolve_layout_from_dims() {
    assert_eq!(
      OutputLayout::resolve(&[1, 84, 8400]),
      Some(OutputLayout::AnchorFree)
    );
    assert_eq!(
      OutputLayout::resolve(&[1, 25200, 85]),
      Some(OutputLayout::Anchor)
    );
    assert_eq!(OutputLayout::resolve(&[1, 84]), None);
  }

  #[test]
  fn anchor_layout_filters_and_suppresses() {
    let (dims, data) = anchor_rows(&[
      [30.0, 30.0, 40.0, 40.0, 0.9, 0.95, 0.1],
      [31.0, 31.0, 40.0, 40.0, 0.9, 0.80, 0.1],
      [30.0, 30.0, 40.0, 40.0, 0.9, 0.10, 0.70],
      [100.0, 100.0, 10.0, 10.0, 0.1, 0.99, 0.0],
    ]);

    let out = decode(OutputLayout::Anchor, &dims, &data, &DecodeOptions::default()).unwrap();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].class_id, 0);
    assert!((out[0].score - 0.855).abs() < 1e-4);
    assert_eq!(out[0].bbox, [10.0, 10.0, 50.0, 50.0]);
    assert_eq!(out[1].class_id, 1);
  }

  #[test]
  fn anchor_free_layout_is_feature_major() {
    // 6 个特征（4 + 2 类）× 3 个候选框
    let dims = vec![1, 6, 3];
    let data = vec![
      20.0, 200.0, 0.0, // cx
      20.0, 200.0, 0.0, // cy
      10.0, 20.0, 0.0, // w
      10.0, 20.0, 0.0, // h
      0.1, 0.6, 0.0, // class 0
      0.9, 0.2, 0.0, // class 1
    ];

    let out = decode(OutputLayout::AnchorFree, &dims, &data, &DecodeOptions::default()).unwrap();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].class_id, 1);
    assert_eq!(out[0].bbox, [15.0, 15.0, 25.0, 25.0]);
    assert_eq!(out[1].class_id, 0);
    assert_eq!(out[1].bbox, [190.0, 190.0, 210.0, 210.0]);
  }

  #[test]
  fn rejects_short_buffers_and_bad_shapes() {
    assert!(matches!(
      decode(OutputLayout::Anchor, &[1, 2, 7], &[0.0; 7], &DecodeOptions::default()),
      Err(DecodeError::LengthMismatch { expected: 14, actual: 7 })
    ));
    assert!(matches!(
      decode(OutputLayout::Anchor, &[1, 2], &[], &DecodeOptions::default()),
      Err(DecodeError::InvalidShape(_))
    ));
  }

  #[test]
  fn empty_output_decodes_to_nothing() {
    let out = decode(OutputLayout::AnchorFree, &[1, 6, 0], &[], &DecodeOptions::default()).unwrap();
    assert!(out.is_empty());
  }
}
