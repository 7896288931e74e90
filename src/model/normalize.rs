// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/normalize.rs - 原始推理结果规范化
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

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ClassNames, Detection, InferenceError, RawBox, RawResult, ResultShape};

/// 反向框（x1>x2 或 y1>y2）的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BoxPolicy {
  /// 交换坐标后保留
  #[default]
  Swap,
  /// 丢弃该检测
  Drop,
  /// 反向的轴收缩为较小坐标处的零长度
  Clamp,
}

impl FromStr for BoxPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "swap" => Ok(BoxPolicy::Swap),
      "drop" => Ok(BoxPolicy::Drop),
      "clamp" => Ok(BoxPolicy::Clamp),
      other => Err(format!("未知的反向框策略: {}", other)),
    }
  }
}

/// 单个检测在规范化时出现的问题，均在本地处理，不会上升为调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationWarning {
  #[error("第 {index} 个框坐标反向，按 {policy:?} 处理")]
  InvertedBox { index: usize, policy: BoxPolicy },
  #[error("第 {index} 个框置信度 {value} 超出 [0,1]，已截断")]
  ConfidenceClamped { index: usize, value: f32 },
  #[error("第 {index} 个框无法解析（{reason}），已丢弃")]
  Unparseable { index: usize, reason: &'static str },
  #[error("并列数组长度不一致: 框 {boxes}, 置信度 {confidences}, 类别 {class_ids}")]
  LengthMismatch {
    boxes: usize,
    confidences: usize,
    class_ids: usize,
  },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
  pub detections: Vec<Detection>,
  pub warnings: Vec<NormalizationWarning>,
}

/// 按句柄策略给出的形态解析原始结果，输出顺序与模型给出的顺序一致
pub fn normalize(
  shape: ResultShape,
  raw: RawResult,
  policy: BoxPolicy,
) -> Result<Normalized, InferenceError> {
  if raw.shape() != shape {
    return Err(InferenceError::ShapeMismatch {
      expected: shape,
      found: raw.shape(),
    });
  }

  let mut out = Normalized::default();

  match raw {
    RawResult::PerBox { boxes, names } => {
      for (index, RawBox { xyxy, conf, cls }) in boxes.into_iter().enumerate() {
        if !cls.is_finite() {
          out.warnings.push(NormalizationWarning::Unparseable {
            index,
            reason: "类别 id 非有限值",
          });
          continue;
        }
        if let Some(detection) =
          canonical(index, xyxy, conf, cls as i64, &names, policy, &mut out.warnings)
        {
          out.detections.push(detection);
        }
      }
    }
    RawResult::Columnar {
      boxes,
      confidences,
      class_ids,
      names,
    } => {
      if boxes.len() != confidences.len() || boxes.len() != class_ids.len() {
        out.warnings.push(NormalizationWarning::LengthMismatch {
          boxes: boxes.len(),
          confidences: confidences.len(),
          class_ids: class_ids.len(),
        });
      }

      let paired = boxes.into_iter().zip(confidences).zip(class_ids);
      for (index, ((xyxy, conf), class_id)) in paired.enumerate() {
        if let Some(detection) =
          canonical(index, xyxy, conf, class_id, &names, policy, &mut out.warnings)
        {
          out.detections.push(detection);
        }
      }
    }
  }

  Ok(out)
}

fn canonical(
  index: usize,
  xyxy: [f32; 4],
  conf: f32,
  class_id: i64,
  names: &ClassNames,
  policy: BoxPolicy,
  warnings: &mut Vec<NormalizationWarning>,
) -> Option<Detection> {
  if xyxy.iter().any(|v| !v.is_finite()) {
    warnings.push(NormalizationWarning::Unparseable {
      index,
      reason: "坐标非有限值",
    });
    return None;
  }
  if conf.is_nan() {
    warnings.push(NormalizationWarning::Unparseable {
      index,
      reason: "置信度为 NaN",
    });
    return None;
  }

  let confidence = if (0.0..=1.0).contains(&conf) {
    conf
  } else {
    warnings.push(NormalizationWarning::ConfidenceClamped { index, value: conf });
    conf.clamp(0.0, 1.0)
  };

  let [x1, y1, x2, y2] = xyxy.map(to_pixel);
  let bbox = if x1 > x2 || y1 > y2 {
    warnings.push(NormalizationWarning::InvertedBox { index, policy });
    match policy {
      BoxPolicy::Swap => [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
      BoxPolicy::Drop => return None,
      BoxPolicy::Clamp => {
        let (x1, x2) = if x1 > x2 { (x2, x2) } else { (x1, x2) };
        let (y1, y2) = if y1 > y2 { (y2, y2) } else { (y1, y2) };
        [x1, y1, x2, y2]
      }
    }
  } else {
    [x1, y1, x2, y2]
  };

  Some(Detection {
    class_name: names.resolve(class_id),
    confidence,
    bbox,
  })
}

// 截断取整后限制为非负
fn to_pixel(value: f32) -> u32 {
  value.trunc().max(0.0) as u32
}
