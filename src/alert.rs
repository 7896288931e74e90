// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/alert.rs - 告警规则
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

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::Detection;

/// 高置信度告警阈值（严格大于）
pub const HIGH_CONFIDENCE_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
  WeaponDetected,
  HighConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  High,
  Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
  pub alert_type: AlertType,
  pub message: String,
  pub severity: Severity,
}

/// 单条规则：对整组检测结果给出至多一条告警
pub type AlertRule = fn(&[Detection]) -> Option<Alert>;

/// 固定的规则集，按顺序求值
pub const RULES: [AlertRule; 2] = [weapon_detected, high_confidence];

fn weapon_detected(detections: &[Detection]) -> Option<Alert> {
  if detections.is_empty() {
    return None;
  }

  Some(Alert {
    alert_type: AlertType::WeaponDetected,
    message: format!(
      "Weapon detected with {} object(s) found",
      detections.len()
    ),
    severity: Severity::High,
  })
}

fn high_confidence(detections: &[Detection]) -> Option<Alert> {
  let count = detections
    .iter()
    .filter(|d| d.confidence > HIGH_CONFIDENCE_THRESHOLD)
    .count();
  if count == 0 {
    return None;
  }

  Some(Alert {
    alert_type: AlertType::HighConfidence,
    message: format!(
      "High confidence weapon detection: {} object(s) with >80% confidence",
      count
    ),
    severity: Severity::Critical,
  })
}

pub fn evaluate(detections: &[Detection]) -> Vec<Alert> {
  let alerts: Vec<Alert> = RULES.iter().filter_map(|rule| rule(detections)).collect();
  for alert in &alerts {
    info!("告警 [{:?}]: {}", alert.severity, alert.message);
  }
  alerts
}
