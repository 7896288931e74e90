// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像文件
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

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::alert::Alert;
use crate::model::Detection;
use crate::output::{AlertRecord, DetectionRecord, DetectionStore, RecordId, append_json_line};
use crate::{FromUrl, FromUrlWithScheme};

/// `image:///out.jpg`，标注图像写入该路径，检测结果写入同名 `.json`
pub struct SaveImageFileOutput {
  path: PathBuf,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
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
      path: PathBuf::from(uri.path()),
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn ensure_parent(&self) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    Ok(())
  }
}

impl DetectionStore for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn store_detection(
    &self,
    detections: &[Detection],
    annotated: &[u8],
  ) -> Result<RecordId, Self::Error> {
    self.ensure_parent()?;
    std::fs::write(&self.path, annotated)?;

    let id = self.path.display().to_string();
    let record = DetectionRecord {
      id: &id,
      timestamp: Utc::now().to_rfc3339(),
      image: self
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned()),
      total_detections: detections.len(),
      detections,
    };
    std::fs::write(
      self.path.with_extension("json"),
      serde_json::to_vec_pretty(&record)?,
    )?;

    info!("保存图像到文件: {}", self.path.display());
    Ok(id)
  }

  fn store_alert(&self, alert: &Alert, record: &RecordId) -> Result<(), Self::Error> {
    self.ensure_parent()?;
    append_json_line(
      &self.path.with_extension("alerts.jsonl"),
      &AlertRecord {
        record_id: record,
        timestamp: Utc::now().to_rfc3339(),
        alert,
      },
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alert::evaluate;

  #[test]
  fn writes_image_and_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested").join("out.png");
    let url = Url::parse(&format!("image://{}", target.display())).unwrap();
    let store = SaveImageFileOutput::from_url(&url).unwrap();

    let detections = vec![Detection {
      class_name: "pistol".into(),
      confidence: 0.5,
      bbox: [0, 0, 2, 2],
    }];
    let id = store.store_detection(&detections, b"not really a png").unwrap();
    for alert in evaluate(&detections) {
      store.store_alert(&alert, &id).unwrap();
    }

    assert_eq!(std::fs::read(&target).unwrap(), b"not really a png");
    let json: serde_json::Value =
      serde_json::from_slice(&std::fs::read(target.with_extension("json")).unwrap()).unwrap();
    assert_eq!(json["detections"][0]["class"], "pistol");
    let alerts = std::fs::read_to_string(target.with_extension("alerts.jsonl")).unwrap();
    assert_eq!(alerts.lines().count(), 1);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
