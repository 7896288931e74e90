// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/output/directory_record.rs - 按日期分目录的检测记录
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

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::Alert;
use crate::model::Detection;
use crate::output::{
  AlertRecord, DetectionRecord, DetectionStore, RecordId, append_json_line, image_extension,
};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("记录标识无效: {0}")]
  InvalidRecord(String),
}

/// `folder:///dir[?always]`，记录写入 `dir/YYYY/MM/DD/HH-MM-SS-mmm-XXXX.{jpg,json}`
///
/// 同名记录已存在时（如另一进程在同一毫秒写入）序号顺延，已有记录不会被覆盖。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counters: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      frame_counters: Mutex::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counters
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  // 相对于输出目录的记录标识，不含扩展名
  fn record_id(&self, now: &DateTime<Utc>) -> RecordId {
    format!(
      "{}/{:02}/{:02}/{}-{:04X}",
      now.year(),
      now.month(),
      now.day(),
      now.format("%H-%M-%S-%3f"),
      self.frame_id()
    )
  }

  fn record_path(&self, record: &str) -> Result<PathBuf, DirectoryRecordOutputError> {
    if record.is_empty() || record.split('/').any(|part| part == ".." || part.is_empty()) {
      return Err(DirectoryRecordOutputError::InvalidRecord(record.to_string()));
    }
    Ok(self.directory.join(record))
  }

  // 以 create_new 占住记录的 JSON 文件
  fn reserve(
    &self,
    now: &DateTime<Utc>,
  ) -> Result<(RecordId, PathBuf, File), DirectoryRecordOutputError> {
    for _ in 0..=u16::MAX {
      let id = self.record_id(now);
      let path = self.record_path(&id)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
      }

      match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path.with_extension("json"))
      {
        Ok(file) => return Ok((id, path, file)),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
          debug!("记录 {} 已存在，改用下一序号", id);
        }
        Err(err) => return Err(err.into()),
      }
    }
    Err(std::io::Error::from(ErrorKind::AlreadyExists).into())
  }

  fn write_record(
    &self,
    now: DateTime<Utc>,
    detections: &[Detection],
    annotated: &[u8],
  ) -> Result<RecordId, DirectoryRecordOutputError> {
    if !self.always && detections.is_empty() {
      let id = self.record_id(&now);
      debug!("无检测结果，跳过记录 {}", id);
      return Ok(id);
    }

    let (id, path, mut json) = self.reserve(&now)?;

    let image_path = path.with_extension(image_extension(annotated));
    fs::write(&image_path, annotated)?;

    let record = DetectionRecord {
      id: &id,
      timestamp: now.to_rfc3339(),
      image: image_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned()),
      total_detections: detections.len(),
      detections,
    };
    json.write_all(&serde_json::to_vec_pretty(&record)?)?;

    info!("保存检测记录: {}", path.display());
    Ok(id)
  }
}

impl DetectionStore for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn store_detection(
    &self,
    detections: &[Detection],
    annotated: &[u8],
  ) -> Result<RecordId, Self::Error> {
    self.write_record(Utc::now(), detections, annotated)
  }

  fn store_alert(&self, alert: &Alert, record: &RecordId) -> Result<(), Self::Error> {
    let path = self.record_path(record)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }

    append_json_line(
      &path.with_extension("alerts.jsonl"),
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

  fn output(dir: &std::path::Path, query: &str) -> DirectoryRecordOutput {
    let url = url::Url::parse(&format!("folder://{}{}", dir.display(), query)).unwrap();
    DirectoryRecordOutput::from_url(&url).unwrap()
  }

  fn knife() -> Detection {
    Detection {
      class_name: "knife".into(),
      confidence: 0.9,
      bbox: [10, 10, 50, 50],
    }
  }

  #[test]
  fn writes_date_partitioned_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = output(dir.path(), "");
    let image = crate::output::draw::ImageEncoding::default()
      .encode(&image::RgbImage::new(4, 4))
      .unwrap();

    let id = store.store_detection(&[knife()], &image).unwrap();

    let parts: Vec<&str> = id.split('/').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0].len(), 4);
    assert_eq!(parts[3].len(), "00-00-00-000-0001".len());
    assert!(parts[3].ends_with("-0001"));

    let base = dir.path().join(&id);
    assert!(base.with_extension("jpg").exists());
    let json: serde_json::Value =
      serde_json::from_slice(&std::fs::read(base.with_extension("json")).unwrap()).unwrap();
    assert_eq!(json["total_detections"], 1);
    assert_eq!(json["detections"][0]["class"], "knife");
  }

  #[test]
  fn concurrent_writers_never_overwrite_each_other() {
    let dir = tempfile::tempdir().unwrap();
    // 两个独立实例相当于两个进程，序号都从 1 开始
    let first = output(dir.path(), "");
    let second = output(dir.path(), "");
    let now = Utc::now();

    let a = first.write_record(now, &[knife()], b"first").unwrap();
    let b = second.write_record(now, &[knife(), knife()], b"second").unwrap();

    assert_ne!(a, b);
    assert!(a.ends_with("-0001"));
    assert!(b.ends_with("-0002"));

    let read = |id: &str| -> serde_json::Value {
      serde_json::from_slice(&fs::read(dir.path().join(id).with_extension("json")).unwrap())
        .unwrap()
    };
    assert_eq!(read(a.as_str())["id"], a.as_str());
    assert_eq!(read(a.as_str())["total_detections"], 1);
    assert_eq!(read(b.as_str())["total_detections"], 2);
    assert_eq!(fs::read(dir.path().join(&a).with_extension("bin")).unwrap(), b"first");
  }

  #[test]
  fn empty_result_is_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();

    let store = output(dir.path(), "");
    let id = store.store_detection(&[], b"").unwrap();
    assert!(!dir.path().join(&id).with_extension("json").exists());

    let store = output(dir.path(), "?always");
    let id = store.store_detection(&[], b"").unwrap();
    assert!(dir.path().join(&id).with_extension("json").exists());
  }

  #[test]
  fn alerts_are_appended_next_to_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = output(dir.path(), "");
    let id = store.store_detection(&[knife()], b"").unwrap();

    for alert in evaluate(&[knife()]) {
      store.store_alert(&alert, &id).unwrap();
    }

    let text =
      std::fs::read_to_string(dir.path().join(&id).with_extension("alerts.jsonl")).unwrap();
    let lines: Vec<serde_json::Value> = text
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["alert_type"], "weapon_detected");
    assert_eq!(lines[1]["severity"], "critical");
    assert_eq!(lines[1]["record_id"], id.as_str());
  }

  #[test]
  fn rejects_escaping_record_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = output(dir.path(), "");
    let alert = evaluate(&[knife()]).remove(0);

    assert!(matches!(
      store.store_alert(&alert, &"../outside".to_string()),
      Err(DirectoryRecordOutputError::InvalidRecord(_))
    ));
  }
}
