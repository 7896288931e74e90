// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/output.rs - 检测记录与告警的持久化
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

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "directory_record"))]
use crate::FromUrlWithScheme;
use crate::alert::Alert;
use crate::model::Detection;

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

/// 存储端分配的记录标识
pub type RecordId = String;

/// 持久化协作方：核心只写不读
pub trait DetectionStore {
  type Error;

  /// 保存一次检测的结果与标注图像，返回记录标识
  fn store_detection(
    &self,
    detections: &[Detection],
    annotated: &[u8],
  ) -> Result<RecordId, Self::Error>;

  /// 保存一条归属于某记录的告警
  fn store_alert(&self, alert: &Alert, record: &RecordId) -> Result<(), Self::Error>;
}

/// 检测记录的 JSON 形式
#[derive(Debug, Serialize)]
pub(crate) struct DetectionRecord<'a> {
  pub id: &'a str,
  pub timestamp: String,
  pub image: Option<String>,
  pub total_detections: usize,
  pub detections: &'a [Detection],
}

#[derive(Debug, Serialize)]
pub(crate) struct AlertRecord<'a> {
  pub record_id: &'a str,
  pub timestamp: String,
  #[serde(flatten)]
  pub alert: &'a Alert,
}

/// 根据编码内容推断文件扩展名
pub(crate) fn image_extension(bytes: &[u8]) -> &'static str {
  image::guess_format(bytes)
    .ok()
    .and_then(|format| format.extensions_str().first().copied())
    .unwrap_or("bin")
}

/// 以 JSON Lines 追加一条记录
pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
  let line = serde_json::to_string(value)?;
  let mut file = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)?;
  writeln!(file, "{}", line)
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl DetectionStore for OutputWrapper {
  type Error = OutputError;

  fn store_detection(
    &self,
    detections: &[Detection],
    annotated: &[u8],
  ) -> Result<RecordId, Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .store_detection(detections, annotated)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .store_detection(detections, annotated)
        .map_err(OutputError::from),
    }
  }

  fn store_alert(&self, alert: &Alert, record: &RecordId) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .store_alert(alert, record)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .store_alert(alert, record)
        .map_err(OutputError::from),
    }
  }
}
