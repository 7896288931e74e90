// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/source.rs - 模型文件来源与解码参数
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

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::model::yolo::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD, DecodeOptions};
use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_INTRA_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("模型路径为空")]
  EmptyPath,
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
}

/// `model:///path/to/weights.onnx?conf=0.25&iou=0.45&size=640&threads=4&hub=/tmp/hub`
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
  pub path: PathBuf,
  pub input_size: u32,
  pub intra_threads: usize,
  pub decode: DecodeOptions,
  pub hub_dir: PathBuf,
}

impl ModelSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      input_size: DEFAULT_INPUT_SIZE,
      intra_threads: DEFAULT_INTRA_THREADS,
      decode: DecodeOptions {
        confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        iou_threshold: DEFAULT_IOU_THRESHOLD,
      },
      hub_dir: std::env::temp_dir().join("shaobing-hub"),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl FromUrlWithScheme for ModelSource {
  const SCHEME: &'static str = "model";
}

impl FromUrl for ModelSource {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SourceError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let path = url.path();
    if path.is_empty() || path == "/" {
      return Err(SourceError::EmptyPath);
    }

    let mut source = ModelSource::new(path);
    for (key, value) in url.query_pairs() {
      match &*key {
        "conf" => source.decode.confidence_threshold = parse_unit(&key, &value)?,
        "iou" => source.decode.iou_threshold = parse_unit(&key, &value)?,
        "size" => source.input_size = parse_positive(&key, &value)?,
        "threads" => source.intra_threads = parse_positive(&key, &value)?,
        "hub" => source.hub_dir = PathBuf::from(value.as_ref()),
        _ => {}
      }
    }

    Ok(source)
  }
}

fn invalid(key: &str, value: &str) -> SourceError {
  SourceError::InvalidParameter {
    key: key.to_string(),
    value: value.to_string(),
  }
}

fn parse_unit(key: &str, value: &str) -> Result<f32, SourceError> {
  match value.parse::<f32>() {
    Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
    _ => Err(invalid(key, value)),
  }
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, SourceError>
where
  T: std::str::FromStr + PartialOrd + Default,
{
  match value.parse::<T>() {
    Ok(v) if v > T::default() => Ok(v),
    _ => Err(invalid(key, value)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_path_and_defaults() {
    let url = Url::parse("model:///opt/models/best.onnx").unwrap();
    let source = ModelSource::from_url(&url).unwrap();

    assert_eq!(source.path(), Path::new("/opt/models/best.onnx"));
    assert_eq!(source.input_size, 640);
    assert_eq!(source.intra_threads, 4);
    assert_eq!(source.decode.confidence_threshold, 0.25);
    assert_eq!(source.decode.iou_threshold, 0.45);
  }

  #[test]
  fn parses_query_parameters() {
    let url =
      Url::parse("model:///m.onnx?conf=0.4&iou=0.5&size=320&threads=2&hub=/var/cache/hub").unwrap();
    let source = ModelSource::from_url(&url).unwrap();

    assert_eq!(source.decode.confidence_threshold, 0.4);
    assert_eq!(source.decode.iou_threshold, 0.5);
    assert_eq!(source.input_size, 320);
    assert_eq!(source.intra_threads, 2);
    assert_eq!(source.hub_dir, PathBuf::from("/var/cache/hub"));
  }

  #[test]
  fn rejects_other_schemes_and_bad_values() {
    let url = Url::parse("image:///m.onnx").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(SourceError::SchemeMismatch { .. })
    ));

    let url = Url::parse("model:///m.onnx?conf=1.5").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(SourceError::InvalidParameter { .. })
    ));

    let url = Url::parse("model:///m.onnx?size=0").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(SourceError::InvalidParameter { .. })
    ));

    let url = Url::parse("model:///").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(SourceError::EmptyPath)
    ));
  }
}
