// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model.rs - 模型句柄、检测结果与推理接口
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

use std::collections::HashMap;
use std::iter::Peekable;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::Chars;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{ChannelOrder, PixelArray};

pub mod acquire;
pub mod cache;
pub mod normalize;
#[cfg(feature = "onnx_runtime")]
pub mod onnx;
pub mod source;
pub mod yolo;

pub use self::acquire::{
  Acquire, LoadStrategy, ModelAcquirer, ModelLoadError, StrategyAttempt, StrategyError,
};
pub use self::cache::{CacheState, ModelCache};
pub use self::normalize::{BoxPolicy, NormalizationWarning, Normalized, normalize};
pub use self::source::{ModelSource, SourceError};

/// 规范化后的检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  #[serde(rename = "class")]
  pub class_name: String,
  pub confidence: f32,
  pub bbox: [u32; 4], // [x_min, y_min, x_max, y_max]
}

/// 加载策略标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
  Checkpoint,
  Managed,
  Registry,
}

impl StrategyKind {
  pub fn identifier(&self) -> &'static str {
    match self {
      StrategyKind::Checkpoint => "checkpoint",
      StrategyKind::Managed => "managed",
      StrategyKind::Registry => "registry",
    }
  }

  /// 该策略加载的模型返回的结果形态
  pub fn result_shape(&self) -> ResultShape {
    match self {
      StrategyKind::Managed => ResultShape::PerBox,
      StrategyKind::Checkpoint | StrategyKind::Registry => ResultShape::Columnar,
    }
  }
}

impl std::fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.identifier())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
  /// 逐框返回 xyxy / conf / cls
  PerBox,
  /// 框、置信度、类别 id 三个并列数组
  Columnar,
}

/// 类别 id 到类别名的映射
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassNames(HashMap<i64, String>);

impl ClassNames {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, id: i64, name: impl Into<String>) {
    self.0.insert(id, name.into());
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// 查不到时返回 `Class_{id}`
  pub fn resolve(&self, id: i64) -> String {
    self
      .0
      .get(&id)
      .cloned()
      .unwrap_or_else(|| format!("Class_{}", id))
  }

  /// 解析模型元数据中的类别表。
  ///
  /// 同时接受 JSON 对象 `{"0": "knife"}` 与导出工具写入的字面量 `{0: 'knife', 1: 'pistol'}`。
  pub fn parse(text: &str) -> Option<Self> {
    if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(text) {
      let mut names = ClassNames::new();
      for (id, name) in map {
        names.insert(id.trim().parse().ok()?, name);
      }
      return Some(names);
    }

    let body = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut chars = body.chars().peekable();
    let mut names = ClassNames::new();
    loop {
      let id = literal_token(&mut chars)?;
      let Some(id) = id else { break };
      if chars.next() != Some(':') {
        return None;
      }
      let id = id.trim().parse().ok()?;
      let name = literal_token(&mut chars)??;
      names.insert(id, name);
      match chars.next() {
        Some(',') => continue,
        None => break,
        Some(_) => return None,
      }
    }
    Some(names)
  }
}

// 读取一个引号字符串或裸值；输入耗尽时返回 Some(None)
fn literal_token(chars: &mut Peekable<Chars<'_>>) -> Option<Option<String>> {
  while chars.next_if(|c| c.is_whitespace()).is_some() {}

  let token = match chars.peek().copied() {
    None => return Some(None),
    Some(quote @ ('\'' | '"')) => {
      chars.next();
      let mut token = String::new();
      loop {
        match chars.next()? {
          '\\' => token.push(chars.next()?),
          c if c == quote => break,
          c => token.push(c),
        }
      }
      token
    }
    Some(_) => {
      let mut token = String::new();
      while let Some(c) = chars.next_if(|c| *c != ',' && *c != ':') {
        token.push(c);
      }
      let token = token.trim().to_string();
      if token.is_empty() {
        return None;
      }
      token
    }
  };

  while chars.next_if(|c| c.is_whitespace()).is_some() {}
  Some(Some(token))
}

impl<S: Into<String>> FromIterator<(i64, S)> for ClassNames {
  fn from_iter<I: IntoIterator<Item = (i64, S)>>(iter: I) -> Self {
    ClassNames(iter.into_iter().map(|(id, name)| (id, name.into())).collect())
  }
}

/// 逐框结果中的单个框
#[derive(Debug, Clone, PartialEq)]
pub struct RawBox {
  pub xyxy: [f32; 4],
  pub conf: f32,
  pub cls: f32,
}

/// 单次推理的原始结果，随即交给规范化层并丢弃
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
  PerBox {
    boxes: Vec<RawBox>,
    names: ClassNames,
  },
  Columnar {
    boxes: Vec<[f32; 4]>,
    confidences: Vec<f32>,
    class_ids: Vec<i64>,
    names: ClassNames,
  },
}

impl RawResult {
  pub fn shape(&self) -> ResultShape {
    match self {
      RawResult::PerBox { .. } => ResultShape::PerBox,
      RawResult::Columnar { .. } => ResultShape::Columnar,
    }
  }
}

#[derive(Error, Debug, Clone)]
pub enum InferenceError {
  #[error("推理执行失败: {0}")]
  Backend(String),
  #[error("输入图像为空: {width}x{height}")]
  EmptyInput { width: u32, height: u32 },
  #[error("结果形态不匹配: 期望 {expected:?}, 实际 {found:?}")]
  ShapeMismatch {
    expected: ResultShape,
    found: ResultShape,
  },
}

/// 推理后端：对预处理后的像素执行检测，返回与加载策略对应的原始结果
pub trait Backend: Send {
  fn channel_order(&self) -> ChannelOrder;
  fn run(&mut self, pixels: &PixelArray) -> Result<RawResult, InferenceError>;
}

/// 已加载模型的句柄，创建后不再变更
pub struct ModelHandle {
  strategy: StrategyKind,
  artifact: PathBuf,
  channel_order: ChannelOrder,
  attempts: Vec<StrategyAttempt>,
  // 后端运行需要独占访问，推理在此串行
  backend: Mutex<Box<dyn Backend>>,
}

impl std::fmt::Debug for ModelHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModelHandle")
      .field("strategy", &self.strategy)
      .field("artifact", &self.artifact)
      .field("channel_order", &self.channel_order)
      .field("attempts", &self.attempts)
      .finish_non_exhaustive()
  }
}

impl ModelHandle {
  pub fn new(
    strategy: StrategyKind,
    artifact: impl Into<PathBuf>,
    backend: Box<dyn Backend>,
    attempts: Vec<StrategyAttempt>,
  ) -> Self {
    Self {
      strategy,
      artifact: artifact.into(),
      channel_order: backend.channel_order(),
      attempts,
      backend: Mutex::new(backend),
    }
  }

  pub fn strategy(&self) -> StrategyKind {
    self.strategy
  }

  pub fn artifact(&self) -> &Path {
    &self.artifact
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.channel_order
  }

  /// 获取该句柄时所有策略的尝试记录（含成功的那一次）
  pub fn attempts(&self) -> &[StrategyAttempt] {
    &self.attempts
  }

  /// 执行推理并把原始结果规范化为检测序列
  pub fn infer(
    &self,
    pixels: &PixelArray,
    policy: BoxPolicy,
  ) -> Result<Vec<Detection>, InferenceError> {
    let raw = {
      // 后端 panic 转为推理错误，句柄保持可用
      let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
      panic::catch_unwind(AssertUnwindSafe(|| backend.run(pixels))).unwrap_or_else(|payload| {
        Err(InferenceError::Backend(format!(
          "推理过程崩溃: {}",
          acquire::panic_message(payload)
        )))
      })?
    };

    let Normalized {
      detections,
      warnings,
    } = normalize(self.strategy.result_shape(), raw, policy)?;

    for warning in &warnings {
      warn!("检测结果规范化: {}", warning);
    }
    debug!("规范化后检测数: {}", detections.len());

    Ok(detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_resolve_falls_back_to_synthetic_label() {
    let names: ClassNames = [(0, "knife")].into_iter().collect();
    assert_eq!(names.resolve(0), "knife");
    assert_eq!(names.resolve(7), "Class_7");
  }

  #[test]
  fn names_parse_python_literal() {
    let names = ClassNames::parse("{0: 'knife', 1: 'pistol'}").unwrap();
    assert_eq!(names.len(), 2);
    assert_eq!(names.resolve(1), "pistol");
  }

  #[test]
  fn names_parse_quoted_separators() {
    let names =
      ClassNames::parse(r#"{0: 'knife, kitchen', 1: "box:cutter", 2: 'it\'s'}"#).unwrap();
    assert_eq!(names.len(), 3);
    assert_eq!(names.resolve(0), "knife, kitchen");
    assert_eq!(names.resolve(1), "box:cutter");
    assert_eq!(names.resolve(2), "it's");
    assert!(ClassNames::parse("{}").unwrap().is_empty());
    assert!(ClassNames::parse("{0: 'knife}").is_none());
  }

  #[test]
  fn names_parse_json_object() {
    let names = ClassNames::parse(r#"{"0": "knife", "3": "rifle"}"#).unwrap();
    assert_eq!(names.resolve(3), "rifle");
  }

  #[test]
  fn names_parse_rejects_garbage() {
    assert!(ClassNames::parse("not a map").is_none());
    assert!(ClassNames::parse("{x: 'knife'}").is_none());
  }

  #[test]
  fn strategy_selects_result_shape() {
    assert_eq!(StrategyKind::Managed.result_shape(), ResultShape::PerBox);
    assert_eq!(StrategyKind::Checkpoint.result_shape(), ResultShape::Columnar);
    assert_eq!(StrategyKind::Registry.result_shape(), ResultShape::Columnar);
  }

  struct PanicOnce {
    runs: usize,
  }

  impl Backend for PanicOnce {
    fn channel_order(&self) -> ChannelOrder {
      ChannelOrder::Rgb
    }

    fn run(&mut self, _pixels: &PixelArray) -> Result<RawResult, InferenceError> {
      self.runs += 1;
      if self.runs == 1 {
        panic!("tensor shape exploded");
      }
      Ok(RawResult::PerBox {
        boxes: vec![RawBox {
          xyxy: [1.0, 2.0, 3.0, 4.0],
          conf: 0.9,
          cls: 0.0,
        }],
        names: [(0, "knife")].into_iter().collect(),
      })
    }
  }

  #[test]
  fn backend_panic_becomes_error_and_handle_stays_usable() {
    let handle = ModelHandle::new(
      StrategyKind::Managed,
      "/models/best.onnx",
      Box::new(PanicOnce { runs: 0 }),
      vec![],
    );
    let image = image::DynamicImage::new_rgb8(4, 4);
    let pixels = crate::frame::prepare(&image, handle.channel_order());

    let err = handle.infer(&pixels, BoxPolicy::default()).unwrap_err();
    assert!(matches!(&err, InferenceError::Backend(msg) if msg.contains("tensor shape exploded")));

    let detections = handle.infer(&pixels, BoxPolicy::default()).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_name, "knife");
    assert_eq!(handle.artifact(), Path::new("/models/best.onnx"));
  }

  #[test]
  fn detection_serializes_like_the_api() {
    let detection = Detection {
      class_name: "knife".into(),
      confidence: 0.5,
      bbox: [1, 2, 3, 4],
    };
    let json = serde_json::to_value(&detection).unwrap();
    assert_eq!(json["class"], "knife");
    assert_eq!(json["bbox"], serde_json::json!([1, 2, 3, 4]));
  }
}
