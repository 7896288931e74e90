// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/onnx.rs - 基于 ONNX Runtime 的三种加载策略
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

use std::fs;
use std::path::{Path, PathBuf};

use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::{Tensor, Value};
use tracing::{debug, info};

use crate::frame::{ChannelOrder, PixelArray};
use crate::model::acquire::{LoadStrategy, StrategyError};
use crate::model::source::ModelSource;
use crate::model::yolo::{self, Candidate, DecodeOptions, OutputLayout};
use crate::model::{
  Backend, ClassNames, InferenceError, RawBox, RawResult, ResultShape, StrategyKind,
};

const DETECT_TASK: &str = "detect";

/// 按优先级排列的默认策略链
pub fn default_strategies(source: &ModelSource) -> Vec<Box<dyn LoadStrategy>> {
  vec![
    Box::new(CheckpointStrategy::new(source)),
    Box::new(ManagedStrategy::new(source)),
    Box::new(RegistryStrategy::new(source)),
  ]
}

fn runtime<E: std::fmt::Display>(err: E) -> StrategyError {
  StrategyError::Runtime(err.to_string())
}

fn builder(threads: usize) -> Result<SessionBuilder, StrategyError> {
  Session::builder()
    .map_err(runtime)?
    .with_intra_threads(threads)
    .map_err(runtime)
}

fn metadata(session: &Session, key: &str) -> Option<String> {
  session.metadata().ok()?.custom(key).ok().flatten()
}

/// 导出工具写入的 `imgsz`，形如 `[640, 640]` 或 `640`，只接受正方形输入
pub fn parse_imgsz(text: &str) -> Option<u32> {
  let body = text.trim().trim_start_matches('[').trim_end_matches(']');
  let mut sizes = body.split(',').map(|s| s.trim().parse::<u32>());
  let first = sizes.next()?.ok().filter(|size| *size > 0)?;
  for size in sizes {
    if size.ok()? != first {
      return None;
    }
  }
  Some(first)
}

/// 模型元数据中的权重描述
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMap {
  pub names: Option<ClassNames>,
  pub imgsz: Option<String>,
  pub task: Option<String>,
  pub version: Option<String>,
  pub stride: Option<u32>,
}

impl StateMap {
  fn read(session: &Session) -> Self {
    Self {
      names: metadata(session, "names").and_then(|text| ClassNames::parse(&text)),
      imgsz: metadata(session, "imgsz"),
      task: metadata(session, "task"),
      version: metadata(session, "version"),
      stride: metadata(session, "stride").and_then(|s| s.trim().parse().ok()),
    }
  }

  pub fn is_empty(&self) -> bool {
    self == &StateMap::default()
  }
}

/// 未加载权重的检测头结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseArchitecture {
  pub input_size: u32,
}

impl Default for BaseArchitecture {
  fn default() -> Self {
    Self { input_size: 640 }
  }
}

impl BaseArchitecture {
  /// 把权重描述套用到基础结构上，返回输出排列
  pub fn apply(&self, state: &StateMap) -> Result<OutputLayout, StrategyError> {
    if let Some(task) = &state.task
      && task != DETECT_TASK
    {
      return Err(StrategyError::ArchitectureMismatch(format!(
        "任务类型 {} 不是 {}",
        task, DETECT_TASK
      )));
    }

    if let Some(imgsz) = &state.imgsz {
      match parse_imgsz(imgsz) {
        Some(size) if size == self.input_size => {}
        _ => {
          return Err(StrategyError::ArchitectureMismatch(format!(
            "输入尺寸 {} 与基础结构 {} 不一致",
            imgsz, self.input_size
          )));
        }
      }
    }

    if let Some(stride) = state.stride {
      debug!("权重步长: {}", stride);
    }

    Ok(if state.version.is_some() {
      OutputLayout::AnchorFree
    } else {
      OutputLayout::Anchor
    })
  }
}

/// 包装 ONNX Runtime 会话的推理后端
pub struct OnnxBackend {
  session: Session,
  // None 时按每次输出的维度判断
  layout: Option<OutputLayout>,
  shape: ResultShape,
  names: ClassNames,
  order: ChannelOrder,
  input_size: u32,
  decode: DecodeOptions,
}

impl Backend for OnnxBackend {
  fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  fn run(&mut self, pixels: &PixelArray) -> Result<RawResult, InferenceError> {
    if pixels.is_empty() {
      return Err(InferenceError::EmptyInput {
        width: pixels.width(),
        height: pixels.height(),
      });
    }

    let (data, letterbox) = pixels.letterbox(self.input_size);
    let size = self.input_size as usize;
    let input: Value = Tensor::from_array((vec![1usize, 3, size, size], data.into_boxed_slice()))
      .map(Value::from)
      .map_err(|e| InferenceError::Backend(format!("创建输入张量失败: {}", e)))?;

    let outputs = self
      .session
      .run(ort::inputs![input])
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    let output = outputs
      .get("output0")
      .or_else(|| outputs.get("output"))
      .ok_or_else(|| InferenceError::Backend("缺少输出张量 output0".to_string()))?;
    let (shape, data) = output
      .try_extract_tensor::<f32>()
      .map_err(|e| InferenceError::Backend(format!("读取输出张量失败: {}", e)))?;
    let dims: Vec<i64> = shape.iter().copied().collect();
    debug!("输出张量维度: {:?}", dims);

    let layout = match self.layout {
      Some(layout) => layout,
      None => OutputLayout::resolve(&dims)
        .ok_or_else(|| InferenceError::Backend(format!("无法识别的输出维度: {:?}", dims)))?,
    };

    let candidates = yolo::decode(layout, &dims, data, &self.decode)?;
    let candidates: Vec<Candidate> = candidates
      .into_iter()
      .map(|c| Candidate {
        bbox: letterbox.restore(c.bbox),
        ..c
      })
      .collect();

    Ok(package(self.shape, candidates, self.names.clone()))
  }
}

/// 把解码后的候选框整理成对应形态的原始结果
pub fn package(shape: ResultShape, candidates: Vec<Candidate>, names: ClassNames) -> RawResult {
  match shape {
    ResultShape::PerBox => RawResult::PerBox {
      boxes: candidates
        .into_iter()
        .map(|c| RawBox {
          xyxy: c.bbox,
          conf: c.score,
          cls: c.class_id as f32,
        })
        .collect(),
      names,
    },
    ResultShape::Columnar => {
      let mut boxes = Vec::with_capacity(candidates.len());
      let mut confidences = Vec::with_capacity(candidates.len());
      let mut class_ids = Vec::with_capacity(candidates.len());
      for c in candidates {
        boxes.push(c.bbox);
        confidences.push(c.score);
        class_ids.push(c.class_id as i64);
      }
      RawResult::Columnar {
        boxes,
        confidences,
        class_ids,
        names,
      }
    }
  }
}

/// 自行读取文件字节，把元数据中的权重描述套用到基础结构上
pub struct CheckpointStrategy {
  base: BaseArchitecture,
  threads: usize,
  decode: DecodeOptions,
}

impl CheckpointStrategy {
  pub fn new(source: &ModelSource) -> Self {
    Self {
      base: BaseArchitecture {
        input_size: source.input_size,
      },
      threads: source.intra_threads,
      decode: source.decode,
    }
  }
}

impl LoadStrategy for CheckpointStrategy {
  fn kind(&self) -> StrategyKind {
    StrategyKind::Checkpoint
  }

  fn load(&self, artifact: &Path) -> Result<Box<dyn Backend>, StrategyError> {
    let bytes = fs::read(artifact)?;
    if bytes.is_empty() {
      return Err(StrategyError::InvalidArtifact("模型文件为空".to_string()));
    }

    let session = builder(self.threads)?
      .commit_from_memory(&bytes)
      .map_err(runtime)?;

    let state = StateMap::read(&session);
    if state.is_empty() {
      debug!("模型无权重描述，使用基础结构");
    }
    let layout = self.base.apply(&state)?;
    info!("checkpoint 策略: 输出排列 {:?}", layout);

    Ok(Box::new(OnnxBackend {
      session,
      layout: Some(layout),
      shape: ResultShape::Columnar,
      names: state.names.unwrap_or_default(),
      order: ChannelOrder::Rgb,
      input_size: self.base.input_size,
      decode: self.decode,
    }))
  }
}

/// 交由运行时完成全部优化与加载，输出排列按次判断
pub struct ManagedStrategy {
  threads: usize,
  input_size: u32,
  decode: DecodeOptions,
}

impl ManagedStrategy {
  pub fn new(source: &ModelSource) -> Self {
    Self {
      threads: source.intra_threads,
      input_size: source.input_size,
      decode: source.decode,
    }
  }
}

impl LoadStrategy for ManagedStrategy {
  fn kind(&self) -> StrategyKind {
    StrategyKind::Managed
  }

  fn load(&self, artifact: &Path) -> Result<Box<dyn Backend>, StrategyError> {
    let session = builder(self.threads)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(runtime)?
      .commit_from_file(artifact)
      .map_err(runtime)?;

    let names = metadata(&session, "names")
      .and_then(|text| ClassNames::parse(&text))
      .unwrap_or_default();
    let input_size = metadata(&session, "imgsz")
      .and_then(|text| parse_imgsz(&text))
      .unwrap_or(self.input_size);

    Ok(Box::new(OnnxBackend {
      session,
      layout: None,
      shape: ResultShape::PerBox,
      names,
      order: ChannelOrder::Rgb,
      input_size,
      decode: self.decode,
    }))
  }
}

/// 把模型复制到 hub 缓存目录后加载，已有副本先删除
pub struct RegistryStrategy {
  hub_dir: PathBuf,
  threads: usize,
  input_size: u32,
  decode: DecodeOptions,
}

impl RegistryStrategy {
  pub fn new(source: &ModelSource) -> Self {
    Self {
      hub_dir: source.hub_dir.clone(),
      threads: source.intra_threads,
      input_size: source.input_size,
      decode: source.decode,
    }
  }

  /// 强制刷新 hub 中的副本
  pub fn materialize(&self, artifact: &Path) -> Result<PathBuf, StrategyError> {
    let name = artifact
      .file_name()
      .ok_or_else(|| StrategyError::InvalidArtifact(format!("{}", artifact.display())))?;

    let source = fs::canonicalize(artifact)?;
    fs::create_dir_all(&self.hub_dir)?;
    let cached = fs::canonicalize(&self.hub_dir)?.join(name);

    // hub 目录就是模型所在目录时原地加载，源文件不能被删除
    if cached == source {
      debug!("缓存副本即源文件，原地加载: {}", cached.display());
      return Ok(cached);
    }

    let partial = self
      .hub_dir
      .join(format!(".{}.partial", name.to_string_lossy()));
    fs::copy(&source, &partial)?;
    if cached.exists() {
      debug!("删除旧的缓存副本: {}", cached.display());
      fs::remove_file(&cached)?;
    }
    fs::rename(&partial, &cached)?;

    Ok(cached)
  }
}

impl LoadStrategy for RegistryStrategy {
  fn kind(&self) -> StrategyKind {
    StrategyKind::Registry
  }

  fn load(&self, artifact: &Path) -> Result<Box<dyn Backend>, StrategyError> {
    let cached = self.materialize(artifact)?;
    info!("registry 策略: 从 {} 加载", cached.display());

    let session = builder(self.threads)?
      .commit_from_file(&cached)
      .map_err(runtime)?;
    let names = metadata(&session, "names")
      .and_then(|text| ClassNames::parse(&text))
      .unwrap_or_default();

    Ok(Box::new(OnnxBackend {
      session,
      layout: Some(OutputLayout::Anchor),
      shape: ResultShape::Columnar,
      names,
      order: ChannelOrder::Bgr,
      input_size: self.input_size,
      decode: self.decode,
    }))
  }
}
