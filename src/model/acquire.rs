// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/acquire.rs - 模型加载策略链
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

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::model::{Backend, ModelHandle, StrategyKind};

/// 单个加载策略：给定模型文件路径，返回可用的推理后端
pub trait LoadStrategy: Send + Sync {
  fn kind(&self) -> StrategyKind;
  fn load(&self, artifact: &Path) -> Result<Box<dyn Backend>, StrategyError>;
}

/// 模型获取：策略链或测试替身
pub trait Acquire: Send + Sync {
  fn acquire(&self, artifact: &Path) -> Result<ModelHandle, ModelLoadError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
  #[error("读取模型文件失败: {0}")]
  Io(String),
  #[error("推理运行时错误: {0}")]
  Runtime(String),
  #[error("模型结构不匹配: {0}")]
  ArchitectureMismatch(String),
  #[error("模型文件无效: {0}")]
  InvalidArtifact(String),
  #[error("加载过程崩溃: {0}")]
  Panicked(String),
}

impl From<std::io::Error> for StrategyError {
  fn from(err: std::io::Error) -> Self {
    StrategyError::Io(err.to_string())
  }
}

impl StrategyError {
  pub fn kind(&self) -> &'static str {
    match self {
      StrategyError::Io(_) => "io",
      StrategyError::Runtime(_) => "runtime",
      StrategyError::ArchitectureMismatch(_) => "architecture_mismatch",
      StrategyError::InvalidArtifact(_) => "invalid_artifact",
      StrategyError::Panicked(_) => "panic",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
  pub kind: &'static str,
  pub message: String,
}

/// 一次策略尝试的诊断记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
  pub strategy: StrategyKind,
  pub failure: Option<AttemptFailure>,
  pub elapsed: Duration,
}

impl StrategyAttempt {
  pub fn succeeded(&self) -> bool {
    self.failure.is_none()
  }
}

impl std::fmt::Display for StrategyAttempt {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.failure {
      None => write!(f, "{}: 成功 ({:.2?})", self.strategy, self.elapsed),
      Some(failure) => write!(
        f,
        "{}: 失败 [{}] {} ({:.2?})",
        self.strategy, failure.kind, failure.message, self.elapsed
      ),
    }
  }
}

/// 所有策略均失败
#[derive(Error, Debug, Clone)]
#[error("模型不可用: {} 的所有加载策略均失败 ({} 次尝试)", .path.display(), .attempts.len())]
pub struct ModelLoadError {
  pub path: PathBuf,
  pub attempts: Vec<StrategyAttempt>,
}

/// 按优先级依次尝试的加载策略链，首个成功的策略即返回
pub struct ModelAcquirer {
  strategies: Vec<Box<dyn LoadStrategy>>,
}

impl ModelAcquirer {
  pub fn new(strategies: Vec<Box<dyn LoadStrategy>>) -> Self {
    Self { strategies }
  }

  pub fn with_strategy(mut self, strategy: impl LoadStrategy + 'static) -> Self {
    self.strategies.push(Box::new(strategy));
    self
  }

  /// ONNX Runtime 的三种加载方式：checkpoint、managed、registry
  #[cfg(feature = "onnx_runtime")]
  pub fn onnx(source: &crate::model::ModelSource) -> Self {
    Self::new(crate::model::onnx::default_strategies(source))
  }

  /// 不短路地尝试每一个策略，只返回诊断
  pub fn probe(&self, artifact: &Path) -> Vec<StrategyAttempt> {
    self
      .strategies
      .iter()
      .map(|strategy| attempt(strategy.as_ref(), artifact).0)
      .collect()
  }
}

impl Acquire for ModelAcquirer {
  fn acquire(&self, artifact: &Path) -> Result<ModelHandle, ModelLoadError> {
    info!("加载模型文件: {}", artifact.display());
    if !artifact.exists() {
      warn!("模型文件不存在: {}", artifact.display());
    }

    let mut attempts = Vec::with_capacity(self.strategies.len());
    for strategy in &self.strategies {
      let (record, backend) = attempt(strategy.as_ref(), artifact);
      attempts.push(record);

      if let Some(backend) = backend {
        info!("模型加载完成，策略: {}", strategy.kind());
        return Ok(ModelHandle::new(
          strategy.kind(),
          artifact,
          backend,
          attempts,
        ));
      }
    }

    error!("所有加载策略均失败: {}", artifact.display());
    for record in &attempts {
      error!("  - {}", record);
    }

    Err(ModelLoadError {
      path: artifact.to_path_buf(),
      attempts,
    })
  }
}

// 每个策略单独运行，panic 也被转换为该策略的失败
fn attempt(
  strategy: &dyn LoadStrategy,
  artifact: &Path,
) -> (StrategyAttempt, Option<Box<dyn Backend>>) {
  let kind = strategy.kind();
  let now = Instant::now();
  let outcome = panic::catch_unwind(AssertUnwindSafe(|| strategy.load(artifact)))
    .unwrap_or_else(|payload| Err(StrategyError::Panicked(panic_message(payload))));
  let elapsed = now.elapsed();

  match outcome {
    Ok(backend) => (
      StrategyAttempt {
        strategy: kind,
        failure: None,
        elapsed,
      },
      Some(backend),
    ),
    Err(err) => {
      warn!("策略 {} 加载失败: {}，耗时: {:.2?}", kind, err, elapsed);
      (
        StrategyAttempt {
          strategy: kind,
          failure: Some(AttemptFailure {
            kind: err.kind(),
            message: err.to_string(),
          }),
          elapsed,
        },
        None,
      )
    }
  }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    msg.to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "未知 panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{ChannelOrder, PixelArray};
  use crate::model::{ClassNames, InferenceError, RawResult};
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct NullBackend;

  impl Backend for NullBackend {
    fn channel_order(&self) -> ChannelOrder {
      ChannelOrder::Bgr
    }

    fn run(&mut self, _pixels: &PixelArray) -> Result<RawResult, InferenceError> {
      Ok(RawResult::Columnar {
        boxes: Vec::new(),
        confidences: Vec::new(),
        class_ids: Vec::new(),
        names: ClassNames::new(),
      })
    }
  }

  enum Behaviour {
    Succeed,
    Fail(StrategyError),
    Panic,
  }

  struct FakeStrategy {
    kind: StrategyKind,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
  }

  impl FakeStrategy {
    fn new(kind: StrategyKind, behaviour: Behaviour) -> (Self, Arc<AtomicUsize>) {
      let calls = Arc::new(AtomicUsize::new(0));
      (
        Self {
          kind,
          behaviour,
          calls: calls.clone(),
        },
        calls,
      )
    }
  }

  impl LoadStrategy for FakeStrategy {
    fn kind(&self) -> StrategyKind {
      self.kind
    }

    fn load(&self, _artifact: &Path) -> Result<Box<dyn Backend>, StrategyError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match &self.behaviour {
        Behaviour::Succeed => Ok(Box::new(NullBackend)),
        Behaviour::Fail(err) => Err(err.clone()),
        Behaviour::Panic => panic!("部分加载后崩溃"),
      }
    }
  }

  #[test]
  fn falls_through_to_registry() {
    let (checkpoint, _) = FakeStrategy::new(
      StrategyKind::Checkpoint,
      Behaviour::Fail(StrategyError::ArchitectureMismatch("imgsz 320 != 640".into())),
    );
    let (managed, _) = FakeStrategy::new(
      StrategyKind::Managed,
      Behaviour::Fail(StrategyError::Runtime("unsupported opset".into())),
    );
    let (registry, _) = FakeStrategy::new(StrategyKind::Registry, Behaviour::Succeed);

    let acquirer = ModelAcquirer::new(Vec::new())
      .with_strategy(checkpoint)
      .with_strategy(managed)
      .with_strategy(registry);

    let handle = acquirer.acquire(Path::new("weights.onnx")).unwrap();

    assert_eq!(handle.strategy(), StrategyKind::Registry);
    assert_eq!(handle.channel_order(), ChannelOrder::Bgr);
    let attempts = handle.attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(
      attempts[0].failure.as_ref().map(|f| f.kind),
      Some("architecture_mismatch")
    );
    assert_eq!(attempts[1].failure.as_ref().map(|f| f.kind), Some("runtime"));
    assert!(attempts[2].succeeded());
  }

  #[test]
  fn exhaustion_reports_every_attempt_in_order() {
    let acquirer = ModelAcquirer::new(Vec::new())
      .with_strategy(
        FakeStrategy::new(
          StrategyKind::Checkpoint,
          Behaviour::Fail(StrategyError::Io("not found".into())),
        )
        .0,
      )
      .with_strategy(
        FakeStrategy::new(
          StrategyKind::Managed,
          Behaviour::Fail(StrategyError::InvalidArtifact("truncated".into())),
        )
        .0,
      )
      .with_strategy(
        FakeStrategy::new(
          StrategyKind::Registry,
          Behaviour::Fail(StrategyError::Runtime("hub offline".into())),
        )
        .0,
      );

    let err = acquirer.acquire(Path::new("weights.onnx")).unwrap_err();

    assert_eq!(err.path, PathBuf::from("weights.onnx"));
    let order: Vec<_> = err.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(
      order,
      vec![
        StrategyKind::Checkpoint,
        StrategyKind::Managed,
        StrategyKind::Registry
      ]
    );
    assert!(err.attempts.iter().all(|a| !a.succeeded()));
  }

  #[test]
  fn first_success_short_circuits() {
    let (checkpoint, first) = FakeStrategy::new(StrategyKind::Checkpoint, Behaviour::Succeed);
    let (managed, second) = FakeStrategy::new(StrategyKind::Managed, Behaviour::Succeed);

    let acquirer = ModelAcquirer::new(vec![Box::new(checkpoint), Box::new(managed)]);
    let handle = acquirer.acquire(Path::new("weights.onnx")).unwrap();

    assert_eq!(handle.strategy(), StrategyKind::Checkpoint);
    assert_eq!(handle.attempts().len(), 1);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn panicking_strategy_does_not_stop_the_chain() {
    let acquirer = ModelAcquirer::new(Vec::new())
      .with_strategy(FakeStrategy::new(StrategyKind::Checkpoint, Behaviour::Panic).0)
      .with_strategy(FakeStrategy::new(StrategyKind::Managed, Behaviour::Succeed).0);

    let handle = acquirer.acquire(Path::new("weights.onnx")).unwrap();

    assert_eq!(handle.strategy(), StrategyKind::Managed);
    let failure = handle.attempts()[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, "panic");
    assert!(failure.message.contains("部分加载后崩溃"));
  }

  #[test]
  fn probe_runs_every_strategy() {
    let (checkpoint, first) = FakeStrategy::new(StrategyKind::Checkpoint, Behaviour::Succeed);
    let (registry, last) = FakeStrategy::new(
      StrategyKind::Registry,
      Behaviour::Fail(StrategyError::Io("gone".into())),
    );
    let acquirer = ModelAcquirer::new(vec![Box::new(checkpoint), Box::new(registry)]);

    let attempts = acquirer.probe(Path::new("weights.onnx"));

    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].succeeded());
    assert!(!attempts[1].succeeded());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(last.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn load_error_message_names_the_artifact() {
    let err = ModelLoadError {
      path: PathBuf::from("/models/best.onnx"),
      attempts: Vec::new(),
    };
    assert!(err.to_string().contains("/models/best.onnx"));
  }
}
