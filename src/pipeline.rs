// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/pipeline.rs - 单张图像的检测管线
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
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::DynamicImage;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::{self, Alert};
use crate::frame;
use crate::input::{InputError, UploadLimits, decode_upload};
use crate::model::{
  BoxPolicy, CacheState, Detection, InferenceError, ModelCache, ModelLoadError, StrategyAttempt,
};
use crate::output::draw::{AnnotateError, Draw};

/// 一次检测的完整输出
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
  pub detections: Vec<Detection>,
  #[serde(serialize_with = "as_base64")]
  pub annotated_image: Vec<u8>,
  pub alerts: Vec<Alert>,
  pub total_detections: usize,
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&STANDARD.encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
  /// 模型暂不可用，稍后重试
  Later,
  /// 当前图像无法处理，换一张
  DifferentImage,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error(transparent)]
  ModelUnavailable(#[from] ModelLoadError),
  #[error(transparent)]
  InferenceFailed(#[from] InferenceError),
  #[error(transparent)]
  InvalidImage(#[from] InputError),
  #[error(transparent)]
  Annotation(#[from] AnnotateError),
}

impl PipelineError {
  /// 稳定的错误码
  pub fn code(&self) -> &'static str {
    match self {
      PipelineError::ModelUnavailable(_) => "model_unavailable",
      PipelineError::InferenceFailed(_) => "inference_failed",
      PipelineError::InvalidImage(_) => "invalid_image",
      PipelineError::Annotation(_) => "annotation_failed",
    }
  }

  pub fn retry_hint(&self) -> RetryHint {
    match self {
      PipelineError::ModelUnavailable(_) | PipelineError::Annotation(_) => RetryHint::Later,
      PipelineError::InferenceFailed(_) | PipelineError::InvalidImage(_) => {
        RetryHint::DifferentImage
      }
    }
  }

  pub fn report(&self) -> ErrorReport {
    ErrorReport {
      error: self.code(),
      message: self.to_string(),
      retry: self.retry_hint(),
      attempts: match self {
        PipelineError::ModelUnavailable(err) => err.attempts.clone(),
        _ => Vec::new(),
      },
    }
  }
}

/// 错误的结构化形式
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
  pub error: &'static str,
  pub message: String,
  pub retry: RetryHint,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub attempts: Vec<StrategyAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
  pub status: &'static str,
  pub model_loaded: bool,
  pub model_path: String,
  pub model_exists: bool,
  pub cache_state: CacheState,
}

/// 预处理 -> 推理 -> 规范化 -> {标注, 告警}
pub struct DetectionPipeline {
  cache: Arc<ModelCache>,
  artifact: PathBuf,
  draw: Draw,
  policy: BoxPolicy,
  limits: UploadLimits,
}

impl DetectionPipeline {
  pub fn new(cache: Arc<ModelCache>, artifact: impl Into<PathBuf>) -> Self {
    Self {
      cache,
      artifact: artifact.into(),
      draw: Draw::default(),
      policy: BoxPolicy::default(),
      limits: UploadLimits::default(),
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_box_policy(mut self, policy: BoxPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
    self.limits = limits;
    self
  }

  pub fn artifact(&self) -> &Path {
    &self.artifact
  }

  pub fn cache(&self) -> &Arc<ModelCache> {
    &self.cache
  }

  /// 处理上传的原始图像字节
  pub fn run(&self, bytes: &[u8]) -> Result<PipelineOutput, PipelineError> {
    let image = decode_upload(bytes, &self.limits)?;
    self.run_image(&image)
  }

  pub fn run_image(&self, image: &DynamicImage) -> Result<PipelineOutput, PipelineError> {
    let handle = self.cache.get(&self.artifact)?;
    debug!(
      "使用模型: {} ({})",
      handle.artifact().display(),
      handle.strategy()
    );

    let pixels = frame::prepare(image, handle.channel_order());
    let detections = handle.infer(&pixels, self.policy)?;
    debug!("检测数量: {}", detections.len());

    let annotated_image = self.draw.annotate(image, &detections)?;
    let alerts = alert::evaluate(&detections);

    info!(
      "检测完成: {} 个目标, {} 条告警",
      detections.len(),
      alerts.len()
    );

    Ok(PipelineOutput {
      total_detections: detections.len(),
      detections,
      annotated_image,
      alerts,
    })
  }

  pub fn health(&self) -> HealthReport {
    let cache_state = self.cache.state(&self.artifact);
    let model_exists = self.artifact.exists();
    let model_loaded = cache_state == CacheState::Ready;

    HealthReport {
      status: if model_loaded || model_exists {
        "healthy"
      } else {
        "degraded"
      },
      model_loaded,
      model_path: self.artifact.display().to_string(),
      model_exists,
      cache_state,
    }
  }
}
