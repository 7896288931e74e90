// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/task.rs - 检测任务
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

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::output::{DetectionStore, RecordId};
use crate::pipeline::{DetectionPipeline, PipelineError, PipelineOutput};

pub trait Task<I, O>: Sized {
  type Output;
  type Error;
  fn run_task(
    self,
    input: I,
    pipeline: &DetectionPipeline,
    output: O,
  ) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TaskError<E> {
  #[error("没有输入图像")]
  NoInput,
  #[error(transparent)]
  Pipeline(#[from] PipelineError),
  #[error("保存结果失败: {0}")]
  Store(E),
}

/// 一次任务的结果与耗时
#[derive(Debug)]
pub struct TaskReport {
  pub record: RecordId,
  pub output: PipelineOutput,
  pub elapsed: Duration,
}

/// 取第一张图像检测一次，结果与告警交给存储端
pub struct OneShotTask;

impl<I, O, E> Task<I, O> for OneShotTask
where
  I: Iterator<Item = Vec<u8>>,
  O: DetectionStore<Error = E>,
  E: std::fmt::Display,
{
  type Output = TaskReport;
  type Error = TaskError<E>;

  fn run_task(
    self,
    mut input: I,
    pipeline: &DetectionPipeline,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let bytes = input.next().ok_or(TaskError::NoInput)?;
    info!("输入图像获取成功 ({} 字节)，开始推理...", bytes.len());

    let now = Instant::now();
    let result = pipeline.run(&bytes)?;
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}", elapsed);

    let record = output
      .store_detection(&result.detections, &result.annotated_image)
      .map_err(TaskError::Store)?;
    for alert in &result.alerts {
      if let Err(err) = output.store_alert(alert, &record) {
        warn!("告警保存失败: {}", err);
        return Err(TaskError::Store(err));
      }
    }
    info!("记录保存完成: {}，耗时: {:.2?}", record, now.elapsed());

    Ok(TaskReport {
      record,
      output: result,
      elapsed,
    })
  }
}
