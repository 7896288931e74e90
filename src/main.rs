// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/main.rs - 单张图像武器检测
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use shaobing::{
  FromUrl,
  input::{DEFAULT_MAX_UPLOAD_BYTES, ImageFileInput, UploadLimits},
  model::{BoxPolicy, ModelAcquirer, ModelCache, ModelSource},
  output::{
    OutputWrapper,
    draw::{Draw, ImageEncoding},
  },
  pipeline::{DetectionPipeline, PipelineError, PipelineOutput},
  task::{OneShotTask, Task, TaskError},
};

/// Shaobing 参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件，如 model:///models/best.onnx?conf=0.25
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，如 image:///tmp/photo.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 结果保存位置（image:// 或 folder://），不指定则只打印
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 标签字体（TTF）
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 倒置边界框的处理方式
  #[arg(long, value_enum, default_value_t = BoxPolicy::Swap)]
  pub box_policy: BoxPolicy,
  /// 标注图像编码（jpeg / png）
  #[arg(long, default_value = "jpeg")]
  pub encoding: ImageEncoding,
  /// 上传大小上限（字节）
  #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
  pub max_upload: usize,
  /// 输出 JSON 中省略标注图像
  #[arg(long)]
  pub no_image: bool,
}

fn print_output(output: &PipelineOutput, no_image: bool) -> Result<()> {
  let mut json = serde_json::to_value(output)?;
  if no_image && let Some(object) = json.as_object_mut() {
    object.remove("annotated_image");
  }
  println!("{}", serde_json::to_string_pretty(&json)?);
  Ok(())
}

fn print_error(err: &PipelineError) -> Result<()> {
  error!("检测失败 [{}]: {}", err.code(), err);
  println!("{}", serde_json::to_string_pretty(&err.report())?);
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件: {}", args.model);
  info!("输入来源: {}", args.input);
  if let Some(output) = &args.output {
    info!("输出路径: {}", output);
  }

  let source = ModelSource::from_url(&args.model)?;
  let cache = Arc::new(ModelCache::new(Arc::new(ModelAcquirer::onnx(&source))));
  let pipeline = DetectionPipeline::new(cache, source.path())
    .with_draw(Draw::new(args.font.as_deref()).with_encoding(args.encoding))
    .with_box_policy(args.box_policy)
    .with_upload_limits(UploadLimits {
      max_bytes: args.max_upload,
    });

  info!("模型路径: {}", pipeline.artifact().display());

  let mut input = ImageFileInput::from_url(&args.input)?;

  let Some(url) = &args.output else {
    let bytes = input
      .next()
      .ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    return match pipeline.run(&bytes) {
      Ok(output) => print_output(&output, args.no_image),
      Err(err) => {
        print_error(&err)?;
        Err(err.into())
      }
    };
  };

  let output = OutputWrapper::from_url(url)?;
  match OneShotTask.run_task(input, &pipeline, output) {
    Ok(report) => {
      info!("记录: {}，推理耗时: {:.2?}", report.record, report.elapsed);
      print_output(&report.output, args.no_image)
    }
    Err(TaskError::Pipeline(err)) => {
      print_error(&err)?;
      Err(err.into())
    }
    Err(err) => Err(err.into()),
  }
}
