// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/bin/model_probe.rs - 模型加载诊断
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

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use shaobing::{
  FromUrl,
  model::{ModelAcquirer, ModelSource, StrategyAttempt},
};

/// 逐一尝试每个加载策略并输出诊断
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件，如 model:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 以 JSON 输出诊断
  #[arg(long)]
  pub json: bool,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
  path: String,
  exists: bool,
  size_bytes: Option<u64>,
  attempts: Vec<StrategyAttempt>,
  loadable: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let source = ModelSource::from_url(&args.model)?;
  let path = source.path();

  info!("模型文件: {}", path.display());
  let size_bytes = std::fs::metadata(path).ok().map(|m| m.len());
  if size_bytes.is_none() {
    warn!("模型文件不存在");
  }

  let acquirer = ModelAcquirer::onnx(&source);
  let attempts = acquirer.probe(path);
  let report = ProbeReport {
    path: path.display().to_string(),
    exists: path.exists(),
    size_bytes,
    loadable: attempts.iter().any(StrategyAttempt::succeeded),
    attempts,
  };

  if args.json {
    println!("{}", serde_json::to_string_pretty(&report)?);
  } else {
    println!("模型文件: {}", report.path);
    println!("文件存在: {}", report.exists);
    if let Some(size) = report.size_bytes {
      println!("文件大小: {:.2} MB", size as f64 / (1024.0 * 1024.0));
    }
    for attempt in &report.attempts {
      println!("  - {}", attempt);
    }
  }

  if report.loadable {
    info!("至少一个策略可以加载该模型");
  } else {
    error!("所有加载策略均失败");
    anyhow::bail!("模型不可加载: {}", report.path);
  }

  Ok(())
}
