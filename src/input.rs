// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/input.rs - 图像输入
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

use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

/// 上传大小上限：16 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
  pub max_bytes: usize,
}

impl Default for UploadLimits {
  fn default() -> Self {
    Self {
      max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
    }
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("上传内容为空")]
  EmptyUpload,
  #[error("上传内容过大: {size} 字节，上限 {limit} 字节")]
  TooLarge { size: usize, limit: usize },
  #[error("图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
}

/// 校验并解码上传的图像字节
pub fn decode_upload(bytes: &[u8], limits: &UploadLimits) -> Result<DynamicImage, InputError> {
  if bytes.is_empty() {
    return Err(InputError::EmptyUpload);
  }
  if bytes.len() > limits.max_bytes {
    return Err(InputError::TooLarge {
      size: bytes.len(),
      limit: limits.max_bytes,
    });
  }

  let image = image::load_from_memory(bytes)?;
  debug!(
    "解码上传图像: {}x{}, {:?}",
    image.width(),
    image.height(),
    image.color()
  );
  Ok(image)
}
