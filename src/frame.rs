// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/frame.rs - 推理输入像素帧与预处理
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

use image::{DynamicImage, ImageBuffer, Rgb, RgbImage, imageops};
use serde::{Deserialize, Serialize};

const RGB_CHANNELS: usize = 3;
const LETTERBOX_FILL: u8 = 114;

/// 模型期望的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

/// NHWC 排列的三通道像素数组
#[derive(Debug, Clone)]
pub struct PixelArray {
  width: u32,
  height: u32,
  order: ChannelOrder,
  data: Box<[u8]>,
}

/// 将任意解码后的图像转换为模型所需的三通道像素数组。
///
/// 带 alpha 通道或单通道的图像先转换为 RGB，再按 `order` 调整通道顺序。
/// 输入图像不会被修改。
pub fn prepare(image: &DynamicImage, order: ChannelOrder) -> PixelArray {
  let rgb = image.to_rgb8();
  let (width, height) = rgb.dimensions();
  let mut data = rgb.into_raw();

  if order == ChannelOrder::Bgr {
    for pixel in data.chunks_exact_mut(RGB_CHANNELS) {
      pixel.swap(0, 2);
    }
  }

  PixelArray {
    width,
    height,
    order,
    data: data.into_boxed_slice(),
  }
}

impl PixelArray {
  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = ((y * self.width + x) as usize) * RGB_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  /// 等比缩放到 `size`×`size` 画布（灰色填充），输出 NCHW 排列、归一化到 [0,1] 的张量
  pub fn letterbox(&self, size: u32) -> (Vec<f32>, Letterbox) {
    let size = size.max(1);
    let letterbox = Letterbox::fit(self.width, self.height, size);

    let source: RgbImage = ImageBuffer::from_fn(self.width, self.height, |x, y| Rgb(self.pixel(x, y)));
    let resized = imageops::resize(
      &source,
      letterbox.scaled_width,
      letterbox.scaled_height,
      imageops::FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    // HWC -> CHW
    let plane = (size as usize) * (size as usize);
    let mut tensor = vec![0f32; plane * RGB_CHANNELS];
    for (idx, pixel) in canvas.pixels().enumerate() {
      for c in 0..RGB_CHANNELS {
        tensor[c * plane + idx] = pixel[c] as f32 / 255.0;
      }
    }

    (tensor, letterbox)
  }
}

/// 等比缩放参数，用于把模型空间的坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: u32,
  pub pad_y: u32,
  pub scaled_width: u32,
  pub scaled_height: u32,
}

impl Letterbox {
  /// `size` 为 0 时按 1 处理
  pub fn fit(width: u32, height: u32, size: u32) -> Self {
    let size = size.max(1);
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    Self {
      scale,
      pad_x: (size - scaled_width) / 2,
      pad_y: (size - scaled_height) / 2,
      scaled_width,
      scaled_height,
    }
  }

  /// [x_min, y_min, x_max, y_max]，模型输入空间 -> 原图像素空间
  pub fn restore(&self, bbox: [f32; 4]) -> [f32; 4] {
    [
      (bbox[0] - self.pad_x as f32) / self.scale,
      (bbox[1] - self.pad_y as f32) / self.scale,
      (bbox[2] - self.pad_x as f32) / self.scale,
      (bbox[3] - self.pad_y as f32) / self.scale,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{GrayImage, Luma, Rgba, RgbaImage};

  #[test]
  fn bgr_swaps_red_and_blue() {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));

    let rgb = prepare(&image, ChannelOrder::Rgb);
    let bgr = prepare(&image, ChannelOrder::Bgr);

    assert_eq!(rgb.pixel(1, 1), [10, 20, 30]);
    assert_eq!(bgr.pixel(1, 1), [30, 20, 10]);
    assert_eq!(bgr.order(), ChannelOrder::Bgr);
  }

  #[test]
  fn alpha_and_gray_become_three_channels() {
    let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 1, Rgba([1, 2, 3, 4])));
    let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 3, Luma([7])));

    let rgba = prepare(&rgba, ChannelOrder::Rgb);
    let gray = prepare(&gray, ChannelOrder::Bgr);

    assert_eq!(rgba.as_nhwc().len(), 3 * 3);
    assert_eq!(rgba.pixel(2, 0), [1, 2, 3]);
    assert_eq!(gray.as_nhwc().len(), 3 * 3);
    assert_eq!(gray.pixel(0, 2), [7, 7, 7]);
  }

  #[test]
  fn prepare_leaves_source_untouched() {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([1, 2, 3])));
    let _ = prepare(&image, ChannelOrder::Bgr);
    assert_eq!(image.to_rgb8().get_pixel(0, 0), &Rgb([1, 2, 3]));
  }

  #[test]
  fn letterbox_pads_the_short_side() {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
    let pixels = prepare(&image, ChannelOrder::Rgb);

    let (tensor, letterbox) = pixels.letterbox(64);

    assert_eq!(tensor.len(), 3 * 64 * 64);
    assert_eq!(letterbox.scaled_width, 64);
    assert_eq!(letterbox.scaled_height, 32);
    assert_eq!(letterbox.pad_x, 0);
    assert_eq!(letterbox.pad_y, 16);

    // 填充区为灰色，图像区红色通道饱和
    let plane = 64 * 64;
    assert!((tensor[0] - LETTERBOX_FILL as f32 / 255.0).abs() < 1e-6);
    let inside = 32 * 64 + 32;
    assert!((tensor[inside] - 1.0).abs() < 1e-6);
    assert!(tensor[plane + inside].abs() < 1e-6);
  }

  #[test]
  fn restore_maps_back_to_source_pixels() {
    let letterbox = Letterbox::fit(200, 100, 64);
    let restored = letterbox.restore([0.0, 16.0, 64.0, 48.0]);
    assert!((restored[0] - 0.0).abs() < 1e-3);
    assert!((restored[1] - 0.0).abs() < 1e-3);
    assert!((restored[2] - 200.0).abs() < 1e-3);
    assert!((restored[3] - 100.0).abs() < 1e-3);
  }

  #[test]
  fn zero_input_size_does_not_panic() {
    let letterbox = Letterbox::fit(10, 10, 0);
    assert_eq!(letterbox.scaled_width, 1);
    assert_eq!(letterbox.pad_x, 0);

    let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
    let (tensor, _) = prepare(&image, ChannelOrder::Rgb).letterbox(0);
    assert_eq!(tensor.len(), 3);
  }
}
