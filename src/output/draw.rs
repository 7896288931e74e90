// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/output/draw.rs - 检测结果标注
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

use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Detection;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（无字体时的估计）
const LABEL_TEXT_PADDING: i32 = 2;
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const TEXT_COLOR: [u8; 3] = [0, 0, 0];
const LINE_WIDTH: i32 = 2;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

// 常见系统字体位置，按顺序尝试
const SYSTEM_FONTS: &[&str] = &[
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

/// 标注图像的编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
  Jpeg { quality: u8 },
  Png,
}

impl Default for ImageEncoding {
  fn default() -> Self {
    ImageEncoding::Jpeg {
      quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl FromStr for ImageEncoding {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "jpeg" | "jpg" => Ok(ImageEncoding::default()),
      "png" => Ok(ImageEncoding::Png),
      other => Err(format!("不支持的编码格式: {}", other)),
    }
  }
}

impl ImageEncoding {
  pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, AnnotateError> {
    let mut buffer = Vec::new();
    match self {
      ImageEncoding::Jpeg { quality } => {
        let encoder = JpegEncoder::new_with_quality(&mut buffer, *quality);
        image.write_with_encoder(encoder)?;
      }
      ImageEncoding::Png => {
        image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
      }
    }
    Ok(buffer)
  }
}

fn load_font(path: &Path) -> Option<FontVec> {
  let data = std::fs::read(path).ok()?;
  FontVec::try_from_vec(data).ok()
}

pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_padding: i32,
  font: Option<FontVec>,
  box_color: [u8; 3],
  text_color: [u8; 3],
  line_width: i32,
  encoding: ImageEncoding,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl Draw {
  /// 优先使用给定字体，否则依次尝试系统字体
  pub fn new(font_path: Option<&Path>) -> Self {
    let configured = font_path.and_then(|path| {
      let font = load_font(path);
      if font.is_none() {
        warn!("无法加载字体文件: {}", path.display());
      }
      font
    });
    let font = configured.or_else(|| {
      SYSTEM_FONTS.iter().find_map(|path| {
        let font = load_font(Path::new(path));
        if font.is_some() {
          debug!("使用系统字体: {}", path);
        }
        font
      })
    });
    if font.is_none() {
      warn!("未找到可用字体，标签将只绘制背景");
    }

    Self::with_font(font)
  }

  /// 不加载任何字体，标签只绘制背景，宽度按字符数估计
  pub fn without_font() -> Self {
    Self::with_font(None)
  }

  fn with_font(font: Option<FontVec>) -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_padding: LABEL_TEXT_PADDING,
      font,
      box_color: BOX_COLOR,
      text_color: TEXT_COLOR,
      line_width: LINE_WIDTH,
      encoding: ImageEncoding::default(),
    }
  }

  pub fn with_encoding(mut self, encoding: ImageEncoding) -> Self {
    self.encoding = encoding;
    self
  }

  /// 在图像副本上绘制检测框与标签并编码，输入图像保持不变
  pub fn annotate(
    &self,
    image: &DynamicImage,
    detections: &[Detection],
  ) -> Result<Vec<u8>, AnnotateError> {
    let mut canvas = image.to_rgb8();
    self.draw_detections(&mut canvas, detections);
    self.encoding.encode(&canvas)
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      self.draw_bbox_with_label(image, detection);
    }
  }

  // bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    let (w, h) = (image.width() as i32, image.height() as i32);
    let color = Rgb(self.box_color);

    let bbox = detection.bbox.map(|v| v.min(i32::MAX as u32) as i32);
    let x_min = bbox[0].clamp(0, w - 1);
    let y_min = bbox[1].clamp(0, h - 1);
    let x_max = bbox[2].clamp(0, w - 1);
    let y_max = bbox[3].clamp(0, h - 1);

    let label = format!("{}: {:.2}", detection.class_name, detection.confidence);
    let scale = PxScale::from(self.font_size);

    let text_width = match &self.font {
      Some(font) => text_size(scale, font, &label).0 as i32 + 2 * self.label_text_padding,
      None => (label.chars().count() as f32 * self.label_char_width) as i32,
    };
    let text_height = self.label_text_height;

    // 标签放在边框左上角上方，超出时压回图像内
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;
    let label_height = text_height.min(h - label_y).max(0) as u32;

    if label_width > 0 && label_height > 0 {
      let rect = imageproc::rect::Rect::at(label_x, label_y).of_size(label_width, label_height);
      draw_filled_rect_mut(image, rect, color);

      if let Some(font) = &self.font {
        draw_text_mut(
          image,
          Rgb(self.text_color),
          label_x + self.label_text_padding,
          label_y + self.label_text_padding,
          scale,
          font,
          &label,
        );
      }
    }

    // 边框最后绘制，不被标签覆盖；向内加粗
    for thickness in 0..self.line_width {
      let x_min_t = (x_min + thickness).min(x_max);
      let y_min_t = (y_min + thickness).min(y_max);
      let x_max_t = (x_max - thickness).max(x_min);
      let y_max_t = (y_max - thickness).max(y_min);

      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, color);
        image.put_pixel(x as u32, y_max_t as u32, color);
      }
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, color);
        image.put_pixel(x_max_t as u32, y as u32, color);
      }
    }
  }
}
