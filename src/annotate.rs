use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;
use rusttype::{point, Font, Scale};

use crate::error::{ContractError, Result};
use crate::stamp::{stamp_rgba, BoundingBox, PageMode};

// Shipped with the crate so annotation does not depend on host fonts.
const FONT_BYTES: &[u8] = include_bytes!("../fonts/DejaVuSans.ttf");

// Raster pixels per PDF point. 3x keeps small annotation text legible.
const RASTER_SCALE: f64 = 3.0;
const FONT_SIZE_PT: f32 = 9.0;
const PADDING_PX: u32 = 6;

/// Composites wrapped, vertically centered text lines into `bbox` on one page.
/// Wrapping measures real glyph advances, so long names cannot overflow the
/// box width. Same compositing path as the image stamper.
pub fn annotate_text(
    source: &[u8],
    lines: &[String],
    page_number: u32,
    bbox: BoundingBox,
    mode: PageMode,
) -> Result<Vec<u8>> {
    let font = Font::try_from_bytes(FONT_BYTES)
        .ok_or_else(|| ContractError::RenderingFailed("embedded font failed to load".into()))?;

    let img_w = (bbox.width * RASTER_SCALE).ceil() as u32;
    let img_h = (bbox.height * RASTER_SCALE).ceil() as u32;
    if img_w == 0 || img_h == 0 {
        return Err(ContractError::RenderingFailed(
            "annotation box has zero area".to_string(),
        ));
    }

    let scale = Scale::uniform(FONT_SIZE_PT * RASTER_SCALE as f32);
    let max_line_width = (img_w - 2 * PADDING_PX) as f32;

    let mut wrapped = Vec::new();
    for line in lines {
        wrapped.extend(wrap_line(&font, scale, line, max_line_width));
    }

    let v_metrics = font.v_metrics(scale);
    let line_height = (v_metrics.ascent - v_metrics.descent + v_metrics.line_gap).ceil();
    let block_height = line_height * wrapped.len() as f32;
    let mut y = ((img_h as f32 - block_height) / 2.0).max(PADDING_PX as f32);

    let mut image = RgbaImage::from_pixel(img_w, img_h, Rgba([0, 0, 0, 0]));
    for line in &wrapped {
        draw_text_mut(
            &mut image,
            Rgba([0, 0, 0, 255]),
            PADDING_PX as i32,
            y as i32,
            scale,
            &font,
            line,
        );
        y += line_height;
    }

    stamp_rgba(source, &image, page_number, bbox, mode)
}

/// Width of a laid-out run, from the last glyph's position plus its advance.
fn text_width(font: &Font, scale: Scale, text: &str) -> f32 {
    font.layout(text, scale, point(0.0, 0.0))
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0)
}

fn wrap_line(font: &Font, scale: Scale, text: &str, max_width: f32) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if text_width(font, scale, &candidate) <= max_width || current.is_empty() {
            current = candidate;
        } else {
            out.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}
