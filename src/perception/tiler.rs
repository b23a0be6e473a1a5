use image::DynamicImage;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::geometry::{NormalizedBox, ScreenGeometry, TILE_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct HighlightStyle {
    /// Border / line colour, RGB.
    pub color: [u8; 3],
    /// Stroke thickness in pixels.
    pub width: u32,
}

impl Default for HighlightStyle {
    fn default() -> Self {
        Self {
            color: [255, 255, 255],
            width: 3,
        }
    }
}

/// Extracts LLM-facing tiles from a screenshot and maps normalized detector
/// output back to screen coordinates. Bound to one [`ScreenGeometry`], which
/// in turn is bound to one screenshot.
pub struct ScreenTiler {
    geometry: ScreenGeometry,
}

impl ScreenTiler {
    pub fn new(geometry: ScreenGeometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &ScreenGeometry {
        &self.geometry
    }

    fn check_resolution(&self, image: &DynamicImage) -> DeskPilotResult<()> {
        if image.width() != self.geometry.width() || image.height() != self.geometry.height() {
            return Err(DeskPilotError::Image(format!(
                "image resolution {}x{} does not match tiling geometry {}x{}",
                image.width(),
                image.height(),
                self.geometry.width(),
                self.geometry.height()
            )));
        }
        Ok(())
    }

    /// Ordered 768x768 PNG tiles, one per starting point.
    pub fn tile(&self, image: &DynamicImage) -> DeskPilotResult<Vec<Vec<u8>>> {
        self.check_resolution(image)?;
        let side = self.geometry.side();
        let mut tiles = Vec::with_capacity(self.geometry.tile_count());
        for &(x, y) in self.geometry.starts() {
            let tile = image
                .crop_imm(x, y, side, side)
                .resize_exact(TILE_SIZE, TILE_SIZE, image::imageops::FilterType::Lanczos3);
            tiles.push(encode_png(&tile)?);
        }
        Ok(tiles)
    }

    pub fn point_to_screen(&self, tile_index: usize, cx: u32, cy: u32) -> DeskPilotResult<(i32, i32)> {
        self.geometry
            .denormalize(tile_index, cx, cy)
            .ok_or_else(|| tile_range_error(tile_index, self.geometry.tile_count()))
    }

    /// Screen coordinate of a box: its integer-floor center, de-normalized.
    pub fn box_to_screen(&self, tile_index: usize, b: &NormalizedBox) -> DeskPilotResult<(i32, i32)> {
        let (cx, cy) = b.center();
        self.point_to_screen(tile_index, cx, cy)
    }

    /// Returns the screenshot with everything outside the de-normalized box
    /// dimmed (black at 50% opacity) and a stroked border around it.
    /// Resolution and PNG encoding are preserved.
    pub fn highlight_box(
        &self,
        image: &DynamicImage,
        tile_index: usize,
        b: &NormalizedBox,
        style: HighlightStyle,
    ) -> DeskPilotResult<Vec<u8>> {
        self.check_resolution(image)?;
        let rect = self
            .geometry
            .denormalize_box(tile_index, b)
            .ok_or_else(|| tile_range_error(tile_index, self.geometry.tile_count()))?;

        let mut canvas = image.to_rgba8();
        apply_vignette(&mut canvas, &[rect]);
        draw_rect(&mut canvas, rect, style.color, style.width);
        encode_png(&DynamicImage::ImageRgba8(canvas))
    }

    /// Vignette exposing both rectangles, plus a line from the first
    /// rectangle's center to the second's, with an arrowhead at the end.
    pub fn highlight_arrow(
        &self,
        image: &DynamicImage,
        start: (usize, &NormalizedBox),
        end: (usize, &NormalizedBox),
        start_style: HighlightStyle,
        end_style: HighlightStyle,
    ) -> DeskPilotResult<Vec<u8>> {
        self.check_resolution(image)?;
        let count = self.geometry.tile_count();
        let start_rect = self
            .geometry
            .denormalize_box(start.0, start.1)
            .ok_or_else(|| tile_range_error(start.0, count))?;
        let end_rect = self
            .geometry
            .denormalize_box(end.0, end.1)
            .ok_or_else(|| tile_range_error(end.0, count))?;

        let mut canvas = image.to_rgba8();
        apply_vignette(&mut canvas, &[start_rect, end_rect]);
        draw_rect(&mut canvas, start_rect, start_style.color, start_style.width);
        draw_rect(&mut canvas, end_rect, end_style.color, end_style.width);

        let from = rect_center(start_rect);
        let to = rect_center(end_rect);
        draw_line(&mut canvas, from, to, end_style.color, end_style.width);
        draw_arrowhead(&mut canvas, from, to, end_style.color, end_style.width);
        encode_png(&DynamicImage::ImageRgba8(canvas))
    }
}

fn tile_range_error(index: usize, count: usize) -> DeskPilotError {
    DeskPilotError::Image(format!("tile index {index} out of range (have {count} tiles)"))
}

fn encode_png(image: &DynamicImage) -> DeskPilotResult<Vec<u8>> {
    let mut out = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| DeskPilotError::Image(format!("PNG encode: {e}")))?;
    Ok(out)
}

fn rect_center((x1, y1, x2, y2): (i32, i32, i32, i32)) -> (i32, i32) {
    ((x1 + x2) / 2, (y1 + y2) / 2)
}

/// Darken every pixel outside the given rectangles with black at 50% opacity.
fn apply_vignette(canvas: &mut image::RgbaImage, keep: &[(i32, i32, i32, i32)]) {
    let (w, h) = canvas.dimensions();
    for y in 0..h {
        for x in 0..w {
            let inside = keep.iter().any(|&(x1, y1, x2, y2)| {
                (x as i32) >= x1 && (x as i32) <= x2 && (y as i32) >= y1 && (y as i32) <= y2
            });
            if !inside {
                blend_pixel(canvas.get_pixel_mut(x, y), 0, 0, 0, 128);
            }
        }
    }
}

fn draw_rect(
    canvas: &mut image::RgbaImage,
    (x1, y1, x2, y2): (i32, i32, i32, i32),
    color: [u8; 3],
    thickness: u32,
) {
    let (w, h) = canvas.dimensions();
    let (iw, ih) = (w as i32, h as i32);
    let t = thickness as i32;

    for d in 0..t {
        let ty = y1 + d;
        let by = y2 - d;
        for x in x1..=x2 {
            if x >= 0 && x < iw {
                if ty >= 0 && ty < ih {
                    set_pixel(canvas, x as u32, ty as u32, color);
                }
                if by >= 0 && by < ih {
                    set_pixel(canvas, x as u32, by as u32, color);
                }
            }
        }
        let lx = x1 + d;
        let rx = x2 - d;
        for y in y1..=y2 {
            if y >= 0 && y < ih {
                if lx >= 0 && lx < iw {
                    set_pixel(canvas, lx as u32, y as u32, color);
                }
                if rx >= 0 && rx < iw {
                    set_pixel(canvas, rx as u32, y as u32, color);
                }
            }
        }
    }
}

/// Thick line segment, stamped as a square brush along the longest axis.
fn draw_line(
    canvas: &mut image::RgbaImage,
    (x1, y1): (i32, i32),
    (x2, y2): (i32, i32),
    color: [u8; 3],
    thickness: u32,
) {
    let steps = (x2 - x1).abs().max((y2 - y1).abs()).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = (x1 as f64 + (x2 - x1) as f64 * t).round() as i32;
        let y = (y1 as f64 + (y2 - y1) as f64 * t).round() as i32;
        stamp(canvas, x, y, color, thickness);
    }
}

fn draw_arrowhead(
    canvas: &mut image::RgbaImage,
    from: (i32, i32),
    to: (i32, i32),
    color: [u8; 3],
    thickness: u32,
) {
    let dx = (to.0 - from.0) as f64;
    let dy = (to.1 - from.1) as f64;
    if dx == 0.0 && dy == 0.0 {
        return;
    }
    let angle = dy.atan2(dx);
    let barb_len = 6.0 * thickness.max(1) as f64;
    for offset in [std::f64::consts::PI * 5.0 / 6.0, -std::f64::consts::PI * 5.0 / 6.0] {
        let bx = (to.0 as f64 + barb_len * (angle + offset).cos()).round() as i32;
        let by = (to.1 as f64 + barb_len * (angle + offset).sin()).round() as i32;
        draw_line(canvas, to, (bx, by), color, thickness);
    }
}

fn stamp(canvas: &mut image::RgbaImage, cx: i32, cy: i32, color: [u8; 3], thickness: u32) {
    let (w, h) = canvas.dimensions();
    let r = (thickness as i32 / 2).max(0);
    for y in (cy - r)..=(cy + r) {
        for x in (cx - r)..=(cx + r) {
            if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
                set_pixel(canvas, x as u32, y as u32, color);
            }
        }
    }
}

fn set_pixel(canvas: &mut image::RgbaImage, x: u32, y: u32, color: [u8; 3]) {
    let p = canvas.get_pixel_mut(x, y);
    p[0] = color[0];
    p[1] = color[1];
    p[2] = color[2];
    p[3] = 255;
}

fn blend_pixel(pixel: &mut image::Rgba<u8>, r: u8, g: u8, b: u8, a: u8) {
    let alpha = a as f32 / 255.0;
    pixel[0] = (pixel[0] as f32 * (1.0 - alpha) + r as f32 * alpha).round() as u8;
    pixel[1] = (pixel[1] as f32 * (1.0 - alpha) + g as f32 * alpha).round() as u8;
    pixel[2] = (pixel[2] as f32 * (1.0 - alpha) + b as f32 * alpha).round() as u8;
}
