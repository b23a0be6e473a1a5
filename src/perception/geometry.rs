use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

/// Side length of the square sent to the LLM, after resampling.
pub const TILE_SIZE: u32 = 768;

/// Upper bound of the normalized coordinate range used by the detector.
pub const BOX_SCALE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileDirection {
    /// Square tiles advance along the y axis (image taller than wide or square).
    Horizontal,
    /// Square tiles advance along the x axis (image wider than tall).
    Vertical,
}

/// Detector bounding box, normalized to `[0, 1000]` as `[ymin, xmin, ymax, xmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub ymin: u32,
    pub xmin: u32,
    pub ymax: u32,
    pub xmax: u32,
}

impl NormalizedBox {
    pub fn new(ymin: u32, xmin: u32, ymax: u32, xmax: u32) -> Self {
        Self {
            ymin,
            xmin,
            ymax,
            xmax,
        }
    }

    pub fn as_array(&self) -> [u32; 4] {
        [self.ymin, self.xmin, self.ymax, self.xmax]
    }

    /// Integer-floor center in normalized coordinates.
    pub fn center(&self) -> (u32, u32) {
        ((self.xmin + self.xmax) / 2, (self.ymin + self.ymax) / 2)
    }
}

/// Deterministic tiling of one captured screenshot.
///
/// The tile side is `min(w, h)`; starting points begin at the origin and step
/// by `round(side * 0.5)` along the long axis, capped by an extra start at
/// `long_axis - side` when that lies strictly past the last stepped start.
/// Built fresh for every screenshot; never shared across turns.
#[derive(Debug, Clone)]
pub struct ScreenGeometry {
    width: u32,
    height: u32,
    side: u32,
    direction: TileDirection,
    starts: Vec<(u32, u32)>,
}

impl ScreenGeometry {
    pub fn new(width: u32, height: u32) -> DeskPilotResult<Self> {
        if width == 0 || height == 0 {
            return Err(DeskPilotError::Image(format!(
                "degenerate screenshot resolution {width}x{height}"
            )));
        }
        let side = width.min(height);
        let direction = if width > height {
            TileDirection::Vertical
        } else {
            TileDirection::Horizontal
        };
        let step = (side as f64 * 0.5).round() as u32;

        let mut starts: Vec<(u32, u32)> = vec![(0, 0)];
        match direction {
            TileDirection::Vertical => {
                let mut x = step;
                while x + side <= width {
                    starts.push((x, 0));
                    x += step;
                }
                let final_x = width - side;
                if final_x > starts[starts.len() - 1].0 {
                    starts.push((final_x, 0));
                }
            }
            TileDirection::Horizontal => {
                let mut y = step;
                while y + side <= height {
                    starts.push((0, y));
                    y += step;
                }
                let final_y = height - side;
                if final_y > starts[starts.len() - 1].1 {
                    starts.push((0, final_y));
                }
            }
        }

        Ok(Self {
            width,
            height,
            side,
            direction,
            starts,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn direction(&self) -> TileDirection {
        self.direction
    }

    pub fn starts(&self) -> &[(u32, u32)] {
        &self.starts
    }

    pub fn tile_count(&self) -> usize {
        self.starts.len()
    }

    pub fn start(&self, index: usize) -> Option<(u32, u32)> {
        self.starts.get(index).copied()
    }

    /// Maps a normalized point inside tile `index` to screen coordinates:
    /// `(x0 + round(cx * side / 1000), y0 + round(cy * side / 1000))`.
    pub fn denormalize(&self, index: usize, cx: u32, cy: u32) -> Option<(i32, i32)> {
        let (x0, y0) = self.start(index)?;
        let scale = |v: u32| -> i32 { (v as f64 * self.side as f64 / BOX_SCALE as f64).round() as i32 };
        Some((x0 as i32 + scale(cx), y0 as i32 + scale(cy)))
    }

    /// Screen-space rectangle `(x1, y1, x2, y2)` of a normalized box in tile `index`.
    pub fn denormalize_box(&self, index: usize, b: &NormalizedBox) -> Option<(i32, i32, i32, i32)> {
        let (x1, y1) = self.denormalize(index, b.xmin, b.ymin)?;
        let (x2, y2) = self.denormalize(index, b.xmax, b.ymax)?;
        Some((x1, y1, x2, y2))
    }
}
