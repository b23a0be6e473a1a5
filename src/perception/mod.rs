pub mod geometry;
pub mod tiler;

pub use geometry::{NormalizedBox, ScreenGeometry, TileDirection, BOX_SCALE, TILE_SIZE};
pub use tiler::{HighlightStyle, ScreenTiler};
