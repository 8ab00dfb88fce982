//! Region geometry: normalized OCR boxes and their pixel projection.
//!
//! The OCR service reports every detected figure as `[x1, y1, x2, y2]` on a
//! resolution-independent `[0, 999]` grid. Converting to pixels is
//! `normalized * dimension / 1000`, so the same box works for whatever
//! resolution the renderer produced.
//!
//! Nothing in here allocates or performs I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest coordinate on the normalized grid.
pub const NORMALIZED_MAX: f64 = 999.0;

/// Divisor used when projecting normalized coordinates onto a bitmap.
const NORMALIZED_SCALE: f64 = 1000.0;

/// Why a region box cannot be projected to a usable pixel rectangle.
///
/// The cropper handles these locally (it emits a minimal placeholder image)
/// so the crop count still matches the region count.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("coordinate {value} outside normalized range 0..={max}", max = NORMALIZED_MAX)]
    OutOfRange { value: f64 },

    #[error("degenerate box {coords:?}: x1 < x2 and y1 < y2 required")]
    Inverted { coords: [f64; 4] },

    #[error("box {coords:?} has no area on a {width}x{height} bitmap")]
    Empty {
        coords: [f64; 4],
        width: u32,
        height: u32,
    },
}

/// A detected image region in normalized `[0, 999]` coordinates.
///
/// Stored exactly as the OCR service reported it; [`RegionBox::validate`]
/// and [`RegionBox::to_pixels`] decide what is usable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct RegionBox {
    coords: [f64; 4],
}

impl RegionBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            coords: [x1, y1, x2, y2],
        }
    }

    pub fn coords(&self) -> [f64; 4] {
        self.coords
    }

    /// Check `x1 < x2`, `y1 < y2` and that every coordinate lies on the grid.
    pub fn validate(&self) -> Result<(), GeometryError> {
        for &value in &self.coords {
            if !(0.0..=NORMALIZED_MAX).contains(&value) || value.is_nan() {
                return Err(GeometryError::OutOfRange { value });
            }
        }
        let [x1, y1, x2, y2] = self.coords;
        if x1 >= x2 || y1 >= y2 {
            return Err(GeometryError::Inverted {
                coords: self.coords,
            });
        }
        Ok(())
    }

    /// Project onto a `width × height` bitmap and clamp to its bounds.
    ///
    /// Out-of-range coordinates are clamped rather than rejected: the OCR
    /// service occasionally reports `1000` or small negatives. Only a box that
    /// is inverted or has no area after clamping is an error.
    pub fn to_pixels(&self, width: u32, height: u32) -> Result<PixelRect, GeometryError> {
        let [x1, y1, x2, y2] = self.coords;
        if x1 >= x2 || y1 >= y2 || self.coords.iter().any(|v| v.is_nan()) {
            return Err(GeometryError::Inverted {
                coords: self.coords,
            });
        }

        let rect = PixelRect {
            x1: project(x1, width),
            y1: project(y1, height),
            x2: project(x2, width),
            y2: project(y2, height),
        };

        if rect.is_degenerate() {
            return Err(GeometryError::Empty {
                coords: self.coords,
                width,
                height,
            });
        }
        Ok(rect)
    }
}

impl From<[f64; 4]> for RegionBox {
    fn from(c: [f64; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }
}

impl From<RegionBox> for [f64; 4] {
    fn from(b: RegionBox) -> Self {
        b.coords
    }
}

/// `normalized * dimension / 1000`, rounded and clamped to `[0, dimension]`.
fn project(normalized: f64, dimension: u32) -> u32 {
    let clamped = normalized.clamp(0.0, NORMALIZED_SCALE);
    let px = (clamped * f64::from(dimension) / NORMALIZED_SCALE).round();
    (px as u32).min(dimension)
}

/// Pixel rectangle on a rendered page, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_page_box_on_tall_bitmap() {
        let rect = RegionBox::new(0.0, 0.0, 999.0, 999.0)
            .to_pixels(1000, 2000)
            .unwrap();
        assert_eq!((rect.x1, rect.y1), (0, 0));
        assert!(rect.x2.abs_diff(999) <= 1, "x2 = {}", rect.x2);
        assert!(rect.y2.abs_diff(1998) <= 1, "y2 = {}", rect.y2);
    }

    #[test]
    fn mid_page_box_scales_per_axis() {
        let rect = RegionBox::new(250.0, 100.0, 750.0, 500.0)
            .to_pixels(800, 1200)
            .unwrap();
        assert_eq!(rect, PixelRect { x1: 200, y1: 120, x2: 600, y2: 600 });
        assert_eq!(rect.width(), 400);
        assert_eq!(rect.height(), 480);
    }

    #[test]
    fn overshooting_box_is_clamped() {
        let rect = RegionBox::new(-5.0, 900.0, 1200.0, 1000.0)
            .to_pixels(100, 100)
            .unwrap();
        assert_eq!(rect.x1, 0);
        assert_eq!(rect.x2, 100);
        assert_eq!(rect.y2, 100);
    }

    #[test]
    fn inverted_box_is_rejected() {
        let err = RegionBox::new(500.0, 10.0, 400.0, 20.0)
            .to_pixels(100, 100)
            .unwrap_err();
        assert!(matches!(err, GeometryError::Inverted { .. }));
    }

    #[test]
    fn sliver_box_has_no_area_on_small_bitmap() {
        let err = RegionBox::new(100.0, 100.0, 101.0, 300.0)
            .to_pixels(10, 10)
            .unwrap_err();
        assert!(matches!(err, GeometryError::Empty { .. }));
    }

    #[test]
    fn validate_checks_range_and_order() {
        assert!(RegionBox::new(0.0, 0.0, 999.0, 999.0).validate().is_ok());
        assert!(matches!(
            RegionBox::new(0.0, 0.0, 1000.0, 10.0).validate(),
            Err(GeometryError::OutOfRange { .. })
        ));
        assert!(matches!(
            RegionBox::new(10.0, 10.0, 10.0, 20.0).validate(),
            Err(GeometryError::Inverted { .. })
        ));
    }

    #[test]
    fn deserializes_from_plain_array() {
        let boxes: Vec<RegionBox> = serde_json::from_str("[[1,2,3,4],[10.5,20,30,40]]").unwrap();
        assert_eq!(boxes[0].coords(), [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(boxes[1].coords()[0], 10.5);
    }
}
