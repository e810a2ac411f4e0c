//! Pixel-space geometry shared by nodes, tiles and the assembler.

mod contour;

pub use contour::{Contour, Crack, CrackKind, Run};

/// Axis-aligned pixel rectangle, `x`/`y` inclusive, `right()`/`bottom()` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[inline]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Single-pixel rectangle.
    #[inline]
    pub const fn pixel(x: u32, y: u32) -> Self {
        Self::new(x, y, 1, 1)
    }

    #[inline]
    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    #[inline]
    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    #[inline]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Perimeter of the rectangle outline, used by the smoothness term.
    #[inline]
    pub const fn perimeter(&self) -> u32 {
        2 * (self.width + self.height)
    }

    #[inline]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| Rect::new(x, y, right - x, bottom - y))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersection(other).is_some()
    }

    /// Grows the rectangle by `margin` on every side, clipped to `bounds`.
    pub fn expand_within(&self, margin: u32, bounds: &Rect) -> Rect {
        let x = self.x.saturating_sub(margin).max(bounds.x);
        let y = self.y.saturating_sub(margin).max(bounds.y);
        let right = (self.right() + margin).min(bounds.right());
        let bottom = (self.bottom() + margin).min(bounds.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }
}

/// Pixel position ordered in raster order: row first, then column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PixelPos {
    pub y: u32,
    pub x: u32,
}

impl PixelPos {
    #[inline]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { y, x }
    }
}
