//! Region boundaries as sorted sets of crack edges.
//!
//! A crack is the unit side between two 4-adjacent pixels (or between a pixel
//! and the outside of the image). The boundary of a region is exactly the set
//! of cracks with the region on one side only, so:
//!
//! - the perimeter is the number of cracks,
//! - merging two regions is the symmetric difference of their sets (shared
//!   cracks cancel),
//! - the border shared by two regions is the intersection of their sets,
//! - every row of the region is recovered by pairing its vertical cracks,
//!   holes included.
//!
//! All coordinates are global image coordinates.

use super::{PixelPos, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrackKind {
    /// Top side of pixel `(x, y)`.
    Horizontal,
    /// Left side of pixel `(x, y)`.
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Crack {
    pub y: u32,
    pub x: u32,
    pub kind: CrackKind,
}

impl Crack {
    #[inline]
    pub const fn horizontal(x: u32, y: u32) -> Self {
        Self {
            y,
            x,
            kind: CrackKind::Horizontal,
        }
    }

    #[inline]
    pub const fn vertical(x: u32, y: u32) -> Self {
        Self {
            y,
            x,
            kind: CrackKind::Vertical,
        }
    }
}

/// Half-open horizontal pixel span `[x_start, x_end)` on row `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub y: u32,
    pub x_start: u32,
    pub x_end: u32,
}

impl Run {
    #[inline]
    pub const fn len(&self) -> u32 {
        self.x_end - self.x_start
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.x_end == self.x_start
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contour {
    cracks: Vec<Crack>,
}

impl Contour {
    /// Boundary of the single pixel `(x, y)`.
    pub fn pixel(x: u32, y: u32) -> Self {
        Self {
            cracks: vec![
                Crack::horizontal(x, y),
                Crack::vertical(x, y),
                Crack::vertical(x + 1, y),
                Crack::horizontal(x, y + 1),
            ],
        }
    }

    /// Boundary of the horizontal run `[x_start, x_end)` on row `y`.
    pub fn run(y: u32, x_start: u32, x_end: u32) -> Self {
        debug_assert!(x_start < x_end);
        let mut cracks = Vec::with_capacity(2 * (x_end - x_start) as usize + 2);
        for x in x_start..x_end {
            cracks.push(Crack::horizontal(x, y));
            if x == x_start {
                cracks.push(Crack::vertical(x, y));
            }
        }
        cracks.push(Crack::vertical(x_end, y));
        cracks.extend((x_start..x_end).map(|x| Crack::horizontal(x, y + 1)));
        cracks.sort_unstable();
        Self { cracks }
    }

    /// Builds a contour from cracks that are already strictly increasing.
    ///
    /// Returns `None` when the input is not sorted or contains duplicates.
    pub fn from_sorted(cracks: Vec<Crack>) -> Option<Self> {
        cracks
            .windows(2)
            .all(|pair| pair[0] < pair[1])
            .then_some(Self { cracks })
    }

    #[inline]
    pub fn cracks(&self) -> &[Crack] {
        &self.cracks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cracks.is_empty()
    }

    /// Boundary of the union of two adjacent regions.
    pub fn merge(&self, other: &Contour) -> Contour {
        let (a, b) = (&self.cracks, &other.cracks);
        let mut merged = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(a[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(b[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&a[i..]);
        merged.extend_from_slice(&b[j..]);
        Contour { cracks: merged }
    }

    /// Number of cracks the two boundaries have in common.
    pub fn shared_length(&self, other: &Contour) -> u32 {
        let (a, b) = (&self.cracks, &other.cracks);
        let (mut i, mut j, mut shared) = (0, 0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    shared += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        shared
    }

    /// First pixel of the region in raster order.
    ///
    /// The smallest crack of any non-empty region is the top side of that pixel.
    pub fn anchor(&self) -> Option<PixelPos> {
        self.cracks.first().map(|crack| {
            debug_assert_eq!(crack.kind, CrackKind::Horizontal);
            PixelPos::new(crack.x, crack.y)
        })
    }

    /// Pixel runs of the region, row by row, left to right.
    pub fn runs(&self) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut open: Option<(u32, u32)> = None;
        for crack in self
            .cracks
            .iter()
            .filter(|crack| crack.kind == CrackKind::Vertical)
        {
            match open.take() {
                Some((y, x_start)) if y == crack.y => runs.push(Run {
                    y,
                    x_start,
                    x_end: crack.x,
                }),
                Some(_) => {
                    debug_assert!(false, "unpaired vertical crack in contour");
                    open = Some((crack.y, crack.x));
                }
                None => open = Some((crack.y, crack.x)),
            }
        }
        debug_assert!(open.is_none(), "unpaired vertical crack in contour");
        runs
    }

    /// Pixel count recovered from the boundary.
    pub fn enclosed_area(&self) -> u64 {
        self.runs().iter().map(|run| run.len() as u64).sum()
    }

    /// Bounding rectangle recovered from the boundary.
    pub fn bounds(&self) -> Option<Rect> {
        let first = self.cracks.first()?;
        let last = self.cracks.last()?;
        let (mut x_min, mut x_max) = (u32::MAX, 0);
        for crack in &self.cracks {
            match crack.kind {
                CrackKind::Vertical => {
                    x_min = x_min.min(crack.x);
                    x_max = x_max.max(crack.x);
                }
                CrackKind::Horizontal => {
                    x_min = x_min.min(crack.x);
                    x_max = x_max.max(crack.x + 1);
                }
            }
        }
        Some(Rect::new(x_min, first.y, x_max - x_min, last.y - first.y))
    }
}
