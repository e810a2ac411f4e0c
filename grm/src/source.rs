//! Pixel input: typed band samples and the seam the host reads tiles through.

use common::Buffer2;
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};
use crate::geometry::Rect;

/// Declared numeric type of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
    I32,
    F32,
    F64,
}

impl SampleType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
            SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }
}

/// Row-major samples of one band.
#[derive(Debug, Clone, PartialEq)]
pub enum BandSamples {
    U8(Buffer2<u8>),
    U16(Buffer2<u16>),
    I32(Buffer2<i32>),
    F32(Buffer2<f32>),
    F64(Buffer2<f64>),
}

impl BandSamples {
    pub fn sample_type(&self) -> SampleType {
        match self {
            BandSamples::U8(_) => SampleType::U8,
            BandSamples::U16(_) => SampleType::U16,
            BandSamples::I32(_) => SampleType::I32,
            BandSamples::F32(_) => SampleType::F32,
            BandSamples::F64(_) => SampleType::F64,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            BandSamples::U8(b) => b.width(),
            BandSamples::U16(b) => b.width(),
            BandSamples::I32(b) => b.width(),
            BandSamples::F32(b) => b.width(),
            BandSamples::F64(b) => b.width(),
        }
    }

    pub fn height(&self) -> usize {
        match self {
            BandSamples::U8(b) => b.height(),
            BandSamples::U16(b) => b.height(),
            BandSamples::I32(b) => b.height(),
            BandSamples::F32(b) => b.height(),
            BandSamples::F64(b) => b.height(),
        }
    }

    /// Sample at local `(x, y)` widened to `f32`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        match self {
            BandSamples::U8(b) => b[(x, y)] as f32,
            BandSamples::U16(b) => b[(x, y)] as f32,
            BandSamples::I32(b) => b[(x, y)] as f32,
            BandSamples::F32(b) => b[(x, y)],
            BandSamples::F64(b) => b[(x, y)] as f32,
        }
    }

    /// Copy of the local window `rect`.
    pub fn window(&self, rect: Rect) -> BandSamples {
        let (x, y, w, h) = (
            rect.x as usize,
            rect.y as usize,
            rect.width as usize,
            rect.height as usize,
        );
        match self {
            BandSamples::U8(b) => BandSamples::U8(b.window(x, y, w, h)),
            BandSamples::U16(b) => BandSamples::U16(b.window(x, y, w, h)),
            BandSamples::I32(b) => BandSamples::I32(b.window(x, y, w, h)),
            BandSamples::F32(b) => BandSamples::F32(b.window(x, y, w, h)),
            BandSamples::F64(b) => BandSamples::F64(b.window(x, y, w, h)),
        }
    }
}

/// Samples of the selected bands over a rectangle in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelTile {
    pub rect: Rect,
    pub bands: Vec<BandSamples>,
}

impl PixelTile {
    pub fn new(rect: Rect, bands: Vec<BandSamples>) -> Result<Self> {
        for band in &bands {
            if band.width() != rect.width as usize || band.height() != rect.height as usize {
                return Err(Error::SampleCount {
                    expected: rect.area() as usize,
                    found: band.width() * band.height(),
                });
            }
        }
        Ok(Self { rect, bands })
    }

    #[inline]
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// All band samples of the pixel at image coordinates `(x, y)`.
    pub fn samples_at(&self, x: u32, y: u32, out: &mut Vec<f32>) {
        debug_assert!(self.rect.contains(x, y));
        let (lx, ly) = ((x - self.rect.x) as usize, (y - self.rect.y) as usize);
        out.clear();
        out.extend(self.bands.iter().map(|band| band.get(lx, ly)));
    }
}

/// Where tile pixels come from.
pub trait TileSource: Sync {
    /// Reads the named bands over `rect`, in the order given.
    fn read(&self, rect: Rect, bands: &[String]) -> Result<PixelTile>;
}

/// In-memory image with named bands of equal size.
#[derive(Debug, Clone)]
pub struct MultiBandImage {
    width: u32,
    height: u32,
    bands: Vec<(String, BandSamples)>,
}

impl MultiBandImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bands: Vec::new(),
        }
    }

    pub fn with_band(mut self, name: impl Into<String>, samples: BandSamples) -> Result<Self> {
        self.add_band(name, samples)?;
        Ok(self)
    }

    pub fn add_band(&mut self, name: impl Into<String>, samples: BandSamples) -> Result<()> {
        if samples.width() != self.width as usize || samples.height() != self.height as usize {
            return Err(Error::SampleCount {
                expected: self.width as usize * self.height as usize,
                found: samples.width() * samples.height(),
            });
        }
        self.bands.push((name.into(), samples));
        Ok(())
    }

    /// Single-band `f32` image.
    pub fn from_f32(width: u32, height: u32, name: &str, values: Vec<f32>) -> Result<Self> {
        if values.len() != width as usize * height as usize {
            return Err(Error::SampleCount {
                expected: width as usize * height as usize,
                found: values.len(),
            });
        }
        let samples = BandSamples::F32(Buffer2::new(width as usize, height as usize, values));
        Self::new(width, height).with_band(name, samples)
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn band_names(&self) -> impl Iterator<Item = &str> {
        self.bands.iter().map(|(name, _)| name.as_str())
    }
}

impl TileSource for MultiBandImage {
    fn read(&self, rect: Rect, bands: &[String]) -> Result<PixelTile> {
        if rect.right() > self.width || rect.bottom() > self.height {
            return Err(Error::TileMismatch { rect });
        }
        let selected = bands
            .iter()
            .map(|name| {
                self.bands
                    .iter()
                    .find(|(band, _)| band == name)
                    .map(|(_, samples)| samples.window(rect))
                    .ok_or_else(|| Error::UnknownBand(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        PixelTile::new(rect, selected)
    }
}
