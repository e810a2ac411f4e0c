//! Output assembly: final renumbering, label run files and the label raster.
//!
//! A label file holds a run count followed by `(y, x_start, x_end, label)`
//! records, `x_end` exclusive, all i32 big-endian.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use common::Buffer2;
use tracing::info;

use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::persistence::{GraphStore, RecordReader, RecordWriter, PREALLOCATE_LIMIT};
use crate::tiling::TileLayout;

const UNLABELED: i32 = -1;

/// Final description of one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionDescriptor {
    pub id: i32,
    pub bbox: Rect,
    pub area: u32,
    pub perimeter: u32,
    pub means: Vec<f32>,
    pub std: Vec<f32>,
}

#[derive(Debug, Clone)]
struct LabelFile {
    path: PathBuf,
    /// Union of the bounding boxes of the tile's regions.
    coverage: Option<Rect>,
}

/// Result of a finished run.
///
/// Label files live in the run's working directory; reading labels after the
/// run context is dropped fails with [`Error::ReadLabels`].
#[derive(Debug)]
pub struct Finalized {
    image: Rect,
    regions: Vec<RegionDescriptor>,
    label_files: Vec<LabelFile>,
}

fn write_labels_error(path: PathBuf, source: io::Error) -> Error {
    Error::WriteLabels { path, source }
}

fn read_labels_error(path: PathBuf, source: io::Error) -> Error {
    Error::ReadLabels { path, source }
}

/// Renumbers the converged graphs and writes one label file per tile.
///
/// Tiles are visited in row-major order and nodes by anchor, so region ids are
/// consecutive within a tile. Graph files are removed once their labels are
/// written.
pub fn finalize(layout: &TileLayout, store: &GraphStore) -> Result<Finalized> {
    let mut regions = Vec::new();
    let mut label_files = Vec::with_capacity(layout.tile_count());
    let mut painted = 0u64;

    for key in layout.keys() {
        let mut nodes = store.load(key)?;
        nodes.sort_by_key(|node| node.anchor);

        let path = store.labels_path(key);
        let file = File::create(&path).map_err(|source| write_labels_error(path.clone(), source))?;
        let mut writer = RecordWriter::new(file, &path, write_labels_error);
        let runs: usize = nodes.iter().map(|node| node.contour.runs().len()).sum();
        writer.write_u32(runs as u32)?;

        let mut coverage: Option<Rect> = None;
        for node in &nodes {
            let id = regions.len() as i32;
            let mut area = 0u64;
            for run in node.contour.runs() {
                writer.write_u32(run.y)?;
                writer.write_u32(run.x_start)?;
                writer.write_u32(run.x_end)?;
                writer.write_i32(id)?;
                area += run.len() as u64;
            }
            if area != node.area as u64 {
                return Err(Error::Partition {
                    scope: format!("region {id} of tile {key}"),
                    expected: node.area as u64,
                    found: area,
                });
            }
            painted += area;
            coverage = Some(coverage.map_or(node.bbox, |rect| rect.union(&node.bbox)));
            regions.push(RegionDescriptor {
                id,
                bbox: node.bbox,
                area: node.area,
                perimeter: node.perimeter,
                means: node.bands.iter().map(|band| band.mean).collect(),
                std: node.bands.iter().map(|band| band.std).collect(),
            });
        }
        writer.finish()?;
        store.remove(key)?;
        label_files.push(LabelFile { path, coverage });
    }

    let image = layout.image();
    if painted != image.area() {
        return Err(Error::Partition {
            scope: "final mosaic".to_string(),
            expected: image.area(),
            found: painted,
        });
    }
    info!(regions = regions.len(), tiles = label_files.len(), "Segmentation finalized");

    Ok(Finalized {
        image,
        regions,
        label_files,
    })
}

impl Finalized {
    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Label raster of `rect`; every pixel must be painted exactly once.
    pub fn labels(&self, rect: Rect) -> Result<Buffer2<i32>> {
        if self.image.intersection(&rect) != Some(rect) {
            return Err(Error::TileMismatch { rect });
        }
        let mut labels = Buffer2::new_filled(rect.width as usize, rect.height as usize, UNLABELED);

        for file in &self.label_files {
            if !file.coverage.is_some_and(|coverage| coverage.intersects(&rect)) {
                continue;
            }
            paint_file(&file.path, rect, &mut labels)?;
        }

        let unlabeled = labels.iter().filter(|&&label| label == UNLABELED).count() as u64;
        if unlabeled != 0 {
            return Err(Error::Partition {
                scope: format!("labels of {rect:?}"),
                expected: rect.area(),
                found: rect.area() - unlabeled,
            });
        }
        Ok(labels)
    }
}

fn paint_file(path: &Path, rect: Rect, labels: &mut Buffer2<i32>) -> Result<()> {
    let file = File::open(path).map_err(|source| read_labels_error(path.to_path_buf(), source))?;
    let mut reader = RecordReader::new(file, path, read_labels_error);
    let count = reader.read_u32()? as usize;

    let mut runs = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    for _ in 0..count {
        let y = reader.read_u32()?;
        let x_start = reader.read_u32()?;
        let x_end = reader.read_u32()?;
        let label = reader.read_i32()?;
        runs.push((y, x_start, x_end, label));
    }
    if !reader.at_end()? {
        return Err(read_labels_error(
            path.to_path_buf(),
            io::Error::new(io::ErrorKind::InvalidData, "trailing bytes after last run"),
        ));
    }

    for (y, x_start, x_end, label) in runs {
        if y < rect.y || y >= rect.bottom() {
            continue;
        }
        let (from, to) = (x_start.max(rect.x), x_end.min(rect.right()));
        if from >= to {
            continue;
        }
        let (line, start, end) = ((y - rect.y) as usize, (from - rect.x) as usize, (to - rect.x) as usize);
        if labels.row(line)[start..end].iter().any(|&label| label != UNLABELED) {
            return Err(Error::Inconsistent(format!(
                "pixel of row {y} in [{from}, {to}) labeled twice"
            )));
        }
        labels.fill_span(line, start, end, label);
    }
    Ok(())
}
