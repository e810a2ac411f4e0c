//! Stand-in host scheduler for in-memory images.

use common::parallel::try_par_for_each_limited;
use common::Buffer2;

use crate::assembler::RegionDescriptor;
use crate::config::GrmConfig;
use crate::engine::RunContext;
use crate::error::Result;
use crate::geometry::Rect;
use crate::source::MultiBandImage;

/// Labels and region descriptors of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub labels: Buffer2<i32>,
    pub regions: Vec<RegionDescriptor>,
}

/// Segments `image` end to end with at most `max_concurrent` tiles in flight.
pub fn segment_image(config: GrmConfig, image: &MultiBandImage, max_concurrent: usize) -> Result<Segmentation> {
    let run = RunContext::new(config, image.width(), image.height())?;
    let rects: Vec<Rect> = run
        .layout()
        .keys()
        .map(|key| run.layout().tile_rect(key))
        .collect();

    try_par_for_each_limited(&rects, max_concurrent.max(1), |rect| {
        run.compute_tile(*rect, image).map(|_| ())
    })?;

    Ok(Segmentation {
        labels: run.labels(image.rect())?,
        regions: run.regions()?,
    })
}
