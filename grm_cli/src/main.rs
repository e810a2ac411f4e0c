//! Command line host for GRM segmentation.
//!
//! Input is a raw band-sequential file: every band configured in
//! `sourceBandNames` as `width * height` little-endian samples, in order.
//! Output is the label raster as little-endian `i32`, row-major.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::Buffer2;
use grm::{BandSamples, GrmConfig, MultiBandImage, SampleType};
use tracing::info;

/// Region merging segmentation of a raw raster.
#[derive(Parser, Debug)]
#[command(name = "grm-segment")]
#[command(about = "Segments a raw multi-band raster into homogeneous regions")]
struct Args {
    /// Run configuration (YAML).
    #[arg(short, long)]
    config: PathBuf,

    /// Raw band-sequential input samples.
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Sample type of every band: u8, u16, i32, f32 or f64.
    #[arg(long, default_value = "f32")]
    data_type: SampleType,

    /// Destination of the i32 label raster.
    #[arg(short, long)]
    output: PathBuf,

    /// Tiles segmented concurrently (default: one per core).
    #[arg(short, long)]
    jobs: Option<usize>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rolling log files to this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::log_setup::setup_logging(&args.log_level, args.log_dir.as_deref())?;

    let config = GrmConfig::from_yaml_file(&args.config)?;
    let image = read_image(&args.input, &config, args.width, args.height, args.data_type)?;
    info!(
        input = %args.input.display(),
        width = args.width,
        height = args.height,
        bands = config.band_count(),
        "Loaded input raster"
    );

    let jobs = args
        .jobs
        .unwrap_or_else(common::parallel::default_concurrency);
    let segmentation = grm::segment_image(config, &image, jobs)?;

    write_labels(&args.output, &segmentation.labels)?;
    info!(
        output = %args.output.display(),
        regions = segmentation.regions.len(),
        "Wrote label raster"
    );
    Ok(())
}

fn read_image(path: &Path, config: &GrmConfig, width: u32, height: u32, sample_type: SampleType) -> Result<MultiBandImage> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read input: {}", path.display()))?;
    let pixels = width as usize * height as usize;
    let band_bytes = pixels * sample_type.size_in_bytes();
    let expected = band_bytes * config.band_count();
    if bytes.len() != expected {
        bail!(
            "Input {} holds {} bytes, expected {expected} for {} {sample_type} band(s) of {width}x{height}",
            path.display(),
            bytes.len(),
            config.band_count()
        );
    }

    let mut image = MultiBandImage::new(width, height);
    for (name, chunk) in config.source_band_names.iter().zip(bytes.chunks_exact(band_bytes)) {
        let (w, h) = (width as usize, height as usize);
        let samples = match sample_type {
            SampleType::U8 => BandSamples::U8(Buffer2::new(w, h, chunk.to_vec())),
            SampleType::U16 => BandSamples::U16(Buffer2::new(w, h, decode(chunk, u16::from_le_bytes))),
            SampleType::I32 => BandSamples::I32(Buffer2::new(w, h, decode(chunk, i32::from_le_bytes))),
            SampleType::F32 => BandSamples::F32(Buffer2::new(w, h, decode(chunk, f32::from_le_bytes))),
            SampleType::F64 => BandSamples::F64(Buffer2::new(w, h, decode(chunk, f64::from_le_bytes))),
        };
        image.add_band(name.clone(), samples)?;
    }
    Ok(image)
}

fn decode<T, const N: usize>(bytes: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            from_le(buf)
        })
        .collect()
}

fn write_labels(path: &Path, labels: &Buffer2<i32>) -> Result<()> {
    let bytes: Vec<u8> = labels.iter().flat_map(|label| label.to_le_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("Failed to write labels: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use grm::MergingCostCriterion;

    #[test]
    fn decodes_little_endian_samples() {
        let bytes = [1, 0, 0, 1];
        assert_eq!(decode(&bytes, u16::from_le_bytes), vec![1, 256]);
    }

    #[test]
    fn reads_band_sequential_input() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("input.raw");
        let samples: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        fs::write(&path, samples)?;
        let config = GrmConfig::new(
            MergingCostCriterion::Spring,
            1.0,
            vec!["red".to_string(), "nir".to_string()],
        );

        let image = read_image(&path, &config, 2, 2, SampleType::F32)?;
        assert_eq!(image.band_names().collect::<Vec<_>>(), vec!["red", "nir"]);

        assert!(read_image(&path, &config, 3, 2, SampleType::F32).is_err());
        Ok(())
    }

    #[test]
    fn writes_little_endian_labels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labels.raw");
        write_labels(&path, &Buffer2::new(2, 1, vec![1, -1]))?;
        assert_eq!(fs::read(&path)?, vec![1, 0, 0, 0, 255, 255, 255, 255]);
        Ok(())
    }
}
