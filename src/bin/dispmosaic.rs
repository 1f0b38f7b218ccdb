use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dispmosaic::core::partition::PartitionDriver;
use dispmosaic::io::catalog::CmrCatalog;
use dispmosaic::io::frames::FrameIndex;
use dispmosaic::io::geotiff::parse_date;
use dispmosaic::io::granule_store::HttpGranuleStore;
use dispmosaic::pipeline::{self, FrameProcessor};
use dispmosaic::types::MAX_FRAME_ID;
use dispmosaic::{BoundingBox, FrameId, MeasurementKind, RunConfig};
use log::{debug, error, info, warn};
use std::path::PathBuf;

fn frame_id_arg(s: &str) -> Result<FrameId, String> {
    let frame: FrameId = s.parse().map_err(|e| format!("invalid frame id {s}: {e}"))?;
    if !(1..=MAX_FRAME_ID).contains(&frame) {
        return Err(format!("Value {frame} must be between 1 and {MAX_FRAME_ID}"));
    }
    Ok(frame)
}

fn date_arg(s: &str) -> Result<DateTime<Utc>, String> {
    parse_date(s).map_err(|e| e.to_string())
}

fn kind_arg(s: &str) -> Result<MeasurementKind, String> {
    s.parse().map_err(|e: dispmosaic::DispError| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a displacement or velocity GeoTIFF for one frame
    Measurement {
        /// Frame id (1..=46986)
        #[arg(value_parser = frame_id_arg)]
        frame: FrameId,

        /// displacement, velocity or secant_velocity
        #[arg(value_parser = kind_arg)]
        kind: MeasurementKind,

        /// Start date (YYYYMMDD)
        #[arg(value_parser = date_arg)]
        start: DateTime<Utc>,

        /// End date (YYYYMMDD)
        #[arg(value_parser = date_arg)]
        end: DateTime<Utc>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Composite per-frame measurement GeoTIFFs into one mosaic
    Mosaic {
        /// Directory for mosaic.tif and extent.json
        output_dir: PathBuf,

        /// Measurement GeoTIFFs to composite
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Build partitioned mosaics over a geographic extent
    Partitions {
        #[arg(allow_hyphen_values = true)]
        min_lon: f64,
        #[arg(allow_hyphen_values = true)]
        min_lat: f64,
        #[arg(allow_hyphen_values = true)]
        max_lon: f64,
        #[arg(allow_hyphen_values = true)]
        max_lat: f64,

        #[arg(value_parser = kind_arg)]
        kind: MeasurementKind,

        #[arg(value_parser = date_arg)]
        start: DateTime<Utc>,

        #[arg(value_parser = date_arg)]
        end: DateTime<Utc>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Displacement and velocity mosaics from OPERA DISP frames", long_about = None)]
struct Cli {
    /// JSON run configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    let mut config = match path {
        Some(path) => RunConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => RunConfig::default(),
    };
    if config.catalog.token.is_none() {
        config.catalog.token = std::env::var("EARTHDATA_TOKEN").ok();
    }
    if config.catalog.token.is_none() {
        warn!("No Earthdata token configured; downloads may be refused");
    }
    Ok(config)
}

fn load_frames(config: &RunConfig) -> Result<FrameIndex> {
    let path = match config.frame_index.clone().or_else(FrameIndex::default_path) {
        Some(path) => path,
        None => bail!("No frame index configured and no cache directory available"),
    };
    FrameIndex::from_file(&path).with_context(|| format!("loading frame index {}", path.display()))
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    debug!("Run configuration: {:?}", config);

    match cli.command {
        Command::Measurement { frame, kind, start, end, output_dir } => {
            let catalog = CmrCatalog::new(config.catalog.clone())?;
            let store = HttpGranuleStore::new(config.catalog.token.clone(), config.catalog.timeout_secs)?;
            let path =
                pipeline::create_measurement(&catalog, &store, &config, frame, kind, start, end, &output_dir)?;
            info!("Created {}", path.display());
        }
        Command::Mosaic { output_dir, inputs } => {
            let frames = match load_frames(&config) {
                Ok(frames) => Some(frames),
                Err(e) => {
                    warn!("Ranking by frame number: {:#}", e);
                    None
                }
            };
            let output = pipeline::create_mosaic(&inputs, &output_dir, frames.as_ref(), &config)?;
            info!(
                "Created {} and {}",
                output.raster_path.display(),
                output.manifest_path.display()
            );
        }
        Command::Partitions { min_lon, min_lat, max_lon, max_lat, kind, start, end, output_dir } => {
            let extent = BoundingBox::new(min_lon, min_lat, max_lon, max_lat);
            if extent.is_empty() {
                bail!("Extent {} is empty", extent);
            }
            let frames = load_frames(&config)?;
            let catalog = CmrCatalog::new(config.catalog.clone())?;
            let store = HttpGranuleStore::new(config.catalog.token.clone(), config.catalog.timeout_secs)?;
            let processor = FrameProcessor::new(&catalog, &store, &config)?;
            let driver = PartitionDriver::new(&processor, &frames, config.partition_params());

            let report = driver.run(&extent, kind, start, end, &output_dir)?;
            for failed in &report.failed {
                error!("Partition {} failed: {}", failed.bounds, failed.error);
            }
            for failure in &report.frame_failures {
                error!(
                    "Frame {} failed in partition {} ({} to {}): {}",
                    failure.frame_id,
                    failure.partition,
                    failure.start.format("%Y%m%d"),
                    failure.end.format("%Y%m%d"),
                    failure.error
                );
            }
            if !report.failed.is_empty() {
                let total = report.failed.len() + report.completed.len() + report.skipped.len();
                bail!("{} of {} partitions failed", report.failed.len(), total);
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    debug!("Parsed CLI args: {:?}", cli);

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
