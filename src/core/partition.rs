//! Partitioned mosaic generation.
//!
//! A large extent is split into fixed-size geographic partitions. Each partition
//! is a window of one job-wide grid, so partitions tile the whole-extent output
//! exactly and can be computed, retried and resumed independently.

use crate::core::composite::FrameCompositor;
use crate::core::frame_order::{FrameRanking, PolicyKind};
use crate::core::grid::{project_bounds, RasterGrid, WEB_MERCATOR_EPSG};
use crate::io::frames::{Frame, FrameIndex};
use crate::io::geotiff;
use crate::types::{
    BoundingBox, DispError, DispResult, FrameId, MeasurementKind, MeasurementRaster, MosaicTile, OrbitDirection,
    ScaleRange, TileManifest,
};
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Produces one frame's measurement resampled onto a target grid
pub trait MeasurementSource: Sync {
    fn measure(
        &self,
        frame: &Frame,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: &RasterGrid,
    ) -> DispResult<MeasurementRaster>;
}

/// Partition driver parameters
#[derive(Debug, Clone)]
pub struct PartitionParams {
    /// Partition edge length in degrees
    pub partition_size: f64,
    pub output_epsg: u32,
    /// Output pixel size in units of the output projection
    pub resolution: f64,
    pub orbit_direction: Option<OrbitDirection>,
    pub policy: PolicyKind,
    /// Skip partitions whose outputs already exist
    pub resume: bool,
}

impl Default for PartitionParams {
    fn default() -> Self {
        Self {
            partition_size: 10.0,
            output_epsg: WEB_MERCATOR_EPSG,
            resolution: 30.0,
            orbit_direction: None,
            policy: PolicyKind::default(),
            resume: true,
        }
    }
}

/// A frame that could not be measured within one partition
#[derive(Debug, Clone)]
pub struct FrameFailure {
    pub frame_id: FrameId,
    pub partition: BoundingBox,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub error: String,
}

/// Composited partition and the frames that failed while building it
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub tile: MosaicTile,
    pub frame_failures: Vec<FrameFailure>,
}

#[derive(Debug, Clone)]
pub struct CompletedPartition {
    pub bounds: BoundingBox,
    pub raster_path: PathBuf,
    pub manifest_path: PathBuf,
    pub frame_ids_used: Vec<FrameId>,
}

#[derive(Debug, Clone)]
pub struct FailedPartition {
    pub bounds: BoundingBox,
    pub error: String,
}

/// Terminal state of a partitioned run; partial completion is valid
#[derive(Debug, Clone, Default)]
pub struct PartitionReport {
    pub completed: Vec<CompletedPartition>,
    pub skipped: Vec<BoundingBox>,
    pub failed: Vec<FailedPartition>,
    pub frame_failures: Vec<FrameFailure>,
}

impl PartitionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.frame_failures.is_empty()
    }
}

enum PartitionStatus {
    Completed(CompletedPartition, Vec<FrameFailure>),
    Skipped(BoundingBox),
    Failed(FailedPartition),
}

/// Split `bbox` into `size` degree cells anchored at its south-west corner.
///
/// Cells on the north and east edges are clipped to the extent.
pub fn split_extent(bbox: &BoundingBox, size: f64) -> Vec<BoundingBox> {
    if bbox.is_empty() || !(size > 0.0) {
        return Vec::new();
    }

    let n_lon = ((bbox.max_lon - bbox.min_lon) / size).ceil() as usize;
    let n_lat = ((bbox.max_lat - bbox.min_lat) / size).ceil() as usize;

    let mut cells = Vec::with_capacity(n_lon * n_lat);
    for i in 0..n_lon {
        let min_lon = bbox.min_lon + i as f64 * size;
        let max_lon = (min_lon + size).min(bbox.max_lon);
        for j in 0..n_lat {
            let min_lat = bbox.min_lat + j as f64 * size;
            let max_lat = (min_lat + size).min(bbox.max_lat);
            let cell = BoundingBox::new(min_lon, min_lat, max_lon, max_lat);
            if !cell.is_empty() {
                cells.push(cell);
            }
        }
    }
    cells
}

fn lat_string(lat: f64) -> String {
    let lat = lat.round() as i64;
    format!("{}{:02}", if lat >= 0 { 'N' } else { 'S' }, lat.abs())
}

fn lon_string(lon: f64) -> String {
    let lon = lon.round() as i64;
    format!("{}{:03}", if lon >= 0 { 'E' } else { 'W' }, lon.abs())
}

/// `{kind}_{DIRECTION}_{lat}{lon}` named from the upper-left corner
pub fn partition_name(kind: MeasurementKind, direction: Option<OrbitDirection>, bounds: &BoundingBox) -> String {
    let direction = direction.map_or_else(|| "ALL".to_string(), |d| d.to_string());
    format!(
        "{}_{}_{}{}",
        kind,
        direction,
        lat_string(bounds.max_lat),
        lon_string(bounds.min_lon)
    )
}

/// Runs measurement and compositing over the partitions of an extent
pub struct PartitionDriver<'a, S: MeasurementSource> {
    source: &'a S,
    frames: &'a FrameIndex,
    params: PartitionParams,
}

impl<'a, S: MeasurementSource> PartitionDriver<'a, S> {
    pub fn new(source: &'a S, frames: &'a FrameIndex, params: PartitionParams) -> Self {
        Self { source, frames, params }
    }

    /// Priority of every frame in the index, computed once per job.
    ///
    /// Ranking the whole index rather than the frames of one partition keeps
    /// overlaps resolved the same way in every partition.
    pub fn ranking(&self) -> FrameRanking {
        let frames: Vec<Frame> = self
            .frames
            .frames()
            .filter(|f| self.params.orbit_direction.map_or(true, |d| f.orbit_direction == d))
            .cloned()
            .collect();
        FrameRanking::new(self.params.policy.policy().as_ref(), &frames)
    }

    /// Output grid covering the whole job extent
    pub fn job_grid(&self, extent: &BoundingBox) -> DispResult<RasterGrid> {
        let projected = project_bounds(extent, self.params.output_epsg)?;
        RasterGrid::anchored(&projected, self.params.output_epsg, self.params.resolution)
    }

    /// Measure and composite every intersecting frame for one partition of `job_grid`
    pub fn run_partition(
        &self,
        job_grid: &RasterGrid,
        ranking: &FrameRanking,
        bounds: &BoundingBox,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DispResult<PartitionOutcome> {
        let projected = project_bounds(bounds, self.params.output_epsg)?;
        let window = job_grid.window(&projected).ok_or_else(|| {
            DispError::Processing(format!("Partition {} covers no output pixels", bounds))
        })?;
        let grid = job_grid.crop(&window);

        let frames: Vec<Frame> = self
            .frames
            .intersecting(bounds, self.params.orbit_direction)
            .into_iter()
            .cloned()
            .collect();
        log::info!("Partition {}: {} intersecting frames", bounds, frames.len());

        let results = self.measure_frames(&frames, kind, start, end, &grid);

        let mut rasters = Vec::with_capacity(results.len());
        let mut frame_failures = Vec::new();
        for (frame_id, result) in results {
            match result {
                Ok(raster) => rasters.push(raster),
                Err(e) if e.is_no_data() => {
                    log::info!("Frame {} contributes nothing to partition {}: {}", frame_id, bounds, e);
                }
                Err(e) => {
                    log::error!(
                        "Frame {} failed in partition {} ({} to {}): {}",
                        frame_id,
                        bounds,
                        start.format("%Y-%m-%d"),
                        end.format("%Y-%m-%d"),
                        e
                    );
                    frame_failures.push(FrameFailure {
                        frame_id,
                        partition: *bounds,
                        start,
                        end,
                        error: e.to_string(),
                    });
                }
            }
        }

        let composite = FrameCompositor::new(grid.clone()).composite(&rasters, ranking)?;
        let frame_ids_used = composite.contributing_frames();
        let frame_references = composite.frame_references(&rasters);

        let manifest = TileManifest {
            extent: grid.extent().to_array(),
            epsg: grid.epsg,
            scale_range: ScaleRange::for_kind(kind),
            measurement_kind: kind,
            frame_ids_used,
            partition_bounds: Some(*bounds),
            frame_references,
        };

        Ok(PartitionOutcome {
            tile: MosaicTile {
                grid,
                data: composite.data,
                provenance: composite.provenance,
                manifest,
            },
            frame_failures,
        })
    }

    fn measure_frames(
        &self,
        frames: &[Frame],
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        grid: &RasterGrid,
    ) -> Vec<(FrameId, DispResult<MeasurementRaster>)> {
        let measure = |frame: &Frame| (frame.frame_id, self.source.measure(frame, kind, start, end, grid));

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            frames.par_iter().map(measure).collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            frames.iter().map(measure).collect()
        }
    }

    /// Output raster and manifest paths of one partition
    pub fn output_paths(&self, output_dir: &Path, kind: MeasurementKind, bounds: &BoundingBox) -> (PathBuf, PathBuf) {
        let name = partition_name(kind, self.params.orbit_direction, bounds);
        (
            output_dir.join(format!("{}.tif", name)),
            output_dir.join(format!("{}.json", name)),
        )
    }

    /// Process every partition of `extent`, writing one raster and manifest per partition
    pub fn run(
        &self,
        extent: &BoundingBox,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        output_dir: &Path,
    ) -> DispResult<PartitionReport> {
        let partitions = split_extent(extent, self.params.partition_size);
        if partitions.is_empty() {
            return Err(DispError::Processing(format!("Extent {} is empty", extent)));
        }
        std::fs::create_dir_all(output_dir)?;
        let job_grid = self.job_grid(extent)?;
        let ranking = self.ranking();

        log::info!(
            "Processing {} partitions of {}° over {} ({} {}x{} grid)",
            partitions.len(),
            self.params.partition_size,
            extent,
            kind,
            job_grid.width,
            job_grid.height
        );

        let process =
            |bounds: &BoundingBox| self.process_one(&job_grid, &ranking, bounds, kind, start, end, output_dir);

        #[cfg(feature = "parallel")]
        let statuses: Vec<PartitionStatus> = {
            use rayon::prelude::*;
            partitions.par_iter().map(process).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let statuses: Vec<PartitionStatus> = partitions.iter().map(process).collect();

        let mut report = PartitionReport::default();
        for status in statuses {
            match status {
                PartitionStatus::Completed(done, failures) => {
                    report.completed.push(done);
                    report.frame_failures.extend(failures);
                }
                PartitionStatus::Skipped(bounds) => report.skipped.push(bounds),
                PartitionStatus::Failed(failed) => report.failed.push(failed),
            }
        }

        log::info!(
            "Partitions: {} completed, {} skipped, {} failed, {} frame failures",
            report.completed.len(),
            report.skipped.len(),
            report.failed.len(),
            report.frame_failures.len()
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one(
        &self,
        job_grid: &RasterGrid,
        ranking: &FrameRanking,
        bounds: &BoundingBox,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        output_dir: &Path,
    ) -> PartitionStatus {
        let (raster_path, manifest_path) = self.output_paths(output_dir, kind, bounds);
        if self.params.resume && raster_path.exists() && manifest_path.exists() {
            log::info!("Skipping partition {}: {} already exists", bounds, raster_path.display());
            return PartitionStatus::Skipped(*bounds);
        }

        let attempt = catch_unwind(AssertUnwindSafe(|| -> DispResult<PartitionStatus> {
            let outcome = self.run_partition(job_grid, ranking, bounds, kind, start, end)?;
            geotiff::write_mosaic(&raster_path, &outcome.tile)?;
            geotiff::write_manifest(&manifest_path, &outcome.tile.manifest)?;
            Ok(PartitionStatus::Completed(
                CompletedPartition {
                    bounds: *bounds,
                    raster_path: raster_path.clone(),
                    manifest_path: manifest_path.clone(),
                    frame_ids_used: outcome.tile.manifest.frame_ids_used.clone(),
                },
                outcome.frame_failures,
            ))
        }));

        let error = match attempt {
            Ok(Ok(status)) => return status,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "partition panicked".to_string()),
        };

        log::error!(
            "Partition {} failed ({} {} to {}): {}",
            bounds,
            kind,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            error
        );
        // A half-written raster must not satisfy a later resume
        let _ = std::fs::remove_file(&manifest_path);
        PartitionStatus::Failed(FailedPartition { bounds: *bounds, error })
    }
}
