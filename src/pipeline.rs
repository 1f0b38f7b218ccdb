//! End-to-end operations: per-frame measurement rasters and mosaics.

use crate::config::RunConfig;
use crate::core::composite::FrameCompositor;
use crate::core::frame_order::FrameRanking;
use crate::core::granule_select::GranuleSelector;
use crate::core::grid::{warp_to_grid, Extent, PixelMapping, RasterGrid};
use crate::core::measurement::MeasurementCalculator;
use crate::core::partition::MeasurementSource;
use crate::core::standardize::{align_to_common_reference_date, ReferenceStandardizer};
use crate::io::catalog::GranuleCatalog;
use crate::io::frames::{Frame, FrameIndex};
use crate::io::geotiff;
use crate::io::granule_store::{DownloadPool, GranuleStore};
use crate::types::{
    DispError, DispResult, FrameId, MeasurementKind, MeasurementRaster, MosaicTile, ScaleRange, StandardizedStack,
    TileManifest, MAX_FRAME_ID,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Name of the composited raster written by [`create_mosaic`]
pub const MOSAIC_FILE_NAME: &str = "mosaic.tif";
/// Name of the bounds manifest written by [`create_mosaic`]
pub const EXTENT_FILE_NAME: &str = "extent.json";

pub fn validate_frame_id(frame_id: FrameId) -> DispResult<()> {
    if frame_id == 0 || frame_id > MAX_FRAME_ID {
        return Err(DispError::InvalidFormat(format!(
            "Frame id {} must be between 1 and {}",
            frame_id, MAX_FRAME_ID
        )));
    }
    Ok(())
}

/// Selects, loads, standardizes and measures the granules of one frame.
///
/// Every granule load of every frame measured through one processor shares a
/// single [`DownloadPool`] of `max_concurrent_downloads` workers.
pub struct FrameProcessor<'a, C: GranuleCatalog + ?Sized, S: GranuleStore + ?Sized> {
    catalog: &'a C,
    store: &'a S,
    selector: GranuleSelector,
    calculator: MeasurementCalculator,
    downloads: DownloadPool,
}

impl<'a, C: GranuleCatalog + ?Sized, S: GranuleStore + ?Sized> FrameProcessor<'a, C, S> {
    pub fn new(catalog: &'a C, store: &'a S, config: &RunConfig) -> DispResult<Self> {
        Ok(Self {
            catalog,
            store,
            selector: GranuleSelector::new(config.selection),
            calculator: MeasurementCalculator::with_params(config.measurement_params()),
            downloads: DownloadPool::new(config.max_concurrent_downloads)?,
        })
    }

    /// Standardized stack of one frame.
    ///
    /// With a `target` grid only the source pixels that grid samples are kept, and
    /// the returned mapping resamples the stack onto it. `None` means the frame does
    /// not overlap the target.
    fn stack(
        &self,
        frame_id: FrameId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: Option<&RasterGrid>,
    ) -> DispResult<Option<(StandardizedStack, Option<PixelMapping>)>> {
        validate_frame_id(frame_id)?;
        let records = self.catalog.granules_for_frame(frame_id)?;
        let selected = self.selector.select(frame_id, &records, start, end)?;

        let first = self.downloads.load(self.store, &selected[0])?;
        let standardizer = ReferenceStandardizer::from_granule(&first);

        let (mapping, window) = match target {
            None => (None, None),
            Some(target) => {
                let mapping = PixelMapping::between(standardizer.canonical_grid(), target)?;
                match mapping.source_window() {
                    None => {
                        log::debug!("Frame {} does not overlap the target grid", frame_id);
                        return Ok(None);
                    }
                    Some(window) => (Some(mapping.relative_to(&window)), Some(window)),
                }
            }
        };
        let standardizer = standardizer.with_window(window);

        let mut layers = Vec::with_capacity(selected.len());
        layers.push(standardizer.standardize(&first)?);
        drop(first);
        layers.extend(
            self.downloads
                .load_with(self.store, &selected[1..], |granule| standardizer.standardize(&granule))?,
        );

        let stack = align_to_common_reference_date(
            layers,
            start,
            frame_id,
            standardizer.output_grid(),
            standardizer.reference().reference_point,
        )?;
        Ok(Some((stack, mapping)))
    }

    /// Measurement on the frame's own canonical grid
    pub fn measure_native(
        &self,
        frame_id: FrameId,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DispResult<MeasurementRaster> {
        match self.stack(frame_id, start, end, None)? {
            Some((stack, _)) => self.calculator.compute(kind, &stack, start, end),
            None => Err(DispError::Processing(format!("Frame {} produced no stack", frame_id))),
        }
    }

    /// Measurement resampled onto `target`; nodata everywhere when the frame misses it
    pub fn measure_on_grid(
        &self,
        frame_id: FrameId,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: &RasterGrid,
    ) -> DispResult<MeasurementRaster> {
        let (stack, mapping) = match self.stack(frame_id, start, end, Some(target))? {
            Some(found) => found,
            None => return Ok(MeasurementRaster::empty(frame_id, kind, start, end, target.clone())),
        };

        let mut raster = self.calculator.compute(kind, &stack, start, end)?;
        if let Some(mapping) = mapping {
            raster.data = mapping.gather(&raster.data.view());
            raster.grid = target.clone();
        }
        Ok(raster)
    }
}

impl<C: GranuleCatalog + ?Sized, S: GranuleStore + ?Sized> MeasurementSource for FrameProcessor<'_, C, S> {
    fn measure(
        &self,
        frame: &Frame,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: &RasterGrid,
    ) -> DispResult<MeasurementRaster> {
        self.measure_on_grid(frame.frame_id, kind, start, end, target)
    }
}

/// Compute one frame's measurement and write `{kind}_{frame}_{start}_{end}.tif` into `output_dir`
#[allow(clippy::too_many_arguments)]
pub fn create_measurement<C: GranuleCatalog + ?Sized, S: GranuleStore + ?Sized>(
    catalog: &C,
    store: &S,
    config: &RunConfig,
    frame_id: FrameId,
    kind: MeasurementKind,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    output_dir: &Path,
) -> DispResult<PathBuf> {
    log::info!(
        "Creating {} for frame {} from {} to {}",
        kind,
        frame_id,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    config.validate()?;

    let processor = FrameProcessor::new(catalog, store, config)?;
    let native = processor.measure_native(frame_id, kind, start, end)?;

    let target = native.grid.reprojected(config.output_epsg, config.resolution)?;
    let data = warp_to_grid(&native.data.view(), &native.grid, &target)?;
    let raster = MeasurementRaster { grid: target, data, ..native };

    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(geotiff::measurement_file_name(kind, frame_id, start, end));
    geotiff::write_measurement(&path, &raster, None)?;
    log::info!("Wrote {} ({} valid pixels)", path.display(), raster.valid_pixels());
    Ok(path)
}

/// Composited raster and manifest written by [`create_mosaic`]
#[derive(Debug, Clone)]
pub struct MosaicOutput {
    pub raster_path: PathBuf,
    pub manifest_path: PathBuf,
    pub tile: MosaicTile,
}

/// Smallest output grid enclosing every input raster
fn union_grid(rasters: &[MeasurementRaster], epsg: u32, resolution: f64) -> DispResult<RasterGrid> {
    let mut union = Extent::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for raster in rasters {
        let extent = raster.grid.reprojected(epsg, resolution)?.extent();
        union.min_x = union.min_x.min(extent.min_x);
        union.min_y = union.min_y.min(extent.min_y);
        union.max_x = union.max_x.max(extent.max_x);
        union.max_y = union.max_y.max(extent.max_y);
    }
    RasterGrid::anchored(&union, epsg, resolution)
}

/// Composite measurement GeoTIFFs into `mosaic.tif` plus `extent.json`.
///
/// Frames are ranked with the configured policy when `frames` knows them,
/// otherwise by frame number.
pub fn create_mosaic(
    inputs: &[PathBuf],
    output_dir: &Path,
    frames: Option<&FrameIndex>,
    config: &RunConfig,
) -> DispResult<MosaicOutput> {
    if inputs.is_empty() {
        return Err(DispError::Processing("No input rasters to mosaic".to_string()));
    }
    log::info!("Creating mosaic from {} rasters", inputs.len());

    let rasters = inputs
        .iter()
        .map(geotiff::read_measurement)
        .collect::<DispResult<Vec<_>>>()?;

    let kind = rasters[0].kind;
    if let Some(other) = rasters.iter().find(|r| r.kind != kind) {
        return Err(DispError::InvalidFormat(format!(
            "Cannot mosaic {} with {} (frame {})",
            kind, other.kind, other.frame_id
        )));
    }

    let grid = union_grid(&rasters, config.output_epsg, config.resolution)?;
    let aligned = rasters
        .into_iter()
        .map(|r| -> DispResult<MeasurementRaster> {
            let data = warp_to_grid(&r.data.view(), &r.grid, &grid)?;
            Ok(MeasurementRaster { grid: grid.clone(), data, ..r })
        })
        .collect::<DispResult<Vec<_>>>()?;

    let ids: Vec<FrameId> = aligned.iter().map(|r| r.frame_id).collect();
    let ranking = match frames {
        Some(index) => {
            let known: Vec<Frame> = ids.iter().filter_map(|id| index.get(*id).cloned()).collect();
            FrameRanking::new(config.policy.policy().as_ref(), &known)
        }
        None => {
            let mut order = ids.clone();
            order.sort_unstable();
            order.dedup();
            FrameRanking::from_order(order)
        }
    };

    let composite = FrameCompositor::new(grid.clone()).composite(&aligned, &ranking)?;
    let manifest = TileManifest {
        extent: grid.extent().to_array(),
        epsg: grid.epsg,
        scale_range: ScaleRange::for_kind(kind),
        measurement_kind: kind,
        frame_ids_used: composite.contributing_frames(),
        partition_bounds: None,
        frame_references: composite.frame_references(&aligned),
    };
    let tile = MosaicTile {
        grid,
        data: composite.data,
        provenance: composite.provenance,
        manifest,
    };

    std::fs::create_dir_all(output_dir)?;
    let raster_path = output_dir.join(MOSAIC_FILE_NAME);
    let manifest_path = output_dir.join(EXTENT_FILE_NAME);
    geotiff::write_mosaic(&raster_path, &tile)?;
    geotiff::write_manifest(&manifest_path, &tile.manifest)?;

    Ok(MosaicOutput { raster_path, manifest_path, tile })
}
