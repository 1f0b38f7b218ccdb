use crate::core::grid::RasterGrid;
use crate::types::{
    BoundingBox, DispError, DispResult, FrameId, FrameReference, GeoTransform, MeasurementKind, MeasurementRaster,
    MosaicTile, ReferencePoint, TileManifest,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

const DATE_FORMAT: &str = "%Y%m%d";
const REF_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

fn file_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(displacement|velocity|secant_velocity)_(\d+)_(\d{8})_(\d{8})\.tif$").ok())
        .as_ref()
}

/// `{kind}_{frame:05}_{start}_{end}.tif`
pub fn measurement_file_name(
    kind: MeasurementKind,
    frame_id: FrameId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{}_{:05}_{}_{}.tif",
        kind,
        frame_id,
        start.format(DATE_FORMAT),
        end.format(DATE_FORMAT)
    )
}

/// Inverse of [`measurement_file_name`]
pub fn parse_measurement_file_name(name: &str) -> Option<(MeasurementKind, FrameId, DateTime<Utc>, DateTime<Utc>)> {
    let caps = file_name_pattern()?.captures(name)?;
    let kind = caps[1].parse().ok()?;
    let frame_id = caps[2].parse().ok()?;
    Some((kind, frame_id, parse_date(&caps[3]).ok()?, parse_date(&caps[4]).ok()?))
}

/// Parse a `YYYYMMDD` date as midnight UTC
pub fn parse_date(text: &str) -> DispResult<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| DispError::InvalidFormat(format!("Invalid date {}: {}", text, e)))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| DispError::InvalidFormat(format!("Invalid date {}", text)))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn join_ids(ids: &[FrameId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn bounds_tag(bounds: Option<&BoundingBox>) -> String {
    bounds
        .map(|b| {
            b.to_array()
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// Write a single float band with nodata NaN and the given metadata tags
fn write_band<P: AsRef<Path>>(
    path: P,
    grid: &RasterGrid,
    data: &Array2<f32>,
    tags: &[(String, String)],
) -> DispResult<()> {
    let path = path.as_ref();
    if data.dim() != grid.shape() {
        return Err(DispError::GridMismatch(format!(
            "Data shape {:?} does not match grid shape {:?}",
            data.dim(),
            grid.shape()
        )));
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "COMPRESS", value: "DEFLATE" },
        RasterCreationOption { key: "TILED", value: "YES" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        grid.width as isize,
        grid.height as isize,
        1,
        &options,
    )?;

    dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
    dataset.set_spatial_ref(&SpatialRef::from_epsg(grid.epsg)?)?;

    for (key, value) in tags {
        dataset.set_metadata_item(key, value, "")?;
    }

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<f32> = data.iter().cloned().collect();
    let buffer = Buffer::new((grid.width, grid.height), flat_data);
    rasterband.write((0, 0), (grid.width, grid.height), &buffer)?;
    rasterband.set_no_data_value(Some(f32::NAN as f64))?;

    log::debug!("Wrote {}x{} raster to {}", grid.width, grid.height, path.display());
    Ok(())
}

fn tag(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn kind_tags(kind: MeasurementKind) -> Vec<(String, String)> {
    let (lo, hi) = kind.valid_range();
    vec![
        tag("UNITS", kind.units()),
        tag("VALID_RANGE", format!("{},{}", lo, hi)),
        tag("MEASUREMENT_KIND", kind),
    ]
}

/// `OPERA_FRAMES` plus the `FRAME_{id}_*` reference of every frame
fn reference_tags(references: &[FrameReference]) -> Vec<(String, String)> {
    if references.is_empty() {
        return Vec::new();
    }
    let ids: Vec<String> = references.iter().map(|r| r.frame_id.to_string()).collect();
    let mut tags = vec![tag("OPERA_FRAMES", ids.join(", "))];
    for r in references {
        let prefix = format!("FRAME_{}", r.frame_id);
        tags.push(tag(&format!("{}_REF_POINT_EASTINGNORTHING", prefix), format!("{}, {}", r.point.x, r.point.y)));
        tags.push(tag(&format!("{}_REF_POINT_GEO", prefix), format!("{}, {}", r.point_geo[0], r.point_geo[1])));
        tags.push(tag(&format!("{}_EPSG", prefix), r.point.epsg));
        tags.push(tag(&format!("{}_REF_TIME", prefix), r.reference_date.format(REF_TIME_FORMAT)));
    }
    tags
}

fn parse_pair(text: &str) -> Option<[f64; 2]> {
    let mut parts = text.split(',').map(|p| p.trim().parse::<f64>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(a)), Some(Ok(b)), None) => Some([a, b]),
        _ => None,
    }
}

/// Reference tags of `frame_id`; `None` when the raster carries none
pub fn read_frame_reference(dataset: &Dataset, frame_id: FrameId) -> DispResult<Option<FrameReference>> {
    let prefix = format!("FRAME_{}", frame_id);
    let item = |suffix: &str| dataset.metadata_item(&format!("{}_{}", prefix, suffix), "");
    let Some(epsg) = item("EPSG") else {
        return Ok(None);
    };
    let invalid = |suffix: &str| DispError::Metadata(format!("Invalid or missing {}_{} tag", prefix, suffix));

    let epsg: u32 = epsg.trim().parse().map_err(|_| invalid("EPSG"))?;
    let [x, y] = item("REF_POINT_EASTINGNORTHING")
        .as_deref()
        .and_then(parse_pair)
        .ok_or_else(|| invalid("REF_POINT_EASTINGNORTHING"))?;
    let point_geo = item("REF_POINT_GEO")
        .as_deref()
        .and_then(parse_pair)
        .ok_or_else(|| invalid("REF_POINT_GEO"))?;
    let reference_date = item("REF_TIME")
        .and_then(|t| NaiveDateTime::parse_from_str(&t, REF_TIME_FORMAT).ok())
        .map(|t| Utc.from_utc_datetime(&t))
        .ok_or_else(|| invalid("REF_TIME"))?;

    Ok(Some(FrameReference {
        frame_id,
        point: ReferencePoint { x, y, epsg },
        point_geo,
        reference_date,
    }))
}

/// Write one frame's measurement raster
pub fn write_measurement<P: AsRef<Path>>(
    path: P,
    raster: &MeasurementRaster,
    partition_bounds: Option<&BoundingBox>,
) -> DispResult<()> {
    log::info!("Saving {} for frame {} to {}", raster.kind, raster.frame_id, path.as_ref().display());
    let mut tags = kind_tags(raster.kind);
    tags.push(tag("FRAME_IDS", raster.frame_id));
    tags.push(tag("PARTITION_BOUNDS", bounds_tag(partition_bounds)));
    tags.push(tag("START_DATE", raster.start_date.format(DATE_FORMAT)));
    tags.push(tag("END_DATE", raster.end_date.format(DATE_FORMAT)));
    let references: Vec<FrameReference> = raster.reference.into_iter().collect();
    tags.extend(reference_tags(&references));
    write_band(path, &raster.grid, &raster.data, &tags)
}

/// Write a composited tile
pub fn write_mosaic<P: AsRef<Path>>(path: P, tile: &MosaicTile) -> DispResult<()> {
    log::info!("Saving mosaic to {}", path.as_ref().display());
    let manifest = &tile.manifest;
    let mut tags = kind_tags(manifest.measurement_kind);
    tags.push(tag("FRAME_IDS", join_ids(&manifest.frame_ids_used)));
    tags.push(tag("PARTITION_BOUNDS", bounds_tag(manifest.partition_bounds.as_ref())));
    tags.extend(reference_tags(&manifest.frame_references));
    write_band(path, &tile.grid, &tile.data, &tags)
}

/// Write a manifest as pretty JSON
pub fn write_manifest<P: AsRef<Path>>(path: P, manifest: &TileManifest) -> DispResult<()> {
    let text = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path.as_ref(), text)?;
    log::debug!("Wrote manifest {}", path.as_ref().display());
    Ok(())
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> DispResult<TileManifest> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Grid and first band of a single-band GeoTIFF
pub fn read_band<P: AsRef<Path>>(path: P) -> DispResult<(RasterGrid, Array2<f32>, Dataset)> {
    let dataset = Dataset::open(path.as_ref())?;
    let gt = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();
    let epsg = dataset.spatial_ref()?.auth_code()?;
    let epsg = u32::try_from(epsg)
        .map_err(|_| DispError::Metadata(format!("Invalid EPSG code {}", epsg)))?;

    let rasterband = dataset.rasterband(1)?;
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    let data = Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| DispError::Processing(format!("Shape error: {}", e)))?;

    let grid = RasterGrid::new(epsg, GeoTransform::from_gdal(&gt), width, height);
    Ok((grid, data, dataset))
}

/// Read a measurement raster written by [`write_measurement`]
pub fn read_measurement<P: AsRef<Path>>(path: P) -> DispResult<MeasurementRaster> {
    let path = path.as_ref();
    log::debug!("Reading measurement raster {}", path.display());
    let (grid, data, dataset) = read_band(path)?;

    let from_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_measurement_file_name);

    let kind = match dataset.metadata_item("MEASUREMENT_KIND", "") {
        Some(k) => k.parse()?,
        None => from_name
            .map(|(k, ..)| k)
            .ok_or_else(|| DispError::Metadata(format!("{} has no MEASUREMENT_KIND tag", path.display())))?,
    };
    let frame_id = match dataset.metadata_item("FRAME_IDS", "") {
        Some(ids) => ids
            .split(',')
            .next()
            .and_then(|id| id.trim().parse().ok())
            .ok_or_else(|| DispError::Metadata(format!("Invalid FRAME_IDS tag {}", ids)))?,
        None => from_name
            .map(|(_, id, ..)| id)
            .ok_or_else(|| DispError::Metadata(format!("{} has no FRAME_IDS tag", path.display())))?,
    };
    let date_tag = |key: &str, fallback: Option<DateTime<Utc>>| -> DispResult<DateTime<Utc>> {
        match dataset.metadata_item(key, "") {
            Some(text) => parse_date(&text),
            None => fallback.ok_or_else(|| DispError::Metadata(format!("{} has no {} tag", path.display(), key))),
        }
    };
    let start_date = date_tag("START_DATE", from_name.map(|(_, _, s, _)| s))?;
    let end_date = date_tag("END_DATE", from_name.map(|(.., e)| e))?;
    let reference = read_frame_reference(&dataset, frame_id)?;

    Ok(MeasurementRaster { frame_id, kind, start_date, end_date, grid, data, reference })
}
