use crate::core::grid::{transform_points, RasterGrid, WGS84_EPSG};
use chrono::{DateTime, Duration, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// OPERA frame identifier
pub type FrameId = u32;

/// Real-valued displacement sample (meters or meters/year)
pub type DispReal = f32;

/// 2D displacement raster (row x column)
pub type DispImage = Array2<DispReal>;

/// 3D displacement stack (time x row x column)
pub type DispCube = Array3<DispReal>;

/// Nodata marker used in every raster this crate produces
pub const NODATA: DispReal = DispReal::NAN;

/// Frame ids assigned by the OPERA frame database
pub const MAX_FRAME_ID: FrameId = 46986;

/// Sentinel-1 orbit pass direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrbitDirection {
    Ascending,
    Descending,
}

impl std::fmt::Display for OrbitDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrbitDirection::Ascending => write!(f, "ASCENDING"),
            OrbitDirection::Descending => write!(f, "DESCENDING"),
        }
    }
}

impl std::str::FromStr for OrbitDirection {
    type Err = DispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ASCENDING" | "ASC" => Ok(OrbitDirection::Ascending),
            "DESCENDING" | "DES" | "DESC" => Ok(OrbitDirection::Descending),
            _ => Err(DispError::InvalidFormat(format!("Invalid orbit direction: {}", s))),
        }
    }
}

/// Product computed from a frame's time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Cumulative displacement at the end of the date range
    Displacement,
    /// Least-squares linear rate over the stack
    Velocity,
    /// Last minus first over elapsed time, no regression
    SecantVelocity,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Displacement => "displacement",
            MeasurementKind::Velocity => "velocity",
            MeasurementKind::SecantVelocity => "secant_velocity",
        }
    }

    pub fn units(&self) -> &'static str {
        match self {
            MeasurementKind::Displacement => "m",
            MeasurementKind::Velocity | MeasurementKind::SecantVelocity => "m/yr",
        }
    }

    /// Fixed output range; values outside saturate to the nearest bound
    pub fn valid_range(&self) -> (DispReal, DispReal) {
        match self {
            MeasurementKind::Displacement => (-0.25, 0.25),
            MeasurementKind::Velocity | MeasurementKind::SecantVelocity => (-0.03, 0.03),
        }
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MeasurementKind {
    type Err = DispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "displacement" => Ok(MeasurementKind::Displacement),
            "velocity" => Ok(MeasurementKind::Velocity),
            "secant_velocity" => Ok(MeasurementKind::SecantVelocity),
            _ => Err(DispError::InvalidFormat(format!(
                "Invalid measurement kind: {} (expected displacement, velocity or secant_velocity)",
                s
            ))),
        }
    }
}

/// Geographic bounding box in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    pub fn is_empty(&self) -> bool {
        self.max_lon <= self.min_lon || self.max_lat <= self.min_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
            && self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
    }

    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.min_lon, self.min_lat, self.max_lon, self.max_lat)
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of a fractional pixel position (column, row)
    pub fn pixel_to_map(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position (column, row) of map coordinates
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        (col, row)
    }
}

/// Location of a granule's reference pixel in map coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub x: f64,
    pub y: f64,
    pub epsg: u32,
}

impl ReferencePoint {
    /// Two reference points are the same when they fall in the same pixel
    pub fn same_location(&self, other: &ReferencePoint, tolerance: f64) -> bool {
        self.epsg == other.epsg
            && (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
    }
}

/// Spatial and temporal reference that one frame's values are relative to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameReference {
    pub frame_id: FrameId,
    /// Reference pixel in the frame's native projection
    pub point: ReferencePoint,
    /// Reference pixel as `[lon, lat]`
    pub point_geo: [f64; 2],
    pub reference_date: DateTime<Utc>,
}

impl FrameReference {
    pub fn new(frame_id: FrameId, point: ReferencePoint, reference_date: DateTime<Utc>) -> DispResult<Self> {
        let (mut xs, mut ys) = ([point.x], [point.y]);
        transform_points(point.epsg, WGS84_EPSG, &mut xs, &mut ys)?;
        Ok(Self { frame_id, point, point_geo: [xs[0], ys[0]], reference_date })
    }
}

/// Catalog entry for one dated DISP product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleRecord {
    pub scene_name: String,
    pub frame_id: FrameId,
    pub orbit_direction: Option<OrbitDirection>,
    pub relative_orbit: u32,
    pub reference_date: DateTime<Utc>,
    pub secondary_date: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
    /// HTTPS download location
    pub url: String,
    /// Direct (in-region) access location
    pub s3_uri: Option<String>,
}

/// One granule with its displacement band loaded
#[derive(Debug, Clone)]
pub struct Granule {
    pub record: GranuleRecord,
    pub displacement: DispImage,
    pub grid: RasterGrid,
    pub reference_point: ReferencePoint,
    pub recommended_mask: Option<Array2<bool>>,
}

impl Granule {
    pub fn frame_id(&self) -> FrameId {
        self.record.frame_id
    }

    pub fn reference_date(&self) -> DateTime<Utc> {
        self.record.reference_date
    }

    pub fn secondary_date(&self) -> DateTime<Utc> {
        self.record.secondary_date
    }
}

/// Per-frame measurement on a canonical grid
#[derive(Debug, Clone)]
pub struct MeasurementRaster {
    pub frame_id: FrameId,
    pub kind: MeasurementKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub grid: RasterGrid,
    /// NaN marks nodata
    pub data: DispImage,
    /// Reference of the values; `None` for a raster with no contribution
    pub reference: Option<FrameReference>,
}

impl MeasurementRaster {
    /// Raster with no contribution anywhere
    pub fn empty(
        frame_id: FrameId,
        kind: MeasurementKind,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        grid: RasterGrid,
    ) -> Self {
        let data = Array2::from_elem(grid.shape(), NODATA);
        Self { frame_id, kind, start_date, end_date, grid, data, reference: None }
    }

    pub fn valid_pixels(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn has_data(&self) -> bool {
        self.data.iter().any(|v| !v.is_nan())
    }
}

/// Numeric scale and units of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRange {
    pub range: [f64; 2],
    pub units: String,
}

impl ScaleRange {
    pub fn for_kind(kind: MeasurementKind) -> Self {
        let (lo, hi) = kind.valid_range();
        Self { range: [lo as f64, hi as f64], units: kind.units().to_string() }
    }
}

/// Machine-readable description of a composited raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileManifest {
    /// `[min_x, min_y, max_x, max_y]` in the output projection
    pub extent: [f64; 4],
    #[serde(rename = "EPSG")]
    pub epsg: u32,
    pub scale_range: ScaleRange,
    pub measurement_kind: MeasurementKind,
    pub frame_ids_used: Vec<FrameId>,
    pub partition_bounds: Option<BoundingBox>,
    /// Reference of each contributing frame, ordered by frame id
    #[serde(default)]
    pub frame_references: Vec<FrameReference>,
}

/// Composited raster plus which frame supplied each pixel
#[derive(Debug, Clone)]
pub struct MosaicTile {
    pub grid: RasterGrid,
    pub data: DispImage,
    /// Contributing frame per pixel, 0 where nodata
    pub provenance: Array2<FrameId>,
    pub manifest: TileManifest,
}

/// Two acquisition timestamps refer to the same date
pub fn within_one_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() < Duration::days(1).num_seconds()
}

/// Elapsed fractional years from `start` to `date`
pub fn years_between(start: DateTime<Utc>, date: DateTime<Utc>) -> f64 {
    (date - start).num_seconds() as f64 / 86_400.0 / 365.25
}

/// Error types for displacement processing
#[derive(Debug, thiserror::Error)]
pub enum DispError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("No data for frame {frame_id} between {start} and {end}")]
    NoDataInRange {
        frame_id: FrameId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Granules for frame {frame_id} do not form a connected network")]
    DisconnectedNetwork { frame_id: FrameId },

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),
}

impl DispError {
    /// Missing data is a normal outcome for a single frame
    pub fn is_no_data(&self) -> bool {
        matches!(self, DispError::NoDataInRange { .. })
    }
}

/// Result type for displacement operations
pub type DispResult<T> = Result<T, DispError>;

/// Stack of granules already expressed against one reference
#[derive(Debug, Clone)]
pub struct StandardizedStack {
    pub frame_id: FrameId,
    pub grid: RasterGrid,
    pub reference_date: DateTime<Utc>,
    pub reference_point: ReferencePoint,
    pub secondary_dates: Vec<DateTime<Utc>>,
    /// time x row x column, NaN where missing
    pub values: DispCube,
}

impl StandardizedStack {
    pub fn len(&self) -> usize {
        self.secondary_dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secondary_dates.is_empty()
    }
}
