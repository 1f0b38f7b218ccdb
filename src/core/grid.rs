use crate::types::{BoundingBox, DispError, DispResult, GeoTransform, NODATA};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

pub const WGS84_EPSG: u32 = 4326;
pub const WEB_MERCATOR_EPSG: u32 = 3857;

/// WGS84 semi-major axis used by spherical mercator
const EARTH_RADIUS: f64 = 6_378_137.0;
/// Latitude limit of spherical mercator
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_6;

/// Rectangular extent in a projected coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }
}

/// Rectangular block of pixels inside a larger grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridWindow {
    pub row_offset: usize,
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Projection, resolution and extent shared by every raster in a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub epsg: u32,
    pub geo_transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

impl RasterGrid {
    pub fn new(epsg: u32, geo_transform: GeoTransform, width: usize, height: usize) -> Self {
        Self { epsg, geo_transform, width, height }
    }

    /// Grid anchored at the upper-left corner of `extent`
    pub fn anchored(extent: &Extent, epsg: u32, resolution: f64) -> DispResult<Self> {
        if resolution <= 0.0 || !resolution.is_finite() {
            return Err(DispError::Processing(format!("Invalid grid resolution: {}", resolution)));
        }
        if extent.is_empty() {
            return Err(DispError::Processing(format!("Empty grid extent: {:?}", extent)));
        }

        let width = ((extent.max_x - extent.min_x) / resolution).ceil() as usize;
        let height = ((extent.max_y - extent.min_y) / resolution).ceil() as usize;
        let geo_transform = GeoTransform::north_up(extent.min_x, extent.max_y, resolution, resolution);

        Ok(Self::new(epsg, geo_transform, width, height))
    }

    /// Array shape as (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Map coordinates of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.geo_transform.pixel_to_map(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Pixel containing a map coordinate, if inside the grid
    pub fn pixel_index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.geo_transform.map_to_pixel(x, y);
        if !col.is_finite() || !row.is_finite() || col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row.floor() as usize, col.floor() as usize);
        if row < self.height && col < self.width {
            Some((row, col))
        } else {
            None
        }
    }

    pub fn extent(&self) -> Extent {
        let corners = [
            self.geo_transform.pixel_to_map(0.0, 0.0),
            self.geo_transform.pixel_to_map(self.width as f64, 0.0),
            self.geo_transform.pixel_to_map(0.0, self.height as f64),
            self.geo_transform.pixel_to_map(self.width as f64, self.height as f64),
        ];
        let mut extent = Extent::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            extent.min_x = extent.min_x.min(x);
            extent.min_y = extent.min_y.min(y);
            extent.max_x = extent.max_x.max(x);
            extent.max_y = extent.max_y.max(y);
        }
        extent
    }

    /// Same projection, shape and transform (within a thousandth of a pixel)
    pub fn same_grid(&self, other: &RasterGrid) -> bool {
        if self.epsg != other.epsg || self.width != other.width || self.height != other.height {
            return false;
        }
        let tol = 1e-3 * self.geo_transform.pixel_width.abs().max(self.geo_transform.pixel_height.abs());
        self.geo_transform
            .to_gdal()
            .iter()
            .zip(other.geo_transform.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Pixels whose centres fall in the half-open extent `[min, max)`.
    ///
    /// Adjacent extents sharing an edge select disjoint windows whose union is
    /// the window of the combined extent.
    pub fn window(&self, extent: &Extent) -> Option<GridWindow> {
        let gt = &self.geo_transform;
        if gt.rotation_x != 0.0 || gt.rotation_y != 0.0 {
            return None;
        }

        let clamp = |v: f64, max: usize| -> usize {
            if v <= 0.0 {
                0
            } else {
                (v as usize).min(max)
            }
        };

        let col_start = clamp(((extent.min_x - gt.top_left_x) / gt.pixel_width - 0.5).ceil(), self.width);
        let col_end = clamp(((extent.max_x - gt.top_left_x) / gt.pixel_width - 0.5).ceil(), self.width);
        let row_start = clamp(((extent.max_y - gt.top_left_y) / gt.pixel_height - 0.5).floor() + 1.0, self.height);
        let row_end = clamp(((extent.min_y - gt.top_left_y) / gt.pixel_height - 0.5).floor() + 1.0, self.height);

        if col_end <= col_start || row_end <= row_start {
            return None;
        }

        Some(GridWindow {
            row_offset: row_start,
            col_offset: col_start,
            rows: row_end - row_start,
            cols: col_end - col_start,
        })
    }

    /// Sub-grid covering a window of this grid
    pub fn crop(&self, window: &GridWindow) -> RasterGrid {
        let (x, y) = self
            .geo_transform
            .pixel_to_map(window.col_offset as f64, window.row_offset as f64);
        let geo_transform = GeoTransform { top_left_x: x, top_left_y: y, ..self.geo_transform };
        RasterGrid::new(self.epsg, geo_transform, window.cols, window.rows)
    }

    /// Grid of `resolution` in `epsg` enclosing this grid's extent
    pub fn reprojected(&self, epsg: u32, resolution: f64) -> DispResult<RasterGrid> {
        let extent = self.extent();
        if epsg == self.epsg {
            return RasterGrid::anchored(&extent, epsg, resolution);
        }

        let steps = 32;
        let mut xs = Vec::with_capacity(4 * steps);
        let mut ys = Vec::with_capacity(4 * steps);
        for i in 0..steps {
            let t = i as f64 / (steps - 1) as f64;
            let x = extent.min_x + t * (extent.max_x - extent.min_x);
            let y = extent.min_y + t * (extent.max_y - extent.min_y);
            xs.extend_from_slice(&[x, x, extent.min_x, extent.max_x]);
            ys.extend_from_slice(&[extent.min_y, extent.max_y, y, y]);
        }
        transform_points(self.epsg, epsg, &mut xs, &mut ys)?;

        let mut projected = Extent::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in xs.iter().zip(ys.iter()) {
            projected.min_x = projected.min_x.min(*x);
            projected.min_y = projected.min_y.min(*y);
            projected.max_x = projected.max_x.max(*x);
            projected.max_y = projected.max_y.max(*y);
        }
        RasterGrid::anchored(&projected, epsg, resolution)
    }
}

/// Project a WGS84 bounding box into `epsg`
pub fn project_bounds(bbox: &BoundingBox, epsg: u32) -> DispResult<Extent> {
    match epsg {
        WGS84_EPSG => Ok(Extent::new(bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat)),
        WEB_MERCATOR_EPSG => {
            let (min_x, min_y) = lonlat_to_mercator(bbox.min_lon, bbox.min_lat);
            let (max_x, max_y) = lonlat_to_mercator(bbox.max_lon, bbox.max_lat);
            Ok(Extent::new(min_x, min_y, max_x, max_y))
        }
        _ => {
            // Sample the edges so curved boundaries are enclosed
            let steps = 16;
            let mut xs = Vec::with_capacity(4 * steps);
            let mut ys = Vec::with_capacity(4 * steps);
            for i in 0..steps {
                let t = i as f64 / (steps - 1) as f64;
                let lon = bbox.min_lon + t * (bbox.max_lon - bbox.min_lon);
                let lat = bbox.min_lat + t * (bbox.max_lat - bbox.min_lat);
                xs.extend_from_slice(&[lon, lon, bbox.min_lon, bbox.max_lon]);
                ys.extend_from_slice(&[bbox.min_lat, bbox.max_lat, lat, lat]);
            }
            transform_points(WGS84_EPSG, epsg, &mut xs, &mut ys)?;

            let mut extent = Extent::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
            for (x, y) in xs.iter().zip(ys.iter()) {
                extent.min_x = extent.min_x.min(*x);
                extent.min_y = extent.min_y.min(*y);
                extent.max_x = extent.max_x.max(*x);
                extent.max_y = extent.max_y.max(*y);
            }
            Ok(extent)
        }
    }
}

fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

/// Transform coordinates in place between two EPSG codes (x = easting/longitude)
pub fn transform_points(src_epsg: u32, dst_epsg: u32, xs: &mut [f64], ys: &mut [f64]) -> DispResult<()> {
    if xs.len() != ys.len() {
        return Err(DispError::Processing("Coordinate arrays differ in length".to_string()));
    }

    match (src_epsg, dst_epsg) {
        (a, b) if a == b => Ok(()),
        (WGS84_EPSG, WEB_MERCATOR_EPSG) => {
            for (x, y) in xs.iter_mut().zip(ys.iter_mut()) {
                (*x, *y) = lonlat_to_mercator(*x, *y);
            }
            Ok(())
        }
        (WEB_MERCATOR_EPSG, WGS84_EPSG) => {
            for (x, y) in xs.iter_mut().zip(ys.iter_mut()) {
                (*x, *y) = mercator_to_lonlat(*x, *y);
            }
            Ok(())
        }
        _ => {
            let src = SpatialRef::from_epsg(src_epsg)?;
            let dst = SpatialRef::from_epsg(dst_epsg)?;
            src.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
            dst.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
            let transform = CoordTransform::new(&src, &dst)?;
            let mut zs = vec![0.0; xs.len()];
            transform.transform_coords(xs, ys, &mut zs)?;
            Ok(())
        }
    }
}

/// Nearest-neighbour lookup from every target pixel to a source pixel
#[derive(Debug, Clone)]
pub struct PixelMapping {
    target_shape: (usize, usize),
    indices: Vec<Option<(usize, usize)>>,
}

impl PixelMapping {
    /// Mapping for two identical grids
    pub fn identity(grid: &RasterGrid) -> Self {
        let (rows, cols) = grid.shape();
        let indices = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| Some((r, c))))
            .collect();
        Self { target_shape: (rows, cols), indices }
    }

    /// Map each `target` pixel centre to the `source` pixel containing it
    pub fn between(source: &RasterGrid, target: &RasterGrid) -> DispResult<Self> {
        if source.same_grid(target) {
            return Ok(Self::identity(target));
        }

        let (rows, cols) = target.shape();
        let mut xs = Vec::with_capacity(rows * cols);
        let mut ys = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                let (x, y) = target.pixel_center(row, col);
                xs.push(x);
                ys.push(y);
            }
        }

        transform_points(target.epsg, source.epsg, &mut xs, &mut ys).map_err(|e| {
            DispError::GridMismatch(format!(
                "Cannot reproject EPSG:{} onto EPSG:{}: {}",
                source.epsg, target.epsg, e
            ))
        })?;

        let indices = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| source.pixel_index(*x, *y))
            .collect();

        Ok(Self { target_shape: (rows, cols), indices })
    }

    pub fn target_shape(&self) -> (usize, usize) {
        self.target_shape
    }

    /// No target pixel falls inside the source grid
    pub fn is_empty(&self) -> bool {
        self.indices.iter().all(Option::is_none)
    }

    /// Smallest source window holding every referenced pixel
    pub fn source_window(&self) -> Option<GridWindow> {
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for (r, c) in self.indices.iter().flatten() {
            bounds = Some(match bounds {
                None => (*r, *r, *c, *c),
                Some((r0, r1, c0, c1)) => (r0.min(*r), r1.max(*r), c0.min(*c), c1.max(*c)),
            });
        }
        bounds.map(|(r0, r1, c0, c1)| GridWindow {
            row_offset: r0,
            col_offset: c0,
            rows: r1 - r0 + 1,
            cols: c1 - c0 + 1,
        })
    }

    /// Same mapping with source indices relative to `window`
    pub fn relative_to(&self, window: &GridWindow) -> PixelMapping {
        let indices = self
            .indices
            .iter()
            .map(|idx| {
                idx.and_then(|(r, c)| {
                    let inside = r >= window.row_offset
                        && c >= window.col_offset
                        && r < window.row_offset + window.rows
                        && c < window.col_offset + window.cols;
                    inside.then(|| (r - window.row_offset, c - window.col_offset))
                })
            })
            .collect();
        PixelMapping { target_shape: self.target_shape, indices }
    }

    /// Sample `source` at every target pixel; unmapped pixels become nodata
    pub fn gather(&self, source: &ArrayView2<f32>) -> Array2<f32> {
        let (rows, cols) = self.target_shape;
        let mut out = Array2::from_elem((rows, cols), NODATA);
        for (i, idx) in self.indices.iter().enumerate() {
            if let Some((r, c)) = idx {
                if let Some(v) = source.get((*r, *c)) {
                    out[[i / cols, i % cols]] = *v;
                }
            }
        }
        out
    }
}

/// Resample `data` from `source` onto `target` by nearest neighbour
pub fn warp_to_grid(data: &ArrayView2<f32>, source: &RasterGrid, target: &RasterGrid) -> DispResult<Array2<f32>> {
    if data.dim() != source.shape() {
        return Err(DispError::GridMismatch(format!(
            "Array shape {:?} does not match grid shape {:?}",
            data.dim(),
            source.shape()
        )));
    }
    if source.same_grid(target) {
        return Ok(data.to_owned());
    }
    let mapping = PixelMapping::between(source, target)?;
    Ok(mapping.gather(data))
}
