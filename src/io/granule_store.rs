//! Scoped access to granule data.
//!
//! A [`GranuleHandle`] owns every remote or on-disk resource of one open granule
//! and releases them in `Drop`, so success, early `?` returns and unwinding all
//! close the handle. Reads go through [`load_granule`], which never lets a handle
//! outlive the read.

use crate::core::grid::RasterGrid;
use crate::types::{DispError, DispResult, Granule, GranuleRecord, GeoTransform, ReferencePoint};
use gdal::{Dataset, Metadata};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// One open granule; resources are released when the handle is dropped
pub trait GranuleHandle {
    fn record(&self) -> &GranuleRecord;

    /// Read the displacement band, mask and reference point
    fn read(&mut self) -> DispResult<Granule>;
}

/// Opens granules for reading
pub trait GranuleStore: Sync {
    fn open<'a>(&'a self, record: &GranuleRecord) -> DispResult<Box<dyn GranuleHandle + 'a>>;
}

/// Open, read and release one granule
pub fn load_granule<S: GranuleStore + ?Sized>(store: &S, record: &GranuleRecord) -> DispResult<Granule> {
    let mut handle = store.open(record)?;
    let granule = handle.read();
    drop(handle);
    granule
}

/// Bounded set of download workers shared by every granule load of a job.
///
/// Frames and partitions may run concurrently, but every load is executed on
/// this pool, so at most `workers` granules are being fetched at once.
pub struct DownloadPool {
    workers: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl DownloadPool {
    pub fn new(workers: usize) -> DispResult<Self> {
        let workers = workers.max(1);
        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("download-{}", i))
            .build()
            .map_err(|e| DispError::Processing(format!("Failed to build download pool: {}", e)))?;

        log::debug!("Download pool with {} workers", workers);
        Ok(Self {
            workers,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Open, read and release one granule on a pool worker
    pub fn load<S: GranuleStore + ?Sized>(&self, store: &S, record: &GranuleRecord) -> DispResult<Granule> {
        #[cfg(feature = "parallel")]
        {
            self.pool.install(|| load_granule(store, record))
        }

        #[cfg(not(feature = "parallel"))]
        {
            load_granule(store, record)
        }
    }

    /// Load granules and transform each as soon as it arrives.
    ///
    /// Only as many granules as the pool has workers are resident at once;
    /// `transform` should reduce each to what the caller keeps.
    pub fn load_with<S, T, F>(&self, store: &S, records: &[GranuleRecord], transform: F) -> DispResult<Vec<T>>
    where
        S: GranuleStore + ?Sized,
        T: Send,
        F: Fn(Granule) -> DispResult<T> + Sync,
    {
        let load = |record: &GranuleRecord| -> DispResult<T> {
            let granule = load_granule(store, record)?;
            transform(granule)
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.pool.install(|| records.par_iter().map(load).collect())
        }

        #[cfg(not(feature = "parallel"))]
        {
            records.iter().map(load).collect()
        }
    }

    /// Load granules, keeping them whole
    pub fn load_all<S: GranuleStore + ?Sized>(&self, store: &S, records: &[GranuleRecord]) -> DispResult<Vec<Granule>> {
        self.load_with(store, records, Ok)
    }
}

/// Variables holding the displacement band, in order of preference
const DISPLACEMENT_VARIABLES: [&str; 2] = ["short_wavelength_displacement", "displacement"];

/// Downloads granules over HTTPS and reads them with GDAL's netCDF driver
pub struct HttpGranuleStore {
    client: reqwest::blocking::Client,
    token: Option<String>,
    max_retries: u32,
}

impl HttpGranuleStore {
    pub fn new(token: Option<String>, timeout_secs: u64) -> DispResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("dispmosaic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispError::Processing(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, token, max_retries: 3 })
    }

    fn download(&self, record: &GranuleRecord) -> DispResult<NamedTempFile> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            log::debug!("Download attempt {} of {} for {}", attempt, self.max_retries, record.scene_name);
            match self.try_download_once(record) {
                Ok(file) => return Ok(file),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        log::warn!("Download attempt {} for {} failed, retrying...", attempt, record.scene_name);
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DispError::Processing("Download failed after all retries".to_string())))
    }

    fn try_download_once(&self, record: &GranuleRecord) -> DispResult<NamedTempFile> {
        let mut request = self.client.get(&record.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|e| DispError::Processing(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DispError::Processing(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                record.url
            )));
        }
        let content = response
            .bytes()
            .map_err(|e| DispError::Processing(format!("Failed to read response body: {}", e)))?;

        let mut file = tempfile::Builder::new().prefix("disp_").suffix(".nc").tempfile()?;
        file.write_all(&content)?;
        file.flush()?;
        log::debug!("Downloaded {} bytes for {}", content.len(), record.scene_name);
        Ok(file)
    }
}

impl GranuleStore for HttpGranuleStore {
    fn open<'a>(&'a self, record: &GranuleRecord) -> DispResult<Box<dyn GranuleHandle + 'a>> {
        log::info!("Opening granule {}", record.scene_name);
        let file = self.download(record)?;
        Ok(Box::new(NetcdfGranuleHandle { record: record.clone(), file }))
    }
}

/// Downloaded granule file; the file is deleted when the handle drops
struct NetcdfGranuleHandle {
    record: GranuleRecord,
    file: NamedTempFile,
}

impl NetcdfGranuleHandle {
    fn subdataset(&self, variable: &str) -> String {
        format!("NETCDF:\"{}\":{}", self.file.path().display(), variable)
    }

    fn open_displacement(&self) -> DispResult<Dataset> {
        for variable in DISPLACEMENT_VARIABLES {
            if let Ok(dataset) = Dataset::open(self.subdataset(variable)) {
                log::debug!("Reading {} from {}", variable, self.record.scene_name);
                return Ok(dataset);
            }
        }
        Err(DispError::InvalidFormat(format!(
            "{} has no displacement variable",
            self.record.scene_name
        )))
    }

    /// `(row, col)` of the reference pixel from the corrections group attributes
    fn reference_pixel(&self) -> DispResult<(usize, usize)> {
        let dataset = Dataset::open(self.subdataset("/corrections/reference_point"))?;
        let lookup = |suffix: &str| -> Option<usize> {
            dataset
                .metadata_domain("")?
                .iter()
                .filter_map(|entry| entry.split_once('='))
                .find(|(key, _)| key.ends_with(suffix))
                .and_then(|(_, value)| value.trim().parse::<f64>().ok())
                .map(|v| v as usize)
        };
        match (lookup("#rows"), lookup("#cols")) {
            (Some(row), Some(col)) => Ok((row, col)),
            _ => Err(DispError::Metadata(format!(
                "{} has no reference point attributes",
                self.record.scene_name
            ))),
        }
    }
}

fn read_band_f32(dataset: &Dataset) -> DispResult<Array2<f32>> {
    let (width, height) = dataset.raster_size();
    let rasterband = dataset.rasterband(1)?;
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| DispError::Processing(format!("Shape error: {}", e)))
}

impl GranuleHandle for NetcdfGranuleHandle {
    fn record(&self) -> &GranuleRecord {
        &self.record
    }

    fn read(&mut self) -> DispResult<Granule> {
        let dataset = self.open_displacement()?;
        let (width, height) = dataset.raster_size();
        let gt = dataset.geo_transform()?;
        let epsg = dataset.spatial_ref()?.auth_code()?;
        let epsg = u32::try_from(epsg)
            .map_err(|_| DispError::Metadata(format!("Invalid EPSG code {} in {}", epsg, self.record.scene_name)))?;
        let grid = RasterGrid::new(epsg, GeoTransform::from_gdal(&gt), width, height);

        let mut displacement = read_band_f32(&dataset)?;
        if let Ok(Some(nodata)) = dataset.rasterband(1).map(|b| b.no_data_value()) {
            let nodata = nodata as f32;
            displacement.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
        }
        drop(dataset);

        let recommended_mask = match Dataset::open(self.subdataset("recommended_mask")) {
            Ok(mask_ds) => Some(read_band_f32(&mask_ds)?.mapv(|v| v == 1.0)),
            Err(_) => {
                log::debug!("{} has no recommended mask", self.record.scene_name);
                None
            }
        };

        let (row, col) = self.reference_pixel()?;
        if row >= height || col >= width {
            return Err(DispError::Metadata(format!(
                "Reference pixel ({}, {}) lies outside {}x{} granule {}",
                row, col, width, height, self.record.scene_name
            )));
        }
        let (x, y) = grid.pixel_center(row, col);

        Ok(Granule {
            record: self.record.clone(),
            displacement,
            grid,
            reference_point: ReferencePoint { x, y, epsg },
            recommended_mask,
        })
    }
}

impl Drop for NetcdfGranuleHandle {
    fn drop(&mut self) {
        log::debug!("Released granule {}", self.record.scene_name);
    }
}

/// Serves pre-built granules and tracks how many handles are open
#[derive(Debug, Default)]
pub struct MemoryGranuleStore {
    granules: HashMap<String, Granule>,
    failing: HashSet<String>,
    open_handles: Arc<AtomicUsize>,
    opened_total: AtomicUsize,
}

impl MemoryGranuleStore {
    pub fn new(granules: impl IntoIterator<Item = Granule>) -> Self {
        Self {
            granules: granules
                .into_iter()
                .map(|g| (g.record.scene_name.clone(), g))
                .collect(),
            ..Self::default()
        }
    }

    /// Reads of `scene_name` fail after the handle is opened
    pub fn fail_reads_of(&mut self, scene_name: &str) {
        self.failing.insert(scene_name.to_string());
    }

    /// Handles currently open
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Handles opened over the store's lifetime
    pub fn opened_total(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }
}

impl GranuleStore for MemoryGranuleStore {
    fn open<'a>(&'a self, record: &GranuleRecord) -> DispResult<Box<dyn GranuleHandle + 'a>> {
        let granule = self.granules.get(&record.scene_name).ok_or_else(|| {
            DispError::Processing(format!("Granule {} not found in store", record.scene_name))
        })?;
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryGranuleHandle {
            granule,
            fail: self.failing.contains(&record.scene_name),
            open_handles: Arc::clone(&self.open_handles),
        }))
    }
}

struct MemoryGranuleHandle<'a> {
    granule: &'a Granule,
    fail: bool,
    open_handles: Arc<AtomicUsize>,
}

impl GranuleHandle for MemoryGranuleHandle<'_> {
    fn record(&self) -> &GranuleRecord {
        &self.granule.record
    }

    fn read(&mut self) -> DispResult<Granule> {
        if self.fail {
            return Err(DispError::InvalidFormat(format!(
                "Simulated read failure for {}",
                self.granule.record.scene_name
            )));
        }
        Ok(self.granule.clone())
    }
}

impl Drop for MemoryGranuleHandle<'_> {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::{Extent, WGS84_EPSG};
    use chrono::{TimeZone, Utc};

    fn granule(name: &str) -> Granule {
        let day = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        Granule {
            record: GranuleRecord {
                scene_name: name.to_string(),
                frame_id: 1,
                orbit_direction: None,
                relative_orbit: 0,
                reference_date: day,
                secondary_date: day,
                creation_date: day,
                url: String::new(),
                s3_uri: None,
            },
            displacement: Array2::zeros((2, 2)),
            grid: RasterGrid::anchored(&Extent::new(0.0, 0.0, 2.0, 2.0), WGS84_EPSG, 1.0).unwrap(),
            reference_point: ReferencePoint { x: 0.5, y: 0.5, epsg: WGS84_EPSG },
            recommended_mask: None,
        }
    }

    #[test]
    fn test_handle_released_after_read() {
        let store = MemoryGranuleStore::new(vec![granule("a")]);
        let loaded = load_granule(&store, &granule("a").record).unwrap();
        assert_eq!(loaded.record.scene_name, "a");
        assert_eq!(store.open_handles(), 0);
        assert_eq!(store.opened_total(), 1);
    }

    #[test]
    fn test_handle_released_on_read_error() {
        let mut store = MemoryGranuleStore::new(vec![granule("a"), granule("b")]);
        store.fail_reads_of("b");
        let records = vec![granule("a").record, granule("b").record];
        let pool = DownloadPool::new(2).unwrap();
        assert!(pool.load_all(&store, &records).is_err());
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn test_handle_released_when_transform_fails() {
        let store = MemoryGranuleStore::new(vec![granule("a"), granule("b")]);
        let records = vec![granule("a").record, granule("b").record];
        let pool = DownloadPool::new(1).unwrap();
        let result: DispResult<Vec<()>> =
            pool.load_with(&store, &records, |_| Err(DispError::Processing("rejected".to_string())));
        assert!(result.is_err());
        assert_eq!(store.open_handles(), 0);
    }
}
