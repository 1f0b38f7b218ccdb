#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use dispmosaic::core::grid::{Extent, RasterGrid, WGS84_EPSG};
use dispmosaic::io::frames::Frame;
use dispmosaic::types::{years_between, BoundingBox, FrameId, Granule, GranuleRecord, OrbitDirection, ReferencePoint};
use ndarray::Array2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Synthetic frame whose products live on a WGS84 grid of `resolution` degrees
#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    pub frame_id: FrameId,
    pub bounds: BoundingBox,
    pub resolution: f64,
    pub range_rank: u32,
    /// Velocity in m/yr at a map coordinate
    pub rate: fn(f64, f64) -> f64,
}

impl SyntheticFrame {
    pub fn grid(&self) -> RasterGrid {
        let extent = Extent::new(self.bounds.min_lon, self.bounds.min_lat, self.bounds.max_lon, self.bounds.max_lat);
        RasterGrid::anchored(&extent, WGS84_EPSG, self.resolution).unwrap()
    }

    pub fn frame(&self) -> Frame {
        Frame {
            frame_id: self.frame_id,
            orbit_direction: OrbitDirection::Ascending,
            relative_orbit: 64,
            range_rank: self.range_rank,
            epsg: WGS84_EPSG,
            bounds: self.bounds,
            latest_acquisition: None,
        }
    }

    pub fn reference_point(&self) -> ReferencePoint {
        let (x, y) = self.grid().pixel_center(0, 0);
        ReferencePoint { x, y, epsg: WGS84_EPSG }
    }

    /// Expected velocity at every pixel of the frame grid
    pub fn rates(&self) -> Array2<f32> {
        let grid = self.grid();
        Array2::from_shape_fn(grid.shape(), |(r, c)| {
            let (x, y) = grid.pixel_center(r, c);
            (self.rate)(x, y) as f32
        })
    }

    pub fn record(&self, reference: DateTime<Utc>, secondary: DateTime<Utc>) -> GranuleRecord {
        GranuleRecord {
            scene_name: format!(
                "OPERA_L3_DISP-S1_IW_F{:05}_VV_{}_{}_v1.0_{}",
                self.frame_id,
                reference.format("%Y%m%dT000000Z"),
                secondary.format("%Y%m%dT000000Z"),
                secondary.format("%Y%m%dT120000Z"),
            ),
            frame_id: self.frame_id,
            orbit_direction: Some(OrbitDirection::Ascending),
            relative_orbit: 64,
            reference_date: reference,
            secondary_date: secondary,
            creation_date: secondary + Duration::hours(12),
            url: format!("memory://{}", self.frame_id),
            s3_uri: None,
        }
    }

    /// Granule whose band holds displacement accumulated since its reference date
    pub fn granule(&self, reference: DateTime<Utc>, secondary: DateTime<Utc>) -> Granule {
        let elapsed = (years_between(reference, secondary)) as f32;
        Granule {
            record: self.record(reference, secondary),
            displacement: self.rates().mapv(|r| r * elapsed),
            grid: self.grid(),
            reference_point: self.reference_point(),
            recommended_mask: None,
        }
    }

    /// `count` acquisitions every 12 days after `start`, with the reference date
    /// moving forward every `ministack` acquisitions
    pub fn series(&self, start: DateTime<Utc>, count: usize, ministack: usize) -> Vec<Granule> {
        let dates: Vec<DateTime<Utc>> = (0..=count as i64).map(|i| start + Duration::days(12 * i)).collect();
        (1..=count)
            .map(|i| {
                let reference = dates[((i - 1) / ministack) * ministack];
                self.granule(reference, dates[i])
            })
            .collect()
    }
}

pub fn assert_same_pixels(a: &Array2<f32>, b: &Array2<f32>) {
    assert_eq!(a.dim(), b.dim());
    for ((idx, x), y) in a.indexed_iter().zip(b.iter()) {
        assert!(
            (x.is_nan() && y.is_nan()) || x == y,
            "pixel {:?} differs: {} vs {}",
            idx,
            x,
            y
        );
    }
}
