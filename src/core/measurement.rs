use crate::types::{
    years_between, DispError, DispImage, DispResult, FrameReference, MeasurementKind, MeasurementRaster,
    StandardizedStack, NODATA,
};
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1, ArrayView3, Axis, Zip};

/// Measurement calculation parameters
#[derive(Debug, Clone)]
pub struct MeasurementParams {
    /// Smallest fraction of valid observations a pixel needs for a velocity fit
    pub min_valid_fraction: f64,
    /// Saturate output into the kind's valid range
    pub clip_to_valid_range: bool,
}

impl Default for MeasurementParams {
    fn default() -> Self {
        Self {
            min_valid_fraction: 0.9, // at most 10% missing
            clip_to_valid_range: true,
        }
    }
}

/// Reduces a standardized stack to one displacement or velocity raster
pub struct MeasurementCalculator {
    params: MeasurementParams,
}

impl MeasurementCalculator {
    pub fn new() -> Self {
        Self { params: MeasurementParams::default() }
    }

    pub fn with_params(params: MeasurementParams) -> Self {
        Self { params }
    }

    /// Compute `kind` over `[start_date, end_date]` for a standardized stack
    pub fn compute(
        &self,
        kind: MeasurementKind,
        stack: &StandardizedStack,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> DispResult<MeasurementRaster> {
        if stack.is_empty() {
            return Err(DispError::Processing(format!(
                "Frame {} has an empty stack",
                stack.frame_id
            )));
        }
        if stack.values.len_of(Axis(0)) != stack.len() {
            return Err(DispError::Processing(format!(
                "Stack of frame {} has {} layers but {} dates",
                stack.frame_id,
                stack.values.len_of(Axis(0)),
                stack.len()
            )));
        }

        log::info!(
            "Computing {} for frame {} from {} layers",
            kind,
            stack.frame_id,
            stack.len()
        );

        let raw = match kind {
            MeasurementKind::Displacement => displacement_nearest(stack, end_date),
            MeasurementKind::Velocity => self.velocity(stack),
            MeasurementKind::SecantVelocity => secant_velocity(stack),
        };

        let data = if self.params.clip_to_valid_range {
            clip_to_range(&raw, kind.valid_range())
        } else {
            raw
        };

        let raster = MeasurementRaster {
            frame_id: stack.frame_id,
            kind,
            start_date,
            end_date,
            grid: stack.grid.clone(),
            data,
            reference: Some(FrameReference::new(stack.frame_id, stack.reference_point, stack.reference_date)?),
        };

        if !raster.has_data() {
            log::warn!(
                "Frame {} has no usable {} between {} and {}",
                stack.frame_id,
                kind,
                start_date.format("%Y-%m-%d"),
                end_date.format("%Y-%m-%d")
            );
        } else {
            log::debug!("Frame {}: {} valid pixels", stack.frame_id, raster.valid_pixels());
        }
        Ok(raster)
    }

    /// Per-pixel least-squares slope against elapsed years
    pub fn velocity(&self, stack: &StandardizedStack) -> DispImage {
        let first = stack.secondary_dates[0];
        let years: Vec<f64> = stack
            .secondary_dates
            .iter()
            .map(|d| years_between(first, *d))
            .collect();
        velocity_from_cube(&years, stack.values.view(), self.params.min_valid_fraction)
    }
}

impl Default for MeasurementCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Layer whose secondary date is nearest `end_date`
fn displacement_nearest(stack: &StandardizedStack, end_date: DateTime<Utc>) -> DispImage {
    let nearest = stack
        .secondary_dates
        .iter()
        .enumerate()
        .min_by_key(|(i, d)| ((**d - end_date).num_seconds().abs(), std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    stack.values.index_axis(Axis(0), nearest).to_owned()
}

/// `(last - first) / elapsed years`, nodata when no time elapsed
fn secant_velocity(stack: &StandardizedStack) -> DispImage {
    let n = stack.len();
    let elapsed = years_between(stack.secondary_dates[0], stack.secondary_dates[n - 1]);
    let first = stack.values.index_axis(Axis(0), 0);
    let last = stack.values.index_axis(Axis(0), n - 1);

    if elapsed <= 0.0 {
        return Array2::from_elem(first.dim(), NODATA);
    }
    Zip::from(&first)
        .and(&last)
        .map_collect(|a, b| ((*b as f64 - *a as f64) / elapsed) as f32)
}

/// Velocity over a `time x row x column` cube sampled at `years`
pub fn velocity_from_cube(years: &[f64], cube: ArrayView3<f32>, min_valid_fraction: f64) -> DispImage {
    let lanes = cube.lanes(Axis(0));

    #[cfg(feature = "parallel")]
    {
        Zip::from(lanes).par_map_collect(|series| pixel_velocity(years, series, min_valid_fraction))
    }

    #[cfg(not(feature = "parallel"))]
    {
        Zip::from(lanes).map_collect(|series| pixel_velocity(years, series, min_valid_fraction))
    }
}

/// Slope of one pixel's series; missing samples count as zero when enough are valid
pub fn pixel_velocity(years: &[f64], series: ArrayView1<f32>, min_valid_fraction: f64) -> f32 {
    let n = series.len();
    if n == 0 || years.len() != n {
        return NODATA;
    }
    let valid = series.iter().filter(|v| !v.is_nan()).count();
    if (valid as f64) < min_valid_fraction * n as f64 - 1e-9 {
        return NODATA;
    }

    let ys = series.iter().map(|v| if v.is_nan() { 0.0 } else { *v as f64 });
    ols_slope(years, ys).map_or(NODATA, |s| s as f32)
}

/// Ordinary least-squares slope; `None` for fewer than two points or constant x
pub fn ols_slope(x: &[f64], y: impl IntoIterator<Item = f64>) -> Option<f64> {
    let y: Vec<f64> = y.into_iter().collect();
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }

    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        sxy += dx * (yi - mean_y);
        sxx += dx * dx;
    }

    if sxx == 0.0 {
        None
    } else {
        Some(sxy / sxx)
    }
}

/// Saturate values into `[min, max]`; nodata stays nodata
pub fn clip_to_range(data: &DispImage, (min, max): (f32, f32)) -> DispImage {
    data.mapv(|v| if v.is_nan() { v } else { v.clamp(min, max) })
}
