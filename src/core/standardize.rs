//! Re-expresses granules against one spatiotemporal reference.
//!
//! Each granule's band is masked, warped onto the frame's canonical grid and shifted
//! so that it is relative to the canonical reference pixel. The resulting layers are
//! then chained onto a single reference date.

use crate::core::grid::{transform_points, GridWindow, PixelMapping, RasterGrid};
use crate::types::{
    within_one_day, DispError, DispImage, DispResult, FrameId, Granule, ReferencePoint,
    StandardizedStack, NODATA,
};
use chrono::{DateTime, Utc};
use ndarray::{s, Array2, Array3, Axis};

/// Reference every granule of a frame is expressed against
#[derive(Debug, Clone, PartialEq)]
pub struct SpatiotemporalReference {
    pub reference_date: DateTime<Utc>,
    pub reference_point: ReferencePoint,
    pub epsg: u32,
}

impl SpatiotemporalReference {
    /// Reference carried by a granule
    pub fn of(granule: &Granule) -> Self {
        Self {
            reference_date: granule.reference_date(),
            reference_point: granule.reference_point,
            epsg: granule.grid.epsg,
        }
    }
}

/// One granule after spatial standardization
#[derive(Debug, Clone)]
pub struct StandardizedLayer {
    pub reference_date: DateTime<Utc>,
    pub secondary_date: DateTime<Utc>,
    pub values: DispImage,
}

/// Spatial standardizer for the granules of one frame
#[derive(Debug, Clone)]
pub struct ReferenceStandardizer {
    frame_id: FrameId,
    grid: RasterGrid,
    reference: SpatiotemporalReference,
    window: Option<GridWindow>,
}

impl ReferenceStandardizer {
    /// Standardizer whose canonical grid and reference come from `canonical`
    pub fn from_granule(canonical: &Granule) -> Self {
        Self {
            frame_id: canonical.frame_id(),
            grid: canonical.grid.clone(),
            reference: SpatiotemporalReference::of(canonical),
            window: None,
        }
    }

    pub fn new(frame_id: FrameId, grid: RasterGrid, reference: SpatiotemporalReference) -> Self {
        Self { frame_id, grid, reference, window: None }
    }

    /// Keep only `window` of the canonical grid in every output layer
    pub fn with_window(mut self, window: Option<GridWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn canonical_grid(&self) -> &RasterGrid {
        &self.grid
    }

    /// Grid of the layers this standardizer produces
    pub fn output_grid(&self) -> RasterGrid {
        match &self.window {
            Some(window) => self.grid.crop(window),
            None => self.grid.clone(),
        }
    }

    pub fn reference(&self) -> &SpatiotemporalReference {
        &self.reference
    }

    /// Express one granule on the canonical grid relative to the canonical reference pixel
    pub fn standardize(&self, granule: &Granule) -> DispResult<StandardizedLayer> {
        if granule.frame_id() != self.frame_id {
            return Err(DispError::Processing(format!(
                "Granule {} belongs to frame {}, expected {}",
                granule.record.scene_name,
                granule.frame_id(),
                self.frame_id
            )));
        }

        let masked = apply_recommended_mask(granule)?;

        let same_grid = granule.grid.same_grid(&self.grid);
        let warped = if same_grid {
            masked
        } else {
            log::debug!(
                "Warping {} from EPSG:{} onto canonical EPSG:{} grid",
                granule.record.scene_name,
                granule.grid.epsg,
                self.grid.epsg
            );
            let mapping = PixelMapping::between(&granule.grid, &self.grid)?;
            if mapping.is_empty() {
                log::warn!(
                    "Granule {} does not overlap the canonical grid of frame {}; marking it nodata",
                    granule.record.scene_name,
                    self.frame_id
                );
                Array2::from_elem(self.grid.shape(), NODATA)
            } else {
                mapping.gather(&masked.view())
            }
        };

        let tolerance = 0.5 * self.grid.geo_transform.pixel_width.abs();
        let rereferenced = if granule
            .reference_point
            .same_location(&self.reference.reference_point, tolerance)
        {
            warped
        } else {
            self.shift_to_reference_pixel(granule, warped)?
        };

        let values = match &self.window {
            Some(w) => rereferenced
                .slice(s![w.row_offset..w.row_offset + w.rows, w.col_offset..w.col_offset + w.cols])
                .to_owned(),
            None => rereferenced,
        };

        Ok(StandardizedLayer {
            reference_date: granule.reference_date(),
            secondary_date: granule.secondary_date(),
            values,
        })
    }

    /// Subtract the value found at the canonical reference pixel
    fn shift_to_reference_pixel(&self, granule: &Granule, values: DispImage) -> DispResult<DispImage> {
        let point = self.reference.reference_point;
        let mut xs = [point.x];
        let mut ys = [point.y];
        transform_points(point.epsg, self.grid.epsg, &mut xs, &mut ys)?;

        let reference_value = self
            .grid
            .pixel_index(xs[0], ys[0])
            .map(|(r, c)| values[[r, c]])
            .filter(|v| !v.is_nan());

        match reference_value {
            Some(offset) => {
                log::debug!(
                    "Re-referencing {} to canonical reference pixel (offset {:.6})",
                    granule.record.scene_name,
                    offset
                );
                Ok(values.mapv(|v| v - offset))
            }
            None => {
                log::warn!(
                    "Granule {} has no value at the canonical reference pixel; marking it nodata",
                    granule.record.scene_name
                );
                Ok(Array2::from_elem(values.dim(), NODATA))
            }
        }
    }
}

/// Displacement band with invalid pixels set to nodata
pub fn apply_recommended_mask(granule: &Granule) -> DispResult<DispImage> {
    match &granule.recommended_mask {
        None => Ok(granule.displacement.clone()),
        Some(mask) => {
            if mask.dim() != granule.displacement.dim() {
                return Err(DispError::InvalidFormat(format!(
                    "Mask shape {:?} does not match displacement shape {:?} for {}",
                    mask.dim(),
                    granule.displacement.dim(),
                    granule.record.scene_name
                )));
            }
            let mut values = granule.displacement.clone();
            values.zip_mut_with(mask, |v, valid| {
                if !*valid {
                    *v = NODATA;
                }
            });
            Ok(values)
        }
    }
}

/// Every reference date after the first must appear as some secondary date
pub fn check_connected_network(layers: &[StandardizedLayer], frame_id: FrameId) -> DispResult<()> {
    let mut reference_dates: Vec<DateTime<Utc>> = layers.iter().map(|l| l.reference_date).collect();
    reference_dates.sort();
    reference_dates.dedup();

    for reference_date in reference_dates.iter().skip(1) {
        if !layers.iter().any(|l| within_one_day(*reference_date, l.secondary_date)) {
            log::warn!("Reference date {} of frame {} is not reachable", reference_date, frame_id);
            return Err(DispError::DisconnectedNetwork { frame_id });
        }
    }
    Ok(())
}

/// Chain layers onto the earliest date of the stack.
///
/// When `start_date` is on or before the first reference date, a zero layer dated at
/// that reference date is prepended. Otherwise the stack is re-referenced to its first
/// secondary date. Whenever the reference date changes, the correction becomes the
/// previous (already corrected) layer.
pub fn align_to_common_reference_date(
    mut layers: Vec<StandardizedLayer>,
    start_date: DateTime<Utc>,
    frame_id: FrameId,
    grid: RasterGrid,
    reference_point: ReferencePoint,
) -> DispResult<StandardizedStack> {
    if layers.is_empty() {
        return Err(DispError::Processing(format!("Frame {} has no layers to align", frame_id)));
    }
    let shape = layers[0].values.dim();
    if layers.iter().any(|l| l.values.dim() != shape) {
        return Err(DispError::GridMismatch(format!(
            "Layers of frame {} have different shapes",
            frame_id
        )));
    }

    layers.sort_by_key(|l| l.secondary_date);
    check_connected_network(&layers, frame_id)?;

    if start_date <= layers[0].reference_date {
        let date = layers[0].reference_date;
        layers.insert(
            0,
            StandardizedLayer {
                reference_date: date,
                secondary_date: date,
                values: Array2::zeros(shape),
            },
        );
    }

    let mut correction = layers[0].values.mapv(|v| -v);
    let mut previous_reference = layers[0].reference_date;
    let mut previous_values = layers[0].values.clone();

    for layer in layers.iter_mut() {
        if !within_one_day(layer.reference_date, previous_reference) {
            correction = previous_values.clone();
        }
        layer.values += &correction;
        previous_reference = layer.reference_date;
        previous_values = layer.values.clone();
    }

    let reference_date = layers[0].secondary_date;
    let secondary_dates: Vec<DateTime<Utc>> = layers.iter().map(|l| l.secondary_date).collect();

    let mut values = Array3::from_elem((layers.len(), shape.0, shape.1), NODATA);
    for (i, layer) in layers.into_iter().enumerate() {
        values.index_axis_mut(Axis(0), i).assign(&layer.values);
    }

    log::debug!(
        "Aligned {} layers of frame {} to reference date {}",
        secondary_dates.len(),
        frame_id,
        reference_date
    );

    Ok(StandardizedStack {
        frame_id,
        grid,
        reference_date,
        reference_point,
        secondary_dates,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::{Extent, WGS84_EPSG};
    use crate::types::GranuleRecord;
    use chrono::TimeZone;
    use ndarray::array;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap()
    }

    fn layer(values: [f32; 2], reference: u32, secondary: u32) -> StandardizedLayer {
        StandardizedLayer {
            reference_date: day(reference),
            secondary_date: day(secondary),
            values: Array2::from_shape_vec((1, 2), values.to_vec()).unwrap(),
        }
    }

    fn grid(width: usize) -> RasterGrid {
        RasterGrid::anchored(&Extent::new(0.0, 0.0, width as f64, 2.0), WGS84_EPSG, 1.0).unwrap()
    }

    fn point() -> ReferencePoint {
        ReferencePoint { x: 0.5, y: 1.5, epsg: WGS84_EPSG }
    }

    fn values_of(stack: &StandardizedStack) -> Vec<Vec<f32>> {
        stack.values.outer_iter().map(|l| l.iter().cloned().collect()).collect()
    }

    #[test]
    fn test_alignment_inserts_zero_epoch() {
        let layers = vec![
            layer([1.0, 0.0], 1, 2),
            layer([5.0, 0.0], 1, 3),
            layer([-1.0, 0.0], 3, 4),
            layer([7.0, 0.0], 3, 5),
            layer([-3.0, 1.0], 5, 6),
        ];
        let stack = align_to_common_reference_date(layers, day(1), 1, grid(2), point()).unwrap();
        assert_eq!(stack.reference_date, day(1));
        assert_eq!(stack.secondary_dates, vec![day(1), day(2), day(3), day(4), day(5), day(6)]);
        assert_eq!(
            values_of(&stack),
            vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![5.0, 0.0],
                vec![4.0, 0.0],
                vec![12.0, 0.0],
                vec![9.0, 1.0]
            ]
        );
    }

    #[test]
    fn test_alignment_rereferences_to_first_secondary() {
        let layers = vec![
            layer([1.0, 0.0], 1, 2),
            layer([5.0, 0.0], 1, 3),
            layer([-1.0, 0.0], 3, 4),
            layer([7.0, 0.0], 3, 5),
            layer([-3.0, 1.0], 5, 6),
        ];
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let stack = align_to_common_reference_date(layers, start, 1, grid(2), point()).unwrap();
        assert_eq!(stack.reference_date, day(2));
        assert_eq!(
            values_of(&stack),
            vec![
                vec![0.0, 0.0],
                vec![4.0, 0.0],
                vec![3.0, 0.0],
                vec![11.0, 0.0],
                vec![8.0, 1.0]
            ]
        );
    }

    #[test]
    fn test_alignment_rejects_disconnected_network() {
        let layers = vec![layer([1.0, 0.0], 1, 10), layer([2.0, 0.0], 20, 30)];
        let result = align_to_common_reference_date(layers, day(1), 7, grid(2), point());
        assert!(matches!(result, Err(DispError::DisconnectedNetwork { frame_id: 7 })));
    }

    fn granule(values: Array2<f32>, reference_point: ReferencePoint) -> Granule {
        let (rows, cols) = values.dim();
        Granule {
            record: GranuleRecord {
                scene_name: "test".to_string(),
                frame_id: 1,
                orbit_direction: None,
                relative_orbit: 0,
                reference_date: day(1),
                secondary_date: day(13),
                creation_date: day(14),
                url: String::new(),
                s3_uri: None,
            },
            displacement: values,
            grid: RasterGrid::anchored(&Extent::new(0.0, 0.0, cols as f64, rows as f64), WGS84_EPSG, 1.0).unwrap(),
            reference_point,
            recommended_mask: None,
        }
    }

    #[test]
    fn test_matching_granule_passes_through() {
        let g = granule(array![[1.0, 2.0], [3.0, 4.0]], point());
        let standardizer = ReferenceStandardizer::from_granule(&g);
        let layer = standardizer.standardize(&g).unwrap();
        assert_eq!(layer.values, g.displacement);
    }

    #[test]
    fn test_different_reference_pixel_is_subtracted() {
        let canonical = granule(array![[0.0, 0.0], [0.0, 0.0]], point());
        let other_point = ReferencePoint { x: 1.5, y: 0.5, epsg: WGS84_EPSG };
        let g = granule(array![[0.25, 2.0], [3.0, 4.0]], other_point);

        let layer = ReferenceStandardizer::from_granule(&canonical).standardize(&g).unwrap();
        assert_eq!(layer.values, array![[0.0, 1.75], [2.75, 3.75]]);
    }

    #[test]
    fn test_mask_marks_nodata() {
        let mut g = granule(array![[1.0, 2.0], [3.0, 4.0]], point());
        g.recommended_mask = Some(array![[true, false], [true, true]]);
        let values = apply_recommended_mask(&g).unwrap();
        assert!(values[[0, 1]].is_nan());
        assert_eq!(values[[1, 1]], 4.0);
    }

    #[test]
    fn test_non_overlapping_granule_becomes_nodata() {
        let canonical = granule(array![[0.0, 0.0], [0.0, 0.0]], point());
        let mut far = granule(array![[1.0, 2.0], [3.0, 4.0]], point());
        far.grid = RasterGrid::anchored(&Extent::new(50.0, 50.0, 52.0, 52.0), WGS84_EPSG, 1.0).unwrap();

        let layer = ReferenceStandardizer::from_granule(&canonical).standardize(&far).unwrap();
        assert!(layer.values.iter().all(|v| v.is_nan()));
    }
}
