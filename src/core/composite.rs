use crate::core::frame_order::FrameRanking;
use crate::core::grid::RasterGrid;
use crate::types::{DispError, DispImage, DispResult, FrameId, FrameReference, MeasurementRaster, NODATA};
use ndarray::{Array2, ArrayView2, Zip};

/// One frame's values with its priority (0 = highest)
#[derive(Debug, Clone)]
pub struct RankedLayer<'a> {
    pub rank: u32,
    pub frame_id: FrameId,
    pub data: ArrayView2<'a, f32>,
}

/// Composited values plus the frame that supplied each pixel
#[derive(Debug, Clone)]
pub struct Composite {
    pub data: DispImage,
    /// 0 where no frame had data
    pub provenance: Array2<FrameId>,
}

impl Composite {
    fn empty(shape: (usize, usize)) -> Self {
        Self {
            data: Array2::from_elem(shape, NODATA),
            provenance: Array2::zeros(shape),
        }
    }

    /// Frames that supplied at least one pixel, ascending
    pub fn contributing_frames(&self) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self.provenance.iter().copied().filter(|id| *id != 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// References of the contributing frames among `rasters`, ordered by frame id
    pub fn frame_references(&self, rasters: &[MeasurementRaster]) -> Vec<FrameReference> {
        let used = self.contributing_frames();
        let mut references: Vec<FrameReference> = rasters
            .iter()
            .filter(|r| used.binary_search(&r.frame_id).is_ok())
            .filter_map(|r| r.reference)
            .collect();
        references.sort_by_key(|r| r.frame_id);
        references.dedup_by_key(|r| r.frame_id);
        references
    }
}

/// Best value seen so far at one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    value: f32,
    rank: u32,
    frame_id: FrameId,
}

impl Candidate {
    const NONE: Candidate = Candidate { value: NODATA, rank: u32::MAX, frame_id: 0 };

    fn is_valid(&self) -> bool {
        !self.value.is_nan()
    }

    /// Valid beats nodata; between valid values the lower (rank, frame id) wins.
    /// Associative and commutative, so any merge order gives the same pixel.
    fn combine(self, other: Candidate) -> Candidate {
        match (self.is_valid(), other.is_valid()) {
            (true, false) => self,
            (false, true) => other,
            (false, false) => Candidate::NONE,
            (true, true) => {
                if (self.rank, self.frame_id) <= (other.rank, other.frame_id) {
                    self
                } else {
                    other
                }
            }
        }
    }
}

fn candidates(layer: &RankedLayer) -> Array2<Candidate> {
    layer.data.mapv(|value| {
        if value.is_nan() {
            Candidate::NONE
        } else {
            Candidate { value, rank: layer.rank, frame_id: layer.frame_id }
        }
    })
}

fn merge(mut acc: Array2<Candidate>, other: Array2<Candidate>) -> Array2<Candidate> {
    Zip::from(&mut acc).and(&other).for_each(|a, b| *a = a.combine(*b));
    acc
}

fn check_shapes(shape: (usize, usize), layers: &[RankedLayer]) -> DispResult<()> {
    for layer in layers {
        if layer.data.dim() != shape {
            return Err(DispError::GridMismatch(format!(
                "Frame {} has shape {:?}, expected {:?}",
                layer.frame_id,
                layer.data.dim(),
                shape
            )));
        }
    }
    Ok(())
}

/// First-valid-wins composite as a reduction over per-pixel candidates
pub fn composite_layers(shape: (usize, usize), layers: &[RankedLayer]) -> DispResult<Composite> {
    check_shapes(shape, layers)?;

    #[cfg(feature = "parallel")]
    let reduced = {
        use rayon::prelude::*;
        layers
            .par_iter()
            .map(candidates)
            .reduce(|| Array2::from_elem(shape, Candidate::NONE), merge)
    };

    #[cfg(not(feature = "parallel"))]
    let reduced = layers
        .iter()
        .map(candidates)
        .fold(Array2::from_elem(shape, Candidate::NONE), merge);

    Ok(Composite {
        data: reduced.mapv(|c| c.value),
        provenance: reduced.mapv(|c| c.frame_id),
    })
}

fn priority_sorted<'a, 'b>(layers: &'b [RankedLayer<'a>]) -> Vec<&'b RankedLayer<'a>> {
    let mut sorted: Vec<&RankedLayer> = layers.iter().collect();
    sorted.sort_by_key(|l| (l.rank, l.frame_id));
    sorted
}

/// Start from the highest priority frame and only fill pixels still lacking data
pub fn fill_from_highest(shape: (usize, usize), layers: &[RankedLayer]) -> DispResult<Composite> {
    check_shapes(shape, layers)?;
    let mut out = Composite::empty(shape);
    for layer in priority_sorted(layers) {
        Zip::from(&mut out.data)
            .and(&mut out.provenance)
            .and(&layer.data)
            .for_each(|acc, source, value| {
                if acc.is_nan() && !value.is_nan() {
                    *acc = *value;
                    *source = layer.frame_id;
                }
            });
    }
    Ok(out)
}

/// Start from the lowest priority frame and let each higher priority frame
/// overwrite wherever it has data
pub fn overlay_from_lowest(shape: (usize, usize), layers: &[RankedLayer]) -> DispResult<Composite> {
    check_shapes(shape, layers)?;
    let mut out = Composite::empty(shape);
    for layer in priority_sorted(layers).into_iter().rev() {
        Zip::from(&mut out.data)
            .and(&mut out.provenance)
            .and(&layer.data)
            .for_each(|acc, source, value| {
                if !value.is_nan() {
                    *acc = *value;
                    *source = layer.frame_id;
                }
            });
    }
    Ok(out)
}

/// Merges per-frame measurement rasters on one grid
pub struct FrameCompositor {
    grid: RasterGrid,
}

impl FrameCompositor {
    pub fn new(grid: RasterGrid) -> Self {
        Self { grid }
    }

    /// Composite `rasters` by `ranking`; frames missing from the ranking go last
    pub fn composite(&self, rasters: &[MeasurementRaster], ranking: &FrameRanking) -> DispResult<Composite> {
        let mut layers = Vec::with_capacity(rasters.len());
        for raster in rasters {
            if !raster.grid.same_grid(&self.grid) {
                return Err(DispError::GridMismatch(format!(
                    "Frame {} raster is not on the composite grid",
                    raster.frame_id
                )));
            }
            let rank = ranking.rank(raster.frame_id).unwrap_or_else(|| {
                log::warn!("Frame {} has no priority rank; placing it last", raster.frame_id);
                u32::MAX - 1
            });
            layers.push(RankedLayer { rank, frame_id: raster.frame_id, data: raster.data.view() });
        }

        log::info!("Compositing {} frames onto {}x{} grid", layers.len(), self.grid.width, self.grid.height);
        let composite = composite_layers(self.grid.shape(), &layers)?;
        log::debug!("Contributing frames: {:?}", composite.contributing_frames());
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn layers<'a>(a: &'a DispImage, b: &'a DispImage, c: &'a DispImage) -> Vec<RankedLayer<'a>> {
        vec![
            RankedLayer { rank: 1, frame_id: 20, data: a.view() },
            RankedLayer { rank: 0, frame_id: 10, data: b.view() },
            RankedLayer { rank: 2, frame_id: 30, data: c.view() },
        ]
    }

    #[test]
    fn test_highest_priority_valid_value_wins() {
        let nan = f32::NAN;
        let a = array![[1.0, 1.0], [nan, nan]];
        let b = array![[2.0, nan], [nan, nan]];
        let c = array![[3.0, 3.0], [3.0, nan]];
        let result = composite_layers((2, 2), &layers(&a, &b, &c)).unwrap();

        assert_eq!(result.data[[0, 0]], 2.0);
        assert_eq!(result.data[[0, 1]], 1.0);
        assert_eq!(result.data[[1, 0]], 3.0);
        assert!(result.data[[1, 1]].is_nan());
        assert_eq!(result.provenance, array![[10, 20], [30, 0]]);
        assert_eq!(result.contributing_frames(), vec![10, 20, 30]);
    }

    #[test]
    fn test_formulations_agree_for_every_merge_order() {
        let nan = f32::NAN;
        let a = array![[1.0, nan, 1.0], [nan, 1.0, nan]];
        let b = array![[nan, 2.0, 2.0], [nan, nan, nan]];
        let c = array![[3.0, 3.0, nan], [3.0, 3.0, nan]];
        let base = layers(&a, &b, &c);
        let expected = fill_from_highest((2, 3), &base).unwrap();

        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let permuted: Vec<RankedLayer> = order.iter().map(|i| base[*i].clone()).collect();
            for result in [
                composite_layers((2, 3), &permuted).unwrap(),
                fill_from_highest((2, 3), &permuted).unwrap(),
                overlay_from_lowest((2, 3), &permuted).unwrap(),
            ] {
                assert_eq!(result.provenance, expected.provenance);
                for (x, y) in result.data.iter().zip(expected.data.iter()) {
                    assert!((x.is_nan() && y.is_nan()) || x == y);
                }
            }
        }
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = Array2::<f32>::zeros((2, 2));
        let layer = RankedLayer { rank: 0, frame_id: 1, data: a.view() };
        assert!(matches!(composite_layers((3, 3), &[layer]), Err(DispError::GridMismatch(_))));
    }
}
