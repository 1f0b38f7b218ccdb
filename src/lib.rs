//! dispmosaic: displacement and velocity mosaics from overlapping Sentinel-1 DISP frames
//!
//! This library turns the dated granules of OPERA DISP frames into per-frame
//! displacement or velocity rasters and composites overlapping frames into
//! seamless mosaics, partition by partition.

pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{CatalogContext, RunConfig};
pub use pipeline::{create_measurement, create_mosaic, FrameProcessor, MosaicOutput};
pub use types::{
    BoundingBox, DispError, DispResult, FrameId, FrameReference, Granule, GranuleRecord, MeasurementKind,
    MeasurementRaster, MosaicTile, OrbitDirection, TileManifest,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::composite::{composite_layers, RankedLayer};
    use crate::core::measurement::velocity_from_cube;
    use crate::io::catalog::CmrCatalog;
    use crate::io::geotiff::parse_date;
    use crate::io::granule_store::HttpGranuleStore;
    use crate::{MeasurementKind, RunConfig};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
    use pyo3::prelude::*;
    use std::path::Path;

    fn to_py_err(e: crate::DispError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    /// Per-pixel velocity of a `time x row x column` cube sampled at `years`
    #[pyfunction]
    #[pyo3(signature = (years, cube, min_valid_fraction = 0.9))]
    fn velocity_from_stack<'py>(
        py: Python<'py>,
        years: Vec<f64>,
        cube: PyReadonlyArray3<f32>,
        min_valid_fraction: f64,
    ) -> PyResult<&'py PyArray2<f32>> {
        let cube = cube.as_array();
        if cube.shape()[0] != years.len() {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "Cube has {} layers but {} times were given",
                cube.shape()[0],
                years.len()
            )));
        }
        Ok(velocity_from_cube(&years, cube, min_valid_fraction).into_pyarray(py))
    }

    /// First-valid-wins composite; returns (values, contributing frame per pixel)
    #[pyfunction]
    fn composite_arrays<'py>(
        py: Python<'py>,
        arrays: Vec<PyReadonlyArray2<f32>>,
        ranks: Vec<u32>,
        frame_ids: Vec<u32>,
    ) -> PyResult<(&'py PyArray2<f32>, &'py PyArray2<u32>)> {
        if arrays.is_empty() || arrays.len() != ranks.len() || arrays.len() != frame_ids.len() {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(
                "arrays, ranks and frame_ids must be non-empty and the same length",
            ));
        }
        let views: Vec<_> = arrays.iter().map(|a| a.as_array()).collect();
        let layers: Vec<RankedLayer> = views
            .iter()
            .zip(ranks.iter().zip(frame_ids.iter()))
            .map(|(data, (rank, frame_id))| RankedLayer { rank: *rank, frame_id: *frame_id, data: data.view() })
            .collect();
        let composite = composite_layers(views[0].dim(), &layers).map_err(to_py_err)?;
        Ok((composite.data.into_pyarray(py), composite.provenance.into_pyarray(py)))
    }

    /// Create `{kind}_{frame}_{start}_{end}.tif` in `output_dir` and return its path
    #[pyfunction]
    #[pyo3(signature = (frame_id, kind, start, end, output_dir = ".", config_path = None, token = None))]
    fn create_measurement(
        frame_id: u32,
        kind: &str,
        start: &str,
        end: &str,
        output_dir: &str,
        config_path: Option<&str>,
        token: Option<String>,
    ) -> PyResult<String> {
        let mut config = match config_path {
            Some(path) => RunConfig::from_file(path).map_err(to_py_err)?,
            None => RunConfig::default(),
        };
        if token.is_some() {
            config.catalog.token = token;
        }
        let kind: MeasurementKind = kind.parse().map_err(to_py_err)?;
        let start = parse_date(start).map_err(to_py_err)?;
        let end = parse_date(end).map_err(to_py_err)?;

        let catalog = CmrCatalog::new(config.catalog.clone()).map_err(to_py_err)?;
        let store =
            HttpGranuleStore::new(config.catalog.token.clone(), config.catalog.timeout_secs).map_err(to_py_err)?;
        let path = crate::pipeline::create_measurement(
            &catalog,
            &store,
            &config,
            frame_id,
            kind,
            start,
            end,
            Path::new(output_dir),
        )
        .map_err(to_py_err)?;
        Ok(path.display().to_string())
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(velocity_from_stack, m)?)?;
        m.add_function(wrap_pyfunction!(composite_arrays, m)?)?;
        m.add_function(wrap_pyfunction!(create_measurement, m)?)?;
        Ok(())
    }
}
