mod common;

use chrono::{DateTime, Utc};
use common::{assert_same_pixels, date, init_logging, SyntheticFrame};
use dispmosaic::core::grid::{project_bounds, RasterGrid, WGS84_EPSG};
use dispmosaic::core::frame_order::PolicyKind;
use dispmosaic::core::partition::{MeasurementSource, PartitionDriver, PartitionParams};
use dispmosaic::core::granule_select::SelectionStrategy;
use dispmosaic::io::catalog::MemoryCatalog;
use dispmosaic::io::frames::{Frame, FrameIndex};
use dispmosaic::io::geotiff;
use dispmosaic::io::granule_store::MemoryGranuleStore;
use dispmosaic::types::{BoundingBox, DispError, DispResult, FrameId, MeasurementKind, MeasurementRaster};
use dispmosaic::{FrameProcessor, RunConfig};
use tempfile::TempDir;

const RESOLUTION: f64 = 0.015625;

fn frames() -> Vec<SyntheticFrame> {
    vec![
        SyntheticFrame {
            frame_id: 101,
            bounds: BoundingBox::new(0.0, 0.0, 1.5, 2.0),
            resolution: 2.0 * RESOLUTION,
            range_rank: 1,
            rate: |x, y| 0.004 * x - 0.003 * y,
        },
        SyntheticFrame {
            frame_id: 202,
            bounds: BoundingBox::new(0.75, 0.25, 2.0, 2.0),
            resolution: 2.0 * RESOLUTION,
            range_rank: 0,
            rate: |x, y| 0.002 + 0.004 * x - 0.003 * y,
        },
    ]
}

fn params(partition_size: f64) -> PartitionParams {
    PartitionParams {
        partition_size,
        output_epsg: WGS84_EPSG,
        resolution: RESOLUTION,
        resume: true,
        ..PartitionParams::default()
    }
}

fn extent() -> BoundingBox {
    BoundingBox::new(0.0, 0.0, 2.0, 2.0)
}

/// Frames of two ascending orbits. Orbit 10 starts at the west edge of the job, but
/// its eastern frame alone starts east of orbit 20, and both overlaps straddle the
/// partition boundaries.
fn two_orbit_frames() -> Vec<(SyntheticFrame, u32)> {
    vec![
        (
            SyntheticFrame {
                frame_id: 101,
                bounds: BoundingBox::new(0.0, 0.0, 0.75, 2.0),
                resolution: 2.0 * RESOLUTION,
                range_rank: 1,
                rate: |x, y| 0.004 * x - 0.003 * y,
            },
            10,
        ),
        (
            SyntheticFrame {
                frame_id: 202,
                bounds: BoundingBox::new(1.25, 0.25, 2.0, 2.0),
                resolution: 2.0 * RESOLUTION,
                range_rank: 0,
                rate: |x, y| 0.002 + 0.004 * x - 0.003 * y,
            },
            10,
        ),
        (
            SyntheticFrame {
                frame_id: 303,
                bounds: BoundingBox::new(0.5, 0.0, 1.75, 1.75),
                resolution: 2.0 * RESOLUTION,
                range_rank: 2,
                rate: |x, y| -0.002 + 0.004 * x - 0.003 * y,
            },
            20,
        ),
    ]
}

struct Fixture {
    catalog: MemoryCatalog,
    store: MemoryGranuleStore,
    config: RunConfig,
    index: FrameIndex,
}

fn fixture_of(synthetic: Vec<(SyntheticFrame, u32)>) -> Fixture {
    let granules: Vec<_> = synthetic
        .iter()
        .flat_map(|(f, _)| f.series(date(2021, 1, 1), 20, 5))
        .collect();
    let frames = synthetic.iter().map(|(f, orbit)| Frame { relative_orbit: *orbit, ..f.frame() });
    Fixture {
        catalog: MemoryCatalog::new(granules.iter().map(|g| g.record.clone()).collect()),
        store: MemoryGranuleStore::new(granules),
        config: RunConfig { selection: SelectionStrategy::All, ..RunConfig::default() },
        index: FrameIndex::from_frames(frames),
    }
}

fn fixture() -> Fixture {
    fixture_of(frames().into_iter().map(|f| (f, 64)).collect())
}

#[test]
fn test_quadrants_match_whole_extent_for_every_policy() {
    init_logging();
    let fixture = fixture_of(two_orbit_frames());
    let processor = FrameProcessor::new(&fixture.catalog, &fixture.store, &fixture.config).unwrap();
    let (start, end) = (date(2021, 1, 1), date(2022, 1, 1));
    assert_eq!(dispmosaic::core::partition::split_extent(&extent(), 1.0).len(), 4);

    for policy in [PolicyKind::NearRangeFirst, PolicyKind::FrameNumber, PolicyKind::OrbitSweep] {
        let whole_params = PartitionParams { policy, ..params(10.0) };
        let whole_driver = PartitionDriver::new(&processor, &fixture.index, whole_params);
        let job_grid = whole_driver.job_grid(&extent()).unwrap();
        assert_eq!(job_grid.shape(), (128, 128));

        let ranking = whole_driver.ranking();
        let whole = whole_driver
            .run_partition(&job_grid, &ranking, &extent(), MeasurementKind::Velocity, start, end)
            .expect("whole extent should composite");
        assert!(whole.frame_failures.is_empty());
        assert_eq!(whole.tile.manifest.frame_ids_used, vec![101, 202, 303]);
        println!("{:?}: {:?}", policy, ranking.ordered());

        let quadrant_driver =
            PartitionDriver::new(&processor, &fixture.index, PartitionParams { policy, ..params(1.0) });
        let output = TempDir::new().expect("Failed to create temp directory");
        let report = quadrant_driver
            .run(&extent(), MeasurementKind::Velocity, start, end, output.path())
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.completed.len(), 4);

        let mut covered = 0;
        for done in &report.completed {
            let window = job_grid.window(&project_bounds(&done.bounds, WGS84_EPSG).unwrap()).unwrap();
            covered += window.rows * window.cols;
            let rows = window.row_offset..window.row_offset + window.rows;
            let cols = window.col_offset..window.col_offset + window.cols;

            let (grid, data, _) = geotiff::read_band(&done.raster_path).unwrap();
            assert!(grid.same_grid(&job_grid.crop(&window)));
            let expected = whole.tile.data.slice(ndarray::s![rows.clone(), cols.clone()]).to_owned();
            assert_same_pixels(&data, &expected);

            let outcome = quadrant_driver
                .run_partition(&job_grid, &ranking, &done.bounds, MeasurementKind::Velocity, start, end)
                .unwrap();
            assert_eq!(outcome.tile.provenance, whole.tile.provenance.slice(ndarray::s![rows, cols]));

            let manifest = geotiff::read_manifest(&done.manifest_path).unwrap();
            assert_eq!(manifest.partition_bounds, Some(done.bounds));
            let referenced: Vec<FrameId> = manifest.frame_references.iter().map(|r| r.frame_id).collect();
            assert_eq!(referenced, manifest.frame_ids_used);
        }
        assert_eq!(covered, job_grid.pixel_count());
    }
    assert_eq!(fixture.store.open_handles(), 0);
}

#[test]
fn test_orbit_sweep_decides_overlaps_by_whole_orbit() {
    init_logging();
    let fixture = fixture_of(two_orbit_frames());
    let processor = FrameProcessor::new(&fixture.catalog, &fixture.store, &fixture.config).unwrap();
    let sweep = PartitionParams { policy: PolicyKind::OrbitSweep, ..params(1.0) };
    let driver = PartitionDriver::new(&processor, &fixture.index, sweep);
    let job_grid = driver.job_grid(&extent()).unwrap();
    let north_east = BoundingBox::new(1.0, 1.0, 2.0, 2.0);
    let (start, end) = (date(2021, 1, 1), date(2022, 1, 1));

    let outcome = driver
        .run_partition(&job_grid, &driver.ranking(), &north_east, MeasurementKind::Velocity, start, end)
        .unwrap();

    // Frames 202 and 303 overlap here; orbit 10 sweeps from the west edge of the job
    let window = job_grid.window(&project_bounds(&north_east, WGS84_EPSG).unwrap()).unwrap();
    let (row, col) = job_grid.pixel_index(1.5078125, 1.5078125).unwrap();
    assert_eq!(outcome.tile.provenance[[row - window.row_offset, col - window.col_offset]], 202);
}

#[test]
fn test_near_range_frame_wins_overlap() {
    init_logging();
    let fixture = fixture();
    let processor = FrameProcessor::new(&fixture.catalog, &fixture.store, &fixture.config).unwrap();
    let driver = PartitionDriver::new(&processor, &fixture.index, params(10.0));
    let job_grid = driver.job_grid(&extent()).unwrap();
    let (start, end) = (date(2021, 1, 1), date(2022, 1, 1));

    let outcome = driver
        .run_partition(&job_grid, &driver.ranking(), &extent(), MeasurementKind::Velocity, start, end)
        .unwrap();

    // Pixel centred at (1.0078125, 1.0078125) lies in both footprints
    let (row, col) = job_grid.pixel_index(1.0078125, 1.0078125).unwrap();
    assert_eq!(outcome.tile.provenance[[row, col]], 202);
    // Only frame 101 covers the west edge
    let (row, col) = job_grid.pixel_index(0.1, 1.0).unwrap();
    assert_eq!(outcome.tile.provenance[[row, col]], 101);
    // Neither frame covers the south-east corner
    let (row, col) = job_grid.pixel_index(1.9, 0.1).unwrap();
    assert_eq!(outcome.tile.provenance[[row, col]], 0);
    assert!(outcome.tile.data[[row, col]].is_nan());
}

/// Constant-valued rasters; panics or errors for chosen frames
struct ScriptedSource {
    panics_for: FrameId,
    fails_for: FrameId,
}

impl MeasurementSource for ScriptedSource {
    fn measure(
        &self,
        frame: &Frame,
        kind: MeasurementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: &RasterGrid,
    ) -> DispResult<MeasurementRaster> {
        if frame.frame_id == self.panics_for {
            panic!("worker crashed while measuring frame {}", frame.frame_id);
        }
        if frame.frame_id == self.fails_for {
            return Err(DispError::Processing(format!("Download of frame {} refused", frame.frame_id)));
        }
        let mut raster = MeasurementRaster::empty(frame.frame_id, kind, start, end, target.clone());
        for ((row, col), value) in raster.data.indexed_iter_mut() {
            let (x, y) = target.pixel_center(row, col);
            let b = &frame.bounds;
            if x >= b.min_lon && x < b.max_lon && y >= b.min_lat && y < b.max_lat {
                *value = frame.frame_id as f32 * 1e-4;
            }
        }
        Ok(raster)
    }
}

fn scripted_frame(frame_id: FrameId, bounds: BoundingBox) -> Frame {
    Frame {
        frame_id,
        orbit_direction: dispmosaic::OrbitDirection::Descending,
        relative_orbit: 71,
        range_rank: frame_id,
        epsg: WGS84_EPSG,
        bounds,
        latest_acquisition: None,
    }
}

#[test]
fn test_failures_are_isolated_and_resume_skips_done_partitions() {
    init_logging();
    let output = TempDir::new().expect("Failed to create temp directory");
    let index = FrameIndex::from_frames(vec![
        scripted_frame(1, BoundingBox::new(0.0, 0.0, 2.0, 2.0)),
        scripted_frame(2, BoundingBox::new(0.1, 0.1, 0.4, 0.4)),
        scripted_frame(3, BoundingBox::new(1.2, 1.2, 1.8, 1.8)),
    ]);
    let source = ScriptedSource { panics_for: 2, fails_for: 3 };
    let coarse = PartitionParams { resolution: 0.0625, ..params(1.0) };
    let driver = PartitionDriver::new(&source, &index, coarse);
    let (start, end) = (date(2021, 1, 1), date(2022, 1, 1));

    let report = driver
        .run(&extent(), MeasurementKind::Displacement, start, end, output.path())
        .unwrap();
    println!(
        "completed {}, skipped {}, failed {}, frame failures {}",
        report.completed.len(),
        report.skipped.len(),
        report.failed.len(),
        report.frame_failures.len()
    );

    // Frame 2 panics inside the south-west partition only
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].bounds, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
    assert!(report.failed[0].error.contains("worker crashed"));
    assert_eq!(report.completed.len(), 3);
    assert!(!report.is_complete());

    // Frame 3 errors in the north-east partition, which still completes
    assert_eq!(report.frame_failures.len(), 1);
    assert_eq!(report.frame_failures[0].frame_id, 3);
    assert_eq!(report.frame_failures[0].partition, BoundingBox::new(1.0, 1.0, 2.0, 2.0));

    let (failed_raster, failed_manifest) =
        driver.output_paths(output.path(), MeasurementKind::Displacement, &report.failed[0].bounds);
    assert!(!failed_raster.exists());
    assert!(!failed_manifest.exists());

    for done in &report.completed {
        assert!(done.raster_path.exists());
        let manifest = geotiff::read_manifest(&done.manifest_path).unwrap();
        assert_eq!(manifest.partition_bounds, Some(done.bounds));
        assert_eq!(manifest.frame_ids_used, vec![1]);
        assert_eq!(manifest.scale_range.units, "m");
    }

    // A second run only retries what is missing
    let report = driver
        .run(&extent(), MeasurementKind::Displacement, start, end, output.path())
        .unwrap();
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert!(report.completed.is_empty());
}

#[test]
fn test_partition_outputs_are_named_by_corner() {
    let index = FrameIndex::default();
    let source = ScriptedSource { panics_for: 0, fails_for: 0 };
    let driver = PartitionDriver::new(&source, &index, PartitionParams::default());
    let (raster, manifest) = driver.output_paths(
        std::path::Path::new("/tmp/out"),
        MeasurementKind::Velocity,
        &BoundingBox::new(-120.0, 30.0, -110.0, 40.0),
    );
    assert_eq!(raster, std::path::Path::new("/tmp/out/velocity_ALL_N40W120.tif"));
    assert_eq!(manifest, std::path::Path::new("/tmp/out/velocity_ALL_N40W120.json"));
}
