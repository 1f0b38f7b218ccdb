use crate::types::{BoundingBox, DispError, DispResult, FrameId, OrbitDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Static footprint metadata for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub orbit_direction: OrbitDirection,
    pub relative_orbit: u32,
    /// 0 for the nearest-range frame of a track, increasing towards far range
    pub range_rank: u32,
    /// Native projection of the frame's products
    pub epsg: u32,
    /// WGS84 footprint bounds
    pub bounds: BoundingBox,
    #[serde(default)]
    pub latest_acquisition: Option<DateTime<Utc>>,
}

/// Frame metadata keyed by frame id
#[derive(Debug, Clone, Default)]
pub struct FrameIndex {
    frames: BTreeMap<FrameId, Frame>,
}

impl FrameIndex {
    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().map(|f| (f.frame_id, f)).collect(),
        }
    }

    /// Load a JSON array of frames
    pub fn from_file<P: AsRef<Path>>(path: P) -> DispResult<Self> {
        let path = path.as_ref();
        log::info!("Loading frame index from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let frames: Vec<Frame> = serde_json::from_str(&text)?;
        if frames.is_empty() {
            return Err(DispError::Metadata(format!("Frame index {} is empty", path.display())));
        }
        log::debug!("Loaded {} frames", frames.len());
        Ok(Self::from_frames(frames))
    }

    /// `<cache dir>/dispmosaic/frames.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("dispmosaic").join("frames.json"))
    }

    pub fn get(&self, frame_id: FrameId) -> Option<&Frame> {
        self.frames.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    /// Frames whose footprint intersects `bbox`, optionally restricted to one orbit direction
    pub fn intersecting(&self, bbox: &BoundingBox, direction: Option<OrbitDirection>) -> Vec<&Frame> {
        self.frames
            .values()
            .filter(|f| direction.map_or(true, |d| f.orbit_direction == d))
            .filter(|f| f.bounds.intersects(bbox))
            .collect()
    }
}
