//! Frame priority policies for compositing.
//!
//! A policy maps static frame metadata to a total order. Rank 0 is the highest
//! priority; ties always fall back to frame id.

use crate::io::frames::Frame;
use crate::types::{FrameId, OrbitDirection};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;

/// Swappable ordering of frames, highest priority first
pub trait PriorityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Frame ids from highest to lowest priority
    fn order(&self, frames: &[Frame]) -> Vec<FrameId>;
}

/// Near-range frames above far-range frames, regardless of orbit direction
#[derive(Debug, Clone, Copy, Default)]
pub struct NearRangeFirst;

impl PriorityPolicy for NearRangeFirst {
    fn name(&self) -> &'static str {
        "near_range_first"
    }

    fn order(&self, frames: &[Frame]) -> Vec<FrameId> {
        let mut keyed: Vec<(u32, FrameId)> = frames.iter().map(|f| (f.range_rank, f.frame_id)).collect();
        keyed.sort_unstable();
        keyed.dedup();
        keyed.into_iter().map(|(_, id)| id).collect()
    }
}

/// Ascending frame number
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameNumber;

impl PriorityPolicy for FrameNumber {
    fn name(&self) -> &'static str {
        "frame_number"
    }

    fn order(&self, frames: &[Frame]) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = frames.iter().map(|f| f.frame_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Orbits swept west to east for ascending passes and east to west for descending
/// passes; within an orbit the most recently acquired frame wins.
///
/// An orbit's position comes from every frame of that orbit in the ranked set, so
/// rank the full frame index once rather than the frames of one region.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrbitSweep;

impl OrbitSweep {
    /// Position of each orbit along its sweep, smaller first
    fn orbit_positions(frames: &[Frame]) -> HashMap<(OrbitDirection, u32), f64> {
        let mut positions: HashMap<(OrbitDirection, u32), f64> = HashMap::new();
        for frame in frames {
            let key = (frame.orbit_direction, frame.relative_orbit);
            let position = match frame.orbit_direction {
                OrbitDirection::Ascending => frame.bounds.min_lon,
                OrbitDirection::Descending => -frame.bounds.max_lon,
            };
            positions
                .entry(key)
                .and_modify(|p| *p = p.min(position))
                .or_insert(position);
        }
        positions
    }
}

impl PriorityPolicy for OrbitSweep {
    fn name(&self) -> &'static str {
        "orbit_sweep"
    }

    fn order(&self, frames: &[Frame]) -> Vec<FrameId> {
        let positions = Self::orbit_positions(frames);
        let mut sorted: Vec<&Frame> = frames.iter().collect();
        sorted.sort_by(|a, b| {
            let pa = positions[&(a.orbit_direction, a.relative_orbit)];
            let pb = positions[&(b.orbit_direction, b.relative_orbit)];
            let recency = |f: &Frame| Reverse(f.latest_acquisition);
            direction_rank(a.orbit_direction)
                .cmp(&direction_rank(b.orbit_direction))
                .then(pa.total_cmp(&pb))
                .then(a.relative_orbit.cmp(&b.relative_orbit))
                .then(recency(a).cmp(&recency(b)))
                .then(a.frame_id.cmp(&b.frame_id))
        });
        let mut ids: Vec<FrameId> = sorted.into_iter().map(|f| f.frame_id).collect();
        ids.dedup();
        ids
    }
}

fn direction_rank(direction: OrbitDirection) -> u8 {
    match direction {
        OrbitDirection::Ascending => 0,
        OrbitDirection::Descending => 1,
    }
}

/// Configurable choice of priority policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    NearRangeFirst,
    FrameNumber,
    OrbitSweep,
}

impl PolicyKind {
    pub fn policy(&self) -> Box<dyn PriorityPolicy> {
        match self {
            PolicyKind::NearRangeFirst => Box::new(NearRangeFirst),
            PolicyKind::FrameNumber => Box::new(FrameNumber),
            PolicyKind::OrbitSweep => Box::new(OrbitSweep),
        }
    }
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::NearRangeFirst
    }
}

/// Integer rank per frame, computed once per job
#[derive(Debug, Clone, Default)]
pub struct FrameRanking {
    order: Vec<FrameId>,
    ranks: HashMap<FrameId, u32>,
}

impl FrameRanking {
    pub fn new(policy: &dyn PriorityPolicy, frames: &[Frame]) -> Self {
        let order = policy.order(frames);
        log::debug!("Frame priority ({}): {:?}", policy.name(), order);
        Self::from_order(order)
    }

    /// Ranking from an explicit highest-first order
    pub fn from_order(order: Vec<FrameId>) -> Self {
        let ranks = order.iter().enumerate().map(|(i, id)| (*id, i as u32)).collect();
        Self { order, ranks }
    }

    /// 0 is the highest priority
    pub fn rank(&self, frame_id: FrameId) -> Option<u32> {
        self.ranks.get(&frame_id).copied()
    }

    pub fn ordered(&self) -> &[FrameId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use chrono::{TimeZone, Utc};

    fn frame(id: FrameId, direction: OrbitDirection, orbit: u32, rank: u32, min_lon: f64) -> Frame {
        Frame {
            frame_id: id,
            orbit_direction: direction,
            relative_orbit: orbit,
            range_rank: rank,
            epsg: 32611,
            bounds: BoundingBox::new(min_lon, 30.0, min_lon + 3.0, 33.0),
            latest_acquisition: None,
        }
    }

    #[test]
    fn test_near_range_first_ignores_direction() {
        let frames = vec![
            frame(30, OrbitDirection::Ascending, 1, 1, 0.0),
            frame(20, OrbitDirection::Descending, 2, 0, 0.0),
            frame(10, OrbitDirection::Ascending, 3, 1, 0.0),
            frame(40, OrbitDirection::Ascending, 4, 0, 0.0),
        ];
        assert_eq!(NearRangeFirst.order(&frames), vec![20, 40, 10, 30]);
    }

    #[test]
    fn test_frame_number_order() {
        let frames = vec![
            frame(30, OrbitDirection::Ascending, 1, 0, 0.0),
            frame(10, OrbitDirection::Ascending, 1, 2, 0.0),
        ];
        assert_eq!(FrameNumber.order(&frames), vec![10, 30]);
    }

    #[test]
    fn test_orbit_sweep_directions() {
        let frames = vec![
            frame(1, OrbitDirection::Ascending, 100, 0, 10.0),
            frame(2, OrbitDirection::Ascending, 50, 0, -5.0),
            frame(3, OrbitDirection::Descending, 7, 0, -5.0),
            frame(4, OrbitDirection::Descending, 8, 0, 10.0),
        ];
        assert_eq!(OrbitSweep.order(&frames), vec![2, 1, 4, 3]);
    }

    #[test]
    fn test_orbit_sweep_prefers_recent_within_orbit() {
        let mut old = frame(5, OrbitDirection::Ascending, 64, 0, 0.0);
        old.latest_acquisition = Some(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
        let mut recent = frame(9, OrbitDirection::Ascending, 64, 0, 1.0);
        recent.latest_acquisition = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(OrbitSweep.order(&[old, recent]), vec![9, 5]);
    }

    #[test]
    fn test_ranking_is_input_order_independent() {
        let frames = vec![
            frame(3, OrbitDirection::Ascending, 1, 2, 0.0),
            frame(1, OrbitDirection::Ascending, 1, 0, 0.0),
            frame(2, OrbitDirection::Ascending, 1, 0, 0.0),
        ];
        let mut reversed = frames.clone();
        reversed.reverse();

        for kind in [PolicyKind::NearRangeFirst, PolicyKind::FrameNumber, PolicyKind::OrbitSweep] {
            let policy = kind.policy();
            let a = FrameRanking::new(policy.as_ref(), &frames);
            let b = FrameRanking::new(policy.as_ref(), &reversed);
            assert_eq!(a.ordered(), b.ordered());
        }

        let ranking = FrameRanking::new(&NearRangeFirst, &frames);
        assert_eq!(ranking.rank(1), Some(0));
        assert_eq!(ranking.rank(2), Some(1));
        assert_eq!(ranking.rank(3), Some(2));
        assert_eq!(ranking.rank(99), None);
    }
}
