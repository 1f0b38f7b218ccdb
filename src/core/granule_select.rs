use crate::types::{within_one_day, DispError, DispResult, FrameId, GranuleRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How granules are chosen within a date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Fewest granules that chain the latest observation back to the first reference date
    Spanning,
    /// One granule per secondary date
    All,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Spanning
    }
}

/// Granule selector for one frame and date range
#[derive(Debug, Clone)]
pub struct GranuleSelector {
    strategy: SelectionStrategy,
}

impl GranuleSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self { strategy }
    }

    /// Select the granules of `frame_id` whose secondary date lies in `[start, end]`.
    ///
    /// Returns `NoDataInRange` when nothing falls in the range.
    pub fn select(
        &self,
        frame_id: FrameId,
        candidates: &[GranuleRecord],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DispResult<Vec<GranuleRecord>> {
        if start > end {
            return Err(DispError::Processing(format!(
                "Start date {} is after end date {}",
                start, end
            )));
        }

        let in_range: Vec<GranuleRecord> = candidates
            .iter()
            .filter(|g| g.frame_id == frame_id)
            .filter(|g| start <= g.secondary_date && g.secondary_date <= end)
            .cloned()
            .collect();

        if in_range.is_empty() {
            log::info!("No granules for frame {} between {} and {}", frame_id, start, end);
            return Err(DispError::NoDataInRange { frame_id, start, end });
        }

        let deduplicated = eliminate_duplicates(in_range);
        let mut selected = match self.strategy {
            SelectionStrategy::Spanning => restrict_to_spanning_set(deduplicated)?,
            SelectionStrategy::All => one_per_secondary_date(deduplicated),
        };
        selected.sort_by_key(|g| g.secondary_date);

        log::info!(
            "Selected {} granules for frame {} between {} and {} ({:?})",
            selected.len(),
            frame_id,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            self.strategy
        );
        Ok(selected)
    }
}

impl Default for GranuleSelector {
    fn default() -> Self {
        Self::new(SelectionStrategy::default())
    }
}

/// Keep only the most recently created granule per (frame, reference date, secondary date)
pub fn eliminate_duplicates(granules: Vec<GranuleRecord>) -> Vec<GranuleRecord> {
    let mut latest: HashMap<(FrameId, i64, i64), GranuleRecord> = HashMap::new();
    for granule in granules {
        let key = (
            granule.frame_id,
            granule.reference_date.timestamp(),
            granule.secondary_date.timestamp(),
        );
        match latest.get(&key) {
            Some(existing) if existing.creation_date >= granule.creation_date => {
                log::debug!("Dropping superseded granule {}", granule.scene_name);
            }
            _ => {
                latest.insert(key, granule);
            }
        }
    }

    let mut unique: Vec<GranuleRecord> = latest.into_values().collect();
    unique.sort_by_key(|g| (g.secondary_date, g.reference_date));
    unique
}

/// Minimum set of granules needed to reconstruct displacement since the first reference date.
///
/// Starts at the latest granule and hops back through granules whose secondary date
/// matches the current reference date, taking the earliest reference date at each hop.
pub fn restrict_to_spanning_set(granules: Vec<GranuleRecord>) -> DispResult<Vec<GranuleRecord>> {
    let mut granules = granules;
    if granules.is_empty() {
        return Ok(granules);
    }

    let frame_id = granules[0].frame_id;
    if granules.iter().any(|g| g.frame_id != frame_id) {
        return Err(DispError::Processing(
            "Spanning set granules must be from the same frame".to_string(),
        ));
    }

    granules.sort_by_key(|g| g.secondary_date);
    let first_reference_date = granules[0].reference_date;
    let last = granules[granules.len() - 1].clone();
    let mut reference_date = last.reference_date;
    let mut spanning = vec![last];

    while !within_one_day(reference_date, first_reference_date) {
        let next = granules
            .iter()
            .filter(|g| within_one_day(g.secondary_date, reference_date))
            .min_by_key(|g| g.reference_date)
            .ok_or(DispError::DisconnectedNetwork { frame_id })?;

        // A granule whose reference date does not move backwards would loop forever
        if next.reference_date >= reference_date {
            return Err(DispError::DisconnectedNetwork { frame_id });
        }

        reference_date = next.reference_date;
        spanning.push(next.clone());
    }

    spanning.sort_by_key(|g| g.secondary_date);
    Ok(spanning)
}

/// One granule per secondary date, preferring the earliest reference date
fn one_per_secondary_date(granules: Vec<GranuleRecord>) -> Vec<GranuleRecord> {
    let mut sorted = granules;
    sorted.sort_by_key(|g| (g.secondary_date, g.reference_date));

    let mut kept: Vec<GranuleRecord> = Vec::with_capacity(sorted.len());
    for granule in sorted {
        match kept.last() {
            Some(prev) if within_one_day(prev.secondary_date, granule.secondary_date) => {}
            _ => kept.push(granule),
        }
    }
    kept
}
