//! Core measurement and mosaic modules

pub mod composite;
pub mod frame_order;
pub mod granule_select;
pub mod grid;
pub mod measurement;
pub mod partition;
pub mod standardize;

// Re-export main types
pub use composite::{Composite, FrameCompositor, RankedLayer};
pub use frame_order::{FrameNumber, FrameRanking, NearRangeFirst, OrbitSweep, PolicyKind, PriorityPolicy};
pub use granule_select::{GranuleSelector, SelectionStrategy};
pub use grid::{Extent, GridWindow, PixelMapping, RasterGrid};
pub use measurement::{MeasurementCalculator, MeasurementParams};
pub use partition::{MeasurementSource, PartitionDriver, PartitionParams, PartitionReport};
pub use standardize::{ReferenceStandardizer, SpatiotemporalReference, StandardizedLayer};
