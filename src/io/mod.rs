//! Catalog, granule storage, frame metadata and raster I/O

pub mod catalog;
pub mod frames;
pub mod geotiff;
pub mod granule_store;

pub use catalog::{CmrCatalog, GranuleCatalog, MemoryCatalog};
pub use frames::{Frame, FrameIndex};
pub use granule_store::{
    load_granule, DownloadPool, GranuleHandle, GranuleStore, HttpGranuleStore, MemoryGranuleStore,
};
