//! I/O modules for reading source rasters and writing harmonized grids

pub mod reader;
pub mod writer;

pub use reader::{FileTile, RasterReader};
pub use writer::{GridOutput, GridWriter};
