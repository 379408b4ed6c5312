//! envgrid: harmonization of environmental rasters onto a shared equal-area grid
//!
//! Heterogeneous sources (population, temperature, leaf area, livestock, tree cover,
//! precipitation) are normalized, mosaicked, reprojected and aggregated into one
//! multi-resolution grid whose files are pixel-coincident across every measure.

pub mod types;
pub mod io;
pub mod core;
pub mod config;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    Crs, Extent, GeoTransform, GridError, GridResult, GridSpec, HarmonizedRaster, Measure, MeasureKind,
    MeasureSpec, RasterBand, RasterTile,
};

pub use config::Config;
pub use core::{MultiScaleAggregator, NoDataNormalizer, Reprojector, TileMosaicker, TileSource};
pub use io::{FileTile, GridWriter, RasterReader};
pub use pipeline::{BatchProcessor, BatchReport, Pipeline, StripSink, WriteOutcome};
