//! Core harmonization stages

pub mod aggregate;
pub mod mosaic;
pub mod nodata;
pub mod reproject;
pub mod transform;

use crate::types::GridResult;
use std::ops::Range;

// Re-export main types
pub use aggregate::MultiScaleAggregator;
pub use mosaic::{Mosaic, TileMosaicker, TileSource};
pub use nodata::NoDataNormalizer;
pub use reproject::{ReprojectOptions, Reprojector, WarpPlan};
pub use transform::CoordinateTransformer;

/// Split a row range into consecutive blocks of at most `block_rows` rows
pub(crate) fn row_blocks(rows: Range<usize>, block_rows: usize) -> Vec<Range<usize>> {
    let step = block_rows.max(1);
    (rows.start..rows.end)
        .step_by(step)
        .map(|start| start..(start + step).min(rows.end))
        .collect()
}

/// Tile a window into blocks of at most `block_rows x block_cols`, row-major
pub(crate) fn grid_blocks(
    rows: Range<usize>,
    cols: Range<usize>,
    block_rows: usize,
    block_cols: usize,
) -> Vec<(Range<usize>, Range<usize>)> {
    let col_blocks = row_blocks(cols, block_cols);
    row_blocks(rows, block_rows)
        .into_iter()
        .flat_map(|r| col_blocks.iter().map(move |c| (r.clone(), c.clone())))
        .collect()
}

/// Run `f` over every block, in parallel when the `parallel` feature is enabled.
///
/// Results keep block order; the first error wins.
#[cfg(feature = "parallel")]
pub(crate) fn map_blocks<B, T, F>(blocks: Vec<B>, f: F) -> GridResult<Vec<T>>
where
    B: Send,
    T: Send,
    F: Fn(B) -> GridResult<T> + Sync + Send,
{
    use rayon::prelude::*;

    blocks.into_par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn map_blocks<B, T, F>(blocks: Vec<B>, f: F) -> GridResult<Vec<T>>
where
    B: Send,
    T: Send,
    F: Fn(B) -> GridResult<T> + Sync + Send,
{
    blocks.into_iter().map(f).collect()
}
