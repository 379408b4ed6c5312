use crate::core::{map_blocks, row_blocks};
use crate::types::{GeoTransform, GridError, GridResult, GridSpec, HarmonizedRaster, MeasureKind};
use ndarray::{s, Array2};
use std::ops::Range;

/// Derives coarser grids from a harmonized raster by `k x k` block aggregation
#[derive(Debug, Clone)]
pub struct MultiScaleAggregator {
    /// Destination rows processed per block
    block_rows: usize,
}

impl Default for MultiScaleAggregator {
    fn default() -> Self {
        Self { block_rows: 256 }
    }
}

/// Aggregated values of one block of destination rows
struct AggregateBlock {
    rows: Range<usize>,
    values: Array2<f32>,
    support: Array2<u32>,
}

impl MultiScaleAggregator {
    pub fn new(block_rows: usize) -> Self {
        Self { block_rows }
    }

    /// Aggregate the base raster to every coarser cell size of `grid`, coarsest last.
    ///
    /// Each output is derived directly from `base`, never from another coarse output.
    pub fn aggregate_all(
        &self,
        base: &HarmonizedRaster,
        grid: &GridSpec,
        kind: MeasureKind,
    ) -> GridResult<Vec<HarmonizedRaster>> {
        grid.cell_sizes()
            .iter()
            .skip(1)
            .map(|&cell_size| self.aggregate_to(base, grid, cell_size, kind))
            .collect()
    }

    /// Aggregate `raster` to `cell_size`, which must be an integer multiple of its own cell size
    pub fn aggregate_to(
        &self,
        raster: &HarmonizedRaster,
        grid: &GridSpec,
        cell_size: f64,
        kind: MeasureKind,
    ) -> GridResult<HarmonizedRaster> {
        let factor = crate::types::integer_ratio(cell_size, raster.cell_size).ok_or_else(|| {
            GridError::Config(format!(
                "cell size {} is not a multiple of {}",
                cell_size, raster.cell_size
            ))
        })?;
        let out = self.aggregate(raster, factor, kind)?;
        debug_assert_eq!(out.dim(), grid.dimensions(cell_size));
        Ok(out)
    }

    /// Aggregate `k x k` windows of `raster` into single pixels.
    ///
    /// Intensive: support-weighted mean of the valid pixels. Extensive: the valid raw sums of the
    /// window, projected to full coverage by `k * k * base_cells / support`. On a base raster,
    /// where support is 0 or 1, this is the mean of valid pixels and `sum * k * k / validCount`.
    /// Windows without valid pixels are no-data.
    pub fn aggregate(&self, raster: &HarmonizedRaster, factor: usize, kind: MeasureKind) -> GridResult<HarmonizedRaster> {
        let (rows, cols) = raster.dim();
        if factor == 0 {
            return Err(GridError::InvalidRaster {
                path: "<aggregation>".to_string(),
                reason: "aggregation factor must be positive".to_string(),
            });
        }
        if rows % factor != 0 || cols % factor != 0 {
            return Err(GridError::InvalidRaster {
                path: "<aggregation>".to_string(),
                reason: format!("{}x{} raster is not divisible into {}x{} windows", rows, cols, factor, factor),
            });
        }

        let out_rows = rows / factor;
        let out_cols = cols / factor;
        let cell_size = raster.cell_size * factor as f64;
        log::debug!(
            "Aggregating {} raster {}x{} -> {}x{} (factor {}, cell size {} -> {})",
            kind,
            rows,
            cols,
            out_rows,
            out_cols,
            factor,
            raster.cell_size,
            cell_size
        );

        let base_cells = raster.base_cells * (factor * factor) as u32;
        let blocks = map_blocks(row_blocks(0..out_rows, self.block_rows), |block| {
            Ok(aggregate_block(raster, factor, kind, out_cols, block))
        })?;

        let mut values = Array2::from_elem((out_rows, out_cols), raster.nodata as f32);
        let mut support = Array2::<u32>::zeros((out_rows, out_cols));
        for block in blocks {
            values.slice_mut(s![block.rows.clone(), ..]).assign(&block.values);
            support.slice_mut(s![block.rows, ..]).assign(&block.support);
        }

        let gt = raster.transform;
        let transform = GeoTransform::north_up(
            gt.top_left_x,
            gt.top_left_y,
            gt.pixel_width * factor as f64,
            gt.pixel_height * factor as f64,
        );

        Ok(HarmonizedRaster {
            data: values,
            support,
            base_cells,
            cell_size,
            transform,
            nodata: raster.nodata,
        })
    }
}

fn aggregate_block(
    raster: &HarmonizedRaster,
    factor: usize,
    kind: MeasureKind,
    out_cols: usize,
    rows: Range<usize>,
) -> AggregateBlock {
    let nodata = raster.nodata as f32;
    let window_cells = (factor * factor) as f64 * raster.base_cells as f64;
    let mut values = Array2::from_elem((rows.len(), out_cols), nodata);
    let mut support = Array2::<u32>::zeros((rows.len(), out_cols));

    for (local_row, out_row) in rows.clone().enumerate() {
        for out_col in 0..out_cols {
            let row_span = out_row * factor..(out_row + 1) * factor;
            let col_span = out_col * factor..(out_col + 1) * factor;
            let window_values = raster.data.slice(s![row_span.clone(), col_span.clone()]);
            let window_support = raster.support.slice(s![row_span, col_span]);

            let mut weighted = 0.0f64;
            let mut count = 0u32;
            for (&v, &n) in window_values.iter().zip(window_support.iter()) {
                if n == 0 {
                    continue;
                }
                weighted += v as f64 * n as f64;
                count += n;
            }
            if count == 0 {
                continue;
            }

            let value = match kind {
                MeasureKind::Intensive => weighted / count as f64,
                MeasureKind::Extensive => {
                    // value * support / base_cells is the raw valid sum behind each input pixel
                    let raw_sum = weighted / raster.base_cells as f64;
                    raw_sum * window_cells / count as f64
                }
            };
            values[[local_row, out_col]] = value as f32;
            support[[local_row, out_col]] = count;
        }
    }

    AggregateBlock { rows, values, support }
}
