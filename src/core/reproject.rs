use crate::core::mosaic::Mosaic;
use crate::core::transform::CoordinateTransformer;
use crate::core::{grid_blocks, map_blocks};
use crate::types::{
    Extent, GeoTransform, GridError, GridResult, GridSpec, HarmonizedRaster, InverseGeoTransform, MeasureKind,
    RasterTile,
};
use ndarray::{s, Array2};
use std::ops::Range;

/// Overlaps below this fraction of a source pixel side are ignored
const MIN_OVERLAP: f64 = 1e-9;

/// Corner coordinates this close to a source pixel edge are snapped onto it
const SNAP_TOLERANCE: f64 = 1e-7;

/// Memory settings of the warp
#[derive(Debug, Clone)]
pub struct ReprojectOptions {
    /// Upper bound on destination rows per block
    pub block_rows: usize,
    /// Approximate upper bound on source pixels read for one block
    pub max_window_pixels: usize,
}

impl Default for ReprojectOptions {
    fn default() -> Self {
        Self {
            block_rows: 256,
            max_window_pixels: 1 << 24,
        }
    }
}

/// Warps mosaics onto the base resolution of a [`GridSpec`]
#[derive(Debug, Clone, Default)]
pub struct Reprojector {
    options: ReprojectOptions,
}

/// A prepared warp of one mosaic onto the base resolution of a grid.
///
/// Rows can be warped in any order and any number of times; the values of a destination
/// pixel never depend on which rows are requested together.
pub struct WarpPlan<'a> {
    mosaic: &'a Mosaic,
    grid: &'a GridSpec,
    kind: MeasureKind,
    cell_size: f64,
    rows: usize,
    dst_transform: GeoTransform,
    src_inverse: InverseGeoTransform,
    /// Destination rows and columns touched by the source footprint
    row_window: Range<usize>,
    col_window: Range<usize>,
    block_rows: usize,
    block_cols: usize,
}

/// Output of one block of destination pixels
struct WarpBlock {
    rows: Range<usize>,
    cols: Range<usize>,
    values: Array2<f32>,
    support: Array2<u32>,
}

/// A destination cell mapped into source pixel coordinates
#[derive(Debug, Clone, Copy)]
struct Footprint {
    col_min: f64,
    col_max: f64,
    row_min: f64,
    row_max: f64,
    /// Area of the mapped quadrilateral, in source pixels
    area: f64,
}

impl Reprojector {
    pub fn new(options: ReprojectOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReprojectOptions {
        &self.options
    }

    /// Reproject a single tile, see [`Reprojector::reproject`]
    pub fn reproject_tile(&self, tile: RasterTile, grid: &GridSpec, kind: MeasureKind) -> GridResult<HarmonizedRaster> {
        let mosaic = Mosaic::from_tile(tile)?;
        self.reproject(&mosaic, grid, kind)
    }

    /// Warp `mosaic` into the grid CRS at the base cell size, clipped to the grid bounding box.
    ///
    /// Each destination pixel is mapped into the mosaic and every source pixel it touches is
    /// weighted by its overlap area. Intensive measures get the weighted mean of the valid
    /// source pixels. Extensive measures get `mean * validFraction * sourcePixelsPerCell`, an
    /// estimate of the summed quantity that is down-weighted where the source only partially
    /// covers the cell. Cells without any valid source pixel are no-data.
    pub fn reproject(&self, mosaic: &Mosaic, grid: &GridSpec, kind: MeasureKind) -> GridResult<HarmonizedRaster> {
        let plan = self.plan(mosaic, grid, kind)?;
        let output = plan.warp_rows(0..plan.rows)?;

        let (rows, cols) = output.dim();
        let coverage = output.valid_count() as f64 / (rows * cols).max(1) as f64 * 100.0;
        log::info!("Reprojection completed: {:.1}% coverage", coverage);
        Ok(output)
    }

    /// Prepare a warp without computing any pixel, see [`WarpPlan::warp_rows`]
    pub fn plan<'a>(&self, mosaic: &'a Mosaic, grid: &'a GridSpec, kind: MeasureKind) -> GridResult<WarpPlan<'a>> {
        let cell_size = grid.base_cell_size();
        let (rows, cols) = grid.dimensions(cell_size);
        let dst_transform = grid.transform(cell_size);
        let src_inverse = mosaic.transform().inverse()?;

        log::info!(
            "Reprojecting {} mosaic ({} tile(s)) from {} to {} at {} ({}x{} pixels)",
            kind,
            mosaic.tile_count(),
            mosaic.crs(),
            grid.crs,
            cell_size,
            rows,
            cols
        );

        let forward = CoordinateTransformer::new(mosaic.crs(), &grid.crs)?;
        let footprint = forward
            .transform_extent(&mosaic.extent())?
            .and_then(|footprint| footprint.intersection(&grid.bbox));
        let (row_window, col_window) = match footprint {
            Some(f) => pixel_window(&f, grid, cell_size, rows, cols, forward.is_identity()),
            None => {
                log::warn!("Source extent does not intersect the grid bounding box, output is all no-data");
                (0..0, 0..0)
            }
        };
        log::debug!("Destination window rows {:?}, cols {:?}", row_window, col_window);

        let src_area = local_pixel_area(&forward, mosaic)?;
        let source_per_cell = if src_area.is_finite() && src_area > 0.0 {
            cell_size * cell_size / src_area
        } else {
            let (pw, ph) = mosaic.pixel_size();
            cell_size * cell_size / (pw * ph)
        };
        let cell_budget = (self.options.max_window_pixels as f64 / source_per_cell.max(1.0)).max(1.0) as usize;
        let block_rows = self
            .options
            .block_rows
            .max(1)
            .min(((cell_budget as f64).sqrt() as usize).max(1));
        let block_cols = (cell_budget / block_rows).max(1);
        log::debug!(
            "~{:.3} source pixels per cell, blocks of {}x{} cells",
            source_per_cell,
            block_rows,
            block_cols
        );

        Ok(WarpPlan {
            mosaic,
            grid,
            kind,
            cell_size,
            rows,
            dst_transform,
            src_inverse,
            row_window,
            col_window,
            block_rows,
            block_cols,
        })
    }
}

impl WarpPlan<'_> {
    pub fn kind(&self) -> MeasureKind {
        self.kind
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Destination rows of the full base raster
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Warp the full-width band `rows` of the base raster.
    ///
    /// Blocks inside the band run on the rayon pool; only the source window of a block is read.
    pub fn warp_rows(&self, rows: Range<usize>) -> GridResult<HarmonizedRaster> {
        if rows.start > rows.end || rows.end > self.rows {
            return Err(GridError::Reprojection(format!(
                "rows {:?} outside a grid of {} rows",
                rows, self.rows
            )));
        }
        let mut strip = HarmonizedRaster::strip(self.grid, self.cell_size, 1, rows.clone());
        let active = rows.start.max(self.row_window.start)..rows.end.min(self.row_window.end);
        if active.is_empty() || self.col_window.is_empty() {
            return Ok(strip);
        }

        let blocks = grid_blocks(active, self.col_window.clone(), self.block_rows, self.block_cols);
        let blocks = map_blocks(blocks, |(block_rows, block_cols)| warp_block(self, block_rows, block_cols))?;

        for block in blocks {
            let local = block.rows.start - rows.start..block.rows.end - rows.start;
            strip
                .data
                .slice_mut(s![local.clone(), block.cols.clone()])
                .assign(&block.values);
            strip.support.slice_mut(s![local, block.cols]).assign(&block.support);
        }
        Ok(strip)
    }
}

/// Destination pixel rows/cols touched by `footprint`, with a margin when the footprint is
/// only an edge-sampled approximation
fn pixel_window(
    footprint: &Extent,
    grid: &GridSpec,
    cell_size: f64,
    rows: usize,
    cols: usize,
    exact: bool,
) -> (Range<usize>, Range<usize>) {
    let (row_margin, col_margin) = if exact {
        (0.0, 0.0)
    } else {
        ((rows as f64 * 0.01).max(1.0), (cols as f64 * 0.01).max(1.0))
    };
    let col_start = ((footprint.xmin - grid.bbox.xmin) / cell_size).floor() - col_margin;
    let col_end = ((footprint.xmax - grid.bbox.xmin) / cell_size).ceil() + col_margin;
    let row_start = ((grid.bbox.ymax - footprint.ymax) / cell_size).floor() - row_margin;
    let row_end = ((grid.bbox.ymax - footprint.ymin) / cell_size).ceil() + row_margin;

    let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64) as usize;
    (
        clamp(row_start, rows)..clamp(row_end, rows),
        clamp(col_start, cols)..clamp(col_end, cols),
    )
}

/// Area covered by one source pixel at the mosaic centre in destination units, from the local
/// Jacobian of the source-to-destination transform
fn local_pixel_area(forward: &CoordinateTransformer, mosaic: &Mosaic) -> GridResult<f64> {
    let gt = mosaic.transform();
    if forward.is_identity() {
        return Ok((gt.pixel_width * gt.pixel_height).abs());
    }
    let (rows, cols) = mosaic.dim();
    let (x, y) = gt.pixel_to_world(cols as f64 / 2.0, rows as f64 / 2.0);
    let mut xs = [x, x + gt.pixel_width, x];
    let mut ys = [y, y, y + gt.pixel_height];
    forward.transform_in_place(&mut xs, &mut ys)?;
    let (ax, ay) = (xs[1] - xs[0], ys[1] - ys[0]);
    let (bx, by) = (xs[2] - xs[0], ys[2] - ys[0]);
    Ok((ax * by - ay * bx).abs())
}

fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < SNAP_TOLERANCE {
        rounded
    } else {
        v
    }
}

/// Length of `[lo, hi]` inside source pixel `[pixel, pixel + 1]`
#[inline]
fn overlap(lo: f64, hi: f64, pixel: usize) -> f64 {
    let p = pixel as f64;
    (hi.min(p + 1.0) - lo.max(p)).max(0.0)
}

impl Footprint {
    /// Corners in ring order, as (col, row) source pixel coordinates
    fn from_corners(corners: [(f64, f64); 4]) -> Option<Self> {
        if corners.iter().any(|(c, r)| !c.is_finite() || !r.is_finite()) {
            return None;
        }
        let mut footprint = Footprint {
            col_min: f64::INFINITY,
            col_max: f64::NEG_INFINITY,
            row_min: f64::INFINITY,
            row_max: f64::NEG_INFINITY,
            area: 0.0,
        };
        let mut twice_area = 0.0;
        for (i, &(col, row)) in corners.iter().enumerate() {
            footprint.col_min = footprint.col_min.min(col);
            footprint.col_max = footprint.col_max.max(col);
            footprint.row_min = footprint.row_min.min(row);
            footprint.row_max = footprint.row_max.max(row);
            let (next_col, next_row) = corners[(i + 1) % 4];
            twice_area += col * next_row - next_col * row;
        }
        footprint.area = twice_area.abs() / 2.0;
        if footprint.area > 0.0 && footprint.box_area() > 0.0 {
            Some(footprint)
        } else {
            None
        }
    }

    fn box_area(&self) -> f64 {
        (self.col_max - self.col_min) * (self.row_max - self.row_min)
    }
}

fn warp_block(plan: &WarpPlan<'_>, rows: Range<usize>, cols: Range<usize>) -> GridResult<WarpBlock> {
    let height = rows.len();
    let width = cols.len();
    let nodata = plan.grid.nodata as f32;
    let mut values = Array2::from_elem((height, width), nodata);
    let mut support = Array2::<u32>::zeros((height, width));

    // GDAL transformation handles are not shared between threads
    let inverse = CoordinateTransformer::new(&plan.grid.crs, plan.mosaic.crs())?;

    // cell corners, shared between neighbouring cells
    let lattice_cols = width + 1;
    let mut xs = Vec::with_capacity((height + 1) * lattice_cols);
    let mut ys = Vec::with_capacity((height + 1) * lattice_cols);
    for row in rows.start..=rows.end {
        for col in cols.start..=cols.end {
            let (x, y) = plan.dst_transform.pixel_to_world(col as f64, row as f64);
            xs.push(x);
            ys.push(y);
        }
    }
    inverse.transform_in_place(&mut xs, &mut ys)?;
    let corners: Vec<(f64, f64)> = xs
        .iter()
        .zip(&ys)
        .map(|(&x, &y)| {
            let (col, row) = plan.src_inverse.world_to_pixel(x, y);
            (snap(col), snap(row))
        })
        .collect();

    let footprints: Vec<Option<Footprint>> = (0..height * width)
        .map(|i| {
            let top = (i / width) * lattice_cols + i % width;
            let bottom = top + lattice_cols;
            Footprint::from_corners([corners[top], corners[top + 1], corners[bottom + 1], corners[bottom]])
        })
        .collect();

    // source window of the whole block, clipped to the mosaic
    let (mosaic_rows, mosaic_cols) = plan.mosaic.dim();
    let (row_lo, row_hi, col_lo, col_hi) = footprints.iter().flatten().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(r0, r1, c0, c1), fp| (r0.min(fp.row_min), r1.max(fp.row_max), c0.min(fp.col_min), c1.max(fp.col_max)),
    );
    let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64) as usize;
    let win_rows = clamp(row_lo.floor(), mosaic_rows)..clamp(row_hi.ceil(), mosaic_rows);
    let win_cols = clamp(col_lo.floor(), mosaic_cols)..clamp(col_hi.ceil(), mosaic_cols);
    if win_rows.is_empty() || win_cols.is_empty() {
        return Ok(WarpBlock {
            rows,
            cols,
            values,
            support,
        });
    }

    let window = plan.mosaic.read_window(
        win_rows.start as i64,
        win_cols.start as i64,
        win_rows.len(),
        win_cols.len(),
        nodata,
    )?;

    for (i, fp) in footprints.iter().enumerate() {
        let fp = match fp {
            Some(fp) => fp,
            None => continue,
        };
        let src_rows = (fp.row_min.floor().max(win_rows.start as f64) as usize)
            ..(fp.row_max.ceil().min(win_rows.end as f64) as usize);
        let src_cols = (fp.col_min.floor().max(win_cols.start as f64) as usize)
            ..(fp.col_max.ceil().min(win_cols.end as f64) as usize);

        let mut weighted = 0.0f64;
        let mut valid_weight = 0.0f64;
        for src_row in src_rows {
            let wy = overlap(fp.row_min, fp.row_max, src_row);
            if wy <= MIN_OVERLAP {
                continue;
            }
            for src_col in src_cols.clone() {
                let wx = overlap(fp.col_min, fp.col_max, src_col);
                if wx <= MIN_OVERLAP {
                    continue;
                }
                let v = window.data[[src_row - win_rows.start, src_col - win_cols.start]];
                if window.is_nodata(v) {
                    continue;
                }
                let w = wx * wy;
                weighted += w * v as f64;
                valid_weight += w;
            }
        }
        if valid_weight <= 0.0 {
            continue;
        }

        let mean = weighted / valid_weight;
        let value = match plan.kind {
            MeasureKind::Intensive => mean,
            MeasureKind::Extensive => {
                let valid_fraction = valid_weight / fp.box_area();
                mean * valid_fraction * fp.area
            }
        };
        values[[i / width, i % width]] = value as f32;
        support[[i / width, i % width]] = 1;
    }

    Ok(WarpBlock {
        rows,
        cols,
        values,
        support,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mosaic::TileMosaicker;
    use crate::types::{Crs, GridError, RasterBand};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    const NODATA: f64 = -9999.0;

    fn source_tile(x: f64, y: f64, pixel: f64, data: Array2<f32>) -> RasterTile {
        RasterTile::new(
            Crs::Epsg(3035),
            GeoTransform::north_up(x, y, pixel, -pixel),
            vec![RasterBand::new(data, Some(NODATA))],
        )
    }

    fn grid(bbox: Extent, sizes: &[f64]) -> GridSpec {
        GridSpec::new(Crs::Epsg(3035), bbox, NODATA, sizes).unwrap()
    }

    fn four_by_four() -> Array2<f32> {
        Array2::from_elem((4, 4), 100.0)
    }

    #[test]
    fn test_uniform_intensive_source_stays_uniform() {
        let tile = source_tile(0.0, 40.0, 1.0, Array2::from_elem((40, 40), 17.25));
        let grid = grid(Extent::new(0.0, 0.0, 40.0, 40.0), &[5.0]);
        let out = Reprojector::default()
            .reproject_tile(tile, &grid, MeasureKind::Intensive)
            .unwrap();
        assert_eq!(out.dim(), (8, 8));
        for &v in out.data.iter() {
            assert_relative_eq!(v, 17.25, epsilon = 1e-5);
        }
        assert_eq!(out.valid_count(), 64);
    }

    #[test]
    fn test_four_by_four_onto_two_by_two() {
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[2.0]);
        let reprojector = Reprojector::default();

        let intensive = reprojector
            .reproject_tile(source_tile(0.0, 4.0, 1.0, four_by_four()), &grid, MeasureKind::Intensive)
            .unwrap();
        assert_eq!(intensive.data, Array2::from_elem((2, 2), 100.0));

        let extensive = reprojector
            .reproject_tile(source_tile(0.0, 4.0, 1.0, four_by_four()), &grid, MeasureKind::Extensive)
            .unwrap();
        assert_eq!(extensive.data, Array2::from_elem((2, 2), 400.0));
    }

    #[test]
    fn test_extensive_partial_coverage_is_scaled_by_valid_fraction() {
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[2.0]);

        let mut data = four_by_four();
        data.row_mut(3).fill(NODATA as f32);
        let out = Reprojector::default()
            .reproject_tile(source_tile(0.0, 4.0, 1.0, data), &grid, MeasureKind::Extensive)
            .unwrap();
        // avg 100, validFraction 0.5, 4 source pixels per cell
        assert_eq!(out.data.row(0).to_vec(), vec![400.0, 400.0]);
        assert_eq!(out.data.row(1).to_vec(), vec![200.0, 200.0]);

        let mut data = four_by_four();
        data[[3, 0]] = NODATA as f32;
        let out = Reprojector::default()
            .reproject_tile(source_tile(0.0, 4.0, 1.0, data), &grid, MeasureKind::Extensive)
            .unwrap();
        // 3 of 4 valid: 100 * 0.75 * 4
        assert_relative_eq!(out.data[[1, 0]], 300.0, epsilon = 1e-4);
        assert_eq!(out.data[[1, 1]], 400.0);
    }

    #[test]
    fn test_extensive_totals_are_preserved() {
        let data = Array2::from_shape_fn((12, 12), |(r, c)| {
            if (r * 7 + c * 3) % 5 == 0 {
                NODATA as f32
            } else {
                ((r * 13 + c * 29) % 97) as f32
            }
        });
        let source_total: f64 = data.iter().filter(|&&v| v != NODATA as f32).map(|&v| v as f64).sum();

        let grid = grid(Extent::new(0.0, 0.0, 12.0, 12.0), &[3.0]);
        let out = Reprojector::default()
            .reproject_tile(source_tile(0.0, 12.0, 1.0, data), &grid, MeasureKind::Extensive)
            .unwrap();
        assert_relative_eq!(out.valid_sum(), source_total, max_relative = 1e-5);
    }

    #[test]
    fn test_partial_overlap_with_bbox_clips_and_fills_nodata() {
        // source covers only the western half of the grid
        let tile = source_tile(0.0, 4.0, 1.0, Array2::from_elem((4, 2), 5.0));
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[1.0]);
        let out = Reprojector::default()
            .reproject_tile(tile, &grid, MeasureKind::Intensive)
            .unwrap();
        for row in 0..4 {
            assert_eq!(out.value(row, 0), Some(5.0));
            assert_eq!(out.value(row, 3), None);
            assert_eq!(out.data[[row, 3]], NODATA as f32);
        }
    }

    #[test]
    fn test_disjoint_source_yields_all_nodata() {
        let tile = source_tile(100.0, 104.0, 1.0, four_by_four());
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[2.0]);
        let out = Reprojector::default()
            .reproject_tile(tile, &grid, MeasureKind::Extensive)
            .unwrap();
        assert!(out.data.iter().all(|&v| v == NODATA as f32));
        assert_eq!(out.valid_count(), 0);
    }

    #[test]
    fn test_zero_valid_pixels_are_canonical_nodata() {
        let mut data = four_by_four();
        data.slice_mut(s![0..2, 0..2]).fill(f32::NAN);
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[2.0]);
        for kind in [MeasureKind::Intensive, MeasureKind::Extensive] {
            let out = Reprojector::default()
                .reproject_tile(source_tile(0.0, 4.0, 1.0, data.clone()), &grid, kind)
                .unwrap();
            assert_eq!(out.data[[0, 0]], NODATA as f32);
            assert_eq!(out.support[[0, 0]], 0);
            assert!(!out.data.iter().any(|v| v.is_nan()));
        }
    }

    #[test]
    fn test_block_size_does_not_change_values() {
        let data = Array2::from_shape_fn((20, 20), |(r, c)| (r * 20 + c) as f32);
        let mosaic = TileMosaicker::new()
            .build(vec![source_tile(0.0, 20.0, 1.0, data)])
            .unwrap();
        let grid = grid(Extent::new(0.0, 0.0, 20.0, 20.0), &[2.0]);

        let whole = Reprojector::new(ReprojectOptions {
            block_rows: 1024,
            ..Default::default()
        })
        .reproject(&mosaic, &grid, MeasureKind::Extensive)
        .unwrap();
        let blocked = Reprojector::new(ReprojectOptions {
            block_rows: 3,
            ..Default::default()
        })
        .reproject(&mosaic, &grid, MeasureKind::Extensive)
        .unwrap();
        assert_eq!(whole, blocked);
    }

    #[test]
    fn test_single_source_pixel_total_at_ratio_ten() {
        let grid = grid(Extent::new(0.0, 0.0, 20.0, 20.0), &[10.0]);
        for (row, col) in [(0, 0), (1, 1), (9, 9), (13, 4)] {
            let mut data = Array2::zeros((20, 20));
            data[[row, col]] = 1000.0;
            let out = Reprojector::default()
                .reproject_tile(source_tile(0.0, 20.0, 1.0, data), &grid, MeasureKind::Extensive)
                .unwrap();
            assert_relative_eq!(out.data[[row / 10, col / 10]], 1000.0, max_relative = 1e-6);
            assert_relative_eq!(out.valid_sum(), 1000.0, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_every_source_column_counts_at_ratio_thirty_three() {
        let grid = grid(Extent::new(0.0, 0.0, 33.0, 33.0), &[33.0]);
        for col in [0, 1, 2, 16, 32] {
            let mut data = Array2::zeros((33, 33));
            data.column_mut(col).fill(100.0);
            let out = Reprojector::default()
                .reproject_tile(source_tile(0.0, 33.0, 1.0, data), &grid, MeasureKind::Intensive)
                .unwrap();
            assert_relative_eq!(out.data[[0, 0]], 100.0 / 33.0, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_cells_straddling_source_pixels_are_weighted_by_overlap() {
        // 3 m source pixels onto a 10 m grid: cell edges cut through source pixels
        let grid = grid(Extent::new(0.0, 0.0, 30.0, 30.0), &[10.0]);
        let out = Reprojector::default()
            .reproject_tile(source_tile(0.0, 30.0, 3.0, Array2::from_elem((10, 10), 1.0)), &grid, MeasureKind::Extensive)
            .unwrap();
        for &v in out.data.iter() {
            assert_relative_eq!(v, 100.0 / 9.0, max_relative = 1e-6);
        }
        assert_relative_eq!(out.valid_sum(), 100.0, max_relative = 1e-6);

        // source columns alternate between 0 and 9
        let data = Array2::from_shape_fn((10, 10), |(_, c)| if c % 2 == 0 { 0.0 } else { 9.0 });
        let out = Reprojector::default()
            .reproject_tile(source_tile(0.0, 30.0, 3.0, data), &grid, MeasureKind::Intensive)
            .unwrap();
        // cell 0 spans x 0..10: pixels [0,3) 0, [3,6) 9, [6,9) 0, [9,10) 9
        assert_relative_eq!(out.data[[0, 0]], 9.0 * 4.0 / 10.0, max_relative = 1e-6);
    }

    #[test]
    fn test_source_window_budget_does_not_change_values() {
        let data = Array2::from_shape_fn((30, 30), |(r, c)| ((r * 31 + c * 17) % 23) as f32);
        let mosaic = TileMosaicker::new()
            .build(vec![source_tile(0.0, 30.0, 1.0, data)])
            .unwrap();
        let grid = grid(Extent::new(0.0, 0.0, 30.0, 30.0), &[3.0]);

        let whole = Reprojector::default()
            .reproject(&mosaic, &grid, MeasureKind::Extensive)
            .unwrap();
        let tiny = Reprojector::new(ReprojectOptions {
            block_rows: 2,
            max_window_pixels: 20,
        });
        let plan = tiny.plan(&mosaic, &grid, MeasureKind::Extensive).unwrap();
        assert_eq!((plan.block_rows, plan.block_cols), (1, 2));
        assert_eq!(tiny.reproject(&mosaic, &grid, MeasureKind::Extensive).unwrap(), whole);

        // strips assembled top to bottom match the full warp
        let top = plan.warp_rows(0..4).unwrap();
        let bottom = plan.warp_rows(4..10).unwrap();
        assert_eq!(top.data, whole.data.slice(s![0..4, ..]));
        assert_eq!(bottom.data, whole.data.slice(s![4..10, ..]));
        assert_eq!(bottom.transform, GeoTransform::north_up(0.0, 18.0, 3.0, -3.0));
        assert!(plan.warp_rows(8..11).is_err());
    }

    #[test]
    fn test_singular_transform_is_a_reprojection_error() {
        let tile = source_tile(0.0, 4.0, 0.0, four_by_four());
        let grid = grid(Extent::new(0.0, 0.0, 4.0, 4.0), &[2.0]);
        assert!(matches!(
            Reprojector::default().reproject_tile(tile, &grid, MeasureKind::Intensive),
            Err(GridError::Reprojection(_))
        ));
    }

    #[test]
    fn test_geographic_source_onto_laea() {
        let grid = GridSpec::new(
            Crs::Epsg(3035),
            Extent::new(4_300_000.0, 3_200_000.0, 4_340_000.0, 3_240_000.0),
            NODATA,
            &[10_000.0],
        )
        .unwrap();
        if CoordinateTransformer::new(&Crs::Epsg(4326), &grid.crs).is_err() {
            println!("PROJ database not available, skipping");
            return;
        }
        // 0.01 degree cells around the LAEA origin at 10E 52N
        let tile = RasterTile::new(
            Crs::Epsg(4326),
            GeoTransform::north_up(9.0, 53.0, 0.01, -0.01),
            vec![RasterBand::new(Array2::from_elem((200, 200), 1.0), Some(NODATA))],
        );
        let out = Reprojector::default()
            .reproject_tile(tile, &grid, MeasureKind::Extensive)
            .unwrap();
        assert_eq!(out.valid_count(), 16);
        // a 10 km cell holds roughly 100 km2 / (0.01deg x 0.01deg at 52N ~ 0.76 km2) source pixels
        for &v in out.data.iter() {
            assert!(v > 120.0 && v < 150.0, "unexpected cell total {}", v);
        }
    }
}
