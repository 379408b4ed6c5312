use crate::types::{Crs, Extent, GeoTransform, Grid, GridError, GridResult, InverseGeoTransform, RasterBand, RasterTile};
use ndarray::s;
use std::fmt;

/// Relative tolerance on native pixel sizes within one source dataset
const DEFAULT_RESOLUTION_TOLERANCE: f64 = 1e-6;

/// Fraction of a pixel a tile origin may be off the mosaic grid before it is reported
const ALIGNMENT_WARN_THRESHOLD: f64 = 0.01;

/// Pixels behind one mosaic tile.
///
/// Only metadata is needed to place a tile; samples are pulled window by window so a source
/// never has to be held in memory as a whole.
pub trait TileSource: Send + Sync + fmt::Debug {
    /// Human readable origin for error messages
    fn label(&self) -> String;

    fn crs(&self) -> &Crs;

    fn transform(&self) -> &GeoTransform;

    /// (rows, cols)
    fn dim(&self) -> (usize, usize);

    fn validate(&self) -> GridResult<()> {
        Ok(())
    }

    /// First-band samples of a window lying inside the tile, with the band's no-data marker
    fn read_window(&self, row_offset: usize, col_offset: usize, rows: usize, cols: usize) -> GridResult<RasterBand>;
}

impl TileSource for RasterTile {
    fn label(&self) -> String {
        RasterTile::label(self)
    }

    fn crs(&self) -> &Crs {
        &self.crs
    }

    fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    fn dim(&self) -> (usize, usize) {
        RasterTile::dim(self)
    }

    fn validate(&self) -> GridResult<()> {
        RasterTile::validate(self)
    }

    fn read_window(&self, row_offset: usize, col_offset: usize, rows: usize, cols: usize) -> GridResult<RasterBand> {
        let band = self.bands.first().ok_or_else(|| GridError::InvalidRaster {
            path: RasterTile::label(self),
            reason: "raster has no bands".to_string(),
        })?;
        let (tile_rows, tile_cols) = band.data.dim();
        if row_offset + rows > tile_rows || col_offset + cols > tile_cols {
            return Err(GridError::InvalidRaster {
                path: RasterTile::label(self),
                reason: format!(
                    "window {}x{} at ({}, {}) exceeds {}x{} raster",
                    rows, cols, row_offset, col_offset, tile_rows, tile_cols
                ),
            });
        }
        let data = band
            .data
            .slice(s![row_offset..row_offset + rows, col_offset..col_offset + cols])
            .to_owned();
        Ok(RasterBand::new(data, band.nodata))
    }
}

/// Composes the tiles of one source dataset into a [`Mosaic`]
#[derive(Debug, Clone)]
pub struct TileMosaicker {
    resolution_tolerance: f64,
}

/// A tile with its placement in mosaic pixel coordinates
#[derive(Debug)]
struct PlacedTile {
    source: Box<dyn TileSource>,
    row_offset: i64,
    col_offset: i64,
    rows: i64,
    cols: i64,
}

/// Virtual union of tiles at native resolution.
///
/// Reads go to the underlying tiles; nothing is resampled or copied into a mosaic buffer.
/// Where footprints overlap the tile given last wins, unless its sample is no-data.
#[derive(Debug)]
pub struct Mosaic {
    tiles: Vec<PlacedTile>,
    crs: Crs,
    transform: GeoTransform,
    inverse: InverseGeoTransform,
    rows: usize,
    cols: usize,
}

impl Default for TileMosaicker {
    fn default() -> Self {
        Self {
            resolution_tolerance: DEFAULT_RESOLUTION_TOLERANCE,
        }
    }
}

impl TileMosaicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(resolution_tolerance: f64) -> Self {
        Self { resolution_tolerance }
    }

    /// Build a mosaic from tiles in caller-defined, stable order.
    ///
    /// Only the first band of every tile takes part in the mosaic.
    pub fn build<T: TileSource + 'static>(&self, tiles: Vec<T>) -> GridResult<Mosaic> {
        self.build_boxed(
            tiles
                .into_iter()
                .map(|tile| Box::new(tile) as Box<dyn TileSource>)
                .collect(),
        )
    }

    pub fn build_boxed(&self, tiles: Vec<Box<dyn TileSource>>) -> GridResult<Mosaic> {
        let reference = tiles.first().ok_or_else(|| GridError::InvalidRaster {
            path: "<mosaic>".to_string(),
            reason: "no tiles to mosaic".to_string(),
        })?;
        log::info!("Building mosaic from {} tile(s)", tiles.len());

        let crs = reference.crs().clone();
        let pixel_width = reference.transform().pixel_width;
        let pixel_height = reference.transform().pixel_height;

        for tile in &tiles {
            tile.validate()?;
            let transform = tile.transform();
            if !transform.is_axis_aligned() {
                return Err(GridError::InvalidRaster {
                    path: tile.label(),
                    reason: "rotated geotransforms are not supported".to_string(),
                });
            }
            if tile.crs() != &crs {
                return Err(GridError::CrsMismatch {
                    path: tile.label(),
                    expected: crs.to_string(),
                    found: tile.crs().to_string(),
                });
            }
            if !self.same_size(pixel_width, transform.pixel_width)
                || !self.same_size(pixel_height, transform.pixel_height)
            {
                return Err(GridError::ResolutionMismatch {
                    path: tile.label(),
                    expected: (pixel_width, pixel_height),
                    found: (transform.pixel_width, transform.pixel_height),
                });
            }
        }

        let extent = tiles
            .iter()
            .map(|tile| {
                let (rows, cols) = tile.dim();
                tile.transform().extent(rows, cols)
            })
            .reduce(|acc, extent| acc.union(&extent))
            .ok_or_else(|| GridError::InvalidRaster {
                path: "<mosaic>".to_string(),
                reason: "no tiles to mosaic".to_string(),
            })?;
        let origin_x = if pixel_width > 0.0 { extent.xmin } else { extent.xmax };
        let origin_y = if pixel_height < 0.0 { extent.ymax } else { extent.ymin };
        let transform = GeoTransform::north_up(origin_x, origin_y, pixel_width, pixel_height);
        let inverse = transform.inverse()?;

        let rows = (extent.height() / pixel_height.abs()).round() as usize;
        let cols = (extent.width() / pixel_width.abs()).round() as usize;
        log::debug!("Mosaic grid: {}x{} pixels, extent {:?}", rows, cols, extent);

        let tiles = tiles
            .into_iter()
            .map(|source| {
                let origin = source.transform();
                let (col, row) = inverse.world_to_pixel(origin.top_left_x, origin.top_left_y);
                let misalignment = (col - col.round()).abs().max((row - row.round()).abs());
                if misalignment > ALIGNMENT_WARN_THRESHOLD {
                    log::warn!(
                        "Tile {} is {:.3} px off the mosaic grid, snapping to nearest pixel",
                        source.label(),
                        misalignment
                    );
                }
                let (tile_rows, tile_cols) = source.dim();
                PlacedTile {
                    row_offset: row.round() as i64,
                    col_offset: col.round() as i64,
                    rows: tile_rows as i64,
                    cols: tile_cols as i64,
                    source,
                }
            })
            .collect();

        Ok(Mosaic {
            tiles,
            crs,
            transform,
            inverse,
            rows,
            cols,
        })
    }

    fn same_size(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.resolution_tolerance * a.abs().max(b.abs())
    }
}

impl Mosaic {
    /// Mosaic consisting of a single tile
    pub fn from_tile<T: TileSource + 'static>(tile: T) -> GridResult<Self> {
        TileMosaicker::default().build(vec![tile])
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn inverse(&self) -> &InverseGeoTransform {
        &self.inverse
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn extent(&self) -> Extent {
        self.transform.extent(self.rows, self.cols)
    }

    /// Absolute native pixel size (width, height)
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.transform.pixel_width.abs(), self.transform.pixel_height.abs())
    }

    /// Read a window of mosaic pixels.
    ///
    /// Only the tiles intersecting the window are read. Pixels without a valid sample in any
    /// tile, including pixels outside the mosaic, hold `nodata`, which the returned band
    /// declares as its marker.
    pub fn read_window(
        &self,
        row_offset: i64,
        col_offset: i64,
        rows: usize,
        cols: usize,
        nodata: f32,
    ) -> GridResult<RasterBand> {
        let mut data = Grid::from_elem((rows, cols), nodata);
        let row_end = row_offset + rows as i64;
        let col_end = col_offset + cols as i64;

        for placed in &self.tiles {
            let r0 = row_offset.max(placed.row_offset);
            let r1 = row_end.min(placed.row_offset + placed.rows);
            let c0 = col_offset.max(placed.col_offset);
            let c1 = col_end.min(placed.col_offset + placed.cols);
            if r0 >= r1 || c0 >= c1 {
                continue;
            }

            let window = placed.source.read_window(
                (r0 - placed.row_offset) as usize,
                (c0 - placed.col_offset) as usize,
                (r1 - r0) as usize,
                (c1 - c0) as usize,
            )?;
            let mut target = data.slice_mut(s![
                (r0 - row_offset) as usize..(r1 - row_offset) as usize,
                (c0 - col_offset) as usize..(c1 - col_offset) as usize
            ]);
            // later tiles overwrite, their no-data stays transparent
            target.zip_mut_with(&window.data, |out, &v| {
                if !window.is_nodata(v) {
                    *out = v;
                }
            });
        }

        Ok(RasterBand::new(data, Some(nodata as f64)))
    }

    /// Valid sample at a mosaic pixel, `None` for no-data, gaps and positions outside the mosaic
    pub fn value_at_pixel(&self, row: i64, col: i64) -> GridResult<Option<f32>> {
        if row < 0 || col < 0 || row >= self.rows as i64 || col >= self.cols as i64 {
            return Ok(None);
        }
        let band = self.read_window(row, col, 1, 1, f32::NAN)?;
        let value = band.data[[0, 0]];
        Ok(if value.is_nan() { None } else { Some(value) })
    }

    /// Valid sample of the pixel containing the world coordinate (x, y)
    pub fn value_at(&self, x: f64, y: f64) -> GridResult<Option<f32>> {
        if !x.is_finite() || !y.is_finite() {
            return Ok(None);
        }
        let (col, row) = self.inverse.world_to_pixel(x, y);
        self.value_at_pixel(row.floor() as i64, col.floor() as i64)
    }
}
