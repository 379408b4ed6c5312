use crate::core::mosaic::TileSource;
use crate::core::nodata::NoDataNormalizer;
use crate::types::{Crs, GeoTransform, Grid, GridError, GridResult, RasterBand, RasterTile};
use gdal::Dataset;
use std::path::{Path, PathBuf};

/// GDAL-backed source raster reader
pub struct RasterReader;

/// First band of a source file, read window by window.
///
/// Holds metadata only. Every window read opens the file, reads the requested pixels and
/// normalizes their no-data samples, so the whole raster never sits in memory.
#[derive(Debug, Clone)]
pub struct FileTile {
    path: PathBuf,
    crs: Crs,
    transform: GeoTransform,
    rows: usize,
    cols: usize,
    nodata: Option<f64>,
    normalizer: NoDataNormalizer,
}

impl FileTile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn invalid(&self, reason: String) -> GridError {
        GridError::InvalidRaster {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

impl TileSource for FileTile {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn crs(&self) -> &Crs {
        &self.crs
    }

    fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn read_window(&self, row_offset: usize, col_offset: usize, rows: usize, cols: usize) -> GridResult<RasterBand> {
        if row_offset + rows > self.rows || col_offset + cols > self.cols {
            return Err(self.invalid(format!(
                "window {}x{} at ({}, {}) exceeds {}x{} raster",
                rows, cols, row_offset, col_offset, self.rows, self.cols
            )));
        }
        let dataset = Dataset::open(&self.path).map_err(|e| self.invalid(format!("cannot open: {}", e)))?;
        let band = dataset.rasterband(1)?;
        let buffer = band
            .read_as::<f32>(
                (col_offset as isize, row_offset as isize),
                (cols, rows),
                (cols, rows),
                None,
            )
            .map_err(|e| self.invalid(format!("cannot read window at ({}, {}): {}", row_offset, col_offset, e)))?;
        let data = Grid::from_shape_vec((rows, cols), buffer.data)
            .map_err(|e| self.invalid(format!("failed to reshape window: {}", e)))?;
        Ok(self.normalizer.normalize_band(&RasterBand::new(data, self.nodata)))
    }
}

impl RasterReader {
    /// Read every band of a raster file into a [`RasterTile`]
    pub fn read_tile<P: AsRef<Path>>(path: P) -> GridResult<RasterTile> {
        let path = path.as_ref();
        log::debug!("Reading raster: {}", path.display());

        let invalid = |reason: String| GridError::InvalidRaster {
            path: path.display().to_string(),
            reason,
        };

        let dataset = Dataset::open(path).map_err(|e| invalid(format!("cannot open: {}", e)))?;

        let geo_transform = dataset
            .geo_transform()
            .map_err(|e| invalid(format!("no geotransform: {}", e)))?;
        let srs = dataset
            .spatial_ref()
            .map_err(|e| invalid(format!("no spatial reference: {}", e)))?;
        let crs = Crs::from_spatial_ref(&srs)?;

        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count() as usize;
        log::debug!("Raster size: {}x{}, {} band(s), {}", width, height, band_count, crs);

        let mut bands = Vec::with_capacity(band_count);
        for index in 1..=band_count {
            let rasterband = dataset.rasterband(index as isize)?;
            let nodata = rasterband.no_data_value();
            let buffer = rasterband
                .read_as::<f32>((0, 0), (width, height), (width, height), None)
                .map_err(|e| invalid(format!("cannot read band {}: {}", index, e)))?;

            let data = Grid::from_shape_vec((height, width), buffer.data)
                .map_err(|e| invalid(format!("failed to reshape band {}: {}", index, e)))?;
            bands.push(RasterBand::new(data, nodata));
        }

        let tile = RasterTile::new(crs, GeoTransform::from_gdal(&geo_transform), bands).with_source(path);
        tile.validate()?;
        Ok(tile)
    }

    /// Open a raster file for windowed reads of its first band, reading metadata only
    pub fn open_tile<P: AsRef<Path>>(path: P, normalizer: &NoDataNormalizer) -> GridResult<FileTile> {
        let path = path.as_ref();
        log::debug!("Opening raster: {}", path.display());

        let invalid = |reason: String| GridError::InvalidRaster {
            path: path.display().to_string(),
            reason,
        };

        let dataset = Dataset::open(path).map_err(|e| invalid(format!("cannot open: {}", e)))?;
        let geo_transform = dataset
            .geo_transform()
            .map_err(|e| invalid(format!("no geotransform: {}", e)))?;
        let srs = dataset
            .spatial_ref()
            .map_err(|e| invalid(format!("no spatial reference: {}", e)))?;
        let crs = Crs::from_spatial_ref(&srs)?;

        let (width, height) = dataset.raster_size();
        if dataset.raster_count() < 1 {
            return Err(invalid("raster has no bands".to_string()));
        }
        if width == 0 || height == 0 {
            return Err(invalid(format!("raster has an empty shape {:?}", (height, width))));
        }
        let nodata = dataset.rasterband(1)?.no_data_value();
        log::debug!("Raster size: {}x{}, no-data {:?}, {}", width, height, nodata, crs);

        Ok(FileTile {
            path: path.to_path_buf(),
            crs,
            transform: GeoTransform::from_gdal(&geo_transform),
            rows: height,
            cols: width,
            nodata,
            normalizer: normalizer.clone(),
        })
    }

    /// Open several files, keeping the order of `paths`.
    ///
    /// Opens run in parallel when the `parallel` feature is enabled; the first failure is returned.
    pub fn open_tiles(paths: &[PathBuf], normalizer: &NoDataNormalizer) -> GridResult<Vec<FileTile>> {
        log::info!("Opening {} source raster(s)", paths.len());

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            paths.par_iter().map(|path| Self::open_tile(path, normalizer)).collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            paths.iter().map(|path| Self::open_tile(path, normalizer)).collect()
        }
    }
}
