use crate::types::{GridError, GridResult, GridSpec, HarmonizedRaster};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Writes harmonized rasters into the per-resolution output layout
#[derive(Debug, Clone)]
pub struct GridWriter {
    output_dir: PathBuf,
    /// Digits of the zero-padded cell size directory
    pad_width: usize,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    /// Extra attempts after the first failure
    retries: u32,
    /// Delay before the first retry, doubled on each further retry
    backoff: Duration,
}

/// One output GeoTIFF being filled strip by strip
pub struct GridOutput {
    path: PathBuf,
    dataset: Dataset,
    rows: usize,
    cols: usize,
    valid_pixels: usize,
    retry: RetryPolicy,
}

/// Failures worth another attempt: filesystem and GDAL I/O
pub fn is_transient(error: &GridError) -> bool {
    matches!(error, GridError::Io(_) | GridError::Gdal(_))
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-transient error or runs out of attempts.
    ///
    /// `cleanup` runs after every failed attempt. Exhausted retries become a `Write` error.
    fn run<T>(&self, path: &Path, mut op: impl FnMut() -> GridResult<T>, mut cleanup: impl FnMut()) -> GridResult<T> {
        let attempts = self.retries + 1;
        let mut delay = self.backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => {
                    cleanup();
                    return Err(e);
                }
                Err(e) => {
                    cleanup();
                    if attempt < attempts {
                        log::warn!("Attempt {} for {} failed: {}, retrying...", attempt, path.display(), e);
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "write failed after all retries".to_string());
        Err(GridError::Write {
            path: path.display().to_string(),
            reason,
        })
    }
}

impl GridWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            pad_width: 6,
            retry: RetryPolicy {
                retries: 3,
                backoff: Duration::from_millis(200),
            },
        }
    }

    pub fn with_pad_width(mut self, pad_width: usize) -> Self {
        self.pad_width = pad_width;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retry = RetryPolicy { retries, backoff };
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory holding every output of one cell size, e.g. `001000`.
    ///
    /// The integer part is zero-padded; a fractional part is kept, so `0.5` maps to `000000.5`.
    pub fn cell_size_dir(&self, cell_size: f64) -> PathBuf {
        let whole = cell_size.trunc() as u64;
        let text = cell_size.to_string();
        let name = match text.split_once('.') {
            Some((_, fraction)) => format!("{:0width$}.{}", whole, fraction, width = self.pad_width),
            None => format!("{:0width$}", whole, width = self.pad_width),
        };
        self.output_dir.join(name)
    }

    /// `{output_dir}/{cell size}/{code}.tif`
    pub fn output_path(&self, code: &str, cell_size: f64) -> PathBuf {
        self.cell_size_dir(cell_size).join(format!("{}.tif", code))
    }

    /// Write `raster` as a single-band Float32 GeoTIFF and return its path.
    ///
    /// I/O failures remove any partial file and are retried with exponential backoff.
    pub fn write(&self, raster: &HarmonizedRaster, code: &str, grid: &GridSpec) -> GridResult<PathBuf> {
        let path = self.output_path(code, raster.cell_size);
        let expected = grid.dimensions(raster.cell_size);
        if raster.dim() != expected || raster.support.dim() != expected {
            return Err(GridError::InvalidRaster {
                path: path.display().to_string(),
                reason: format!(
                    "raster of {:?} (support {:?}) does not match the {:?} grid at {}",
                    raster.dim(),
                    raster.support.dim(),
                    expected,
                    raster.cell_size
                ),
            });
        }

        let mut output = self.create(code, raster.cell_size, grid)?;
        if let Err(e) = output.write_rows(0, raster) {
            output.discard();
            return Err(e);
        }
        Ok(output.finish())
    }

    /// Create the no-data GeoTIFF of `code` at `cell_size`, ready for [`GridOutput::write_rows`]
    pub fn create(&self, code: &str, cell_size: f64, grid: &GridSpec) -> GridResult<GridOutput> {
        let path = self.output_path(code, cell_size);
        let (rows, cols) = grid.dimensions(cell_size);
        log::debug!("Creating {} ({}x{})", path.display(), cols, rows);

        let dataset = self.retry.run(
            &path,
            || create_dataset(&path, rows, cols, cell_size, grid),
            || {
                let _ = std::fs::remove_file(&path);
            },
        )?;

        Ok(GridOutput {
            path,
            dataset,
            rows,
            cols,
            valid_pixels: 0,
            retry: self.retry,
        })
    }
}

fn create_dataset(
    path: &Path,
    rows: usize,
    cols: usize,
    cell_size: f64,
    grid: &GridSpec,
) -> GridResult<Dataset> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let srs = grid.crs.to_spatial_ref()?;

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "COMPRESS", value: "DEFLATE" },
        RasterCreationOption { key: "PREDICTOR", value: "3" },
        RasterCreationOption { key: "TILED", value: "YES" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        cols as isize,
        rows as isize,
        1,
        &options,
    )?;

    dataset.set_geo_transform(&grid.transform(cell_size).to_gdal())?;
    dataset.set_spatial_ref(&srs)?;
    dataset.rasterband(1)?.set_no_data_value(Some(grid.nodata))?;
    Ok(dataset)
}

impl GridOutput {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// (rows, cols) of the full output
    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Valid pixels written so far
    pub fn valid_pixels(&self) -> usize {
        self.valid_pixels
    }

    /// Write a full-width strip starting at output row `row_offset`
    pub fn write_rows(&mut self, row_offset: usize, strip: &HarmonizedRaster) -> GridResult<()> {
        let (rows, cols) = strip.dim();
        if cols != self.cols || row_offset + rows > self.rows || strip.support.dim() != (rows, cols) {
            return Err(GridError::InvalidRaster {
                path: self.path.display().to_string(),
                reason: format!(
                    "strip of {}x{} at row {} does not fit a {}x{} output",
                    rows, cols, row_offset, self.rows, self.cols
                ),
            });
        }

        let flat: Vec<f32> = strip.data.iter().copied().collect();
        let buffer = Buffer::new((cols, rows), flat);
        let dataset = &self.dataset;
        self.retry.run(
            &self.path,
            || {
                let mut band = dataset.rasterband(1)?;
                band.write((0, row_offset as isize), (cols, rows), &buffer)?;
                Ok(())
            },
            || {},
        )?;
        self.valid_pixels += strip.valid_count();
        Ok(())
    }

    /// Close the dataset and return its path
    pub fn finish(self) -> PathBuf {
        let GridOutput {
            path,
            dataset,
            rows,
            cols,
            ..
        } = self;
        drop(dataset);
        log::info!("✅ Wrote {} ({}x{})", path.display(), cols, rows);
        path
    }

    /// Close the dataset and remove the partial file
    pub fn discard(self) {
        let GridOutput { path, dataset, .. } = self;
        drop(dataset);
        if let Err(e) = std::fs::remove_file(&path) {
            log::debug!("Could not remove partial output {}: {}", path.display(), e);
        }
    }
}
