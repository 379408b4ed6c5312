//! Per-measure stage chain and the batch driver
//!
//! Every measure runs normalize → mosaic → reproject → aggregate → write strictly in sequence.
//! The base raster is produced in full-width strips; each strip is aggregated to every coarser
//! resolution and handed to a [`StripSink`] before the next one is warped, so a measure never
//! holds a full grid in memory unless the sink collects it.
//!
//! Measures are independent of each other and run concurrently on a bounded pool; a failing
//! measure is recorded in the [`BatchReport`] without stopping the others.

use crate::config::{discover_sources, Config};
use crate::core::{Mosaic, MultiScaleAggregator, NoDataNormalizer, ReprojectOptions, Reprojector, TileMosaicker};
use crate::io::{GridOutput, GridWriter, RasterReader};
use crate::types::{GridError, GridResult, GridSpec, HarmonizedRaster, Measure, MeasureKind, MeasureSpec, RasterTile};
use chrono::{DateTime, Utc};
use ndarray::s;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One written output file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub cell_size: f64,
    pub path: PathBuf,
    pub valid_pixels: usize,
    pub total_pixels: usize,
}

/// One output file that could not be written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFailure {
    pub cell_size: f64,
    pub path: PathBuf,
    pub error: String,
}

/// Per-resolution outcome of writing one measure
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub written: Vec<OutputRecord>,
    pub failed: Vec<OutputFailure>,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of one measure's pipeline
#[derive(Debug, Clone, Serialize)]
pub struct MeasureReport {
    pub measure: Measure,
    pub code: String,
    pub kind: MeasureKind,
    pub source_count: usize,
    pub outputs: Vec<OutputRecord>,
    pub failed_outputs: Vec<OutputFailure>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl MeasureReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_outputs.is_empty()
    }
}

/// Partial-success summary of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub measures: Vec<MeasureReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &MeasureReport> {
        self.measures.iter().filter(|m| m.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &MeasureReport> {
        self.measures.iter().filter(|m| !m.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> GridResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Receives harmonized strips top to bottom, for every resolution of the grid
pub trait StripSink {
    /// `level` indexes the grid's cell sizes (0 is the base resolution) and `row_offset` is the
    /// strip's first row at that resolution
    fn accept(&mut self, level: usize, row_offset: usize, strip: &HarmonizedRaster);
}

/// Assembles strips into full rasters
struct CollectSink {
    rasters: Vec<HarmonizedRaster>,
}

impl CollectSink {
    fn new(grid: &GridSpec) -> GridResult<Self> {
        let rasters = grid
            .cell_sizes()
            .iter()
            .map(|&cell_size| {
                let factor = grid.factor(cell_size)?;
                Ok(HarmonizedRaster::empty(grid, cell_size, (factor * factor) as u32))
            })
            .collect::<GridResult<Vec<_>>>()?;
        Ok(Self { rasters })
    }
}

impl StripSink for CollectSink {
    fn accept(&mut self, level: usize, row_offset: usize, strip: &HarmonizedRaster) {
        let raster = &mut self.rasters[level];
        let rows = row_offset..row_offset + strip.dim().0;
        raster.data.slice_mut(s![rows.clone(), ..]).assign(&strip.data);
        raster.support.slice_mut(s![rows, ..]).assign(&strip.support);
    }
}

enum LevelOutput {
    Open(GridOutput),
    Failed(OutputFailure),
}

/// Streams strips into one GeoTIFF per resolution; a failing resolution does not stop the others
struct WriterSink {
    levels: Vec<LevelOutput>,
}

impl WriterSink {
    fn create(writer: &GridWriter, grid: &GridSpec, code: &str) -> Self {
        let levels = grid
            .cell_sizes()
            .iter()
            .map(|&cell_size| match writer.create(code, cell_size, grid) {
                Ok(output) => LevelOutput::Open(output),
                Err(e) => {
                    log::error!("❌ Cannot create {} at {}: {}", code, cell_size, e);
                    LevelOutput::Failed(OutputFailure {
                        cell_size,
                        path: writer.output_path(code, cell_size),
                        error: e.to_string(),
                    })
                }
            })
            .collect();
        Self { levels }
    }

    fn has_open_outputs(&self) -> bool {
        self.levels.iter().any(|level| matches!(level, LevelOutput::Open(_)))
    }

    /// Remove every partial file
    fn abandon(self) {
        for level in self.levels {
            if let LevelOutput::Open(output) = level {
                output.discard();
            }
        }
    }

    fn finish(self, grid: &GridSpec) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        for (level, &cell_size) in self.levels.into_iter().zip(grid.cell_sizes()) {
            match level {
                LevelOutput::Open(output) => {
                    let (rows, cols) = output.dim();
                    let valid_pixels = output.valid_pixels();
                    if valid_pixels == 0 {
                        log::warn!("{} has no valid pixels", output.path().display());
                    }
                    outcome.written.push(OutputRecord {
                        cell_size,
                        path: output.finish(),
                        valid_pixels,
                        total_pixels: rows * cols,
                    });
                }
                LevelOutput::Failed(failure) => outcome.failed.push(failure),
            }
        }
        outcome
    }
}

impl StripSink for WriterSink {
    fn accept(&mut self, level: usize, row_offset: usize, strip: &HarmonizedRaster) {
        let slot = &mut self.levels[level];
        if let LevelOutput::Open(output) = &mut *slot {
            if let Err(e) = output.write_rows(row_offset, strip) {
                log::error!("❌ Writing {} failed: {}", output.path().display(), e);
                let failure = OutputFailure {
                    cell_size: strip.cell_size,
                    path: output.path().to_path_buf(),
                    error: e.to_string(),
                };
                if let LevelOutput::Open(output) = std::mem::replace(slot, LevelOutput::Failed(failure)) {
                    output.discard();
                }
            }
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Base rows per strip: a multiple of every aggregation factor, close to `target`
fn strip_height(factors: &[usize], target: usize) -> usize {
    let lcm = factors.iter().fold(1, |acc, &k| acc / gcd(acc, k.max(1)) * k.max(1));
    lcm * (target / lcm).max(1)
}

/// Stage chain shared by every measure of a run
pub struct Pipeline {
    grid: Arc<GridSpec>,
    reprojector: Reprojector,
    aggregator: MultiScaleAggregator,
    writer: GridWriter,
    /// Target base rows per strip
    strip_rows: usize,
}

impl Pipeline {
    pub fn new(grid: Arc<GridSpec>, options: ReprojectOptions, writer: GridWriter) -> Self {
        let aggregator = MultiScaleAggregator::new(options.block_rows);
        let strip_rows = options.block_rows;
        Self {
            grid,
            reprojector: Reprojector::new(options),
            aggregator,
            writer,
            strip_rows,
        }
    }

    pub fn from_config(config: &Config) -> GridResult<Self> {
        Ok(Self::new(
            Arc::new(config.grid_spec()?),
            config.reproject_options(),
            config.writer(),
        ))
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn writer(&self) -> &GridWriter {
        &self.writer
    }

    /// Warp `mosaic` strip by strip and feed every resolution of each strip to `sink`.
    ///
    /// Coarse strips are aggregated directly from the base strip.
    pub fn harmonize_mosaic(&self, mosaic: &Mosaic, kind: MeasureKind, sink: &mut dyn StripSink) -> GridResult<()> {
        let plan = self.reprojector.plan(mosaic, &self.grid, kind)?;
        let factors = self
            .grid
            .cell_sizes()
            .iter()
            .map(|&cell_size| self.grid.factor(cell_size))
            .collect::<GridResult<Vec<_>>>()?;
        let strip_rows = strip_height(&factors, self.strip_rows);
        let rows = plan.rows();
        log::debug!("Streaming {} base rows in strips of {}", rows, strip_rows);

        let mut valid = 0usize;
        let mut total = 0usize;
        for start in (0..rows).step_by(strip_rows) {
            let base = plan.warp_rows(start..(start + strip_rows).min(rows))?;
            valid += base.valid_count();
            total += base.data.len();
            for (level, &factor) in factors.iter().enumerate().skip(1) {
                let coarse = self.aggregator.aggregate(&base, factor, kind)?;
                sink.accept(level, start / factor, &coarse);
            }
            sink.accept(0, start, &base);
        }

        log::info!(
            "Base grid at {} done with {:.1}% coverage",
            plan.cell_size(),
            100.0 * valid as f64 / total.max(1) as f64
        );
        Ok(())
    }

    /// Run the stages on in-memory `tiles`.
    ///
    /// Returns one raster per grid cell size, base resolution first.
    pub fn harmonize_tiles(&self, spec: &MeasureSpec, tiles: Vec<RasterTile>) -> GridResult<Vec<HarmonizedRaster>> {
        let normalizer = NoDataNormalizer::new(self.grid.nodata).with_extra_sentinels(&spec.extra_nodata);
        let tiles = tiles
            .iter()
            .map(|tile| normalizer.normalize(tile))
            .collect::<GridResult<Vec<_>>>()?;

        let mosaic = TileMosaicker::new().build(tiles)?;
        let mut sink = CollectSink::new(&self.grid)?;
        self.harmonize_mosaic(&mosaic, spec.kind, &mut sink)?;
        Ok(sink.rasters)
    }

    /// Write every raster under the measure's output code.
    ///
    /// Each resolution is written independently; failures are collected, not propagated.
    pub fn write_all(&self, spec: &MeasureSpec, rasters: &[HarmonizedRaster]) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        for raster in rasters {
            if raster.valid_count() == 0 {
                log::warn!("{} at {} has no valid pixels", spec.code, raster.cell_size);
            }
            match self.writer.write(raster, &spec.code, &self.grid) {
                Ok(path) => {
                    let (rows, cols) = raster.dim();
                    outcome.written.push(OutputRecord {
                        cell_size: raster.cell_size,
                        path,
                        valid_pixels: raster.valid_count(),
                        total_pixels: rows * cols,
                    });
                }
                Err(e) => {
                    log::error!("❌ {} at {} not written: {}", spec.code, raster.cell_size, e);
                    outcome.failed.push(OutputFailure {
                        cell_size: raster.cell_size,
                        path: self.writer.output_path(&spec.code, raster.cell_size),
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// Read, harmonize and write one measure from its source files.
    ///
    /// Sources are read window by window and outputs are written strip by strip. An error
    /// before or during harmonization fails the measure and removes its partial files; a
    /// failing resolution only fails itself.
    pub fn process_measure(&self, spec: &MeasureSpec, paths: &[PathBuf]) -> GridResult<WriteOutcome> {
        if paths.is_empty() {
            return Err(GridError::Config(format!(
                "no source files matched {:?} for {}",
                spec.sources, spec.measure
            )));
        }
        log::info!("Processing {} ({}, {}) from {} file(s)", spec.measure, spec.code, spec.kind, paths.len());

        let normalizer = NoDataNormalizer::new(self.grid.nodata).with_extra_sentinels(&spec.extra_nodata);
        let tiles = RasterReader::open_tiles(paths, &normalizer)?;
        let mosaic = TileMosaicker::new().build(tiles)?;

        let mut sink = WriterSink::create(&self.writer, &self.grid, &spec.code);
        if sink.has_open_outputs() {
            if let Err(e) = self.harmonize_mosaic(&mosaic, spec.kind, &mut sink) {
                sink.abandon();
                return Err(e);
            }
        }
        Ok(sink.finish(&self.grid))
    }
}

/// Runs one pipeline per measure on a bounded worker pool
pub struct BatchProcessor {
    pipeline: Arc<Pipeline>,
    data_dir: PathBuf,
    workers: usize,
}

impl BatchProcessor {
    pub fn new(pipeline: Pipeline, data_dir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            data_dir: data_dir.into(),
            workers: workers.max(1),
        }
    }

    pub fn from_config(config: &Config) -> GridResult<Self> {
        Ok(Self::new(
            Pipeline::from_config(config)?,
            &config.data_dir,
            config.worker_count(),
        ))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process every measure and report each outcome, in input order
    pub fn run(&self, specs: &[MeasureSpec]) -> GridResult<BatchReport> {
        let started_at = Utc::now();
        log::info!("Starting batch of {} measure(s) on {} worker(s)", specs.len(), self.workers);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| GridError::Config(format!("Failed to create thread pool: {}", e)))?;

        let measures = pool.install(|| {
            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                specs.par_iter().map(|spec| self.run_measure(spec)).collect::<Vec<_>>()
            }

            #[cfg(not(feature = "parallel"))]
            {
                specs.iter().map(|spec| self.run_measure(spec)).collect::<Vec<_>>()
            }
        });

        let report = BatchReport {
            started_at,
            finished_at: Utc::now(),
            measures,
        };
        log::info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded().count(),
            report.failed().count()
        );
        Ok(report)
    }

    fn run_measure(&self, spec: &MeasureSpec) -> MeasureReport {
        let start = std::time::Instant::now();
        let mut source_count = 0;

        let result = discover_sources(&self.data_dir, &spec.sources).and_then(|paths| {
            source_count = paths.len();
            self.pipeline.process_measure(spec, &paths)
        });

        let (outcome, error) = match result {
            Ok(outcome) if outcome.is_complete() => {
                log::info!("✅ {} done: {} file(s) written", spec.measure, outcome.written.len());
                (outcome, None)
            }
            Ok(outcome) => {
                log::error!(
                    "❌ {}: {} of {} output(s) failed",
                    spec.measure,
                    outcome.failed.len(),
                    outcome.failed.len() + outcome.written.len()
                );
                (outcome, None)
            }
            Err(e) => {
                log::error!("❌ {} failed: {}", spec.measure, e);
                (WriteOutcome::default(), Some(e.to_string()))
            }
        };

        MeasureReport {
            measure: spec.measure,
            code: spec.code.clone(),
            kind: spec.kind,
            source_count,
            outputs: outcome.written,
            failed_outputs: outcome.failed,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, Extent, GeoTransform, Grid, RasterBand};
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    const NODATA: f64 = -9999.0;

    fn grid() -> Arc<GridSpec> {
        Arc::new(GridSpec::new(Crs::Epsg(3035), Extent::new(0.0, 0.0, 8.0, 8.0), NODATA, &[2.0, 4.0, 8.0]).unwrap())
    }

    fn tile(x: f64, y: f64, data: Grid, nodata: Option<f64>) -> RasterTile {
        RasterTile::new(
            Crs::Epsg(3035),
            GeoTransform::north_up(x, y, 1.0, -1.0),
            vec![RasterBand::new(data, nodata)],
        )
    }

    fn pipeline(output: &Path) -> Pipeline {
        Pipeline::new(grid(), ReprojectOptions::default(), GridWriter::new(output))
    }

    #[test]
    fn test_harmonize_tiles_produces_full_ladder() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(dir.path());
        let spec = MeasureSpec::new(Measure::Population);

        // two 8x4 tiles side by side, one with a -1 fill value
        let left = tile(0.0, 8.0, Grid::from_elem((8, 4), 1.0), None);
        let mut right_data = Grid::from_elem((8, 4), 1.0);
        right_data[[0, 0]] = -1.0;
        let right = tile(4.0, 8.0, right_data, Some(-1.0));

        let rasters = pipeline.harmonize_tiles(&spec, vec![left, right]).unwrap();
        assert_eq!(rasters.len(), 3);
        assert_eq!(rasters[0].dim(), (4, 4));
        assert_eq!(rasters[1].dim(), (2, 2));
        assert_eq!(rasters[2].dim(), (1, 1));
        for raster in &rasters {
            assert_eq!(raster.transform, pipeline.grid().transform(raster.cell_size));
            assert_eq!(raster.nodata, NODATA);
        }
        // three of the four source pixels behind cell (0, 2) are valid
        assert_relative_eq!(rasters[0].data[[0, 2]], 3.0, epsilon = 1e-4);
        assert_relative_eq!(rasters[0].data[[0, 0]], 4.0, epsilon = 1e-4);
        assert_relative_eq!(rasters[2].data[[0, 0]], 63.0, epsilon = 1e-3);
    }

    #[test]
    fn test_strip_height_is_a_multiple_of_every_factor() {
        assert_eq!(strip_height(&[1, 10, 100], 256), 200);
        assert_eq!(strip_height(&[1, 2, 4], 256), 256);
        assert_eq!(strip_height(&[1, 4, 6], 256), 252);
        assert_eq!(strip_height(&[1, 3], 1), 3);
    }

    #[test]
    fn test_strip_streaming_matches_single_pass() {
        let grid = Arc::new(
            GridSpec::new(Crs::Epsg(3035), Extent::new(0.0, 0.0, 12.0, 12.0), NODATA, &[1.0, 2.0, 6.0]).unwrap(),
        );
        let dir = TempDir::new().unwrap();
        let spec = MeasureSpec::new(Measure::Population);
        let data = Grid::from_shape_fn((24, 24), |(r, c)| if (r + c) % 11 == 0 { -1.0 } else { (r * c % 7) as f32 });
        let source = RasterTile::new(
            Crs::Epsg(3035),
            GeoTransform::north_up(0.0, 12.0, 0.5, -0.5),
            vec![RasterBand::new(data, Some(-1.0))],
        );

        let single = Pipeline::new(grid.clone(), ReprojectOptions::default(), GridWriter::new(dir.path()))
            .harmonize_tiles(&spec, vec![source.clone()])
            .unwrap();
        // strips of 6 base rows
        let streamed = Pipeline::new(
            grid,
            ReprojectOptions {
                block_rows: 1,
                ..Default::default()
            },
            GridWriter::new(dir.path()),
        )
        .harmonize_tiles(&spec, vec![source])
        .unwrap();
        assert_eq!(single, streamed);
    }

    #[test]
    fn test_blocked_resolution_does_not_stop_the_others() {
        if Crs::Epsg(3035).to_spatial_ref().is_err() {
            println!("PROJ database not available, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        // a file where the 4 m directory should be
        std::fs::write(out.join("000004"), b"").unwrap();

        let pipeline = Pipeline::new(
            grid(),
            ReprojectOptions::default(),
            GridWriter::new(&out).with_retries(0, std::time::Duration::from_millis(1)),
        );
        let spec = MeasureSpec::new(Measure::Population);
        let rasters = pipeline
            .harmonize_tiles(&spec, vec![tile(0.0, 8.0, Grid::from_elem((8, 8), 1.0), None)])
            .unwrap();

        let outcome = pipeline.write_all(&spec, &rasters);
        assert!(!outcome.is_complete());
        let written: Vec<f64> = outcome.written.iter().map(|r| r.cell_size).collect();
        assert_eq!(written, vec![2.0, 8.0]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].cell_size, 4.0);
        assert_eq!(outcome.failed[0].path, out.join("000004").join("pop.tif"));
        assert!(out.join("000002/pop.tif").exists());
        assert!(out.join("000008/pop.tif").exists());
    }

    #[test]
    fn test_extra_sentinels_become_nodata() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(dir.path());
        let mut spec = MeasureSpec::new(Measure::Temperature);
        spec.extra_nodata = vec![-32768.0];

        let mut data = Grid::from_elem((8, 8), 280.0);
        for r in 0..2 {
            for c in 0..2 {
                data[[r, c]] = -32768.0;
            }
        }
        let rasters = pipeline.harmonize_tiles(&spec, vec![tile(0.0, 8.0, data, None)]).unwrap();
        assert_eq!(rasters[0].value(0, 0), None);
        assert_eq!(rasters[0].data[[0, 0]], NODATA as f32);
        assert_eq!(rasters[0].value(1, 1), Some(280.0));
        assert_eq!(rasters[2].value(0, 0), Some(280.0));
    }

    #[test]
    fn test_mismatched_tiles_fail_the_measure() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(dir.path());
        let spec = MeasureSpec::new(Measure::LeafArea);
        let a = tile(0.0, 8.0, Grid::zeros((4, 4)), None);
        let mut b = tile(4.0, 8.0, Grid::zeros((4, 4)), None);
        b.crs = Crs::Epsg(4326);
        assert!(matches!(
            pipeline.harmonize_tiles(&spec, vec![a, b]),
            Err(GridError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let batch = BatchProcessor::new(pipeline(&dir.path().join("out")), dir.path(), 2);

        let mut missing = MeasureSpec::new(Measure::Population);
        missing.sources = vec!["nothing/*.tif".to_string()];
        let mut broken = MeasureSpec::new(Measure::TreeCover);
        std::fs::write(dir.path().join("broken.tif"), b"not a raster").unwrap();
        broken.sources = vec!["broken.tif".to_string()];

        let report = batch.run(&[missing, broken]).unwrap();
        assert_eq!(report.measures.len(), 2);
        assert!(!report.is_success());
        assert_eq!(report.failed().count(), 2);
        assert_eq!(report.measures[0].measure, Measure::Population);
        assert_eq!(report.measures[0].source_count, 0);
        assert_eq!(report.measures[1].source_count, 1);
        assert!(report.measures[1].error.as_deref().unwrap().contains("broken.tif"));
        assert!(report.measures[1].outputs.is_empty());
        assert!(report.finished_at >= report.started_at);

        let json_path = dir.path().join("report.json");
        report.write_json(&json_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(parsed["measures"][1]["measure"], "tree_cover");
    }
}
