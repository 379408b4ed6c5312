//! JSON run configuration
//!
//! A [`Config`] is loaded once per run and turned into the explicit values every stage
//! receives: one shared [`GridSpec`] and one [`MeasureSpec`] per configured measure.

use crate::core::ReprojectOptions;
use crate::io::GridWriter;
use crate::types::{Crs, Extent, GridError, GridResult, GridSpec, Measure, MeasureKind, MeasureSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-measure configuration entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureConfig {
    /// Output code, defaults to the measure's standard code
    #[serde(default)]
    pub code: Option<String>,
    /// Extensive/intensive override
    #[serde(default)]
    pub kind: Option<MeasureKind>,
    /// Glob patterns relative to `data_dir`
    #[serde(default)]
    pub sources: Vec<String>,
    /// Undeclared fill values used by the source
    #[serde(default)]
    pub extra_nodata: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_target_epsg")]
    pub target_epsg: u32,
    pub grid_sizes: Vec<f64>,
    /// `[xmin, ymin, xmax, ymax]` in the target CRS
    pub bbox: [f64; 4],
    #[serde(default = "default_nodata")]
    pub nodata: f64,
    #[serde(default)]
    pub measures: BTreeMap<Measure, MeasureConfig>,

    /// Concurrent measure pipelines, defaults to the number of CPUs
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_block_rows")]
    pub block_rows: usize,
    #[serde(default = "default_max_window_pixels")]
    pub max_window_pixels: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_dir_pad_width")]
    pub dir_pad_width: usize,
}

fn default_target_epsg() -> u32 {
    3035
}

fn default_nodata() -> f64 {
    -9999.0
}

fn default_block_rows() -> usize {
    256
}

fn default_max_window_pixels() -> usize {
    1 << 24
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_dir_pad_width() -> usize {
    6
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> GridResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a configuration document
    pub fn from_json(json: &str) -> GridResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.measures.is_empty() {
            return Err(GridError::Config("no measures configured".to_string()));
        }
        for (measure, entry) in &self.measures {
            if entry.sources.is_empty() {
                return Err(GridError::Config(format!("measure {} has no source patterns", measure)));
            }
            if let Some(code) = &entry.code {
                if code.is_empty() || code.contains(['/', '\\']) {
                    return Err(GridError::Config(format!("invalid output code {:?} for {}", code, measure)));
                }
            }
        }

        let mut codes: Vec<String> = self.measure_specs().into_iter().map(|m| m.code).collect();
        codes.sort();
        if codes.windows(2).any(|w| w[0] == w[1]) {
            return Err(GridError::Config("output codes must be unique".to_string()));
        }

        if self.workers == Some(0) {
            return Err(GridError::Config("workers must be at least 1".to_string()));
        }
        if self.block_rows == 0 || self.max_window_pixels == 0 {
            return Err(GridError::Config(
                "block_rows and max_window_pixels must be positive".to_string(),
            ));
        }

        // the grid itself validates sizes against the bbox
        self.grid_spec().map(|_| ())
    }

    pub fn target_crs(&self) -> Crs {
        Crs::Epsg(self.target_epsg)
    }

    pub fn grid_spec(&self) -> GridResult<GridSpec> {
        let [xmin, ymin, xmax, ymax] = self.bbox;
        GridSpec::new(
            self.target_crs(),
            Extent::new(xmin, ymin, xmax, ymax),
            self.nodata,
            &self.grid_sizes,
        )
    }

    /// Every configured measure with code and classification overrides applied, in measure order
    pub fn measure_specs(&self) -> Vec<MeasureSpec> {
        self.measures
            .iter()
            .map(|(&measure, entry)| {
                let mut spec = MeasureSpec::new(measure);
                if let Some(code) = &entry.code {
                    spec.code = code.clone();
                }
                if let Some(kind) = entry.kind {
                    spec.kind = kind;
                }
                spec.sources = entry.sources.clone();
                spec.extra_nodata = entry.extra_nodata.clone();
                spec
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn reproject_options(&self) -> ReprojectOptions {
        ReprojectOptions {
            block_rows: self.block_rows,
            max_window_pixels: self.max_window_pixels,
        }
    }

    pub fn writer(&self) -> GridWriter {
        GridWriter::new(&self.output_dir)
            .with_pad_width(self.dir_pad_width)
            .with_retries(self.write_retries, Duration::from_millis(self.retry_backoff_ms))
    }

    /// Files matched by the measure's glob patterns under `data_dir`, sorted and deduplicated
    pub fn discover_sources(&self, spec: &MeasureSpec) -> GridResult<Vec<PathBuf>> {
        discover_sources(&self.data_dir, &spec.sources)
    }
}

/// Expand `patterns` relative to `root` into a sorted, deduplicated file list
pub fn discover_sources(root: &Path, patterns: &[String]) -> GridResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let full = root.join(pattern);
        let full = full.to_string_lossy();
        let entries = glob::glob(&full)
            .map_err(|e| GridError::Config(format!("invalid source pattern {:?}: {}", pattern, e)))?;
        for entry in entries {
            let path = entry.map_err(|e| GridError::Io(e.into_error()))?;
            if path.is_file() {
                paths.push(path);
            }
        }
    }
    paths.sort();
    paths.dedup();
    log::debug!("{} source file(s) matched {:?}", paths.len(), patterns);
    Ok(paths)
}
