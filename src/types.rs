use gdal::spatial_ref::SpatialRef;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Sample storage for every raster in the pipeline
pub type Grid = Array2<f32>;

/// Relative tolerance used when checking that cell sizes are integer multiples
const RATIO_TOLERANCE: f64 = 1e-6;

/// Coordinate reference system definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// Authority code in the EPSG registry
    Epsg(u32),
    /// Full WKT definition for rasters without an EPSG identification
    Wkt(String),
}

impl Crs {
    /// Resolve the definition through OSR.
    ///
    /// Axis order is forced to x=easting/longitude, y=northing/latitude so coordinates
    /// can be passed straight from geotransforms.
    pub fn to_spatial_ref(&self) -> GridResult<SpatialRef> {
        let srs = match self {
            Crs::Epsg(code) => SpatialRef::from_epsg(*code),
            Crs::Wkt(wkt) => SpatialRef::from_wkt(wkt),
        }
        .map_err(|e| GridError::Reprojection(format!("cannot resolve CRS {}: {}", self, e)))?;
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    }

    /// Identify a GDAL spatial reference, preferring its EPSG code when it has one
    pub fn from_spatial_ref(srs: &SpatialRef) -> GridResult<Self> {
        if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
            if name.eq_ignore_ascii_case("EPSG") && code > 0 {
                return Ok(Crs::Epsg(code as u32));
            }
        }
        let wkt = srs
            .to_wkt()
            .map_err(|e| GridError::Reprojection(format!("cannot export CRS as WKT: {}", e)))?;
        Ok(Crs::Wkt(wkt))
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{}", code),
            Crs::Wkt(wkt) => {
                let head: String = wkt.chars().take(48).collect();
                write!(f, "WKT[{}...]", head)
            }
        }
    }
}

/// Axis-aligned bounding box in projection units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn is_empty(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    /// Overlapping part of both extents, `None` when they only touch or are disjoint
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let clipped = Extent {
            xmin: self.xmin.max(other.xmin),
            ymin: self.ymin.max(other.ymin),
            xmax: self.xmax.min(other.xmax),
            ymax: self.ymax.min(other.ymax),
        };
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }

    /// Smallest extent containing all finite points, `None` if there are none
    pub fn from_points(xs: &[f64], ys: &[f64]) -> Option<Extent> {
        let mut extent: Option<Extent> = None;
        for (&x, &y) in xs.iter().zip(ys) {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            let point = Extent::new(x, y, x, y);
            extent = Some(match extent {
                Some(e) => e.union(&point),
                None => point,
            });
        }
        extent
    }
}

/// Geospatial transformation parameters (GDAL affine geotransform)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_axis_aligned(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0
    }

    pub fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y
    }

    /// World coordinate of a (fractional) pixel position
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Inverse mapping, world coordinate to fractional (col, row)
    pub fn inverse(&self) -> GridResult<InverseGeoTransform> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(GridError::Reprojection(format!(
                "singular geotransform {:?}",
                self.to_gdal()
            )));
        }
        Ok(InverseGeoTransform {
            origin_x: self.top_left_x,
            origin_y: self.top_left_y,
            a: self.pixel_height / det,
            b: -self.rotation_x / det,
            c: -self.rotation_y / det,
            d: self.pixel_width / det,
        })
    }

    /// Footprint of a raster of the given size
    pub fn extent(&self, rows: usize, cols: usize) -> Extent {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(cols as f64, 0.0),
            self.pixel_to_world(0.0, rows as f64),
            self.pixel_to_world(cols as f64, rows as f64),
        ];
        let xs: Vec<f64> = corners.iter().map(|c| c.0).collect();
        let ys: Vec<f64> = corners.iter().map(|c| c.1).collect();
        Extent::from_points(&xs, &ys).unwrap_or(Extent::new(0.0, 0.0, 0.0, 0.0))
    }
}

/// Precomputed inverse of a [`GeoTransform`]
#[derive(Debug, Clone, Copy)]
pub struct InverseGeoTransform {
    origin_x: f64,
    origin_y: f64,
    a: f64,
    b: f64,
    c: f64,
    d: f64,
}

impl InverseGeoTransform {
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        (self.a * dx + self.b * dy, self.c * dx + self.d * dy)
    }
}

/// Aggregation semantics of a measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureKind {
    /// Totals/counts that sum over area (population)
    Extensive,
    /// Rates, densities and indices that are averaged (temperature)
    Intensive,
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureKind::Extensive => write!(f, "extensive"),
            MeasureKind::Intensive => write!(f, "intensive"),
        }
    }
}

/// Environmental variables harmonized onto the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Population,
    Temperature,
    LeafArea,
    Livestock,
    TreeCover,
    Precipitation,
}

impl Measure {
    pub const ALL: [Measure; 6] = [
        Measure::Population,
        Measure::Temperature,
        Measure::LeafArea,
        Measure::Livestock,
        Measure::TreeCover,
        Measure::Precipitation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Measure::Population => "population",
            Measure::Temperature => "temperature",
            Measure::LeafArea => "leaf_area",
            Measure::Livestock => "livestock",
            Measure::TreeCover => "tree_cover",
            Measure::Precipitation => "precipitation",
        }
    }

    /// Output file stem used unless the configuration maps another code
    pub fn default_code(&self) -> &'static str {
        match self {
            Measure::Population => "pop",
            Measure::Temperature => "lst",
            Measure::LeafArea => "lai",
            Measure::Livestock => "lsd",
            Measure::TreeCover => "tcc",
            Measure::Precipitation => "pre",
        }
    }

    pub fn default_kind(&self) -> MeasureKind {
        match self {
            Measure::Population | Measure::Livestock => MeasureKind::Extensive,
            Measure::Temperature | Measure::LeafArea | Measure::TreeCover | Measure::Precipitation => {
                MeasureKind::Intensive
            }
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Measure {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Measure::ALL
            .iter()
            .find(|m| m.name() == wanted || m.default_code() == wanted)
            .copied()
            .ok_or_else(|| GridError::Config(format!("Unknown measure: {}", s)))
    }
}

/// A measure as configured for one run
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureSpec {
    pub measure: Measure,
    /// Output code, the file stem inside every cell size directory
    pub code: String,
    pub kind: MeasureKind,
    /// Glob patterns relative to the data directory
    pub sources: Vec<String>,
    /// Fill values used by the source that its metadata does not declare
    pub extra_nodata: Vec<f64>,
}

impl MeasureSpec {
    pub fn new(measure: Measure) -> Self {
        Self {
            measure,
            code: measure.default_code().to_string(),
            kind: measure.default_kind(),
            sources: Vec::new(),
            extra_nodata: Vec::new(),
        }
    }
}

/// One band of a source raster
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBand {
    pub data: Grid,
    /// Declared no-data sentinel, may be NaN
    pub nodata: Option<f64>,
}

impl RasterBand {
    pub fn new(data: Grid, nodata: Option<f64>) -> Self {
        Self { data, nodata }
    }

    /// True for NaN samples and samples equal to the declared sentinel
    #[inline]
    pub fn is_nodata(&self, value: f32) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata {
            Some(nodata) => !nodata.is_nan() && value == nodata as f32,
            None => false,
        }
    }
}

/// Georeferenced multi-band raster as read from one source file
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    /// File the tile was read from, used to attribute errors
    pub source: Option<PathBuf>,
    pub crs: Crs,
    pub transform: GeoTransform,
    pub bands: Vec<RasterBand>,
}

impl RasterTile {
    pub fn new(crs: Crs, transform: GeoTransform, bands: Vec<RasterBand>) -> Self {
        Self {
            source: None,
            crs,
            transform,
            bands,
        }
    }

    pub fn with_source<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.source = Some(path.as_ref().to_path_buf());
        self
    }

    /// Human readable origin of the tile for error messages
    pub fn label(&self) -> String {
        match &self.source {
            Some(path) => path.display().to_string(),
            None => "<in-memory tile>".to_string(),
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// (rows, cols) of the first band
    pub fn dim(&self) -> (usize, usize) {
        self.bands.first().map(|b| b.data.dim()).unwrap_or((0, 0))
    }

    pub fn extent(&self) -> Extent {
        let (rows, cols) = self.dim();
        self.transform.extent(rows, cols)
    }

    /// Reject tiles without bands or with bands of differing shapes
    pub fn validate(&self) -> GridResult<()> {
        let first = self.bands.first().ok_or_else(|| GridError::InvalidRaster {
            path: self.label(),
            reason: "raster has no bands".to_string(),
        })?;
        let shape = first.data.dim();
        if shape.0 == 0 || shape.1 == 0 {
            return Err(GridError::InvalidRaster {
                path: self.label(),
                reason: format!("raster has an empty shape {:?}", shape),
            });
        }
        for (index, band) in self.bands.iter().enumerate().skip(1) {
            if band.data.dim() != shape {
                return Err(GridError::InvalidRaster {
                    path: self.label(),
                    reason: format!(
                        "band {} has shape {:?}, expected {:?}",
                        index + 1,
                        band.data.dim(),
                        shape
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Shared target geometry of every harmonized output
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub crs: Crs,
    pub bbox: Extent,
    pub nodata: f64,
    /// Ascending, the first entry is the base resolution
    cell_sizes: Vec<f64>,
}

impl GridSpec {
    pub fn new(crs: Crs, bbox: Extent, nodata: f64, cell_sizes: &[f64]) -> GridResult<Self> {
        if bbox.is_empty() {
            return Err(GridError::Config(format!("bounding box {:?} is empty", bbox)));
        }
        if nodata.is_nan() {
            return Err(GridError::Config("canonical no-data value must not be NaN".to_string()));
        }
        let mut sizes: Vec<f64> = cell_sizes.to_vec();
        if sizes.is_empty() {
            return Err(GridError::Config("at least one grid size is required".to_string()));
        }
        if let Some(bad) = sizes.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(GridError::Config(format!("invalid grid size {}", bad)));
        }
        sizes.sort_by(|a, b| a.total_cmp(b));
        sizes.dedup();

        let base = sizes[0];
        for &size in &sizes {
            integer_ratio(size, base).ok_or_else(|| {
                GridError::Config(format!(
                    "grid size {} is not an integer multiple of the base size {}",
                    size, base
                ))
            })?;
            if integer_ratio(bbox.width(), size).is_none() || integer_ratio(bbox.height(), size).is_none() {
                return Err(GridError::Config(format!(
                    "bounding box {}x{} is not divisible by grid size {}",
                    bbox.width(),
                    bbox.height(),
                    size
                )));
            }
        }

        Ok(Self {
            crs,
            bbox,
            nodata,
            cell_sizes: sizes,
        })
    }

    pub fn cell_sizes(&self) -> &[f64] {
        &self.cell_sizes
    }

    pub fn base_cell_size(&self) -> f64 {
        self.cell_sizes[0]
    }

    /// Integer factor between `cell_size` and the base resolution
    pub fn factor(&self, cell_size: f64) -> GridResult<usize> {
        integer_ratio(cell_size, self.base_cell_size()).ok_or_else(|| {
            GridError::Config(format!(
                "cell size {} is not a multiple of the base size {}",
                cell_size,
                self.base_cell_size()
            ))
        })
    }

    /// (rows, cols) of the grid at `cell_size`
    pub fn dimensions(&self, cell_size: f64) -> (usize, usize) {
        (
            (self.bbox.height() / cell_size).round() as usize,
            (self.bbox.width() / cell_size).round() as usize,
        )
    }

    /// North-up transform anchored at the bounding box's top-left corner
    pub fn transform(&self, cell_size: f64) -> GeoTransform {
        GeoTransform::north_up(self.bbox.xmin, self.bbox.ymax, cell_size, -cell_size)
    }
}

/// `numerator / denominator` when it is (within tolerance) a positive integer
pub fn integer_ratio(numerator: f64, denominator: f64) -> Option<usize> {
    let ratio = numerator / denominator;
    let rounded = ratio.round();
    if rounded >= 1.0 && (ratio - rounded).abs() <= RATIO_TOLERANCE * rounded.max(1.0) {
        Some(rounded as usize)
    } else {
        None
    }
}

/// Single-band output raster for one (measure, cell size) pair
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonizedRaster {
    pub data: Grid,
    /// Number of valid base-resolution cells behind each pixel, zero exactly where no-data
    pub support: Array2<u32>,
    /// Base-resolution cells per pixel (`k * k`)
    pub base_cells: u32,
    pub cell_size: f64,
    pub transform: GeoTransform,
    pub nodata: f64,
}

impl HarmonizedRaster {
    /// Raster of the grid at `cell_size` where every pixel is no-data
    pub fn empty(grid: &GridSpec, cell_size: f64, base_cells: u32) -> Self {
        let (rows, _) = grid.dimensions(cell_size);
        Self::strip(grid, cell_size, base_cells, 0..rows)
    }

    /// No-data raster holding the full-width band `rows` of the grid at `cell_size`
    pub fn strip(grid: &GridSpec, cell_size: f64, base_cells: u32, rows: Range<usize>) -> Self {
        let (_, cols) = grid.dimensions(cell_size);
        let dim = (rows.len(), cols);
        let gt = grid.transform(cell_size);
        Self {
            data: Array2::from_elem(dim, grid.nodata as f32),
            support: Array2::zeros(dim),
            base_cells,
            cell_size,
            transform: GeoTransform::north_up(
                gt.top_left_x,
                gt.top_left_y + rows.start as f64 * gt.pixel_height,
                gt.pixel_width,
                gt.pixel_height,
            ),
            nodata: grid.nodata,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.support.iter().filter(|&&s| s > 0).count()
    }

    /// Sum of all valid pixel values
    pub fn valid_sum(&self) -> f64 {
        self.data
            .iter()
            .zip(self.support.iter())
            .filter(|(_, &s)| s > 0)
            .map(|(&v, _)| v as f64)
            .sum()
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        if self.support[[row, col]] > 0 {
            Some(self.data[[row, col]])
        } else {
            None
        }
    }
}

/// Error types for raster harmonization
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Invalid raster {path}: {reason}")]
    InvalidRaster { path: String, reason: String },

    #[error("CRS mismatch in {path}: expected {expected}, found {found}")]
    CrsMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Resolution mismatch in {path}: expected {expected:?}, found {found:?}")]
    ResolutionMismatch {
        path: String,
        expected: (f64, f64),
        found: (f64, f64),
    },

    #[error("Reprojection error: {0}")]
    Reprojection(String),

    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for harmonization operations
pub type GridResult<T> = Result<T, GridError>;
