use crate::types::{GridResult, RasterBand, RasterTile};
#[cfg(feature = "parallel")]
use ndarray::Zip;

/// Rewrites per-band no-data sentinels to one canonical value
#[derive(Debug, Clone)]
pub struct NoDataNormalizer {
    canonical: f64,
    extra_sentinels: Vec<f64>,
}

impl NoDataNormalizer {
    pub fn new(canonical: f64) -> Self {
        Self {
            canonical,
            extra_sentinels: Vec::new(),
        }
    }

    /// Additional fill values treated as no-data in every band
    pub fn with_extra_sentinels(mut self, sentinels: &[f64]) -> Self {
        self.extra_sentinels = sentinels.iter().copied().filter(|s| !s.is_nan()).collect();
        self
    }

    pub fn canonical(&self) -> f64 {
        self.canonical
    }

    /// Return a copy of `tile` where every no-data sample holds the canonical value.
    ///
    /// NaN samples, the band's declared sentinel and the extra sentinels are replaced; all
    /// other samples are copied unchanged. Each band then declares the canonical value as its
    /// no-data marker, which makes a second pass a no-op.
    pub fn normalize(&self, tile: &RasterTile) -> GridResult<RasterTile> {
        tile.validate()?;

        let mut replaced = 0usize;
        let bands = tile
            .bands
            .iter()
            .map(|band| {
                replaced += self.replaced_count(band);
                self.normalize_band(band)
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Normalized no-data in {}: {} band(s), {} sample(s) rewritten to {}",
            tile.label(),
            bands.len(),
            replaced,
            self.canonical
        );

        Ok(RasterTile {
            source: tile.source.clone(),
            crs: tile.crs.clone(),
            transform: tile.transform,
            bands,
        })
    }

    /// Normalize a single band, e.g. a window read lazily from a source file
    pub fn normalize_band(&self, band: &RasterBand) -> RasterBand {
        let canonical = self.canonical as f32;
        let extra: Vec<f32> = self.extra_sentinels.iter().map(|&s| s as f32).collect();
        let rewrite = |v: f32| {
            if band.is_nodata(v) || extra.contains(&v) {
                canonical
            } else {
                v
            }
        };

        #[cfg(feature = "parallel")]
        let data = Zip::from(&band.data).par_map_collect(|&v| rewrite(v));

        #[cfg(not(feature = "parallel"))]
        let data = band.data.mapv(rewrite);

        RasterBand::new(data, Some(self.canonical))
    }

    fn replaced_count(&self, band: &RasterBand) -> usize {
        let canonical = self.canonical as f32;
        band.data
            .iter()
            .filter(|&&v| v != canonical && (band.is_nodata(v) || self.extra_sentinels.contains(&(v as f64))))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform, Grid, GridError};
    use ndarray::array;

    fn tile(bands: Vec<RasterBand>) -> RasterTile {
        RasterTile::new(Crs::Epsg(4326), GeoTransform::north_up(0.0, 2.0, 1.0, -1.0), bands)
    }

    #[test]
    fn test_replaces_declared_sentinel_and_nan() {
        let input = tile(vec![
            RasterBand::new(array![[1.0, -3.4e38], [f32::NAN, 4.0]], Some(-3.4e38)),
            RasterBand::new(array![[f32::NAN, 2.0], [3.0, 0.0]], Some(f64::NAN)),
        ]);
        let out = NoDataNormalizer::new(-9999.0).normalize(&input).unwrap();

        assert_eq!(out.bands[0].data, array![[1.0, -9999.0], [-9999.0, 4.0]]);
        assert_eq!(out.bands[1].data, array![[-9999.0, 2.0], [3.0, 0.0]]);
        assert!(out.bands.iter().all(|b| b.nodata == Some(-9999.0)));
        assert_eq!(out.transform, input.transform);
        assert_eq!(out.crs, input.crs);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let input = tile(vec![RasterBand::new(
            array![[0.0, 255.0], [12.5, f32::NAN]],
            Some(255.0),
        )]);
        let normalizer = NoDataNormalizer::new(-9999.0);
        let once = normalizer.normalize(&input).unwrap();
        let twice = normalizer.normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_extra_sentinels_and_untouched_values() {
        // 200 marks water in some tree cover products
        let input = tile(vec![RasterBand::new(array![[200.0, 35.0, 0.0]], None)]);
        let out = NoDataNormalizer::new(-9999.0)
            .with_extra_sentinels(&[200.0])
            .normalize(&input)
            .unwrap();
        assert_eq!(out.bands[0].data, array![[-9999.0, 35.0, 0.0]]);
    }

    #[test]
    fn test_normalize_band_matches_tile_path() {
        let band = RasterBand::new(
            Grid::from_shape_fn((64, 48), |(r, c)| match (r * 48 + c) % 7 {
                0 => f32::NAN,
                1 => 255.0,
                2 => 200.0,
                _ => (r + c) as f32,
            }),
            Some(255.0),
        );
        let normalizer = NoDataNormalizer::new(-9999.0).with_extra_sentinels(&[200.0]);
        let single = normalizer.normalize_band(&band);
        let via_tile = normalizer.normalize(&tile(vec![band.clone()])).unwrap();

        assert_eq!(single, via_tile.bands[0]);
        assert_eq!(single.nodata, Some(-9999.0));
        assert!(!single.data.iter().any(|v| v.is_nan() || *v == 255.0 || *v == 200.0));
        assert_eq!(single.data[[0, 3]], 3.0);
    }

    #[test]
    fn test_rejects_malformed_tiles() {
        let normalizer = NoDataNormalizer::new(-9999.0);
        assert!(matches!(
            normalizer.normalize(&tile(vec![])),
            Err(GridError::InvalidRaster { .. })
        ));
        let ragged = tile(vec![
            RasterBand::new(Grid::zeros((2, 2)), None),
            RasterBand::new(Grid::zeros((3, 2)), None),
        ]);
        assert!(matches!(
            normalizer.normalize(&ragged),
            Err(GridError::InvalidRaster { .. })
        ));
    }
}
