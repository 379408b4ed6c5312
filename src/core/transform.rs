use crate::types::{Crs, Extent, GridError, GridResult};
use gdal::spatial_ref::CoordTransform;

/// Number of points sampled along each edge when warping a bounding box
const EDGE_SAMPLES: usize = 25;

/// Point transformation between two coordinate reference systems.
///
/// Equal definitions short-circuit to the identity so same-CRS processing never touches OSR.
pub struct CoordinateTransformer {
    source: Crs,
    target: Crs,
    transform: Option<CoordTransform>,
}

impl CoordinateTransformer {
    pub fn new(source: &Crs, target: &Crs) -> GridResult<Self> {
        let transform = if source == target {
            None
        } else {
            let src = source.to_spatial_ref()?;
            let dst = target.to_spatial_ref()?;
            let transform = CoordTransform::new(&src, &dst).map_err(|e| {
                GridError::Reprojection(format!("no transformation from {} to {}: {}", source, target, e))
            })?;
            Some(transform)
        };

        Ok(Self {
            source: source.clone(),
            target: target.clone(),
            transform,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.transform.is_none()
    }

    pub fn source(&self) -> &Crs {
        &self.source
    }

    pub fn target(&self) -> &Crs {
        &self.target
    }

    /// Transform coordinates in place.
    ///
    /// Points outside the domain of the projection become NaN instead of failing the batch.
    pub fn transform_in_place(&self, xs: &mut [f64], ys: &mut [f64]) -> GridResult<()> {
        let transform = match &self.transform {
            Some(t) => t,
            None => return Ok(()),
        };
        if xs.len() != ys.len() {
            return Err(GridError::Reprojection(format!(
                "coordinate arrays differ in length ({} vs {})",
                xs.len(),
                ys.len()
            )));
        }
        if xs.is_empty() {
            return Ok(());
        }

        let original_x = xs.to_vec();
        let original_y = ys.to_vec();
        if transform.transform_coords(xs, ys, &mut []).is_ok() {
            return Ok(());
        }

        // OSR rejects the whole batch when a single point fails, retry point by point
        let mut failed = 0usize;
        for i in 0..original_x.len() {
            let mut x = [original_x[i]];
            let mut y = [original_y[i]];
            if transform.transform_coords(&mut x, &mut y, &mut []).is_ok() {
                xs[i] = x[0];
                ys[i] = y[0];
            } else {
                xs[i] = f64::NAN;
                ys[i] = f64::NAN;
                failed += 1;
            }
        }
        log::debug!(
            "{} of {} points could not be transformed from {} to {}",
            failed,
            original_x.len(),
            self.source,
            self.target
        );
        Ok(())
    }

    pub fn transform_point(&self, x: f64, y: f64) -> GridResult<(f64, f64)> {
        let mut xs = [x];
        let mut ys = [y];
        self.transform_in_place(&mut xs, &mut ys)?;
        Ok((xs[0], ys[0]))
    }

    /// Bounding box of `extent` in the target CRS, sampling points along every edge.
    ///
    /// Returns `None` when no sampled point can be transformed.
    pub fn transform_extent(&self, extent: &Extent) -> GridResult<Option<Extent>> {
        if self.is_identity() {
            return Ok(Some(*extent));
        }

        let mut xs = Vec::with_capacity(EDGE_SAMPLES * 4);
        let mut ys = Vec::with_capacity(EDGE_SAMPLES * 4);
        for i in 0..EDGE_SAMPLES {
            let t = i as f64 / (EDGE_SAMPLES - 1) as f64;
            let x = extent.xmin + t * extent.width();
            let y = extent.ymin + t * extent.height();
            // bottom, top, left, right
            xs.extend_from_slice(&[x, x, extent.xmin, extent.xmax]);
            ys.extend_from_slice(&[extent.ymin, extent.ymax, y, y]);
        }
        self.transform_in_place(&mut xs, &mut ys)?;
        Ok(Extent::from_points(&xs, &ys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_leaves_points_untouched() {
        let trans = CoordinateTransformer::new(&Crs::Epsg(3035), &Crs::Epsg(3035)).unwrap();
        assert!(trans.is_identity());
        let mut xs = [4_321_000.0, 0.0];
        let mut ys = [3_210_000.0, -5.0];
        trans.transform_in_place(&mut xs, &mut ys).unwrap();
        assert_eq!(xs, [4_321_000.0, 0.0]);
        assert_eq!(ys, [3_210_000.0, -5.0]);

        let extent = Extent::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(trans.transform_extent(&extent).unwrap(), Some(extent));
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        let trans = CoordinateTransformer::new(&Crs::Epsg(4326), &Crs::Epsg(3035));
        let trans = match trans {
            Ok(t) => t,
            Err(_) => {
                println!("PROJ database not available, skipping");
                return;
            }
        };
        let mut xs = [1.0, 2.0];
        let mut ys = [1.0];
        assert!(trans.transform_in_place(&mut xs, &mut ys).is_err());
    }

    #[test]
    fn test_laea_europe_natural_origin() {
        let trans = match CoordinateTransformer::new(&Crs::Epsg(4326), &Crs::Epsg(3035)) {
            Ok(t) => t,
            Err(_) => {
                println!("PROJ database not available, skipping");
                return;
            }
        };
        // ETRS89-LAEA is centred on 10E 52N with false easting/northing 4321000/3210000
        let (x, y) = trans.transform_point(10.0, 52.0).unwrap();
        assert_relative_eq!(x, 4_321_000.0, epsilon = 1.0);
        assert_relative_eq!(y, 3_210_000.0, epsilon = 1.0);
    }
}
