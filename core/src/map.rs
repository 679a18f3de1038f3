//! Terrain map contract consumed by the filters.
//!
//! Storage and interpolation backends (DEM grids, octrees) live outside this crate. A backend
//! implements [`TerrainMap`] and is handed to a filter as a boxed trait object. Map holes and
//! out-of-bounds queries are reported as `None` rather than NaN.

use nalgebra::Vector3;

/// Expected-minus-measured range along a beam and the variance of that expectation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeError {
    /// Map-predicted range minus measured range (m).
    pub error: f64,
    /// Variance of the map prediction: stored map variance blended with a resolution term (m²).
    pub variance: f64,
}

/// Terrain depth and its variance at a horizontal location.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainSample {
    pub depth: f64,
    pub variance: f64,
}

/// Result of a submap load request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmapStatus {
    Ok,
    OutOfBounds,
}

/// Region a filter needs loaded before correlating a measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubmapRequest {
    pub center_north: f64,
    pub center_east: f64,
    /// Half-widths of the region along North and East (m).
    pub half_widths: [f64; 2],
}

/// Spatial terrain map queried during measurement updates.
///
/// `load_submap` is the only blocking call; filters request a region sized to their current
/// uncertainty before every correlation and treat [`SubmapStatus::OutOfBounds`] as a rejected
/// measurement.
pub trait TerrainMap: Send {
    /// Expected-minus-measured range for a beam leaving `position` along unit `direction`.
    ///
    /// `None` when the beam resolves to a map hole or leaves the loaded region.
    fn range_error(
        &self,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        measured_range: f64,
    ) -> Option<RangeError>;

    /// Terrain depth (positive down) at a horizontal location.
    fn depth(&self, north: f64, east: f64) -> Option<TerrainSample>;

    /// Horizontal depth gradient `(∂D/∂N, ∂D/∂E)`.
    ///
    /// The default uses central differences over one map cell.
    fn gradient(&self, north: f64, east: f64) -> Option<(f64, f64)> {
        let h = self.resolution().max(1e-3);
        let dn = self.depth(north + h, east)?.depth - self.depth(north - h, east)?.depth;
        let de = self.depth(north, east + h)?.depth - self.depth(north, east - h)?.depth;
        Some((dn / (2.0 * h), de / (2.0 * h)))
    }

    fn load_submap(&mut self, request: &SubmapRequest) -> SubmapStatus;

    /// Grid spacing (m).
    fn resolution(&self) -> f64;

    /// Whether the location lies inside the reference map extent.
    fn within_ref_map(&self, north: f64, east: f64) -> bool;

    /// Whether the location lies inside the map and on valid (non-hole) terrain.
    fn within_valid_map_region(&self, north: f64, east: f64) -> bool {
        self.within_ref_map(north, east) && self.depth(north, east).is_some()
    }
}

/// Range error obtained by dropping a beam endpoint onto a depth surface.
///
/// Helper for depth-grid backends: the beam endpoint `position + range * direction` is compared
/// with the terrain depth below it.
pub fn vertical_range_error<M: TerrainMap + ?Sized>(
    map: &M,
    position: &Vector3<f64>,
    direction: &Vector3<f64>,
    measured_range: f64,
) -> Option<RangeError> {
    let end = position + direction * measured_range;
    let sample = map.depth(end.x, end.y)?;
    Some(RangeError {
        error: sample.depth - end.z,
        variance: sample.variance,
    })
}


#[cfg(test)]
mod tests {
    use super::test_maps::*;
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn vertical_error_on_flat_floor() {
        let map = PlaneMap::flat(100.0);
        let pos = Vector3::new(0.0, 0.0, 20.0);
        let down = Vector3::new(0.0, 0.0, 1.0);
        let err = map.range_error(&pos, &down, 75.0).unwrap();
        assert_approx_eq!(err.error, 5.0);
        assert_approx_eq!(err.variance, 0.25);
    }

    #[test]
    fn default_gradient_matches_slope() {
        let map = PlaneMap::sloped(50.0, 0.1, -0.2);
        let (gn, ge) = map.gradient(3.0, 4.0).unwrap();
        assert_approx_eq!(gn, 0.1, 1e-9);
        assert_approx_eq!(ge, -0.2, 1e-9);
    }

    #[test]
    fn holes_and_bounds() {
        let mut map = PlaneMap::flat(10.0);
        assert!(map.depth(2000.0, 0.0).is_none());
        assert!(map.within_valid_map_region(0.0, 0.0));
        assert!(!map.within_valid_map_region(0.0, 1500.0));
        let req = SubmapRequest {
            center_north: 990.0,
            center_east: 0.0,
            half_widths: [20.0, 20.0],
        };
        assert_eq!(map.load_submap(&req), SubmapStatus::OutOfBounds);
        assert!(HoleMap.gradient(0.0, 0.0).is_none());
    }
}
