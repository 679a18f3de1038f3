//! Synthetic terrain maps and input builders shared by the integration tests.
#![allow(dead_code)]

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::io::Write;
use std::path::PathBuf;

use nalgebra::Vector3;
use trnav::map::{
    RangeError, SubmapRequest, SubmapStatus, TerrainMap, TerrainSample, vertical_range_error,
};
use trnav::{Measurement, Pose};

/// DVL Janus angle used by the default vehicle (rad).
pub const JANUS_ANGLE: f64 = 30.0 * std::f64::consts::PI / 180.0;

/// Planar seafloor `depth = d0 + gn * N + ge * E` over a square extent centered on the origin.
#[derive(Clone, Debug)]
pub struct PlaneMap {
    pub d0: f64,
    pub gn: f64,
    pub ge: f64,
    pub half_extent: f64,
    pub variance: f64,
}

impl PlaneMap {
    pub fn flat(depth: f64) -> Self {
        PlaneMap {
            d0: depth,
            gn: 0.0,
            ge: 0.0,
            half_extent: 2000.0,
            variance: 0.25,
        }
    }

    pub fn sloped(d0: f64, gn: f64, ge: f64) -> Self {
        PlaneMap {
            gn,
            ge,
            ..PlaneMap::flat(d0)
        }
    }

    pub fn depth_at(&self, north: f64, east: f64) -> f64 {
        self.d0 + self.gn * north + self.ge * east
    }

    /// Exact ranges of a four-beam Janus DVL at `position` with level attitude.
    pub fn janus_ranges(&self, position: &Vector3<f64>) -> [f64; 4] {
        let (s, c) = JANUS_ANGLE.sin_cos();
        let floor = self.depth_at(position.x, position.y);
        std::array::from_fn(|k| {
            let azimuth = FRAC_PI_4 + k as f64 * FRAC_PI_2;
            let along = s * (self.gn * azimuth.cos() + self.ge * azimuth.sin());
            (floor - position.z) / (c - along)
        })
    }
}

impl TerrainMap for PlaneMap {
    fn range_error(
        &self,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        measured_range: f64,
    ) -> Option<RangeError> {
        vertical_range_error(self, position, direction, measured_range)
    }

    fn depth(&self, north: f64, east: f64) -> Option<TerrainSample> {
        self.within_ref_map(north, east).then(|| TerrainSample {
            depth: self.depth_at(north, east),
            variance: self.variance,
        })
    }

    fn load_submap(&mut self, request: &SubmapRequest) -> SubmapStatus {
        let [hn, he] = request.half_widths;
        let corners_inside = self
            .within_ref_map(request.center_north - hn, request.center_east - he)
            && self.within_ref_map(request.center_north + hn, request.center_east + he);
        if corners_inside {
            SubmapStatus::Ok
        } else {
            SubmapStatus::OutOfBounds
        }
    }

    fn resolution(&self) -> f64 {
        1.0
    }

    fn within_ref_map(&self, north: f64, east: f64) -> bool {
        north.abs() <= self.half_extent && east.abs() <= self.half_extent
    }
}

/// A map made entirely of holes. Initialization is allowed anywhere.
#[derive(Clone, Debug, Default)]
pub struct HoleMap;

impl TerrainMap for HoleMap {
    fn range_error(&self, _: &Vector3<f64>, _: &Vector3<f64>, _: f64) -> Option<RangeError> {
        None
    }

    fn depth(&self, _: f64, _: f64) -> Option<TerrainSample> {
        None
    }

    fn load_submap(&mut self, _: &SubmapRequest) -> SubmapStatus {
        SubmapStatus::Ok
    }

    fn resolution(&self) -> f64 {
        1.0
    }

    fn within_ref_map(&self, _: f64, _: f64) -> bool {
        true
    }

    fn within_valid_map_region(&self, _: f64, _: f64) -> bool {
        true
    }
}

/// Navigation pose in bottom lock moving north at 0.5 m/s.
pub fn dvl_pose(time: f64, x: f64, y: f64, z: f64) -> Pose {
    let mut pose = Pose::at(time, x, y, z);
    pose.vx = 0.5;
    pose.dvl_valid = true;
    pose.bottom_lock = true;
    pose
}

/// Four-beam DVL ping with the given per-beam variance.
pub fn dvl_ping(time: f64, ranges: &[f64], variance: f64) -> Measurement {
    let mut meas = Measurement::dvl(time, ranges);
    meas.covariance = vec![variance; ranges.len()];
    meas
}

/// Write a particle file with the count and state headers followed by `N,E` rows.
pub fn write_particle_file(dir: &tempfile::TempDir, name: &str, rows: &[(f64, f64)]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "{}", rows.len()).unwrap();
    writeln!(file, "2").unwrap();
    for (n, e) in rows {
        writeln!(file, "{n},{e}").unwrap();
    }
    path
}
