//! Terrain-relative navigation filters for underwater vehicles
//!
//! This crate fuses dead-reckoned vehicle motion (inertial and DVL) with sonar or lidar range
//! measurements matched against a bathymetric terrain map. The result is a probabilistic
//! position estimate whose error stays bounded without GPS. Three estimators implement a common
//! filter contract ([`TerrainFilter`]):
//!
//! - [particle::ParticleFilter]: weighted particle cloud with subcloud and cross-beam weighting
//!   strategies, systematic resampling and optional augmented states (attitude, gyro bias,
//!   DVL errors, iceberg heading, terrain drift).
//! - [kalman::ExtendedKalmanFilter]: three-state Gaussian filter linearized through the local
//!   terrain gradient.
//! - [kalman::SigmaPointFilter]: scaled unscented transform over position, optionally attitude and
//!   gyro bias, optionally augmented with noise states.
//!
//! The filters are driven by alternating [`TerrainFilter::motion_update`] and
//! [`TerrainFilter::meas_update`] calls, and queried with [`TerrainFilter::compute_mle`] /
//! [`TerrainFilter::compute_mmse`]. [navigator::TerrainNavigator] wraps one filter with the
//! bookkeeping a vehicle needs (initialization gating, measurement buffering and interpolation,
//! sensor validity checks, health monitoring and reinitialization).
//!
//! ## Crate overview
//! - [beams]: beam projection from sensor frame to vehicle and map frames.
//! - [config]: immutable filter configuration, vehicle and sensor descriptions.
//! - [error]: fatal errors and per-measurement rejection reasons.
//! - [filter]: state shared by all filter variants and the filter factory.
//! - [kalman]: extended and sigma-point Kalman filters.
//! - [linalg]: robust covariance square roots and SPD solves.
//! - [logging]: `env_logger` setup.
//! - [map]: the terrain map contract the filters correlate against.
//! - [navigator]: the driver that owns one filter.
//! - [particle]: the particle filter.
//! - [random]: seeded random variates.
//!
//! ## Frames and states
//!
//! Positions are North/East/Down in meters in the map frame. Attitude is roll/pitch/yaw
//! ($\phi$, $\theta$, $\psi$) in radians with the intrinsic Z-Y-X convention, so a body vector maps
//! to the navigation frame through $R = R_z(\psi) R_y(\theta) R_x(\phi)$.
//!
//! Pose covariance is stored packed (see [`PackedCovariance`]) over nine states:
//!
//! $$
//! x = [N, E, D, \phi, \theta, \psi, b_{g,y}, b_{g,z}, \psi_{berg}]
//! $$
pub mod beams;
pub mod config;
pub mod error;
pub mod filter;
pub mod kalman;
pub mod linalg;
pub mod logging;
pub mod map;
pub mod navigator;
pub mod particle;
pub mod random;

use std::f64::consts::PI;
use std::fmt::Debug;
use std::ops::Sub;

use log::{debug, error};
use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

pub use config::{FilterConfig, FilterType, VehicleSpec};
pub use error::{Rejection, Result, TrnError};
pub use filter::{FilterCore, create_filter};
pub use map::TerrainMap;

/// Indices of the pose states in [`PackedCovariance`].
pub mod states {
    pub const NORTH: usize = 0;
    pub const EAST: usize = 1;
    pub const DOWN: usize = 2;
    pub const ROLL: usize = 3;
    pub const PITCH: usize = 4;
    pub const YAW: usize = 5;
    pub const GYRO_BIAS_X: usize = 6;
    pub const GYRO_BIAS_Y: usize = 7;
    pub const PSI_BERG: usize = 8;
    /// Number of states covered by the packed covariance.
    pub const COUNT: usize = 9;
}

/// Number of entries in a packed 9x9 symmetric covariance.
pub const N_COVAR: usize = states::COUNT * (states::COUNT + 1) / 2;

/// Lower triangle of a symmetric 9x9 covariance stored row by row.
///
/// Element `(i, j)` with `i >= j` lives at `i (i + 1) / 2 + j`, so the diagonal entries of the
/// first six states sit at 0, 2, 5, 9, 14 and 20.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PackedCovariance(pub [f64; N_COVAR]);

impl Default for PackedCovariance {
    fn default() -> Self {
        PackedCovariance([0.0; N_COVAR])
    }
}

impl PackedCovariance {
    #[inline]
    pub fn index(i: usize, j: usize) -> usize {
        let (r, c) = if i >= j { (i, j) } else { (j, i) };
        r * (r + 1) / 2 + c
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.0[Self::index(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.0[Self::index(i, j)] = value;
    }

    /// Dense symmetric copy of the leading `n x n` block.
    pub fn to_matrix(&self, n: usize) -> DMatrix<f64> {
        let n = n.min(states::COUNT);
        DMatrix::from_fn(n, n, |i, j| self.get(i, j))
    }

    /// Pack the leading block of `m` (up to 9x9); states beyond its size are zeroed.
    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        let n = m.nrows().min(m.ncols()).min(states::COUNT);
        let mut packed = PackedCovariance::default();
        for i in 0..n {
            for j in 0..=i {
                packed.set(i, j, 0.5 * (m[(i, j)] + m[(j, i)]));
            }
        }
        packed
    }
}

/// Vehicle navigation state at a timestamp.
///
/// Velocities are body-frame DVL velocities, rates are body angular rates. The filters treat a
/// pose as an immutable snapshot; [`FilterCore`] keeps the most recent one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose {
    /// Seconds since epoch.
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub phi: f64,
    pub theta: f64,
    pub psi: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub wx: f64,
    pub wy: f64,
    pub wz: f64,
    /// Heading of the vehicle relative to a drifting iceberg frame.
    pub psi_berg: f64,
    pub psi_dot_berg: f64,
    pub gps_valid: bool,
    pub dvl_valid: bool,
    pub bottom_lock: bool,
    pub covariance: PackedCovariance,
}

impl Pose {
    pub fn at(time: f64, x: f64, y: f64, z: f64) -> Self {
        Pose {
            time,
            x,
            y,
            z,
            ..Default::default()
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn attitude(&self) -> Vector3<f64> {
        Vector3::new(self.phi, self.theta, self.psi)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.vx, self.vy, self.vz)
    }

    pub fn angular_rate(&self) -> Vector3<f64> {
        Vector3::new(self.wx, self.wy, self.wz)
    }

    pub fn acceleration(&self) -> Vector3<f64> {
        Vector3::new(self.ax, self.ay, self.az)
    }

    /// Linear interpolation of every numeric field between `self` and `other` at `time`.
    ///
    /// Validity flags are the conjunction of both endpoints. Headings are interpolated along
    /// the shorter arc.
    pub fn interpolate(&self, other: &Pose, time: f64) -> Pose {
        let span = other.time - self.time;
        let f = if span.abs() > f64::EPSILON {
            ((time - self.time) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let lerp = |a: f64, b: f64| a + f * (b - a);
        let lerp_angle = |a: f64, b: f64| wrap_to_pi(a + f * wrap_to_pi(b - a));
        let mut covariance = PackedCovariance::default();
        for (k, c) in covariance.0.iter_mut().enumerate() {
            *c = lerp(self.covariance.0[k], other.covariance.0[k]);
        }
        Pose {
            time,
            x: lerp(self.x, other.x),
            y: lerp(self.y, other.y),
            z: lerp(self.z, other.z),
            phi: lerp_angle(self.phi, other.phi),
            theta: lerp_angle(self.theta, other.theta),
            psi: lerp_angle(self.psi, other.psi),
            vx: lerp(self.vx, other.vx),
            vy: lerp(self.vy, other.vy),
            vz: lerp(self.vz, other.vz),
            ax: lerp(self.ax, other.ax),
            ay: lerp(self.ay, other.ay),
            az: lerp(self.az, other.az),
            wx: lerp(self.wx, other.wx),
            wy: lerp(self.wy, other.wy),
            wz: lerp(self.wz, other.wz),
            psi_berg: lerp_angle(self.psi_berg, other.psi_berg),
            psi_dot_berg: lerp(self.psi_dot_berg, other.psi_dot_berg),
            gps_valid: self.gps_valid && other.gps_valid,
            dvl_valid: self.dvl_valid && other.dvl_valid,
            bottom_lock: self.bottom_lock && other.bottom_lock,
            covariance,
        }
    }
}

/// Field-wise difference used as the dead-reckoned delta between two poses.
///
/// Flags are ANDed; the covariance of the left operand is kept.
impl Sub for Pose {
    type Output = Pose;

    fn sub(self, rhs: Pose) -> Pose {
        Pose {
            time: self.time - rhs.time,
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
            phi: self.phi - rhs.phi,
            theta: self.theta - rhs.theta,
            psi: wrap_to_pi(self.psi - rhs.psi),
            vx: self.vx - rhs.vx,
            vy: self.vy - rhs.vy,
            vz: self.vz - rhs.vz,
            ax: self.ax - rhs.ax,
            ay: self.ay - rhs.ay,
            az: self.az - rhs.az,
            wx: self.wx - rhs.wx,
            wy: self.wy - rhs.wy,
            wz: self.wz - rhs.wz,
            psi_berg: self.psi_berg - rhs.psi_berg,
            psi_dot_berg: self.psi_dot_berg - rhs.psi_dot_berg,
            gps_valid: self.gps_valid && rhs.gps_valid,
            dvl_valid: self.dvl_valid && rhs.dvl_valid,
            bottom_lock: self.bottom_lock && rhs.bottom_lock,
            covariance: self.covariance,
        }
    }
}

/// Kind of range sensor that produced a measurement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Dvl,
    Multibeam,
    SingleBeam,
    /// Relative position of a homing beacon, carried in beam 0.
    Homer,
    WideSwathLidar,
}

/// A decoded sonar or lidar ping.
///
/// Per-beam vectors are indexed by beam; `along_track`, `cross_track` and `altitudes` are only
/// filled for multibeam, lidar and homer measurements. `covariance` holds per-beam range
/// variance and may be left empty for the navigator to fill from the sensor error model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Measurement {
    pub time: f64,
    pub data_type: DataType,
    pub ping_number: u32,
    pub ranges: Vec<f64>,
    pub along_track: Vec<f64>,
    pub cross_track: Vec<f64>,
    pub altitudes: Vec<f64>,
    pub covariance: Vec<f64>,
    pub status: Vec<bool>,
    pub beam_nums: Vec<usize>,
    /// Vehicle attitude at capture time (rad).
    pub phi: f64,
    pub theta: f64,
    pub psi: f64,
}

impl Measurement {
    /// DVL ping with all beams valid.
    pub fn dvl(time: f64, ranges: &[f64]) -> Self {
        Measurement {
            time,
            data_type: DataType::Dvl,
            ranges: ranges.to_vec(),
            status: vec![true; ranges.len()],
            beam_nums: (0..ranges.len()).collect(),
            ..Default::default()
        }
    }

    /// Multibeam ping from per-beam sensor-frame offsets, all beams valid.
    pub fn multibeam(time: f64, along: &[f64], cross: &[f64], altitudes: &[f64]) -> Self {
        let n = along.len().min(cross.len()).min(altitudes.len());
        let ranges = (0..n)
            .map(|i| (along[i].powi(2) + cross[i].powi(2) + altitudes[i].powi(2)).sqrt())
            .collect();
        Measurement {
            time,
            data_type: DataType::Multibeam,
            ranges,
            along_track: along[..n].to_vec(),
            cross_track: cross[..n].to_vec(),
            altitudes: altitudes[..n].to_vec(),
            status: vec![true; n],
            beam_nums: (0..n).collect(),
            ..Default::default()
        }
    }

    pub fn num_beams(&self) -> usize {
        self.ranges.len()
    }

    /// Range variance of beam `i`, zero when none was supplied.
    pub fn beam_variance(&self, i: usize) -> f64 {
        self.covariance.get(i).copied().unwrap_or(0.0)
    }

    pub fn beam_valid(&self, i: usize) -> bool {
        self.status.get(i).copied().unwrap_or(false)
    }
}

/// Contract implemented by every terrain navigation filter.
///
/// Calls must be strictly sequential on one instance. A failed measurement update leaves the
/// belief untouched; a failed initialization leaves the filter uninitialized.
pub trait TerrainFilter: Debug {
    fn filter_type(&self) -> FilterType;

    /// State shared by all filter variants.
    fn core(&self) -> &FilterCore;
    fn core_mut(&mut self) -> &mut FilterCore;

    /// Replace the belief with one centered on `pose` with the given spread.
    ///
    /// Does not touch [`FilterCore::last_pose`]; callers go through [`Self::init_filter`] or
    /// [`Self::reinit_filter`].
    fn initialize_belief(
        &mut self,
        pose: &Pose,
        covariance: &PackedCovariance,
        distribution: config::InitDistribution,
    ) -> Result<()>;

    /// Propagate the belief by the dead-reckoned change since the last pose.
    fn motion_update(&mut self, pose: &Pose) -> Result<()>;

    /// Correlate a measurement against the map, reporting why it was discarded on failure.
    fn incorporate(&mut self, meas: &Measurement) -> std::result::Result<(), Rejection>;

    /// Pose of the most probable hypothesis.
    fn compute_mle(&self) -> Pose;

    /// Probability-weighted mean pose with its covariance.
    fn compute_mmse(&self) -> Pose;

    fn check_convergence(&mut self) -> bool;

    /// Initialize around `pose` with the configured window and distribution.
    fn init_filter(&mut self, pose: &Pose) -> Result<()> {
        self.init_filter_with_offset(pose, &Vector3::zeros())
    }

    /// Initialize the belief around `pose` shifted by a position `offset`.
    ///
    /// The unshifted `pose` becomes the last navigation pose, so later motion updates keep
    /// carrying the offset.
    fn init_filter_with_offset(&mut self, pose: &Pose, offset: &Vector3<f64>) -> Result<()> {
        let mut center = *pose;
        center.x += offset[0];
        center.y += offset[1];
        center.z += offset[2];
        if !self.core().map.within_valid_map_region(center.x, center.y) {
            error!(
                "refusing to initialize {:?} filter outside the valid map region at ({:.2}, {:.2})",
                self.filter_type(),
                center.x,
                center.y
            );
            return Err(TrnError::InitOutsideMap {
                x: center.x,
                y: center.y,
            });
        }
        let covariance = self.core().init_window.to_covariance();
        let distribution = self.core().config.init_distribution;
        self.initialize_belief(&center, &covariance, distribution)?;
        self.core_mut().start(pose);
        Ok(())
    }

    /// Forget the belief. The filter reports itself uninitialized until the next
    /// [`Self::init_filter`].
    fn reset(&mut self) {
        let core = self.core_mut();
        core.last_pose = None;
        core.converged = false;
        core.nis.clear();
    }

    /// Re-create the belief at the current pose.
    ///
    /// With `low_info` the configured init window is spread uniformly around the last pose;
    /// otherwise the current MMSE estimate and covariance seed a Gaussian spread.
    fn reinit_filter(&mut self, low_info: bool) -> Result<()> {
        let last = self.core().last_pose.ok_or(TrnError::NotInitialized)?;
        let (center, covariance, distribution) = if low_info {
            (
                last,
                self.core().init_window.to_covariance(),
                config::InitDistribution::Uniform,
            )
        } else {
            let mut est = self.compute_mmse();
            est.time = last.time;
            let mut center = last;
            center.x = est.x;
            center.y = est.y;
            center.z = est.z;
            (center, est.covariance, config::InitDistribution::Gaussian)
        };
        self.initialize_belief(&center, &covariance, distribution)?;
        self.core_mut().start(&last);
        Ok(())
    }

    /// Correlate a measurement; `false` means it was not incorporated.
    fn meas_update(&mut self, meas: &Measurement) -> bool {
        match self.incorporate(meas) {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    "{:?} measurement at t={:.3} (ping {}) not incorporated: {}",
                    meas.data_type, meas.time, meas.ping_number, reason
                );
                false
            }
        }
    }

    /// Re-weight hypotheses against a measured roll and pitch. No-op unless the filter carries
    /// attitude hypotheses.
    fn attitude_meas_update(&mut self, _pose: &Pose) {}

    fn is_converged(&self) -> bool {
        self.core().converged
    }

    fn windowed_nis(&self) -> Option<f64> {
        self.core().nis.mean()
    }

    fn subcloud_nis(&self) -> Option<f64> {
        None
    }

    fn set_water_current(&mut self, current: Vector3<f64>) {
        self.core_mut().water_current = current;
    }

    /// Spread used by later low-information (re)initializations.
    fn set_init_window(&mut self, window: config::InitWindow) {
        self.core_mut().init_window = window;
    }

    fn last_pose(&self) -> Option<&Pose> {
        self.core().last_pose.as_ref()
    }

    fn is_initialized(&self) -> bool {
        self.core().last_pose.is_some()
    }
}

/// Wrap an angle to [-π, π].
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped < -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

/// Wrap an angle to [0, 2π).
pub fn wrap_to_2pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped >= 2.0 * PI { 0.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn packed_indices() {
        assert_eq!(PackedCovariance::index(0, 0), 0);
        assert_eq!(PackedCovariance::index(1, 0), 1);
        assert_eq!(PackedCovariance::index(0, 1), 1);
        assert_eq!(PackedCovariance::index(1, 1), 2);
        assert_eq!(PackedCovariance::index(2, 2), 5);
        assert_eq!(PackedCovariance::index(3, 3), 9);
        assert_eq!(PackedCovariance::index(4, 4), 14);
        assert_eq!(PackedCovariance::index(5, 5), 20);
        assert_eq!(PackedCovariance::index(6, 6), 27);
        assert_eq!(PackedCovariance::index(7, 7), 35);
        assert_eq!(PackedCovariance::index(8, 8), 44);
    }

    #[test]
    fn packed_matrix_roundtrip() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 2.0, 0.0, 0.5, 0.0, 1.0]);
        let packed = PackedCovariance::from_matrix(&m);
        assert_eq!(packed.get(2, 0), 0.5);
        assert_eq!(packed.get(0, 2), 0.5);
        assert_eq!(packed.to_matrix(3), m);
        assert_eq!(packed.get(5, 5), 0.0);
    }

    #[test]
    fn pose_difference_ands_flags() {
        let mut a = Pose::at(2.0, 3.0, 4.0, 5.0);
        a.gps_valid = true;
        a.dvl_valid = true;
        let mut b = Pose::at(1.0, 1.0, 1.0, 1.0);
        b.dvl_valid = true;
        let d = a - b;
        assert_eq!(d.time, 1.0);
        assert_eq!(d.x, 2.0);
        assert_eq!(d.z, 4.0);
        assert!(!d.gps_valid);
        assert!(d.dvl_valid);
        assert!(!d.bottom_lock);
    }

    #[test]
    fn heading_difference_wraps() {
        let mut a = Pose::default();
        a.psi = -PI + 0.1;
        let mut b = Pose::default();
        b.psi = PI - 0.1;
        assert_approx_eq!((a - b).psi, 0.2, 1e-12);
    }

    #[test]
    fn pose_interpolation() {
        let mut a = Pose::at(0.0, 0.0, 0.0, 10.0);
        a.bottom_lock = true;
        a.psi = PI - 0.1;
        let mut b = Pose::at(2.0, 4.0, -2.0, 12.0);
        b.bottom_lock = true;
        b.psi = -PI + 0.1;
        let mid = a.interpolate(&b, 1.0);
        assert_eq!(mid.time, 1.0);
        assert_approx_eq!(mid.x, 2.0);
        assert_approx_eq!(mid.y, -1.0);
        assert_approx_eq!(mid.z, 11.0);
        assert!(mid.bottom_lock);
        assert_approx_eq!(mid.psi.abs(), PI, 1e-9);
        let same = a.interpolate(&a, 0.0);
        assert_eq!(same.x, a.x);
    }

    #[test]
    fn measurement_constructors() {
        let dvl = Measurement::dvl(1.0, &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(dvl.num_beams(), 4);
        assert!(dvl.beam_valid(3));
        assert!(!dvl.beam_valid(4));
        assert_eq!(dvl.beam_variance(0), 0.0);
        let mb = Measurement::multibeam(1.0, &[0.0, 3.0], &[0.0, 0.0], &[10.0, 4.0]);
        assert_eq!(mb.data_type, DataType::Multibeam);
        assert_approx_eq!(mb.ranges[1], 5.0);
    }

    #[test]
    fn angle_wrapping() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_2pi(-PI / 2.0), 3.0 * PI / 2.0, 1e-12);
        assert_eq!(wrap_to_2pi(0.0), 0.0);
    }
}
