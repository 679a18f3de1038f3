//! State and helpers shared by every filter variant.
//!
//! [`FilterCore`] is the common part of the filter contract: it owns the configuration, the
//! vehicle description, the map handle, the last pose, convergence and NIS bookkeeping, and
//! the random source. The variants in [crate::particle] and [crate::kalman] embed one and
//! expose it through [`TerrainFilter::core`](crate::TerrainFilter::core).

use std::fmt::{self, Debug};

use log::{debug, trace};
use nalgebra::Vector3;

use crate::beams::{BeamProjector, ProjectedBeams, map_frame_attitude};
use crate::config::{FilterConfig, FilterType, InitWindow, VehicleSpec};
use crate::error::{Rejection, Result, TrnError};
use crate::kalman::{ExtendedKalmanFilter, SigmaPointFilter};
use crate::map::{SubmapRequest, SubmapStatus, TerrainMap};
use crate::particle::ParticleFilter;
use crate::random::RandomVariate;
use crate::{DataType, Measurement, Pose, TerrainFilter};

/// Length of the rolling NIS windows.
pub const NIS_WINDOW_LEN: usize = 20;

/// Fixed-length rolling window of NIS samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NisWindow {
    values: [f64; NIS_WINDOW_LEN],
    len: usize,
    next: usize,
}

impl Default for NisWindow {
    fn default() -> Self {
        NisWindow {
            values: [0.0; NIS_WINDOW_LEN],
            len: 0,
            next: 0,
        }
    }
}

impl NisWindow {
    /// Add a sample, evicting the oldest once full. Non-finite samples are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.values[self.next] = value;
        self.next = (self.next + 1) % NIS_WINDOW_LEN;
        self.len = (self.len + 1).min(NIS_WINDOW_LEN);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        Some(self.values[..self.len].iter().sum::<f64>() / self.len as f64)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == NIS_WINDOW_LEN
    }

    pub fn clear(&mut self) {
        *self = NisWindow::default();
    }
}

/// Quantities shared by every hypothesis during one motion update.
#[derive(Clone, Copy, Debug)]
pub struct MotionStep {
    /// Pose at the start of the step.
    pub last: Pose,
    pub current: Pose,
    /// `current - last`.
    pub delta: Pose,
    pub dt: f64,
    /// Integrate DVL velocity rather than the inertial position delta.
    pub use_dvl: bool,
    /// Per-axis sensor-frame velocity sigma used when integrating DVL velocity (m/s).
    pub velocity_sigma: Vector3<f64>,
    /// Gyro bias random-walk sigma for this step (rad/s).
    pub gyro_sigma: f64,
    /// Horizontal sigma of the inertial delta under the CEP drift model (m).
    pub drift_sigma: f64,
}

/// State every filter variant carries.
pub struct FilterCore {
    pub config: FilterConfig,
    pub vehicle: VehicleSpec,
    pub map: Box<dyn TerrainMap>,
    /// Most recent pose seen by a motion update; `None` until initialized.
    pub last_pose: Option<Pose>,
    pub converged: bool,
    /// Windowed (per-beam normalized) NIS of the incorporated measurements.
    pub nis: NisWindow,
    /// Spread used for low-information (re)initialization.
    pub init_window: InitWindow,
    /// Estimated water current in the navigation frame (m/s).
    pub water_current: Vector3<f64>,
    pub time_last_dvl_valid: f64,
    pub rng: RandomVariate,
}

impl Debug for FilterCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCore")
            .field("filter_type", &self.config.filter_type)
            .field("initialized", &self.last_pose.is_some())
            .field("last_time", &self.last_pose.map(|p| p.time))
            .field("converged", &self.converged)
            .field("windowed_nis", &self.nis.mean())
            .field("water_current", &self.water_current)
            .finish()
    }
}

impl FilterCore {
    pub fn new(config: FilterConfig, vehicle: VehicleSpec, map: Box<dyn TerrainMap>) -> Self {
        let rng = RandomVariate::new(config.seed);
        let init_window = config.init_window;
        FilterCore {
            config,
            vehicle,
            map,
            last_pose: None,
            converged: false,
            nis: NisWindow::default(),
            init_window,
            water_current: Vector3::zeros(),
            time_last_dvl_valid: 0.0,
            rng,
        }
    }

    /// Mark the filter initialized at `pose` and reset health bookkeeping.
    pub fn start(&mut self, pose: &Pose) {
        self.last_pose = Some(*pose);
        self.converged = false;
        self.nis.clear();
        self.time_last_dvl_valid = pose.time;
    }

    /// Validate a motion update and compute the quantities shared by all hypotheses.
    pub fn begin_motion(&self, pose: &Pose) -> Result<MotionStep> {
        let last = self.last_pose.ok_or(TrnError::NotInitialized)?;
        if pose.time < last.time {
            return Err(TrnError::NonMonotonicTime {
                last: last.time,
                current: pose.time,
            });
        }
        let delta = *pose - last;
        let dt = delta.time;
        let noise = &self.config.motion_noise;
        let use_dvl = !delta.gps_valid && self.config.dead_reckon && last.dvl_valid;

        let mut velocity_sigma = Vector3::zeros();
        if !pose.gps_valid && self.config.dead_reckon {
            let per_error = if last.bottom_lock {
                noise.vel_per_error
            } else {
                noise.water_vel_per_error
            };
            let staleness = 0.01 * (last.time - self.time_last_dvl_valid).abs();
            let v = last.velocity();
            for i in 0..3 {
                velocity_sigma[i] = (per_error * v[i] / 100.0).abs() + staleness + noise.vel_stddev;
            }
        }
        let gyro_sigma = if dt > 0.0 {
            noise.dgbias_error / dt.sqrt()
        } else {
            0.0
        };
        let drift_sigma = self.drift_sigma(delta.x, delta.y);
        trace!(
            "motion step dt={dt:.3} use_dvl={use_dvl} drift_sigma={drift_sigma:.4} vel_sigma={:?}",
            velocity_sigma.as_slice()
        );
        Ok(MotionStep {
            last,
            current: *pose,
            delta,
            dt,
            use_dvl,
            velocity_sigma,
            gyro_sigma,
            drift_sigma,
        })
    }

    /// Record the end of a motion update.
    pub fn finish_motion(&mut self, step: &MotionStep) {
        if step.current.dvl_valid {
            self.time_last_dvl_valid = step.current.time;
        }
        self.last_pose = Some(step.current);
    }

    /// Horizontal position sigma for an inertial displacement under the CEP drift model.
    ///
    /// `cep = drift_rate/100 · |Δxy|` and `σ = k · sqrt(cep / sqrt(-2 ln 0.5))`.
    pub fn drift_sigma(&self, dx: f64, dy: f64) -> f64 {
        let cep = self.vehicle.drift_rate / 100.0 * dx.hypot(dy);
        let k = self.config.motion_noise.drift_multiplier;
        k * (cep / (-2.0 * 0.5_f64.ln()).sqrt()).sqrt()
    }

    /// Vehicle-frame beams for a measurement, using the mounted sensor of its data type.
    pub fn project_beams(
        &self,
        meas: &Measurement,
    ) -> std::result::Result<ProjectedBeams, Rejection> {
        let sensor = self
            .vehicle
            .sensor_for(meas.data_type)
            .ok_or(Rejection::UnknownSensor)?;
        BeamProjector::new(sensor)
            .project(meas)
            .ok_or(Rejection::NoValidBeams)
    }

    /// Size the submap needed to correlate `beams` for hypotheses spread over the given
    /// position bounds and attitude statistics.
    ///
    /// The attitude used to rotate the beams is the 3σ extreme of roll and pitch and the mean
    /// yaw, so the footprint covers the worst-case horizontal beam reach.
    pub fn submap_request(
        &self,
        bounds: &PositionBounds,
        attitude_mean: &Vector3<f64>,
        attitude_var: &Vector3<f64>,
        beams: &ProjectedBeams,
        data_type: DataType,
    ) -> SubmapRequest {
        let min_var = 0.001_f64.to_radians().powi(2);
        let sigma = attitude_var.map(|v| if v > min_var { v.sqrt() } else { 0.0 });
        let extreme = |mean: f64, s: f64| (mean + 3.0 * s).abs().max((mean - 3.0 * s).abs());
        let worst = Vector3::new(
            extreme(attitude_mean[0], sigma[0]),
            extreme(attitude_mean[1], sigma[1]),
            attitude_mean[2],
        );
        let rotated = beams.rotated(&map_frame_attitude(data_type, &worst));
        let (max_dn, max_de) = rotated.max_horizontal_extent();
        let res = self.map.resolution().abs();
        let half_n = (bounds.max_north - bounds.min_north) / 2.0 + 1.5 * max_dn + 2.0 * res;
        let half_e = (bounds.max_east - bounds.min_east) / 2.0 + 1.5 * max_de + 2.0 * res;
        SubmapRequest {
            center_north: 0.5 * (bounds.max_north + bounds.min_north),
            center_east: 0.5 * (bounds.max_east + bounds.min_east),
            half_widths: [half_n, half_e],
        }
    }

    pub fn load_submap(&mut self, request: &SubmapRequest) -> std::result::Result<(), Rejection> {
        match self.map.load_submap(request) {
            SubmapStatus::Ok => Ok(()),
            SubmapStatus::OutOfBounds => {
                debug!(
                    "submap centered at ({:.1}, {:.1}) half-widths {:?} is out of bounds",
                    request.center_north, request.center_east, request.half_widths
                );
                Err(Rejection::SubmapOutOfBounds)
            }
        }
    }
}

/// Heading rate from body rates through the Euler-rate kinematics, with the gyro biases of the
/// y and z axes removed.
pub fn heading_rate(pose: &Pose, gyro_bias: &[f64; 2]) -> f64 {
    let (sin_phi, cos_phi) = pose.phi.sin_cos();
    let cos_theta = pose.theta.cos();
    (sin_phi / cos_theta) * (pose.wy - gyro_bias[0])
        + (cos_phi / cos_theta) * (pose.wz - gyro_bias[1])
}

/// Horizontal extent of a set of position hypotheses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionBounds {
    pub min_north: f64,
    pub max_north: f64,
    pub min_east: f64,
    pub max_east: f64,
}

impl PositionBounds {
    pub fn around(north: f64, east: f64, half_n: f64, half_e: f64) -> Self {
        PositionBounds {
            min_north: north - half_n,
            max_north: north + half_n,
            min_east: east - half_e,
            max_east: east + half_e,
        }
    }

    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (n0, e0) = iter.next()?;
        let mut b = PositionBounds::around(n0, e0, 0.0, 0.0);
        for (n, e) in iter {
            b.min_north = b.min_north.min(n);
            b.max_north = b.max_north.max(n);
            b.min_east = b.min_east.min(e);
            b.max_east = b.max_east.max(e);
        }
        Some(b)
    }
}

/// Build the filter selected by `config.filter_type`.
pub fn create_filter(
    config: FilterConfig,
    vehicle: VehicleSpec,
    map: Box<dyn TerrainMap>,
) -> Result<Box<dyn TerrainFilter>> {
    config.validate()?;
    let filter_type = config.filter_type;
    let core = FilterCore::new(config, vehicle, map);
    let filter: Box<dyn TerrainFilter> = match filter_type {
        FilterType::Particle => Box::new(ParticleFilter::new(core)),
        FilterType::Extended => Box::new(ExtendedKalmanFilter::new(core)),
        FilterType::SigmaPoint => Box::new(SigmaPointFilter::new(core)),
    };
    debug!("created {filter_type:?} filter");
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::test_maps::PlaneMap;
    use assert_approx_eq::assert_approx_eq;

    fn core() -> FilterCore {
        FilterCore::new(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(50.0)),
        )
    }

    #[test]
    fn nis_window_rolls() {
        let mut w = NisWindow::default();
        assert!(w.mean().is_none());
        for i in 0..NIS_WINDOW_LEN {
            w.push(i as f64);
        }
        assert!(w.is_full());
        assert_approx_eq!(w.mean().unwrap(), 9.5);
        w.push(100.0);
        assert_eq!(w.len(), NIS_WINDOW_LEN);
        // 0 evicted, 100 added.
        assert_approx_eq!(w.mean().unwrap(), 9.5 + 100.0 / NIS_WINDOW_LEN as f64);
        w.push(f64::NAN);
        assert_eq!(w.len(), NIS_WINDOW_LEN);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn motion_requires_initialization_and_monotonic_time() {
        let mut c = core();
        assert!(matches!(
            c.begin_motion(&Pose::at(1.0, 0.0, 0.0, 0.0)),
            Err(TrnError::NotInitialized)
        ));
        c.start(&Pose::at(5.0, 0.0, 0.0, 0.0));
        assert!(matches!(
            c.begin_motion(&Pose::at(4.0, 0.0, 0.0, 0.0)),
            Err(TrnError::NonMonotonicTime { .. })
        ));
        let step = c.begin_motion(&Pose::at(5.0, 1.0, 0.0, 0.0)).unwrap();
        assert_eq!(step.dt, 0.0);
        assert_eq!(step.gyro_sigma, 0.0);
        c.finish_motion(&step);
        assert_eq!(c.last_pose.unwrap().x, 1.0);
    }

    #[test]
    fn drift_sigma_grows_with_distance() {
        let c = core();
        assert_eq!(c.drift_sigma(0.0, 0.0), 0.0);
        let s1 = c.drift_sigma(1.0, 0.0);
        let s4 = c.drift_sigma(4.0, 0.0);
        assert!(s1 > 0.0);
        assert_approx_eq!(s4 / s1, 2.0, 1e-12);
    }

    #[test]
    fn dvl_velocity_sigma() {
        let mut c = core();
        let mut start = Pose::at(0.0, 0.0, 0.0, 10.0);
        start.vx = 1.0;
        start.dvl_valid = true;
        start.bottom_lock = true;
        c.start(&start);
        let mut next = start;
        next.time = 1.0;
        let step = c.begin_motion(&next).unwrap();
        assert!(step.use_dvl);
        assert_approx_eq!(step.velocity_sigma[0], 0.04 + 0.02, 1e-12);
        assert_approx_eq!(step.velocity_sigma[1], 0.02, 1e-12);
    }

    #[test]
    fn submap_covers_spread_and_beams() {
        let c = core();
        let meas = Measurement::dvl(0.0, &[20.0, 20.0, 20.0, 20.0]);
        let beams = c.project_beams(&meas).unwrap();
        let bounds = PositionBounds::around(10.0, -5.0, 8.0, 4.0);
        let req = c.submap_request(
            &bounds,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &beams,
            DataType::Dvl,
        );
        assert_approx_eq!(req.center_north, 10.0);
        assert_approx_eq!(req.center_east, -5.0);
        let reach = 10.0 * std::f64::consts::FRAC_PI_4.cos();
        assert_approx_eq!(req.half_widths[0], 8.0 + 1.5 * reach + 2.0, 1e-9);
        assert_approx_eq!(req.half_widths[1], 4.0 + 1.5 * reach + 2.0, 1e-9);
    }

    #[test]
    fn unknown_sensor_rejected() {
        let c = core();
        let meas = Measurement::multibeam(0.0, &[0.0], &[0.0], &[10.0]);
        assert_eq!(c.project_beams(&meas), Err(Rejection::UnknownSensor));
    }

    #[test]
    fn heading_rate_level_and_banked() {
        let mut pose = Pose::at(0.0, 0.0, 0.0, 0.0);
        pose.wz = 0.1;
        assert_approx_eq!(heading_rate(&pose, &[0.0, 0.0]), 0.1, 1e-12);
        assert_approx_eq!(heading_rate(&pose, &[0.0, 0.04]), 0.06, 1e-12);
        pose.phi = std::f64::consts::FRAC_PI_2;
        pose.wy = 0.2;
        assert_approx_eq!(heading_rate(&pose, &[0.0, 0.0]), 0.2, 1e-12);
    }

    #[test]
    fn bounds_from_points() {
        let b = PositionBounds::from_points(vec![(1.0, 2.0), (-3.0, 5.0), (2.0, -1.0)]).unwrap();
        assert_eq!(b.min_north, -3.0);
        assert_eq!(b.max_north, 2.0);
        assert_eq!(b.min_east, -1.0);
        assert_eq!(b.max_east, 5.0);
        assert!(PositionBounds::from_points(Vec::new()).is_none());
    }
}
