//! Vehicle-side driver that owns one terrain navigation filter.
//!
//! [`TerrainNavigator`] sits between the vehicle's navigation and sonar streams and a
//! [`TerrainFilter`]. It screens velocities and ranges, waits until the vehicle is in a state
//! where initialization makes sense, buffers range measurements that arrive ahead of the
//! navigation data, and reinitializes the filter when its innovations stop matching the map.
//!
//! A typical loop alternates the two inputs as they arrive:
//!
//! ```ignore
//! let mut nav = TerrainNavigator::new(map, vehicle, config)?;
//! for event in stream {
//!     match event {
//!         Event::Nav(pose) => nav.motion_update(&pose)?,
//!         Event::Ping(meas) => {
//!             nav.meas_update(meas);
//!         }
//!     }
//!     if nav.initialized() {
//!         let estimate = nav.estimate_pose(EstimateKind::Mmse)?;
//!     }
//! }
//! ```

use log::{debug, info, trace, warn};
use nalgebra::Vector3;

use crate::beams::rotation;
use crate::config::{FilterConfig, InitWindow, NavigatorConfig, VehicleSpec};
use crate::error::{Result, TrnError};
use crate::filter::create_filter;
use crate::map::TerrainMap;
use crate::{DataType, Measurement, Pose, TerrainFilter, states};

/// Position variance (m²) below which an MMSE estimate updates the navigation offset.
const OFFSET_UPDATE_VAR: f64 = 100.0;
/// Initialization window growth per second of waiting, before the increase flag (m/s).
const WINDOW_GROWTH_RATE: f64 = 0.01 * 1.5;
/// DVL beams closer than this are treated as the same return (m).
const EQUAL_RANGE_TOLERANCE: f64 = 0.1;

/// Which point estimate [`TerrainNavigator::estimate_pose`] returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimateKind {
    /// Most probable hypothesis.
    Mle,
    /// Probability-weighted mean with covariance.
    Mmse,
}

/// Driver owning one filter and the bookkeeping around it.
#[derive(Debug)]
pub struct TerrainNavigator {
    filter: Box<dyn TerrainFilter>,
    config: NavigatorConfig,
    /// Window restored on every low-information reinitialization.
    init_window: InitWindow,
    /// Measurements newer than the last navigation pose, oldest first.
    waiting: Vec<Measurement>,
    last_valid_vel: Vector3<f64>,
    last_vel_bottom_lock: bool,
    last_bottom_lock_time: Option<f64>,
    last_meas_valid: bool,
    last_meas_success: bool,
    last_meas_success_time: Option<f64>,
    last_init_attempt_time: Option<f64>,
    /// Extra horizontal spread accumulated while waiting to initialize (m).
    window_growth: f64,
    /// Last trusted offset of the estimate from the navigation solution.
    nav_offset: Vector3<f64>,
    /// Last accepted range and its time, per DVL beam.
    dvl_ranges: Vec<Option<(f64, f64)>>,
    reinit_count: usize,
}

impl TerrainNavigator {
    /// Build the filter selected by `config` and wrap it.
    pub fn new(map: Box<dyn TerrainMap>, vehicle: VehicleSpec, config: FilterConfig) -> Result<Self> {
        let filter = create_filter(config, vehicle, map)?;
        Ok(Self::with_filter(filter))
    }

    /// Wrap an already constructed filter. Thresholds come from its configuration.
    pub fn with_filter(filter: Box<dyn TerrainFilter>) -> Self {
        let config = filter.core().config.navigator;
        let init_window = filter.core().config.init_window;
        TerrainNavigator {
            filter,
            config,
            init_window,
            waiting: Vec::new(),
            last_valid_vel: Vector3::zeros(),
            last_vel_bottom_lock: false,
            last_bottom_lock_time: None,
            last_meas_valid: false,
            last_meas_success: false,
            last_meas_success_time: None,
            last_init_attempt_time: None,
            window_growth: 0.0,
            nav_offset: Vector3::zeros(),
            dvl_ranges: Vec::new(),
            reinit_count: 0,
        }
    }

    pub fn filter(&self) -> &dyn TerrainFilter {
        self.filter.as_ref()
    }

    pub fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    pub fn initialized(&self) -> bool {
        self.filter.is_initialized()
    }

    /// Whether the most recent measurement was incorporated.
    pub fn last_meas_successful(&self) -> bool {
        self.last_meas_success
    }

    /// Number of reinitializations so far.
    pub fn reinit_count(&self) -> usize {
        self.reinit_count
    }

    /// Number of buffered measurements waiting for navigation data.
    pub fn pending_measurements(&self) -> usize {
        self.waiting.len()
    }

    /// Offset of the last confident MMSE estimate from the navigation solution.
    pub fn nav_offset(&self) -> Vector3<f64> {
        self.nav_offset
    }

    pub fn is_converged(&mut self) -> bool {
        self.filter.is_initialized() && self.filter.check_convergence()
    }

    /// Feed a navigation pose.
    ///
    /// Before initialization this only evaluates whether the filter can be started. Afterwards
    /// it screens the velocity, applies any buffered measurement that falls between the last
    /// and the current pose, and propagates the filter to `pose`.
    ///
    /// # Errors
    /// [`TrnError::NonMonotonicTime`] when `pose` precedes the last navigation pose; errors
    /// from filter initialization are passed through.
    pub fn motion_update(&mut self, pose: &Pose) -> Result<()> {
        let Some(last) = self.filter.last_pose().copied() else {
            return self.attempt_init(pose);
        };
        if pose.time < last.time {
            return Err(TrnError::NonMonotonicTime {
                last: last.time,
                current: pose.time,
            });
        }
        if let Some(reason) = self.health_problem(&last) {
            info!("reinitializing filter at t={:.2}: {reason}", last.time);
            self.reinit(true)?;
            return Ok(());
        }

        let mut current = *pose;
        let dt = current.time - self.filter.core().time_last_dvl_valid;
        if dt > 0.0 {
            let accel = (current.velocity() - self.last_valid_vel) / dt;
            current.ax = accel.x;
            current.ay = accel.y;
            current.az = accel.z;
        }
        self.check_velocity(&mut current);
        if current.bottom_lock && current.dvl_valid {
            self.last_bottom_lock_time = Some(current.time);
        }

        if !current.dvl_valid {
            debug!(
                "invalid DVL velocity at t={:.3}, using the last valid value",
                current.time
            );
            current.vx = self.last_valid_vel.x;
            current.vy = self.last_valid_vel.y;
            current.vz = self.last_valid_vel.z;
            current.bottom_lock = self.last_vel_bottom_lock;
        } else {
            if self.last_vel_bottom_lock && !current.bottom_lock {
                let estimate = self.filter.compute_mmse();
                let water = rotation(&estimate.attitude()) * (current.velocity() - self.last_valid_vel);
                debug!(
                    "bottom lock lost at t={:.3}; water current ({:.3}, {:.3}, {:.3}) m/s",
                    current.time, water.x, water.y, water.z
                );
                self.filter.set_water_current(water);
            }
            self.last_valid_vel = current.velocity();
            self.last_vel_bottom_lock = current.bottom_lock;
        }

        self.apply_waiting(&current)?;
        self.filter.motion_update(&current)
    }

    /// Feed a range measurement. Returns `true` when it was incorporated right away.
    ///
    /// Measurements newer than the last navigation pose are buffered and applied by the next
    /// [`Self::motion_update`] that covers their time; older ones are dropped.
    pub fn meas_update(&mut self, mut meas: Measurement) -> bool {
        self.check_range_validity(&mut meas);
        let Some(last) = self.filter.last_pose().copied() else {
            self.last_meas_valid = meas.status.iter().any(|&s| s);
            self.last_meas_success = false;
            debug!(
                "{:?} measurement at t={:.2} (ping {}) not included; motion not initialized, valid={}",
                meas.data_type, meas.time, meas.ping_number, self.last_meas_valid
            );
            return false;
        };
        self.fill_variance(&mut meas);

        if meas.time > last.time {
            trace!(
                "buffering {:?} measurement at t={:.3} until navigation passes it (last {:.3})",
                meas.data_type, meas.time, last.time
            );
            let at = self.waiting.partition_point(|m| m.time <= meas.time);
            self.waiting.insert(at, meas);
            return false;
        }
        if meas.time == last.time {
            self.apply(&meas);
            return self.last_meas_success;
        }
        debug!(
            "{:?} measurement at t={:.3} (ping {}) dropped; navigation is already at t={:.3}",
            meas.data_type, meas.time, meas.ping_number, last.time
        );
        false
    }

    /// Point estimate of the vehicle pose.
    ///
    /// An MMSE estimate whose horizontal variances are both below 100 m² becomes the offset
    /// used to place the belief on the next reinitialization.
    pub fn estimate_pose(&mut self, kind: EstimateKind) -> Result<Pose> {
        let last = *self.filter.last_pose().ok_or(TrnError::NotInitialized)?;
        let mut estimate = match kind {
            EstimateKind::Mle => self.filter.compute_mle(),
            EstimateKind::Mmse => {
                let mut estimate = self.filter.compute_mmse();
                estimate.time = last.time;
                let var_n = estimate.covariance.get(states::NORTH, states::NORTH);
                let var_e = estimate.covariance.get(states::EAST, states::EAST);
                if var_n < OFFSET_UPDATE_VAR && var_e < OFFSET_UPDATE_VAR {
                    self.nav_offset = estimate.position() - last.position();
                }
                estimate
            }
        };
        if estimate.x.is_nan() || estimate.y.is_nan() {
            warn!("{kind:?} estimate at t={:.2} is not a number", last.time);
            estimate.covariance.set(states::NORTH, states::NORTH, self.init_window.north_var);
            estimate.covariance.set(states::EAST, states::EAST, self.init_window.east_var);
        }
        trace!(
            "{kind:?} estimate ({:.2}, {:.2}, {:.2}) variances N={:.3} E={:.3}",
            estimate.x,
            estimate.y,
            estimate.z,
            estimate.covariance.get(states::NORTH, states::NORTH),
            estimate.covariance.get(states::EAST, states::EAST)
        );
        Ok(estimate)
    }

    /// Reinitialize the filter.
    ///
    /// With `low_info` the belief is dropped and rebuilt from the configured window, shifted by
    /// the navigation offset, once the initialization conditions hold again. Otherwise the
    /// current estimate seeds a Gaussian belief in place.
    pub fn reinit(&mut self, low_info: bool) -> Result<()> {
        if low_info || !self.filter.is_initialized() {
            self.filter.reset();
            self.filter.set_init_window(self.init_window);
        } else {
            self.filter.reinit_filter(false)?;
        }
        self.waiting.clear();
        self.last_meas_success_time = None;
        self.last_init_attempt_time = None;
        self.last_bottom_lock_time = None;
        self.window_growth = 0.0;
        self.reinit_count += 1;
        info!(
            "filter reinitialized (low information: {low_info}); {} reinitializations so far",
            self.reinit_count
        );
        Ok(())
    }

    fn attempt_init(&mut self, pose: &Pose) -> Result<()> {
        let mut pose = *pose;
        self.check_velocity(&mut pose);
        let center = pose.position() + self.nav_offset;
        let within_map = self.filter.core().map.within_valid_map_region(center.x, center.y);
        let surfaced = (pose.gps_valid && !self.config.ignore_gps) || pose.z <= 1.0;

        if within_map && pose.bottom_lock && pose.dvl_valid && self.last_meas_valid && !surfaced {
            if self.window_growth > 0.0 {
                let grow = self.window_growth.powi(2);
                let mut window = self.filter.core().init_window;
                window.north_var += grow;
                window.east_var += grow;
                self.filter.set_init_window(window);
                debug!(
                    "initialization window grown by {:.3} m after waiting",
                    self.window_growth
                );
                self.window_growth = 0.0;
            }
            self.filter.init_filter_with_offset(&pose, &self.nav_offset)?;
            self.last_valid_vel = pose.velocity();
            self.last_vel_bottom_lock = pose.bottom_lock;
            info!(
                "vehicle motion initialized at t={:.2} around ({:.2}, {:.2}, {:.2})",
                pose.time, center.x, center.y, center.z
            );
            return Ok(());
        }

        if let Some(t) = self.last_init_attempt_time
            && self.config.increase_window
        {
            self.window_growth += WINDOW_GROWTH_RATE * (pose.time - t);
        }
        self.last_init_attempt_time = Some(pose.time);
        let reason = if !within_map {
            "vehicle is in a non-valid region of the reference map"
        } else if surfaced {
            "vehicle is on the surface"
        } else if !self.last_meas_valid {
            "no good range measurements"
        } else {
            "no bottom lock or good velocity data"
        };
        debug!("filter not initialized at t={:.2}: {reason}", pose.time);
        Ok(())
    }

    /// Motion-update to each buffered measurement covered by `current` and apply it.
    fn apply_waiting(&mut self, current: &Pose) -> Result<()> {
        if self.waiting.is_empty() {
            return Ok(());
        }
        let split = self.waiting.partition_point(|m| m.time <= current.time);
        let due: Vec<Measurement> = self.waiting.drain(..split).collect();
        for meas in due {
            let Some(last) = self.filter.last_pose().copied() else {
                break;
            };
            if meas.time < last.time
                || meas.time - last.time > self.config.max_interp_time
                || current.time - meas.time > self.config.max_interp_time
            {
                self.last_meas_success = false;
                debug!(
                    "{:?} measurement at t={:.2} not incorporated; no navigation data within {:.1} s",
                    meas.data_type, meas.time, self.config.max_interp_time
                );
                continue;
            }
            let meas_pose = last.interpolate(current, meas.time);
            self.filter.motion_update(&meas_pose)?;
            self.apply(&meas);
        }
        Ok(())
    }

    fn apply(&mut self, meas: &Measurement) {
        self.last_meas_success = self.filter.meas_update(meas);
        if self.last_meas_success {
            self.last_meas_success_time = Some(meas.time);
            trace!(
                "{:?} measurement at t={:.3} (ping {}) incorporated",
                meas.data_type, meas.time, meas.ping_number
            );
        }
    }

    /// Reason the filter should be reinitialized, if any.
    fn health_problem(&self, last: &Pose) -> Option<String> {
        if let Some(t) = self.last_meas_success_time
            && last.time - t > self.config.max_meas_outage
        {
            return Some(format!(
                "no valid range measurements for {:.1} s",
                last.time - t
            ));
        }
        if let Some(t) = self.last_bottom_lock_time
            && last.time - t > self.config.max_vel_outage
        {
            return Some(format!(
                "no valid bottom velocity for {:.1} s",
                last.time - t
            ));
        }
        if self.filter.core().nis.is_full()
            && let Some(nis) = self.filter.windowed_nis()
            && nis > self.config.max_nis
        {
            return Some(format!(
                "windowed NIS {nis:.2} exceeds {:.2}",
                self.config.max_nis
            ));
        }
        if let Some(nis) = self.filter.subcloud_nis()
            && nis > self.config.max_nis
        {
            return Some(format!(
                "subcloud NIS {nis:.2} exceeds {:.2}",
                self.config.max_nis
            ));
        }
        None
    }

    /// Mark implausible DVL velocities invalid.
    fn check_velocity(&self, pose: &mut Pose) {
        let max_vel = self.config.max_vel;
        if pose.vx.abs() > max_vel
            || pose.vx.abs() <= 1e-4
            || pose.vy.abs() > max_vel
            || pose.vz.abs() > max_vel
        {
            pose.dvl_valid = false;
        }
        if pose.bottom_lock
            && self.last_vel_bottom_lock
            && pose.z > 5.0
            && pose.acceleration().amax() > self.config.max_accel
        {
            pose.dvl_valid = false;
            pose.ax = 0.0;
            pose.ay = 0.0;
            pose.az = 0.0;
        }
    }

    /// Clear the status of beams whose ranges cannot be trusted.
    fn check_range_validity(&mut self, meas: &mut Measurement) {
        let n = meas.num_beams();
        meas.status.resize(n, false);
        match meas.data_type {
            DataType::Homer => return,
            DataType::Dvl => {
                for i in 0..n.min(2) {
                    let alpha = meas.ranges[i];
                    let equal = meas.ranges[i + 1..]
                        .iter()
                        .filter(|r| (alpha - **r).abs() < EQUAL_RANGE_TOLERANCE)
                        .count();
                    if equal >= 2 {
                        meas.status.iter_mut().for_each(|s| *s = false);
                        debug!(
                            "discarding all beams at t={:.2} (ping {}): {equal} ranges equal to {alpha:.3}",
                            meas.time, meas.ping_number
                        );
                        return;
                    }
                }
            }
            _ => {}
        }

        let windowed = matches!(meas.data_type, DataType::Dvl | DataType::SingleBeam);
        if meas.data_type == DataType::Dvl && self.dvl_ranges.len() < n {
            self.dvl_ranges.resize(n, None);
        }
        for i in 0..n {
            let range = meas.ranges[i];
            if !range.is_finite()
                || (windowed && (range >= self.config.max_range || range <= self.config.min_range))
            {
                meas.status[i] = false;
            }
            if meas.data_type != DataType::Dvl || !meas.status[i] {
                continue;
            }
            match self.dvl_ranges[i] {
                Some((last_range, last_time)) => {
                    let dt = meas.time - last_time;
                    if dt > 0.0 && ((range - last_range) / dt).abs() > self.config.max_drdt {
                        meas.status[i] = false;
                    } else {
                        self.dvl_ranges[i] = Some((range, meas.time));
                    }
                }
                None => self.dvl_ranges[i] = Some((range, meas.time)),
            }
        }
    }

    /// Per-beam range variance from the sensor's percent range error.
    fn fill_variance(&self, meas: &mut Measurement) {
        let Some(sensor) = self.filter.core().vehicle.sensor_for(meas.data_type) else {
            return;
        };
        let fraction = (sensor.percent_range_error / 100.0).powi(2);
        let n = meas.num_beams();
        meas.covariance = (0..n)
            .map(|i| match meas.data_type {
                DataType::Multibeam => {
                    let along = meas.along_track.get(i).copied().unwrap_or(0.0);
                    let cross = meas.cross_track.get(i).copied().unwrap_or(0.0);
                    let alt = meas.altitudes.get(i).copied().unwrap_or(0.0);
                    (along.powi(2) + cross.powi(2) + alt.powi(2)) * fraction
                }
                _ => meas.ranges[i].powi(2) * fraction,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterType;
    use crate::map::test_maps::PlaneMap;
    use assert_approx_eq::assert_approx_eq;

    const DEPTH: f64 = 50.0;
    const ALTITUDE: f64 = 40.0;

    fn config() -> FilterConfig {
        FilterConfig {
            filter_type: FilterType::Extended,
            ..FilterConfig::default()
        }
    }

    fn navigator(config: FilterConfig) -> TerrainNavigator {
        TerrainNavigator::new(
            Box::new(PlaneMap::flat(DEPTH)),
            VehicleSpec::default(),
            config,
        )
        .unwrap()
    }

    fn nav(time: f64) -> Pose {
        let mut pose = Pose::at(time, 0.5 * time, 0.0, DEPTH - ALTITUDE);
        pose.vx = 0.5;
        pose.dvl_valid = true;
        pose.bottom_lock = true;
        pose
    }

    /// Two-beam DVL ping whose ranges hit the flat floor exactly.
    fn ping(time: f64) -> Measurement {
        let range = ALTITUDE / 30.0_f64.to_radians().cos();
        Measurement::dvl(time, &[range, range])
    }

    #[test]
    fn velocity_limits() {
        let nav_ = navigator(config());
        let mut pose = nav(0.0);
        nav_.check_velocity(&mut pose);
        assert!(pose.dvl_valid);
        pose.vx = 0.0;
        nav_.check_velocity(&mut pose);
        assert!(!pose.dvl_valid);
        let mut pose = nav(0.0);
        pose.vy = -6.0;
        nav_.check_velocity(&mut pose);
        assert!(!pose.dvl_valid);
    }

    #[test]
    fn acceleration_limit_needs_sustained_bottom_lock() {
        let mut nav_ = navigator(config());
        let mut pose = nav(0.0);
        pose.ax = 2.0;
        nav_.check_velocity(&mut pose);
        assert!(pose.dvl_valid);
        nav_.last_vel_bottom_lock = true;
        nav_.check_velocity(&mut pose);
        assert!(!pose.dvl_valid);
        assert_eq!(pose.ax, 0.0);
    }

    #[test]
    fn dvl_equal_ranges_discard_the_ping() {
        let mut nav_ = navigator(config());
        let mut meas = Measurement::dvl(0.0, &[30.0, 30.05, 30.02, 45.0]);
        nav_.check_range_validity(&mut meas);
        assert!(meas.status.iter().all(|s| !s));
        let mut meas = Measurement::dvl(0.0, &[30.0, 30.05, 36.0, 45.0]);
        nav_.check_range_validity(&mut meas);
        assert!(meas.status.iter().all(|s| *s));
    }

    #[test]
    fn dvl_range_window_and_rate() {
        let mut nav_ = navigator(config());
        let mut meas = Measurement::dvl(0.0, &[0.5, 250.0, f64::NAN, 40.0]);
        nav_.check_range_validity(&mut meas);
        assert_eq!(meas.status, vec![false, false, false, true]);
        // 40 m -> 70 m in one second exceeds the range-rate limit.
        let mut meas = Measurement::dvl(1.0, &[20.0, 30.0, 50.0, 70.0]);
        nav_.check_range_validity(&mut meas);
        assert_eq!(meas.status, vec![true, true, true, false]);
        // The rejected range did not replace the reference.
        let mut meas = Measurement::dvl(2.0, &[20.0, 30.0, 50.0, 45.0]);
        nav_.check_range_validity(&mut meas);
        assert!(meas.status[3]);
    }

    #[test]
    fn multibeam_ranges_only_need_to_be_finite() {
        let mut nav_ = navigator(config());
        let mut meas = Measurement::multibeam(0.0, &[0.0, 0.0], &[0.0, 300.0], &[0.5, 10.0]);
        meas.ranges[0] = f64::INFINITY;
        nav_.check_range_validity(&mut meas);
        assert_eq!(meas.status, vec![false, true]);
    }

    #[test]
    fn variance_from_percent_range_error() {
        let mut vehicle = VehicleSpec::default();
        vehicle
            .sensors
            .push(crate::config::SensorSpec::new("mb", DataType::Multibeam, 2));
        vehicle.sensors[1].percent_range_error = 2.0;
        let nav_ = TerrainNavigator::new(Box::new(PlaneMap::flat(DEPTH)), vehicle, config()).unwrap();
        let mut meas = Measurement::dvl(0.0, &[10.0, 20.0]);
        nav_.fill_variance(&mut meas);
        assert_approx_eq!(meas.covariance[0], 0.01, 1e-12);
        assert_approx_eq!(meas.covariance[1], 0.04, 1e-12);
        let mut meas = Measurement::multibeam(0.0, &[3.0], &[4.0], &[12.0]);
        nav_.fill_variance(&mut meas);
        assert_approx_eq!(meas.covariance[0], 169.0 * 0.0004, 1e-12);
    }

    #[test]
    fn initialization_waits_for_ranges_and_depth() {
        let mut nav_ = navigator(config());
        nav_.motion_update(&nav(0.0)).unwrap();
        assert!(!nav_.initialized());
        assert!(!nav_.meas_update(ping(0.0)));
        let mut surfaced = nav(1.0);
        surfaced.z = 0.5;
        nav_.motion_update(&surfaced).unwrap();
        assert!(!nav_.initialized());
        let mut gps = nav(2.0);
        gps.gps_valid = true;
        nav_.motion_update(&gps).unwrap();
        assert!(!nav_.initialized());
        nav_.motion_update(&nav(3.0)).unwrap();
        assert!(nav_.initialized());
        assert_eq!(nav_.filter().last_pose().unwrap().time, 3.0);
    }

    #[test]
    fn ignore_gps_allows_initialization() {
        let mut cfg = config();
        cfg.navigator.ignore_gps = true;
        let mut nav_ = navigator(cfg);
        nav_.meas_update(ping(0.0));
        let mut gps = nav(0.0);
        gps.gps_valid = true;
        nav_.motion_update(&gps).unwrap();
        assert!(nav_.initialized());
    }

    #[test]
    fn waiting_grows_the_init_window() {
        let mut nav_ = navigator(config());
        let before = nav_.filter().core().init_window.north_var;
        nav_.motion_update(&nav(0.0)).unwrap();
        nav_.motion_update(&nav(10.0)).unwrap();
        nav_.meas_update(ping(10.0));
        nav_.motion_update(&nav(10.5)).unwrap();
        assert!(nav_.initialized());
        let window = nav_.filter().core().init_window;
        assert_approx_eq!(window.north_var, before + 0.15_f64.powi(2), 1e-12);
        assert_approx_eq!(window.east_var, window.north_var, 1e-12);
    }

    #[test]
    fn measurements_are_applied_buffered_or_dropped() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        assert!(nav_.meas_update(ping(0.0)));
        assert!(nav_.last_meas_successful());

        assert!(!nav_.meas_update(ping(1.5)));
        assert_eq!(nav_.pending_measurements(), 1);
        nav_.motion_update(&nav(1.0)).unwrap();
        assert_eq!(nav_.pending_measurements(), 1);
        nav_.motion_update(&nav(2.0)).unwrap();
        assert_eq!(nav_.pending_measurements(), 0);
        assert!(nav_.last_meas_successful());
        assert_eq!(nav_.filter().last_pose().unwrap().time, 2.0);

        assert!(!nav_.meas_update(ping(1.0)));
        assert_eq!(nav_.pending_measurements(), 0);
    }

    #[test]
    fn stale_buffered_measurement_is_dropped() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        nav_.meas_update(ping(0.5));
        // Navigation gap longer than the interpolation limit on both sides.
        nav_.motion_update(&nav(5.0)).unwrap();
        assert_eq!(nav_.pending_measurements(), 0);
        assert!(!nav_.last_meas_successful());
    }

    #[test]
    fn backwards_navigation_time_is_an_error() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(5.0)).unwrap();
        assert!(matches!(
            nav_.motion_update(&nav(4.0)),
            Err(TrnError::NonMonotonicTime { .. })
        ));
    }

    #[test]
    fn invalid_velocity_is_replaced() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        let mut bad = nav(1.0);
        bad.vx = 9.0;
        nav_.motion_update(&bad).unwrap();
        let last = nav_.filter().last_pose().unwrap();
        assert_eq!(last.vx, 0.5);
        assert!(!last.dvl_valid);
    }

    #[test]
    fn losing_bottom_lock_estimates_water_current() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        let mut water_track = nav(1.0);
        water_track.vx = 0.8;
        water_track.vy = 0.1;
        water_track.bottom_lock = false;
        nav_.motion_update(&water_track).unwrap();
        let current = nav_.filter().core().water_current;
        assert_approx_eq!(current.x, 0.3, 1e-9);
        assert_approx_eq!(current.y, 0.1, 1e-9);
    }

    #[test]
    fn measurement_outage_triggers_reinit() {
        let mut cfg = config();
        cfg.navigator.max_meas_outage = 50.0;
        let mut nav_ = navigator(cfg);
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        assert!(nav_.meas_update(ping(0.0)));
        nav_.motion_update(&nav(40.0)).unwrap();
        nav_.motion_update(&nav(100.0)).unwrap();
        assert_eq!(nav_.reinit_count(), 0);
        nav_.motion_update(&nav(120.0)).unwrap();
        assert_eq!(nav_.reinit_count(), 1);
        assert!(!nav_.initialized());
        nav_.motion_update(&nav(121.0)).unwrap();
        assert!(nav_.initialized());
    }

    #[test]
    fn confident_estimate_sets_nav_offset() {
        let mut cfg = config();
        cfg.init_window.north_var = 25.0;
        cfg.init_window.east_var = 25.0;
        let mut nav_ = navigator(cfg);
        assert!(matches!(
            nav_.estimate_pose(EstimateKind::Mmse),
            Err(TrnError::NotInitialized)
        ));
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        nav_.meas_update(ping(0.0));
        let estimate = nav_.estimate_pose(EstimateKind::Mmse).unwrap();
        assert_eq!(estimate.time, 0.0);
        let offset = nav_.nav_offset();
        assert_approx_eq!(offset.x, 0.0, 1e-9);
        assert_approx_eq!(offset.y, 0.0, 1e-9);
        let mle = nav_.estimate_pose(EstimateKind::Mle).unwrap();
        assert_approx_eq!(mle.x, estimate.x, 1e-12);
    }

    #[test]
    fn reinit_from_estimate_keeps_filter_running() {
        let mut nav_ = navigator(config());
        nav_.meas_update(ping(0.0));
        nav_.motion_update(&nav(0.0)).unwrap();
        nav_.reinit(false).unwrap();
        assert!(nav_.initialized());
        assert_eq!(nav_.reinit_count(), 1);
        assert!(nav_.is_converged());
    }
}
