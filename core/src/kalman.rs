//! Gaussian terrain navigation filters (EKF/SPKF)
//!
//! This module contains the Kalman filter style estimators of the filter contract. Both keep a
//! mean and covariance over the vehicle position (and, for the sigma-point filter, optionally
//! attitude and gyro bias) and correlate range measurements against the terrain map through the
//! [`TerrainMap`](crate::map::TerrainMap) interface held by their [`FilterCore`].

use std::fmt::{self, Debug};

use log::{debug, trace};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::beams::{ProjectedBeams, map_frame_attitude, rotation};
use crate::config::{FilterType, InitDistribution, SigmaPointConfig};
use crate::error::{Rejection, Result};
use crate::filter::{FilterCore, MotionStep, PositionBounds, heading_rate};
use crate::linalg::{matrix_square_root, robust_spd_solve, symmetrize};
use crate::map::{RangeError, SubmapRequest};
use crate::{DataType, Measurement, PackedCovariance, Pose, TerrainFilter, states, wrap_to_pi};

/// Diagonal regularization added after every covariance update.
const COVARIANCE_EPS: f64 = 1e-9;
/// Floor on per-beam measurement noise (m²).
const MIN_NOISE_VARIANCE: f64 = 1e-9;

/// Horizontal 3σ extent of a Gaussian position belief.
fn gaussian_bounds(mean: &DVector<f64>, covariance: &DMatrix<f64>) -> PositionBounds {
    let sigma = |i: usize| covariance[(i, i)].max(0.0).sqrt();
    PositionBounds::around(mean[0], mean[1], 3.0 * sigma(0), 3.0 * sigma(1))
}

/// Per-beam normalized innovation squared, `νᵀ S⁻¹ ν / m`.
fn innovation_nis(s: &DMatrix<f64>, innovation: &DVector<f64>) -> Option<f64> {
    let m = innovation.len();
    if m == 0 {
        return None;
    }
    let rhs = DMatrix::from_column_slice(m, 1, innovation.as_slice());
    let solved = robust_spd_solve(s, &rhs)?;
    Some(innovation.dot(&solved.column(0)) / m as f64)
}

fn regularize(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let mut p = symmetrize(covariance);
    for i in 0..p.nrows() {
        p[(i, i)] += COVARIANCE_EPS;
    }
    p
}

/// Extended Kalman Filter (EKF) over the vehicle position
///
/// The EKF keeps a three-state Gaussian belief $x = [N, E, D]$ with covariance $P$ and
/// linearizes the terrain measurement through the local map gradient.
///
/// # Motion model
///
/// The mean moves by the dead-reckoned inertial delta and the covariance grows by a diagonal
/// drift term:
///
/// $$
/// \bar{x} = x + \Delta, \qquad \bar{P} = P + \mathrm{diag}(\sigma_d^2, \sigma_d^2, \sigma_z^2)
/// $$
///
/// where $\sigma_d$ follows the CEP drift model of
/// [`FilterCore::drift_sigma`](crate::filter::FilterCore::drift_sigma) and $\sigma_z$ is the
/// configured depth noise. A zero-length time step adds no noise.
///
/// # Measurement model
///
/// Each beam $j$, rotated into the map frame as $b_j$, predicts a range error
///
/// $$
/// h_j(x) = D(N + b_{j,N}, E + b_{j,E}) - (D_v + b_{j,D})
/// $$
///
/// which is zero for a perfect measurement. The observation row is the gradient of $h_j$,
///
/// $$
/// H_j = \begin{bmatrix} \frac{\partial D}{\partial N} & \frac{\partial D}{\partial E} & -1 \end{bmatrix}
/// $$
///
/// and the beam noise combines the measured range variance, the map variance and a quadratic
/// penalty on the horizontal beam reach that accounts for terrain decorrelation:
///
/// $$
/// W_{jj} = \sigma_{r,j}^2 + \sigma_{map,j}^2 + k_p (b_{j,N}^2 + b_{j,E}^2)
/// $$
///
/// Beams whose depth or gradient fall in a map hole are skipped; with none left the update is
/// rejected. The gain is $K = P H^T (H P H^T + W)^{-1}$ and the covariance uses the Joseph form
///
/// $$
/// P^+ = (I - K H) P (I - K H)^T + K W K^T
/// $$
///
/// A Gaussian belief has no separate mode, so the MLE and MMSE estimates coincide and the
/// filter always reports itself converged.
pub struct ExtendedKalmanFilter {
    core: FilterCore,
    /// State estimate `[N, E, D]`
    mean_state: DVector<f64>,
    /// State covariance (3x3)
    covariance: DMatrix<f64>,
}

impl Debug for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF")
            .field("core", &self.core)
            .field("mean_state", &self.mean_state.as_slice())
            .field("covariance_diagonal", &self.covariance.diagonal().as_slice())
            .finish()
    }
}

impl ExtendedKalmanFilter {
    /// Wrap the shared filter state. The belief is empty until the filter is initialized.
    pub fn new(core: FilterCore) -> Self {
        ExtendedKalmanFilter {
            core,
            mean_state: DVector::zeros(3),
            covariance: DMatrix::zeros(3, 3),
        }
    }

    /// Current state estimate `[N, E, D]`.
    pub fn mean_state(&self) -> &DVector<f64> {
        &self.mean_state
    }

    /// Current 3x3 state covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Assemble the linearized observation for every beam with valid map depth and gradient.
    ///
    /// Returns the observation matrix `H`, the innovations `ν = -h(x)` and the diagonal of `W`.
    fn linearize(
        &self,
        beams: &ProjectedBeams,
        meas: &Measurement,
    ) -> Option<(DMatrix<f64>, DVector<f64>, DVector<f64>)> {
        let x = &self.mean_state;
        let penalty = self.core.config.ekf_distance_penalty;
        let mut rows = Vec::with_capacity(beams.len());
        for j in 0..beams.len() {
            let b = beams.vector(j);
            let (north, east) = (x[0] + b.x, x[1] + b.y);
            let Some(sample) = self.core.map.depth(north, east) else {
                continue;
            };
            let Some((gn, ge)) = self.core.map.gradient(north, east) else {
                continue;
            };
            if !(sample.depth.is_finite() && gn.is_finite() && ge.is_finite()) {
                continue;
            }
            let predicted = sample.depth - (x[2] + b.z);
            let noise = meas.beam_variance(beams.indices[j])
                + sample.variance
                + penalty * (b.x * b.x + b.y * b.y);
            rows.push(([gn, ge, -1.0], -predicted, noise.max(MIN_NOISE_VARIANCE)));
        }
        if rows.is_empty() {
            return None;
        }
        let m = rows.len();
        let h = DMatrix::from_fn(m, 3, |r, c| rows[r].0[c]);
        let innovation = DVector::from_fn(m, |r, _| rows[r].1);
        let noise = DVector::from_fn(m, |r, _| rows[r].2);
        Some((h, innovation, noise))
    }
}

impl TerrainFilter for ExtendedKalmanFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Extended
    }

    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    /// The Gaussian belief takes the pose position as its mean and the leading 3x3 block of
    /// `covariance`; the distribution shape is not used.
    fn initialize_belief(
        &mut self,
        pose: &Pose,
        covariance: &PackedCovariance,
        _distribution: InitDistribution,
    ) -> Result<()> {
        self.mean_state = DVector::from_column_slice(pose.position().as_slice());
        self.covariance = symmetrize(&covariance.to_matrix(3));
        debug!(
            "EKF initialized at ({:.2}, {:.2}, {:.2}) with variances {:?}",
            pose.x,
            pose.y,
            pose.z,
            self.covariance.diagonal().as_slice()
        );
        Ok(())
    }

    /// Predict step: shift the mean by the inertial delta and inflate the covariance.
    ///
    /// The process noise is
    ///
    /// $$
    /// Q = \mathrm{diag}(\sigma_d^2, \sigma_d^2, \sigma_z^2)
    /// $$
    ///
    /// with $\sigma_d$ from the CEP drift model evaluated on the horizontal delta.
    fn motion_update(&mut self, pose: &Pose) -> Result<()> {
        let step = self.core.begin_motion(pose)?;
        let d = &step.delta;
        self.mean_state += DVector::from_vec(vec![d.x, d.y, d.z]);
        if step.dt > 0.0 {
            let dz = self.core.config.motion_noise.dz_stddev;
            let q = DVector::from_vec(vec![
                step.drift_sigma.powi(2),
                step.drift_sigma.powi(2),
                dz * dz,
            ]);
            self.covariance = symmetrize(&(&self.covariance + DMatrix::from_diagonal(&q)));
        }
        self.core.finish_motion(&step);
        Ok(())
    }

    /// Update step: correlate the beams against the map around the current mean.
    ///
    /// The innovation is $\nu = -h(\bar{x})$ since a perfect measurement produces zero range
    /// error. The state and covariance updates are
    ///
    /// $$
    /// x^+ = \bar{x} + K \nu, \qquad S = H P H^T + W
    /// $$
    ///
    /// The NIS $\nu^T S^{-1} \nu / m$ of the $m$ used beams is pushed into the rolling window.
    fn incorporate(&mut self, meas: &Measurement) -> std::result::Result<(), Rejection> {
        let last = self.core.last_pose.ok_or(Rejection::NotInitialized)?;
        let beams = self.core.project_beams(meas)?;
        let request = self.core.submap_request(
            &gaussian_bounds(&self.mean_state, &self.covariance),
            &last.attitude(),
            &Vector3::zeros(),
            &beams,
            meas.data_type,
        );
        self.core.load_submap(&request)?;

        let map_beams = beams.rotated(&map_frame_attitude(meas.data_type, &last.attitude()));
        let (h, innovation, noise) = self
            .linearize(&map_beams, meas)
            .ok_or(Rejection::MapHole)?;
        let w = DMatrix::from_diagonal(&noise);
        let p = &self.covariance;
        let s = symmetrize(&(&h * p * h.transpose() + &w));

        // Kalman gain: K = P Hᵀ S⁻¹, solved as Kᵀ = S⁻¹ H P.
        let k = robust_spd_solve(&s, &(&h * p))
            .ok_or(Rejection::SingularInnovation)?
            .transpose();
        let nis = innovation_nis(&s, &innovation);

        let mean = &self.mean_state + &k * &innovation;
        let i_kh = DMatrix::identity(3, 3) - &k * &h;
        let covariance = regularize(&(&i_kh * p * i_kh.transpose() + &k * &w * k.transpose()));

        trace!(
            "EKF update with {} beams: correction {:?}, nis {:?}",
            innovation.len(),
            (&mean - &self.mean_state).as_slice(),
            nis
        );
        self.mean_state = mean;
        self.covariance = covariance;
        if let Some(nis) = nis {
            self.core.nis.push(nis);
        }
        Ok(())
    }

    fn compute_mle(&self) -> Pose {
        self.compute_mmse()
    }

    fn compute_mmse(&self) -> Pose {
        let base = self.core.last_pose.unwrap_or_default();
        Pose {
            x: self.mean_state[0],
            y: self.mean_state[1],
            z: self.mean_state[2],
            covariance: PackedCovariance::from_matrix(&self.covariance),
            ..base
        }
    }

    fn check_convergence(&mut self) -> bool {
        self.core.converged = true;
        true
    }
}

/// Weights and scaling of the scaled unscented transform.
#[derive(Clone, Debug)]
struct UnscentedTransform {
    state_size: usize,
    lambda: f64,
    weights_mean: DVector<f64>,
    weights_cov: DVector<f64>,
}

impl UnscentedTransform {
    fn new(state_size: usize, params: &SigmaPointConfig) -> Self {
        let (alpha, beta, kappa) = (params.alpha, params.beta, params.kappa);
        let n = state_size as f64;
        let lambda = alpha * alpha * (n + kappa) - n;
        let mut weights_mean = DVector::zeros(2 * state_size + 1);
        let mut weights_cov = DVector::zeros(2 * state_size + 1);
        weights_mean[0] = lambda / (n + lambda);
        weights_cov[0] = lambda / (n + lambda) + (1.0 - alpha * alpha + beta);
        for i in 1..(2 * state_size + 1) {
            let w = 1.0 / (2.0 * (n + lambda));
            weights_mean[i] = w;
            weights_cov[i] = w;
        }
        UnscentedTransform {
            state_size,
            lambda,
            weights_mean,
            weights_cov,
        }
    }

    fn sigma_points(&self, mean: &DVector<f64>, covariance: &DMatrix<f64>) -> DMatrix<f64> {
        let n = self.state_size;
        let p = (n as f64 + self.lambda) * covariance;
        let sqrt_p = matrix_square_root(&p);
        let mut pts = DMatrix::<f64>::zeros(n, 2 * n + 1);
        pts.column_mut(0).copy_from(mean);
        for i in 0..sqrt_p.ncols() {
            pts.column_mut(i + 1).copy_from(&(mean + sqrt_p.column(i)));
            pts.column_mut(i + 1 + n).copy_from(&(mean - sqrt_p.column(i)));
        }
        pts
    }
}

/// Sigma-point (unscented) Kalman filter
///
/// State layout is `[N, E, D]`, followed by `[roll, pitch, yaw]` with attitude search and the
/// two gyro biases with gyro-bias search. With `augment_noise` the motion update draws sigma
/// points over the state augmented with one process-noise state per state.
pub struct SigmaPointFilter {
    core: FilterCore,
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    state_size: usize,
    transform: UnscentedTransform,
}

impl Debug for SigmaPointFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SPKF")
            .field("core", &self.core)
            .field("mean_state", &self.mean_state.as_slice())
            .field("covariance_diagonal", &self.covariance.diagonal().as_slice())
            .field("lambda", &self.transform.lambda)
            .field("state_size", &self.state_size)
            .finish()
    }
}

impl SigmaPointFilter {
    pub fn new(core: FilterCore) -> Self {
        let mut state_size = 3;
        if core.config.attitude_search {
            state_size += 3;
        }
        if core.config.gyro_bias_search {
            state_size += 2;
        }
        let transform = UnscentedTransform::new(state_size, &core.config.sigma_point);
        SigmaPointFilter {
            core,
            mean_state: DVector::zeros(state_size),
            covariance: DMatrix::zeros(state_size, state_size),
            state_size,
            transform,
        }
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn mean_state(&self) -> &DVector<f64> {
        &self.mean_state
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Current sigma points, one per column.
    pub fn sigma_points(&self) -> DMatrix<f64> {
        self.transform
            .sigma_points(&self.mean_state, &self.covariance)
    }

    fn attitude_index(&self) -> Option<usize> {
        self.core.config.attitude_search.then_some(3)
    }

    fn yaw_index(&self) -> Option<usize> {
        self.attitude_index().map(|a| a + 2)
    }

    fn gyro_index(&self) -> Option<usize> {
        self.core
            .config
            .gyro_bias_search
            .then_some(if self.core.config.attitude_search { 6 } else { 3 })
    }

    /// Index of state `k` in the packed pose covariance.
    fn packed_index(&self, k: usize) -> usize {
        match (self.attitude_index(), self.gyro_index()) {
            (Some(a), _) if (a..a + 3).contains(&k) => states::ROLL + (k - a),
            (_, Some(g)) if k >= g => states::GYRO_BIAS_X + (k - g),
            _ => k,
        }
    }

    fn wrap_angles(&self, x: &mut DVector<f64>) {
        if let Some(y) = self.yaw_index() {
            x[y] = wrap_to_pi(x[y]);
        }
    }

    /// `a - b` with the yaw difference wrapped.
    fn residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        let mut d = a - b;
        self.wrap_angles(&mut d);
        d
    }

    /// Weighted mean of the first `state_size` rows, averaging yaw about the central point.
    fn weighted_mean(&self, points: &DMatrix<f64>, weights: &DVector<f64>) -> DVector<f64> {
        let mut mean = DVector::<f64>::zeros(self.state_size);
        let reference = points.column(0).rows(0, self.state_size).clone_owned();
        for (i, point) in points.column_iter().enumerate() {
            let x = point.rows(0, self.state_size).clone_owned();
            mean += weights[i] * self.residual(&x, &reference);
        }
        mean += reference;
        self.wrap_angles(&mut mean);
        mean
    }

    /// Diagonal of the additive process noise for one motion step.
    fn process_noise(&self, step: &MotionStep) -> DVector<f64> {
        let mut q = DVector::zeros(self.state_size);
        if step.dt <= 0.0 {
            return q;
        }
        let noise = &self.core.config.motion_noise;
        q[0] = step.drift_sigma.powi(2);
        q[1] = step.drift_sigma.powi(2);
        q[2] = noise.dz_stddev.powi(2);
        if let Some(a) = self.attitude_index() {
            q[a] = noise.dphi_stddev.powi(2);
            q[a + 1] = noise.dtheta_stddev.powi(2);
            if !self.core.config.gyro_bias_search {
                q[a + 2] = noise.dpsi_stddev.powi(2);
            }
        }
        if let Some(g) = self.gyro_index() {
            q[g] = step.gyro_sigma.powi(2);
            q[g + 1] = step.gyro_sigma.powi(2);
        }
        q
    }

    /// Move one sigma point through the dead-reckoning model.
    ///
    /// With attitude search the horizontal delta is rotated by the point's heading offset from
    /// the navigation heading, and yaw integrates the body rates minus the point's gyro bias
    /// when the biases are estimated.
    fn propagate_point(&self, x: &mut DVector<f64>, step: &MotionStep) {
        let d = &step.delta;
        let last = &step.last;
        let (mut dx, mut dy) = (d.x, d.y);
        if let Some(a) = self.attitude_index() {
            let (sin, cos) = wrap_to_pi(x[a + 2] - last.psi).sin_cos();
            (dx, dy) = (cos * d.x - sin * d.y, sin * d.x + cos * d.y);
            x[a] += d.phi;
            x[a + 1] += d.theta;
            x[a + 2] += match self.gyro_index() {
                Some(g) => heading_rate(last, &[x[g], x[g + 1]]) * step.dt,
                None => d.psi,
            };
        }
        x[0] += dx;
        x[1] += dy;
        x[2] += d.z;
        self.wrap_angles(x);
    }

    fn submap_request_for(
        &self,
        beams: &ProjectedBeams,
        data_type: DataType,
        last: &Pose,
    ) -> SubmapRequest {
        let (mean, var) = match self.attitude_index() {
            Some(a) => (
                Vector3::new(self.mean_state[a], self.mean_state[a + 1], self.mean_state[a + 2]),
                Vector3::new(
                    self.covariance[(a, a)],
                    self.covariance[(a + 1, a + 1)],
                    self.covariance[(a + 2, a + 2)],
                ),
            ),
            None => (last.attitude(), Vector3::zeros()),
        };
        self.core.submap_request(
            &gaussian_bounds(&self.mean_state, &self.covariance),
            &mean,
            &var,
            beams,
            data_type,
        )
    }

    /// Range errors of every beam for every sigma point, laid out point-major.
    fn expected_range_errors(
        &self,
        points: &DMatrix<f64>,
        beams: &ProjectedBeams,
        data_type: DataType,
        last: &Pose,
    ) -> Vec<Option<RangeError>> {
        let mut table = Vec::with_capacity(points.ncols() * beams.len());
        for point in points.column_iter() {
            let attitude = match self.attitude_index() {
                Some(a) => Vector3::new(point[a], point[a + 1], point[a + 2]),
                None => last.attitude(),
            };
            let to_map = rotation(&map_frame_attitude(data_type, &attitude));
            let position = Vector3::new(point[0], point[1], point[2]);
            for j in 0..beams.len() {
                let v = to_map * beams.vector(j);
                let range = v.norm();
                let error = if range > 0.0 {
                    let direction: Vector3<f64> = v / range;
                    self.core
                        .map
                        .range_error(&position, &direction, range)
                        .filter(|e| e.error.is_finite())
                } else {
                    None
                };
                table.push(error);
            }
        }
        table
    }
}

impl TerrainFilter for SigmaPointFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::SigmaPoint
    }

    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn initialize_belief(
        &mut self,
        pose: &Pose,
        covariance: &PackedCovariance,
        _distribution: InitDistribution,
    ) -> Result<()> {
        let n = self.state_size;
        let mut mean = DVector::zeros(n);
        mean[0] = pose.x;
        mean[1] = pose.y;
        mean[2] = pose.z;
        if let Some(a) = self.attitude_index() {
            mean[a] = pose.phi;
            mean[a + 1] = pose.theta;
            mean[a + 2] = wrap_to_pi(pose.psi);
        }
        self.mean_state = mean;
        self.covariance = DMatrix::from_fn(n, n, |i, j| {
            covariance.get(self.packed_index(i), self.packed_index(j))
        });
        debug!(
            "SPKF initialized with {} states at ({:.2}, {:.2}, {:.2})",
            n, pose.x, pose.y, pose.z
        );
        Ok(())
    }

    fn motion_update(&mut self, pose: &Pose) -> Result<()> {
        let step = self.core.begin_motion(pose)?;
        let n = self.state_size;
        let q = self.process_noise(&step);

        let (points, transform) = if self.core.config.sigma_point.augment_noise {
            let mut mean = DVector::zeros(2 * n);
            mean.rows_mut(0, n).copy_from(&self.mean_state);
            let mut cov = DMatrix::zeros(2 * n, 2 * n);
            cov.view_mut((0, 0), (n, n)).copy_from(&self.covariance);
            cov.view_mut((n, n), (n, n))
                .copy_from(&DMatrix::from_diagonal(&q));
            let transform = UnscentedTransform::new(2 * n, &self.core.config.sigma_point);
            let augmented = transform.sigma_points(&mean, &cov);
            let mut points = DMatrix::zeros(n, augmented.ncols());
            for (i, point) in augmented.column_iter().enumerate() {
                let mut x = point.rows(0, n).clone_owned();
                self.propagate_point(&mut x, &step);
                x += point.rows(n, n);
                self.wrap_angles(&mut x);
                points.set_column(i, &x);
            }
            (points, transform)
        } else {
            let mut points = self.sigma_points();
            for i in 0..points.ncols() {
                let mut x = points.column(i).clone_owned();
                self.propagate_point(&mut x, &step);
                points.set_column(i, &x);
            }
            (points, self.transform.clone())
        };

        let mu_bar = self.weighted_mean(&points, &transform.weights_mean);
        let mut p_bar = DMatrix::<f64>::zeros(n, n);
        for (i, point) in points.column_iter().enumerate() {
            let diff = self.residual(&point.clone_owned(), &mu_bar);
            p_bar += transform.weights_cov[i] * &diff * diff.transpose();
        }
        if !self.core.config.sigma_point.augment_noise {
            p_bar += DMatrix::from_diagonal(&q);
        }
        self.mean_state = mu_bar;
        self.covariance = symmetrize(&p_bar);
        self.core.finish_motion(&step);
        Ok(())
    }

    /// Unscented measurement update against the map.
    ///
    /// A beam that falls in a map hole for any sigma point rejects the measurement unless
    /// `use_nan_region` is set, in which case that beam is dropped for every point.
    fn incorporate(&mut self, meas: &Measurement) -> std::result::Result<(), Rejection> {
        let last = self.core.last_pose.ok_or(Rejection::NotInitialized)?;
        let beams = self.core.project_beams(meas)?;
        let request = self.submap_request_for(&beams, meas.data_type, &last);
        self.core.load_submap(&request)?;

        let points = self.sigma_points();
        let np = points.ncols();
        let nb = beams.len();
        let table = self.expected_range_errors(&points, &beams, meas.data_type, &last);
        let use_nan_region = self.core.config.sigma_point.use_nan_region;
        let mut used = Vec::with_capacity(nb);
        for j in 0..nb {
            if (0..np).all(|i| table[i * nb + j].is_some()) {
                used.push(j);
            } else if !use_nan_region {
                return Err(Rejection::MapHole);
            }
        }
        if used.is_empty() {
            return Err(Rejection::MapHole);
        }

        let m = used.len();
        let z = DMatrix::from_fn(m, np, |r, i| {
            table[i * nb + used[r]].map_or(0.0, |e| e.error)
        });
        let noise = DVector::from_fn(m, |r, _| {
            let j = used[r];
            let map_var = (0..np)
                .filter_map(|i| table[i * nb + j])
                .map(|e| e.variance)
                .sum::<f64>()
                / np as f64;
            (meas.beam_variance(beams.indices[j]) + map_var).max(MIN_NOISE_VARIANCE)
        });

        let wm = &self.transform.weights_mean;
        let wc = &self.transform.weights_cov;
        let mut z_hat = DVector::<f64>::zeros(m);
        for (i, zi) in z.column_iter().enumerate() {
            z_hat += wm[i] * zi;
        }
        let mut s = DMatrix::from_diagonal(&noise);
        let mut cross_covariance = DMatrix::<f64>::zeros(self.state_size, m);
        for (i, zi) in z.column_iter().enumerate() {
            let dz = zi - &z_hat;
            s += wc[i] * &dz * dz.transpose();
            let dx = self.residual(&points.column(i).clone_owned(), &self.mean_state);
            cross_covariance += wc[i] * dx * dz.transpose();
        }
        let s = symmetrize(&s);
        let k = robust_spd_solve(&s, &cross_covariance.transpose())
            .ok_or(Rejection::SingularInnovation)?
            .transpose();

        // A perfect measurement has zero range error for every beam.
        let innovation = -z_hat;
        let nis = innovation_nis(&s, &innovation);
        let mut mean = &self.mean_state + &k * &innovation;
        self.wrap_angles(&mut mean);
        let covariance = regularize(&(&self.covariance - &k * &s * k.transpose()));

        trace!(
            "SPKF update with {m} of {nb} beams: innovation {:?}, nis {nis:?}",
            innovation.as_slice()
        );
        self.mean_state = mean;
        self.covariance = covariance;
        if let Some(nis) = nis {
            self.core.nis.push(nis);
        }
        Ok(())
    }

    fn compute_mle(&self) -> Pose {
        self.compute_mmse()
    }

    fn compute_mmse(&self) -> Pose {
        let base = self.core.last_pose.unwrap_or_default();
        let mut pose = Pose {
            x: self.mean_state[0],
            y: self.mean_state[1],
            z: self.mean_state[2],
            ..base
        };
        if let Some(a) = self.attitude_index() {
            pose.phi = self.mean_state[a];
            pose.theta = self.mean_state[a + 1];
            pose.psi = self.mean_state[a + 2];
        }
        let mut full = DMatrix::<f64>::zeros(states::COUNT, states::COUNT);
        for i in 0..self.state_size {
            for j in 0..self.state_size {
                full[(self.packed_index(i), self.packed_index(j))] = self.covariance[(i, j)];
            }
        }
        pose.covariance = PackedCovariance::from_matrix(&full);
        pose
    }

    fn check_convergence(&mut self) -> bool {
        self.core.converged = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, InitWindow, VehicleSpec};
    use crate::map::test_maps::{HoleMap, PlaneMap};
    use crate::map::{SubmapStatus, TerrainMap, TerrainSample, vertical_range_error};
    use assert_approx_eq::assert_approx_eq;

    const FLOOR: f64 = 50.0;
    const ALTITUDE: f64 = 10.0;

    fn start_pose() -> Pose {
        let mut pose = Pose::at(0.0, 0.0, 0.0, FLOOR - ALTITUDE);
        pose.gps_valid = true;
        pose
    }

    fn ping(time: f64, altitude: f64, variance: f64) -> Measurement {
        let range = altitude / 30.0_f64.to_radians().cos();
        let mut meas = Measurement::dvl(time, &[range; 4]);
        meas.covariance = vec![variance; 4];
        meas
    }

    fn ekf(
        config: FilterConfig,
        vehicle: VehicleSpec,
        map: Box<dyn TerrainMap>,
    ) -> ExtendedKalmanFilter {
        let mut filter = ExtendedKalmanFilter::new(FilterCore::new(config, vehicle, map));
        filter.init_filter(&start_pose()).unwrap();
        filter
    }

    fn spkf(config: FilterConfig, map: Box<dyn TerrainMap>) -> SigmaPointFilter {
        let config = FilterConfig {
            filter_type: FilterType::SigmaPoint,
            ..config
        };
        let core = FilterCore::new(config, VehicleSpec::default(), map);
        let mut filter = SigmaPointFilter::new(core);
        filter.init_filter(&start_pose()).unwrap();
        filter
    }

    fn assert_symmetric_psd_diagonal(p: &DMatrix<f64>) {
        assert!((p - p.transpose()).amax() < 1e-12);
        for i in 0..p.nrows() {
            assert!(p[(i, i)] >= 0.0);
        }
    }

    /// Flat floor with map holes east of the vehicle track.
    #[derive(Debug)]
    struct EastHoleMap;

    impl TerrainMap for EastHoleMap {
        fn range_error(
            &self,
            position: &Vector3<f64>,
            direction: &Vector3<f64>,
            range: f64,
        ) -> Option<RangeError> {
            vertical_range_error(self, position, direction, range)
        }

        fn depth(&self, _north: f64, east: f64) -> Option<TerrainSample> {
            (east <= 0.0).then_some(TerrainSample {
                depth: FLOOR,
                variance: 0.25,
            })
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

    #[test]
    fn ekf_motion_only_drift() {
        let config = FilterConfig {
            filter_type: FilterType::Extended,
            init_window: InitWindow {
                north_var: 0.0,
                east_var: 0.0,
                depth_var: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let vehicle = VehicleSpec {
            drift_rate: 2.0,
            ..Default::default()
        };
        let mut filter = ekf(config, vehicle, Box::new(PlaneMap::flat(FLOOR)));
        assert_eq!(filter.covariance()[(0, 0)], 0.0);
        let mut previous = 0.0;
        for k in 1..=10 {
            let mut pose = start_pose();
            pose.time = k as f64;
            pose.x = k as f64;
            filter.motion_update(&pose).unwrap();
            let var = filter.covariance()[(0, 0)];
            assert!(var > previous);
            previous = var;
            assert_symmetric_psd_diagonal(filter.covariance());
        }
        assert_approx_eq!(filter.mean_state()[0], 10.0, 1e-9);
        assert_approx_eq!(filter.mean_state()[1], 0.0, 1e-12);
    }

    #[test]
    fn ekf_zero_time_motion_adds_no_noise() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(FLOOR)),
        );
        let before = filter.covariance().clone();
        let mut pose = start_pose();
        pose.x = 3.0;
        filter.motion_update(&pose).unwrap();
        assert_eq!(filter.covariance(), &before);
        assert_approx_eq!(filter.mean_state()[0], 3.0);
    }

    #[test]
    fn ekf_perfect_measurement_reduces_depth_variance() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(FLOOR)),
        );
        let before = filter.covariance()[(2, 2)];
        assert!(filter.meas_update(&ping(0.0, ALTITUDE, 0.0)));
        let after = filter.covariance()[(2, 2)];
        assert!(after < before);
        assert_approx_eq!(filter.mean_state()[2], FLOOR - ALTITUDE, 1e-6);
        assert_symmetric_psd_diagonal(filter.covariance());
        assert!(filter.windowed_nis().is_some());
    }

    #[test]
    fn ekf_corrects_depth_toward_terrain() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(FLOOR)),
        );
        // Measured altitude 12 m puts the vehicle 2 m shallower than believed.
        assert!(filter.meas_update(&ping(0.0, 12.0, 0.01)));
        let z = filter.mean_state()[2];
        assert!(z < FLOOR - ALTITUDE - 1.0, "z = {z}");
        assert!(z > FLOOR - 12.0 - 0.5);
    }

    #[test]
    fn ekf_sloped_terrain_moves_position() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::sloped(FLOOR, 0.2, 0.0)),
        );
        // True position 5 m north: the floor is 1 m deeper there.
        assert!(filter.meas_update(&ping(0.0, ALTITUDE + 1.0, 0.01)));
        assert!(filter.mean_state()[0] > 0.5);
        assert!(filter.covariance()[(0, 0)] < 100.0);
    }

    #[test]
    fn ekf_map_hole_leaves_state_untouched() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(HoleMap),
        );
        let before = filter.compute_mmse();
        assert_eq!(
            filter.incorporate(&ping(0.0, ALTITUDE, 1.0)),
            Err(Rejection::MapHole)
        );
        assert_eq!(filter.compute_mmse(), before);
    }

    #[test]
    fn ekf_invalid_beams_are_a_no_op() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(FLOOR)),
        );
        let before = filter.compute_mmse();
        let mut meas = ping(0.0, ALTITUDE, 1.0);
        meas.status = vec![false; 4];
        assert!(!filter.meas_update(&meas));
        assert_eq!(filter.compute_mmse(), before);
    }

    #[test]
    fn ekf_estimates_agree_and_converge() {
        let mut filter = ekf(
            FilterConfig::default(),
            VehicleSpec::default(),
            Box::new(PlaneMap::flat(FLOOR)),
        );
        assert_eq!(filter.compute_mle(), filter.compute_mmse());
        assert_eq!(filter.compute_mmse(), filter.compute_mmse());
        assert!(filter.check_convergence());
        assert!(filter.is_converged());
        assert_eq!(filter.compute_mmse().covariance.get(0, 0), 100.0);
    }

    #[test]
    fn unscented_weights_sum_to_one() {
        let t = UnscentedTransform::new(3, &SigmaPointConfig::default());
        assert_approx_eq!(t.weights_mean.sum(), 1.0, 1e-6);
        assert_eq!(t.weights_mean.len(), 7);
        let mean = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 1.0, 0.25]));
        let pts = t.sigma_points(&mean, &cov);
        assert_eq!(pts.ncols(), 7);
        let mut recovered = DVector::<f64>::zeros(3);
        for (i, p) in pts.column_iter().enumerate() {
            recovered += t.weights_mean[i] * p;
        }
        for i in 0..3 {
            assert_approx_eq!(recovered[i], mean[i], 1e-6);
        }
    }

    #[test]
    fn spkf_state_layout() {
        let filter = spkf(
            FilterConfig {
                attitude_search: true,
                gyro_bias_search: true,
                ..Default::default()
            },
            Box::new(PlaneMap::flat(FLOOR)),
        );
        assert_eq!(filter.state_size(), 8);
        assert_eq!(filter.sigma_points().ncols(), 17);
        let cov = filter.compute_mmse().covariance;
        assert_approx_eq!(cov.get(states::YAW, states::YAW), 5.0_f64.to_radians().powi(2));
        assert_approx_eq!(cov.get(states::GYRO_BIAS_Y, states::GYRO_BIAS_Y), 1e-6);
        assert_eq!(cov.get(states::PSI_BERG, states::PSI_BERG), 0.0);
    }

    #[test]
    fn spkf_motion_moves_mean_and_grows_covariance() {
        let mut filter = spkf(FilterConfig::default(), Box::new(PlaneMap::flat(FLOOR)));
        let before = filter.covariance()[(0, 0)];
        let mut pose = start_pose();
        pose.time = 1.0;
        pose.x = 2.0;
        pose.y = -1.0;
        filter.motion_update(&pose).unwrap();
        assert_approx_eq!(filter.mean_state()[0], 2.0, 1e-6);
        assert_approx_eq!(filter.mean_state()[1], -1.0, 1e-6);
        assert!(filter.covariance()[(0, 0)] > before);
        assert_symmetric_psd_diagonal(filter.covariance());
    }

    #[test]
    fn spkf_augmented_noise_matches_additive_for_linear_motion() {
        let mut additive = spkf(FilterConfig::default(), Box::new(PlaneMap::flat(FLOOR)));
        let mut config = FilterConfig::default();
        config.sigma_point.augment_noise = true;
        let mut augmented = spkf(config, Box::new(PlaneMap::flat(FLOOR)));
        let mut pose = start_pose();
        pose.time = 1.0;
        pose.x = 4.0;
        additive.motion_update(&pose).unwrap();
        augmented.motion_update(&pose).unwrap();
        for i in 0..3 {
            assert_approx_eq!(augmented.mean_state()[i], additive.mean_state()[i], 1e-6);
            assert_approx_eq!(
                augmented.covariance()[(i, i)],
                additive.covariance()[(i, i)],
                1e-4
            );
        }
    }

    #[test]
    fn spkf_gyro_bias_integrates_heading() {
        let mut filter = spkf(
            FilterConfig {
                attitude_search: true,
                gyro_bias_search: true,
                ..Default::default()
            },
            Box::new(PlaneMap::flat(FLOOR)),
        );
        let mut pose = start_pose();
        pose.wz = 0.1;
        filter.motion_update(&pose).unwrap();
        let mut next = pose;
        next.time = 1.0;
        filter.motion_update(&next).unwrap();
        assert_approx_eq!(filter.mean_state()[5], 0.1, 1e-4);
    }

    #[test]
    fn spkf_measurement_reduces_depth_variance() {
        let mut filter = spkf(FilterConfig::default(), Box::new(PlaneMap::flat(FLOOR)));
        let before = filter.covariance()[(2, 2)];
        assert!(filter.meas_update(&ping(0.0, ALTITUDE, 0.0)));
        assert!(filter.covariance()[(2, 2)] < before);
        assert_approx_eq!(filter.mean_state()[2], FLOOR - ALTITUDE, 1e-4);
        assert_symmetric_psd_diagonal(filter.covariance());
    }

    #[test]
    fn spkf_map_hole_needs_nan_region() {
        let mut strict = spkf(FilterConfig::default(), Box::new(EastHoleMap));
        let before = strict.compute_mmse();
        assert_eq!(
            strict.incorporate(&ping(0.0, ALTITUDE, 1.0)),
            Err(Rejection::MapHole)
        );
        assert_eq!(strict.compute_mmse(), before);

        let mut config = FilterConfig::default();
        config.sigma_point.use_nan_region = true;
        let mut lenient = spkf(config, Box::new(EastHoleMap));
        let before = lenient.covariance()[(2, 2)];
        assert_eq!(lenient.incorporate(&ping(0.0, ALTITUDE, 1.0)), Ok(()));
        assert!(lenient.covariance()[(2, 2)] < before);
    }

    #[test]
    fn spkf_all_holes_rejected_even_with_nan_region() {
        let mut config = FilterConfig::default();
        config.sigma_point.use_nan_region = true;
        let mut filter = spkf(config, Box::new(HoleMap));
        let before = filter.compute_mmse();
        assert!(!filter.meas_update(&ping(0.0, ALTITUDE, 1.0)));
        assert_eq!(filter.compute_mmse(), before);
    }

    #[test]
    fn spkf_invalid_beams_are_a_no_op() {
        let mut filter = spkf(FilterConfig::default(), Box::new(PlaneMap::flat(FLOOR)));
        let before = filter.compute_mmse();
        let mut meas = ping(0.0, ALTITUDE, 1.0);
        meas.status = vec![false; 4];
        assert_eq!(filter.incorporate(&meas), Err(Rejection::NoValidBeams));
        assert_eq!(filter.compute_mmse(), before);
    }
}
