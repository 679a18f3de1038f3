//! Particle filter over vehicle position and optional augmented states.
//!
//! Each [`Particle`] is one hypothesis of the vehicle's map-frame position, plus whatever
//! augmented states the configuration searches over (attitude, gyro bias, compass bias, DVL
//! alignment and errors, iceberg heading offset, terrain drift). Motion updates move every
//! particle by the dead-reckoned displacement with per-particle noise; measurement updates
//! re-weight the cloud by comparing each particle's expected ranges against the map.
//!
//! A measurement update is computed into a staged set of weights and NIS windows and only
//! committed once it has succeeded, so a rejected measurement leaves the cloud untouched.
//! Resampling is systematic and double-buffered: survivors are copied into a second vector
//! which is then swapped with the live one.

use std::fmt::{self, Debug};
use std::mem;
use std::path::Path;

use log::{debug, info, trace, warn};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3xX, Rotation3, Vector2, Vector3};

use crate::beams::{ProjectedBeams, map_frame_attitude, rotation};
use crate::config::{
    FilterConfig, FilterType, InitDistribution, InitWindow, MAX_PARTICLES, WeightingMode,
};
use crate::error::{Rejection, Result, TrnError};
use crate::filter::{FilterCore, MotionStep, NisWindow, PositionBounds, heading_rate};
use crate::linalg::{matrix_square_root, robust_spd_solve};
use crate::random::RandomVariate;
use crate::{DataType, Measurement, PackedCovariance, Pose, TerrainFilter, states, wrap_to_pi};

/// Augmented-MCL smoothing rates for the slow and fast likelihood averages.
const AMCL_ALPHA_SLOW: f64 = 0.03;
const AMCL_ALPHA_FAST: f64 = 0.2;
/// Fraction of the slow/fast likelihood deficit converted into random particles.
const AMCL_INJECTION_GAIN: f64 = 0.1;

/// One-sigma homing beacon position error, percent of each relative offset.
const HOMER_RANGE_PERCENT_ERROR: f64 = 2.75;

/// Floor on a combined beam variance.
const MIN_VARIANCE: f64 = 1e-9;
/// Map information covariance used when the cloud carries no more spread than the map noise.
const MIN_MAP_INFO_COV: f64 = 1e-7;

/// Subclouds smaller than this fraction of the cloud, or lighter than this weight, are skipped.
const MIN_SUBCLOUD_FRACTION: f64 = 0.001;
const MIN_SUBCLOUD_WEIGHT: f64 = 0.001;

/// One position hypothesis and its augmented states.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    /// North, East, Down in the map frame (m).
    pub position: Vector3<f64>,
    /// Roll, pitch, yaw (rad).
    pub attitude: Vector3<f64>,
    /// Terrain drift: North and East velocity (m/s) and yaw rate (rad/s).
    pub terrain_drift: Vector3<f64>,
    /// DVL mounting alignment error (rad).
    pub dvl_align: Vector3<f64>,
    /// DVL velocity bias (m/s).
    pub dvl_bias: Vector3<f64>,
    pub dvl_scale_factor: f64,
    /// Gyro biases on the y and z body axes (rad/s).
    pub gyro_bias: [f64; 2],
    pub compass_bias: f64,
    /// Iceberg-relative heading offset (rad).
    pub psi_berg: f64,
    pub weight: f64,
    pub nis_window: NisWindow,
}

impl Particle {
    fn at(pose: &Pose, weight: f64) -> Self {
        Particle {
            position: pose.position(),
            attitude: pose.attitude(),
            psi_berg: pose.psi_berg,
            weight,
            ..Default::default()
        }
    }

    /// `base` with this particle's position and attitude states substituted.
    pub fn to_pose(&self, base: &Pose) -> Pose {
        Pose {
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
            phi: self.attitude.x,
            theta: self.attitude.y,
            psi: wrap_to_pi(self.attitude.z),
            psi_berg: self.psi_berg,
            covariance: PackedCovariance::default(),
            ..*base
        }
    }

    /// Yaw used to rotate body vectors, including the compass bias.
    fn heading_attitude(&self) -> Vector3<f64> {
        Vector3::new(
            self.attitude.x,
            self.attitude.y,
            self.attitude.z + self.compass_bias,
        )
    }
}

/// Weighted estimate of a homing beacon's position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HomerEstimate {
    pub time: f64,
    pub north: f64,
    pub east: f64,
    /// `[NN, EE, NE]` (m²).
    pub covariance: [f64; 3],
}

/// Diagnostics of the most recent successful measurement update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateStats {
    pub time: f64,
    /// Beams valid for every particle and weighted with the standard likelihood.
    pub common_beams: usize,
    pub subcloud_beams: usize,
    pub cross_beams: usize,
    pub nis: Option<f64>,
    /// Prior-weighted likelihood sum of the standard update.
    pub sum_weights: Option<f64>,
    /// Ratio of non-map to total variance per common beam under the modified weighting modes.
    pub alphas: Vec<f64>,
    /// `false` when the standard likelihood was gated out by NIS or a zero likelihood sum.
    pub weights_updated: bool,
    pub effective_sample_size: f64,
    pub resampled: bool,
}

/// Expected-minus-measured range of every beam for every particle.
struct DiffTable {
    num_beams: usize,
    diffs: Vec<Option<f64>>,
    /// Mean map variance per beam over the particles where the beam resolved.
    map_var: Vec<f64>,
    beam_var: Vec<f64>,
    /// Vertical component of each beam at the navigation attitude (m).
    beam_dz: Vec<f64>,
}

impl UpdateStats {
    pub fn beams_used(&self) -> usize {
        self.common_beams + self.subcloud_beams + self.cross_beams
    }
}

impl DiffTable {
    #[inline]
    fn get(&self, particle: usize, beam: usize) -> Option<f64> {
        self.diffs[particle * self.num_beams + beam]
    }
}

/// A measurement update that has been computed but not yet applied.
struct StagedUpdate {
    weights: Vec<f64>,
    depth_bias: Option<Vec<f64>>,
    nis_windows: Option<Vec<NisWindow>>,
    soundings: usize,
    mean_likelihood: Option<f64>,
    stats: UpdateStats,
}

pub struct ParticleFilter {
    core: FilterCore,
    particles: Vec<Particle>,
    resample_buffer: Vec<Particle>,
    /// Soundings incorporated since the last resample.
    n_soundings: usize,
    w_slow: f64,
    w_fast: f64,
    homer: Option<HomerEstimate>,
    last_stats: Option<UpdateStats>,
    subcloud_nis: Option<f64>,
}

impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.compute_mmse();
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field(
                "mean_position",
                &format_args!("({:.2}, {:.2}, {:.2}) m", mean.x, mean.y, mean.z),
            )
            .field(
                "mean_attitude",
                &format_args!("({:.3}, {:.3}, {:.3}) rad", mean.phi, mean.theta, mean.psi),
            )
            .field("n_soundings", &self.n_soundings)
            .field("core", &self.core)
            .finish()
    }
}

impl ParticleFilter {
    pub fn new(core: FilterCore) -> Self {
        ParticleFilter {
            core,
            particles: Vec::new(),
            resample_buffer: Vec::new(),
            n_soundings: 0,
            w_slow: 0.0,
            w_fast: 0.0,
            homer: None,
            last_stats: None,
            subcloud_nis: None,
        }
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Overwrite the particle weights; `weights` must hold one entry per particle.
    pub fn set_weights(&mut self, weights: &[f64]) {
        debug_assert_eq!(weights.len(), self.particles.len());
        for (particle, &w) in self.particles.iter_mut().zip(weights.iter()) {
            particle.weight = w;
        }
    }

    /// Scale the weights to sum to one, falling back to uniform weights when the sum is zero
    /// or not finite.
    pub fn normalize_weights(&mut self) {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else if !self.particles.is_empty() {
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
        }
    }

    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    pub fn n_soundings(&self) -> usize {
        self.n_soundings
    }

    pub fn homer_estimate(&self) -> Option<&HomerEstimate> {
        self.homer.as_ref()
    }

    pub fn last_update_stats(&self) -> Option<&UpdateStats> {
        self.last_stats.as_ref()
    }

    /// Systematic resampling into the spare buffer, followed by a buffer swap.
    ///
    /// With augmented MCL enabled, part of the new cloud is drawn fresh around the current
    /// estimate when the fast likelihood average has fallen below the slow one. Every particle
    /// of the new cloud carries weight `1/N`.
    pub fn resample(&mut self) {
        let n = self.particles.len();
        if n == 0 {
            return;
        }
        let random_count = self.random_particle_count().min(n - 1);
        let keep = n - random_count;
        let uniform = 1.0 / n as f64;

        self.resample_buffer.clear();
        self.resample_buffer.reserve(n);
        let step = 1.0 / keep as f64;
        let mut target = self.core.rng.unit_open_low() * step;
        let mut i = 0;
        let mut cumulative = self.particles[0].weight;
        for _ in 0..keep {
            while cumulative < target && i < n - 1 {
                i += 1;
                cumulative += self.particles[i].weight;
            }
            let mut copy = self.particles[i];
            copy.weight = uniform;
            self.resample_buffer.push(copy);
            target += step;
        }

        if random_count > 0 {
            let center = self.compute_mmse();
            let window = self.core.init_window;
            let fresh = sample_cloud(
                &self.core.config,
                &window,
                &mut self.core.rng,
                &center,
                &window.to_covariance(),
                InitDistribution::Uniform,
                random_count,
            );
            debug!("augmented MCL injected {random_count} random particles");
            self.resample_buffer
                .extend(fresh.into_iter().map(|p| Particle { weight: uniform, ..p }));
        }

        mem::swap(&mut self.particles, &mut self.resample_buffer);
        trace!("resampled {n} particles ({keep} drawn, {random_count} injected)");
    }

    fn random_particle_count(&self) -> usize {
        if !self.core.config.augmented_mcl || self.w_slow <= 0.0 {
            return 0;
        }
        let deficit = (1.0 - self.w_fast / self.w_slow).max(0.0);
        (AMCL_INJECTION_GAIN * deficit * self.particles.len() as f64) as usize
    }

    fn resample_if_needed(&mut self) -> bool {
        let n = self.particles.len() as f64;
        let ess = self.effective_sample_size();
        if ess < self.core.config.min_eff_sample_fraction * n
            && self.n_soundings >= self.core.config.min_num_soundings
        {
            self.resample();
            self.n_soundings = 0;
            true
        } else {
            false
        }
    }

    /// Write the cloud as a particle file: the particle count, the number of states, then one
    /// `N,E,D,weight` row per particle.
    pub fn save_particles<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        writer.write_record([self.particles.len().to_string()])?;
        writer.write_record(["3".to_string()])?;
        for p in &self.particles {
            writer.write_record(
                [p.position.x, p.position.y, p.position.z, p.weight].map(|v| v.to_string()),
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Replace the cloud with the particles stored in `path`, filling unspecified states
    /// from `pose`.
    pub fn load_particles<P: AsRef<Path>>(&mut self, path: P, pose: &Pose) -> Result<()> {
        let cap = self.core.config.num_particles.min(MAX_PARTICLES);
        let cloud = read_particle_file(path.as_ref(), pose, cap)?;
        self.install(cloud);
        Ok(())
    }

    fn install(&mut self, cloud: Vec<Particle>) {
        self.resample_buffer = Vec::with_capacity(cloud.len());
        self.particles = cloud;
        self.n_soundings = 0;
        self.w_slow = 0.0;
        self.w_fast = 0.0;
        self.homer = None;
        self.last_stats = None;
        self.subcloud_nis = None;
    }

    fn submap_request_for(
        &self,
        beams: &ProjectedBeams,
        data_type: DataType,
        last: &Pose,
    ) -> Option<crate::map::SubmapRequest> {
        let bounds = PositionBounds::from_points(
            self.particles
                .iter()
                .map(|p| (p.position.x, p.position.y)),
        )?;
        let est = self.compute_mmse();
        let (mean, var) = if self.core.config.attitude_search {
            (
                est.attitude(),
                Vector3::new(
                    est.covariance.get(states::ROLL, states::ROLL),
                    est.covariance.get(states::PITCH, states::PITCH),
                    est.covariance.get(states::YAW, states::YAW),
                ),
            )
        } else {
            (last.attitude(), Vector3::zeros())
        };
        Some(
            self.core
                .submap_request(&bounds, &mean, &var, beams, data_type),
        )
    }

    fn expected_measurement_differences(
        &self,
        beams: &ProjectedBeams,
        meas: &Measurement,
        last: &Pose,
    ) -> DiffTable {
        let cfg = &self.core.config;
        let n = self.particles.len();
        let nb = beams.len();
        let per_particle = cfg.attitude_search || cfg.align_search || cfg.compass_bias_search;
        let nav_vectors = beams
            .rotated(&map_frame_attitude(meas.data_type, &last.attitude()))
            .vectors;

        let mut diffs = Vec::with_capacity(n * nb);
        let mut map_var_sum = vec![0.0; nb];
        let mut map_var_count = vec![0usize; nb];
        for p in &self.particles {
            let owned: Matrix3xX<f64>;
            let vectors = if per_particle {
                let body = rotation(&map_frame_attitude(meas.data_type, &p.heading_attitude()));
                owned = (body * rotation(&p.dvl_align)).matrix() * &beams.vectors;
                &owned
            } else {
                &nav_vectors
            };
            for (j, v) in vectors.column_iter().enumerate() {
                let range = v.norm();
                let diff = if range > 0.0 {
                    let direction: Vector3<f64> = v / range;
                    self.core.map.range_error(&p.position, &direction, range)
                } else {
                    None
                };
                diffs.push(match diff {
                    Some(e) if e.error.is_finite() => {
                        map_var_sum[j] += e.variance;
                        map_var_count[j] += 1;
                        Some(e.error)
                    }
                    _ => None,
                });
            }
        }
        let map_var = map_var_sum
            .iter()
            .zip(&map_var_count)
            .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();
        DiffTable {
            num_beams: nb,
            diffs,
            map_var,
            beam_var: beams
                .indices
                .iter()
                .map(|&k| meas.beam_variance(k))
                .collect(),
            beam_dz: nav_vectors.row(2).iter().copied().collect(),
        }
    }

    /// Compute the new weights from a difference table without touching the cloud.
    fn weigh(&self, table: &DiffTable) -> std::result::Result<StagedUpdate, Rejection> {
        let cfg = &self.core.config;
        let mode = cfg.weighting_mode;
        let n = self.particles.len();
        let nb = table.num_beams;

        let mut use_beam: Vec<bool> = (0..nb)
            .map(|j| (0..n).all(|i| table.get(i, j).is_some()))
            .collect();
        if !mode.is_subcloud() {
            if let Some(i) = (0..n).find(|&i| (0..nb).all(|j| table.get(i, j).is_none())) {
                trace!("particle {i} has no beam resolving on the map");
                return Err(Rejection::HypothesisWithoutBeams);
            }
        }
        if mode == WeightingMode::ForcedSubcloud {
            use_beam.fill(false);
        }

        let mut weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let mut staged = StagedUpdate {
            weights: Vec::new(),
            depth_bias: None,
            nis_windows: None,
            soundings: 0,
            mean_likelihood: None,
            stats: UpdateStats::default(),
        };

        let no_common_beam = use_beam.iter().all(|&u| !u);
        if mode == WeightingMode::ForcedSubcloud
            || (mode == WeightingMode::Subcloud && no_common_beam)
        {
            let windows = self.weigh_subclouds(table, &use_beam, &mut weights, &mut staged);
            staged.nis_windows = Some(windows);
        }

        let common: Vec<usize> = (0..nb).filter(|&j| use_beam[j]).collect();
        if common.is_empty()
            && mode == WeightingMode::CrossBeam
            && !cfg.attitude_search
            && !cfg.align_search
            && !cfg.psi_berg_search
        {
            self.weigh_cross_beams(table, &mut weights, &mut staged);
        }
        if !common.is_empty() {
            self.weigh_common_beams(table, &common, &mut weights, &mut staged)?;
        }

        if staged.stats.beams_used() == 0 {
            return Err(Rejection::NoUsableBeams);
        }
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 || weights.iter().any(|w| !w.is_finite()) {
            return Err(Rejection::DegenerateWeights);
        }
        for w in &mut weights {
            *w /= total;
        }
        staged.weights = weights;
        Ok(staged)
    }

    /// Weight each beam that is not valid for every particle using only the particles for
    /// which it resolved, scaling the rest so the subcloud's total weight is preserved in
    /// expectation.
    fn weigh_subclouds(
        &self,
        table: &DiffTable,
        use_beam: &[bool],
        weights: &mut [f64],
        staged: &mut StagedUpdate,
    ) -> Vec<NisWindow> {
        let n = self.particles.len();
        let mmv = self.core.config.mod_map_var;
        let mut nis_sum = vec![0.0; n];
        let mut nis_count = vec![0usize; n];

        for j in (0..table.num_beams).filter(|&j| !use_beam[j]) {
            let members: Vec<usize> = (0..n).filter(|&i| table.get(i, j).is_some()).collect();
            let member_weight: f64 = members.iter().map(|&i| self.particles[i].weight).sum();
            if (members.len() as f64) < MIN_SUBCLOUD_FRACTION * n as f64
                || member_weight < MIN_SUBCLOUD_WEIGHT
            {
                trace!(
                    "beam {j}: subcloud of {} particles (weight {member_weight:.3e}) skipped",
                    members.len()
                );
                continue;
            }
            let total_var = (table.map_var[j] + table.beam_var[j]).max(MIN_VARIANCE);

            let (mut mean, mut mean_sq, mut sum_sq_w) = (0.0, 0.0, 0.0);
            for &i in &members {
                let w = self.particles[i].weight / member_weight;
                let d = table.get(i, j).unwrap_or(0.0);
                mean += w * d;
                mean_sq += w * d * d;
                sum_sq_w += w * w;
            }
            let innovation_var = (mean_sq - mean * mean).max(0.0);
            let delta_rms_sq = mean_sq - mean * mean - (1.0 - sum_sq_w) * mmv;
            let alpha = if delta_rms_sq <= 0.0 {
                0.0
            } else {
                delta_rms_sq / (delta_rms_sq + 2.0 * mmv)
            };
            trace!(
                "beam {j}: subcloud mean diff {mean:.3}, delta_rms² {delta_rms_sq:.4}, alpha {alpha:.3}"
            );

            let mut in_subcloud = vec![false; n];
            let (mut before, mut after) = (0.0, 0.0);
            for &i in &members {
                let d = table.get(i, j).unwrap_or(0.0);
                let update = (-0.5 * d * d / total_var).exp().powf(alpha);
                before += self.particles[i].weight;
                after += self.particles[i].weight * update;
                weights[i] *= update;
                in_subcloud[i] = true;
                nis_sum[i] += d * d / (total_var + innovation_var);
                nis_count[i] += 1;
            }
            let scale = after / before;
            for i in (0..n).filter(|&i| !in_subcloud[i]) {
                weights[i] *= scale;
            }
            staged.stats.subcloud_beams += 1;
            staged.soundings += 1;
        }

        self.particles
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut window = p.nis_window;
                if nis_count[i] > 0 {
                    window.push(nis_sum[i] / nis_count[i] as f64);
                }
                window
            })
            .collect()
    }

    /// Compare each particle against its own first few valid beams when no beam is common to
    /// the whole cloud.
    fn weigh_cross_beams(&self, table: &DiffTable, weights: &mut [f64], staged: &mut StagedUpdate) {
        let n = self.particles.len();
        let max_comparisons = self.core.config.max_cross_beam_comparisons.max(1);
        let own_beams: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..table.num_beams)
                    .filter(|&j| table.get(i, j).is_some())
                    .take(max_comparisons)
                    .collect()
            })
            .collect();
        let min_beams = own_beams.iter().map(Vec::len).min().unwrap_or(0);
        if min_beams == 0 {
            return;
        }
        let map_var = table.map_var.iter().sum::<f64>() / table.num_beams as f64;
        let max_sensor_var = table.beam_var.iter().copied().fold(0.0, f64::max);
        let sum_sq_w: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();

        for k in 0..min_beams {
            let (mut mean, mut mean_sq) = (0.0, 0.0);
            for (i, p) in self.particles.iter().enumerate() {
                let depth = p.position.z + table.beam_dz[own_beams[i][k]];
                mean += p.weight * depth;
                mean_sq += p.weight * depth * depth;
            }
            let delta_rms_sq = mean_sq - mean * mean - (1.0 - sum_sq_w) * map_var;
            let alpha = if delta_rms_sq <= 0.0 {
                0.0
            } else {
                delta_rms_sq / (delta_rms_sq + map_var + max_sensor_var)
            };
            for i in 0..n {
                let j = own_beams[i][k];
                let d = table.get(i, j).unwrap_or(0.0);
                let total_var = (table.map_var[j] + table.beam_var[j]).max(MIN_VARIANCE);
                weights[i] *= (-0.5 * d * d / total_var).exp().powf(alpha);
            }
        }
        staged.stats.cross_beams = min_beams;
        staged.soundings += min_beams;
    }

    /// Gaussian likelihood over the beams valid for every particle.
    fn weigh_common_beams(
        &self,
        table: &DiffTable,
        common: &[usize],
        weights: &mut [f64],
        staged: &mut StagedUpdate,
    ) -> std::result::Result<(), Rejection> {
        let cfg = &self.core.config;
        let mmv = cfg.mod_map_var;
        let mut total_var = Vec::with_capacity(common.len());
        for &j in common {
            let bv = table.beam_var[j];
            let v = if cfg.weighting_mode.is_modified() {
                let (mut e1, mut e2) = (0.0, 0.0);
                for (i, p) in self.particles.iter().enumerate() {
                    let d = table.get(i, j).unwrap_or(0.0);
                    e1 += p.weight * d;
                    e2 += p.weight * d * d;
                }
                let map_variance = e2 - e1 * e1;
                let base = (table.map_var[j] - mmv).max(0.0);
                let map_info_cov = if map_variance > mmv {
                    map_variance - mmv
                } else {
                    MIN_MAP_INFO_COV
                };
                let v = ((bv + base + mmv) * map_variance + (base + bv) * mmv) / map_info_cov;
                staged.stats.alphas.push((base + bv + mmv) / v);
                v
            } else {
                table.map_var[j] + bv
            };
            total_var.push(v.max(MIN_VARIANCE));
        }

        let n = self.particles.len();
        let mut likelihood = vec![0.0; n];
        let mut depth_bias = cfg.contour_matching.then(|| vec![0.0; n]);
        for i in 0..n {
            let (mut sse, mut swe, mut sw) = (0.0, 0.0, 0.0);
            for (k, &j) in common.iter().enumerate() {
                let d = table.get(i, j).unwrap_or(0.0);
                sse += d * d / total_var[k];
                swe += d / total_var[k];
                sw += 1.0 / total_var[k];
            }
            likelihood[i] = match depth_bias.as_mut() {
                Some(bias) => {
                    bias[i] = swe / sw;
                    (-0.5 * (sse - bias[i] * swe)).exp()
                }
                None => (-0.5 * sse).exp(),
            };
        }

        let sum_weights: f64 = weights.iter().zip(&likelihood).map(|(w, l)| w * l).sum();
        let nis = self.innovation_nis(table, common);
        staged.stats.common_beams = common.len();
        staged.stats.nis = nis;
        staged.stats.sum_weights = Some(sum_weights);
        staged.soundings += common.len();
        staged.mean_likelihood = Some(sum_weights);

        if nis.is_some_and(|v| v >= cfg.nis_gate) {
            debug!("standard weighting skipped: NIS {nis:?} at or above the gate");
            return Ok(());
        }
        if sum_weights <= 0.0 || !sum_weights.is_finite() {
            debug!("likelihood sum {sum_weights:.3e} leaves no usable weights");
            return Err(Rejection::DegenerateWeights);
        }
        for (w, l) in weights.iter_mut().zip(&likelihood) {
            *w *= l / sum_weights;
        }
        staged.depth_bias = depth_bias;
        staged.stats.weights_updated = true;
        Ok(())
    }

    /// Per-beam normalized innovation `μᵀ (C + R)⁻¹ μ / m` of the cloud's expected
    /// measurement differences over the `m` common beams.
    fn innovation_nis(&self, table: &DiffTable, common: &[usize]) -> Option<f64> {
        let m = common.len();
        let mut mean = DMatrix::<f64>::zeros(m, 1);
        for (i, p) in self.particles.iter().enumerate() {
            for (k, &j) in common.iter().enumerate() {
                mean[(k, 0)] += p.weight * table.get(i, j)?;
            }
        }
        let mut s = DMatrix::<f64>::zeros(m, m);
        for (i, p) in self.particles.iter().enumerate() {
            for (a, &ja) in common.iter().enumerate() {
                let da = table.get(i, ja)? - mean[(a, 0)];
                for (b, &jb) in common.iter().enumerate().skip(a) {
                    let db = table.get(i, jb)? - mean[(b, 0)];
                    s[(a, b)] += p.weight * da * db;
                }
            }
        }
        for a in 0..m {
            for b in 0..a {
                s[(a, b)] = s[(b, a)];
            }
            let j = common[a];
            s[(a, a)] += (table.beam_var[j] + table.map_var[j]).max(MIN_VARIANCE);
        }
        let x = robust_spd_solve(&s, &mean)?;
        let nis = mean.dot(&x) / m as f64;
        nis.is_finite().then_some(nis)
    }

    fn commit(&mut self, update: StagedUpdate, time: f64) {
        let StagedUpdate {
            weights,
            depth_bias,
            nis_windows,
            soundings,
            mean_likelihood,
            mut stats,
        } = update;
        for (p, w) in self.particles.iter_mut().zip(weights) {
            p.weight = w;
        }
        if let Some(bias) = depth_bias {
            for (p, b) in self.particles.iter_mut().zip(bias) {
                p.position.z += b;
            }
        }
        if let Some(windows) = nis_windows {
            for (p, w) in self.particles.iter_mut().zip(windows) {
                p.nis_window = w;
            }
            self.subcloud_nis = Some(
                self.particles
                    .iter()
                    .map(|p| p.weight * p.nis_window.mean().unwrap_or(0.0))
                    .sum(),
            );
        }
        if let Some(nis) = stats.nis {
            self.core.nis.push(nis);
        }
        if let Some(avg) = mean_likelihood {
            self.w_slow += AMCL_ALPHA_SLOW * (avg - self.w_slow);
            self.w_fast += AMCL_ALPHA_FAST * (avg - self.w_fast);
        }
        self.n_soundings += soundings;
        stats.time = time;
        stats.resampled = self.resample_if_needed();
        stats.effective_sample_size = self.effective_sample_size();
        self.last_stats = Some(stats);
    }

    /// Estimate a homing beacon's position from the relative offset in beam 0.
    ///
    /// Every particle projects the offset, perturbed by the beacon's range error, from its own
    /// pose. The weighted mean and covariance of those positions become the estimate; the
    /// particle weights are not changed.
    fn homer_meas_update(&mut self, meas: &Measurement) -> std::result::Result<(), Rejection> {
        let relative = match (
            meas.along_track.first(),
            meas.cross_track.first(),
            meas.altitudes.first(),
        ) {
            (Some(&a), Some(&c), Some(&z)) if a.is_finite() && c.is_finite() && z.is_finite() => {
                Vector3::new(a, c, z)
            }
            _ => return Err(Rejection::NoValidBeams),
        };
        let sigma = relative.map(|v| (v * HOMER_RANGE_PERCENT_ERROR / 100.0).abs());
        let rng = &mut self.core.rng;
        let beacons: Vec<Vector2<f64>> = self
            .particles
            .iter()
            .map(|p| {
                let noisy = Vector3::new(
                    relative.x + rng.gaussian_zero_mean(sigma.x),
                    relative.y + rng.gaussian_zero_mean(sigma.y),
                    relative.z + rng.gaussian_zero_mean(sigma.z),
                );
                let inertial = rotation(&p.attitude) * noisy;
                Vector2::new(p.position.x + inertial.x, p.position.y + inertial.y)
            })
            .collect();

        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if total.is_nan() || total <= 0.0 {
            return Err(Rejection::DegenerateWeights);
        }
        let mut mean = Vector2::zeros();
        for (p, b) in self.particles.iter().zip(&beacons) {
            mean += p.weight / total * b;
        }
        let mut cov = [0.0; 3];
        for (p, b) in self.particles.iter().zip(&beacons) {
            let w = p.weight / total;
            let d = b - mean;
            cov[0] += w * d.x * d.x;
            cov[1] += w * d.y * d.y;
            cov[2] += w * d.x * d.y;
        }
        debug!(
            "homer at ({:.2}, {:.2}) var ({:.2}, {:.2})",
            mean.x, mean.y, cov[0], cov[1]
        );
        self.homer = Some(HomerEstimate {
            time: meas.time,
            north: mean.x,
            east: mean.y,
            covariance: cov,
        });
        Ok(())
    }
}

impl TerrainFilter for ParticleFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Particle
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
        distribution: InitDistribution,
    ) -> Result<()> {
        let cloud = match self.core.config.particle_file.clone() {
            Some(path) => read_particle_file(
                &path,
                pose,
                self.core.config.num_particles.min(MAX_PARTICLES),
            )?,
            None => {
                let window = self.core.init_window;
                let n = self.core.config.num_particles.min(MAX_PARTICLES);
                sample_cloud(
                    &self.core.config,
                    &window,
                    &mut self.core.rng,
                    pose,
                    covariance,
                    distribution,
                    n,
                )
            }
        };
        info!(
            "initialized {} particles around ({:.2}, {:.2}, {:.2}) with {:?} spread",
            cloud.len(),
            pose.x,
            pose.y,
            pose.z,
            distribution
        );
        self.install(cloud);
        Ok(())
    }

    fn motion_update(&mut self, pose: &Pose) -> Result<()> {
        let step = self.core.begin_motion(pose)?;
        let dvl_mount = self
            .core
            .vehicle
            .sensor_for(DataType::Dvl)
            .map(|s| Vector3::from(s.mount_attitude))
            .unwrap_or_else(Vector3::zeros);
        let core = &mut self.core;
        for particle in &mut self.particles {
            propagate(
                particle,
                &step,
                &core.config,
                &dvl_mount,
                &core.water_current,
                &mut core.rng,
            );
        }
        core.finish_motion(&step);
        Ok(())
    }

    fn incorporate(&mut self, meas: &Measurement) -> std::result::Result<(), Rejection> {
        let last = self.core.last_pose.ok_or(Rejection::NotInitialized)?;
        if self.particles.is_empty() {
            return Err(Rejection::NotInitialized);
        }
        if meas.data_type == DataType::Homer {
            return self.homer_meas_update(meas);
        }
        let beams = self.core.project_beams(meas)?;
        let request = self
            .submap_request_for(&beams, meas.data_type, &last)
            .ok_or(Rejection::NotInitialized)?;
        self.core.load_submap(&request)?;
        let table = self.expected_measurement_differences(&beams, meas, &last);
        let update = self.weigh(&table)?;
        self.commit(update, meas.time);
        Ok(())
    }

    fn compute_mle(&self) -> Pose {
        let base = self.core.last_pose.unwrap_or_default();
        self.particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .map(|p| p.to_pose(&base))
            .unwrap_or(base)
    }

    fn compute_mmse(&self) -> Pose {
        let base = self.core.last_pose.unwrap_or_default();
        if self.particles.is_empty() {
            return base;
        }
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        let uniform = 1.0 / self.particles.len() as f64;
        let weight = |p: &Particle| {
            if total > 0.0 && total.is_finite() {
                p.weight / total
            } else {
                uniform
            }
        };
        let reference_yaw = base.psi;
        let state = |p: &Particle| {
            [
                p.position.x,
                p.position.y,
                p.position.z,
                p.attitude.x,
                p.attitude.y,
                wrap_to_pi(p.attitude.z - reference_yaw),
                p.gyro_bias[0],
                p.gyro_bias[1],
                p.psi_berg,
            ]
        };

        let mut mean = [0.0; states::COUNT];
        for p in &self.particles {
            let w = weight(p);
            for (m, s) in mean.iter_mut().zip(state(p)) {
                *m += w * s;
            }
        }
        let mut cov = DMatrix::<f64>::zeros(states::COUNT, states::COUNT);
        for p in &self.particles {
            let w = weight(p);
            let s = state(p);
            for a in 0..states::COUNT {
                let da = s[a] - mean[a];
                for b in 0..=a {
                    cov[(a, b)] += w * da * (s[b] - mean[b]);
                }
            }
        }
        for a in 0..states::COUNT {
            for b in 0..a {
                cov[(b, a)] = cov[(a, b)];
            }
        }

        Pose {
            x: mean[states::NORTH],
            y: mean[states::EAST],
            z: mean[states::DOWN],
            phi: mean[states::ROLL],
            theta: mean[states::PITCH],
            psi: wrap_to_pi(reference_yaw + mean[states::YAW]),
            psi_berg: mean[states::PSI_BERG],
            covariance: PackedCovariance::from_matrix(&cov),
            ..base
        }
    }

    /// Converged when the Kullback-Leibler divergence of the cloud from a Gaussian with the
    /// cloud's horizontal mean and covariance drops below one.
    ///
    /// A cloud with singular horizontal covariance has collapsed onto a line or a point and
    /// counts as converged.
    fn check_convergence(&mut self) -> bool {
        let est = self.compute_mmse();
        let cov = Matrix2::new(
            est.covariance.get(states::NORTH, states::NORTH),
            est.covariance.get(states::NORTH, states::EAST),
            est.covariance.get(states::EAST, states::NORTH),
            est.covariance.get(states::EAST, states::EAST),
        );
        let det = (2.0 * std::f64::consts::PI * cov).determinant();
        let converged = match cov.try_inverse() {
            Some(inverse) if det > 0.0 => {
                let eta = det.powf(-0.5);
                let mut kl = 0.0;
                for p in &self.particles {
                    let dx = Vector2::new(p.position.x - est.x, p.position.y - est.y);
                    let q = eta * (-0.5 * dx.dot(&(inverse * dx))).exp();
                    let ratio = p.weight / q;
                    if ratio > 1e-50 && ratio < 1e50 {
                        kl += p.weight * ratio.ln();
                    }
                }
                trace!("particle cloud KL divergence {kl:.4}");
                kl < 1.0
            }
            _ => true,
        };
        self.core.converged = converged;
        converged
    }

    /// Re-weight particles by how well their roll and pitch agree with a measured attitude.
    fn attitude_meas_update(&mut self, pose: &Pose) {
        if !self.core.config.attitude_search || self.particles.is_empty() {
            return;
        }
        let noise = &self.core.config.motion_noise;
        let var = |measured: f64, fallback: f64| {
            if measured > 0.0 {
                measured
            } else {
                (fallback * fallback).max(MIN_VARIANCE)
            }
        };
        let roll_var = var(pose.covariance.get(states::ROLL, states::ROLL), noise.dphi_stddev);
        let pitch_var = var(
            pose.covariance.get(states::PITCH, states::PITCH),
            noise.dtheta_stddev,
        );
        let weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| {
                let dr = p.attitude.x - pose.phi;
                let dp = p.attitude.y - pose.theta;
                p.weight * (-0.5 * (dr * dr / roll_var + dp * dp / pitch_var)).exp()
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            for (p, w) in self.particles.iter_mut().zip(weights) {
                p.weight = w / total;
            }
            self.resample_if_needed();
        } else {
            warn!("attitude update would zero every particle weight; ignored");
        }
    }

    fn subcloud_nis(&self) -> Option<f64> {
        self.subcloud_nis
    }
}

fn draw(rng: &mut RandomVariate, distribution: InitDistribution, width: f64) -> f64 {
    match distribution {
        InitDistribution::Uniform => rng.uniform_zero_mean(width),
        InitDistribution::Gaussian => rng.gaussian_zero_mean(width),
    }
}

/// Draw `n` particles around `pose`.
///
/// Position is drawn jointly through a square root of its covariance block, skipping states
/// with zero variance. Depth is left unperturbed under contour matching, and attitude, gyro
/// bias, compass bias, alignment, iceberg heading and terrain drift are only spread when
/// searched.
fn sample_cloud(
    config: &FilterConfig,
    window: &InitWindow,
    rng: &mut RandomVariate,
    pose: &Pose,
    covariance: &PackedCovariance,
    distribution: InitDistribution,
    n: usize,
) -> Vec<Particle> {
    let mut spread = vec![states::NORTH, states::EAST];
    if !config.contour_matching {
        spread.push(states::DOWN);
    }
    spread.retain(|&k| covariance.get(k, k) > 0.0);
    let m = spread.len();
    let root = (m > 0).then(|| {
        matrix_square_root(&DMatrix::from_fn(m, m, |a, b| {
            covariance.get(spread[a], spread[b])
        }))
    });
    let sd = |k: usize| covariance.get(k, k).max(0.0).sqrt();
    let weight = if n > 0 { 1.0 / n as f64 } else { 0.0 };

    (0..n)
        .map(|_| {
            let mut p = Particle::at(pose, weight);
            if let Some(root) = &root {
                let offset = match distribution {
                    InitDistribution::Gaussian => {
                        rng.correlated_gaussian(&DVector::zeros(m), root)
                    }
                    InitDistribution::Uniform => {
                        root * DVector::from_fn(m, |_, _| rng.uniform_zero_mean(1.0))
                    }
                };
                for (a, &k) in spread.iter().enumerate() {
                    p.position[k] += offset[a];
                }
            }
            if config.attitude_search {
                p.attitude.x += draw(rng, distribution, sd(states::ROLL));
                p.attitude.y += draw(rng, distribution, sd(states::PITCH));
                p.attitude.z += draw(rng, distribution, sd(states::YAW));
            }
            if config.gyro_bias_search {
                p.gyro_bias[0] += draw(rng, distribution, sd(states::GYRO_BIAS_X));
                p.gyro_bias[1] += draw(rng, distribution, sd(states::GYRO_BIAS_Y));
            }
            if config.psi_berg_search {
                p.psi_berg += draw(rng, distribution, sd(states::PSI_BERG));
            }
            if config.moving_terrain {
                let s = window.terrain_drift_var.max(0.0).sqrt();
                p.terrain_drift = Vector3::new(
                    rng.gaussian_zero_mean(s),
                    rng.gaussian_zero_mean(s),
                    rng.gaussian_zero_mean(s),
                );
            }
            if config.compass_bias_search {
                p.compass_bias = rng.uniform_zero_mean(window.compass_bias_var.max(0.0).sqrt());
            }
            if config.align_search {
                let s = window.align_var.max(0.0).sqrt();
                p.dvl_align = Vector3::new(
                    rng.uniform_zero_mean(s),
                    rng.uniform_zero_mean(s),
                    rng.uniform_zero_mean(s),
                );
            }
            p
        })
        .collect()
}

/// Read a particle file: the particle count, the number of states per row, then one
/// `N,E[,D[,psi_berg_offset]]` row per particle. At most `cap` particles are kept.
fn read_particle_file(path: &Path, pose: &Pose, cap: usize) -> Result<Vec<Particle>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut records = reader.records();
    let mut header = |what: &str| -> Result<usize> {
        let record = records
            .next()
            .ok_or_else(|| TrnError::ParticleFile(format!("missing {what}")))??;
        record
            .get(0)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| TrnError::ParticleFile(format!("unreadable {what}")))
    };
    let count = header("particle count")?;
    let n_states = header("state count")?;
    if count == 0 {
        return Err(TrnError::ParticleFile("particle count is zero".to_string()));
    }
    if !(2..=4).contains(&n_states) {
        return Err(TrnError::ParticleFile(format!(
            "expected 2 to 4 states per particle, got {n_states}"
        )));
    }
    if count > cap {
        warn!("particle file holds {count} particles; keeping the first {cap}");
    }
    let count = count.min(cap);
    let weight = 1.0 / count as f64;

    let mut cloud = Vec::with_capacity(count);
    for (row, record) in records.take(count).enumerate() {
        let record = record?;
        let field = |k: usize| -> Result<f64> {
            record
                .get(k)
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| {
                    TrnError::ParticleFile(format!(
                        "row {}: field {} is not a number",
                        row + 3,
                        k + 1
                    ))
                })
        };
        let mut p = Particle::at(pose, weight);
        p.position.x = field(0)?;
        p.position.y = field(1)?;
        if n_states >= 3 {
            p.position.z = field(2)?;
        }
        if n_states >= 4 {
            p.psi_berg = pose.psi - field(3)?;
        }
        cloud.push(p);
    }
    if cloud.len() < count {
        return Err(TrnError::ParticleFile(format!(
            "expected {count} particles, found {}",
            cloud.len()
        )));
    }
    debug!("read {} particles from {}", cloud.len(), path.display());
    Ok(cloud)
}

/// Move one particle by the dead-reckoned displacement of `step`.
///
/// A zero-length step injects no noise.
fn propagate(
    p: &mut Particle,
    step: &MotionStep,
    config: &FilterConfig,
    dvl_mount: &Vector3<f64>,
    water_current: &Vector3<f64>,
    rng: &mut RandomVariate,
) {
    let noise = &config.motion_noise;
    let delta = &step.delta;
    let last = &step.last;
    let dt = step.dt;
    let scale = if dt > 0.0 { 1.0 } else { 0.0 };

    let mut disp = Vector3::new(0.0, 0.0, delta.z);
    if !config.contour_matching {
        disp.z += rng.gaussian_zero_mean(noise.dz_stddev * scale);
    }

    if step.use_dvl {
        let mut v = last.velocity();
        if config.dvl_error_search && last.bottom_lock {
            v = v * (1.0 + p.dvl_scale_factor) + p.dvl_bias;
        }
        for k in 0..3 {
            let s = step.velocity_sigma[k] * scale;
            v[k] += if last.bottom_lock {
                rng.gaussian_zero_mean(s)
            } else {
                rng.uniform_zero_mean(s)
            };
        }
        let to_nav = rotation(&p.heading_attitude());
        let mut v_nav = to_nav * (rotation(&(dvl_mount + p.dvl_align)) * v);
        if !last.bottom_lock {
            v_nav -= water_current;
        }
        disp.x = v_nav.x * dt;
        disp.y = v_nav.y * dt;
        if config.use_accel {
            let a = to_nav * last.acceleration();
            let s = 2.0 * noise.vel_stddev * dt * dt;
            disp.x += 0.5 * a.x * dt * dt + rng.gaussian_zero_mean(s);
            disp.y += 0.5 * a.y * dt * dt + rng.gaussian_zero_mean(s);
        }
    } else {
        disp.x = delta.x + rng.gaussian_zero_mean(step.drift_sigma * scale);
        disp.y = delta.y + rng.gaussian_zero_mean(step.drift_sigma * scale);
    }

    if config.psi_berg_search {
        let (s, c) = p.psi_berg.sin_cos();
        let (dx, dy) = (disp.x, disp.y);
        disp.x = c * dx + s * dy;
        disp.y = -s * dx + c * dy;
        p.psi_berg += rng.gaussian_zero_mean(noise.psi_berg_stddev * scale);
    }

    if config.moving_terrain {
        let terrain_disp = Vector3::new(dt * p.terrain_drift.x, dt * p.terrain_drift.y, 0.0);
        let map_yaw = last.psi - p.attitude.z;
        let to_inertial = Rotation3::from_euler_angles(0.0, 0.0, map_yaw);
        let shifted = to_inertial.inverse() * p.position - terrain_disp + disp;
        let to_terrain = Rotation3::from_euler_angles(0.0, 0.0, map_yaw + dt * p.terrain_drift.z);
        p.position = to_terrain * shifted;
        p.attitude.z -= dt * p.terrain_drift.z;
        let s = noise.terrain_drift_stddev * scale;
        p.terrain_drift += Vector3::new(
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
        );
    } else {
        p.position += disp;
    }

    if config.gyro_bias_search {
        p.attitude.z += heading_rate(last, &p.gyro_bias) * dt;
        p.gyro_bias[0] += rng.gaussian_zero_mean(step.gyro_sigma);
        p.gyro_bias[1] += rng.gaussian_zero_mean(step.gyro_sigma);
    } else {
        p.attitude.z += delta.psi;
    }
    p.attitude.x += delta.phi;
    p.attitude.y += delta.theta;

    if config.attitude_search {
        p.attitude.x += rng.gaussian_zero_mean(noise.dphi_stddev * scale);
        p.attitude.y += rng.gaussian_zero_mean(noise.dtheta_stddev * scale);
        if !config.gyro_bias_search {
            p.attitude.z += rng.gaussian_zero_mean(noise.dpsi_stddev * scale);
        }
    }
    p.attitude.z = wrap_to_pi(p.attitude.z);

    if config.align_search {
        let s = noise.align_stddev * scale;
        p.dvl_align += Vector3::new(
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
        );
    }
    if config.dvl_error_search {
        p.dvl_scale_factor += rng.gaussian_zero_mean(noise.dvl_sf_stddev * scale);
        let s = noise.dvl_bias_stddev * scale;
        p.dvl_bias += Vector3::new(
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
            rng.gaussian_zero_mean(s),
        );
    }
}
