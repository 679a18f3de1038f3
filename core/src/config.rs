//! Filter, navigator and vehicle configuration.
//!
//! A [`FilterConfig`] is built once when a filter is created and never changes afterwards.
//! Every behavior variant of the filters (attitude search, gyro-bias search, weighting mode,
//! initial distribution, ...) is selected by a field here. Configurations can be written to and
//! read from JSON, YAML or TOML files; the format is chosen from the file extension.

use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrnError};
use crate::{DataType, PackedCovariance, states};

/// Hard upper bound on the particle count.
pub const MAX_PARTICLES: usize = 50_000;

/// Which estimator implements the filter contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    #[default]
    Particle,
    Extended,
    SigmaPoint,
}

/// Particle weighting strategy used when beams are not valid for every particle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMode {
    /// Plain Gaussian likelihood over the beams common to all particles.
    #[default]
    None,
    /// Modified weighting that separates map information from sensor variance.
    Normalized,
    /// Modified weighting, falling back to cross-beam comparison.
    CrossBeam,
    /// Modified weighting, falling back to subcloud comparison.
    Subcloud,
    /// Always use subcloud comparison, even when common beams exist.
    ForcedSubcloud,
}

impl WeightingMode {
    pub fn is_modified(&self) -> bool {
        !matches!(self, WeightingMode::None)
    }

    pub fn is_subcloud(&self) -> bool {
        matches!(self, WeightingMode::Subcloud | WeightingMode::ForcedSubcloud)
    }
}

/// Shape of the spread drawn around the initial pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitDistribution {
    #[default]
    Uniform,
    Gaussian,
}

/// Initial uncertainty used when (re)initializing a filter with low information.
///
/// All values are variances (m² or rad²).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitWindow {
    pub north_var: f64,
    pub east_var: f64,
    pub depth_var: f64,
    pub roll_var: f64,
    pub pitch_var: f64,
    pub yaw_var: f64,
    pub gyro_bias_var: f64,
    pub psi_berg_var: f64,
    pub compass_bias_var: f64,
    /// DVL alignment error, per axis.
    pub align_var: f64,
    /// Terrain drift velocity ((m/s)²), used by the moving-terrain model.
    pub terrain_drift_var: f64,
}

impl Default for InitWindow {
    fn default() -> Self {
        InitWindow {
            north_var: 100.0,
            east_var: 100.0,
            depth_var: 4.0,
            roll_var: 2.0_f64.to_radians().powi(2),
            pitch_var: 2.0_f64.to_radians().powi(2),
            yaw_var: 5.0_f64.to_radians().powi(2),
            gyro_bias_var: 1e-6,
            psi_berg_var: 5.0_f64.to_radians().powi(2),
            compass_bias_var: 2.0_f64.to_radians().powi(2),
            align_var: 1.0_f64.to_radians().powi(2),
            terrain_drift_var: 0.01,
        }
    }
}

impl InitWindow {
    /// Expand the window into a packed covariance with only diagonal terms set.
    pub fn to_covariance(&self) -> PackedCovariance {
        let mut cov = PackedCovariance::default();
        cov.set(states::NORTH, states::NORTH, self.north_var);
        cov.set(states::EAST, states::EAST, self.east_var);
        cov.set(states::DOWN, states::DOWN, self.depth_var);
        cov.set(states::ROLL, states::ROLL, self.roll_var);
        cov.set(states::PITCH, states::PITCH, self.pitch_var);
        cov.set(states::YAW, states::YAW, self.yaw_var);
        cov.set(states::GYRO_BIAS_X, states::GYRO_BIAS_X, self.gyro_bias_var);
        cov.set(states::GYRO_BIAS_Y, states::GYRO_BIAS_Y, self.gyro_bias_var);
        cov.set(states::PSI_BERG, states::PSI_BERG, self.psi_berg_var);
        cov
    }
}

/// Process noise used by the motion models.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionNoise {
    /// Bottom-track velocity error, percent of speed.
    pub vel_per_error: f64,
    /// Water-track velocity error, percent of speed.
    pub water_vel_per_error: f64,
    /// Constant velocity noise floor (m/s).
    pub vel_stddev: f64,
    /// Depth noise per motion step (m).
    pub dz_stddev: f64,
    /// Scale applied to the CEP-derived position sigma.
    pub drift_multiplier: f64,
    pub dphi_stddev: f64,
    pub dtheta_stddev: f64,
    pub dpsi_stddev: f64,
    /// Gyro bias random walk (rad/s per step).
    pub gyro_bias_stddev: f64,
    /// Gyro bias instability used to bound the integrated heading noise (rad/s).
    pub dgbias_error: f64,
    pub psi_berg_stddev: f64,
    pub align_stddev: f64,
    pub dvl_bias_stddev: f64,
    pub dvl_sf_stddev: f64,
    /// Terrain drift rate noise (m/s).
    pub terrain_drift_stddev: f64,
}

impl Default for MotionNoise {
    fn default() -> Self {
        MotionNoise {
            vel_per_error: 4.0,
            water_vel_per_error: 15.0,
            vel_stddev: 0.02,
            dz_stddev: 0.02,
            drift_multiplier: 1.0,
            dphi_stddev: 0.1_f64.to_radians(),
            dtheta_stddev: 0.1_f64.to_radians(),
            dpsi_stddev: 0.5_f64.to_radians(),
            gyro_bias_stddev: 1e-6,
            dgbias_error: 5e-6,
            psi_berg_stddev: 0.05_f64.to_radians(),
            align_stddev: 0.01_f64.to_radians(),
            dvl_bias_stddev: 1e-4,
            dvl_sf_stddev: 1e-4,
            terrain_drift_stddev: 0.01,
        }
    }
}

/// Scaled unscented transform parameters and sigma-point filter options.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaPointConfig {
    pub alpha: f64,
    pub beta: f64,
    pub kappa: f64,
    /// Carry process and measurement noise as augmented states.
    pub augment_noise: bool,
    /// Drop beams that hit a map hole instead of rejecting the measurement.
    pub use_nan_region: bool,
}

impl Default for SigmaPointConfig {
    fn default() -> Self {
        SigmaPointConfig {
            alpha: 1e-3,
            beta: 2.0,
            kappa: 0.0,
            augment_noise: false,
            use_nan_region: false,
        }
    }
}

/// Thresholds used by [`crate::navigator::TerrainNavigator`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigatorConfig {
    /// Maximum plausible DVL velocity component (m/s).
    pub max_vel: f64,
    /// Maximum plausible acceleration while in bottom lock (m/s²).
    pub max_accel: f64,
    pub min_range: f64,
    pub max_range: f64,
    /// Maximum range rate between consecutive valid DVL pings (m/s).
    pub max_drdt: f64,
    /// Buffered measurements further than this from a nav sample are dropped (s).
    pub max_interp_time: f64,
    pub max_meas_outage: f64,
    pub max_vel_outage: f64,
    /// Windowed NIS above this triggers a reinitialization.
    pub max_nis: f64,
    /// Grow the initialization window while waiting to initialize.
    pub increase_window: bool,
    /// Allow initialization while GPS is valid.
    pub ignore_gps: bool,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        NavigatorConfig {
            max_vel: 5.0,
            max_accel: 1.0,
            min_range: 1.0,
            max_range: 200.0,
            max_drdt: 20.0,
            max_interp_time: 2.0,
            max_meas_outage: 300.0,
            max_vel_outage: 300.0,
            max_nis: 1.4,
            increase_window: true,
            ignore_gps: false,
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_num_particles() -> usize {
    8000
}

fn default_nis_gate() -> f64 {
    20.0 * 1.4
}

fn default_mod_map_var() -> f64 {
    0.01
}

/// Where and how verbosely the library's log records are written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LevelFilter,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LevelFilter::Info,
            file: None,
        }
    }
}

/// Immutable configuration shared by all filter variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    /// Number of particles (particle filter only), capped at [`MAX_PARTICLES`].
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    pub weighting_mode: WeightingMode,
    pub init_distribution: InitDistribution,
    pub init_window: InitWindow,
    /// Load the initial particle cloud from this file instead of sampling it.
    pub particle_file: Option<PathBuf>,

    pub attitude_search: bool,
    pub gyro_bias_search: bool,
    pub compass_bias_search: bool,
    pub align_search: bool,
    pub dvl_error_search: bool,
    pub psi_berg_search: bool,
    pub moving_terrain: bool,
    /// Estimate and remove a per-hypothesis depth bias before weighting.
    pub contour_matching: bool,
    /// Integrate DVL velocity instead of the inertial position delta when GPS is absent.
    pub dead_reckon: bool,
    pub use_accel: bool,

    /// Resample when the effective sample size drops below this fraction of N.
    pub min_eff_sample_fraction: f64,
    /// Soundings that must accumulate before a resample is allowed.
    pub min_num_soundings: usize,
    pub augmented_mcl: bool,
    /// Updates whose NIS reaches this value do not change the weights.
    #[serde(default = "default_nis_gate")]
    pub nis_gate: f64,
    /// Map noise floor used by the modified weighting schemes (m²).
    #[serde(default = "default_mod_map_var")]
    pub mod_map_var: f64,
    pub max_cross_beam_comparisons: usize,

    pub motion_noise: MotionNoise,
    pub sigma_point: SigmaPointConfig,
    /// Quadratic penalty on horizontal beam offset added to the EKF measurement noise.
    pub ekf_distance_penalty: f64,
    pub navigator: NavigatorConfig,
    pub logging: LoggingConfig,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            filter_type: FilterType::default(),
            num_particles: default_num_particles(),
            weighting_mode: WeightingMode::default(),
            init_distribution: InitDistribution::default(),
            init_window: InitWindow::default(),
            particle_file: None,
            attitude_search: false,
            gyro_bias_search: false,
            compass_bias_search: false,
            align_search: false,
            dvl_error_search: false,
            psi_berg_search: false,
            moving_terrain: false,
            contour_matching: false,
            dead_reckon: true,
            use_accel: false,
            min_eff_sample_fraction: 0.75,
            min_num_soundings: 4,
            augmented_mcl: false,
            nis_gate: default_nis_gate(),
            mod_map_var: default_mod_map_var(),
            max_cross_beam_comparisons: 5,
            motion_noise: MotionNoise::default(),
            sigma_point: SigmaPointConfig::default(),
            ekf_distance_penalty: 1e-4,
            navigator: NavigatorConfig::default(),
            logging: LoggingConfig::default(),
            seed: default_seed(),
        }
    }
}

impl FilterConfig {
    /// Check the configuration for values no filter can run with.
    pub fn validate(&self) -> Result<()> {
        if self.filter_type == FilterType::Particle
            && (self.num_particles == 0 || self.num_particles > MAX_PARTICLES)
        {
            return Err(TrnError::InvalidConfig(format!(
                "num_particles must be in 1..={MAX_PARTICLES}, got {}",
                self.num_particles
            )));
        }
        if !(0.0..=1.0).contains(&self.min_eff_sample_fraction) {
            return Err(TrnError::InvalidConfig(format!(
                "min_eff_sample_fraction must be within [0, 1], got {}",
                self.min_eff_sample_fraction
            )));
        }
        if self.mod_map_var < 0.0 || self.nis_gate <= 0.0 {
            return Err(TrnError::InvalidConfig(
                "mod_map_var must be non-negative and nis_gate positive".to_string(),
            ));
        }
        if self.sigma_point.alpha <= 0.0 {
            return Err(TrnError::InvalidConfig(
                "unscented alpha must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of states the search configuration estimates beyond N/E/D.
    pub fn search_dimensions(&self) -> usize {
        let mut n = 0;
        if self.attitude_search {
            n += 3;
        }
        if self.gyro_bias_search {
            n += 2;
        }
        if self.psi_berg_search {
            n += 1;
        }
        n
    }
}

/// On-disk encodings accepted for configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick the encoding from a file extension (`json`, `yaml`/`yml`, `toml`; any case).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(TrnError::ConfigFile(format!(
                "{}: expected a .json, .yaml, .yml or .toml extension",
                path.display()
            ))),
        }
    }
}

/// Serde-backed persistence for the configuration structs.
pub trait ConfigFile: Serialize + for<'de> Deserialize<'de> + Sized {
    fn encode(&self, format: ConfigFormat) -> Result<String> {
        let text = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(config_error)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(config_error)?,
            ConfigFormat::Toml => toml::to_string(self).map_err(config_error)?,
        };
        Ok(text)
    }

    fn decode(text: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Json => serde_json::from_str(text).map_err(config_error),
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(config_error),
            ConfigFormat::Toml => toml::from_str(text).map_err(config_error),
        }
    }

    /// Write to `path`, encoded according to its extension.
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = self.encode(ConfigFormat::from_path(path)?)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Read from `path`, decoded according to its extension.
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        Self::decode(&fs::read_to_string(path)?, format)
    }
}

fn config_error(err: impl std::fmt::Display) -> TrnError {
    TrnError::ConfigFile(err.to_string())
}

impl ConfigFile for FilterConfig {}
impl ConfigFile for NavigatorConfig {}
impl ConfigFile for VehicleSpec {}

/// A range sensor mounted on the vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub name: String,
    pub data_type: DataType,
    pub num_beams: usize,
    /// One-sigma range error as a percent of range.
    pub percent_range_error: f64,
    /// Beam angle off the sensor z-axis (rad). DVL Janus angle, or the single-beam pitch.
    pub beam_angle: f64,
    /// Sensor mounting attitude relative to the vehicle frame (roll, pitch, yaw; rad).
    pub mount_attitude: [f64; 3],
    /// Sensor mounting offset relative to the vehicle origin (m).
    pub mount_translation: [f64; 3],
}

impl SensorSpec {
    pub fn new(name: &str, data_type: DataType, num_beams: usize) -> Self {
        let beam_angle = match data_type {
            DataType::Dvl => 30.0_f64.to_radians(),
            _ => 0.0,
        };
        SensorSpec {
            name: name.to_string(),
            data_type,
            num_beams,
            percent_range_error: 1.0,
            beam_angle,
            mount_attitude: [0.0; 3],
            mount_translation: [0.0; 3],
        }
    }
}

/// Vehicle description: inertial drift rate and the mounted range sensors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleSpec {
    pub name: String,
    /// Inertial drift rate, percent of distance travelled.
    pub drift_rate: f64,
    pub sensors: Vec<SensorSpec>,
}

impl Default for VehicleSpec {
    fn default() -> Self {
        VehicleSpec {
            name: "vehicle".to_string(),
            drift_rate: 1.0,
            sensors: vec![SensorSpec::new("dvl", DataType::Dvl, 4)],
        }
    }
}

impl VehicleSpec {
    /// First mounted sensor producing `data_type` measurements.
    pub fn sensor_for(&self, data_type: DataType) -> Option<&SensorSpec> {
        self.sensors.iter().find(|s| s.data_type == data_type)
    }
}
