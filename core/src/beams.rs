//! Beam projection from sensor frame to vehicle and map frames.
//!
//! A measurement is first turned into one 3-D vector per usable beam in the sensor frame
//! (meters, x forward, y starboard, z down). The sensor mount rotation and offset take the
//! vectors into the vehicle frame, and an attitude rotation takes them into the map frame.

use std::f64::consts::FRAC_PI_2;
use std::f64::consts::FRAC_PI_4;

use nalgebra::{Matrix3xX, Rotation3, Vector3};

use crate::config::SensorSpec;
use crate::{DataType, Measurement};

/// Beam vectors with the measurement index each column came from.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedBeams {
    /// 3 x n beam vectors (m).
    pub vectors: Matrix3xX<f64>,
    /// Index into the measurement's per-beam arrays for each column.
    pub indices: Vec<usize>,
}

impl ProjectedBeams {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vector(&self, j: usize) -> Vector3<f64> {
        self.vectors.column(j).into_owned()
    }

    /// Length of beam `j` (m).
    pub fn range(&self, j: usize) -> f64 {
        self.vectors.column(j).norm()
    }

    /// Unit direction of beam `j`; straight down for a zero-length beam.
    pub fn direction(&self, j: usize) -> Vector3<f64> {
        let v = self.vector(j);
        let n = v.norm();
        if n > 0.0 { v / n } else { Vector3::z() }
    }

    /// Same beams rotated by a roll-pitch-yaw attitude.
    pub fn rotated(&self, attitude: &Vector3<f64>) -> ProjectedBeams {
        ProjectedBeams {
            vectors: rotate(attitude, &self.vectors),
            indices: self.indices.clone(),
        }
    }

    /// Largest horizontal extent over all beams, `(max |dN|, max |dE|)`.
    pub fn max_horizontal_extent(&self) -> (f64, f64) {
        self.vectors.column_iter().fold((0.0_f64, 0.0_f64), |(mx, my), c| {
            (mx.max(c[0].abs()), my.max(c[1].abs()))
        })
    }
}

/// Projects measurements of one mounted sensor.
#[derive(Clone, Debug)]
pub struct BeamProjector {
    data_type: DataType,
    beam_angle: f64,
    mount: Rotation3<f64>,
    offset: Vector3<f64>,
}

impl BeamProjector {
    pub fn new(sensor: &SensorSpec) -> Self {
        let [roll, pitch, yaw] = sensor.mount_attitude;
        BeamProjector {
            data_type: sensor.data_type,
            beam_angle: sensor.beam_angle,
            mount: Rotation3::from_euler_angles(roll, pitch, yaw),
            offset: Vector3::from(sensor.mount_translation),
        }
    }

    /// Sensor-frame beam vectors for every geometrically valid beam.
    ///
    /// Beams with `status == false`, non-positive or non-finite range, or non-finite geometry
    /// are dropped. Returns `None` when nothing is left.
    pub fn project_to_sensor_frame(&self, meas: &Measurement) -> Option<ProjectedBeams> {
        let mut columns = Vec::with_capacity(meas.num_beams());
        let mut indices = Vec::with_capacity(meas.num_beams());
        for i in 0..meas.num_beams() {
            let range = meas.ranges[i];
            if !meas.beam_valid(i) || !range.is_finite() || range <= 0.0 {
                continue;
            }
            let v = match self.data_type {
                DataType::Dvl => {
                    // Janus configuration: four beams at 45° + k·90° azimuth.
                    let azimuth = FRAC_PI_4 + (i % 4) as f64 * FRAC_PI_2;
                    let (sb, cb) = self.beam_angle.sin_cos();
                    range * Vector3::new(sb * azimuth.cos(), sb * azimuth.sin(), cb)
                }
                DataType::SingleBeam => {
                    let (sb, cb) = self.beam_angle.sin_cos();
                    range * Vector3::new(sb, 0.0, cb)
                }
                DataType::Multibeam | DataType::WideSwathLidar | DataType::Homer => {
                    match (
                        meas.along_track.get(i),
                        meas.cross_track.get(i),
                        meas.altitudes.get(i),
                    ) {
                        (Some(&a), Some(&c), Some(&z)) => Vector3::new(a, c, z),
                        _ => continue,
                    }
                }
            };
            if v.iter().all(|x| x.is_finite()) {
                columns.push(v);
                indices.push(i);
            }
        }
        if columns.is_empty() {
            return None;
        }
        Some(ProjectedBeams {
            vectors: Matrix3xX::from_columns(&columns),
            indices,
        })
    }

    /// Apply the fixed mount rotation and offset.
    pub fn project_to_vehicle_frame(&self, beams: &ProjectedBeams) -> ProjectedBeams {
        let mut vectors = self.mount.matrix() * &beams.vectors;
        for mut c in vectors.column_iter_mut() {
            c += self.offset;
        }
        ProjectedBeams {
            vectors,
            indices: beams.indices.clone(),
        }
    }

    /// Sensor frame followed by vehicle frame.
    pub fn project(&self, meas: &Measurement) -> Option<ProjectedBeams> {
        self.project_to_sensor_frame(meas)
            .map(|b| self.project_to_vehicle_frame(&b))
    }
}

/// Rotation taking vehicle-frame vectors to the navigation frame (intrinsic Z-Y-X).
pub fn rotation(attitude: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::from_euler_angles(attitude[0], attitude[1], attitude[2])
}

/// Rotate every column of `vectors` by a roll-pitch-yaw attitude.
pub fn rotate(attitude: &Vector3<f64>, vectors: &Matrix3xX<f64>) -> Matrix3xX<f64> {
    rotation(attitude).matrix() * vectors
}

/// Attitude used to bring a sensor's vehicle-frame beams into the map frame.
///
/// Multibeam soundings arrive already compensated for roll and pitch, so only yaw applies.
pub fn map_frame_attitude(data_type: DataType, attitude: &Vector3<f64>) -> Vector3<f64> {
    match data_type {
        DataType::Multibeam => Vector3::new(0.0, 0.0, attitude[2]),
        _ => *attitude,
    }
}
