//! 5-state Extended Kalman Filter for a differential-drive ground vehicle.
//!
//! State vector:
//! [0]: X position in the local frame [m]
//! [1]: Y position in the local frame [m]
//! [2]: heading theta, kept in (-pi, pi]
//! [3]: linear velocity [m/s]
//! [4]: angular velocity [rad/s]
//!
//! Prediction runs at the encoder tick rate from wheel displacements; yaw is
//! a complementary blend of the IMU z-rate and differential-wheel odometry.
//! The measurement update consumes GNSS positions projected to the local
//! frame, with covariance scaled by HDOP^2 and a Mahalanobis innovation gate.

use crate::types::wrap_angle;
use ndarray::{arr1, Array1, Array2};

pub const STATE_DIM: usize = 5;

#[derive(Clone, Copy, Debug)]
pub struct EkfState {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    /// Row-major 3x3 covariance over (x, y, theta).
    pub pose_covariance: [f64; 9],
}

/// Outcome of one GNSS measurement update.
#[derive(Clone, Copy, Debug)]
pub enum GnssUpdateOutcome {
    Accepted { innovation_m: f64 },
    RejectedOutlier { mahalanobis: f64, gate: f64 },
}

pub struct DifferentialEkf {
    state: Array1<f64>,
    covariance: Array2<f64>,
    wheel_base: f64,
    /// Complementary blend weight for the IMU yaw rate, in [0, 1].
    imu_yaw_weight: f64,
    process_noise_scale: f64,
    measurement_noise_scale: f64,
    outlier_gate_sigma: f64,
    predict_count: u64,
    gnss_accept_count: u64,
    gnss_reject_count: u64,
}

impl DifferentialEkf {
    pub fn new(
        wheel_base: f64,
        imu_yaw_weight: f64,
        process_noise_scale: f64,
        measurement_noise_scale: f64,
        outlier_gate_sigma: f64,
    ) -> Self {
        DifferentialEkf {
            state: Array1::zeros(STATE_DIM),
            covariance: Self::initial_covariance(),
            wheel_base,
            imu_yaw_weight,
            process_noise_scale,
            measurement_noise_scale,
            outlier_gate_sigma,
            predict_count: 0,
            gnss_accept_count: 0,
            gnss_reject_count: 0,
        }
    }

    fn initial_covariance() -> Array2<f64> {
        let mut p = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        let diag = [100.0, 100.0, 1.0, 1.0, 1.0];
        for (idx, value) in diag.iter().enumerate() {
            p[[idx, idx]] = *value;
        }
        p
    }

    /// Prediction step from wheel displacements and the optional IMU yaw rate.
    ///
    /// `d_left`/`d_right` are linear wheel displacements since the previous
    /// step [m]; `imu_yaw_rate` is the body z angular rate [rad/s], `None`
    /// when the IMU is down (wheel-only fallback with widened yaw noise).
    pub fn predict(&mut self, d_left: f64, d_right: f64, dt: f64, imu_yaw_rate: Option<f64>) {
        if dt <= 0.0 {
            return;
        }

        let ds = 0.5 * (d_left + d_right);
        let d_theta_wheel = (d_right - d_left) / self.wheel_base;
        let (d_theta, yaw_noise_boost) = match imu_yaw_rate {
            Some(wz) => {
                let blended = self.imu_yaw_weight * (wz * dt)
                    + (1.0 - self.imu_yaw_weight) * d_theta_wheel;
                (blended, 1.0)
            }
            // IMU loss: wheel-only yaw, widened covariance.
            None => (d_theta_wheel, 25.0),
        };

        let theta_mid = self.state[2] + 0.5 * d_theta;
        self.state[0] += ds * theta_mid.cos();
        self.state[1] += ds * theta_mid.sin();
        self.state[2] = wrap_angle(self.state[2] + d_theta);
        self.state[3] = ds / dt;
        self.state[4] = d_theta / dt;

        // Jacobian of the motion model w.r.t. the state. Velocity rows are
        // re-derived each step from the displacements, so they carry no
        // memory in F and live entirely in Q.
        let mut f = Array2::<f64>::eye(STATE_DIM);
        f[[0, 2]] = -ds * theta_mid.sin();
        f[[1, 2]] = ds * theta_mid.cos();
        f[[3, 3]] = 0.0;
        f[[4, 4]] = 0.0;

        let q = self.build_process_noise(ds, d_theta, dt, yaw_noise_boost);
        let propagated = f.dot(&self.covariance).dot(&f.t()) + q;
        self.covariance = propagated;
        self.symmetrize();
        self.predict_count += 1;
    }

    fn build_process_noise(&self, ds: f64, d_theta: f64, dt: f64, yaw_boost: f64) -> Array2<f64> {
        // Slip-proportional translation noise plus a floor so the covariance
        // keeps growing while stationary GNSS is absent.
        let sigma_ds = 0.03 * ds.abs() + 1e-4;
        let sigma_th = (0.05 * d_theta.abs() + 1e-5) * yaw_boost;
        let scale = self.process_noise_scale;
        let mut q = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        q[[0, 0]] = sigma_ds * sigma_ds * scale;
        q[[1, 1]] = sigma_ds * sigma_ds * scale;
        q[[2, 2]] = sigma_th * sigma_th * scale;
        q[[3, 3]] = (0.05 + ds.abs() / dt.max(1e-6) * 0.01).powi(2) * scale;
        q[[4, 4]] = (0.05 + d_theta.abs() / dt.max(1e-6) * 0.01).powi(2) * scale;
        q
    }

    /// GNSS position update in local-frame meters. `hdop` scales the
    /// measurement covariance quadratically.
    pub fn update_gnss(&mut self, x_meas: f64, y_meas: f64, hdop: f64) -> GnssUpdateOutcome {
        let base_var = 1.5_f64.powi(2); // 1-sigma of a healthy single fix
        let var = base_var * hdop * hdop * self.measurement_noise_scale;

        let nu = arr1(&[x_meas - self.state[0], y_meas - self.state[1]]);

        // S = H P H^T + R with H selecting (x, y).
        let s00 = self.covariance[[0, 0]] + var;
        let s01 = self.covariance[[0, 1]];
        let s11 = self.covariance[[1, 1]] + var;
        let det = s00 * s11 - s01 * s01;
        if det.abs() < 1e-12 {
            return GnssUpdateOutcome::RejectedOutlier {
                mahalanobis: f64::INFINITY,
                gate: self.outlier_gate_sigma,
            };
        }
        let (i00, i01, i11) = (s11 / det, -s01 / det, s00 / det);

        let d2 = nu[0] * nu[0] * i00 + 2.0 * nu[0] * nu[1] * i01 + nu[1] * nu[1] * i11;
        let gate = self.outlier_gate_sigma;
        if d2 > gate * gate {
            self.gnss_reject_count += 1;
            return GnssUpdateOutcome::RejectedOutlier {
                mahalanobis: d2.sqrt(),
                gate,
            };
        }

        // K = P H^T S^-1, only the first two columns of P participate.
        let mut k = Array2::<f64>::zeros((STATE_DIM, 2));
        for row in 0..STATE_DIM {
            let p0 = self.covariance[[row, 0]];
            let p1 = self.covariance[[row, 1]];
            k[[row, 0]] = p0 * i00 + p1 * i01;
            k[[row, 1]] = p0 * i01 + p1 * i11;
        }

        for row in 0..STATE_DIM {
            self.state[row] += k[[row, 0]] * nu[0] + k[[row, 1]] * nu[1];
        }
        self.state[2] = wrap_angle(self.state[2]);

        // Joseph form keeps the covariance positive-definite.
        let mut kh = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        for row in 0..STATE_DIM {
            kh[[row, 0]] = k[[row, 0]];
            kh[[row, 1]] = k[[row, 1]];
        }
        let i_kh = Array2::<f64>::eye(STATE_DIM) - kh;
        let mut krk = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        for a in 0..STATE_DIM {
            for b in 0..STATE_DIM {
                krk[[a, b]] = var * (k[[a, 0]] * k[[b, 0]] + k[[a, 1]] * k[[b, 1]]);
            }
        }
        self.covariance = i_kh.dot(&self.covariance).dot(&i_kh.t()) + krk;
        self.symmetrize();

        self.gnss_accept_count += 1;
        GnssUpdateOutcome::Accepted {
            innovation_m: (nu[0] * nu[0] + nu[1] * nu[1]).sqrt(),
        }
    }

    /// First accepted fix anchors the frame: collapse position covariance
    /// onto the measurement.
    pub fn anchor(&mut self, x: f64, y: f64, hdop: f64) {
        self.state[0] = x;
        self.state[1] = y;
        let var = (1.5 * hdop).powi(2).max(0.25);
        self.covariance[[0, 0]] = var;
        self.covariance[[1, 1]] = var;
        self.covariance[[0, 1]] = 0.0;
        self.covariance[[1, 0]] = 0.0;
    }

    fn symmetrize(&mut self) {
        for a in 0..STATE_DIM {
            for b in (a + 1)..STATE_DIM {
                let m = 0.5 * (self.covariance[[a, b]] + self.covariance[[b, a]]);
                self.covariance[[a, b]] = m;
                self.covariance[[b, a]] = m;
            }
        }
    }

    pub fn get_state(&self) -> EkfState {
        let mut pose_covariance = [0.0; 9];
        for a in 0..3 {
            for b in 0..3 {
                pose_covariance[a * 3 + b] = self.covariance[[a, b]];
            }
        }
        EkfState {
            x: self.state[0],
            y: self.state[1],
            theta: self.state[2],
            linear_velocity: self.state[3],
            angular_velocity: self.state[4],
            pose_covariance,
        }
    }

    pub fn position_sigma(&self) -> f64 {
        (0.5 * (self.covariance[[0, 0]] + self.covariance[[1, 1]]))
            .max(0.0)
            .sqrt()
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (self.predict_count, self.gnss_accept_count, self.gnss_reject_count)
    }
}
