// Thermal PID control for the detector cooler. The controller regulates the
// temperature *rate* (degrees per second) rather than the temperature
// itself: far from the setpoint it drives toward a configured ramp rate,
// and inside the last degree the rate demand tapers toward zero. The
// derivative comes from a least-squares slope over the recent measurement
// history instead of a two-point difference, so single noisy readings do
// not kick the actuator.

use std::time::Duration;

use canonical_error::CanonicalError;

use crate::ring_buf::RingBuf;

/// Rate-history samples consulted for the slope estimate.
const RATE_WINDOW: usize = 8;
/// Actuations at or below this are suppressed (actuator dead time).
const MIN_ACTUATION_US: i64 = 1500;
/// Fixed overhead subtracted from every issued actuation.
const ACTUATION_OVERHEAD_US: i64 = 1000;
/// Measurements needed before the controller starts actuating.
const WARMUP_SAMPLES: usize = 3;

#[derive(Copy, Clone, Debug)]
pub struct ThermalPidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Seconds between step() calls.
    pub time_step: f32,
    /// Cooler setpoint, degrees C.
    pub temp_target: f32,
    /// Ramp rate demanded while far from the setpoint, degrees C per
    /// second. Values below 1e-6 (including negative) are treated as zero.
    pub rate_target: f32,
}

/// One controller iteration's outputs, for logging or display.
#[derive(Copy, Clone, Debug)]
pub struct PidOutput {
    pub temperature: f32,
    /// Estimated temperature rate, degrees C per second. None while the
    /// measurement history is still warming up.
    pub rate: Option<f32>,
    /// How long to energize the cooler this cycle; None when warming up or
    /// below the actuation floor.
    pub actuation: Option<Duration>,
}

pub struct ThermalPid {
    config: ThermalPidConfig,
    history: RingBuf<f64>,
    err: f32,
    prev_err: f32,
    i_err: f32,
    runcount: u32,
}

impl ThermalPid {
    pub fn new(config: ThermalPidConfig) -> Result<Self, CanonicalError> {
        Ok(ThermalPid {
            config,
            history: RingBuf::new(64)?,
            err: 0.0,
            prev_err: 0.0,
            i_err: 0.0,
            runcount: 0,
        })
    }

    pub fn config(&self) -> &ThermalPidConfig {
        &self.config
    }

    /// Reconfigure and start over; accumulated error state would be
    /// meaningless under new gains or a new time step.
    pub fn reconfigure(&mut self, config: ThermalPidConfig) {
        self.config = config;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.err = 0.0;
        self.prev_err = 0.0;
        self.i_err = 0.0;
        self.runcount = 0;
    }

    /// Rate demand for the current measurement: the configured ramp far
    /// from the setpoint, tapering linearly inside the last degree.
    fn rate_demand(&self, measurement: f32) -> f32 {
        let mut demand = self.config.rate_target;
        if (measurement - self.config.temp_target) < 1.0 {
            demand = (measurement - self.config.temp_target) / self.config.time_step;
        }
        if demand < 1e-6 {
            demand = 0.0;
        }
        demand
    }

    /// Feed one temperature measurement (degrees C), taken time_step
    /// seconds after the previous one.
    pub fn step(&mut self, measurement: f32) -> PidOutput {
        self.history.push(measurement as f64);
        self.runcount += 1;

        if (self.history.pushed()) < WARMUP_SAMPLES {
            return PidOutput {
                temperature: measurement,
                rate: None,
                actuation: None,
            };
        }

        // Slope is per sample-offset with 0 the newest sample, so time runs
        // backwards along the axis; negate to get degrees per second.
        // A window equal to the push count would fall into the regression's
        // modulo sizing and report no samples, so ask for "all available"
        // until more than RATE_WINDOW measurements exist.
        let window = if self.history.pushed() > RATE_WINDOW {
            Some(RATE_WINDOW)
        } else {
            None
        };
        let rate = match self.history.linear_regression(window) {
            Some(fit) => -(fit.slope as f32) / self.config.time_step,
            None => {
                return PidOutput {
                    temperature: measurement,
                    rate: None,
                    actuation: None,
                };
            }
        };

        let demand = self.rate_demand(measurement);
        self.prev_err = self.err;
        self.err = demand - rate;
        self.i_err += self.err;
        let derr = self.err - self.prev_err;

        let p = self.config.kp * self.err;
        let i = self.config.ki * self.i_err * self.config.time_step;
        let d = self.config.kd * derr / self.config.time_step;

        let mut actuation_us = ((p + i + d) as f64 * 1e6) as i64;
        // Never energize longer than one control period.
        actuation_us %= (self.config.time_step as f64 * 1e6) as i64;
        let actuation = if actuation_us <= MIN_ACTUATION_US {
            None
        } else {
            Some(Duration::from_micros(
                (actuation_us - ACTUATION_OVERHEAD_US) as u64))
        };
        PidOutput {
            temperature: measurement,
            rate: Some(rate),
            actuation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ThermalPidConfig {
        ThermalPidConfig {
            kp: 0.005,
            ki: 0.0,
            kd: 0.0,
            time_step: 0.1,
            temp_target: -30.0,
            rate_target: 5.0,
        }
    }

    #[test]
    fn warms_up_before_actuating() {
        let mut pid = ThermalPid::new(config()).unwrap();
        for _ in 0..WARMUP_SAMPLES - 1 {
            let out = pid.step(20.0);
            assert!(out.rate.is_none());
            assert!(out.actuation.is_none());
        }
        let out = pid.step(20.0);
        assert!(out.rate.is_some());
    }

    #[test]
    fn flat_history_reports_zero_rate() {
        let mut pid = ThermalPid::new(config()).unwrap();
        let out = (0..9).map(|_| pid.step(20.0)).last().unwrap();
        assert!(out.rate.unwrap().abs() < 1e-6);
        // Rate error of 5 C/s at kp=0.005 is 25 ms, inside the 100 ms
        // period and above the floor: the cooler gets energized.
        let actuation = out.actuation.unwrap();
        assert!((actuation.as_micros() as i64 - 24000).abs() < 10);
    }

    #[test]
    fn cooling_ramp_is_tracked() {
        let mut pid = ThermalPid::new(config()).unwrap();
        // 0.5 C colder every 100 ms: -5 C/s, exactly the demanded ramp.
        pid.step(20.0);
        let out = (1..12)
            .map(|i| pid.step(20.0 - 0.5 * i as f32))
            .last()
            .unwrap();
        let rate = out.rate.unwrap();
        assert!((rate - (-5.0)).abs() < 1e-3);
        // err = 5 - (-5) = 10 C/s -> 50 ms actuation (minus overhead).
        let actuation = out.actuation.unwrap();
        assert!((actuation.as_micros() as i64 - 49000).abs() < 100);
    }

    #[test]
    fn rate_demand_tapers_near_setpoint() {
        let pid = ThermalPid::new(config()).unwrap();
        // Far away: configured ramp.
        assert_eq!(pid.rate_demand(20.0), 5.0);
        // Inside the last degree the demand scales with remaining distance.
        assert!((pid.rate_demand(-29.5) - 5.0).abs() < 1e-6);
        // At or below the setpoint the demand clamps to zero.
        assert_eq!(pid.rate_demand(-30.0), 0.0);
        assert_eq!(pid.rate_demand(-31.0), 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = ThermalPid::new(config()).unwrap();
        for i in 0..8 {
            pid.step(20.0 - i as f32);
        }
        pid.reset();
        let out = pid.step(20.0);
        assert!(out.rate.is_none());
        assert!(out.actuation.is_none());
    }
}
