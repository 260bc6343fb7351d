//! IMU sample buffer shared between the IMU feed thread and the estimator.

use nalgebra::Vector3;

/// A single IMU measurement.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds since epoch.
    pub stamp: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// Append-only buffer of IMU samples for one agent.
///
/// The feed thread appends, the estimator reads; callers wrap the buffer in a
/// lock (see `system::AgentNode`). Preintegration itself happens outside the
/// consensus core.
#[derive(Debug, Default)]
pub struct ImuBuffer {
    samples: Vec<ImuSample>,
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Out-of-order samples are dropped.
    pub fn add(&mut self, sample: ImuSample) {
        if let Some(last) = self.samples.last() {
            if sample.stamp <= last.stamp {
                return;
            }
        }
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the newest sample, if any.
    pub fn t_last(&self) -> Option<f64> {
        self.samples.last().map(|s| s.stamp)
    }

    /// True once the buffer covers timestamp `t`; the estimator spin-waits on
    /// this before solving a frame.
    pub fn available(&self, t: f64) -> bool {
        self.t_last().map(|last| last >= t).unwrap_or(false)
    }

    /// Samples in the half-open interval `(t0, t1]`.
    pub fn between(&self, t0: f64, t1: f64) -> &[ImuSample] {
        let start = self.samples.partition_point(|s| s.stamp <= t0);
        let end = self.samples.partition_point(|s| s.stamp <= t1);
        &self.samples[start..end]
    }

    /// Drop samples older than `t`, keeping the buffer bounded.
    pub fn discard_before(&mut self, t: f64) {
        let keep_from = self.samples.partition_point(|s| s.stamp < t);
        self.samples.drain(..keep_from);
    }
}
