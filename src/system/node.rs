//! Agent node: thread orchestration around one estimator.
//!
//! Four roles share the node: a frame feed pushing keyframes onto a bounded
//! queue, the estimator thread draining it (one outer solve per frame), a
//! network receiver depositing parsed bus messages into the coordinator's
//! inbox, and an IMU feed appending samples under the buffer lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::estimator::{Estimator, FactorSource};
use crate::solver::prior::Marginalizer;
use crate::solver::problem::InnerSolver;
use crate::state::imu::{ImuBuffer, ImuSample};
use crate::state::VinsFrame;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::transport::{Incoming, Transport};

/// Capacity of the keyframe queue between the frame feed and the estimator.
/// When full, the feed blocks briefly.
const FRAME_CHANNEL_CAPACITY: usize = 5;

/// Timeout for frame reception; allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-attempt sleep while waiting for IMU coverage of a frame stamp.
const IMU_WAIT_SLEEP: Duration = Duration::from_millis(2);

/// Give up waiting for IMU after this many attempts and solve anyway.
const IMU_WAIT_MAX_ATTEMPTS: usize = 500;

pub struct AgentNode {
    estimator: Arc<Mutex<Estimator>>,
    imu: Arc<Mutex<ImuBuffer>>,
    frame_tx: Sender<VinsFrame>,
    shutdown: Arc<AtomicBool>,
    estimator_handle: Option<JoinHandle<()>>,
    receiver_handle: Option<JoinHandle<()>>,
}

impl AgentNode {
    /// Build the estimator and spawn the estimator and network-receiver
    /// threads.
    pub fn spawn(
        config: AgentConfig,
        transport: Box<dyn Transport>,
        transport_rx: Receiver<Incoming>,
        inner: Box<dyn InnerSolver>,
        factor_source: Box<dyn FactorSource>,
        marginalizer: Option<Box<dyn Marginalizer>>,
    ) -> Result<Self> {
        let self_id = config.self_id;

        // The receiver thread deposits parsed messages into the
        // coordinator's inbox; the channel is the short critical section.
        let (inbox_tx, inbox_rx) = unbounded();
        let coordinator = SyncCoordinator::new(self_id, transport, inbox_rx);
        let estimator = Arc::new(Mutex::new(Estimator::new(
            config,
            coordinator,
            inner,
            factor_source,
            marginalizer,
        )?));

        let imu = Arc::new(Mutex::new(ImuBuffer::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = bounded::<VinsFrame>(FRAME_CHANNEL_CAPACITY);

        let receiver_handle = Self::spawn_receiver(transport_rx, inbox_tx, shutdown.clone());
        let estimator_handle = Self::spawn_estimator(
            estimator.clone(),
            imu.clone(),
            frame_rx,
            shutdown.clone(),
            self_id,
        );

        info!(self_id, "agent node started");
        Ok(Self {
            estimator,
            imu,
            frame_tx,
            shutdown,
            estimator_handle: Some(estimator_handle),
            receiver_handle: Some(receiver_handle),
        })
    }

    fn spawn_receiver(
        transport_rx: Receiver<Incoming>,
        inbox_tx: Sender<Incoming>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match transport_rx.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    if inbox_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    }

    fn spawn_estimator(
        estimator: Arc<Mutex<Estimator>>,
        imu: Arc<Mutex<ImuBuffer>>,
        frame_rx: Receiver<VinsFrame>,
        shutdown: Arc<AtomicBool>,
        self_id: u32,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let frame = match frame_rx.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // Wait (bounded) for IMU samples to cover the frame stamp.
            let mut attempts = 0;
            while !imu.lock().available(frame.stamp) {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                attempts += 1;
                if attempts > IMU_WAIT_MAX_ATTEMPTS {
                    warn!(self_id, stamp = frame.stamp, "IMU never caught up to frame");
                    break;
                }
                thread::sleep(IMU_WAIT_SLEEP);
            }

            let mut est = estimator.lock();
            est.add_frame(frame);
            match est.solve() {
                Ok(_) => {}
                Err(e) => {
                    // Inner-solver failure aborts the loop; nothing partial
                    // was published.
                    error!(self_id, error = %e, "outer solve failed, stopping estimator");
                    break;
                }
            }
        })
    }

    /// Push a keyframe onto the bounded queue (frame-feed thread).
    pub fn input_frame(&self, frame: VinsFrame) -> Result<()> {
        self.frame_tx
            .send(frame)
            .map_err(|e| anyhow::anyhow!("frame queue closed: {e}"))
    }

    /// Append an IMU sample (IMU-feed thread).
    pub fn input_imu(&self, sample: ImuSample) {
        self.imu.lock().add(sample);
    }

    /// Inspect the estimator under its lock.
    pub fn with_estimator<R>(&self, f: impl FnOnce(&Estimator) -> R) -> R {
        f(&self.estimator.lock())
    }

    /// Signal all threads to finish and join them.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.estimator_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receiver_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AgentNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::solver::levenberg::LevenbergMarquardt;
    use crate::solver::params::{ParamKey, ParameterRegistry};
    use crate::solver::residual::{CostFunction, Loss, ResidualBlock, ResidualKind};
    use crate::state::window::WindowState;
    use crate::sync::transport::MemoryBus;
    use nalgebra::Vector3;

    struct OriginAnchor;

    impl CostFunction for OriginAnchor {
        fn num_residuals(&self) -> usize {
            6
        }
        fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
            let x = SE3::from_array(params[0]);
            residuals.copy_from_slice(x.tangent().as_slice());
            true
        }
    }

    struct AnchorAll;

    impl FactorSource for AnchorAll {
        fn build_residuals(
            &mut self,
            window: &WindowState,
            _registry: &ParameterRegistry,
        ) -> Vec<ResidualBlock> {
            window
                .window(window.self_id())
                .iter()
                .map(|&frame_id| {
                    ResidualBlock::new(
                        ResidualKind::Prior,
                        Box::new(OriginAnchor),
                        Loss::Trivial,
                        vec![ParamKey::FramePose(frame_id)],
                    )
                })
                .collect()
        }
    }

    #[test]
    fn node_processes_frames_after_imu_catches_up() {
        let bus = MemoryBus::new();
        let (endpoint, rx) = bus.join(1);
        let config = AgentConfig {
            self_id: 1,
            min_solve_frames: 1,
            ..AgentConfig::default()
        };
        let mut node = AgentNode::spawn(
            config,
            Box::new(endpoint),
            rx,
            Box::new(LevenbergMarquardt::new()),
            Box::new(AnchorAll),
            None,
        )
        .unwrap();

        // IMU first, so the estimator never has to wait.
        for i in 0..20 {
            node.input_imu(ImuSample {
                stamp: i as f64 * 0.01,
                accel: Vector3::new(0.0, 0.0, 9.81),
                gyro: Vector3::zeros(),
            });
        }
        // Frame 1 is the frozen window base; frame 2 gets pulled to the
        // origin by its anchor.
        for (frame_id, stamp) in [(1u64, 0.05), (2, 0.10)] {
            node.input_frame(VinsFrame {
                frame_id,
                drone_id: 1,
                stamp,
                pose: SE3::new(
                    nalgebra::UnitQuaternion::identity(),
                    Vector3::new(0.5, 0.0, 0.0),
                ),
                velocity: Vector3::zeros(),
                ba: Vector3::zeros(),
                bg: Vector3::zeros(),
                is_keyframe: true,
            })
            .unwrap();
        }

        // Wait until the estimator thread has drained and solved the frames.
        let mut solved = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));
            solved = node.with_estimator(|est| {
                est.pose(2)
                    .map(|p| p.translation.norm() < 1e-4)
                    .unwrap_or(false)
            });
            if solved {
                break;
            }
        }
        node.shutdown();
        assert!(solved, "estimator thread never solved the queued frames");
    }
}
