//! Per-agent configuration of the consensus core.
//!
//! One `AgentConfig` value is built per agent and passed into every component
//! at construction; the core holds no process-wide mutable state.

use std::time::Duration;

use thiserror::Error;

use crate::solver::problem::SolverOptions;
use crate::state::DroneId;

/// Invalid configuration, rejected when the estimator is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("eta_k must lie in (0, 1], got {0}")]
    EtaOutOfRange(f64),

    #[error("consensus weight {name} must be positive, got {value}")]
    NonPositiveWeight { name: &'static str, value: f64 },

    #[error("max_steps must be at least 1")]
    ZeroMaxSteps,

    #[error("min_solve_frames ({min}) exceeds max_sld_win_size ({max})")]
    WindowBounds { min: usize, max: usize },

    #[error("min_inv_dep must be positive, got {0}")]
    NonPositiveMinInvDepth(f64),
}

/// Complete configuration of one agent's consensus core.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This agent's id; fixes which parameters are local.
    pub self_id: DroneId,

    /// Consensus penalty weight on pose translation.
    pub rho_frame_t: f64,
    /// Consensus penalty weight on pose rotation / yaw.
    pub rho_frame_theta: f64,
    /// Consensus penalty weight on landmarks and other euclidean blocks.
    pub rho_landmark: f64,

    /// ARock relaxation step; must lie in (0, 1].
    pub eta_k: f64,

    /// Upper bound on outer iterations per solve call.
    pub max_steps: usize,
    /// Upper bound on empty-reception rounds before bailing out.
    pub max_wait_steps: usize,
    /// Sleep applied when a round sees no new data.
    pub skip_iteration: Duration,

    /// Use token round negotiation; when false rounds run asynchronously.
    pub consensus_sync_to_start: bool,

    /// Freeze the first self pose regardless of prior presence.
    pub always_fixed_first_pose: bool,

    /// When marginalizing a remote frame, also drop the window base frame.
    pub remove_base_when_margin_remote: bool,

    /// Estimate camera extrinsics (otherwise frozen).
    pub estimate_extrinsic: bool,
    /// Estimate the camera-IMU time offset (otherwise frozen).
    pub estimate_td: bool,

    /// Minimum window length before solving.
    pub min_solve_frames: usize,
    /// Maximum sliding-window length; older frames are marginalized.
    pub max_sld_win_size: usize,

    /// Lower bound applied to inverse-depth landmark parameters.
    pub min_inv_dep: f64,

    /// Options forwarded to the inner solver (bounded iterations and time).
    pub solver: SolverOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            self_id: 0,
            rho_frame_t: 0.1,
            rho_frame_theta: 0.1,
            rho_landmark: 0.1,
            eta_k: 0.9,
            max_steps: 10,
            max_wait_steps: 10,
            skip_iteration: Duration::from_micros(500),
            consensus_sync_to_start: true,
            always_fixed_first_pose: false,
            remove_base_when_margin_remote: true,
            estimate_extrinsic: false,
            estimate_td: false,
            min_solve_frames: 2,
            max_sld_win_size: 10,
            min_inv_dep: 1e-4,
            solver: SolverOptions::default(),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration; called by `Estimator::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.eta_k > 0.0 && self.eta_k <= 1.0) {
            return Err(ConfigError::EtaOutOfRange(self.eta_k));
        }
        for (name, value) in [
            ("rho_frame_T", self.rho_frame_t),
            ("rho_frame_theta", self.rho_frame_theta),
            ("rho_landmark", self.rho_landmark),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NonPositiveWeight { name, value });
            }
        }
        if self.max_steps == 0 {
            return Err(ConfigError::ZeroMaxSteps);
        }
        if self.min_solve_frames > self.max_sld_win_size {
            return Err(ConfigError::WindowBounds {
                min: self.min_solve_frames,
                max: self.max_sld_win_size,
            });
        }
        if self.min_inv_dep <= 0.0 {
            return Err(ConfigError::NonPositiveMinInvDepth(self.min_inv_dep));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_eta_outside_unit_interval() {
        let mut cfg = AgentConfig::default();
        cfg.eta_k = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::EtaOutOfRange(_))));
        cfg.eta_k = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::EtaOutOfRange(_))));
        cfg.eta_k = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_window_bounds() {
        let mut cfg = AgentConfig::default();
        cfg.min_solve_frames = 20;
        cfg.max_sld_win_size = 10;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::WindowBounds { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_weights() {
        let mut cfg = AgentConfig::default();
        cfg.rho_landmark = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveWeight { .. })
        ));
    }
}
