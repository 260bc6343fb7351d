//! Consensus optimization core: parameter registry, dual states, consensus
//! penalties, and the ARock outer loop around a black-box inner solver.

pub mod arock;
pub mod consensus;
pub mod dual;
pub mod levenberg;
pub mod params;
pub mod prior;
pub mod problem;
pub mod residual;

pub use arock::{ArockConfig, ArockSolver, ConsensusHooks, SolveError, SolverReport};
pub use dual::{DualPair, DualStateStore};
pub use levenberg::LevenbergMarquardt;
pub use params::{ParamInfo, ParamKey, ParamKind, ParameterRegistry};
pub use prior::{Marginalizer, PriorFactor};
pub use problem::{InnerSolver, Manifold, Problem, SolverOptions, SolverSummary};
pub use residual::{CostFunction, Loss, ResidualBlock, ResidualKind};
