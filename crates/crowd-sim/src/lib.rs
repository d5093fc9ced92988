//! Real-time multi-agent crowd simulation on navigation meshes
//!
//! This crate moves many agents across a shared navigation mesh. Each agent
//! follows a path corridor toward its target, steers around neighbours and
//! walls, and is kept apart from other agents by collision resolution. Path
//! searches are spread over ticks by a bounded path queue.
//!
//! The mesh itself is consumed through [`nav_query::NavMeshQuery`], so any
//! polygon graph implementing that trait can host a crowd.
//!
//! # Example
//!
//! ```rust,ignore
//! use crowd_sim::{AgentParams, Crowd, CrowdConfig};
//! use nav_query::GridNavMesh;
//!
//! let mesh = GridNavMesh::new(Vec3::ZERO, 1.0, 16, 16)?;
//! let mut crowd = Crowd::new(CrowdConfig::new(64, 0.6), mesh)?;
//!
//! let agent = crowd.add_agent(start, AgentParams::default())?;
//! let target_ref = crowd.navquery().poly_at(target);
//! crowd.request_move_target(agent, target_ref, target);
//!
//! loop {
//!     crowd.update(1.0 / 30.0, None);
//! }
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent registry and the per-tick pipeline
//! - [`PathCorridor`]: the polygon path an agent follows
//! - [`PathQueue`]: sliced path searches under a shared iteration budget
//! - [`LocalBoundary`]: cached walls around an agent
//! - [`ObstacleAvoidanceQuery`]: sampling based velocity planning
//! - [`ProximityGrid`]: spatial hash for neighbour lookups

pub mod agent;
pub mod config;
pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod path_queue;
pub mod priority_queue;
pub mod proximity_grid;
pub mod telemetry;

pub use agent::*;
pub use config::*;
pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use path_queue::*;
pub use priority_queue::*;
pub use proximity_grid::*;
pub use telemetry::*;

#[cfg(test)]
mod crowd_scenario_tests;
