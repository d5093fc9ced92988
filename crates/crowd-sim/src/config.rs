//! Crowd configuration

use crowd_common::{Error, Result};

/// Number of obstacle avoidance presets a crowd holds
pub const MAX_OBSTACLE_AVOIDANCE_PARAMS: usize = 16;

/// Number of query filters a crowd holds
pub const MAX_QUERY_FILTER_TYPE: usize = 16;

/// Sizing and budgets of a crowd, fixed at construction
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct CrowdConfig {
    /// Maximum number of live agents
    pub max_agents: usize,
    /// Largest radius any agent will use. Sizes the proximity grid and the
    /// nearest polygon search of new agents.
    pub max_agent_radius: f32,
    /// Neighbour circles fed to obstacle avoidance
    pub max_obstacle_avoidance_circles: usize,
    /// Wall segments fed to obstacle avoidance
    pub max_obstacle_avoidance_segments: usize,
    /// Longest corridor or path result in polygons
    pub max_path_result: usize,
    /// Concurrent searches in the path queue
    pub path_queue_size: usize,
    /// Search iterations shared by the path queue per tick
    pub max_find_path_iterations: usize,
    /// Iterations of the immediate search run when a target is requested
    pub max_target_find_path_iterations: usize,
    /// Seconds before a partial corridor is re-planned
    pub target_replan_delay: f32,
    /// Seconds between topology optimizations of an agent
    pub topology_optimization_time_threshold: f32,
    /// Search iterations of one topology optimization
    pub max_topology_optimization_iterations: usize,
    /// Corridor polygons checked for validity each tick
    pub check_look_ahead: usize,
    pub collision_resolve_iterations: usize,
    /// Fraction of the penetration resolved per iteration
    pub collision_resolve_factor: f32,
    pub max_corners: usize,
    pub max_neighbours: usize,
    pub proximity_grid_max_items_per_cell: usize,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            max_agents: 128,
            max_agent_radius: 0.6,
            max_obstacle_avoidance_circles: 6,
            max_obstacle_avoidance_segments: 8,
            max_path_result: 256,
            path_queue_size: 32,
            max_find_path_iterations: 100,
            max_target_find_path_iterations: 20,
            target_replan_delay: 1.0,
            topology_optimization_time_threshold: 0.5,
            max_topology_optimization_iterations: 32,
            check_look_ahead: 10,
            collision_resolve_iterations: 4,
            collision_resolve_factor: 0.7,
            max_corners: 4,
            max_neighbours: 6,
            proximity_grid_max_items_per_cell: 64,
        }
    }
}

impl CrowdConfig {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Self {
        Self {
            max_agents,
            max_agent_radius,
            ..Default::default()
        }
    }

    pub fn with_path_queue_size(mut self, path_queue_size: usize) -> Self {
        self.path_queue_size = path_queue_size;
        self
    }

    pub fn with_max_find_path_iterations(mut self, iterations: usize) -> Self {
        self.max_find_path_iterations = iterations;
        self
    }

    pub fn with_max_target_find_path_iterations(mut self, iterations: usize) -> Self {
        self.max_target_find_path_iterations = iterations;
        self
    }

    pub fn with_collision_resolve(mut self, iterations: usize, factor: f32) -> Self {
        self.collision_resolve_iterations = iterations;
        self.collision_resolve_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(Error::Config("max_agents must be positive".into()));
        }
        if self.max_agent_radius.is_nan() || self.max_agent_radius <= 0.0 {
            return Err(Error::Config("max_agent_radius must be positive".into()));
        }
        if self.max_path_result == 0 || self.path_queue_size == 0 {
            return Err(Error::Config(
                "path result and queue sizes must be positive".into(),
            ));
        }
        if self.max_find_path_iterations == 0
            || self.max_target_find_path_iterations == 0
            || self.max_topology_optimization_iterations == 0
        {
            return Err(Error::Config("search iteration budgets must be positive".into()));
        }
        if self.max_corners < 2 {
            return Err(Error::Config("max_corners must be at least 2".into()));
        }
        if self.check_look_ahead == 0 || self.proximity_grid_max_items_per_cell == 0 {
            return Err(Error::Config(
                "look-ahead and grid cell capacity must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.collision_resolve_factor) {
            return Err(Error::Config(
                "collision_resolve_factor must be within [0, 1]".into(),
            ));
        }
        if self.target_replan_delay < 0.0 || self.topology_optimization_time_threshold < 0.0 {
            return Err(Error::Config("timers cannot be negative".into()));
        }
        Ok(())
    }

    /// Saves the configuration to a file in JSON format
    #[cfg(feature = "serialization")]
    pub fn save_to_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates a configuration from a JSON file
    #[cfg(feature = "serialization")]
    pub fn load_from_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
