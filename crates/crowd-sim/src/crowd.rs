//! Crowd management
//!
//! [`Crowd`] owns the agents and runs the per-tick pipeline. Each phase runs
//! over the whole live agent set before the next one starts, in this order:
//!
//! 1. path validity check
//! 2. move requests and the sliced path queue
//! 3. topology optimization
//! 4. proximity grid rebuild
//! 5. neighbours and wall boundaries
//! 6. corner finding and visibility optimization
//! 7. off-mesh connection triggers
//! 8. steering
//! 9. velocity planning (obstacle avoidance)
//! 10. integration
//! 11. collision resolution
//! 12. moving agents along their corridors
//! 13. off-mesh connection animation
//!
//! Navigation failures never surface as errors here. They end up in the
//! agent's [`MoveRequestState`] and [`AgentState`].

use crate::{
    AgentHandle, AgentParams, AgentState, CrowdAgent, CrowdAgentAnimation, CrowdConfig,
    CrowdNeighbour, CrowdPhase, CrowdTelemetry, KeyedPriorityQueue, MoveRequestState,
    ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery, PathQueue,
    PathQueueRef, ProximityGrid, UpdateFlags, MAX_OBSTACLE_AVOIDANCE_PARAMS,
    MAX_QUERY_FILTER_TYPE,
};
use crowd_common::{dist_2d, dist_sqr_2d, sqr, tri_area_2d, tween, Error, Result, Vec3};
use nav_query::{NavMeshQuery, PolyRef, PolygonFilter, QueryFilter};
use std::rc::Rc;
use web_time::Instant;

/// Neighbour candidates pulled from the proximity grid per agent
const MAX_GRID_QUERY: usize = 32;

/// Avoidance samples recorded for the debugged agent
const MAX_DEBUG_SAMPLES: usize = 2048;

/// Intermediate data of one agent, captured during an update
#[derive(Debug, Clone)]
pub struct CrowdAgentDebugInfo {
    /// The agent to capture
    pub agent: AgentHandle,
    /// Start of the last visibility optimization ray
    pub opt_start: Vec3,
    /// End of the last visibility optimization ray
    pub opt_end: Vec3,
    /// Velocity samples of the last avoidance pass
    pub vod: ObstacleAvoidanceDebugData,
}

impl CrowdAgentDebugInfo {
    pub fn new(agent: AgentHandle) -> Self {
        Self {
            agent,
            opt_start: Vec3::ZERO,
            opt_end: Vec3::ZERO,
            vod: ObstacleAvoidanceDebugData::new(MAX_DEBUG_SAMPLES),
        }
    }
}

/// Removes A-B-A detours from a merged path, keeping the second A
fn remove_track_backs(path: &mut Vec<PolyRef>) {
    let mut j = 1;
    while j + 1 < path.len() {
        if path[j - 1] == path[j + 1] {
            path.drain(j - 1..j + 1);
            j = j.saturating_sub(1).max(1);
        } else {
            j += 1;
        }
    }
}

/// A crowd of agents moving on one navigation mesh
pub struct Crowd<Q: NavMeshQuery> {
    config: CrowdConfig,
    navquery: Q,
    agents: Vec<CrowdAgent>,
    generations: Vec<u32>,
    /// Live agents in insertion order
    active_agents: Vec<usize>,
    path_queue: PathQueue<Q::Search>,
    obstacle_query: ObstacleAvoidanceQuery,
    obstacle_query_params: [ObstacleAvoidanceParams; MAX_OBSTACLE_AVOIDANCE_PARAMS],
    filters: Vec<Rc<dyn PolygonFilter>>,
    grid: ProximityGrid,
    agent_placement_half_extents: Vec3,
    telemetry: CrowdTelemetry,
}

impl<Q: NavMeshQuery> Crowd<Q> {
    /// Creates an empty crowd on top of `navquery`
    pub fn new(config: CrowdConfig, navquery: Q) -> Result<Self> {
        config.validate()?;

        let agents = (0..config.max_agents)
            .map(|_| CrowdAgent::new(config.max_path_result))
            .collect();
        let default_filter: Rc<dyn PolygonFilter> = Rc::new(QueryFilter::default());
        let r = config.max_agent_radius;

        log::debug!(
            "Creating crowd for {} agents, max radius {}",
            config.max_agents,
            r
        );

        Ok(Self {
            navquery,
            agents,
            generations: vec![0; config.max_agents],
            active_agents: Vec::with_capacity(config.max_agents),
            path_queue: PathQueue::new(config.path_queue_size, config.max_path_result),
            obstacle_query: ObstacleAvoidanceQuery::new(
                config.max_obstacle_avoidance_circles,
                config.max_obstacle_avoidance_segments,
            ),
            obstacle_query_params: [ObstacleAvoidanceParams::default();
                MAX_OBSTACLE_AVOIDANCE_PARAMS],
            filters: vec![default_filter; MAX_QUERY_FILTER_TYPE],
            grid: ProximityGrid::new(
                config.max_agents * 4,
                r * 3.0,
                config.proximity_grid_max_items_per_cell,
            ),
            agent_placement_half_extents: Vec3::new(r * 2.0, r * 1.5, r * 2.0),
            telemetry: CrowdTelemetry::default(),
            config,
        })
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    pub fn navquery(&self) -> &Q {
        &self.navquery
    }

    /// Mutable access to the navigation mesh, e.g. to block polygons at runtime
    pub fn navquery_mut(&mut self) -> &mut Q {
        &mut self.navquery
    }

    /// Measurements of the last update
    pub fn telemetry(&self) -> &CrowdTelemetry {
        &self.telemetry
    }

    pub fn grid(&self) -> &ProximityGrid {
        &self.grid
    }

    pub fn path_queue(&self) -> &PathQueue<Q::Search> {
        &self.path_queue
    }

    pub fn obstacle_avoidance_query(&self) -> &ObstacleAvoidanceQuery {
        &self.obstacle_query
    }

    /// Search box used to snap new agents onto the mesh
    pub fn query_half_extents(&self) -> Vec3 {
        self.agent_placement_half_extents
    }

    pub fn set_obstacle_avoidance_params(
        &mut self,
        idx: usize,
        params: ObstacleAvoidanceParams,
    ) -> Result<()> {
        let slot = self.obstacle_query_params.get_mut(idx).ok_or_else(|| {
            Error::InvalidParam(format!("obstacle avoidance preset {idx} out of range"))
        })?;
        *slot = params;
        Ok(())
    }

    pub fn obstacle_avoidance_params(&self, idx: usize) -> Result<&ObstacleAvoidanceParams> {
        self.obstacle_query_params.get(idx).ok_or_else(|| {
            Error::InvalidParam(format!("obstacle avoidance preset {idx} out of range"))
        })
    }

    /// Installs the query filter agents select with `query_filter_type == idx`
    pub fn set_filter(&mut self, idx: usize, filter: Rc<dyn PolygonFilter>) -> Result<()> {
        let slot = self
            .filters
            .get_mut(idx)
            .ok_or_else(|| Error::InvalidParam(format!("query filter {idx} out of range")))?;
        *slot = filter;
        Ok(())
    }

    pub fn filter(&self, idx: usize) -> Result<&dyn PolygonFilter> {
        self.filters
            .get(idx)
            .map(|f| f.as_ref())
            .ok_or_else(|| Error::InvalidParam(format!("query filter {idx} out of range")))
    }

    fn validate_params(&self, params: &AgentParams) -> Result<()> {
        if params.radius.is_nan() || params.radius <= 0.0 {
            log::warn!("Rejecting agent radius {}", params.radius);
            return Err(Error::InvalidParam("agent radius must be positive".into()));
        }
        if params.max_speed < 0.0 || params.max_acceleration < 0.0 {
            log::warn!("Rejecting negative agent speed or acceleration");
            return Err(Error::InvalidParam(
                "agent speed and acceleration cannot be negative".into(),
            ));
        }
        if params.obstacle_avoidance_type as usize >= MAX_OBSTACLE_AVOIDANCE_PARAMS {
            log::warn!(
                "Rejecting obstacle avoidance preset {}",
                params.obstacle_avoidance_type
            );
            return Err(Error::InvalidParam(format!(
                "obstacle avoidance preset {} out of range",
                params.obstacle_avoidance_type
            )));
        }
        if params.query_filter_type as usize >= MAX_QUERY_FILTER_TYPE {
            log::warn!("Rejecting query filter {}", params.query_filter_type);
            return Err(Error::InvalidParam(format!(
                "query filter {} out of range",
                params.query_filter_type
            )));
        }
        // The proximity grid pool holds four cells per agent of at most this radius
        if params.radius > self.config.max_agent_radius {
            log::warn!(
                "Rejecting agent radius {} above the crowd maximum {}",
                params.radius,
                self.config.max_agent_radius
            );
            return Err(Error::InvalidParam(format!(
                "agent radius {} exceeds max_agent_radius {}",
                params.radius, self.config.max_agent_radius
            )));
        }
        Ok(())
    }

    fn slot(&self, handle: AgentHandle) -> Option<usize> {
        let ag = self.agents.get(handle.index)?;
        (ag.active && self.generations[handle.index] == handle.generation).then_some(handle.index)
    }

    /// Adds an agent, snapping `pos` onto the nearest polygon.
    ///
    /// If no polygon is close enough the agent is added in
    /// [`AgentState::Invalid`]. Fails only when the crowd is full or the
    /// parameters are unusable.
    pub fn add_agent(&mut self, pos: Vec3, params: AgentParams) -> Result<AgentHandle> {
        self.validate_params(&params)?;

        let Some(idx) = self.agents.iter().position(|a| !a.active) else {
            log::debug!("Crowd full, cannot add agent at {}", pos);
            return Err(Error::Crowd(format!(
                "crowd is full ({} agents)",
                self.config.max_agents
            )));
        };

        let filter = &*self.filters[params.query_filter_type as usize];
        let (poly, nearest) = self
            .navquery
            .find_nearest_poly(pos, self.agent_placement_half_extents, filter)
            .unwrap_or((PolyRef::NULL, pos));

        let mut ag = CrowdAgent::new(self.config.max_path_result);
        ag.params = params;
        ag.corridor.reset(poly, nearest);
        ag.npos = nearest;
        ag.state = if poly.is_valid() {
            AgentState::Walking
        } else {
            log::debug!("Agent {} placed off the navigation mesh at {}", idx, pos);
            AgentState::Invalid
        };
        ag.active = true;
        self.agents[idx] = ag;
        self.active_agents.push(idx);

        Ok(AgentHandle {
            index: idx,
            generation: self.generations[idx],
        })
    }

    /// Removes an agent. Returns false if it was already gone.
    pub fn remove_agent(&mut self, handle: AgentHandle) -> bool {
        let Some(idx) = self.slot(handle) else {
            return false;
        };

        let ag = &mut self.agents[idx];
        self.path_queue
            .cancel(std::mem::take(&mut ag.target_path_queue_ref));
        ag.active = false;
        ag.neis.clear();
        ag.corners.clear();

        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.active_agents.retain(|&i| i != idx);
        true
    }

    pub fn agent(&self, handle: AgentHandle) -> Option<&CrowdAgent> {
        self.slot(handle).map(|idx| &self.agents[idx])
    }

    /// Handles of the live agents, in insertion order
    pub fn active_agents(&self) -> Vec<AgentHandle> {
        self.active_agents
            .iter()
            .map(|&index| AgentHandle {
                index,
                generation: self.generations[index],
            })
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.active_agents.len()
    }

    /// Live agent handle for an arena index, as stored in neighbour lists and telemetry
    pub fn handle_at(&self, index: usize) -> Option<AgentHandle> {
        let handle = AgentHandle {
            index,
            generation: *self.generations.get(index)?,
        };
        self.slot(handle).map(|_| handle)
    }

    fn set_move_target(&mut self, idx: usize, poly: PolyRef, pos: Vec3, replan: bool) {
        let ag = &mut self.agents[idx];
        self.path_queue
            .cancel(std::mem::take(&mut ag.target_path_queue_ref));

        ag.target_ref = poly;
        ag.target_pos = pos;
        ag.target_replan = replan;
        ag.target_state = if poly.is_valid() {
            MoveRequestState::Requesting
        } else {
            MoveRequestState::Failed
        };
    }

    /// Asks the agent to move to `pos` on polygon `poly`.
    ///
    /// Returns false, leaving the current target untouched, for a null
    /// polygon or a stale handle.
    pub fn request_move_target(&mut self, handle: AgentHandle, poly: PolyRef, pos: Vec3) -> bool {
        if poly.is_null() {
            return false;
        }
        let Some(idx) = self.slot(handle) else {
            return false;
        };
        self.set_move_target(idx, poly, pos, false);
        true
    }

    /// Drives the agent directly with `vel`, bypassing path following
    pub fn request_move_velocity(&mut self, handle: AgentHandle, vel: Vec3) -> bool {
        let Some(idx) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[idx];
        self.path_queue
            .cancel(std::mem::take(&mut ag.target_path_queue_ref));
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = vel;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Velocity;
        true
    }

    /// Clears the target. Succeeds for every live agent.
    pub fn reset_move_target(&mut self, handle: AgentHandle) -> bool {
        let Some(idx) = self.slot(handle) else {
            return false;
        };
        let ag = &mut self.agents[idx];
        self.path_queue
            .cancel(std::mem::take(&mut ag.target_path_queue_ref));
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = Vec3::ZERO;
        ag.dvel = Vec3::ZERO;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::None;
        true
    }

    /// Replaces the agent's parameters, leaving its position and corridor alone
    pub fn update_agent_parameters(
        &mut self,
        handle: AgentHandle,
        params: AgentParams,
    ) -> Result<()> {
        self.validate_params(&params)?;
        let idx = self
            .slot(handle)
            .ok_or_else(|| Error::InvalidParam(format!("unknown {handle}")))?;
        self.agents[idx].params = params;
        Ok(())
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// When `debug` is given, intermediate data of the agent it names is
    /// recorded into it.
    pub fn update(
        &mut self,
        dt: f32,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) -> &CrowdTelemetry {
        self.telemetry.start();

        let agents = self.active_agents.clone();
        let debug_idx = debug.as_ref().and_then(|d| self.slot(d.agent));

        self.timed(CrowdPhase::CheckPathValidity, |c| {
            c.check_path_validity(&agents, dt)
        });
        self.timed(CrowdPhase::UpdateMoveRequests, |c| {
            c.update_move_requests(&agents, dt)
        });
        self.timed(CrowdPhase::OptimizeTopology, |c| {
            c.update_topology_optimization(&agents, dt)
        });
        self.timed(CrowdPhase::BuildProximityGrid, |c| {
            c.build_proximity_grid(&agents)
        });
        self.timed(CrowdPhase::BuildNeighbours, |c| c.build_neighbours(&agents));
        self.timed(CrowdPhase::FindCorners, |c| {
            c.find_corners(&agents, debug_idx, debug.as_deref_mut())
        });
        self.timed(CrowdPhase::TriggerOffMeshConnections, |c| {
            c.trigger_off_mesh_connections(&agents)
        });
        self.timed(CrowdPhase::CalculateSteering, |c| {
            c.calculate_steering(&agents)
        });
        self.timed(CrowdPhase::PlanVelocity, |c| {
            c.plan_velocity(&agents, debug_idx, debug.as_deref_mut())
        });
        self.timed(CrowdPhase::Integrate, |c| c.integrate(&agents, dt));
        self.timed(CrowdPhase::HandleCollisions, |c| {
            c.handle_collisions(&agents)
        });
        self.timed(CrowdPhase::MoveAgents, |c| c.move_agents(&agents));
        self.timed(CrowdPhase::UpdateOffMeshConnections, |c| {
            c.update_off_mesh_connections(&agents, dt)
        });

        log::trace!("Crowd update: {}", self.telemetry);
        &self.telemetry
    }

    fn timed(&mut self, phase: CrowdPhase, f: impl FnOnce(&mut Self)) {
        let started = Instant::now();
        f(self);
        self.telemetry.record_phase(phase, started);
    }

    fn check_path_validity(&mut self, agents: &[usize], dt: f32) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking {
                continue;
            }
            let filter = &*self.filters[ag.params.query_filter_type as usize];

            ag.target_replan_time += dt;
            let mut replan = false;

            // First check that the current location is valid
            let mut agent_ref = ag.corridor.first_poly();
            let mut agent_pos = ag.npos;
            if !self.navquery.is_valid_poly_ref(agent_ref, filter) {
                match self.navquery.find_nearest_poly(
                    ag.npos,
                    self.agent_placement_half_extents,
                    filter,
                ) {
                    Some((poly, nearest)) => {
                        agent_ref = poly;
                        agent_pos = nearest;
                        ag.corridor.fix_path_start(agent_ref, agent_pos);
                        ag.boundary.reset();
                        ag.npos = agent_pos;
                        replan = true;
                    }
                    None => {
                        log::debug!("Agent {} lost the navigation mesh at {}", idx, ag.npos);
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.partial = false;
                        ag.boundary.reset();
                        ag.state = AgentState::Invalid;
                        continue;
                    }
                }
            }

            // No target to recover or replan
            if ag.target_state.is_pathless() {
                continue;
            }

            // Try to recover the move request position
            if ag.target_state != MoveRequestState::Failed {
                if !self.navquery.is_valid_poly_ref(ag.target_ref, filter) {
                    match self.navquery.find_nearest_poly(
                        ag.target_pos,
                        self.agent_placement_half_extents,
                        filter,
                    ) {
                        Some((poly, nearest)) => {
                            ag.target_ref = poly;
                            ag.target_pos = nearest;
                        }
                        None => ag.target_ref = PolyRef::NULL,
                    }
                    replan = true;
                }
                if ag.target_ref.is_null() {
                    log::debug!("Agent {} target left the navigation mesh", idx);
                    ag.corridor.reset(agent_ref, agent_pos);
                    ag.partial = false;
                    ag.target_state = MoveRequestState::None;
                }
            }

            // The corridor ahead became unusable
            if !ag
                .corridor
                .is_valid(self.config.check_look_ahead, &self.navquery, filter)
            {
                replan = true;
            }

            // Close to the end of a partial path, try again to reach the real target
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > self.config.target_replan_delay
                && ag.corridor.path_count() < self.config.check_look_ahead
                && ag.corridor.last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != MoveRequestState::None {
                let (poly, pos) = (ag.target_ref, ag.target_pos);
                log::trace!("Agent {} replanning to {}", idx, poly);
                self.set_move_target(idx, poly, pos, true);
            }
        }
    }

    fn update_move_requests(&mut self, agents: &[usize], dt: f32) {
        let max_path = self.config.max_path_result;
        let mut queue = KeyedPriorityQueue::new(|&(_, wait): &(usize, f32)| wait);

        // Fire off new requests
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state == AgentState::Invalid || ag.target_state.is_pathless() {
                continue;
            }

            if ag.target_state == MoveRequestState::Requesting {
                let filter = &*self.filters[ag.params.query_filter_type as usize];
                debug_assert!(ag.corridor.path_count() > 0);
                let first = ag.corridor.first_poly();

                // Quick search toward the goal
                let mut search = self.navquery.init_sliced_find_path(
                    first,
                    ag.target_ref,
                    ag.npos,
                    ag.target_pos,
                    filter,
                );
                self.navquery.update_sliced_find_path(
                    &mut search,
                    self.config.max_target_find_path_iterations,
                    filter,
                );
                let (status, mut req_path) = if ag.target_replan {
                    // Keep the steady part of the current path while replanning
                    self.navquery.finalize_sliced_find_path_partial(
                        &mut search,
                        ag.corridor.path(),
                        max_path,
                    )
                } else {
                    self.navquery
                        .finalize_sliced_find_path(&mut search, max_path)
                };

                let mut req_pos = Vec3::ZERO;
                if !status.is_failure() {
                    if let Some(&last) = req_path.last() {
                        if last != ag.target_ref {
                            // Partial path, constrain the target inside the last polygon
                            match self.navquery.closest_point_on_poly(last, ag.target_pos) {
                                Ok((pos, _)) => req_pos = pos,
                                Err(_) => req_path.clear(),
                            }
                        } else {
                            req_pos = ag.target_pos;
                        }
                    }
                } else {
                    req_path.clear();
                }

                if req_path.is_empty() {
                    // Could not find a path, start the request from the current location
                    req_pos = ag.npos;
                    req_path.push(first);
                }

                ag.corridor.set_corridor(req_pos, &req_path);
                ag.boundary.reset();
                ag.partial = false;

                if req_path.last() == Some(&ag.target_ref) {
                    ag.target_state = MoveRequestState::Valid;
                    ag.target_replan_time = 0.0;
                } else {
                    // The path is longer or possibly unreachable, plan it fully
                    ag.target_state = MoveRequestState::WaitingForQueue;
                }
                ag.target_replan_wait_time = 0.0;
            }

            if ag.target_state == MoveRequestState::WaitingForQueue {
                queue.push((idx, ag.target_replan_time));
            }
        }

        // Longest waiting first
        for (idx, _) in queue {
            let ag = &mut self.agents[idx];
            let filter = Rc::clone(&self.filters[ag.params.query_filter_type as usize]);
            ag.target_path_queue_ref = self.path_queue.request(
                ag.corridor.last_poly(),
                ag.target_ref,
                ag.corridor.target(),
                ag.target_pos,
                filter,
            );
            if ag.target_path_queue_ref.is_valid() {
                ag.target_state = MoveRequestState::WaitingForPath;
            } else {
                log::debug!("Path queue full, agent {} keeps waiting", idx);
                self.telemetry
                    .record_max_time_to_enqueue_request(ag.target_replan_wait_time, idx);
                ag.target_replan_wait_time += dt;
            }
        }

        self.path_queue
            .update(&self.navquery, self.config.max_find_path_iterations);

        // Process path results
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.target_state != MoveRequestState::WaitingForPath {
                continue;
            }

            let status = self.path_queue.request_status(ag.target_path_queue_ref);
            if status.is_failure() {
                log::debug!("Path search failed for agent {}", idx);
                ag.target_path_queue_ref = PathQueueRef::INVALID;
                ag.target_state = MoveRequestState::Failed;
                ag.target_replan_time = 0.0;
            } else if status.is_success() {
                debug_assert!(ag.corridor.path_count() > 0);
                let (res_status, res) = self
                    .path_queue
                    .path_result(std::mem::take(&mut ag.target_path_queue_ref));

                let path = ag.corridor.path();
                let mut target_pos = ag.target_pos;
                ag.partial = res_status.is_partial();

                // The request was issued from the end of the current corridor,
                // so the result must start there
                let mut valid = res_status.is_success()
                    && !res.is_empty()
                    && path.last() == res.first();

                let mut merged = Vec::new();
                if valid {
                    if path.len() > 1 {
                        merged.extend_from_slice(&path[..path.len() - 1]);
                        merged.extend_from_slice(&res);
                        remove_track_backs(&mut merged);
                        merged.truncate(max_path);
                    } else {
                        merged = res;
                    }

                    let last = merged.last().copied().unwrap_or(PolyRef::NULL);
                    if last != ag.target_ref {
                        // Partial path, constrain the target inside the last polygon
                        match self.navquery.closest_point_on_poly(last, target_pos) {
                            Ok((pos, _)) => target_pos = pos,
                            Err(_) => valid = false,
                        }
                    }
                }

                if valid {
                    ag.corridor.set_corridor(target_pos, &merged);
                    ag.boundary.reset();
                    ag.target_state = MoveRequestState::Valid;
                } else {
                    log::debug!("Discarding unusable path result for agent {}", idx);
                    ag.target_state = MoveRequestState::Failed;
                }
                ag.target_replan_time = 0.0;
            }

            self.telemetry
                .record_max_time_to_find_path(ag.target_replan_wait_time, idx);
            ag.target_replan_wait_time += dt;
        }
    }

    fn update_topology_optimization(&mut self, agents: &[usize], dt: f32) {
        let mut queue = KeyedPriorityQueue::new(|&(_, time): &(usize, f32)| time);

        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking
                || ag.target_state.is_pathless()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= self.config.topology_optimization_time_threshold {
                queue.push((idx, ag.topology_opt_time));
            }
        }

        for (idx, _) in queue {
            let ag = &mut self.agents[idx];
            let filter = &*self.filters[ag.params.query_filter_type as usize];
            ag.corridor.optimize_path_topology(
                &self.navquery,
                filter,
                self.config.max_topology_optimization_iterations,
            );
            ag.topology_opt_time = 0.0;
        }
    }

    fn build_proximity_grid(&mut self, agents: &[usize]) {
        self.grid.clear();
        for &idx in agents {
            let ag = &self.agents[idx];
            let p = ag.npos;
            let r = ag.params.radius;
            if !self.grid.add_item(idx, p.x - r, p.z - r, p.x + r, p.z + r) {
                log::trace!("Agent {} only partially registered in the proximity grid", idx);
            }
        }
    }

    fn build_neighbours(&mut self, agents: &[usize]) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking {
                continue;
            }
            let filter = &*self.filters[ag.params.query_filter_type as usize];

            // Refresh the walls once the agent moved far enough or they became invalid
            let update_thr = ag.params.collision_query_range * 0.25;
            if dist_sqr_2d(ag.npos, ag.boundary.center()) > sqr(update_thr)
                || !ag.boundary.is_valid(&self.navquery, filter)
            {
                if let Err(e) = ag.boundary.update(
                    ag.corridor.first_poly(),
                    ag.npos,
                    ag.params.collision_query_range,
                    &self.navquery,
                    filter,
                ) {
                    log::trace!("Boundary update failed for agent {}: {}", idx, e);
                    ag.boundary.reset();
                }
            }

            let neis = self.query_neighbours(idx);
            self.agents[idx].neis = neis;
        }
    }

    fn query_neighbours(&self, idx: usize) -> Vec<CrowdNeighbour> {
        let ag = &self.agents[idx];
        let range = ag.params.collision_query_range;
        let p = ag.npos;

        let mut result: Vec<CrowdNeighbour> = self
            .grid
            .query_items(p.x - range, p.z - range, p.x + range, p.z + range, MAX_GRID_QUERY)
            .into_iter()
            .filter(|&other| other != idx)
            .filter_map(|other| {
                let nei = &self.agents[other];
                let mut diff = p - nei.npos;
                if diff.y.abs() >= (ag.params.height + nei.params.height) / 2.0 {
                    return None;
                }
                diff.y = 0.0;
                let dist = diff.length_squared();
                (dist <= sqr(range)).then_some(CrowdNeighbour { idx: other, dist })
            })
            .collect();

        result.sort_by(|a, b| a.dist.total_cmp(&b.dist));
        result.truncate(self.config.max_neighbours);
        result
    }

    fn find_corners(
        &mut self,
        agents: &[usize],
        debug_idx: Option<usize>,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking || ag.target_state.is_pathless() {
                continue;
            }
            let filter = &*self.filters[ag.params.query_filter_type as usize];

            ag.corners = ag
                .corridor
                .find_corners(&self.navquery, self.config.max_corners);

            // Shortcut toward the corner after next if it is directly visible
            let mut opt = (Vec3::ZERO, Vec3::ZERO);
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty()
            {
                let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                ag.corridor.optimize_path_visibility(
                    target,
                    ag.params.path_optimization_range,
                    &self.navquery,
                    filter,
                );
                opt = (ag.corridor.pos(), target);
            }

            if debug_idx == Some(idx) {
                if let Some(debug) = debug.as_deref_mut() {
                    (debug.opt_start, debug.opt_end) = opt;
                }
            }
        }
    }

    fn trigger_off_mesh_connections(&mut self, agents: &[usize]) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking || ag.target_state.is_pathless() {
                continue;
            }

            let trigger_radius = ag.params.radius * 2.25;
            if !ag.over_offmesh_connection(trigger_radius) {
                continue;
            }
            let Some(connection) = ag.corners.last().map(|c| c.poly) else {
                continue;
            };

            // On failure the validity check replans around the connection
            if let Some((start_pos, end_pos)) = ag
                .corridor
                .move_over_offmesh_connection(connection, &self.navquery)
            {
                let speed = ag.params.max_speed.max(f32::EPSILON);
                ag.animation = CrowdAgentAnimation {
                    active: true,
                    init_pos: ag.npos,
                    start_pos,
                    end_pos,
                    poly_ref: connection,
                    t: 0.0,
                    tmax: dist_2d(start_pos, end_pos) / speed * 0.5,
                };
                ag.state = AgentState::OffMeshConnection;
                ag.corners.clear();
                ag.neis.clear();
                log::trace!("Agent {} entering off-mesh connection {}", idx, connection);
            }
        }
    }

    fn calculate_steering(&mut self, agents: &[usize]) {
        for &idx in agents {
            let ag = &self.agents[idx];
            if ag.state != AgentState::Walking {
                continue;
            }
            if ag.target_state == MoveRequestState::None {
                // Nothing to steer toward, come to a stop
                let ag = &mut self.agents[idx];
                ag.dvel = Vec3::ZERO;
                ag.desired_speed = 0.0;
                continue;
            }

            let (mut dvel, desired_speed) = if ag.target_state == MoveRequestState::Velocity {
                (ag.target_pos, ag.target_pos.length())
            } else {
                let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    ag.calc_smooth_steer_direction()
                } else {
                    ag.calc_straight_steer_direction()
                };
                // Slow down near the end of the path
                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = ag.get_distance_to_goal(slow_down_radius) / slow_down_radius;
                (
                    dir * (ag.params.max_speed * speed_scale),
                    ag.params.max_speed,
                )
            };

            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let separation_weight = ag.params.separation_weight;

                let mut w = 0.0f32;
                let mut disp = Vec3::ZERO;
                for nei in &ag.neis {
                    let mut diff = ag.npos - self.agents[nei.idx].npos;
                    diff.y = 0.0;

                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = separation_weight * (1.0 - sqr(dist * inv_separation_dist));
                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel += disp * (1.0 / w);
                    // Clamp back to the desired speed
                    let speed_sqr = dvel.length_squared();
                    let desired_sqr = sqr(desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel *= desired_sqr / speed_sqr;
                    }
                }
            }

            let ag = &mut self.agents[idx];
            ag.dvel = dvel;
            ag.desired_speed = desired_speed;
        }
    }

    fn plan_velocity(
        &mut self,
        agents: &[usize],
        debug_idx: Option<usize>,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) {
        for &idx in agents {
            let ag = &self.agents[idx];
            if ag.state != AgentState::Walking {
                continue;
            }

            if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                let ag = &mut self.agents[idx];
                ag.nvel = ag.dvel;
                continue;
            }

            self.obstacle_query.reset();

            // Neighbours as moving circles
            for nei in &ag.neis {
                let other = &self.agents[nei.idx];
                self.obstacle_query
                    .add_circle(other.npos, other.params.radius, other.vel, other.dvel);
            }

            // Walls facing the agent as segments
            for j in 0..ag.boundary.segment_count() {
                let Some((s0, s1)) = ag.boundary.segment(j) else {
                    continue;
                };
                if tri_area_2d(ag.npos, s0, s1) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(s0, s1);
            }

            let is_debug = debug_idx == Some(idx);
            let vod = if is_debug {
                debug.as_deref_mut().map(|d| &mut d.vod)
            } else {
                None
            };

            let params = self.obstacle_query_params[ag.params.obstacle_avoidance_type as usize];
            let (nvel, ns) = self.obstacle_query.sample_velocity(
                ag.npos,
                ag.params.radius,
                ag.desired_speed,
                ag.vel,
                ag.dvel,
                &params,
                vod,
            );
            self.telemetry.record_velocity_samples(ns);

            if is_debug {
                if let Some(debug) = debug.as_deref_mut() {
                    debug.vod.normalize_samples();
                }
            }

            self.agents[idx].nvel = nvel;
        }
    }

    fn integrate(&mut self, agents: &[usize], dt: f32) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state == AgentState::Walking {
                ag.integrate(dt);
            }
        }
    }

    fn handle_collisions(&mut self, agents: &[usize]) {
        let factor = self.config.collision_resolve_factor;

        for _ in 0..self.config.collision_resolve_iterations {
            for &idx0 in agents {
                let ag = &self.agents[idx0];
                if ag.state != AgentState::Walking {
                    continue;
                }

                let mut disp = Vec3::ZERO;
                let mut w = 0.0f32;
                for nei in &ag.neis {
                    let idx1 = nei.idx;
                    let other = &self.agents[idx1];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;

                    let rsum = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > sqr(rsum) {
                        continue;
                    }

                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // On top of each other, pick diverging directions
                        let mut dir = Vec3::new(ag.dvel.x, 0.0, ag.dvel.z);
                        if dir.length_squared() < 0.0001 {
                            dir = Vec3::X;
                        }
                        diff = if idx0 > idx1 {
                            Vec3::new(-dir.z, 0.0, dir.x)
                        } else {
                            Vec3::new(dir.z, 0.0, -dir.x)
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((rsum - dist) * 0.5) * factor
                    };

                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp *= 1.0 / w;
                }
                self.agents[idx0].disp = disp;
            }

            for &idx in agents {
                let ag = &mut self.agents[idx];
                if ag.state == AgentState::Walking {
                    ag.npos += ag.disp;
                }
            }
        }
    }

    fn move_agents(&mut self, agents: &[usize]) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != AgentState::Walking {
                continue;
            }
            let filter = &*self.filters[ag.params.query_filter_type as usize];

            // Move along the surface and take the constrained position back
            ag.corridor.move_position(ag.npos, &self.navquery, filter);
            ag.npos = ag.corridor.pos();

            // Without a path the corridor is just the current polygon
            if ag.target_state.is_pathless() {
                let first = ag.corridor.first_poly();
                ag.corridor.reset(first, ag.npos);
                ag.partial = false;
            }
        }
    }

    fn update_off_mesh_connections(&mut self, agents: &[usize], dt: f32) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if !ag.animation.active {
                continue;
            }

            let anim = &mut ag.animation;
            anim.t += dt;
            if anim.t > anim.tmax {
                anim.active = false;
                ag.npos = anim.end_pos;
                ag.state = AgentState::Walking;
                log::trace!("Agent {} finished off-mesh connection", idx);
                continue;
            }

            // Quick approach to the start, then across
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            ag.npos = if anim.t < ta {
                anim.init_pos.lerp(anim.start_pos, tween(anim.t, 0.0, ta))
            } else {
                anim.start_pos.lerp(anim.end_pos, tween(anim.t, ta, tb))
            };

            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
        }
    }
}
