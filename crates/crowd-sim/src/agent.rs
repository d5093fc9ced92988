//! Crowd agent state
//!
//! An agent is plain data owned by the crowd's arena. The crowd pipeline
//! mutates it phase by phase; callers only read it back through the
//! accessors here, and change it through the [`Crowd`](crate::Crowd) request
//! methods.

use crate::{LocalBoundary, PathCorridor, PathQueueRef};
use crowd_common::{dist_2d, dist_sqr_2d, sqr, Vec3};
use nav_query::{PolyRef, StraightPathFlags, StraightPathPoint};
use std::fmt;

/// Default radius of an agent
const DEFAULT_AGENT_RADIUS: f32 = 0.6;

/// Default height of an agent
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;

/// Default max acceleration of an agent
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;

/// Default max speed of an agent
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

/// Navigation state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    /// Not on the navigation mesh
    #[default]
    Invalid,
    /// Following its corridor on the mesh
    Walking,
    /// Being animated across an off-mesh connection
    OffMeshConnection,
}

/// Progress of an agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
}

impl MoveRequestState {
    /// True when the agent has no path to follow, either idle or under velocity control
    pub fn is_pathless(self) -> bool {
        matches!(self, MoveRequestState::None | MoveRequestState::Velocity)
    }
}

bitflags::bitflags! {
    /// Per-agent steering features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct UpdateFlags: u8 {
        /// Smooth the steering direction toward the corner after next
        const ANTICIPATE_TURNS = 0x01;
        /// Sample a collision-free velocity around neighbours and walls
        const OBSTACLE_AVOIDANCE = 0x02;
        /// Push the desired velocity away from close neighbours
        const SEPARATION = 0x04;
        /// Shortcut the corridor toward visible corners
        const OPTIMIZE_VIS = 0x08;
        /// Periodically re-plan the start of the corridor
        const OPTIMIZE_TOPO = 0x10;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OBSTACLE_AVOIDANCE | UpdateFlags::SEPARATION
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct AgentParams {
    /// Radius of the agent
    pub radius: f32,
    /// Height of the agent
    pub height: f32,
    /// Maximum acceleration of the agent
    pub max_acceleration: f32,
    /// Maximum speed of the agent
    pub max_speed: f32,
    /// How far neighbours and walls are considered for steering
    pub collision_query_range: f32,
    /// How far ahead visibility optimization looks
    pub path_optimization_range: f32,
    /// How strongly neighbours push each other apart
    pub separation_weight: f32,
    /// Steering features of the agent
    pub update_flags: UpdateFlags,
    /// Index of the avoidance preset used by the agent
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter used by the agent
    pub query_filter_type: u8,
    /// Opaque value for the caller
    pub user_data: usize,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: DEFAULT_AGENT_RADIUS * 12.0,
            path_optimization_range: DEFAULT_AGENT_RADIUS * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 0,
            query_filter_type: 0,
            user_data: 0,
        }
    }
}

/// Stable handle of an agent in a crowd.
///
/// Slots are recycled, the generation tells a live agent from a removed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentHandle {
    pub index: usize,
    pub generation: u32,
}

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent {}v{}", self.index, self.generation)
    }
}

/// A nearby agent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    /// Arena index of the neighbour
    pub idx: usize,
    /// Squared distance to the neighbour
    pub dist: f32,
}

/// Tween state of an off-mesh connection traversal
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrowdAgentAnimation {
    pub active: bool,
    /// Where the agent stood when the traversal started
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    /// The connection being traversed
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

/// An agent managed by the crowd
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub(crate) active: bool,
    pub(crate) state: AgentState,
    /// The corridor ends short of the requested target
    pub(crate) partial: bool,
    pub(crate) corridor: PathCorridor,
    pub(crate) boundary: LocalBoundary,
    pub(crate) topology_opt_time: f32,
    pub(crate) neis: Vec<CrowdNeighbour>,
    pub(crate) desired_speed: f32,

    pub(crate) npos: Vec3,
    /// Collision displacement accumulator
    pub(crate) disp: Vec3,
    /// Desired velocity
    pub(crate) dvel: Vec3,
    /// Velocity picked by avoidance
    pub(crate) nvel: Vec3,
    pub(crate) vel: Vec3,

    pub(crate) params: AgentParams,
    pub(crate) corners: Vec<StraightPathPoint>,

    pub(crate) target_state: MoveRequestState,
    pub(crate) target_ref: PolyRef,
    /// Target position, or the velocity in velocity mode
    pub(crate) target_pos: Vec3,
    pub(crate) target_path_queue_ref: PathQueueRef,
    pub(crate) target_replan: bool,
    pub(crate) target_replan_time: f32,
    pub(crate) target_replan_wait_time: f32,

    pub(crate) animation: CrowdAgentAnimation,
}

impl CrowdAgent {
    pub(crate) fn new(max_path: usize) -> Self {
        Self {
            active: false,
            state: AgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(max_path),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::new(),
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            disp: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params: AgentParams::default(),
            corners: Vec::new(),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            target_path_queue_ref: PathQueueRef::INVALID,
            target_replan: false,
            target_replan_time: 0.0,
            target_replan_wait_time: 0.0,
            animation: CrowdAgentAnimation::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Current position
    pub fn pos(&self) -> Vec3 {
        self.npos
    }

    /// Actual velocity
    pub fn vel(&self) -> Vec3 {
        self.vel
    }

    /// Desired velocity before avoidance
    pub fn desired_vel(&self) -> Vec3 {
        self.dvel
    }

    /// Velocity chosen by avoidance
    pub fn new_vel(&self) -> Vec3 {
        self.nvel
    }

    pub fn desired_speed(&self) -> f32 {
        self.desired_speed
    }

    pub fn params(&self) -> &AgentParams {
        &self.params
    }

    pub fn corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    /// Upcoming steering corners
    pub fn corners(&self) -> &[StraightPathPoint] {
        &self.corners
    }

    /// Neighbours found this tick, nearest first
    pub fn neighbours(&self) -> &[CrowdNeighbour] {
        &self.neis
    }

    pub fn target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn target_pos(&self) -> Vec3 {
        self.target_pos
    }

    /// Seconds since the path to the target was last (re)planned
    pub fn target_replan_time(&self) -> f32 {
        self.target_replan_time
    }

    /// Seconds spent waiting for a path queue slot or result
    pub fn target_replan_wait_time(&self) -> f32 {
        self.target_replan_wait_time
    }

    /// True when the corridor cannot reach the requested target
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Outstanding path queue request, invalid when none
    pub fn path_queue_ref(&self) -> PathQueueRef {
        self.target_path_queue_ref
    }

    pub fn animation(&self) -> &CrowdAgentAnimation {
        &self.animation
    }

    /// True when the last corner is an off-mesh connection within `radius`
    pub fn over_offmesh_connection(&self, radius: f32) -> bool {
        match self.corners.last() {
            Some(c) if c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) => {
                dist_sqr_2d(self.npos, c.pos) < sqr(radius)
            }
            _ => false,
        }
    }

    /// Distance to the end of the path, or `range` if the end is not in sight
    pub fn get_distance_to_goal(&self, range: f32) -> f32 {
        match self.corners.last() {
            Some(c) if c.flags.contains(StraightPathFlags::END) => {
                dist_2d(self.npos, c.pos).min(range)
            }
            _ => range,
        }
    }

    /// Direction toward the first corner, bent toward the second one.
    ///
    /// The closer the first corner, the more the agent already turns toward
    /// the next, which rounds off sharp corners.
    pub fn calc_smooth_steer_direction(&self) -> Vec3 {
        let Some(c0) = self.corners.first() else {
            return Vec3::ZERO;
        };
        let c1 = &self.corners[1.min(self.corners.len() - 1)];

        let mut dir0 = c0.pos - self.npos;
        let mut dir1 = c1.pos - self.npos;
        dir0.y = 0.0;
        dir1.y = 0.0;

        let len0 = dir0.length();
        let len1 = dir1.length();
        if len1 > 0.001 {
            dir1 /= len1;
        }

        Vec3::new(
            dir0.x - dir1.x * len0 * 0.5,
            0.0,
            dir0.z - dir1.z * len0 * 0.5,
        )
        .normalize_or_zero()
    }

    /// Direction toward the first corner on the XZ plane
    pub fn calc_straight_steer_direction(&self) -> Vec3 {
        let Some(c0) = self.corners.first() else {
            return Vec3::ZERO;
        };
        let mut dir = c0.pos - self.npos;
        dir.y = 0.0;
        dir.normalize_or_zero()
    }

    /// Accelerates toward the new velocity and advances the position
    pub(crate) fn integrate(&mut self, dt: f32) {
        let max_delta = self.params.max_acceleration * dt;
        let mut dv = self.nvel - self.vel;
        let ds = dv.length();
        if ds > max_delta {
            dv *= max_delta / ds;
        }
        self.vel += dv;

        if self.vel.length() > 0.0001 {
            self.npos += self.vel * dt;
        } else {
            self.vel = Vec3::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corner(x: f32, z: f32, flags: StraightPathFlags) -> StraightPathPoint {
        StraightPathPoint {
            pos: Vec3::new(x, 0.0, z),
            flags,
            poly: PolyRef::new(1),
        }
    }

    #[test]
    fn test_default_params() {
        let params = AgentParams::default();
        assert_eq!(params.radius, 0.6);
        assert!(params.update_flags.contains(UpdateFlags::SEPARATION));
        assert!(!params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO));
    }

    #[test]
    fn test_pathless_states() {
        assert!(MoveRequestState::None.is_pathless());
        assert!(MoveRequestState::Velocity.is_pathless());
        assert!(!MoveRequestState::Valid.is_pathless());
        assert!(!MoveRequestState::Failed.is_pathless());
    }

    #[test]
    fn test_distance_to_goal() {
        let mut agent = CrowdAgent::new(16);
        assert_eq!(agent.get_distance_to_goal(2.0), 2.0);

        agent.corners = vec![corner(3.0, 0.0, StraightPathFlags::empty())];
        assert_eq!(agent.get_distance_to_goal(2.0), 2.0);

        agent.corners = vec![corner(0.5, 0.0, StraightPathFlags::END)];
        assert!((agent.get_distance_to_goal(2.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_over_offmesh_connection() {
        let mut agent = CrowdAgent::new(16);
        agent.corners = vec![
            corner(1.0, 0.0, StraightPathFlags::empty()),
            corner(1.0, 1.0, StraightPathFlags::OFFMESH_CONNECTION),
        ];
        agent.npos = Vec3::new(1.0, 0.0, 0.5);
        assert!(agent.over_offmesh_connection(0.6));
        assert!(!agent.over_offmesh_connection(0.4));

        agent.corners.pop();
        assert!(!agent.over_offmesh_connection(10.0));
    }

    #[test]
    fn test_steer_directions() {
        let mut agent = CrowdAgent::new(16);
        assert_eq!(agent.calc_straight_steer_direction(), Vec3::ZERO);
        assert_eq!(agent.calc_smooth_steer_direction(), Vec3::ZERO);

        agent.corners = vec![
            corner(2.0, 0.0, StraightPathFlags::empty()),
            corner(2.0, 2.0, StraightPathFlags::END),
        ];
        let straight = agent.calc_straight_steer_direction();
        assert!((straight - Vec3::X).length() < 1e-6);

        // The second corner pulls the direction off the straight line
        let smooth = agent.calc_smooth_steer_direction();
        assert!((smooth.length() - 1.0).abs() < 1e-5);
        assert!(smooth.x > 0.0);
        assert!(smooth.z.abs() > 0.1);
        assert_eq!(smooth.y, 0.0);
    }

    #[test]
    fn test_integrate_limits_acceleration() {
        let mut agent = CrowdAgent::new(16);
        agent.params.max_acceleration = 4.0;
        agent.nvel = Vec3::new(10.0, 0.0, 0.0);

        agent.integrate(0.5);
        assert!((agent.vel - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-6);
        assert!((agent.npos - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);

        // Tiny velocities snap to rest
        agent.vel = Vec3::new(0.00001, 0.0, 0.0);
        agent.nvel = agent.vel;
        let before = agent.npos;
        agent.integrate(0.5);
        assert_eq!(agent.vel, Vec3::ZERO);
        assert_eq!(agent.npos, before);
    }
}
