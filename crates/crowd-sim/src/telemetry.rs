//! Per-tick timing and counters of the crowd pipeline

use std::fmt;
use std::time::Duration;
use web_time::Instant;

const PHASE_COUNT: usize = 13;

/// The ordered phases of one crowd update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrowdPhase {
    CheckPathValidity,
    UpdateMoveRequests,
    OptimizeTopology,
    BuildProximityGrid,
    BuildNeighbours,
    FindCorners,
    TriggerOffMeshConnections,
    CalculateSteering,
    PlanVelocity,
    Integrate,
    HandleCollisions,
    MoveAgents,
    UpdateOffMeshConnections,
}

impl CrowdPhase {
    /// Every phase in execution order
    pub const ALL: [CrowdPhase; PHASE_COUNT] = [
        CrowdPhase::CheckPathValidity,
        CrowdPhase::UpdateMoveRequests,
        CrowdPhase::OptimizeTopology,
        CrowdPhase::BuildProximityGrid,
        CrowdPhase::BuildNeighbours,
        CrowdPhase::FindCorners,
        CrowdPhase::TriggerOffMeshConnections,
        CrowdPhase::CalculateSteering,
        CrowdPhase::PlanVelocity,
        CrowdPhase::Integrate,
        CrowdPhase::HandleCollisions,
        CrowdPhase::MoveAgents,
        CrowdPhase::UpdateOffMeshConnections,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CrowdPhase::CheckPathValidity => "checkPathValidity",
            CrowdPhase::UpdateMoveRequests => "updateMoveRequest",
            CrowdPhase::OptimizeTopology => "updateTopologyOptimization",
            CrowdPhase::BuildProximityGrid => "buildProximityGrid",
            CrowdPhase::BuildNeighbours => "buildNeighbours",
            CrowdPhase::FindCorners => "findCorners",
            CrowdPhase::TriggerOffMeshConnections => "triggerOffMeshConnections",
            CrowdPhase::CalculateSteering => "calculateSteering",
            CrowdPhase::PlanVelocity => "planVelocity",
            CrowdPhase::Integrate => "integrate",
            CrowdPhase::HandleCollisions => "handleCollisions",
            CrowdPhase::MoveAgents => "moveAgents",
            CrowdPhase::UpdateOffMeshConnections => "updateOffMeshConnections",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CrowdPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Measurements of the last crowd update
#[derive(Debug, Clone, Default)]
pub struct CrowdTelemetry {
    phase_times: [Duration; PHASE_COUNT],
    velocity_samples: usize,
    max_time_to_enqueue_request: f32,
    max_time_to_enqueue_request_agent: Option<usize>,
    max_time_to_find_path: f32,
    max_time_to_find_path_agent: Option<usize>,
}

impl CrowdTelemetry {
    /// Clears everything for a new tick
    pub(crate) fn start(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn record_phase(&mut self, phase: CrowdPhase, started: Instant) {
        self.phase_times[phase.index()] += started.elapsed();
    }

    pub(crate) fn record_velocity_samples(&mut self, samples: usize) {
        self.velocity_samples += samples;
    }

    pub(crate) fn record_max_time_to_enqueue_request(&mut self, time: f32, agent: usize) {
        if time > self.max_time_to_enqueue_request
            || self.max_time_to_enqueue_request_agent.is_none()
        {
            self.max_time_to_enqueue_request = time;
            self.max_time_to_enqueue_request_agent = Some(agent);
        }
    }

    pub(crate) fn record_max_time_to_find_path(&mut self, time: f32, agent: usize) {
        if time > self.max_time_to_find_path || self.max_time_to_find_path_agent.is_none() {
            self.max_time_to_find_path = time;
            self.max_time_to_find_path_agent = Some(agent);
        }
    }

    /// Wall-clock time spent in a phase
    pub fn phase_time(&self, phase: CrowdPhase) -> Duration {
        self.phase_times[phase.index()]
    }

    /// Wall-clock time of the whole update
    pub fn total_time(&self) -> Duration {
        self.phase_times.iter().sum()
    }

    /// Candidate velocities evaluated by obstacle avoidance
    pub fn velocity_samples(&self) -> usize {
        self.velocity_samples
    }

    /// Longest time an agent has been waiting for a path queue slot, and the agent
    pub fn max_time_to_enqueue_request(&self) -> (f32, Option<usize>) {
        (
            self.max_time_to_enqueue_request,
            self.max_time_to_enqueue_request_agent,
        )
    }

    /// Longest time an agent has been waiting for a queued path, and the agent
    pub fn max_time_to_find_path(&self) -> (f32, Option<usize>) {
        (self.max_time_to_find_path, self.max_time_to_find_path_agent)
    }
}

impl fmt::Display for CrowdTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {:?}, {} velocity samples",
            self.total_time(),
            self.velocity_samples
        )?;
        for phase in CrowdPhase::ALL {
            write!(f, ", {} {:?}", phase, self.phase_time(phase))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        for (i, phase) in CrowdPhase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
        assert_eq!(CrowdPhase::Integrate.to_string(), "integrate");
    }

    #[test]
    fn test_maxima_keep_worst_agent() {
        let mut telemetry = CrowdTelemetry::default();
        assert_eq!(telemetry.max_time_to_find_path(), (0.0, None));

        telemetry.record_max_time_to_find_path(0.5, 3);
        telemetry.record_max_time_to_find_path(0.2, 4);
        telemetry.record_max_time_to_find_path(0.9, 1);
        assert_eq!(telemetry.max_time_to_find_path(), (0.9, Some(1)));

        telemetry.record_max_time_to_enqueue_request(0.0, 7);
        assert_eq!(telemetry.max_time_to_enqueue_request(), (0.0, Some(7)));

        telemetry.record_velocity_samples(10);
        telemetry.record_velocity_samples(5);
        assert_eq!(telemetry.velocity_samples(), 15);

        telemetry.start();
        assert_eq!(telemetry.velocity_samples(), 0);
        assert_eq!(telemetry.max_time_to_find_path(), (0.0, None));
    }

    #[test]
    fn test_phase_times_accumulate() {
        let mut telemetry = CrowdTelemetry::default();
        let started = Instant::now();
        telemetry.record_phase(CrowdPhase::PlanVelocity, started);
        telemetry.record_phase(CrowdPhase::PlanVelocity, started);
        assert!(telemetry.phase_time(CrowdPhase::PlanVelocity) >= Duration::ZERO);
        assert_eq!(telemetry.phase_time(CrowdPhase::Integrate), Duration::ZERO);
        assert_eq!(
            telemetry.total_time(),
            telemetry.phase_time(CrowdPhase::PlanVelocity)
        );
    }
}
