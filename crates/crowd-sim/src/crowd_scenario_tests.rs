//! End-to-end crowd scenarios on the grid navigation mesh

#[cfg(test)]
mod tests {
    use crate::{
        AgentHandle, AgentParams, AgentState, Crowd, CrowdAgentDebugInfo, CrowdConfig,
        CrowdPhase, MoveRequestState,
    };
    use crowd_common::{dist_2d, Vec3};
    use nav_query::{GridNavMesh, NavMeshQuery, OffMeshConnection, QueryFilter};

    const DT: f32 = 0.1;

    fn mesh(width: usize, depth: usize) -> GridNavMesh {
        GridNavMesh::new(Vec3::ZERO, 1.0, width, depth).unwrap()
    }

    fn crowd(mesh: GridNavMesh, config: CrowdConfig) -> Crowd<GridNavMesh> {
        Crowd::new(config, mesh).unwrap()
    }

    fn params() -> AgentParams {
        AgentParams {
            radius: 0.4,
            collision_query_range: 0.4 * 12.0,
            path_optimization_range: 0.4 * 30.0,
            ..Default::default()
        }
    }

    fn move_to(crowd: &mut Crowd<GridNavMesh>, handle: AgentHandle, target: Vec3) {
        let target_ref = crowd.navquery().poly_at(target);
        assert!(crowd.request_move_target(handle, target_ref, target));
    }

    fn run(crowd: &mut Crowd<GridNavMesh>, ticks: usize) {
        for _ in 0..ticks {
            crowd.update(DT, None);
        }
    }

    #[test]
    fn test_agent_reaches_target() {
        let mut crowd = crowd(mesh(12, 3), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 1.5), params()).unwrap();
        let target = Vec3::new(10.5, 0.0, 1.5);
        move_to(&mut crowd, handle, target);

        run(&mut crowd, 100);

        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.state(), AgentState::Walking);
        assert_eq!(agent.target_state(), MoveRequestState::Valid);
        assert!(!agent.is_partial());
        assert!(agent.pos().x > 10.0, "stopped at {}", agent.pos());
        assert!(dist_2d(agent.pos(), target) < 0.5);
        assert_eq!(agent.corridor().last_poly(), crowd.navquery().poly_at(target));
        assert!(agent.vel().length() < 0.1, "still moving at {}", agent.vel());
    }

    #[test]
    fn test_agent_starting_on_mesh_vertex_reaches_target() {
        // Cell corners fall on integer coordinates, the origin included
        let mesh = GridNavMesh::new(Vec3::new(-4.0, 0.0, -4.0), 1.0, 20, 8).unwrap();
        let mut crowd = crowd(mesh, CrowdConfig::new(4, 0.5));
        let radius = AgentParams {
            radius: 0.5,
            ..Default::default()
        };
        let handle = crowd.add_agent(Vec3::ZERO, radius).unwrap();
        let target = Vec3::new(10.0, 0.0, 0.0);
        move_to(&mut crowd, handle, target);

        for _ in 0..600 {
            crowd.update(1.0 / 60.0, None);
        }

        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::Valid);
        assert!(agent.pos().x > 9.5, "stopped at {}", agent.pos());
    }

    #[test]
    fn test_overlapping_agents_are_pushed_apart() {
        let mut crowd = crowd(mesh(8, 8), CrowdConfig::new(4, 0.5));
        let radius = AgentParams {
            radius: 0.5,
            ..Default::default()
        };
        let a = crowd
            .add_agent(Vec3::new(3.8, 0.0, 4.5), radius.clone())
            .unwrap();
        let b = crowd.add_agent(Vec3::new(4.2, 0.0, 4.5), radius).unwrap();

        crowd.update(DT, None);

        let pa = crowd.agent(a).unwrap().pos();
        let pb = crowd.agent(b).unwrap().pos();
        assert!(dist_2d(pa, pb) >= 0.9, "still {} apart", dist_2d(pa, pb));
        // Pushed symmetrically along the line between them
        assert!(pa.x < 3.8 && pb.x > 4.2);
        assert!((pa.z - 4.5).abs() < 1e-4 && (pb.z - 4.5).abs() < 1e-4);
    }

    #[test]
    fn test_coincident_idle_agents_separate() {
        let mut crowd = crowd(mesh(8, 8), CrowdConfig::new(4, 0.5));
        let radius = AgentParams {
            radius: 0.5,
            ..Default::default()
        };
        let spot = Vec3::new(4.5, 0.0, 4.5);
        let a = crowd.add_agent(spot, radius.clone()).unwrap();
        let b = crowd.add_agent(spot, radius).unwrap();

        run(&mut crowd, 10);

        let pa = crowd.agent(a).unwrap().pos();
        let pb = crowd.agent(b).unwrap().pos();
        assert!(dist_2d(pa, pb) >= 0.9, "still {} apart", dist_2d(pa, pb));
        assert!(crowd.navquery().cell_at(pa).is_some());
        assert!(crowd.navquery().cell_at(pb).is_some());
    }

    #[test]
    fn test_penetration_shrinks_with_each_iteration() {
        let radius = AgentParams {
            radius: 0.5,
            ..Default::default()
        };
        let mut previous = 1.0 - 0.4;
        for iterations in 1..=4 {
            let config = CrowdConfig::new(4, 0.5).with_collision_resolve(iterations, 0.7);
            let mut crowd = crowd(mesh(8, 8), config);
            let a = crowd
                .add_agent(Vec3::new(4.3, 0.0, 4.5), radius.clone())
                .unwrap();
            let b = crowd
                .add_agent(Vec3::new(4.7, 0.0, 4.5), radius.clone())
                .unwrap();

            crowd.update(DT, None);

            let pa = crowd.agent(a).unwrap().pos();
            let pb = crowd.agent(b).unwrap().pos();
            let penetration = 1.0 - dist_2d(pa, pb);
            assert!(
                penetration < previous,
                "{iterations} iterations left {penetration}, fewer left {previous}"
            );
            assert!(penetration >= 0.0);
            previous = penetration;
        }
        assert!(previous < 0.01);
    }

    #[test]
    fn test_agent_stops_when_target_is_lost() {
        let mut crowd = crowd(mesh(16, 3), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 1.5), params()).unwrap();
        move_to(&mut crowd, handle, Vec3::new(14.5, 0.0, 1.5));
        run(&mut crowd, 5);
        assert!(crowd.agent(handle).unwrap().vel().length() > 1.0);

        // Nothing left near the target to fall back to
        for z in 0..3 {
            for x in 12..16 {
                crowd.navquery_mut().block_cell(x, z).unwrap();
            }
        }
        crowd.update(DT, None);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::None);
        assert_eq!(agent.desired_vel(), Vec3::ZERO);
        assert_eq!(agent.desired_speed(), 0.0);
        let stopped_at = agent.pos();

        run(&mut crowd, 20);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::None);
        assert!(agent.vel().length() < 0.01, "still moving at {}", agent.vel());
        assert!(dist_2d(agent.pos(), stopped_at) < 1.0);
    }

    #[test]
    fn test_null_target_is_rejected() {
        let mut crowd = crowd(mesh(8, 8), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), params()).unwrap();
        move_to(&mut crowd, handle, Vec3::new(6.5, 0.0, 6.5));
        run(&mut crowd, 3);
        let before = crowd.agent(handle).unwrap().target_pos();

        // Off the mesh, so there is no polygon under it
        let nowhere = Vec3::new(50.0, 0.0, 50.0);
        let nowhere_ref = crowd.navquery().poly_at(nowhere);
        assert!(!crowd.request_move_target(handle, nowhere_ref, nowhere));

        let agent = crowd.agent(handle).unwrap();
        assert_ne!(agent.target_state(), MoveRequestState::Requesting);
        assert_eq!(agent.target_pos(), before);
    }

    #[test]
    fn test_simulation_is_deterministic() {
        fn simulate() -> Vec<Vec3> {
            let mut crowd = crowd(mesh(10, 10), CrowdConfig::new(8, 0.5));
            let starts = [
                (Vec3::new(1.5, 0.0, 2.5), Vec3::new(8.5, 0.0, 7.5)),
                (Vec3::new(1.5, 0.0, 7.5), Vec3::new(8.5, 0.0, 2.5)),
                (Vec3::new(8.5, 0.0, 5.0), Vec3::new(1.5, 0.0, 5.0)),
                (Vec3::new(5.0, 0.0, 1.5), Vec3::new(5.0, 0.0, 8.5)),
            ];
            let handles: Vec<_> = starts
                .iter()
                .map(|&(start, target)| {
                    let handle = crowd.add_agent(start, params()).unwrap();
                    move_to(&mut crowd, handle, target);
                    handle
                })
                .collect();
            run(&mut crowd, 60);
            handles
                .iter()
                .map(|&h| crowd.agent(h).unwrap().pos())
                .collect()
        }

        assert_eq!(simulate(), simulate());
    }

    #[test]
    fn test_one_path_request_in_flight_per_agent() {
        let config = CrowdConfig::new(4, 0.5)
            .with_max_target_find_path_iterations(1)
            .with_max_find_path_iterations(1);
        let mut crowd = crowd(mesh(30, 1), config);
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), params()).unwrap();
        move_to(&mut crowd, handle, Vec3::new(29.5, 0.0, 0.5));

        crowd.update(DT, None);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::WaitingForPath);
        assert!(agent.path_queue_ref().is_valid());
        assert_eq!(crowd.path_queue().len(), 1);

        // A new target supersedes the queued search
        move_to(&mut crowd, handle, Vec3::new(20.5, 0.0, 0.5));
        assert!(crowd.path_queue().is_empty());
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::Requesting);
        assert!(!agent.path_queue_ref().is_valid());

        crowd.update(DT, None);
        assert_eq!(crowd.path_queue().len(), 1);

        assert!(crowd.remove_agent(handle));
        assert!(crowd.path_queue().is_empty());
    }

    #[test]
    fn test_full_path_queue_keeps_agents_waiting() {
        let config = CrowdConfig::new(4, 0.5)
            .with_path_queue_size(1)
            .with_max_target_find_path_iterations(1)
            .with_max_find_path_iterations(1);
        let mut crowd = crowd(mesh(30, 3), config);
        let a = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), params()).unwrap();
        let b = crowd.add_agent(Vec3::new(0.5, 0.0, 2.5), params()).unwrap();
        move_to(&mut crowd, a, Vec3::new(29.5, 0.0, 0.5));
        move_to(&mut crowd, b, Vec3::new(29.5, 0.0, 2.5));

        let telemetry = crowd.update(DT, None);
        assert_eq!(telemetry.max_time_to_enqueue_request(), (0.0, Some(b.index)));
        assert_eq!(telemetry.max_time_to_find_path().1, Some(a.index));

        assert_eq!(
            crowd.agent(a).unwrap().target_state(),
            MoveRequestState::WaitingForPath
        );
        let waiting = crowd.agent(b).unwrap();
        assert_eq!(waiting.target_state(), MoveRequestState::WaitingForQueue);
        assert!(waiting.target_replan_wait_time() > 0.0);

        // Both eventually get their path
        run(&mut crowd, 250);
        for handle in [a, b] {
            assert_eq!(
                crowd.agent(handle).unwrap().target_state(),
                MoveRequestState::Valid
            );
        }
    }

    #[test]
    fn test_unreachable_target_gives_partial_corridor() {
        let mut mesh = mesh(12, 3);
        for z in 0..3 {
            mesh.block_cell(8, z).unwrap();
        }
        let mut crowd = crowd(mesh, CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 1.5), params()).unwrap();
        let target = Vec3::new(10.5, 0.0, 1.5);
        move_to(&mut crowd, handle, target);

        run(&mut crowd, 5);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::Valid);
        assert!(agent.is_partial());
        assert_ne!(agent.corridor().last_poly(), agent.target_ref());
        assert!(agent.corridor().target().x <= 8.0);

        // Walks up to the gap and stays on this side of it
        run(&mut crowd, 100);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.state(), AgentState::Walking);
        assert!(agent.pos().x <= 8.0);
        assert!(agent.pos().x > 6.5, "stopped at {}", agent.pos());
        assert_ne!(agent.target_state(), MoveRequestState::Failed);
    }

    #[test]
    fn test_failed_search_marks_request_failed() {
        let config = CrowdConfig::new(4, 0.5)
            .with_max_target_find_path_iterations(12)
            .with_max_find_path_iterations(1);
        let mut crowd = crowd(mesh(30, 1), config);
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), params()).unwrap();
        move_to(&mut crowd, handle, Vec3::new(29.5, 0.0, 0.5));

        crowd.update(DT, None);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::WaitingForPath);
        let queued_from = agent.corridor().last_poly();
        assert!(agent.corridor().path_count() > crowd.config().check_look_ahead);

        // Remove the polygon the queued search starts from, beyond the look-ahead
        let (x, z) = (queued_from.id() as usize - 1, 0);
        crowd.navquery_mut().block_cell(x, z).unwrap();

        crowd.update(DT, None);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::Failed);
        assert!(!agent.path_queue_ref().is_valid());
        assert_eq!(agent.target_replan_time(), 0.0);
        assert!(crowd.path_queue().is_empty());
    }

    #[test]
    fn test_lost_target_polygon_is_recovered() {
        let mut crowd = crowd(mesh(8, 8), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), params()).unwrap();
        let target = Vec3::new(6.5, 0.0, 6.5);
        move_to(&mut crowd, handle, target);
        run(&mut crowd, 3);

        crowd.navquery_mut().block_cell(6, 6).unwrap();
        run(&mut crowd, 3);

        let agent = crowd.agent(handle).unwrap();
        let filter = QueryFilter::default();
        assert!(crowd.navquery().is_valid_poly_ref(agent.target_ref(), &filter));
        assert_ne!(agent.target_ref(), crowd.navquery().cell_ref(6, 6));
        assert!(dist_2d(agent.target_pos(), target) <= 0.5 + 1e-4);
    }

    #[test]
    fn test_agent_recovers_from_blocked_polygon() {
        let mut crowd = crowd(mesh(8, 8), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(3.5, 0.0, 3.5), params()).unwrap();
        let blocked = crowd.navquery().cell_ref(3, 3);
        assert_eq!(crowd.agent(handle).unwrap().corridor().first_poly(), blocked);

        crowd.navquery_mut().block_cell(3, 3).unwrap();
        crowd.update(DT, None);

        let agent = crowd.agent(handle).unwrap();
        let filter = QueryFilter::default();
        assert_eq!(agent.state(), AgentState::Walking);
        assert_ne!(agent.corridor().first_poly(), blocked);
        assert!(crowd
            .navquery()
            .is_valid_poly_ref(agent.corridor().first_poly(), &filter));
    }

    #[test]
    fn test_agent_without_mesh_becomes_invalid() {
        let mut crowd = crowd(mesh(3, 3), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), params()).unwrap();
        for z in 0..3 {
            for x in 0..3 {
                crowd.navquery_mut().block_cell(x, z).unwrap();
            }
        }

        crowd.update(DT, None);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.state(), AgentState::Invalid);
        assert!(agent.corridor().first_poly().is_null());

        // Invalid agents are left alone
        let pos = agent.pos();
        run(&mut crowd, 5);
        assert_eq!(crowd.agent(handle).unwrap().pos(), pos);
    }

    #[test]
    fn test_agents_converge_and_stay_on_mesh() {
        let mut crowd = crowd(mesh(10, 10), CrowdConfig::new(8, 0.5));
        let routes = [
            (Vec3::new(1.5, 0.0, 2.5), Vec3::new(8.5, 0.0, 2.5)),
            (Vec3::new(1.5, 0.0, 5.0), Vec3::new(8.5, 0.0, 5.0)),
            (Vec3::new(1.5, 0.0, 7.5), Vec3::new(8.5, 0.0, 7.5)),
            (Vec3::new(8.5, 0.0, 3.75), Vec3::new(1.5, 0.0, 3.75)),
            (Vec3::new(8.5, 0.0, 6.25), Vec3::new(1.5, 0.0, 6.25)),
        ];
        let agents: Vec<_> = routes
            .iter()
            .map(|&(start, target)| {
                let handle = crowd.add_agent(start, params()).unwrap();
                move_to(&mut crowd, handle, target);
                (handle, target)
            })
            .collect();

        for _ in 0..300 {
            crowd.update(DT, None);
            for &(handle, _) in &agents {
                let agent = crowd.agent(handle).unwrap();
                let pos = agent.pos();
                assert!(pos.is_finite());
                assert!(
                    crowd.navquery().cell_at(pos).is_some(),
                    "{handle} left the mesh at {pos}"
                );
                assert!(pos.y.abs() < 1e-4);
            }
        }

        for &(handle, target) in &agents {
            let agent = crowd.agent(handle).unwrap();
            assert_eq!(agent.target_state(), MoveRequestState::Valid);
            assert!(
                dist_2d(agent.pos(), target) < 0.75,
                "{handle} ended at {} instead of {target}",
                agent.pos()
            );
        }
    }

    #[test]
    fn test_off_mesh_connection_traversal() {
        let mut mesh = mesh(12, 3);
        for z in 0..3 {
            mesh.block_cell(5, z).unwrap();
        }
        let link = mesh
            .add_off_mesh_connection(OffMeshConnection::new(
                Vec3::new(4.5, 0.0, 1.5),
                Vec3::new(6.5, 0.0, 1.5),
                0.5,
            ))
            .unwrap();

        let mut crowd = crowd(mesh, CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), params()).unwrap();
        let target = Vec3::new(10.5, 0.0, 1.5);
        move_to(&mut crowd, handle, target);

        let mut traversed = false;
        for _ in 0..200 {
            crowd.update(DT, None);
            let agent = crowd.agent(handle).unwrap();
            if agent.state() == AgentState::OffMeshConnection {
                traversed = true;
                let anim = agent.animation();
                assert!(anim.active);
                assert_eq!(anim.poly_ref, link);
                assert_eq!(anim.end_pos, Vec3::new(6.5, 0.0, 1.5));
                assert_eq!(agent.vel(), Vec3::ZERO);
                assert!(agent.neighbours().is_empty());
            }
        }

        let agent = crowd.agent(handle).unwrap();
        assert!(traversed);
        assert!(!agent.animation().active);
        assert_eq!(agent.state(), AgentState::Walking);
        assert!(agent.pos().x > 9.5, "stopped at {}", agent.pos());
    }

    #[test]
    fn test_velocity_request_moves_agent() {
        let mut crowd = crowd(mesh(12, 3), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), params()).unwrap();
        assert!(crowd.request_move_velocity(handle, Vec3::new(1.0, 0.0, 0.0)));

        run(&mut crowd, 20);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::Velocity);
        assert_eq!(agent.corridor().path_count(), 1);
        assert!((agent.desired_speed() - 1.0).abs() < 1e-5);
        assert!(agent.pos().x > 2.5);

        // Stopping clears the desired velocity and the agent slows down
        assert!(crowd.reset_move_target(handle));
        run(&mut crowd, 20);
        let agent = crowd.agent(handle).unwrap();
        assert_eq!(agent.target_state(), MoveRequestState::None);
        assert!(agent.vel().length() < 0.05);
    }

    #[test]
    fn test_wall_stops_velocity_agent() {
        let mut crowd = crowd(mesh(4, 3), CrowdConfig::new(4, 0.5));
        let handle = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), params()).unwrap();
        crowd.request_move_velocity(handle, Vec3::new(3.0, 0.0, 0.0));

        run(&mut crowd, 50);
        let agent = crowd.agent(handle).unwrap();
        assert!(agent.pos().x <= 4.0 + 1e-4);
        assert!(crowd.navquery().cell_at(agent.pos()).is_some());
    }

    #[test]
    fn test_telemetry_and_debug_info() {
        let mut crowd = crowd(mesh(10, 10), CrowdConfig::new(8, 0.5));
        let a = crowd.add_agent(Vec3::new(1.5, 0.0, 5.0), params()).unwrap();
        let b = crowd.add_agent(Vec3::new(8.5, 0.0, 5.2), params()).unwrap();
        move_to(&mut crowd, a, Vec3::new(8.5, 0.0, 5.0));
        move_to(&mut crowd, b, Vec3::new(1.5, 0.0, 5.0));

        let mut debug = CrowdAgentDebugInfo::new(a);
        for _ in 0..5 {
            crowd.update(DT, Some(&mut debug));
        }

        let telemetry = crowd.telemetry();
        assert!(telemetry.velocity_samples() > 0);
        for phase in CrowdPhase::ALL {
            assert!(telemetry.phase_time(phase) <= telemetry.total_time());
        }
        assert!(!telemetry.to_string().is_empty());

        assert!(debug.vod.sample_count() > 0);
        assert!(debug.vod.sample_count() <= telemetry.velocity_samples());
        for sample in debug.vod.samples() {
            assert!((0.0..=1.0).contains(&sample.penalty));
        }

        // A removed agent is no longer recorded
        crowd.remove_agent(a);
        let mut stale = CrowdAgentDebugInfo::new(a);
        crowd.update(DT, Some(&mut stale));
        assert_eq!(stale.vod.sample_count(), 0);
    }

    #[test]
    fn test_many_agents_in_small_space() {
        let mut crowd = crowd(mesh(6, 6), CrowdConfig::new(16, 0.5));
        let mut handles = Vec::new();
        for i in 0..16 {
            let pos = Vec3::new(2.5 + (i % 4) as f32 * 0.3, 0.0, 2.5 + (i / 4) as f32 * 0.3);
            handles.push(crowd.add_agent(pos, params()).unwrap());
        }
        assert!(crowd.add_agent(Vec3::new(1.0, 0.0, 1.0), params()).is_err());

        run(&mut crowd, 30);
        for handle in handles {
            let agent = crowd.agent(handle).unwrap();
            assert!(agent.neighbours().len() <= crowd.config().max_neighbours);
            assert!(crowd.navquery().cell_at(agent.pos()).is_some());
        }
    }
}
