//! Path corridor for smooth path following
//!
//! A corridor is the polygon path an agent follows plus the agent position
//! (always inside the first polygon) and the target (inside the last one).
//! Small movements of either end are absorbed by local surface queries, so
//! the path stays valid while the agent drifts around under local steering.
//! Steering waypoints are extracted on demand by string pulling.

use crowd_common::{dist_2d, dist_sqr_2d, sqr, Vec3};
use nav_query::{NavMeshQuery, PolyRef, PolygonFilter, StraightPathFlags, StraightPathPoint};

/// Corners closer than this to the agent are considered reached
const MIN_TARGET_DIST: f32 = 0.01;

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    pos: Vec3,
    target: Vec3,
    path: Vec<PolyRef>,
    max_path: usize,
}

impl PathCorridor {
    /// Creates an empty corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::with_capacity(max_path),
            max_path: max_path.max(1),
        }
    }

    /// Collapses the corridor to a single polygon at `pos`
    pub fn reset(&mut self, poly: PolyRef, pos: Vec3) {
        self.path.clear();
        self.path.push(poly);
        self.pos = pos;
        self.target = pos;
    }

    /// Finds the upcoming corners from the position toward the target.
    ///
    /// Corners the agent already stands on are dropped, and nothing past the
    /// first off-mesh connection is returned. If the target is within reach
    /// it is the last corner, flagged `END` with a null polygon.
    pub fn find_corners<Q: NavMeshQuery + ?Sized>(
        &self,
        navquery: &Q,
        max_corners: usize,
    ) -> Vec<StraightPathPoint> {
        let Ok(mut corners) =
            navquery.find_straight_path(self.pos, self.target, &self.path, max_corners)
        else {
            return Vec::new();
        };

        let is_off_mesh =
            |c: &StraightPathPoint| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION);

        // Prune points at the beginning of the path which are too close
        let start = corners
            .iter()
            .position(|c| is_off_mesh(c) || dist_sqr_2d(c.pos, self.pos) > sqr(MIN_TARGET_DIST))
            .unwrap_or(corners.len());

        // Prune points after an off-mesh connection
        let end = corners[start..]
            .iter()
            .position(is_off_mesh)
            .map(|i| start + i + 1)
            .unwrap_or(corners.len());

        corners.truncate(end);
        corners.drain(..start);
        corners
    }

    /// Shortcuts the corridor if `next` is directly visible from the position.
    ///
    /// The ray is cast up to `path_optimization_range` and the corridor only
    /// changes when the ray gets (nearly) all the way.
    pub fn optimize_path_visibility<Q: NavMeshQuery + ?Sized>(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) {
        let Some(&first) = self.path.first() else {
            return;
        };

        // Too close to the goal to bother
        let dist = dist_2d(self.pos, next);
        if dist < 0.01 {
            return;
        }

        // Overshoot a little, helps in open fields
        let dist = (dist + 0.01).min(path_optimization_range);
        let delta = next - self.pos;
        let goal = self.pos + delta * (path_optimization_range / dist);

        if let Ok(hit) = navquery.raycast(first, self.pos, goal, filter) {
            if hit.path.len() > 1 && hit.t > 0.99 {
                self.path = merge_corridor_start_shortcut(&self.path, &hit.path, self.max_path);
            }
        }
    }

    /// Re-plans the start of the corridor with a bounded local search.
    ///
    /// Returns true if the corridor was updated.
    pub fn optimize_path_topology<Q: NavMeshQuery + ?Sized>(
        &mut self,
        navquery: &Q,
        filter: &dyn PolygonFilter,
        max_iterations: usize,
    ) -> bool {
        if self.path.len() < 3 {
            return false;
        }

        let mut search = navquery.init_sliced_find_path(
            self.path[0],
            self.path[self.path.len() - 1],
            self.pos,
            self.target,
            filter,
        );
        navquery.update_sliced_find_path(&mut search, max_iterations, filter);
        let (status, res) =
            navquery.finalize_sliced_find_path_partial(&mut search, &self.path, self.max_path);

        if status.is_success() && !res.is_empty() {
            self.path = merge_corridor_start_shortcut(&self.path, &res, self.max_path);
            return true;
        }
        false
    }

    /// Advances the corridor over the off-mesh connection `offmesh_ref`.
    ///
    /// On success the position jumps to the far end of the connection and the
    /// connection's start and end points are returned.
    pub fn move_over_offmesh_connection<Q: NavMeshQuery + ?Sized>(
        &mut self,
        offmesh_ref: PolyRef,
        navquery: &Q,
    ) -> Option<(Vec3, Vec3)> {
        let mut prev_ref = PolyRef::NULL;
        let mut poly_ref = *self.path.first()?;
        let mut npos = 0;
        while npos < self.path.len() && poly_ref != offmesh_ref {
            prev_ref = poly_ref;
            poly_ref = self.path[npos];
            npos += 1;
        }
        if npos == self.path.len() {
            // Connection is not on the corridor
            return None;
        }

        self.path.drain(..npos);

        let (start, end) = navquery
            .get_off_mesh_connection_poly_end_points(prev_ref, poly_ref)
            .ok()?;
        self.pos = end;
        Some((start, end))
    }

    /// Moves the position toward `npos` along the surface, growing or
    /// shrinking the start of the corridor to match.
    pub fn move_position<Q: NavMeshQuery + ?Sized>(
        &mut self,
        npos: Vec3,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> bool {
        let Some(&first) = self.path.first() else {
            return false;
        };
        let Ok((result, visited)) = navquery.move_along_surface(first, self.pos, npos, filter)
        else {
            return false;
        };

        self.path = merge_corridor_start_moved(&self.path, &visited, self.max_path);

        // Stay on top of the surface
        self.pos = result;
        if let Some(h) = navquery.get_poly_height(self.path[0], result) {
            self.pos.y = h;
        }
        true
    }

    /// Moves the target toward `npos` along the surface, adjusting the end of the corridor
    pub fn move_target_position<Q: NavMeshQuery + ?Sized>(
        &mut self,
        npos: Vec3,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> bool {
        let Some(&last) = self.path.last() else {
            return false;
        };
        let Ok((result, visited)) = navquery.move_along_surface(last, self.target, npos, filter)
        else {
            return false;
        };

        self.path = merge_corridor_end_moved(&self.path, &visited, self.max_path);
        self.target = result;
        true
    }

    /// Loads a new path and target. The position is expected to be inside the first polygon.
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        debug_assert!(!path.is_empty());
        self.target = target;
        self.path.clear();
        self.path
            .extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    /// Restarts the corridor at a safe polygon after the first polygon became invalid.
    ///
    /// A null polygon is kept after the safe one so the corridor reads as
    /// invalid until it is re-planned.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        // Short corridors keep their end polygon
        let keep_last = match self.path.len() {
            1 | 2 => self.path.last().copied(),
            _ => None,
        };
        self.path.clear();
        self.path.push(safe_ref);
        self.path.push(PolyRef::NULL);
        if let Some(last) = keep_last {
            self.path.push(last);
        }
    }

    /// Keeps the valid prefix of the corridor and clamps the target onto it
    pub fn trim_invalid_path<Q: NavMeshQuery + ?Sized>(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> bool {
        let n = self
            .path
            .iter()
            .take_while(|&&p| navquery.is_valid_poly_ref(p, filter))
            .count();

        if n == self.path.len() {
            return true;
        }
        if n == 0 {
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        if let Ok((target, _)) = navquery.closest_point_on_poly(self.last_poly(), self.target) {
            self.target = target;
        }
        true
    }

    /// Checks that the first `max_look_ahead` polygons still pass the filter
    pub fn is_valid<Q: NavMeshQuery + ?Sized>(
        &self,
        max_look_ahead: usize,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&p| navquery.is_valid_poly_ref(p, filter))
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    /// Polygon containing the position, null when the corridor is empty
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    /// Polygon containing the target, null when the corridor is empty
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    pub fn max_path(&self) -> usize {
        self.max_path
    }
}

/// Indices of the first polygon of `path` (scanning from the end when
/// `from_end` is set) that also appears in `visited`, paired with its
/// lowest index in `visited`.
fn furthest_common(
    path: &[PolyRef],
    visited: &[PolyRef],
    from_end: bool,
) -> Option<(usize, usize)> {
    let find = |i: usize| visited.iter().position(|&v| v == path[i]).map(|j| (i, j));
    if from_end {
        (0..path.len()).rev().find_map(find)
    } else {
        (0..path.len()).find_map(find)
    }
}

/// Splices the polygons visited while moving the start position into the corridor.
///
/// The result starts at the polygon the position ended up in.
pub fn merge_corridor_start_moved(
    path: &[PolyRef],
    visited: &[PolyRef],
    max_path: usize,
) -> Vec<PolyRef> {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, true) else {
        return path.to_vec();
    };

    let mut result: Vec<PolyRef> = visited[furthest_visited + 1..]
        .iter()
        .rev()
        .copied()
        .collect();
    result.extend_from_slice(&path[furthest_path..]);
    result.truncate(max_path);
    result
}

/// Splices the polygons visited while moving the target into the corridor
pub fn merge_corridor_end_moved(
    path: &[PolyRef],
    visited: &[PolyRef],
    max_path: usize,
) -> Vec<PolyRef> {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, false) else {
        return path.to_vec();
    };

    let mut result = path[..=furthest_path].to_vec();
    result.extend_from_slice(&visited[furthest_visited + 1..]);
    result.truncate(max_path);
    result
}

/// Replaces the start of the corridor with a shortcut that rejoins it
pub fn merge_corridor_start_shortcut(
    path: &[PolyRef],
    visited: &[PolyRef],
    max_path: usize,
) -> Vec<PolyRef> {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, true) else {
        return path.to_vec();
    };
    if furthest_visited == 0 {
        return path.to_vec();
    }

    let mut result = visited[..furthest_visited].to_vec();
    result.extend_from_slice(&path[furthest_path..]);
    result.truncate(max_path);
    result
}
