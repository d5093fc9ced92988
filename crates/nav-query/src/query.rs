//! The navigation mesh query contract consumed by the crowd
//!
//! The crowd never owns or inspects mesh data. Everything it needs from the
//! polygon graph goes through [`NavMeshQuery`]. Geometric queries return
//! [`Result`]; the sliced path search is status driven so callers can tell
//! "still running" and "partial" apart from outright failure.

use crate::{PolyRef, PolygonFilter, Status};
use crowd_common::Result;
use glam::Vec3;

bitflags::bitflags! {
    /// Flags attached to each straight path vertex
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StraightPathFlags: u8 {
        /// The vertex is the start position of the path
        const START = 0x01;
        /// The vertex is the end position of the path
        const END = 0x02;
        /// The vertex is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// A vertex of a string-pulled path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon entered at this vertex, null at the end of the path
    pub poly: PolyRef,
}

/// Result of a surface raycast
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment, `f32::MAX` when the end was reached
    pub t: f32,
    /// Normal of the wall that was hit, zero when nothing was hit
    pub hit_normal: Vec3,
    /// Polygons visited by the ray
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    /// Returns true if the ray reached its end without hitting a wall
    pub fn reached_end(&self) -> bool {
        self.t == f32::MAX
    }
}

/// Progress of a sliced (incremental) path search
pub trait SlicedSearch {
    /// Current status of the search
    fn status(&self) -> Status;
}

/// Polygon queries the crowd consumes.
///
/// The sliced search state is owned by the caller ([`NavMeshQuery::Search`]),
/// so any number of searches can be in flight at once and advanced
/// independently.
pub trait NavMeshQuery {
    /// Caller-owned state of one sliced path search
    type Search: SlicedSearch;

    /// Finds the polygon nearest to `center` within `half_extents`.
    ///
    /// Returns the polygon and the closest point on it, or `None` if no
    /// polygon accepted by the filter overlaps the search box.
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Option<(PolyRef, Vec3)>;

    /// Returns true if the reference points at a live polygon accepted by the filter
    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &dyn PolygonFilter) -> bool;

    /// Projects `pos` onto the polygon. The flag tells whether `pos` was over it.
    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)>;

    /// Height of the polygon surface under `pos`
    fn get_poly_height(&self, poly: PolyRef, pos: Vec3) -> Option<f32>;

    /// Moves from `start` towards `end` constrained to the surface.
    ///
    /// Returns the reached position and the polygons visited, first to last.
    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)>;

    /// String-pulls a polygon path into at most `max_points` vertices
    fn find_straight_path(
        &self,
        start: Vec3,
        end: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>>;

    /// Casts a ray along the surface from `start` towards `end`
    fn raycast(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<RaycastHit>;

    /// Collects connected polygons whose portals lie within `radius` of `center`
    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &dyn PolygonFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Edges of the polygon that are not shared with a passable neighbour
    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &dyn PolygonFilter,
    ) -> Result<Vec<(Vec3, Vec3)>>;

    /// Start and end of an off-mesh connection as seen when entering it from `prev_ref`
    fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        connection_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)>;

    /// Starts a sliced path search. Invalid input yields a failed search.
    fn init_sliced_find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Self::Search;

    /// Runs at most `max_iters` search iterations.
    ///
    /// Returns the new status and the number of iterations performed.
    fn update_sliced_find_path(
        &self,
        search: &mut Self::Search,
        max_iters: usize,
        filter: &dyn PolygonFilter,
    ) -> (Status, usize);

    /// Extracts the path found so far (to the best node when the goal was not reached)
    fn finalize_sliced_find_path(
        &self,
        search: &mut Self::Search,
        max_path: usize,
    ) -> (Status, Vec<PolyRef>);

    /// Like [`NavMeshQuery::finalize_sliced_find_path`], but ends the path at the
    /// furthest polygon of `existing` the search reached, keeping it consistent
    /// with a path the caller already follows.
    fn finalize_sliced_find_path_partial(
        &self,
        search: &mut Self::Search,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>);
}

impl<T: NavMeshQuery + ?Sized> NavMeshQuery for &T {
    type Search = T::Search;

    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Option<(PolyRef, Vec3)> {
        (**self).find_nearest_poly(center, half_extents, filter)
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &dyn PolygonFilter) -> bool {
        (**self).is_valid_poly_ref(poly, filter)
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        (**self).closest_point_on_poly(poly, pos)
    }

    fn get_poly_height(&self, poly: PolyRef, pos: Vec3) -> Option<f32> {
        (**self).get_poly_height(poly, pos)
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        (**self).move_along_surface(start_ref, start, end, filter)
    }

    fn find_straight_path(
        &self,
        start: Vec3,
        end: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        (**self).find_straight_path(start, end, path, max_points)
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<RaycastHit> {
        (**self).raycast(start_ref, start, end, filter)
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &dyn PolygonFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        (**self).find_local_neighbourhood(start_ref, center, radius, filter, max_result)
    }

    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &dyn PolygonFilter,
    ) -> Result<Vec<(Vec3, Vec3)>> {
        (**self).get_poly_wall_segments(poly, filter)
    }

    fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        connection_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        (**self).get_off_mesh_connection_poly_end_points(prev_ref, connection_ref)
    }

    fn init_sliced_find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Self::Search {
        (**self).init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter)
    }

    fn update_sliced_find_path(
        &self,
        search: &mut Self::Search,
        max_iters: usize,
        filter: &dyn PolygonFilter,
    ) -> (Status, usize) {
        (**self).update_sliced_find_path(search, max_iters, filter)
    }

    fn finalize_sliced_find_path(
        &self,
        search: &mut Self::Search,
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        (**self).finalize_sliced_find_path(search, max_path)
    }

    fn finalize_sliced_find_path_partial(
        &self,
        search: &mut Self::Search,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        (**self).finalize_sliced_find_path_partial(search, existing, max_path)
    }
}
