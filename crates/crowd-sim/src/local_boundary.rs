//! Cached wall segments around an agent
//!
//! The crowd refreshes the cache only after the agent has moved a quarter of
//! its collision query range or a cached polygon became invalid.

use crowd_common::{dist_point_segment_sqr_2d, sqr, Result, Vec3};
use nav_query::{NavMeshQuery, PolyRef, PolygonFilter};

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    p: Vec3,
    q: Vec3,
    // Squared distance to the centre, for pruning
    d: f32,
}

/// Cached wall segments around an agent.
///
/// Refreshed when the agent has moved far enough from the point the cache was
/// built at, or when one of the polygons it was built from becomes invalid.
#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: Vec3,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: Vec3::splat(f32::MAX),
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segs.clear();
        self.polys.clear();
    }

    /// Rebuilds the cache around `pos` from the walls of the polygons
    /// reachable within `collision_query_range` of `poly`.
    pub fn update<Q: NavMeshQuery + ?Sized>(
        &mut self,
        poly: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> Result<()> {
        if poly.is_null() {
            self.reset();
            return Ok(());
        }

        self.center = pos;
        self.segs.clear();
        self.polys = navquery.find_local_neighbourhood(
            poly,
            pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
        )?;

        let range_sqr = sqr(collision_query_range);
        for &p in &self.polys {
            for (a, b) in navquery.get_poly_wall_segments(p, filter)? {
                let (dist_sqr, _) = dist_point_segment_sqr_2d(pos, a, b);
                if dist_sqr > range_sqr {
                    continue;
                }
                Self::add_segment(&mut self.segs, dist_sqr, a, b);
            }
        }

        Ok(())
    }

    // Sorted insert, nearest first, keeping at most MAX_LOCAL_SEGS.
    fn add_segment(segs: &mut Vec<Segment>, dist: f32, p: Vec3, q: Vec3) {
        let seg = Segment { p, q, d: dist };
        match segs.last() {
            Some(last) if dist >= last.d => {
                if segs.len() < MAX_LOCAL_SEGS {
                    segs.push(seg);
                }
            }
            _ => {
                let i = segs.iter().position(|s| dist <= s.d).unwrap_or(segs.len());
                segs.insert(i, seg);
                segs.truncate(MAX_LOCAL_SEGS);
            }
        }
    }

    /// Returns false if the cache is empty or any cached polygon became invalid
    pub fn is_valid<Q: NavMeshQuery + ?Sized>(
        &self,
        navquery: &Q,
        filter: &dyn PolygonFilter,
    ) -> bool {
        !self.polys.is_empty()
            && self
                .polys
                .iter()
                .all(|&p| navquery.is_valid_poly_ref(p, filter))
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, i: usize) -> Option<(Vec3, Vec3)> {
        self.segs.get(i).map(|s| (s.p, s.q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nav_query::{GridNavMesh, QueryFilter};

    #[test]
    fn test_reset_state() {
        let boundary = LocalBoundary::new();
        assert_eq!(boundary.segment_count(), 0);
        assert_eq!(boundary.center(), Vec3::splat(f32::MAX));
        assert!(boundary.segment(0).is_none());
    }

    #[test]
    fn test_collects_nearest_walls() {
        let mesh = GridNavMesh::new(Vec3::ZERO, 1.0, 5, 5).unwrap();
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();

        // Near the south-west corner: west and south walls are in range
        let pos = Vec3::new(0.4, 0.0, 0.3);
        boundary
            .update(mesh.poly_at(pos), pos, 1.0, &mesh, &filter)
            .unwrap();
        assert_eq!(boundary.center(), pos);
        assert!(boundary.segment_count() >= 2);
        assert!(boundary.is_valid(&mesh, &filter));

        // Sorted nearest first
        let dists: Vec<f32> = (0..boundary.segment_count())
            .map(|i| {
                let (a, b) = boundary.segment(i).unwrap();
                dist_point_segment_sqr_2d(pos, a, b).0
            })
            .collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        assert!((dists[0] - sqr(0.3)).abs() < 1e-5);
    }

    #[test]
    fn test_open_area_has_no_walls() {
        let mesh = GridNavMesh::new(Vec3::ZERO, 1.0, 9, 9).unwrap();
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();
        let pos = Vec3::new(4.5, 0.0, 4.5);
        boundary
            .update(mesh.poly_at(pos), pos, 1.5, &mesh, &filter)
            .unwrap();
        assert_eq!(boundary.segment_count(), 0);
    }

    #[test]
    fn test_segment_cap() {
        let mut segs = Vec::new();
        for i in (0..12).rev() {
            LocalBoundary::add_segment(&mut segs, i as f32, Vec3::ZERO, Vec3::X);
        }
        assert_eq!(segs.len(), MAX_LOCAL_SEGS);
        assert_eq!(segs[0].d, 0.0);
        assert_eq!(segs[MAX_LOCAL_SEGS - 1].d, 7.0);

        // Further than everything kept: dropped when full
        LocalBoundary::add_segment(&mut segs, 100.0, Vec3::ZERO, Vec3::X);
        assert_eq!(segs[MAX_LOCAL_SEGS - 1].d, 7.0);
    }

    #[test]
    fn test_invalidated_by_mesh_change() {
        let mut mesh = GridNavMesh::new(Vec3::ZERO, 1.0, 3, 3).unwrap();
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();
        let pos = Vec3::new(1.5, 0.0, 1.5);
        boundary
            .update(mesh.poly_at(pos), pos, 1.0, &mesh, &filter)
            .unwrap();
        assert!(boundary.is_valid(&mesh, &filter));

        mesh.block_cell(2, 1).unwrap();
        assert!(!boundary.is_valid(&mesh, &filter));

        boundary.update(PolyRef::NULL, pos, 1.0, &mesh, &filter).unwrap();
        assert!(!boundary.is_valid(&mesh, &filter));
    }
}
