//! Reference navigation mesh built from a regular grid of square cells
//!
//! Every open cell is one polygon, connected to its four edge neighbours.
//! Cells without flags are holes. Off-mesh connections link two cells that
//! are not adjacent (a jump or a ladder) and get polygon references after the
//! last cell.
//!
//! The mesh implements the full [`NavMeshQuery`] contract, so it is what the
//! crowd tests and demos run on. Cell vertices are wound so that edge `e`
//! runs from `verts[e]` to `verts[e + 1]`: west, north (+Z), east, south.

use crate::sliced_search::{PathSearch, H_SCALE};
use crate::{
    NavMeshQuery, PolyFlags, PolyRef, PolygonFilter, RaycastHit, StraightPathFlags,
    StraightPathPoint, Status,
};
use crowd_common::{
    dist_point_segment_sqr_2d, intersect_segment_poly_2d, sqr, tri_area_2d, v_equal, Error,
    Result,
};
use glam::Vec3;
use std::collections::{HashSet, VecDeque};

/// Default node budget of a single sliced search
pub const DEFAULT_MAX_SEARCH_NODES: usize = 2048;

/// Slack when deciding whether a point lies over a cell
const CELL_EDGE_TOLERANCE: f32 = 1e-4;

const MAX_SURFACE_VISITED: usize = 16;
const MAX_SURFACE_STACK: usize = 48;
const MAX_NEIGHBOURHOOD_STACK: usize = 48;

/// One grid cell
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct GridCell {
    /// Surface height of the cell
    pub height: f32,
    /// Empty flags make the cell a hole
    pub flags: PolyFlags,
    pub area: u8,
}

impl GridCell {
    pub fn walkable(height: f32) -> Self {
        Self {
            height,
            flags: PolyFlags::WALK,
            area: 0,
        }
    }

    pub fn blocked() -> Self {
        Self {
            height: 0.0,
            flags: PolyFlags::empty(),
            area: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.flags.is_empty()
    }
}

/// A link between two non-adjacent cells
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    /// One-way links can only be entered from the start side
    pub bidirectional: bool,
    pub flags: PolyFlags,
    pub area: u8,
}

impl OffMeshConnection {
    pub fn new(start: Vec3, end: Vec3, radius: f32) -> Self {
        Self {
            start,
            end,
            radius,
            bidirectional: false,
            flags: PolyFlags::JUMP,
            area: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct OffMeshLink {
    connection: OffMeshConnection,
    start_poly: PolyRef,
    end_poly: PolyRef,
}

enum Poly<'a> {
    Cell { x: usize, z: usize, cell: &'a GridCell },
    OffMesh(&'a OffMeshLink),
}

/// Grid navigation mesh
#[derive(Debug, Clone)]
pub struct GridNavMesh {
    origin: Vec3,
    cell_size: f32,
    width: usize,
    depth: usize,
    cells: Vec<GridCell>,
    links: Vec<OffMeshLink>,
    max_search_nodes: usize,
}

fn invalid_param() -> Error {
    Error::Query(Status::failure_detail(Status::INVALID_PARAM).to_string())
}

impl GridNavMesh {
    /// Creates a `width × depth` grid of walkable cells at `origin.y`.
    ///
    /// `origin` is the minimum corner of the grid.
    pub fn new(origin: Vec3, cell_size: f32, width: usize, depth: usize) -> Result<Self> {
        if cell_size <= 0.0 || !cell_size.is_finite() {
            return Err(Error::InvalidParam(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        let count = width
            .checked_mul(depth)
            .filter(|&n| n > 0 && n < u32::MAX as usize / 2)
            .ok_or_else(|| Error::InvalidParam(format!("invalid grid size {width}x{depth}")))?;

        Ok(Self {
            origin,
            cell_size,
            width,
            depth,
            cells: vec![GridCell::walkable(origin.y); count],
            links: Vec::new(),
            max_search_nodes: DEFAULT_MAX_SEARCH_NODES,
        })
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Limits the number of polygons a single sliced search may touch
    pub fn set_max_search_nodes(&mut self, max_nodes: usize) {
        self.max_search_nodes = max_nodes.max(1);
    }

    /// Reference of the cell at grid coordinates, null when out of range
    pub fn cell_ref(&self, x: usize, z: usize) -> PolyRef {
        if x >= self.width || z >= self.depth {
            return PolyRef::NULL;
        }
        PolyRef::new((z * self.width + x + 1) as u32)
    }

    pub fn cell(&self, x: usize, z: usize) -> Option<&GridCell> {
        if x >= self.width || z >= self.depth {
            return None;
        }
        self.cells.get(z * self.width + x)
    }

    pub fn set_cell(&mut self, x: usize, z: usize, cell: GridCell) -> Result<()> {
        if x >= self.width || z >= self.depth {
            return Err(Error::InvalidParam(format!("cell ({x}, {z}) out of range")));
        }
        self.cells[z * self.width + x] = cell;
        Ok(())
    }

    pub fn set_cell_flags(&mut self, x: usize, z: usize, flags: PolyFlags) -> Result<()> {
        let mut cell = *self
            .cell(x, z)
            .ok_or_else(|| Error::InvalidParam(format!("cell ({x}, {z}) out of range")))?;
        cell.flags = flags;
        self.set_cell(x, z, cell)
    }

    /// Turns a cell into a hole
    pub fn block_cell(&mut self, x: usize, z: usize) -> Result<()> {
        self.set_cell_flags(x, z, PolyFlags::empty())
    }

    /// Grid coordinates of the cell under `pos`
    pub fn cell_at(&self, pos: Vec3) -> Option<(usize, usize)> {
        let x = self.axis_index(pos.x - self.origin.x, self.width)?;
        let z = self.axis_index(pos.z - self.origin.z, self.depth)?;
        Some((x, z))
    }

    /// Open cell polygon under `pos`, null if there is none
    pub fn poly_at(&self, pos: Vec3) -> PolyRef {
        match self.cell_at(pos) {
            Some((x, z)) if self.cell(x, z).is_some_and(GridCell::is_open) => self.cell_ref(x, z),
            _ => PolyRef::NULL,
        }
    }

    /// Adds an off-mesh connection. Both endpoints must lie on open cells.
    pub fn add_off_mesh_connection(&mut self, connection: OffMeshConnection) -> Result<PolyRef> {
        let start_poly = self.poly_at(connection.start);
        let end_poly = self.poly_at(connection.end);
        if start_poly.is_null() || end_poly.is_null() {
            return Err(Error::InvalidParam(
                "off-mesh connection endpoints must lie on open cells".into(),
            ));
        }
        self.links.push(OffMeshLink {
            connection,
            start_poly,
            end_poly,
        });
        let poly = self.off_mesh_ref(self.links.len() - 1);
        log::debug!(
            "Added off-mesh connection {} from {} to {}",
            poly,
            start_poly,
            end_poly
        );
        Ok(poly)
    }

    fn off_mesh_ref(&self, index: usize) -> PolyRef {
        PolyRef::new((self.cells.len() + index + 1) as u32)
    }

    fn axis_index(&self, offset: f32, count: usize) -> Option<usize> {
        if offset < 0.0 {
            return None;
        }
        let f = offset / self.cell_size;
        let idx = f.floor() as usize;
        if idx < count {
            Some(idx)
        } else if f - count as f32 <= 1e-4 {
            // On the far boundary
            Some(count - 1)
        } else {
            None
        }
    }

    fn axis_range(&self, lo: f32, hi: f32, origin: f32, count: usize) -> Option<(usize, usize)> {
        let a = ((lo - origin) / self.cell_size).floor();
        let b = ((hi - origin) / self.cell_size).floor();
        if b < 0.0 || a >= count as f32 {
            return None;
        }
        Some((a.max(0.0) as usize, (b as usize).min(count - 1)))
    }

    fn decode(&self, poly: PolyRef) -> Option<Poly<'_>> {
        let id = poly.id() as usize;
        if id == 0 {
            return None;
        }
        let idx = id - 1;
        if idx < self.cells.len() {
            let cell = &self.cells[idx];
            if !cell.is_open() {
                return None;
            }
            Some(Poly::Cell {
                x: idx % self.width,
                z: idx / self.width,
                cell,
            })
        } else {
            self.links.get(idx - self.cells.len()).map(Poly::OffMesh)
        }
    }

    fn is_off_mesh(&self, poly: PolyRef) -> bool {
        matches!(self.decode(poly), Some(Poly::OffMesh(_)))
    }

    fn flags_area(&self, poly: PolyRef) -> Option<(PolyFlags, u8)> {
        match self.decode(poly)? {
            Poly::Cell { cell, .. } => Some((cell.flags, cell.area)),
            Poly::OffMesh(link) => Some((link.connection.flags, link.connection.area)),
        }
    }

    fn passes(&self, poly: PolyRef, filter: &dyn PolygonFilter) -> bool {
        self.flags_area(poly)
            .is_some_and(|(flags, area)| filter.pass_filter(poly, flags, area))
    }

    fn cell_bounds(&self, x: usize, z: usize) -> (f32, f32, f32, f32) {
        let x0 = self.origin.x + x as f32 * self.cell_size;
        let z0 = self.origin.z + z as f32 * self.cell_size;
        (x0, z0, x0 + self.cell_size, z0 + self.cell_size)
    }

    fn cell_verts(&self, x: usize, z: usize, height: f32) -> [Vec3; 4] {
        let (x0, z0, x1, z1) = self.cell_bounds(x, z);
        [
            Vec3::new(x0, height, z0),
            Vec3::new(x0, height, z1),
            Vec3::new(x1, height, z1),
            Vec3::new(x1, height, z0),
        ]
    }

    /// Whether `pos` lies over the cell, edges included
    fn covers(&self, x: usize, z: usize, pos: Vec3) -> bool {
        let (x0, z0, x1, z1) = self.cell_bounds(x, z);
        let tol = CELL_EDGE_TOLERANCE;
        pos.x >= x0 - tol && pos.x <= x1 + tol && pos.z >= z0 - tol && pos.z <= z1 + tol
    }

    fn clamp_to_cell(&self, x: usize, z: usize, height: f32, pos: Vec3) -> (Vec3, bool) {
        let (x0, z0, x1, z1) = self.cell_bounds(x, z);
        let over = pos.x >= x0 && pos.x <= x1 && pos.z >= z0 && pos.z <= z1;
        (
            Vec3::new(pos.x.clamp(x0, x1), height, pos.z.clamp(z0, z1)),
            over,
        )
    }

    /// Open cell across edge `edge` of cell `(x, z)`
    fn edge_neighbour(&self, x: usize, z: usize, edge: usize) -> Option<PolyRef> {
        let (nx, nz) = match edge {
            0 => (x.checked_sub(1)?, z),
            1 => (x, z + 1),
            2 => (x + 1, z),
            _ => (x, z.checked_sub(1)?),
        };
        let cell = self.cell(nx, nz)?;
        cell.is_open().then(|| self.cell_ref(nx, nz))
    }

    /// All polygons reachable in one step, unfiltered
    fn links_of(&self, poly: PolyRef) -> Vec<PolyRef> {
        let mut out = Vec::new();
        match self.decode(poly) {
            Some(Poly::Cell { x, z, .. }) => {
                out.extend((0..4).filter_map(|e| self.edge_neighbour(x, z, e)));
                for (i, link) in self.links.iter().enumerate() {
                    if link.start_poly == poly
                        || (link.connection.bidirectional && link.end_poly == poly)
                    {
                        out.push(self.off_mesh_ref(i));
                    }
                }
            }
            Some(Poly::OffMesh(link)) => {
                out.push(link.start_poly);
                out.push(link.end_poly);
            }
            None => {}
        }
        out
    }

    /// Left and right portal points when moving from `from` to `to`
    fn portal_points(&self, from: PolyRef, to: PolyRef) -> Option<(Vec3, Vec3)> {
        match (self.decode(from)?, self.decode(to)?) {
            (Poly::Cell { x, z, cell }, Poly::Cell { .. }) => {
                let verts = self.cell_verts(x, z, cell.height);
                (0..4)
                    .find(|&e| self.edge_neighbour(x, z, e) == Some(to))
                    .map(|e| (verts[e], verts[(e + 1) % 4]))
            }
            (Poly::Cell { .. }, Poly::OffMesh(link)) => {
                let con = &link.connection;
                if link.start_poly == from {
                    Some((con.start, con.start))
                } else if link.end_poly == from {
                    Some((con.end, con.end))
                } else {
                    None
                }
            }
            (Poly::OffMesh(link), Poly::Cell { .. }) => {
                let con = &link.connection;
                if link.end_poly == to {
                    Some((con.end, con.end))
                } else if link.start_poly == to {
                    Some((con.start, con.start))
                } else {
                    None
                }
            }
            (Poly::OffMesh(_), Poly::OffMesh(_)) => None,
        }
    }

    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        match self.decode(poly).ok_or_else(invalid_param)? {
            Poly::Cell { x, z, cell } => {
                let (closest, over) = self.clamp_to_cell(x, z, cell.height, pos);
                Ok(if over { pos } else { closest })
            }
            Poly::OffMesh(link) => {
                let con = &link.connection;
                let (_, t) = dist_point_segment_sqr_2d(pos, con.start, con.end);
                Ok(con.start.lerp(con.end, t))
            }
        }
    }
}

/// Appends a straight path vertex, merging duplicates. Returns true when the
/// path is complete (end reached or buffer full).
fn append_vertex(
    path: &mut Vec<StraightPathPoint>,
    pos: Vec3,
    flags: StraightPathFlags,
    poly: PolyRef,
    max_points: usize,
) -> bool {
    if let Some(last) = path.last_mut() {
        if v_equal(last.pos, pos) {
            last.flags = flags;
            last.poly = poly;
            return false;
        }
    }
    path.push(StraightPathPoint { pos, flags, poly });
    path.len() >= max_points || flags == StraightPathFlags::END
}

impl NavMeshQuery for GridNavMesh {
    type Search = PathSearch;

    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let min = center - half_extents;
        let max = center + half_extents;
        let (x0, x1) = self.axis_range(min.x, max.x, self.origin.x, self.width)?;
        let (z0, z1) = self.axis_range(min.z, max.z, self.origin.z, self.depth)?;

        let mut best = None;
        let mut best_dist = f32::MAX;
        for z in z0..=z1 {
            for x in x0..=x1 {
                let poly = self.cell_ref(x, z);
                let Some(cell) = self.cell(x, z).filter(|c| c.is_open()) else {
                    continue;
                };
                if cell.height < min.y || cell.height > max.y {
                    continue;
                }
                if !filter.pass_filter(poly, cell.flags, cell.area) {
                    continue;
                }
                let (closest, over) = self.clamp_to_cell(x, z, cell.height, center);
                let d = if over {
                    sqr(center.y - cell.height)
                } else {
                    center.distance_squared(closest)
                };
                if d < best_dist {
                    best_dist = d;
                    best = Some((poly, closest));
                }
            }
        }
        best
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &dyn PolygonFilter) -> bool {
        self.passes(poly, filter)
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        match self.decode(poly).ok_or_else(invalid_param)? {
            Poly::Cell { x, z, cell } => Ok(self.clamp_to_cell(x, z, cell.height, pos)),
            Poly::OffMesh(link) => {
                let con = &link.connection;
                let (_, t) = dist_point_segment_sqr_2d(pos, con.start, con.end);
                Ok((con.start.lerp(con.end, t), false))
            }
        }
    }

    fn get_poly_height(&self, poly: PolyRef, pos: Vec3) -> Option<f32> {
        match self.decode(poly)? {
            Poly::Cell { x, z, cell } => self.covers(x, z, pos).then_some(cell.height),
            Poly::OffMesh(link) => {
                let con = &link.connection;
                let (_, t) = dist_point_segment_sqr_2d(pos, con.start, con.end);
                Some(con.start.y + (con.end.y - con.start.y) * t)
            }
        }
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        if !self.passes(start_ref, filter) {
            return Err(invalid_param());
        }

        struct SurfaceNode {
            poly: PolyRef,
            parent: Option<usize>,
        }

        let mut nodes = vec![SurfaceNode {
            poly: start_ref,
            parent: None,
        }];
        let mut stack = VecDeque::from([0usize]);

        let mut best_pos = start;
        let mut best_dist = f32::MAX;
        let mut best_node = 0;

        // Constrain the search to a circle around the move segment
        let search_pos = start.lerp(end, 0.5);
        let search_rad_sqr = sqr(start.distance(end) * 0.5 + 0.001);

        while let Some(cur) = stack.pop_front() {
            let cur_ref = nodes[cur].poly;
            let Some(Poly::Cell { x, z, cell }) = self.decode(cur_ref) else {
                continue;
            };
            let verts = self.cell_verts(x, z, cell.height);

            // End points on a shared edge stop the walk in the first cell reached
            if self.covers(x, z, end) {
                let (x0, z0, x1, z1) = self.cell_bounds(x, z);
                best_node = cur;
                best_pos = Vec3::new(end.x.clamp(x0, x1), end.y, end.z.clamp(z0, z1));
                break;
            }

            for e in 0..4 {
                let vj = verts[e];
                let vi = verts[(e + 1) % 4];
                let nei = self
                    .edge_neighbour(x, z, e)
                    .filter(|&n| self.passes(n, filter));

                match nei {
                    None => {
                        // Wall edge, track the nearest point on it
                        let (d, t) = dist_point_segment_sqr_2d(end, vj, vi);
                        if d < best_dist {
                            best_pos = vj.lerp(vi, t);
                            best_dist = d;
                            best_node = cur;
                        }
                    }
                    Some(nei) => {
                        if nodes.iter().any(|n| n.poly == nei) {
                            continue;
                        }
                        let (d, _) = dist_point_segment_sqr_2d(search_pos, vj, vi);
                        if d > search_rad_sqr {
                            continue;
                        }
                        if nodes.len() < MAX_SURFACE_VISITED && stack.len() < MAX_SURFACE_STACK {
                            nodes.push(SurfaceNode {
                                poly: nei,
                                parent: Some(cur),
                            });
                            stack.push_back(nodes.len() - 1);
                        }
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut cur = Some(best_node);
        while let Some(idx) = cur {
            visited.push(nodes[idx].poly);
            cur = nodes[idx].parent;
        }
        visited.reverse();

        Ok((best_pos, visited))
    }

    fn find_straight_path(
        &self,
        start: Vec3,
        end: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        if path.is_empty() || max_points == 0 {
            return Err(invalid_param());
        }

        let closest_start = self.closest_point_on_poly_boundary(path[0], start)?;
        let closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end)?;

        let mut out = Vec::with_capacity(max_points.min(16));
        if append_vertex(
            &mut out,
            closest_start,
            StraightPathFlags::START,
            path[0],
            max_points,
        ) {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut left = apex;
            let mut right = apex;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_ref = path[0];
            let mut right_ref = path[0];
            let mut left_off_mesh = false;
            let mut right_off_mesh = false;

            let mut i = 0;
            while i < path.len() {
                let (portal_left, portal_right, to_off_mesh) = if i + 1 < path.len() {
                    let Some((l, r)) = self.portal_points(path[i], path[i + 1]) else {
                        // Next polygon is gone: clamp the end to the current one
                        let end_here = self.closest_point_on_poly_boundary(path[i], end)?;
                        append_vertex(
                            &mut out,
                            end_here,
                            StraightPathFlags::empty(),
                            path[i],
                            max_points,
                        );
                        return Ok(out);
                    };

                    // Starting right at the first portal: skip it
                    if i == 0 {
                        let (d, _) = dist_point_segment_sqr_2d(apex, l, r);
                        if d < sqr(0.001) {
                            i += 1;
                            continue;
                        }
                    }
                    (l, r, self.is_off_mesh(path[i + 1]))
                } else {
                    (closest_end, closest_end, false)
                };
                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                // Right vertex
                if tri_area_2d(apex, right, portal_right) <= 0.0 {
                    if v_equal(apex, right) || tri_area_2d(apex, left, portal_right) > 0.0 {
                        right = portal_right;
                        right_ref = next_ref;
                        right_off_mesh = to_off_mesh;
                        right_index = i;
                    } else {
                        apex = left;
                        let apex_index = left_index;
                        let flags = if left_ref.is_null() {
                            StraightPathFlags::END
                        } else if left_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if append_vertex(&mut out, apex, flags, left_ref, max_points) {
                            return Ok(out);
                        }
                        left = apex;
                        right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(apex, left, portal_left) >= 0.0 {
                    if v_equal(apex, left) || tri_area_2d(apex, right, portal_left) < 0.0 {
                        left = portal_left;
                        left_ref = next_ref;
                        left_off_mesh = to_off_mesh;
                        left_index = i;
                    } else {
                        apex = right;
                        let apex_index = right_index;
                        let flags = if right_ref.is_null() {
                            StraightPathFlags::END
                        } else if right_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        if append_vertex(&mut out, apex, flags, right_ref, max_points) {
                            return Ok(out);
                        }
                        left = apex;
                        right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        append_vertex(
            &mut out,
            closest_end,
            StraightPathFlags::END,
            PolyRef::NULL,
            max_points,
        );
        Ok(out)
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &dyn PolygonFilter,
    ) -> Result<RaycastHit> {
        if !self.passes(start_ref, filter) {
            return Err(invalid_param());
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: Vec3::ZERO,
            path: Vec::new(),
        };

        let mut cur = start_ref;
        while hit.path.len() <= self.cells.len() {
            let Some(Poly::Cell { x, z, cell }) = self.decode(cur) else {
                return Ok(hit);
            };
            let verts = self.cell_verts(x, z, cell.height);

            // Ray left the polygon chain, report what was reached
            let Some((_, tmax, _, seg_max)) = intersect_segment_poly_2d(start, end, &verts) else {
                return Ok(hit);
            };
            if tmax > hit.t {
                hit.t = tmax;
            }
            hit.path.push(cur);

            let Some(edge) = seg_max else {
                // End point is inside this polygon
                hit.t = f32::MAX;
                return Ok(hit);
            };

            match self
                .edge_neighbour(x, z, edge)
                .filter(|&n| self.passes(n, filter))
            {
                Some(next) => cur = next,
                None => {
                    let va = verts[edge];
                    let vb = verts[(edge + 1) % 4];
                    let dx = vb.x - va.x;
                    let dz = vb.z - va.z;
                    hit.hit_normal = Vec3::new(dz, 0.0, -dx).normalize_or_zero();
                    return Ok(hit);
                }
            }
        }
        Ok(hit)
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &dyn PolygonFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.passes(start_ref, filter) {
            return Err(invalid_param());
        }

        let radius_sqr = sqr(radius);
        let mut result = vec![start_ref];
        let mut visited = HashSet::from([start_ref]);
        let mut stack = VecDeque::from([start_ref]);

        while let Some(cur) = stack.pop_front() {
            for nei in self.links_of(cur) {
                if visited.contains(&nei) || self.is_off_mesh(nei) {
                    continue;
                }
                if !self.passes(nei, filter) {
                    continue;
                }
                let Some((va, vb)) = self.portal_points(cur, nei) else {
                    continue;
                };
                let (d, _) = dist_point_segment_sqr_2d(center, va, vb);
                if d > radius_sqr {
                    continue;
                }

                visited.insert(nei);
                if result.len() < max_result {
                    result.push(nei);
                }
                if stack.len() < MAX_NEIGHBOURHOOD_STACK {
                    stack.push_back(nei);
                }
            }
        }

        Ok(result)
    }

    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &dyn PolygonFilter,
    ) -> Result<Vec<(Vec3, Vec3)>> {
        match self.decode(poly).ok_or_else(invalid_param)? {
            Poly::Cell { x, z, cell } => {
                let verts = self.cell_verts(x, z, cell.height);
                Ok((0..4)
                    .filter(|&e| {
                        self.edge_neighbour(x, z, e)
                            .filter(|&n| self.passes(n, filter))
                            .is_none()
                    })
                    .map(|e| (verts[e], verts[(e + 1) % 4]))
                    .collect())
            }
            Poly::OffMesh(_) => Ok(Vec::new()),
        }
    }

    fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        connection_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        match self.decode(connection_ref) {
            Some(Poly::OffMesh(link)) => {
                let con = &link.connection;
                if link.start_poly == prev_ref {
                    Ok((con.start, con.end))
                } else {
                    Ok((con.end, con.start))
                }
            }
            _ => Err(invalid_param()),
        }
    }

    fn init_sliced_find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        _filter: &dyn PolygonFilter,
    ) -> PathSearch {
        if self.decode(start_ref).is_none() || self.decode(end_ref).is_none() {
            return PathSearch::failed(Status::INVALID_PARAM);
        }

        let mut search =
            PathSearch::new(start_ref, end_ref, end_pos, self.max_search_nodes);
        if start_ref == end_ref {
            search.status = Status::success();
            return search;
        }

        let Some(start) = search.get_node(start_ref) else {
            return PathSearch::failed(Status::OUT_OF_NODES);
        };
        let total = start_pos.distance(end_pos) * H_SCALE;
        {
            let node = search.node_mut(start);
            node.pos = start_pos;
            node.cost = 0.0;
            node.total = total;
        }
        search.push_open(start);
        search.last_best = Some(start);
        search.last_best_cost = total;
        search
    }

    fn update_sliced_find_path(
        &self,
        search: &mut PathSearch,
        max_iters: usize,
        filter: &dyn PolygonFilter,
    ) -> (Status, usize) {
        if !search.status.is_in_progress() {
            return (search.status, 0);
        }

        // The mesh may have changed since the last slice
        if self.decode(search.start_ref).is_none() || self.decode(search.end_ref).is_none() {
            search.status = Status::failure();
            return (search.status, 0);
        }

        let mut iter = 0;
        while iter < max_iters {
            let Some(best) = search.pop_open() else {
                break;
            };
            iter += 1;

            let best_ref = search.node(best).poly;
            if best_ref == search.end_ref {
                search.last_best = Some(best);
                search.status = Status::success_detail(search.status.detail());
                return (search.status, iter);
            }

            let Some((_, best_area)) = self.flags_area(best_ref) else {
                search.status = Status::failure();
                return (search.status, iter);
            };
            let parent_ref = search.node(best).parent.map(|p| search.node(p).poly);
            let best_pos = search.node(best).pos;
            let best_cost = search.node(best).cost;

            for nei in self.links_of(best_ref) {
                if Some(nei) == parent_ref {
                    continue;
                }
                let Some((flags, area)) = self.flags_area(nei) else {
                    continue;
                };
                if !filter.pass_filter(nei, flags, area) {
                    continue;
                }

                let Some(n) = search.get_node(nei) else {
                    search.status = search.status.with_detail(Status::OUT_OF_NODES);
                    continue;
                };

                if search.node(n).state.is_none() {
                    let Some((l, r)) = self.portal_points(best_ref, nei) else {
                        continue;
                    };
                    search.node_mut(n).pos = l.lerp(r, 0.5);
                }
                let nei_pos = search.node(n).pos;

                let (cost, heuristic) = if nei == search.end_ref {
                    let cur_cost = filter.cost(best_pos, nei_pos, best_area);
                    let end_cost = filter.cost(nei_pos, search.end_pos, area);
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = filter.cost(best_pos, nei_pos, best_area);
                    (
                        best_cost + cur_cost,
                        nei_pos.distance(search.end_pos) * H_SCALE,
                    )
                };
                let total = cost + heuristic;

                let node = search.node(n);
                if node.state.is_some() && total >= node.total {
                    continue;
                }

                {
                    let node = search.node_mut(n);
                    node.parent = Some(best);
                    node.cost = cost;
                    node.total = total;
                }
                search.push_open(n);

                if heuristic < search.last_best_cost {
                    search.last_best_cost = heuristic;
                    search.last_best = Some(n);
                }
            }
        }

        if !search.has_open() {
            // Exhausted: the best node so far is the answer
            search.status = Status::success_detail(search.status.detail());
        }
        (search.status, iter)
    }

    fn finalize_sliced_find_path(
        &self,
        search: &mut PathSearch,
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        if search.status.is_failure() || max_path == 0 {
            search.finish(Status::failure());
            return (Status::failure(), Vec::new());
        }

        let mut detail = search.status.detail();
        let path = if search.start_ref == search.end_ref {
            vec![search.start_ref]
        } else {
            let Some(best) = search.last_best else {
                search.finish(Status::failure());
                return (Status::failure(), Vec::new());
            };
            if search.node(best).poly != search.end_ref {
                detail |= Status::PARTIAL_RESULT;
            }
            let (path, truncated) = search.path_to(best, max_path);
            if truncated {
                detail |= Status::BUFFER_TOO_SMALL;
            }
            path
        };

        let status = Status::success_detail(detail);
        search.finish(status);
        (status, path)
    }

    fn finalize_sliced_find_path_partial(
        &self,
        search: &mut PathSearch,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        if existing.is_empty() || search.status.is_failure() || max_path == 0 {
            search.finish(Status::failure());
            return (Status::failure(), Vec::new());
        }

        let mut detail = search.status.detail();
        let path = if search.start_ref == search.end_ref {
            vec![search.start_ref]
        } else {
            // Furthest polygon of the existing path the search reached
            let found = existing.iter().rev().find_map(|&p| search.find_node(p));
            let node = match found {
                Some(node) => node,
                None => {
                    detail |= Status::PARTIAL_RESULT;
                    let Some(best) = search.last_best else {
                        search.finish(Status::failure());
                        return (Status::failure(), Vec::new());
                    };
                    best
                }
            };
            let (path, truncated) = search.path_to(node, max_path);
            if truncated {
                detail |= Status::BUFFER_TOO_SMALL;
            }
            path
        };

        let status = Status::success_detail(detail);
        search.finish(status);
        (status, path)
    }
}
