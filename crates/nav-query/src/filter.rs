//! Polygon filtering and traversal cost

use crate::{PolyFlags, PolyRef};
use glam::Vec3;

/// Number of distinct area ids a filter can price
pub const MAX_AREAS: usize = 64;

/// Decides which polygons a query may visit and what it costs to cross them.
///
/// Crowd agents select a filter from a small registry by index, so
/// implementations are shared behind `Rc<dyn PolygonFilter>`.
pub trait PolygonFilter {
    /// Returns true if the polygon can be visited
    fn pass_filter(&self, poly: PolyRef, flags: PolyFlags, area: u8) -> bool;

    /// Cost of moving from `from` to `to` across a polygon of the given area
    fn cost(&self, from: Vec3, to: Vec3, area: u8) -> f32;
}

/// Flag based filter with a per-area cost table
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
    area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Self::default()
        }
    }

    /// Cost multiplier for an area, 1.0 for unknown areas
    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of an area. Out of range areas are ignored.
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }
}

impl PolygonFilter for QueryFilter {
    fn pass_filter(&self, _poly: PolyRef, flags: PolyFlags, _area: u8) -> bool {
        flags.intersects(self.include_flags) && !flags.intersects(self.exclude_flags)
    }

    fn cost(&self, from: Vec3, to: Vec3, area: u8) -> f32 {
        from.distance(to) * self.area_cost(area)
    }
}
