//! Navigation mesh query layer for crowd simulation
//!
//! The crowd consumes a polygon graph only through the [`NavMeshQuery`]
//! trait: nearest polygon lookup, surface movement, string pulling, raycasts,
//! local neighbourhood and wall queries, and an incremental (sliced) A* path
//! search. [`GridNavMesh`] is a complete reference implementation over a grid
//! of square cells with optional off-mesh connections.

mod filter;
mod grid_mesh;
mod poly_ref;
mod query;
mod sliced_search;
mod status;

pub use filter::{PolygonFilter, QueryFilter, MAX_AREAS};
pub use grid_mesh::{GridCell, GridNavMesh, OffMeshConnection, DEFAULT_MAX_SEARCH_NODES};
pub use poly_ref::{PolyFlags, PolyRef};
pub use query::{NavMeshQuery, RaycastHit, SlicedSearch, StraightPathFlags, StraightPathPoint};
pub use sliced_search::PathSearch;
pub use status::Status;
