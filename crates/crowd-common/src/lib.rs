//! Common utilities shared by the navigation query and crowd simulation crates
//!
//! Everything in here works on a Y-up coordinate system. Agents move on the XZ
//! plane, so most helpers ignore the Y component.

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// Represents a 3D position or velocity
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("navigation query failed: {0}")]
    Query(String),

    #[error("crowd error: {0}")]
    Crowd(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for crowd and query operations
pub type Result<T> = std::result::Result<T, Error>;
