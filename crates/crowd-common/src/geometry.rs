//! 2D geometry operations on the XZ plane
//!
//! Agents, corridors and obstacles live on a walkable surface, so distances and
//! orientation tests here ignore height (the Y component).

use glam::Vec3;

/// Calculate twice the signed area of the triangle `abc` on the XZ plane.
///
/// The sign gives the winding order:
/// - Positive: `c` lies to the right of `a -> b` (clockwise looking down Y)
/// - Negative: `c` lies to the left
/// - Zero: collinear points
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Squared distance between two points on the XZ plane.
#[inline]
pub fn dist_sqr_2d(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Distance between two points on the XZ plane.
#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Dot product of two vectors on the XZ plane.
#[inline]
pub fn dot_2d(u: Vec3, v: Vec3) -> f32 {
    u.x * v.x + u.z * v.z
}

/// Perp-dot product of two vectors on the XZ plane.
#[inline]
pub fn perp_2d(u: Vec3, v: Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Length of a vector projected on the XZ plane.
#[inline]
pub fn length_2d(v: Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

/// Returns true when two points are closer than the query tolerance (3D).
#[inline]
pub fn v_equal(a: Vec3, b: Vec3) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    a.distance_squared(b) < THR * THR
}

/// Squared XZ distance from `p` to segment `a-b`, plus the segment parameter
/// of the closest point.
pub fn dist_point_segment_sqr_2d(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let pqx = b.x - a.x;
    let pqz = b.z - a.z;
    let dx = p.x - a.x;
    let dz = p.z - a.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = a.x + t * pqx - p.x;
    let dz = a.z + t * pqz - p.z;
    (dx * dx + dz * dz, t)
}

/// Closest point to `p` on segment `a-b`, measured on the XZ plane and
/// interpolated in 3D.
pub fn closest_point_on_segment_2d(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let (_, t) = dist_point_segment_sqr_2d(p, a, b);
    a.lerp(b, t)
}

/// Point-in-polygon test on the XZ plane (convex or concave, any winding).
pub fn point_in_polygon_2d(p: Vec3, verts: &[Vec3]) -> bool {
    let mut inside = false;
    let n = verts.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Intersects segments `ap-aq` and `bp-bq` on the XZ plane.
///
/// Returns the parameters `(s, t)` along each segment of the intersection of the
/// supporting lines, or `None` when they are parallel.
pub fn intersect_segments_2d(ap: Vec3, aq: Vec3, bp: Vec3, bq: Vec3) -> Option<(f32, f32)> {
    let u = aq - ap;
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let s = perp_2d(v, w) / d;
    let t = perp_2d(u, w) / d;
    Some((s, t))
}

/// Clips segment `p0-p1` against a convex polygon on the XZ plane.
///
/// Returns `(tmin, tmax, seg_min, seg_max)`: the parameter range of the
/// segment inside the polygon and the edges it enters and leaves through.
/// Edge `i` runs from `verts[i]` to `verts[i + 1]`. An edge index is `None`
/// when the segment starts (or ends) inside the polygon.
pub fn intersect_segment_poly_2d(
    p0: Vec3,
    p1: Vec3,
    verts: &[Vec3],
) -> Option<(f32, f32, Option<usize>, Option<usize>)> {
    const EPS: f32 = 0.000001;

    let mut tmin = 0.0;
    let mut tmax = 1.0;
    let mut seg_min = None;
    let mut seg_max = None;
    let dir = p1 - p0;

    let n = verts.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = p0 - verts[j];
        let num = perp_2d(edge, diff);
        let den = perp_2d(dir, edge);
        if den.abs() < EPS {
            // Parallel to this edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            // Entering across this edge
            if t > tmin {
                tmin = t;
                seg_min = Some(j);
                if tmin > tmax {
                    return None;
                }
            }
        } else if t < tmax {
            // Leaving across this edge
            tmax = t;
            seg_max = Some(j);
            if tmax < tmin {
                return None;
            }
        }
        j = i;
    }
    Some((tmin, tmax, seg_min, seg_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_area_sign() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let right = Vec3::new(0.5, 0.0, -1.0);
        let left = Vec3::new(0.5, 0.0, 1.0);
        assert!(tri_area_2d(a, b, right) > 0.0);
        assert!(tri_area_2d(a, b, left) < 0.0);
        assert_eq!(tri_area_2d(a, b, Vec3::new(2.0, 5.0, 0.0)), 0.0);
    }

    #[test]
    fn test_distances_ignore_height() {
        let a = Vec3::new(0.0, 10.0, 0.0);
        let b = Vec3::new(3.0, -4.0, 4.0);
        assert_eq!(dist_sqr_2d(a, b), 25.0);
        assert_eq!(dist_2d(a, b), 5.0);
        assert_eq!(length_2d(b), 5.0);
    }

    #[test]
    fn test_point_segment_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(4.0, 0.0, 0.0);

        let (d, t) = dist_point_segment_sqr_2d(Vec3::new(2.0, 0.0, 3.0), a, b);
        assert_eq!(d, 9.0);
        assert_eq!(t, 0.5);

        // Past the end clamps to the endpoint
        let (d, t) = dist_point_segment_sqr_2d(Vec3::new(7.0, 0.0, 4.0), a, b);
        assert_eq!(d, 25.0);
        assert_eq!(t, 1.0);

        let c = closest_point_on_segment_2d(Vec3::new(1.0, 3.0, -2.0), a, b);
        assert_eq!(c, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        assert!(point_in_polygon_2d(Vec3::new(1.0, 5.0, 1.0), &square));
        assert!(!point_in_polygon_2d(Vec3::new(3.0, 0.0, 1.0), &square));
        assert!(!point_in_polygon_2d(Vec3::ZERO, &square[..2]));
    }

    #[test]
    fn test_segment_intersection() {
        let hit = intersect_segments_2d(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        let (s, t) = hit.unwrap();
        assert!((s - 0.5).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);

        let parallel = intersect_segments_2d(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert!(parallel.is_none());
    }

    #[test]
    fn test_segment_poly_clipping() {
        // Unit square wound so that edge 2 is the +X side
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ];

        let (tmin, tmax, seg_min, seg_max) = intersect_segment_poly_2d(
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(1.5, 0.0, 0.5),
            &square,
        )
        .unwrap();
        assert_eq!(tmin, 0.0);
        assert!((tmax - 0.5).abs() < 1e-6);
        assert_eq!(seg_min, None);
        assert_eq!(seg_max, Some(2));

        // Fully inside: never leaves
        let (_, tmax, _, seg_max) = intersect_segment_poly_2d(
            Vec3::new(0.2, 0.0, 0.2),
            Vec3::new(0.8, 0.0, 0.8),
            &square,
        )
        .unwrap();
        assert_eq!(tmax, 1.0);
        assert_eq!(seg_max, None);

        // Misses the polygon entirely
        assert!(intersect_segment_poly_2d(
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(3.0, 0.0, 2.0),
            &square,
        )
        .is_none());
    }

    #[test]
    fn test_v_equal() {
        assert!(v_equal(Vec3::ONE, Vec3::ONE + Vec3::splat(1e-6)));
        assert!(!v_equal(Vec3::ONE, Vec3::new(1.0, 1.0, 1.01)));
    }
}
