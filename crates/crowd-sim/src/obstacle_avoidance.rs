//! Velocity-obstacle sampling for local avoidance
//!
//! Each agent registers its neighbours as moving circles and the nearby walls
//! as segments, then samples candidate velocities around its desired velocity.
//! Every candidate is scored by how far it strays from the desired and current
//! velocities, which side it passes obstacles on, and how soon it would hit
//! something. The cheapest candidate wins.
//!
//! Two strategies are available: an exhaustive grid and an adaptive pattern
//! that refines around the best sample ring by ring.

use crowd_common::{dist_point_segment_sqr_2d, dot_2d, perp_2d, sqr, tri_area_2d, Vec3};

/// Upper bound on angular divisions of the adaptive pattern
pub const MAX_PATTERN_DIVS: usize = 32;
/// Upper bound on rings of the adaptive pattern
pub const MAX_PATTERN_RINGS: usize = 4;

/// A moving circular obstacle (another agent)
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleCircle {
    pub p: Vec3,
    pub vel: Vec3,
    pub dvel: Vec3,
    pub rad: f32,
    // Side selection helpers, filled by `prepare`
    dp: Vec3,
    np: Vec3,
}

/// A static wall segment
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleSegment {
    pub p: Vec3,
    pub q: Vec3,
    // Agent is practically touching the segment
    touch: bool,
}

/// Weights and sampling resolution of one avoidance profile
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleAvoidanceParams {
    /// How much the sampling is centred on the desired velocity
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    /// Time of impact weight
    pub weight_toi: f32,
    /// Look-ahead horizon in seconds
    pub horiz_time: f32,
    /// Lattice size of grid sampling
    pub grid_size: u8,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
    /// Adaptive sampling when set, grid sampling otherwise
    pub adaptive: bool,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
            adaptive: true,
        }
    }
}

/// One evaluated candidate velocity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvoidanceSample {
    pub vel: Vec3,
    /// Spacing between neighbouring samples
    pub size: f32,
    pub penalty: f32,
    pub desired_velocity_penalty: f32,
    pub current_velocity_penalty: f32,
    pub side_penalty: f32,
    pub collision_time_penalty: f32,
}

/// Samples recorded for one agent's velocity planning, for visualisation
#[derive(Debug, Clone, Default)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<AvoidanceSample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn add_sample(&mut self, sample: AvoidanceSample) {
        if self.samples.len() < self.max_samples {
            self.samples.push(sample);
        }
    }

    /// Rescales every penalty component to the 0..1 range
    pub fn normalize_samples(&mut self) {
        normalize(&mut self.samples, |s| &mut s.penalty);
        normalize(&mut self.samples, |s| &mut s.desired_velocity_penalty);
        normalize(&mut self.samples, |s| &mut s.current_velocity_penalty);
        normalize(&mut self.samples, |s| &mut s.side_penalty);
        normalize(&mut self.samples, |s| &mut s.collision_time_penalty);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn sample(&self, i: usize) -> Option<&AvoidanceSample> {
        self.samples.get(i)
    }

    pub fn samples(&self) -> &[AvoidanceSample] {
        &self.samples
    }
}

fn normalize(samples: &mut [AvoidanceSample], field: impl Fn(&mut AvoidanceSample) -> &mut f32) {
    if samples.is_empty() {
        return;
    }
    let mut min_pen = f32::MAX;
    let mut max_pen = -f32::MAX;
    for s in samples.iter_mut() {
        let v = *field(s);
        min_pen = min_pen.min(v);
        max_pen = max_pen.max(v);
    }
    let range = max_pen - min_pen;
    let scale = if range > 0.001 { 1.0 / range } else { 1.0 };
    for s in samples.iter_mut() {
        let v = field(s);
        *v = ((*v - min_pen) * scale).clamp(0.0, 1.0);
    }
}

/// Swept circle test. Returns the entry and exit times, if the circles meet.
fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * a, (b + rd) * a))
}

/// Ray from `ap` along `u` against segment `bp..bq`. Returns the ray parameter.
fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(v, w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

fn normalize_2d(v: Vec3) -> Vec3 {
    let d = (v.x * v.x + v.z * v.z).sqrt();
    if d == 0.0 {
        return v;
    }
    Vec3::new(v.x / d, v.y, v.z / d)
}

fn rotate_2d(v: Vec3, ang: f32) -> Vec3 {
    let (s, c) = ang.sin_cos();
    Vec3::new(v.x * c - v.z * s, v.y, v.x * s + v.z * c)
}

/// Scratch buffer for velocity sampling, shared by all agents of a crowd
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    vmax: f32,
    inv_vmax: f32,

    max_circles: usize,
    circles: Vec<ObstacleCircle>,
    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            vmax: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    /// Drops all registered obstacles
    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Registers a moving circle. Returns false when the buffer is full.
    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) -> bool {
        if self.circles.len() >= self.max_circles {
            return false;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
        true
    }

    /// Registers a wall segment. Returns false when the buffer is full.
    pub fn add_segment(&mut self, p: Vec3, q: Vec3) -> bool {
        if self.segments.len() >= self.max_segments {
            return false;
        }
        self.segments.push(ObstacleSegment {
            p,
            q,
            touch: false,
        });
        true
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn circle(&self, i: usize) -> Option<&ObstacleCircle> {
        self.circles.get(i)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, i: usize) -> Option<&ObstacleSegment> {
        self.segments.get(i)
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            cir.dp = (cir.p - pos).normalize_or_zero();
            let dv = cir.dvel - dvel;
            let a = tri_area_2d(Vec3::ZERO, cir.dp, dv);
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        for seg in &mut self.segments {
            let (d, _) = dist_point_segment_sqr_2d(pos, seg.p, seg.q);
            seg.touch = d < sqr(0.01);
        }
    }

    fn setup(&mut self, pos: Vec3, vmax: f32, dvel: Vec3, params: &ObstacleAvoidanceParams) {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / self.params.horiz_time;
        self.vmax = vmax;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    /// Scores one candidate. Bails out with `min_penalty` as soon as the
    /// candidate cannot beat the best one so far.
    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: Vec3,
        cs: f32,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> f32 {
        let p = &self.params;

        let vpen = p.weight_des_vel * (vcand.distance(dvel) * self.inv_vmax);
        let vcpen = p.weight_cur_vel * (vcand.distance(vel) * self.inv_vmax);

        // Hit time below which the candidate cannot win anymore
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (p.weight_toi / min_pen - 0.1) * p.horiz_time;
        if t_threshold - p.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = p.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal velocity obstacle
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5)
                .min(dot_2d(cir.np, vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad)
            else {
                continue;
            };

            // Avoid more when already overlapping
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                // Moving away from a touched wall is free
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Avoid less when facing walls
            let htmin = htmin * 2.0;
            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }

        let spen = p.weight_side * side;
        let tpen = p.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        let penalty = vpen + vcpen + spen + tpen;

        if let Some(debug) = debug {
            debug.add_sample(AvoidanceSample {
                vel: vcand,
                size: cs,
                penalty,
                desired_velocity_penalty: vpen,
                current_velocity_penalty: vcpen,
                side_penalty: spen,
                collision_time_penalty: tpen,
            });
        }

        penalty
    }

    /// Evaluates a `grid_size × grid_size` lattice around the biased desired velocity.
    ///
    /// Returns the chosen velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.setup(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let mut nvel = Vec3::ZERO;
        let grid_size = self.params.grid_size.max(2) as usize;
        let cvx = dvel.x * self.params.vel_bias;
        let cvz = dvel.z * self.params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - self.params.vel_bias) / (grid_size - 1) as f32;
        let half = (grid_size - 1) as f32 * cs * 0.5;

        let mut min_penalty = f32::MAX;
        let mut ns = 0;

        for y in 0..grid_size {
            for x in 0..grid_size {
                let vcand = Vec3::new(
                    cvx + x as f32 * cs - half,
                    0.0,
                    cvz + y as f32 * cs - half,
                );
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + cs / 2.0) {
                    continue;
                }

                let penalty = self.process_sample(
                    vcand,
                    cs,
                    pos,
                    rad,
                    vel,
                    dvel,
                    min_penalty,
                    debug.as_deref_mut(),
                );
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }

        (nvel, ns)
    }

    /// Samples concentric rings aligned with the desired velocity, recentring
    /// on the best candidate and halving the radius at each depth level.
    ///
    /// Returns the chosen velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.setup(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let pattern = self.sample_pattern(dvel);
        let depth = self.params.adaptive_depth.max(1);

        let mut cr = vmax * (1.0 - self.params.vel_bias);
        let mut res = Vec3::new(dvel.x * self.params.vel_bias, 0.0, dvel.z * self.params.vel_bias);
        let mut ns = 0;

        for _ in 0..depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;

            for pat in &pattern {
                let vcand = Vec3::new(res.x + pat.0 * cr, 0.0, res.z + pat.1 * cr);
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + 0.001) {
                    continue;
                }

                let penalty = self.process_sample(
                    vcand,
                    cr / 10.0,
                    pos,
                    rad,
                    vel,
                    dvel,
                    min_penalty,
                    debug.as_deref_mut(),
                );
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (res, ns)
    }

    /// Dispatches on [`ObstacleAvoidanceParams::adaptive`]
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        if params.adaptive {
            self.sample_velocity_adaptive(pos, rad, vmax, vel, dvel, params, debug)
        } else {
            self.sample_velocity_grid(pos, rad, vmax, vel, dvel, params, debug)
        }
    }

    // Unit-radius sample offsets: the origin, then rings alternating between
    // the desired direction and the direction rotated by half a division.
    fn sample_pattern(&self, dvel: Vec3) -> Vec<(f32, f32)> {
        let nd = (self.params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
        let nr = (self.params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
        let da = std::f32::consts::TAU / nd as f32;
        let (sa, ca) = da.sin_cos();

        let d0 = normalize_2d(dvel);
        let ddir = [d0, rotate_2d(d0, da * 0.5)];

        let mut pat = Vec::with_capacity(nd * nr + 1);
        pat.push((0.0, 0.0));

        for j in 0..nr {
            let r = (nr - j) as f32 / nr as f32;
            let first = (ddir[j % 2].x * r, ddir[j % 2].z * r);
            pat.push(first);

            let mut last1 = first;
            let mut last2 = first;
            let mut i = 1;
            while i + 1 < nd {
                // Next point clockwise and counter-clockwise
                let right = (last1.0 * ca + last1.1 * sa, -last1.0 * sa + last1.1 * ca);
                let left = (last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca);
                pat.push(right);
                pat.push(left);
                last1 = right;
                last2 = left;
                i += 2;
            }

            if nd % 2 == 0 {
                pat.push((last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca));
            }
        }

        pat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> ObstacleAvoidanceQuery {
        ObstacleAvoidanceQuery::new(6, 8)
    }

    #[test]
    fn test_capacity_limits() {
        let mut q = ObstacleAvoidanceQuery::new(1, 1);
        assert!(q.add_circle(Vec3::ZERO, 0.5, Vec3::ZERO, Vec3::ZERO));
        assert!(!q.add_circle(Vec3::ONE, 0.5, Vec3::ZERO, Vec3::ZERO));
        assert!(q.add_segment(Vec3::ZERO, Vec3::X));
        assert!(!q.add_segment(Vec3::ZERO, Vec3::Z));
        assert_eq!(q.circle_count(), 1);
        assert_eq!(q.segment_count(), 1);

        q.reset();
        assert_eq!(q.circle_count(), 0);
        assert!(q.segment(0).is_none());
    }

    #[test]
    fn test_unobstructed_keeps_desired_velocity() {
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        for adaptive in [true, false] {
            let params = ObstacleAvoidanceParams {
                adaptive,
                ..Default::default()
            };
            let mut q = query();
            let (nvel, ns) = q.sample_velocity(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, None);
            assert!(ns > 0);
            assert!(nvel.distance(dvel) < 0.05, "adaptive={adaptive} nvel={nvel}");
        }
    }

    #[test]
    fn test_head_on_agent_is_avoided() {
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        for adaptive in [true, false] {
            let params = ObstacleAvoidanceParams {
                adaptive,
                ..Default::default()
            };
            let mut q = query();
            let other_vel = Vec3::new(-1.0, 0.0, 0.0);
            q.add_circle(Vec3::new(2.0, 0.0, 0.0), 0.5, other_vel, other_vel);
            let (nvel, _) = q.sample_velocity(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, None);
            assert!(nvel.distance(dvel) > 0.1, "adaptive={adaptive} nvel={nvel}");
            assert!(nvel.length() <= 1.0 + 0.05);
        }
    }

    #[test]
    fn test_wall_ahead_slows_agent() {
        let mut q = query();
        // Wall across the path at x = 0.3, wound so the agent is on its inner side
        q.add_segment(Vec3::new(0.3, 0.0, 1.0), Vec3::new(0.3, 0.0, -1.0));
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        let (nvel, _) = q.sample_velocity_grid(
            Vec3::ZERO,
            0.2,
            1.0,
            dvel,
            dvel,
            &ObstacleAvoidanceParams::default(),
            None,
        );
        assert!(nvel.x < 0.9);
    }

    #[test]
    fn test_sample_counts() {
        let params = ObstacleAvoidanceParams::default();
        let mut q = query();
        let dvel = Vec3::new(0.0, 0.0, 2.0);

        let (_, grid) = q.sample_velocity_grid(Vec3::ZERO, 0.5, 2.0, dvel, dvel, &params, None);
        assert!(grid > 0 && grid <= 33 * 33);

        // 15 pattern points over 5 depth levels at most
        let (_, adaptive) =
            q.sample_velocity_adaptive(Vec3::ZERO, 0.5, 2.0, dvel, dvel, &params, None);
        assert!(adaptive > 0 && adaptive <= 15 * 5);
        assert!(adaptive < grid);
    }

    #[test]
    fn test_pattern_size() {
        let q = query();
        assert_eq!(q.sample_pattern(Vec3::X).len(), 15);

        let mut even = query();
        even.params.adaptive_divs = 8;
        // origin + 2 rings of 8
        assert_eq!(even.sample_pattern(Vec3::X).len(), 17);
    }

    #[test]
    fn test_zero_speed_agent() {
        let mut q = query();
        let (nvel, _) = q.sample_velocity(
            Vec3::ZERO,
            0.5,
            0.0,
            Vec3::ZERO,
            Vec3::ZERO,
            &ObstacleAvoidanceParams::default(),
            None,
        );
        assert_eq!(nvel, Vec3::ZERO);
    }

    #[test]
    fn test_debug_samples_are_normalized() {
        let mut q = query();
        q.add_circle(
            Vec3::new(1.5, 0.0, 0.2),
            0.5,
            Vec3::ZERO,
            Vec3::ZERO,
        );
        let mut debug = ObstacleAvoidanceDebugData::new(2048);
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        let (_, ns) = q.sample_velocity_adaptive(
            Vec3::ZERO,
            0.5,
            1.0,
            dvel,
            dvel,
            &ObstacleAvoidanceParams::default(),
            Some(&mut debug),
        );
        assert!(debug.sample_count() > 0);
        assert!(debug.sample_count() <= ns);

        debug.normalize_samples();
        for s in debug.samples() {
            assert!((0.0..=1.0).contains(&s.penalty));
            assert!((0.0..=1.0).contains(&s.collision_time_penalty));
        }
    }
}
