//! Scalar helpers

/// Square a value (x²)
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Linear interpolation between two values
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Normalized progress of `t` through the interval `[t0, t1]`, clamped to `[0, 1]`.
#[inline]
pub fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 <= t0 {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}
