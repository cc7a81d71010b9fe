// Coordinated multi-axis limit scaling
//
// All axes of a move follow one normalized profile s(t) in [0, 1], each
// scaled by its own distance. The slowest axis (at its own limits) sets the
// pace; every other axis gets speed and acceleration scaled down in
// proportion to its distance, so all axes start and finish together and the
// pen travels a straight line.

use super::profile::Limits;

/// Time for a rest-to-rest trapezoidal (or triangular) move
pub fn move_duration(distance: u64, limits: Limits) -> f64 {
    if distance == 0 {
        return 0.0;
    }
    let d = distance as f64;
    let ramp_distance = limits.max_speed * limits.max_speed / limits.accel;
    if d >= ramp_distance {
        // Accelerate, cruise, decelerate
        d / limits.max_speed + limits.max_speed / limits.accel
    } else {
        // Never reaches max speed
        2.0 * (d / limits.accel).sqrt()
    }
}

/// Cap each moving axis so the pen's path speed stays at or below `feed_mm_s`
/// over a straight move of `path_mm`. Feeds above the axis limits change nothing.
pub fn feed_limits<const N: usize>(
    distances: [u64; N],
    limits: [Limits; N],
    path_mm: f64,
    feed_mm_s: f64,
) -> [Limits; N] {
    if path_mm <= 0.0 {
        return limits;
    }
    // Time the whole path takes at the requested feed
    let path_time = path_mm / feed_mm_s;
    let mut capped = limits;
    for (slot, &distance) in capped.iter_mut().zip(distances.iter()) {
        if distance == 0 {
            continue;
        }
        slot.max_speed = slot.max_speed.min(distance as f64 / path_time);
    }
    capped
}

/// Per-axis limits for one coordinated move.
///
/// For cruise-bound moves this is `t_move = max(d_i / v_i)` with each axis
/// running at `d_i / t_move`; acceleration is scaled the same way so
/// short, accel-bound moves also arrive together. Axes that do not move keep
/// their configured limits. No result exceeds the configured limit.
pub fn coordinate<const N: usize>(distances: [u64; N], limits: [Limits; N]) -> [Limits; N] {
    let mut speed_scale = f64::INFINITY;
    let mut accel_scale = f64::INFINITY;
    for (&distance, limit) in distances.iter().zip(limits.iter()) {
        if distance == 0 {
            continue;
        }
        let d = distance as f64;
        speed_scale = speed_scale.min(limit.max_speed / d);
        accel_scale = accel_scale.min(limit.accel / d);
    }

    let mut scaled = limits;
    for (slot, (&distance, limit)) in scaled.iter_mut().zip(distances.iter().zip(limits.iter())) {
        if distance == 0 {
            continue;
        }
        let d = distance as f64;
        *slot = Limits::new(
            (d * speed_scale).min(limit.max_speed),
            (d * accel_scale).min(limit.accel),
        );
    }
    scaled
}
