// Monotonic clock helpers
//
// The renderer and presenter need a single, cheap, monotonically
// increasing time source for frame timestamps, timer items (L4.9/L9)
// and log lines. `Instant` never goes backwards and is the right
// primitive for all three.

use std::time::Instant;

lazy_static::lazy_static! {
    static ref START: Instant = Instant::now();
}

/// Milliseconds elapsed since the first call into this module.
///
/// Used for log timestamps; not wall-clock time.
pub fn get_current_millis() -> u128 {
    START.elapsed().as_millis()
}

/// Seconds elapsed since the first call into this module, as an f64.
///
/// This is the time base fed to timer items and frame events
/// (`dvz_timer_tick(t)` in the spec's terms).
pub fn get_current_seconds() -> f64 {
    START.elapsed().as_secs_f64()
}
