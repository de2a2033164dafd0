// Timer item backing the client's TIMER event (4.7, 9 scenario 5).
//
// `tick(t)` is driven externally by the client's event loop with the
// current time rather than spawning its own thread, matching the
// core's "single-threaded by default" scheduling model (5).

/// One timer: fires at `delay`, then every `period` thereafter, up to
/// `max_count` times (`0` = unbounded).
pub struct Timer {
    delay: f64,
    period: f64,
    max_count: u64,
    running: bool,
    fire_count: u64,
    /// Time the timer was (re)started at, in the same clock `tick`
    /// advances in.
    start_time: f64,
    last_tick: f64,
}

impl Timer {
    pub fn new(delay: f64, period: f64, max_count: u64) -> Self {
        Timer {
            delay,
            period,
            max_count,
            running: true,
            fire_count: 0,
            start_time: 0.0,
            last_tick: 0.0,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Resumes the timer with its schedule re-anchored to `now`, so
    /// `delay`/`period` are measured from this call rather than from
    /// the original construction time. Resets the fire count, so a
    /// restarted timer runs through its full `max_count` again.
    pub fn start(&mut self, now: f64) {
        self.running = true;
        self.fire_count = 0;
        self.start_time = now;
        self.last_tick = now;
    }

    /// Advances the timer to time `now`; returns the number of
    /// scheduled fire points crossed since the last tick (9 scenario
    /// 5: each tick may cross at most one boundary in practice, but
    /// callers driving coarse frame times could cross more than one).
    pub fn tick(&mut self, now: f64) -> u32 {
        if !self.running || (self.max_count != 0 && self.fire_count >= self.max_count) {
            self.last_tick = now;
            return 0;
        }

        let elapsed_prev = self.last_tick - self.start_time;
        let elapsed_now = now - self.start_time;
        self.last_tick = now;

        let mut fires = 0;
        loop {
            if self.max_count != 0 && self.fire_count >= self.max_count {
                self.running = false;
                break;
            }
            let next_fire = if self.fire_count == 0 {
                self.delay
            } else {
                self.delay + self.period * self.fire_count as f64
            };
            if next_fire > elapsed_now || next_fire <= elapsed_prev {
                break;
            }
            self.fire_count += 1;
            fires += 1;
        }

        fires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_delay() {
        let mut timer = Timer::new(1.0, 1.0, 0);
        assert_eq!(timer.tick(0.5), 0);
        assert_eq!(timer.tick(1.0), 1);
        assert_eq!(timer.fire_count(), 1);
    }

    #[test]
    fn fires_periodically_until_max_count() {
        let mut timer = Timer::new(1.0, 1.0, 3);
        assert_eq!(timer.tick(1.0), 1);
        assert_eq!(timer.tick(2.0), 1);
        assert_eq!(timer.tick(3.0), 1);
        assert!(!timer.running());
        // Past max_count, further ticks fire nothing.
        assert_eq!(timer.tick(4.0), 0);
    }

    #[test]
    fn paused_timer_does_not_fire() {
        let mut timer = Timer::new(1.0, 1.0, 0);
        timer.pause();
        assert_eq!(timer.tick(5.0), 0);
        assert_eq!(timer.fire_count(), 0);
    }

    #[test]
    fn start_reanchors_schedule_and_resets_fire_count() {
        let mut timer = Timer::new(1.0, 1.0, 0);
        assert_eq!(timer.tick(1.0), 1);
        timer.start(10.0);
        assert_eq!(timer.fire_count(), 0);
        assert_eq!(timer.tick(10.5), 0);
        assert_eq!(timer.tick(11.0), 1);
    }

    #[test]
    fn coarse_tick_can_cross_multiple_fire_points() {
        let mut timer = Timer::new(1.0, 1.0, 0);
        assert_eq!(timer.tick(3.5), 3);
    }
}
