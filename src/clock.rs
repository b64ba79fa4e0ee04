/// Returns the current `CLOCK_MONOTONIC` reading in nanoseconds.
///
/// Frames carry a timestamp taken from this clock at publish time, so a
/// consumer computes delivery latency as `monotonic_ns() - frame.timestamp_ns()`
/// and the result is never negative. The monotonic clock is unaffected by
/// wall-clock adjustments, but its epoch is arbitrary and differs across
/// host reboots.
#[inline]
pub fn monotonic_ns() -> u64 {
    use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec out-parameter; CLOCK_MONOTONIC is
    // always available on the supported platforms.
    unsafe {
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_positive() {
        assert!(monotonic_ns() > 0);
    }

    #[test]
    fn never_goes_backwards() {
        let t1 = monotonic_ns();
        let t2 = monotonic_ns();
        assert!(t2 >= t1, "monotonic clock went backwards: {} < {}", t2, t1);
    }

    #[test]
    fn advances_over_sleep() {
        let t1 = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = monotonic_ns();
        assert!(t2 > t1);
    }
}
