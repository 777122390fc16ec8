use std::sync::OnceLock;
use std::time::Instant;

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
///
/// Frame timestamps handed to the pusher should come from this clock so that
/// graceful stop deadlines compare against the same timeline.
pub fn now_ns() -> u64 {
    let base = CLOCK_BASE.get_or_init(Instant::now);
    // Offset by one so a valid timestamp is never zero, zero means "unset".
    base.elapsed().as_nanos() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
