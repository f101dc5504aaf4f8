use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on the process-wide clip clock.
///
/// Never returns 0, which `ClipReader::current` treats as "not animating".
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64 + 1
}

/// Converts a clip clock timestamp back into an `Instant` for timers.
pub fn instant_at(ms: u64) -> Instant {
    epoch() + Duration::from_millis(ms.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_never_zero_and_round_trips() {
        let now = now_ms();
        assert!(now >= 1);
        let at = instant_at(now + 50);
        assert!(at > Instant::now());
    }
}
