use std::time::Duration;

use tokio::time::Instant;

/// Tick lengths are configured in tenths of a second.
const TENTH_SECOND: Duration = Duration::from_millis(100);

/// Duration of one tick for a configured `tick_len`.
///
/// The clock is [`CLOCK_MONOTONIC`](https://man7.org/linux/man-pages/man2/clock_gettime.2.html)
/// style throughout: deadlines are [`Instant`]s, wall-clock time is never
/// consulted.
pub fn tick_duration(tick_len: u32) -> Duration {
	TENTH_SECOND * tick_len
}

/// The deadline of the tick that starts now.
pub fn next_deadline(tick_len: u32) -> Instant {
	Instant::now() + tick_duration(tick_len)
}

/// Sleep until `deadline` has truly passed.
///
/// Re-checks the clock after every wakeup, so an early return from the
/// underlying timer never cuts the wait short.
pub async fn wait_until(deadline: Instant) {
	while Instant::now() < deadline {
		tokio::time::sleep_until(deadline).await;
	}
}
