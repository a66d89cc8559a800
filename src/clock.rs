use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in whole milliseconds.
///
/// Queue entry timestamps and the T1/T2/T3 deadlines are defined on wall
/// time, so a stepped system clock can move this value backwards. The
/// connection timers clamp stored timestamps against that (see
/// `server::connection`).
pub fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        Err(_) => 0,
    }
}
