//! Millisecond time sourcing for the channel engine.
//!
//! Channels never look at a clock themselves: every operation that consults
//! "now" takes it as an explicit millisecond argument chosen by the outer
//! loop, which keeps resend and keep-alive timing deterministic in tests.
//! The loops in `broker` and `client` feed real wall time from
//! [`now_millis`].

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_advances() {
        let a = now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_millis();
        assert!(b >= a + 4);
    }
}
