//! RTT measurement across the CONNECT exchange.
//!
//! The initiator starts the timer when its CONNECT is written and stops it
//! when the peer's CONNECT arrives. Half the round trip is the time the SYNC
//! still needs to reach the responder, so the initiator waits that long
//! before dialing and both sides start at roughly the same instant.

use std::time::Duration;

use tokio::time::Instant;

/// Upper bound on a usable RTT sample.
/// Anything slower than this is past any hole-punch deadline anyway.
pub const MAX_RTT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RttTimer {
    started_at: Instant,
}

impl RttTimer {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn stop(self) -> RttSample {
        let rtt = self.started_at.elapsed().min(MAX_RTT);
        RttSample { rtt }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    rtt: Duration,
}

impl RttSample {
    pub fn from_rtt(rtt: Duration) -> Self {
        Self { rtt: rtt.min(MAX_RTT) }
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Delay between receiving the peer's CONNECT and dialing: `rtt / 2`.
    pub fn sync_delay(&self) -> Duration {
        self.rtt / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn measures_elapsed_time_on_paused_clock() {
        let timer = RttTimer::start();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let sample = timer.stop();
        assert_eq!(sample.rtt(), Duration::from_millis(80));
        assert_eq!(sample.sync_delay(), Duration::from_millis(40));
    }

    #[test]
    fn sample_is_clamped() {
        let sample = RttSample::from_rtt(Duration::from_secs(3600));
        assert_eq!(sample.rtt(), MAX_RTT);
        assert_eq!(sample.sync_delay(), MAX_RTT / 2);
    }

    #[test]
    fn zero_rtt_means_no_delay() {
        assert_eq!(RttSample::from_rtt(Duration::ZERO).sync_delay(), Duration::ZERO);
    }
}
