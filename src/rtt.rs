//! Jacobson/Karels round-trip time estimation.
//!
//! On ack of a slot first sent at `t_send`, the sender samples `r = now - t_send` and feeds
//!  it here. The smoothed estimate and deviation travel on outbound packets for
//!  observability; [`RttEstimator::rto`] is available for an adaptive retransmission timeout,
//!  though the shipped retry policy uses the configured constant timeout.

use std::time::Duration;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt_nsec: f64,
    rttvar_nsec: f64,
    n: i64,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            srtt_nsec: 0.0,
            rttvar_nsec: 0.0,
            n: 0,
        }
    }

    /// feeds one sample, in nanoseconds
    pub fn sample(&mut self, r_nsec: i64) {
        let r = r_nsec as f64;

        if self.n == 0 {
            self.srtt_nsec = r;
            self.rttvar_nsec = r / 2.0;
        }
        else {
            self.rttvar_nsec = (1.0 - BETA) * self.rttvar_nsec + BETA * (self.srtt_nsec - r).abs();
            self.srtt_nsec = (1.0 - ALPHA) * self.srtt_nsec + ALPHA * r;
        }
        self.n += 1;
    }

    /// smoothed RTT estimate in nanoseconds, 0 before the first sample
    pub fn estimate_nsec(&self) -> i64 {
        self.srtt_nsec as i64
    }

    /// smoothed deviation in nanoseconds, 0 before the first sample
    pub fn deviation_nsec(&self) -> i64 {
        self.rttvar_nsec as i64
    }

    /// number of samples observed
    pub fn n(&self) -> i64 {
        self.n
    }

    /// `srtt + 4*rttvar`, clamped to `[min, max]`
    pub fn rto(&self, min: Duration, max: Duration) -> Duration {
        let raw = self.srtt_nsec + 4.0 * self.rttvar_nsec;
        Duration::from_nanos(raw as u64).clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.n(), 0);
        assert_eq!(rtt.estimate_nsec(), 0);

        rtt.sample(8_000);

        assert_eq!(rtt.n(), 1);
        assert_eq!(rtt.estimate_nsec(), 8_000);
        assert_eq!(rtt.deviation_nsec(), 4_000);
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttEstimator::new();
        rtt.sample(8_000);
        rtt.sample(16_000);

        // rttvar = 3/4*4000 + 1/4*|8000-16000| = 5000
        // srtt   = 7/8*8000 + 1/8*16000        = 9000
        assert_eq!(rtt.deviation_nsec(), 5_000);
        assert_eq!(rtt.estimate_nsec(), 9_000);
        assert_eq!(rtt.n(), 2);
    }

    #[test]
    fn test_converges_on_constant_input() {
        let mut rtt = RttEstimator::new();
        for _ in 0..200 {
            rtt.sample(10_000);
        }
        assert_eq!(rtt.estimate_nsec(), 10_000);
        assert!(rtt.deviation_nsec() < 10);
    }

    #[rstest]
    #[case::clamped_to_min(1_000, Duration::from_millis(1), Duration::from_secs(1), Duration::from_millis(1))]
    #[case::clamped_to_max(500_000_000, Duration::from_millis(1), Duration::from_millis(100), Duration::from_millis(100))]
    fn test_rto_clamping(#[case] sample_nsec: i64, #[case] min: Duration, #[case] max: Duration, #[case] expected: Duration) {
        let mut rtt = RttEstimator::new();
        rtt.sample(sample_nsec);
        assert_eq!(rtt.rto(min, max), expected);
    }

    #[test]
    fn test_rto_formula() {
        let mut rtt = RttEstimator::new();
        rtt.sample(8_000);

        // srtt + 4*rttvar = 8000 + 16000 = 24000
        assert_eq!(
            rtt.rto(Duration::from_nanos(0), Duration::from_secs(10)),
            Duration::from_nanos(24_000)
        );
    }
}
