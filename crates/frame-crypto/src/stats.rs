use serde::Serialize;

/// Weight of the newest sample in the latency average
const LATENCY_SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EncryptionStats {
    pub frames_encrypted: u64,
    pub frames_decrypted: u64,
    pub failures: u64,
    pub key_rotations: u64,
    /// Exponentially weighted average of per-call latency, microseconds
    pub average_latency_us: f64,
    pub latency_samples: u64,
}

impl EncryptionStats {
    pub(crate) fn record_latency(&mut self, sample_us: f64) {
        self.average_latency_us = if self.latency_samples == 0 {
            sample_us
        } else {
            self.average_latency_us * (1.0 - LATENCY_SMOOTHING) + sample_us * LATENCY_SMOOTHING
        };
        self.latency_samples += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_average() {
        let mut stats = EncryptionStats::default();
        stats.record_latency(50.0);
        assert_eq!(stats.average_latency_us, 50.0);
        assert_eq!(stats.latency_samples, 1);
    }

    #[test]
    fn test_subsequent_samples_are_smoothed() {
        let mut stats = EncryptionStats::default();
        stats.record_latency(100.0);
        stats.record_latency(200.0);
        assert!((stats.average_latency_us - 110.0).abs() < 1e-9);
        stats.record_latency(0.0);
        assert!((stats.average_latency_us - 99.0).abs() < 1e-9);
    }
}
