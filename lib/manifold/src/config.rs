use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serial line parameters. The frame format is fixed at 8N1 with no flow
/// control; only the rate and the read window vary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    pub baud: u32,
    pub byte_timeout_ms: u64,
}

impl Default for LineSettings {
    fn default() -> LineSettings {
        LineSettings {
            baud: 38_400,
            byte_timeout_ms: 10,
        }
    }
}

/// Transaction timing and the retry schedule of the port gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub response_timeout_ms: u64,
    pub retry_backoff_ms: Vec<u64>,
}

impl Default for TimingSettings {
    fn default() -> TimingSettings {
        TimingSettings {
            response_timeout_ms: 2_000,
            retry_backoff_ms: vec![100, 200, 300],
        }
    }
}

impl TimingSettings {
    #[inline]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    #[inline]
    pub fn backoff(&self, retry: usize) -> Duration {
        Duration::from_millis(self.retry_backoff_ms[retry.min(self.retry_backoff_ms.len() - 1)])
    }

    /// Total attempts an operation gets, the first one included.
    #[inline]
    pub fn max_attempts(&self) -> usize {
        self.retry_backoff_ms.len() + 1
    }
}

/// Poller cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub period_ms: u64,
    pub idle_slice_us: u64,
    pub async_reply_timeout_ms: u64,
}

impl Default for PollSettings {
    fn default() -> PollSettings {
        PollSettings {
            period_ms: 250,
            idle_slice_us: 2_000,
            async_reply_timeout_ms: 400,
        }
    }
}

impl PollSettings {
    #[inline]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    #[inline]
    pub fn idle_slice(&self) -> Duration {
        Duration::from_micros(self.idle_slice_us)
    }

    #[inline]
    pub fn async_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.async_reply_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifoldConfig {
    pub line: LineSettings,
    pub timing: TimingSettings,
    pub poll: PollSettings,
}

impl ManifoldConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ManifoldConfig {
        serdeconv::from_toml_file(path).expect("Error loading bus configuration file")
    }
}
