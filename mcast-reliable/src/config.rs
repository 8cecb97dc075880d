//! Communicator tuning knobs.
//!
//! [`CommConfig`] bounds every resource the core touches: window size, queue
//! depths, completion moderation and the staging pool.  Values come from
//! [`CommConfig::default`], optionally overridden from `MCAST_*` environment
//! variables via [`CommConfig::from_env`], and must pass
//! [`CommConfig::validate`] before a communicator is built.

use std::time::Duration;

use thiserror::Error;

/// Errors found while validating or loading a configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("window size {0} is not a power of two >= 2")]
    WindowNotPowerOfTwo(usize),
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: usize,
        value: usize,
    },
    #[error("max_inline ({max_inline}) exceeds max_per_packet ({max_per_packet})")]
    InlineTooLarge {
        max_inline: usize,
        max_per_packet: usize,
    },
    #[error("scq_moderation ({moderation}) exceeds sx_depth ({sx_depth})")]
    ModerationTooLarge { moderation: usize, sx_depth: usize },
    #[error("probability {name} = {value} outside [0, 1]")]
    BadProbability { name: &'static str, value: f64 },
    #[error("environment variable {var} has unparsable value {value:?}")]
    BadEnv { var: &'static str, value: String },
}

/// Per-communicator configuration.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Receive window size in packets; must be a power of two.
    pub wsize: usize,
    /// Hardware send queue depth.
    pub sx_depth: usize,
    /// Number of receive buffers kept posted.
    pub rx_depth: usize,
    /// One send in every `scq_moderation` is signaled.
    pub scq_moderation: usize,
    /// Receive buffers are reposted only once this many are missing.
    pub post_recv_thresh: usize,
    /// Maximum payload bytes per packet (excluding the routing header).
    pub max_per_packet: usize,
    /// Payloads up to this size are sent inline.
    pub max_inline: usize,
    /// Number of staging descriptors in the pool.
    pub buf_n: usize,
    /// Receive completions drained per poll in the batch receiver.
    pub poll_batch: usize,
    /// Stalled progress calls before drop detection arms its timer.
    pub drop_threshold: u32,
    /// Time a stall must last before a NACK is sent.
    pub nack_timeout: Duration,
    /// Broadcasts of at least this many bytes use zero-copy sends.
    pub zcopy_threshold: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            wsize: 64,
            sx_depth: 512,
            rx_depth: 1024,
            scq_moderation: 64,
            post_recv_thresh: 64,
            max_per_packet: 4096 - crate::packet::GRH_LENGTH,
            max_inline: 128,
            buf_n: 2048,
            poll_batch: 16,
            drop_threshold: 1000,
            nack_timeout: Duration::from_millis(10),
            zcopy_threshold: 64 * 1024,
        }
    }
}

impl CommConfig {
    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wsize < 2 || !self.wsize.is_power_of_two() {
            return Err(ConfigError::WindowNotPowerOfTwo(self.wsize));
        }
        at_least("sx_depth", 1, self.sx_depth)?;
        at_least("scq_moderation", 1, self.scq_moderation)?;
        at_least("max_per_packet", 1, self.max_per_packet)?;
        at_least("poll_batch", 1, self.poll_batch)?;
        // Posted receives plus a full window must still leave a spare descriptor.
        at_least("buf_n", self.rx_depth + self.wsize + 1, self.buf_n)?;
        // Receive buffers are only ever reposted in batches larger than the threshold.
        at_least("rx_depth", self.post_recv_thresh + 1, self.rx_depth)?;
        if self.scq_moderation > self.sx_depth {
            return Err(ConfigError::ModerationTooLarge {
                moderation: self.scq_moderation,
                sx_depth: self.sx_depth,
            });
        }
        if self.max_inline > self.max_per_packet {
            return Err(ConfigError::InlineTooLarge {
                max_inline: self.max_inline,
                max_per_packet: self.max_per_packet,
            });
        }
        Ok(())
    }

    /// Start from the defaults and apply any `MCAST_*` overrides found in the
    /// process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment, a map in
    /// tests).  Unknown variables are simply absent.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let usize_vars: [(&'static str, &mut usize); 10] = [
            ("MCAST_WSIZE", &mut self.wsize),
            ("MCAST_SX_DEPTH", &mut self.sx_depth),
            ("MCAST_RX_DEPTH", &mut self.rx_depth),
            ("MCAST_SCQ_MODERATION", &mut self.scq_moderation),
            ("MCAST_POST_RECV_THRESH", &mut self.post_recv_thresh),
            ("MCAST_MAX_PER_PACKET", &mut self.max_per_packet),
            ("MCAST_MAX_INLINE", &mut self.max_inline),
            ("MCAST_BUF_N", &mut self.buf_n),
            ("MCAST_POLL_BATCH", &mut self.poll_batch),
            ("MCAST_ZCOPY_THRESHOLD", &mut self.zcopy_threshold),
        ];
        for (var, slot) in usize_vars {
            if let Some(raw) = lookup(var) {
                *slot = parse(var, &raw)?;
            }
        }
        if let Some(raw) = lookup("MCAST_DROP_THRESHOLD") {
            self.drop_threshold = parse("MCAST_DROP_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("MCAST_NACK_TIMEOUT_US") {
            self.nack_timeout = Duration::from_micros(parse("MCAST_NACK_TIMEOUT_US", &raw)?);
        }
        self.validate()?;
        Ok(self)
    }
}

fn at_least(name: &'static str, min: usize, value: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::BadEnv {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(CommConfig::default().validate(), Ok(()));
    }

    #[test]
    fn window_must_be_power_of_two() {
        let cfg = CommConfig {
            wsize: 48,
            ..CommConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::WindowNotPowerOfTwo(48)));
    }

    #[test]
    fn pool_must_cover_window() {
        let cfg = CommConfig {
            wsize: 64,
            rx_depth: 1024,
            buf_n: 1088,
            ..CommConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooSmall { name: "buf_n", .. })
        ));
    }

    #[test]
    fn inline_bounded_by_packet_size() {
        let cfg = CommConfig {
            max_per_packet: 64,
            max_inline: 128,
            ..CommConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InlineTooLarge { .. })));
    }

    #[test]
    fn overrides_apply_and_revalidate() {
        let vars: HashMap<&str, &str> = [("MCAST_WSIZE", "16"), ("MCAST_NACK_TIMEOUT_US", "250")]
            .into_iter()
            .collect();
        let cfg = CommConfig::default()
            .with_overrides(|v| vars.get(v).map(|s| s.to_string()))
            .unwrap();
        assert_eq!(cfg.wsize, 16);
        assert_eq!(cfg.nack_timeout, Duration::from_micros(250));

        let bad = CommConfig::default().with_overrides(|v| {
            (v == "MCAST_WSIZE").then(|| "twelve".to_string())
        });
        assert!(matches!(bad, Err(ConfigError::BadEnv { var: "MCAST_WSIZE", .. })));
    }
}
