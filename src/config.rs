//! Kernel configuration parameters.
//!
//! Tunables for the dispatcher, the cyclic scheduler and the dataflow
//! graph. Drivers never see this; the firmware builds one at boot and
//! hands it to [`Kernel::new`](crate::kernel::Kernel::new).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Depth of the event mailbox. Fixed at compile time because the
/// mailbox is a statically sized channel.
pub const MAILBOX_DEPTH: usize = 32;

/// Core kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    // --- Event bus ---
    /// How long `trigger` may block waiting for mailbox space (milliseconds)
    pub send_timeout_ms: u32,
    /// Maximum dispatcher wait before it polls the scheduler (milliseconds)
    pub idle_poll_ms: u32,
    /// Interval between lost/invalid/discarded reports (milliseconds)
    pub report_interval_ms: u32,

    // --- Dataflow ---
    /// Maximum nesting of Signal -> Function -> Signal propagation
    pub max_propagation_depth: u8,

    // --- Threads ---
    /// Stack size of the dispatcher thread (bytes)
    pub dispatcher_stack_size: usize,
    /// Stack size of the cyclic thread, if one is used (bytes)
    pub cyclic_stack_size: usize,
    /// Run the cyclic scheduler in its own thread instead of the
    /// dispatcher's idle slots
    pub dedicated_cyclic_thread: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            // Event bus
            send_timeout_ms: 1000,
            idle_poll_ms: 100,
            report_interval_ms: 10_000,

            // Dataflow
            max_propagation_depth: 16,

            // Threads
            dispatcher_stack_size: 8192,
            cyclic_stack_size: 8192,
            dedicated_cyclic_thread: false,
        }
    }
}

impl KernelConfig {
    /// Reject values that would make the dispatcher spin or the graph inert.
    pub fn validate(&self) -> Result<()> {
        if self.send_timeout_ms == 0 {
            return Err(Error::Config("send_timeout_ms must be > 0"));
        }
        if self.idle_poll_ms == 0 {
            return Err(Error::Config("idle_poll_ms must be > 0"));
        }
        if self.report_interval_ms < self.idle_poll_ms {
            return Err(Error::Config("report_interval_ms below idle_poll_ms"));
        }
        if self.max_propagation_depth == 0 {
            return Err(Error::Config("max_propagation_depth must be > 0"));
        }
        if self.dispatcher_stack_size < 2048 || self.cyclic_stack_size < 2048 {
            return Err(Error::Config("thread stack below 2 KiB"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = KernelConfig::default();
        assert!(c.validate().is_ok());
        assert!(c.send_timeout_ms > 0);
        assert!(c.idle_poll_ms > 0);
        assert!(c.max_propagation_depth > 0);
        assert!(!c.dedicated_cyclic_thread);
    }

    #[test]
    fn serde_roundtrip() {
        let c = KernelConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let c2: KernelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c.send_timeout_ms, c2.send_timeout_ms);
        assert_eq!(c.max_propagation_depth, c2.max_propagation_depth);
        assert_eq!(c.dispatcher_stack_size, c2.dispatcher_stack_size);
    }

    #[test]
    fn zero_timeout_rejected() {
        let c = KernelConfig {
            send_timeout_ms: 0,
            ..KernelConfig::default()
        };
        assert_eq!(
            c.validate(),
            Err(Error::Config("send_timeout_ms must be > 0"))
        );
    }

    #[test]
    fn timing_ratios_make_sense() {
        let c = KernelConfig::default();
        assert!(
            c.idle_poll_ms <= c.report_interval_ms,
            "loss reports cannot be more frequent than idle polls"
        );
    }
}
