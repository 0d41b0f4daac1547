//! Platform services the kernel needs from the host: a monotonic clock
//! and a source of random numbers.
//!
//! - **`target_os = "espidf"`**: `esp_timer_get_time()` and the hardware
//!   RNG (`esp_random`).
//! - **`not(target_os = "espidf")`**: `std::time::Instant` and
//!   `RandomState` entropy for host-side testing and simulation.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Shortest sleep that yields the CPU. Below one FreeRTOS tick
/// `thread::sleep` spins in `esp_rom_delay_us` instead of blocking.
#[cfg(target_os = "espidf")]
pub const TICK: Duration =
    Duration::from_millis(1000 / esp_idf_svc::sys::configTICK_RATE_HZ as u64);

/// Host scheduler granularity.
#[cfg(not(target_os = "espidf"))]
pub const TICK: Duration = Duration::from_millis(1);

/// Sleep for `d`, rounded up to at least one [`TICK`].
pub fn sleep_at_least(d: Duration) {
    std::thread::sleep(d.max(TICK));
}

/// Monotonic microsecond time source.
///
/// The scheduler computes deadlines from it and actions/events/tasks
/// record their latency statistics with it.
pub trait Clock: Send + Sync {
    /// Microseconds since boot (monotonic).
    fn now_us(&self) -> u64;
}

/// The platform's monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        uptime_us()
    }
}

/// Microseconds since boot (monotonic).
#[cfg(target_os = "espidf")]
pub fn uptime_us() -> u64 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64
}

/// Microseconds since first use (monotonic).
#[cfg(not(target_os = "espidf"))]
pub fn uptime_us() -> u64 {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// 32 random bits from the hardware RNG.
#[cfg(target_os = "espidf")]
pub fn random_u32() -> u32 {
    // SAFETY: esp_random has no preconditions; it reads the RNG register.
    unsafe { esp_idf_svc::sys::esp_random() }
}

/// Host stub. Uses `RandomState` to produce non-cryptographic entropy.
#[cfg(not(target_os = "espidf"))]
pub fn random_u32() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(uptime_us());
    h.finish() as u32
}

/// Take a registry lock. Bodies never run under a registry lock, so a
/// poisoned lock still guards consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand-cranked clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn set_us(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
