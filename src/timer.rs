//! Host timer facility behind the timer fuses.
//!
//! Two implementations of [`TimerPort`]:
//! - [`SoftTimers`]: deadline list serviced from a `timefuse` SubTask of
//!   the cyclic scheduler. Resolution is the scheduler's poll interval.
//!   Used on the host and in tests.
//! - [`EspTimers`] (`target_os = "espidf"`): one `esp_timer` per fuse,
//!   callbacks dispatched from the esp_timer task.
//!
//! Expiry callbacks must not block: they typically post an event with
//! [`EventBus::trigger_nowait`](crate::event::EventBus::trigger_nowait).

use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Result, TimerError};
use crate::platform::{lock, Clock};

/// Expiry callback.
pub type ExpireFn = Arc<dyn Fn() + Send + Sync>;

/// Slot of a timer inside its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// One-shot/periodic timers provided by the platform.
pub trait TimerPort: Send + Sync {
    /// Allocate a stopped timer.
    fn create(
        &self,
        name: &str,
        period_ms: u32,
        repeat: bool,
        on_expire: ExpireFn,
    ) -> Result<TimerId>;
    /// Arm the timer for one period from now, restarting it if running.
    fn start(&self, id: TimerId) -> Result<()>;
    fn stop(&self, id: TimerId) -> Result<()>;
    fn is_active(&self, id: TimerId) -> bool;
    /// Change the period. A running timer is re-armed with the new period.
    fn set_period(&self, id: TimerId, period_ms: u32) -> Result<()>;
    fn period(&self, id: TimerId) -> u32;
    /// Stop and release the timer. Its id is never reused.
    fn delete(&self, id: TimerId);

    /// Whether expiry depends on [`service`](Self::service) being called
    /// from the cyclic scheduler.
    fn is_polled(&self) -> bool {
        false
    }

    /// Fire expired timers. Returns the milliseconds until the next
    /// deadline.
    fn service(&self) -> u32 {
        u32::MAX
    }
}

// ═══════════════════════════════════════════════════════════════
//  Soft timers
// ═══════════════════════════════════════════════════════════════

/// Name of the SubTask that services [`SoftTimers`].
pub const SOFT_TIMER_TASK: &str = "timefuse";

struct SoftTimer {
    period_ms: u32,
    repeat: bool,
    deadline_us: Option<u64>,
    on_expire: ExpireFn,
}

/// Timers polled from the cyclic scheduler.
pub struct SoftTimers {
    timers: Mutex<Vec<Option<SoftTimer>>>,
    clock: Arc<dyn Clock>,
}

impl SoftTimers {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Fire every expired timer, then return the milliseconds until the
    /// next deadline (`u32::MAX` when nothing is armed).
    ///
    /// Callbacks run outside the timer lock, so they may start or stop
    /// timers.
    pub fn service(&self) -> u32 {
        let now = self.clock.now_us();
        let fired: Vec<ExpireFn> = {
            let mut timers = lock(&self.timers);
            timers
                .iter_mut()
                .flatten()
                .filter(|t| t.deadline_us.is_some_and(|d| d <= now))
                .map(|t| {
                    t.deadline_us = t.repeat.then(|| now + ms_to_us(t.period_ms));
                    Arc::clone(&t.on_expire)
                })
                .collect()
        };
        for f in &fired {
            f();
        }

        let now = self.clock.now_us();
        lock(&self.timers)
            .iter()
            .flatten()
            .filter_map(|t| t.deadline_us)
            .map(|d| u32::try_from(d.saturating_sub(now) / 1000).unwrap_or(u32::MAX))
            .min()
            .unwrap_or(u32::MAX)
    }

    fn with<R>(&self, id: TimerId, f: impl FnOnce(&mut SoftTimer, u64) -> R) -> Result<R> {
        let now = self.clock.now_us();
        let mut timers = lock(&self.timers);
        match timers.get_mut(id.0).and_then(Option::as_mut) {
            Some(t) => Ok(f(t, now)),
            None => Err(TimerError::StartFailed.into()),
        }
    }
}

fn ms_to_us(ms: u32) -> u64 {
    u64::from(ms) * 1000
}

impl TimerPort for SoftTimers {
    fn create(
        &self,
        name: &str,
        period_ms: u32,
        repeat: bool,
        on_expire: ExpireFn,
    ) -> Result<TimerId> {
        if period_ms == 0 {
            return Err(TimerError::InvalidInterval.into());
        }
        let mut timers = lock(&self.timers);
        timers.push(Some(SoftTimer {
            period_ms,
            repeat,
            deadline_us: None,
            on_expire,
        }));
        debug!("timer: soft timer {} ({}ms, repeat={})", name, period_ms, repeat);
        Ok(TimerId(timers.len() - 1))
    }

    fn start(&self, id: TimerId) -> Result<()> {
        self.with(id, |t, now| t.deadline_us = Some(now + ms_to_us(t.period_ms)))
    }

    fn stop(&self, id: TimerId) -> Result<()> {
        self.with(id, |t, _| t.deadline_us = None)
            .map_err(|_| TimerError::StopFailed.into())
    }

    fn is_active(&self, id: TimerId) -> bool {
        self.with(id, |t, _| t.deadline_us.is_some()).unwrap_or(false)
    }

    fn set_period(&self, id: TimerId, period_ms: u32) -> Result<()> {
        if period_ms == 0 {
            return Err(TimerError::InvalidInterval.into());
        }
        self.with(id, |t, now| {
            t.period_ms = period_ms;
            if t.deadline_us.is_some() {
                t.deadline_us = Some(now + ms_to_us(period_ms));
            }
        })
    }

    fn period(&self, id: TimerId) -> u32 {
        self.with(id, |t, _| t.period_ms).unwrap_or(0)
    }

    fn delete(&self, id: TimerId) {
        if let Some(slot) = lock(&self.timers).get_mut(id.0) {
            *slot = None;
        }
    }

    fn is_polled(&self) -> bool {
        true
    }

    fn service(&self) -> u32 {
        SoftTimers::service(self)
    }
}

// ═══════════════════════════════════════════════════════════════
//  ESP-IDF timers
// ═══════════════════════════════════════════════════════════════

#[cfg(target_os = "espidf")]
pub use esp::EspTimers;

#[cfg(target_os = "espidf")]
mod esp {
    use std::ffi::CString;
    use std::sync::Mutex;

    use esp_idf_svc::sys::*;
    use log::{debug, error};

    use super::{ExpireFn, TimerId, TimerPort};
    use crate::error::{Result, TimerError};
    use crate::platform::lock;

    struct EspTimer {
        handle: esp_timer_handle_t,
        /// Boxed callback handed to esp_timer as its `arg`.
        ctx: *mut ExpireFn,
        /// esp_timer keeps a pointer to the name.
        _name: CString,
        period_ms: u32,
        repeat: bool,
    }

    // SAFETY: the handle and ctx pointer are only used through esp_timer
    // API calls, which are thread-safe, and ctx is freed only after the
    // timer has been deleted.
    unsafe impl Send for EspTimer {}

    unsafe extern "C" fn expire_cb(arg: *mut core::ffi::c_void) {
        // SAFETY: arg is the ExpireFn boxed in `create`; it outlives the
        // timer (released in `delete` after esp_timer_delete).
        let f = unsafe { &*(arg as *const ExpireFn) };
        f();
    }

    /// Fuse timers backed by `esp_timer`.
    #[derive(Default)]
    pub struct EspTimers {
        timers: Mutex<Vec<Option<EspTimer>>>,
    }

    impl EspTimers {
        pub fn new() -> Self {
            Self::default()
        }

        fn arm(t: &EspTimer) -> Result<()> {
            let us = u64::from(t.period_ms) * 1000;
            // SAFETY: handle came from esp_timer_create and is not deleted.
            let ret = unsafe {
                if esp_timer_is_active(t.handle) {
                    esp_timer_stop(t.handle);
                }
                if t.repeat {
                    esp_timer_start_periodic(t.handle, us)
                } else {
                    esp_timer_start_once(t.handle, us)
                }
            };
            if ret != ESP_OK {
                error!("timer: start failed (rc={})", ret);
                return Err(TimerError::StartFailed.into());
            }
            Ok(())
        }
    }

    impl TimerPort for EspTimers {
        fn create(
            &self,
            name: &str,
            period_ms: u32,
            repeat: bool,
            on_expire: ExpireFn,
        ) -> Result<TimerId> {
            if period_ms == 0 {
                return Err(TimerError::InvalidInterval.into());
            }
            let cname = CString::new(name).map_err(|_| TimerError::CreateFailed)?;
            let ctx = Box::into_raw(Box::new(on_expire));
            let args = esp_timer_create_args_t {
                callback: Some(expire_cb),
                arg: ctx.cast(),
                dispatch_method: esp_timer_dispatch_t_ESP_TIMER_TASK,
                name: cname.as_ptr(),
                skip_unhandled_events: true,
            };
            let mut handle: esp_timer_handle_t = core::ptr::null_mut();
            // SAFETY: args and handle are valid for the call; ctx stays
            // alive until `delete`.
            let ret = unsafe { esp_timer_create(&args, &mut handle) };
            if ret != ESP_OK {
                error!("timer: create {} failed (rc={})", name, ret);
                // SAFETY: ctx was never handed to a live timer.
                drop(unsafe { Box::from_raw(ctx) });
                return Err(TimerError::CreateFailed.into());
            }
            debug!("timer: esp_timer {} ({}ms, repeat={})", name, period_ms, repeat);
            let mut timers = lock(&self.timers);
            timers.push(Some(EspTimer {
                handle,
                ctx,
                _name: cname,
                period_ms,
                repeat,
            }));
            Ok(TimerId(timers.len() - 1))
        }

        fn start(&self, id: TimerId) -> Result<()> {
            let timers = lock(&self.timers);
            let t = timers.get(id.0).and_then(Option::as_ref).ok_or(TimerError::StartFailed)?;
            Self::arm(t)
        }

        fn stop(&self, id: TimerId) -> Result<()> {
            let timers = lock(&self.timers);
            let t = timers.get(id.0).and_then(Option::as_ref).ok_or(TimerError::StopFailed)?;
            // SAFETY: live handle.
            unsafe {
                if esp_timer_is_active(t.handle) {
                    esp_timer_stop(t.handle);
                }
            }
            Ok(())
        }

        fn is_active(&self, id: TimerId) -> bool {
            let timers = lock(&self.timers);
            timers
                .get(id.0)
                .and_then(Option::as_ref)
                // SAFETY: live handle.
                .is_some_and(|t| unsafe { esp_timer_is_active(t.handle) })
        }

        fn set_period(&self, id: TimerId, period_ms: u32) -> Result<()> {
            if period_ms == 0 {
                return Err(TimerError::InvalidInterval.into());
            }
            let mut timers = lock(&self.timers);
            let t = timers.get_mut(id.0).and_then(Option::as_mut).ok_or(TimerError::StartFailed)?;
            t.period_ms = period_ms;
            // SAFETY: live handle.
            if unsafe { esp_timer_is_active(t.handle) } {
                Self::arm(t)?;
            }
            Ok(())
        }

        fn period(&self, id: TimerId) -> u32 {
            lock(&self.timers)
                .get(id.0)
                .and_then(Option::as_ref)
                .map_or(0, |t| t.period_ms)
        }

        fn delete(&self, id: TimerId) {
            let Some(t) = lock(&self.timers).get_mut(id.0).and_then(Option::take) else {
                return;
            };
            // SAFETY: live handle; after esp_timer_delete no callback can
            // observe ctx, so it is released here exactly once.
            unsafe {
                esp_timer_stop(t.handle);
                esp_timer_delete(t.handle);
                drop(Box::from_raw(t.ctx));
            }
        }
    }
}
