//! ESP-IDF runtime symbol providers for third-party crates.
//!
//! `embassy-sync`'s `CriticalSectionRawMutex` guards the event mailbox,
//! and `isr_trigger` reaches it from interrupt context. The
//! `critical-section` 1.x hooks therefore take a FreeRTOS spinlock
//! (`portENTER_CRITICAL`), which masks interrupts on the calling core
//! and nests on the owning core.

use core::cell::UnsafeCell;

use esp_idf_svc::sys;

/// `portMUX_INITIALIZER_UNLOCKED` owner value.
const SPINLOCK_FREE: u32 = 0xB33F_FFFF;
/// `portMUX_NO_TIMEOUT`
const SPINLOCK_WAIT_FOREVER: i32 = -1;

struct Spinlock(UnsafeCell<sys::portMUX_TYPE>);

// SAFETY: the mux is only ever handed to the FreeRTOS port layer, which
// does its own atomic compare-and-set on it.
unsafe impl Sync for Spinlock {}

static CRITICAL_SECTION_MUX: Spinlock = Spinlock(UnsafeCell::new(sys::portMUX_TYPE {
    owner: SPINLOCK_FREE,
    count: 0,
}));

/// Runtime-backed critical-section acquire used by `critical-section` 1.x.
#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_acquire() -> u8 {
    // SAFETY: static mux, initialised unlocked.
    unsafe {
        sys::xPortEnterCriticalTimeout(CRITICAL_SECTION_MUX.0.get(), SPINLOCK_WAIT_FOREVER);
    }
    0
}

/// Runtime-backed critical-section release used by `critical-section` 1.x.
#[unsafe(no_mangle)]
pub extern "C" fn _critical_section_1_0_release(_token: u8) {
    // SAFETY: paired with the acquire above on the same core.
    unsafe {
        sys::vPortExitCritical(CRITICAL_SECTION_MUX.0.get());
    }
}
