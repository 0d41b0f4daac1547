//! Atrium firmware entry point
//!
//! Boots the reactive kernel and hands the dispatcher thread to the
//! drivers that registered with it.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  main: bootstrap → Kernel::new → driver set up → Kernel::start │
//! │                                                                │
//! │  events thread   mailbox → callbacks → actions                 │
//! │                  idle slots → cyclic SubTasks                  │
//! │  esp_timer task  fuse expiry → `timeout events (no wait)       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use atrium_kernel::config::KernelConfig;
use atrium_kernel::kernel::Kernel;

/// Interval of the `system` heartbeat fuse (milliseconds).
const HEARTBEAT_MS: u32 = 60_000;

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  Atrium v{}                          ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Kernel ─────────────────────────────────────────────
    let kernel = Kernel::new(KernelConfig::default())?;

    // ── 3. System drivers ─────────────────────────────────────
    let boot = kernel.register_event("system", Some("`boot"))?;
    let weak_bus = std::sync::Arc::downgrade(kernel.events());
    let weak_cyclic = std::sync::Arc::downgrade(kernel.cyclic());
    kernel.register_action(
        "system!stats",
        move |_| {
            if let Some(bus) = weak_bus.upgrade() {
                let c = bus.counters();
                info!(
                    "system: processed {}, discarded {}, lost {}, invalid {}",
                    c.processed, c.discarded, c.lost, c.invalid
                );
            }
            if let Some(cyclic) = weak_cyclic.upgrade() {
                let mut table = String::new();
                if cyclic.render_table(&mut table).is_ok() {
                    info!("system: subtasks\n{}", table);
                }
            }
        },
        None,
        Some("log event counters and the SubTask table"),
    )?;

    let heartbeat = kernel.create_timefuse("heartbeat", HEARTBEAT_MS, true)?;
    kernel.attach_callback(heartbeat.timeout_event(), "system!stats")?;
    kernel.attach_callback(boot, "heartbeat!start")?;

    // ── 4. Run ────────────────────────────────────────────────
    kernel.start()?;
    kernel.trigger(boot);
    info!("System ready. Dispatcher running.");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
        if kernel.events().pending() > 0 {
            warn!("main: mailbox still holds {} events", kernel.events().pending());
        }
    }
}
