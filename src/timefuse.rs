//! Timer fuses: named one-shot or repeating timers wired into the
//! event bus and the action registry.
//!
//! Creating fuse `heater` registers
//! - events `heater`started`, `heater`stopped`, `heater`timeout`
//! - actions `heater!start`, `heater!stop`
//!
//! Starting or stopping raises the matching event at once and never
//! waits for mailbox space; with a full mailbox the event is lost. The
//! timeout event is posted by the host timer callback, so timeout
//! handling runs on the dispatcher like any other event.

use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};
use serde::Serialize;

use crate::action::ActionRegistry;
use crate::error::{RegistryError, Result, TimerError};
use crate::event::{EventBus, EventId};
use crate::platform::lock;
use crate::timer::{ExpireFn, TimerId, TimerPort};

pub type FuseRef = Arc<TimeFuse>;

/// Status row of one fuse.
#[derive(Debug, Clone, Serialize)]
pub struct FuseStats {
    pub name: String,
    pub interval_ms: u32,
    pub repeat: bool,
    pub active: bool,
}

pub struct TimeFuse {
    name: String,
    repeat: bool,
    timer: TimerId,
    port: Arc<dyn TimerPort>,
    bus: Arc<EventBus>,
    started: EventId,
    stopped: EventId,
    timeout: EventId,
}

impl core::fmt::Debug for TimeFuse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimeFuse")
            .field("name", &self.name)
            .field("repeat", &self.repeat)
            .finish_non_exhaustive()
    }
}

impl TimeFuse {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    /// Arm (or re-arm) the fuse and raise its `started` event.
    pub fn start(&self) -> Result<()> {
        self.port.start(self.timer)?;
        self.bus.trigger_nowait(self.started);
        Ok(())
    }

    /// Disarm the fuse and raise its `stopped` event.
    pub fn stop(&self) -> Result<()> {
        self.port.stop(self.timer)?;
        self.bus.trigger_nowait(self.stopped);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.port.is_active(self.timer)
    }

    pub fn interval(&self) -> u32 {
        self.port.period(self.timer)
    }

    /// Change the interval; a running fuse restarts with it.
    pub fn set_interval(&self, ms: u32) -> Result<()> {
        self.port.set_period(self.timer, ms)
    }

    pub fn start_event(&self) -> EventId {
        self.started
    }

    pub fn stop_event(&self) -> EventId {
        self.stopped
    }

    pub fn timeout_event(&self) -> EventId {
        self.timeout
    }

    fn stats(&self) -> FuseStats {
        FuseStats {
            name: self.name.clone(),
            interval_ms: self.interval(),
            repeat: self.repeat,
            active: self.is_active(),
        }
    }
}

/// All fuses, in creation order.
pub struct FuseRegistry {
    fuses: Mutex<Vec<FuseRef>>,
    bus: Arc<EventBus>,
    actions: Arc<ActionRegistry>,
    port: Arc<dyn TimerPort>,
}

impl FuseRegistry {
    pub fn new(bus: Arc<EventBus>, actions: Arc<ActionRegistry>, port: Arc<dyn TimerPort>) -> Self {
        Self {
            fuses: Mutex::new(Vec::new()),
            bus,
            actions,
            port,
        }
    }

    /// Create a stopped fuse with its events and actions.
    pub fn create(&self, name: &str, interval_ms: u32, repeat: bool) -> Result<FuseRef> {
        if interval_ms == 0 {
            warn!("timefuse: {}: interval must be > 0", name);
            return Err(TimerError::InvalidInterval.into());
        }
        if self.get(name).is_some() {
            warn!("timefuse: {} already exists", name);
            return Err(RegistryError::DuplicateName.into());
        }

        let started = self.bus.register(name, Some("`started"))?;
        let stopped = self.bus.register(name, Some("`stopped"))?;
        let timeout = self.bus.register(name, Some("`timeout"))?;

        let bus = Arc::clone(&self.bus);
        let on_expire: ExpireFn = Arc::new(move || bus.trigger_nowait(timeout));
        let timer = self.port.create(name, interval_ms, repeat, on_expire)?;

        let fuse = Arc::new(TimeFuse {
            name: name.to_owned(),
            repeat,
            timer,
            port: Arc::clone(&self.port),
            bus: Arc::clone(&self.bus),
            started,
            stopped,
            timeout,
        });

        // Actions outlive a deleted fuse; they hold it weakly and turn
        // into no-ops once it is gone.
        let weak = Arc::downgrade(&fuse);
        self.register_action(
            &format!("{name}!start"),
            weak.clone(),
            TimeFuse::start,
            "start timer",
        )?;
        self.register_action(&format!("{name}!stop"), weak, TimeFuse::stop, "stop timer")?;

        lock(&self.fuses).push(Arc::clone(&fuse));
        info!("timefuse: created {} ({}ms, repeat={})", name, interval_ms, repeat);
        Ok(fuse)
    }

    fn register_action(
        &self,
        action: &str,
        fuse: Weak<TimeFuse>,
        op: fn(&TimeFuse) -> Result<()>,
        help: &str,
    ) -> Result<()> {
        let label = action.to_owned();
        self.actions.register(
            action,
            move |_| match fuse.upgrade() {
                Some(f) => {
                    if let Err(e) = op(&f) {
                        warn!("timefuse: {}: {}", label, e);
                    }
                }
                None => warn!("timefuse: {}: fuse was deleted", label),
            },
            None,
            Some(help),
        )?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<FuseRef> {
        lock(&self.fuses).iter().find(|f| f.name == name).cloned()
    }

    /// Stop the fuse and release its timer. Its events and actions stay
    /// registered.
    pub fn delete(&self, name: &str) -> Result<()> {
        let fuse = {
            let mut fuses = lock(&self.fuses);
            let Some(i) = fuses.iter().position(|f| f.name == name) else {
                return Err(RegistryError::UnknownName.into());
            };
            fuses.remove(i)
        };
        self.port.delete(fuse.timer);
        info!("timefuse: deleted {}", name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.fuses).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every fuse in creation order.
    pub fn iterate(&self, mut visitor: impl FnMut(&TimeFuse)) {
        let snapshot: Vec<FuseRef> = lock(&self.fuses).clone();
        for f in &snapshot {
            visitor(f);
        }
    }

    pub fn stats(&self) -> Vec<FuseStats> {
        let mut out = Vec::new();
        self.iterate(|f| out.push(f.stats()));
        out
    }
}
