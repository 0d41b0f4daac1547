//! Kernel facade: the API drivers are written against.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Kernel                             │
//! │                                                              │
//! │  ActionRegistry ◀── EventBus ──▶ Cyclic ◀── SoftTimers       │
//! │        ▲               ▲            (timefuse SubTask)       │
//! │        │               │                                     │
//! │        └──── Graph ────┴──── FuseRegistry ──▶ TimerPort      │
//! │                                                              │
//! │  thread "events": EventBus::run_dispatcher (+ Cyclic idle)   │
//! │  thread "cyclic": optional, Cyclic::run_once loop            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Set up happens before [`Kernel::start`]: drivers register events,
//! actions, SubTasks, signals and functions, then the dispatcher thread
//! is spawned. Everything stays usable from any thread afterwards.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, info};

use crate::action::{split_name, ActionRef, ActionRegistry};
use crate::config::KernelConfig;
use crate::cyclic::Cyclic;
use crate::dataflow::{FunctionId, Graph, SignalId, SignalValue};
use crate::error::{Error, RegistryError, Result};
use crate::event::{DispatchTiming, EventBus, EventId, TriggerHandle};
use crate::platform::{lock, sleep_at_least, Clock, MonotonicClock};
use crate::status::{ActionInfo, KernelStatus};
use crate::timefuse::{FuseRef, FuseRegistry};
use crate::timer::{TimerPort, SOFT_TIMER_TASK};

pub struct Kernel {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    actions: Arc<ActionRegistry>,
    bus: Arc<EventBus>,
    cyclic: Arc<Cyclic>,
    fuses: Arc<FuseRegistry>,
    graph: Arc<Graph>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Kernel on the platform clock and timers (`esp_timer` on ESP-IDF,
    /// soft timers elsewhere).
    pub fn new(config: KernelConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        #[cfg(target_os = "espidf")]
        let timers: Arc<dyn TimerPort> = Arc::new(crate::timer::EspTimers::new());
        #[cfg(not(target_os = "espidf"))]
        let timers: Arc<dyn TimerPort> = Arc::new(crate::timer::SoftTimers::new(clock.clone()));
        Self::with_parts(config, clock, timers)
    }

    /// Kernel on an explicit clock and timer port. A polled port is
    /// serviced by a `timefuse` SubTask.
    pub fn with_parts(
        config: KernelConfig,
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerPort>,
    ) -> Result<Self> {
        config.validate()?;

        let actions = Arc::new(ActionRegistry::new(clock.clone()));
        let bus = Arc::new(EventBus::new(
            clock.clone(),
            Duration::from_millis(u64::from(config.send_timeout_ms)),
        ));
        let cyclic = Arc::new(Cyclic::new(clock.clone(), config.idle_poll_ms));
        let fuses = Arc::new(FuseRegistry::new(bus.clone(), actions.clone(), timers.clone()));
        let graph = Arc::new(Graph::new(
            bus.clone(),
            actions.clone(),
            fuses.clone(),
            config.max_propagation_depth,
        ));

        if timers.is_polled() {
            let t = timers.clone();
            cyclic.add(SOFT_TIMER_TASK, move || t.service(), 0)?;
        }

        info!("kernel: initialised ({:?})", config);
        Ok(Self {
            config,
            clock,
            actions,
            bus,
            cyclic,
            fuses,
            graph,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn cyclic(&self) -> &Arc<Cyclic> {
        &self.cyclic
    }

    pub fn fuses(&self) -> &Arc<FuseRegistry> {
        &self.fuses
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    // ── Events ────────────────────────────────────────────────

    pub fn register_event(&self, category: &str, type_: Option<&str>) -> Result<EventId> {
        self.bus.register(category, type_)
    }

    /// Attach the action named in `command` to `event`. An inline
    /// argument (`"relay!set 1"`) becomes the callback's argument.
    pub fn attach_callback(&self, event: EventId, command: &str) -> Result<TriggerHandle> {
        let (name, arg) = split_name(command);
        let Some(action) = self.actions.lookup(name) else {
            error!("kernel: cannot attach unknown action {}", name);
            return Err(RegistryError::UnknownName.into());
        };
        self.bus.attach(event, action, arg)
    }

    pub fn detach_callback(&self, event: EventId, action: &str) -> Result<()> {
        let action = self.actions.lookup(action).ok_or(RegistryError::UnknownName)?;
        self.bus.detach(event, &action)
    }

    pub fn enable_callback(&self, handle: TriggerHandle, enabled: bool) -> Result<()> {
        self.bus.enable(handle, enabled)
    }

    pub fn trigger(&self, event: EventId) {
        self.bus.trigger(event);
    }

    pub fn trigger_with_arg(&self, event: EventId, arg: String) {
        self.bus.trigger_with_arg(event, arg);
    }

    pub fn isr_trigger(&self, event: EventId) {
        self.bus.isr_trigger(event);
    }

    pub fn isr_trigger_with_arg(&self, event: EventId, arg: String) {
        self.bus.isr_trigger_with_arg(event, arg);
    }

    // ── Actions ───────────────────────────────────────────────

    pub fn register_action<F>(
        &self,
        name: &str,
        body: F,
        bound_arg: Option<&str>,
        help: Option<&str>,
    ) -> Result<ActionRef>
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.actions.register(name, body, bound_arg, help)
    }

    pub fn activate_action(&self, name: &str, arg: Option<&str>) -> Result<()> {
        self.actions.activate(name, arg)
    }

    // ── Cyclic ────────────────────────────────────────────────

    pub fn add_cyclic_task<F>(&self, name: &str, body: F, initial_delay_ms: u32) -> Result<()>
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        self.cyclic.add(name, body, initial_delay_ms)
    }

    pub fn remove_cyclic_task(&self, name: &str) -> Result<()> {
        self.cyclic.remove(name)
    }

    // ── Dataflow ──────────────────────────────────────────────

    /// Create a signal of the kind of `initial`.
    pub fn create_signal(
        &self,
        name: &str,
        initial: SignalValue,
        dim: Option<&str>,
    ) -> Result<SignalId> {
        self.graph.create_signal(name, initial, dim)
    }

    pub fn set_signal(&self, id: SignalId, value: impl Into<SignalValue>) -> Result<()> {
        self.graph.set(id, value)
    }

    pub fn create_function(&self, kind: &str, name: &str, args: &[&str]) -> Result<FunctionId> {
        self.graph.create_function(kind, name, args)
    }

    pub fn bind_parameter(
        &self,
        function: FunctionId,
        index: usize,
        signal: SignalId,
    ) -> Result<()> {
        self.graph.bind_parameter(function, index, signal)
    }

    // ── Fuses ─────────────────────────────────────────────────

    pub fn create_timefuse(&self, name: &str, interval_ms: u32, repeat: bool) -> Result<FuseRef> {
        self.fuses.create(name, interval_ms, repeat)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn status(&self) -> KernelStatus {
        let mut actions = Vec::with_capacity(self.actions.len());
        self.actions.iterate(|a| {
            actions.push(ActionInfo {
                name: a.name().to_owned(),
                help: a.help().map(str::to_owned),
                stats: a.stats(),
            });
        });
        KernelStatus {
            uptime_us: self.clock.now_us(),
            counters: self.bus.counters(),
            events: self.bus.stats(),
            tasks: self.cyclic.stats(),
            actions,
            fuses: self.fuses.stats(),
            signals: self.graph.signals(),
            functions: self.graph.functions(),
        }
    }

    /// Spawn the dispatcher thread, and the cyclic thread if configured.
    pub fn start(&self) -> Result<()> {
        let mut threads = lock(&self.threads);
        if !threads.is_empty() {
            return Err(Error::Init("kernel already started"));
        }
        self.stop.store(false, Ordering::Release);

        let timing = DispatchTiming {
            idle_poll: Duration::from_millis(u64::from(self.config.idle_poll_ms)),
            report_interval: Duration::from_millis(u64::from(self.config.report_interval_ms)),
        };
        let dedicated = self.config.dedicated_cyclic_thread;

        let (bus, cyclic, stop) = (self.bus.clone(), self.cyclic.clone(), self.stop.clone());
        let events = std::thread::Builder::new()
            .name("events".into())
            .stack_size(self.config.dispatcher_stack_size)
            .spawn(move || {
                let idle = (!dedicated).then_some(&*cyclic);
                bus.run_dispatcher(idle, timing, &stop);
            })
            .map_err(|e| {
                error!("kernel: cannot spawn events thread: {}", e);
                Error::Init("cannot spawn events thread")
            })?;
        threads.push(events);

        if dedicated {
            let (cyclic, stop) = (self.cyclic.clone(), self.stop.clone());
            let spawned = std::thread::Builder::new()
                .name("cyclic".into())
                .stack_size(self.config.cyclic_stack_size)
                .spawn(move || {
                    info!("cyclic: thread started");
                    while !stop.load(Ordering::Acquire) {
                        let d = cyclic.run_once();
                        sleep_at_least(Duration::from_millis(u64::from(d)));
                    }
                });
            match spawned {
                Ok(h) => threads.push(h),
                Err(e) => {
                    error!("kernel: cannot spawn cyclic thread: {}", e);
                    drop(threads);
                    self.shutdown();
                    return Err(Error::Init("cannot spawn cyclic thread"));
                }
            }
        }
        info!("kernel: started");
        Ok(())
    }

    /// Stop and join the kernel threads. Queued events stay queued.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let handles: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for h in handles {
            if h.join().is_err() {
                error!("kernel: a kernel thread panicked");
            }
        }
        info!("kernel: stopped");
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
