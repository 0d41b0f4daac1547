//! Named event bus.
//!
//! Events are produced by:
//! - Drivers (sensor readings, button presses, state changes)
//! - ISRs (GPIO edges, via the non-blocking `isr_trigger*` variants)
//! - Timer fuses (start/stop/timeout)
//! - Dataflow functions (hysteresis edges)
//!
//! Events are consumed by a single dispatcher, which runs the attached
//! callbacks one event at a time in send order.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Drivers     │────▶│              │     │              │
//! │ ISRs        │────▶│   Mailbox    │────▶│  Dispatcher  │──▶ Actions
//! │ Timer fuses │────▶│  (bounded)   │     │  (consumer)  │
//! │ Functions   │────▶│              │     │              │
//! └─────────────┘     └──────────────┘     └──────┬───────┘
//!                                                 │ idle
//!                                                 ▼
//!                                          Cyclic::run_once()
//! ```
//!
//! Every trigger ends in exactly one of four counters: processed,
//! discarded (no callbacks), lost (mailbox full) or invalid
//! (unregistered id). Failures are never returned to the producer.
//!
//! Task-context triggers check for callbacks under the handler lock and
//! never queue an event nobody listens to. ISR triggers touch only
//! atomics and the mailbox; an ISR event without callbacks is queued
//! and counted as discarded by the dispatcher.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::action::{split_name, ActionRef, ActionRegistry};
use crate::config::MAILBOX_DEPTH;
use crate::cyclic::Cyclic;
use crate::error::{DeliveryError, RegistryError, Result};
use crate::platform::{lock, sleep_at_least, Clock, TICK};

/// Separator between category and type in event names.
pub const EVENT_SEPARATOR: char = '`';

/// Dense event identifier. `0` is reserved and never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventId(u16);

impl EventId {
    pub const INVALID: EventId = EventId(0);

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Addresses one callback of one event: event id in bits 31..16,
/// callback position in bits 15..0. Stays valid as the callback list
/// grows and after the callback is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TriggerHandle(u32);

impl TriggerHandle {
    pub const fn new(event: EventId, index: u16) -> Self {
        Self(((event.0 as u32) << 16) | index as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn event(self) -> EventId {
        EventId((self.0 >> 16) as u16)
    }

    pub const fn index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

/// Global delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusCounters {
    pub processed: u32,
    pub discarded: u32,
    pub lost: u32,
    pub invalid: u32,
    /// Trigger attempts from ISR context (also counted in one of the above).
    pub isr: u32,
}

/// Per-event status row.
#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub id: EventId,
    pub name: String,
    pub occurrences: u32,
    pub time_us: u64,
    pub callbacks: Vec<CallbackInfo>,
}

/// One attached callback as seen by the status command.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackInfo {
    pub action: String,
    pub arg: Option<String>,
    pub enabled: bool,
}

/// Queued event. Owns its argument until the dispatcher has run every
/// callback, then drops it.
struct Message {
    event: EventId,
    arg: Option<String>,
}

struct Callback {
    action: ActionRef,
    arg: Option<Arc<str>>,
    enabled: bool,
}

struct EventHandler {
    name: String,
    /// Detached callbacks leave `None` so handles keep their position.
    callbacks: Vec<Option<Callback>>,
    occurrences: u32,
    time_us: u64,
}

impl EventHandler {
    fn new(name: String) -> Self {
        Self {
            name,
            callbacks: Vec::new(),
            occurrences: 0,
            time_us: 0,
        }
    }

    fn has_callbacks(&self) -> bool {
        self.callbacks.iter().any(Option::is_some)
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU32,
    discarded: AtomicU32,
    lost: AtomicU32,
    invalid: AtomicU32,
    isr: AtomicU32,
}

impl Counters {
    fn count(&self, outcome: Posted) {
        let c = match outcome {
            Ok(()) => &self.processed,
            Err(DeliveryError::Discarded) => &self.discarded,
            Err(DeliveryError::Lost) => &self.lost,
            Err(DeliveryError::InvalidId) => &self.invalid,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    /// Count trigger outcomes that are final at trigger time. Queued
    /// messages are counted when the dispatcher delivers them.
    fn count_early(&self, r: Posted) {
        if r.is_err() {
            self.count(r);
        }
    }

    fn snapshot(&self) -> BusCounters {
        BusCounters {
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            isr: self.isr.load(Ordering::Relaxed),
        }
    }
}

enum SendMode {
    /// Block up to the bus send timeout for mailbox space.
    Wait,
    /// Give up at once if the mailbox is full.
    NoWait,
}

/// Outcome of a trigger that is known before dispatch. Queued messages
/// are counted by the dispatcher.
type Posted = core::result::Result<(), DeliveryError>;

/// Timing knobs for [`EventBus::run_dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchTiming {
    pub idle_poll: Duration,
    pub report_interval: Duration,
}

/// The event bus: handler table, mailbox and dispatcher.
pub struct EventBus {
    handlers: Mutex<Vec<EventHandler>>,
    /// Highest registered id, readable without the handler lock.
    registered: AtomicU16,
    mailbox: Channel<CriticalSectionRawMutex, Message, MAILBOX_DEPTH>,
    counters: Counters,
    reported: Mutex<BusCounters>,
    send_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>, send_timeout: Duration) -> Self {
        Self {
            // Slot 0 is the reserved invalid event.
            handlers: Mutex::new(vec![EventHandler::new(String::new())]),
            registered: AtomicU16::new(0),
            mailbox: Channel::new(),
            counters: Counters::default(),
            reported: Mutex::new(BusCounters::default()),
            send_timeout,
            clock,
        }
    }

    // ── Registration ──────────────────────────────────────────

    /// Register `category` + `type_` as an event. Registering a name a
    /// second time returns the existing id.
    pub fn register(&self, category: &str, type_: Option<&str>) -> Result<EventId> {
        let name = match type_ {
            Some(t) => format!("{category}{t}"),
            None => category.to_owned(),
        };
        if name.is_empty() {
            return Err(RegistryError::InvalidId.into());
        }
        if !name.contains(EVENT_SEPARATOR) {
            warn!("event: name '{}' does not match convention", name);
        }
        let mut handlers = lock(&self.handlers);
        if let Some(i) = handlers.iter().skip(1).position(|h| h.name == name) {
            debug!("event: {} is already registered", name);
            return Ok(EventId((i + 1) as u16));
        }
        let Ok(id) = u16::try_from(handlers.len()) else {
            error!("event: cannot register {}: id space exhausted", name);
            return Err(RegistryError::Exhausted.into());
        };
        debug!("event: register {} as {}", name, id);
        handlers.push(EventHandler::new(name));
        self.registered.store(id, Ordering::Release);
        Ok(EventId(id))
    }

    /// Look an event up by its full name.
    pub fn event_id(&self, name: &str) -> Option<EventId> {
        lock(&self.handlers)
            .iter()
            .skip(1)
            .position(|h| h.name == name)
            .map(|i| EventId((i + 1) as u16))
    }

    pub fn event_name(&self, id: EventId) -> Option<String> {
        if !id.is_valid() {
            return None;
        }
        lock(&self.handlers).get(id.index()).map(|h| h.name.clone())
    }

    /// Number of registered events (excluding the reserved id 0).
    pub fn event_count(&self) -> usize {
        lock(&self.handlers).len() - 1
    }

    // ── Callbacks ─────────────────────────────────────────────

    /// Append a callback running `action` with optional bound `arg`.
    pub fn attach(
        &self,
        event: EventId,
        action: ActionRef,
        arg: Option<&str>,
    ) -> Result<TriggerHandle> {
        let mut handlers = lock(&self.handlers);
        let Some(h) = handlers.get_mut(event.index()).filter(|_| event.is_valid()) else {
            error!("event: cannot attach {} to event {}: out of range", action.name(), event.0);
            return Err(RegistryError::InvalidId.into());
        };
        let Ok(index) = u16::try_from(h.callbacks.len()) else {
            return Err(RegistryError::Exhausted.into());
        };
        debug!("event: {} -> action {}", h.name, action.name());
        h.callbacks.push(Some(Callback {
            action,
            arg: arg.map(Arc::from),
            enabled: true,
        }));
        Ok(TriggerHandle::new(event, index))
    }

    /// Attach by names. `command` may carry an inline argument
    /// (`"relay!set 1"`), which becomes the callback's bound argument.
    pub fn attach_by_name(
        &self,
        actions: &ActionRegistry,
        event: &str,
        command: &str,
    ) -> Result<TriggerHandle> {
        let Some(id) = self.event_id(event) else {
            warn!("event: attach('{}','{}'): unknown event", event, command);
            return Err(RegistryError::UnknownName.into());
        };
        let (name, arg) = split_name(command);
        let Some(action) = actions.lookup(name) else {
            warn!("event: attach('{}','{}'): unknown action", event, command);
            return Err(RegistryError::UnknownName.into());
        };
        self.attach(id, action, arg)
    }

    /// Detach the first callback of `event` that runs `action`.
    pub fn detach(&self, event: EventId, action: &ActionRef) -> Result<()> {
        let mut handlers = lock(&self.handlers);
        let Some(h) = handlers.get_mut(event.index()).filter(|_| event.is_valid()) else {
            error!("event: cannot detach from event {}: invalid event", event.0);
            return Err(RegistryError::InvalidId.into());
        };
        let slot = h
            .callbacks
            .iter_mut()
            .find(|c| c.as_ref().is_some_and(|c| Arc::ptr_eq(&c.action, action)));
        match slot {
            Some(slot) => {
                *slot = None;
                debug!("event: detached {} from {}", action.name(), h.name);
                Ok(())
            }
            None => {
                error!("event: cannot detach from {}: action {} not found", h.name, action.name());
                Err(RegistryError::UnknownName.into())
            }
        }
    }

    /// Enable or disable a callback without removing it. Takes effect
    /// from the next delivery whose snapshot has not been taken yet.
    pub fn enable(&self, handle: TriggerHandle, enabled: bool) -> Result<()> {
        let mut handlers = lock(&self.handlers);
        let cb = handlers
            .get_mut(handle.event().index())
            .filter(|_| handle.event().is_valid())
            .and_then(|h| h.callbacks.get_mut(usize::from(handle.index())))
            .and_then(Option::as_mut);
        match cb {
            Some(cb) => {
                cb.enabled = enabled;
                Ok(())
            }
            None => Err(RegistryError::InvalidId.into()),
        }
    }

    /// Callbacks currently attached to `event`, in registration order.
    pub fn callbacks(&self, event: EventId) -> Vec<CallbackInfo> {
        if !event.is_valid() {
            return Vec::new();
        }
        lock(&self.handlers)
            .get(event.index())
            .map(|h| h.callbacks.iter().flatten().map(callback_info).collect())
            .unwrap_or_default()
    }

    // ── Triggering ────────────────────────────────────────────

    /// Raise `event`. May block up to the send timeout if the mailbox is
    /// full; the event is then counted as lost.
    pub fn trigger(&self, event: EventId) {
        let r = self.post(event, None, SendMode::Wait);
        self.counters.count_early(r);
    }

    /// Raise `event` with an argument. Ownership of `arg` passes to the
    /// kernel; it is dropped after the last callback of this delivery,
    /// or immediately if the event is not queued.
    pub fn trigger_with_arg(&self, event: EventId, arg: String) {
        let r = self.post(event, Some(arg), SendMode::Wait);
        self.counters.count_early(r);
    }

    /// Non-blocking trigger for task contexts that must not wait on the
    /// mailbox (timer callbacks, possibly running on the dispatcher).
    pub fn trigger_nowait(&self, event: EventId) {
        let r = self.post(event, None, SendMode::NoWait);
        self.counters.count_early(r);
    }

    /// ISR-safe trigger: never blocks, never logs, takes no lock.
    pub fn isr_trigger(&self, event: EventId) {
        self.counters.isr.fetch_add(1, Ordering::Relaxed);
        let r = self.isr_post(event, None);
        self.counters.count_early(r);
    }

    /// ISR-safe trigger with argument: never blocks, never logs.
    pub fn isr_trigger_with_arg(&self, event: EventId, arg: String) {
        self.counters.isr.fetch_add(1, Ordering::Relaxed);
        let r = self.isr_post(event, Some(arg));
        self.counters.count_early(r);
    }

    fn post(&self, event: EventId, arg: Option<String>, send: SendMode) -> Posted {
        {
            let handlers = lock(&self.handlers);
            let Some(h) = handlers.get(event.index()).filter(|_| event.is_valid()) else {
                warn!("event: trigger of invalid event {}", event.0);
                return Err(DeliveryError::InvalidId);
            };
            if !h.has_callbacks() {
                // Fast path: `arg` is dropped here, nothing is queued.
                return Err(DeliveryError::Discarded);
            }
            debug!("event: trigger {}", h.name);
        }
        let msg = Message { event, arg };
        let sent = match send {
            SendMode::NoWait => self.mailbox.try_send(msg).map_err(|_| ()),
            SendMode::Wait => self.send_blocking(msg),
        };
        sent.map_err(|()| {
            warn!("event: mailbox full, event {} lost", event.0);
            DeliveryError::Lost
        })
    }

    fn isr_post(&self, event: EventId, arg: Option<String>) -> Posted {
        if !event.is_valid() || event.0 > self.registered.load(Ordering::Acquire) {
            return Err(DeliveryError::InvalidId);
        }
        self.mailbox
            .try_send(Message { event, arg })
            .map_err(|_| DeliveryError::Lost)
    }

    fn send_blocking(&self, mut msg: Message) -> core::result::Result<(), ()> {
        let deadline = Instant::now() + self.send_timeout;
        loop {
            match self.mailbox.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(());
                    }
                    msg = back;
                    sleep_at_least(TICK);
                }
            }
        }
    }

    // ── Dispatching ───────────────────────────────────────────

    /// Messages waiting in the mailbox.
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }

    /// Wait up to `wait` for one message and deliver it. Returns whether
    /// a message was delivered. Waits are whole [`TICK`]s, so a nonzero
    /// `wait` may run up to one tick long.
    pub fn dispatch_once(&self, wait: Duration) -> bool {
        match self.receive(wait) {
            Some(msg) => {
                self.deliver(msg);
                true
            }
            None => false,
        }
    }

    /// Deliver everything currently queued without waiting.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.mailbox.try_receive() {
            self.deliver(msg);
            n += 1;
        }
        n
    }

    fn receive(&self, wait: Duration) -> Option<Message> {
        let deadline = Instant::now() + wait;
        loop {
            if let Ok(msg) = self.mailbox.try_receive() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep_at_least(TICK);
        }
    }

    fn deliver(&self, msg: Message) {
        let Message { event, arg } = msg;

        // Snapshot the enabled callbacks before running any of them: a
        // body that toggles a later callback affects the next delivery.
        let snapshot: Vec<(ActionRef, Option<Arc<str>>)> = {
            let mut handlers = lock(&self.handlers);
            let Some(h) = handlers.get_mut(event.index()).filter(|_| event.is_valid()) else {
                error!("event: invalid/unknown event {}", event.0);
                self.counters.count(Err(DeliveryError::InvalidId));
                return;
            };
            if !h.has_callbacks() {
                self.counters.count(Err(DeliveryError::Discarded));
                return;
            }
            h.occurrences = h.occurrences.wrapping_add(1);
            debug!("event: execute callbacks of {}", h.name);
            h.callbacks
                .iter()
                .flatten()
                .filter(|c| c.enabled)
                .map(|c| (Arc::clone(&c.action), c.arg.clone()))
                .collect()
        };

        let start = self.clock.now_us();
        for (action, cb_arg) in &snapshot {
            let effective = arg
                .as_deref()
                .or(cb_arg.as_deref())
                .or(action.bound_arg());
            debug!("event: \taction {}", action.name());
            action.invoke(effective);
        }
        let dt = self.clock.now_us().saturating_sub(start);

        if let Some(h) = lock(&self.handlers).get_mut(event.index()) {
            h.time_us += dt;
        }
        self.counters.count(Ok(()));
        // `arg` is released here, after every callback has run.
    }

    /// Dispatcher main loop. Runs until `stop` is set.
    ///
    /// The cyclic scheduler, if given, runs whenever the mailbox stays
    /// empty until its requested poll time, and also whenever that poll
    /// time has passed while events were being processed.
    pub fn run_dispatcher(
        &self,
        cyclic: Option<&Cyclic>,
        timing: DispatchTiming,
        stop: &AtomicBool,
    ) {
        info!("event: dispatcher started");
        let mut next_cyclic = Instant::now();
        let mut next_report = Instant::now() + timing.report_interval;
        while !stop.load(Ordering::Acquire) {
            let wait = if cyclic.is_some() {
                next_cyclic.saturating_duration_since(Instant::now())
            } else {
                timing.idle_poll
            };
            self.dispatch_once(wait.min(timing.idle_poll));

            let now = Instant::now();
            if let Some(c) = cyclic {
                if now >= next_cyclic {
                    let d = c.run_once().max(1);
                    next_cyclic = Instant::now() + Duration::from_millis(u64::from(d));
                }
            }
            if now >= next_report {
                self.report();
                next_report = now + timing.report_interval;
            }
        }
        info!("event: dispatcher stopped");
    }

    // ── Diagnostics ───────────────────────────────────────────

    pub fn counters(&self) -> BusCounters {
        self.counters.snapshot()
    }

    pub fn occurrences(&self, event: EventId) -> u32 {
        if !event.is_valid() {
            return 0;
        }
        lock(&self.handlers).get(event.index()).map_or(0, |h| h.occurrences)
    }

    /// Cumulative callback processing time of `event` (microseconds).
    pub fn processing_time_us(&self, event: EventId) -> u64 {
        if !event.is_valid() {
            return 0;
        }
        lock(&self.handlers).get(event.index()).map_or(0, |h| h.time_us)
    }

    pub fn stats(&self) -> Vec<EventStats> {
        lock(&self.handlers)
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, h)| EventStats {
                id: EventId(i as u16),
                name: h.name.clone(),
                occurrences: h.occurrences,
                time_us: h.time_us,
                callbacks: h.callbacks.iter().flatten().map(callback_info).collect(),
            })
            .collect()
    }

    /// Log lost/invalid/discarded counts accumulated since the last
    /// report. Returns the deltas.
    pub fn report(&self) -> BusCounters {
        let now = self.counters.snapshot();
        let mut last = lock(&self.reported);
        let delta = BusCounters {
            processed: now.processed.wrapping_sub(last.processed),
            discarded: now.discarded.wrapping_sub(last.discarded),
            lost: now.lost.wrapping_sub(last.lost),
            invalid: now.invalid.wrapping_sub(last.invalid),
            isr: now.isr.wrapping_sub(last.isr),
        };
        if delta.lost > 0 {
            warn!("event: {} events lost", delta.lost);
        }
        if delta.invalid > 0 {
            warn!("event: {} invalid events", delta.invalid);
        }
        if delta.discarded > 0 {
            debug!("event: {} events discarded", delta.discarded);
        }
        *last = now;
        delta
    }
}

fn callback_info(c: &Callback) -> CallbackInfo {
    CallbackInfo {
        action: c.action.name().to_owned(),
        arg: c.arg.as_deref().map(str::to_owned),
        enabled: c.enabled,
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualClock;

    type Log = Arc<Mutex<Vec<String>>>;

    fn setup() -> (ActionRegistry, EventBus) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        (
            ActionRegistry::new(clock.clone()),
            EventBus::new(clock, Duration::from_millis(1)),
        )
    }

    fn logging_action(reg: &ActionRegistry, name: &str, bound: Option<&str>) -> (ActionRef, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let tag = name.to_owned();
        let a = reg
            .register(
                name,
                move |arg| sink.lock().unwrap().push(format!("{tag}:{}", arg.unwrap_or("-"))),
                bound,
                None,
            )
            .unwrap();
        (a, log)
    }

    #[test]
    fn register_is_idempotent() {
        let (reg, bus) = setup();
        let a = bus.register("wifi", Some("`station_up")).unwrap();
        let b = bus.register("wifi`station_up", None).unwrap();
        assert!(a.is_valid());
        assert_eq!(a, b);
        let (act, _) = logging_action(&reg, "x!y", None);
        bus.attach(a, act, None).unwrap();
        assert_eq!(bus.register("wifi", Some("`station_up")).unwrap(), a);
        assert_eq!(bus.event_count(), 1);
    }

    #[test]
    fn ids_are_dense_from_one() {
        let (_reg, bus) = setup();
        let a = bus.register("a`x", None).unwrap();
        let b = bus.register("b`x", None).unwrap();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_eq!(bus.event_id("b`x"), Some(b));
        assert_eq!(bus.event_id("nope`x"), None);
        assert_eq!(bus.event_name(a).as_deref(), Some("a`x"));
        assert_eq!(bus.event_name(EventId::INVALID), None);
    }

    #[test]
    fn name_without_separator_still_registers() {
        let (_reg, bus) = setup();
        assert!(bus.register("oddname", None).unwrap().is_valid());
    }

    #[test]
    fn handle_packs_event_and_index() {
        let h = TriggerHandle::new(EventId::from_raw(0x1234), 0x0056);
        assert_eq!(h.raw(), 0x1234_0056);
        assert_eq!(h.event().get(), 0x1234);
        assert_eq!(h.index(), 0x56);
    }

    #[test]
    fn trigger_without_callbacks_is_discarded() {
        let (_reg, bus) = setup();
        let e = bus.register("idle`tick", None).unwrap();
        bus.trigger(e);
        bus.trigger_with_arg(e, "payload".into());
        assert_eq!(bus.pending(), 0);
        let c = bus.counters();
        assert_eq!(c.discarded, 2);
        assert_eq!((c.processed, c.lost, c.invalid), (0, 0, 0));
    }

    #[test]
    fn invalid_ids_are_counted() {
        let (_reg, bus) = setup();
        bus.trigger(EventId::INVALID);
        bus.trigger(EventId::from_raw(99));
        assert_eq!(bus.counters().invalid, 2);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn overflow_counts_lost_exactly() {
        let (reg, bus) = setup();
        let e = bus.register("burst`x", None).unwrap();
        let (a, log) = logging_action(&reg, "burst!x", None);
        bus.attach(e, a, None).unwrap();
        for _ in 0..MAILBOX_DEPTH + 5 {
            bus.trigger(e);
        }
        assert_eq!(bus.counters().lost, 5);
        assert_eq!(bus.pending(), MAILBOX_DEPTH);

        assert_eq!(bus.drain(), MAILBOX_DEPTH);
        bus.trigger(e);
        assert!(bus.dispatch_once(Duration::from_millis(10)));
        assert_eq!(log.lock().unwrap().len(), MAILBOX_DEPTH + 1);
        assert_eq!(bus.counters().processed, MAILBOX_DEPTH as u32 + 1);
    }

    #[test]
    fn isr_trigger_never_blocks() {
        let (reg, bus) = setup();
        let e = bus.register("gpio`edge", None).unwrap();
        let (a, _) = logging_action(&reg, "gpio!edge", None);
        bus.attach(e, a, None).unwrap();
        for _ in 0..MAILBOX_DEPTH + 3 {
            bus.isr_trigger(e);
        }
        let c = bus.counters();
        assert_eq!(c.lost, 3);
        assert_eq!(c.isr, MAILBOX_DEPTH as u32 + 3);
    }

    #[test]
    fn isr_trigger_checks_only_registration() {
        let (_reg, bus) = setup();
        let e = bus.register("gpio`idle", None).unwrap();
        bus.isr_trigger(EventId::from_raw(e.get() + 1));
        bus.isr_trigger_with_arg(e, "level".into());
        assert_eq!(bus.counters().invalid, 1);
        assert_eq!(bus.pending(), 1);
        bus.drain();
        let c = bus.counters();
        assert_eq!((c.discarded, c.processed, c.isr), (1, 0, 2));
        assert_eq!(bus.occurrences(e), 0);
    }

    #[test]
    fn argument_precedence_event_then_callback_then_action() {
        let (reg, bus) = setup();
        let e = bus.register("btn`press", None).unwrap();
        let (a, log) = logging_action(&reg, "led!set", Some("action"));
        bus.attach(e, a.clone(), Some("callback")).unwrap();
        bus.attach(e, a, None).unwrap();

        bus.trigger_with_arg(e, "event".into());
        bus.trigger(e);
        bus.drain();

        let log = log.lock().unwrap();
        assert_eq!(*log, ["led!set:event", "led!set:event", "led!set:callback", "led!set:action"]);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let (reg, bus) = setup();
        let e = bus.register("seq`go", None).unwrap();
        let order: Log = Arc::new(Mutex::new(Vec::new()));
        for n in ["c!1", "a!2", "b!3"] {
            let o = Arc::clone(&order);
            let tag = n.to_owned();
            let act = reg
                .register(n, move |_| o.lock().unwrap().push(tag.clone()), None, None)
                .unwrap();
            bus.attach(e, act, None).unwrap();
        }
        bus.trigger(e);
        bus.drain();
        assert_eq!(*order.lock().unwrap(), ["c!1", "a!2", "b!3"]);
    }

    #[test]
    fn disable_mid_dispatch_affects_next_delivery_only() {
        let (reg, bus) = setup();
        let bus = Arc::new(bus);
        let e = bus.register("mid`x", None).unwrap();
        let (victim, log) = logging_action(&reg, "victim!run", None);

        let handle_slot: Arc<Mutex<Option<TriggerHandle>>> = Arc::new(Mutex::new(None));
        let (b, slot) = (Arc::clone(&bus), Arc::clone(&handle_slot));
        let killer = reg
            .register(
                "killer!run",
                move |_| {
                    if let Some(h) = *slot.lock().unwrap() {
                        b.enable(h, false).unwrap();
                    }
                },
                None,
                None,
            )
            .unwrap();
        bus.attach(e, killer, None).unwrap();
        let h = bus.attach(e, victim, None).unwrap();
        *handle_slot.lock().unwrap() = Some(h);

        bus.trigger(e);
        bus.drain();
        assert_eq!(log.lock().unwrap().len(), 1, "snapshotted callback still fires");

        bus.trigger(e);
        bus.drain();
        assert_eq!(log.lock().unwrap().len(), 1, "disabled callback skipped next time");
        assert!(!bus.callbacks(e)[1].enabled);
    }

    #[test]
    fn detach_keeps_later_handles_valid() {
        let (reg, bus) = setup();
        let e = bus.register("det`x", None).unwrap();
        let (a, log_a) = logging_action(&reg, "a!x", None);
        let (b, log_b) = logging_action(&reg, "b!x", None);
        bus.attach(e, a.clone(), None).unwrap();
        let hb = bus.attach(e, b, None).unwrap();

        bus.detach(e, &a).unwrap();
        assert_eq!(bus.detach(e, &a), Err(RegistryError::UnknownName.into()));
        bus.enable(hb, false).unwrap();
        bus.enable(hb, true).unwrap();
        assert_eq!(
            bus.enable(TriggerHandle::new(e, 0), false),
            Err(RegistryError::InvalidId.into())
        );

        bus.trigger(e);
        bus.drain();
        assert!(log_a.lock().unwrap().is_empty());
        assert_eq!(log_b.lock().unwrap().len(), 1);
    }

    #[test]
    fn detaching_last_callback_makes_event_discard() {
        let (reg, bus) = setup();
        let e = bus.register("solo`x", None).unwrap();
        let (a, _) = logging_action(&reg, "solo!x", None);
        bus.attach(e, a.clone(), None).unwrap();
        bus.detach(e, &a).unwrap();
        bus.trigger(e);
        assert_eq!(bus.counters().discarded, 1);
    }

    #[test]
    fn attach_by_name_resolves_inline_argument() {
        let (reg, bus) = setup();
        bus.register("sw`on", None).unwrap();
        let (_a, log) = logging_action(&reg, "relay!set", None);
        bus.attach_by_name(&reg, "sw`on", "relay!set 1").unwrap();
        assert_eq!(
            bus.attach_by_name(&reg, "sw`off", "relay!set").unwrap_err(),
            RegistryError::UnknownName.into()
        );
        assert_eq!(
            bus.attach_by_name(&reg, "sw`on", "relay!nope").unwrap_err(),
            RegistryError::UnknownName.into()
        );
        bus.trigger(bus.event_id("sw`on").unwrap());
        bus.drain();
        assert_eq!(*log.lock().unwrap(), ["relay!set:1"]);
    }

    #[test]
    fn occurrences_and_time_accumulate() {
        let clock = Arc::new(ManualClock::new(0));
        let reg = ActionRegistry::new(clock.clone());
        let bus = EventBus::new(clock.clone(), Duration::from_millis(1));
        let e = bus.register("t`x", None).unwrap();
        let c = clock.clone();
        let a = reg.register("t!x", move |_| c.advance_ms(2), None, None).unwrap();
        bus.attach(e, a, None).unwrap();
        bus.trigger(e);
        bus.trigger(e);
        bus.drain();
        assert_eq!(bus.occurrences(e), 2);
        assert_eq!(bus.processing_time_us(e), 4_000);
    }

    #[test]
    fn nested_trigger_from_callback_does_not_deadlock() {
        let (reg, bus) = setup();
        let bus = Arc::new(bus);
        let first = bus.register("chain`first", None).unwrap();
        let second = bus.register("chain`second", None).unwrap();
        let b = Arc::clone(&bus);
        let fwd = reg.register("chain!fwd", move |_| b.trigger(second), None, None).unwrap();
        let (sink, log) = logging_action(&reg, "chain!sink", None);
        bus.attach(first, fwd, None).unwrap();
        bus.attach(second, sink, None).unwrap();
        bus.trigger(first);
        assert_eq!(bus.drain(), 2);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn report_returns_deltas_once() {
        let (_reg, bus) = setup();
        bus.trigger(EventId::INVALID);
        assert_eq!(bus.report().invalid, 1);
        assert_eq!(bus.report().invalid, 0);
    }

    #[test]
    fn sub_tick_wait_sleeps_a_whole_tick() {
        let (_reg, bus) = setup();
        let start = Instant::now();
        assert!(!bus.dispatch_once(Duration::from_micros(200)));
        assert!(start.elapsed() >= TICK);
    }

    #[test]
    fn full_mailbox_send_waits_in_whole_ticks() {
        let (reg, bus) = setup();
        let ev = bus.register("flood", Some("`item")).unwrap();
        let (act, _) = logging_action(&reg, "sink!put", None);
        bus.attach(ev, act, None).unwrap();
        for _ in 0..MAILBOX_DEPTH {
            bus.trigger(ev);
        }
        let start = Instant::now();
        bus.trigger(ev);
        assert!(start.elapsed() >= TICK);
        assert_eq!(bus.counters().lost, 1);
    }

    #[test]
    fn dispatcher_thread_runs_cyclic_when_idle() {
        let clock: Arc<dyn Clock> = Arc::new(crate::platform::MonotonicClock);
        let bus = Arc::new(EventBus::new(clock.clone(), Duration::from_millis(10)));
        let cyclic = Arc::new(Cyclic::new(clock, 5));
        let ticks = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&ticks);
        cyclic
            .add(
                "tick",
                move || {
                    t.fetch_add(1, Ordering::SeqCst);
                    1
                },
                0,
            )
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let (b, c, s) = (Arc::clone(&bus), Arc::clone(&cyclic), Arc::clone(&stop));
        let th = std::thread::spawn(move || {
            b.run_dispatcher(
                Some(&c),
                DispatchTiming {
                    idle_poll: Duration::from_millis(5),
                    report_interval: Duration::from_millis(50),
                },
                &s,
            );
        });
        std::thread::sleep(Duration::from_millis(60));
        stop.store(true, Ordering::Release);
        th.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }
}
