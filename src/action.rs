//! Named action registry.
//!
//! An action is a named, independently invocable command. Drivers
//! register them at setup (`relay1!on`, `timer!start`, ...), the event
//! bus invokes them as callbacks and the CLI activates them by name.
//!
//! Names follow `category!verb` and may carry a trailing, space
//! separated argument when used as a command string:
//!
//! ```text
//!   "dimmer!set 40"  ──▶  action "dimmer!set", argument "40"
//! ```
//!
//! Every invocation updates the action's latency statistics. The
//! registry lock is only held while looking an action up, never while
//! its body runs, so bodies may freely register, trigger or activate.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use serde::Serialize;

use crate::error::{RegistryError, Result};
use crate::platform::{lock, Clock};

/// Executable body of an action. Receives the effective argument.
pub type ActionFn = dyn Fn(Option<&str>) + Send + Sync;

/// Shared, non-owning handle to a registered action.
pub type ActionRef = Arc<Action>;

/// Snapshot of an action's latency statistics (microseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub calls: u32,
    /// Fastest invocation; 0 until the first call.
    pub min_us: u32,
    pub max_us: u32,
    pub total_us: u64,
}

pub struct Action {
    name: String,
    help: Option<String>,
    bound_arg: Option<String>,
    body: Box<ActionFn>,
    clock: Arc<dyn Clock>,
    calls: AtomicU32,
    min_us: AtomicU32,
    max_us: AtomicU32,
    total_us: AtomicU64,
}

impl core::fmt::Debug for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("bound_arg", &self.bound_arg)
            .finish_non_exhaustive()
    }
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    /// Argument fixed at registration, if any.
    pub fn bound_arg(&self) -> Option<&str> {
        self.bound_arg.as_deref()
    }

    /// Run the body with exactly `arg` and record the elapsed time.
    ///
    /// Argument precedence is the caller's business: the registry
    /// prefers the bound argument, the dispatcher prefers the event's.
    pub fn invoke(&self, arg: Option<&str>) {
        let start = self.clock.now_us();
        (self.body)(arg);
        let dt = self.clock.now_us().saturating_sub(start);
        self.record(u32::try_from(dt).unwrap_or(u32::MAX));
    }

    fn record(&self, dt: u32) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(u64::from(dt), Ordering::Relaxed);
        self.min_us.fetch_min(dt, Ordering::Relaxed);
        self.max_us.fetch_max(dt, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ActionStats {
        let calls = self.calls.load(Ordering::Relaxed);
        ActionStats {
            calls,
            min_us: if calls == 0 {
                0
            } else {
                self.min_us.load(Ordering::Relaxed)
            },
            max_us: self.max_us.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
        }
    }
}

/// Split a command string into action name and optional argument.
///
/// The argument is everything after the first space, with leading
/// blanks removed; an empty remainder counts as no argument.
pub fn split_name(s: &str) -> (&str, Option<&str>) {
    match s.split_once(' ') {
        Some((name, rest)) => {
            let rest = rest.trim_start();
            (name, (!rest.is_empty()).then_some(rest))
        }
        None => (s, None),
    }
}

/// The action registry. Ordered by name so iteration is stable for the
/// status command regardless of registration order.
pub struct ActionRegistry {
    actions: Mutex<BTreeMap<String, ActionRef>>,
    clock: Arc<dyn Clock>,
}

impl ActionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            actions: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Register a new action. The first registration of a name wins;
    /// later ones fail with [`RegistryError::DuplicateName`].
    pub fn register<F>(
        &self,
        name: &str,
        body: F,
        bound_arg: Option<&str>,
        help: Option<&str>,
    ) -> Result<ActionRef>
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        if name.is_empty() || name.contains(' ') {
            error!("action: invalid name '{}'", name);
            return Err(RegistryError::InvalidId.into());
        }
        if !name.contains('!') {
            warn!("action: name '{}' does not match convention", name);
        }
        let mut actions = lock(&self.actions);
        if actions.contains_key(name) {
            error!("action: {} already exists", name);
            return Err(RegistryError::DuplicateName.into());
        }
        let action = Arc::new(Action {
            name: name.to_owned(),
            help: help.map(str::to_owned),
            bound_arg: bound_arg.map(str::to_owned),
            body: Box::new(body),
            clock: Arc::clone(&self.clock),
            calls: AtomicU32::new(0),
            min_us: AtomicU32::new(u32::MAX),
            max_us: AtomicU32::new(0),
            total_us: AtomicU64::new(0),
        });
        actions.insert(name.to_owned(), Arc::clone(&action));
        debug!("action: add {}", name);
        Ok(action)
    }

    /// Look an action up. A trailing argument in `name` is ignored.
    pub fn lookup(&self, name: &str) -> Option<ActionRef> {
        let (name, _) = split_name(name);
        lock(&self.actions).get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn help(&self, name: &str) -> Option<String> {
        self.lookup(name).and_then(|a| a.help.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.actions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activate an action by command string.
    ///
    /// The effective argument is the action's bound argument if it has
    /// one, otherwise `arg`, otherwise the argument embedded in `name`.
    pub fn activate(&self, name: &str, arg: Option<&str>) -> Result<()> {
        let (bare, inline) = split_name(name);
        let Some(action) = self.lookup(bare) else {
            warn!("action: unable to execute unknown action '{}'", bare);
            return Err(RegistryError::UnknownName.into());
        };
        debug!("action: activate {}", bare);
        let supplied = arg.or(inline);
        action.invoke(action.bound_arg().or(supplied));
        Ok(())
    }

    /// Visit every action in name order.
    pub fn iterate(&self, mut visitor: impl FnMut(&Action)) {
        let snapshot: Vec<ActionRef> = lock(&self.actions).values().cloned().collect();
        for action in &snapshot {
            visitor(action);
        }
    }
}
