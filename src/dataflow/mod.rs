//! Synchronous dataflow graph.
//!
//! ```text
//!   Signal a ──┐                         ┌──▶ Function g ──▶ g.result
//!              ├──▶ Function f ──▶ f.result
//!   Signal b ──┘                         └──▶ ...
//! ```
//!
//! `set` stores a signal value and evaluates every Function bound to the
//! signal, in edge order, on the calling thread. A Function reads the
//! current value of all its parameters and sets its result signal, which
//! propagates further. Nothing is queued. Propagation depth is bounded
//! per thread by `max_propagation_depth`.
//!
//! Signals, Functions and the edge table each sit behind their own lock.
//! No lock is held while an operator runs or while a result propagates.

pub mod factory;
pub mod func;
pub mod signal;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::action::ActionRegistry;
use crate::error::{GraphError, RegistryError, Result};
use crate::event::EventBus;
use crate::platform::lock;
use crate::timefuse::FuseRegistry;

pub use factory::{FactoryContext, OperatorFactory};
pub use func::{BinaryOp, EvalContext, Operator, Trigger};
pub use signal::{SignalId, SignalInfo, SignalKind, SignalValue};

/// Suffix of a Function's result signal name.
pub const RESULT_SUFFIX: &str = ".result";

/// Dense function identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionId(u32);

thread_local! {
    static DEPTH: Cell<u8> = const { Cell::new(0) };
}

/// Decrements the propagation depth when a level unwinds.
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: u8) -> Option<Self> {
        DEPTH.with(|d| {
            let depth = d.get();
            (depth < limit).then(|| {
                d.set(depth + 1);
                DepthGuard
            })
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

struct Signal {
    name: String,
    dim: Option<String>,
    value: SignalValue,
}

struct FunctionNode {
    name: String,
    kind: String,
    params: Mutex<Vec<Option<SignalId>>>,
    required: usize,
    op: Mutex<Box<dyn Operator>>,
    result: Option<SignalId>,
}

/// One row of the function listing.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub kind: String,
    pub params: Vec<Option<String>>,
    pub result: Option<String>,
}

/// The dataflow graph.
pub struct Graph {
    signals: Mutex<Vec<Signal>>,
    functions: Mutex<Vec<Arc<FunctionNode>>>,
    /// (producer, dependent) pairs in bind order; each pair at most once.
    edges: Mutex<Vec<(SignalId, FunctionId)>>,
    factories: Mutex<BTreeMap<String, Arc<dyn OperatorFactory>>>,
    bus: Arc<EventBus>,
    actions: Arc<ActionRegistry>,
    fuses: Arc<FuseRegistry>,
    max_depth: u8,
}

impl Graph {
    /// Empty graph with the built-in operator kinds registered.
    pub fn new(
        bus: Arc<EventBus>,
        actions: Arc<ActionRegistry>,
        fuses: Arc<FuseRegistry>,
        max_depth: u8,
    ) -> Self {
        let factories = factory::builtin()
            .into_iter()
            .map(|f| (f.kind().to_owned(), f))
            .collect();
        Self {
            signals: Mutex::new(Vec::new()),
            functions: Mutex::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
            factories: Mutex::new(factories),
            bus,
            actions,
            fuses,
            max_depth,
        }
    }

    // ── Signals ───────────────────────────────────────────────

    pub fn create_int_signal(
        &self,
        name: &str,
        initial: i64,
        dim: Option<&str>,
    ) -> Result<SignalId> {
        self.create_signal(name, SignalValue::Int(initial), dim)
    }

    pub fn create_float_signal(
        &self,
        name: &str,
        initial: f64,
        dim: Option<&str>,
    ) -> Result<SignalId> {
        self.create_signal(name, SignalValue::Float(initial), dim)
    }

    /// Create a signal whose kind is that of `initial`.
    pub fn create_signal(
        &self,
        name: &str,
        initial: SignalValue,
        dim: Option<&str>,
    ) -> Result<SignalId> {
        let mut signals = lock(&self.signals);
        if signals.iter().any(|s| s.name == name) {
            warn!("signal: duplicate signal name {}", name);
            return Err(RegistryError::DuplicateName.into());
        }
        let id = u32::try_from(signals.len()).map_err(|_| RegistryError::Exhausted)?;
        signals.push(Signal {
            name: name.to_owned(),
            dim: dim.map(str::to_owned),
            value: initial,
        });
        debug!("signal: {} ({}) = {}", name, initial.kind(), initial);
        Ok(SignalId(id))
    }

    pub fn signal_by_name(&self, name: &str) -> Option<SignalId> {
        lock(&self.signals)
            .iter()
            .position(|s| s.name == name)
            .map(|i| SignalId(i as u32))
    }

    pub fn value(&self, id: SignalId) -> Option<SignalValue> {
        lock(&self.signals).get(id.index()).map(|s| s.value)
    }

    pub fn signal(&self, id: SignalId) -> Option<SignalInfo> {
        lock(&self.signals).get(id.index()).map(|s| info(id, s))
    }

    /// All signals in creation order.
    pub fn signals(&self) -> Vec<SignalInfo> {
        lock(&self.signals)
            .iter()
            .enumerate()
            .map(|(i, s)| info(SignalId(i as u32), s))
            .collect()
    }

    /// Store a value (coerced into the signal's kind) and evaluate every
    /// dependent Function. The value is stored even if propagation hits
    /// the depth limit.
    pub fn set(&self, id: SignalId, value: impl Into<SignalValue>) -> Result<()> {
        let value = value.into();
        {
            let mut signals = lock(&self.signals);
            let Some(s) = signals.get_mut(id.index()) else {
                return Err(RegistryError::InvalidId.into());
            };
            s.value = value.coerce(s.value.kind());
            debug!("signal: {}={}", s.name, s.value);
        }
        self.process(id)
    }

    /// Parse `text` in the signal's kind and [`set`](Self::set) it.
    pub fn set_from_str(&self, id: SignalId, text: &str) -> Result<()> {
        let kind = self.value(id).ok_or(RegistryError::InvalidId)?.kind();
        let v = SignalValue::parse(kind, text).ok_or(GraphError::BadArgument("not a number"))?;
        self.set(id, v)
    }

    fn process(&self, id: SignalId) -> Result<()> {
        let Some(_depth) = DepthGuard::enter(self.max_depth) else {
            error!("signal: propagation depth {} exceeded at signal {}", self.max_depth, id.get());
            return Err(GraphError::RecursionLimit.into());
        };
        let sinks: Vec<FunctionId> = lock(&self.edges)
            .iter()
            .filter(|(s, _)| *s == id)
            .map(|&(_, f)| f)
            .collect();
        let mut outcome = Ok(());
        for f in sinks {
            let r = self.run(f, Some(id));
            if outcome.is_ok() {
                outcome = r;
            }
        }
        outcome
    }

    // ── Functions ─────────────────────────────────────────────

    /// Add an operator kind. Kinds are unique.
    pub fn register_factory(&self, factory: Arc<dyn OperatorFactory>) -> Result<()> {
        let mut factories = lock(&self.factories);
        let kind = factory.kind().to_owned();
        if factories.contains_key(&kind) {
            error!("func: operator kind {} already registered", kind);
            return Err(RegistryError::DuplicateName.into());
        }
        factories.insert(kind, factory);
        Ok(())
    }

    /// Create a Function of operator `kind`. Also creates its result
    /// signal `<name>.result` (if the operator has one) and its
    /// `func!<name>` action. On error no Function, result signal or
    /// action is left behind.
    pub fn create_function(
        self: &Arc<Self>,
        kind: &str,
        name: &str,
        args: &[&str],
    ) -> Result<FunctionId> {
        let action_name = format!("func!{name}");
        let result_name = format!("{name}{RESULT_SUFFIX}");
        if self.function_by_name(name).is_some()
            || self.actions.exists(&action_name)
            || self.signal_by_name(&result_name).is_some()
        {
            error!("func: function {} already exists", name);
            return Err(RegistryError::DuplicateName.into());
        }
        let Some(fac) = lock(&self.factories).get(kind).cloned() else {
            error!("func: unknown operator kind '{}'", kind);
            return Err(GraphError::UnknownOperator.into());
        };
        let cx = FactoryContext {
            bus: &self.bus,
            fuses: &self.fuses,
        };
        let op = fac.create(&cx, name, args)?;
        let wake = op.wake_event();

        // Name check and publish happen under one functions lock.
        let (id, action) = {
            let mut functions = lock(&self.functions);
            if functions.iter().any(|f| f.name == name) {
                error!("func: function {} already exists", name);
                return Err(RegistryError::DuplicateName.into());
            }
            let id = u32::try_from(functions.len()).map_err(|_| RegistryError::Exhausted)?;
            let id = FunctionId(id);

            let graph: Weak<Graph> = Arc::downgrade(self);
            let fname = name.to_owned();
            let action = self.actions.register(
                &action_name,
                move |_| {
                    if let Some(g) = graph.upgrade() {
                        if let Err(e) = g.evaluate(id) {
                            warn!("func: {}: {}", fname, e);
                        }
                    }
                },
                None,
                Some("execute the function"),
            )?;
            let result = match op.result_kind() {
                Some(k) => Some(self.create_signal(&result_name, SignalValue::zero(k), None)?),
                None => None,
            };
            functions.push(Arc::new(FunctionNode {
                name: name.to_owned(),
                kind: kind.to_owned(),
                params: Mutex::new(vec![None; op.params()]),
                required: op.required_params(),
                op: Mutex::new(op),
                result,
            }));
            (id, action)
        };

        if let Some(ev) = wake {
            self.bus.attach(ev, action, None)?;
        }
        info!("func: created {} ({})", name, kind);
        Ok(id)
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        lock(&self.functions)
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId(i as u32))
    }

    /// Result signal of a Function.
    pub fn function_result(&self, f: FunctionId) -> Option<SignalId> {
        self.node(f).ok().and_then(|n| n.result)
    }

    pub fn function_count(&self) -> usize {
        lock(&self.functions).len()
    }

    pub fn functions(&self) -> Vec<FunctionInfo> {
        let nodes: Vec<Arc<FunctionNode>> = lock(&self.functions).clone();
        let signals = lock(&self.signals);
        let name_of = |id: SignalId| signals.get(id.index()).map(|s| s.name.clone());
        nodes
            .iter()
            .map(|n| FunctionInfo {
                name: n.name.clone(),
                kind: n.kind.clone(),
                params: lock(&n.params).iter().map(|p| p.and_then(name_of)).collect(),
                result: n.result.and_then(name_of),
            })
            .collect()
    }

    /// Bind parameter `index` of `f` to `signal`. Binding does not
    /// evaluate the Function, but may change the kind of its result
    /// signal (see [`Operator::bound_kind`]).
    pub fn bind_parameter(&self, f: FunctionId, index: usize, signal: SignalId) -> Result<()> {
        if lock(&self.signals).get(signal.index()).is_none() {
            return Err(RegistryError::InvalidId.into());
        }
        let node = self.node(f)?;
        let previous = {
            let mut params = lock(&node.params);
            let Some(slot) = params.get_mut(index) else {
                error!("func: {} has no parameter {}", node.name, index);
                return Err(GraphError::ParameterIndex.into());
            };
            let previous = slot.replace(signal);
            // Drop the old edge unless the old signal still feeds another slot.
            previous.filter(|&p| p != signal && !params.contains(&Some(p)))
        };

        {
            let mut edges = lock(&self.edges);
            if let Some(old) = previous {
                edges.retain(|&e| e != (old, f));
            }
            if !edges.contains(&(signal, f)) {
                edges.push((signal, f));
            }
        }
        debug!("func: {} param {} <- signal {}", node.name, index, signal.get());
        self.settle_kinds(f);
        Ok(())
    }

    /// Re-derive the result kind of `f` and, transitively, of every
    /// Function fed by a result that changed kind. Each Function is
    /// visited at most once.
    fn settle_kinds(&self, f: FunctionId) {
        let mut work = vec![f];
        let mut seen = Vec::new();
        while let Some(f) = work.pop() {
            if seen.contains(&f) {
                continue;
            }
            seen.push(f);
            let Some(result) = self.settle_result_kind(f) else {
                continue;
            };
            work.extend(
                lock(&self.edges)
                    .iter()
                    .filter(|(s, _)| *s == result)
                    .map(|&(_, g)| g),
            );
        }
    }

    /// Coerce the result signal of `f` into the kind its operator asks
    /// for under the current bindings. Returns the result signal if its
    /// kind changed.
    fn settle_result_kind(&self, f: FunctionId) -> Option<SignalId> {
        let node = self.node(f).ok()?;
        let result = node.result?;
        let bindings: Vec<Option<SignalId>> = lock(&node.params).clone();
        let kinds: Vec<Option<SignalKind>> = {
            let signals = lock(&self.signals);
            bindings
                .iter()
                .map(|b| b.and_then(|id| signals.get(id.index()).map(|s| s.value.kind())))
                .collect()
        };
        let kind = lock(&node.op).bound_kind(&kinds)?;
        let mut signals = lock(&self.signals);
        let s = signals.get_mut(result.index())?;
        if s.value.kind() == kind {
            return None;
        }
        s.value = s.value.coerce(kind);
        debug!("signal: {} is now {}", s.name, kind);
        Some(result)
    }

    /// Bind the next unbound parameter of `f` to the signal named
    /// `signal_name`.
    pub fn add_parameter(&self, f: FunctionId, signal_name: &str) -> Result<()> {
        let Some(signal) = self.signal_by_name(signal_name) else {
            warn!("func: unknown signal {}", signal_name);
            return Err(RegistryError::UnknownName.into());
        };
        let node = self.node(f)?;
        let free = lock(&node.params).iter().position(Option::is_none);
        match free {
            Some(i) => self.bind_parameter(f, i, signal),
            None => {
                error!("func: {} has no free parameter", node.name);
                Err(GraphError::ParameterIndex.into())
            }
        }
    }

    /// Evaluate `f` on demand, as its `func!<name>` action does.
    pub fn evaluate(&self, f: FunctionId) -> Result<()> {
        self.run(f, None)
    }

    fn node(&self, f: FunctionId) -> Result<Arc<FunctionNode>> {
        lock(&self.functions)
            .get(f.0 as usize)
            .cloned()
            .ok_or_else(|| RegistryError::InvalidId.into())
    }

    fn run(&self, f: FunctionId, trigger: Option<SignalId>) -> Result<()> {
        let node = self.node(f)?;
        let bindings: Vec<Option<SignalId>> = lock(&node.params).clone();
        if bindings.iter().take(node.required).any(Option::is_none) {
            // A no-op until wiring is complete.
            warn!("func: {}: {}", node.name, GraphError::UnboundParameter);
            return Ok(());
        }
        let values: Vec<Option<SignalValue>> = {
            let signals = lock(&self.signals);
            bindings
                .iter()
                .map(|b| b.and_then(|id| signals.get(id.index()).map(|s| s.value)))
                .collect()
        };
        let trigger = match trigger {
            Some(sig) => Trigger::Param(bindings.iter().position(|b| *b == Some(sig)).unwrap_or(0)),
            None => Trigger::Action,
        };
        let out = {
            let mut op = lock(&node.op);
            op.evaluate(&EvalContext {
                name: &node.name,
                params: &values,
                trigger,
            })
        };
        match (out, node.result) {
            (Some(v), Some(result)) => self.set(result, v),
            _ => Ok(()),
        }
    }
}

fn info(id: SignalId, s: &Signal) -> SignalInfo {
    SignalInfo {
        id,
        name: s.name.clone(),
        kind: s.value.kind(),
        dim: s.dim.clone(),
        value: s.value,
        valid: s.value.is_valid(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
