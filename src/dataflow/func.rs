//! Operators: the computation inside a Function node.
//!
//! The graph owns the parameter bindings and the result signal; an
//! operator only sees the current parameter values and returns the new
//! result (if any).

use std::sync::Arc;

use log::{debug, warn};

use super::signal::{SignalKind, SignalValue};
use crate::event::{EventBus, EventId};
use crate::platform::random_u32;
use crate::timefuse::FuseRef;

/// What caused an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Parameter `n` changed.
    Param(usize),
    /// The `func!<name>` action ran.
    Action,
}

/// Evaluation input.
pub struct EvalContext<'a> {
    /// Function name, for diagnostics.
    pub name: &'a str,
    /// Current value of each parameter slot, `None` if unbound.
    pub params: &'a [Option<SignalValue>],
    pub trigger: Trigger,
}

impl EvalContext<'_> {
    pub fn param(&self, i: usize) -> Option<SignalValue> {
        self.params.get(i).copied().flatten()
    }
}

/// A Function's computation.
pub trait Operator: Send {
    /// Number of parameter slots.
    fn params(&self) -> usize;

    /// Leading slots that must be bound before the operator may run.
    fn required_params(&self) -> usize {
        self.params()
    }

    /// Kind of the result signal, `None` for operators without a result.
    fn result_kind(&self) -> Option<SignalKind>;

    /// Result kind once the parameters are bound to signals of `params`
    /// kinds. `None` keeps the current kind.
    fn bound_kind(&self, params: &[Option<SignalKind>]) -> Option<SignalKind> {
        let _ = params;
        None
    }

    /// Event that should run the Function's action when raised.
    fn wake_event(&self) -> Option<EventId> {
        None
    }

    /// Compute the new result value. `None` leaves the result untouched.
    fn evaluate(&mut self, cx: &EvalContext<'_>) -> Option<SignalValue>;
}

// ═══════════════════════════════════════════════════════════════
//  Binary operators
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Less,
    LessEqual,
    Equal,
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 10] = [
        Self::Less,
        Self::LessEqual,
        Self::Equal,
        Self::And,
        Self::Or,
        Self::Xor,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
    ];

    /// Operator kind string used by the factory registry.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Equal => "==",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }

    fn result_kind(self) -> SignalKind {
        if self.is_arithmetic() {
            SignalKind::Float
        } else {
            SignalKind::Int
        }
    }

    /// Apply the operator. Mixed Int/Float operands are compared and
    /// combined as floating point. Int arithmetic is exact; overflow and
    /// integer division by zero yield `None`.
    pub fn apply(self, l: SignalValue, r: SignalValue) -> Option<SignalValue> {
        use SignalValue::{Float, Int};
        let v = match self {
            Self::Less | Self::LessEqual | Self::Equal => {
                let b = match (l, r) {
                    (Int(a), Int(b)) => compare(self, a, b),
                    _ => compare(self, l.as_f64(), r.as_f64()),
                };
                SignalValue::from(b)
            }
            Self::And | Self::Or | Self::Xor => {
                let (Some(a), Some(b)) = (l.as_int(), r.as_int()) else {
                    return None;
                };
                Int(match self {
                    Self::And => a & b,
                    Self::Or => a | b,
                    _ => a ^ b,
                })
            }
            Self::Add | Self::Sub | Self::Mul | Self::Div => match (l, r) {
                (Int(a), Int(b)) => Int(match self {
                    Self::Add => a.checked_add(b),
                    Self::Sub => a.checked_sub(b),
                    Self::Mul => a.checked_mul(b),
                    _ => a.checked_div(b),
                }?),
                _ => {
                    let (a, b) = (l.as_f64(), r.as_f64());
                    Float(match self {
                        Self::Add => a + b,
                        Self::Sub => a - b,
                        Self::Mul => a * b,
                        _ => a / b,
                    })
                }
            },
        };
        Some(v)
    }
}

fn compare<T: PartialOrd>(op: BinaryOp, a: T, b: T) -> bool {
    match op {
        BinaryOp::Less => a < b,
        BinaryOp::LessEqual => a <= b,
        _ => a == b,
    }
}

/// Two-parameter operator producing `<name>.result`.
pub struct Binary {
    op: BinaryOp,
}

impl Binary {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }
}

impl Operator for Binary {
    fn params(&self) -> usize {
        2
    }

    fn result_kind(&self) -> Option<SignalKind> {
        Some(self.op.result_kind())
    }

    fn bound_kind(&self, params: &[Option<SignalKind>]) -> Option<SignalKind> {
        match params {
            [Some(SignalKind::Int), Some(SignalKind::Int)] if self.op.is_arithmetic() => {
                Some(SignalKind::Int)
            }
            [Some(_), Some(_)] => Some(self.op.result_kind()),
            _ => None,
        }
    }

    fn evaluate(&mut self, cx: &EvalContext<'_>) -> Option<SignalValue> {
        let (l, r) = (cx.param(0)?, cx.param(1)?);
        let v = self.op.apply(l, r);
        match v {
            Some(v) => debug!("func: {} {} {} {} = {}", cx.name, l, self.op.symbol(), r, v),
            None => warn!("func: {}: {} {} {} has no result", cx.name, l, self.op.symbol(), r),
        }
        v
    }
}

// ═══════════════════════════════════════════════════════════════
//  Random
// ═══════════════════════════════════════════════════════════════

/// Uniform integer in `[lo, hi)`; `lo` and `hi` come from the optional
/// parameters 0 and 1.
pub struct Random;

pub const RANDOM_DEFAULT_LO: i64 = 0;
pub const RANDOM_DEFAULT_HI: i64 = u32::MAX as i64;

impl Operator for Random {
    fn params(&self) -> usize {
        2
    }

    fn required_params(&self) -> usize {
        0
    }

    fn result_kind(&self) -> Option<SignalKind> {
        Some(SignalKind::Int)
    }

    fn evaluate(&mut self, cx: &EvalContext<'_>) -> Option<SignalValue> {
        let bound = |i: usize, default: i64| match cx.param(i) {
            None => Some(default),
            Some(v) => v.as_int(),
        };
        let (Some(lo), Some(hi)) = (bound(0, RANDOM_DEFAULT_LO), bound(1, RANDOM_DEFAULT_HI)) else {
            warn!("func: {}: random range must be int", cx.name);
            return None;
        };
        if hi <= lo {
            warn!("func: {}: empty random range [{}, {})", cx.name, lo, hi);
            return None;
        }
        let span = (i128::from(hi) - i128::from(lo)) as u128;
        let r = (u128::from(random_u32()) << 32) | u128::from(random_u32());
        Some(SignalValue::Int((i128::from(lo) + (r % span) as i128) as i64))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Hysteresis
// ═══════════════════════════════════════════════════════════════

/// Level crossing with hysteresis. Goes high above `hi`, low below `lo`,
/// raising `<name>`rising` / `<name>`falling` on each transition.
pub struct Hysteresis {
    lo: i64,
    hi: i64,
    high: bool,
    bus: Arc<EventBus>,
    rising: EventId,
    falling: EventId,
}

impl Hysteresis {
    pub fn new(
        lo: i64,
        hi: i64,
        initial: bool,
        bus: Arc<EventBus>,
        rising: EventId,
        falling: EventId,
    ) -> Self {
        Self {
            lo,
            hi,
            high: initial,
            bus,
            rising,
            falling,
        }
    }

    pub fn rising_event(&self) -> EventId {
        self.rising
    }

    pub fn falling_event(&self) -> EventId {
        self.falling
    }
}

impl Operator for Hysteresis {
    fn params(&self) -> usize {
        1
    }

    fn result_kind(&self) -> Option<SignalKind> {
        Some(SignalKind::Int)
    }

    fn evaluate(&mut self, cx: &EvalContext<'_>) -> Option<SignalValue> {
        let v = cx.param(0)?;
        let (below, above) = match v {
            SignalValue::Int(i) => (i < self.lo, i > self.hi),
            SignalValue::Float(f) => (f < self.lo as f64, f > self.hi as f64),
        };
        if self.high && below {
            self.high = false;
            debug!("func: {} falling at {}", cx.name, v);
            self.bus.trigger_nowait(self.falling);
        } else if !self.high && above {
            self.high = true;
            debug!("func: {} rising at {}", cx.name, v);
            self.bus.trigger_nowait(self.rising);
        }
        Some(SignalValue::from(self.high))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Delay
// ═══════════════════════════════════════════════════════════════

/// Debounce: every input change restarts a one-shot fuse; when the fuse
/// times out the then-current input is copied to the result.
pub struct Delay {
    fuse: FuseRef,
}

impl Delay {
    pub fn new(fuse: FuseRef) -> Self {
        Self { fuse }
    }
}

impl Operator for Delay {
    fn params(&self) -> usize {
        1
    }

    fn result_kind(&self) -> Option<SignalKind> {
        Some(SignalKind::Float)
    }

    fn bound_kind(&self, params: &[Option<SignalKind>]) -> Option<SignalKind> {
        params.first().copied().flatten()
    }

    fn wake_event(&self) -> Option<EventId> {
        Some(self.fuse.timeout_event())
    }

    fn evaluate(&mut self, cx: &EvalContext<'_>) -> Option<SignalValue> {
        match cx.trigger {
            Trigger::Param(_) => {
                if let Err(e) = self.fuse.start() {
                    warn!("func: {}: cannot restart delay: {}", cx.name, e);
                }
                None
            }
            Trigger::Action => cx.param(0),
        }
    }
}
