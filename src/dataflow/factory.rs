//! Operator factories, keyed by operator kind string.
//!
//! `create_function("hysteresis", "tank", &["20", "80"])` looks up the
//! factory registered for `"hysteresis"` and hands it the function name
//! and the creation arguments. New kinds are added with
//! [`Graph::register_factory`](super::Graph::register_factory).

use std::sync::Arc;

use log::error;

use super::func::{Binary, BinaryOp, Delay, Hysteresis, Operator, Random};
use crate::error::{GraphError, Result};
use crate::event::EventBus;
use crate::timefuse::FuseRegistry;

/// Kernel services available to a factory while it builds an operator.
pub struct FactoryContext<'a> {
    pub bus: &'a Arc<EventBus>,
    pub fuses: &'a FuseRegistry,
}

pub trait OperatorFactory: Send + Sync {
    /// Operator kind this factory builds.
    fn kind(&self) -> &str;

    fn create(
        &self,
        cx: &FactoryContext<'_>,
        name: &str,
        args: &[&str],
    ) -> Result<Box<dyn Operator>>;
}

/// All built-in factories.
pub fn builtin() -> Vec<Arc<dyn OperatorFactory>> {
    let mut v: Vec<Arc<dyn OperatorFactory>> = BinaryOp::ALL
        .iter()
        .map(|&op| Arc::new(BinaryFactory(op)) as Arc<dyn OperatorFactory>)
        .collect();
    v.push(Arc::new(RandomFactory));
    v.push(Arc::new(HysteresisFactory));
    v.push(Arc::new(DelayFactory));
    v
}

struct BinaryFactory(BinaryOp);

impl OperatorFactory for BinaryFactory {
    fn kind(&self) -> &str {
        self.0.symbol()
    }

    fn create(
        &self,
        _cx: &FactoryContext<'_>,
        _name: &str,
        _args: &[&str],
    ) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Binary::new(self.0)))
    }
}

struct RandomFactory;

impl OperatorFactory for RandomFactory {
    fn kind(&self) -> &str {
        "random"
    }

    fn create(
        &self,
        _cx: &FactoryContext<'_>,
        _name: &str,
        _args: &[&str],
    ) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Random))
    }
}

/// `hysteresis <lo> <hi> [true|false]`
struct HysteresisFactory;

impl OperatorFactory for HysteresisFactory {
    fn kind(&self) -> &str {
        "hysteresis"
    }

    fn create(
        &self,
        cx: &FactoryContext<'_>,
        name: &str,
        args: &[&str],
    ) -> Result<Box<dyn Operator>> {
        let [lo, hi, rest @ ..] = args else {
            error!("func: {}: hysteresis needs <lo> <hi>", name);
            return Err(GraphError::BadArgument("hysteresis needs lo and hi").into());
        };
        let lo = parse_i64(lo).ok_or(GraphError::BadArgument("lo is not an integer"))?;
        let hi = parse_i64(hi).ok_or(GraphError::BadArgument("hi is not an integer"))?;
        if lo > hi {
            return Err(GraphError::BadArgument("lo above hi").into());
        }
        let initial = match rest.first().copied() {
            None | Some("false") => false,
            Some("true") => true,
            Some(_) => return Err(GraphError::BadArgument("initial state is not a bool").into()),
        };
        let rising = cx.bus.register(name, Some("`rising"))?;
        let falling = cx.bus.register(name, Some("`falling"))?;
        Ok(Box::new(Hysteresis::new(lo, hi, initial, Arc::clone(cx.bus), rising, falling)))
    }
}

/// `delay <ms>`
struct DelayFactory;

impl OperatorFactory for DelayFactory {
    fn kind(&self) -> &str {
        "delay"
    }

    fn create(
        &self,
        cx: &FactoryContext<'_>,
        name: &str,
        args: &[&str],
    ) -> Result<Box<dyn Operator>> {
        let ms = args
            .first()
            .and_then(|a| parse_i64(a))
            .and_then(|ms| u32::try_from(ms).ok())
            .filter(|&ms| ms > 0)
            .ok_or(GraphError::BadArgument("delay needs a positive interval in ms"))?;
        let fuse = cx.fuses.create(name, ms, false)?;
        Ok(Box::new(Delay::new(fuse)))
    }
}

fn parse_i64(s: &str) -> Option<i64> {
    match super::SignalValue::parse(super::SignalKind::Int, s)? {
        super::SignalValue::Int(i) => Some(i),
        super::SignalValue::Float(_) => None,
    }
}
