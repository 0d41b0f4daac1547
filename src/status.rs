//! Kernel status snapshot for the external CLI.
//!
//! [`KernelStatus`] serialises to JSON; the `render_*` methods print the
//! plain-text tables.

use core::fmt;

use serde::Serialize;

use crate::action::ActionStats;
use crate::cyclic::SubTaskStats;
use crate::dataflow::{FunctionInfo, SignalInfo};
use crate::event::{BusCounters, EventStats};
use crate::timefuse::FuseStats;

/// One row of the action listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub help: Option<String>,
    pub stats: ActionStats,
}

/// Point-in-time view of every kernel registry.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub uptime_us: u64,
    pub counters: BusCounters,
    pub events: Vec<EventStats>,
    pub tasks: Vec<SubTaskStats>,
    pub actions: Vec<ActionInfo>,
    pub fuses: Vec<FuseStats>,
    pub signals: Vec<SignalInfo>,
    pub functions: Vec<FunctionInfo>,
}

impl KernelStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Global counters plus the per-event table.
    pub fn render_events(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let c = &self.counters;
        writeln!(
            out,
            "processed {}, discarded {}, lost {}, invalid {}, isr {}",
            c.processed, c.discarded, c.lost, c.invalid, c.isr
        )?;
        writeln!(out, "{:>5}  {:<32}  {:>8}  {:>10}", "id", "event", "count", "time")?;
        for e in &self.events {
            writeln!(
                out,
                "{:>5}  {:<32}  {:>8}  {:>10}",
                e.id.get(),
                e.name,
                e.occurrences,
                e.time_us
            )?;
            for cb in &e.callbacks {
                let state = if cb.enabled { "" } else { " (disabled)" };
                match &cb.arg {
                    Some(arg) => writeln!(out, "       -> {} {}{}", cb.action, arg, state)?,
                    None => writeln!(out, "       -> {}{}", cb.action, state)?,
                }
            }
        }
        Ok(())
    }

    /// SubTask table in the cyclic scheduler's column layout.
    pub fn render_tasks(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "{:<16}  {:>8}  {:>8}  {:>10}", "name", "calls", "peak", "total")?;
        for t in &self.tasks {
            writeln!(
                out,
                "{:<16}  {:>8}  {:>8}  {:>10}",
                t.name, t.calls, t.peak_us, t.total_us
            )?;
        }
        Ok(())
    }

    pub fn render_actions(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for a in &self.actions {
            let s = &a.stats;
            write!(out, "{:<24} {:>6} calls", a.name, s.calls)?;
            if s.calls > 0 {
                let avg = s.total_us / u64::from(s.calls);
                write!(out, ", {}/{}/{} us min/avg/max", s.min_us, avg, s.max_us)?;
            }
            match &a.help {
                Some(h) => writeln!(out, "  {h}")?,
                None => writeln!(out)?,
            }
        }
        Ok(())
    }

    pub fn render_signals(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for s in &self.signals {
            let dim = s.dim.as_deref().unwrap_or("");
            if s.valid {
                writeln!(out, "{} [{}] = {}{}", s.name, s.kind, s.value, dim)?;
            } else {
                writeln!(out, "{} [{}] = <invalid>", s.name, s.kind)?;
            }
        }
        for f in &self.fuses {
            let state = if f.active { "active" } else { "stopped" };
            writeln!(out, "timer {} {}ms {}", f.name, f.interval_ms, state)?;
        }
        Ok(())
    }
}
