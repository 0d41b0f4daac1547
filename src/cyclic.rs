//! Cooperative cyclic scheduler.
//!
//! Drivers register SubTasks: named periodic bodies that return the
//! delay (milliseconds) until they want to run again. One pass of
//! [`Cyclic::run_once`] runs every task whose deadline has elapsed and
//! reports how long the caller may sleep before the next pass.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         run_once()                           │
//! │                                                              │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   │
//! │  │ SubTask  │──▶│ SubTask  │──▶│ SubTask  │──▶│ SubTask  │   │
//! │  │ due: run │   │ not due  │   │ due: run │   │ not due  │   │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘   │
//! │        │              │              │              │        │
//! │        └──────────────┴──────┬───────┴──────────────┘        │
//! │                              ▼                               │
//! │                  min(next wait) ──▶ caller sleeps            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Strictly cooperative: a slow body delays every task behind it in the
//! same pass. The task list lock is released while a body runs, so a
//! body may add or remove tasks (including itself) or trigger events.

use core::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use serde::Serialize;

use crate::error::{RegistryError, Result};
use crate::platform::{lock, Clock};

/// Maximum SubTask name length (the width of the status table column).
pub const NAME_CAP: usize = 16;

/// Fixed-capacity SubTask name.
pub type TaskName = heapless::String<NAME_CAP>;

/// SubTask body. Returns the requested delay until its next run in
/// milliseconds.
pub type SubTaskFn = dyn Fn() -> u32 + Send + Sync;

/// Status table row for one SubTask.
#[derive(Debug, Clone, Serialize)]
pub struct SubTaskStats {
    pub name: TaskName,
    pub calls: u32,
    pub peak_us: u32,
    pub total_us: u64,
    /// Absolute deadline of the next run (microseconds since boot).
    pub next_run_us: u64,
}

struct SubTask {
    /// Unique per registration, so a removed and re-added name is not
    /// mistaken for the old entry mid-pass.
    serial: u32,
    name: TaskName,
    body: Arc<SubTaskFn>,
    next_run_us: u64,
    total_us: u64,
    peak_us: u32,
    calls: u32,
}

/// The cyclic scheduler.
pub struct Cyclic {
    tasks: Mutex<TaskList>,
    clock: Arc<dyn Clock>,
    /// Ceiling of the poll interval returned by `run_once` (ms).
    max_delay_ms: u32,
}

#[derive(Default)]
struct TaskList {
    next_serial: u32,
    tasks: Vec<SubTask>,
}

impl Cyclic {
    pub fn new(clock: Arc<dyn Clock>, max_delay_ms: u32) -> Self {
        Self {
            tasks: Mutex::new(TaskList::default()),
            clock,
            max_delay_ms,
        }
    }

    /// Add a SubTask that first runs `initial_delay_ms` from now.
    pub fn add<F>(&self, name: &str, body: F, initial_delay_ms: u32) -> Result<()>
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        let Ok(task_name) = TaskName::try_from(name) else {
            error!("cyclic: subtask name '{}' exceeds {} bytes", name, NAME_CAP);
            return Err(RegistryError::NameTooLong.into());
        };
        let now = self.clock.now_us();
        let mut list = lock(&self.tasks);
        if list.tasks.iter().any(|t| t.name == task_name) {
            error!("cyclic: subtask {} already exists", name);
            return Err(RegistryError::DuplicateName.into());
        }
        let serial = list.next_serial;
        list.next_serial = list.next_serial.wrapping_add(1);
        list.tasks.push(SubTask {
            serial,
            name: task_name,
            body: Arc::new(body),
            next_run_us: now + u64::from(initial_delay_ms) * 1000,
            total_us: 0,
            peak_us: 0,
            calls: 0,
        });
        info!("cyclic: add subtask {}", name);
        Ok(())
    }

    /// Remove a SubTask. An invocation already in progress completes.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut list = lock(&self.tasks);
        match list.tasks.iter().position(|t| t.name.as_str() == name) {
            Some(i) => {
                list.tasks.remove(i);
                info!("cyclic: removed subtask {}", name);
                Ok(())
            }
            None => Err(RegistryError::UnknownName.into()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one pass over all SubTasks.
    ///
    /// Every task whose deadline has passed runs once; its next deadline
    /// becomes its completion time plus the delay it returned. Returns
    /// the minimum wait (ms) across all tasks, capped at the configured
    /// ceiling, as the caller's next poll interval.
    pub fn run_once(&self) -> u32 {
        let mut delay = self.max_delay_ms;
        let serials: Vec<u32> = lock(&self.tasks).tasks.iter().map(|t| t.serial).collect();
        let mut start = self.clock.now_us();

        for serial in serials {
            // Re-check under the lock: the task may have been removed by
            // an earlier body in this pass.
            let due = {
                let list = lock(&self.tasks);
                let Some(t) = list.tasks.iter().find(|t| t.serial == serial) else {
                    continue;
                };
                if t.next_run_us <= start {
                    Some(Arc::clone(&t.body))
                } else {
                    let wait_ms = (t.next_run_us - start) / 1000;
                    delay = delay.min(u32::try_from(wait_ms).unwrap_or(u32::MAX));
                    None
                }
            };
            let Some(body) = due else { continue };

            let requested = body();
            let end = self.clock.now_us();
            let dt = end.saturating_sub(start);
            {
                let mut list = lock(&self.tasks);
                if let Some(t) = list.tasks.iter_mut().find(|t| t.serial == serial) {
                    t.next_run_us = end + u64::from(requested) * 1000;
                    t.calls = t.calls.wrapping_add(1);
                    t.total_us += dt;
                    t.peak_us = t.peak_us.max(u32::try_from(dt).unwrap_or(u32::MAX));
                }
            }
            start = end;
            delay = delay.min(requested);
        }
        debug!("cyclic: next poll in {}ms", delay);
        delay
    }

    /// Per-SubTask status table, in registration order.
    pub fn stats(&self) -> Vec<SubTaskStats> {
        lock(&self.tasks)
            .tasks
            .iter()
            .map(|t| SubTaskStats {
                name: t.name.clone(),
                calls: t.calls,
                peak_us: t.peak_us,
                total_us: t.total_us,
                next_run_us: t.next_run_us,
            })
            .collect()
    }

    /// Print the status table in the CLI layout.
    pub fn render_table(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "{:<16}  {:>8}  {:>8}  {:>10}", "name", "calls", "peak", "total")?;
        for s in self.stats() {
            writeln!(
                out,
                "{:<16}  {:>8}  {:>8}  {:>10}",
                s.name, s.calls, s.peak_us, s.total_us
            )?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualClock;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn sched() -> (Arc<ManualClock>, Cyclic) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let c = Cyclic::new(clock.clone(), 100);
        (clock, c)
    }

    fn counter() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        let n = Arc::new(AtomicU32::new(0));
        (n.clone(), n)
    }

    #[test]
    fn task_waits_for_initial_delay() {
        let (clock, s) = sched();
        let (n, n2) = counter();
        s.add(
            "t",
            move || {
                n2.fetch_add(1, Ordering::SeqCst);
                50
            },
            20,
        )
        .unwrap();

        assert_eq!(s.run_once(), 20);
        assert_eq!(n.load(Ordering::SeqCst), 0);

        clock.advance_ms(20);
        assert_eq!(s.run_once(), 50);
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deadline_is_completion_plus_requested_delay() {
        let (clock, s) = sched();
        let c = clock.clone();
        s.add(
            "slow",
            move || {
                c.advance_ms(7);
                30
            },
            0,
        )
        .unwrap();
        s.run_once();
        let st = &s.stats()[0];
        assert_eq!(st.calls, 1);
        assert_eq!(st.next_run_us, clock.now_us() + 30_000);
        assert_eq!(st.peak_us, 7_000);
        assert_eq!(st.total_us, 7_000);
    }

    #[test]
    fn future_task_never_runs() {
        let (clock, s) = sched();
        let (n, n2) = counter();
        s.add(
            "later",
            move || {
                n2.fetch_add(1, Ordering::SeqCst);
                10
            },
            500,
        )
        .unwrap();
        for _ in 0..10 {
            clock.advance_ms(40);
            s.run_once();
        }
        assert_eq!(n.load(Ordering::SeqCst), 0);
        clock.advance_ms(100);
        s.run_once();
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_capped() {
        let (_clock, s) = sched();
        s.add("lazy", || 10_000, 0).unwrap();
        assert_eq!(s.run_once(), 100);
        assert_eq!(s.run_once(), 100);
    }

    #[test]
    fn duplicate_and_long_names_rejected() {
        let (_clock, s) = sched();
        s.add("dup", || 1, 0).unwrap();
        assert_eq!(s.add("dup", || 1, 0), Err(RegistryError::DuplicateName.into()));
        assert_eq!(
            s.add("a-name-longer-than-16", || 1, 0),
            Err(RegistryError::NameTooLong.into())
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn remove_unknown_fails() {
        let (_clock, s) = sched();
        assert_eq!(s.remove("ghost"), Err(RegistryError::UnknownName.into()));
    }

    #[test]
    fn body_can_remove_later_task() {
        let (_clock, s) = sched();
        let s = Arc::new(s);
        let (n, n2) = counter();
        let s2 = Arc::clone(&s);
        s.add(
            "killer",
            move || {
                s2.remove("victim").unwrap();
                10
            },
            0,
        )
        .unwrap();
        s.add(
            "victim",
            move || {
                n2.fetch_add(1, Ordering::SeqCst);
                10
            },
            0,
        )
        .unwrap();
        s.run_once();
        assert_eq!(n.load(Ordering::SeqCst), 0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn body_can_remove_itself() {
        let (_clock, s) = sched();
        let s = Arc::new(s);
        let s2 = Arc::clone(&s);
        s.add(
            "once",
            move || {
                s2.remove("once").unwrap();
                10
            },
            0,
        )
        .unwrap();
        s.run_once();
        assert!(s.is_empty());
    }

    #[test]
    fn render_table_lists_tasks() {
        let (_clock, s) = sched();
        s.add("blink", || 500, 0).unwrap();
        s.run_once();
        let mut out = String::new();
        s.render_table(&mut out).unwrap();
        assert!(out.starts_with("name"));
        assert!(out.lines().nth(1).unwrap().starts_with("blink"));
    }
}
