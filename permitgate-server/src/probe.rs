//! System load readings for the tuner

use parking_lot::Mutex;
use permitgate::{GateError, LoadSignals, LoadSnapshot};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reads memory pressure from the OS and the thread count of this process
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSignals for SystemProbe {
    fn snapshot(&self) -> Result<LoadSnapshot, GateError> {
        let (used, total, threads) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (
                system.used_memory(),
                system.total_memory(),
                self.thread_count(&mut system),
            )
        };
        if total == 0 {
            return Err(GateError::TunerCycle(
                "total memory reported as zero".into(),
            ));
        }

        Ok(LoadSnapshot {
            memory_usage_percent: used as f64 / total as f64 * 100.0,
            thread_count: threads,
        })
    }
}

impl SystemProbe {
    /// Threads in this process, or the available parallelism where the OS
    /// does not list them
    fn thread_count(&self, system: &mut System) -> usize {
        let tasks = self.pid.and_then(|pid| {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            // The main thread is not part of its own task list
            system
                .process(pid)
                .and_then(|process| process.tasks())
                .map(|tasks| tasks.len() + 1)
        });
        tasks.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
