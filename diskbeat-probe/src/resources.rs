//! CPU / memory sampling of the probe process
//!
//! Values are percentages rendered as text, the same shape `ps -o %cpu,%mem` prints.

use diskbeat_protocol::Resource;
use sysinfo::{Pid, System};
use tracing::debug;

pub trait ResourceSampler: Send {
    /// `None` when the process can no longer be observed
    fn sample(&mut self) -> Option<Resource>;
}

pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    pub fn for_pid(pid: Pid) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // Primes the CPU counters so the first real sample has a baseline
        system.refresh_process(pid);
        Self { system, pid }
    }

    /// Samples the running probe, which hosts the load worker
    pub fn current() -> Self {
        Self::for_pid(Pid::from_u32(std::process::id()))
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&mut self) -> Option<Resource> {
        self.system.refresh_memory();
        if !self.system.refresh_process(self.pid) {
            debug!("process {} not found while sampling", self.pid);
            return None;
        }
        let process = self.system.process(self.pid)?;
        let total = self.system.total_memory();
        let mem = if total > 0 {
            process.memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Some(Resource {
            cpu: format!("{:.1}", process.cpu_usage()),
            mem: format!("{:.1}", mem),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let mut sampler = ProcessSampler::current();
        let resource = sampler.sample().unwrap();
        let cpu: f64 = resource.cpu.parse().unwrap();
        let mem: f64 = resource.mem.parse().unwrap();
        assert!(cpu >= 0.0);
        assert!((0.0..=100.0).contains(&mem));
    }
}
