use crate::error::SetupError;
use serde::{Deserialize, Serialize};

/// Real-time execution context of the control task.
///
/// Applied once at start-up, before the cycle loop is armed. Every step that
/// is enabled must succeed. Each step has its own switch so a configuration
/// file can turn it off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealTimeConfig {
    /// Switch to `SCHED_FIFO` at `priority`.
    pub fifo: bool,
    pub priority: i32,
    /// Pin the task to the single CPU `cpu`.
    pub pin_cpu: bool,
    pub cpu: usize,
    /// Lock all current and future pages into RAM.
    pub lock_memory: bool,
}

impl Default for RealTimeConfig {
    fn default() -> Self {
        Self {
            fifo: true,
            priority: 81,
            pin_cpu: true,
            cpu: 1,
            lock_memory: true,
        }
    }
}

impl RealTimeConfig {
    /// A context that changes nothing.
    pub fn disabled() -> Self {
        Self {
            fifo: false,
            pin_cpu: false,
            lock_memory: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.pin_cpu && self.cpu >= libc::CPU_SETSIZE as usize {
            return Err(SetupError::Config(format!(
                "cpu {} exceeds CPU_SETSIZE {}",
                self.cpu,
                libc::CPU_SETSIZE
            )));
        }
        Ok(())
    }

    /// Applies the context to the calling thread (and, for memory locking,
    /// the whole process).
    pub fn apply(&self) -> Result<(), SetupError> {
        self.validate()?;
        if self.fifo {
            set_fifo_priority(self.priority)?;
            log::info!("scheduling policy SCHED_FIFO, priority {}", self.priority);
        }
        if self.pin_cpu {
            pin_to_cpu(self.cpu)?;
            log::info!("pinned to cpu {}", self.cpu);
        }
        if self.lock_memory {
            lock_all_memory()?;
            log::info!("all current and future pages locked");
        }
        Ok(())
    }
}

fn set_fifo_priority(priority: i32) -> Result<(), SetupError> {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        return Err(SetupError::RealTime {
            what: "sched_setscheduler",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn pin_to_cpu(cpu: usize) -> Result<(), SetupError> {
    unsafe {
        let mut mask: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut mask);
        libc::CPU_SET(cpu, &mut mask);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mask) != 0 {
            return Err(SetupError::RealTime {
                what: "sched_setaffinity",
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

fn lock_all_memory() -> Result<(), SetupError> {
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(SetupError::RealTime {
            what: "mlockall",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
