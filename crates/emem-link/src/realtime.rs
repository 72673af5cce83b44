//! Real-time setup for the cyclic thread.
//!
//! Applied from inside the thread that runs the exchange:
//! - Memory locking (mlockall) to keep frame buffers resident
//! - Real-time scheduling (SCHED_FIFO/SCHED_RR)
//! - CPU affinity to keep the exchange off housekeeping cores

use emem_common::config::{RealtimeConfig, SchedPolicy};
use emem_common::error::{EmemError, EmemResult};
use tracing::{debug, info, warn};

/// What [`init_realtime`] actually managed to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply `config` to the calling thread.
///
/// Missing privileges are logged and skipped; the link still runs, only
/// with more jitter.
///
/// # Errors
///
/// Returns an error if the OS rejects a request for a reason other than
/// missing privileges.
pub fn init_realtime(config: &RealtimeConfig) -> EmemResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };
    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;
    let cpu_affinity = set_cpu_affinity(&config.cpus)?;

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Real-time initialization complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> EmemResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("Memory locked");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM | nix::errno::Errno::ENOMEM) => {
            warn!("mlockall refused (no CAP_IPC_LOCK or RLIMIT_MEMLOCK too low), page faults may occur");
            Ok(false)
        }
        Err(e) => Err(EmemError::Config(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> EmemResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

#[cfg(target_os = "linux")]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> EmemResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(original = priority, clamped, "Scheduler priority clamped to valid range");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: pid 0 targets the calling thread and `param` outlives the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("sched_setscheduler refused, running without RT priority (needs CAP_SYS_NICE)");
            return Ok((None, None));
        }
        return Err(EmemError::Config(format!("sched_setscheduler failed: {err}")));
    }

    info!(?policy, priority = clamped, "Real-time scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> EmemResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpus: &[usize]) -> EmemResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    if cpus.is_empty() {
        return Ok(None);
    }

    let mut cpu_set = CpuSet::new();
    for &cpu in cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| EmemError::Config(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "CPU affinity set");
            Ok(Some(cpus.to_vec()))
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(?cpus, "Invalid CPU set, some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(EmemError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(cpus: &[usize]) -> EmemResult<Option<Vec<usize>>> {
    if !cpus.is_empty() {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_rt() {
        let config = RealtimeConfig {
            enabled: false,
            ..Default::default()
        };
        let status = init_realtime(&config).unwrap();
        assert_eq!(status, RealtimeStatus::default());
    }

    #[test]
    fn test_other_policy_needs_no_privileges() {
        let (policy, priority) = set_scheduler(SchedPolicy::Other, 10).unwrap();
        assert!(priority.is_none());
        if cfg!(target_os = "linux") {
            assert_eq!(policy, Some(SchedPolicy::Other));
        }
    }

    #[test]
    fn test_cpu_affinity_empty() {
        assert!(set_cpu_affinity(&[]).unwrap().is_none());
    }
}
