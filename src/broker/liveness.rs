//! Process liveness probing for stale resource reclamation.

/// Answers whether the process owning a resource entry still exists.
///
/// The broker asks before every request and on its periodic update; entries and user ids
/// of processes reported dead are reclaimed.
pub trait Liveness: Send + Sync {
    /// True while `pid` refers to a running process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes real processes with a null signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 performs the permission and existence checks without delivering anything.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::kill(pid, 0) };
        // EPERM: the process exists but belongs to someone else.
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;

    /// Liveness driven by an explicit set of running pids.
    #[derive(Debug, Default)]
    pub(crate) struct FakeLiveness {
        alive: Mutex<HashSet<u32>>,
    }

    impl FakeLiveness {
        pub(crate) fn alive(pids: &[u32]) -> Self {
            Self {
                alive: Mutex::new(pids.iter().copied().collect()),
            }
        }

        pub(crate) fn spawn(&self, pid: u32) {
            self.alive.lock().insert(pid);
        }

        pub(crate) fn kill(&self, pid: u32) {
            self.alive.lock().remove(&pid);
        }
    }

    impl Liveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(ProcessLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!ProcessLiveness.is_alive(0));
        assert!(!ProcessLiveness.is_alive(u32::MAX));
    }

    #[test]
    fn test_fake_tracks_kills() {
        let probe = FakeLiveness::alive(&[5]);
        assert!(probe.is_alive(5));
        probe.kill(5);
        assert!(!probe.is_alive(5));
        probe.spawn(6);
        assert!(probe.is_alive(6));
    }
}
