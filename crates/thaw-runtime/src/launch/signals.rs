//! Forwarding of termination signals to a supervised child.
//!
//! While a [`Forwarding`] guard is alive, SIGINT, SIGTERM, SIGHUP and SIGQUIT
//! received by this process are re-sent to the child instead of terminating
//! the supervisor, so it can still wait, release ownership and propagate the
//! child's status.

use std::process::ExitStatus;

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicI32, Ordering};

    static CHILD_PID: AtomicI32 = AtomicI32::new(0);

    const FORWARDED: [libc::c_int; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT];

    extern "C" fn forward(signo: libc::c_int) {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: kill(2) is async-signal-safe and pid names our own child.
            unsafe {
                libc::kill(pid, signo);
            }
        }
    }

    pub struct Forwarding {
        previous: Vec<(libc::c_int, libc::sighandler_t)>,
    }

    impl Forwarding {
        pub fn install(child: u32) -> Self {
            CHILD_PID.store(child as i32, Ordering::SeqCst);
            let handler = forward as extern "C" fn(libc::c_int) as libc::sighandler_t;
            let previous = FORWARDED
                .iter()
                .map(|&signo| {
                    // SAFETY: the handler only reads an atomic and calls kill.
                    let old = unsafe { libc::signal(signo, handler) };
                    (signo, old)
                })
                .collect();
            Self { previous }
        }
    }

    impl Drop for Forwarding {
        fn drop(&mut self) {
            for &(signo, old) in &self.previous {
                if old != libc::SIG_ERR {
                    // SAFETY: restores the disposition saved in install.
                    unsafe {
                        libc::signal(signo, old);
                    }
                }
            }
            CHILD_PID.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub struct Forwarding;

    impl Forwarding {
        pub fn install(_child: u32) -> Self {
            Forwarding
        }
    }
}

/// Guard that forwards termination signals to a child until dropped.
pub struct Forwarding {
    _inner: imp::Forwarding,
}

/// Start forwarding signals to `child`.
pub fn forward_to(child: u32) -> Forwarding {
    tracing::trace!(child, "forwarding termination signals");
    Forwarding {
        _inner: imp::Forwarding::install(child),
    }
}

/// Exit code for a finished child: its own code, or `128 + signo` if a
/// signal ended it.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return 128 + signo;
        }
    }
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_exit_code_passthrough() {
        let status = Command::new("sh").args(["-c", "exit 7"]).status().unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[test]
    fn test_signal_death_maps_to_128_plus_signo() {
        let status = Command::new("sh").args(["-c", "kill -TERM $$"]).status().unwrap();
        assert_eq!(exit_code(status), 128 + libc::SIGTERM);
    }
}
