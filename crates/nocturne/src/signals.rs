// src/signals.rs
use std::io;
use std::mem;
use std::ptr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const MANAGED_SIGNALS: [libc::c_int; 3] = [libc::SIGUSR1, libc::SIGUSR2, libc::SIGPIPE];

struct SignalState {
    depth: usize,
    saved: Option<[libc::sigaction; 3]>,
}

static STATE: Mutex<SignalState> = Mutex::new(SignalState {
    depth: 0,
    saved: None,
});

/// Keeps `SIGUSR1`, `SIGUSR2` and `SIGPIPE` ignored while alive.
///
/// Guards nest: the first one saves the previous dispositions, the last one
/// dropped restores them. Dispositions are process-wide, so a guard may be
/// dropped on any thread. The signal mask is per thread and is left alone
/// here; workers block the signals for themselves with
/// [`block_worker_signals`].
#[must_use = "signals are restored when the guard is dropped"]
pub struct SignalGuard {
    _private: (),
}

impl SignalGuard {
    pub fn retain() -> io::Result<SignalGuard> {
        let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
        if state.depth == 0 {
            state.saved = Some(install()?);
            debug!("signal dispositions installed");
        }
        state.depth += 1;
        Ok(SignalGuard { _private: () })
    }

    /// Number of live guards in the process.
    pub fn depth() -> usize {
        STATE.lock().unwrap_or_else(PoisonError::into_inner).depth
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
        state.depth -= 1;
        if state.depth == 0 {
            if let Some(saved) = state.saved.take() {
                restore(&saved);
                debug!("signal dispositions restored");
            }
        }
    }
}

/// Block the managed signals on the calling thread only.
///
/// Called first thing on every worker thread; the mask goes away with the
/// thread, so the thread that started the queue keeps its own mask.
pub fn block_worker_signals() -> io::Result<()> {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        for signal in MANAGED_SIGNALS {
            libc::sigaddset(&mut mask, signal);
        }
        let res = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
        if res != 0 {
            return Err(io::Error::from_raw_os_error(res));
        }
    }
    Ok(())
}

fn install() -> io::Result<[libc::sigaction; 3]> {
    unsafe {
        let mut ignore: libc::sigaction = mem::zeroed();
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut ignore.sa_mask);

        let mut actions: [libc::sigaction; 3] = mem::zeroed();
        for (i, signal) in MANAGED_SIGNALS.iter().enumerate() {
            if libc::sigaction(*signal, &ignore, &mut actions[i]) < 0 {
                let err = io::Error::last_os_error();
                for (signal, action) in MANAGED_SIGNALS.iter().zip(&actions[..i]) {
                    libc::sigaction(*signal, action, ptr::null_mut());
                }
                return Err(err);
            }
        }
        Ok(actions)
    }
}

fn restore(saved: &[libc::sigaction; 3]) {
    unsafe {
        for (signal, action) in MANAGED_SIGNALS.iter().zip(saved.iter()) {
            if libc::sigaction(*signal, action, ptr::null_mut()) < 0 {
                warn!("failed to restore handler for signal {}: {}", signal, io::Error::last_os_error());
            }
        }
    }
}

/// Serializes tests that install the process-wide signal state.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sigpipe_ignored() -> bool {
        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGPIPE, ptr::null(), &mut current);
            current.sa_sigaction == libc::SIG_IGN
        }
    }

    fn sigpipe_blocked() -> bool {
        unsafe {
            let mut current: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut current);
            libc::sigismember(&current, libc::SIGPIPE) == 1
        }
    }

    #[test]
    fn test_nested_guards_restore_on_last_drop() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let before_ignored = sigpipe_ignored();
        let before_blocked = sigpipe_blocked();

        let outer = SignalGuard::retain().unwrap();
        assert_eq!(SignalGuard::depth(), 1);
        assert!(sigpipe_ignored());
        assert_eq!(sigpipe_blocked(), before_blocked);

        let inner = SignalGuard::retain().unwrap();
        assert_eq!(SignalGuard::depth(), 2);
        drop(inner);
        assert_eq!(SignalGuard::depth(), 1);
        assert!(sigpipe_ignored());

        drop(outer);
        assert_eq!(SignalGuard::depth(), 0);
        assert_eq!(sigpipe_ignored(), before_ignored);
        assert_eq!(sigpipe_blocked(), before_blocked);
    }

    #[test]
    fn test_guard_dropped_on_another_thread() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let before_ignored = sigpipe_ignored();
        let before_blocked = sigpipe_blocked();

        let guard = SignalGuard::retain().unwrap();
        let dropper_blocked = thread::spawn(move || {
            drop(guard);
            sigpipe_blocked()
        })
        .join()
        .unwrap();

        assert_eq!(SignalGuard::depth(), 0);
        assert_eq!(dropper_blocked, before_blocked);
        assert_eq!(sigpipe_blocked(), before_blocked);
        assert_eq!(sigpipe_ignored(), before_ignored);
    }

    #[test]
    fn test_worker_mask_stays_on_worker_thread() {
        let before_blocked = sigpipe_blocked();
        let worker_blocked = thread::spawn(|| {
            block_worker_signals().unwrap();
            sigpipe_blocked()
        })
        .join()
        .unwrap();

        assert!(worker_blocked);
        assert_eq!(sigpipe_blocked(), before_blocked);
    }
}
