//! Counting semaphore over the POSIX primitive.
//!
//! Thin wrapper with the usual contract: `post` increments, `wait`
//! blocks until it can decrement, `try_wait` never blocks. A semaphore
//! must not be moved while other threads wait on it; the substrate
//! only moves semaphores during construction, before sharing.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use grit_lib::log::SystemTag;
use grit_lib::{fatal_cleanup_and_exit, log_fatal};

pub struct Semaphore {
    inner: UnsafeCell<libc::sem_t>,
}

// SAFETY: sem_t is designed for concurrent use from multiple threads.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

fn sem_failure(op: &str) -> ! {
    log_fatal!(
        SystemTag::System,
        "semaphore {} failed: {}",
        op,
        std::io::Error::last_os_error()
    );
    fatal_cleanup_and_exit();
}

impl Semaphore {
    /// Create a semaphore holding `value` permits.
    pub fn new(value: u32) -> Self {
        let mut sem = MaybeUninit::<libc::sem_t>::uninit();
        if unsafe { libc::sem_init(sem.as_mut_ptr(), 0, value) } == -1 {
            sem_failure("init");
        }
        Self {
            inner: UnsafeCell::new(unsafe { sem.assume_init() }),
        }
    }

    /// Release one permit, waking a waiter if any.
    pub fn post(&self) {
        if unsafe { libc::sem_post(self.inner.get()) } == -1 {
            sem_failure("post");
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => sem_failure("wait"),
            }
        }
    }

    /// Take a permit if one is available. Returns false otherwise.
    pub fn try_wait(&self) -> bool {
        if unsafe { libc::sem_trywait(self.inner.get()) } == 0 {
            return true;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => false,
            _ => sem_failure("trywait"),
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // Destroying a semaphore with active waiters is caller error
        // under the POSIX contract; nothing to recover here.
        unsafe {
            libc::sem_destroy(self.inner.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_wait_counts_permits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || {
            sem2.wait();
            1u32
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        assert_eq!(handle.join().unwrap(), 1);
    }
}
