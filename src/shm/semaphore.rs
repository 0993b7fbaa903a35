//! Named counting semaphores for cross-process synchronization.
//!
//! Maps to POSIX named semaphores. Names follow the POSIX leading-slash
//! convention and are normalized on the way in. macOS lacks
//! `sem_timedwait`, so timed acquisition polls `sem_trywait` there.

use std::ffi::CString;
use std::time::Duration;

use crate::{Error, Result};

/// A cross-process counting semaphore identified by name.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    closed: bool,
}

// Safety: POSIX named semaphores are process-shared kernel objects; the
// handle itself is just a pointer the libc calls accept from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn normalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Semaphore(format!("invalid semaphore name {name:?}")))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl NamedSemaphore {
    /// Create (or open, when it already exists) a named semaphore with the
    /// given initial value.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let name = normalize(name);
        let cname = c_name(&name)?;
        // SAFETY: cname is a valid NUL-terminated string; the extra
        // variadic arguments match the O_CREAT contract of sem_open.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o644 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::Semaphore(format!(
                "failed to create semaphore {name:?}: errno {}",
                last_errno()
            )));
        }
        Ok(Self {
            sem,
            name,
            closed: false,
        })
    }

    /// Open an existing named semaphore.
    pub fn open(name: &str) -> Result<Self> {
        let name = normalize(name);
        let cname = c_name(&name)?;
        // SAFETY: cname is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Error::Semaphore(format!(
                "failed to open semaphore {name:?}: errno {}",
                last_errno()
            )));
        }
        Ok(Self {
            sem,
            name,
            closed: false,
        })
    }

    /// Semaphore name, normalized.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the semaphore can be decremented.
    pub fn acquire(&self) -> Result<()> {
        loop {
            // SAFETY: self.sem is a live semaphore handle.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            if last_errno() == libc::EINTR {
                continue;
            }
            return Err(Error::Semaphore(format!(
                "failed to acquire semaphore {:?}",
                self.name
            )));
        }
    }

    /// Increment the semaphore.
    pub fn release(&self) -> Result<()> {
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(Error::Semaphore(format!(
                "failed to release semaphore {:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// Decrement without blocking; returns whether the acquire succeeded.
    pub fn try_acquire(&self) -> Result<bool> {
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match last_errno() {
            libc::EAGAIN => Ok(false),
            libc::EINTR => Ok(false),
            _ => Err(Error::Semaphore(format!(
                "failed to try-acquire semaphore {:?}",
                self.name
            ))),
        }
    }

    /// Block up to `timeout` for an acquire; returns whether it succeeded.
    #[cfg(not(target_os = "macos"))]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: now points at a valid timespec.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(Error::Semaphore("clock_gettime failed".to_string()));
        }
        let mut deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
        };
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }
        loop {
            // SAFETY: self.sem is live and deadline is a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            match last_errno() {
                libc::ETIMEDOUT => return Ok(false),
                libc::EINTR => continue,
                _ => {
                    return Err(Error::Semaphore(format!(
                        "failed timed acquire on semaphore {:?}",
                        self.name
                    )))
                }
            }
        }
    }

    /// Block up to `timeout` for an acquire; returns whether it succeeded.
    ///
    /// The platform library lacks `sem_timedwait`, so this polls.
    #[cfg(target_os = "macos")]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Close this handle. The name stays in the system until unlinked.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // SAFETY: self.sem is a live semaphore handle, closed exactly once.
        if unsafe { libc::sem_close(self.sem) } != 0 {
            return Err(Error::Semaphore(format!(
                "failed to close semaphore {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .finish()
    }
}

/// Remove a semaphore name from the system.
pub fn unlink(name: &str) -> Result<()> {
    let name = normalize(name);
    let cname = c_name(&name)?;
    // SAFETY: cname is a valid NUL-terminated string.
    if unsafe { libc::sem_unlink(cname.as_ptr()) } != 0 {
        return Err(Error::Semaphore(format!(
            "failed to remove semaphore {name:?}: errno {}",
            last_errno()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::unique_name;

    #[test]
    fn test_counting_semantics() {
        let name = unique_name("sem");
        let sem = NamedSemaphore::create(&name, 2).unwrap();

        assert!(sem.try_acquire().unwrap());
        assert!(sem.try_acquire().unwrap());
        assert!(!sem.try_acquire().unwrap());

        sem.release().unwrap();
        assert!(sem.try_acquire().unwrap());

        drop(sem);
        unlink(&name).unwrap();
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let name = unique_name("semto");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        let start = std::time::Instant::now();
        assert!(!sem.acquire_timeout(Duration::from_millis(100)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(90));

        sem.release().unwrap();
        assert!(sem.acquire_timeout(Duration::from_millis(100)).unwrap());

        drop(sem);
        unlink(&name).unwrap();
    }

    #[test]
    fn test_open_shares_count_with_creator() {
        let name = unique_name("semshare");
        let creator = NamedSemaphore::create(&name, 0).unwrap();
        let opener = NamedSemaphore::open(&name).unwrap();

        opener.release().unwrap();
        assert!(creator.acquire_timeout(Duration::from_secs(1)).unwrap());

        drop(opener);
        drop(creator);
        unlink(&name).unwrap();
    }

    #[test]
    fn test_unlink_missing_name_fails() {
        assert!(unlink(&unique_name("missing")).is_err());
    }
}
