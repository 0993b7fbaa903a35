//! Anonymous pipe creation and inheritable-descriptor passing.
//!
//! Each session gets five private pipes. The child-side ends are renumbered
//! to sequential descriptors starting at 3 (after stdio) inside a
//! `pre_exec` hook, and those numbers travel to the child as decimal
//! strings in its argument vector.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::{Error, Result};

/// First descriptor number handed to the child after stdio.
pub(crate) const FIRST_CHILD_FD: RawFd = 3;

/// One anonymous pipe; `read` and `write` are the two ends.
pub(crate) struct PipePair {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Create one anonymous pipe.
///
/// Both ends are close-on-exec: only the descriptors explicitly
/// renumbered by [`inherit_fds`] survive into the child. A leaked
/// parent-side write end would keep the one-shot pipes from ever
/// reaching EOF.
pub(crate) fn pipe_pair() -> Result<PipePair> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(target_os = "linux")]
    // SAFETY: fds points at a valid two-element array.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    // SAFETY: fds points at a valid two-element array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    #[cfg(not(target_os = "linux"))]
    for fd in fds {
        // SAFETY: fd was just returned by pipe(2).
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
    // SAFETY: pipe(2) returned two freshly created descriptors we own.
    unsafe {
        Ok(PipePair {
            read: OwnedFd::from_raw_fd(fds[0]),
            write: OwnedFd::from_raw_fd(fds[1]),
        })
    }
}

/// The five private pipes of one session, from the parent's point of view.
pub(crate) struct SessionPipes {
    /// Child writes results; parent reads.
    pub data_in: PipePair,
    /// Parent writes commands; child reads.
    pub data_out: PipePair,
    /// Child writes status objects; parent reads.
    pub status: PipePair,
    /// Secondary bootstrap script, written once and closed.
    pub bootstrap: PipePair,
    /// Serialized program, written once and closed.
    pub program: PipePair,
}

impl SessionPipes {
    pub fn create() -> Result<Self> {
        Ok(Self {
            data_in: pipe_pair()?,
            data_out: pipe_pair()?,
            status: pipe_pair()?,
            bootstrap: pipe_pair()?,
            program: pipe_pair()?,
        })
    }

    /// Child-side ends in inheritance order. The renumbered descriptors are
    /// `FIRST_CHILD_FD + index`.
    pub fn child_fds(&self) -> Vec<RawFd> {
        vec![
            self.data_in.write.as_raw_fd(),
            self.data_out.read.as_raw_fd(),
            self.status.write.as_raw_fd(),
            self.bootstrap.read.as_raw_fd(),
            self.program.read.as_raw_fd(),
        ]
    }
}

/// Install a `pre_exec` hook that remaps `fds` to sequential descriptors
/// starting at [`FIRST_CHILD_FD`], and return the child-side numbers as
/// decimal strings in the same order.
///
/// The hook first duplicates every source above the target window so a
/// source sitting inside `3..3+n` is never clobbered before it is staged,
/// then `dup2`s each staged copy down (which also clears close-on-exec).
pub(crate) fn inherit_fds(cmd: &mut tokio::process::Command, fds: &[RawFd]) -> Vec<String> {
    let sources: Vec<RawFd> = fds.to_vec();
    let count = sources.len() as RawFd;
    // SAFETY: the hook only calls async-signal-safe libc functions
    // (fcntl, dup2, close) on descriptors owned by the parent.
    unsafe {
        cmd.pre_exec(move || {
            let base = FIRST_CHILD_FD + count;
            let mut staged = Vec::with_capacity(sources.len());
            for &fd in &sources {
                let dup = libc::fcntl(fd, libc::F_DUPFD, base);
                if dup < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                staged.push(dup);
            }
            for (i, &fd) in staged.iter().enumerate() {
                let target = FIRST_CHILD_FD + i as RawFd;
                if libc::dup2(fd, target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(fd);
            }
            Ok(())
        });
    }
    (0..fds.len())
        .map(|i| (FIRST_CHILD_FD + i as RawFd).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe_pair_transfers_bytes() {
        let pair = pipe_pair().unwrap();
        let mut writer = std::fs::File::from(pair.write);
        let mut reader = std::fs::File::from(pair.read);

        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_session_pipes_order() {
        let pipes = SessionPipes::create().unwrap();
        let fds = pipes.child_fds();
        assert_eq!(fds.len(), 5);
        assert_eq!(fds[0], pipes.data_in.write.as_raw_fd());
        assert_eq!(fds[3], pipes.bootstrap.read.as_raw_fd());
    }

    #[tokio::test]
    async fn test_inherit_fds_renumbers_from_three() {
        // `cat` of /dev/fd/3 sees whatever was remapped onto descriptor 3.
        let pair = pipe_pair().unwrap();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "cat <&3"]);
        let numbers = inherit_fds(&mut cmd, &[pair.read.as_raw_fd()]);
        assert_eq!(numbers, vec!["3".to_string()]);
        cmd.stdout(std::process::Stdio::piped());

        let child = cmd.spawn().unwrap();
        let mut writer = std::fs::File::from(pair.write);
        drop(pair.read);
        writer.write_all(b"relayed").unwrap();
        drop(writer);

        let output = child.wait_with_output().await.unwrap();
        assert_eq!(output.stdout, b"relayed");
    }
}
