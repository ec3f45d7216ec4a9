// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    time,
};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use tracing::{instrument, warn};

/// The bound on every fence wait in the composer.
pub const FENCE_TIMEOUT: time::Duration = time::Duration::from_secs(3);

/// A sync_file fence. It becomes readable when the operation it tracks has
/// completed.
#[derive(Debug)]
pub struct Fence(OwnedFd);

impl Fence {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self(self.0.try_clone()?))
    }

    pub fn into_fd(self) -> OwnedFd {
        self.0
    }

    /// Waits for the fence to signal. Returns false if the timeout elapsed
    /// first.
    pub fn wait(&self, timeout: time::Duration) -> io::Result<bool> {
        let mut pollfd = [PollFd::new(&self.0, PollFlags::IN)];
        let deadline = time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match poll(&mut pollfd, remaining.as_millis() as _) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = pollfd[0].revents();
                    if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "fence is in an error state",
                        ));
                    }

                    return Ok(true);
                }
                Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for Fence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

/// Waits on a fence with the standard timeout. Timeouts and errors are
/// logged, never returned, so a stuck producer can't wedge a display.
#[instrument(level = "trace", skip_all)]
pub fn wait_logged(fence: Option<&Fence>, what: &str) {
    let Some(fence) = fence else {
        return;
    };

    match fence.wait(FENCE_TIMEOUT) {
        Ok(true) => (),
        Ok(false) => warn!(
            timeout_ms = FENCE_TIMEOUT.as_millis() as u64,
            "timed out waiting for {what} fence"
        ),
        Err(err) => warn!(?err, "failed to wait for {what} fence"),
    }
}

/// Produces an already-signalled fence. Used where a producer has nothing
/// to wait on but a consumer expects a fence.
pub fn signalled() -> io::Result<Fence> {
    let fd = rustix::event::eventfd(1, rustix::event::EventfdFlags::CLOEXEC)?;
    Ok(Fence(fd))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signalled_fence_is_ready() {
        let fence = signalled().unwrap();
        assert!(fence.wait(time::Duration::from_millis(10)).unwrap());

        let clone = fence.try_clone().unwrap();
        assert!(clone.wait(time::Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn unsignalled_fence_times_out() {
        let fd = rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC).unwrap();
        let fence = Fence::new(fd);

        let start = time::Instant::now();
        assert!(!fence.wait(time::Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= time::Duration::from_millis(20));
    }

    #[test_log::test]
    fn wait_logged_tolerates_missing_fence() {
        wait_logged(None, "test");
        wait_logged(Some(&signalled().unwrap()), "test");
    }
}
