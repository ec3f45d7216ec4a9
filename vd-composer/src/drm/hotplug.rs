// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    io,
    os::fd::{AsRawFd as _, OwnedFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use nix::{
    errno::Errno,
    sys::socket::{
        bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
    },
};
use tracing::{debug, error, trace, warn};

const UEVENT: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

/// Returns true if a kernel uevent announces a DRM hotplug.
pub fn is_drm_hotplug(msg: &[u8]) -> bool {
    let mut drm_minor = false;
    let mut hotplug = false;
    for field in msg.split(|b| *b == 0) {
        match field {
            b"DEVTYPE=drm_minor" => drm_minor = true,
            b"HOTPLUG=1" => hotplug = true,
            _ => (),
        }
    }

    drm_minor && hotplug
}

fn open_uevent_socket() -> io::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        SockProtocol::NetlinkKObjectUEvent,
    )?;

    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 1))?;
    Ok(fd)
}

/// Listens for kernel uevents on a background thread, and invokes a callback
/// for each DRM hotplug event.
pub struct HotplugListener {
    waker: Arc<mio::Waker>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HotplugListener {
    pub fn spawn<F>(on_hotplug: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (ready_send, ready_recv) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_clone = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("drm hotplug".to_string())
            .spawn(move || {
                let setup = || -> io::Result<_> {
                    let fd = open_uevent_socket()?;
                    let poll = mio::Poll::new()?;
                    poll.registry().register(
                        &mut mio::unix::SourceFd(&fd.as_raw_fd()),
                        UEVENT,
                        mio::Interest::READABLE,
                    )?;

                    let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);
                    Ok((fd, poll, waker))
                };

                let (fd, poll) = match setup() {
                    Ok((fd, poll, waker)) => {
                        if ready_send.send(Ok(waker)).is_err() {
                            return;
                        }

                        (fd, poll)
                    }
                    Err(err) => {
                        let _ = ready_send.send(Err(err));
                        return;
                    }
                };

                listen(fd, poll, shutdown_clone, on_hotplug);
            })?;

        let waker = match ready_recv.recv() {
            Ok(res) => res?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "hotplug thread exited unexpectedly",
                ))
            }
        };

        debug!("listening for DRM hotplug events");
        Ok(Self {
            waker,
            shutdown,
            handle: Some(handle),
        })
    }
}

fn listen<F: Fn()>(fd: OwnedFd, mut poll: mio::Poll, shutdown: Arc<AtomicBool>, on_hotplug: F) {
    let mut events = mio::Events::with_capacity(16);
    let mut buf = vec![0_u8; 4096];

    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            error!(%err, "hotplug listener failed");
            return;
        }

        for event in events.iter() {
            match event.token() {
                WAKER => {
                    if shutdown.load(Ordering::Acquire) {
                        trace!("hotplug listener shutting down");
                        return;
                    }
                }
                UEVENT => loop {
                    match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                        Ok(n) if is_drm_hotplug(&buf[..n]) => {
                            debug!("received DRM hotplug event");
                            on_hotplug();
                        }
                        Ok(_) => (),
                        Err(Errno::EAGAIN) => break,
                        Err(Errno::EINTR) => continue,
                        Err(err) => {
                            warn!(%err, "failed to read uevent");
                            break;
                        }
                    }
                },
                _ => unreachable!(),
            }
        }
    }
}

impl Drop for HotplugListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            error!(%err, "failed to wake hotplug listener");
            return;
        }

        if let Some(handle) = self.handle.take() {
            // The last reference can be dropped from the callback itself.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                error!("hotplug listener panicked");
            }
        }
    }
}
