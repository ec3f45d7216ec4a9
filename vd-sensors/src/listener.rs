// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{
    collections::BTreeMap,
    io,
    os::fd::AsRawFd as _,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use mio::unix::SourceFd;
use tracing::{debug, error, info, trace};
use uds::nonblocking::{UnixSeqpacketConn, UnixSeqpacketListener};

use crate::{
    error::Result,
    wire::{SensorEvent, SensorStatePacket},
    SensorCore,
};

const LISTENER: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);
const FIRST_CONNECTION: usize = 2;

/// Messages to the listener thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    /// Forward the state of a sensor to every remote.
    SensorStateUpdate(i32),
    ThreadStop,
}

#[derive(Clone)]
pub(crate) struct ControlSender {
    waker: Arc<mio::Waker>,
    sender: crossbeam_channel::Sender<ControlMessage>,
}

impl ControlSender {
    pub(crate) fn send(&self, msg: ControlMessage) -> io::Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "listener exited"))?;
        self.waker.wake()
    }
}

/// Accepts remote connections on a seqpacket socket and injects the events
/// they send into a [`SensorCore`]. The thread stops when this is closed or
/// dropped.
pub struct Listener {
    core: Arc<SensorCore>,
    control: ControlSender,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl Listener {
    pub fn bind(core: Arc<SensorCore>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => (),
        }

        let socket = UnixSeqpacketListener::bind(&path)?;
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            LISTENER,
            mio::Interest::READABLE,
        )?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let control = ControlSender { waker, sender };

        let handle = {
            let core = core.clone();
            std::thread::Builder::new()
                .name("sensor listener".to_owned())
                .spawn(move || {
                    if let Err(e) = receive(&core, poll, socket, receiver) {
                        error!("sensor listener exited: {e}");
                    }
                })?
        };

        core.set_control(Some(control.clone()));
        info!(?path, "listening for sensor connections");

        Ok(Self {
            core,
            control,
            handle: Some(handle),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.core.set_control(None);
        if let Err(e) = self.control.send(ControlMessage::ThreadStop) {
            error!("could not stop sensor listener: {e}");
        }

        if handle.join().is_err() {
            error!("sensor listener panicked");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn receive(
    core: &SensorCore,
    mut poll: mio::Poll,
    socket: UnixSeqpacketListener,
    control: crossbeam_channel::Receiver<ControlMessage>,
) -> io::Result<()> {
    let mut events = mio::Events::with_capacity(64);
    let mut connections: BTreeMap<mio::Token, UnixSeqpacketConn> = BTreeMap::new();
    let mut next_token = FIRST_CONNECTION;
    let mut buf = [0; 256];

    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => loop {
                    let conn = match socket.accept_unix_addr() {
                        Ok((conn, _)) => conn,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    };

                    let token = mio::Token(next_token);
                    next_token += 1;

                    poll.registry().register(
                        &mut SourceFd(&conn.as_raw_fd()),
                        token,
                        mio::Interest::READABLE,
                    )?;

                    info!(connection = token.0, "new sensor remote connected");
                    connections.insert(token, conn);
                },
                WAKER => {
                    for msg in control.try_iter() {
                        match msg {
                            ControlMessage::ThreadStop => {
                                debug!("received terminate control message");
                                return Ok(());
                            }
                            ControlMessage::SensorStateUpdate(handle) => {
                                forward_state(core, handle, &connections)
                            }
                        }
                    }
                }
                token => {
                    let Some(conn) = connections.get(&token) else {
                        continue;
                    };

                    if !drain_events(core, conn, &mut buf) {
                        if let Some(conn) = connections.remove(&token) {
                            poll.registry()
                                .deregister(&mut SourceFd(&conn.as_raw_fd()))?;
                        }
                    }
                }
            }
        }
    }
}

/// Reads every pending packet from a remote. Returns false if the
/// connection should be dropped.
fn drain_events(core: &SensorCore, conn: &UnixSeqpacketConn, buf: &mut [u8]) -> bool {
    loop {
        let len = match conn.recv(buf) {
            Ok(0) => {
                info!("sensor remote disconnected");
                return false;
            }
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("failed to receive sensor message: {e}");
                return false;
            }
        };

        let event = match SensorEvent::decode(&buf[..len]) {
            Ok(event) => event,
            Err(e) => {
                error!(len, "malformed sensor message: {e}");
                return false;
            }
        };

        trace!(sensor = event.sensor, value = ?&event.data[..3], "received sensor event");
        if let Err(e) = core.inject(event) {
            error!("remote sent an invalid sensor event: {e}");
            return false;
        }
    }
}

fn forward_state(
    core: &SensorCore,
    handle: i32,
    connections: &BTreeMap<mio::Token, UnixSeqpacketConn>,
) {
    let mut buf = [0; SensorStatePacket::ENCODED_LEN];
    if let Err(e) = core
        .state_packet(handle)
        .and_then(|packet| packet.encode(&mut buf))
    {
        error!(handle, "could not encode sensor state: {e}");
        return;
    }

    for conn in connections.values() {
        if let Err(e) = conn.send(&buf) {
            error!(handle, "could not send sensor state: {e}");
        }
    }
}
