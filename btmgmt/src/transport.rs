//! Byte transport to the kernel's management control channel.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::AdapterConfig;
use crate::MgmtError;

// Linux BlueZ socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_DEV_NONE: u16 = 0xffff;
const HCI_CHANNEL_CONTROL: u16 = 3;

/// How often a blocked reader checks whether the socket was closed.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Duplex frame channel the engine runs on.
///
/// `receive` blocks until one whole frame is available and returns `None`
/// once the channel has been closed.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> Result<(), MgmtError>;
    fn is_connected(&self) -> bool;
    fn send(&self, frame: &[u8]) -> Result<(), MgmtError>;
    fn receive(&self) -> Result<Option<Vec<u8>>, MgmtError>;
    fn close(&self);
}

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

fn bind_hci(socket: &Socket, dev_id: u16, channel: u16) -> io::Result<()> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: channel,
    };
    // SAFETY: bind() with a valid fd and a sockaddr of the size passed
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Management socket: raw HCI socket bound to the control channel.
///
/// The control channel is not tied to one controller; commands pick their
/// controller through the frame header.
pub struct MgmtSocket {
    socket: RwLock<Option<Arc<Socket>>>,
    closed: AtomicBool,
    buffer_size: usize,
}

impl Default for MgmtSocket {
    fn default() -> Self {
        Self::from_config(&AdapterConfig::default())
    }
}

impl MgmtSocket {
    /// Socket reading inbound frames into `config.receive_buffer_size` bytes.
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(config.receive_buffer_size)
    }

    pub fn new(buffer_size: usize) -> Self {
        Self {
            socket: RwLock::new(None),
            closed: AtomicBool::new(false),
            buffer_size,
        }
    }

    fn open() -> io::Result<Socket> {
        let socket = Socket::new(Domain::from(AF_BLUETOOTH), Type::RAW, Some(Protocol::from(BTPROTO_HCI)))?;
        socket.set_cloexec(true)?;
        bind_hci(&socket, HCI_DEV_NONE, HCI_CHANNEL_CONTROL)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(socket)
    }

    fn current(&self) -> Option<Arc<Socket>> {
        match self.socket.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Transport for MgmtSocket {
    fn connect(&self) -> Result<(), MgmtError> {
        let mut guard = match self.socket.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return Ok(());
        }

        let socket = Self::open().map_err(|e| {
            if e.raw_os_error() == Some(libc::EPERM) || e.raw_os_error() == Some(libc::EACCES) {
                warn!("management socket needs CAP_NET_ADMIN: {}", e);
            } else {
                warn!("cannot open management socket: {}", e);
            }
            MgmtError::Transport(e)
        })?;
        info!("management socket connected");
        self.closed.store(false, Ordering::SeqCst);
        *guard = Some(Arc::new(socket));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn send(&self, frame: &[u8]) -> Result<(), MgmtError> {
        let socket = self.current().ok_or(MgmtError::NotConnected)?;
        trace!("send {} bytes", frame.len());
        // one write per frame, the kernel rejects partial frames
        let written = (&*socket).write(frame)?;
        if written != frame.len() {
            return Err(MgmtError::Transport(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, frame.len()),
            )));
        }
        Ok(())
    }

    fn receive(&self) -> Result<Option<Vec<u8>>, MgmtError> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let Some(socket) = self.current() else {
                return Ok(None);
            };

            match (&*socket).read(&mut buf) {
                Ok(0) => {
                    debug!("management socket reached end of stream");
                    return Ok(None);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MgmtError::Transport(e)),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let socket = match self.socket.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(socket) = socket {
            // not every kernel supports shutdown on HCI sockets; the poll interval covers that
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!("shutdown: {}", e);
            }
            info!("management socket closed");
        }
    }
}
