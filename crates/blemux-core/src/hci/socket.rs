//! Raw HCI socket transport (Linux).
//!
//! Opens an `AF_BLUETOOTH`/`BTPROTO_HCI` socket bound to `hci<N>` on the raw
//! channel, with the kernel filter narrowed to Command Complete and Command
//! Status events. The socket is non-blocking and driven by
//! [`tokio::io::unix::AsyncFd`].
//!
//! Opening the raw channel requires `CAP_NET_RAW` (or root).

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::{EVT_CMD_COMPLETE, EVT_CMD_STATUS, HCI_EVENT_PKT, HciTransport};
use crate::error::{Result, TransportError};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

/// Largest HCI event packet: indicator, code, length, 255 parameter bytes.
const MAX_EVENT_LEN: usize = 3 + 255;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// A raw HCI socket bound to one controller.
#[derive(Debug)]
pub struct HciSocket {
    fd: AsyncFd<OwnedFd>,
    device: u16,
}

impl HciSocket {
    /// Open and bind the raw socket for `hci<device>`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(device: u16) -> std::result::Result<Self, TransportError> {
        let name = format!("hci{}", device);
        let open_err = |source: io::Error| TransportError::Open {
            device: name.clone(),
            source,
        };

        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if raw < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: device,
            hci_channel: HCI_CHANNEL_RAW,
        };
        // SAFETY: `addr` is a valid sockaddr_hci and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const libc::sockaddr,
                size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        let filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask: [(1 << EVT_CMD_COMPLETE) | (1 << EVT_CMD_STATUS), 0],
            opcode: 0,
        };
        // SAFETY: `filter` matches the kernel's struct hci_filter layout.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const libc::c_void,
                size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        let fd = AsyncFd::new(fd).map_err(open_err)?;
        debug!("opened raw HCI socket on {}", name);
        Ok(Self { fd, device })
    }

    /// Controller index this socket is bound to.
    pub fn device(&self) -> u16 {
        self.device
    }
}

#[async_trait]
impl HciTransport for HciSocket {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let written = guard.try_io(|inner| {
                // SAFETY: `frame` is a valid slice for the duration of the call.
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match written {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(TransportError::MalformedFrame(format!(
                        "short write: {} of {} bytes",
                        n,
                        frame.len()
                    ))
                    .into());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_frame(&mut self) -> Result<Bytes> {
        let mut buf = [0u8; MAX_EVENT_LEN];
        loop {
            let mut guard = self.fd.readable().await?;
            let read = guard.try_io(|inner| {
                // SAFETY: `buf` is valid for writes of its full length.
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match read {
                Ok(Ok(0)) => return Err(TransportError::Closed.into()),
                Ok(Ok(n)) => return Ok(Bytes::copy_from_slice(&buf[..n])),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}
