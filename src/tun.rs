//! TUN character device access.
//!
//! Opens `/dev/net/tun`, binds a named interface in `IFF_TUN | IFF_NO_PI`
//! mode, and exposes it as an async packet source/sink for the stack driver.
//! One read yields one IP packet of at most MTU bytes; one vectored write
//! emits one IP packet gathered from a packet-buffer chain.

use std::future::Future;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Asynchronous packet I/O, implemented by the real TUN device and by
/// in-memory test doubles.
pub trait PacketIo: Send + 'static {
    /// Read one packet into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write one packet gathered from `bufs`, returning the bytes written.
    fn send_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
    ) -> impl Future<Output = io::Result<usize>> + Send;
}

/// A TUN interface bound to `/dev/net/tun`.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Open `/dev/net/tun` and bind the named interface.
    ///
    /// Failures here are setup-fatal: the caller is expected to abort the
    /// process, there is no proxying without a packet path.
    pub fn open(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(Error::Tun(format!("invalid interface name: {:?}", name)));
        }

        let raw = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(Error::Tun(format!(
                "open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }
        // Owned from here on; closed on any subsequent error path.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = IfReq {
            name: [0u8; IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        ifr.name[..name.len()].copy_from_slice(name.as_bytes());

        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut ifr as *mut IfReq) };
        if rc < 0 {
            return Err(Error::Tun(format!(
                "ioctl TUNSETIFF {}: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        let fd = AsyncFd::new(fd).map_err(|e| Error::Tun(format!("register fd: {}", e)))?;

        tracing::info!("{} opened", name);

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Interface name as bound by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketIo for TunDevice {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let res = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
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
            match res {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let res = guard.try_io(|inner| {
                // IoSlice is ABI-compatible with iovec.
                let n = unsafe {
                    libc::writev(
                        inner.get_ref().as_raw_fd(),
                        bufs.as_ptr() as *const libc::iovec,
                        bufs.len() as libc::c_int,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
