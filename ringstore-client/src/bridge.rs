//! Moving object bytes between descriptors.
//!
//! [`Transfer`] copies a response body from the socket into a host
//! descriptor. [`BufferedBridge`] goes through a user-space buffer; on Linux
//! [`SpliceBridge`] moves pages socket → pipe → destination with `splice(2)`
//! and never copies them into user space. Both report errors the same way,
//! so callers don't care which one they got.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;

use tracing::{info, warn};

const BUFFER_SIZE: usize = 64 * 1024;

pub trait ReadDescriptor: Read + AsFd {}
impl<T: Read + AsFd> ReadDescriptor for T {}

pub trait WriteDescriptor: Write + AsFd {}
impl<T: Write + AsFd> WriteDescriptor for T {}

/// Where a transfer failed and how far it got. A source failure is the
/// remote side's problem; a destination failure is the host's.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("reading source after {transferred} bytes: {source}")]
    Read { source: io::Error, transferred: u64 },
    #[error("writing destination after {transferred} bytes: {source}")]
    Write { source: io::Error, transferred: u64 },
}

impl TransferError {
    pub fn transferred(&self) -> u64 {
        match self {
            TransferError::Read { transferred, .. } | TransferError::Write { transferred, .. } => {
                *transferred
            }
        }
    }
}

pub trait Transfer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Copy exactly `len` bytes, or everything up to EOF when `len` is
    /// `None`. EOF before `len` bytes is an `UnexpectedEof` read error.
    fn transfer(
        &self,
        src: &mut dyn ReadDescriptor,
        dst: &mut dyn WriteDescriptor,
        len: Option<u64>,
    ) -> Result<u64, TransferError>;
}

fn short_source(len: u64, transferred: u64) -> TransferError {
    TransferError::Read {
        source: io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {transferred} of {len} bytes"),
        ),
        transferred,
    }
}

#[derive(Debug, Default)]
pub struct BufferedBridge;

impl BufferedBridge {
    fn copy<R, W>(
        src: &mut R,
        dst: &mut W,
        len: Option<u64>,
        already: u64,
    ) -> Result<u64, TransferError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = already;
        loop {
            let want = match len {
                Some(len) if total >= len => break,
                Some(len) => (len - total).min(BUFFER_SIZE as u64) as usize,
                None => BUFFER_SIZE,
            };
            let n = match src.read(&mut buf[..want]) {
                Ok(0) => match len {
                    Some(len) => return Err(short_source(len, total)),
                    None => break,
                },
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(TransferError::Read { source, transferred: total }),
            };
            dst.write_all(&buf[..n])
                .map_err(|source| TransferError::Write { source, transferred: total })?;
            total += n as u64;
        }
        Ok(total)
    }
}

impl Transfer for BufferedBridge {
    fn name(&self) -> &'static str {
        "buffered"
    }

    fn transfer(
        &self,
        src: &mut dyn ReadDescriptor,
        dst: &mut dyn WriteDescriptor,
        len: Option<u64>,
    ) -> Result<u64, TransferError> {
        Self::copy(src, dst, len, 0)
    }
}

#[cfg(target_os = "linux")]
pub use splice::SpliceBridge;

#[cfg(target_os = "linux")]
mod splice {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::ptr;
    use std::sync::OnceLock;

    use tracing::debug;

    use super::{
        short_source, BufferedBridge, ReadDescriptor, Transfer, TransferError, WriteDescriptor,
        BUFFER_SIZE,
    };

    const PIPE_MAX_SIZE_PATH: &str = "/proc/sys/fs/pipe-max-size";

    struct Pipe {
        read: OwnedFd,
        write: OwnedFd,
        capacity: usize,
    }

    fn pipe_max_size() -> Option<libc::c_int> {
        std::fs::read_to_string(PIPE_MAX_SIZE_PATH)
            .ok()
            .and_then(|s| s.trim().parse::<libc::c_int>().ok())
            .filter(|&n| n > 0)
    }

    impl Pipe {
        fn new() -> io::Result<Self> {
            let mut fds: [libc::c_int; 2] = [0; 2];
            if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
            if let Some(max) = pipe_max_size() {
                // Unprivileged processes may be capped lower; keep the default then.
                unsafe { libc::fcntl(write.as_raw_fd(), libc::F_SETPIPE_SZ, max) };
            }
            let capacity = unsafe { libc::fcntl(write.as_raw_fd(), libc::F_GETPIPE_SZ) };
            let capacity = if capacity > 0 { capacity as usize } else { BUFFER_SIZE };
            Ok(Self { read, write, capacity })
        }
    }

    fn splice(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::splice(
                    from,
                    ptr::null_mut(),
                    to,
                    ptr::null_mut(),
                    len,
                    libc::SPLICE_F_MOVE | libc::SPLICE_F_MORE,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // SO_RCVTIMEO / SO_SNDTIMEO expired.
                io::ErrorKind::WouldBlock => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "splice timed out"))
                }
                _ => return Err(err),
            }
        }
    }

    /// Whether `splice(2)` works here (it may be filtered by a sandbox).
    pub fn available() -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(probe_splice)
    }

    fn probe_splice() -> bool {
        let (Ok(a), Ok(b)) = (Pipe::new(), Pipe::new()) else {
            return false;
        };
        let mut writer = File::from(a.write);
        if writer.write_all(b"x").is_err() {
            return false;
        }
        matches!(splice(a.read.as_raw_fd(), b.write.as_raw_fd(), 1), Ok(1))
    }

    #[derive(Debug, Default)]
    pub struct SpliceBridge;

    impl Transfer for SpliceBridge {
        fn name(&self) -> &'static str {
            "splice"
        }

        fn transfer(
            &self,
            src: &mut dyn ReadDescriptor,
            dst: &mut dyn WriteDescriptor,
            len: Option<u64>,
        ) -> Result<u64, TransferError> {
            let pipe = Pipe::new().map_err(|source| TransferError::Read { source, transferred: 0 })?;
            let src_fd = src.as_fd().as_raw_fd();
            let dst_fd = dst.as_fd().as_raw_fd();
            let mut total = 0u64;

            loop {
                let want = match len {
                    Some(len) if total >= len => break,
                    Some(len) => (len - total).min(pipe.capacity as u64) as usize,
                    None => pipe.capacity,
                };
                let n = splice(src_fd, pipe.write.as_raw_fd(), want)
                    .map_err(|source| TransferError::Read { source, transferred: total })?;
                if n == 0 {
                    match len {
                        Some(len) => return Err(short_source(len, total)),
                        None => break,
                    }
                }

                let mut in_pipe = n;
                while in_pipe > 0 {
                    match splice(pipe.read.as_raw_fd(), dst_fd, in_pipe) {
                        Ok(0) => {
                            return Err(TransferError::Write {
                                source: io::ErrorKind::WriteZero.into(),
                                transferred: total,
                            })
                        }
                        Ok(m) => {
                            in_pipe -= m;
                            total += m as u64;
                        }
                        // The destination has no splice support (e.g. some
                        // character devices): finish with plain copies.
                        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                            debug!("Destination refuses splice, continuing with buffered copies");
                            let mut pipe_out = File::from(pipe.read);
                            let mut staged = vec![0u8; in_pipe];
                            pipe_out
                                .read_exact(&mut staged)
                                .map_err(|source| TransferError::Read { source, transferred: total })?;
                            dst.write_all(&staged)
                                .map_err(|source| TransferError::Write { source, transferred: total })?;
                            total += in_pipe as u64;
                            return BufferedBridge::copy(src, dst, len, total);
                        }
                        Err(source) => return Err(TransferError::Write { source, transferred: total }),
                    }
                }
            }
            Ok(total)
        }
    }
}

/// Pick the transfer strategy for this process.
pub fn select(zero_copy: bool) -> Arc<dyn Transfer> {
    if zero_copy {
        #[cfg(target_os = "linux")]
        {
            if splice::available() {
                info!("Zero-copy reads enabled (splice)");
                return Arc::new(SpliceBridge);
            }
        }
        warn!("zero_copy requested but splice is unavailable, using buffered copies");
    }
    Arc::new(BufferedBridge)
}
