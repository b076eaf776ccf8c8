//! Blocking-shaped I/O operations over an io_uring completion queue.
//!
//! A dedicated driver thread owns the ring. Every public operation packages
//! the resources the kernel will touch into an [`Op`], hands it to the
//! driver together with a freshly allocated oneshot channel, and awaits that
//! channel. The driver correlates each CQE back to its submission through the
//! `user_data` key and delivers exactly one completion per submission; the
//! channel is consumed by that single delivery and never reused.

use std::{
    collections::{HashMap, VecDeque},
    ffi::CString,
    io,
    net::SocketAddr,
    os::fd::{IntoRawFd, RawFd},
    os::unix::ffi::OsStrExt,
    path::Path,
    thread,
};

use io_uring::{opcode, squeue, types, IoUring};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};

use crate::Result;

/// Submission-queue depth, matching the rings the original deployment ran
/// with. Overflow spills into a driver-side backlog rather than failing.
pub const DEFAULT_QUEUE_DEPTH: u32 = 32;

/// `user_data` key reserved for the eventfd read that wakes the driver.
const WAKE_TOKEN: u64 = 0;
/// `user_data` key for cancellation sweeps issued during shutdown.
const CANCEL_TOKEN: u64 = u64::MAX;

#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    #[error("failed to set up reactor: {0}")]
    Setup(#[source] io::Error),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("reactor is shut down")]
    Closed,
}

/// An asynchronous request plus every resource the kernel needs while it is
/// in flight. The descriptor is moved to the driver at submission time,
/// parked in the pending map until its completion arrives, and handed back
/// to the caller with the CQE result, so buffers stay alive even if the
/// awaiting future is dropped mid-operation.
enum Op {
    Connect { fd: RawFd, addr: Box<RawSockAddr> },
    Open { path: CString },
    StatSize { fd: RawFd, path: CString, statx: Box<libc::statx> },
    Recv { fd: RawFd, buf: Vec<u8> },
    Send { fd: RawFd, buf: Vec<u8> },
    ReadAt { fd: RawFd, buf: Vec<u8>, offset: u64 },
    ShutdownWrite { fd: RawFd },
    Close { fd: RawFd },
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Connect { .. } => "connect",
            Op::Open { .. } => "open",
            Op::StatSize { .. } => "statx",
            Op::Recv { .. } => "read",
            Op::Send { .. } => "write",
            Op::ReadAt { .. } => "pread",
            Op::ShutdownWrite { .. } => "shutdown",
            Op::Close { .. } => "close",
        }
    }

    /// Builds the SQE. Pointers refer into heap allocations owned by `self`,
    /// which must stay parked until the matching CQE is reaped.
    fn entry(&mut self, user_data: u64) -> squeue::Entry {
        let entry = match self {
            Op::Connect { fd, addr } => {
                opcode::Connect::new(types::Fd(*fd), addr.as_ptr(), addr.len()).build()
            }
            Op::Open { path } => opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
                .flags(libc::O_RDONLY | libc::O_CLOEXEC)
                .build(),
            Op::StatSize { fd, path, statx } => {
                opcode::Statx::new(types::Fd(*fd), path.as_ptr(), (&mut **statx as *mut libc::statx).cast())
                    .flags(libc::AT_EMPTY_PATH)
                    .mask(libc::STATX_SIZE)
                    .build()
            }
            Op::Recv { fd, buf } => {
                opcode::Recv::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32).build()
            }
            Op::Send { fd, buf } => {
                opcode::Send::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32).build()
            }
            Op::ReadAt { fd, buf, offset } => {
                opcode::Read::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32)
                    .offset(*offset)
                    .build()
            }
            Op::ShutdownWrite { fd } => {
                opcode::Shutdown::new(types::Fd(*fd), libc::SHUT_WR).build()
            }
            Op::Close { fd } => opcode::Close::new(types::Fd(*fd)).build(),
        };
        entry.user_data(user_data)
    }
}

struct Completion {
    result: i32,
    op: Op,
}

impl Completion {
    fn into_buf(self) -> Vec<u8> {
        match self.op {
            Op::Recv { buf, .. } | Op::Send { buf, .. } | Op::ReadAt { buf, .. } => buf,
            _ => Vec::new(),
        }
    }
}

enum Incoming {
    Submit {
        op: Op,
        done: oneshot::Sender<Completion>,
    },
    Shutdown,
}

/// Handle to the driver thread. Cheap to share behind an [`Arc`]; concurrent
/// submitters are safe because every submission carries its own channel.
pub struct Reactor {
    tx: mpsc::UnboundedSender<Incoming>,
    wake_fd: RawFd,
    driver: Option<thread::JoinHandle<()>>,
}

impl Reactor {
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries).map_err(ReactorError::Setup)?;
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            return Err(ReactorError::Setup(io::Error::last_os_error()).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = thread::Builder::new()
            .name("ringtail-reactor".into())
            .spawn(move || driver_loop(ring, wake_fd, rx))
            .map_err(ReactorError::Setup)?;
        Ok(Reactor {
            tx,
            wake_fd,
            driver: Some(driver),
        })
    }

    /// Opens a TCP connection to `addr` and returns the connected socket.
    pub async fn connect(&self, addr: SocketAddr) -> Result<RawFd> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
            .map_err(|e| ReactorError::Os {
                op: "socket",
                source: e.into(),
            })?
            .into_raw_fd();
        let op = Op::Connect {
            fd,
            addr: Box::new(RawSockAddr::from(addr)),
        };
        match self.submit(op).await {
            Ok(_) => Ok(fd),
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e.into())
            }
        }
    }

    /// Opens `path` read-only and returns the new descriptor.
    pub async fn open(&self, path: &Path) -> Result<RawFd> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| ReactorError::Os {
            op: "open",
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
        let done = self.submit(Op::Open { path }).await?;
        Ok(done.result)
    }

    /// Size in bytes of the file behind `fd`, via `statx` on the descriptor.
    pub async fn stat_size(&self, fd: RawFd) -> Result<u64> {
        let op = Op::StatSize {
            fd,
            path: CString::default(),
            statx: Box::new(unsafe { std::mem::zeroed() }),
        };
        let done = self.submit(op).await?;
        let Op::StatSize { statx, .. } = done.op else {
            unreachable!("driver echoes the submitted op");
        };
        Ok(statx.stx_size)
    }

    /// One receive on a socket. Returns however many bytes this single
    /// completion reported (0 means the peer closed); callers needing an
    /// exact length loop themselves.
    pub async fn read(&self, fd: RawFd, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        let done = self.submit(Op::Recv { fd, buf }).await?;
        let n = done.result as usize;
        Ok((n, done.into_buf()))
    }

    /// One send on a socket; may be short.
    pub async fn write(&self, fd: RawFd, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        let done = self.submit(Op::Send { fd, buf }).await?;
        let n = done.result as usize;
        Ok((n, done.into_buf()))
    }

    /// One positioned read on a regular file; may be short.
    pub async fn pread(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Result<(usize, Vec<u8>)> {
        let done = self.submit(Op::ReadAt { fd, buf, offset }).await?;
        let n = done.result as usize;
        Ok((n, done.into_buf()))
    }

    /// Half-closes the write side so the peer's pending read completes.
    pub async fn shutdown_write(&self, fd: RawFd) -> Result<()> {
        self.submit(Op::ShutdownWrite { fd }).await?;
        Ok(())
    }

    /// Closes a descriptor previously produced by this reactor.
    pub async fn close(&self, fd: RawFd) -> Result<()> {
        self.submit(Op::Close { fd }).await?;
        Ok(())
    }

    async fn submit(&self, op: Op) -> std::result::Result<Completion, ReactorError> {
        let name = op.name();
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Incoming::Submit { op, done })
            .map_err(|_| ReactorError::Closed)?;
        self.wake();
        let completion = wait.await.map_err(|_| ReactorError::Closed)?;
        if completion.result < 0 {
            return Err(ReactorError::Os {
                op: name,
                source: io::Error::from_raw_os_error(-completion.result),
            });
        }
        Ok(completion)
    }

    fn wake(&self) {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.wake_fd, (&one as *const u64).cast(), 8) };
        if n < 0 {
            trace!("reactor wakeup write failed: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = self.tx.send(Incoming::Shutdown);
        self.wake();
        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                error!("reactor driver thread panicked");
            }
        }
    }
}

fn driver_loop(mut ring: IoUring, wake_fd: RawFd, mut rx: mpsc::UnboundedReceiver<Incoming>) {
    let mut pending: HashMap<u64, (Op, oneshot::Sender<Completion>)> = HashMap::new();
    let mut backlog: VecDeque<squeue::Entry> = VecDeque::new();
    let mut wake_buf = [0u8; 8];
    let mut next_id: u64 = 1;
    let mut wake_armed = false;
    let mut shutting_down = false;

    loop {
        loop {
            match rx.try_recv() {
                Ok(Incoming::Submit { mut op, done }) => {
                    if shutting_down {
                        let _ = done.send(Completion {
                            result: -libc::ECANCELED,
                            op,
                        });
                        continue;
                    }
                    let id = next_id;
                    next_id += 1;
                    let entry = op.entry(id);
                    pending.insert(id, (op, done));
                    backlog.push_back(entry);
                }
                Ok(Incoming::Shutdown) => {
                    shutting_down = true;
                    for id in pending.keys() {
                        backlog.push_back(
                            opcode::AsyncCancel::new(*id).build().user_data(CANCEL_TOKEN),
                        );
                    }
                }
                Err(_) => break,
            }
        }

        if !wake_armed && !shutting_down {
            let entry = opcode::Read::new(types::Fd(wake_fd), wake_buf.as_mut_ptr(), 8)
                .build()
                .user_data(WAKE_TOKEN);
            backlog.push_front(entry);
            wake_armed = true;
        }

        while let Some(entry) = backlog.pop_front() {
            if unsafe { ring.submission().push(&entry) }.is_err() {
                let _ = ring.submit();
                if unsafe { ring.submission().push(&entry) }.is_err() {
                    backlog.push_front(entry);
                    break;
                }
            }
        }

        if shutting_down && pending.is_empty() {
            break;
        }

        if let Err(e) = ring.submit_and_wait(1) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "io_uring submit failed, reactor stopping");
            break;
        }

        while let Some(cqe) = ring.completion().next() {
            match cqe.user_data() {
                WAKE_TOKEN => wake_armed = false,
                CANCEL_TOKEN => {}
                id => match pending.remove(&id) {
                    Some((op, done)) => {
                        let _ = done.send(Completion {
                            result: cqe.result(),
                            op,
                        });
                    }
                    // One completion per submission is the contract with the
                    // ring; a stray second delivery is a facility violation.
                    None => warn!(id, "completion for unknown submission"),
                },
            }
        }
    }

    // Tear the ring down before the wake buffer leaves scope; any still-armed
    // wake read is cancelled by the ring teardown.
    drop(ring);
    unsafe { libc::close(wake_fd) };
    trace!("reactor driver exited");
}

/// Socket address in the raw form `connect(2)` wants, boxed so its location
/// is stable for the lifetime of the submission.
enum RawSockAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl From<SocketAddr> for RawSockAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                raw.sin_family = libc::AF_INET as libc::sa_family_t;
                raw.sin_port = v4.port().to_be();
                raw.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                RawSockAddr::V4(raw)
            }
            SocketAddr::V6(v6) => {
                let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                raw.sin6_port = v6.port().to_be();
                raw.sin6_addr.s6_addr = v6.ip().octets();
                RawSockAddr::V6(raw)
            }
        }
    }
}

impl RawSockAddr {
    fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            RawSockAddr::V4(a) => (a as *const libc::sockaddr_in).cast(),
            RawSockAddr::V6(a) => (a as *const libc::sockaddr_in6).cast(),
        }
    }

    fn len(&self) -> libc::socklen_t {
        let size = match self {
            RawSockAddr::V4(_) => std::mem::size_of::<libc::sockaddr_in>(),
            RawSockAddr::V6(_) => std::mem::size_of::<libc::sockaddr_in6>(),
        };
        size as libc::socklen_t
    }
}
