// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLEXCLUSIVE: u32 = libc::EPOLLEXCLUSIVE as u32;

fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Run `f` on a freshly created fd, closing it if `f` fails.
fn configure_or_close(fd: c_int, f: impl FnOnce(c_int) -> io::Result<()>) -> io::Result<c_int> {
    match f(fd) {
        Ok(()) => Ok(fd),
        Err(err) => {
            close(fd);
            Err(err)
        }
    }
}

// ---- Socket Operations ----

pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL, 0))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

fn set_reuseaddr(fd: c_int) -> io::Result<()> {
    let one: c_int = 1;
    unsafe {
        cvt(libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ))?;
    }
    Ok(())
}

/// Create a non-blocking IPv4 stream socket bound to `addr` and listening
/// with a `SOMAXCONN` backlog.
pub fn create_inet_listener(addr: SocketAddrV4) -> io::Result<c_int> {
    let fd = unsafe { cvt(libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))? };
    configure_or_close(fd, |fd| {
        set_reuseaddr(fd)?;
        set_nonblocking(fd)?;
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            cvt(libc::bind(
                fd,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sin) as socklen_t,
            ))?;
            cvt(libc::listen(fd, libc::SOMAXCONN))?;
        }
        Ok(())
    })
}

/// Create a non-blocking UNIX stream socket at `path`.
///
/// A stale socket file left at `path` is removed first.
pub fn create_unix_listener(path: &Path) -> io::Result<c_int> {
    let bytes = path.as_os_str().as_bytes();
    let mut sun = libc::sockaddr_un {
        sun_family: libc::AF_UNIX as libc::sa_family_t,
        sun_path: [0; 108],
    };
    if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path is empty or too long",
        ));
    }
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let fd = unsafe { cvt(libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))? };
    configure_or_close(fd, |fd| {
        set_reuseaddr(fd)?;
        set_nonblocking(fd)?;
        unsafe {
            cvt(libc::bind(
                fd,
                &sun as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sun) as socklen_t,
            ))?;
            cvt(libc::listen(fd, libc::SOMAXCONN))?;
        }
        Ok(())
    })
}

/// Resolved address of a bound IPv4 socket, `None` for other families.
pub fn local_inet_addr(fd: c_int) -> io::Result<Option<SocketAddrV4>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        cvt(libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok(inet_from_storage(&storage))
    }
}

fn inet_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddrV4> {
    if storage.ss_family as c_int != libc::AF_INET {
        return None;
    }
    let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
    Some(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
}

/// Accept one pending connection as a non-blocking socket.
///
/// Returns `Ok(None)` when the backlog is drained. The peer address is only
/// known for IPv4 listeners.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(c_int, Option<SocketAddrV4>)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some((fd, inet_from_storage(&storage))))
        }
    }
}

pub fn shutdown(fd: c_int, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    unsafe {
        cvt(libc::shutdown(fd, how))?;
    }
    Ok(())
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Connected pair of non-blocking UNIX stream sockets.
pub fn socket_pair() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        cvt(libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ))?;
    }
    Ok((fds[0], fds[1]))
}

// ---- Epoll ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Self { fd })
    }

    /// Register `fd` with exactly the given event mask.
    pub fn add(&self, fd: c_int, token: u64, events: u32) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            cvt(libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Wait for events. `EINTR` is returned as an `Interrupted` error so the
    /// caller can tell it apart from an empty timeout.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        Ok(cvt(res)? as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close(self.fd);
    }
}

// ---- Eventfd and pipes ----

pub fn create_eventfd() -> io::Result<c_int> {
    unsafe { cvt(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)) }
}

/// Read and reset the eventfd counter. `Ok(None)` when it is zero.
pub fn eventfd_read(fd: c_int) -> io::Result<Option<u64>> {
    let mut value: u64 = 0;
    let res = unsafe { libc::read(fd, &mut value as *mut u64 as *mut c_void, mem::size_of::<u64>()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(value))
}

/// Add `value` to the eventfd counter.
pub fn eventfd_write(fd: c_int, value: u64) -> io::Result<()> {
    let res = unsafe { libc::write(fd, &value as *const u64 as *const c_void, mem::size_of::<u64>()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking, close-on-exec pipe. Returns (read_fd, write_fd).
pub fn create_pipe() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        cvt(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    }
    Ok((fds[0], fds[1]))
}

// ---- Data transfer ----

/// Bytes waiting in the receive queue of `fd`.
pub fn bytes_available(fd: c_int) -> io::Result<usize> {
    let mut n: c_int = 0;
    unsafe {
        cvt(libc::ioctl(fd, libc::FIONREAD, &mut n))?;
    }
    Ok(n.max(0) as usize)
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// `send` without raising SIGPIPE on a reset peer.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Zero-copy transfer of up to `count` bytes from `in_fd` at `*offset`.
/// `offset` is advanced by the kernel.
pub fn sendfile(out_fd: c_int, in_fd: c_int, offset: &mut i64, count: usize) -> io::Result<usize> {
    let res = unsafe { libc::sendfile(out_fd, in_fd, offset as *mut i64 as *mut libc::off_t, count) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_counter_accumulates() {
        let fd = create_eventfd().unwrap();
        assert_eq!(eventfd_read(fd).unwrap(), None);
        eventfd_write(fd, 2).unwrap();
        eventfd_write(fd, 3).unwrap();
        assert_eq!(eventfd_read(fd).unwrap(), Some(5));
        assert_eq!(eventfd_read(fd).unwrap(), None);
        close(fd);
    }

    #[test]
    fn test_inet_listener_reports_port() {
        let fd = create_inet_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = local_inet_addr(fd).unwrap().unwrap();
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
        assert!(accept_connection(fd).unwrap().is_none());
        close(fd);
    }

    #[test]
    fn test_socket_pair_fionread() {
        let (a, b) = socket_pair().unwrap();
        assert_eq!(send_nonblocking(a, b"hello").unwrap(), 5);
        assert_eq!(bytes_available(b).unwrap(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(read_nonblocking(b, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        let err = read_nonblocking(b, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        close(a);
        close(b);
    }
}
