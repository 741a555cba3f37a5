// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    io,
    os::unix::io::{FromRawFd, OwnedFd, RawFd},
};

macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod epoll;

pub(crate) use self::epoll::Epoll;

pub(crate) fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn write_eventfd(eventfd: RawFd) -> io::Result<()> {
    let buf = [1u64; 1];
    let ret = syscall!(write(eventfd, &buf as *const u64 as _, 8))?;
    assert_eq!(ret, 8);
    Ok(())
}

/// Resets the eventfd counter, returning how many signals were pending. An
/// eventfd with nothing pending reads as zero.
pub(crate) fn read_eventfd(eventfd: RawFd) -> io::Result<u64> {
    let mut buf = [0u64; 1];
    match syscall!(read(eventfd, &mut buf as *mut u64 as _, 8)) {
        Ok(_) => Ok(buf[0]),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(err),
    }
}

pub(crate) fn page_size() -> usize {
    match syscall!(sysconf(libc::_SC_PAGESIZE)) {
        Ok(size) if size > 0 => size as usize,
        _ => 4096,
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as _, buf.len())).map(|x| x as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as _, buf.len())).map(|x| x as usize)
}

#[cfg(test)]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn eventfd_counts_and_resets() {
        let fd = create_eventfd().unwrap();
        assert_eq!(read_eventfd(fd.as_raw_fd()).unwrap(), 0);
        write_eventfd(fd.as_raw_fd()).unwrap();
        write_eventfd(fd.as_raw_fd()).unwrap();
        assert_eq!(read_eventfd(fd.as_raw_fd()).unwrap(), 2);
        assert_eq!(read_eventfd(fd.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn empty_nonblocking_pipe_would_block() {
        let (reader, writer) = pipe().unwrap();
        let mut buf = [0u8; 4];
        let err = read(reader.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(write(writer.as_raw_fd(), b"ab").unwrap(), 2);
        assert_eq!(read(reader.as_raw_fd(), &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
    }
}
