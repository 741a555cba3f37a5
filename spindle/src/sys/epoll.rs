// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// Raw bindings to `epoll`.
///
/// Registrations are edge-triggered and carry the file descriptor itself as
/// their user data.
#[derive(Debug)]
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Epoll> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // kernels before 2.6.9 insist on a non-null event for DEL
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(
            self.fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            &mut ev
        ))?;
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: events | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev))?;
        Ok(())
    }

    /// Waits for events, for at most `timeout` (forever on `None`).
    ///
    /// Fills `events` up to its capacity and returns `(fd, event mask)`
    /// pairs through `out`. A wait interrupted by a signal reports nothing.
    pub(crate) fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
        out: &mut Vec<(RawFd, u32)>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => {
                // round up, so a wait never returns before the deadline it
                // was computed from
                let ms = (t.as_nanos() + 999_999) / 1_000_000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        events.clear();
        let capacity = events.capacity().max(1);
        let res = syscall!(epoll_wait(
            self.fd.as_raw_fd(),
            events.as_mut_ptr(),
            capacity as libc::c_int,
            timeout_ms
        ));
        let n = match res {
            Ok(n) => n as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        unsafe { events.set_len(n) };

        for ev in events.iter() {
            let fd = ev.u64 as RawFd;
            let mask = ev.events;
            out.push((fd, mask));
        }
        Ok(())
    }
}
