// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! I/O readiness tracking on top of epoll.
//!
//! File descriptors are first registered as objects. Interest in one of them
//! is then expressed by attaching watchers, each waiting for a readiness
//! condition. The kernel only knows about a descriptor while at least one
//! watcher is attached, and its interest mask is always the union of the
//! attached watchers' conditions.

use crate::{
    clock::IoClock,
    error::{ErrorEnhancer, ReactorErrorKind},
    free_list::{FreeList, Idx},
    sys::Epoll,
    Result,
};
use ahash::AHashMap;
use smallvec::SmallVec;
use std::{fmt, os::unix::io::RawFd, time::Duration};

bitflags::bitflags! {
    /// Readiness conditions a watcher can wait for.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoCondition: u32 {
        /// Data can be read, or the peer hung up.
        const READABLE = 1;
        /// Data can be written without blocking.
        const WRITABLE = 2;
    }
}

impl IoCondition {
    fn epoll_events(self) -> u32 {
        let mut events = 0;
        if self.contains(IoCondition::READABLE) {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.contains(IoCondition::WRITABLE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn from_epoll_events(events: u32) -> IoCondition {
        if events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
            return IoCondition::all();
        }
        let mut ready = IoCondition::empty();
        if events & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32 != 0 {
            ready |= IoCondition::READABLE;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            ready |= IoCondition::WRITABLE;
        }
        ready
    }
}

/// Identifies a watcher attached to an [`IoPoller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherKey(Idx);

#[derive(Debug)]
struct Watcher<T> {
    fd: RawFd,
    condition: IoCondition,
    payload: T,
}

#[derive(Debug, Default)]
struct IoObject {
    /// What the kernel is currently told to report, empty when the
    /// descriptor is not in the epoll set.
    registered: IoCondition,
    watchers: SmallVec<[Idx; 2]>,
}

/// The set of file descriptors and watchers under watch.
pub struct IoPoller<T> {
    epoll: Epoll,
    objects: AHashMap<RawFd, IoObject>,
    watchers: FreeList<Watcher<T>>,
    events: Vec<libc::epoll_event>,
    ready: Vec<(RawFd, u32)>,
}

impl<T> fmt::Debug for IoPoller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPoller")
            .field("epoll", &self.epoll)
            .field("objects", &self.objects.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

impl<T> IoPoller<T> {
    /// Creates a poller that collects up to 1024 kernel events per poll.
    pub fn new() -> Result<IoPoller<T>> {
        IoPoller::with_capacity(1024)
    }

    /// Creates a poller that collects up to `events_capacity` kernel events
    /// per poll. Further events are picked up by the following polls.
    pub fn with_capacity(events_capacity: usize) -> Result<IoPoller<T>> {
        Ok(IoPoller {
            epoll: Epoll::new()?,
            objects: AHashMap::new(),
            watchers: FreeList::default(),
            events: Vec::with_capacity(events_capacity.max(1)),
            ready: Vec::new(),
        })
    }

    /// Starts tracking `fd`. Nothing is registered with the kernel until the
    /// first watcher is attached.
    pub fn create_object(&mut self, fd: RawFd) -> Result<()> {
        if self.objects.contains_key(&fd) {
            return Err(ReactorErrorKind::AlreadyRegistered(fd).into());
        }
        self.objects.insert(fd, IoObject::default());
        Ok(())
    }

    /// Stops tracking `fd`, which must have no watcher left.
    pub fn destroy_object(&mut self, fd: RawFd) -> Result<()> {
        match self.objects.get(&fd) {
            None => Err(ReactorErrorKind::NotRegistered(fd).into()),
            Some(object) if !object.watchers.is_empty() => {
                Err(ReactorErrorKind::Busy(fd).into())
            }
            Some(_) => {
                self.objects.remove(&fd);
                Ok(())
            }
        }
    }

    /// Whether `fd` is tracked.
    pub fn has_object(&self, fd: RawFd) -> bool {
        self.objects.contains_key(&fd)
    }

    /// Attaches a watcher waiting for `condition` on `fd`.
    ///
    /// Attaching always re-arms the descriptor, so readiness that is already
    /// there when the watcher is added is reported by the next poll.
    pub fn add_watcher(&mut self, payload: T, fd: RawFd, condition: IoCondition) -> Result<WatcherKey> {
        let object = self
            .objects
            .get_mut(&fd)
            .ok_or(ReactorErrorKind::NotRegistered(fd))?;
        let mask = object.registered | condition;
        let res = if object.registered.is_empty() {
            self.epoll.add(fd, mask.epoll_events()).map_err(|inner| ErrorEnhancer {
                inner,
                op: "epoll_ctl add",
                fd: Some(fd),
            })
        } else {
            self.epoll.modify(fd, mask.epoll_events()).map_err(|inner| ErrorEnhancer {
                inner,
                op: "epoll_ctl mod",
                fd: Some(fd),
            })
        };
        res?;
        object.registered = mask;

        let idx = self.watchers.alloc(Watcher {
            fd,
            condition,
            payload,
        });
        object.watchers.push(idx);
        Ok(WatcherKey(idx))
    }

    /// Detaches a watcher, handing back its payload.
    ///
    /// Returns `None` if the watcher was already removed.
    pub fn remove_watcher(&mut self, key: WatcherKey) -> Option<T> {
        let watcher = self.watchers.dealloc(key.0)?;
        let fd = watcher.fd;
        if let Some(object) = self.objects.get_mut(&fd) {
            object.watchers.retain(|idx| *idx != key.0);
            let watchers = &self.watchers;
            let mask = object
                .watchers
                .iter()
                .filter_map(|idx| watchers.get(*idx))
                .fold(IoCondition::empty(), |mask, w| mask | w.condition);

            if mask.is_empty() {
                if let Err(err) = self.epoll.delete(fd) {
                    log::error!("failed to remove fd {} from epoll: {}", fd, err);
                }
            } else if mask != object.registered {
                if let Err(err) = self.epoll.modify(fd, mask.epoll_events()) {
                    log::error!("failed to update epoll interest of fd {}: {}", fd, err);
                }
            }
            object.registered = mask;
        }
        Some(watcher.payload)
    }

    /// Looks up the payload of a watcher.
    pub fn watcher(&self, key: WatcherKey) -> Option<&T> {
        self.watchers.get(key.0).map(|w| &w.payload)
    }

    /// Number of attached watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Number of tracked file descriptors.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Blocks until some watcher is ready or the earliest timer of `clock`
    /// is due, and appends the ready watchers to `out`.
    ///
    /// Without timers this blocks until a watcher becomes ready. Watchers
    /// stay attached; each is reported at most once per call.
    pub fn get_ready_watchers<U>(&mut self, clock: &IoClock<U>, out: &mut Vec<WatcherKey>) -> Result<()> {
        self.poll(clock.timeout(), out)
    }

    /// Like [`get_ready_watchers`](IoPoller::get_ready_watchers), with an
    /// explicit bound on the wait. `None` waits forever.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<WatcherKey>) -> Result<()> {
        self.ready.clear();
        self.epoll
            .wait(&mut self.events, timeout, &mut self.ready)
            .map_err(|inner| ErrorEnhancer {
                inner,
                op: "epoll_wait",
                fd: None,
            })?;

        // epoll reports a descriptor at most once per wait, and a watcher
        // belongs to a single descriptor
        for (fd, events) in self.ready.drain(..) {
            let ready = IoCondition::from_epoll_events(events);
            let object = match self.objects.get(&fd) {
                Some(object) => object,
                None => continue,
            };
            for idx in &object.watchers {
                match self.watchers.get(*idx) {
                    Some(w) if w.condition.intersects(ready) => out.push(WatcherKey(*idx)),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{sys, SpindleError};
    use std::{
        os::unix::io::AsRawFd,
        time::{Duration, Instant},
    };

    #[test]
    fn timer_then_readable_pipe() {
        let (reader, writer) = sys::pipe().unwrap();
        let mut clock = IoClock::new();
        let mut poller = IoPoller::new().unwrap();
        poller.create_object(reader.as_raw_fd()).unwrap();
        let watcher = poller
            .add_watcher("reader", reader.as_raw_fd(), IoCondition::READABLE)
            .unwrap();
        clock.add_timer("timer", Duration::from_millis(100));

        let mut ready = Vec::new();
        let mut expired = Vec::new();
        let start = Instant::now();
        poller.get_ready_watchers(&clock, &mut ready).unwrap();
        clock.get_expired_timers(&mut expired);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(ready.is_empty());
        assert_eq!(expired.len(), 1);

        let writer_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            sys::write(writer.as_raw_fd(), b"x").unwrap();
            writer
        });

        poller.get_ready_watchers(&clock, &mut ready).unwrap();
        assert_eq!(ready, vec![watcher]);
        assert_eq!(poller.watcher(watcher), Some(&"reader"));
        let _writer = writer_thread.join().unwrap();

        assert_eq!(poller.remove_watcher(watcher), Some("reader"));
        assert_eq!(poller.remove_watcher(watcher), None);
        poller.destroy_object(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn only_matching_conditions_are_ready() {
        let (reader, writer) = sys::pipe().unwrap();
        let mut poller = IoPoller::new().unwrap();
        poller.create_object(reader.as_raw_fd()).unwrap();
        poller.create_object(writer.as_raw_fd()).unwrap();
        let read_watcher = poller
            .add_watcher(1, reader.as_raw_fd(), IoCondition::READABLE)
            .unwrap();
        let write_watcher = poller
            .add_watcher(2, writer.as_raw_fd(), IoCondition::WRITABLE)
            .unwrap();

        let mut ready = Vec::new();
        poller.poll(Some(Duration::ZERO), &mut ready).unwrap();
        assert_eq!(ready, vec![write_watcher]);

        // the write edge was consumed, and the pipe is still empty
        ready.clear();
        poller.poll(Some(Duration::ZERO), &mut ready).unwrap();
        assert!(ready.is_empty());
        assert_eq!(poller.remove_watcher(write_watcher), Some(2));

        sys::write(writer.as_raw_fd(), b"x").unwrap();
        poller.poll(Some(Duration::ZERO), &mut ready).unwrap();
        assert_eq!(ready, vec![read_watcher]);

        // data still pending is reported again to a newly attached watcher
        ready.clear();
        let second = poller
            .add_watcher(3, reader.as_raw_fd(), IoCondition::READABLE)
            .unwrap();
        poller.poll(Some(Duration::ZERO), &mut ready).unwrap();
        ready.sort_by_key(|key| *poller.watcher(*key).unwrap());
        assert_eq!(ready, vec![read_watcher, second]);
    }

    #[test]
    fn hangup_wakes_every_condition() {
        let (reader, writer) = sys::pipe().unwrap();
        let mut poller = IoPoller::new().unwrap();
        poller.create_object(reader.as_raw_fd()).unwrap();
        let watcher = poller
            .add_watcher((), reader.as_raw_fd(), IoCondition::READABLE)
            .unwrap();
        drop(writer);

        let mut ready = Vec::new();
        poller.poll(Some(Duration::from_secs(1)), &mut ready).unwrap();
        assert_eq!(ready, vec![watcher]);
    }

    #[test]
    fn object_lifecycle() {
        let (reader, _writer) = sys::pipe().unwrap();
        let fd = reader.as_raw_fd();
        let mut poller = IoPoller::new().unwrap();

        assert!(matches!(
            poller.add_watcher((), fd, IoCondition::READABLE),
            Err(SpindleError::ReactorError(ReactorErrorKind::NotRegistered(_)))
        ));
        poller.create_object(fd).unwrap();
        assert_eq!(poller.objects[&fd].registered, IoCondition::default());
        assert!(poller.objects[&fd].registered.is_empty());
        assert!(matches!(
            poller.create_object(fd),
            Err(SpindleError::ReactorError(ReactorErrorKind::AlreadyRegistered(_)))
        ));

        let a = poller.add_watcher((), fd, IoCondition::READABLE).unwrap();
        let b = poller.add_watcher((), fd, IoCondition::WRITABLE).unwrap();
        assert_eq!(poller.objects[&fd].registered, IoCondition::all());
        assert!(matches!(
            poller.destroy_object(fd),
            Err(SpindleError::ReactorError(ReactorErrorKind::Busy(_)))
        ));

        poller.remove_watcher(a);
        assert_eq!(poller.objects[&fd].registered, IoCondition::WRITABLE);
        poller.remove_watcher(b);
        assert!(poller.objects[&fd].registered.is_empty());
        assert_eq!(poller.watcher_count(), 0);

        // the descriptor left the epoll set, so it can be added again
        let c = poller.add_watcher((), fd, IoCondition::READABLE).unwrap();
        poller.remove_watcher(c);
        poller.destroy_object(fd).unwrap();
        assert_eq!(poller.object_count(), 0);
    }
}
