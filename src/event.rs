// SPDX-License-Identifier: Apache-2.0

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::{ErrorKind, VleaseError};

const EVENT_BUFFER_COUNT: usize = 64;

// Upper bound on a single poll so the caller can notice a stop request
// even when no timer is close.
const MAX_POLL_WAIT: Duration = Duration::from_millis(500);

/// Opaque handle of a scheduled timer. Cancelling is idempotent; a fired
/// or cancelled handle never fires again.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct TimerHandle(u64);

/// Single-threaded reactor over readable file descriptors and a monotonic
/// timer queue. Both kinds of readiness surface as plain dispatch tokens
/// from [EventLoop::poll]; the owner routes them.
#[derive(Debug)]
pub struct EventLoop<T> {
    epoll: VleaseEpoll,
    fd_tokens: HashMap<u64, T>,
    fds: HashMap<RawFd, u64>,
    next_token: u64,
    timers: TimerQueue<T>,
}

impl<T: Clone + std::fmt::Debug> EventLoop<T> {
    pub fn new() -> Result<Self, VleaseError> {
        Ok(Self {
            epoll: VleaseEpoll::new()?,
            fd_tokens: HashMap::new(),
            fds: HashMap::new(),
            next_token: 1,
            timers: TimerQueue::new(),
        })
    }

    pub fn register_fd(
        &mut self,
        fd: RawFd,
        token: T,
    ) -> Result<(), VleaseError> {
        let id = self.next_token;
        self.next_token += 1;
        log::debug!("Registering fd {fd} with token {token:?}");
        self.epoll.add_fd(fd, id)?;
        self.fd_tokens.insert(id, token);
        self.fds.insert(fd, id);
        Ok(())
    }

    pub fn unregister_fd(&mut self, fd: RawFd) -> Result<(), VleaseError> {
        if let Some(id) = self.fds.remove(&fd) {
            self.fd_tokens.remove(&id);
            self.epoll.del_fd(fd)?;
        }
        Ok(())
    }

    pub fn schedule_at(&mut self, deadline: Instant, token: T) -> TimerHandle {
        self.timers.schedule(deadline, token)
    }

    pub fn schedule_in(&mut self, delay: Duration, token: T) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, token)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    /// Wait for the next batch of events. Returns fd readiness tokens
    /// followed by all due timer tokens in nondecreasing deadline order.
    /// Each source fires at most once per call.
    pub fn poll(&mut self) -> Result<Vec<T>, VleaseError> {
        let now = Instant::now();
        let wait = match self.timers.next_deadline() {
            Some(deadline) => {
                deadline.saturating_duration_since(now).min(MAX_POLL_WAIT)
            }
            None => MAX_POLL_WAIT,
        };
        let mut ret = Vec::new();
        for id in self.epoll.poll(wait)? {
            if let Some(token) = self.fd_tokens.get(&id) {
                ret.push(token.clone());
            } else {
                log::debug!("Ignoring event for unregistered token {id}");
            }
        }
        ret.append(&mut self.timers.pop_due(Instant::now()));
        Ok(ret)
    }
}

#[derive(Debug)]
struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, T>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    fn schedule(&mut self, deadline: Instant, token: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, token);
        TimerHandle(id)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.remove(&handle.0);
    }

    // Cancelled timers stay in the heap and are discarded lazily here.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut ret = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(token) = self.pending.remove(&id) {
                ret.push(token);
            }
        }
        ret
    }
}

#[derive(Debug)]
struct VleaseEpoll {
    fd: Epoll,
}

impl VleaseEpoll {
    fn new() -> Result<Self, VleaseError> {
        Ok(Self {
            fd: Epoll::new(EpollCreateFlags::empty()).map_err(|e| {
                let e = VleaseError::new(
                    ErrorKind::Bug,
                    format!("Failed to create epoll: {e}"),
                );
                log::error!("{e}");
                e
            })?,
        })
    }

    fn add_fd(&self, fd: RawFd, id: u64) -> Result<(), VleaseError> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(EpollFlags::EPOLLIN, id);
        self.fd.add(fd, event).map_err(|e| {
            let e = VleaseError::new(
                ErrorKind::Bug,
                format!(
                    "Failed to add fd {} to epoll {}: {e}",
                    fd.as_raw_fd(),
                    self.fd.0.as_raw_fd()
                ),
            );
            log::error!("{e}");
            e
        })
    }

    fn del_fd(&self, fd: RawFd) -> Result<(), VleaseError> {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.fd.delete(fd).map_err(|e| {
            let e = VleaseError::new(
                ErrorKind::Bug,
                format!(
                    "Failed to delete fd {} from epoll {}: {e}",
                    fd.as_raw_fd(),
                    self.fd.0.as_raw_fd(),
                ),
            );
            log::error!("{e}");
            e
        })
    }

    fn poll(&self, wait: Duration) -> Result<Vec<u64>, VleaseError> {
        let mut events: [EpollEvent; EVENT_BUFFER_COUNT] =
            [EpollEvent::empty(); EVENT_BUFFER_COUNT];
        let wait_ms = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);

        loop {
            match self.fd.wait(&mut events, wait_ms) {
                Ok(c) => {
                    return Ok(events[..c].iter().map(|e| e.data()).collect());
                }
                Err(e) => match e {
                    nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN => {
                        // retry
                        continue;
                    }
                    _ => {
                        return Err(VleaseError::new(
                            ErrorKind::Bug,
                            format!("Failed on epoll_wait(): {e}"),
                        ));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Timer(u32),
        Socket,
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut evl: EventLoop<Token> = EventLoop::new().unwrap();
        let now = Instant::now();
        evl.schedule_at(now + Duration::from_millis(30), Token::Timer(3));
        evl.schedule_at(now + Duration::from_millis(10), Token::Timer(1));
        evl.schedule_at(now + Duration::from_millis(20), Token::Timer(2));

        let mut fired = Vec::new();
        while fired.len() < 3 {
            fired.append(&mut evl.poll().unwrap());
        }
        assert_eq!(
            fired,
            vec![Token::Timer(1), Token::Timer(2), Token::Timer(3)]
        );
    }

    #[test]
    fn test_cancel_is_idempotent_and_suppresses_firing() {
        let mut evl: EventLoop<Token> = EventLoop::new().unwrap();
        let handle = evl
            .schedule_at(Instant::now() - Duration::from_millis(1), Token::Timer(1));
        evl.cancel(handle);
        evl.cancel(handle);
        assert!(evl.poll().unwrap().is_empty());
    }

    #[test]
    fn test_fd_readiness_dispatch() {
        let mut evl: EventLoop<Token> = EventLoop::new().unwrap();
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        evl.register_fd(receiver.as_raw_fd(), Token::Socket).unwrap();

        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();
        let events = evl.poll().unwrap();
        assert_eq!(events, vec![Token::Socket]);

        evl.unregister_fd(receiver.as_raw_fd()).unwrap();
        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();
        assert!(evl.poll().unwrap().is_empty());
    }
}
