use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{error, trace};

use crate::channel::{Channel, Membership};
use crate::poller::{ChannelList, Poller};
use crate::timestamp::Timestamp;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

/// Level-triggered epoll backend.
pub(crate) struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            ep,
            events: Vec::with_capacity(INITIAL_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, n_events: usize, active: &mut ChannelList) {
        for event in &self.events[..n_events] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(event.events);
                active.push(channel.clone());
            }
        }
    }

    fn control(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: channel.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            op,
            channel.fd(),
            &mut event,
        )) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd={} failed: {}", channel.fd(), err);
            } else {
                error!("epoll_ctl add/mod fd={} failed: {}", channel.fd(), err);
                panic!("epoll_ctl add/mod failed: {}", err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut ChannelList) -> Timestamp {
        trace!("epoll waiting, {} fds registered", self.channels.len());

        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.capacity() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n > 0 {
            trace!("{} events reported", n);
            // SAFETY: `epoll_wait` initialised the first `n` entries.
            unsafe { self.events.set_len(n as usize) };
            self.fill_active_channels(n as usize, active);
            // A full event list means there may be more; double it so the
            // next wait can absorb the whole fan-out.
            if n as usize == self.events.capacity() {
                let cap = self.events.capacity();
                self.events.reserve(cap);
            }
        } else if n == 0 {
            trace!("epoll wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll wait failed: {}", saved);
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let membership = channel.membership();
        trace!(
            "epoll update fd={} events={:#x} membership={:?}",
            channel.fd(),
            channel.events(),
            membership
        );
        match membership {
            Membership::New | Membership::Deleted => {
                if membership == Membership::New {
                    self.channels.insert(channel.fd(), channel.clone());
                }
                channel.set_membership(Membership::Added);
                self.control(libc::EPOLL_CTL_ADD, channel);
            }
            Membership::Added => {
                if channel.is_none_event() {
                    self.control(libc::EPOLL_CTL_DEL, channel);
                    channel.set_membership(Membership::Deleted);
                } else {
                    self.control(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        trace!("epoll remove fd={}", channel.fd());
        self.channels.remove(&channel.fd());
        if channel.membership() == Membership::Added {
            self.control(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_membership(Membership::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
