use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{error, trace, warn};

use crate::channel::{Channel, Membership};
use crate::poller::{ChannelList, Poller};
use crate::timestamp::Timestamp;

/// poll(2) backend, selected via the environment override.
///
/// The interest masks stored on channels use the epoll bit values, which
/// on Linux coincide with the poll(2) bits for IN/PRI/OUT/ERR/HUP, so the
/// masks pass through unchanged. The `pollfd` scratch array is rebuilt
/// from the channel map before each wait.
pub(crate) struct PollPoller {
    channels: HashMap<RawFd, Arc<Channel>>,
    pollfds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            channels: HashMap::new(),
            pollfds: Vec::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut ChannelList) -> Timestamp {
        self.pollfds.clear();
        for channel in self.channels.values() {
            if channel.membership() == Membership::Added && !channel.is_none_event() {
                self.pollfds.push(libc::pollfd {
                    fd: channel.fd(),
                    events: channel.events() as i16,
                    revents: 0,
                });
            }
        }
        trace!("poll waiting on {} fds", self.pollfds.len());

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n > 0 {
            for pollfd in &self.pollfds {
                if pollfd.revents == 0 {
                    continue;
                }
                let mut revents = pollfd.revents as u16 as u32;
                if pollfd.revents & libc::POLLNVAL != 0 {
                    warn!("poll reported fd {} as not open", pollfd.fd);
                    revents |= libc::EPOLLERR as u32;
                }
                if let Some(channel) = self.channels.get(&pollfd.fd) {
                    channel.set_revents(revents);
                    active.push(channel.clone());
                }
            }
        } else if n == 0 {
            trace!("poll wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("poll wait failed: {}", saved);
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let membership = channel.membership();
        trace!(
            "poll update fd={} events={:#x} membership={:?}",
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
            }
            Membership::Added => {
                if channel.is_none_event() {
                    channel.set_membership(Membership::Deleted);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        trace!("poll remove fd={}", channel.fd());
        self.channels.remove(&channel.fd());
        channel.set_membership(Membership::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
