//! Readiness demultiplexer backends.

use std::env;
use std::io;
use std::sync::Arc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollPoller;
pub(crate) use self::poll::PollPoller;

/// Channels reported ready by one wait.
pub(crate) type ChannelList = Vec<Arc<Channel>>;

/// When this variable is present in the environment the poll(2) backend is
/// selected; the default is epoll.
const USE_POLL_ENV: &str = "MUDUO_USE_POLL";

/// Abstraction over a kernel readiness facility.
///
/// A poller is owned by exactly one event loop and is only touched from
/// that loop's thread. `update_channel` drives the channel's membership
/// state machine: NEW and DELETED channels are (re)submitted as ADD, an
/// ADDED channel with an empty interest set is withdrawn (DEL, membership
/// DELETED), and any other ADDED channel is modified in place.
pub(crate) trait Poller: Send {
    /// Waits up to `timeout_ms` for readiness, appends each ready channel
    /// to `active` with its reported mask stamped on, and returns the wall
    /// clock at which the wait returned.
    fn poll(&mut self, timeout_ms: i32, active: &mut ChannelList) -> Timestamp;

    /// Registers or modifies interest according to the channel's
    /// membership and interest mask.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Erases the channel from the fd map, withdrawing kernel interest if
    /// it was still submitted. Membership resets to NEW.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    /// Whether this exact channel is currently known to the poller.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Picks the backend for a new loop, honoring the environment override.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        EpollPoller::new().map(|p| Box::new(p) as Box<dyn Poller>)
    }
}
