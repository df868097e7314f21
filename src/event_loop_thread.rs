use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

/// Callback run on a freshly created loop, on its own thread, before the
/// loop starts driving.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct LoopSlot {
    event_loop: Mutex<Option<Arc<EventLoop>>>,
    published: Condvar,
}

/// A thread owning exactly one event loop.
///
/// The loop is constructed on the spawned thread (thread affinity is fixed
/// at construction) and published back to the spawning thread through a
/// mutex/condvar pair. Dropping the value quits the loop and joins the
/// thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    slot: Arc<LoopSlot>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Prepares a named loop thread; nothing runs until
    /// [`start_loop`](EventLoopThread::start_loop).
    pub fn new(init: Option<ThreadInitCallback>, name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            slot: Arc::new(LoopSlot {
                event_loop: Mutex::new(None),
                published: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Spawns the thread and blocks until its loop has been constructed.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.handle.is_none(), "loop thread already started");

        let slot = self.slot.clone();
        let init = self.init.take();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new().expect("failed to create event loop");
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let mut published = slot.event_loop.lock().unwrap();
                    *published = Some(event_loop.clone());
                    slot.published.notify_one();
                }
                event_loop.run();
                *slot.event_loop.lock().unwrap() = None;
            })
            .expect("failed to spawn event loop thread");
        self.handle = Some(handle);

        let mut published = self.slot.event_loop.lock().unwrap();
        while published.is_none() {
            published = self.slot.published.wait(published).unwrap();
        }
        published.clone().unwrap()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let event_loop = self.slot.event_loop.lock().unwrap().clone();
        if let Some(event_loop) = event_loop {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
