use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evio::{EventLoop, EventLoopThread};

mod util;

use util::init;

#[test]
fn cross_thread_quit_interrupts_the_wait() {
    init();

    let mut loop_thread = EventLoopThread::new(None, "quit-test");
    let event_loop = loop_thread.start_loop();

    // Give the loop time to block in its 10 s wait, then quit from here.
    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    event_loop.quit();
    drop(loop_thread); // joins
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn queued_work_runs_on_the_loop_thread_in_order() {
    init();

    let mut loop_thread = EventLoopThread::new(None, "queue-test");
    let event_loop = loop_thread.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let loop_tid = Arc::new(Mutex::new(None));
    for i in 0..4 {
        let order = order.clone();
        let loop_tid = loop_tid.clone();
        event_loop.queue_in_loop(move || {
            order.lock().unwrap().push(i);
            *loop_tid.lock().unwrap() = Some(thread::current().id());
        });
    }

    // Posted work owns its captures until it runs; poll until done.
    let deadline = Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 4 {
        assert!(Instant::now() < deadline, "queued work never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_ne!(loop_tid.lock().unwrap().unwrap(), thread::current().id());
}

#[test]
fn run_in_loop_from_another_thread_is_queued() {
    init();

    let mut loop_thread = EventLoopThread::new(None, "run-test");
    let event_loop = loop_thread.start_loop();

    let ran_on = Arc::new(Mutex::new(None));
    let record = ran_on.clone();
    event_loop.run_in_loop(move || {
        *record.lock().unwrap() = Some(thread::current().id());
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while ran_on.lock().unwrap().is_none() {
        assert!(Instant::now() < deadline, "posted work never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert_ne!(ran_on.lock().unwrap().unwrap(), thread::current().id());
    assert!(!event_loop.is_in_loop_thread());
}

#[test]
fn work_queued_during_drain_runs_in_the_next_drain() {
    init();

    let mut loop_thread = EventLoopThread::new(None, "requeue-test");
    let event_loop = loop_thread.start_loop();

    let stages = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    let inner_stages = stages.clone();
    let inner_counter = counter.clone();
    let requeue_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        inner_stages.lock().unwrap().push("first");
        let stages = inner_stages.clone();
        let counter = inner_counter.clone();
        let inner_requeue_counter = counter.clone();
        requeue_loop.queue_in_loop(move || {
            stages.lock().unwrap().push("second");
            inner_requeue_counter.fetch_add(1, Ordering::AcqRel);
        });
        // The re-queued task must not run inside this drain.
        assert_eq!(counter.load(Ordering::Acquire), 0);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::Acquire) == 0 {
        assert!(Instant::now() < deadline, "re-queued work never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*stages.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn poll_return_time_advances() {
    init();

    let mut loop_thread = EventLoopThread::new(None, "time-test");
    let event_loop = loop_thread.start_loop();

    let nudge = event_loop.clone();
    nudge.queue_in_loop(|| {});
    let deadline = Instant::now() + Duration::from_secs(5);
    while event_loop.poll_return_time().micros() == 0 {
        assert!(Instant::now() < deadline, "loop never returned from poll");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn init_callback_runs_on_the_loop_thread_before_looping() {
    init();

    let init_tid = Arc::new(Mutex::new(None));
    let record = init_tid.clone();
    let mut loop_thread = EventLoopThread::new(
        Some(Arc::new(move |event_loop: &Arc<EventLoop>| {
            assert!(event_loop.is_in_loop_thread());
            *record.lock().unwrap() = Some(thread::current().id());
        })),
        "init-test",
    );
    let _event_loop = loop_thread.start_loop();

    let recorded = init_tid.lock().unwrap().unwrap();
    assert_ne!(recorded, thread::current().id());
}
