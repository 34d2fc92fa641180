use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use uniserve::{EventLoop, TimerHandle};

#[test]
fn next_tick_is_fifo() {
    let lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for tag in 1..=5 {
        let order = order.clone();
        lp.next_tick(move || order.borrow_mut().push(tag));
    }
    lp.run();

    assert_eq!(*order.borrow(), [1, 2, 3, 4, 5]);
}

#[test]
fn next_tick_runs_before_a_zero_timeout() {
    // Both enqueue orders: the microtask always wins.
    for tick_first in [true, false] {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let tick = {
            let order = order.clone();
            move || order.borrow_mut().push("tick")
        };
        let timeout = {
            let order = order.clone();
            move || order.borrow_mut().push("timeout")
        };

        if tick_first {
            lp.next_tick(tick);
            lp.set_timeout(Duration::ZERO, timeout);
        } else {
            lp.set_timeout(Duration::ZERO, timeout);
            lp.next_tick(tick);
        }
        lp.run();

        assert_eq!(*order.borrow(), ["tick", "timeout"]);
    }
}

#[test]
fn next_tick_runs_before_an_immediate() {
    let lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    lp.set_immediate(move || o.borrow_mut().push("immediate"));
    let o = order.clone();
    lp.next_tick(move || o.borrow_mut().push("tick"));
    lp.run();

    assert_eq!(*order.borrow(), ["tick", "immediate"]);
}

#[test]
fn timers_fire_before_immediates_in_one_iteration() {
    let lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    lp.set_immediate(move || o.borrow_mut().push("immediate"));
    let o = order.clone();
    lp.set_timeout(Duration::ZERO, move || o.borrow_mut().push("timeout"));
    lp.run();

    assert_eq!(*order.borrow(), ["timeout", "immediate"]);
}

#[test]
fn microtasks_from_a_macrotask_run_before_the_next_macrotask() {
    let lp = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        let lp2 = lp.clone();
        lp.set_timeout(Duration::ZERO, move || {
            order.borrow_mut().push("timer-1");
            let order = order.clone();
            lp2.next_tick(move || order.borrow_mut().push("micro"));
        });
    }
    {
        let order = order.clone();
        lp.set_timeout(Duration::ZERO, move || order.borrow_mut().push("timer-2"));
    }
    lp.run();

    assert_eq!(*order.borrow(), ["timer-1", "micro", "timer-2"]);
}

#[test]
fn run_returns_quiescent() {
    let lp = EventLoop::new().unwrap();
    let hits = Rc::new(Cell::new(0u32));

    let h = hits.clone();
    lp.next_tick(move || h.set(h.get() + 1));
    let h = hits.clone();
    lp.set_immediate(move || h.set(h.get() + 1));
    let h = hits.clone();
    lp.set_timeout(Duration::from_millis(1), move || h.set(h.get() + 1));

    lp.run();
    assert_eq!(hits.get(), 3);
    assert_eq!(lp.ref_count(), 0);

    // The loop is reusable once quiescent.
    let h = hits.clone();
    lp.next_tick(move || h.set(h.get() + 1));
    lp.run();
    assert_eq!(hits.get(), 4);
    assert_eq!(lp.ref_count(), 0);
}

#[test]
fn each_armed_timeout_holds_one_ref() {
    let lp = EventLoop::new().unwrap();

    let first = lp.set_timeout(Duration::from_secs(3600), || {});
    assert_eq!(lp.ref_count(), 1);
    let second = lp.set_timeout(Duration::from_secs(3600), || {});
    assert_eq!(lp.ref_count(), 2);

    first.cancel();
    assert_eq!(lp.ref_count(), 1);
    first.cancel(); // idempotent
    assert_eq!(lp.ref_count(), 1);
    second.cancel();
    assert_eq!(lp.ref_count(), 0);

    // Nothing armed: run returns at once instead of sleeping an hour.
    lp.run();
}

#[test]
fn firing_releases_the_ref_cancel_becomes_a_noop() {
    let lp = EventLoop::new().unwrap();
    let handle_slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));

    let slot = handle_slot.clone();
    let lp2 = lp.clone();
    let handle = lp.set_timeout(Duration::ZERO, move || {
        assert_eq!(lp2.ref_count(), 0, "ref released before the callback runs");
        if let Some(handle) = slot.borrow_mut().take() {
            handle.cancel(); // fired already: must not double-release
        }
        assert_eq!(lp2.ref_count(), 0);
    });
    handle_slot.borrow_mut().replace(handle);

    lp.run();
    assert_eq!(lp.ref_count(), 0);
}

#[test]
fn interval_holds_a_single_ref_across_firings() {
    let lp = EventLoop::new().unwrap();
    let hits = Rc::new(Cell::new(0u32));
    let handle_slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));

    let h = hits.clone();
    let slot = handle_slot.clone();
    let lp2 = lp.clone();
    let handle = lp.set_interval(Duration::from_millis(1), move || {
        h.set(h.get() + 1);
        assert_eq!(lp2.ref_count(), 1, "one ref for the interval's lifetime");
        if h.get() == 3 {
            if let Some(handle) = slot.borrow_mut().take() {
                handle.cancel();
            }
        }
    });
    handle_slot.borrow_mut().replace(handle);

    lp.run();
    assert_eq!(hits.get(), 3);
    assert_eq!(lp.ref_count(), 0);
}

#[test]
fn remote_handle_schedules_from_another_thread() {
    let lp = EventLoop::new().unwrap();
    let ticked = Arc::new(AtomicBool::new(false));
    let timed = Arc::new(AtomicBool::new(false));

    let remote = lp.remote();
    let ticked2 = ticked.clone();
    let timed2 = timed.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.next_tick(move || ticked2.store(true, Ordering::SeqCst));
        remote.set_timeout(Duration::ZERO, move || timed2.store(true, Ordering::SeqCst));
    });

    // Keep the loop alive until the injected work has run.
    let handle_slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
    let slot = handle_slot.clone();
    let ticked3 = ticked.clone();
    let timed3 = timed.clone();
    let handle = lp.set_interval(Duration::from_millis(2), move || {
        if ticked3.load(Ordering::SeqCst) && timed3.load(Ordering::SeqCst) {
            if let Some(handle) = slot.borrow_mut().take() {
                handle.cancel();
            }
        }
    });
    handle_slot.borrow_mut().replace(handle);

    lp.run();
    worker.join().unwrap();
    assert!(ticked.load(Ordering::SeqCst));
    assert!(timed.load(Ordering::SeqCst));
    assert_eq!(lp.ref_count(), 0);
}
