//! End-to-end loop scenarios (§8 testable properties 4–6), driven through
//! the public `Squall`/`EventLoop` API rather than the timer wheel or TCP
//! stream internals directly.

use squall::address::Address;
use squall::reactor::RunMode;
use squall::Squall;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn periodic_timer_fires_about_once_per_period_over_one_second() {
    let mut squall = Squall::with_defaults().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    squall
        .start_timer(Duration::from_millis(10), Duration::from_millis(10), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        squall.run(RunMode::Once).unwrap();
    }

    // §8 property 4: a 10ms periodic timer run for 1s fires 95..=105 times.
    let count = fired.load(Ordering::SeqCst);
    assert!((95..=105).contains(&count), "expected 95..=105 fires, got {count}");
}

#[test]
fn default_mode_terminates_once_a_self_stopping_timer_fires() {
    let mut squall = Squall::with_defaults().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let handle = squall.wake_handle();
    squall
        .start_timer(Duration::from_millis(5), Duration::ZERO, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            handle.stop();
            Ok(())
        })
        .unwrap();

    let start = Instant::now();
    squall.run(RunMode::Default).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn three_writes_arrive_concatenated_in_program_order() {
    let mut squall = Squall::with_defaults().unwrap();
    let addr = Address::parse("127.0.0.1:0").unwrap();

    let received = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
    let got_all = Arc::new(AtomicBool::new(false));

    let r = Arc::clone(&received);
    let done = Arc::clone(&got_all);
    let listener = squall
        .tcp_listen(addr, 16, move |lp, _listener, result| {
            let stream_id = result.unwrap();
            let pool = lp.pool();
            let r2 = Arc::clone(&r);
            let done2 = Arc::clone(&done);
            lp.tcp_read_start(
                stream_id,
                move |_lp, n| pool.alloc_buf(n).unwrap(),
                move |lp, id, outcome| match outcome {
                    squall::tcp::ReadOutcome::Data(buf) => {
                        r2.lock().unwrap().extend_from_slice(&buf);
                        if r2.lock().unwrap().len() >= 3 {
                            done2.store(true, Ordering::SeqCst);
                            lp.tcp_close(id, |_, _| {});
                        }
                    }
                    squall::tcp::ReadOutcome::Eof | squall::tcp::ReadOutcome::Error(_) => {}
                },
            )
            .unwrap();
        })
        .unwrap();
    let bound = squall.tcp_listener_local_addr(listener).unwrap();

    squall
        .tcp_connect(bound, move |lp, id, result| {
            result.unwrap();
            lp.tcp_write(id, &b"a"[..], |_, _, r| r.unwrap()).unwrap();
            lp.tcp_write(id, &b"b"[..], |_, _, r| r.unwrap()).unwrap();
            lp.tcp_write(id, &b"c"[..], |lp, id, r| {
                r.unwrap();
                lp.tcp_close(id, |_, _| {});
            })
            .unwrap();
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !got_all.load(Ordering::SeqCst) && Instant::now() < deadline {
        squall.run(RunMode::Once).unwrap();
    }

    assert_eq!(&received.lock().unwrap()[..], b"abc");
}
