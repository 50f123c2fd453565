//! corio timer demo
//!
//! Schedules a repeating tick, a pair of one-shot deadlines, and a
//! coroutine that sleeps in blocking style, then stops the loop once
//! everything has fired.
//!
//! Usage:
//!     cargo run -p corio-timer-demo

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corio_core::kinfo;
use corio_reactor::hook;
use corio_reactor::reactor::{self, ReactorKind};
use corio_reactor::timer::TimerEvent;
use corio_runtime::pool;

const TICKS_WANTED: usize = 5;

fn main() {
    hook::set_hook_enabled(true);
    let r = reactor::init_thread(ReactorKind::Main);
    let timer = r.timer();
    let started = Instant::now();

    for (label, ms) in [("first one-shot", 500i64), ("second one-shot", 1500)] {
        let event = TimerEvent::new(
            ms,
            false,
            Arc::new(move || {
                println!("[{:>6}ms] {}", started.elapsed().as_millis(), label);
            }),
        );
        timer.add_timer_event(event, true);
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let tick_counter = ticks.clone();
    let tick = TimerEvent::new(
        400,
        true,
        Arc::new(move || {
            let n = tick_counter.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[{:>6}ms] tick {}/{}", started.elapsed().as_millis(), n, TICKS_WANTED);
        }),
    );
    timer.add_timer_event(tick.clone(), true);

    // A coroutine sleeping in blocking style; it outlives the ticks and
    // shuts the loop down
    let cor = pool().acquire().expect("pool empty at startup");
    let stopper = r.clone();
    let tick_handle = tick.clone();
    let tick_count = ticks.clone();
    cor.set_callback(move || {
        hook::sleep(3);
        tick_handle.cancel();
        kinfo!("sleeper woke after 3s, {} ticks seen", tick_count.load(Ordering::SeqCst));
        stopper.stop();
    });
    r.add_coroutine(cor);

    r.run().expect("reactor loop failed");
    println!(
        "[{:>6}ms] done, {} ticks fired",
        started.elapsed().as_millis(),
        ticks.load(Ordering::SeqCst)
    );
}
