// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::args::ProgramArguments;
use anyhow::Result;
use quicksilver::{
    SimTime,
    Simulation,
    ThreadId,
};
use std::{
    cell::RefCell,
    rc::Rc,
    time::Duration,
};

pub fn run_tests(args: &ProgramArguments) -> Vec<(String, String, Result<(), anyhow::Error>)> {
    let mut test_results: Vec<(String, String, Result<(), anyhow::Error>)> = Vec::new();

    crate::append_test_result!(test_results, crate::test!(sleep_accumulates_virtual_time(args)));

    crate::append_test_result!(test_results, crate::test!(events_fire_in_timestamp_order(args)));

    crate::append_test_result!(test_results, crate::test!(same_time_events_fire_in_schedule_order(args)));

    crate::append_test_result!(test_results, crate::test!(block_timeout_expires_when_nobody_wakes(args)));

    crate::append_test_result!(test_results, crate::test!(an_early_wake_beats_the_timeout(args)));

    crate::append_test_result!(test_results, crate::test!(zero_delay_events_run_at_the_current_instant(args)));

    test_results
}

fn sleep_accumulates_virtual_time(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let times: Rc<RefCell<Vec<SimTime>>> = Rc::new(RefCell::new(Vec::new()));

    let mut body_sim: Simulation = sim.clone();
    let body_times: Rc<RefCell<Vec<SimTime>>> = times.clone();
    sim.spawn(move || {
        body_sim.sleep(Duration::from_millis(2));
        body_times.borrow_mut().push(body_sim.now());
        body_sim.sleep(Duration::from_millis(3));
        body_times.borrow_mut().push(body_sim.now());
    });
    sim.run();

    let expected: Vec<SimTime> = vec![Duration::from_millis(2), Duration::from_millis(5)];
    quicksilver::ensure_eq!(*times.borrow(), expected);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(5));
    Ok(())
}

fn events_fire_in_timestamp_order(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let log: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

    // Scheduled out of order on purpose.
    for millis in [5, 1, 3] {
        let event_log: Rc<RefCell<Vec<u64>>> = log.clone();
        sim.schedule_after(
            Duration::from_millis(millis),
            Box::new(move || event_log.borrow_mut().push(millis)),
        );
    }
    sim.run();

    quicksilver::ensure_eq!(*log.borrow(), vec![1, 3, 5]);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(5));
    Ok(())
}

fn same_time_events_fire_in_schedule_order(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    for tag in ["a", "b", "c"] {
        let event_log: Rc<RefCell<Vec<&'static str>>> = log.clone();
        sim.schedule_after(Duration::from_millis(2), Box::new(move || event_log.borrow_mut().push(tag)));
    }
    sim.run();

    quicksilver::ensure_eq!(*log.borrow(), vec!["a", "b", "c"]);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(2));
    Ok(())
}

fn block_timeout_expires_when_nobody_wakes(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let outcomes: Rc<RefCell<Vec<(bool, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    let mut body_sim: Simulation = sim.clone();
    let body_outcomes: Rc<RefCell<Vec<(bool, SimTime)>>> = outcomes.clone();
    sim.spawn(move || {
        let timed_out: bool = body_sim.block_timeout(Duration::from_millis(3));
        body_outcomes.borrow_mut().push((timed_out, body_sim.now()));
    });
    sim.run();

    quicksilver::ensure_eq!(*outcomes.borrow(), vec![(true, Duration::from_millis(3))]);
    Ok(())
}

fn an_early_wake_beats_the_timeout(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let outcomes: Rc<RefCell<Vec<(bool, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    let mut body_sim: Simulation = sim.clone();
    let body_outcomes: Rc<RefCell<Vec<(bool, SimTime)>>> = outcomes.clone();
    let blocker: ThreadId = sim.spawn(move || {
        let timed_out: bool = body_sim.block_timeout(Duration::from_millis(10));
        body_outcomes.borrow_mut().push((timed_out, body_sim.now()));
    });

    let mut waker_sim: Simulation = sim.clone();
    sim.schedule_after(Duration::from_millis(2), Box::new(move || waker_sim.unblock(blocker)));
    sim.run();

    quicksilver::ensure_eq!(*outcomes.borrow(), vec![(false, Duration::from_millis(2))]);
    // The stale timeout event still drains from the queue.
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(10));
    Ok(())
}

fn zero_delay_events_run_at_the_current_instant(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 4, "first-fit")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    let root_sim: Simulation = sim.clone();
    let root_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = log.clone();
    sim.schedule_after(Duration::ZERO, Box::new(move || root_log.borrow_mut().push(("root", root_sim.now()))));

    let mut body_sim: Simulation = sim.clone();
    let body_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = log.clone();
    sim.spawn(move || {
        body_sim.sleep(Duration::from_millis(2));
        let event_sim: Simulation = body_sim.clone();
        let event_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = body_log.clone();
        body_sim.schedule_after(Duration::ZERO, Box::new(move || event_log.borrow_mut().push(("thread", event_sim.now()))));
        body_sim.sleep(Duration::from_millis(1));
    });
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![("root", Duration::ZERO), ("thread", Duration::from_millis(2))];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(3));
    Ok(())
}
