// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::args::ProgramArguments;
use anyhow::Result;
use quicksilver::{
    SimTime,
    Simulation,
};
use std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    time::Duration,
};

pub fn run_tests(args: &ProgramArguments) -> Vec<(String, String, Result<(), anyhow::Error>)> {
    let mut test_results: Vec<(String, String, Result<(), anyhow::Error>)> = Vec::new();

    crate::append_test_result!(test_results, crate::test!(a_computation_finishes_after_its_duration(args)));

    crate::append_test_result!(test_results, crate::test!(contended_requests_serialize(args)));

    crate::append_test_result!(test_results, crate::test!(each_release_admits_one_waiter(args)));

    crate::append_test_result!(test_results, crate::test!(many_threads_share_a_small_pool(args)));

    test_results
}

fn a_computation_finishes_after_its_duration(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 1, "first-fit")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    let mut body_sim: Simulation = sim.clone();
    let body_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = log.clone();
    sim.spawn(move || {
        body_log.borrow_mut().push(("before", body_sim.now()));
        body_sim.compute_for(Duration::from_millis(7), 1);
        body_log.borrow_mut().push(("after", body_sim.now()));
    });
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![("before", Duration::ZERO), ("after", Duration::from_millis(7))];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(sim.available_cores(), 1);
    Ok(())
}

fn contended_requests_serialize(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 1, "first-fit")?;
    let log: Rc<RefCell<Vec<(usize, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    for index in 0..2 {
        let mut body_sim: Simulation = sim.clone();
        let body_log: Rc<RefCell<Vec<(usize, SimTime)>>> = log.clone();
        sim.spawn(move || {
            body_sim.compute_for(Duration::from_millis(5), 1);
            body_log.borrow_mut().push((index, body_sim.now()));
        });
    }
    sim.run();

    let expected: Vec<(usize, SimTime)> = vec![(0, Duration::from_millis(5)), (1, Duration::from_millis(10))];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(10));
    Ok(())
}

fn each_release_admits_one_waiter(args: &ProgramArguments) -> Result<()> {
    let mut sim: Simulation = crate::build_simulation(args, 2, "first-fit")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    for (name, ncores) in [("a", 2), ("b", 1), ("c", 1)] {
        let mut body_sim: Simulation = sim.clone();
        let body_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = log.clone();
        sim.spawn(move || {
            body_sim.compute_for(Duration::from_millis(4), ncores);
            body_log.borrow_mut().push((name, body_sim.now()));
        });
    }
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![
        ("a", Duration::from_millis(4)),
        ("b", Duration::from_millis(8)),
        ("c", Duration::from_millis(12)),
    ];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    Ok(())
}

fn many_threads_share_a_small_pool(args: &ProgramArguments) -> Result<()> {
    const POOL: usize = 4;
    let nthreads: usize = args.nthreads();
    let mut sim: Simulation = crate::build_simulation(args, POOL, "first-fit")?;
    let completions: Rc<Cell<usize>> = Rc::new(Cell::new(0));

    for index in 0..nthreads {
        let mut body_sim: Simulation = sim.clone();
        let body_count: Rc<Cell<usize>> = completions.clone();
        sim.spawn(move || {
            body_sim.sleep(Duration::from_millis((index % 3) as u64));
            body_sim.compute_for(Duration::from_millis(1 + (index % 3) as u64), 1 + index % 2);
            body_count.set(body_count.get() + 1);
        });
    }
    sim.run();

    quicksilver::ensure_eq!(completions.get(), nthreads);
    quicksilver::ensure_eq!(sim.thread_count(), 0);
    quicksilver::ensure_eq!(sim.available_cores(), POOL);
    quicksilver::ensure_neq!(sim.now(), Duration::ZERO);
    Ok(())
}
