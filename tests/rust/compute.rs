// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::quicksilver::{
    Config,
    SimTime,
    Simulation,
    ThreadId,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

/// Builds a simulation on the OS-thread backend with the requested core pool.
/// Every simulation in this binary shares the process-wide stack arena, so
/// all of them configure identical stacks.
fn simulation(ncores: usize, wake_policy: &str) -> Result<Simulation> {
    let text: String = format!(
        concat!(
            "quicksilver:\n",
            "    context: threads\n",
            "compute:\n",
            "    ncores: {}\n",
            "    wake_policy: {}\n",
            "stacks:\n",
            "    stack_size: 65536\n",
            "    chunk_size: 262144\n",
        ),
        ncores, wake_policy
    );
    let config: Config = Config::from_yaml_str(&text)?;
    Ok(Simulation::from_config(&config)?)
}

/// Spawns one thread per entry that computes for the given duration on the
/// given number of cores and then records its name and completion time.
fn spawn_compute_ladder(
    sim: &mut Simulation,
    log: &Rc<RefCell<Vec<(&'static str, SimTime)>>>,
    ladder: &[(&'static str, usize, u64)],
) {
    for (name, ncores, millis) in ladder.iter().copied() {
        let mut body_sim: Simulation = sim.clone();
        let body_log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = log.clone();
        sim.spawn(move || {
            body_sim.compute_for(Duration::from_millis(millis), ncores);
            body_log.borrow_mut().push((name, body_sim.now()));
        });
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// On a pool of 4: a and b each hold 2 cores, c waits for 3 and d for 1.
/// When b releases at 10ms only 2 cores are free, so d overtakes c and c
/// runs only after a releases at 30ms.
#[test]
fn first_fit_lets_a_late_small_request_overtake() -> Result<()> {
    let mut sim: Simulation = simulation(4, "first-fit")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    spawn_compute_ladder(&mut sim, &log, &[("a", 2, 30), ("b", 2, 10), ("c", 3, 5), ("d", 1, 5)]);
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![
        ("b", Duration::from_millis(10)),
        ("d", Duration::from_millis(15)),
        ("a", Duration::from_millis(30)),
        ("c", Duration::from_millis(35)),
    ];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(sim.available_cores(), 4);
    quicksilver::ensure_eq!(sim.thread_count(), 0);
    Ok(())
}

/// Same ladder under the in-order policy: the 2 cores freed at 10ms sit
/// idle because c is at the front and needs 3, and d runs last of all.
#[test]
fn in_order_leaves_cores_idle_until_the_front_request_fits() -> Result<()> {
    let mut sim: Simulation = simulation(4, "in-order")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    spawn_compute_ladder(&mut sim, &log, &[("a", 2, 30), ("b", 2, 10), ("c", 3, 5), ("d", 1, 5)]);
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![
        ("b", Duration::from_millis(10)),
        ("a", Duration::from_millis(30)),
        ("c", Duration::from_millis(35)),
        ("d", Duration::from_millis(40)),
    ];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(sim.available_cores(), 4);
    quicksilver::ensure_eq!(sim.thread_count(), 0);
    Ok(())
}

/// a holds the whole pool of 2 while x and y each wait for 1 core. The
/// release at 10ms wakes only x; y keeps waiting with a core idle until x
/// releases in turn. A probe at 12ms sees that idle core.
#[test]
fn each_release_wakes_at_most_one_request() -> Result<()> {
    let mut sim: Simulation = simulation(2, "first-fit")?;
    let log: Rc<RefCell<Vec<(&'static str, SimTime)>>> = Rc::new(RefCell::new(Vec::new()));

    spawn_compute_ladder(&mut sim, &log, &[("a", 2, 10), ("x", 1, 5), ("y", 1, 5)]);

    let idle_at_probe: Rc<Cell<usize>> = Rc::new(Cell::new(usize::MAX));
    let probe_sim: Simulation = sim.clone();
    let probe_cell: Rc<Cell<usize>> = idle_at_probe.clone();
    sim.schedule_after(
        Duration::from_millis(12),
        Box::new(move || probe_cell.set(probe_sim.available_cores())),
    );
    sim.run();

    let expected: Vec<(&str, SimTime)> = vec![
        ("a", Duration::from_millis(10)),
        ("x", Duration::from_millis(15)),
        ("y", Duration::from_millis(20)),
    ];
    quicksilver::ensure_eq!(*log.borrow(), expected);
    quicksilver::ensure_eq!(idle_at_probe.get(), 1);
    Ok(())
}

/// A computing thread holds exactly what it asked for, and the pool
/// accounts for it.
#[test]
fn ledger_reports_cores_held_while_computing() -> Result<()> {
    let mut sim: Simulation = simulation(4, "first-fit")?;

    let mut body_sim: Simulation = sim.clone();
    let holder: ThreadId = sim.spawn(move || body_sim.compute_for(Duration::from_millis(20), 3));

    let observed: Rc<Cell<(usize, usize)>> = Rc::new(Cell::new((usize::MAX, usize::MAX)));
    let probe_sim: Simulation = sim.clone();
    let probe_cell: Rc<Cell<(usize, usize)>> = observed.clone();
    sim.schedule_after(
        Duration::from_millis(10),
        Box::new(move || probe_cell.set((probe_sim.cores_held(holder), probe_sim.available_cores()))),
    );
    sim.run();

    quicksilver::ensure_eq!(observed.get(), (3, 1));
    quicksilver::ensure_eq!(sim.cores_held(holder), 0);
    quicksilver::ensure_eq!(sim.available_cores(), 4);
    Ok(())
}

/// Threads whose computations end at the same instant finish in the order
/// their wakes were scheduled, which is their spawn order.
#[test]
fn simultaneous_completions_finish_in_spawn_order() -> Result<()> {
    let mut sim: Simulation = simulation(3, "first-fit")?;
    let log: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    for index in 0..3 {
        let mut body_sim: Simulation = sim.clone();
        let body_log: Rc<RefCell<Vec<usize>>> = log.clone();
        sim.spawn(move || {
            body_sim.compute_for(Duration::from_millis(10), 1);
            body_log.borrow_mut().push(index);
        });
    }
    sim.run();

    quicksilver::ensure_eq!(*log.borrow(), vec![0, 1, 2]);
    quicksilver::ensure_eq!(sim.now(), Duration::from_millis(10));
    Ok(())
}

/// A request for more cores than the pool has is queued and never woken;
/// the run drains every event and leaves the thread blocked.
#[test]
fn an_oversized_request_never_completes() -> Result<()> {
    let mut sim: Simulation = simulation(2, "first-fit")?;
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let mut body_sim: Simulation = sim.clone();
    let body_log: Rc<RefCell<Vec<&'static str>>> = log.clone();
    sim.spawn(move || {
        body_log.borrow_mut().push("entered");
        body_sim.compute_for(Duration::from_millis(1), 3);
        body_log.borrow_mut().push("finished");
    });
    sim.run();

    quicksilver::ensure_eq!(*log.borrow(), vec!["entered"]);
    quicksilver::ensure_eq!(sim.thread_count(), 1);
    quicksilver::ensure_eq!(sim.available_cores(), 2);
    quicksilver::ensure_eq!(sim.now(), Duration::ZERO);
    Ok(())
}

/// Random contention between a dozen workers: an observer samples the pool
/// once a simulated millisecond and every sample must account for every
/// core, with no oversubscription and nothing leaked at the end.
#[test]
fn random_contention_never_oversubscribes_the_pool() -> Result<()> {
    const TOTAL_CORES: usize = 8;
    const NWORKERS: usize = 12;
    const ROUNDS: usize = 3;

    let mut sim: Simulation = simulation(TOTAL_CORES, "first-fit")?;
    let mut rng: SmallRng = SmallRng::seed_from_u64(0x0c0f_fee5);
    let plans: Vec<Vec<(Duration, usize)>> = (0..NWORKERS)
        .map(|_| {
            (0..ROUNDS)
                .map(|_| {
                    (
                        Duration::from_millis(rng.gen_range(1..10)),
                        rng.gen_range(1..=TOTAL_CORES),
                    )
                })
                .collect()
        })
        .collect();

    let completions: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let mut workers: Vec<ThreadId> = Vec::with_capacity(NWORKERS);
    for plan in plans {
        let mut body_sim: Simulation = sim.clone();
        let body_count: Rc<Cell<usize>> = completions.clone();
        workers.push(sim.spawn(move || {
            for (duration, ncores) in plan {
                body_sim.compute_for(duration, ncores);
            }
            body_count.set(body_count.get() + 1);
        }));
    }

    // Spawned last so the workers have already queued up on the pool by the
    // time it takes its first sample.
    let samples: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let mut observer_sim: Simulation = sim.clone();
    let observer_ids: Vec<ThreadId> = workers.clone();
    let observer_samples: Rc<RefCell<Vec<(usize, usize)>>> = samples.clone();
    sim.spawn(move || {
        while observer_sim.thread_count() > 1 {
            let available: usize = observer_sim.available_cores();
            let held: usize = observer_ids.iter().map(|id: &ThreadId| observer_sim.cores_held(*id)).sum();
            observer_samples.borrow_mut().push((available, held));
            observer_sim.sleep(Duration::from_millis(1));
        }
    });
    sim.run();

    quicksilver::ensure_eq!(completions.get(), NWORKERS);
    quicksilver::ensure_eq!(sim.thread_count(), 0);
    quicksilver::ensure_eq!(sim.available_cores(), TOTAL_CORES);

    quicksilver::ensure_eq!(samples.borrow().is_empty(), false);
    for (available, held) in samples.borrow().iter().copied() {
        quicksilver::ensure_eq!(available + held, TOTAL_CORES);
    }
    let saw_contention: bool = samples.borrow().iter().any(|(available, _)| *available < TOTAL_CORES);
    quicksilver::ensure_eq!(saw_contention, true);
    Ok(())
}
