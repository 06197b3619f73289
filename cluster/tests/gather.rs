//! Probe data collection from several workers

use cluster::{Controller, ControllerError, Launcher};
use compute::Chunk;
use data::column;
use std::collections::BTreeMap;

#[test]
fn probes_are_attributed_to_their_worker() -> cluster::Result<()> {
    let mut master = Chunk::new("Chunk 0", 0.001);
    let mut controller = Controller::new();
    controller.initialize(&master, 2, &Launcher::Threads, None)?;

    // Rank 1 has signals and operators, but no probe
    controller.add_signal(1, 1, "idle", column(&[0.0]))?;
    controller.add_op(1, "Reset;1;1")?;

    // Rank 2 has three probes of different periods
    controller.add_signal(2, 1, "a", column(&[0.0]))?;
    controller.add_signal(2, 2, "b", column(&[0.0, 0.0]))?;
    controller.add_op(2, "Reset;1;3")?;
    controller.add_op(2, "Reset;2;4")?;
    for (probe_key, signal_key, period) in [(31, 1, 1.0), (32, 2, 2.0), (33, 1, 5.0)] {
        controller.add_probe(2, probe_key, signal_key, period)?;
    }
    controller.finalize(&mut master)?;
    controller.run_n_steps(&mut master, 10)?;

    let expected = BTreeMap::from([(1, 0), (2, 3)]);
    let probe_data = controller.gather_probe_data(&expected)?;
    assert_eq!(probe_data.keys().copied().collect::<Vec<_>>(), vec![31, 32, 33]);
    assert_eq!(probe_data[&31].len(), 11);
    assert_eq!(probe_data[&32].len(), 6);
    assert_eq!(probe_data[&33].len(), 3);
    assert_eq!(probe_data[&32][5], column(&[4.0, 4.0]));

    // Claiming probes on rank 1 is refused instead of blocking forever
    assert!(matches!(
        controller.gather_probe_data(&BTreeMap::from([(1, 1), (2, 3)])),
        Err(ControllerError::Protocol(_))
    ));
    controller.finish_simulation()
}
