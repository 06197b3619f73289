//! Spiking neuron population driven through the full simulation stack

use approx::assert_relative_eq;
use cluster::{Simulator, SimulatorConfig};
use data::{column, Precision};

const DT: Precision = 0.001;
const TAU_RC: Precision = 0.02;
const TAU_REF: Precision = 0.002;

#[test]
fn spike_count_matches_lif_period() -> cluster::Result<()> {
    let current: Precision = 2.0;
    let mut sim = Simulator::new(DT, SimulatorConfig::default());
    sim.add_signal(0, 1, "J", column(&[0.0]))?;
    sim.add_signal(0, 2, "spikes", column(&[0.0]))?;
    sim.add_op(0, format!("Reset;1;{current}"))?;
    sim.add_op(0, format!("SimLIF;1;{TAU_RC};{TAU_REF};{DT};1;2"))?;
    sim.add_probe(0, 1, 2, 1.0)?;

    let num_steps = 1000;
    sim.run_n_steps(num_steps)?;
    let archive = sim.probe_data()?;
    let spikes = &archive.histories[&1];
    assert_eq!(spikes.len(), num_steps as usize + 1);
    let spike_count = spikes.iter().map(|sample| sample[[0, 0]] * DT).sum::<Precision>();

    let period = TAU_REF + TAU_RC * (current / (current - 1.0)).ln();
    let expected = num_steps as Precision * DT / period;
    assert!(
        (spike_count - expected).abs() <= 1.0,
        "{spike_count} spikes, expected {expected}"
    );
    sim.finish()
}

#[test]
fn distributed_rates_match_local_rates() -> cluster::Result<()> {
    // The same rate population, once on the master and once on a worker
    let currents = [0.5, 1.5, 3.0];
    let mut sim = Simulator::new(DT, SimulatorConfig::default());
    let worker = sim.add_chunk()?;
    for (component, probe_key) in [(0, 1), (worker, 2)] {
        sim.add_signal(component, 1, "J", column(&currents))?;
        sim.add_signal(component, 2, "rates", column(&[0.0; 3]))?;
        sim.add_op(component, format!("SimLIFRate;3;{TAU_RC};{TAU_REF};{DT};1;2"))?;
        sim.add_probe(component, probe_key, 2, 1.0)?;
    }
    sim.run_n_steps(3)?;
    let archive = sim.probe_data()?;
    let [local, remote] = [&archive.histories[&1], &archive.histories[&2]];
    assert_eq!(local, remote);

    // Rate neurons have no state: every step yields the same output
    for sample in &local[2..] {
        assert_eq!(sample, &local[1]);
    }
    assert_eq!(local[1][[0, 0]], 0.0);
    let period = TAU_REF + TAU_RC * (3.0f64 / 2.0).ln();
    assert_relative_eq!(local[1][[2, 0]], 1.0 / period, max_relative = 1e-12);
    sim.finish()
}
