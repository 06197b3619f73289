//! Small partitioned network, for trying out the simulator

use cluster::{Result, Simulator, SimulatorConfig};
use data::{column, scalar, Matrix, Precision, ProbeKey};

/// Membrane time constant of the demo neurons (s)
const TAU_RC: Precision = 0.02;

/// Refractory period of the demo neurons (s)
const TAU_REF: Precision = 0.002;

/// Time constant of the spike filter (s)
const TAU_SYN: Precision = 0.005;

/// Steps between two samples of the filtered activity
const PROBE_PERIOD: Precision = 10.0;

/// Probe of the master's filtered spike trains
pub const FILTERED_PROBE: ProbeKey = 1;

/// Probe of the master's raw spikes
pub const SPIKES_PROBE: ProbeKey = 2;

/// Probe of the output of the worker with a given rank
pub fn output_probe(rank: usize) -> ProbeKey {
    100 + rank as ProbeKey
}

/// Message tag of the coupling edge into a given worker
fn coupling_tag(rank: usize) -> u32 {
    10 + rank as u32
}

/// Record the demo network into a fresh simulator
///
/// The master runs a population of `num_neurons` LIF neurons driven by
/// constant, increasingly strong bias currents, and low-pass filters their
/// spike trains. Every worker receives the filtered activity, decodes its
/// mean with a dot product, and scales it by its own rank.
pub fn demo_network(
    num_workers: usize,
    num_neurons: usize,
    dt: Precision,
    config: SimulatorConfig,
) -> Result<Simulator> {
    let mut sim = Simulator::new(dt, config);

    // Master: LIF population and spike filter
    let bias = (0..num_neurons)
        .map(|i| 1.1 + 2.0 * i as Precision / num_neurons.max(1) as Precision)
        .collect::<Vec<_>>();
    let zeros = vec![0.0; num_neurons];
    sim.add_signal(0, 1, "bias", column(&bias))?;
    sim.add_signal(0, 2, "current", column(&zeros))?;
    sim.add_signal(0, 3, "spikes", column(&zeros))?;
    sim.add_signal(0, 4, "filtered", column(&zeros))?;
    let decay = (-dt / TAU_SYN).exp();
    sim.add_op(0, "Copy;2;1")?;
    sim.add_op(
        0,
        format!("SimLIF;{num_neurons};{TAU_RC};{TAU_REF};{dt};2;3"),
    )?;
    sim.add_op(0, format!("SimpleSynapse;3;4;{};{}", -decay, 1.0 - decay))?;
    sim.add_probe(0, FILTERED_PROBE, 4, PROBE_PERIOD)?;
    sim.add_probe(0, SPIKES_PROBE, 3, 1.0)?;

    // Workers: decoding of the mean activity, with a per-worker gain
    for _ in 0..num_workers {
        let rank = sim.add_chunk()?;
        sim.add_op(0, format!("MPISend;{rank};{};4", coupling_tag(rank)))?;
        sim.add_signal(rank, 1, "activity", column(&zeros))?;
        sim.add_signal(
            rank,
            2,
            "decoders",
            Matrix::from_elem((1, num_neurons), 1.0 / num_neurons.max(1) as Precision),
        )?;
        sim.add_signal(rank, 3, "mean", scalar(0.0))?;
        sim.add_signal(rank, 4, "gain", scalar(rank as Precision))?;
        sim.add_signal(rank, 5, "output", scalar(0.0))?;
        sim.add_op(rank, format!("MPIReceive;0;{};1", coupling_tag(rank)))?;
        sim.add_op(rank, "Reset;3;0")?;
        sim.add_op(rank, "DotInc;2;1;3")?;
        sim.add_op(rank, "Reset;5;0")?;
        sim.add_op(rank, "ElementwiseInc;4;3;5")?;
        sim.add_probe(rank, output_probe(rank), 5, PROBE_PERIOD)?;
    }
    Ok(sim)
}
