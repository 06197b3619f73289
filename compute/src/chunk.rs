//! Unit of partitioned simulation state

use crate::{
    descriptor::OpSpec,
    operator::Operator,
    probe::Probe,
    signals::SignalTable,
    BuildError, BuildResult, StepResult,
};
use comm::ProcessGroup;
use data::{command::BuildCommand, Matrix, Precision, ProbeKey, SignalKey};
use log::{debug, trace};
use std::{cell::Ref, collections::BTreeMap, fmt};

/// One process' share of the simulation
///
/// A chunk is first populated with signals, operators and probes, in an order
/// where everything an item refers to has been added before it. Once it has
/// started stepping, its contents are frozen.
#[derive(Debug)]
pub struct Chunk {
    /// Human-readable name
    label: String,

    /// Simulation timestep (s)
    dt: Precision,

    /// Signals, shared by operators and probes
    signals: SignalTable,

    /// Operators, in execution order
    operators: Vec<Operator>,

    /// Probes, by key
    probes: BTreeMap<ProbeKey, Probe>,

    /// Number of completed steps
    time_step: u64,

    /// Truth that the chunk has started stepping
    stepping: bool,
}
//
impl Chunk {
    /// Set up an empty chunk
    pub fn new(label: impl Into<String>, dt: Precision) -> Self {
        Self {
            label: label.into(),
            dt,
            signals: SignalTable::default(),
            operators: Vec::new(),
            probes: BTreeMap::new(),
            time_step: 0,
            stepping: false,
        }
    }

    /// Human-readable name
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Simulation timestep (s)
    pub fn dt(&self) -> Precision {
        self.dt
    }

    /// Number of completed steps
    pub fn time_step(&self) -> u64 {
        self.time_step
    }

    /// Signals of this chunk
    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    /// Current value of a signal
    pub fn signal(&self, key: SignalKey) -> Option<Ref<'_, Matrix>> {
        self.signals.get(key)
    }

    /// Operators, in execution order
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Number of probes
    pub fn num_probes(&self) -> usize {
        self.probes.len()
    }

    /// Add a signal with its initial value
    pub fn add_signal(
        &mut self,
        key: SignalKey,
        label: impl Into<String>,
        data: Matrix,
    ) -> BuildResult<()> {
        self.ensure_building()?;
        self.signals.insert(key, label, data)?;
        Ok(())
    }

    /// Add an operator from its textual descriptor
    pub fn add_op(&mut self, descriptor: &str) -> BuildResult<()> {
        self.add_op_spec(&descriptor.parse()?)
    }

    /// Add a parsed operator
    pub fn add_op_spec(&mut self, spec: &OpSpec) -> BuildResult<()> {
        self.ensure_building()?;
        let op = Operator::build(spec, &self.signals)?;
        debug!("Chunk {:?} gets operator #{}: {op}", self.label, self.operators.len());
        self.operators.push(op);
        Ok(())
    }

    /// Add a probe
    pub fn add_probe(
        &mut self,
        probe_key: ProbeKey,
        signal_key: SignalKey,
        period: Precision,
    ) -> BuildResult<()> {
        self.ensure_building()?;
        if self.probes.contains_key(&probe_key) {
            return Err(BuildError::DuplicateProbe(probe_key));
        }
        let probe = Probe::new(&self.signals, probe_key, signal_key, period)?;
        self.probes.insert(probe_key, probe);
        Ok(())
    }

    /// Apply a build command
    ///
    /// [`BuildCommand::Stop`] carries no chunk modification and is ignored.
    pub fn apply(&mut self, command: BuildCommand) -> BuildResult<()> {
        match command {
            BuildCommand::AddSignal { key, label, data } => self.add_signal(key, label, data),
            BuildCommand::AddOp { descriptor } => self.add_op(&descriptor),
            BuildCommand::AddProbe {
                probe_key,
                signal_key,
                period,
            } => self.add_probe(probe_key, signal_key, period),
            BuildCommand::Stop => Ok(()),
        }
    }

    /// Attach every signal exchange operator to the process group
    pub fn bind_group(&mut self, group: &ProcessGroup) -> BuildResult<()> {
        for op in &mut self.operators {
            match op {
                Operator::MpiSend(send) => send.bind(group)?,
                Operator::MpiReceive(recv) => recv.bind(group)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Truth that some signal exchange operator is not yet bound
    pub fn has_unbound_exchanges(&self) -> bool {
        self.operators.iter().any(|op| match op {
            Operator::MpiSend(send) => !send.is_bound(),
            Operator::MpiReceive(recv) => !recv.is_bound(),
            _ => false,
        })
    }

    /// Run `num_steps` simulation steps
    ///
    /// Each step invokes every operator once, in insertion order, then gives
    /// every probe a chance to record its signal.
    pub fn run_n_steps(&mut self, num_steps: u64) -> StepResult<()> {
        if !self.stepping {
            self.stepping = true;
            self.sample_probes();
        }
        for _ in 0..num_steps {
            for op in &mut self.operators {
                op.invoke(&self.signals)?;
            }
            self.time_step += 1;
            trace!("Chunk {:?} completed step {}", self.label, self.time_step);
            self.sample_probes();
        }
        Ok(())
    }

    /// Recorded history of a probe
    pub fn probe_history(&self, key: ProbeKey) -> Option<&[Matrix]> {
        self.probes.get(&key).map(Probe::history)
    }

    /// Iterate over probe histories, by increasing probe key
    pub fn probe_data(&self) -> impl Iterator<Item = (ProbeKey, &[Matrix])> + '_ {
        self.probes
            .iter()
            .map(|(&key, probe)| (key, probe.history()))
    }

    /// Let every probe record its signal
    fn sample_probes(&mut self) {
        for probe in self.probes.values_mut() {
            probe.sample(&self.signals, self.time_step);
        }
    }

    /// Check that the chunk can still be modified
    fn ensure_building(&self) -> BuildResult<()> {
        if self.stepping {
            Err(BuildError::AlreadyStepping)
        } else {
            Ok(())
        }
    }
}
//
impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "<Chunk {:?} dt={} time_step={}",
            self.label, self.dt, self.time_step
        )?;
        writeln!(f, "  Signals:")?;
        for signal in self.signals.iter() {
            let [rows, cols] = self.signals.shape(signal);
            writeln!(
                f,
                "    {signal}: {:?} ({rows}x{cols})",
                self.signals.label(signal)
            )?;
        }
        writeln!(f, "  Operators:")?;
        for op in &self.operators {
            writeln!(f, "    {op}")?;
        }
        writeln!(f, "  Probes:")?;
        for probe in self.probes.values() {
            writeln!(f, "    {probe}")?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use data::{column, scalar};
    use ndarray::array;

    fn init_logger() {
        static INIT_LOGGER: std::sync::Once = std::sync::Once::new();
        INIT_LOGGER.call_once(|| env_logger::init());
    }

    /// Chunk computing y ← 0.5·y + [[1, 2], [3, 4]]·x with x reset to 1
    fn leaky_chunk() -> Chunk {
        init_logger();
        let mut chunk = Chunk::new("leaky", 0.001);
        chunk.add_signal(1, "A", array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        chunk.add_signal(2, "x", column(&[0.0, 0.0])).unwrap();
        chunk.add_signal(3, "decay", scalar(0.5)).unwrap();
        chunk.add_signal(4, "y", column(&[0.0, 0.0])).unwrap();
        chunk.add_op("Reset;2;1").unwrap();
        chunk.add_op("ProdUpdate;1;2;3;4").unwrap();
        chunk
    }

    #[test]
    fn operators_run_in_order() {
        let mut chunk = leaky_chunk();
        chunk.run_n_steps(1).unwrap();
        // Reset ran before ProdUpdate within the first step
        assert_eq!(*chunk.signal(4).unwrap(), column(&[3.0, 7.0]));
        chunk.run_n_steps(1).unwrap();
        assert_eq!(*chunk.signal(4).unwrap(), column(&[4.5, 10.5]));
        assert_eq!(chunk.time_step(), 2);

        // Converges to 2·A·x
        chunk.run_n_steps(100).unwrap();
        let y = chunk.signal(4).unwrap();
        assert_relative_eq!(y[[0, 0]], 6.0, epsilon = 1e-9);
        assert_relative_eq!(y[[1, 0]], 14.0, epsilon = 1e-9);
    }

    #[test]
    fn probe_sample_count() {
        for (period, num_steps) in [(1.0, 10), (3.0, 10), (4.0, 12), (7.0, 3)] {
            let mut chunk = leaky_chunk();
            chunk.add_probe(10, 4, period).unwrap();
            chunk.run_n_steps(num_steps).unwrap();
            let samples = chunk.probe_history(10).unwrap().len() as u64;
            assert_eq!(samples, num_steps / period as u64 + 1);
        }
    }

    #[test]
    fn split_runs_sample_like_one_run() {
        let mut whole = leaky_chunk();
        whole.add_probe(10, 4, 2.0).unwrap();
        whole.run_n_steps(9).unwrap();

        let mut split = leaky_chunk();
        split.add_probe(10, 4, 2.0).unwrap();
        for num_steps in [2, 0, 3, 4] {
            split.run_n_steps(num_steps).unwrap();
        }
        assert_eq!(whole.probe_history(10), split.probe_history(10));
        assert_eq!(whole.probe_history(10).unwrap()[0], column(&[0.0, 0.0]));
    }

    #[test]
    fn frozen_after_stepping() {
        let mut chunk = leaky_chunk();
        chunk.run_n_steps(0).unwrap();
        assert!(matches!(
            chunk.add_signal(5, "late", scalar(0.0)),
            Err(BuildError::AlreadyStepping)
        ));
        assert!(matches!(
            chunk.add_op("Reset;4;0"),
            Err(BuildError::AlreadyStepping)
        ));
        assert!(matches!(
            chunk.add_probe(1, 4, 1.0),
            Err(BuildError::AlreadyStepping)
        ));
    }

    #[test]
    fn build_errors() {
        let mut chunk = leaky_chunk();
        assert!(matches!(
            chunk.add_op("Copy;2;99"),
            Err(BuildError::UnknownSignal(99))
        ));
        assert!(matches!(
            chunk.add_op("Copy;2"),
            Err(BuildError::Descriptor(_))
        ));
        chunk.add_probe(1, 4, 1.0).unwrap();
        assert!(matches!(
            chunk.add_probe(1, 2, 1.0),
            Err(BuildError::DuplicateProbe(1))
        ));
        assert_eq!(chunk.operators().len(), 2);
    }

    #[test]
    fn commands_replay() {
        let mut chunk = Chunk::new("replayed", 0.001);
        for command in [
            BuildCommand::AddSignal {
                key: 1,
                label: "x".into(),
                data: column(&[0.0; 3]),
            },
            BuildCommand::AddOp {
                descriptor: "Reset;1;2.5".into(),
            },
            BuildCommand::AddProbe {
                probe_key: 7,
                signal_key: 1,
                period: 1.0,
            },
            BuildCommand::Stop,
        ] {
            chunk.apply(command).unwrap();
        }
        chunk.run_n_steps(2).unwrap();
        let history = chunk.probe_history(7).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], column(&[2.5; 3]));
    }

    #[test]
    fn exchanges_need_binding() {
        let mut chunk = leaky_chunk();
        chunk.add_op("MPISend;1;4;4").unwrap();
        assert!(chunk.has_unbound_exchanges());
        assert!(chunk.run_n_steps(1).is_err());

        let group = ProcessGroup::local(2).remove(0);
        let mut chunk = leaky_chunk();
        chunk.add_op("MPISend;1;4;4").unwrap();
        chunk.bind_group(&group).unwrap();
        assert!(!chunk.has_unbound_exchanges());
        chunk.run_n_steps(3).unwrap();
    }

    #[test]
    fn display_lists_contents() {
        let mut chunk = leaky_chunk();
        chunk.add_probe(10, 4, 1.0).unwrap();
        let text = chunk.to_string();
        assert!(text.starts_with("<Chunk \"leaky\" dt=0.001"));
        assert!(text.contains("    4: \"y\" (2x1)"));
        assert!(text.contains("    ProdUpdate(A=1, X=2, B=3, Y=4)"));
        assert!(text.contains("    Probe(key=10, signal=4, period=1, samples=0)"));
        assert!(text.ends_with('>'));
    }
}
