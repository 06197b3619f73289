//! Neuron population operators
//!
//! All populations read an `[n, 1]` input current J and write an `[n, 1]`
//! output. Spiking neurons output `1/dt` on steps where they spike and 0
//! otherwise, so that the output integrates to the spike count.

use crate::{
    descriptor::NeuronSpec,
    signals::{SignalRef, SignalTable},
    BuildError, BuildResult,
};
use data::{Precision, SignalKey};
use ndarray::{Array1, Zip};
use std::fmt;

/// Parameters shared by the LIF neuron models
#[derive(Clone, Copy, Debug, PartialEq)]
struct LifParameters {
    /// Membrane RC time constant (s)
    tau_rc: Precision,

    /// Refractory period (s)
    tau_ref: Precision,

    /// Simulation timestep (s)
    dt: Precision,
}

/// Resolve the J and output signals of an `n`-neuron population
fn population_signals(
    op: &'static str,
    signals: &SignalTable,
    num_neurons: usize,
    j: SignalKey,
    output: SignalKey,
) -> BuildResult<(SignalRef, SignalRef)> {
    if num_neurons == 0 {
        return Err(BuildError::InvalidParameter {
            op,
            name: "neuron count",
            value: 0.0,
        });
    }
    let shape = [num_neurons, 1];
    let j = signals.resolve_shaped(op, j, shape)?;
    let output = signals.resolve_shaped(op, output, shape)?;
    Ok((j, output))
}

/// Validate and resolve the common part of a LIF operator
fn lif_setup(
    op: &'static str,
    signals: &SignalTable,
    spec: &NeuronSpec,
) -> BuildResult<(LifParameters, SignalRef, SignalRef)> {
    let check = |name: &'static str, value: Precision, valid: bool| {
        if valid && value.is_finite() {
            Ok(())
        } else {
            Err(BuildError::InvalidParameter { op, name, value })
        }
    };
    check("tau_rc", spec.tau_rc, spec.tau_rc > 0.0)?;
    check("tau_ref", spec.tau_ref, spec.tau_ref >= 0.0)?;
    check("dt", spec.dt, spec.dt > 0.0)?;
    let (j, output) = population_signals(op, signals, spec.num_neurons, spec.j, spec.output)?;
    let params = LifParameters {
        tau_rc: spec.tau_rc,
        tau_ref: spec.tau_ref,
        dt: spec.dt,
    };
    Ok((params, j, output))
}

/// Spiking leaky integrate-and-fire neurons
///
/// Between spikes, the membrane voltage V of each neuron relaxes towards its
/// input current J with time constant `tau_rc`, which is integrated exactly
/// over each step under the assumption that J is constant during the step.
/// When V crosses the threshold of 1, the neuron emits a spike, its voltage
/// is reset to 0, and it stays silent for `tau_ref` seconds.
///
/// Spike times and refractory periods are tracked with sub-step accuracy: the
/// time at which V crossed the threshold is recovered from the step's final
/// voltage, and the refractory period starts from there. A neuron leaving its
/// refractory period in the middle of a step only integrates over the
/// remaining fraction of the step.
#[derive(Debug)]
pub struct SimLif {
    /// Model parameters
    params: LifParameters,

    /// Input current
    j: SignalRef,

    /// Spike output
    output: SignalRef,

    /// Membrane voltage of each neuron
    voltage: Array1<Precision>,

    /// Remaining refractory time of each neuron (s)
    refractory_time: Array1<Precision>,

    /// Integration multiplier of each neuron over the current step
    multiplier: Array1<Precision>,

    /// Voltage change of each neuron over the current step
    dv: Array1<Precision>,

    /// Integration multiplier of neurons integrating over a full step
    full_step_multiplier: Precision,
}
//
impl SimLif {
    pub(crate) fn new(signals: &SignalTable, spec: &NeuronSpec) -> BuildResult<Self> {
        let (params, j, output) = lif_setup("SimLIF", signals, spec)?;
        let n = spec.num_neurons;
        Ok(Self {
            params,
            j,
            output,
            voltage: Array1::zeros(n),
            refractory_time: Array1::zeros(n),
            multiplier: Array1::zeros(n),
            dv: Array1::zeros(n),
            full_step_multiplier: -(-params.dt / params.tau_rc).exp_m1(),
        })
    }

    /// Membrane voltage of each neuron
    pub fn voltage(&self) -> &Array1<Precision> {
        &self.voltage
    }

    pub(crate) fn invoke(&mut self, signals: &SignalTable) {
        let LifParameters {
            tau_rc,
            tau_ref,
            dt,
        } = self.params;
        let full_step_multiplier = self.full_step_multiplier;

        // Work out how long each neuron integrates during this step
        Zip::from(&mut self.multiplier)
            .and(&mut self.refractory_time)
            .for_each(|multiplier, refractory_time| {
                *refractory_time -= dt;
                let integration_time = (dt - *refractory_time).clamp(0.0, dt);
                *multiplier = if integration_time == dt {
                    full_step_multiplier
                } else {
                    -(-integration_time / tau_rc).exp_m1()
                };
            });

        // Integrate, then detect spikes
        let j = signals.read_input(self.j, self.output);
        let mut output = signals.write(self.output);
        Zip::from(j.column(0))
            .and(output.column_mut(0))
            .and(&mut self.voltage)
            .and(&mut self.refractory_time)
            .and(&self.multiplier)
            .and(&mut self.dv)
            .for_each(|&j, output, voltage, refractory_time, &multiplier, dv| {
                *dv = (j - *voltage) * multiplier;
                *voltage += *dv;
                if *voltage > 1.0 {
                    let overshoot = (*voltage - 1.0) / (j - 1.0);
                    let spike_time = (dt + tau_rc * (-overshoot).ln_1p()).clamp(0.0, dt);
                    *output = 1.0 / dt;
                    *voltage = 0.0;
                    *refractory_time = tau_ref + spike_time;
                } else {
                    *output = 0.0;
                    *voltage = voltage.max(0.0);
                }
            });
    }
}
//
impl fmt::Display for SimLif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimLIF(n={}, tau_rc={}, tau_ref={}, dt={}, J={}, output={})",
            self.voltage.len(),
            self.params.tau_rc,
            self.params.tau_ref,
            self.params.dt,
            self.j,
            self.output
        )
    }
}

/// Rate-based leaky integrate-and-fire neurons
///
/// Outputs the steady-state firing rate of a LIF neuron under constant input
/// J, which is zero when J does not exceed the firing threshold of 1.
#[derive(Debug)]
pub struct SimLifRate {
    /// Model parameters
    params: LifParameters,

    /// Number of neurons
    num_neurons: usize,

    /// Input current
    j: SignalRef,

    /// Firing rate output
    output: SignalRef,
}
//
impl SimLifRate {
    pub(crate) fn new(signals: &SignalTable, spec: &NeuronSpec) -> BuildResult<Self> {
        let (params, j, output) = lif_setup("SimLIFRate", signals, spec)?;
        Ok(Self {
            params,
            num_neurons: spec.num_neurons,
            j,
            output,
        })
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) {
        let LifParameters {
            tau_rc, tau_ref, ..
        } = self.params;
        let j = signals.read_input(self.j, self.output);
        let mut output = signals.write(self.output);
        Zip::from(&mut *output).and(&*j).for_each(|output, &j| {
            let excess = j - 1.0;
            *output = if excess > 0.0 {
                1.0 / (tau_ref + tau_rc * (1.0 / excess).ln_1p())
            } else {
                0.0
            };
        });
    }
}
//
impl fmt::Display for SimLifRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimLIFRate(n={}, tau_rc={}, tau_ref={}, dt={}, J={}, output={})",
            self.num_neurons,
            self.params.tau_rc,
            self.params.tau_ref,
            self.params.dt,
            self.j,
            self.output
        )
    }
}

/// Rectified linear units: output ← max(J, 0)
#[derive(Debug)]
pub struct RectifiedLinear {
    /// Number of neurons
    num_neurons: usize,

    /// Input current
    j: SignalRef,

    /// Output
    output: SignalRef,
}
//
impl RectifiedLinear {
    pub(crate) fn new(
        signals: &SignalTable,
        num_neurons: usize,
        j: SignalKey,
        output: SignalKey,
    ) -> BuildResult<Self> {
        let (j, output) =
            population_signals("RectifiedLinear", signals, num_neurons, j, output)?;
        Ok(Self {
            num_neurons,
            j,
            output,
        })
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) {
        let j = signals.read_input(self.j, self.output);
        let mut output = signals.write(self.output);
        Zip::from(&mut *output)
            .and(&*j)
            .for_each(|output, &j| *output = j.max(0.0));
    }
}
//
impl fmt::Display for RectifiedLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RectifiedLinear(n={}, J={}, output={})",
            self.num_neurons, self.j, self.output
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Operator;
    use approx::assert_relative_eq;
    use data::column;

    const DT: Precision = 0.001;
    const TAU_RC: Precision = 0.02;
    const TAU_REF: Precision = 0.002;

    /// Steady-state inter-spike interval of a LIF neuron
    fn lif_period(j: Precision) -> Precision {
        TAU_REF + TAU_RC * (1.0 / (j - 1.0)).ln_1p()
    }

    fn population(currents: &[Precision]) -> SignalTable {
        let mut signals = SignalTable::default();
        signals.insert(1, "J", column(currents)).unwrap();
        signals
            .insert(2, "output", column(&vec![0.0; currents.len()]))
            .unwrap();
        signals
    }

    fn neuron_spec(n: usize) -> NeuronSpec {
        NeuronSpec {
            num_neurons: n,
            tau_rc: TAU_RC,
            tau_ref: TAU_REF,
            dt: DT,
            j: 1,
            output: 2,
        }
    }

    #[test]
    fn lif_spike_count_matches_rate() {
        let currents = [0.5, 1.0, 1.5, 2.0, 5.0];
        let signals = population(&currents);
        let mut lif = SimLif::new(&signals, &neuron_spec(currents.len())).unwrap();
        let num_steps = 1000;
        let mut spike_steps = vec![Vec::new(); currents.len()];
        for step in 0..num_steps {
            lif.invoke(&signals);
            let output = signals.get(2).unwrap();
            for (neuron, &value) in output.iter().enumerate() {
                assert!(value == 0.0 || value == 1.0 / DT);
                if value > 0.0 {
                    spike_steps[neuron].push(step);
                }
            }
            assert!(lif.voltage().iter().all(|&v| (0.0..=1.0).contains(&v)));
        }

        // Sub-threshold neurons never fire
        assert!(spike_steps[0].is_empty());
        assert!(spike_steps[1].is_empty());

        // Others fire at their analytical rate
        let duration = num_steps as Precision * DT;
        for (neuron, &j) in currents.iter().enumerate().skip(2) {
            let spikes = &spike_steps[neuron];
            let expected = duration / lif_period(j);
            assert!((spikes.len() as Precision - expected).abs() <= 1.0);

            let mean_interval = (spikes[spikes.len() - 1] - spikes[0]) as Precision * DT
                / (spikes.len() - 1) as Precision;
            assert_relative_eq!(mean_interval, lif_period(j), max_relative = 0.01);
        }
    }

    #[test]
    fn lif_rate_matches_analytical_rate() {
        let currents = [-1.0, 1.0, 2.0, 3.0];
        let signals = population(&currents);
        let rate = SimLifRate::new(&signals, &neuron_spec(currents.len())).unwrap();
        rate.invoke(&signals);
        let output = signals.get(2).unwrap();
        assert_eq!(output[[0, 0]], 0.0);
        assert_eq!(output[[1, 0]], 0.0);
        assert_relative_eq!(output[[2, 0]], 1.0 / lif_period(2.0), max_relative = 1e-12);
        assert_relative_eq!(output[[3, 0]], 1.0 / lif_period(3.0), max_relative = 1e-12);
    }

    #[test]
    fn lif_parameters_are_validated() {
        let signals = population(&[1.0; 3]);
        let bad_specs = [
            NeuronSpec {
                tau_rc: 0.0,
                ..neuron_spec(3)
            },
            NeuronSpec {
                tau_ref: -1.0,
                ..neuron_spec(3)
            },
            NeuronSpec {
                dt: Precision::NAN,
                ..neuron_spec(3)
            },
        ];
        for spec in &bad_specs {
            assert!(matches!(
                SimLif::new(&signals, spec),
                Err(BuildError::InvalidParameter { op: "SimLIF", .. })
            ));
        }
        assert!(matches!(
            SimLif::new(&signals, &neuron_spec(4)),
            Err(BuildError::ShapeMismatch { key: 1, .. })
        ));
    }

    #[test]
    fn rectified_linear_clips_negative_inputs() {
        let signals = population(&[-2.0, 0.0, 3.5]);
        let spec = "RectifiedLinear;3;1;2".parse().unwrap();
        let mut op = Operator::build(&spec, &signals).unwrap();
        op.invoke(&signals).unwrap();
        assert_eq!(*signals.get(2).unwrap(), column(&[0.0, 0.0, 3.5]));
    }
}
