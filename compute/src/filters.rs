//! Synaptic filters
//!
//! These implement discretized linear synapse models. The simplest ones only
//! feed the output of the previous step back into the current one, while the
//! general [`Synapse`] keeps as much input and output history as its
//! coefficients require.

use crate::{
    signals::{SignalRef, SignalTable},
    BuildError, BuildResult,
};
use data::{Matrix, Precision, SignalKey};
use ndarray::Zip;
use std::{collections::VecDeque, fmt};

/// Resolve an input and output signal of identical shapes
fn filter_signals(
    op: &'static str,
    signals: &SignalTable,
    input: SignalKey,
    output: SignalKey,
) -> BuildResult<(SignalRef, SignalRef)> {
    let output = signals.resolve(output)?;
    let input = signals.resolve_shaped(op, input, signals.shape(output))?;
    Ok((input, output))
}

/// First-order low-pass filter: output ← b·input − a·output
#[derive(Debug)]
pub struct SimpleSynapse {
    /// Filtered signal
    input: SignalRef,

    /// Filter state and output
    output: SignalRef,

    /// Feedback coefficient
    a: Precision,

    /// Input gain
    b: Precision,
}
//
impl SimpleSynapse {
    pub(crate) fn new(
        signals: &SignalTable,
        input: SignalKey,
        output: SignalKey,
        a: Precision,
        b: Precision,
    ) -> BuildResult<Self> {
        let (input, output) = filter_signals("SimpleSynapse", signals, input, output)?;
        Ok(Self {
            input,
            output,
            a,
            b,
        })
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) {
        let (a, b) = (self.a, self.b);
        let input = signals.read_input(self.input, self.output);
        let mut output = signals.write(self.output);
        Zip::from(&mut *output)
            .and(&*input)
            .for_each(|output, &input| *output = b * input - a * *output);
    }
}
//
impl fmt::Display for SimpleSynapse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimpleSynapse(input={}, output={}, a={}, b={})",
            self.input, self.output, self.a, self.b
        )
    }
}

/// Memoryless synapse: output ← b·input
#[derive(Debug)]
pub struct NoDenSynapse {
    /// Scaled signal
    input: SignalRef,

    /// Output
    output: SignalRef,

    /// Input gain
    b: Precision,
}
//
impl NoDenSynapse {
    pub(crate) fn new(
        signals: &SignalTable,
        input: SignalKey,
        output: SignalKey,
        b: Precision,
    ) -> BuildResult<Self> {
        let (input, output) = filter_signals("NoDenSynapse", signals, input, output)?;
        Ok(Self { input, output, b })
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) {
        let b = self.b;
        let input = signals.read_input(self.input, self.output);
        let mut output = signals.write(self.output);
        Zip::from(&mut *output)
            .and(&*input)
            .for_each(|output, &input| *output = b * input);
    }
}
//
impl fmt::Display for NoDenSynapse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NoDenSynapse(input={}, output={}, b={})",
            self.input, self.output, self.b
        )
    }
}

/// General linear filter, in direct form
///
/// output[k] = Σᵢ num[i]·input[k−i] − Σᵢ den[i]·output[k−1−i]
///
/// Inputs and outputs from before the first step count as zero. The leading
/// coefficient of the denominator is assumed to be 1 and left out of `den`.
#[derive(Debug)]
pub struct Synapse {
    /// Filtered signal
    input: SignalRef,

    /// Output
    output: SignalRef,

    /// Numerator coefficients, applied to the current and past inputs
    num: Vec<Precision>,

    /// Denominator coefficients, applied to past outputs
    den: Vec<Precision>,

    /// Past inputs, most recent first
    inputs: VecDeque<Matrix>,

    /// Past outputs, most recent first
    outputs: VecDeque<Matrix>,
}
//
impl Synapse {
    pub(crate) fn new(
        signals: &SignalTable,
        input: SignalKey,
        output: SignalKey,
        num: &[Precision],
        den: &[Precision],
    ) -> BuildResult<Self> {
        let (input, output) = filter_signals("Synapse", signals, input, output)?;
        if let Some(&value) = num.iter().chain(den).find(|c| !c.is_finite()) {
            return Err(BuildError::InvalidParameter {
                op: "Synapse",
                name: "coefficient",
                value,
            });
        }
        Ok(Self {
            input,
            output,
            num: num.to_vec(),
            den: den.to_vec(),
            inputs: VecDeque::with_capacity(num.len()),
            outputs: VecDeque::with_capacity(den.len()),
        })
    }

    pub(crate) fn invoke(&mut self, signals: &SignalTable) {
        let input = signals.read_input(self.input, self.output);
        remember(&mut self.inputs, self.num.len(), &input);
        let mut output = signals.write(self.output);
        output.fill(0.0);
        for (&b, past_input) in self.num.iter().zip(&self.inputs) {
            output.scaled_add(b, past_input);
        }
        for (&a, past_output) in self.den.iter().zip(&self.outputs) {
            output.scaled_add(-a, past_output);
        }
        remember(&mut self.outputs, self.den.len(), &output);
    }
}
//
impl fmt::Display for Synapse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Synapse(input={}, output={}, num={:?}, den={:?})",
            self.input, self.output, self.num, self.den
        )
    }
}

/// Push a value at the front of a history of at most `depth` values
fn remember(history: &mut VecDeque<Matrix>, depth: usize, value: &Matrix) {
    if depth == 0 {
        return;
    }
    // Recycle the oldest entry once the history is full
    let entry = if history.len() == depth {
        history.pop_back()
    } else {
        None
    };
    let entry = match entry {
        Some(mut entry) => {
            entry.assign(value);
            entry
        }
        None => value.clone(),
    };
    history.push_front(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use data::{column, scalar};

    #[test]
    fn simple_synapse_converges() {
        let mut signals = SignalTable::default();
        signals.insert(1, "in", column(&[1.0, -2.0])).unwrap();
        signals.insert(2, "out", column(&[0.0, 0.0])).unwrap();

        // y[k+1] = 0.1·x + 0.9·y[k] converges to x
        let synapse = SimpleSynapse::new(&signals, 1, 2, -0.9, 0.1).unwrap();
        synapse.invoke(&signals);
        assert_relative_eq!(signals.get(2).unwrap()[[0, 0]], 0.1);
        for _ in 0..500 {
            synapse.invoke(&signals);
        }
        let output = signals.get(2).unwrap();
        assert_relative_eq!(output[[0, 0]], 1.0, epsilon = 1e-9);
        assert_relative_eq!(output[[1, 0]], -2.0, epsilon = 1e-9);
    }

    #[test]
    fn no_den_synapse_scales() {
        let mut signals = SignalTable::default();
        signals.insert(1, "in", column(&[1.0, -2.0])).unwrap();
        signals.insert(2, "out", column(&[7.0, 7.0])).unwrap();
        let synapse = NoDenSynapse::new(&signals, 1, 2, 0.5).unwrap();
        synapse.invoke(&signals);
        assert_eq!(*signals.get(2).unwrap(), column(&[0.5, -1.0]));

        // Filtering a signal in place
        let in_place = NoDenSynapse::new(&signals, 2, 2, 0.5).unwrap();
        in_place.invoke(&signals);
        assert_eq!(*signals.get(2).unwrap(), column(&[0.25, -0.5]));
    }

    #[test]
    fn second_order_synapse_response() {
        let mut signals = SignalTable::default();
        signals.insert(1, "in", column(&[1.0, 2.0])).unwrap();
        signals.insert(2, "out", column(&[0.0, 0.0])).unwrap();

        // y[k] = 0.5·x[k] + 0.25·x[k−1] + 0.5·y[k−1] − 0.1·y[k−2]
        let mut synapse = Synapse::new(&signals, 1, 2, &[0.5, 0.25], &[-0.5, 0.1]).unwrap();
        let mut response = Vec::new();
        for step in 0..5 {
            if step == 4 {
                signals.write(signals.resolve(1).unwrap()).fill(0.0);
            }
            synapse.invoke(&signals);
            response.push(signals.get(2).unwrap()[[0, 0]]);
        }
        for (actual, expected) in response.iter().zip([0.5, 1.0, 1.2, 1.25, 0.755]) {
            assert_relative_eq!(*actual, expected, epsilon = 1e-12);
        }

        // Linearity: the second element sees twice the input
        assert_relative_eq!(signals.get(2).unwrap()[[1, 0]], 2.0 * 0.755, epsilon = 1e-12);
    }

    #[test]
    fn synapse_without_denominator_is_a_fir_filter() {
        let mut signals = SignalTable::default();
        signals.insert(1, "in", scalar(1.0)).unwrap();
        signals.insert(2, "out", scalar(0.0)).unwrap();
        let mut synapse = Synapse::new(&signals, 1, 2, &[0.0, 0.0, 3.0], &[]).unwrap();
        let mut response = Vec::new();
        for _ in 0..4 {
            synapse.invoke(&signals);
            response.push(signals.get(2).unwrap()[[0, 0]]);
        }
        assert_eq!(response, vec![0.0, 0.0, 3.0, 3.0]);
        assert!(matches!(
            Synapse::new(&signals, 1, 2, &[Precision::NAN], &[]),
            Err(BuildError::InvalidParameter { op: "Synapse", .. })
        ));
    }
}
