//! Operators and the arithmetic operator kinds
//!
//! Every operator is constructed from its descriptor against a signal table,
//! which resolves signal keys and checks shapes once and for all. Invoking an
//! operator then only borrows the signals it touches and updates its output
//! in place.

use crate::{
    descriptor::OpSpec,
    exchange::{MpiReceive, MpiSend},
    filters::{NoDenSynapse, SimpleSynapse, Synapse},
    neurons::{RectifiedLinear, SimLif, SimLifRate},
    signals::{SignalRef, SignalTable},
    BuildError, BuildResult, StepResult,
};
use data::{Matrix, Precision, SignalKey};
use ndarray::{linalg::general_mat_mul, Zip};
use std::fmt;

/// Simulation operator, invoked once per time step
#[derive(Debug)]
pub enum Operator {
    Reset(Reset),
    Copy(SignalCopy),
    DotInc(DotInc),
    ElementwiseInc(ElementwiseInc),
    ProdUpdate(ProdUpdate),
    SimLif(SimLif),
    SimLifRate(SimLifRate),
    RectifiedLinear(RectifiedLinear),
    SimpleSynapse(SimpleSynapse),
    NoDenSynapse(NoDenSynapse),
    Synapse(Synapse),
    MpiSend(MpiSend),
    MpiReceive(MpiReceive),
}
//
impl Operator {
    /// Build an operator from its descriptor
    pub fn build(spec: &OpSpec, signals: &SignalTable) -> BuildResult<Self> {
        let op = match *spec {
            OpSpec::Reset { dst, value } => Self::Reset(Reset::new(signals, dst, value)?),
            OpSpec::Copy { dst, src } => Self::Copy(SignalCopy::new(signals, dst, src)?),
            OpSpec::DotInc { a, x, y } => Self::DotInc(DotInc::new(signals, a, x, y)?),
            OpSpec::ElementwiseInc { a, x, y } => {
                Self::ElementwiseInc(ElementwiseInc::new(signals, a, x, y)?)
            }
            OpSpec::ProdUpdate { a, x, b, y } => {
                Self::ProdUpdate(ProdUpdate::new(signals, a, x, b, y)?)
            }
            OpSpec::SimLif(ref neurons) => Self::SimLif(SimLif::new(signals, neurons)?),
            OpSpec::SimLifRate(ref neurons) => {
                Self::SimLifRate(SimLifRate::new(signals, neurons)?)
            }
            OpSpec::RectifiedLinear {
                num_neurons,
                j,
                output,
            } => Self::RectifiedLinear(RectifiedLinear::new(signals, num_neurons, j, output)?),
            OpSpec::SimpleSynapse {
                input,
                output,
                a,
                b,
            } => Self::SimpleSynapse(SimpleSynapse::new(signals, input, output, a, b)?),
            OpSpec::NoDenSynapse { input, output, b } => {
                Self::NoDenSynapse(NoDenSynapse::new(signals, input, output, b)?)
            }
            OpSpec::Synapse {
                input,
                output,
                ref num,
                ref den,
            } => Self::Synapse(Synapse::new(signals, input, output, &num.0, &den.0)?),
            OpSpec::MpiSend { peer, tag, signal } => {
                Self::MpiSend(MpiSend::new(signals, peer, tag, signal)?)
            }
            OpSpec::MpiReceive { peer, tag, signal } => {
                Self::MpiReceive(MpiReceive::new(signals, peer, tag, signal)?)
            }
        };
        Ok(op)
    }

    /// Perform this operator's update for one time step
    ///
    /// Only the communication operators can fail.
    pub fn invoke(&mut self, signals: &SignalTable) -> StepResult<()> {
        match self {
            Self::Reset(op) => op.invoke(signals),
            Self::Copy(op) => op.invoke(signals),
            Self::DotInc(op) => op.invoke(signals),
            Self::ElementwiseInc(op) => op.invoke(signals),
            Self::ProdUpdate(op) => op.invoke(signals),
            Self::SimLif(op) => op.invoke(signals),
            Self::SimLifRate(op) => op.invoke(signals),
            Self::RectifiedLinear(op) => op.invoke(signals),
            Self::SimpleSynapse(op) => op.invoke(signals),
            Self::NoDenSynapse(op) => op.invoke(signals),
            Self::Synapse(op) => op.invoke(signals),
            Self::MpiSend(op) => return op.invoke(signals),
            Self::MpiReceive(op) => return op.invoke(signals),
        }
        Ok(())
    }
}
//
impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset(op) => write!(f, "{op}"),
            Self::Copy(op) => write!(f, "{op}"),
            Self::DotInc(op) => write!(f, "{op}"),
            Self::ElementwiseInc(op) => write!(f, "{op}"),
            Self::ProdUpdate(op) => write!(f, "{op}"),
            Self::SimLif(op) => write!(f, "{op}"),
            Self::SimLifRate(op) => write!(f, "{op}"),
            Self::RectifiedLinear(op) => write!(f, "{op}"),
            Self::SimpleSynapse(op) => write!(f, "{op}"),
            Self::NoDenSynapse(op) => write!(f, "{op}"),
            Self::Synapse(op) => write!(f, "{op}"),
            Self::MpiSend(op) => write!(f, "{op}"),
            Self::MpiReceive(op) => write!(f, "{op}"),
        }
    }
}

/// Overwrite every element of a signal with a constant
#[derive(Debug)]
pub struct Reset {
    /// Output signal
    dst: SignalRef,

    /// Constant to be written
    value: Precision,
}
//
impl Reset {
    fn new(signals: &SignalTable, dst: SignalKey, value: Precision) -> BuildResult<Self> {
        Ok(Self {
            dst: signals.resolve(dst)?,
            value,
        })
    }

    fn invoke(&self, signals: &SignalTable) {
        signals.write(self.dst).fill(self.value);
    }
}
//
impl fmt::Display for Reset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reset(dst={}, value={})", self.dst, self.value)
    }
}

/// Overwrite a signal with the value of another signal of the same shape
#[derive(Debug)]
pub struct SignalCopy {
    /// Output signal
    dst: SignalRef,

    /// Input signal
    src: SignalRef,
}
//
impl SignalCopy {
    fn new(signals: &SignalTable, dst: SignalKey, src: SignalKey) -> BuildResult<Self> {
        let dst = signals.resolve(dst)?;
        let src = signals.resolve_shaped("Copy", src, signals.shape(dst))?;
        Ok(Self { dst, src })
    }

    fn invoke(&self, signals: &SignalTable) {
        let src = signals.read_input(self.src, self.dst);
        signals.write(self.dst).assign(&*src);
    }
}
//
impl fmt::Display for SignalCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Copy(dst={}, src={})", self.dst, self.src)
    }
}

/// Check that a factor is either 1x1 or has the `full` shape
fn check_gain(
    op: &'static str,
    signals: &SignalTable,
    a: SignalRef,
    full: [usize; 2],
) -> BuildResult<()> {
    match signals.shape(a) {
        [1, 1] => Ok(()),
        found if found == full => Ok(()),
        found => Err(BuildError::ShapeMismatch {
            op,
            key: a.key(),
            expected: full,
            found,
        }),
    }
}

/// Accumulate a matrix-vector product: Y ← Y + A·X
///
/// A is an `[m, n]` matrix, X an `[n, 1]` vector and Y an `[m, 1]` vector.
/// A 1x1 A is also accepted, and then acts as a scalar gain on a X of the same
/// shape as Y.
#[derive(Debug)]
pub struct DotInc {
    /// Matrix or scalar gain
    a: SignalRef,

    /// Input vector
    x: SignalRef,

    /// Accumulator
    y: SignalRef,

    /// A is a 1x1 gain
    scalar_a: bool,
}
//
impl DotInc {
    fn new(signals: &SignalTable, a: SignalKey, x: SignalKey, y: SignalKey) -> BuildResult<Self> {
        let y = signals.resolve(y)?;
        let [m, cols] = signals.shape(y);
        let [n, _] = signals.shape(signals.resolve(x)?);
        let x = signals.resolve_shaped("DotInc", x, [n, cols])?;
        let a = signals.resolve(a)?;
        let scalar_a = if signals.shape(a) == [1, 1] && n == m {
            true
        } else {
            signals.resolve_shaped("DotInc", a.key(), [m, n])?;
            false
        };
        Ok(Self { a, x, y, scalar_a })
    }

    fn invoke(&self, signals: &SignalTable) {
        let a = signals.read_input(self.a, self.y);
        let x = signals.read_input(self.x, self.y);
        self.accumulate(&a, &x, &mut signals.write(self.y));
    }

    /// Y ← Y + A·X, for the current values of A, X and Y
    fn accumulate(&self, a: &Matrix, x: &Matrix, y: &mut Matrix) {
        if self.scalar_a {
            y.scaled_add(a[[0, 0]], x);
        } else {
            general_mat_mul(1.0, a, x, 1.0, y);
        }
    }
}
//
impl fmt::Display for DotInc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DotInc(A={}, X={}, Y={})", self.a, self.x, self.y)
    }
}

/// Accumulate an elementwise product: Y ← Y + A∘X
///
/// A and X must either have the same shape as Y, or be 1x1.
#[derive(Debug)]
pub struct ElementwiseInc {
    /// First factor
    a: SignalRef,

    /// Second factor
    x: SignalRef,

    /// Accumulator
    y: SignalRef,
}
//
impl ElementwiseInc {
    fn new(signals: &SignalTable, a: SignalKey, x: SignalKey, y: SignalKey) -> BuildResult<Self> {
        let y = signals.resolve(y)?;
        let full = signals.shape(y);
        let a = signals.resolve(a)?;
        check_gain("ElementwiseInc", signals, a, full)?;
        let x = signals.resolve(x)?;
        check_gain("ElementwiseInc", signals, x, full)?;
        Ok(Self { a, x, y })
    }

    fn invoke(&self, signals: &SignalTable) {
        let a = signals.read_input(self.a, self.y);
        let x = signals.read_input(self.x, self.y);
        let mut y = signals.write(self.y);
        Zip::from(&mut *y)
            .and_broadcast(&*a)
            .and_broadcast(&*x)
            .for_each(|y, &a, &x| *y += a * x);
    }
}
//
impl fmt::Display for ElementwiseInc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementwiseInc(A={}, X={}, Y={})", self.a, self.x, self.y)
    }
}

/// Decay and accumulate: Y ← A·X + B∘Y
///
/// A follows the same rules as in [`DotInc`]. B must either be 1x1 or have
/// the same shape as Y.
#[derive(Debug)]
pub struct ProdUpdate {
    /// Product part, following the [`DotInc`] rules
    dot: DotInc,

    /// Decay factor
    b: SignalRef,
}
//
impl ProdUpdate {
    fn new(
        signals: &SignalTable,
        a: SignalKey,
        x: SignalKey,
        b: SignalKey,
        y: SignalKey,
    ) -> BuildResult<Self> {
        let dot = DotInc::new(signals, a, x, y)?;
        let b = signals.resolve(b)?;
        check_gain("ProdUpdate", signals, b, signals.shape(dot.y))?;
        Ok(Self { dot, b })
    }

    fn invoke(&self, signals: &SignalTable) {
        // Every input is read as it was before Y changes
        let a = signals.read_input(self.dot.a, self.dot.y);
        let x = signals.read_input(self.dot.x, self.dot.y);
        let b = signals.read_input(self.b, self.dot.y);
        let mut y = signals.write(self.dot.y);
        Zip::from(&mut *y)
            .and_broadcast(&*b)
            .for_each(|y, &b| *y *= b);
        self.dot.accumulate(&a, &x, &mut y);
    }
}
//
impl fmt::Display for ProdUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProdUpdate(A={}, X={}, B={}, Y={})",
            self.dot.a, self.dot.x, self.b, self.dot.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::{column, scalar, Matrix};
    use ndarray::array;

    fn table(entries: Vec<(u64, Matrix)>) -> SignalTable {
        let mut signals = SignalTable::default();
        for (key, value) in entries {
            signals.insert(key, format!("s{key}"), value).unwrap();
        }
        signals
    }

    fn run(signals: &SignalTable, descriptor: &str) {
        let mut op = Operator::build(&descriptor.parse().unwrap(), signals).unwrap();
        op.invoke(signals).unwrap();
    }

    #[test]
    fn reset_fills() {
        let signals = table(vec![(1, column(&[1.0, 2.0, 3.0]))]);
        run(&signals, "Reset;1;5");
        assert_eq!(*signals.get(1).unwrap(), column(&[5.0; 3]));
    }

    #[test]
    fn copy_requires_matching_shapes() {
        let signals = table(vec![
            (1, column(&[0.0; 2])),
            (2, column(&[4.0, 5.0])),
            (3, column(&[0.0; 3])),
        ]);
        run(&signals, "Copy;1;2");
        assert_eq!(*signals.get(1).unwrap(), column(&[4.0, 5.0]));
        assert!(matches!(
            Operator::build(&"Copy;1;3".parse().unwrap(), &signals),
            Err(BuildError::ShapeMismatch { key: 3, .. })
        ));
        run(&signals, "Copy;1;1");
        assert_eq!(*signals.get(1).unwrap(), column(&[4.0, 5.0]));
    }

    #[test]
    fn dot_inc_accumulates() {
        let signals = table(vec![
            (1, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]),
            (2, column(&[1.0, -1.0])),
            (3, column(&[10.0, 20.0, 30.0])),
        ]);
        run(&signals, "DotInc;1;2;3");
        assert_eq!(*signals.get(3).unwrap(), column(&[9.0, 19.0, 29.0]));
        assert!(matches!(
            Operator::build(&"DotInc;1;3;2".parse().unwrap(), &signals),
            Err(BuildError::ShapeMismatch { key: 1, .. })
        ));
    }

    #[test]
    fn dot_inc_scalar_gain() {
        let signals = table(vec![
            (1, scalar(2.0)),
            (2, column(&[1.0, 2.0])),
            (3, column(&[1.0, 1.0])),
        ]);
        run(&signals, "DotInc;1;2;3");
        assert_eq!(*signals.get(3).unwrap(), column(&[3.0, 5.0]));
    }

    #[test]
    fn elementwise_inc_broadcasts() {
        let signals = table(vec![
            (1, column(&[1.0, 2.0, 3.0])),
            (2, scalar(3.0)),
            (3, column(&[1.0, 1.0, 1.0])),
        ]);
        run(&signals, "ElementwiseInc;1;2;3");
        assert_eq!(*signals.get(3).unwrap(), column(&[4.0, 7.0, 10.0]));
        run(&signals, "ElementwiseInc;2;1;3");
        assert_eq!(*signals.get(3).unwrap(), column(&[7.0, 13.0, 19.0]));
    }

    #[test]
    fn prod_update_decays_then_accumulates() {
        let signals = table(vec![
            (1, array![[1.0, 0.0], [0.0, 2.0]]),
            (2, column(&[1.0, 1.0])),
            (3, column(&[0.5, 0.25])),
            (4, column(&[4.0, 8.0])),
            (5, scalar(0.0)),
        ]);
        run(&signals, "ProdUpdate;1;2;3;4");
        assert_eq!(*signals.get(4).unwrap(), column(&[3.0, 4.0]));
        run(&signals, "ProdUpdate;1;2;5;4");
        assert_eq!(*signals.get(4).unwrap(), column(&[1.0, 2.0]));
    }

    #[test]
    fn outputs_may_also_be_inputs() {
        let signals = table(vec![
            (1, array![[0.0, 1.0], [1.0, 0.0]]),
            (2, column(&[1.0, 2.0])),
            (3, scalar(0.5)),
        ]);

        // Y ← A·Y + 0.5·Y, with A swapping elements
        run(&signals, "ProdUpdate;1;2;3;2");
        assert_eq!(*signals.get(2).unwrap(), column(&[2.5, 2.0]));

        // Y ← Y + Y∘Y
        run(&signals, "ElementwiseInc;2;2;2");
        assert_eq!(*signals.get(2).unwrap(), column(&[8.75, 6.0]));

        // Y ← Y + A·Y
        run(&signals, "DotInc;1;2;2");
        assert_eq!(*signals.get(2).unwrap(), column(&[14.75, 14.75]));

        // Y ← Y∘Y + A·X, with B = Y
        let signals = table(vec![
            (1, scalar(1.0)),
            (2, column(&[1.0, 1.0])),
            (3, column(&[2.0, 3.0])),
        ]);
        run(&signals, "ProdUpdate;1;2;3;3");
        assert_eq!(*signals.get(3).unwrap(), column(&[5.0, 10.0]));
    }

    #[test]
    fn display_names_keys() {
        let signals = table(vec![(1, scalar(0.0)), (2, scalar(1.0))]);
        let op = Operator::build(&"Copy;1;2".parse().unwrap(), &signals).unwrap();
        assert_eq!(op.to_string(), "Copy(dst=1, src=2)");
    }
}
