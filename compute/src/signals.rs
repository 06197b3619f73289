//! Signal storage of a chunk

use crate::{BuildError, BuildResult};
use data::{Matrix, SignalKey};
use std::{
    cell::{Ref, RefCell, RefMut},
    collections::HashMap,
    fmt,
    ops::Deref,
};

/// Resolved reference to a signal of a [`SignalTable`]
///
/// Operators hold these instead of keys, so that running a step does not
/// involve any key lookup.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SignalRef {
    /// Position in the signal table
    index: usize,

    /// Key that the signal was registered with
    key: SignalKey,
}
//
impl SignalRef {
    /// Key that the signal was registered with
    pub fn key(self) -> SignalKey {
        self.key
    }
}
//
impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Named signal
#[derive(Debug)]
struct Signal {
    /// Key under which operators refer to the signal
    key: SignalKey,

    /// Human-readable name
    label: String,

    /// Current value
    value: RefCell<Matrix>,
}

/// Arena of the signals of a chunk
///
/// Signals are shared between operators, some of which read a signal while
/// others write it. Values are therefore kept in `RefCell`s, and operators
/// borrow the signals they need for the duration of one invocation only.
/// Signal shapes never change after insertion.
#[derive(Debug, Default)]
pub struct SignalTable {
    /// Signals, in insertion order
    signals: Vec<Signal>,

    /// Position of each signal in `signals`
    index: HashMap<SignalKey, usize>,
}
//
impl SignalTable {
    /// Register a new signal with its initial value
    pub fn insert(
        &mut self,
        key: SignalKey,
        label: impl Into<String>,
        value: Matrix,
    ) -> BuildResult<SignalRef> {
        if self.index.contains_key(&key) {
            return Err(BuildError::DuplicateSignal(key));
        }
        let index = self.signals.len();
        self.signals.push(Signal {
            key,
            label: label.into(),
            value: RefCell::new(value),
        });
        self.index.insert(key, index);
        Ok(SignalRef { index, key })
    }

    /// Look up a signal by key
    pub fn resolve(&self, key: SignalKey) -> BuildResult<SignalRef> {
        self.index
            .get(&key)
            .map(|&index| SignalRef { index, key })
            .ok_or(BuildError::UnknownSignal(key))
    }

    /// Look up a signal and check its shape
    pub(crate) fn resolve_shaped(
        &self,
        op: &'static str,
        key: SignalKey,
        expected: [usize; 2],
    ) -> BuildResult<SignalRef> {
        let signal = self.resolve(key)?;
        let found = self.shape(signal);
        if found == expected {
            Ok(signal)
        } else {
            Err(BuildError::ShapeMismatch {
                op,
                key,
                expected,
                found,
            })
        }
    }

    /// Shape of a signal
    pub fn shape(&self, signal: SignalRef) -> [usize; 2] {
        data::shape(&self.read(signal))
    }

    /// Human-readable name of a signal
    pub fn label(&self, signal: SignalRef) -> &str {
        &self.signals[signal.index].label
    }

    /// Current value of a signal, by key
    pub fn get(&self, key: SignalKey) -> Option<Ref<'_, Matrix>> {
        let signal = self.resolve(key).ok()?;
        Some(self.read(signal))
    }

    /// Borrow a signal for reading
    ///
    /// # Panics
    ///
    /// If the signal is currently borrowed for writing.
    pub fn read(&self, signal: SignalRef) -> Ref<'_, Matrix> {
        self.signals[signal.index].value.borrow()
    }

    /// Borrow a signal for writing
    ///
    /// # Panics
    ///
    /// If the signal is currently borrowed.
    pub fn write(&self, signal: SignalRef) -> RefMut<'_, Matrix> {
        self.signals[signal.index].value.borrow_mut()
    }

    /// Borrow an input of an operator that updates `output`
    ///
    /// An input may be the output itself, as in `Y ← A·Y`. It is then copied,
    /// so that the operator sees its value from before the update and can
    /// still borrow the output for writing.
    pub fn read_input(&self, input: SignalRef, output: SignalRef) -> Operand<'_> {
        if input == output {
            Operand::Snapshot(self.read(input).clone())
        } else {
            Operand::Borrowed(self.read(input))
        }
    }

    /// Number of signals
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Truth that there are no signals
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Iterate over signals in insertion order
    pub fn iter(&self) -> impl Iterator<Item = SignalRef> + '_ {
        self.signals
            .iter()
            .enumerate()
            .map(|(index, signal)| SignalRef {
                index,
                key: signal.key,
            })
    }
}

/// Input of an operator update, as returned by [`SignalTable::read_input()`]
#[derive(Debug)]
pub enum Operand<'table> {
    /// Shared borrow of a signal that is not the output
    Borrowed(Ref<'table, Matrix>),

    /// Copy of a signal that is also the output, taken before the update
    Snapshot(Matrix),
}
//
impl Deref for Operand<'_> {
    type Target = Matrix;

    fn deref(&self) -> &Matrix {
        match self {
            Self::Borrowed(value) => value,
            Self::Snapshot(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::{column, scalar};

    #[test]
    fn insert_and_lookup() -> BuildResult<()> {
        let mut signals = SignalTable::default();
        let a = signals.insert(7, "a", column(&[1.0, 2.0, 3.0]))?;
        let b = signals.insert(3, "b", scalar(4.0))?;
        assert_eq!(signals.resolve(7)?, a);
        assert_eq!(signals.shape(a), [3, 1]);
        assert_eq!(signals.shape(b), [1, 1]);
        assert_eq!(signals.label(b), "b");
        assert_eq!(signals.iter().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(signals.get(3).unwrap()[[0, 0]], 4.0);
        assert!(signals.get(4).is_none());
        Ok(())
    }

    #[test]
    fn duplicate_and_unknown_keys() {
        let mut signals = SignalTable::default();
        signals.insert(1, "x", scalar(0.0)).unwrap();
        assert!(matches!(
            signals.insert(1, "y", scalar(1.0)),
            Err(BuildError::DuplicateSignal(1))
        ));
        assert!(matches!(
            signals.resolve(2),
            Err(BuildError::UnknownSignal(2))
        ));
    }

    #[test]
    fn aliased_inputs_are_snapshots() -> BuildResult<()> {
        let mut signals = SignalTable::default();
        let x = signals.insert(1, "x", column(&[1.0, 2.0]))?;
        let y = signals.insert(2, "y", column(&[0.0, 0.0]))?;
        assert!(matches!(signals.read_input(x, y), Operand::Borrowed(_)));
        let own = signals.read_input(y, y);
        assert!(matches!(own, Operand::Snapshot(_)));
        signals.write(y).fill(5.0);
        assert_eq!(*own, column(&[0.0, 0.0]));
        Ok(())
    }

    #[test]
    fn shape_checks() {
        let mut signals = SignalTable::default();
        signals.insert(1, "x", column(&[0.0; 4])).unwrap();
        assert!(signals.resolve_shaped("Test", 1, [4, 1]).is_ok());
        assert!(matches!(
            signals.resolve_shaped("Test", 1, [3, 1]),
            Err(BuildError::ShapeMismatch {
                key: 1,
                expected: [3, 1],
                found: [4, 1],
                ..
            })
        ));
    }
}
