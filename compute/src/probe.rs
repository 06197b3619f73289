//! Periodic recording of signal values

use crate::{
    signals::{SignalRef, SignalTable},
    BuildError, BuildResult,
};
use data::{probe::ProbeHistory, Matrix, Precision, ProbeKey, SignalKey};
use std::fmt;

/// Records a copy of a signal every `period` steps
///
/// A probe samples its signal when the chunk starts stepping (step 0), then
/// after every step whose index is a multiple of the period. After `n` steps,
/// a probe of period `p` thus holds `n / p + 1` samples.
#[derive(Debug)]
pub struct Probe {
    /// Key under which the history is reported
    key: ProbeKey,

    /// Sampled signal
    signal: SignalRef,

    /// Number of steps between two samples
    period: u64,

    /// Recorded samples, oldest first
    history: ProbeHistory,
}
//
impl Probe {
    /// Set up a probe
    ///
    /// The period is rounded to the nearest integer number of steps, which
    /// must be at least 1.
    pub fn new(
        signals: &SignalTable,
        key: ProbeKey,
        signal: SignalKey,
        period: Precision,
    ) -> BuildResult<Self> {
        let steps = period.round();
        if !(steps >= 1.0 && steps <= u64::MAX as Precision) {
            return Err(BuildError::InvalidPeriod { key, period });
        }
        Ok(Self {
            key,
            signal: signals.resolve(signal)?,
            period: steps as u64,
            history: ProbeHistory::new(),
        })
    }

    /// Key under which the history is reported
    pub fn key(&self) -> ProbeKey {
        self.key
    }

    /// Number of steps between two samples
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Record the signal if `time_step` falls on the sampling period
    pub fn sample(&mut self, signals: &SignalTable, time_step: u64) {
        if time_step % self.period == 0 {
            self.history.push(signals.read(self.signal).clone());
        }
    }

    /// Recorded samples, oldest first
    pub fn history(&self) -> &[Matrix] {
        &self.history
    }
}
//
impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Probe(key={}, signal={}, period={}, samples={})",
            self.key,
            self.signal,
            self.period,
            self.history.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::scalar;

    fn table() -> SignalTable {
        let mut signals = SignalTable::default();
        signals.insert(1, "x", scalar(0.0)).unwrap();
        signals
    }

    #[test]
    fn period_is_rounded_and_validated() {
        let signals = table();
        assert_eq!(Probe::new(&signals, 1, 1, 2.4).unwrap().period(), 2);
        assert_eq!(Probe::new(&signals, 1, 1, 0.6).unwrap().period(), 1);
        for bad in [0.0, 0.4, -3.0, Precision::NAN, Precision::INFINITY] {
            assert!(matches!(
                Probe::new(&signals, 9, 1, bad),
                Err(BuildError::InvalidPeriod { key: 9, .. })
            ));
        }
        assert!(matches!(
            Probe::new(&signals, 1, 2, 1.0),
            Err(BuildError::UnknownSignal(2))
        ));
    }

    #[test]
    fn samples_on_period() {
        let signals = table();
        let mut probe = Probe::new(&signals, 1, 1, 3.0).unwrap();
        for step in 0..=10 {
            signals.write(signals.resolve(1).unwrap()).fill(step as Precision);
            probe.sample(&signals, step);
        }
        let values = probe
            .history()
            .iter()
            .map(|sample| sample[[0, 0]])
            .collect::<Vec<_>>();
        assert_eq!(values, vec![0.0, 3.0, 6.0, 9.0]);
    }
}
