//! Textual operator descriptors
//!
//! Operators travel from the master to the workers, and are stored in network
//! files, as semicolon-separated strings whose first field names the operator
//! kind and whose remaining fields are its arguments:
//!
//! | Descriptor                                       | Effect                          |
//! |--------------------------------------------------|---------------------------------|
//! | `Reset;dst;value`                                | dst ← value                     |
//! | `Copy;dst;src`                                   | dst ← src                       |
//! | `DotInc;A;X;Y`                                   | Y ← Y + A·X                     |
//! | `ElementwiseInc;A;X;Y`                           | Y ← Y + A∘X                     |
//! | `ProdUpdate;A;X;B;Y`                             | Y ← A·X + B∘Y                   |
//! | `SimLIF;n;tau_rc;tau_ref;dt;J;output`            | spiking LIF neurons             |
//! | `SimLIFRate;n;tau_rc;tau_ref;dt;J;output`        | LIF firing rates                |
//! | `RectifiedLinear;n;J;output`                     | output ← max(J, 0)              |
//! | `SimpleSynapse;input;output;a;b`                 | output ← b·input − a·output     |
//! | `NoDenSynapse;input;output;b`                    | output ← b·input                |
//! | `Synapse;input;output;[b0, ..];[a1, ..]`         | general linear filter           |
//! | `MPISend;peer;tag;signal`                        | send signal to another member   |
//! | `MPIReceive;peer;tag;signal`                     | receive signal from a member    |
//!
//! Signal arguments are signal keys. Parsing only checks the syntax, signal
//! resolution and shape checks happen when the operator is added to a chunk.
//!
//! An operator's output may also be one of its inputs. Such inputs are read
//! as they were before the operator updates its output.

use comm::{Rank, Tag};
use data::{Precision, SignalKey};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Parsed operator descriptor
#[derive(Clone, Debug, PartialEq)]
pub enum OpSpec {
    Reset {
        dst: SignalKey,
        value: Precision,
    },
    Copy {
        dst: SignalKey,
        src: SignalKey,
    },
    DotInc {
        a: SignalKey,
        x: SignalKey,
        y: SignalKey,
    },
    ElementwiseInc {
        a: SignalKey,
        x: SignalKey,
        y: SignalKey,
    },
    ProdUpdate {
        a: SignalKey,
        x: SignalKey,
        b: SignalKey,
        y: SignalKey,
    },
    SimLif(NeuronSpec),
    SimLifRate(NeuronSpec),
    RectifiedLinear {
        num_neurons: usize,
        j: SignalKey,
        output: SignalKey,
    },
    SimpleSynapse {
        input: SignalKey,
        output: SignalKey,
        a: Precision,
        b: Precision,
    },
    NoDenSynapse {
        input: SignalKey,
        output: SignalKey,
        b: Precision,
    },
    Synapse {
        input: SignalKey,
        output: SignalKey,
        num: Coefficients,
        den: Coefficients,
    },
    MpiSend {
        peer: Rank,
        tag: Tag,
        signal: SignalKey,
    },
    MpiReceive {
        peer: Rank,
        tag: Tag,
        signal: SignalKey,
    },
}
//
impl OpSpec {
    /// Operator kind, as spelled in descriptors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "Reset",
            Self::Copy { .. } => "Copy",
            Self::DotInc { .. } => "DotInc",
            Self::ElementwiseInc { .. } => "ElementwiseInc",
            Self::ProdUpdate { .. } => "ProdUpdate",
            Self::SimLif(_) => "SimLIF",
            Self::SimLifRate(_) => "SimLIFRate",
            Self::RectifiedLinear { .. } => "RectifiedLinear",
            Self::SimpleSynapse { .. } => "SimpleSynapse",
            Self::NoDenSynapse { .. } => "NoDenSynapse",
            Self::Synapse { .. } => "Synapse",
            Self::MpiSend { .. } => "MPISend",
            Self::MpiReceive { .. } => "MPIReceive",
        }
    }
}
//
impl FromStr for OpSpec {
    type Err = DescriptorError;

    fn from_str(descriptor: &str) -> Result<Self> {
        let mut fields = descriptor.trim().split(';').map(str::trim);
        let name = fields
            .next()
            .filter(|name| !name.is_empty())
            .ok_or(DescriptorError::Empty)?;
        let args = Args {
            op: name,
            fields: fields.collect(),
        };
        let spec = match name {
            "Reset" => {
                args.expect(2)?;
                Self::Reset {
                    dst: args.parse(0)?,
                    value: args.parse(1)?,
                }
            }
            "Copy" => {
                args.expect(2)?;
                Self::Copy {
                    dst: args.parse(0)?,
                    src: args.parse(1)?,
                }
            }
            "DotInc" => {
                args.expect(3)?;
                Self::DotInc {
                    a: args.parse(0)?,
                    x: args.parse(1)?,
                    y: args.parse(2)?,
                }
            }
            "ElementwiseInc" => {
                args.expect(3)?;
                Self::ElementwiseInc {
                    a: args.parse(0)?,
                    x: args.parse(1)?,
                    y: args.parse(2)?,
                }
            }
            "ProdUpdate" => {
                args.expect(4)?;
                Self::ProdUpdate {
                    a: args.parse(0)?,
                    x: args.parse(1)?,
                    b: args.parse(2)?,
                    y: args.parse(3)?,
                }
            }
            "SimLIF" => Self::SimLif(NeuronSpec::parse(&args)?),
            "SimLIFRate" => Self::SimLifRate(NeuronSpec::parse(&args)?),
            "RectifiedLinear" => {
                args.expect(3)?;
                Self::RectifiedLinear {
                    num_neurons: args.parse(0)?,
                    j: args.parse(1)?,
                    output: args.parse(2)?,
                }
            }
            "SimpleSynapse" => {
                args.expect(4)?;
                Self::SimpleSynapse {
                    input: args.parse(0)?,
                    output: args.parse(1)?,
                    a: args.parse(2)?,
                    b: args.parse(3)?,
                }
            }
            "NoDenSynapse" => {
                args.expect(3)?;
                Self::NoDenSynapse {
                    input: args.parse(0)?,
                    output: args.parse(1)?,
                    b: args.parse(2)?,
                }
            }
            "Synapse" => {
                args.expect(4)?;
                Self::Synapse {
                    input: args.parse(0)?,
                    output: args.parse(1)?,
                    num: args.parse(2)?,
                    den: args.parse(3)?,
                }
            }
            "MPISend" => {
                args.expect(3)?;
                Self::MpiSend {
                    peer: args.parse(0)?,
                    tag: args.parse(1)?,
                    signal: args.parse(2)?,
                }
            }
            "MPIReceive" => {
                args.expect(3)?;
                Self::MpiReceive {
                    peer: args.parse(0)?,
                    tag: args.parse(1)?,
                    signal: args.parse(2)?,
                }
            }
            other => return Err(DescriptorError::UnknownOperator(other.to_owned())),
        };
        Ok(spec)
    }
}
//
impl fmt::Display for OpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Self::Reset { dst, value } => write!(f, "{name};{dst};{value}"),
            Self::Copy { dst, src } => write!(f, "{name};{dst};{src}"),
            Self::DotInc { a, x, y } | Self::ElementwiseInc { a, x, y } => {
                write!(f, "{name};{a};{x};{y}")
            }
            Self::ProdUpdate { a, x, b, y } => write!(f, "{name};{a};{x};{b};{y}"),
            Self::SimLif(neurons) | Self::SimLifRate(neurons) => {
                write!(f, "{name};{neurons}")
            }
            Self::RectifiedLinear {
                num_neurons,
                j,
                output,
            } => write!(f, "{name};{num_neurons};{j};{output}"),
            Self::SimpleSynapse {
                input,
                output,
                a,
                b,
            } => write!(f, "{name};{input};{output};{a};{b}"),
            Self::NoDenSynapse { input, output, b } => {
                write!(f, "{name};{input};{output};{b}")
            }
            Self::Synapse {
                input,
                output,
                num,
                den,
            } => write!(f, "{name};{input};{output};{num};{den}"),
            Self::MpiSend { peer, tag, signal } | Self::MpiReceive { peer, tag, signal } => {
                write!(f, "{name};{peer};{tag};{signal}")
            }
        }
    }
}

/// Arguments shared by the LIF neuron operators
#[derive(Clone, Debug, PartialEq)]
pub struct NeuronSpec {
    /// Number of neurons in the population
    pub num_neurons: usize,

    /// Membrane RC time constant (s)
    pub tau_rc: Precision,

    /// Refractory period (s)
    pub tau_ref: Precision,

    /// Simulation timestep (s)
    pub dt: Precision,

    /// Input current signal
    pub j: SignalKey,

    /// Output signal
    pub output: SignalKey,
}
//
impl NeuronSpec {
    fn parse(args: &Args<'_>) -> Result<Self> {
        args.expect(6)?;
        Ok(Self {
            num_neurons: args.parse(0)?,
            tau_rc: args.parse(1)?,
            tau_ref: args.parse(2)?,
            dt: args.parse(3)?,
            j: args.parse(4)?,
            output: args.parse(5)?,
        })
    }
}
//
impl fmt::Display for NeuronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{};{}",
            self.num_neurons, self.tau_rc, self.tau_ref, self.dt, self.j, self.output
        )
    }
}

/// Filter coefficients, spelled `[c0, c1, ..]` in descriptors
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Coefficients(pub Vec<Precision>);
//
impl FromStr for Coefficients {
    type Err = MalformedCoefficients;

    fn from_str(s: &str) -> std::result::Result<Self, MalformedCoefficients> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or(MalformedCoefficients)?;
        if inner.trim().is_empty() {
            return Ok(Self::default());
        }
        inner
            .split(',')
            .map(|c| c.trim().parse::<Precision>().map_err(|_| MalformedCoefficients))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Self)
    }
}
//
impl fmt::Display for Coefficients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (index, c) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}

/// A coefficient list is not a bracketed list of numbers
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("malformed coefficient list")]
pub struct MalformedCoefficients;

/// Descriptor fields following the operator name
struct Args<'a> {
    /// Operator name
    op: &'a str,

    /// Argument fields
    fields: Vec<&'a str>,
}
//
impl Args<'_> {
    /// Check the number of arguments
    fn expect(&self, expected: usize) -> Result<()> {
        if self.fields.len() == expected {
            Ok(())
        } else {
            Err(DescriptorError::ArgCount {
                op: self.op.to_owned(),
                expected,
                found: self.fields.len(),
            })
        }
    }

    /// Parse one argument
    fn parse<T: FromStr>(&self, index: usize) -> Result<T> {
        let field = self.fields[index];
        field.parse().map_err(|_| DescriptorError::BadField {
            op: self.op.to_owned(),
            index,
            field: field.to_owned(),
        })
    }
}

/// Things that can go wrong while parsing a descriptor
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DescriptorError {
    #[error("empty operator descriptor")]
    Empty,

    #[error("unknown operator kind {0:?}")]
    UnknownOperator(String),

    #[error("{op} expects {expected} arguments, got {found}")]
    ArgCount {
        op: String,
        expected: usize,
        found: usize,
    },

    #[error("{op}: argument #{index} ({field:?}) is malformed")]
    BadField {
        op: String,
        index: usize,
        field: String,
    },
}
//
/// Result type associated with descriptor parsing
pub type Result<T> = std::result::Result<T, DescriptorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arithmetic() {
        assert_eq!(
            "Reset;12;5".parse::<OpSpec>().unwrap(),
            OpSpec::Reset {
                dst: 12,
                value: 5.0
            }
        );
        assert_eq!(
            " ProdUpdate; 1;2 ;3;4 ".parse::<OpSpec>().unwrap(),
            OpSpec::ProdUpdate {
                a: 1,
                x: 2,
                b: 3,
                y: 4
            }
        );
    }

    #[test]
    fn parse_neurons_and_exchange() {
        assert_eq!(
            "SimLIF;10;0.02;0.002;0.001;3;4".parse::<OpSpec>().unwrap(),
            OpSpec::SimLif(NeuronSpec {
                num_neurons: 10,
                tau_rc: 0.02,
                tau_ref: 0.002,
                dt: 0.001,
                j: 3,
                output: 4,
            })
        );
        assert_eq!(
            "MPIReceive;2;17;9".parse::<OpSpec>().unwrap(),
            OpSpec::MpiReceive {
                peer: 2,
                tag: 17,
                signal: 9
            }
        );
    }

    #[test]
    fn display_parses_back() {
        for descriptor in [
            "Reset;1;-0.5",
            "Copy;1;2",
            "DotInc;1;2;3",
            "ElementwiseInc;1;2;3",
            "ProdUpdate;1;2;3;4",
            "SimLIF;3;0.02;0.002;0.001;1;2",
            "SimLIFRate;3;0.02;0.002;0.001;1;2",
            "RectifiedLinear;3;1;2",
            "SimpleSynapse;1;2;0.5;0.25",
            "NoDenSynapse;1;2;0.5",
            "Synapse;1;2;[0.5, 0.25];[-0.5, 0.1]",
            "Synapse;1;2;[1];[]",
            "MPISend;1;5;3",
            "MPIReceive;0;5;3",
        ] {
            let spec = descriptor.parse::<OpSpec>().unwrap();
            assert_eq!(spec.to_string(), descriptor);
        }
    }

    #[test]
    fn malformed_descriptors() {
        assert_eq!("".parse::<OpSpec>(), Err(DescriptorError::Empty));
        assert_eq!(
            "Frobnicate;1".parse::<OpSpec>(),
            Err(DescriptorError::UnknownOperator("Frobnicate".into()))
        );
        assert_eq!(
            "Copy;1".parse::<OpSpec>(),
            Err(DescriptorError::ArgCount {
                op: "Copy".into(),
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            "Reset;x;1".parse::<OpSpec>(),
            Err(DescriptorError::BadField {
                op: "Reset".into(),
                index: 0,
                field: "x".into()
            })
        );
        assert!("MPISend;-1;0;0".parse::<OpSpec>().is_err());
        assert!(matches!(
            "Synapse;1;2;0.5;[]".parse::<OpSpec>(),
            Err(DescriptorError::BadField { index: 2, .. })
        ));
        assert!("Synapse;1;2;[0.5,x];[]".parse::<OpSpec>().is_err());
    }

    #[test]
    fn parse_coefficient_lists() {
        assert_eq!(
            "Synapse;3;4;[0.1,0.2];[ -0.9 ]".parse::<OpSpec>().unwrap(),
            OpSpec::Synapse {
                input: 3,
                output: 4,
                num: Coefficients(vec![0.1, 0.2]),
                den: Coefficients(vec![-0.9]),
            }
        );
        assert_eq!("[ ]".parse::<Coefficients>(), Ok(Coefficients::default()));
        assert_eq!("0.5".parse::<Coefficients>(), Err(MalformedCoefficients));
    }
}
