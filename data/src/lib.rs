//! Data formats used by the partitioned spiking network simulation
//!
//! Everything that crosses a process boundary or lands on disk lives here:
//! signal payloads, chunk build commands, step-loop directives, replayable
//! network files and gathered probe data.

pub mod command;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod network;
pub mod probe;

/// Computation precision
pub type Precision = f64;

/// Signal payload
///
/// Vectors are stored as single-column matrices and scalars as 1x1 matrices,
/// so that every signal has a `[rows, cols]` shape.
pub type Matrix = ndarray::Array2<Precision>;

/// Key identifying a signal within a chunk
pub type SignalKey = u64;

/// Key identifying a probe across the whole simulation
pub type ProbeKey = u64;

/// Shape of a signal payload
pub fn shape(matrix: &Matrix) -> [usize; 2] {
    [matrix.nrows(), matrix.ncols()]
}

/// Build a column-vector payload from a slice of values
pub fn column(values: &[Precision]) -> Matrix {
    Matrix::from_shape_fn((values.len(), 1), |(row, _)| values[row])
}

/// Build a 1x1 payload
pub fn scalar(value: Precision) -> Matrix {
    Matrix::from_elem((1, 1), value)
}
