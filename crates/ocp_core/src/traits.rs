use crate::error::Result;
use crate::sx::Sx;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types the bytecode VM can evaluate over.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents an explicit ODE right-hand side handed to an integrator.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// Resolves identifiers met while reading expression text.
pub trait SymbolScope {
    /// The value symbol bound to `name`.
    fn symbol(&self, name: &str) -> Result<Sx>;

    /// The derivative symbol of the variable `name`.
    fn derivative(&self, name: &str) -> Result<Sx>;
}
