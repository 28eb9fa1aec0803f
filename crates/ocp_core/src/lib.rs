pub mod blt;
pub mod description;
pub mod equation_engine;
pub mod error;
pub mod function;
pub mod linsolve;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod scaling;
pub mod substitute;
pub mod sx;
/// The `ocp_core` crate holds flat optimal control problems in symbolic form
/// and rewrites them step by step towards an explicit ODE.
///
/// Key components:
/// - **Sx**: Shared scalar expression graphs with folding constructors and derivatives.
/// - **Model**: `FlatModel`, the categorised variable and equation vectors plus the registry.
/// - **Pipeline**: Sorting, splitting and elimination passes driven by Jacobian sparsity and BLT.
/// - **Equation Engine**: Bytecode VM for numeric evaluation of the transformed equations.
pub mod traits;
pub mod variable;

pub use error::{OcpError, Result};
pub use model::{EquationRole, FlatModel, VariableRole};
pub use sx::Sx;
