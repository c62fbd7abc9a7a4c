//! CLI command implementations

pub mod error;
pub mod gaps;
pub mod load;
pub mod validate;

pub use error::{CliError, CliResult};
pub use gaps::GapsArgs;
pub use load::{Cli, Commands, LoadArgs, OutputFormat};
pub use validate::{ValidateCommand, ValidateTarget};
