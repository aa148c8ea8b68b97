//! Custom Resource Definitions for studio-operator.
//!
//! - `ApicurioStudio`: one composite Apicurio Studio deployment
//! - `Module`: closed set of sub-applications an instance is made of

mod apicurio_studio;
mod module;

pub use apicurio_studio::*;
pub use module::*;
