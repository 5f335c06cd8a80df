pub mod executor;
pub mod orchestrator;
pub mod query;
pub mod template;

pub use executor::*;
pub use orchestrator::*;
pub use query::*;
pub use template::*;
