pub mod instrument;
pub mod metrics;

pub use instrument::*;
pub use metrics::*;
