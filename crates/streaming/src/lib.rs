pub mod cache;
pub mod error;
pub mod layer;
pub mod middleware;
pub mod pipeline;
pub mod render;
pub mod request;
pub mod store;

pub use cache::*;
pub use error::*;
pub use layer::*;
pub use middleware::*;
pub use pipeline::*;
pub use render::*;
pub use request::*;
pub use store::*;
