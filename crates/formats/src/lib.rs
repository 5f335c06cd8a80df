pub mod encoding;
pub mod feature;
pub mod geometry;
pub mod topology;
pub mod vector_tile;

pub use encoding::*;
pub use feature::*;
pub use geometry::*;
pub use topology::*;
pub use vector_tile::*;
