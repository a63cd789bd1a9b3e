// Catalog and subscription collaborators consumed by the streaming path.

pub mod memory;
pub mod model;
pub mod traits;
