pub mod position;
pub mod record;
pub mod sequential;
pub mod tree_cached;

pub use position::TreePosition;
pub use record::SectorRef;
pub use tree_cached::ConcurrentSectorTree;
