//! The chunk and data-node catalogs and the under-replication queue.
//!
//! Each catalog guards its map with one read/write lock so that batched
//! mutations appear atomic to readers. Operations that touch more than one
//! catalog acquire locks in the fixed order *path tree -> chunk catalog ->
//! data-node catalog*; the queue has its own internal lock and may be
//! touched without holding catalog locks, but every mutation that abandons
//! a pending assignment re-enqueues the chunk before the catalog lock is
//! released.

mod chunks;
mod nodes;
mod queue;

pub use chunks::ChunkCatalog;
pub use nodes::DataNodeCatalog;
pub use queue::UnderReplicationQueue;
