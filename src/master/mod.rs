//! The metadata master: replicated state, command set, snapshot codec,
//! background controllers, and the client/data-node facade.

pub mod ops;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod tasks;

pub use ops::{MasterOp, OpErrorKind, OpResult};
pub use server::{MasterServer, NetworkRpc};
pub use state::{MasterState, MasterStateMachine};
pub use tasks::{LivenessController, RepairLoop};
