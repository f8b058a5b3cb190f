//! Fault proofs for the opcore challenger.
//!
//! A proposal is disputed by bisecting over output roots down to the split depth, then over the
//! VM execution between two neighbouring outputs, down to a single instruction that is
//! re-executed against the preimage oracle.
//!
//! ```text
//! GameSource -> GameScheduler -> Agent -> Solver -> SplitTraceProvider -> OutputTraceProvider
//!                                  |                      |
//!                                  v                      +-> TraceCache -> VmTraceProvider -> mips | mips64
//!                             GameContract
//!                      LocalGame    RpcGame (eth_call, TxSender)
//!                          |
//!             FaultDisputeGame <- VmKind::verify_step <- PreimageOracle
//! ```

mod agent;
pub mod contract;
mod game;
pub mod mips;
pub mod mips64;
mod position;
pub mod preimage;
mod scheduler;
mod solver;
pub mod trace;
pub mod vm;

#[cfg(test)]
mod tests;

pub use agent::Agent;
pub use contract::{ContractCall, ContractError, GameContract, LocalGame, RpcGame, TxSender};
pub use game::{
    Anchor, Claim, Clock, FaultDisputeGame, GameConfig, GameError, GameRecord, GameStatus,
};
pub use position::Position;
pub use scheduler::{GameDirs, GamePlayer, GameScheduler, GameSource, MAX_CONCURRENCY};
pub use solver::{Action, Solver};
pub use vm::{VmKind, VmProgram};
