//! Custom algorithms: operator-supplied WebAssembly run in the sandbox.
//!
//! [`CustomAlgorithmManager`] maps each (feature, environment) pair to a
//! [`CustomAlgorithmState`] and each algorithm id to one pooled
//! [`ModuleInstance`](crate::sandbox::ModuleInstance). Evaluation builds the
//! JSON input for the algorithm's kind, calls the guest and stores the opaque
//! state blob it hands back. Any guest failure is logged and yields no
//! decision; the caller falls back to its default variant.
//!
//! Feedback goes to the guest's optional `handle_feedback` export. When the
//! module has none, or the call fails, the event is counted in the state's
//! local stats so nothing is lost; those stats are what
//! [`CustomAlgorithmManager::flush_stats`] persists.

mod manager;
mod state;

pub use crate::sandbox::CustomKind;
pub use manager::CustomAlgorithmManager;
pub(crate) use manager::{Registration, StagedRegistrations};
pub use state::CustomAlgorithmState;
