//! WebAssembly sandbox for operator-supplied algorithms.
//!
//! - [`SandboxRuntime`] owns the wasmtime engine, the epoch ticker that
//!   enforces call deadlines and the compiled-module cache.
//! - [`ModuleInstance`] is one instantiated module plus the call protocol.
//! - [`protocol`] defines the JSON documents passed in and out.

mod buffer;
mod executor;
pub mod protocol;
mod runtime;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use buffer::{decode_frame_len, FRAME_PREFIX_LEN};
pub use executor::ModuleInstance;
pub use protocol::CustomKind;
pub use runtime::{ModuleExports, SandboxRuntime};

/// Failures while compiling, instantiating or calling a guest module.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("module failed to compile: {0}")]
    Compile(String),

    #[error("module does not export `{0}`")]
    MissingExport(&'static str),

    #[error("module failed to instantiate: {0}")]
    Instantiate(String),

    #[error("guest allocator returned a null pointer")]
    AllocationFailed,

    #[error("guest memory access out of bounds")]
    MemoryAccess,

    #[error("guest returned no output")]
    NoOutput,

    #[error("guest output length {0} is out of range")]
    InvalidOutputLength(u32),

    #[error("guest call exceeded its deadline")]
    Timeout,

    #[error("guest trapped: {0}")]
    Trap(String),

    #[error("failed to encode guest input: {0}")]
    Encode(String),

    #[error("failed to decode guest output: {0}")]
    Decode(String),

    #[error("guest reported an error: {0}")]
    Guest(String),

    #[error("custom algorithm {0} not found")]
    AlgorithmNotFound(String),

    #[error("custom algorithm {id} is a {actual} algorithm, not {expected}")]
    UnsupportedKind {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Hex SHA-256 of a module binary, used as its cache key.
pub fn content_hash(binary: &[u8]) -> String {
    hex::encode(Sha256::digest(binary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(b"(module)");
        assert_eq!(a, content_hash(b"(module)"));
        assert_ne!(a, content_hash(b"(module )"));
        assert_eq!(a.len(), 64);
    }
}
