//! Instantiated guest modules and the host/guest call protocol.
//!
//! # Guest contract
//!
//! | Export | Signature | Required |
//! |--------|-----------|----------|
//! | `memory` | linear memory | yes |
//! | `alloc` | `(size: i32) -> i32` | yes |
//! | `dealloc` | `(ptr: i32, size: i32)` | yes |
//! | `evaluate` | `(ptr: i32, len: i32) -> i32` | yes |
//! | `handle_feedback` | `(ptr: i32, len: i32) -> i32` | no |
//!
//! Entry points receive a JSON document at `ptr..ptr+len` and return a
//! pointer to `[len: u32 LE][len bytes of JSON]`, or 0 for no output. The
//! host frees both regions with `dealloc` once it has copied the output out.
//!
//! Every guest call runs under an epoch deadline; a call that runs past it
//! traps with [`SandboxError::Timeout`]. The instance survives the trap and
//! serves the next call.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use wasmtime::{Engine, Instance, Memory, Module, Store, Trap, TypedFunc};

use super::buffer::{decode_frame_len, GuestBuffer, FRAME_PREFIX_LEN};
use super::protocol::GuestOutput;
use super::SandboxError;
use crate::config::SandboxConfig;

/// Entry points a call can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Evaluate,
    HandleFeedback,
}

impl Entry {
    fn name(self) -> &'static str {
        match self {
            Entry::Evaluate => "evaluate",
            Entry::HandleFeedback => "handle_feedback",
        }
    }
}

/// Store and typed exports of one instance. Only reachable under the
/// instance mutex.
pub(crate) struct InstanceState {
    pub(crate) store: Store<()>,
    instance: Instance,
    pub(crate) memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: TypedFunc<(i32, i32), ()>,
    evaluate: TypedFunc<(i32, i32), i32>,
    handle_feedback: Option<TypedFunc<(i32, i32), i32>>,
    deadline_ticks: u64,
}

impl InstanceState {
    fn arm_deadline(&mut self) {
        self.store.set_epoch_deadline(self.deadline_ticks);
    }

    pub(crate) fn dealloc(&mut self, ptr: i32, len: i32) -> Result<(), SandboxError> {
        self.arm_deadline();
        let dealloc = self.dealloc.clone();
        dealloc.call(&mut self.store, (ptr, len)).map_err(classify_trap)
    }
}

/// Map a wasmtime call error onto the sandbox taxonomy.
fn classify_trap(err: anyhow::Error) -> SandboxError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => SandboxError::Timeout,
        _ => SandboxError::Trap(format!("{err:#}")),
    }
}

/// One live instance of a custom algorithm module.
///
/// Calls are serialized through an internal mutex, so one instance can be
/// shared by every request for the algorithm.
pub struct ModuleInstance {
    inner: Mutex<InstanceState>,
    has_feedback: bool,
    max_output_bytes: usize,
}

impl ModuleInstance {
    /// Instantiate `module` with no imports.
    pub fn new(
        engine: &Engine,
        module: &Module,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let mut store = Store::new(engine, ());
        let deadline_ticks = config.deadline_ticks();
        store.set_epoch_deadline(deadline_ticks);

        let instance = Instance::new(&mut store, module, &[])
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(SandboxError::MissingExport("memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|_| SandboxError::MissingExport("alloc"))?;
        let dealloc = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "dealloc")
            .map_err(|_| SandboxError::MissingExport("dealloc"))?;
        let evaluate = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "evaluate")
            .map_err(|_| SandboxError::MissingExport("evaluate"))?;
        let handle_feedback = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "handle_feedback")
            .ok();

        let has_feedback = handle_feedback.is_some();
        Ok(Self {
            inner: Mutex::new(InstanceState {
                store,
                instance,
                memory,
                alloc,
                dealloc,
                evaluate,
                handle_feedback,
                deadline_ticks,
            }),
            has_feedback,
            max_output_bytes: config.output_limit(),
        })
    }

    /// Whether the module exports `handle_feedback`.
    pub fn has_feedback_handler(&self) -> bool {
        self.has_feedback
    }

    /// Call `evaluate`. A missing output is an error.
    pub fn evaluate<I, O>(&self, input: &I) -> Result<O, SandboxError>
    where
        I: Serialize,
        O: DeserializeOwned + GuestOutput,
    {
        match self.call(Entry::Evaluate, input)? {
            Some(output) => Ok(output),
            None => Err(SandboxError::NoOutput),
        }
    }

    /// Call `handle_feedback`. `Ok(None)` when the guest returned no output.
    pub fn handle_feedback<I, O>(&self, input: &I) -> Result<Option<O>, SandboxError>
    where
        I: Serialize,
        O: DeserializeOwned + GuestOutput,
    {
        if !self.has_feedback {
            return Err(SandboxError::MissingExport("handle_feedback"));
        }
        self.call(Entry::HandleFeedback, input)
    }

    fn call<I, O>(&self, entry: Entry, input: &I) -> Result<Option<O>, SandboxError>
    where
        I: Serialize,
        O: DeserializeOwned + GuestOutput,
    {
        let payload =
            serde_json::to_vec(input).map_err(|e| SandboxError::Encode(e.to_string()))?;

        let mut state = self.inner.lock();
        let Some(bytes) = run_entry(&mut state, entry, &payload, self.max_output_bytes)? else {
            return Ok(None);
        };
        drop(state);

        let output: O =
            serde_json::from_slice(&bytes).map_err(|e| SandboxError::Decode(e.to_string()))?;
        if let Some(message) = output.error() {
            return Err(SandboxError::Guest(message.to_string()));
        }
        Ok(Some(output))
    }
}

/// One full protocol round trip against the guest.
fn run_entry(
    state: &mut InstanceState,
    entry: Entry,
    payload: &[u8],
    max_output_bytes: usize,
) -> Result<Option<Vec<u8>>, SandboxError> {
    let len = i32::try_from(payload.len())
        .map_err(|_| SandboxError::Encode(format!("payload of {} bytes", payload.len())))?;
    let func = match entry {
        Entry::Evaluate => state.evaluate.clone(),
        Entry::HandleFeedback => state
            .handle_feedback
            .clone()
            .ok_or(SandboxError::MissingExport("handle_feedback"))?,
    };

    state.arm_deadline();
    let alloc = state.alloc.clone();
    let in_ptr = alloc.call(&mut state.store, len).map_err(classify_trap)?;
    if in_ptr == 0 {
        return Err(SandboxError::AllocationFailed);
    }

    let mut input = GuestBuffer::new(state, in_ptr, len as u32);
    input.write(0, payload)?;

    let out_ptr = {
        let state = input.state_mut();
        state.arm_deadline();
        func.call(&mut state.store, (in_ptr, len))
            .map_err(classify_trap)?
    };
    if out_ptr == 0 {
        debug!(entry = entry.name(), "guest returned no output");
        return Ok(None);
    }

    let mut output = GuestBuffer::new(input.state_mut(), out_ptr, FRAME_PREFIX_LEN as u32);
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    output.read(0, &mut prefix)?;
    let body_len = decode_frame_len(prefix, max_output_bytes)?;
    output.set_len((FRAME_PREFIX_LEN + body_len) as u32);

    let mut body = vec![0u8; body_len];
    output.read(FRAME_PREFIX_LEN, &mut body)?;
    debug!(
        entry = entry.name(),
        in_ptr,
        out_ptr = output.ptr(),
        bytes = body_len,
        "guest call complete"
    );
    Ok(Some(body))
}
