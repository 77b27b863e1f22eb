//! Guest memory buffers and output framing.

use tracing::debug;

use super::executor::InstanceState;
use super::SandboxError;

/// Width of the little-endian length prefix on guest outputs.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Decode the length prefix of a guest output frame.
///
/// A zero length or one above `max_output_bytes` is rejected.
pub fn decode_frame_len(
    prefix: [u8; FRAME_PREFIX_LEN],
    max_output_bytes: usize,
) -> Result<usize, SandboxError> {
    let len = u32::from_le_bytes(prefix);
    if len == 0 || len as usize > max_output_bytes {
        return Err(SandboxError::InvalidOutputLength(len));
    }
    Ok(len as usize)
}

/// A region of guest memory obtained from the guest allocator.
///
/// The region is returned through the guest's `dealloc` export when the
/// buffer is dropped, on success and error paths alike. Only pointers that
/// the guest actually handed out are ever wrapped.
pub(crate) struct GuestBuffer<'a> {
    state: &'a mut InstanceState,
    ptr: i32,
    len: u32,
}

impl<'a> GuestBuffer<'a> {
    pub(crate) fn new(state: &'a mut InstanceState, ptr: i32, len: u32) -> Self {
        Self { state, ptr, len }
    }

    pub(crate) fn ptr(&self) -> i32 {
        self.ptr
    }

    /// Size passed to `dealloc`. Grows once an output frame's length is known.
    pub(crate) fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    pub(crate) fn state_mut(&mut self) -> &mut InstanceState {
        self.state
    }

    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), SandboxError> {
        let start = self.ptr as u32 as usize + offset;
        let memory = self.state.memory;
        memory
            .write(&mut self.state.store, start, data)
            .map_err(|_| SandboxError::MemoryAccess)
    }

    pub(crate) fn read(&mut self, offset: usize, out: &mut [u8]) -> Result<(), SandboxError> {
        let start = self.ptr as u32 as usize + offset;
        let memory = self.state.memory;
        memory
            .read(&self.state.store, start, out)
            .map_err(|_| SandboxError::MemoryAccess)
    }
}

impl Drop for GuestBuffer<'_> {
    fn drop(&mut self) {
        let len = self.len as i32;
        if let Err(e) = self.state.dealloc(self.ptr, len) {
            debug!(ptr = self.ptr, len, %e, "guest dealloc failed");
        }
    }
}
