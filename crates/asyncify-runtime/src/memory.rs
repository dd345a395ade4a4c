//! Guest linear-memory access and the future record layout.
//!
//! Every helper here takes the store explicitly so it can be used from a host
//! import (`Caller`), from a re-entry job (`StoreContextMut`) or from the call
//! façade holding the `Store` itself.

use wasmtime::{AsContext, AsContextMut, Instance, Memory, TypedFunc};

use crate::error::RuntimeError;

/// Bridging record shared with the guest.
///
/// Mirrors the guest's `#[repr(C)]` struct of six `u32`s on wasm32, stored
/// little-endian at offsets 0, 4, 8, 12, 16 and 20.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaFuture {
    pub data: u32,
    pub len: u32,
    pub callback: u32,
    pub context: u32,
    pub context_len: u32,
    pub index: u32,
}

impl WaFuture {
    pub const SIZE: usize = 24;

    /// Record whose result lives in guest memory right now.
    pub fn ready(data: u32, len: u32) -> Self {
        Self {
            data,
            len,
            ..Self::default()
        }
    }

    /// The result must be taken from the task under `index`, not from `data`.
    pub fn is_awaitable(&self) -> bool {
        self.index != 0
    }

    /// A callback replaced its own result with another pending task.
    pub fn is_chained(&self) -> bool {
        self.callback != 0 && self.index != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.data,
            self.len,
            self.callback,
            self.context,
            self.context_len,
            self.index,
        ];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            data: field(0),
            len: field(4),
            callback: field(8),
            context: field(12),
            context_len: field(16),
            index: field(20),
        }
    }
}

/// Handles to the exports every asyncify guest must provide.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub call: TypedFunc<(i32, i32, i32), ()>,
    pub callback: TypedFunc<(i32, i32, i32), ()>,
    allocate: TypedFunc<i32, i32>,
    release: TypedFunc<i32, ()>,
}

impl GuestExports {
    pub fn from_instance(mut store: impl AsContextMut, instance: &Instance) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| RuntimeError::MissingExport("memory".into()))?;
        let call = instance
            .get_typed_func(&mut store, "call")
            .map_err(|e| RuntimeError::MissingExport(format!("call: {e}")))?;
        let callback = instance
            .get_typed_func(&mut store, "callback")
            .map_err(|e| RuntimeError::MissingExport(format!("callback: {e}")))?;
        let allocate = instance
            .get_typed_func(&mut store, "allocate")
            .map_err(|e| RuntimeError::MissingExport(format!("allocate: {e}")))?;
        let release = instance
            .get_typed_func(&mut store, "release")
            .map_err(|e| RuntimeError::MissingExport(format!("release: {e}")))?;
        Ok(Self {
            memory,
            call,
            callback,
            allocate,
            release,
        })
    }

    /// Copy `len` bytes at `ptr` out of guest memory. The range is checked
    /// before anything is allocated.
    pub fn read_bytes(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        let start = ptr as usize;
        let data = self.memory.data(store.as_context());
        start
            .checked_add(len as usize)
            .and_then(|end| data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| RuntimeError::Memory(format!("read of {len} bytes at {ptr:#x}")))
    }

    /// Decode a guest string, replacing invalid UTF-8.
    pub fn read_string_lossy(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<String, RuntimeError> {
        let bytes = self.read_bytes(store, ptr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_bytes(&self, store: impl AsContextMut, ptr: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.memory
            .write(store, ptr as usize, bytes)
            .map_err(|_| RuntimeError::Memory(format!("write of {} bytes at {ptr:#x}", bytes.len())))
    }

    pub fn load_future(&self, store: impl AsContext, ptr: u32) -> Result<WaFuture, RuntimeError> {
        let mut raw = [0u8; WaFuture::SIZE];
        self.memory
            .read(store, ptr as usize, &mut raw)
            .map_err(|_| RuntimeError::Memory(format!("future record at {ptr:#x}")))?;
        Ok(WaFuture::from_bytes(&raw))
    }

    pub fn store_future(&self, store: impl AsContextMut, ptr: u32, future: &WaFuture) -> Result<(), RuntimeError> {
        self.write_bytes(store, ptr, &future.to_bytes())
    }

    /// Ask the guest allocator for `size` bytes.
    pub fn allocate(&self, store: impl AsContextMut, size: u32) -> Result<u32, RuntimeError> {
        let ptr = self
            .allocate
            .call(store, size as i32)
            .map_err(RuntimeError::from_guest)?;
        if ptr == 0 && size != 0 {
            return Err(RuntimeError::Memory(format!("guest failed to allocate {size} bytes")));
        }
        Ok(ptr as u32)
    }

    /// Allocate a buffer holding `bytes`. Empty input yields a null pointer
    /// and allocates nothing.
    pub fn allocate_copy(&self, mut store: impl AsContextMut, bytes: &[u8]) -> Result<u32, RuntimeError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let ptr = self.allocate(&mut store, bytes.len() as u32)?;
        self.write_bytes(&mut store, ptr, bytes)?;
        Ok(ptr)
    }

    /// Hand a buffer back to the guest allocator.
    ///
    /// Failures are logged and swallowed; the bridge never fails a call
    /// because cleanup did.
    pub fn release(&self, store: impl AsContextMut, ptr: u32) {
        if ptr == 0 {
            return;
        }
        if let Err(e) = self.release.call(store, ptr as i32) {
            tracing::debug!(ptr = format_args!("{ptr:#x}"), "guest release failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_at_fixed_offsets() {
        let future = WaFuture {
            data: 0x0102_0304,
            len: 5,
            callback: 6,
            context: 7,
            context_len: 8,
            index: 0xdead_beef,
        };
        let bytes = future.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &5u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &6u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &7u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0xdead_beefu32.to_le_bytes());
        assert_eq!(WaFuture::from_bytes(&bytes), future);
    }

    #[test]
    fn chained_needs_callback_and_index() {
        let mut future = WaFuture::ready(16, 4);
        assert!(!future.is_awaitable());
        assert!(!future.is_chained());

        future.index = 64;
        assert!(future.is_awaitable());
        assert!(!future.is_chained());

        future.callback = 1;
        assert!(future.is_chained());
    }
}
