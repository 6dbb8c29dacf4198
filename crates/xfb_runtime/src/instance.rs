use crate::Handle;
use crate::host::{HostBuffer, SharedHostBuffer};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use xfb_core::allocator::DeviceAllocator;
use xfb_core::instr::Instr;
use xfb_core::program::encode_stream;
use xfb_core::vm::KernelVm;
use xfb_core::{BlasError, Result};

/// Execution log shared by every instance of a context.
pub(crate) type SharedLog = Arc<Mutex<ExecLog>>;

pub(crate) struct ExecLog {
    pub path: PathBuf,
    pub out: BufWriter<File>,
}

/// Host side of a registered buffer.
#[derive(Debug)]
pub(crate) enum HostBinding {
    /// Allocated and owned by the runtime.
    Owned(HostBuffer),
    /// Caller memory from a restricted or managed allocation.
    Bound(SharedHostBuffer),
}

/// One row of a kernel instance's handle table.
#[derive(Debug)]
pub(crate) struct BufferEntry {
    /// Byte offset in device memory.
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
    /// Leading dimension in elements, shared by host and device layouts.
    pub ld: usize,
    pub elem_size: usize,
    pub host: HostBinding,
}

impl BufferEntry {
    pub fn bytes(&self) -> usize {
        self.rows * self.ld * self.elem_size
    }

    pub fn is_vector(&self) -> bool {
        self.rows == 1
    }

    /// Runs `f` over the host bytes of this buffer.
    ///
    /// Bound buffers are shared with the caller, who may have replaced them
    /// with a shorter one since registration; that is an `InvalidValue`.
    pub fn with_host<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let len = self.bytes();
        let short = |have: usize| {
            BlasError::InvalidValue(format!(
                "host buffer shrank to {have} bytes, {len} registered"
            ))
        };
        match &mut self.host {
            HostBinding::Owned(buf) => Ok(f(&mut buf.as_bytes_mut()[..len])),
            HostBinding::Bound(shared) => {
                let mut buf = shared.lock();
                let have = buf.len();
                match buf.as_bytes_mut().get_mut(..len) {
                    Some(bytes) => Ok(f(bytes)),
                    None => Err(short(have)),
                }
            }
        }
    }
}

/// State of one kernel instance.
pub(crate) struct KernelInstance {
    pub index: usize,
    pub alive: bool,
    pub memory: Vec<u8>,
    pub allocator: DeviceAllocator,
    pub table: BTreeMap<Handle, BufferEntry>,
    /// Handles are never reused; every handle below this one was issued.
    pub next_handle: Handle,
    pub pending: Vec<Instr>,
    pub vm: KernelVm,
    pub log: Option<SharedLog>,
}

impl KernelInstance {
    pub fn new(index: usize, device_bytes: usize, vm: KernelVm, log: Option<SharedLog>) -> Self {
        Self {
            index,
            alive: true,
            memory: vec![0; device_bytes],
            allocator: DeviceAllocator::new(device_bytes),
            table: BTreeMap::new(),
            next_handle: 0,
            pending: Vec::new(),
            vm,
            log,
        }
    }

    /// Reserves zeroed device memory and registers a new handle for it.
    pub fn register(
        &mut self,
        rows: usize,
        cols: usize,
        ld: usize,
        elem_size: usize,
        host: HostBinding,
    ) -> Result<Handle> {
        let size = rows * ld * elem_size;
        let handle = self.next_handle;
        let next = handle.checked_add(1).ok_or(BlasError::Alloc {
            requested: size,
            available: 0,
        })?;
        let offset = self.allocator.allocate(size)?;
        if offset + size > u32::MAX as usize {
            self.allocator.release(offset, size);
            return Err(BlasError::Alloc {
                requested: size,
                available: (u32::MAX as usize).saturating_sub(offset),
            });
        }
        self.memory[offset..offset + size].fill(0);
        self.next_handle = next;
        self.table.insert(
            handle,
            BufferEntry {
                offset,
                rows,
                cols,
                ld,
                elem_size,
                host,
            },
        );
        debug!(kernel = self.index, handle, offset, rows, cols, ld, "registered buffer");
        Ok(handle)
    }

    pub fn entry(&self, handle: Handle) -> Result<&BufferEntry> {
        match self.table.get(&handle) {
            Some(entry) => Ok(entry),
            None => Err(self.missing(handle)),
        }
    }

    pub fn entry_mut(&mut self, handle: Handle) -> Result<&mut BufferEntry> {
        let missing = self.missing(handle);
        self.table.get_mut(&handle).ok_or(missing)
    }

    fn missing(&self, handle: Handle) -> BlasError {
        let reason = if self.was_issued(handle) {
            "buffer has been freed"
        } else {
            "handle was never allocated"
        };
        BlasError::Handle { handle, reason }
    }

    /// Copies a buffer's host bytes into device memory.
    pub fn push(&mut self, handle: Handle) -> Result<()> {
        let Self { table, memory, .. } = self;
        let entry = table.get_mut(&handle).ok_or(BlasError::Handle {
            handle,
            reason: "handle was never allocated",
        })?;
        let (offset, len) = (entry.offset, entry.bytes());
        entry.with_host(|host| memory[offset..offset + len].copy_from_slice(host))
    }

    /// Copies a buffer's device bytes back to its host side.
    pub fn pull(&mut self, handle: Handle) -> Result<()> {
        let Self { table, memory, .. } = self;
        let entry = table.get_mut(&handle).ok_or(BlasError::Handle {
            handle,
            reason: "handle was never allocated",
        })?;
        let (offset, len) = (entry.offset, entry.bytes());
        entry.with_host(|host| host.copy_from_slice(&memory[offset..offset + len]))
    }

    /// Runs every pending record.
    ///
    /// The pending list is emptied before execution starts, so a failed
    /// stream is never retried.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len();
        let stream = encode_stream(&self.vm.params, &self.pending);
        self.pending.clear();

        let executed = self.vm.execute_stream(&stream, count, &mut self.memory)?;
        debug!(kernel = self.index, count, "executed instruction stream");
        if let Some(log) = &self.log {
            let mut log = log.lock();
            let ExecLog { path, out } = &mut *log;
            for instr in &executed {
                writeln!(out, "kernel {}: {instr}", self.index).map_err(|e| BlasError::io(&*path, e))?;
            }
            out.flush().map_err(|e| BlasError::io(&*path, e))?;
        }
        Ok(())
    }

    fn was_issued(&self, handle: Handle) -> bool {
        handle < self.next_handle
    }

    /// Drops a handle and returns its device memory.
    ///
    /// Records already queued against the buffer run first, so a release
    /// never changes the inputs of earlier work.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        if !self.table.contains_key(&handle) {
            if self.was_issued(handle) {
                return Err(BlasError::DoubleFree(handle));
            }
            return Err(self.missing(handle));
        }
        self.flush()?;
        if let Some(entry) = self.table.remove(&handle) {
            self.allocator.release(entry.offset, entry.bytes());
            debug!(kernel = self.index, handle, used = self.allocator.used(), "released buffer");
        }
        Ok(())
    }
}
