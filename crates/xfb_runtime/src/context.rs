use crate::host::{HostBuffer, SharedHostBuffer};
use crate::instance::{BufferEntry, ExecLog, HostBinding, KernelInstance};
use crate::{Handle, Transpose};
use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use xfb_common::isa::{Engine, Opcode};
use xfb_common::mem::{HOST_ALIGNMENT, XCLBIN_MAGIC};
use xfb_core::format::FormatParams;
use xfb_core::instr::{Instr, MatInstr};
use xfb_core::vm::KernelVm;
use xfb_core::{BlasError, Result};
use xfb_io::config::EngineConfig;

/// Buffer whose host side was allocated by the runtime and handed back to
/// the caller.
#[derive(Debug, Clone)]
pub struct ManagedBuffer {
    pub handle: Handle,
    /// Padded row count.
    pub rows: usize,
    /// Padded leading dimension in elements.
    pub lda: usize,
    pub host: SharedHostBuffer,
}

/// Buffer still registered when the runtime was destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedBuffer {
    pub kernel: usize,
    pub handle: Handle,
    pub bytes: usize,
}

/// Outcome of [`RuntimeContext::destroy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    /// Instances torn down by this call.
    pub kernels: usize,
    pub leaked: Vec<LeakedBuffer>,
}

impl DestroyReport {
    /// True when every buffer had been freed.
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

/// The host runtime: a set of independent kernel instances.
///
/// Each instance sits behind its own mutex, so the context can be shared
/// between threads. Calls addressed to different instances run in parallel;
/// calls addressed to the same instance are serialized.
pub struct RuntimeContext {
    config: EngineConfig,
    instances: Vec<Mutex<KernelInstance>>,
}

fn check_image(path: &Path) -> Result<()> {
    let load = |reason: String| BlasError::Load {
        path: path.to_path_buf(),
        reason,
    };
    let mut magic = [0u8; XCLBIN_MAGIC.len()];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| load(e.to_string()))?;
    if magic != XCLBIN_MAGIC {
        return Err(load("not an accelerator image".into()));
    }
    Ok(())
}

fn positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(BlasError::InvalidValue(format!("{name} must be positive")));
    }
    Ok(())
}

fn buffer_bytes(rows: usize, ld: usize, elem_size: usize) -> Result<usize> {
    rows.checked_mul(ld)
        .and_then(|n| n.checked_mul(elem_size))
        .ok_or(BlasError::Alloc {
            requested: usize::MAX,
            available: 0,
        })
}

fn device_u32(name: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| BlasError::DimMismatch(format!("{name} = {value} does not fit a record field")))
}

/// Checks a host copy of `rows x cols` elements with leading dimension
/// `lda` against a registered buffer.
fn check_copy(
    entry: &BufferEntry,
    rows: usize,
    cols: usize,
    lda: usize,
    elem_size: usize,
    len: usize,
) -> Result<()> {
    if elem_size != entry.elem_size {
        return Err(BlasError::InvalidValue(format!(
            "{elem_size}-byte elements for a buffer of {}-byte elements",
            entry.elem_size
        )));
    }
    if rows == 0 || cols == 0 {
        return Err(BlasError::DimMismatch(format!("empty {rows}x{cols} copy")));
    }
    if rows > entry.rows || cols > entry.cols {
        return Err(BlasError::DimMismatch(format!(
            "{rows}x{cols} does not fit the {}x{} buffer",
            entry.rows, entry.cols
        )));
    }
    if lda < cols {
        return Err(BlasError::DimMismatch(format!(
            "leading dimension {lda} is smaller than {cols} columns"
        )));
    }
    let needed = (rows - 1) * lda + cols;
    if needed > len {
        return Err(BlasError::DimMismatch(format!(
            "host data holds {len} elements, {needed} required"
        )));
    }
    Ok(())
}

/// Resolves a compute operand that must hold at least `rows x cols`.
fn operand(inst: &KernelInstance, name: &str, handle: Handle, rows: usize, cols: usize) -> Result<(u32, u32)> {
    let entry = inst.entry(handle)?;
    if entry.rows < rows || entry.cols < cols {
        return Err(BlasError::DimMismatch(format!(
            "{name}: {rows}x{cols} does not fit the {}x{} buffer {handle}",
            entry.rows, entry.cols
        )));
    }
    Ok((device_u32(name, entry.offset)?, device_u32(name, entry.ld)?))
}

impl RuntimeContext {
    /// Opens the accelerator and prepares `num_kernels` instances.
    ///
    /// # Arguments
    ///
    /// * `xclbin` - Accelerator image; must start with the image magic
    /// * `config` - The image's `config_info.dat`
    /// * `log` - Optional file receiving one line per executed instruction
    /// * `engine` - Engine the instances run
    /// * `num_kernels` - Number of independent instances
    ///
    /// # Returns
    ///
    /// The context, `BlasError::Config` when the configuration is missing
    /// or incomplete, `BlasError::InvalidValue` when the engine is disabled
    /// in the image or `num_kernels` is zero, or `BlasError::Load` when the
    /// image cannot be opened.
    pub fn create<P: AsRef<Path>, Q: AsRef<Path>>(
        xclbin: P,
        config: Q,
        log: Option<&Path>,
        engine: Engine,
        num_kernels: usize,
    ) -> Result<Self> {
        let config = EngineConfig::load(config, engine).map_err(|e| match e {
            BlasError::Io { path, source } => {
                BlasError::Config(format!("cannot read {}: {source}", path.display()))
            }
            other => other,
        })?;
        check_image(xclbin.as_ref())?;
        Self::with_config(config, log, num_kernels)
    }

    /// Prepares `num_kernels` instances for an already parsed configuration.
    pub fn with_config(config: EngineConfig, log: Option<&Path>, num_kernels: usize) -> Result<Self> {
        positive("number of kernels", num_kernels)?;
        let log = match log {
            Some(path) => {
                let file = File::create(path).map_err(|e| BlasError::io(path, e))?;
                Some(Arc::new(Mutex::new(ExecLog {
                    path: path.to_path_buf(),
                    out: BufWriter::new(file),
                })))
            }
            None => None,
        };

        let vm = KernelVm::new(FormatParams::default(), config.elem);
        let instances = (0..num_kernels)
            .map(|k| Mutex::new(KernelInstance::new(k, config.device_mem_bytes, vm, log.clone())))
            .collect();
        info!(
            engine = ?config.engine,
            kernels = num_kernels,
            min_size = config.min_size,
            device_mem = config.device_mem_bytes,
            "runtime created"
        );
        Ok(Self { config, instances })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn num_kernels(&self) -> usize {
        self.instances.len()
    }

    /// Granularity every dimension is padded to.
    pub fn min_size(&self) -> usize {
        self.config.min_size
    }

    fn instance(&self, kernel: usize) -> Result<MutexGuard<'_, KernelInstance>> {
        let inst = self.instances.get(kernel).ok_or_else(|| {
            BlasError::InvalidValue(format!(
                "kernel index {kernel} outside 0..{}",
                self.instances.len()
            ))
        })?;
        let guard = inst.lock();
        if !guard.alive {
            return Err(BlasError::NotReady("kernel instance has been destroyed"));
        }
        Ok(guard)
    }

    fn check_elem(&self, elem_size: usize) -> Result<()> {
        let want = self.config.elem.size();
        if elem_size != want {
            return Err(BlasError::InvalidValue(format!(
                "element size {elem_size}, the engine runs {want}-byte {:?} data",
                self.config.elem
            )));
        }
        Ok(())
    }

    fn check_padded(&self, dims: &[usize]) -> Result<()> {
        let min = self.config.min_size;
        match dims.iter().find(|&&d| d % min != 0) {
            Some(&d) => Err(BlasError::NotPadded(d, min)),
            None => Ok(()),
        }
    }

    /// Registers a runtime-owned buffer of `rows x lda` elements, both
    /// rounded up to the engine's block size.
    pub fn malloc(&self, rows: usize, lda: usize, elem_size: usize, kernel: usize) -> Result<Handle> {
        positive("rows", rows)?;
        positive("lda", lda)?;
        self.check_elem(elem_size)?;
        let (rows, ld) = (self.config.padded(rows), self.config.padded(lda));
        let host = HostBuffer::new(buffer_bytes(rows, ld, elem_size)?);
        self.instance(kernel)?
            .register(rows, ld, ld, elem_size, HostBinding::Owned(host))
    }

    /// Like [`RuntimeContext::malloc`], but the padded host buffer is shared
    /// with the caller, who fills it directly.
    ///
    /// The caller writes rows with the returned padded `lda` and moves them
    /// with the `*_restricted` copies.
    pub fn malloc_managed(&self, rows: usize, lda: usize, elem_size: usize, kernel: usize) -> Result<ManagedBuffer> {
        positive("rows", rows)?;
        positive("lda", lda)?;
        self.check_elem(elem_size)?;
        let (rows, ld) = (self.config.padded(rows), self.config.padded(lda));
        let host = HostBuffer::new(buffer_bytes(rows, ld, elem_size)?).into_shared();
        let handle = self.instance(kernel)?.register(
            rows,
            ld,
            ld,
            elem_size,
            HostBinding::Bound(Arc::clone(&host)),
        )?;
        Ok(ManagedBuffer {
            handle,
            rows,
            lda: ld,
            host,
        })
    }

    /// Registers a matrix that lives in caller memory.
    ///
    /// No host copy is made; `host` must stay at least `rows * lda` elements
    /// long and is read and written in place.
    ///
    /// # Returns
    ///
    /// The handle, `BlasError::BadAlignment` when `host` is not page aligned,
    /// `BlasError::NotPadded` when `rows` or `lda` is not a multiple of the
    /// block size, `BlasError::InvalidValue` for empty dimensions, `cols`
    /// larger than `lda`, a wrong element size or a short buffer, or
    /// `BlasError::Alloc` when device memory is exhausted.
    pub fn malloc_restricted(
        &self,
        rows: usize,
        cols: usize,
        elem_size: usize,
        host: &SharedHostBuffer,
        lda: usize,
        kernel: usize,
    ) -> Result<Handle> {
        positive("rows", rows)?;
        positive("cols", cols)?;
        if cols > lda {
            return Err(BlasError::InvalidValue(format!(
                "{cols} columns exceed leading dimension {lda}"
            )));
        }
        self.check_elem(elem_size)?;
        self.check_padded(&[rows, lda])?;
        self.bind(rows, cols, lda, elem_size, host, kernel)
    }

    /// Registers a vector of `n` elements with a runtime-owned host buffer.
    pub fn malloc_vector(&self, n: usize, elem_size: usize, kernel: usize) -> Result<Handle> {
        positive("n", n)?;
        self.check_elem(elem_size)?;
        let n = self.config.padded(n);
        let host = HostBuffer::new(buffer_bytes(1, n, elem_size)?);
        self.instance(kernel)?
            .register(1, n, n, elem_size, HostBinding::Owned(host))
    }

    /// Registers a vector that lives in caller memory.
    pub fn malloc_vector_restricted(
        &self,
        n: usize,
        elem_size: usize,
        host: &SharedHostBuffer,
        kernel: usize,
    ) -> Result<Handle> {
        positive("n", n)?;
        self.check_elem(elem_size)?;
        self.check_padded(&[n])?;
        self.bind(1, n, n, elem_size, host, kernel)
    }

    fn bind(
        &self,
        rows: usize,
        cols: usize,
        ld: usize,
        elem_size: usize,
        host: &SharedHostBuffer,
        kernel: usize,
    ) -> Result<Handle> {
        let bytes = buffer_bytes(rows, ld, elem_size)?;
        {
            let buf = host.lock();
            if !buf.is_aligned() {
                return Err(BlasError::BadAlignment {
                    offset: buf.as_bytes().as_ptr() as usize % HOST_ALIGNMENT,
                    align: HOST_ALIGNMENT,
                });
            }
            if buf.len() < bytes {
                return Err(BlasError::InvalidValue(format!(
                    "host buffer of {} bytes cannot hold {rows}x{ld} elements",
                    buf.len()
                )));
            }
        }
        self.instance(kernel)?
            .register(rows, cols, ld, elem_size, HostBinding::Bound(Arc::clone(host)))
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_in<T: Pod>(
        &self,
        handle: Handle,
        rows: usize,
        cols: usize,
        lda: usize,
        src: &[T],
        vector: bool,
        kernel: usize,
    ) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        let entry = inst.entry_mut(handle)?;
        if vector && !entry.is_vector() {
            return Err(BlasError::DimMismatch(format!("buffer {handle} is a matrix")));
        }
        check_copy(entry, rows, cols, lda, std::mem::size_of::<T>(), src.len())?;

        let (es, ld) = (entry.elem_size, entry.ld);
        let bytes: &[u8] = bytemuck::cast_slice(src);
        entry.with_host(|host| {
            for r in 0..rows {
                let (from, to) = (r * lda * es, r * ld * es);
                host[to..to + cols * es].copy_from_slice(&bytes[from..from + cols * es]);
            }
        })?;
        inst.flush()?;
        inst.push(handle)?;
        debug!(kernel, handle, rows, cols, "set buffer");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_out<T: Pod>(
        &self,
        handle: Handle,
        rows: usize,
        cols: usize,
        lda: usize,
        dst: &mut [T],
        vector: bool,
        kernel: usize,
    ) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        let entry = inst.entry(handle)?;
        if vector && !entry.is_vector() {
            return Err(BlasError::DimMismatch(format!("buffer {handle} is a matrix")));
        }
        check_copy(entry, rows, cols, lda, std::mem::size_of::<T>(), dst.len())?;

        inst.flush()?;
        inst.pull(handle)?;
        let entry = inst.entry_mut(handle)?;
        let (es, ld) = (entry.elem_size, entry.ld);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        entry.with_host(|host| {
            for r in 0..rows {
                let (to, from) = (r * lda * es, r * ld * es);
                bytes[to..to + cols * es].copy_from_slice(&host[from..from + cols * es]);
            }
        })?;
        debug!(kernel, handle, rows, cols, "got buffer");
        Ok(())
    }

    /// Copies a `rows x cols` host matrix with leading dimension `lda` to
    /// the device.
    ///
    /// # Returns
    ///
    /// `Ok(())`, `BlasError::Handle` for an unknown or freed handle, or
    /// `BlasError::DimMismatch` when the matrix does not fit the buffer or
    /// `src` is too short.
    #[allow(clippy::too_many_arguments)]
    pub fn set_matrix<T: Pod>(
        &self,
        rows: usize,
        cols: usize,
        src: &[T],
        lda: usize,
        handle: Handle,
        kernel: usize,
    ) -> Result<()> {
        self.copy_in(handle, rows, cols, lda, src, false, kernel)
    }

    /// Copies a host vector to the device.
    pub fn set_vector<T: Pod>(&self, src: &[T], handle: Handle, kernel: usize) -> Result<()> {
        self.copy_in(handle, 1, src.len(), src.len(), src, true, kernel)
    }

    /// Pushes the bound host buffer of `handle` to the device.
    ///
    /// Queued work runs first, so it still sees the previous contents.
    pub fn set_matrix_restricted(&self, handle: Handle, kernel: usize) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        inst.entry(handle)?;
        inst.flush()?;
        inst.push(handle)
    }

    pub fn set_vector_restricted(&self, handle: Handle, kernel: usize) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        if !inst.entry(handle)?.is_vector() {
            return Err(BlasError::DimMismatch(format!("buffer {handle} is a matrix")));
        }
        inst.flush()?;
        inst.push(handle)
    }

    /// Runs pending work and copies a `rows x cols` result into `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_matrix<T: Pod>(
        &self,
        rows: usize,
        cols: usize,
        dst: &mut [T],
        lda: usize,
        handle: Handle,
        kernel: usize,
    ) -> Result<()> {
        self.copy_out(handle, rows, cols, lda, dst, false, kernel)
    }

    pub fn get_vector<T: Pod>(&self, dst: &mut [T], handle: Handle, kernel: usize) -> Result<()> {
        let n = dst.len();
        self.copy_out(handle, 1, n, n, dst, true, kernel)
    }

    /// Runs pending work and copies the device contents of `handle` into
    /// its bound host buffer.
    pub fn get_matrix_restricted(&self, handle: Handle, kernel: usize) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        inst.entry(handle)?;
        inst.flush()?;
        inst.pull(handle)
    }

    pub fn get_vector_restricted(&self, handle: Handle, kernel: usize) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        if !inst.entry(handle)?.is_vector() {
            return Err(BlasError::DimMismatch(format!("buffer {handle} is a matrix")));
        }
        inst.flush()?;
        inst.pull(handle)
    }

    /// Queues `C := alpha * op(A) * op(B) + beta * C`.
    ///
    /// Dimensions that are not multiples of the block size are padded; the
    /// buffers must be large enough for the padded shape, which is always
    /// the case for buffers from [`RuntimeContext::malloc`].
    ///
    /// # Returns
    ///
    /// `Ok(())` once the record is queued, `BlasError::NotSupported` for a
    /// transposed operand or a GEMV image, `BlasError::DimMismatch` for empty or
    /// inconsistent dimensions, or `BlasError::Handle` for an unknown or
    /// freed operand.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        k: usize,
        n: usize,
        alpha: f32,
        a: Handle,
        lda: usize,
        b: Handle,
        ldb: usize,
        beta: f32,
        c: Handle,
        ldc: usize,
        kernel: usize,
    ) -> Result<()> {
        if self.config.engine != Engine::Gemm {
            return Err(BlasError::NotSupported("gemm on an image built for gemv"));
        }
        if op_a != Transpose::N || op_b != Transpose::N {
            return Err(BlasError::NotSupported("transposed gemm operands"));
        }
        if m == 0 || k == 0 || n == 0 {
            return Err(BlasError::DimMismatch(format!("empty {m}x{k}x{n} gemm")));
        }
        if lda < k || ldb < n || ldc < n {
            return Err(BlasError::DimMismatch(format!(
                "leading dimensions {lda}/{ldb}/{ldc} too small for {m}x{k}x{n}"
            )));
        }
        let (mp, kp, np) = (self.config.padded(m), self.config.padded(k), self.config.padded(n));

        let mut inst = self.instance(kernel)?;
        let (a_off, lda) = operand(&inst, "A", a, mp, kp)?;
        let (b_off, ldb) = operand(&inst, "B", b, kp, np)?;
        let (c_off, ldc) = operand(&inst, "C", c, mp, np)?;
        let instr = Instr::Mat(MatInstr {
            op: Opcode::Gemm,
            trans_a: false,
            trans_b: false,
            m: device_u32("m", mp)?,
            k: device_u32("k", kp)?,
            n: device_u32("n", np)?,
            alpha,
            beta,
            a: a_off,
            b: b_off,
            c: c_off,
            lda,
            ldb,
            ldc,
        });
        debug!(kernel, %instr, "queued");
        inst.pending.push(instr);
        Ok(())
    }

    /// Queues `y := alpha * op(A) * x + beta * y`.
    #[allow(clippy::too_many_arguments)]
    pub fn gemv(
        &self,
        op_a: Transpose,
        m: usize,
        n: usize,
        alpha: f32,
        a: Handle,
        lda: usize,
        x: Handle,
        beta: f32,
        y: Handle,
        kernel: usize,
    ) -> Result<()> {
        if self.config.engine != Engine::Gemv {
            return Err(BlasError::NotSupported("gemv on an image built for gemm"));
        }
        if op_a != Transpose::N {
            return Err(BlasError::NotSupported("transposed gemv operand"));
        }
        if m == 0 || n == 0 {
            return Err(BlasError::DimMismatch(format!("empty {m}x{n} gemv")));
        }
        if lda < n {
            return Err(BlasError::DimMismatch(format!(
                "leading dimension {lda} too small for {n} columns"
            )));
        }
        let (mp, np) = (self.config.padded(m), self.config.padded(n));

        let mut inst = self.instance(kernel)?;
        let (a_off, lda) = operand(&inst, "A", a, mp, np)?;
        let (x_off, _) = operand(&inst, "x", x, 1, np)?;
        let (y_off, _) = operand(&inst, "y", y, 1, mp)?;
        let instr = Instr::Mat(MatInstr {
            op: Opcode::Gemv,
            trans_a: false,
            trans_b: false,
            m: device_u32("m", mp)?,
            k: 0,
            n: device_u32("n", np)?,
            alpha,
            beta,
            a: a_off,
            b: x_off,
            c: y_off,
            lda,
            ldb: 0,
            ldc: 0,
        });
        debug!(kernel, %instr, "queued");
        inst.pending.push(instr);
        Ok(())
    }

    /// Runs pending work and refreshes every caller-bound host buffer of the
    /// instance from device memory.
    ///
    /// Bound buffers the caller changed since the last `set_*_restricted`
    /// are overwritten.
    pub fn device_synchronize(&self, kernel: usize) -> Result<()> {
        let mut inst = self.instance(kernel)?;
        inst.flush()?;
        let bound: Vec<Handle> = inst
            .table
            .iter()
            .filter(|(_, e)| matches!(e.host, HostBinding::Bound(_)))
            .map(|(&h, _)| h)
            .collect();
        for handle in bound {
            inst.pull(handle)?;
        }
        Ok(())
    }

    /// Releases one buffer and its device memory.
    ///
    /// Work already queued on the instance runs before the memory is handed
    /// back.
    ///
    /// # Returns
    ///
    /// `Ok(())`, `BlasError::DoubleFree` when the handle was already freed,
    /// or `BlasError::Handle` when it was never allocated.
    pub fn free(&self, handle: Handle, kernel: usize) -> Result<()> {
        self.instance(kernel)?.release(handle)?;
        debug!(kernel, handle, "freed buffer");
        Ok(())
    }

    /// Tears down every instance.
    ///
    /// Buffers still registered are logged as leaks and listed in the
    /// report; their memory is released with the instance.
    ///
    /// # Returns
    ///
    /// The report, or `BlasError::NotReady` when the runtime was already
    /// destroyed.
    pub fn destroy(&self) -> Result<DestroyReport> {
        let mut report = DestroyReport::default();
        for inst in &self.instances {
            let mut inst = inst.lock();
            if !inst.alive {
                continue;
            }
            for (&handle, entry) in &inst.table {
                warn!(kernel = inst.index, handle, bytes = entry.bytes(), "buffer still allocated at destroy");
                report.leaked.push(LeakedBuffer {
                    kernel: inst.index,
                    handle,
                    bytes: entry.bytes(),
                });
            }
            inst.alive = false;
            inst.table.clear();
            inst.pending.clear();
            inst.memory = Vec::new();
            inst.allocator.reset();
            report.kernels += 1;
        }
        if report.kernels == 0 {
            return Err(BlasError::NotReady("runtime already destroyed"));
        }
        info!(kernels = report.kernels, leaked = report.leaked.len(), "runtime destroyed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "GEMX_dataType=float\nGEMX_ddrWidth=4\nGEMX_runGemm=1\nGEMX_runGemv=1\nGEMX_ddrSizeMB=1\n";

    fn engine_ctx(engine: Engine, kernels: usize) -> RuntimeContext {
        let config = EngineConfig::parse(CFG, engine).unwrap();
        RuntimeContext::with_config(config, None, kernels).unwrap()
    }

    fn ctx(kernels: usize) -> RuntimeContext {
        engine_ctx(Engine::Gemm, kernels)
    }

    #[test]
    fn kernel_index_and_element_size_are_checked() {
        let rt = ctx(2);
        assert!(matches!(rt.malloc(4, 4, 4, 2), Err(BlasError::InvalidValue(_))));
        assert!(matches!(rt.malloc(4, 4, 2, 0), Err(BlasError::InvalidValue(_))));
        assert!(matches!(rt.malloc(0, 4, 4, 0), Err(BlasError::InvalidValue(_))));
        assert_eq!(rt.malloc(3, 5, 4, 1).unwrap(), 0);
    }

    #[test]
    fn restricted_buffers_must_be_aligned_and_padded() {
        let rt = ctx(1);
        let aligned = HostBuffer::new(64 * 4).into_shared();
        let skewed = HostBuffer::with_offset(64 * 4, 8).into_shared();
        assert!(matches!(
            rt.malloc_restricted(8, 8, 4, &skewed, 8, 0),
            Err(BlasError::BadAlignment { offset: 8, align: HOST_ALIGNMENT })
        ));
        assert!(matches!(
            rt.malloc_restricted(6, 6, 4, &aligned, 6, 0),
            Err(BlasError::NotPadded(6, 4))
        ));
        assert!(matches!(
            rt.malloc_restricted(8, 12, 4, &aligned, 8, 0),
            Err(BlasError::InvalidValue(_))
        ));
        assert!(matches!(
            rt.malloc_restricted(16, 8, 4, &aligned, 8, 0),
            Err(BlasError::InvalidValue(_))
        ));
        assert!(rt.malloc_restricted(8, 8, 4, &aligned, 8, 0).is_ok());
    }

    #[test]
    fn padded_copies_keep_the_caller_layout() {
        let rt = ctx(1);
        let h = rt.malloc(3, 3, 4, 0).unwrap();
        let src: Vec<f32> = (0..9).map(|v| v as f32).collect();
        rt.set_matrix(3, 3, &src, 3, h, 0).unwrap();
        let mut back = vec![0f32; 9];
        rt.get_matrix(3, 3, &mut back, 3, h, 0).unwrap();
        assert_eq!(back, src);
        assert!(matches!(
            rt.set_matrix(5, 3, &src, 3, h, 0),
            Err(BlasError::DimMismatch(_))
        ));
        assert!(matches!(
            rt.set_matrix(3, 3, &src[..8], 3, h, 0),
            Err(BlasError::DimMismatch(_))
        ));
        assert!(matches!(rt.set_vector(&src[..3], h, 0), Err(BlasError::DimMismatch(_))));
    }

    #[test]
    fn gemv_matches_reference() {
        let rt = engine_ctx(Engine::Gemv, 1);
        let (m, n) = (5, 6);
        let a: Vec<f32> = (0..m * n).map(|v| (v % 7) as f32 - 3.0).collect();
        let x: Vec<f32> = (0..n).map(|v| v as f32 * 0.5).collect();
        let mut y: Vec<f32> = vec![1.0; m];

        let ha = rt.malloc(m, n, 4, 0).unwrap();
        let hx = rt.malloc_vector(n, 4, 0).unwrap();
        let hy = rt.malloc_vector(m, 4, 0).unwrap();
        rt.set_matrix(m, n, &a, n, ha, 0).unwrap();
        rt.set_vector(&x, hx, 0).unwrap();
        rt.set_vector(&y, hy, 0).unwrap();
        rt.gemv(Transpose::N, m, n, 2.0, ha, n, hx, 1.0, hy, 0).unwrap();

        let mut got = vec![0f32; m];
        rt.get_vector(&mut got, hy, 0).unwrap();
        xfb_core::reference::gemv_ref(m, n, 2.0, &a, n, &x, 1.0, &mut y);
        assert_eq!(xfb_core::reference::compare(&got, &y), None);
    }

    #[test]
    fn transposes_are_not_supported() {
        let rt = ctx(1);
        let h = rt.malloc(4, 4, 4, 0).unwrap();
        assert!(matches!(
            rt.gemm(Transpose::T, Transpose::N, 4, 4, 4, 1.0, h, 4, h, 4, 0.0, h, 4, 0),
            Err(BlasError::NotSupported(_))
        ));
        let rt = engine_ctx(Engine::Gemv, 1);
        let h = rt.malloc(4, 4, 4, 0).unwrap();
        assert!(matches!(
            rt.gemv(Transpose::C, 4, 4, 1.0, h, 4, h, 0.0, h, 0),
            Err(BlasError::NotSupported(_))
        ));
    }

    #[test]
    fn operations_must_match_the_image_engine() {
        let gemm = ctx(1);
        let (a, x, y) = (
            gemm.malloc(4, 4, 4, 0).unwrap(),
            gemm.malloc_vector(4, 4, 0).unwrap(),
            gemm.malloc_vector(4, 4, 0).unwrap(),
        );
        assert!(matches!(
            gemm.gemv(Transpose::N, 4, 4, 1.0, a, 4, x, 0.0, y, 0),
            Err(BlasError::NotSupported(_))
        ));

        let gemv = engine_ctx(Engine::Gemv, 1);
        let h = gemv.malloc(4, 4, 4, 0).unwrap();
        assert!(matches!(
            gemv.gemm(Transpose::N, Transpose::N, 4, 4, 4, 1.0, h, 4, h, 4, 0.0, h, 4, 0),
            Err(BlasError::NotSupported(_))
        ));
        assert!(gemv.get_matrix(4, 4, &mut [0f32; 16][..], 4, h, 0).is_ok());
    }

    #[test]
    fn shrunk_bound_buffers_are_rejected() {
        let rt = ctx(1);
        let host = HostBuffer::new(16 * 4).into_shared();
        let h = rt.malloc_restricted(4, 4, 4, &host, 4, 0).unwrap();
        *host.lock() = HostBuffer::new(4);
        assert!(matches!(rt.set_matrix_restricted(h, 0), Err(BlasError::InvalidValue(_))));
        assert!(matches!(rt.get_matrix_restricted(h, 0), Err(BlasError::InvalidValue(_))));
        assert!(matches!(rt.device_synchronize(0), Err(BlasError::InvalidValue(_))));
        *host.lock() = HostBuffer::new(16 * 4);
        assert!(rt.set_matrix_restricted(h, 0).is_ok());
    }

    #[test]
    fn managed_buffers_are_refreshed_on_synchronize() {
        let rt = ctx(1);
        let a = rt.malloc_managed(2, 2, 4, 0).unwrap();
        assert_eq!((a.rows, a.lda), (4, 4));
        let b = rt.malloc_managed(4, 4, 4, 0).unwrap();
        let c = rt.malloc_managed(4, 4, 4, 0).unwrap();

        let mut ident = vec![0f32; 16];
        for i in 0..4 {
            ident[i * 4 + i] = 1.0;
        }
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        a.host.lock().write(&ident).unwrap();
        b.host.lock().write(&data).unwrap();
        rt.set_matrix_restricted(a.handle, 0).unwrap();
        rt.set_matrix_restricted(b.handle, 0).unwrap();
        rt.gemm(Transpose::N, Transpose::N, 4, 4, 4, 1.0, a.handle, 4, b.handle, 4, 0.0, c.handle, 4, 0)
            .unwrap();
        rt.device_synchronize(0).unwrap();
        assert_eq!(c.host.lock().to_vec::<f32>(), data);
    }
}
