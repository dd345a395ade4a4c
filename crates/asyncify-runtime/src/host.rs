//! Host functions imported by asyncify guests under the `asyncify` module.
//!
//! `get_async` registers a unit of work and returns at once; the unit later
//! re-enters the guest through its `callback` export. `get` blocks the calling
//! frame until an awaitable input resolves, servicing re-entries meanwhile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wasmtime::{AsContextMut, Caller, Linker, StoreContextMut};

use crate::error::{RuntimeError, TaskError};
use crate::memory::{GuestExports, WaFuture};
use crate::reentry::Reentry;
use crate::tasks::{Pending, TaskManager, TaskOutcome};

pub const IMPORT_MODULE: &str = "asyncify";

/// Store data shared by every host import of one instance.
pub struct HostState {
    pub(crate) tasks: Arc<TaskManager>,
    pub(crate) reentry: Reentry,
    pub(crate) runtime: Handle,
    pub(crate) exports: Option<GuestExports>,
    pub(crate) guest_logging: bool,
}

impl HostState {
    pub fn new(tasks: Arc<TaskManager>, runtime: Handle, guest_logging: bool) -> Self {
        let reentry = Reentry::new(tasks.token());
        Self {
            tasks,
            reentry,
            runtime,
            exports: None,
            guest_logging,
        }
    }

    pub(crate) fn exports(&self) -> Result<GuestExports, RuntimeError> {
        self.exports
            .clone()
            .ok_or_else(|| RuntimeError::MissingExport("guest exports not bound yet".into()))
    }
}

pub fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "log", log)?;
    linker.func_wrap(IMPORT_MODULE, "usleep", usleep)?;
    linker.func_wrap(IMPORT_MODULE, "uuid_v4", uuid_v4)?;
    linker.func_wrap(IMPORT_MODULE, "get", get)?;
    linker.func_wrap(IMPORT_MODULE, "get_async", get_async)?;
    Ok(())
}

fn log(caller: Caller<'_, HostState>, ptr: i32, len: i32) {
    if !caller.data().guest_logging {
        return;
    }
    let Ok(exports) = caller.data().exports() else {
        return;
    };
    match exports.read_string_lossy(&caller, ptr as u32, len as u32) {
        Ok(message) => tracing::debug!(target: "asyncify::guest", "{message}"),
        Err(e) => tracing::debug!(target: "asyncify::guest", "unreadable log message: {e}"),
    }
}

fn usleep(_caller: Caller<'_, HostState>, us: i32) {
    std::thread::sleep(Duration::from_micros(us.max(0) as u64));
}

fn uuid_v4(mut caller: Caller<'_, HostState>, out_ptr: i32) -> anyhow::Result<()> {
    let exports = caller.data().exports()?;
    let id = Uuid::new_v4().to_string();
    let data = exports.allocate_copy(&mut caller, id.as_bytes())?;
    exports.store_future(&mut caller, out_ptr as u32, &WaFuture::ready(data, id.len() as u32))?;
    Ok(())
}

fn get(mut caller: Caller<'_, HostState>, out_ptr: i32, input_offset: i32) -> anyhow::Result<()> {
    let started = Instant::now();
    let exports = caller.data().exports()?;
    let input = exports.load_future(&caller, input_offset as u32)?;

    let bytes = if input.is_awaitable() {
        let pending = caller.data().tasks.subscribe(input.index)?;
        let runtime = caller.data().runtime.clone();
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(RuntimeError::BlockingUnsupported.into());
        }
        let reentry = caller.data().reentry.clone();
        let ctx = caller.as_context_mut();
        tokio::task::block_in_place(|| runtime.block_on(reentry.drive(ctx, pending.wait())))?
    } else {
        exports.read_bytes(&caller, input.data, input.len)?
    };

    let args = WaFuture {
        data: exports.allocate_copy(&mut caller, &bytes)?,
        len: bytes.len() as u32,
        callback: 0,
        context: input.context,
        context_len: input.context_len,
        index: 0,
    };
    exports.store_future(&mut caller, out_ptr as u32, &args)?;

    tracing::trace!(
        target: "asyncify::timing",
        import = "get",
        out_ptr = format_args!("{out_ptr:#x}"),
        elapsed_us = started.elapsed().as_micros() as u64,
        "host import finished"
    );
    Ok(())
}

fn get_async(mut caller: Caller<'_, HostState>, out_ptr: i32, fn_ptr: i32, input_offset: i32) -> anyhow::Result<()> {
    let started = Instant::now();
    let exports = caller.data().exports()?;
    let input = exports.load_future(&caller, input_offset as u32)?;
    let target = Delivery {
        out: out_ptr as u32,
        fn_ptr: fn_ptr as u32,
        context: input.context,
        context_len: input.context_len,
    };
    exports.store_future(&mut caller, target.out, &target.placeholder())?;

    let tasks = Arc::clone(&caller.data().tasks);
    let args = Arguments::capture(&tasks, &exports, &caller, &input)?;
    let reentry = caller.data().reentry.clone();
    tasks.register(
        target.out,
        deliver(Arc::clone(&tasks), reentry, exports, target, args),
    );

    tracing::trace!(
        target: "asyncify::timing",
        import = "get_async",
        out_ptr = format_args!("{out_ptr:#x}"),
        elapsed_us = started.elapsed().as_micros() as u64,
        "host import finished"
    );
    Ok(())
}

/// Where a unit delivers its arguments once they resolve.
#[derive(Debug, Clone, Copy)]
struct Delivery {
    out: u32,
    fn_ptr: u32,
    context: u32,
    context_len: u32,
}

impl Delivery {
    /// Record left at `out` until the callback overwrites it; keyed to itself.
    fn placeholder(&self) -> WaFuture {
        WaFuture {
            data: 0,
            len: 0,
            callback: self.fn_ptr,
            context: self.context,
            context_len: self.context_len,
            index: self.out,
        }
    }
}

/// Arguments of a `get_async` input, captured when the import is called.
enum Arguments {
    Ready(Vec<u8>),
    Pending(Pending),
}

impl Arguments {
    fn capture(
        tasks: &TaskManager,
        exports: &GuestExports,
        caller: &Caller<'_, HostState>,
        input: &WaFuture,
    ) -> Result<Self, RuntimeError> {
        if input.is_awaitable() {
            Ok(Arguments::Pending(tasks.subscribe(input.index)?))
        } else {
            Ok(Arguments::Ready(exports.read_bytes(caller, input.data, input.len)?))
        }
    }

    async fn resolve(self) -> TaskOutcome {
        match self {
            Arguments::Ready(bytes) => Ok(bytes),
            Arguments::Pending(pending) => pending.wait().await,
        }
    }
}

/// What the guest left at `out` after its callback ran.
enum Settled {
    Ready(Vec<u8>),
    Chained(Pending),
}

fn checkpoint(token: &CancellationToken) -> Result<(), TaskError> {
    if token.is_cancelled() {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

/// Body of one `get_async` unit of work.
async fn deliver(
    tasks: Arc<TaskManager>,
    reentry: Reentry,
    exports: GuestExports,
    target: Delivery,
    args: Arguments,
) -> TaskOutcome {
    let token = tasks.token();
    checkpoint(&token)?;
    let args = args.resolve().await?;
    checkpoint(&token)?;

    let settled = {
        let exports = exports.clone();
        let tasks = Arc::clone(&tasks);
        reentry
            .run(move |ctx: StoreContextMut<'_, HostState>| {
                invoke_callback(ctx, &exports, &tasks, target, &args)
            })
            .await??
    };
    checkpoint(&token)?;

    match settled {
        Settled::Ready(bytes) => Ok(bytes),
        Settled::Chained(child) => {
            let outcome = child.wait().await;
            let out = target.out;
            let _ = reentry
                .run(move |mut ctx: StoreContextMut<'_, HostState>| exports.release(&mut ctx, out))
                .await;
            outcome
        }
    }
}

/// Write the argument buffers, run the guest callback and inspect its result.
/// Argument buffers are released whatever the callback did.
fn invoke_callback(
    mut ctx: StoreContextMut<'_, HostState>,
    exports: &GuestExports,
    tasks: &TaskManager,
    target: Delivery,
    args: &[u8],
) -> Result<Settled, TaskError> {
    let data = exports.allocate_copy(&mut ctx, args)?;
    let record = match exports.allocate(&mut ctx, WaFuture::SIZE as u32) {
        Ok(record) => record,
        Err(e) => {
            exports.release(&mut ctx, data);
            return Err(e.into());
        }
    };
    let settled = run_callback(&mut ctx, exports, tasks, target, data, args.len() as u32, record);
    exports.release(&mut ctx, record);
    exports.release(&mut ctx, data);
    settled
}

fn run_callback(
    ctx: &mut StoreContextMut<'_, HostState>,
    exports: &GuestExports,
    tasks: &TaskManager,
    target: Delivery,
    data: u32,
    len: u32,
    record: u32,
) -> Result<Settled, TaskError> {
    let args = WaFuture {
        data,
        len,
        callback: 0,
        context: target.context,
        context_len: target.context_len,
        index: 0,
    };
    exports.store_future(&mut *ctx, record, &args)?;
    exports
        .callback
        .call(&mut *ctx, (target.out as i32, target.fn_ptr as i32, record as i32))
        .map_err(RuntimeError::from_guest)?;

    let result = exports.load_future(&mut *ctx, target.out)?;
    if result.is_chained() {
        if result.index == target.out {
            return Err(TaskError::Guest(format!(
                "record at {:#x} chains to its own key",
                target.out
            )));
        }
        tracing::trace!(
            out_ptr = format_args!("{:#x}", target.out),
            child = format_args!("{:#x}", result.index),
            "chained"
        );
        return Ok(Settled::Chained(tasks.subscribe(result.index)?));
    }

    let bytes = exports.read_bytes(&mut *ctx, result.data, result.len)?;
    exports.release(&mut *ctx, result.data);
    exports.release(&mut *ctx, target.out);
    Ok(Settled::Ready(bytes))
}
