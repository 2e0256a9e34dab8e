//! WASM driver: instantiates a module inside a sandboxed wasmtime runtime
//! with a linear-memory cap and an epoch-based CPU deadline.
//!
//! Module ABI: export `memory` plus `fetch() -> i64`, the return value
//! packing `(ptr << 32) | len` of a JSON byte slice inside `memory`.

use std::path::PathBuf;
use std::time::Duration;

use wasmtime::{Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder};

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::{rows_from_json, Row};

pub struct WasmSource {
    engine: Engine,
    module: Module,
    memory_limit: u64,
    timeout: Duration,
}

struct Ctx {
    limits: StoreLimits,
}

impl std::fmt::Debug for WasmSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSource")
            .field("memory_limit", &self.memory_limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WasmSource {
    pub fn new(path: PathBuf, limits: WasmLimits) -> SourceResult<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = Engine::new(&config)
            .map_err(|e| SourceError::internal(format!("wasm engine: {e}")))?;

        let bytes = std::fs::read(&path).map_err(|e| {
            SourceError::from(e).with_op(format!("read {}", path.display()))
        })?;

        let module = Module::new(&engine, bytes).map_err(|e| {
            SourceError::validation(format!("invalid wasm module {}: {e}", path.display()))
        })?;

        Ok(Self {
            engine,
            module,
            memory_limit: limits.memory,
            timeout: limits.timeout,
        })
    }

    pub async fn fetch(&self) -> SourceResult<Vec<Row>> {
        let engine = self.engine.clone();
        let module = self.module.clone();
        let memory_limit = self.memory_limit;
        let timeout = self.timeout;

        // The guest runs on a blocking thread; a watchdog bumps the epoch at
        // the deadline, which traps any still-running guest code.
        tokio::task::spawn_blocking(move || {
            let limits = StoreLimitsBuilder::new()
                .memory_size(memory_limit as usize)
                .build();

            let mut store = Store::new(&engine, Ctx { limits });
            store.limiter(|ctx| &mut ctx.limits);
            store.set_epoch_deadline(1);

            // The watchdog only bumps the epoch if the guest is still running
            // at the deadline; a completed fetch disarms it so the stray
            // increment cannot trap a later store on the same engine.
            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    if done_rx.recv_timeout(timeout).is_err() {
                        engine.increment_epoch();
                    }
                });
            }

            let result = run_fetch(&mut store, &module);
            let _ = done_tx.send(());
            result
        })
        .await
        .map_err(|e| SourceError::internal(format!("wasm worker panicked: {e}")))?
    }
}

fn run_fetch(store: &mut Store<Ctx>, module: &Module) -> SourceResult<Vec<Row>> {
    let instance = Instance::new(&mut *store, module, &[])
        .map_err(|e| map_trap("instantiation", e))?;

    let fetch = instance
        .get_typed_func::<(), i64>(&mut *store, "fetch")
        .map_err(|e| SourceError::validation(format!("module does not export fetch(): {e}")))?;

    let packed = fetch
        .call(&mut *store, ())
        .map_err(|e| map_trap("fetch", e))?;

    let ptr = (packed >> 32) as u64 as usize;
    let len = (packed & 0xffff_ffff) as usize;

    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| SourceError::validation("module does not export memory"))?;

    let data = memory.data(&store);
    let slice = data
        .get(ptr..ptr + len)
        .ok_or_else(|| SourceError::resource("fetch() returned an out-of-bounds slice"))?;

    let value = serde_json::from_slice(slice)?;

    let mut rows = rows_from_json(value);
    for (i, row) in rows.iter_mut().enumerate() {
        row.ensure_id(|| format!("r{i}"));
    }

    Ok(rows)
}

/// Epoch interruptions and limiter rejections surface as traps; both are
/// resource breaches and terminate the instance.
fn map_trap(op: &str, err: wasmtime::Error) -> SourceError {
    let text = format!("{err:#}");

    if text.contains("epoch") || text.contains("interrupt") {
        SourceError::resource(format!("wasm {op} exceeded its CPU deadline"))
    } else if text.contains("memory") || text.contains("limit") {
        SourceError::resource(format!("wasm {op} exceeded its memory limit"))
    } else {
        SourceError::internal(format!("wasm {op} trapped: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal module in WAT form: data segment holds a JSON array, fetch()
    // returns (ptr << 32) | len.
    const WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (data (i32.const 16) "[{\"id\": 1, \"name\": \"wasm\"}]")
          (func (export "fetch") (result i64)
            (i64.or
              (i64.shl (i64.const 16) (i64.const 32))
              (i64.const 27))))
    "#;

    // wasmtime accepts WAT directly through Module::new, so the "wasm" file
    // can hold the textual form.
    fn temp_module(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-wasm-{name}-{}.wasm",
            std::process::id()
        ));
        std::fs::write(&path, WAT.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn fetch_reads_packed_slice() {
        let path = temp_module("ok");
        let source = WasmSource::new(path, WasmLimits::default()).unwrap();

        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), "1");
    }

    #[test]
    fn missing_module_file_errors() {
        let err =
            WasmSource::new(PathBuf::from("/no/such/module.wasm"), WasmLimits::default())
                .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn garbage_module_is_validation_error() {
        let path = std::env::temp_dir().join(format!(
            "tinkerdown-wasm-garbage-{}.wasm",
            std::process::id()
        ));
        std::fs::write(&path, b"not a module").unwrap();

        let err = WasmSource::new(path, WasmLimits::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
