//! In-process WASM sandbox using Wasmtime.
//!
//! Guest code is a core module (WAT text or binary). Every invocation gets a
//! fresh [`Store`] so nothing leaks between calls, a [`ResourceLimiter`]
//! caps linear memory, and epoch interruption lets the host stop a runaway
//! guest: a ticker bumps the engine epoch while the guest runs and the
//! deadline callback traps once the abort token has fired.
//!
//! Guest ABI (all in module `env`):
//!
//! | import         | signature           | effect                                  |
//! |----------------|---------------------|-----------------------------------------|
//! | `input_len`    | `() -> i32`         | byte length of the input items JSON     |
//! | `input_read`   | `(ptr: i32)`        | copy the input JSON to `ptr`            |
//! | `output_write` | `(ptr: i32, len: i32)` | append bytes to the result buffer    |
//! | `log`          | `(ptr: i32, len: i32)` | emit one log line                    |
//! | `now_ms`       | `() -> i64`         | wall clock in Unix milliseconds         |
//!
//! The module must export `memory` and `run: () -> ()`. Any other import is
//! rejected before instantiation.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use wasmtime::{
    Caller, Config, Engine, Linker, Memory, Module, ResourceLimiter, Store, UpdateDeadline,
};

use switchyard_core::deadline::{DeadlineError, run_with_deadline};
use switchyard_types::config::SandboxConfig;
use switchyard_types::error::StepError;
use switchyard_types::item::Item;

use super::SandboxError;
use super::output::{CodeOutput, items_json, parse_output};

const HOST_MODULE: &str = "env";
const ALLOWED_IMPORTS: &[&str] = &["input_len", "input_read", "output_write", "log", "now_ms"];

/// How often the engine epoch advances while a guest is running.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Longest log line taken from a guest.
const MAX_LOG_LINE: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// Host traps
// ---------------------------------------------------------------------------

/// Errors raised by the host to stop a guest.
#[derive(Debug, thiserror::Error)]
enum HostTrap {
    #[error("guest aborted by deadline or cancellation")]
    Aborted,

    #[error("memory growth to {desired} bytes exceeds the {limit} byte limit")]
    MemoryLimit { desired: usize, limit: usize },

    #[error("output exceeds the {limit} byte limit")]
    OutputLimit { limit: usize },

    #[error("guest accessed memory out of bounds")]
    OutOfBounds,

    #[error("module does not export memory")]
    NoMemory,
}

// ---------------------------------------------------------------------------
// GuestState -- per-invocation Store data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_memory_bytes: usize,
    max_output_bytes: usize,
}

struct GuestState {
    input: Vec<u8>,
    output: Vec<u8>,
    logs: Vec<String>,
    limits: Limits,
    abort: CancellationToken,
    memory_denied: bool,
}

impl ResourceLimiter for GuestState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if desired > self.limits.max_memory_bytes {
            tracing::warn!(
                current_bytes = current,
                desired_bytes = desired,
                limit_bytes = self.limits.max_memory_bytes,
                "guest memory growth denied"
            );
            self.memory_denied = true;
            return Err(HostTrap::MemoryLimit {
                desired,
                limit: self.limits.max_memory_bytes,
            }
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        Ok(desired <= 1000)
    }
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| HostTrap::NoMemory.into())
}

fn offset(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| HostTrap::OutOfBounds.into())
}

fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; offset(len)?];
    memory
        .read(&*caller, offset(ptr)?, &mut buf)
        .map_err(|_| HostTrap::OutOfBounds)?;
    Ok(buf)
}

fn add_host_functions(linker: &mut Linker<GuestState>) -> Result<()> {
    linker.func_wrap(HOST_MODULE, "input_len", |caller: Caller<'_, GuestState>| -> i32 {
        i32::try_from(caller.data().input.len()).unwrap_or(i32::MAX)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "input_read",
        |mut caller: Caller<'_, GuestState>, ptr: i32| -> Result<()> {
            let memory = guest_memory(&mut caller)?;
            let input = std::mem::take(&mut caller.data_mut().input);
            let written = memory.write(&mut caller, offset(ptr)?, &input);
            caller.data_mut().input = input;
            written.map_err(|_| HostTrap::OutOfBounds)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "output_write",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<()> {
            let limit = caller.data().limits.max_output_bytes;
            if caller.data().output.len().saturating_add(offset(len)?) > limit {
                return Err(HostTrap::OutputLimit { limit }.into());
            }
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().output.extend_from_slice(&bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<()> {
            let len = len.clamp(0, MAX_LOG_LINE as i32);
            let bytes = read_guest(&mut caller, ptr, len)?;
            let line = String::from_utf8_lossy(&bytes).into_owned();
            caller.data_mut().logs.push(line);
            Ok(())
        },
    )?;

    linker.func_wrap(HOST_MODULE, "now_ms", |_caller: Caller<'_, GuestState>| -> i64 {
        chrono::Utc::now().timestamp_millis()
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// WasmSandbox
// ---------------------------------------------------------------------------

/// Runs guest modules on a shared engine, one fresh store per call.
#[derive(Clone)]
pub struct WasmSandbox {
    engine: Engine,
    limits: Limits,
}

impl WasmSandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.wasm_threads(false);

        let engine =
            Engine::new(&wasm_config).map_err(|e| SandboxError::Engine(e.to_string()))?;
        Ok(Self {
            engine,
            limits: Limits {
                max_memory_bytes: config.max_memory_bytes,
                max_output_bytes: config.max_output_bytes,
            },
        })
    }

    /// Compile and run `source` against `items`.
    ///
    /// The guest runs on a blocking thread. On timeout or cancellation the
    /// abort token fires, the guest traps at its next epoch check, and this
    /// returns without waiting for the thread.
    pub async fn run(
        &self,
        source: &[u8],
        items: &[Item],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CodeOutput, StepError> {
        let input = items_json(items)?.into_bytes();
        let engine = self.engine.clone();
        let limits = self.limits;
        let source = source.to_vec();

        let outcome = run_with_deadline(timeout, cancel, |abort| async move {
            let ticking = CancellationToken::new();
            spawn_epoch_ticker(engine.clone(), ticking.clone());
            // Held by the guest thread; the ticker stops when the thread ends.
            let guard = ticking.drop_guard();

            let joined = tokio::task::spawn_blocking(move || {
                let _ticker = guard;
                invoke(&engine, &source, input, limits, abort)
            })
            .await;

            match joined {
                Ok(result) => result,
                Err(e) => Err(StepError::execution(format!("sandbox thread failed: {e}"))),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(DeadlineError::TimedOut(limit)) => Err(StepError::timeout(format!(
                "code exceeded its {}ms timeout",
                limit.as_millis()
            ))
            .with_retryable(false)),
            Err(DeadlineError::Cancelled) => Err(StepError::cancelled()),
        }
    }
}

impl std::fmt::Debug for WasmSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSandbox")
            .field("max_memory_bytes", &self.limits.max_memory_bytes)
            .field("max_output_bytes", &self.limits.max_output_bytes)
            .finish()
    }
}

fn spawn_epoch_ticker(engine: Engine, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EPOCH_TICK);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => engine.increment_epoch(),
            }
        }
        // One last bump so a guest still spinning sees its deadline.
        engine.increment_epoch();
    });
}

/// Reject modules that import anything outside the host ABI or lack the
/// required exports.
fn check_interface(module: &Module) -> Result<(), StepError> {
    for import in module.imports() {
        if import.module() != HOST_MODULE || !ALLOWED_IMPORTS.contains(&import.name()) {
            return Err(StepError::sandbox_violation(format!(
                "import '{}.{}' is not allowed",
                import.module(),
                import.name()
            )));
        }
    }
    for required in ["memory", "run"] {
        if !module.exports().any(|export| export.name() == required) {
            return Err(StepError::validation(format!(
                "module must export '{required}'"
            )));
        }
    }
    Ok(())
}

fn invoke(
    engine: &Engine,
    source: &[u8],
    input: Vec<u8>,
    limits: Limits,
    abort: CancellationToken,
) -> Result<CodeOutput, StepError> {
    let module = Module::new(engine, source)
        .map_err(|e| StepError::validation(format!("invalid wasm module: {e}")))?;
    check_interface(&module)?;

    let mut linker: Linker<GuestState> = Linker::new(engine);
    add_host_functions(&mut linker)
        .map_err(|e| StepError::execution(format!("failed to link host functions: {e}")))?;

    let mut store = Store::new(
        engine,
        GuestState {
            input,
            output: Vec::new(),
            logs: Vec::new(),
            limits,
            abort,
            memory_denied: false,
        },
    );
    store.limiter(|state| state);
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|ctx| {
        if ctx.data().abort.is_cancelled() {
            Err(HostTrap::Aborted.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(err) => return Err(classify_trap(&err, store.data())),
    };
    let run = instance
        .get_typed_func::<(), ()>(&mut store, "run")
        .map_err(|e| StepError::validation(format!("export 'run' must be () -> (): {e}")))?;
    if let Err(err) = run.call(&mut store, ()) {
        return Err(classify_trap(&err, store.data()));
    }

    let state = store.into_data();
    let text = String::from_utf8(state.output)
        .map_err(|_| StepError::execution("code output is not valid UTF-8"))?;
    Ok(CodeOutput {
        value: parse_output(&text)?,
        logs: state.logs,
    })
}

fn classify_trap(err: &anyhow::Error, state: &GuestState) -> StepError {
    let trap = err
        .downcast_ref::<HostTrap>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref::<HostTrap>()));

    match trap {
        Some(HostTrap::Aborted) => {
            StepError::timeout("code aborted at its deadline").with_retryable(false)
        }
        Some(trap @ (HostTrap::MemoryLimit { .. } | HostTrap::OutputLimit { .. })) => {
            StepError::sandbox_violation(trap.to_string())
        }
        _ if state.memory_denied => StepError::sandbox_violation(format!(
            "memory limit of {} bytes exceeded",
            state.limits.max_memory_bytes
        )),
        Some(trap) => StepError::execution(trap.to_string()),
        None => StepError::execution(format!("wasm trap: {err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use switchyard_types::error::StepErrorKind;

    use super::*;

    const ECHO: &str = r#"
(module
  (import "env" "input_len" (func $input_len (result i32)))
  (import "env" "input_read" (func $input_read (param i32)))
  (import "env" "output_write" (func $output_write (param i32 i32)))
  (memory (export "memory") 1)
  (func (export "run")
    (call $input_read (i32.const 0))
    (call $output_write (i32.const 0) (call $input_len))))
"#;

    const SPIN: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "run")
    (loop $forever (br $forever))))
"#;

    fn sandbox() -> WasmSandbox {
        WasmSandbox::new(&SandboxConfig::default()).unwrap()
    }

    fn items() -> Vec<Item> {
        vec![Item::new(json!({"n": 1})), Item::new(json!({"n": 2}))]
    }

    #[tokio::test]
    async fn echo_module_returns_its_input() {
        let out = sandbox()
            .run(ECHO.as_bytes(), &items(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.value, json!([{"payload": {"n": 1}}, {"payload": {"n": 2}}]));
    }

    #[tokio::test]
    async fn infinite_loop_is_aborted_at_the_deadline() {
        let started = Instant::now();
        let err = sandbox()
            .run(SPIN.as_bytes(), &items(), Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Timeout);
        assert!(!err.retryable);
        assert!(
            started.elapsed() <= Duration::from_millis(200),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_guest() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = sandbox()
            .run(SPIN.as_bytes(), &items(), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn disallowed_import_is_rejected() {
        let source = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "run")))
"#;
        let err = sandbox()
            .run(source.as_bytes(), &items(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::SandboxViolation);
        assert!(err.message.contains("fd_write"));
    }

    #[tokio::test]
    async fn oversized_memory_is_a_violation() {
        // 2000 pages is about 125 MiB, over the 64 MiB default.
        let source = r#"
(module
  (memory (export "memory") 2000)
  (func (export "run")))
"#;
        let err = sandbox()
            .run(source.as_bytes(), &items(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::SandboxViolation);
    }

    #[tokio::test]
    async fn output_limit_is_enforced() {
        let config = SandboxConfig {
            max_output_bytes: 8,
            ..SandboxConfig::default()
        };
        let err = WasmSandbox::new(&config)
            .unwrap()
            .run(ECHO.as_bytes(), &items(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::SandboxViolation);
    }

    #[tokio::test]
    async fn log_lines_are_collected() {
        let source = r#"
(module
  (import "env" "log" (func $log (param i32 i32)))
  (import "env" "output_write" (func $output_write (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello")
  (data (i32.const 32) "[]")
  (func (export "run")
    (call $log (i32.const 16) (i32.const 5))
    (call $output_write (i32.const 32) (i32.const 2))))
"#;
        let out = sandbox()
            .run(source.as_bytes(), &items(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.value, json!([]));
        assert_eq!(out.logs, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn missing_exports_and_bad_modules_are_validation_errors() {
        let s = sandbox();
        let cancel = CancellationToken::new();

        let err = s
            .run(b"(module (func (export \"run\")))", &items(), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Validation);

        let err = s
            .run(b"not a module", &items(), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Validation);
    }
}
