//! Isolated rendering surface - runs a preview document in its own V8 isolate.
//!
//! The capability set is fixed when the surface is created:
//! - console output is captured in the surface, never printed
//! - `parent.postMessage` is the only channel to the host
//! - `fetch()` only reaches allow-listed origins (none by default)
//! - no popups, no navigation, no filesystem, no environment
//! - imports resolve only to the document's own inline modules
//!
//! Scripts run in browser order: classic scripts as they appear, then
//! module scripts (modules are deferred until the document is parsed), then
//! `DOMContentLoaded` and `load` listeners.

use crate::config::SurfaceConfig;
use crate::dom;
use crate::loader::{InlineModuleLoader, InlineModules};
use crate::message::{MessagePort, SurfaceId};
use crate::network::{op_fetch, NetworkPolicy};
use crate::scripts::{extract_scripts, ScriptKind};
use anyhow::{anyhow, Error};
use deno_core::error::JsError;
use deno_core::{op2, v8, JsRuntime, ModuleSpecifier, OpState, PollEventLoopOptions, RuntimeOptions};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Console output that stayed inside the surface (its own devtools view).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IsolateConsole {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl IsolateConsole {
    /// `log`, `info` and `debug` share one stream.
    fn record(&mut self, level: &str, line: String) {
        let stream = match level {
            "warn" => &mut self.warns,
            "error" => &mut self.errors,
            _ => &mut self.logs,
        };
        stream.push(line);
    }
}

// ============================================================================
// Surface Ops
// ============================================================================

#[op2(fast)]
fn op_surface_console(state: &mut OpState, #[string] level: &str, #[string] line: &str) {
    if let Some(output) = state.try_borrow_mut::<IsolateConsole>() {
        output.record(level, line.to_string());
    }
}

#[op2(fast)]
fn op_post_message(state: &mut OpState, #[string] data: &str, #[string] target_origin: &str) {
    if let Some(port) = state.try_borrow::<MessagePort>() {
        port.post(data, target_origin);
    }
}

#[op2(async)]
async fn op_surface_sleep(millis: u32) {
    tokio::time::sleep(Duration::from_millis(millis.into())).await;
}

#[op2]
#[string]
fn op_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
fn op_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[string]
fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    latin1_to_base64(data)
}

#[op2]
#[string]
fn op_atob(#[string] data: &str) -> Result<String, Error> {
    base64_to_latin1(data)
}

/// Browser `btoa`: each character is one byte, so anything above U+00FF is
/// rejected rather than UTF-8 encoded.
fn latin1_to_base64(data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = data
        .chars()
        .map(|c| {
            u8::try_from(u32::from(c))
                .map_err(|_| anyhow!("InvalidCharacterError: '{c}' is outside the Latin1 range"))
        })
        .collect::<Result<Vec<u8>, Error>>()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Browser `atob`: ASCII whitespace is ignored and every decoded byte
/// becomes one character.
fn base64_to_latin1(data: &str) -> Result<String, Error> {
    use base64::Engine;
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| anyhow!("InvalidCharacterError: {e}"))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

deno_core::extension!(
    preview_surface,
    ops = [
        op_surface_console,
        op_post_message,
        op_surface_sleep,
        op_random_uuid,
        op_get_random_values,
        op_btoa,
        op_atob,
        op_fetch,
    ],
    esm_entry_point = "ext:preview_surface/bootstrap.js",
    esm = ["ext:preview_surface/bootstrap.js" = "src/bootstrap.js"],
);

/// Why a load stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Timeout,
    HeapLimit,
}

/// What happened while loading a document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Scripts that ran to completion.
    pub executed: usize,
    /// Scripts that threw an uncaught error.
    pub failed: usize,
    /// Scripts that were not run (external, inert, or scripts disallowed).
    pub skipped: usize,
    pub halted: Option<HaltReason>,
}

enum Step {
    Done,
    Threw(Error),
    Halted(HaltReason),
}

/// Terminates a spinning isolate once its budget runs out.
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(isolate: v8::IsolateHandle, budget: Duration, fired: Arc<AtomicBool>) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(budget) {
                fired.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
            }
        });
        Self {
            cancel: Some(cancel),
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting wakes the thread without firing.
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The isolate itself. Created, driven and dropped on its surface thread.
struct SurfaceRuntime {
    id: SurfaceId,
    runtime: JsRuntime,
    modules: InlineModules,
    config: SurfaceConfig,
    timed_out: Arc<AtomicBool>,
    heap_exhausted: Arc<AtomicBool>,
}

impl SurfaceRuntime {
    fn new(config: &SurfaceConfig, port: MessagePort) -> Self {
        let loader = InlineModuleLoader::new();
        let modules = loader.registry();

        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(loader)),
            extensions: vec![preview_surface::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let id = port.source();
        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if config.max_heap_size.is_some() {
            let isolate = runtime.v8_isolate().thread_safe_handle();
            let exhausted = heap_exhausted.clone();
            runtime.add_near_heap_limit_callback(move |current, initial| {
                tracing::warn!(
                    surface = %id,
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "near heap limit, terminating surface"
                );
                exhausted.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
                // Headroom so V8 can unwind instead of aborting the process.
                current * 2
            });
        }

        {
            let op_state = runtime.op_state();
            let mut state = op_state.borrow_mut();
            state.put(IsolateConsole::default());
            state.put(NetworkPolicy {
                allowed_origins: config.allowed_origins.clone(),
            });
            state.put(port);
        }

        Self {
            id,
            runtime,
            modules,
            config: config.clone(),
            timed_out: Arc::new(AtomicBool::new(false)),
            heap_exhausted,
        }
    }

    fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    fn console(&mut self) -> IsolateConsole {
        self.runtime.op_state().borrow().borrow::<IsolateConsole>().clone()
    }

    async fn load(&mut self, document: &str) -> Result<LoadReport, Error> {
        let mut report = LoadReport::default();
        let scripts = extract_scripts(document);

        if !self.config.policy.allow_scripts {
            report.skipped = scripts.len();
            tracing::debug!(surface = %self.id, skipped = report.skipped, "scripts disabled by policy");
            return Ok(report);
        }
        self.mount_document(document);

        let budget = self.config.timeout();
        let deadline = budget.map(|b| tokio::time::Instant::now() + b);
        let _watchdog = budget.map(|b| {
            Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), b, self.timed_out.clone())
        });

        let (modules, classic): (Vec<_>, Vec<_>) = scripts
            .into_iter()
            .partition(|script| script.kind == ScriptKind::Module);

        for (index, script) in classic.into_iter().chain(modules).enumerate() {
            let step = match script.kind {
                ScriptKind::Classic => {
                    let result = self.runtime.execute_script("<inline-script>", script.code);
                    self.classify(result.map(|_| ()))
                }
                ScriptKind::Module => self.evaluate_module(index, script.code, deadline).await?,
                ScriptKind::External(src) => {
                    tracing::warn!(surface = %self.id, src = %src, "external script not loaded");
                    self.console_error(format!(
                        "Failed to load script '{src}': network access is disabled in sandbox"
                    ));
                    report.skipped += 1;
                    continue;
                }
                ScriptKind::Inert(kind) => {
                    tracing::debug!(surface = %self.id, kind = %kind, "skipping non-JavaScript script");
                    report.skipped += 1;
                    continue;
                }
            };
            if !self.record(step, &mut report) {
                return Ok(report);
            }
        }

        self.call_hook("<document-loaded>", "globalThis.__sandbox_document_loaded__()".to_string());

        // Let timers and pending promises settle.
        let step = self.run_event_loop(deadline).await;
        self.record_settled(step, &mut report);

        Ok(report)
    }

    /// Give the surface's `document` the element tree of `document`.
    fn mount_document(&mut self, document: &str) {
        match serde_json::to_string(&dom::parse(document)) {
            Ok(tree) => self.call_hook(
                "<mount-document>",
                format!("globalThis.__sandbox_mount_document__({tree})"),
            ),
            Err(e) => tracing::warn!(surface = %self.id, error = %e, "failed to serialize document tree"),
        }
    }

    /// Run host-side glue inside the isolate. Failures are logged, never
    /// reported to the document.
    fn call_hook(&mut self, name: &'static str, code: String) {
        if let Err(e) = self.runtime.execute_script(name, code) {
            tracing::warn!(surface = %self.id, hook = name, error = %e, "surface hook failed");
        }
    }

    async fn evaluate_module(
        &mut self,
        index: usize,
        code: String,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Step, Error> {
        let specifier = ModuleSpecifier::parse(&format!("sandbox://{}/inline-{index}.js", self.id))?;
        self.modules.register(specifier.clone(), code.clone());

        let id = match self.runtime.load_side_es_module_from_code(&specifier, code).await {
            Ok(id) => id,
            Err(e) => return Ok(self.classify(Err(e))),
        };
        let evaluation = self.runtime.mod_evaluate(id);
        match self.run_event_loop(deadline).await {
            Step::Done => Ok(self.classify(evaluation.await)),
            other => Ok(other),
        }
    }

    async fn run_event_loop(&mut self, deadline: Option<tokio::time::Instant>) -> Step {
        let run = self.runtime.run_event_loop(PollEventLoopOptions::default());
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, run).await {
                Ok(result) => result,
                Err(_) => {
                    self.timed_out.store(true, Ordering::SeqCst);
                    return Step::Halted(HaltReason::Timeout);
                }
            },
            None => run.await,
        };
        self.classify(result)
    }

    fn classify(&self, result: Result<(), Error>) -> Step {
        if self.heap_exhausted.load(Ordering::SeqCst) {
            return Step::Halted(HaltReason::HeapLimit);
        }
        if self.timed_out.load(Ordering::SeqCst) {
            return Step::Halted(HaltReason::Timeout);
        }
        match result {
            Ok(()) => Step::Done,
            Err(e) => Step::Threw(e),
        }
    }

    /// Returns false once the surface has been halted.
    fn record(&mut self, step: Step, report: &mut LoadReport) -> bool {
        match step {
            Step::Done => {
                report.executed += 1;
                true
            }
            Step::Threw(error) => {
                report.failed += 1;
                self.dispatch_error(&error);
                true
            }
            Step::Halted(reason) => {
                tracing::warn!(surface = %self.id, ?reason, "surface halted");
                report.halted = Some(reason);
                false
            }
        }
    }

    /// Outcome of async work after every script has run.
    fn record_settled(&mut self, step: Step, report: &mut LoadReport) {
        match step {
            Step::Done => {}
            Step::Threw(error) => {
                report.failed += 1;
                self.dispatch_error(&error);
            }
            Step::Halted(reason) => {
                tracing::warn!(surface = %self.id, ?reason, "surface halted");
                report.halted = Some(reason);
            }
        }
    }

    /// Fire the document's `error` listeners for an uncaught error.
    fn dispatch_error(&mut self, error: &Error) {
        let (message, stack) = match error.downcast_ref::<JsError>() {
            Some(js) => (js.exception_message.clone(), js.stack.clone()),
            None => (format!("{error:#}"), None),
        };
        tracing::debug!(surface = %self.id, message = %message, "uncaught error in surface");
        self.console_error(message.clone());

        let call = format!(
            "globalThis.__sandbox_dispatch_error__({}, {})",
            serde_json::Value::from(message),
            serde_json::json!(stack)
        );
        self.call_hook("<dispatch-error>", call);
    }

    fn console_error(&mut self, message: String) {
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<IsolateConsole>()
            .record("error", message);
    }
}

enum Command {
    Load {
        document: String,
        reply: oneshot::Sender<Loaded>,
    },
}

struct Loaded {
    report: Result<LoadReport, Error>,
    console: IsolateConsole,
}

/// One isolated execution context bound to one document.
///
/// Each surface owns a thread with its own isolate and current-thread
/// runtime, so any number of surfaces can coexist and be dropped in any
/// order. The handle talks to it over a command channel.
pub struct Surface {
    id: SurfaceId,
    commands: Option<UnboundedSender<Command>>,
    isolate: v8::IsolateHandle,
    console: IsolateConsole,
    loading: bool,
    thread: Option<JoinHandle<()>>,
}

impl Surface {
    /// Start a surface whose messages go out through `port`.
    pub fn spawn(config: &SurfaceConfig, port: MessagePort) -> Result<Self, Error> {
        let id = port.source();
        let config = config.clone();
        let (commands, inbox) = unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("preview-{id}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::from(e)));
                        return;
                    }
                };
                let mut runtime = SurfaceRuntime::new(&config, port);
                if ready_tx.send(Ok(runtime.isolate_handle())).is_err() {
                    return;
                }
                rt.block_on(serve(runtime, inbox));
            })?;

        let isolate = ready_rx
            .recv()
            .map_err(|_| anyhow!("surface thread exited during startup"))??;
        tracing::debug!(surface = %id, "surface thread started");

        Ok(Self {
            id,
            commands: Some(commands),
            isolate,
            console: IsolateConsole::default(),
            loading: false,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// The surface's own console as of the last completed load.
    pub fn console(&self) -> IsolateConsole {
        self.console.clone()
    }

    /// Run the scripts of `document`.
    ///
    /// Errors thrown by the document are reported to its `error` listeners
    /// and counted in the report; `Err` means the surface itself failed.
    pub async fn load(&mut self, document: &str) -> Result<LoadReport, Error> {
        let (reply, loaded) = oneshot::channel();
        self.commands
            .as_ref()
            .ok_or_else(|| anyhow!("surface {} is closed", self.id))?
            .send(Command::Load {
                document: document.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("surface {} thread has exited", self.id))?;

        self.loading = true;
        let loaded = loaded
            .await
            .map_err(|_| anyhow!("surface {} thread panicked", self.id))?;
        self.loading = false;

        self.console = loaded.console;
        loaded.report
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // An abandoned load may still be spinning.
        if self.loading {
            self.isolate.terminate_execution();
        }
        drop(self.commands.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(surface = %self.id, "surface thread panicked");
            }
        }
    }
}

/// Command loop of a surface thread. The isolate is dropped here, on the
/// thread that created it.
async fn serve(mut runtime: SurfaceRuntime, mut inbox: UnboundedReceiver<Command>) {
    while let Some(command) = inbox.recv().await {
        match command {
            Command::Load { document, mut reply } => {
                let report = tokio::select! {
                    report = runtime.load(&document) => report,
                    _ = reply.closed() => {
                        tracing::debug!(surface = %runtime.id, "load abandoned by host");
                        continue;
                    }
                };
                let loaded = Loaded {
                    report,
                    console: runtime.console(),
                };
                if reply.send(loaded).is_err() {
                    tracing::debug!(surface = %runtime.id, "load finished after host stopped waiting");
                }
            }
        }
    }
}
