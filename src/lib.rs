//! # Preview Sandbox
//!
//! Safe previews of untrusted, generated or user-authored web code.
//!
//! A [`SourceFragment`] (markup, styles and script, or a complete document)
//! is assembled into an instrumented [`SandboxDocument`], materialized as a
//! short-lived [`ResourceHandle`], and rendered on an isolated surface: a
//! fresh V8 isolate with no filesystem, environment, popups or (by default)
//! network. Console calls and uncaught errors inside the surface come back
//! to the [`SandboxHost`] as [`ForwardedMessage`]s and land in a bounded
//! console log.
//!
//! ## Security Guarantees
//!
//! - **One channel out**: `parent.postMessage` is the only way to reach the host
//! - **No network**: `fetch` is stubbed by the injected shim, and the surface
//!   itself only reaches allow-listed origins
//! - **No popups**: `window.open` is stubbed or returns `null`
//! - **No imports**: modules resolve only to the document's own inline scripts
//! - **Bounded**: heap cap and an execution budget per load
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{HostConfig, SandboxHost, SourceFragment};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> preview_sandbox::Result<()> {
//!     let mut host = SandboxHost::new(HostConfig::default())?;
//!     let fragment = SourceFragment::parts("<h1>Hi</h1>", "h1{color:red}", "console.log('ready')");
//!
//!     host.run(&fragment).await?;
//!     for line in host.console().lines() {
//!         println!("{line}"); // [log] ready
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod document;
mod dom;
mod error;
mod host;
mod loader;
mod message;
mod network;
mod resource;
mod scripts;
mod shim;
mod surface;

pub use config::{HostConfig, SandboxPolicy, SurfaceConfig};
pub use document::{
    build, component_document, is_complete_document, BuildOptions, ProjectFile, SandboxDocument,
    SourceFragment,
};
pub use error::{BuildError, ConfigError, HostError, Result};
pub use host::{RunReport, SandboxHost};
pub use message::{
    ConsoleLevel, ConsoleLog, Envelope, ForwardedMessage, MessageBus, MessagePort, SurfaceId,
};
pub use network::NetworkPolicy;
pub use resource::{PreviewSlot, ResourceHandle, ResourceManager, SlotState};
pub use shim::InstrumentationShim;
pub use surface::{HaltReason, IsolateConsole, LoadReport, Surface};
