//! Hosting-side controller for one preview slot.
//!
//! The host builds documents, materializes them as handles, renders each
//! handle on a fresh isolated surface, and turns messages posted by the
//! active surface into console lines. Messages from any other surface,
//! including ones released earlier with messages still in flight, are
//! discarded.

use crate::config::HostConfig;
use crate::document::{build, BuildOptions, SourceFragment};
use crate::error::{HostError, Result};
use crate::message::{ConsoleLog, ForwardedMessage, MessageBus, SurfaceId};
use crate::resource::{PreviewSlot, ResourceHandle, ResourceManager, SlotState};
use crate::surface::{IsolateConsole, LoadReport, Surface};
use std::time::{Duration, Instant};

type Listener = Box<dyn FnMut(&ForwardedMessage)>;

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub handle: ResourceHandle,
    pub surface: SurfaceId,
    pub load: LoadReport,
    /// Messages accepted into the console during this run.
    pub messages: usize,
}

/// Delays automatic runs until edits pause.
#[derive(Debug)]
struct Debouncer {
    delay: Duration,
    pending: Option<(SourceFragment, Instant)>,
}

impl Debouncer {
    fn touch(&mut self, fragment: SourceFragment, now: Instant) {
        self.pending = Some((fragment, now + self.delay));
    }

    fn take_due(&mut self, now: Instant) -> Option<SourceFragment> {
        let is_due = matches!(&self.pending, Some((_, due)) if *due <= now);
        if is_due {
            self.pending.take().map(|(fragment, _)| fragment)
        } else {
            None
        }
    }
}

pub struct SandboxHost {
    config: HostConfig,
    resources: ResourceManager,
    slot: PreviewSlot,
    bus: MessageBus,
    surface: Option<Surface>,
    next_surface: u64,
    log: ConsoleLog,
    listeners: Vec<Listener>,
    debounce: Debouncer,
}

impl SandboxHost {
    /// Host for `config`, which is validated first.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_resources(config, ResourceManager::new())
    }

    /// Host sharing an existing blob store.
    pub fn with_resources(config: HostConfig, resources: ResourceManager) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slot: PreviewSlot::new(resources.clone()),
            resources,
            bus: MessageBus::new(config.host_origin.clone()),
            surface: None,
            next_surface: 0,
            log: ConsoleLog::with_capacity(config.console_capacity),
            listeners: Vec::new(),
            debounce: Debouncer {
                delay: config.debounce(),
                pending: None,
            },
            config,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn state(&self) -> SlotState {
        self.slot.state()
    }

    /// Handle currently bound to the slot.
    pub fn current_handle(&self) -> Option<&ResourceHandle> {
        self.slot.current()
    }

    pub fn active_surface(&self) -> Option<SurfaceId> {
        self.surface.as_ref().map(Surface::id)
    }

    pub fn console(&self) -> &ConsoleLog {
        &self.log
    }

    pub fn clear_console(&mut self) {
        self.log.clear();
    }

    /// Console output that stayed inside the active surface.
    pub fn surface_console(&self) -> Option<IsolateConsole> {
        self.surface.as_ref().map(Surface::console)
    }

    /// Called for every accepted message, after it is logged.
    pub fn on_message(&mut self, listener: impl FnMut(&ForwardedMessage) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Build options derived from the host configuration.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            title: Some(self.config.title.clone()),
            target_origin: Some(self.config.target_origin.clone()),
            lockdown: self.config.lockdown,
        }
    }

    /// Explicit run: rebuild, rematerialize and rerender the slot.
    ///
    /// A build failure leaves the slot empty and is returned for the host
    /// UI to show; errors inside the sandbox only reach the console.
    pub async fn run(&mut self, fragment: &SourceFragment) -> Result<RunReport> {
        self.debounce.pending = None;
        if self.config.clear_on_run {
            self.log.clear();
        }

        self.slot.begin_build();
        let document = match build(fragment, &self.build_options()) {
            Ok(document) => document,
            Err(e) => {
                self.slot.abort();
                self.detach();
                tracing::warn!(error = %e, "build failed");
                return Err(e.into());
            }
        };
        let handle = self.slot.materialize(&document);

        let load = match self.render(&handle).await {
            Ok(load) => load,
            Err(e) => {
                self.slot.abort();
                self.detach();
                return Err(e);
            }
        };
        self.slot.mark_displayed();

        let messages = self.pump();
        let surface = SurfaceId(self.next_surface);
        tracing::info!(
            handle = %handle,
            surface = %surface,
            executed = load.executed,
            failed = load.failed,
            messages,
            "preview rendered"
        );

        Ok(RunReport {
            handle,
            surface,
            load,
            messages,
        })
    }

    /// Bind `handle` to a fresh surface and load its document.
    pub async fn render(&mut self, handle: &ResourceHandle) -> Result<LoadReport> {
        self.detach();
        let document = self
            .resources
            .resolve(handle)
            .ok_or_else(|| HostError::UnknownHandle(handle.to_string()))?;

        self.next_surface += 1;
        let id = SurfaceId(self.next_surface);
        let surface = Surface::spawn(&self.config.surface, self.bus.port(id)).map_err(HostError::Surface)?;
        let surface = self.surface.insert(surface);
        tracing::debug!(surface = %id, handle = %handle, policy = %self.config.surface.policy.attribute(), "surface attached");

        surface.load(&document).await.map_err(HostError::Surface)
    }

    /// Record a content edit; it runs once edits pause for the debounce
    /// period.
    pub fn edit(&mut self, fragment: SourceFragment, now: Instant) {
        self.debounce.touch(fragment, now);
    }

    /// Whether an edit is waiting for its debounce period.
    pub fn has_pending_edit(&self) -> bool {
        self.debounce.pending.is_some()
    }

    /// Run the pending edit if its debounce period has passed.
    pub async fn poll_auto_run(&mut self, now: Instant) -> Option<Result<RunReport>> {
        let fragment = self.debounce.take_due(now)?;
        Some(self.run(&fragment).await)
    }

    /// Deliver messages from the active surface to the console and
    /// listeners. Returns how many were accepted.
    pub fn pump(&mut self) -> usize {
        let active = self.active_surface();
        let mut accepted = 0;

        for envelope in self.bus.drain() {
            if Some(envelope.source) != active {
                tracing::debug!(source = %envelope.source, "discarded message from inactive surface");
                continue;
            }
            let message: ForwardedMessage = match serde_json::from_str(&envelope.data) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(source = %envelope.source, error = %e, "ignored non-protocol message");
                    continue;
                }
            };
            self.log.push(message.clone());
            for listener in &mut self.listeners {
                listener(&message);
            }
            accepted += 1;
        }

        accepted
    }

    /// The owning view is going away: drop the surface and release the
    /// handle.
    pub fn teardown(&mut self) {
        self.detach();
        self.slot.unmount();
        self.debounce.pending = None;
    }

    fn detach(&mut self) {
        if let Some(surface) = self.surface.take() {
            tracing::debug!(surface = %surface.id(), "surface detached");
        }
    }
}

impl Drop for SandboxHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConsoleLevel;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn parts(script: &str) -> SourceFragment {
        SourceFragment::parts("<h1>Hi</h1>", "h1{color:red}", script)
    }

    #[tokio::test]
    async fn test_run_forwards_console() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        let report = host.run(&parts("console.log('ready')")).await.unwrap();

        assert_eq!(report.messages, 1);
        assert_eq!(host.console().lines(), vec!["[log] ready".to_string()]);
        assert_eq!(host.state(), SlotState::Displayed);
        assert_eq!(host.resources().live_count(), 1);
        // The surface console still ran.
        assert_eq!(host.surface_console().unwrap().logs, vec!["ready".to_string()]);
    }

    #[tokio::test]
    async fn test_each_level_forwarded_in_order() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts(
            "console.log('l'); console.info('i'); console.warn('w'); console.error('e', {x: 1});",
        ))
        .await
        .unwrap();

        let levels: Vec<_> = host
            .console()
            .iter()
            .map(|m| match m {
                ForwardedMessage::Console { level, .. } => *level,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            levels,
            vec![ConsoleLevel::Log, ConsoleLevel::Info, ConsoleLevel::Warn, ConsoleLevel::Error]
        );
        assert_eq!(host.console().lines()[3], r#"[error] e {"x":1}"#);
    }

    #[tokio::test]
    async fn test_unserializable_argument_falls_back() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts("const a = {}; a.self = a; console.log(a, 'next');"))
            .await
            .unwrap();
        assert_eq!(host.console().lines(), vec!["[log] [object Object] next".to_string()]);
    }

    #[tokio::test]
    async fn test_blocked_fetch_throws_and_reports_once() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts(
            "try { fetch('https://example.com') } catch (e) { console.log('threw ' + e.message) }",
        ))
        .await
        .unwrap();

        assert_eq!(
            host.console().lines(),
            vec![
                "[error] fetch is disabled in sandbox".to_string(),
                "[log] threw fetch is disabled in sandbox".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_blocked_window_open_reports_once() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts(
            "try { window.open('https://x.example') } catch (e) { console.log('threw ' + e.message) }",
        ))
        .await
        .unwrap();

        assert_eq!(
            host.console().lines(),
            vec![
                "[error] window.open is disabled in sandbox".to_string(),
                "[log] threw window.open is disabled in sandbox".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_blocked_xhr_open_and_send_report_once_each() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts(
            "const xhr = new XMLHttpRequest();
             try { xhr.open('GET', '/x') } catch (e) { console.log('threw ' + e.message) }
             try { xhr.send() } catch (e) { console.log('threw ' + e.message) }",
        ))
        .await
        .unwrap();

        assert_eq!(
            host.console().lines(),
            vec![
                "[error] XMLHttpRequest.open is disabled in sandbox".to_string(),
                "[log] threw XMLHttpRequest.open is disabled in sandbox".to_string(),
                "[error] XMLHttpRequest.send is disabled in sandbox".to_string(),
                "[log] threw XMLHttpRequest.send is disabled in sandbox".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_without_lockdown_fetch_reaches_network_policy() {
        let config = HostConfig {
            lockdown: false,
            ..Default::default()
        };
        let mut host = SandboxHost::new(config).unwrap();
        host.run(&parts(
            "fetch('https://example.com').catch((e) => console.log(e.message))",
        ))
        .await
        .unwrap();

        let lines = host.console().lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[log] Fetch blocked"), "{lines:?}");
        assert!(!lines[0].contains("disabled in sandbox"));
    }

    #[tokio::test]
    async fn test_uncaught_error_forwarded_with_stack() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        let report = host.run(&parts("throw new Error('kaboom')")).await.unwrap();

        assert_eq!(report.load.failed, 1);
        let entries: Vec<_> = host.console().iter().cloned().collect();
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            ForwardedMessage::Error { message, stack } => {
                assert!(message.contains("kaboom"));
                assert!(stack.as_deref().unwrap_or_default().contains("kaboom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_surface_messages_discarded() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts("console.log('first')")).await.unwrap();

        // A late message from the first surface, still in flight.
        let stale = host.active_surface().unwrap();
        host.bus.port(stale).post(r#"{"type":"console","level":"log","args":["late"]}"#, "*");

        let report = host.run(&parts("console.log('second')")).await.unwrap();
        assert_ne!(report.surface, stale);
        assert_eq!(host.console().lines(), vec!["[log] second".to_string()]);
    }

    #[tokio::test]
    async fn test_targeted_origin_must_match_host() {
        let config = HostConfig {
            host_origin: "http://localhost:5173".into(),
            target_origin: "https://other.example".into(),
            ..Default::default()
        };
        let mut host = SandboxHost::new(config).unwrap();
        let report = host.run(&parts("console.log('hidden')")).await.unwrap();
        assert_eq!(report.messages, 0);
        assert!(host.console().is_empty());

        let config = HostConfig {
            host_origin: "http://localhost:5173".into(),
            target_origin: "http://localhost:5173".into(),
            ..Default::default()
        };
        let mut host = SandboxHost::new(config).unwrap();
        host.run(&parts("console.log('shown')")).await.unwrap();
        assert_eq!(host.console().lines(), vec!["[log] shown".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_runs_keep_one_live_handle() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        let mut handles = Vec::new();
        for i in 0..4 {
            let report = host.run(&parts(&format!("console.log({i})"))).await.unwrap();
            handles.push(report.handle);
            assert_eq!(host.resources().live_count(), 1);
        }
        for old in &handles[..3] {
            assert!(!host.resources().is_live(old));
        }
        assert_eq!(host.console().lines(), vec!["[log] 3".to_string()]);
    }

    #[tokio::test]
    async fn test_console_kept_across_runs_without_clear() {
        let config = HostConfig {
            clear_on_run: false,
            console_capacity: 3,
            ..Default::default()
        };
        let mut host = SandboxHost::new(config).unwrap();
        host.run(&parts("console.log(1); console.log(2)")).await.unwrap();
        host.run(&parts("console.log(3); console.log(4)")).await.unwrap();

        assert_eq!(host.console().lines(), vec!["[log] 2", "[log] 3", "[log] 4"]);
        host.clear_console();
        assert!(host.console().is_empty());
    }

    #[tokio::test]
    async fn test_listeners_receive_messages() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        let sink = seen.clone();
        host.on_message(move |msg| sink.borrow_mut().push(msg.to_string()));

        host.run(&parts("console.warn('careful')")).await.unwrap();
        assert_eq!(*seen.borrow(), vec!["[warn] careful".to_string()]);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_slot_empty() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        host.run(&parts("console.log('ok')")).await.unwrap();

        let err = host
            .run(&SourceFragment::Document("<html><body>no head</body></html>".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Build(_)));
        assert_eq!(host.state(), SlotState::Empty);
        assert_eq!(host.resources().live_count(), 0);
        assert!(host.active_surface().is_none());
    }

    #[tokio::test]
    async fn test_render_released_handle_fails() {
        let mut host = SandboxHost::new(HostConfig::default()).unwrap();
        let report = host.run(&parts("")).await.unwrap();
        host.resources().release(&report.handle);
        host.resources().release(&report.handle);

        let err = host.render(&report.handle).await.unwrap_err();
        assert!(matches!(err, HostError::UnknownHandle(_)));
    }

    #[tokio::test]
    async fn test_debounced_auto_run() {
        let config = HostConfig {
            debounce_ms: 300,
            ..Default::default()
        };
        let mut host = SandboxHost::new(config).unwrap();
        let start = Instant::now();

        host.edit(parts("console.log('draft')"), start);
        host.edit(parts("console.log('final')"), start + Duration::from_millis(200));

        assert!(host.poll_auto_run(start + Duration::from_millis(400)).await.is_none());
        assert!(host.has_pending_edit());

        let report = host
            .poll_auto_run(start + Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(host.console().lines(), vec!["[log] final".to_string()]);
        assert!(!host.has_pending_edit());
        assert!(host.poll_auto_run(start + Duration::from_secs(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_two_hosts_alternate_on_one_thread() {
        let mut a = SandboxHost::new(HostConfig::default()).unwrap();
        let mut b = SandboxHost::new(HostConfig::default()).unwrap();

        for round in 0..2 {
            a.run(&parts(&format!("console.log('a{round}')"))).await.unwrap();
            b.run(&parts(&format!("console.log('b{round}')"))).await.unwrap();
        }
        assert_eq!(a.console().lines(), vec!["[log] a1".to_string()]);
        assert_eq!(b.console().lines(), vec!["[log] b1".to_string()]);

        drop(a);
        b.run(&parts("console.log('b2')")).await.unwrap();
        assert_eq!(b.console().lines(), vec!["[log] b2".to_string()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = HostConfig::default();
        config.surface.policy.allow_same_origin = true;
        assert!(matches!(SandboxHost::new(config), Err(HostError::Config(_))));

        let config = HostConfig {
            host_origin: "localhost".into(),
            ..Default::default()
        };
        assert!(matches!(
            SandboxHost::with_resources(config, ResourceManager::new()),
            Err(HostError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let resources = ResourceManager::new();
        {
            let mut host = SandboxHost::with_resources(HostConfig::default(), resources.clone()).unwrap();
            host.run(&parts("console.log('x')")).await.unwrap();
            assert_eq!(resources.live_count(), 1);
            host.teardown();
            assert_eq!(host.state(), SlotState::Empty);
            assert_eq!(resources.live_count(), 0);
            host.run(&parts("console.log('y')")).await.unwrap();
        }
        assert_eq!(resources.live_count(), 0);
    }
}
