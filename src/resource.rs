//! Ephemeral resource handles for built documents.
//!
//! A [`ResourceManager`] is an in-memory blob store: `materialize` stores a
//! document and hands back a `blob:` locator, `release` forgets it. Release
//! is idempotent. A [`PreviewSlot`] owns at most one live handle at a time and
//! releases it when superseded or dropped.

use crate::document::SandboxDocument;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

const HANDLE_PREFIX: &str = "blob:preview-sandbox/";
const CONTENT_TYPE: &str = "text/html";

/// Opaque locator for a materialized document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle(String);

impl ResourceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct Blob {
    content_type: &'static str,
    data: Rc<str>,
}

/// Shared blob store. Clones refer to the same store.
#[derive(Debug, Clone, Default)]
pub struct ResourceManager {
    blobs: Rc<RefCell<HashMap<String, Blob>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materialize(&self, document: &SandboxDocument) -> ResourceHandle {
        let handle = ResourceHandle(format!("{HANDLE_PREFIX}{}", Uuid::new_v4()));
        self.blobs.borrow_mut().insert(
            handle.0.clone(),
            Blob {
                content_type: CONTENT_TYPE,
                data: Rc::from(document.as_str()),
            },
        );
        tracing::debug!(handle = %handle, bytes = document.as_str().len(), "materialized document");
        handle
    }

    /// Forget `handle`. Unknown or already released handles are ignored.
    pub fn release(&self, handle: &ResourceHandle) {
        if self.blobs.borrow_mut().remove(&handle.0).is_some() {
            tracing::debug!(handle = %handle, "released document");
        }
    }

    /// Dereference a live handle.
    pub fn resolve(&self, handle: &ResourceHandle) -> Option<Rc<str>> {
        self.blobs.borrow().get(&handle.0).map(|blob| blob.data.clone())
    }

    pub fn content_type(&self, handle: &ResourceHandle) -> Option<&'static str> {
        self.blobs.borrow().get(&handle.0).map(|blob| blob.content_type)
    }

    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        self.blobs.borrow().contains_key(&handle.0)
    }

    /// Number of handles not yet released.
    pub fn live_count(&self) -> usize {
        self.blobs.borrow().len()
    }
}

/// Lifecycle of one preview slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Building,
    Displayed,
}

/// One logical preview area and the handle it currently shows.
#[derive(Debug)]
pub struct PreviewSlot {
    resources: ResourceManager,
    current: Option<ResourceHandle>,
    state: SlotState,
}

impl PreviewSlot {
    pub fn new(resources: ResourceManager) -> Self {
        Self {
            resources,
            current: None,
            state: SlotState::Empty,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn current(&self) -> Option<&ResourceHandle> {
        self.current.as_ref()
    }

    /// Enter `Building`, releasing whatever the slot was showing.
    pub fn begin_build(&mut self) {
        self.release_current();
        self.state = SlotState::Building;
    }

    /// Materialize the next document for this slot.
    pub fn materialize(&mut self, document: &SandboxDocument) -> ResourceHandle {
        // Callers normally go through begin_build; never leak a prior handle.
        self.release_current();
        let handle = self.resources.materialize(document);
        self.current = Some(handle.clone());
        handle
    }

    /// The current handle is bound to the rendering surface.
    pub fn mark_displayed(&mut self) {
        if self.current.is_some() {
            self.state = SlotState::Displayed;
        }
    }

    /// A build or render failed; nothing is shown.
    pub fn abort(&mut self) {
        self.release_current();
        self.state = SlotState::Empty;
    }

    /// The owning view is going away.
    pub fn unmount(&mut self) {
        self.abort();
    }

    fn release_current(&mut self) {
        if let Some(handle) = self.current.take() {
            self.resources.release(&handle);
        }
    }
}

impl Drop for PreviewSlot {
    fn drop(&mut self) {
        self.release_current();
    }
}
