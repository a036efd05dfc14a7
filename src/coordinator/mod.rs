//! Session registry and the "active" inspection source.
//!
//! The coordinator is an explicit context object: whoever builds the display
//! surface gets a clone of it. It owns one handler per session and forwards
//! the active handler's events to the attached display, if any.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    config::Config,
    connector::Connector,
    error::Result,
    handler::{HandlerEvent, HandlerOptions, InspectionHandler},
    scripts::ScriptRegistry,
};

#[derive(Clone)]
pub struct InspectionCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    registry: &'static ScriptRegistry,
    options: HandlerOptions,
}

#[derive(Default)]
struct CoordinatorState {
    handlers: HashMap<String, InspectionHandler>,
    active: Option<InspectionHandler>,
    forwarder: Option<JoinHandle<()>>,
    /// Bumped on every active-source change; a forwarder only delivers
    /// while its generation is current.
    generation: u64,
    display: Option<mpsc::UnboundedSender<HandlerEvent>>,
}

impl CoordinatorState {
    fn prune(&mut self) {
        self.handlers.retain(|_, h| !h.is_disposed());
        if self.active.as_ref().is_some_and(InspectionHandler::is_disposed) {
            self.active = None;
        }
    }

    fn display_attached(&self) -> bool {
        self.display.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl Default for InspectionCoordinator {
    fn default() -> Self {
        Self::new(ScriptRegistry::builtin(), HandlerOptions::default())
    }
}

impl InspectionCoordinator {
    pub fn new(registry: &'static ScriptRegistry, options: HandlerOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            registry,
            options,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(ScriptRegistry::builtin(), HandlerOptions::from_config(cfg))
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        // state stays consistent across a panicked holder; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` under its session id. A different handler already
    /// registered for that id is disposed.
    pub fn add_handler(&self, handler: InspectionHandler) {
        let mut state = self.lock();
        state.prune();
        debug!(session = %handler.id(), "registering inspection handler");
        let replaced = state
            .handlers
            .insert(handler.id().to_string(), handler.clone());
        if let Some(previous) = replaced.filter(|p| !p.same_as(&handler)) {
            info!(session = %handler.id(), "replacing inspection handler");
            previous.dispose();
            if state.active.as_ref().is_some_and(|a| a.same_as(&previous)) {
                state.active = None;
            }
        }
    }

    pub fn get_handler(&self, id: &str) -> Option<InspectionHandler> {
        let mut state = self.lock();
        state.prune();
        state.handlers.get(id).cloned()
    }

    pub fn has_handler(&self, id: &str) -> bool {
        self.get_handler(id).is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut state = self.lock();
        state.prune();
        let mut ids: Vec<String> = state.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Build and register a handler for a newly observed session, once its
    /// kernel is up and its init script has run.
    pub async fn attach_session(
        &self,
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<InspectionHandler> {
        let id = id.into();
        let handler =
            InspectionHandler::for_connector(id.clone(), connector, self.registry, self.options.clone())
                .await?;
        self.add_handler(handler.clone());
        handler.ready().await?;
        info!(session = %id, "session attached");
        Ok(handler)
    }

    /// Session teardown: forget the session and dispose its handler.
    pub fn detach_session(&self, id: &str) -> Option<InspectionHandler> {
        let handler = self.lock().handlers.remove(id)?;
        handler.dispose();
        info!(session = %id, "session detached");
        Some(handler)
    }

    pub fn active_source(&self) -> Option<InspectionHandler> {
        let mut state = self.lock();
        state.prune();
        state.active.clone()
    }

    /// Make `source` the active handler. The previous source's event
    /// subscription is released before this returns; with a display attached
    /// the new source is inspected immediately.
    pub async fn set_active_source(&self, source: Option<InspectionHandler>) {
        let previous = {
            let mut state = self.lock();
            state.prune();
            let unchanged = match (&state.active, &source) {
                (Some(current), Some(next)) => current.same_as(next),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
            state.active = source.clone();
            state.generation += 1;
            let previous = state.forwarder.take();
            if let Some(next) = &source {
                state.forwarder = Some(self.spawn_forwarder(next, state.generation));
            }
            previous
        };

        if let Some(forwarder) = previous {
            forwarder.abort();
            let _ = forwarder.await;
        }

        if let Some(next) = source {
            debug!(session = %next.id(), "active inspection source changed");
            if self.display_attached() {
                let _ = next.perform_inspection();
            }
        }
    }

    /// Activate a registered session (e.g. on a focus change). Returns
    /// false when the session has no handler.
    pub async fn activate_session(&self, id: &str) -> bool {
        match self.get_handler(id) {
            Some(handler) => {
                self.set_active_source(Some(handler)).await;
                true
            }
            None => false,
        }
    }

    /// Attach a display surface; it receives the active source's events.
    /// Replaces any previously attached display.
    pub fn attach_display(&self) -> mpsc::UnboundedReceiver<HandlerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = {
            let mut state = self.lock();
            state.prune();
            state.display = Some(tx);
            state.active.clone()
        };
        if let Some(active) = active {
            let _ = active.perform_inspection();
        }
        rx
    }

    pub fn detach_display(&self) {
        self.lock().display = None;
    }

    pub fn display_attached(&self) -> bool {
        self.lock().display_attached()
    }

    fn spawn_forwarder(&self, source: &InspectionHandler, generation: u64) -> JoinHandle<()> {
        let mut events = source.subscribe();
        let source_id = source.id().to_string();
        let shared = Arc::clone(&self.state);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let disposed = matches!(event, HandlerEvent::Disposed);
                let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                // events still in flight from a replaced source are dropped
                let current = state.generation == generation;
                if current {
                    if let Some(display) = &state.display {
                        let _ = display.send(event);
                    }
                }
                if disposed {
                    if current {
                        if state.active.as_ref().is_some_and(InspectionHandler::is_disposed) {
                            state.active = None;
                        }
                        state.forwarder = None;
                    }
                    if state
                        .handlers
                        .get(&source_id)
                        .is_some_and(InspectionHandler::is_disposed)
                    {
                        state.handlers.remove(&source_id);
                    }
                    debug!(session = %source_id, "inspection source disposed");
                    break;
                }
            }
        })
    }
}
