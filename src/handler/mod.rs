//! Variable inspection handler for one kernel session.
//!
//! A handler owns its connector subscriptions through a single driver task:
//! it waits for the kernel, runs the bundle's init script, then watches the
//! session's output feed and re-inspects whenever someone else submits code.
//! Restarts re-run the init script on the new kernel before resynchronising.

pub mod decode;

use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures_core::Stream;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, DEFAULT_EVENT_CAPACITY, DEFAULT_MATRIX_MAX_ROWS, DEFAULT_RESTART_NOTICE},
    connector::{
        Connector, ExecuteRequest, KernelMessage, KernelRestart, MessageKind, StreamCallback,
    },
    error::{InspectorError, Result},
    model::{InspectionTitle, InspectionUpdate, MatrixModel},
    scripts::{ProbeBundle, ScriptRegistry},
};

use self::decode::{decode_matrix, decode_variables};

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub matrix_max_rows: usize,
    pub restart_notice: String,
    pub event_capacity: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            matrix_max_rows: DEFAULT_MATRIX_MAX_ROWS,
            restart_notice: DEFAULT_RESTART_NOTICE.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl HandlerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            matrix_max_rows: cfg.matrix_max_rows(),
            restart_notice: cfg.restart_notice(),
            event_capacity: cfg.event_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the kernel or running the init script.
    Initializing,
    Ready,
    /// A restart was signalled; waiting for the new kernel.
    Restarting,
    /// The kernel or the init script failed. Not retried.
    Failed(InspectorError),
    Disposed,
}

#[derive(Debug, Clone)]
pub enum HandlerEvent {
    Inspected(InspectionUpdate),
    /// A fire-and-forget query or delete failed.
    Failed(InspectorError),
    /// Emitted exactly once, on the first `dispose()`.
    Disposed,
}

pub type HandlerEventStream = Pin<Box<dyn Stream<Item = HandlerEvent> + Send>>;

#[derive(Clone)]
pub struct InspectionHandler {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    connector: Arc<dyn Connector>,
    bundle: ProbeBundle,
    options: HandlerOptions,
    events: broadcast::Sender<HandlerEvent>,
    state: watch::Sender<HandlerState>,
    disposed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl InspectionHandler {
    /// Start inspecting `connector`'s kernel with `bundle`. Must be called from
    /// within a Tokio runtime; the handler runs until [`dispose`](Self::dispose).
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
        bundle: ProbeBundle,
        options: HandlerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (state, _) = watch::channel(HandlerState::Initializing);
        let restarts = connector.subscribe_restarts();

        let inner = Arc::new(Inner {
            id: id.into(),
            connector,
            bundle,
            options,
            events,
            state,
            disposed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(Arc::clone(&inner).drive(restarts));
        if let Ok(mut slot) = inner.driver.lock() {
            *slot = Some(driver);
        }
        Self { inner }
    }

    /// Wait for the connector, pick the bundle for its kernel language and
    /// start a handler. Fails with `UnsupportedLanguage` when no bundle fits.
    pub async fn for_connector(
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
        registry: &ScriptRegistry,
        options: HandlerOptions,
    ) -> Result<Self> {
        connector.ready().await?;
        let language = connector.kernel_language();
        let bundle = registry.lookup(&language)?.clone();
        Ok(Self::new(id, connector, bundle, options))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether both values refer to the same handler instance.
    pub fn same_as(&self, other: &InspectionHandler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn bundle(&self) -> &ProbeBundle {
        &self.inner.bundle
    }

    pub fn state(&self) -> HandlerState {
        self.inner.state.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once the init script has run on the current kernel.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, HandlerState::Initializing | HandlerState::Restarting))
            .await
            .map(|s| s.clone())
            .map_err(|_| InspectorError::HandlerDisposed)?;
        match state {
            HandlerState::Failed(err) => Err(err),
            HandlerState::Disposed => Err(InspectorError::HandlerDisposed),
            _ => Ok(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.inner.events.subscribe()
    }

    /// Handler events as a stream; ends after `Disposed`.
    pub fn events(&self) -> HandlerEventStream {
        let mut rx = self.subscribe();
        let id = self.inner.id.clone();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = matches!(event, HandlerEvent::Disposed);
                        yield event;
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = %id, skipped, "inspection events dropped for slow subscriber");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Live event subscriptions, including the coordinator's.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// Submit the query command. Returns immediately; the update (or a
    /// failure) arrives as a [`HandlerEvent`].
    pub fn perform_inspection(&self) -> Result<()> {
        self.inner.check_usable()?;
        self.inner.spawn_query(self.inner.bundle.query_command.clone());
        Ok(())
    }

    /// Fetch the table behind a matrix-like variable, capped at `max_rows`
    /// (the configured default when `None`).
    pub async fn perform_matrix_inspection(
        &self,
        name: &str,
        max_rows: Option<usize>,
    ) -> Result<MatrixModel> {
        self.inner.check_usable()?;
        let max_rows = max_rows.unwrap_or(self.inner.options.matrix_max_rows);
        let code = self.inner.bundle.matrix_query(name, max_rows);

        let outcome: Arc<Mutex<Option<Result<MatrixModel>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        let on_stream: StreamCallback = Box::new(move |msg: &KernelMessage| {
            let decoded = match msg.kind {
                MessageKind::ExecuteResult => match msg.text_plain() {
                    Some(text) => decode_matrix(text),
                    None => Err(InspectorError::DecodeError("result has no text/plain data".into())),
                },
                MessageKind::Error => Err(InspectorError::KernelEvaluationError {
                    command: "matrixQuery".into(),
                    message: msg.error_summary().unwrap_or_default(),
                }),
                _ => return,
            };
            if let Ok(mut slot) = sink.lock() {
                // a kernel error overrides anything decoded before it
                if slot.is_none() || matches!(decoded, Err(InspectorError::KernelEvaluationError { .. })) {
                    *slot = Some(decoded);
                }
            }
        });

        let reply = self
            .inner
            .connector
            .execute(ExecuteRequest::probe(code), on_stream)
            .await?;

        let outcome = outcome.lock().ok().and_then(|mut slot| slot.take());
        match outcome {
            Some(Ok(mut model)) if reply.is_ok() => {
                model.truncate_rows(max_rows);
                Ok(model)
            }
            Some(Err(err)) => Err(err),
            _ if !reply.is_ok() => Err(InspectorError::KernelEvaluationError {
                command: "matrixQuery".into(),
                message: reply.error_summary(),
            }),
            _ => Err(InspectorError::DecodeError(format!(
                "no table payload returned for {}",
                name
            ))),
        }
    }

    /// Delete a variable in the kernel. Fire-and-forget; any output goes
    /// through the same decode-and-emit path as a query.
    pub fn perform_delete(&self, name: &str) -> Result<()> {
        self.inner.check_usable()?;
        self.inner.spawn_query(self.inner.bundle.delete(name));
        Ok(())
    }

    /// Stop inspecting. Idempotent; only the first call emits `Disposed`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.inner.id, "disposing inspection handler");
        self.inner.state.send_replace(HandlerState::Disposed);
        let _ = self.inner.events.send(HandlerEvent::Disposed);
    }

    /// Resolves once the driver task has released its connector subscriptions.
    pub async fn closed(&self) {
        let driver = self.inner.driver.lock().ok().and_then(|mut slot| slot.take());
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl fmt::Debug for InspectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectionHandler")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, restarts: broadcast::Receiver<KernelRestart>) {
        let mut lifecycle = self.state.subscribe();
        let mut restarts = Some(restarts);

        let mut output = tokio::select! {
            _ = wait_disposed(&mut lifecycle) => return,
            output = self.initialize(None) => output,
        };

        loop {
            tokio::select! {
                _ = wait_disposed(&mut lifecycle) => break,
                restart = next_restart(&mut restarts, &self.id) => {
                    // old kernel's feed is stale until the new one is initialised
                    drop(output.take());
                    self.begin_restart();
                    output = tokio::select! {
                        _ = wait_disposed(&mut lifecycle) => break,
                        output = self.initialize(Some(restart)) => output,
                    };
                    if output.is_some() {
                        info!(session = %self.id, "kernel restarted, resynchronising");
                        self.spawn_query(self.bundle.query_command.clone());
                    }
                }
                msg = next_output(&mut output, &self.id) => self.observe(&msg),
            }
        }
        debug!(session = %self.id, "inspection driver stopped");
    }

    /// Wait for the kernel, run the init script, then subscribe to the
    /// output feed. Returns the subscription on success.
    async fn initialize(
        self: &Arc<Self>,
        restart: Option<KernelRestart>,
    ) -> Option<broadcast::Receiver<KernelMessage>> {
        let kernel_ready = match restart {
            Some(restart) => restart.ready().await,
            None => self.connector.ready().await,
        };
        if let Err(err) = kernel_ready {
            warn!(session = %self.id, error = %err, "kernel not available");
            self.set_state(HandlerState::Failed(err));
            return None;
        }

        self.set_state(HandlerState::Initializing);
        debug!(session = %self.id, "running init script");
        let init = ExecuteRequest::silent(self.bundle.init_script.clone());
        let reply = self
            .connector
            .execute(init, Box::new(|_: &KernelMessage| {}))
            .await;

        let failure = match reply {
            Ok(reply) if reply.is_ok() => None,
            Ok(reply) => Some(reply.error_summary()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(message) = failure {
            warn!(session = %self.id, error = %message, "init script failed");
            self.set_state(HandlerState::Failed(InspectorError::InitializationFailed(message)));
            return None;
        }

        let output = self.connector.subscribe_output();
        self.set_state(HandlerState::Ready);
        info!(session = %self.id, kernel = %self.connector.kernel_display_name(), "inspection handler ready");
        Some(output)
    }

    fn begin_restart(&self) {
        info!(session = %self.id, "kernel restarting");
        self.set_state(HandlerState::Restarting);
        self.emit(HandlerEvent::Inspected(InspectionUpdate::restarting(
            self.options.restart_notice.clone(),
        )));
    }

    /// Passive re-inspection: any submission other than our own queries.
    fn observe(self: &Arc<Self>, msg: &KernelMessage) {
        if msg.kind != MessageKind::ExecuteInput {
            return;
        }
        let code = msg.code().unwrap_or_default();
        if self.bundle.is_own_query(code) {
            return;
        }
        debug!(session = %self.id, "code submitted, re-inspecting");
        self.spawn_query(self.bundle.query_command.clone());
    }

    fn spawn_query(self: &Arc<Self>, code: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_query(code).await });
    }

    async fn run_query(self: Arc<Self>, code: String) {
        let saw_error = Arc::new(AtomicBool::new(false));
        let on_stream: StreamCallback = {
            let inner = Arc::clone(&self);
            let saw_error = Arc::clone(&saw_error);
            let command = code.clone();
            Box::new(move |msg: &KernelMessage| {
                if msg.kind == MessageKind::Error {
                    saw_error.store(true, Ordering::SeqCst);
                    inner.emit(HandlerEvent::Failed(InspectorError::KernelEvaluationError {
                        command: command.clone(),
                        message: msg.error_summary().unwrap_or_default(),
                    }));
                } else {
                    inner.handle_query_response(msg);
                }
            })
        };

        match self.connector.execute(ExecuteRequest::probe(code.clone()), on_stream).await {
            Ok(reply) if !reply.is_ok() && !saw_error.load(Ordering::SeqCst) => {
                self.emit(HandlerEvent::Failed(InspectorError::KernelEvaluationError {
                    command: code,
                    message: reply.error_summary(),
                }));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(session = %self.id, error = %err, "inspection request failed");
                self.emit(HandlerEvent::Failed(err));
            }
        }
    }

    fn handle_query_response(&self, msg: &KernelMessage) {
        if !matches!(msg.kind, MessageKind::ExecuteResult | MessageKind::DisplayData) {
            return;
        }
        let Some(text) = msg.text_plain() else {
            return;
        };
        match decode_variables(text) {
            Ok(variables) => self.emit(HandlerEvent::Inspected(InspectionUpdate {
                title: self.title(),
                variables,
            })),
            Err(err) => {
                warn!(session = %self.id, error = %err, "undecodable variable listing");
                self.emit(HandlerEvent::Failed(err));
            }
        }
    }

    fn title(&self) -> InspectionTitle {
        InspectionTitle {
            context_name: Some(String::new()),
            kernel_name: Some(self.connector.kernel_display_name()),
            language_name: Some(self.connector.kernel_language()),
        }
    }

    fn check_usable(&self) -> Result<()> {
        match &*self.state.borrow() {
            HandlerState::Disposed => Err(InspectorError::HandlerDisposed),
            HandlerState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Late replies after disposal are dropped.
    fn emit(&self, event: HandlerEvent) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: HandlerState) {
        self.state.send_if_modified(|state| {
            if *state == HandlerState::Disposed {
                return false;
            }
            *state = next;
            true
        });
    }
}

async fn wait_disposed(rx: &mut watch::Receiver<HandlerState>) {
    let _ = rx.wait_for(|s| *s == HandlerState::Disposed).await;
}

async fn next_restart(
    rx: &mut Option<broadcast::Receiver<KernelRestart>>,
    session: &str,
) -> KernelRestart {
    loop {
        let Some(restarts) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match restarts.recv().await {
            Ok(restart) => return restart,
            Err(RecvError::Lagged(skipped)) => {
                warn!(session, skipped, "missed kernel restart notifications");
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

async fn next_output(
    rx: &mut Option<broadcast::Receiver<KernelMessage>>,
    session: &str,
) -> KernelMessage {
    loop {
        let Some(output) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match output.recv().await {
            Ok(msg) => return msg,
            Err(RecvError::Lagged(skipped)) => {
                debug!(session, skipped, "output feed lagged");
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}
