//! Scripted in-memory kernel used by the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use varinspect::{
    Connector, ExecuteReply, ExecuteRequest, HandlerEvent, InspectorError, KernelMessage,
    KernelRestart, MessageKind, Result, StreamCallback,
};

pub const LISTING_A: &str = r#"'[{"varName":"a","varType":"int","varSize":"28","varShape":"","varContent":"1","isMatrix":false}]'"#;

pub const TABLE_DF: &str = r#"'{"schema":{"fields":[{"name":"index","type":"integer"},{"name":"x","type":"number"}],"primaryKey":["index"]},"data":[{"index":0,"x":1.5},{"index":1,"x":2.5},{"index":2,"x":3.5}]}'"#;

pub struct ScriptedKernel {
    language: String,
    display_name: String,
    attached: AtomicBool,
    session_failed: AtomicBool,
    output: broadcast::Sender<KernelMessage>,
    restarts: broadcast::Sender<KernelRestart>,
    responses: Mutex<HashMap<String, Vec<KernelMessage>>>,
    submissions: Mutex<Vec<ExecuteRequest>>,
}

impl ScriptedKernel {
    pub fn new(language: &str, display_name: &str) -> Arc<Self> {
        let (output, _) = broadcast::channel(64);
        let (restarts, _) = broadcast::channel(8);
        Arc::new(Self {
            language: language.to_string(),
            display_name: display_name.to_string(),
            attached: AtomicBool::new(true),
            session_failed: AtomicBool::new(false),
            output,
            restarts,
            responses: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn python(display_name: &str) -> Arc<Self> {
        Self::new("python", display_name)
    }

    /// Messages the kernel emits when `code` is executed.
    pub fn respond(&self, code: &str, messages: Vec<KernelMessage>) {
        self.responses
            .lock()
            .unwrap()
            .insert(code.to_string(), messages);
    }

    pub fn fail(&self, code: &str, ename: &str, evalue: &str) {
        self.respond(code, vec![KernelMessage::error(ename, evalue)]);
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn fail_session(&self) {
        self.session_failed.store(true, Ordering::SeqCst);
    }

    /// Code submitted by someone else (the user, other tooling).
    pub fn user_execute(&self, code: &str) {
        let _ = self.output.send(KernelMessage::execute_input(code));
    }

    /// Signal a restart; the new kernel is ready once the returned sender fires.
    pub fn restart(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel::<()>();
        let restart = KernelRestart::new(async move {
            rx.await
                .map_err(|_| InspectorError::KernelUnavailable("restart abandoned".into()))
        });
        let _ = self.restarts.send(restart);
        tx
    }

    pub fn submissions(&self) -> Vec<ExecuteRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn count(&self, code: &str) -> usize {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.code == code)
            .count()
    }

    pub fn output_subscribers(&self) -> usize {
        self.output.receiver_count()
    }

    pub fn restart_subscribers(&self) -> usize {
        self.restarts.receiver_count()
    }
}

#[async_trait]
impl Connector for ScriptedKernel {
    async fn ready(&self) -> Result<()> {
        if self.session_failed.load(Ordering::SeqCst) {
            return Err(InspectorError::KernelUnavailable("session failed".into()));
        }
        Ok(())
    }

    fn kernel_language(&self) -> String {
        self.language.clone()
    }

    fn kernel_display_name(&self) -> String {
        self.display_name.clone()
    }

    fn subscribe_restarts(&self) -> broadcast::Receiver<KernelRestart> {
        self.restarts.subscribe()
    }

    fn subscribe_output(&self) -> broadcast::Receiver<KernelMessage> {
        self.output.subscribe()
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        mut on_stream: StreamCallback,
    ) -> Result<ExecuteReply> {
        tokio::task::yield_now().await;
        if !self.attached.load(Ordering::SeqCst) {
            return Err(InspectorError::KernelUnavailable(
                "Require kernel to perform variable inspection!".into(),
            ));
        }
        self.submissions.lock().unwrap().push(request.clone());

        let mut messages = Vec::new();
        if !request.silent {
            messages.push(KernelMessage::execute_input(request.code.clone()));
        }
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get(&request.code)
            .cloned()
            .unwrap_or_default();
        messages.extend(scripted);

        let mut reply = ExecuteReply::ok();
        for msg in &messages {
            if msg.kind == MessageKind::Error {
                let summary = msg.error_summary().unwrap_or_default();
                let (ename, evalue) = summary.split_once(": ").unwrap_or((summary.as_str(), ""));
                reply = ExecuteReply::error(ename, evalue);
            }
            if !request.silent {
                let _ = self.output.send(msg.clone());
            }
            on_stream(msg);
        }
        Ok(reply)
    }
}

/// Let spawned handler tasks run to quiescence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn next_event(rx: &mut broadcast::Receiver<HandlerEvent>) -> HandlerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler event channel closed")
}

pub async fn next_display_event(rx: &mut mpsc::UnboundedReceiver<HandlerEvent>) -> HandlerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for display event")
        .expect("display channel closed")
}
