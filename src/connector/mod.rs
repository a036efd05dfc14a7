//! Kernel connector contract: execute requests, output messages and restarts.
//!
//! A connector is a thin transport over one session's kernel. It never filters
//! traffic; every output message the kernel emits, whoever submitted the code,
//! is fanned out on the session-wide output feed.

use std::fmt;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::Result;

/// The only MIME type this crate consumes from result payloads.
pub const TEXT_PLAIN: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ExecuteResult,
    DisplayData,
    ExecuteInput,
    Error,
    Stream,
    Status,
    #[serde(other)]
    Other,
}

/// One output message from the kernel, with its protocol content left as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    #[serde(rename = "msg_type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(kind: MessageKind, content: Value) -> Self {
        Self { kind, content }
    }

    pub fn execute_input(code: impl Into<String>) -> Self {
        Self::new(MessageKind::ExecuteInput, json!({ "code": code.into() }))
    }

    pub fn execute_result(text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::ExecuteResult,
            json!({ "data": { "text/plain": text.into() }, "metadata": {} }),
        )
    }

    pub fn display_data(text: impl Into<String>) -> Self {
        Self::new(
            MessageKind::DisplayData,
            json!({ "data": { "text/plain": text.into() }, "metadata": {} }),
        )
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error,
            json!({ "ename": ename.into(), "evalue": evalue.into(), "traceback": [] }),
        )
    }

    /// Submitted code, for `execute_input` messages.
    pub fn code(&self) -> Option<&str> {
        self.content.get("code").and_then(Value::as_str)
    }

    /// The `text/plain` entry of the MIME bundle, for result/display messages.
    pub fn text_plain(&self) -> Option<&str> {
        self.content
            .get("data")
            .and_then(|d| d.get(TEXT_PLAIN))
            .and_then(Value::as_str)
    }

    /// `ename: evalue` for error messages.
    pub fn error_summary(&self) -> Option<String> {
        if self.kind != MessageKind::Error {
            return None;
        }
        let ename = self.content.get("ename").and_then(Value::as_str).unwrap_or("Error");
        let evalue = self.content.get("evalue").and_then(Value::as_str).unwrap_or("");
        Some(format!("{}: {}", ename, evalue))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    pub store_history: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// A probe submission: no history, and a failing statement does not stop
    /// the rest of the submission.
    pub fn probe(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: false,
            stop_on_error: false,
        }
    }

    /// Like [`ExecuteRequest::probe`] but silent: kernels neither broadcast
    /// the input nor publish results.
    pub fn silent(code: impl Into<String>) -> Self {
        Self {
            silent: true,
            ..Self::probe(code)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
}

impl ExecuteReply {
    pub fn ok() -> Self {
        Self { status: ReplyStatus::Ok, execution_count: None, ename: None, evalue: None }
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            execution_count: None,
            ename: Some(ename.into()),
            evalue: Some(evalue.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn error_summary(&self) -> String {
        format!(
            "{}: {}",
            self.ename.as_deref().unwrap_or("Error"),
            self.evalue.as_deref().unwrap_or("")
        )
    }
}

/// Resolves once the restarted kernel is ready.
pub type KernelReady = Shared<BoxFuture<'static, Result<()>>>;

/// Restart notification. Fired once per restart; the carried future resolves
/// when the *new* kernel instance can accept requests.
#[derive(Clone)]
pub struct KernelRestart {
    ready: KernelReady,
}

impl KernelRestart {
    pub fn new<F>(ready: F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self { ready: ready.boxed().shared() }
    }

    pub async fn ready(self) -> Result<()> {
        self.ready.await
    }
}

impl fmt::Debug for KernelRestart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRestart").finish_non_exhaustive()
    }
}

/// Callback receiving every intermediate output message of one submission.
pub type StreamCallback = Box<dyn FnMut(&KernelMessage) + Send>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the session and its kernel are both available. Fails
    /// only if the session itself fails.
    async fn ready(&self) -> Result<()>;

    /// Language reported by the attached kernel (may change across restarts).
    fn kernel_language(&self) -> String;

    /// Display name of the attached kernel.
    fn kernel_display_name(&self) -> String;

    fn subscribe_restarts(&self) -> broadcast::Receiver<KernelRestart>;

    /// Session-wide feed of all kernel output messages.
    fn subscribe_output(&self) -> broadcast::Receiver<KernelMessage>;

    /// Submit code and stream each output message of this submission to
    /// `on_stream` before resolving with the final reply. Fails with
    /// `KernelUnavailable` when no kernel is attached.
    async fn execute(&self, request: ExecuteRequest, on_stream: StreamCallback)
        -> Result<ExecuteReply>;
}
