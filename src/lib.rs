//! Live variable inspection for interactive kernels.
//!
//! Small probe programs are injected into a kernel's own execution stream and
//! their printed output is decoded into a typed variable table, kept in sync
//! as the kernel runs more code or restarts.

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod model;
pub mod scripts;

pub use config::Config;
pub use connector::{
    Connector, ExecuteReply, ExecuteRequest, KernelMessage, KernelRestart, MessageKind,
    ReplyStatus, StreamCallback,
};
pub use coordinator::InspectionCoordinator;
pub use error::{InspectorError, Result};
pub use handler::{HandlerEvent, HandlerOptions, HandlerState, InspectionHandler};
pub use model::{InspectionTitle, InspectionUpdate, MatrixModel, VariableRecord};
pub use scripts::{ProbeBundle, ScriptRegistry};
