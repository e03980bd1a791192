//! 核心层：错误与恢复、执行状态、执行监管、worker 池、引擎门面与构建器、优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use builder::{open_store, EngineBuilder};
pub use error::{AgentError, FailureReason, RecoveryAction};
pub use orchestrator::{create_llm_from_config, Engine};
pub use recovery::RecoveryEngine;
pub use session_supervisor::ExecutionSupervisor;
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, WorkerDrain};
pub use state::{
    new_execution_id, AgentId, ApprovalId, ContextSummary, Execution, ExecutionId, ExecutionResult, ExecutionStatus,
    Observation, ObservationKind, Step, StepAction, SuspendedCall, TokenUsage, ToolCall, TriggerSource,
};
pub use task_scheduler::TaskScheduler;
