//! ReAct 层：Step Controller 主循环与过程事件

pub mod events;
pub mod loop_;

pub use events::{ProgressEvent, ReactEvent};
pub use loop_::StepController;
