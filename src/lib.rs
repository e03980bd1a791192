//! Hive - Rust 智能体执行引擎
//!
//! 模块划分：
//! - **agent**: Agent 定义（模型参数、指令、可用工具、记忆策略、风险策略、限制与触发器）与注册表
//! - **approval**: 高风险工具调用的挂起、人工决议与恢复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、执行状态、worker 池、引擎门面与构建器、优雅关闭
//! - **daemon**: 守护进程装配与优雅关闭（两个二进制共用）
//! - **events**: Execution 终态事件（广播 / webhook）
//! - **llm**: 模型客户端抽象、输出解析与 Model Gateway（重试、配额、超时）
//! - **memory**: 短期 / 长期 / 情节记忆、token 预算与上下文组装
//! - **react**: 有界 ReAct 循环（Step Controller）
//! - **store**: 持久化边界（进程内 / SQLite）
//! - **tools**: 工具注册表、参数 schema、风险分级与分发
//! - **trigger**: 事件、手动、webhook 与定时触发
//! - **usage**: token / 费用计量与配额
//! - **api**: HTTP 接口（feature `web`）

pub mod agent;
#[cfg(feature = "web")]
pub mod api;
pub mod approval;
pub mod config;
pub mod core;
pub mod daemon;
pub mod events;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;
pub mod trigger;
pub mod usage;

pub use crate::core::{Engine, EngineBuilder};
