//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、输出解析与模型网关

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod parser;
pub mod traits;

pub use gateway::{CallContext, GatewayResponse, GatewaySummarizer, ModelGateway, DEFAULT_MAX_PARSE_RETRIES};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use parser::{parse_model_output, parse_text, ModelResponse};
pub use traits::{LlmClient, LlmError, LlmOutput, ModelParams, TokenStream};
