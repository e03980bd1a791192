//! 执行监管：每个运行中 Execution 一个取消令牌
//!
//! 所有令牌都是根令牌的子令牌；cancel(id) 只取消单个 Execution，取消根令牌则通知全部。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::ExecutionId;

#[derive(Debug)]
pub struct ExecutionSupervisor {
    root: CancellationToken,
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl ExecutionSupervisor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// 为即将运行的 Execution 登记取消令牌
    pub fn register(&self, execution_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        if let Ok(mut active) = self.active.lock() {
            active.insert(execution_id.to_string(), token.clone());
        }
        token
    }

    /// worker 退出时注销
    pub fn finish(&self, execution_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(execution_id);
        }
    }

    /// 取消单个 Execution；不在本进程运行时返回 false
    pub fn cancel(&self, execution_id: &str) -> bool {
        let token = self.active.lock().ok().and_then(|a| a.get(execution_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains_key(execution_id))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

impl Default for ExecutionSupervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
