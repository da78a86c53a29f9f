// src/service/mod.rs
//! # 服务层
//!
//! 把线路上的 JSON 请求翻译成 daemon 命令：
//! - `public`：桌面客户端（会话、事件查询、startup agent）
//! - `agent`：app 进程内的 agent（心跳、CPU trace start/stop）
//!
//! 每行一个请求 `{"op": ...}`，每行一个响应 `{"ok": bool, "result" | "error": ...}`。
pub mod agent;
pub mod public;

pub use agent::{AgentRequest, TraceEvent, handle_agent};
pub use public::{PublicRequest, handle_public};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Response { ok: true, result: Some(value), error: None },
            Err(e) => Response::error(format!("encoding result: {e}")),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response { ok: false, result: None, error: Some(message.into()) }
    }

    /// 编码成一行（含结尾换行）
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"encoding response"}"#.to_string());
        line.push('\n');
        line
    }
}

impl<T: Serialize, E: std::fmt::Display> From<Result<T, E>> for Response {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Response::ok(&value),
            Err(e) => Response::error(e.to_string()),
        }
    }
}
