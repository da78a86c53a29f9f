// src/lib.rs
//! crab-perfd 库：session / sampler / event / cpu / agent / daemon / service / server / monitor

pub mod agent;    // agent 心跳、状态与注入
pub mod clock;    // 单调时钟
pub mod command;  // 命令与注册表
pub mod config;   // JSON 配置
pub mod cpu;      // CPU trace capture 状态
pub mod daemon;   // 命令执行核心
pub mod error;    // 领域错误
pub mod event;    // 事件模型与缓冲区
pub mod monitor;  // 监控 & 诊断
pub mod procfs;   // /proc 读取与解析
pub mod sampler;  // 周期采样
pub mod server;   // 网络层
pub mod service;  // 请求 -> 命令
pub mod session;  // 会话与会话管理
