// src/server.rs
//! 网络层：
//! - 监听 public / agent 两个 TCP 端口
//! - 每行解码一个 JSON 请求
//! - 调度到 daemon 执行（阻塞调用放进 spawn_blocking）
//! - 每行回复一个 JSON 响应
//! - `stream_events` 把连接切换成事件流
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::event::Event;
use crate::monitor::Monitor;
use crate::service::{AgentRequest, PublicRequest, Response, handle_agent, handle_public};

/// 流式读者的背压缓冲
const STREAM_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Public,
    Agent,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Public => "public",
            Service::Agent => "agent",
        }
    }
}

/// 所有连接共享的句柄
#[derive(Clone)]
pub struct ServerContext {
    pub daemon: Arc<Daemon>,
    pub monitor: Monitor,
    // 同一时刻只有一个事件流读者
    stream_slot: Arc<Mutex<()>>,
}

impl ServerContext {
    pub fn new(daemon: Arc<Daemon>, monitor: Monitor) -> Self {
        ServerContext { daemon, monitor, stream_slot: Arc::new(Mutex::new(())) }
    }
}

/// 按配置绑定两个端口并服务，直到 `shutdown` 完成
pub async fn run(ctx: ServerContext, shutdown: impl Future<Output = ()>) -> Result<()> {
    let config = ctx.daemon.config().clone();
    let public = TcpListener::bind(&config.public_addr)
        .await
        .with_context(|| format!("binding public service {}", config.public_addr))?;
    let agent = TcpListener::bind(&config.agent_addr)
        .await
        .with_context(|| format!("binding agent service {}", config.agent_addr))?;
    info!(public = %config.public_addr, agent = %config.agent_addr, "daemon listening");

    tokio::select! {
        r = serve(public, Service::Public, ctx.clone()) => r,
        r = serve(agent, Service::Agent, ctx) => r,
        _ = shutdown => {
            info!("server shutting down");
            Ok(())
        }
    }
}

/// 接受循环：不断 accept 新连接，并为每个连接 spawn 一个异步任务
pub async fn serve(listener: TcpListener, service: Service, ctx: ServerContext) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, service = service.name(), "accepted connection");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service, ctx).await {
                warn!(%peer, error = %err, "connection error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, service: Service, ctx: ServerContext) -> Result<()> {
    let peer = stream.peer_addr()?;
    let tracker = ctx.monitor.client_tracker.clone();
    let id = tracker.add_client(peer, service.name());
    ctx.monitor.metrics.client_connected();

    let result = connection_loop(stream, service, &ctx, id).await;

    tracker.remove_client(id);
    ctx.monitor.metrics.client_disconnected();
    debug!(%peer, "disconnected");
    result
}

async fn connection_loop(stream: TcpStream, service: Service, ctx: &ServerContext, id: u64) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match service {
            Service::Public => match serde_json::from_str::<PublicRequest>(line) {
                Ok(PublicRequest::StreamEvents) => {
                    ctx.monitor.client_tracker.update_op(id, "stream_events");
                    return stream_events(lines, writer, ctx).await;
                }
                Ok(PublicRequest::ListClients) => {
                    ctx.monitor.client_tracker.update_op(id, "list_clients");
                    let listing = ctx.monitor.client_tracker.list_clients();
                    let clients: Vec<&str> = listing.lines().collect();
                    Response::ok(&serde_json::json!({ "clients": clients }))
                }
                Ok(request) => {
                    ctx.monitor.client_tracker.update_op(id, request.op());
                    let daemon = ctx.daemon.clone();
                    tokio::task::spawn_blocking(move || handle_public(&daemon, request)).await?
                }
                Err(e) => Response::error(format!("invalid request: {e}")),
            },
            Service::Agent => match serde_json::from_str::<AgentRequest>(line) {
                Ok(request) => {
                    ctx.monitor.client_tracker.update_op(id, request.op());
                    let daemon = ctx.daemon.clone();
                    tokio::task::spawn_blocking(move || handle_agent(&daemon, request)).await?
                }
                Err(e) => Response::error(format!("invalid request: {e}")),
            },
        };
        writer.write_all(response.to_line().as_bytes()).await?;
    }
    Ok(())
}

/// 把阻塞的 `write_events_to` 桥接到连接上；客户端断开时中断读者
async fn stream_events<W>(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: W,
    ctx: &ServerContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // 新的流顶替旧的流；旧读者可能还没进入等待，持续中断直到拿到位置
    let _slot = loop {
        match ctx.stream_slot.try_lock() {
            Ok(slot) => break slot,
            Err(_) => {
                ctx.daemon.interrupt_write_events();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    };

    writer
        .write_all(Response::ok(&serde_json::json!({ "streaming": true })).to_line().as_bytes())
        .await?;

    let (tx, mut rx) = mpsc::channel::<Event>(STREAM_CHANNEL_CAPACITY);
    let daemon = ctx.daemon.clone();
    let reader = tokio::task::spawn_blocking(move || {
        daemon.write_events_to(&mut |event: &Event| tx.blocking_send(event.clone()).is_ok());
    });
    info!("event stream started");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let line = Response::ok(&event).to_line();
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                // 读者被中断（关闭或被新的流顶替）
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(_)) => continue,
                _ => break,
            },
        }
    }

    drop(rx);
    // 读者可能还没进入等待，反复中断直到它退出
    while !reader.is_finished() {
        ctx.daemon.interrupt_write_events();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    reader.await?;
    info!("event stream closed");
    Ok(())
}
