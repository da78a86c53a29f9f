// src/service/public.rs

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Response;
use crate::command::{
    BeginSessionData, CommandRequest, CommandType, EndSessionData, StartupAgentConfig,
};
use crate::daemon::Daemon;
use crate::event::GetEventGroupsRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PublicRequest {
    /// 直接提交一条原始命令
    Execute { command: CommandRequest },
    BeginSession {
        device_id: i64,
        pid: i32,
        #[serde(default)]
        start_timestamp: Option<i64>,
    },
    EndSession {
        session_id: i64,
        #[serde(default)]
        end_timestamp: Option<i64>,
    },
    GetEventGroups(GetEventGroupsRequest),
    GetAgentStatus { pid: i32 },
    ConfigureStartupAgent(StartupAgentConfig),
    /// 当前连接列表，由传输层处理
    ListClients,
    /// 把连接切换为事件流，由传输层处理
    StreamEvents,
}

impl PublicRequest {
    pub fn op(&self) -> &'static str {
        match self {
            PublicRequest::Execute { .. } => "execute",
            PublicRequest::BeginSession { .. } => "begin_session",
            PublicRequest::EndSession { .. } => "end_session",
            PublicRequest::GetEventGroups(_) => "get_event_groups",
            PublicRequest::GetAgentStatus { .. } => "get_agent_status",
            PublicRequest::ConfigureStartupAgent(_) => "configure_startup_agent",
            PublicRequest::ListClients => "list_clients",
            PublicRequest::StreamEvents => "stream_events",
        }
    }
}

pub fn handle_public(daemon: &Daemon, request: PublicRequest) -> Response {
    match request {
        PublicRequest::Execute { command } => daemon.execute(&command).into(),
        PublicRequest::BeginSession { device_id, pid, start_timestamp } => {
            let command = CommandRequest::new(CommandType::BeginSession, pid)
                .with_stream(device_id)
                .with_payload(&BeginSessionData { start_timestamp });
            daemon.execute(&command).into()
        }
        PublicRequest::EndSession { session_id, end_timestamp } => {
            let command = CommandRequest::new(CommandType::EndSession, 0)
                .with_payload(&EndSessionData { session_id, end_timestamp });
            daemon.execute(&command).into()
        }
        PublicRequest::GetEventGroups(query) => {
            Response::ok(&json!({ "groups": daemon.get_event_groups(&query) }))
        }
        PublicRequest::GetAgentStatus { pid } => {
            Response::ok(&json!({ "pid": pid, "status": daemon.get_agent_status(pid) }))
        }
        PublicRequest::ConfigureStartupAgent(config) => {
            let command = CommandRequest::new(CommandType::ConfigureStartupAgent, 0).with_payload(&config);
            daemon.execute(&command).into()
        }
        other @ (PublicRequest::ListClients | PublicRequest::StreamEvents) => {
            Response::error(format!("{} is served by the connection layer", other.op()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::procfs::ProcFs;

    fn daemon() -> Daemon {
        Daemon::builder(Config { unified_pipeline: false, ..Config::default() })
            .procfs(ProcFs::with_root("/nonexistent-proc"))
            .build()
    }

    fn parse(line: &str) -> PublicRequest {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn test_session_round_trip() {
        let d = daemon();
        let resp = handle_public(
            &d,
            parse(r#"{"op":"begin_session","device_id":1,"pid":100,"start_timestamp":1000}"#),
        );
        assert!(resp.ok);
        let session_id = resp.result.as_ref().unwrap()["session_id"].as_i64().unwrap();

        let dup = handle_public(&d, parse(r#"{"op":"begin_session","device_id":1,"pid":100}"#));
        assert!(!dup.ok);
        assert!(dup.error.unwrap().contains("already active"));

        let line = format!(r#"{{"op":"end_session","session_id":{session_id},"end_timestamp":2000}}"#);
        let end = handle_public(&d, parse(&line));
        assert_eq!(end.result.unwrap()["ended"], json!(true));
        let again = handle_public(&d, parse(&line));
        assert_eq!(again.result.unwrap()["ended"], json!(false));

        let groups = handle_public(
            &d,
            parse(&format!(r#"{{"op":"get_event_groups","session_id":{session_id},"kind":"SESSION"}}"#)),
        );
        let groups = groups.result.unwrap();
        let events = groups["groups"][0]["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["ended"], json!(true));
    }

    #[test]
    fn test_configure_startup_agent() {
        let d = daemon();
        let resp = handle_public(
            &d,
            parse(
                r#"{"op":"configure_startup_agent","app_package_name":"com.example",
                    "agent_lib_file_name":"/data/libagent.so","agent_config_path":"/data/agent.config"}"#,
            ),
        );
        assert_eq!(
            resp.result.unwrap()["agent_args"],
            json!("-agentpath:/data/libagent.so=/data/agent.config")
        );
        assert!(d.inspect(|s| s.startup_agents.contains_key("com.example")));
    }

    #[test]
    fn test_agent_status_defaults_to_unspecified() {
        let d = daemon();
        let resp = handle_public(&d, parse(r#"{"op":"get_agent_status","pid":5}"#));
        assert_eq!(resp.result.unwrap()["status"], json!("UNSPECIFIED"));
    }
}
