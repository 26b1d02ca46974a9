/// Unit tests for the taskplane server.
/// These tests don't require a network listener or a live agent.

#[cfg(test)]
mod config_tests {
    use taskplane_server::config::Config;

    #[test]
    fn test_agent_token_parsing() {
        let tokens = Config::parse_agent_tokens("agent-1=tok1, agent-2=tok2,broken,=x,y=");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["agent-1"], "tok1");
        assert_eq!(tokens["agent-2"], "tok2");
    }

    #[test]
    fn test_cors_origins_parsing() {
        let mut config = test_support::test_config();
        config.cors_origin = "http://localhost:3000,https://ops.example.com".into();
        let origins = config.cors_origins();
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "http://localhost:3000");
        assert_eq!(origins[1], "https://ops.example.com");
    }

    #[test]
    fn test_intake_capacity_derivation() {
        let mut config = test_support::test_config();
        config.subscriber_buffer = 16;
        config.hub_intake_capacity = 0;
        assert_eq!(config.intake_capacity(), 16_000);

        config.hub_intake_capacity = 128;
        assert_eq!(config.intake_capacity(), 128);
    }

    mod test_support {
        use std::collections::HashMap;
        use std::time::Duration;
        use taskplane_server::config::Config;

        pub fn test_config() -> Config {
            Config {
                port: 0,
                cors_origin: "*".into(),
                http_timeout: Duration::from_secs(30),
                agent_tokens: HashMap::new(),
                ping_interval: Duration::from_secs(3),
                offline_timeout: Duration::from_secs(6),
                default_task_timeout: Duration::from_secs(300),
                max_task_timeout: Duration::from_secs(3600),
                completed_task_ttl: Duration::from_secs(1800),
                task_cleanup_interval: Duration::from_secs(300),
                cleanup_grace: Duration::from_secs(5),
                streaming_cleanup_grace: Duration::from_secs(30),
                registry_stale_ttl: Duration::from_secs(86400),
                registry_cleanup_interval: Duration::from_secs(3600),
                subscriber_buffer: 16,
                room_buffer: 10,
                hub_intake_capacity: 0,
            }
        }
    }
}

#[cfg(test)]
mod protocol_tests {
    use taskplane_server::ws::protocol::{
        AgentMessage, ResponsePayload, ResponseStatus, ServerMessage, TaskPayload, TaskRequest,
    };

    #[test]
    fn test_ping_wire_format() {
        let msg = ServerMessage::Ping { ts: 1712345678901 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["ts"], 1712345678901i64);
    }

    #[test]
    fn test_task_request_wire_format() {
        let msg = ServerMessage::Task(TaskRequest {
            agent_id: "agent-1".into(),
            task_id: "t-1".into(),
            payload: TaskPayload::ShellExecute {
                cmd: "echo hi".into(),
                timeout_secs: Some(30),
            },
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["agent_id"], "agent-1");
        assert_eq!(json["payload"]["kind"], "shell_execute");
        assert_eq!(json["payload"]["cmd"], "echo hi");
    }

    #[test]
    fn test_pong_parses_from_agent_json() {
        let raw = r#"{"type":"pong","ts":200,"ping_ts":100}"#;
        match serde_json::from_str::<AgentMessage>(raw).unwrap() {
            AgentMessage::Pong { ts, ping_ts } => {
                assert_eq!(ts, 200);
                assert_eq!(ping_ts, 100);
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }

    #[test]
    fn test_task_response_parses_with_defaults() {
        // is_final / cancelled / payload are optional on the wire.
        let raw = r#"{
            "type": "task_response",
            "agent_id": "agent-1",
            "task_id": "t-1",
            "status": "IN_PROGRESS"
        }"#;
        match serde_json::from_str::<AgentMessage>(raw).unwrap() {
            AgentMessage::TaskResponse(resp) => {
                assert_eq!(resp.status, ResponseStatus::InProgress);
                assert!(!resp.is_final);
                assert!(!resp.cancelled);
                assert!(resp.payload.is_none());
            }
            other => panic!("expected task response, got {:?}", other),
        }
    }

    #[test]
    fn test_shell_output_roundtrip() {
        let raw = r#"{
            "type": "task_response",
            "agent_id": "agent-1",
            "task_id": "t-1",
            "status": "COMPLETED",
            "is_final": true,
            "payload": {"kind": "shell_output", "stdout": "hi\n", "exit_code": 0}
        }"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();
        let AgentMessage::TaskResponse(resp) = msg else {
            panic!("expected task response");
        };
        match resp.payload.unwrap() {
            ResponsePayload::ShellOutput {
                stdout,
                stderr,
                exit_code,
            } => {
                assert_eq!(stdout, "hi\n");
                assert_eq!(stderr, "");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("expected shell output, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_payload_detection() {
        let watch = TaskPayload::MetricsRequest {
            watch: true,
            interval_secs: Some(1),
        };
        let oneshot = TaskPayload::MetricsRequest {
            watch: false,
            interval_secs: None,
        };
        let shell = TaskPayload::ShellExecute {
            cmd: "ls".into(),
            timeout_secs: None,
        };
        assert!(watch.is_streaming());
        assert!(!oneshot.is_streaming());
        assert!(!shell.is_streaming());
    }
}
