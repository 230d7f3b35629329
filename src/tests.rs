use std::sync::{Arc, Mutex};

use arrow_array::{ArrayRef, Float32Array, RecordBatch, StringArray};
use arrow_ipc::writer::FileWriter;
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use clap::Parser;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::agents::team::*;
use crate::agents::*;
use crate::cli::*;
use crate::config::*;
use crate::console::*;
use crate::error::*;
use crate::mock::*;
use crate::provider::*;
use crate::retrieval::*;
use crate::server::*;
use crate::telemetry::*;

    use tempfile::tempdir;

    fn base_cfg() -> RuntimeConfig {
        RuntimeConfig {
            profile: "default".to_string(),
            config_path: ".standards/config.toml".to_string(),
            default_model: DEFAULT_MODEL_ID.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_api_key: None,
            knowledge_backend: KnowledgeBackend::Lance,
            lance_url: None,
            lance_api_key: None,
            lance_region: "us-east-1".to_string(),
            safety_table: "safety_standards".to_string(),
            quality_table: "quality_standards".to_string(),
            safety_corpus_path: "data/pdfs".to_string(),
            quality_corpus_path: "data/Quality PDF".to_string(),
            retrieval_max_chunks: 5,
            retrieval_max_chars: 6000,
            request_timeout_secs: 30,
            telemetry_enabled: false,
            telemetry_path: ".standards/test-telemetry.jsonl".to_string(),
            show_sensitive_config: false,
        }
    }

    fn test_cli(config_path: &str, profile: &str) -> Cli {
        Cli {
            profile: profile.to_string(),
            config_path: config_path.to_string(),
            model: None,
            embedding_model: None,
            openai_base_url: None,
            knowledge_backend: None,
            lance_url: None,
            lance_region: None,
            safety_table: None,
            quality_table: None,
            safety_corpus_path: None,
            quality_corpus_path: None,
            retrieval_max_chunks: None,
            retrieval_max_chars: None,
            request_timeout_secs: None,
            telemetry_enabled: None,
            telemetry_path: None,
            show_sensitive_config: false,
            log_filter: "warn".to_string(),
            command: Commands::Doctor,
        }
    }

    type Responder = dyn Fn(&GenerationRequest) -> String + Send + Sync;

    /// Answers from a closure and records every request it receives.
    struct ScriptedModel {
        responder: Box<Responder>,
        calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedModel {
        fn new(responder: impl Fn(&GenerationRequest) -> String + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<GenerationRequest> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        async fn generate(&self, request: GenerationRequest) -> anyhow::Result<String> {
            let text = (self.responder)(&request);
            self.calls.lock().expect("calls lock").push(request);
            Ok(text)
        }
    }

    struct RecordingKnowledge {
        queries: Mutex<Vec<String>>,
    }

    impl RecordingKnowledge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                queries: Mutex::new(Vec::new()),
            })
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("queries lock").clone()
        }
    }

    #[async_trait]
    impl KnowledgeSource for RecordingKnowledge {
        fn backend_name(&self) -> &'static str {
            "recording"
        }

        async fn query(&self, text: &str, _limit: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
            self.queries.lock().expect("queries lock").push(text.to_string());
            Ok(vec![RetrievedChunk {
                source: "standards.md#1".to_string(),
                text: "Relevant clause from the standards.".to_string(),
                score: 1.0,
            }])
        }
    }

    fn member_answer(request: &GenerationRequest) -> Option<String> {
        if request.system.starts_with(AgentKey::Safety.role()) {
            Some("Safety answer".to_string())
        } else if request.system.starts_with(AgentKey::Quality.role()) {
            Some("Quality answer".to_string())
        } else {
            None
        }
    }

    /// Members answer by domain; coordinator calls get `coordinator_text`.
    fn scripted_team(coordinator_text: &'static str) -> Arc<ScriptedModel> {
        ScriptedModel::new(move |request| {
            member_answer(request).unwrap_or_else(|| coordinator_text.to_string())
        })
    }

    struct Fixture {
        model: Arc<ScriptedModel>,
        safety: Arc<RecordingKnowledge>,
        quality: Arc<RecordingKnowledge>,
        agents: StandardsAgents,
    }

    fn fixture(model: Arc<ScriptedModel>) -> Fixture {
        let safety = RecordingKnowledge::new();
        let quality = RecordingKnowledge::new();
        let agents = StandardsAgents::assemble(
            safety.clone(),
            quality.clone(),
            model.clone(),
            DEFAULT_MODEL_ID,
            RetrievalPolicy {
                max_chunks: 5,
                max_chars: 6000,
            },
        );
        Fixture {
            model,
            safety,
            quality,
            agents,
        }
    }

    fn api_router(registry: AgentRegistry) -> axum::Router {
        build_api_router(Arc::new(ApiState {
            cfg: base_cfg(),
            registry: Arc::new(registry),
            telemetry: TelemetrySink::disabled(),
        }))
    }

    async fn send(router: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = router.oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let value = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn every_team_mode_has_a_complete_instruction_bundle() {
        for mode in TeamMode::ALL {
            let bundle = instruction_bundle(mode);
            assert_eq!(bundle.mode, mode);
            assert!(!bundle.description.trim().is_empty());
            assert_eq!(bundle.instructions.len(), 6);
            assert!(bundle.instructions.iter().all(|line| !line.trim().is_empty()));
            assert!(
                bundle
                    .instructions
                    .iter()
                    .any(|line| line.contains("only answer questions related to safety and quality"))
            );
        }
        assert_eq!(TeamMode::default(), TeamMode::Collaborate);
    }

    #[test]
    fn team_mode_parsing_is_exact_and_fails_closed() {
        assert_eq!("route".parse::<TeamMode>().expect("route parses"), TeamMode::Route);
        assert_eq!(
            resolve_mode("coordinate").expect("coordinate resolves").mode,
            TeamMode::Coordinate
        );

        for bad in ["bogus", "Route", " route", ""] {
            let err = bad.parse::<TeamMode>().expect_err("mode should be rejected");
            assert!(matches!(err, StandardsError::UnknownMode { .. }));
        }

        let message = resolve_mode("bogus").expect_err("bogus rejected").to_string();
        assert_eq!(
            message,
            "Invalid team mode: bogus. Must be one of: collaborate, route, coordinate"
        );
    }

    #[tokio::test]
    async fn unknown_team_mode_invokes_no_agent() {
        let fx = fixture(scripted_team("unused"));
        let err = fx
            .agents
            .team
            .run("Is this a safety question?", Some("bogus"), None)
            .await
            .expect_err("unknown mode should fail");

        assert!(matches!(err, StandardsError::UnknownMode { ref mode } if mode == "bogus"));
        assert!(fx.model.calls().is_empty());
        assert!(fx.safety.queries().is_empty());
        assert!(fx.quality.queries().is_empty());
    }

    #[tokio::test]
    async fn collaborate_consults_every_member_and_synthesizes() {
        let fx = fixture(scripted_team("Synthesized answer"));
        let run = fx
            .agents
            .team
            .run("What are fire exit rules?", Some("collaborate"), Some("gpt-4o"))
            .await
            .expect("collaborate should succeed");

        assert_eq!(run.mode, TeamMode::Collaborate);
        assert_eq!(run.response, "Synthesized answer");
        assert_eq!(run.consulted, vec![AgentKey::Safety, AgentKey::Quality]);
        assert_eq!(fx.safety.queries(), vec!["What are fire exit rules?".to_string()]);
        assert_eq!(fx.quality.queries(), vec!["What are fire exit rules?".to_string()]);

        let calls = fx.model.calls();
        assert_eq!(calls.len(), 3);
        let synthesis = calls
            .iter()
            .find(|call| member_answer(call).is_none())
            .expect("synthesis call recorded");
        assert_eq!(synthesis.model_id, "gpt-4o");
        assert!(synthesis.system.contains("collaborative team"));
        assert!(synthesis.prompt.contains("### Safety Standards Agent\nSafety answer"));
        assert!(synthesis.prompt.contains("### Quality Standards Agent\nQuality answer"));
        assert!(
            calls
                .iter()
                .filter(|call| member_answer(call).is_some())
                .all(|call| call.model_id == DEFAULT_MODEL_ID)
        );
    }

    #[tokio::test]
    async fn missing_mode_defaults_to_collaborate() {
        let fx = fixture(scripted_team("Synthesized answer"));
        let run = fx
            .agents
            .team
            .run("Hygiene and PPE?", None, None)
            .await
            .expect("default mode should succeed");
        assert_eq!(run.mode, TeamMode::Collaborate);
        assert_eq!(run.consulted.len(), 2);
    }

    #[tokio::test]
    async fn route_invokes_exactly_one_member() {
        let fx = fixture(scripted_team(
            "```json\n{\"member\": \"quality\", \"reason\": \"hygiene is a quality topic\", \"reply\": \"\"}\n```",
        ));
        let run = fx
            .agents
            .team
            .run("How often must staff wash hands?", Some("route"), None)
            .await
            .expect("route should succeed");

        assert_eq!(run.mode, TeamMode::Route);
        assert_eq!(run.consulted, vec![AgentKey::Quality]);
        assert!(fx.safety.queries().is_empty());
        assert_eq!(fx.quality.queries().len(), 1);
        assert_eq!(
            run.response,
            "Routed to Quality Standards Agent: hygiene is a quality topic\n\nQuality answer"
        );
        assert_eq!(fx.model.calls().len(), 2);
    }

    #[tokio::test]
    async fn route_decline_returns_router_reply_without_members() {
        let fx = fixture(scripted_team(
            "{\"member\": \"none\", \"reason\": \"off topic\", \"reply\": \"I can only answer questions related to safety and quality standards.\"}",
        ));
        let run = fx
            .agents
            .team
            .run("Who won the football match?", Some("route"), None)
            .await
            .expect("decline should succeed");

        assert!(run.consulted.is_empty());
        assert!(run.response.starts_with("I can only answer"));
        assert!(fx.safety.queries().is_empty());
        assert!(fx.quality.queries().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_routing_fails_closed() {
        for decision in [
            "{\"member\": \"legal\", \"reason\": \"contracts\", \"reply\": \"\"}",
            "Probably the safety agent.",
            "{\"member\": \"none\", \"reason\": \"unsure\", \"reply\": \"\"}",
        ] {
            let fx = fixture(scripted_team(decision));
            let err = fx
                .agents
                .team
                .run("Safety or quality?", Some("route"), None)
                .await
                .expect_err("ambiguous decision should fail");
            assert!(matches!(err, StandardsError::Upstream(_)), "decision: {decision}");
            assert!(fx.safety.queries().is_empty());
            assert!(fx.quality.queries().is_empty());
        }
    }

    #[tokio::test]
    async fn coordinate_delegates_sub_tasks_and_synthesizes() {
        let model = ScriptedModel::new(|request| {
            if let Some(answer) = member_answer(request) {
                return answer;
            }
            if request.prompt.contains("Break the question") {
                return "{\"tasks\": [\
                    {\"member\": \"safety\", \"task\": \"Which PPE is needed?\"},\
                    {\"member\": \"Quality Standards Agent\", \"task\": \"How is hygiene audited?\"}\
                ], \"reply\": \"\"}"
                    .to_string();
            }
            "Coordinated answer".to_string()
        });
        let fx = fixture(model);
        let run = fx
            .agents
            .team
            .run("Plan a food plant inspection", Some("coordinate"), None)
            .await
            .expect("coordinate should succeed");

        assert_eq!(run.mode, TeamMode::Coordinate);
        assert_eq!(run.response, "Coordinated answer");
        assert_eq!(run.consulted, vec![AgentKey::Safety, AgentKey::Quality]);
        assert_eq!(fx.safety.queries(), vec!["Which PPE is needed?".to_string()]);
        assert_eq!(fx.quality.queries(), vec!["How is hygiene audited?".to_string()]);

        let synthesis = fx
            .model
            .calls()
            .into_iter()
            .find(|call| call.prompt.contains("Team member contributions"))
            .expect("synthesis call recorded");
        assert!(synthesis.prompt.contains("Sub-task: Which PPE is needed?"));
    }

    #[tokio::test]
    async fn coordinate_plan_with_unknown_member_runs_nothing() {
        let fx = fixture(scripted_team(
            "{\"tasks\": [{\"member\": \"safety\", \"task\": \"a\"}, {\"member\": \"finance\", \"task\": \"b\"}]}",
        ));
        let err = fx
            .agents
            .team
            .run("Mixed question", Some("coordinate"), None)
            .await
            .expect_err("unknown member should fail");

        assert!(err.to_string().contains("finance"));
        assert!(fx.safety.queries().is_empty());
        assert!(fx.quality.queries().is_empty());
    }

    #[tokio::test]
    async fn coordinate_empty_plan_returns_reply() {
        let fx = fixture(scripted_team(
            "{\"tasks\": [], \"reply\": \"That is outside safety and quality standards.\"}",
        ));
        let run = fx
            .agents
            .team
            .run("Best pizza topping?", Some("coordinate"), None)
            .await
            .expect("empty plan should succeed");
        assert!(run.consulted.is_empty());
        assert_eq!(run.response, "That is outside safety and quality standards.");
    }

    #[tokio::test]
    async fn reasoning_agent_threads_model_override_and_context() {
        let fx = fixture(scripted_team("unused"));
        let answer = fx
            .agents
            .safety
            .run("What PPE is needed for welding?", Some(" gpt-4o-mini "))
            .await
            .expect("safety agent should answer");

        assert_eq!(answer, "Safety answer");
        let calls = fx.model.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model_id, "gpt-4o-mini");
        assert!(calls[0].prompt.starts_with("Retrieved context from the standards documents:"));
        assert!(calls[0].prompt.ends_with("Question:\nWhat PPE is needed for welding?"));
    }

    #[tokio::test]
    async fn reasoning_agent_rejects_bad_model_id_before_any_call() {
        let fx = fixture(scripted_team("unused"));
        let err = fx
            .agents
            .quality
            .run("Hygiene?", Some("o3 mini"))
            .await
            .expect_err("whitespace model id rejected");

        assert!(matches!(err, StandardsError::InvalidRequest(_)));
        assert!(fx.model.calls().is_empty());
        assert!(fx.quality.queries().is_empty());
    }

    #[tokio::test]
    async fn reasoning_agent_treats_empty_output_as_upstream_failure() {
        let fx = fixture(ScriptedModel::new(|_| "   ".to_string()));
        let err = fx
            .agents
            .safety
            .run("Anything", None)
            .await
            .expect_err("empty answer should fail");
        assert!(matches!(err, StandardsError::Upstream(_)));
    }

    #[tokio::test]
    async fn degraded_registry_answers_503_with_detail() {
        let router = api_router(AgentRegistry::unavailable(
            "configuration error: LanceDB cloud configuration is incomplete. Set LanceURL and LANCE_API_KEY.",
        ));

        let (status, body) = send(router.clone(), "POST", "/safety/ask", Some(json!({"query": "abc"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let detail = body["detail"].as_str().expect("detail should be a string");
        assert!(detail.starts_with("Safety Agent is not available"));
        assert!(detail.contains("LanceURL"));

        let (status, body) = send(
            router,
            "POST",
            "/team/ask",
            Some(json!({"query": "abc", "team_mode": "route"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap_or_default().starts_with("Team Agent"));
    }

    #[tokio::test]
    async fn health_and_config_report_degraded_state_idempotently() {
        let router = api_router(AgentRegistry::unavailable("OPENAI_API_KEY is not set"));

        let (status, first) = send(router.clone(), "GET", "/health", None).await;
        let (_, second) = send(router.clone(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(
            first,
            json!({"status": "healthy", "agents_status": "unavailable", "available_agents": []})
        );

        let (status, config) = send(router.clone(), "GET", "/config", None).await;
        let (_, config_again) = send(router.clone(), "GET", "/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config, config_again);
        assert_eq!(config["lance_url"], "Not set");
        assert_eq!(config["lance_api_key_set"], false);
        assert_eq!(config["openai_api_key_set"], false);
        assert_eq!(config["agents_available"], false);
        assert_eq!(config["knowledge_backend"], "lance");

        let (status, root) = send(router, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(root["app"], APP_TITLE);
        assert_eq!(root["endpoints"]["team"], "/team/ask");
    }

    #[tokio::test]
    async fn healthy_registry_lists_all_agents() {
        let fx = fixture(scripted_team("unused"));
        let router = api_router(AgentRegistry::available(fx.agents));
        let (_, health) = send(router, "GET", "/health", None).await;
        assert_eq!(health["agents_status"], "available");
        assert_eq!(health["available_agents"], json!(["safety", "quality", "team"]));
    }

    #[tokio::test]
    async fn team_endpoint_rejects_unknown_mode_with_400() {
        let fx = fixture(scripted_team("unused"));
        let model = fx.model.clone();
        let safety = fx.safety.clone();
        let quality = fx.quality.clone();
        let router = api_router(AgentRegistry::available(fx.agents));

        let (status, body) = send(
            router,
            "POST",
            "/team/ask",
            Some(json!({"query": "Is this a safety or quality question?", "team_mode": "bogus"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            "Invalid team mode: bogus. Must be one of: collaborate, route, coordinate"
        );
        assert!(model.calls().is_empty());
        assert!(safety.queries().is_empty());
        assert!(quality.queries().is_empty());
    }

    #[tokio::test]
    async fn team_endpoint_routes_to_one_domain() {
        let fx = fixture(scripted_team(
            "{\"member\": \"safety\", \"reason\": \"fire protection\", \"reply\": \"\"}",
        ));
        let safety = fx.safety.clone();
        let quality = fx.quality.clone();
        let router = api_router(AgentRegistry::available(fx.agents));

        let (status, body) = send(
            router,
            "POST",
            "/team/ask",
            Some(json!({"query": "Is this a safety or quality question?", "team_mode": "route"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(
            body["response"]
                .as_str()
                .unwrap_or_default()
                .starts_with("Routed to Safety Standards Agent")
        );
        assert_eq!(safety.queries().len(), 1);
        assert!(quality.queries().is_empty());
    }

    #[tokio::test]
    async fn team_endpoint_defaults_missing_mode_and_rejects_null() {
        let fx = fixture(scripted_team("Synthesized answer"));
        let model = fx.model.clone();
        let router = api_router(AgentRegistry::available(fx.agents));

        let (status, body) = send(
            router.clone(),
            "POST",
            "/team/ask",
            Some(json!({"query": "PPE and hygiene?", "model_id": "o3-mini"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"response": "Synthesized answer"}));

        let calls_before = model.calls().len();
        let (status, body) = send(
            router,
            "POST",
            "/team/ask",
            Some(json!({"query": "PPE and hygiene?", "team_mode": null})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            "Invalid team mode: null. Must be one of: collaborate, route, coordinate"
        );
        assert_eq!(model.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn blank_model_id_falls_back_to_default_model() {
        let fx = fixture(scripted_team("unused"));
        let model = fx.model.clone();
        let router = api_router(AgentRegistry::available(fx.agents));

        let (status, body) = send(
            router,
            "POST",
            "/safety/ask",
            Some(json!({"query": "abc", "model_id": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"response": "Safety answer"}));
        assert_eq!(model.calls()[0].model_id, DEFAULT_MODEL_ID);
    }

    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        fn backend_name(&self) -> &'static str {
            "stalled"
        }

        async fn generate(&self, _request: GenerationRequest) -> anyhow::Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn slow_model_calls_time_out_with_gateway_timeout() {
        let agents = StandardsAgents::assemble(
            RecordingKnowledge::new(),
            RecordingKnowledge::new(),
            Arc::new(StalledModel),
            DEFAULT_MODEL_ID,
            RetrievalPolicy {
                max_chunks: 5,
                max_chars: 6000,
            },
        );
        let mut cfg = base_cfg();
        cfg.request_timeout_secs = 1;
        let router = build_api_router(Arc::new(ApiState {
            cfg,
            registry: Arc::new(AgentRegistry::available(agents)),
            telemetry: TelemetrySink::disabled(),
        }));

        let (status, body) = send(
            router.clone(),
            "POST",
            "/safety/ask",
            Some(json!({"query": "Fire exits?"})),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["detail"], "request timed out after 1s");

        let (status, _) = send(
            router,
            "POST",
            "/team/ask",
            Some(json!({"query": "Fire exits?", "team_mode": "route"})),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_team_requests_keep_their_own_mode_and_model() {
        let route_description = instruction_bundle(TeamMode::Route).description;
        let model = ScriptedModel::new(move |request| {
            if let Some(answer) = member_answer(request) {
                return answer;
            }
            if request.system.starts_with(route_description) {
                format!(
                    "{{\"member\": \"safety\", \"reason\": \"{}\", \"reply\": \"\"}}",
                    request.model_id
                )
            } else {
                format!("collaborated with {}", request.model_id)
            }
        });
        let fx = fixture(model);
        let router = api_router(AgentRegistry::available(fx.agents));

        let requests = (0..40).map(|index| {
            let router = router.clone();
            tokio::spawn(async move {
                let mode = if index % 2 == 0 { "route" } else { "collaborate" };
                let model_id = format!("model-{index}");
                let (status, body) = send(
                    router,
                    "POST",
                    "/team/ask",
                    Some(json!({
                        "query": "Fire exits and hygiene?",
                        "team_mode": mode,
                        "model_id": &model_id
                    })),
                )
                .await;
                (mode, model_id, status, body)
            })
        });

        for handle in futures::future::join_all(requests).await {
            let (mode, model_id, status, body) = handle.expect("request task should finish");
            assert_eq!(status, StatusCode::OK);
            let expected = if mode == "route" {
                format!("Routed to Safety Standards Agent: {model_id}\n\nSafety answer")
            } else {
                format!("collaborated with {model_id}")
            };
            assert_eq!(body["response"], expected, "{mode} request with {model_id}");
        }
    }

    #[tokio::test]
    async fn domain_endpoints_answer_and_reject_empty_queries() {
        let fx = fixture(scripted_team("unused"));
        let router = api_router(AgentRegistry::available(fx.agents));

        let (status, body) = send(
            router.clone(),
            "POST",
            "/quality/ask",
            Some(json!({"query": "How is cross-contamination prevented?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"response": "Quality answer"}));

        let (status, body) = send(router, "POST", "/safety/ask", Some(json!({"query": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("query cannot be empty"));
    }

    #[test]
    fn standards_errors_map_to_http_statuses() {
        let cases = [
            (
                StandardsError::UnknownMode {
                    mode: "x".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                StandardsError::InvalidRequest("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                StandardsError::AgentUnavailable {
                    agent: "Safety Agent".to_string(),
                    reason: "missing key".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StandardsError::Upstream("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StandardsError::Configuration("missing".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (StandardsError::Timeout(120), StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(error_status(&err), status, "{err}");
        }
    }

    #[tokio::test]
    async fn mock_server_returns_canned_answers_and_validates_modes() {
        assert_eq!(
            mock_team_answer("q", None).expect("default mode"),
            "Team response (collaborate) to: q"
        );
        assert_eq!(
            mock_team_answer("q", Some("route")).expect("route mode"),
            "Team response (route) to: q"
        );

        let router = build_mock_router(Arc::new(MockState {
            telemetry: TelemetrySink::disabled(),
        }));
        let (status, body) = send(router.clone(), "POST", "/safety/ask", Some(json!({"query": "PPE?"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Safety response to: PPE?");

        let (status, body) = send(
            router.clone(),
            "POST",
            "/team/ask",
            Some(json!({"query": "q", "team_mode": "bogus"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("bogus"));

        let (status, body) = send(
            router.clone(),
            "POST",
            "/team/ask",
            Some(json!({"query": "q", "team_mode": null})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("null"));

        let (status, body) = send(router.clone(), "POST", "/team/ask", Some(json!({"query": "q"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Team response (collaborate) to: q");

        let (_, health) = send(router, "GET", "/health", None).await;
        assert_eq!(health["status"], "healthy");
    }

    #[test]
    fn build_agents_requires_credentials() {
        let cfg = base_cfg();
        let err = build_agents(&cfg).err().expect("missing OpenAI key should fail");
        assert!(matches!(err, StandardsError::Configuration(ref msg) if msg.contains("OPENAI_API_KEY")));

        let mut cfg = base_cfg();
        cfg.openai_api_key = Some("sk-test-key-value".to_string());
        cfg.lance_api_key = Some("lance-key".to_string());
        let err = build_agents(&cfg).err().expect("missing LanceURL should fail");
        assert_eq!(
            err.to_string(),
            "configuration error: LanceDB cloud configuration is incomplete. Set LanceURL and LANCE_API_KEY."
        );
    }

    #[test]
    fn registry_initialization_degrades_instead_of_failing() {
        let registry = AgentRegistry::initialize(&base_cfg());
        assert!(!registry.is_available());
        assert_eq!(registry.status_label(), "unavailable");
        assert!(registry.available_agents().is_empty());
        assert!(registry.unavailable_reason().is_some());
        assert!(matches!(
            registry.agent(AgentKey::Quality),
            Err(StandardsError::AgentUnavailable { .. })
        ));
        assert!(registry.team().is_err());
    }

    #[test]
    fn registry_initializes_with_local_corpora() {
        let dir = tempdir().expect("temp directory should create");
        let safety_dir = dir.path().join("safety");
        let quality_dir = dir.path().join("quality");
        std::fs::create_dir_all(&safety_dir).expect("safety dir");
        std::fs::create_dir_all(&quality_dir).expect("quality dir");
        std::fs::write(safety_dir.join("fire.txt"), "Keep fire exits clear.").expect("write");
        std::fs::write(quality_dir.join("hygiene.md"), "Wash hands before entry.").expect("write");

        let mut cfg = base_cfg();
        cfg.openai_api_key = Some("sk-test-key-value".to_string());
        cfg.knowledge_backend = KnowledgeBackend::Local;
        cfg.safety_corpus_path = safety_dir.to_string_lossy().to_string();
        cfg.quality_corpus_path = quality_dir.to_string_lossy().to_string();

        let registry = AgentRegistry::initialize(&cfg);
        assert!(registry.is_available());
        assert_eq!(registry.available_agents(), vec!["safety", "quality", "team"]);
        assert!(registry.team().is_ok());
        for key in AgentKey::ALL {
            let agent = registry.agent(key).expect("domain agent should be available");
            assert_eq!(agent.key(), key);
        }
    }

    #[tokio::test]
    async fn local_corpus_ranks_chunks_by_term_hits() {
        let dir = tempdir().expect("temp directory should create");
        std::fs::write(
            dir.path().join("safety.txt"),
            "Fire extinguishers must be inspected monthly.\n\n\
             Ladders need three points of contact.\n\n\
             Fire exits must stay clear of fire hazards.",
        )
        .expect("write corpus");
        std::fs::write(dir.path().join("scan.pdf"), "fire fire fire").expect("write pdf");

        let source = LocalCorpusKnowledgeSource::load(dir.path()).expect("corpus should load");
        assert_eq!(source.chunks.len(), 3);

        let hits = source.query("fire exits", 5).await.expect("query should run");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.starts_with("Fire exits"));
        assert_eq!(hits[0].score, 3.0);
        assert!(hits[0].source.ends_with("safety.txt#3"));

        let limited = source.query("fire exits", 1).await.expect("query should run");
        assert_eq!(limited.len(), 1);
        assert!(source.query("a an", 5).await.expect("query").is_empty());
    }

    #[test]
    fn lance_endpoint_expands_cloud_shorthand() {
        assert_eq!(
            lance_endpoint("db://standards-db", "us-east-1"),
            "https://standards-db.us-east-1.api.lancedb.com"
        );
        assert_eq!(
            lance_endpoint("http://localhost:8000/", "us-east-1"),
            "http://localhost:8000"
        );
    }

    fn arrow_file_bytes(batch: &RecordBatch) -> Vec<u8> {
        let mut writer = FileWriter::try_new(Vec::new(), &batch.schema()).expect("ipc writer");
        writer.write(batch).expect("write batch");
        writer.finish().expect("finish ipc file");
        writer.into_inner().expect("ipc bytes")
    }

    #[test]
    fn lance_reply_decodes_payload_column_from_arrow_ipc() {
        let schema = Schema::new(vec![
            Field::new("payload", DataType::Utf8, true),
            Field::new("_relevance_score", DataType::Float32, false),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![
                    Some("{\"name\": \"fire.pdf\", \"content\": \"Keep exits clear.\"}"),
                    None,
                ])) as ArrayRef,
                Arc::new(Float32Array::from(vec![0.5, 0.25])) as ArrayRef,
            ],
        )
        .expect("record batch");

        let chunks = decode_lance_ipc("safety_standards", &arrow_file_bytes(&batch))
            .expect("arrow reply should decode");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "safety_standards:fire.pdf");
        assert_eq!(chunks[0].text, "Keep exits clear.");
        assert_eq!(chunks[0].score, 0.5);
    }

    #[test]
    fn lance_reply_decodes_plain_columns_scored_by_distance() {
        let schema = Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("content", DataType::Utf8, false),
            Field::new("_distance", DataType::Float32, false),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![Some("ladder.pdf"), None, Some("blank.pdf")]))
                    as ArrayRef,
                Arc::new(StringArray::from(vec!["Inspect ladders.", "Hygiene zones.", "   "]))
                    as ArrayRef,
                Arc::new(Float32Array::from(vec![1.0, 3.0, 0.0])) as ArrayRef,
            ],
        )
        .expect("record batch");

        let chunks = decode_lance_ipc("quality_standards", &arrow_file_bytes(&batch))
            .expect("arrow reply should decode");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "quality_standards:ladder.pdf");
        assert_eq!(chunks[0].score, 0.5);
        assert_eq!(chunks[1].source, "quality_standards:row-2");
        assert_eq!(chunks[1].score, 0.25);
    }

    #[test]
    fn lance_reply_rejects_json_bodies() {
        let err = decode_lance_ipc("safety_standards", b"[{\"content\": \"x\"}]")
            .expect_err("json is not an arrow file");
        assert!(err.to_string().contains("safety_standards"));
    }

    #[test]
    fn render_context_bounds_retrieved_text() {
        assert_eq!(render_context("Question?", Vec::new(), 100), "Question?");

        let chunks = vec![
            RetrievedChunk {
                source: "a.md#1".to_string(),
                text: "0123456789abcdef".to_string(),
                score: 2.0,
            },
            RetrievedChunk {
                source: "b.md#1".to_string(),
                text: "never rendered".to_string(),
                score: 1.0,
            },
        ];
        let rendered = render_context("Question?", chunks, 10);
        assert!(rendered.contains("[1] a.md#1 (score=2.000)\n0123456789\n"));
        assert!(!rendered.contains("b.md#1"));
        assert!(rendered.ends_with("\nQuestion:\nQuestion?"));
    }

    #[test]
    fn json_object_is_extracted_from_fenced_output() {
        assert_eq!(
            extract_json_object("```json\n{\"member\": \"safety\"}\n```"),
            Some("{\"member\": \"safety\"}")
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} reversed {"), None);

        let decision = parse_route_decision("Sure: {\"member\": \"quality\"}").expect("decision");
        assert_eq!(decision.member, "quality");
        assert!(decision.reason.is_empty());
        assert!(parse_coordination_plan("[]").is_err());
    }

    #[test]
    fn model_id_override_is_validated() {
        assert_eq!(select_model_id(None, "o3-mini").expect("default"), "o3-mini");
        assert_eq!(select_model_id(Some("gpt-4o"), "o3-mini").expect("override"), "gpt-4o");
        assert_eq!(select_model_id(Some(""), "o3-mini").expect("blank"), "o3-mini");
        assert_eq!(select_model_id(Some("  "), "o3-mini").expect("blank"), "o3-mini");
        assert_eq!(select_model_id(Some(" gpt-4o "), "o3-mini").expect("trimmed"), "gpt-4o");
        assert!(select_model_id(Some("gpt 4o"), "o3-mini").is_err());
    }

    #[test]
    fn agent_keys_resolve_from_labels_and_names() {
        assert_eq!(AgentKey::from_label("safety"), Some(AgentKey::Safety));
        assert_eq!(AgentKey::from_label("Quality Standards Agent"), Some(AgentKey::Quality));
        assert_eq!(AgentKey::from_label(" QUALITY "), Some(AgentKey::Quality));
        assert_eq!(AgentKey::from_label("legal"), None);
    }

    #[test]
    fn profile_values_fill_gaps_left_by_cli() {
        let profiles = parse_profiles(
            r#"
[profiles.ops]
model = "gpt-4o-mini"
knowledge_backend = "local"
retrieval_max_chunks = 3
request_timeout_secs = 0
lance_url = "db://ops-standards"
"#,
        )
        .expect("profiles should parse");

        let mut cli = test_cli(".standards/config.toml", "ops");
        cli.model = Some("o1".to_string());
        let cfg = resolve_runtime_config_with_secrets(
            &cli,
            &profiles,
            SecretEnv {
                openai_api_key: Some("sk-test-key-value".to_string()),
                lance_api_key: None,
            },
        )
        .expect("config should resolve");

        assert_eq!(cfg.profile, "ops");
        assert_eq!(cfg.default_model, "o1");
        assert_eq!(cfg.knowledge_backend, KnowledgeBackend::Local);
        assert_eq!(cfg.retrieval_max_chunks, 3);
        assert_eq!(cfg.retrieval_max_chars, 6000);
        assert_eq!(cfg.request_timeout_secs, 1);
        assert_eq!(cfg.lance_url.as_deref(), Some("db://ops-standards"));
        assert_eq!(cfg.safety_table, "safety_standards");
        assert_eq!(cfg.embedding_model, DEFAULT_EMBEDDING_MODEL);
        assert!(cfg.openai_api_key.is_some());
        assert!(cfg.lance_api_key.is_none());
        assert!(cfg.telemetry_enabled);
    }

    #[test]
    fn default_profile_is_implicit_and_missing_profiles_are_reported() {
        let profiles = parse_profiles("[profiles.ops]\nmodel = \"o1\"\n").expect("profiles parse");

        let cfg = resolve_runtime_config_with_secrets(
            &test_cli("cfg.toml", "default"),
            &profiles,
            SecretEnv::default(),
        )
        .expect("implicit default profile");
        assert_eq!(cfg.default_model, DEFAULT_MODEL_ID);
        assert_eq!(cfg.knowledge_backend, KnowledgeBackend::Lance);

        let err = resolve_runtime_config_with_secrets(
            &test_cli("cfg.toml", "staging"),
            &profiles,
            SecretEnv::default(),
        )
        .expect_err("unknown profile should fail");
        assert!(err.to_string().contains("Available profiles: ops"));

        assert!(parse_profiles("[profiles.ops]\nprovider = \"gemini\"\n").is_err());
    }

    #[test]
    fn load_profiles_returns_empty_for_missing_file() {
        let dir = tempdir().expect("temp directory should create");
        let missing = dir.path().join("absent.toml");
        let profiles = load_profiles(&missing.to_string_lossy()).expect("missing file is fine");
        assert!(profiles.profiles.is_empty());
    }

    #[test]
    fn lance_url_display_is_redacted_by_default() {
        let mut cfg = base_cfg();
        assert_eq!(display_lance_url(&cfg), "<not set>");

        cfg.lance_url = Some("db://secret-db".to_string());
        let shown = display_lance_url(&cfg);
        assert!(shown.starts_with("db://[REDACTED]"));
        assert!(!shown.contains("secret-db"));

        cfg.show_sensitive_config = true;
        assert_eq!(display_lance_url(&cfg), "db://secret-db");
    }

    #[test]
    fn cli_errors_are_categorized_and_redacted() {
        let err = anyhow::Error::from(StandardsError::UnknownMode {
            mode: "bogus".to_string(),
        });
        assert_eq!(categorize_error(&err), ErrorCategory::Input);

        let err = anyhow::Error::from(StandardsError::Configuration(
            "LanceURL db://private-db rejected key sk-abcdefghijklmnop".to_string(),
        ));
        assert_eq!(categorize_error(&err), ErrorCategory::Configuration);
        let rendered = format_cli_error(&err, false);
        assert!(rendered.starts_with("[CONFIG] "));
        assert!(rendered.contains("db://[REDACTED]"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("private-db"));
        assert!(!rendered.contains("sk-abcdefghijklmnop"));
        assert!(format_cli_error(&err, true).contains("private-db"));

        let err = anyhow::anyhow!("OpenAI request failed with status 502");
        assert_eq!(categorize_error(&err), ErrorCategory::Upstream);
        assert_eq!(categorize_error(&anyhow::anyhow!("boom")), ErrorCategory::Internal);
    }

    #[test]
    fn console_menu_parsing() {
        assert_eq!(parse_menu_choice("1"), Some(ConsoleChoice::Agent(AgentKey::Safety)));
        assert_eq!(parse_menu_choice(" 2 "), Some(ConsoleChoice::Agent(AgentKey::Quality)));
        assert_eq!(parse_menu_choice("3"), Some(ConsoleChoice::Team));
        assert_eq!(parse_menu_choice("4"), Some(ConsoleChoice::Exit));
        assert_eq!(parse_menu_choice("5"), None);
        assert_eq!(parse_menu_choice(""), None);

        assert_eq!(parse_mode_choice("2"), TeamMode::Route);
        assert_eq!(parse_mode_choice("3"), TeamMode::Coordinate);
        assert_eq!(parse_mode_choice("1"), TeamMode::Collaborate);
        assert_eq!(parse_mode_choice(""), TeamMode::Collaborate);
        assert_eq!(parse_mode_choice("route"), TeamMode::Collaborate);
    }

    #[tokio::test]
    async fn console_client_gives_up_on_stalled_asks() {
        let app = axum::Router::new()
            .route(
                "/health",
                axum::routing::get(|| async {
                    axum::Json(json!({"status": "healthy", "agents_status": "available"}))
                }),
            )
            .route(
                "/safety/ask",
                axum::routing::post(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    axum::Json(json!({"response": "late"}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local address");
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = ApiClient::new(&format!("http://{addr}"), std::time::Duration::from_secs(1))
            .expect("client should build");
        assert!(client.health().await.expect("health should answer").is_healthy());

        let err = client
            .ask(AgentKey::Safety, "PPE?", "o3-mini")
            .await
            .expect_err("stalled ask should time out");
        assert!(err.to_string().contains("/safety/ask"));
    }

    #[test]
    fn cli_parses_ask_and_mode_commands() {
        let cli = Cli::try_parse_from([
            "standards-agents",
            "ask",
            "team",
            "--mode",
            "route",
            "Is",
            "this",
            "safety?",
        ])
        .expect("ask should parse");
        match &cli.command {
            Commands::Ask {
                target,
                mode,
                prompt,
                ..
            } => {
                assert_eq!(*target, AskTarget::Team);
                assert_eq!(mode.as_deref(), Some("route"));
                assert_eq!(prompt.join(" "), "Is this safety?");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(command_label(&cli.command), "ask.team");

        let cli = Cli::try_parse_from(["standards-agents", "modes", "show", "coordinate"])
            .expect("modes show should parse");
        assert_eq!(command_label(&cli.command), "modes.show");
        assert!(Cli::try_parse_from(["standards-agents", "modes", "show", "bogus"]).is_err());
    }

    #[test]
    fn telemetry_sink_appends_and_report_summarizes() {
        let dir = tempdir().expect("temp directory should create");
        let mut cfg = base_cfg();
        cfg.telemetry_enabled = true;
        cfg.telemetry_path = dir
            .path()
            .join("nested/events.jsonl")
            .to_string_lossy()
            .to_string();

        let sink = TelemetrySink::new(&cfg, "serve".to_string());
        sink.emit("api.ask.completed", json!({"agent": "safety", "mode": null}));
        sink.emit("api.ask.completed", json!({"agent": "team", "mode": "route"}));
        sink.emit("api.ask.failed", json!({"agent": "team", "mode": "bogus"}));

        let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry written");
        let mut lines = content.lines().map(str::to_string).collect::<Vec<String>>();
        lines.push("not json".to_string());

        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.total_lines, 4);
        assert_eq!(summary.parsed_events, 3);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 1);
        assert_eq!(summary.asks_completed, 2);
        assert_eq!(summary.asks_failed, 1);
        assert_eq!(summary.agent_counts.get("team"), Some(&2));
        assert_eq!(summary.mode_counts.get("route"), Some(&1));
        assert_eq!(summary.command_counts.get("serve"), Some(&3));
    }

    #[test]
    fn disabled_telemetry_writes_nothing() {
        let dir = tempdir().expect("temp directory should create");
        let mut cfg = base_cfg();
        cfg.telemetry_path = dir.path().join("events.jsonl").to_string_lossy().to_string();

        TelemetrySink::new(&cfg, "ask.safety".to_string()).emit("cli.ask.completed", json!({}));
        assert!(!std::path::Path::new(&cfg.telemetry_path).exists());
    }
