use std::sync::Arc;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use conductor_model_routing::{
    AnthropicProvider, CatalogConfig, DeepSeekProvider, GoogleProvider, ModelCatalogClient,
    OpenAiProvider, ProviderId, ProviderRegistry, RoutingError, RoutingPreset, TaskOverride,
    TaskRouter, TaskRoutingRequest, TaskType, WorkspaceRoutingConfig,
};

fn catalog_model(
    model_id: &str,
    provider: &str,
    input: f64,
    output: f64,
    tier: &str,
    suitable_for: &[&str],
) -> Value {
    json!({
        "modelId": model_id,
        "provider": provider,
        "supportsTools": true,
        "supportsVision": false,
        "supportsStreaming": true,
        "supportsEmbedding": suitable_for == ["embedding"],
        "contextWindow": 128000,
        "maxOutputTokens": 8192,
        "inputPricePer1M": input,
        "outputPricePer1M": output,
        "qualityTier": tier,
        "suitableFor": suitable_for,
        "available": true
    })
}

fn fixture_models() -> Vec<Value> {
    vec![
        catalog_model(
            "claude-sonnet-4-20250514",
            "anthropic",
            3.0,
            15.0,
            "standard",
            &["coding", "planning", "review"],
        ),
        catalog_model("gpt-4o", "openai", 2.5, 10.0, "standard", &["coding", "planning"]),
        catalog_model("deepseek-chat", "deepseek", 0.27, 1.1, "economy", &["coding", "simple_chat"]),
        catalog_model("gemini-2.0-pro", "google", 1.25, 5.0, "standard", &["coding", "planning"]),
        catalog_model(
            "gemini-2.0-flash",
            "google",
            0.1,
            0.4,
            "economy",
            &["simple_chat", "summarization"],
        ),
        catalog_model(
            "text-embedding-3-small",
            "openai",
            0.02,
            0.0,
            "economy",
            &["embedding"],
        ),
    ]
}

async fn mount_catalog(server: &MockServer) {
    let models = fixture_models();

    for task in ["coding", "planning", "review", "simple_chat", "summarization", "embedding"] {
        let suitable: Vec<Value> = models
            .iter()
            .filter(|m| {
                m["suitableFor"]
                    .as_array()
                    .is_some_and(|tasks| tasks.iter().any(|t| t == task))
            })
            .cloned()
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/api/model-registry/models/task/{task}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(suitable)))
            .mount(server)
            .await;
    }

    for model in &models {
        let id = model["modelId"].as_str().expect("model id");
        Mock::given(method("GET"))
            .and(path(format!("/api/model-registry/models/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(model))
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(models)))
        .mount(server)
        .await;

    // Default-rule candidates absent from the fixture catalog.
    for missing in [
        "claude-opus-4-20250514",
        "gpt-4o-mini",
        "claude-3-5-haiku-20241022",
        "deepseek-reasoner",
        "text-embedding-004",
        "text-embedding-3-large",
        "unknown-model",
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/api/model-registry/models/{missing}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }
}

async fn router_for(server: &MockServer) -> TaskRouter {
    let catalog = Arc::new(ModelCatalogClient::new(CatalogConfig {
        base_url: server.uri(),
        ..Default::default()
    }));
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(AnthropicProvider::new())).await;
    registry.register(Arc::new(OpenAiProvider::new())).await;
    registry.register(Arc::new(GoogleProvider::new())).await;
    registry.register(Arc::new(DeepSeekProvider::new())).await;
    TaskRouter::new(catalog, registry)
}

fn all_providers() -> Vec<ProviderId> {
    vec![
        ProviderId::Anthropic,
        ProviderId::Openai,
        ProviderId::Google,
        ProviderId::Deepseek,
    ]
}

#[tokio::test]
async fn coding_under_full_availability_selects_the_default_rule() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let decision = router.route_task(&request, &config).await.expect("decision");

    assert_eq!(decision.selected_model, "claude-sonnet-4-20250514");
    assert_eq!(decision.provider, ProviderId::Anthropic);
    // 1000 input at $3/M + 500 output at $15/M.
    assert!((decision.estimated_cost - 0.0105).abs() < 1e-9);
}

#[tokio::test]
async fn coding_without_anthropic_falls_back_to_openai() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let config = WorkspaceRoutingConfig::new(
        "w",
        vec![ProviderId::Openai, ProviderId::Google, ProviderId::Deepseek],
    );
    let decision = router.route_task(&request, &config).await.expect("decision");

    assert_eq!(decision.selected_model, "gpt-4o");
    assert_eq!(decision.provider, ProviderId::Openai);
    let sonnet = decision
        .alternatives
        .iter()
        .find(|alt| alt.model_id == "claude-sonnet-4-20250514")
        .expect("rejected sonnet recorded");
    assert!(sonnet.reason.contains("no BYOK key"));
}

#[tokio::test]
async fn empty_enabled_providers_fails_immediately() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let config = WorkspaceRoutingConfig::new("w", vec![]);
    let err = router.route_task(&request, &config).await.expect_err("error");
    assert!(matches!(err, RoutingError::NoProvidersEnabled { .. }));
}

#[tokio::test]
async fn forced_model_wins_with_capability_warning() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let mut request = TaskRoutingRequest::new(TaskType::Coding, "w");
    request.force_model = Some("gemini-2.0-flash".to_string());
    // The fixture flash model has no vision support; the forced stage only
    // warns about it.
    request.requires_vision = true;
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let decision = router.route_task(&request, &config).await.expect("decision");

    assert_eq!(decision.selected_model, "gemini-2.0-flash");
    assert!(decision.reason.contains("warning"));
}

#[tokio::test]
async fn forced_model_from_disabled_provider_is_recorded_and_skipped() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let mut request = TaskRoutingRequest::new(TaskType::Coding, "w");
    request.force_model = Some("claude-sonnet-4-20250514".to_string());
    let config = WorkspaceRoutingConfig::new("w", vec![ProviderId::Openai]);
    let decision = router.route_task(&request, &config).await.expect("decision");

    assert_eq!(decision.selected_model, "gpt-4o");
    assert!(decision
        .alternatives
        .iter()
        .any(|alt| alt.model_id == "claude-sonnet-4-20250514"));
}

#[tokio::test]
async fn forced_provider_picks_its_cheapest_suitable_model() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let mut request = TaskRoutingRequest::new(TaskType::Coding, "w");
    request.force_provider = Some(ProviderId::Google);
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let decision = router.route_task(&request, &config).await.expect("decision");

    assert_eq!(decision.selected_model, "gemini-2.0-pro");
    assert_eq!(decision.provider, ProviderId::Google);
}

#[tokio::test]
async fn workspace_override_beats_preset_and_rules() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let mut config = WorkspaceRoutingConfig::new("w", all_providers());
    config.task_overrides.insert(
        TaskType::Coding,
        TaskOverride {
            preferred_model: Some("deepseek-chat".to_string()),
            fallback_model: None,
        },
    );
    let decision = router.route_task(&request, &config).await.expect("decision");
    assert_eq!(decision.selected_model, "deepseek-chat");
    assert!(decision.reason.contains("override"));
}

#[tokio::test]
async fn economy_preset_selects_the_cheapest_candidate() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let mut config = WorkspaceRoutingConfig::new("w", all_providers());
    config.preset = RoutingPreset::Economy;
    let decision = router.route_task(&request, &config).await.expect("decision");
    assert_eq!(decision.selected_model, "deepseek-chat");
}

#[tokio::test]
async fn quality_preset_selects_the_highest_tier() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let mut config = WorkspaceRoutingConfig::new("w", all_providers());
    config.preset = RoutingPreset::Quality;
    let decision = router.route_task(&request, &config).await.expect("decision");
    // Standard beats economy; sonnet is the most expensive standard model.
    assert_eq!(decision.selected_model, "claude-sonnet-4-20250514");
}

#[tokio::test]
async fn routing_is_deterministic_for_fixed_inputs() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let first = router.route_task(&request, &config).await.expect("first");
    for _ in 0..5 {
        let again = router.route_task(&request, &config).await.expect("again");
        assert_eq!(again.selected_model, first.selected_model);
        assert_eq!(again.provider, first.provider);
    }
}

#[tokio::test]
async fn impossible_requirements_exhaust_with_attempts() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let mut request = TaskRoutingRequest::new(TaskType::Coding, "w");
    // Nothing in the fixture catalog supports vision.
    request.requires_vision = true;
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let err = router.route_task(&request, &config).await.expect_err("exhausted");
    match err {
        RoutingError::Exhausted {
            task_type,
            attempted_models,
            ..
        } => {
            assert_eq!(task_type, TaskType::Coding);
            assert!(attempted_models.contains(&"gpt-4o".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn embedding_tasks_route_to_embedding_models() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let request = TaskRoutingRequest::new(TaskType::Embedding, "w");
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let decision = router.route_task(&request, &config).await.expect("decision");
    assert_eq!(decision.selected_model, "text-embedding-3-small");
}

#[tokio::test]
async fn estimate_cost_returns_sentinel_for_unknown_pricing() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let cost = router.estimate_cost("claude-sonnet-4-20250514", 1_000, 500).await;
    assert!((cost - 0.0105).abs() < 1e-9);

    let missing = router.estimate_cost("unknown-model", 1_000, 500).await;
    assert_eq!(missing, -1.0);
}

#[tokio::test]
async fn model_availability_requires_registry_and_workspace_enablement() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let catalog = Arc::new(ModelCatalogClient::new(CatalogConfig {
        base_url: server.uri(),
        ..Default::default()
    }));
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(AnthropicProvider::new())).await;
    registry.register(Arc::new(OpenAiProvider::new())).await;
    let router = TaskRouter::new(catalog, registry.clone());

    let config = WorkspaceRoutingConfig::new("w", vec![ProviderId::Anthropic, ProviderId::Openai]);
    assert!(router
        .is_model_available("claude-sonnet-4-20250514", &config)
        .await
        .expect("check"));

    registry.disable(ProviderId::Anthropic).await;
    assert!(!router
        .is_model_available("claude-sonnet-4-20250514", &config)
        .await
        .expect("check"));

    assert!(!router
        .is_model_available("unknown-model", &config)
        .await
        .expect("check"));
}

#[tokio::test]
async fn available_models_group_by_task_type() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let grouped = router.get_available_models(&config).await.expect("grouped");
    let coding = grouped.get(&TaskType::Coding).expect("coding group");
    assert!(coding.iter().any(|m| m.model_id == "gpt-4o"));
    let embedding = grouped.get(&TaskType::Embedding).expect("embedding group");
    assert_eq!(embedding.len(), 1);
}

#[tokio::test]
async fn routing_rules_hot_swap() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let router = router_for(&server).await;

    let mut rules = router.get_routing_rules().await;
    rules
        .get_mut(&TaskType::Coding)
        .expect("coding rule")
        .default_model = "deepseek-chat".to_string();
    router.set_routing_rules(rules).await;

    let request = TaskRoutingRequest::new(TaskType::Coding, "w");
    let config = WorkspaceRoutingConfig::new("w", all_providers());
    let decision = router.route_task(&request, &config).await.expect("decision");
    assert_eq!(decision.selected_model, "deepseek-chat");
}
