use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use conductor_model_routing::{
    CatalogConfig, CatalogError, ModelCatalogClient, ModelFilters, ProviderId, TaskType,
};

fn gpt4o() -> serde_json::Value {
    json!({
        "modelId": "gpt-4o",
        "provider": "openai",
        "supportsTools": true,
        "supportsVision": true,
        "supportsStreaming": true,
        "supportsEmbedding": false,
        "contextWindow": 128000,
        "maxOutputTokens": 16384,
        "inputPricePer1M": 2.5,
        "outputPricePer1M": 10.0,
        "qualityTier": "standard",
        "suitableFor": ["coding"],
        "available": true
    })
}

fn client_for(server: &MockServer, config: CatalogConfig) -> ModelCatalogClient {
    ModelCatalogClient::new(CatalogConfig {
        base_url: server.uri(),
        ..config
    })
}

#[tokio::test]
async fn list_results_are_cached_by_full_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([gpt4o()])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, CatalogConfig::default());
    let filters = ModelFilters::default();
    let first = client.list_models(&filters).await.expect("first");
    let second = client.list_models(&filters).await.expect("second");
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    // expect(1) verifies the second read came from cache.
}

#[tokio::test]
async fn different_filters_are_different_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .and(query_param("provider", "openai"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([gpt4o()])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, CatalogConfig::default());
    let filtered = client
        .list_models(&ModelFilters {
            provider: Some(ProviderId::Openai),
            ..Default::default()
        })
        .await
        .expect("filtered");
    let unfiltered = client
        .list_models(&ModelFilters::default())
        .await
        .expect("unfiltered");
    assert_eq!(filtered.len(), 1);
    assert!(unfiltered.is_empty());
}

#[tokio::test]
async fn expired_entries_are_refetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([gpt4o()])))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        CatalogConfig {
            cache_ttl: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let filters = ModelFilters::default();
    client.list_models(&filters).await.expect("first");
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.list_models(&filters).await.expect("after expiry");
}

#[tokio::test]
async fn missing_models_are_null_not_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server, CatalogConfig::default());
    let model = client.get_model("nope").await.expect("lookup");
    assert!(model.is_none());
}

#[tokio::test]
async fn other_failures_surface_with_status_and_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server, CatalogConfig::default());
    let err = client
        .list_models(&ModelFilters::default())
        .await
        .expect_err("server error");
    match err {
        CatalogError::Status { status, url } => {
            assert_eq!(status, 503);
            assert!(url.contains("/api/model-registry/models"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn bearer_token_is_attached_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models/task/coding"))
        .and(header("authorization", "Bearer catalog-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([gpt4o()])))
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        CatalogConfig {
            auth_token: Some("catalog-token".to_string()),
            ..Default::default()
        },
    );
    let models = client
        .models_by_task(TaskType::Coding)
        .await
        .expect("task listing");
    assert_eq!(models[0].model_id, "gpt-4o");
}

#[tokio::test]
async fn wrapped_payloads_decode_too() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/model-registry/models/provider/openai"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": [gpt4o()]})))
        .mount(&server)
        .await;

    let client = client_for(&server, CatalogConfig::default());
    let models = client
        .models_by_provider(ProviderId::Openai)
        .await
        .expect("provider listing");
    assert_eq!(models.len(), 1);
}
