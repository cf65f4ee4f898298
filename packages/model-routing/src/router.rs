use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::catalog::{CatalogError, ModelCatalogClient, ModelFilters};
use crate::registry::ProviderRegistry;
use crate::types::{
    Model, QualityTier, RoutingAlternative, RoutingDecision, RoutingPreset, RoutingRule,
    TaskRoutingRequest, TaskType, WorkspaceRoutingConfig,
};

const DEFAULT_INPUT_TOKENS: u64 = 1_000;
const DEFAULT_OUTPUT_TOKENS: u64 = 500;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("workspace {workspace_id} has no enabled providers")]
    NoProvidersEnabled { workspace_id: String },
    #[error("no eligible model for task {task_type} (attempted: {})", attempted_models.join(", "))]
    Exhausted {
        task_type: TaskType,
        request: Box<TaskRoutingRequest>,
        attempted_models: Vec<String>,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl From<RoutingError> for conductor_error::ConductorError {
    fn from(err: RoutingError) -> Self {
        Self::RoutingFailure {
            message: err.to_string(),
        }
    }
}

/// Normative per-task candidate lists.
pub fn default_rules() -> HashMap<TaskType, RoutingRule> {
    let economy_chat = RoutingRule {
        default_model: "gemini-2.0-flash".to_string(),
        fallback_models: vec![
            "gpt-4o-mini".to_string(),
            "claude-3-5-haiku-20241022".to_string(),
            "deepseek-chat".to_string(),
        ],
        quality_tier_preference: QualityTier::Economy,
    };
    let planning = RoutingRule {
        default_model: "claude-sonnet-4-20250514".to_string(),
        fallback_models: vec!["gpt-4o".to_string(), "gemini-2.0-pro".to_string()],
        quality_tier_preference: QualityTier::Standard,
    };

    HashMap::from([
        (TaskType::SimpleChat, economy_chat.clone()),
        (TaskType::Summarization, economy_chat),
        (
            TaskType::Coding,
            RoutingRule {
                default_model: "claude-sonnet-4-20250514".to_string(),
                fallback_models: vec![
                    "gpt-4o".to_string(),
                    "deepseek-chat".to_string(),
                    "gemini-2.0-pro".to_string(),
                ],
                quality_tier_preference: QualityTier::Standard,
            },
        ),
        (TaskType::Planning, planning.clone()),
        (TaskType::Review, planning),
        (
            TaskType::ComplexReasoning,
            RoutingRule {
                default_model: "claude-opus-4-20250514".to_string(),
                fallback_models: vec![
                    "claude-sonnet-4-20250514".to_string(),
                    "gpt-4o".to_string(),
                    "deepseek-reasoner".to_string(),
                ],
                quality_tier_preference: QualityTier::Premium,
            },
        ),
        (
            TaskType::Embedding,
            RoutingRule {
                default_model: "text-embedding-3-small".to_string(),
                fallback_models: vec![
                    "text-embedding-004".to_string(),
                    "text-embedding-3-large".to_string(),
                ],
                quality_tier_preference: QualityTier::Economy,
            },
        ),
    ])
}

/// Rejection bookkeeping across the selection stages. Insertion order is
/// preserved so the error and alternatives read in attempt order.
struct Attempts {
    alternatives: Vec<RoutingAlternative>,
    seen: HashSet<String>,
    order: Vec<String>,
}

impl Attempts {
    fn new() -> Self {
        Self {
            alternatives: Vec::new(),
            seen: HashSet::new(),
            order: Vec::new(),
        }
    }

    fn contains(&self, model_id: &str) -> bool {
        self.seen.contains(model_id)
    }

    fn reject(
        &mut self,
        model_id: &str,
        provider: Option<crate::types::ProviderId>,
        estimated_cost: f64,
        reason: impl Into<String>,
    ) {
        if self.seen.insert(model_id.to_string()) {
            self.order.push(model_id.to_string());
        }
        self.alternatives.push(RoutingAlternative {
            model_id: model_id.to_string(),
            provider,
            estimated_cost,
            reason: reason.into(),
        });
    }
}

/// Multi-stage model selection over the catalog and the enabled-provider
/// set. Deterministic for fixed catalog contents, rules, and config.
pub struct TaskRouter {
    catalog: Arc<ModelCatalogClient>,
    registry: Arc<ProviderRegistry>,
    rules: RwLock<HashMap<TaskType, RoutingRule>>,
}

impl TaskRouter {
    pub fn new(catalog: Arc<ModelCatalogClient>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            catalog,
            registry,
            rules: RwLock::new(default_rules()),
        }
    }

    pub async fn route_task(
        &self,
        request: &TaskRoutingRequest,
        config: &WorkspaceRoutingConfig,
    ) -> Result<RoutingDecision, RoutingError> {
        if config.enabled_providers.is_empty() {
            return Err(RoutingError::NoProvidersEnabled {
                workspace_id: config.workspace_id.clone(),
            });
        }

        let mut attempts = Attempts::new();

        // Stage 1: forced model. Capability mismatches warn instead of
        // rejecting; the caller explicitly asked for this model.
        if let Some(force_model) = &request.force_model {
            match self.catalog.get_model(force_model).await? {
                None => attempts.reject(force_model, None, -1.0, "forced model not in catalog"),
                Some(model) => {
                    if !config.enabled_providers.contains(&model.provider) {
                        attempts.reject(
                            force_model,
                            Some(model.provider),
                            estimate_for(&model, request),
                            format!(
                                "provider {} not enabled (no BYOK key configured)",
                                model.provider
                            ),
                        );
                    } else {
                        let mut reason = format!("forced model {force_model}");
                        if let Err(warning) = validate_capabilities(&model, request) {
                            reason.push_str(&format!(" (warning: {warning})"));
                        }
                        if !model.available {
                            reason.push_str(" (warning: model marked unavailable)");
                        }
                        return Ok(decision(&model, reason, request, attempts.alternatives));
                    }
                }
            }
        }

        let suitable = self.catalog.models_by_task(request.task_type).await?;

        // Stage 2: forced provider, cheapest suitable model first.
        if let Some(force_provider) = request.force_provider {
            if config.enabled_providers.contains(&force_provider) {
                let mut candidates: Vec<&Model> = suitable
                    .iter()
                    .filter(|model| model.provider == force_provider && model.available)
                    .collect();
                sort_by_price_ascending(&mut candidates);
                for model in candidates {
                    if attempts.contains(&model.model_id) {
                        continue;
                    }
                    match validate_capabilities(model, request) {
                        Ok(()) => {
                            return Ok(decision(
                                model,
                                format!("forced provider {force_provider}"),
                                request,
                                attempts.alternatives,
                            ));
                        }
                        Err(reason) => attempts.reject(
                            &model.model_id,
                            Some(model.provider),
                            estimate_for(model, request),
                            reason,
                        ),
                    }
                }
            } else {
                tracing::warn!(
                    provider = %force_provider,
                    workspace_id = config.workspace_id,
                    "forced provider not enabled, continuing selection"
                );
            }
        }

        // Stage 3: workspace task overrides.
        if let Some(task_override) = config.task_overrides.get(&request.task_type) {
            let candidates = [
                ("preferred", task_override.preferred_model.as_ref()),
                ("fallback", task_override.fallback_model.as_ref()),
            ];
            for (label, candidate) in candidates {
                let Some(model_id) = candidate else { continue };
                if attempts.contains(model_id) {
                    continue;
                }
                if let Some(model) = self
                    .check_model(model_id, request, config, &mut attempts)
                    .await?
                {
                    return Ok(decision(
                        &model,
                        format!("workspace override ({label})"),
                        request,
                        attempts.alternatives,
                    ));
                }
            }
        }

        // Stage 4: price/tier presets. `auto` and `balanced` fall through.
        if matches!(config.preset, RoutingPreset::Economy | RoutingPreset::Quality) {
            let mut candidates: Vec<&Model> = suitable
                .iter()
                .filter(|model| {
                    model.available && config.enabled_providers.contains(&model.provider)
                })
                .collect();
            match config.preset {
                RoutingPreset::Economy => sort_by_price_ascending(&mut candidates),
                RoutingPreset::Quality => sort_by_tier_descending(&mut candidates),
                _ => unreachable!(),
            }
            for model in candidates {
                if attempts.contains(&model.model_id) {
                    continue;
                }
                match validate_capabilities(model, request) {
                    Ok(()) => {
                        return Ok(decision(
                            model,
                            format!("{:?} preset", config.preset).to_lowercase(),
                            request,
                            attempts.alternatives,
                        ));
                    }
                    Err(reason) => attempts.reject(
                        &model.model_id,
                        Some(model.provider),
                        estimate_for(model, request),
                        reason,
                    ),
                }
            }
        }

        // Stage 5: static default rules.
        let rule = self.rules.read().await.get(&request.task_type).cloned();
        if let Some(rule) = rule {
            let mut candidates = vec![rule.default_model.clone()];
            candidates.extend(rule.fallback_models.iter().cloned());
            for model_id in candidates {
                if attempts.contains(&model_id) {
                    continue;
                }
                if let Some(model) = self
                    .check_model(&model_id, request, config, &mut attempts)
                    .await?
                {
                    return Ok(decision(
                        &model,
                        format!("default rule for {}", request.task_type),
                        request,
                        attempts.alternatives,
                    ));
                }
            }
        }

        // Stage 6: whatever suitable catalog models remain, cheapest first.
        let mut remaining: Vec<&Model> = suitable
            .iter()
            .filter(|model| {
                model.available
                    && config.enabled_providers.contains(&model.provider)
                    && !attempts.contains(&model.model_id)
            })
            .collect();
        sort_by_price_ascending(&mut remaining);
        for model in remaining {
            match validate_capabilities(model, request) {
                Ok(()) => {
                    return Ok(decision(
                        model,
                        "registry fallback".to_string(),
                        request,
                        attempts.alternatives,
                    ));
                }
                Err(reason) => attempts.reject(
                    &model.model_id,
                    Some(model.provider),
                    estimate_for(model, request),
                    reason,
                ),
            }
        }

        Err(RoutingError::Exhausted {
            task_type: request.task_type,
            request: Box::new(request.clone()),
            attempted_models: attempts.order,
        })
    }

    /// Generic single-model check used by overrides and default rules.
    /// Returns the model when it passed; records the rejection otherwise.
    async fn check_model(
        &self,
        model_id: &str,
        request: &TaskRoutingRequest,
        config: &WorkspaceRoutingConfig,
        attempts: &mut Attempts,
    ) -> Result<Option<Model>, RoutingError> {
        let Some(model) = self.catalog.get_model(model_id).await? else {
            attempts.reject(model_id, None, -1.0, "not in catalog");
            return Ok(None);
        };
        if !model.available {
            attempts.reject(
                model_id,
                Some(model.provider),
                estimate_for(&model, request),
                "model unavailable",
            );
            return Ok(None);
        }
        if !config.enabled_providers.contains(&model.provider) {
            attempts.reject(
                model_id,
                Some(model.provider),
                estimate_for(&model, request),
                format!(
                    "provider {} not enabled (no BYOK key configured)",
                    model.provider
                ),
            );
            return Ok(None);
        }
        if let Err(reason) = validate_capabilities(&model, request) {
            attempts.reject(
                model_id,
                Some(model.provider),
                estimate_for(&model, request),
                reason,
            );
            return Ok(None);
        }
        Ok(Some(model))
    }

    /// `(input·in + output·out) / 1e6`; `-1.0` signals a failed pricing
    /// lookup, distinct from a legitimate zero.
    pub async fn estimate_cost(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.catalog.get_model(model_id).await {
            Ok(Some(model)) => {
                (input_tokens as f64 * model.input_price_per_1m
                    + output_tokens as f64 * model.output_price_per_1m)
                    / 1e6
            }
            Ok(None) => -1.0,
            Err(err) => {
                tracing::warn!(model_id, error = %err, "pricing lookup failed");
                -1.0
            }
        }
    }

    pub async fn is_model_available(
        &self,
        model_id: &str,
        config: &WorkspaceRoutingConfig,
    ) -> Result<bool, RoutingError> {
        Ok(match self.catalog.get_model(model_id).await? {
            Some(model) => {
                model.available
                    && self.registry.is_enabled(model.provider).await
                    && config.enabled_providers.contains(&model.provider)
            }
            None => false,
        })
    }

    /// Catalog models a workspace can actually reach, grouped by task type.
    pub async fn get_available_models(
        &self,
        config: &WorkspaceRoutingConfig,
    ) -> Result<HashMap<TaskType, Vec<Model>>, RoutingError> {
        let filters = ModelFilters {
            available: Some(true),
            ..Default::default()
        };
        let models = self.catalog.list_models(&filters).await?;

        let mut grouped: HashMap<TaskType, Vec<Model>> = HashMap::new();
        for model in models {
            if !model.available || !config.enabled_providers.contains(&model.provider) {
                continue;
            }
            if !self.registry.is_enabled(model.provider).await {
                continue;
            }
            for task_type in &model.suitable_for {
                grouped.entry(*task_type).or_default().push(model.clone());
            }
        }
        Ok(grouped)
    }

    pub async fn set_routing_rules(&self, rules: HashMap<TaskType, RoutingRule>) {
        *self.rules.write().await = rules;
    }

    pub async fn get_routing_rules(&self) -> HashMap<TaskType, RoutingRule> {
        self.rules.read().await.clone()
    }
}

fn decision(
    model: &Model,
    reason: String,
    request: &TaskRoutingRequest,
    alternatives: Vec<RoutingAlternative>,
) -> RoutingDecision {
    RoutingDecision {
        selected_model: model.model_id.clone(),
        provider: model.provider,
        reason,
        estimated_cost: estimate_for(model, request),
        alternatives,
    }
}

fn estimate_for(model: &Model, request: &TaskRoutingRequest) -> f64 {
    let input = request.estimated_input_tokens.unwrap_or(DEFAULT_INPUT_TOKENS);
    let output = request
        .estimated_output_tokens
        .unwrap_or(DEFAULT_OUTPUT_TOKENS);
    (input as f64 * model.input_price_per_1m + output as f64 * model.output_price_per_1m) / 1e6
}

fn validate_capabilities(model: &Model, request: &TaskRoutingRequest) -> Result<(), String> {
    if request.requires_tools && !model.supports_tools {
        return Err("tool support required".to_string());
    }
    if request.requires_vision && !model.supports_vision {
        return Err("vision support required".to_string());
    }
    if request.requires_streaming && !model.supports_streaming {
        return Err("streaming support required".to_string());
    }
    if let Some(required) = request.context_size_tokens {
        if model.context_window < required {
            return Err(format!(
                "context window {} below required {}",
                model.context_window, required
            ));
        }
    }
    if request.task_type != TaskType::Embedding && model.is_embedding_only() {
        return Err("embedding-only model".to_string());
    }
    if request.task_type == TaskType::Embedding && !model.supports_embedding {
        return Err("embedding support required".to_string());
    }
    Ok(())
}

fn sort_by_price_ascending(models: &mut [&Model]) {
    models.sort_by(|a, b| {
        a.input_price_per_1m
            .total_cmp(&b.input_price_per_1m)
            .then_with(|| a.model_id.cmp(&b.model_id))
    });
}

fn sort_by_tier_descending(models: &mut [&Model]) {
    models.sort_by(|a, b| {
        b.quality_tier
            .priority()
            .cmp(&a.quality_tier.priority())
            .then(b.input_price_per_1m.total_cmp(&a.input_price_per_1m))
            .then_with(|| a.model_id.cmp(&b.model_id))
    });
}
