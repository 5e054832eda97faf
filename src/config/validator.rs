use crate::config::{parse_duration, Config};
use crate::error::{Result, SmartChatError, ValidationError};
use std::collections::HashSet;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_server(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_rerank(config, &mut errors);
        Self::validate_context(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_cache(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SmartChatError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_server(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.server.socket_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "server.socket_path",
                "Socket path cannot be empty",
            ));
        }

        if config.server.max_connections == 0 {
            errors.push(ValidationError::new(
                "server.max_connections",
                "Max connections must be greater than 0",
            ));
        }

        if config.server.stream_buffer == 0 {
            errors.push(ValidationError::new(
                "server.stream_buffer",
                "Stream buffer must be greater than 0",
            ));
        }

        Self::check_duration("server.request_timeout", &config.server.request_timeout, errors);
        Self::check_duration("server.shutdown_grace", &config.server.shutdown_grace, errors);
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if retrieval.top_k_initial == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k_initial",
                "top_k_initial must be greater than 0",
            ));
        }

        if retrieval.final_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.final_k",
                "final_k must be greater than 0",
            ));
        } else if retrieval.final_k > retrieval.top_k_initial {
            errors.push(ValidationError::new(
                "retrieval.final_k",
                format!(
                    "final_k ({}) cannot exceed top_k_initial ({})",
                    retrieval.final_k, retrieval.top_k_initial
                ),
            ));
        }

        if !(0.0..=1.0).contains(&retrieval.alpha) {
            errors.push(ValidationError::new(
                "retrieval.alpha",
                format!("Alpha must be between 0.0 and 1.0, got {}", retrieval.alpha),
            ));
        }

        let methods = ["weighted", "rrf"];
        if !methods.contains(&retrieval.fusion_method.as_str()) {
            errors.push(ValidationError::new(
                "retrieval.fusion_method",
                format!(
                    "Fusion method must be one of {:?}, got '{}'",
                    methods, retrieval.fusion_method
                ),
            ));
        }

        if retrieval.rrf_k <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                "RRF k must be greater than 0",
            ));
        }

        if retrieval.min_fused_score < 0.0 {
            errors.push(ValidationError::new(
                "retrieval.min_fused_score",
                "Minimum fused score cannot be negative",
            ));
        }

        Self::check_duration("retrieval.source_timeout", &retrieval.source_timeout, errors);
    }

    fn validate_rerank(config: &Config, errors: &mut Vec<ValidationError>) {
        let scorers = ["cross_encoder", "term_overlap"];
        if !scorers.contains(&config.rerank.scorer.as_str()) {
            errors.push(ValidationError::new(
                "rerank.scorer",
                format!(
                    "Scorer must be one of {:?}, got '{}'",
                    scorers, config.rerank.scorer
                ),
            ));
        }

        if config.rerank.model.is_empty() {
            errors.push(ValidationError::new(
                "rerank.model",
                "Model name cannot be empty",
            ));
        }

        Self::check_duration("rerank.timeout", &config.rerank.timeout, errors);
    }

    fn validate_context(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.context.token_budget == 0 {
            errors.push(ValidationError::new(
                "context.token_budget",
                "Token budget must be greater than 0",
            ));
        }

        if config.context.history_budget >= config.context.token_budget {
            errors.push(ValidationError::new(
                "context.history_budget",
                "History budget must be smaller than the total token budget",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        Self::check_duration("embedding.timeout", &config.embedding.timeout, errors);
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        let llm = &config.llm;

        let temp = llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        if llm.max_tokens == 0 {
            errors.push(ValidationError::new(
                "llm.max_tokens",
                "Max tokens must be greater than 0",
            ));
        }

        Self::check_duration("llm.request_timeout", &llm.request_timeout, errors);

        if llm.providers.iter().all(|p| !p.enabled) {
            errors.push(ValidationError::new(
                "llm.providers",
                "At least one provider must be enabled",
            ));
        }

        let mut seen = HashSet::new();
        for (i, provider) in llm.providers.iter().enumerate() {
            if provider.name.is_empty() {
                errors.push(ValidationError::new(
                    format!("llm.providers[{}].name", i),
                    "Provider name cannot be empty",
                ));
            } else if !seen.insert(provider.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("llm.providers[{}].name", i),
                    format!("Duplicate provider name '{}'", provider.name),
                ));
            }

            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
            {
                errors.push(ValidationError::new(
                    format!("llm.providers[{}].base_url", i),
                    format!("Base URL must be http(s), got '{}'", provider.base_url),
                ));
            }

            if provider.model.is_empty() {
                errors.push(ValidationError::new(
                    format!("llm.providers[{}].model", i),
                    "Model name cannot be empty",
                ));
            }
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        let cache = &config.cache;
        Self::check_duration("cache.retrieval_ttl", &cache.retrieval_ttl, errors);
        Self::check_duration("cache.response_ttl", &cache.response_ttl, errors);
        Self::check_duration("cache.metadata_ttl", &cache.metadata_ttl, errors);
        Self::check_duration("cache.op_timeout", &cache.op_timeout, errors);

        if cache.max_entries == 0 {
            errors.push(ValidationError::new(
                "cache.max_entries",
                "Max entries must be greater than 0",
            ));
        }
    }

    fn check_duration(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
        match parse_duration(value) {
            Some(d) if !d.is_zero() => {}
            _ => errors.push(ValidationError::new(
                path,
                format!("Invalid duration format: {}", value),
            )),
        }
    }
}
