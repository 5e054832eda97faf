use smartchat::cache::{CacheScope, ClearTarget};
use smartchat::cli::{CacheAction, Cli, Commands, ConfigAction};
use smartchat::config::{duration_or, Config, ConfigValidator};
use smartchat::embedding::{EmbeddingProvider, FastEmbedProvider};
use smartchat::error::{Result, SmartChatError};
use smartchat::index::MemoryCorpus;
use smartchat::llm::StreamEvent;
use smartchat::pipeline::{QueryPipeline, QueryRequest, SearchRequest};
use smartchat::server::{HealthStatus, Server, ServerClient, SignalHandler};
use smartchat::types::{MutationKind, QueryResult, Scope};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    let config = load_config(cli.config.clone(), cli.profile.clone())?;

    match cli.command {
        Commands::Serve { socket, corpus } => {
            cmd_serve(config, socket, corpus)?;
        }
        Commands::Ask {
            question,
            stream,
            document,
            provider,
            json,
        } => {
            cmd_ask(&config, question, stream, document, provider, json)?;
        }
        Commands::Search {
            query,
            document,
            limit,
            json,
        } => {
            cmd_search(&config, query, document, limit, json)?;
        }
        Commands::Providers { refresh } => {
            cmd_providers(&config, refresh)?;
        }
        Commands::Cache { action } => {
            cmd_cache(&config, action)?;
        }
        Commands::Invalidate {
            document_id,
            deleted,
        } => {
            cmd_invalidate(&config, document_id, deleted)?;
        }
        Commands::Health => {
            cmd_health(&config)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose {
        "smartchat=debug"
    } else {
        "smartchat=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| SmartChatError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn client(config: &Config) -> Result<ServerClient> {
    Ok(ServerClient::new(expand_path(&config.server.socket_path)?))
}

fn cmd_serve(mut config: Config, socket: Option<PathBuf>, corpus: Option<PathBuf>) -> Result<()> {
    if let Some(socket) = socket {
        config.server.socket_path = socket;
    }
    if let Some(corpus) = corpus {
        config.corpus.path = Some(corpus);
    }

    let socket_path = expand_path(&config.server.socket_path)?;
    let corpus = match &config.corpus.path {
        Some(path) => {
            let path = expand_path(path)?;
            tracing::info!("Loading corpus from {:?}", path);
            MemoryCorpus::load(&path)?
        }
        None => {
            tracing::warn!("No corpus configured, starting with an empty corpus");
            MemoryCorpus::new()
        }
    };
    let corpus = Arc::new(corpus);

    let embedding: Arc<dyn EmbeddingProvider> = Arc::new(
        FastEmbedProvider::new(&config.embedding.model)
            .map_err(|e| SmartChatError::Config(format!("embedding: {}", e)))?,
    );

    let rt = runtime()?;
    rt.block_on(async {
        match corpus.embed_missing(embedding.as_ref()).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Embedded {} fragments", n),
            Err(e) => tracing::warn!("Corpus embedding failed, keyword search only: {}", e),
        }

        let pipeline = Arc::new(QueryPipeline::build(
            &config,
            corpus.clone(),
            embedding.clone(),
        )?);
        pipeline.orchestrator().refresh_health().await;

        let available = pipeline
            .orchestrator()
            .providers()
            .iter()
            .filter(|p| p.available)
            .count();
        println!("✓ SmartChat server starting");
        println!("  Socket: {}", socket_path.display());
        println!("  Fragments: {}", corpus.len().await);
        println!("  Providers available: {}", available);

        let mut signals = SignalHandler::new()?;
        let server = Server::new(
            socket_path,
            config.server.max_connections,
            pipeline,
            corpus,
            embedding,
        )
        .with_timeouts(
            duration_or(&config.server.request_timeout, Duration::from_secs(10)),
            duration_or(&config.server.shutdown_grace, Duration::from_secs(5)),
        );
        server
            .run(async move {
                let name = signals.wait().await;
                tracing::info!("Stopping on {}", name);
            })
            .await
    })
}

fn cmd_ask(
    config: &Config,
    question: String,
    stream: bool,
    document: Option<u64>,
    provider: Option<String>,
    json: bool,
) -> Result<()> {
    let mut request = QueryRequest::new(question);
    if let Some(id) = document {
        request = request.with_scope(Scope::Document(id));
    }
    if let Some(provider) = provider {
        request = request.with_provider(provider);
    }
    let client = client(config)?;

    let rt = runtime()?;
    rt.block_on(async {
        if !stream {
            let result = client.query(request).await?;
            return print_result(&result, json);
        }

        let terminal = client
            .query_stream(request, |event| {
                if json {
                    if let Ok(line) = serde_json::to_string(event) {
                        println!("{}", line);
                    }
                } else if let StreamEvent::Chunk { content } = event {
                    print!("{}", content);
                    std::io::stdout().flush().ok();
                }
            })
            .await?;

        if json {
            return Ok(());
        }
        println!();
        match terminal {
            StreamEvent::Final(result) => {
                print_citations(&result);
                Ok(())
            }
            StreamEvent::Error {
                message,
                correlation_id,
                ..
            } => Err(SmartChatError::Server(format!(
                "{} (correlation id {})",
                message, correlation_id
            ))),
            _ => Ok(()),
        }
    })
}

fn print_result(result: &QueryResult, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(result).map_err(|e| SmartChatError::Json {
            source: e,
            context: "Failed to serialize result".to_string(),
        })?;
        println!("{}", text);
        return Ok(());
    }

    println!("{}", result.answer_text);
    print_citations(result);
    Ok(())
}

fn print_citations(result: &QueryResult) {
    if !result.citations.is_empty() {
        println!("\nSources:");
        for citation in &result.citations {
            println!(
                "  {} document {} #{}: {}",
                citation.label, citation.document_id, citation.position, citation.snippet
            );
        }
    }
    println!(
        "\n{} via {} ({} of {} fragments, {}ms)",
        result.model_name,
        result.provider_used,
        result.fragments_used,
        result.fragments_found,
        result.latency_ms
    );
    if !result.flags.is_empty() {
        println!("Flags: {:?}", result.flags);
    }
}

fn cmd_search(
    config: &Config,
    query: String,
    document: Option<u64>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut request = SearchRequest::new(query);
    if let Some(id) = document {
        request = request.with_scope(Scope::Document(id));
    }
    if let Some(limit) = limit {
        request = request.with_limit(limit);
    }
    let client = client(config)?;
    let response = runtime()?.block_on(client.search(request))?;

    if json {
        let text = serde_json::to_string_pretty(&response).map_err(|e| SmartChatError::Json {
            source: e,
            context: "Failed to serialize search results".to_string(),
        })?;
        println!("{}", text);
        return Ok(());
    }

    if response.results.is_empty() {
        println!("No matching fragments");
    }
    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{:>2}. document {} #{} [{}]  hybrid {:.3}  vector {:.3}  keyword {:.3}",
            i + 1,
            hit.document_id,
            hit.position,
            hit.fragment_id,
            hit.hybrid_score,
            hit.vector_score,
            hit.keyword_score
        );
        println!("    {}", hit.text);
    }
    println!(
        "
{:?} fusion, alpha {:.2} ({}ms)",
        response.fusion.method, response.fusion.alpha, response.latency_ms
    );
    if !response.flags.is_empty() {
        println!("Flags: {:?}", response.flags);
    }
    if let Some(reason) = &response.degraded_reason {
        println!("Degraded: {}", reason);
    }
    Ok(())
}

fn cmd_providers(config: &Config, refresh: bool) -> Result<()> {
    let client = client(config)?;
    let providers = runtime()?.block_on(client.providers(refresh))?;

    println!("Providers");
    println!("=========");
    for provider in providers {
        let mark = if provider.available { "✓" } else { "✗" };
        print!("{} {} ({})", mark, provider.name, provider.model);
        match provider.reason {
            Some(reason) => println!(": {}", reason),
            None => println!(),
        }
    }
    Ok(())
}

fn cmd_cache(config: &Config, action: CacheAction) -> Result<()> {
    let client = client(config)?;
    let rt = runtime()?;

    match action {
        CacheAction::Stats => {
            let stats = rt.block_on(client.cache_stats())?;
            println!("Cache {}", if stats.enabled { "enabled" } else { "disabled" });
            println!("  Hits: {}  Misses: {}", stats.hits, stats.misses);
            println!(
                "  Writes: {}  Skipped: {}  Errors: {}",
                stats.writes, stats.skipped_writes, stats.errors
            );
            println!(
                "  Keys: {} retrieval, {} response, {} docmeta",
                stats.keys.retrieval, stats.keys.response, stats.keys.docmeta
            );
            println!(
                "  Invalidations: {} ({} retrieval, {} response, {} docmeta keys)",
                stats.invalidations,
                stats.retrieval_keys_invalidated,
                stats.response_keys_invalidated,
                stats.docmeta_keys_invalidated
            );
        }
        CacheAction::Clear {
            scope,
            document,
            pattern,
        } => {
            let target = match (scope, document, pattern) {
                (_, Some(id), _) => ClearTarget::Document(id),
                (_, _, Some(pattern)) => ClearTarget::Pattern(pattern),
                (Some(scope), _, _) => ClearTarget::Scope(parse_scope(&scope)?),
                (None, None, None) => ClearTarget::Scope(CacheScope::All),
            };
            let removed = rt.block_on(client.clear_cache(target))?;
            println!("✓ Removed {} cache entries", removed);
        }
    }
    Ok(())
}

fn parse_scope(scope: &str) -> Result<CacheScope> {
    serde_json::from_value(serde_json::Value::String(scope.to_string())).map_err(|e| {
        SmartChatError::InvalidConfigValue {
            path: "scope".to_string(),
            message: e.to_string(),
        }
    })
}

fn cmd_invalidate(config: &Config, document_id: u64, deleted: bool) -> Result<()> {
    let kind = if deleted {
        MutationKind::Deleted
    } else {
        MutationKind::Updated
    };
    let client = client(config)?;
    let report = runtime()?.block_on(client.document_mutation(document_id, kind, Vec::new()))?;

    println!("✓ Invalidated document {}", report.document_id);
    println!(
        "  Removed {} retrieval and {} response entries",
        report.retrieval_keys_deleted, report.response_keys_deleted
    );
    for error in &report.errors {
        println!("⚠ {}", error);
    }
    Ok(())
}

fn cmd_health(config: &Config) -> Result<()> {
    let client = client(config)?;
    let report = runtime()?.block_on(client.health())?;

    let status = match report.status {
        HealthStatus::Healthy => "✓ healthy",
        HealthStatus::Degraded => "⚠ degraded",
        HealthStatus::Unhealthy => "✗ unhealthy",
    };
    println!("SmartChat: {}", status);
    println!("  Fragments: {}", report.fragments);
    println!(
        "  Cache: {}",
        match (report.cache_enabled, report.cache_reachable) {
            (false, _) => "disabled",
            (true, true) => "reachable",
            (true, false) => "unreachable",
        }
    );
    for provider in report.providers {
        println!(
            "  Provider {}: {}",
            provider.name,
            if provider.available { "available" } else { "unavailable" }
        );
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, config: Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(&config)?;
            println!("{}", text);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            ConfigValidator::validate(&config)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Providers enabled: {}", config.enabled_providers().len());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SmartChatError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'smartchat config init' to create one."
        );
        let mut config = Config::default();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| SmartChatError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| SmartChatError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
