use anyhow::{bail, Context, Result};
use dedupe_lib::matching::manager::RunMode;
use dedupe_lib::pipeline::{run_pipeline, PipelineInputs, PipelineOutput};
use dedupe_lib::rules::{ClassificationRules, CompiledRules};
use dedupe_lib::utils::db_connect::{connect, get_pool_status};
use dedupe_lib::utils::engine_config::EngineConfig;
use dedupe_lib::utils::env::load_env;
use dedupe_lib::utils::get_memory_usage;
use dedupe_lib::utils::jsonl::{read_jsonl, read_jsonl_if_present};
use dedupe_lib::utils::pipeline_state::{MemoryStateStore, PgStateStore, RunStateStore};
use dedupe_lib::utils::progress_bars::progress_config::ProgressConfig;
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

fn path_from_env(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

async fn run_with_store<S: RunStateStore>(
    store: &mut S,
    config: &EngineConfig,
    rules: &CompiledRules,
    mode: RunMode,
    run_id: &str,
    inputs: PipelineInputs,
    progress_config: &ProgressConfig,
) -> Result<PipelineOutput> {
    let multi_progress = progress_config.create_multi_progress();
    run_pipeline(config, rules, store, mode, run_id, inputs, progress_config, multi_progress).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging and environment
    env_logger::init();
    info!("Starting union linkage pipeline");
    load_env();

    let config = EngineConfig::from_env();
    config.validate().context("Invalid engine configuration")?;
    config.log_config();

    let rules = ClassificationRules::load_from_env()
        .context("Failed to load classification rules")?
        .compile()
        .context("Failed to compile classification rules")?;

    let progress_config = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress_config.enabled, progress_config.detailed
    );

    let raw_mode = env::var("LINKAGE_RUN_MODE").unwrap_or_else(|_| "fresh".to_string());
    let mode = match RunMode::parse(&raw_mode) {
        Some(mode) => mode,
        None => bail!("LINKAGE_RUN_MODE must be 'fresh' or 'resume', got '{}'", raw_mode),
    };

    let mentions_path = path_from_env("LINKAGE_MENTIONS_PATH", "data/mentions.jsonl");
    let hierarchy_path = path_from_env("LINKAGE_HIERARCHY_PATH", "data/hierarchy_nodes.jsonl");
    let output_dir = path_from_env("LINKAGE_OUTPUT_DIR", "output");

    let load_start = Instant::now();
    let inputs = PipelineInputs {
        mentions: read_jsonl(&mentions_path)
            .with_context(|| format!("Failed to load mentions from {}", mentions_path.display()))?,
        hierarchy: read_jsonl_if_present(&hierarchy_path)
            .with_context(|| format!("Failed to load hierarchy filings from {}", hierarchy_path.display()))?,
    };
    info!(
        "Loaded {} mentions and {} hierarchy filings in {:.2?}",
        inputs.mentions.len(),
        inputs.hierarchy.len(),
        load_start.elapsed()
    );

    let run_id = Uuid::new_v4().to_string();
    info!("Instantiating run {}", run_id);

    let backend = env::var("LINKAGE_STATE_BACKEND").unwrap_or_else(|_| "memory".to_string());
    let output = match backend.trim().to_lowercase().as_str() {
        "postgres" => {
            let pool = connect().await.context("Failed to connect to database")?;
            info!("Successfully connected to the database");
            let mut store = PgStateStore::new(pool.clone())
                .await
                .context("Failed to prepare run state schema")?;
            let output = run_with_store(&mut store, &config, &rules, mode, &run_id, inputs, &progress_config).await?;
            if progress_config.should_show_db_connection_stats() {
                let (connections, idle) = get_pool_status(&pool);
                info!("DB pool: {} connections, {} idle", connections, idle);
            }
            output
        }
        "memory" => {
            if mode == RunMode::Resume {
                warn!("⚠️  In-memory run state does not survive restarts; resume behaves like a fresh run");
            }
            let mut store = MemoryStateStore::new();
            run_with_store(&mut store, &config, &rules, mode, &run_id, inputs, &progress_config).await?
        }
        other => bail!("LINKAGE_STATE_BACKEND must be 'memory' or 'postgres', got '{}'", other),
    };

    output
        .write_tables(&output_dir)
        .with_context(|| format!("Failed to write outputs to {}", output_dir.display()))?;

    if progress_config.should_show_memory() {
        info!("Memory at exit: {} MB", get_memory_usage().await);
    }
    info!(
        "Run {} finished: {} canonical entities, {} counted workers, {} counted members, fingerprint {}",
        run_id,
        output.summary.canonical_entities,
        output.summary.employer_counted_total,
        output.summary.membership_counted_total,
        output.fingerprint()
    );
    Ok(())
}
