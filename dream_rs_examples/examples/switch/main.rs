use std::time::Instant;

use clap::Parser;
use dream_rs_core::{
    render_model_table, CacheConfig, CheckpointLoader, DevicePreference, ModelCache,
    ModelPrecision, ModelRegistry,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Model registry to use
    #[arg(short, long, default_value = "configs/models.yaml")]
    config: String,

    /// Models to activate, in order
    #[arg(required = true)]
    models: Vec<String>,

    /// Maximum number of resident models
    #[arg(long, default_value_t = 2)]
    max_loaded_models: usize,

    #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
    device: DevicePreference,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = ModelRegistry::load(&args.config)?;
    let loader = CheckpointLoader::from_preferences(args.device, ModelPrecision::Auto, false)?;
    let mut cache = ModelCache::new(
        registry,
        Box::new(loader),
        CacheConfig::default().with_max_loaded_models(args.max_loaded_models),
    )?;

    for name in &args.models {
        let start = Instant::now();
        let Some(model) = cache.acquire(name) else {
            println!("Could not activate {name}");
            continue;
        };
        println!(
            "Activated {} ({}x{}) in {:.2}s",
            model.name,
            model.width,
            model.height,
            start.elapsed().as_secs_f32()
        );
        println!("{}", cache.memory_usage());
    }

    print!("{}", render_model_table(&cache.list_models()));
    println!("{}", summarize_stats(&cache));

    Ok(())
}

fn summarize_stats(cache: &ModelCache) -> String {
    let stats = cache.stats();
    format!(
        "hits: {}, misses: {}, evictions: {}, offloads: {}, failures: {}",
        stats.total_hits,
        stats.total_misses,
        stats.total_evictions,
        stats.total_offloads,
        stats.load_failures
    )
}
