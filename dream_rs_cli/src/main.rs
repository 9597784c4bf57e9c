use std::path::PathBuf;

use clap::Parser;
use cliclack::{confirm, input, intro, log, outro, select};
use dream_rs_core::{
    render_model_table, CacheConfig, CheckpointLoader, DevicePreference, ModelAttributes,
    ModelCache, ModelPrecision, ModelRegistry, DEFAULT_MAX_LOADED_MODELS,
};
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Model registry to read, and to write on commit.
    #[arg(short, long, default_value = "configs/models.yaml")]
    config: PathBuf,

    /// Maximum number of models kept in memory at once, on the device or the host.
    #[arg(long, default_value_t = DEFAULT_MAX_LOADED_MODELS)]
    max_loaded_models: usize,

    /// Precision the weights are cast to.
    #[arg(long, value_enum, default_value_t = ModelPrecision::Auto)]
    precision: ModelPrecision,

    #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
    device: DevicePreference,

    /// Model to activate at startup. If not specified, the default model of the registry is used.
    #[arg(short, long)]
    model: Option<String>,

    /// Do not show progress bars.
    #[arg(long)]
    silent: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Action {
    List,
    Switch,
    Edit,
    Delete,
    SetDefault,
    Stats,
    Commit,
    Quit,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CacheConfig::default()
        .with_max_loaded_models(args.max_loaded_models)
        .with_precision(args.precision)
        .with_device(args.device)
        .silent(args.silent);
    let registry = ModelRegistry::load(&args.config)?;
    let loader =
        CheckpointLoader::from_preferences(config.device, config.precision, config.silent)?;
    let mut cache = ModelCache::new(registry, Box::new(loader), config)?;

    let initial = args
        .model
        .clone()
        .or_else(|| cache.default_model().map(String::from));
    if let Some(name) = initial {
        if cache.acquire(&name).is_none() {
            warn!("no model is active, pick one with \"Switch model\"");
        }
    }

    intro("dream_rs model manager")?;
    let mut dirty = false;
    loop {
        let action = select("What do you want to do?")
            .item(Action::List, "List models", "")
            .item(Action::Switch, "Switch model", "")
            .item(Action::Edit, "Add or edit a model", "")
            .item(Action::Delete, "Delete a model", "")
            .item(Action::SetDefault, "Set the default model", "must be loaded")
            .item(Action::Stats, "Show cache statistics", "")
            .item(Action::Commit, "Commit changes", args.config.display().to_string())
            .item(Action::Quit, "Quit", "")
            .interact()?;

        match action {
            Action::List => {
                log::info(render_model_table(&cache.list_models()))?;
            }
            Action::Switch => {
                let Some(name) = pick_model(&cache, "Model to activate:", |_| true)? else {
                    continue;
                };
                match cache.try_acquire(&name) {
                    Ok(model) => log::success(format!(
                        "`{}` is active ({}x{}, sha256 {})",
                        model.name, model.width, model.height, model.hash
                    ))?,
                    Err(e) => log::error(e.to_string())?,
                }
            }
            Action::Edit => {
                let name: String = input("Model name:")
                    .validate(|input: &String| {
                        if input.is_empty() || input.contains(char::is_whitespace) {
                            Err("A name without spaces is required!")
                        } else {
                            Ok(())
                        }
                    })
                    .interact()?;
                let clobber = cache.is_valid_model(&name);
                if clobber
                    && !confirm(format!("`{name}` exists. Replace its definition?"))
                        .initial_value(false)
                        .interact()?
                {
                    continue;
                }
                let existing = cache
                    .registry()
                    .get(&name)
                    .map(ModelAttributes::from)
                    .unwrap_or_default();
                let attributes = prompt_attributes(existing)?;
                match cache.add_model(&name, attributes, clobber) {
                    Ok(()) => {
                        dirty = true;
                        log::success(format!("`{name}` saved. Commit to keep the change."))?;
                    }
                    Err(e) => log::error(e.to_string())?,
                }
            }
            Action::Delete => {
                let Some(name) = pick_model(&cache, "Model to delete:", |_| true)? else {
                    continue;
                };
                if confirm(format!("Delete `{name}`?"))
                    .initial_value(false)
                    .interact()?
                {
                    match cache.del_model(&name) {
                        Ok(_) => {
                            dirty = true;
                            log::success(format!("`{name}` deleted"))?;
                        }
                        Err(e) => log::error(e.to_string())?,
                    }
                }
            }
            Action::SetDefault => {
                let Some(name) =
                    pick_model(&cache, "New default model:", |name| cache.contains(name))?
                else {
                    continue;
                };
                match cache.set_default_model(&name) {
                    Ok(()) => {
                        dirty = true;
                        log::success(format!("`{name}` is the default model"))?;
                    }
                    Err(e) => log::error(e.to_string())?,
                }
            }
            Action::Stats => {
                let report = serde_json::json!({
                    "active": cache.current_name(),
                    "resident": cache.resident_names().collect::<Vec<_>>(),
                    "stats": cache.stats(),
                    "memory": cache.memory_usage(),
                });
                log::info(serde_json::to_string_pretty(&report)?)?;
                log::remark(cache.memory_usage().to_string())?;
            }
            Action::Commit => match cache.commit(&args.config) {
                Ok(()) => {
                    dirty = false;
                    log::success(format!("wrote `{}`", args.config.display()))?;
                }
                Err(e) => log::error(e.to_string())?,
            },
            Action::Quit => {
                if dirty
                    && confirm("Commit changes before quitting?")
                        .initial_value(true)
                        .interact()?
                {
                    cache.commit(&args.config)?;
                }
                break;
            }
        }
    }
    outro("Bye!")?;
    Ok(())
}

/// Let the user pick a registered model. Returns `None` if nothing matches `filter`.
fn pick_model(
    cache: &ModelCache,
    prompt: &str,
    filter: impl Fn(&str) -> bool,
) -> anyhow::Result<Option<String>> {
    let listing = cache.list_models();
    let candidates: Vec<_> = listing
        .iter()
        .filter(|(name, _)| filter(name.as_str()))
        .collect();
    if candidates.is_empty() {
        log::warning("No matching models.")?;
        return Ok(None);
    }
    let mut menu = select(prompt);
    for (name, entry) in candidates {
        menu = menu.item(name.clone(), name, entry.status.to_string());
    }
    Ok(Some(menu.interact()?))
}

fn prompt_attributes(existing: ModelAttributes) -> anyhow::Result<ModelAttributes> {
    let description: String = input("Description:")
        .default_input(existing.description.as_deref().unwrap_or_default())
        .interact()?;
    let weights: String = input("Weights file:")
        .default_input(&path_default(&existing.weights))
        .validate(|input: &String| {
            if input.is_empty() {
                Err("A weights file is required!")
            } else {
                Ok(())
            }
        })
        .interact()?;
    let config: String = input("Model config file:")
        .default_input(&path_default(&existing.config))
        .validate(|input: &String| {
            if input.is_empty() {
                Err("A config file is required!")
            } else {
                Ok(())
            }
        })
        .interact()?;
    let vae: String = input("VAE file (optional):")
        .default_input(&path_default(&existing.vae))
        .required(false)
        .interact()?;
    let width: u32 = input("Width:")
        .default_input(&existing.width.unwrap_or(512).to_string())
        .validate(nonzero)
        .interact()?;
    let height: u32 = input("Height:")
        .default_input(&existing.height.unwrap_or(512).to_string())
        .validate(nonzero)
        .interact()?;
    let default = confirm("Make this the default model?")
        .initial_value(existing.default.unwrap_or(false))
        .interact()?;

    Ok(ModelAttributes {
        description: Some(description),
        weights: Some(weights.into()),
        config: Some(config.into()),
        width: Some(width),
        height: Some(height),
        vae: (!vae.is_empty()).then(|| vae.into()),
        default: Some(default),
    })
}

fn path_default(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn nonzero(input: &String) -> Result<(), String> {
    if input.parse::<u32>().map_err(|e| e.to_string())? == 0 {
        Err("Nonzero value is required!".to_string())
    } else {
        Ok(())
    }
}
