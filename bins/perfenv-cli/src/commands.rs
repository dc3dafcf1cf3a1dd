// CLI commands for running and configuring perfenv
use anyhow::{bail, Context, Result};
use perfenv_core::{build_engine, Backend, ConfigResolver, Configuration, EngineSettings, Evaluator};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use tracing::info;

/// Parse a `key=value` override; the value is JSON, falling back to a plain string
fn parse_override(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Override '{}' is not of the form KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Override '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Load the user configuration mapping from an optional file plus overrides
fn load_config(path: Option<&Path>, overrides: &[String]) -> Result<Value> {
    let mut map = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            match serde_json::from_str::<Value>(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
            {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => bail!(
                    "Config {} must hold a JSON object, found {}",
                    path.display(),
                    other
                ),
            }
        }
        None => Map::new(),
    };

    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        map.insert(key, value);
    }

    Ok(Value::Object(map))
}

fn read_code(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read submission from stdin")?;
        return Ok(code);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read submission {}", path.display()))
}

/// Run one episode on a submission
pub async fn run_step(
    code_path: &Path,
    config_path: Option<&Path>,
    overrides: &[String],
    backend: Option<&str>,
    observation_only: bool,
) -> Result<()> {
    let code = read_code(code_path)?;
    let user_config = load_config(config_path, overrides)?;

    let mut settings = EngineSettings::from_env().context("Invalid engine settings")?;
    if let Some(backend) = backend {
        settings.backend = backend.parse::<Backend>()?;
    }
    let engine = build_engine(&settings)?;

    let mut env = Evaluator::with_engine(&user_config, engine).context("Invalid configuration")?;
    env.reset();
    info!(backend = %settings.backend, "Scoring submission");

    let step = env.step(&code).await?;

    if observation_only {
        println!("{}", step.observation);
        println!("reward: {}", step.reward);
    } else {
        let json = serde_json::to_string_pretty(&step).context("Failed to serialize step")?;
        println!("{}", json);
    }

    Ok(())
}

/// Write the default configuration
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(&Configuration::default())
        .context("Failed to serialize default configuration")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

/// Validate a configuration file
pub fn check_config(path: &Path) -> Result<()> {
    let user_config = load_config(Some(path), &[])?;
    let config = ConfigResolver::resolve(&user_config)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    println!("✅ {} is valid", path.display());
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("Failed to serialize configuration")?
    );
    Ok(())
}
