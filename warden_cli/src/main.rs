use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use warden_core::config::WardenConfig;
use warden_core::executor::{ExecutionResult, StaticEnvironment};
use warden_core::instrument::{self, InstrumentationKind};
use warden_core::supervisor::{SessionKey, Supervisor};
use warden_core::unit::{ClassFile, decode_unit, encode_unit, parse_signature};
use warden_core::value::Value;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Root of instrumented units; repeatable.
    #[clap(long = "user-path", global = true)]
    user_paths: Vec<PathBuf>,
    /// Root of units loaded unmodified; repeatable.
    #[clap(long = "dependency-path", global = true)]
    dependency_paths: Vec<PathBuf>,
    #[clap(long, global = true)]
    kind: Option<InstrumentationKind>,
    #[clap(long, global = true)]
    timeout_ms: Option<u64>,
    /// Worker executable.
    #[clap(long, global = true)]
    worker: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode a JSON unit description into a binary unit.
    Assemble { json: PathBuf, out: PathBuf },
    /// Print a binary unit as JSON.
    Inspect { unit: PathBuf },
    /// Rewrite a binary unit and print its probe layout.
    Instrument {
        unit: PathBuf,
        #[clap(long)]
        out: Option<PathBuf>,
    },
    /// Call a member in a worker.
    Invoke {
        #[clap(long)]
        unit: String,
        /// Member signature, e.g. `add(II)I`.
        #[clap(long)]
        member: String,
        /// JSON array of arguments.
        #[clap(long, default_value = "[]")]
        args: String,
        /// JSON array of `{"unit", "field", "value"}` bindings.
        #[clap(long)]
        env: Option<String>,
        /// Collect the unit's coverage after the call.
        #[clap(long)]
        coverage: bool,
    },
    /// Read a static field in a worker.
    StaticField {
        #[clap(long)]
        unit: String,
        #[clap(long)]
        field: String,
    },
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            WardenConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("warden.toml");
            if default_config_path.exists() {
                log::info!("No config file specified, loading {default_config_path:?}");
                WardenConfig::load_from_file(&default_config_path)?
            } else {
                log::debug!("No config file specified and no warden.toml, using built-in defaults");
                WardenConfig::default()
            }
        }
    };
    apply_overrides(&mut config, &cli)?;
    log::debug!("Effective configuration: {config:#?}");

    match cli.command {
        Commands::Assemble { json, out } => assemble(&json, &out),
        Commands::Inspect { unit } => inspect(&unit),
        Commands::Instrument { unit, out } => {
            instrument_unit(&unit, config.session.instrumentation, out.as_ref())
        }
        Commands::Invoke {
            unit,
            member,
            args,
            env,
            coverage,
        } => invoke(&config, &unit, &member, &args, env.as_deref(), coverage),
        Commands::StaticField { unit, field } => {
            let supervisor = Supervisor::new(config.supervisor_config());
            let value = supervisor.compute_static_field(&config.session_key(), &unit, &field)?;
            println!("{}", serde_json::to_string_pretty(&value.to_json())?);
            Ok(())
        }
    }
}

fn apply_overrides(config: &mut WardenConfig, cli: &Cli) -> Result<(), anyhow::Error> {
    if !cli.user_paths.is_empty() {
        config.session.user_paths = cli.user_paths.clone();
    }
    if !cli.dependency_paths.is_empty() {
        config.session.dependency_paths = cli.dependency_paths.clone();
    }
    if let Some(kind) = cli.kind {
        config.session.instrumentation = kind;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.supervisor.request_timeout_ms = timeout_ms;
    }
    match &cli.worker {
        Some(worker) => config.supervisor.worker_command = Some(vec![worker.display().to_string()]),
        None if config.supervisor.worker_command.is_none() => {
            config.supervisor.worker_command = Some(vec![sibling_worker()?.display().to_string()]);
        }
        None => {}
    }
    Ok(())
}

fn sibling_worker() -> Result<PathBuf, anyhow::Error> {
    let exe = std::env::current_exe().context("cannot locate the warden executable")?;
    Ok(exe.with_file_name(format!("warden-worker{}", std::env::consts::EXE_SUFFIX)))
}

fn assemble(json: &PathBuf, out: &PathBuf) -> Result<(), anyhow::Error> {
    let content = std::fs::read_to_string(json)
        .map_err(|e| anyhow!("Failed to read unit description at {:?}: {}", json, e))?;
    let class: ClassFile = serde_json::from_str(&content)
        .map_err(|e| anyhow!("Failed to parse unit description {:?}: {}", json, e))?;
    class.validate()?;
    let binary = encode_unit(&class)?;
    std::fs::write(out, &binary).with_context(|| format!("Failed to write {out:?}"))?;
    log::info!(
        "Assembled {} ({} bytes, md5 {:x}) into {:?}",
        class.name,
        binary.len(),
        md5::compute(&binary),
        out
    );
    Ok(())
}

fn inspect(unit: &PathBuf) -> Result<(), anyhow::Error> {
    let binary = std::fs::read(unit).with_context(|| format!("Failed to read {unit:?}"))?;
    let class = decode_unit(&binary)?;
    log::info!("{} md5 {:x}", class.name, md5::compute(&binary));
    println!("{}", serde_json::to_string_pretty(&class)?);
    Ok(())
}

fn instrument_unit(
    unit: &PathBuf,
    kind: InstrumentationKind,
    out: Option<&PathBuf>,
) -> Result<(), anyhow::Error> {
    let binary = std::fs::read(unit).with_context(|| format!("Failed to read {unit:?}"))?;
    let name = decode_unit(&binary)?.name;
    let transformed = instrument::create(kind).transform(&binary, &name)?;
    if let Some(out) = out {
        std::fs::write(out, &transformed.binary).with_context(|| format!("Failed to write {out:?}"))?;
    }
    match transformed.layout {
        Some(layout) => println!("{}", serde_json::to_string_pretty(&layout)?),
        None => println!("{}", serde_json::json!({ "unit": name, "kind": kind.as_str(), "probes": null })),
    }
    Ok(())
}

fn invoke(
    config: &WardenConfig,
    unit: &str,
    member: &str,
    args: &str,
    env: Option<&str>,
    coverage: bool,
) -> Result<(), anyhow::Error> {
    let (_, params, _) =
        parse_signature(member).ok_or_else(|| anyhow!("'{member}' is not a member signature"))?;
    let args: Vec<serde_json::Value> =
        serde_json::from_str(args).context("--args must be a JSON array")?;
    if args.len() != params.len() {
        bail!("{member} takes {} argument(s), {} given", params.len(), args.len());
    }
    let args = args
        .iter()
        .zip(&params)
        .map(|(json, ty)| Value::from_json_typed(json, *ty))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("bad argument: {e}"))?;
    let env = match env {
        Some(env) => parse_env(env)?,
        None => StaticEnvironment::default(),
    };

    let key: SessionKey = config.session_key();
    let supervisor = Supervisor::new(config.supervisor_config());
    let result = supervisor.invoke(&key, unit, member, args, env)?;
    let mut report = match &result {
        ExecutionResult::Success(value) => serde_json::json!({ "success": value.to_json() }),
        ExecutionResult::Failure(fault) => serde_json::json!({
            "failure": { "kind": fault.kind, "message": fault.message, "trace": fault.trace }
        }),
    };
    if coverage {
        let info = supervisor.collect_coverage(&key, unit)?;
        report["coverage"] = serde_json::to_value(&info)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    supervisor.close();
    Ok(())
}

fn parse_env(env: &str) -> Result<StaticEnvironment, anyhow::Error> {
    let bindings: Vec<serde_json::Value> =
        serde_json::from_str(env).context("--env must be a JSON array")?;
    let mut parsed = StaticEnvironment::default();
    for binding in &bindings {
        let field = |name: &str| {
            binding
                .get(name)
                .ok_or_else(|| anyhow!("env binding {binding} is missing '{name}'"))
        };
        let unit = field("unit")?
            .as_str()
            .ok_or_else(|| anyhow!("env binding unit must be a string"))?;
        let name = field("field")?
            .as_str()
            .ok_or_else(|| anyhow!("env binding field must be a string"))?;
        let value = Value::from_json(field("value")?).map_err(|e| anyhow!("bad env value: {e}"))?;
        parsed = parsed.with(unit, name, value);
    }
    Ok(parsed)
}
