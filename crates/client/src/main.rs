use std::process::ExitCode;

use rowflow_client::Engine;
use rowflow_common::EngineConfig;
use rowflow_runtime::PipelineDef;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    match run_cli() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

#[derive(Debug, Clone)]
enum Command {
    Run(RunOpts),
    Validate { pipeline: String },
    Stages,
    Help,
}

#[derive(Debug, Clone)]
struct RunOpts {
    pipeline: String,
    metrics: bool,
    channel_capacity: Option<usize>,
    spill_dir: Option<String>,
}

/// Returns whether the command succeeded.
fn run_cli() -> Result<bool, Box<dyn std::error::Error>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match parse_args(&args)? {
        Command::Help => {
            print_usage();
            Ok(true)
        }
        Command::Stages => {
            let engine = Engine::from_env()?;
            for name in engine.stage_types() {
                println!("{name}");
            }
            Ok(true)
        }
        Command::Validate { pipeline } => {
            let engine = Engine::from_env()?;
            let def = PipelineDef::from_path(&pipeline)?;
            engine.validate(&def)?;
            println!("OK: {} ({} stages, {} hops)", def.name, def.stages.len(), def.hops.len());
            Ok(true)
        }
        Command::Run(opts) => {
            let mut config = EngineConfig::from_env()?;
            if let Some(capacity) = opts.channel_capacity {
                config.channel_capacity = capacity;
            }
            if let Some(dir) = opts.spill_dir {
                config.spill_dir = dir;
            }
            let engine = Engine::new(config)?;
            let report = engine.run_path(&opts.pipeline)?;
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            if opts.metrics {
                print!("{}", engine.prometheus_metrics());
            }
            Ok(report.success())
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, Box<dyn std::error::Error>> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };
    match first.as_str() {
        "--help" | "-h" | "help" => Ok(Command::Help),
        "stages" => Ok(Command::Stages),
        "validate" => {
            let pipeline = args
                .get(1)
                .cloned()
                .ok_or("missing pipeline path for validate")?;
            if let Some(extra) = args.get(2) {
                return Err(format!("unknown argument for validate: {extra}").into());
            }
            Ok(Command::Validate { pipeline })
        }
        "run" => parse_run_opts(&args[1..]).map(Command::Run),
        other => Err(format!("unknown command: {other}").into()),
    }
}

fn parse_run_opts(args: &[String]) -> Result<RunOpts, Box<dyn std::error::Error>> {
    let mut pipeline = None;
    let mut metrics = false;
    let mut channel_capacity = None;
    let mut spill_dir = None;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--metrics" => metrics = true,
            "--channel-capacity" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or("missing value for --channel-capacity")?;
                channel_capacity = Some(raw.parse::<usize>()?);
            }
            "--spill-dir" => {
                i += 1;
                spill_dir = Some(args.get(i).cloned().ok_or("missing value for --spill-dir")?);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument for run: {other}").into());
            }
            path => {
                if pipeline.replace(path.to_string()).is_some() {
                    return Err("run takes a single pipeline path".into());
                }
            }
        }
        i += 1;
    }

    Ok(RunOpts {
        pipeline: pipeline.ok_or("missing pipeline path for run")?,
        metrics,
        channel_capacity,
        spill_dir,
    })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  rowflow run <pipeline.json> [--metrics] [--channel-capacity N] [--spill-dir DIR]");
    eprintln!("  rowflow validate <pipeline.json>");
    eprintln!("  rowflow stages");
    eprintln!();
    eprintln!("Environment: ROWFLOW_CHANNEL_CAPACITY, ROWFLOW_SPILL_DIR,");
    eprintln!("ROWFLOW_SPILL_THRESHOLD_ROWS, RUST_LOG");
}
