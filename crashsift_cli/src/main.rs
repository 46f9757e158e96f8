use crashsift_core::backend::GdbBackend;
use crashsift_core::config::{
    BackendSettings, CorpusSettings, SessionSettings, TargetSettings, TriageConfig,
    default_cur_input_path,
};
use crashsift_core::process::NixSignaller;
use crashsift_core::runner::{CorpusRunner, RunSummary};
use crashsift_core::session::{CancelFlag, InputDelivery, SessionOrchestrator};
use crashsift_core::transport::SessionListener;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, debug, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const DEFAULT_CONFIG_FILE: &str = "crashsift.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Replays a crash corpus under a debugger and buckets every input", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    input_dir: Option<PathBuf>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    #[clap(short, long)]
    port: Option<u16>,
    #[clap(short, long)]
    timeout_secs: Option<u64>,
    #[clap(short, long)]
    debug: bool,
    /// Target command; `@@` is replaced by the current-input path.
    #[clap(last = true)]
    target_command: Vec<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<TriageConfig> {
    let path = cli.config_file.clone().or_else(|| {
        let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
        fallback.exists().then_some(fallback)
    });
    let mut config = match path {
        Some(path) => TriageConfig::load_from_file(&path)?,
        None => TriageConfig {
            debug: false,
            target: TargetSettings {
                command: Vec::new(),
                cur_input_path: default_cur_input_path(),
            },
            session: SessionSettings::default(),
            backend: BackendSettings::default(),
            corpus: CorpusSettings {
                input_dir: cli
                    .input_dir
                    .clone()
                    .context("--input-dir is required without a config file")?,
                output_dir: cli
                    .output_dir
                    .clone()
                    .context("--output-dir is required without a config file")?,
                report_path: None,
            },
        },
    };

    if let Some(input_dir) = &cli.input_dir {
        config.corpus.input_dir = input_dir.clone();
    }
    if let Some(output_dir) = &cli.output_dir {
        config.corpus.output_dir = output_dir.clone();
    }
    if let Some(port) = cli.port {
        config.session.port = port;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        config.session.timeout_secs = timeout_secs;
    }
    if !cli.target_command.is_empty() {
        config.target.command = cli.target_command.clone();
    }
    config.debug |= cli.debug;
    Ok(config)
}

fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// First SIGINT/SIGTERM asks the runner to stop; a second one exits at once.
fn register_cancellation() -> anyhow::Result<CancelFlag> {
    let cancel = CancelFlag::default();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&cancel))
            .with_context(|| format!("Failed to register shutdown for signal {signal}"))?;
        signal_hook::flag::register(signal, Arc::clone(&cancel))
            .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }
    Ok(cancel)
}

fn run(config: &TriageConfig) -> anyhow::Result<RunSummary> {
    let session = config.session_config();
    info!("Target command: {}", session.command.join(" "));
    match &session.input_delivery {
        InputDelivery::Argument => info!("  - Input passed as an argument"),
        InputDelivery::Stdin(path) => info!("  - No @@ in target command, {path:?} fed on stdin"),
    }
    let backend = GdbBackend::prepare(&config.backend, &session)?;
    let snapshot = backend.snapshot_store();
    info!("Backend workspace: {:?}", backend.workspace());

    let listener = SessionListener::bind(session.port)?;
    info!("Listening for backend on 127.0.0.1:{}", listener.port());

    let cancel = register_cancellation()?;
    let orchestrator = SessionOrchestrator::new(
        session,
        listener,
        Box::new(backend),
        snapshot,
        Arc::new(NixSignaller),
    )
    .with_cancel_flag(cancel);

    let mut runner = CorpusRunner::new(orchestrator).with_report(config.corpus.report_path.clone());
    let summary = runner.run(
        &config.corpus.input_dir,
        &config.target.cur_input_path,
        &config.corpus.output_dir,
    )?;
    Ok(summary)
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(config.debug);
    debug!("Effective configuration: {config:#?}");

    config.validate().context("Invalid configuration")?;

    let summary = run(&config)?;
    info!(
        "Triage finished: {} inputs, {} crash buckets",
        summary.processed,
        summary.buckets.len()
    );
    if summary.interrupted {
        warn!("Triage interrupted before the corpus was exhausted");
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_without_config_file() {
        let cli = Cli::parse_from([
            "crashsift_cli",
            "--config-file",
            "/nonexistent/crashsift.toml",
        ]);
        assert!(load_config(&cli).is_err());

        let cli = Cli::parse_from([
            "crashsift_cli",
            "--input-dir",
            "/tmp/in",
            "--output-dir",
            "/tmp/out",
            "--port",
            "6000",
            "--timeout-secs",
            "3",
            "--debug",
            "--",
            "./bin/test",
            "@@",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.session.port, 6000);
        assert_eq!(config.session.timeout_secs, 3);
        assert!(config.debug);
        assert_eq!(config.target.command, vec!["./bin/test", "@@"]);
        assert_eq!(config.corpus.input_dir, PathBuf::from("/tmp/in"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_directories_are_reported() {
        let cli = Cli::parse_from(["crashsift_cli", "--", "./bin/test"]);
        if PathBuf::from(DEFAULT_CONFIG_FILE).exists() {
            return;
        }
        let err = load_config(&cli).unwrap_err();
        assert!(err.to_string().contains("--input-dir"));
    }
}
