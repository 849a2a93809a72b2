use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fuzzwall::config::{load_project_configs, BroadcastFile, ProjectConfig};
use fuzzwall::evm::config::{FuzzingConfig, SeedConfig};
use fuzzwall::evm::mutation::MutationEngine;
use fuzzwall::evm::registry::{ProtectedContractInfo, ProtectedRegistry};
use fuzzwall::evm::types::parse_address;
use fuzzwall::invariants::registry::InvariantRegistry;
use fuzzwall::monitor::alerts::AlertManager;
use fuzzwall::monitor::monitor::{spawn_fuzz_workers, Monitor, MonitorConfig};
use fuzzwall::monitor::prestate::PreBlockStateOrchestrator;
use fuzzwall::onchain::endpoints::RpcClient;
use fuzzwall::onchain::storage::StorageFetcher;
use fuzzwall::rules::exporter::RuleExporter;
use fuzzwall::rules::pusher::{start_background, OraclePusher, OraclePusherConfig};

/// On-chain invariant monitor and attack-parameter fuzzer for protected
/// EVM contracts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node RPC endpoint URL
    #[arg(long, default_value = "http://localhost:8545")]
    rpc: String,

    /// Project config path (single project or an array of projects)
    #[arg(long)]
    config: PathBuf,

    /// Webhook URL for violation alerts
    #[arg(long)]
    webhook: Option<String>,

    /// Broadcast file; CREATE entries override protected addresses
    #[arg(long)]
    broadcast: Option<PathBuf>,

    /// Only load projects with these names (CSV)
    #[arg(long, default_value = "")]
    names: String,

    /// Replay transactions on the local EVM
    #[arg(long, default_value = "true")]
    local_execution: bool,

    /// Never pass a state override to replays
    #[arg(long, default_value = "false")]
    disable_state_override: bool,

    /// Baseline state file for fork tests
    #[arg(long)]
    baseline_state: Option<PathBuf>,

    /// Enable the oracle pusher
    #[arg(long, default_value = "false")]
    oracle_enabled: bool,

    /// Oracle module address
    #[arg(long, default_value = "")]
    oracle_module: String,

    /// Oracle signing key (hex)
    #[arg(long, default_value = "")]
    oracle_pk: String,

    /// Oracle chain id
    #[arg(long, default_value = "1")]
    oracle_chainid: u64,

    /// Minimum similarity for a push
    #[arg(long, default_value = "0.5")]
    oracle_threshold: f64,

    /// Push candidate rules below the threshold
    #[arg(long, default_value = "false")]
    oracle_push_candidates: bool,

    /// Reports per push batch
    #[arg(long, default_value = "8")]
    oracle_batch: u64,

    /// Seconds between periodic flushes
    #[arg(long, default_value = "30")]
    oracle_flush_interval: u64,

    /// Max rule groups per flush
    #[arg(long, default_value = "64")]
    oracle_max_rules: u64,

    /// Compress oversized discrete sets into ranges
    #[arg(long, default_value = "true")]
    oracle_compress_ranges: bool,

    /// Discrete value cap per parameter
    #[arg(long, default_value = "16")]
    oracle_max_values_per_param: u64,

    /// Rules file path
    #[arg(long, default_value = "rules.json")]
    rule_path: PathBuf,

    /// Write the rules file
    #[arg(long, default_value = "true")]
    rule_enable: bool,

    /// Rules file format (json|yaml)
    #[arg(long, default_value = "json")]
    rule_format: String,
}

fn build_registry(
    projects: &[ProjectConfig],
    broadcast: Option<&BroadcastFile>,
) -> anyhow::Result<ProtectedRegistry> {
    let broadcast_overrides: HashMap<String, _> = broadcast
        .map(|b| b.created_contracts().into_iter().collect())
        .unwrap_or_default();

    let mut registry = ProtectedRegistry::new();
    let mut infos = Vec::new();
    for project in projects {
        for contract in &project.contracts {
            let address = match broadcast_overrides.get(&contract.name) {
                Some(address) => *address,
                None => parse_address(&contract.address)
                    .with_context(|| format!("bad contract address {}", contract.address))?,
            };
            let abi = if let Some(inline) = &contract.abi {
                serde_json::from_value(inline.clone())
                    .with_context(|| format!("bad inline abi for {}", contract.name))?
            } else if let Some(path) = &contract.abi_path {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read abi file {path}"))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("bad abi file {path}"))?
            } else {
                Default::default()
            };
            infos.push(ProtectedContractInfo {
                address,
                name: contract.name.clone(),
                abi,
                seed_config: contract.seed_config.as_ref().map(SeedConfig::from_value),
                metadata: HashMap::from([("project".to_string(), project.project_id.clone())]),
            });
        }
    }
    registry.register_batch(infos);
    Ok(registry)
}

fn run(args: Args) -> anyhow::Result<()> {
    let names: Vec<String> = args
        .names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let projects = load_project_configs(&args.config, &names)?;
    if projects.is_empty() {
        bail!("no projects loaded from {}", args.config.display());
    }
    info!(projects = projects.len(), "configuration loaded");

    let broadcast = match &args.broadcast {
        Some(path) => Some(BroadcastFile::load(path)?),
        None => None,
    };
    let registry = Arc::new(RwLock::new(build_registry(&projects, broadcast.as_ref())?));
    if registry.read().unwrap().count() == 0 {
        bail!("no protected contracts registered");
    }

    let mut invariants = InvariantRegistry::new();
    let mut fuzz_configs: HashMap<String, FuzzingConfig> = HashMap::new();
    for project in &projects {
        invariants
            .load_project(project)
            .with_context(|| format!("loading project {}", project.project_id))?;
        fuzz_configs.insert(project.project_id.clone(), project.fuzzing_config.clone());
    }
    let invariants = Arc::new(invariants);

    let chain_id = projects[0].chain_id.max(1);
    let client = Arc::new(RpcClient::new(args.rpc.clone(), chain_id));

    let alert_config = &projects[0].alert_config;
    let webhook = args.webhook.clone().or_else(|| alert_config.webhook_url.clone());
    let alerts = AlertManager::new(webhook, Duration::from_secs(alert_config.dedup_seconds));

    let protected_addresses = registry.read().unwrap().addresses();
    let orchestrator = PreBlockStateOrchestrator::new(
        args.baseline_state.clone(),
        Some(Arc::new(StorageFetcher::new(client.clone()))),
        protected_addresses,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            cancel.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let workers = projects
        .iter()
        .map(|p| p.fuzzing_config.workers)
        .max()
        .unwrap_or(20);
    let (task_tx, task_rx) = crossbeam_channel::bounded(workers * 4);
    let (report_tx, report_rx) = crossbeam_channel::bounded(256);
    let engine = Arc::new(MutationEngine::new());
    let worker_handles = spawn_fuzz_workers(
        workers,
        registry.clone(),
        engine,
        invariants.clone(),
        task_rx,
        report_tx,
        cancel.clone(),
    );

    let exporter = Arc::new(RuleExporter::new(
        args.rule_path.clone(),
        args.rule_enable,
        &args.rule_format,
    ));
    let pusher = Arc::new(
        OraclePusher::new(
            OraclePusherConfig {
                enabled: args.oracle_enabled,
                module: parse_address(&args.oracle_module).unwrap_or_default(),
                private_key: args.oracle_pk.clone(),
                chain_id: args.oracle_chainid,
                push_threshold: args.oracle_threshold,
                push_candidates: args.oracle_push_candidates,
                batch_size: args.oracle_batch as usize,
                flush_interval: Duration::from_secs(args.oracle_flush_interval),
                max_rules: args.oracle_max_rules as usize,
                compress_ranges: args.oracle_compress_ranges,
                max_values_per_param: args.oracle_max_values_per_param as usize,
                ..Default::default()
            },
            client.clone(),
        )
        .context("configuring oracle pusher")?,
    );
    let pusher_handle = args
        .oracle_enabled
        .then(|| start_background(pusher.clone(), cancel.clone()));

    // reports fan into both sinks; one sink failing never blocks the other
    let sink_handle = {
        let exporter = exporter.clone();
        let pusher = pusher.clone();
        std::thread::spawn(move || {
            for report in report_rx.iter() {
                exporter.merge_report(&report);
                if let Err(e) = exporter.persist() {
                    error!(error = %e, "rule export failed");
                }
                pusher.process_fuzzing_result(report);
            }
        })
    };

    let monitor_config = MonitorConfig {
        block_lag: projects[0].monitoring_config.block_lag,
        poll_interval: Duration::from_millis(projects[0].monitoring_config.poll_interval_ms),
        local_execution: args.local_execution,
        disable_state_override: args.disable_state_override,
        trace_settle: Duration::from_secs(projects[0].fuzzing_config.trace_settle_seconds),
    };
    let mut monitor = Monitor::new(
        client,
        registry,
        invariants,
        alerts,
        orchestrator,
        monitor_config,
        fuzz_configs,
        task_tx,
        cancel.clone(),
    );
    monitor.run();
    drop(monitor);

    // clean shutdown: drain workers, flush rules, join everything
    for handle in worker_handles {
        let _ = handle.join();
    }
    let _ = sink_handle.join();
    if let Some(handle) = pusher_handle {
        let _ = handle.join();
    }
    if let Err(e) = exporter.persist() {
        warn!(error = %e, "final rule persist failed");
    }
    if let Err(e) = pusher.flush() {
        warn!(error = %e, "final push flush failed");
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "init failed");
        std::process::exit(1);
    }
}
