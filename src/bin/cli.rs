//! Binary entry point for the pagex administrative CLI.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;

use std::collections::VecDeque;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pagex::{
    env::PagePool,
    exchange::{CopyBackend, CounterMetrics, ExchangeOptions, Exchanger, OrderMismatchPolicy},
    sim::SimSystem,
    types::{BlockingMode, NodeId},
    PairStatus,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use config::{CliConfig, Profile, ProfileUpdate};

const HUGE_FRAMES: usize = 4;

#[derive(Parser, Debug)]
#[command(
    name = "pagex",
    version,
    about = "Administrative CLI for page exchange",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "PAGEX_CONFIG", help = "Path to the CLI config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "PAGEX_PROFILE", help = "Profile to apply")]
    profile: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, env = "PAGEX_LOG", help = "Tracing filter, e.g. pagex=debug")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Exchange hot and cold pages on a simulated two-node system")]
    Simulate(SimulateCmd),

    #[command(subcommand, about = "Manage saved option profiles")]
    Profile(ProfileCmd),
}

#[derive(Args, Debug, Default)]
struct TuningArgs {
    #[arg(long, value_enum, help = "Copy backend")]
    backend: Option<BackendArg>,

    #[arg(long, value_enum, help = "Lock and write-back patience")]
    mode: Option<ModeArg>,

    #[arg(long, help = "Copy workers (clamped to 32, rounded to even)")]
    workers: Option<usize>,

    #[arg(long, help = "Hardware copy channels")]
    channels: Option<usize>,

    #[arg(long, help = "Hold copy channels for the whole run")]
    reserve_channels: Option<bool>,

    #[arg(long, allow_negative_numbers = true, help = "Pairs per copy call; <= 0 is unbounded")]
    batch_size: Option<i64>,

    #[arg(long, help = "Use the phase-batched scheduler")]
    concurrent_batching: Option<bool>,

    #[arg(long, help = "Scheduler pass bound")]
    max_passes: Option<u32>,

    #[arg(long, help = "Frame size in bytes")]
    frame_size: Option<usize>,

    #[arg(long, value_enum, help = "Handling of hot and cold pages with different frame counts")]
    order_mismatch: Option<OrderArg>,
}

#[derive(Args, Debug)]
struct SimulateCmd {
    #[arg(long, default_value_t = 64, help = "Page pairs to exchange")]
    pairs: usize,

    #[arg(long, default_value_t = 4, help = "CPUs per simulated node")]
    cpus: usize,

    #[arg(long, default_value_t = 4, help = "Channels on the simulated copy device")]
    device_channels: usize,

    #[arg(long, default_value_t = 0, help = "Hot pages freed before the exchange")]
    freed: usize,

    #[arg(long, default_value_t = 0, help = "Hot pages allocated as 4-frame huge pages")]
    huge: usize,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Subcommand, Debug)]
enum ProfileCmd {
    #[command(about = "List saved profiles")]
    List,
    #[command(about = "Show one profile")]
    Show { name: String },
    #[command(about = "Create or update a profile")]
    Set {
        name: String,
        #[arg(long, help = "Make this the default profile")]
        default: bool,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    #[command(about = "Delete a profile")]
    Delete { name: String },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum BackendArg {
    WorkerPool,
    HardwareChannel,
    Serial,
}

impl From<BackendArg> for CopyBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::WorkerPool => CopyBackend::WorkerPool,
            BackendArg::HardwareChannel => CopyBackend::HardwareChannel,
            BackendArg::Serial => CopyBackend::Serial,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum ModeArg {
    Async,
    SyncLight,
    Sync,
}

impl From<ModeArg> for BlockingMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Async => BlockingMode::NonBlocking,
            ModeArg::SyncLight => BlockingMode::LightSync,
            ModeArg::Sync => BlockingMode::FullSync,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OrderArg {
    Requeue,
    Reject,
}

impl From<OrderArg> for OrderMismatchPolicy {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Requeue => OrderMismatchPolicy::Requeue,
            OrderArg::Reject => OrderMismatchPolicy::Reject,
        }
    }
}

#[derive(Debug, Serialize)]
struct SimulateReport {
    pairs: usize,
    unpaired: usize,
    rejected: usize,
    engine: &'static str,
    exchanged: usize,
    failed: usize,
    reclaimed: usize,
    serialized: usize,
    passes: u32,
    copy_calls: u64,
    copy_fallbacks: u64,
    bytes: u64,
    verified: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct ProfileView {
    name: String,
    backend: Option<String>,
    mode: Option<String>,
    workers: Option<usize>,
    channels: Option<usize>,
    reserve_channels: Option<bool>,
    batch_size: Option<i64>,
    concurrent_batching: Option<bool>,
    max_passes: Option<u32>,
    frame_size: Option<usize>,
    order_mismatch: Option<String>,
}

impl From<&Profile> for ProfileView {
    fn from(profile: &Profile) -> Self {
        Self {
            name: profile.name.clone(),
            backend: profile.backend.map(|b| format!("{b:?}")),
            mode: profile.mode.map(|m| format!("{m:?}")),
            workers: profile.workers,
            channels: profile.channels,
            reserve_channels: profile.reserve_channels,
            batch_size: profile.batch_size,
            concurrent_batching: profile.concurrent_batching,
            max_passes: profile.max_passes,
            frame_size: profile.frame_size,
            order_mismatch: profile
                .order_mismatch
                .map(|o| OrderMismatchPolicy::from(o).as_str().to_string()),
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("pagex=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());
    let mut config = CliConfig::load(cli.config.clone())?;

    match cli.command {
        Command::Simulate(cmd) => {
            let profile_name = cli
                .profile
                .as_deref()
                .or_else(|| config.default_profile_name());
            let profile = match profile_name {
                Some(name) => Some(config.profile(name).cloned().ok_or_else(|| {
                    config::ConfigError::ProfileNotFound {
                        name: name.to_string(),
                    }
                })?),
                None => None,
            };
            let report = run_simulation(&cmd, profile.as_ref())?;
            emit(&cli.format, &report, || print_simulate_text(&report))?;
            if report.failed > 0 {
                std::process::exit(2);
            }
        }
        Command::Profile(ProfileCmd::List) => {
            let views: Vec<ProfileView> = config.profiles().map(ProfileView::from).collect();
            let default = config.default_profile_name().map(str::to_string);
            let path = config.path().map(|p| p.display().to_string());
            emit(&cli.format, &views, || {
                if let Some(path) = &path {
                    println!("config: {path}");
                }
                if views.is_empty() {
                    println!("no profiles");
                }
                for view in &views {
                    let marker = if default.as_deref() == Some(view.name.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {}", view.name);
                }
            })?;
        }
        Command::Profile(ProfileCmd::Show { name }) => {
            let profile = config
                .profile(&name)
                .ok_or(config::ConfigError::ProfileNotFound { name: name.clone() })?;
            let view = ProfileView::from(profile);
            emit(&cli.format, &view, || print_profile_text(&view))?;
        }
        Command::Profile(ProfileCmd::Set {
            name,
            default,
            tuning,
        }) => {
            config.upsert_profile(&name, profile_update(&tuning))?;
            if default {
                config.set_default_profile(Some(&name))?;
            }
            let path = config.persist()?;
            println!("saved profile '{name}' to {}", path.display());
        }
        Command::Profile(ProfileCmd::Delete { name }) => {
            config.delete_profile(&name)?;
            let path = config.persist()?;
            println!("deleted profile '{name}' from {}", path.display());
        }
    }
    Ok(())
}

fn profile_update(tuning: &TuningArgs) -> ProfileUpdate {
    ProfileUpdate {
        backend: tuning.backend,
        mode: tuning.mode,
        workers: tuning.workers,
        channels: tuning.channels,
        reserve_channels: tuning.reserve_channels,
        batch_size: tuning.batch_size,
        concurrent_batching: tuning.concurrent_batching,
        max_passes: tuning.max_passes,
        frame_size: tuning.frame_size,
        order_mismatch: tuning.order_mismatch,
    }
}

impl From<&Profile> for TuningArgs {
    fn from(p: &Profile) -> Self {
        Self {
            backend: p.backend,
            mode: p.mode,
            workers: p.workers,
            channels: p.channels,
            reserve_channels: p.reserve_channels,
            batch_size: p.batch_size,
            concurrent_batching: p.concurrent_batching,
            max_passes: p.max_passes,
            frame_size: p.frame_size,
            order_mismatch: p.order_mismatch,
        }
    }
}

/// Profile values first, command-line flags on top.
fn build_options(tuning: &TuningArgs, profile: Option<&Profile>) -> ExchangeOptions {
    let mut opts = ExchangeOptions::default();
    let base = profile.map(TuningArgs::from);
    for layer in base.iter().chain(std::iter::once(tuning)) {
        if let Some(backend) = layer.backend {
            opts.copy_backend = backend.into();
        }
        if let Some(mode) = layer.mode {
            opts.blocking_mode = mode.into();
        }
        if let Some(workers) = layer.workers {
            opts.worker_count = workers;
        }
        if let Some(channels) = layer.channels {
            opts.channel_count = channels;
        }
        if let Some(reserve) = layer.reserve_channels {
            opts.reserve_channels = reserve;
        }
        if let Some(batch_size) = layer.batch_size {
            opts.batch_size = batch_size;
        }
        if let Some(concurrent) = layer.concurrent_batching {
            opts.concurrent_batching = concurrent;
        }
        if let Some(passes) = layer.max_passes {
            opts.max_passes = passes;
        }
        if let Some(frame_size) = layer.frame_size {
            opts.frame_size = frame_size;
        }
        if let Some(policy) = layer.order_mismatch {
            opts.order_mismatch = policy.into();
        }
    }
    opts
}

fn run_simulation(
    cmd: &SimulateCmd,
    profile: Option<&Profile>,
) -> Result<SimulateReport, Box<dyn Error>> {
    let metrics = Arc::new(CounterMetrics::default());
    let options = build_options(&cmd.tuning, profile).metrics(metrics.clone());
    let mut builder = SimSystem::builder()
        .nodes(2)
        .cpus_per_node(cmd.cpus)
        .frame_size(options.frame_size);
    if options.copy_backend == CopyBackend::HardwareChannel {
        builder = builder.dma_channels(cmd.device_channels);
    }
    let sim = builder.build();
    let mm = sim.new_mm();
    let vma = sim.new_anon_vma();
    let frame = sim.frame_size() as u64;

    let mut hot = VecDeque::with_capacity(cmd.pairs);
    let mut cold = VecDeque::with_capacity(cmd.pairs);
    let stride = HUGE_FRAMES as u64 * frame;
    for i in 0..cmd.pairs as u64 {
        let slow = if (i as usize) < cmd.huge {
            sim.alloc_huge_anon_page(&mm, &vma, i * stride, NodeId(1), HUGE_FRAMES)
        } else {
            sim.alloc_anon_page(&mm, &vma, i * stride, NodeId(1))
        };
        let fast = sim.alloc_anon_page(&mm, &vma, (cmd.pairs as u64 + i) * stride, NodeId(0));
        sim.fill(&slow, 2 * i);
        sim.fill(&fast, 2 * i + 1);
        sim.isolate(&slow);
        sim.isolate(&fast);
        hot.push_back(slow);
        cold.push_back(fast);
    }
    for i in 0..cmd.freed.min(cmd.pairs) as u64 {
        sim.zap(&mm, i * stride);
    }

    let exchanger = Exchanger::new(sim.env(), options);
    let pairing = exchanger.pair_isolated(&mut hot, &mut cold);
    let rejected = pairing.rejected.len();
    let unpaired = hot.len() + cold.len();
    for page in hot.drain(..).chain(cold.drain(..)) {
        sim.lru().putback(&page);
    }
    let expected: Vec<(u32, u32)> = pairing
        .pairs
        .iter()
        .map(|pair| (pair.from.fingerprint(), pair.to.fingerprint()))
        .collect();
    let pairs = pairing.pairs.clone();

    let started = Instant::now();
    let report = exchanger.exchange(&mm, pairing.pairs)?;
    let elapsed_ms = started.elapsed().as_millis();

    let verified = pairs
        .iter()
        .zip(&expected)
        .zip(&report.statuses)
        .filter(|((pair, (from_fp, to_fp)), status)| {
            **status == PairStatus::Exchanged
                && pair.from.fingerprint() == *to_fp
                && pair.to.fingerprint() == *from_fp
        })
        .count();

    Ok(SimulateReport {
        pairs: pairs.len(),
        unpaired,
        rejected,
        engine: exchanger.copy_engine(),
        exchanged: report.exchanged,
        failed: report.failed,
        reclaimed: report.reclaimed,
        serialized: report.serialized,
        passes: report.passes,
        copy_calls: metrics.copy_calls(),
        copy_fallbacks: metrics.copy_fallbacks.load(Ordering::Relaxed),
        bytes: metrics.bytes.load(Ordering::Relaxed),
        verified,
        elapsed_ms,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_simulate_text(report: &SimulateReport) {
    println!("Exchange:");
    println!(
        "  pairs={} engine={} passes={} elapsed_ms={}",
        report.pairs, report.engine, report.passes, report.elapsed_ms
    );
    println!(
        "  unpaired={} rejected={}",
        report.unpaired, report.rejected
    );
    println!(
        "  exchanged={} failed={} reclaimed={} serialized={} verified={}",
        report.exchanged, report.failed, report.reclaimed, report.serialized, report.verified
    );
    println!("Copy:");
    println!(
        "  calls={} fallbacks={} bytes={}",
        report.copy_calls, report.copy_fallbacks, report.bytes
    );
}

fn print_profile_text(view: &ProfileView) {
    println!("Profile {}:", view.name);
    let show = |key: &str, value: Option<String>| {
        println!("  {key}={}", value.unwrap_or_else(|| "-".to_string()));
    };
    show("backend", view.backend.clone());
    show("mode", view.mode.clone());
    show("workers", view.workers.map(|v| v.to_string()));
    show("channels", view.channels.map(|v| v.to_string()));
    show("reserve_channels", view.reserve_channels.map(|v| v.to_string()));
    show("batch_size", view.batch_size.map(|v| v.to_string()));
    show("concurrent_batching", view.concurrent_batching.map(|v| v.to_string()));
    show("max_passes", view.max_passes.map(|v| v.to_string()));
    show("frame_size", view.frame_size.map(|v| v.to_string()));
    show("order_mismatch", view.order_mismatch.clone());
}
