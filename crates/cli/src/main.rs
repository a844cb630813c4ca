use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand};
use coldscan_aws::AwsContext;
use coldscan_core::{
    collect_doctor_info, load_engine, render_markdown_summary, LinuxHost, RunController,
    RunReport, ScanContext, ScanEngine, ScanSettings, TargetSelection,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "coldscan",
    version,
    about = "Scan cloud volumes and buckets for malware signatures without touching the running workloads."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Snapshot and scan volumes, then scan buckets.
    Scan(ScanArgs),
    /// Show host readiness: devices, mount point and rule files.
    Doctor(DoctorArgs),
    /// Compile the signature rules and list them.
    Rules(RulesArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Directory holding the signature rule files.
    #[arg(long, value_name = "DIR")]
    signatures: Option<PathBuf>,

    /// Comma separated volume IDs, `all`, or empty to skip volumes.
    #[arg(long, default_value = "all", value_name = "IDS")]
    volume_ids: String,

    /// Comma separated bucket names, `all`, or empty to skip buckets.
    #[arg(long, default_value = "all", value_name = "IDS")]
    bucket_ids: String,

    /// JSON settings file; flags override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scan worker threads per target.
    #[arg(long)]
    workers: Option<usize>,

    /// Where snapshot volumes are mounted.
    #[arg(long, value_name = "DIR")]
    mount_dir: Option<PathBuf>,

    /// Exclude glob patterns for file paths and object keys (repeatable).
    #[arg(long = "exclude", value_name = "GLOB", num_args = 1.., action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Skip instance metadata for the instance id.
    #[arg(long, value_name = "ID")]
    instance_id: Option<String>,

    /// Skip instance metadata for the availability zone.
    #[arg(long, value_name = "AZ")]
    availability_zone: Option<String>,

    /// Wait on snapshot, volume and attachment states without a poll limit.
    #[arg(long)]
    no_poll_limit: bool,

    /// Optional JSON report output file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Optional markdown summary output file.
    #[arg(long, value_name = "FILE")]
    md: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DoctorArgs {
    /// JSON settings file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the findings as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RulesArgs {
    /// Directory holding the signature rule files.
    #[arg(long, value_name = "DIR")]
    signatures: Option<PathBuf>,

    /// JSON settings file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan(args) => {
            let exit_code = run_scan_command(args)?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::Doctor(args) => run_doctor_command(args),
        Commands::Rules(args) => run_rules_command(args),
    }
}

fn load_settings(config: Option<&Path>) -> Result<ScanSettings> {
    match config {
        Some(path) => ScanSettings::load(path),
        None => Ok(ScanSettings::default()),
    }
}

fn run_scan_command(args: ScanArgs) -> Result<i32> {
    let ScanArgs {
        signatures,
        volume_ids,
        bucket_ids,
        config,
        workers,
        mount_dir,
        exclude,
        instance_id,
        availability_zone,
        no_poll_limit,
        report: report_path,
        md,
    } = args;

    let mut settings = load_settings(config.as_deref())?;
    if let Some(signatures) = signatures {
        settings.signatures_dir = signatures;
    }
    if let Some(workers) = workers {
        settings.workers = workers;
    }
    if let Some(mount_dir) = mount_dir {
        settings.mount_dir = mount_dir;
    }
    settings.excludes.extend(exclude);
    if no_poll_limit {
        settings.poll = settings.poll.without_ceiling();
    }
    settings.validate()?;

    let engine = load_engine(&settings.signatures_dir, settings.engine_overlap)?;

    let aws = AwsContext::load(instance_id, availability_zone)
        .context("failed to resolve host identity")?;
    let context = ScanContext {
        block_storage: Arc::new(aws.block_storage(&settings.volume_type, settings.volume_iops)),
        object_storage: Arc::new(aws.object_storage()),
        host: Arc::new(LinuxHost),
        engine,
        identity: aws.identity().clone(),
        settings,
    };

    let report = RunController::new(&context).run(
        &TargetSelection::parse(&volume_ids),
        &TargetSelection::parse(&bucket_ids),
    )?;

    if let Some(output) = report_path {
        write_report(&report, &output)?;
        println!("Report written to {}", output.display());
    }
    if let Some(md_path) = md {
        let markdown = render_markdown_summary(&report);
        fs::write(&md_path, markdown).with_context(|| {
            format!("failed to write markdown summary to {}", md_path.display())
        })?;
        println!("Markdown summary written to {}", md_path.display());
    }

    println!(
        "Scanned {} target(s): {} failed, {} match(es).",
        report.targets.len(),
        report.failed_targets(),
        report.total_matches()
    );
    for target in report.targets.iter().filter(|target| !target.succeeded()) {
        println!(
            "- {}: {}",
            target.target,
            target.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(report.exit_code())
}

fn write_report(report: &RunReport, output: &Path) -> Result<()> {
    let payload = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    fs::write(output, payload)
        .with_context(|| format!("failed to write report to {}", output.display()))
}

fn run_doctor_command(args: DoctorArgs) -> Result<()> {
    let settings = load_settings(args.config.as_deref())?;
    let info = collect_doctor_info(&settings);

    if args.json {
        let payload =
            serde_json::to_string_pretty(&info).context("failed to serialize doctor info")?;
        println!("{payload}");
        return Ok(());
    }

    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = &info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    println!("Mounted disks: {}", info.disks.len());
    for disk in &info.disks {
        println!(
            "- {} [{}] fs={} total={} free={} removable={}",
            disk.name,
            disk.mount_point,
            disk.file_system,
            human_bytes(disk.total_space_bytes),
            human_bytes(disk.free_space_bytes),
            disk.is_removable
        );
    }
    println!(
        "NVMe devices under {}: {}",
        info.device_dir,
        if info.nvme_devices.is_empty() {
            "none".to_string()
        } else {
            info.nvme_devices.join(", ")
        }
    );
    if let Some(newest) = &info.newest_device {
        println!("Newest device: {}", newest);
    }
    println!(
        "Mount directory: {} (exists: {})",
        info.mount_dir, info.mount_dir_exists
    );
    println!(
        "Rule files under {}: {}",
        info.signatures_dir,
        info.rule_files.len()
    );
    for note in &info.notes {
        println!("Note: {}", note);
    }
    Ok(())
}

fn run_rules_command(args: RulesArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(signatures) = args.signatures {
        settings.signatures_dir = signatures;
    }

    let engine = load_engine(&settings.signatures_dir, settings.engine_overlap)?;
    println!(
        "Compiled {} rule(s) from {}:",
        engine.rule_count(),
        settings.signatures_dir.display()
    );
    for name in engine.rule_names() {
        println!("- {}", name);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
