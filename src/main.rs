use std::io::IsTerminal;
use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use isoprov::capacity::{self, CapacityReport, ResourceBudget};
use isoprov::cli::{Cli, Command, OutputFormat};
use isoprov::config::{self, Config};
use isoprov::error::ProvisionError;
use isoprov::install::{self, install_stages};
use isoprov::logging;
use isoprov::plan::ProvisioningPlan;
use isoprov::progress::{OutputMode, StepProgress};
use isoprov::provision::{self, Tools};
use isoprov::{host, paths};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(cli.output);
    let mode = resolve_output_mode(output_format, cli.verbose, cli.quiet);

    // Tracing on stderr corrupts indicatif's line tracking, so it stays off
    // while the spinner UI owns the terminal.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet | OutputMode::Silent => EnvFilter::new("off"),
        OutputMode::Plain => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("isoprov=info"))
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures isoprov=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("isoprov=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let logs_dir = paths::logs_dir();

    // The log viewer doesn't need a config
    if let Command::Log { failed, all, tool } = cli.command {
        return handle_log_command(&logs_dir, failed, all, tool);
    }

    let sys_config = config::load_config(&cli.config)?;
    let plan = ProvisioningPlan::from_configurations(&sys_config.configurations)?;

    // Activate file logging for commands that touch the host
    if !matches!(cli.command, Command::Check) {
        std::fs::create_dir_all(&logs_dir).ok();
        file_handle.set_file(&logs_dir.join("isoprov.log")).ok();
    }

    let tools = Tools::new(&sys_config.installer.libvirt_uri);

    match cli.command {
        Command::Log { .. } => unreachable!(),
        Command::Check => {
            let report = run_check(&sys_config, &plan, output_format)?;
            if output_format != OutputFormat::Json {
                print_topology(&plan);
                print_budget(&report.requested, &report.available);
                println!("Plan fits on this host.");
            }
        }
        Command::Up { iso, apply } => {
            let config_file = apply.or_else(|| sys_config.installer.config_file.clone());
            let target = UpTarget {
                iso: &iso,
                config_file: config_file.as_deref(),
                logs_dir: &logs_dir,
            };
            run_up(&tools, &sys_config, &plan, target, mode, output_format).await?;
        }
        Command::Install { domain, apply } => {
            let config_file = apply.or_else(|| sys_config.installer.config_file.clone());
            let stages = install_stages(&sys_config, config_file.as_deref());
            let mut progress = StepProgress::new(stages.len(), mode);
            let report = install::install_domain(
                &sys_config,
                &domain,
                config_file.as_deref(),
                &logs_dir,
                &mut progress,
            )
            .await?;
            print_install_summary(&domain, &report, output_format)?;
        }
        Command::Destroy => {
            let removed = provision::destroy_plan(&tools, &sys_config, &plan).await?;
            if output_format == OutputFormat::Json {
                print_json(&DestroyJson {
                    nodes: plan.nodes().len(),
                    domains_removed: removed,
                })?;
            } else if removed == 0 {
                println!("No domains found; removed leftover images.");
            } else {
                println!("Destroyed {removed} of {} domain(s).", plan.nodes().len());
            }
        }
    }

    Ok(())
}

/// Capture the host, validate the plan and print JSON when asked to.
///
/// A violation is returned as an error so the process exits non-zero.
fn run_check(
    sys_config: &Config,
    plan: &ProvisioningPlan,
    output_format: OutputFormat,
) -> Result<CapacityReport, ProvisionError> {
    let capacity = host::capture(&sys_config.host)?;
    let result = capacity::validate(plan, &capacity);

    if output_format == OutputFormat::Json {
        print_json(&CheckJson {
            ok: result.is_ok(),
            requested: ResourceBudget::of_plan(plan),
            available: capacity.budget(),
            violation: result.as_ref().err().map(ToString::to_string),
        })?;
    }

    let report = result?;
    tracing::info!(
        memory_mb = report.requested.memory_mb,
        disk_gb = report.requested.disk_gb,
        cores = report.requested.cores,
        "plan fits"
    );
    Ok(report)
}

fn print_topology(plan: &ProvisioningPlan) {
    for line in plan.topology_lines() {
        println!("{line}");
    }
}

fn print_budget(requested: &ResourceBudget, available: &ResourceBudget) {
    println!("           requested  available");
    println!("memory MB  {:>9}  {:>9}", requested.memory_mb, available.memory_mb);
    println!("disk GB    {:>9}  {:>9}", requested.disk_gb, available.disk_gb);
    println!("cores      {:>9}  {:>9}", requested.cores, available.cores);
}

struct UpTarget<'a> {
    iso: &'a Path,
    config_file: Option<&'a str>,
    logs_dir: &'a Path,
}

/// Gate on KVM and capacity, provision every node, then install the
/// controller that carries the ISO.
async fn run_up(
    tools: &Tools,
    sys_config: &Config,
    plan: &ProvisioningPlan,
    target: UpTarget<'_>,
    mode: OutputMode,
    output_format: OutputFormat,
) -> Result<(), ProvisionError> {
    let UpTarget {
        iso,
        config_file,
        logs_dir,
    } = target;
    let iso = std::fs::canonicalize(iso).map_err(|e| ProvisionError::Io {
        context: format!("installation ISO {}", iso.display()),
        source: e,
    })?;

    host::check_kvm()?;
    // JSON for `up` is the final summary only
    let report = run_check(sys_config, plan, OutputFormat::Plain)?;

    let Some(controller) = plan.install_controller() else {
        return Err(ProvisionError::Validation {
            message: "plan has no controller to install".into(),
        });
    };

    let stages = install_stages(sys_config, config_file);
    let total_steps = plan.nodes().len() + 1 + stages.len();
    let mut progress = StepProgress::new(total_steps, mode);
    progress.info(&format!(
        "plan: {} MB, {} GB, {} cores of {} MB, {} GB, {} cores available",
        report.requested.memory_mb,
        report.requested.disk_gb,
        report.requested.cores,
        report.available.memory_mb,
        report.available.disk_gb,
        report.available.cores,
    ));

    provision::provision_plan(tools, sys_config, plan, &iso, &mut progress).await?;

    let install_report = install::install_domain(
        sys_config,
        &controller.id,
        config_file,
        logs_dir,
        &mut progress,
    )
    .await?;
    print_install_summary(&controller.id, &install_report, output_format)
}

fn print_install_summary(
    domain: &str,
    report: &install::InstallReport,
    output_format: OutputFormat,
) -> Result<(), ProvisionError> {
    if output_format == OutputFormat::Json {
        return print_json(&InstallJson {
            domain: domain.to_string(),
            phases: report.phases.iter().map(|p| p.phase.clone()).collect(),
            transcript: report.transcript.as_ref().map(|p| p.display().to_string()),
        });
    }
    println!("Installation of '{domain}' complete ({} phases).", report.phases.len());
    if let Some(path) = &report.transcript {
        println!("Console transcript: {}", path.display());
    }
    Ok(())
}

fn handle_log_command(logs_dir: &Path, failed: bool, all: bool, tool_log: bool) -> miette::Result<()> {
    if tool_log {
        let log_path = logs_dir.join("isoprov.log");
        if log_path.exists() {
            print!("{}", read_log(&log_path)?);
        } else {
            println!("No isoprov.log found. Run `isoprov up` first.");
        }
        return Ok(());
    }

    if all {
        let logs = logging::list_transcripts(logs_dir);
        if logs.is_empty() {
            println!("No console transcripts found.");
        } else {
            for entry in &logs {
                let status_indicator = if entry.status == "failed" { "FAIL" } else { " OK " };
                println!(
                    "[{status_indicator}] {} {} ({})",
                    entry.timestamp,
                    entry.name,
                    entry.path.display()
                );
            }
        }
        return Ok(());
    }

    match logging::latest_transcript(logs_dir, failed) {
        Some(path) => {
            let contents = read_log(&path)?;
            let fname = path.file_name().and_then(|f| f.to_str()).unwrap_or("?");
            println!("--- {fname} ---");
            print!("{contents}");
        }
        None if failed => println!("No failed console transcripts found."),
        None => println!("No console transcripts found. Run `isoprov up` first."),
    }

    Ok(())
}

fn read_log(path: &Path) -> Result<String, ProvisionError> {
    std::fs::read_to_string(path).map_err(|e| ProvisionError::Io {
        context: format!("reading {}", path.display()),
        source: e,
    })
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct CheckJson {
    ok: bool,
    requested: ResourceBudget,
    available: ResourceBudget,
    violation: Option<String>,
}

#[derive(facet::Facet)]
struct InstallJson {
    domain: String,
    phases: Vec<String>,
    transcript: Option<String>,
}

#[derive(facet::Facet)]
struct DestroyJson {
    nodes: usize,
    domains_removed: usize,
}

fn print_json<'a, T: facet::Facet<'a>>(value: &T) -> Result<(), ProvisionError> {
    let json = facet_json::to_string(value).map_err(|e| ProvisionError::Validation {
        message: format!("JSON serialization: {e}"),
    })?;
    println!("{json}");
    Ok(())
}

/// Resolve `Auto` to a concrete format based on terminal detection.
fn resolve_output_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other,
    }
}

/// Map the resolved output format (plus `--verbose`/`--quiet` modifiers)
/// into the `OutputMode` used by `StepProgress`.
fn resolve_output_mode(format: OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => {
            if verbose || quiet {
                eprintln!("warning: --verbose/--quiet ignored in JSON output mode");
            }
            OutputMode::Silent
        }
        OutputFormat::Plain if quiet => OutputMode::Quiet,
        OutputFormat::Plain if verbose => OutputMode::Verbose,
        OutputFormat::Plain => OutputMode::Plain,
        OutputFormat::Interactive | OutputFormat::Auto if quiet => OutputMode::Quiet,
        OutputFormat::Interactive | OutputFormat::Auto if verbose => OutputMode::Verbose,
        OutputFormat::Interactive | OutputFormat::Auto => OutputMode::Normal,
    }
}
