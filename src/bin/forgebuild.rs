//! Driver binary (4.L): wires `Context::from_env_and_files()`, the manifest
//! loader, and the build session's `build()` to completion, translating the
//! final `Result` into one of §6's exit codes plus a single-line diagnostic.
//! Deliberately thin: the argument surface is just enough to drive the
//! pipeline from a shell, not a full front-end (§1 Non-goals rule out rich
//! CLI parsing and generator back ends).

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use owo_colors::OwoColorize;

use forgebuild::config::{Context, SchedulerPolicy};
use forgebuild::resolver::{DirectoryCatalog, LocalStorage, Resolver};
use forgebuild::build::BuildSession;

#[derive(Parser)]
#[command(name = "forgebuild", about = "incremental build engine for native targets")]
struct Cli {
    /// Directory to scan for target.toml manifests
    root: PathBuf,

    /// Package names of the targets to build (builds everything if empty)
    targets: Vec<String>,

    /// Worker pool size, overriding SW_NUM_JOBS / the config file
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Number of command failures to tolerate before cancelling the rest of the build
    #[arg(long)]
    skip_errors: Option<usize>,

    /// Re-run every command regardless of cache state
    #[arg(long)]
    build_always: bool,

    /// Emit a Chrome Trace Event Format dump to <build-dir>/.sw/misc/time_trace.json
    #[arg(long)]
    time_trace: bool,

    /// Directory catalogs to resolve unresolved dependencies against, in priority order
    #[arg(long = "catalog")]
    catalogs: Vec<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let mut ctx = match Context::from_env_and_files() {
        Ok(ctx) => ctx,
        Err(e) => return report_failure(&e),
    };

    if cli.jobs.is_some() || cli.skip_errors.is_some() || cli.build_always || cli.time_trace {
        ctx = Context::new(
            ctx.storage_root.clone(),
            ctx.build_dir.clone(),
            SchedulerPolicy {
                jobs: cli.jobs.unwrap_or(ctx.policy.jobs),
                skip_errors: cli.skip_errors.unwrap_or(ctx.policy.skip_errors),
                build_always: cli.build_always || ctx.policy.build_always,
                write_output_to_file: ctx.policy.write_output_to_file,
                time_trace: cli.time_trace || ctx.policy.time_trace,
            },
        );
    }

    let storage = LocalStorage::new(ctx.storage_root.clone());
    let catalogs: Vec<Box<dyn forgebuild::resolver::Catalog>> = cli
        .catalogs
        .iter()
        .enumerate()
        .map(|(i, dir)| Box::new(DirectoryCatalog::new(format!("catalog-{i}"), dir.clone())) as Box<_>)
        .collect();
    let resolver = Resolver::new(catalogs, storage);

    let bar = indicatif::ProgressBar::new_spinner();
    bar.set_message("building");
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    let mut session = BuildSession::new(&ctx);
    let started = Instant::now();
    let result = session.build(&cli.root, &cli.targets, &resolver);
    bar.finish_and_clear();

    match result {
        Ok(report) => {
            print_summary(&report, started.elapsed());
            if report.cancelled || report.failed > 0 {
                1
            } else {
                0
            }
        }
        Err(e) => report_failure(&e),
    }
}

fn print_summary(report: &forgebuild::scheduler::ExecutionReport, elapsed: std::time::Duration) {
    let width = terminal_size::terminal_size()
        .map(|(terminal_size::Width(w), _)| w as usize)
        .unwrap_or(80);
    println!("{}", "-".repeat(width.min(80)));

    let status = if report.failed > 0 || report.cancelled {
        "FAILED".red().bold().to_string()
    } else {
        "OK".green().bold().to_string()
    };
    println!(
        "{status}  {} succeeded, {} cached, {} failed, {} skipped in {:.2}s",
        report.succeeded,
        report.cache_hits,
        report.failed,
        report.skipped,
        elapsed.as_secs_f64()
    );
    if let Some(err) = &report.first_error {
        println!("{}: {err}", "first error".yellow());
    }
}

fn report_failure(e: &forgebuild::error::Error) -> i32 {
    eprintln!("{}: {e}", "error".red().bold());
    e.exit_code()
}
