#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cmd::output::{format_check, format_route, format_run, format_verification};
use cmd::{
    Backend, StageOptions, StageOutput, check_command, route_command, run_command, stage_command,
};
use pipeline::Stage;
use warehouse::RetryPolicy;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "bqdeploy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository root holding config/, data/ and sql/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Backend that executes the statements
    #[arg(long, global = true, value_enum, default_value_t = Backend::Bigquery)]
    warehouse: Backend,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Make each warehouse call exactly once
    #[arg(long, global = true)]
    no_retry: bool,
}

#[derive(Args, Clone)]
struct BranchArgs {
    /// Branch that was pushed (bare name or refs/heads/...)
    #[arg(long, env = "GITHUB_REF_NAME")]
    branch: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy: route, ensure schema, load, transform, verify
    Run(BranchArgs),
    /// Show the environment a branch deploys to
    Route(BranchArgs),
    /// Create the dataset and tables if absent
    EnsureSchema(BranchArgs),
    /// Append the input file to the base table
    Load {
        #[command(flatten)]
        target: BranchArgs,
        /// Input file instead of the configured one
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Rebuild the summary table and view
    Transform {
        #[command(flatten)]
        target: BranchArgs,
        /// Directory with department_summary.sql and high_earners.sql
        #[arg(long)]
        sql_dir: Option<PathBuf>,
    },
    /// Count the deployed objects
    Verify(BranchArgs),
    /// List datasets without changing anything
    Check(BranchArgs),
}

fn print_report<T: serde::Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", text(value));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let retry = if cli.no_retry {
        RetryPolicy::no_retry()
    } else {
        RetryPolicy::default()
    };

    let (stage, target, data_file, sql_dir) = match cli.command {
        Commands::Run(args) => {
            let report = run_command(&cli.root, &args.branch, cli.warehouse, retry).await?;
            return print_report(cli.json, &report, format_run);
        }
        Commands::Route(args) => {
            let config = route_command(&cli.root, &args.branch)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(config.file())?);
            } else {
                print!("{}", format_route(&config));
            }
            return Ok(());
        }
        Commands::Check(args) => {
            let report = check_command(&cli.root, &args.branch, cli.warehouse, retry).await?;
            return print_report(cli.json, &report, format_check);
        }
        Commands::EnsureSchema(args) => (Stage::EnsureSchema, args, None, None),
        Commands::Load { target, file } => (Stage::Load, target, file, None),
        Commands::Transform { target, sql_dir } => (Stage::Transform, target, None, sql_dir),
        Commands::Verify(args) => (Stage::Verify, args, None, None),
    };

    let options = StageOptions {
        root: cli.root,
        branch: target.branch,
        backend: cli.warehouse,
        retry,
        data_file,
        sql_dir,
    };

    match stage_command(stage, &options).await? {
        StageOutput::Verified(report) => print_report(cli.json, &report, format_verification)?,
        StageOutput::Created(created) if created.is_empty() => {
            println!("All objects already exist");
        }
        StageOutput::Created(created) => {
            for name in created {
                println!("created {name}");
            }
        }
        StageOutput::Loaded(rows) => println!("loaded {rows} rows"),
        StageOutput::Executed(count) => println!("executed {count} statements"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    diagnostics::init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The failure already names its stage and cause.
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
