//! reelflow CLI entry point.
//!
//! Binary name: `reelflow`
//!
//! Parses arguments, sets up tracing, wires the job store and executor,
//! then dispatches to the command handler. A run that stops on a failed
//! step exits with status 1.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::{Shell, generate};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = reelflow_observe::verbosity_filter(cli.verbose, cli.quiet);
    reelflow_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    reelflow_observe::shutdown_tracing();

    Ok(if result? { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Returns `false` when a run stopped on a failed step.
async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = cli.command {
        print_completions(shell);
        return Ok(true);
    }

    let state = AppState::init(cli.data_dir.clone()).await?;
    let json = cli.json;

    match cli.command {
        Commands::Create {
            workflow,
            inputs,
            inputs_file,
        } => {
            cli::job::create_job(&state, &workflow, &inputs, inputs_file.as_deref(), json).await?;
        }

        Commands::Run {
            job_id,
            step,
            force,
            from,
        } => {
            return cli::run::run_job(&state, &job_id, step, force, from, json, cli.quiet).await;
        }

        Commands::Batch {
            job_ids,
            status,
            concurrency,
        } => {
            return cli::run::run_batch(&state, job_ids, status, concurrency, json, cli.quiet)
                .await;
        }

        Commands::Status { job_id } => {
            cli::job::show_status(&state, &job_id, json).await?;
        }

        Commands::List { status } => {
            cli::job::list_jobs(&state, status, json).await?;
        }

        Commands::Recover { job_id } => {
            cli::job::recover_job(&state, &job_id, json).await?;
        }

        Commands::Note { job_id, text } => {
            cli::job::add_note(&state, &job_id, &text, json).await?;
        }

        Commands::Append {
            job_id,
            id,
            step,
            params,
            skip_if,
            optional,
            description,
        } => {
            let args = cli::job::AppendArgs {
                id: &id,
                step: &step,
                params: &params,
                skip_if: skip_if.as_deref(),
                optional,
                description: description.as_deref(),
            };
            cli::job::append_step(&state, &job_id, args, json).await?;
        }

        Commands::Steps => {
            cli::step::list_steps(&state, json)?;
        }

        Commands::Workflows => {
            cli::workflow::list_workflows(&state, json)?;
        }

        Commands::Completions { shell } => print_completions(shell),
    }

    Ok(true)
}

fn print_completions(shell: Shell) {
    let mut cmd = <Cli as clap::CommandFactory>::command();
    generate(shell, &mut cmd, "reelflow", &mut std::io::stdout());
}
