use anyhow::{Context, Result};
use octcube::cli::{parse_args, setup_logging, Commands, FinetuneArgs, InspectArgs};
use octcube::training::FinetuneConfig;
use octcube::training::runner::{run_evaluation, run_finetune, PreparedRun};
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", octcube::info());

    let result = match cli.command {
        Commands::Finetune(args) => run_finetune_command(args),
        Commands::Inspect(args) => run_inspect(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_finetune_command(args: FinetuneArgs) -> Result<()> {
    let config = args.resolve().context("Failed to resolve configuration")?;
    if config.eval {
        return run_eval_command(config);
    }

    info!("Starting finetuning...");
    info!("Task mode: {} ({:?})", config.task_mode, config.split_mode);
    info!("Data path: {:?}", config.data_path);
    info!("Output directory: {:?}", config.output_dir);
    info!(
        "Model: {}, epochs: {}, batch size: {}, lr: {:.2e}",
        config.model,
        config.epochs,
        config.batch_size,
        config.effective_lr()
    );

    let output_dir = config.output_dir.clone();
    let summary = run_finetune(config)
        .with_context(|| format!("Finetuning failed (outputs under {:?})", output_dir))?;

    for outcome in &summary.outcomes {
        info!(
            "{}: {:?} after {} epochs, best val AUC {:.4} AUPRC {:.4} at epoch {}",
            outcome.tag,
            outcome.termination,
            outcome.epochs_run,
            outcome.best_val.auc,
            outcome.best_val.auprc,
            outcome.best_val.epoch
        );
    }

    info!("Results written to {:?}", output_dir);

    Ok(())
}

fn run_eval_command(config: FinetuneConfig) -> Result<()> {
    info!("Evaluating checkpoints under {:?}", config.resume);

    let output_dir = config.output_dir.clone();
    let results = run_evaluation(config)
        .with_context(|| format!("Evaluation failed (outputs under {:?})", output_dir))?;

    for result in &results {
        match &result.metrics {
            Some(m) => info!(
                "{}: test AUC {:.4}, ACC {:.4}, AUPRC {:.4}",
                result.tag, m.auc, m.acc, m.auprc
            ),
            None => warn!("{}: test subset could not be scored", result.tag),
        }
    }

    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let config = args.data.base_config().context("Failed to resolve configuration")?;

    let run = PreparedRun::prepare(config).context("Failed to build index and folds")?;
    let report = run.inspect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    Ok(())
}
