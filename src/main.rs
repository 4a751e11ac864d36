use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use pibake::batch::{batch_exit_code, run_batch, BatchPlan};
use pibake::cancel::CancelToken;
use pibake::cli::{BatchArgs, Cli, Commands, RunArgs};
use pibake::config::Config;
use pibake::logging::init_tracing;
use pibake::pty::{PtyTransport, Transcript};
use pibake::runtime::image::prepare_working_copy;
use pibake::runtime::DockerRuntime;
use pibake::session::{Provisioner, ProvisioningRequest, SessionReport};

#[tokio::main]
async fn main() {
    init_tracing();
    let code = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn real_main() -> Result<i32> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let cancel = CancelToken::new();
    cancel
        .register_signals()
        .context("Failed to install signal handlers")?;

    let runtime = Arc::new(DockerRuntime::from_config(&config.runtime));
    let provisioner = Arc::new(Provisioner::new(
        config,
        runtime,
        Arc::new(PtyTransport::new()),
    ));

    match cli.command {
        Commands::Run(args) => run(provisioner, args, cancel).await,
        Commands::Batch(args) => batch(provisioner, args, cancel).await,
    }
}

async fn run(provisioner: Arc<Provisioner>, args: RunArgs, cancel: CancelToken) -> Result<i32> {
    let defaults = &provisioner.config().defaults;
    let features = args.features(defaults)?;
    let requires_login = args.requires_login(defaults);

    let image = match &args.output {
        Some(output) => prepare_working_copy(&args.image, output)
            .with_context(|| format!("Failed to create working copy {}", output.display()))?,
        None => args.image.clone(),
    };
    let request = ProvisioningRequest::new(image, features)?
        .with_version_tag(args.version_tag.clone())
        .with_login(requires_login);

    let mut transcript = if args.quiet || args.json {
        Transcript::discard()
    } else {
        Transcript::stdout()
    };
    if let Some(path) = &args.transcript {
        transcript = transcript
            .with_file(path)
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;
    }

    let outcome = tokio::task::spawn_blocking(move || provisioner.run(&request, &cancel, transcript))
        .await
        .context("Provisioning thread failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print_report(&outcome.report);
    }
    if let Err(e) = &outcome.result {
        eprintln!("Error: {} stage failed: {}", e.stage(), e);
        eprintln!("Image left in place: {}", outcome.report.image.display());
    }
    Ok(outcome.exit_code())
}

async fn batch(provisioner: Arc<Provisioner>, args: BatchArgs, cancel: CancelToken) -> Result<i32> {
    let plan = BatchPlan::load(&args.plan)
        .with_context(|| format!("Failed to load batch plan {}", args.plan.display()))?;
    let outcomes = run_batch(provisioner, &plan, usize::from(args.parallel), cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            match &outcome.error {
                None => eprintln!("[ok]   {} -> {}", outcome.suffix, outcome.output.display()),
                Some(error) => eprintln!(
                    "[fail] {} -> {} (exit {}): {}",
                    outcome.suffix,
                    outcome.output.display(),
                    outcome.exit_code,
                    error
                ),
            }
        }
    }
    Ok(batch_exit_code(&outcomes))
}

fn print_report(report: &SessionReport) {
    let features: Vec<&str> = report.features_applied.iter().map(|k| k.as_str()).collect();
    eprintln!();
    eprintln!("Image:     {}", report.image.display());
    if let Some(id) = &report.resource_id {
        eprintln!("Instance:  {}", id);
    }
    eprintln!("Features:  {}", if features.is_empty() { "-".to_string() } else { features.join(", ") });
    eprintln!("Commands:  {}", report.commands_sent);
    eprintln!("Elapsed:   {:.1}s", report.elapsed_ms as f64 / 1000.0);
    if report.residual_resource {
        eprintln!("Warning:   instance was still running at cleanup and was force-stopped");
    }
}
