use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ui_verify::{ChromeBrowser, Config, RunStatus, ScenarioFile, ScenarioRunner};
use url::Url;

const EXIT_INVALID: u8 = 2;

#[derive(Parser)]
#[command(name = "ui-verify", version, about = "Drive a headless browser through a verification scenario")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario against a live application
    Run(RunArgs),
    /// Validate a scenario file without launching a browser
    Check {
        scenario: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    scenario: PathBuf,

    /// Base URL for relative navigate steps, overriding the scenario's
    #[arg(long)]
    base_url: Option<Url>,

    #[arg(long)]
    step_timeout_ms: Option<u64>,

    #[arg(long)]
    run_timeout_ms: Option<u64>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Write the JSON run report here
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(ms) = self.step_timeout_ms {
            config.timing.step_timeout_ms = ms;
        }
        if let Some(ms) = self.run_timeout_ms {
            config.timing.run_timeout_ms = ms;
        }
        if self.headed {
            config.browser.headless = false;
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts.dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { scenario } => check(scenario).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_INVALID)
        }
    }
}

async fn load(path: &Path) -> anyhow::Result<(ui_verify::Scenario, Config)> {
    let (scenario, config) = ScenarioFile::load(path)
        .await
        .with_context(|| format!("loading scenario {}", path.display()))?
        .into_parts();
    scenario
        .validate()
        .with_context(|| format!("invalid scenario {}", path.display()))?;
    Ok((scenario, config))
}

async fn check(path: PathBuf) -> anyhow::Result<u8> {
    let (scenario, _) = load(&path).await?;
    info!(scenario = %scenario.name, steps = scenario.len(), "Scenario is valid");
    for (index, step) in scenario.steps.iter().enumerate() {
        info!("  {:>2}. [{:?}] {}", index, step.tolerance, step.describe());
    }
    Ok(0)
}

async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let (scenario, mut config) = load(&args.scenario).await?;
    args.apply(&mut config);

    let mut runner = ScenarioRunner::new(config).with_base_url(args.base_url.clone());
    let report = runner.run(ChromeBrowser::new(), &scenario).await;

    match (&report.status, &report.failure) {
        (RunStatus::Completed, _) => info!(
            scenario = %report.scenario,
            steps = report.steps_executed,
            duration_ms = report.duration_ms,
            "PASSED"
        ),
        (RunStatus::Failed, Some(failure)) => {
            error!(
                scenario = %report.scenario,
                step = ?failure.step_index,
                reason = %failure.reason,
                "FAILED: {}",
                failure.message
            );
            if let Some(path) = &failure.screenshot_path {
                error!("Screenshot: {}", path.display());
            }
            if let Some(err) = &failure.screenshot_error {
                error!("Screenshot not captured: {}", err);
            }
        }
        (RunStatus::Failed, None) => error!(scenario = %report.scenario, "FAILED"),
    }

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .await
            .with_context(|| format!("writing report {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(report.exit_code() as u8)
}
