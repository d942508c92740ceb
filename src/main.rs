mod airflow;
mod docker_args;
mod docker_image;
mod error;
mod hocon;
mod jupyter;
mod loader;
mod project;
mod runner;
mod selector;
mod tree;
mod validate;

use clap::{ArgAction, Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::error::{AiscalatorError, ProcessErrorDetails};
use crate::jupyter::{ConfigFormat, NotebookParams};
use crate::loader::{AppConfig, AppLocations};
use crate::project::ProjectConfig;
use crate::runner::{LabSession, ProcessRunner, RealProcessRunner, WaitPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "aiscalator",
    version,
    about = "Run notebook steps and Airflow dags in Docker from HOCON configuration"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Application home holding config/aiscalator.conf.
    #[arg(long = "app-home", global = true)]
    app_home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Author and run notebook steps.
    Jupyter {
        #[command(subcommand)]
        command: JupyterCommand,
    },
    /// Drive the local Airflow deployment.
    Airflow {
        #[command(subcommand)]
        command: AirflowCommand,
    },
    /// Locate (or generate) and validate the application configuration.
    Setup,
    Doctor {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Version,
}

#[derive(Subcommand, Debug)]
enum JupyterCommand {
    /// Execute step notebooks with papermill.
    Run {
        conf: String,
        steps: Vec<String>,
        #[arg(short = 'p', long = "param", num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
        param: Vec<String>,
        #[arg(short = 'r', long = "raw-param", num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
        raw_param: Vec<String>,
        #[arg(long, default_value_t = false)]
        prepare_only: bool,
    },
    /// Open a step notebook in Jupyter Lab.
    Edit {
        conf: String,
        step: Option<String>,
        #[arg(short = 'p', long = "param", num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
        param: Vec<String>,
        #[arg(short = 'r', long = "raw-param", num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
        raw_param: Vec<String>,
        #[arg(long, default_value_t = false)]
        no_browser: bool,
    },
    /// Scaffold a new step.
    New {
        #[arg(default_value = ".")]
        path: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, value_enum, default_value_t = ConfigFormat::Hocon)]
        format: ConfigFormat,
    },
    /// Build the default notebook image.
    Setup,
}

#[derive(Subcommand, Debug)]
enum AirflowCommand {
    /// Point Airflow at a config home and workspace folders.
    Setup {
        #[arg(short = 'd', long = "config-home")]
        config_home: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        append: bool,
        workspace: Vec<String>,
    },
    Start,
    Stop,
    /// Run a one-off command in a compose service.
    Run {
        #[arg(short, long, default_value = airflow::DEFAULT_SERVICE)]
        service: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        subcommand: Vec<String>,
    },
    /// Open a dag notebook in Jupyter Lab.
    Edit {
        conf: String,
        dag: Option<String>,
        #[arg(long, default_value_t = false)]
        no_browser: bool,
    },
    /// Copy dag code into the Airflow dags folder.
    Push { conf: String, dags: Vec<String> },
    /// Scaffold a new dag.
    New {
        #[arg(default_value = ".")]
        path: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, value_enum, default_value_t = ConfigFormat::Hocon)]
        format: ConfigFormat,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    locations: AppLocations,
    json: bool,
}

fn main() -> Result<(), AiscalatorError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    init_tracing(cli.verbose, configured_log_level(&ctx.locations).as_deref());
    let runner = RealProcessRunner;

    let result = match cli.command {
        Commands::Jupyter { command } => handle_jupyter(&ctx, command, &runner),
        Commands::Airflow { command } => handle_airflow(&ctx, command, &runner),
        Commands::Setup => handle_setup(&ctx),
        Commands::Doctor { strict } => handle_doctor(&ctx, strict),
        Commands::Version => handle_version(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.process_details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        locations: AppLocations::discover(cli.app_home.as_deref()),
        json: cli.json,
    }
}

/// `logging.level` of an existing application config. Nothing is generated
/// before logging is installed.
fn configured_log_level(locations: &AppLocations) -> Option<String> {
    let file = locations.candidates().into_iter().find(|file| file.is_file())?;
    let app = AppConfig::load(&file).ok()?;
    app.log_level().map(str::to_lowercase)
}

fn init_tracing(verbose: bool, configured: Option<&str>) {
    let fallback = if verbose {
        "debug"
    } else {
        configured.unwrap_or("warn")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_app(ctx: &Context) -> Result<AppConfig, AiscalatorError> {
    loader::locate_application_config(&ctx.locations)
}

fn key_values(flat: &[String]) -> Vec<(String, String)> {
    flat.chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => Some((key.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Step or dag names to focus; none means the default candidate.
fn selections(names: &[String]) -> Vec<Option<&str>> {
    if names.is_empty() {
        vec![None]
    } else {
        names.iter().map(|name| Some(name.as_str())).collect()
    }
}

fn handle_jupyter<R: ProcessRunner>(
    ctx: &Context,
    command: JupyterCommand,
    runner: &R,
) -> Result<(), AiscalatorError> {
    match command {
        JupyterCommand::Run {
            conf,
            steps,
            param,
            raw_param,
            prepare_only,
        } => {
            let app = load_app(ctx)?;
            let params = NotebookParams {
                parameters: key_values(&param),
                raw: key_values(&raw_param),
            };
            let mut notebooks = Vec::new();
            for step in selections(&steps) {
                let project = ProjectConfig::new(app.clone(), &conf, step, None)?;
                notebooks.push(jupyter::run(&project, runner, &params, prepare_only)?);
            }
            if ctx.json {
                return output(ctx, json!({ "notebooks": notebooks }));
            }
            for notebook in &notebooks {
                println!("{}", notebook.display());
            }
            Ok(())
        }
        JupyterCommand::Edit {
            conf,
            step,
            param,
            raw_param,
            no_browser,
        } => {
            let project = ProjectConfig::new(load_app(ctx)?, &conf, step.as_deref(), None)?;
            let params = NotebookParams {
                parameters: key_values(&param),
                raw: key_values(&raw_param),
            };
            let session = jupyter::edit(&project, runner, &params, !no_browser, WaitPolicy::default())?;
            attend_lab(ctx, session)
        }
        JupyterCommand::New { path, name, format } => {
            if let Some(existing) = jupyter::existing_config(&path, &name) {
                return offer_edit(ctx, &existing, runner);
            }
            let file = jupyter::new(&path, &name, format)?;
            report_path(ctx, "config", &file)
        }
        JupyterCommand::Setup => {
            let project = ProjectConfig::app_only(load_app(ctx)?);
            let image = jupyter::setup(&project, runner)?;
            output(
                ctx,
                json!({ "image": image, "name": jupyter::DEFAULT_IMAGE_NAME }),
            )
        }
    }
}

/// An existing step configuration is opened in Jupyter Lab when the user
/// agrees; scripted runs get an error instead of a prompt.
fn offer_edit<R: ProcessRunner>(ctx: &Context, existing: &Path, runner: &R) -> Result<(), AiscalatorError> {
    let interactive = !ctx.json && io::stdin().is_terminal();
    if !interactive {
        return Err(AiscalatorError::Config(format!(
            "{} already exists",
            existing.display()
        )));
    }
    let wants_edit = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "A configuration already exists at {}. Edit it instead?",
            existing.display()
        ))
        .default(true)
        .interact()?;
    if !wants_edit {
        return Ok(());
    }
    let source = existing.display().to_string();
    let project = ProjectConfig::new(load_app(ctx)?, &source, None, None)?;
    let session = jupyter::edit(
        &project,
        runner,
        &NotebookParams::default(),
        true,
        WaitPolicy::default(),
    )?;
    attend_lab(ctx, session)
}

/// Reports the Jupyter Lab url, then stays attached until the container
/// exits.
fn attend_lab(ctx: &Context, session: LabSession) -> Result<(), AiscalatorError> {
    match (&session.url, ctx.json) {
        (url, true) => output(ctx, json!({ "url": url }))?,
        (Some(url), false) => println!("{url}"),
        (None, false) => eprintln!("Jupyter Lab did not report an access url yet"),
    }
    let status = session
        .handle
        .join()
        .map_err(|_| AiscalatorError::Process("jupyter lab output thread panicked".to_string()))??;
    debug!("Jupyter Lab exited with status {status}");
    Ok(())
}

fn report_path(ctx: &Context, key: &str, path: &Path) -> Result<(), AiscalatorError> {
    if ctx.json {
        return output(ctx, json!({ key: path }));
    }
    println!("{}", path.display());
    Ok(())
}

fn handle_airflow<R: ProcessRunner>(
    ctx: &Context,
    command: AirflowCommand,
    runner: &R,
) -> Result<(), AiscalatorError> {
    match command {
        AirflowCommand::Setup {
            config_home,
            append,
            workspace,
        } => {
            let app = load_app(ctx)?;
            let config_home = config_home.unwrap_or_else(|| app.app_config_home());
            let app = airflow::setup(&app, &config_home, &workspace, append)?;
            output(
                ctx,
                json!({
                    "config_file": app.file(),
                    "app_config_home": app.app_config_home(),
                    "workspace_paths": app.workspace_paths(),
                    "dags_dir": airflow::dags_dir(&app),
                }),
            )
        }
        AirflowCommand::Start => {
            airflow::start(&ProjectConfig::app_only(load_app(ctx)?), runner)?;
            compose_done(ctx, "start")
        }
        AirflowCommand::Stop => {
            airflow::stop(&ProjectConfig::app_only(load_app(ctx)?), runner)?;
            compose_done(ctx, "stop")
        }
        AirflowCommand::Run { service, subcommand } => {
            let subcommand = if subcommand.is_empty() {
                vec!["airflow".to_string()]
            } else {
                subcommand
            };
            airflow::run(&ProjectConfig::app_only(load_app(ctx)?), runner, &service, &subcommand)?;
            compose_done(ctx, "run")
        }
        AirflowCommand::Edit {
            conf,
            dag,
            no_browser,
        } => {
            let project = ProjectConfig::new(load_app(ctx)?, &conf, None, dag.as_deref())?;
            let session = airflow::edit(&project, runner, !no_browser, WaitPolicy::default())?;
            attend_lab(ctx, session)
        }
        AirflowCommand::Push { conf, dags } => {
            let app = load_app(ctx)?;
            let mut pushed = Vec::new();
            for dag in selections(&dags) {
                let project = ProjectConfig::new(app.clone(), &conf, None, dag)?;
                pushed.push(airflow::push(&project)?);
            }
            if ctx.json {
                return output(ctx, json!({ "pushed": pushed }));
            }
            for file in &pushed {
                println!("{}", file.display());
            }
            Ok(())
        }
        AirflowCommand::New { path, name, format } => {
            if let Some(existing) = jupyter::existing_config(&path, &name) {
                return Err(AiscalatorError::Config(format!(
                    "{} already exists",
                    existing.display()
                )));
            }
            let file = airflow::new(&path, &name, format)?;
            report_path(ctx, "config", &file)
        }
    }
}

fn compose_done(ctx: &Context, action: &str) -> Result<(), AiscalatorError> {
    if ctx.json {
        return output(ctx, json!({ "action": action }));
    }
    Ok(())
}

fn handle_setup(ctx: &Context) -> Result<(), AiscalatorError> {
    let app = load_app(ctx)?;
    let advisories: Vec<String> = ProjectConfig::app_only(app.clone())
        .validate_config()?
        .iter()
        .map(ToString::to_string)
        .collect();
    output(
        ctx,
        json!({
            "config_file": app.file(),
            "app_config_home": app.app_config_home(),
            "user_id": app.user_id(),
            "advisories": advisories,
        }),
    )
}

fn handle_version(ctx: &Context) -> Result<(), AiscalatorError> {
    let version = env!("CARGO_PKG_VERSION");
    if ctx.json {
        return output(ctx, json!({ "version": version }));
    }
    println!("aiscalator {version}");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    strict_fail: bool,
    message: String,
    remediation: String,
    details: serde_json::Value,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn collect_doctor_checks(ctx: &Context) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let docker_installed = which::which("docker").is_ok();
    let docker_ok = docker_installed && command_succeeds("docker", &["info"]);
    checks.push(doctor_check(
        "docker_runtime",
        docker_ok,
        "error",
        true,
        if docker_ok {
            "docker daemon reachable"
        } else if docker_installed {
            "docker is installed but daemon is unreachable"
        } else {
            "docker is not installed or not in PATH"
        },
        "Install/start Docker and rerun `aiscalator doctor`.",
        json!({ "docker_installed": docker_installed }),
    ));

    let compose_installed = which::which("docker-compose").is_ok();
    let compose_ok = compose_installed && command_succeeds("docker-compose", &["version"]);
    checks.push(doctor_check(
        "docker_compose",
        compose_ok,
        "warning",
        true,
        if compose_ok {
            "docker-compose available"
        } else {
            "docker-compose is not available; airflow commands will fail"
        },
        "Install docker-compose to use `aiscalator airflow`.",
        json!({ "docker_compose_installed": compose_installed }),
    ));

    let existing = ctx
        .locations
        .candidates()
        .into_iter()
        .find(|file| file.is_file());
    let app_check = match existing {
        None => doctor_check(
            "app_config",
            false,
            "warning",
            true,
            "no application configuration found",
            "Run `aiscalator setup` to generate one.",
            json!({ "candidates": ctx.locations.candidates() }),
        ),
        Some(file) => {
            let validated = AppConfig::load(&file)
                .and_then(|app| ProjectConfig::app_only(app).validate_config());
            match validated {
                Ok(advisories) => doctor_check(
                    "app_config",
                    true,
                    "error",
                    true,
                    "application configuration is valid",
                    "",
                    json!({ "path": file, "advisories": advisories.len() }),
                ),
                Err(err) => doctor_check(
                    "app_config",
                    false,
                    "error",
                    true,
                    format!("application configuration is invalid: {err}"),
                    format!("Fix {} or remove it and rerun `aiscalator setup`.", file.display()),
                    json!({ "path": file }),
                ),
            }
        }
    };
    checks.push(app_check);

    checks
}

/// Overall doctor result and the message to report when it fails. Failed
/// error checks decide the message before failed warnings.
fn doctor_verdict(checks: &[DoctorCheck], strict: bool) -> (bool, Option<String>) {
    let failed = || checks.iter().filter(|check| !check.ok);
    let first_error = failed().find(|check| check.severity == "error");
    let strict_failure = strict && failed().any(|check| check.strict_fail);
    let ok = first_error.is_none() && !strict_failure;
    let message = if ok {
        None
    } else {
        first_error.or_else(|| failed().next()).map(|check| check.message.clone())
    };
    (ok, message)
}

fn handle_doctor(ctx: &Context, strict: bool) -> Result<(), AiscalatorError> {
    let checks = collect_doctor_checks(ctx);
    let (ok, message) = doctor_verdict(&checks, strict);

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: message,
            error_details: None,
        };
        return print_json(&payload);
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!("[{state}] {} ({}) - {}", check.id, check.severity, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(AiscalatorError::Process(
        message.unwrap_or_else(|| "one or more readiness checks failed".to_string()),
    ))
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), AiscalatorError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), AiscalatorError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
