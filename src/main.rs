use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use srctl::engine::ConfigSyncEngine;
use srctl::error::{ErrorCode, SrError};
use srctl::host::{CapabilityHost, ShellHost};
use srctl::model::{
    validate_package_id, AppConfig, AppConfigPatch, ConfigSnapshot, GlobalConfig, PackageScope,
    ReadOnlyRule, RedirectRule,
};
use srctl::settings::{
    default_settings_yaml, ensure_parent, load_settings, read_settings, resolve_settings_path,
    Settings,
};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SRCTL_LOG";

#[derive(Parser, Debug)]
#[command(name = "srctl", version, about = "Storage redirect control CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Serve everything from built-in sample data.
    #[arg(long, global = true)]
    demo: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Status,
    Doctor,
    Apps {
        #[arg(long, value_enum, default_value_t = ScopeArg::All)]
        scope: ScopeArg,
        #[arg(long, conflicts_with = "without_rules")]
        with_rules: bool,
        #[arg(long)]
        without_rules: bool,
    },
    App {
        #[command(subcommand)]
        command: AppCommand,
    },
    Global {
        #[command(subcommand)]
        command: GlobalCommand,
    },
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Running,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    User,
    System,
    All,
}

impl From<ScopeArg> for PackageScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::User => PackageScope::User,
            ScopeArg::System => PackageScope::System,
            ScopeArg::All => PackageScope::All,
        }
    }
}

#[derive(Subcommand, Debug)]
enum AppCommand {
    Get {
        pkg: String,
    },
    Set {
        pkg: String,
        /// JSON object merged over the stored config.
        #[arg(long)]
        data: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        /// SRC:DST; replaces the redirect rule list.
        #[arg(long = "redirect")]
        redirects: Vec<String>,
        /// Replaces the read-only rule list.
        #[arg(long = "read-only")]
        read_only: Vec<String>,
    },
    Delete {
        pkg: String,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GlobalCommand {
    Get,
    Set {
        #[arg(long, conflicts_with_all = ["file", "recommended"])]
        data: Option<String>,
        #[arg(long, conflicts_with = "recommended")]
        file: Option<PathBuf>,
        #[arg(long)]
        recommended: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LogsCommand {
    Tail {
        #[arg(long)]
        pkg: Option<String>,
        #[arg(long, default_value_t = 10)]
        n: usize,
        #[arg(long)]
        op: Option<String>,
    },
    Clear {
        #[arg(long)]
        pkg: String,
        #[arg(long)]
        yes: bool,
    },
    Stats,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Import {
        /// Snapshot file, `-` for stdin.
        file: PathBuf,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    demo: bool,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    message: String,
    remediation: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SrError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = Context {
        config_path: resolve_settings_path(cli.config.as_ref()),
        json: cli.json,
        demo: cli.demo,
    };

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        command => run(&ctx, command).await,
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

async fn connect(ctx: &Context) -> Result<(Settings, ConfigSyncEngine), SrError> {
    let settings = load_settings(&ctx.config_path)?;
    let host: Arc<dyn CapabilityHost> =
        Arc::new(ShellHost::with_timeout_secs(settings.daemon.call_timeout_sec));
    let engine = ConfigSyncEngine::from_settings(host, &settings);
    if ctx.demo {
        engine.load_demo_data().await;
    } else {
        engine.check_daemon().await;
    }
    Ok((settings, engine))
}

async fn run(ctx: &Context, command: Commands) -> Result<(), SrError> {
    let (settings, engine) = connect(ctx).await?;
    match command {
        Commands::Status => handle_status(ctx, &engine).await,
        Commands::Doctor => handle_doctor(ctx, &settings, &engine).await,
        Commands::Apps {
            scope,
            with_rules,
            without_rules,
        } => handle_apps(ctx, &engine, scope.into(), with_rules, without_rules).await,
        Commands::App { command } => handle_app(ctx, &engine, command).await,
        Commands::Global { command } => handle_global(ctx, &engine, command).await,
        Commands::Logs { command } => handle_logs(ctx, &engine, command).await,
        Commands::Snapshot { command } => handle_snapshot(ctx, &engine, command).await,
        Commands::Running => {
            let running = engine.running_apps().await;
            output(ctx, json!({"running": running}))
        }
        Commands::Config { command } => handle_config(ctx, command),
    }
}

async fn handle_status(ctx: &Context, engine: &ConfigSyncEngine) -> Result<(), SrError> {
    let report = engine.daemon_report().await;
    output(
        ctx,
        json!({
            "mode": engine.mode(),
            "daemon": engine.daemon_status(),
            "report": report,
        }),
    )
}

fn doctor_check(id: &str, ok: bool, message: String, remediation: &str) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        message,
        remediation: remediation.to_string(),
    }
}

async fn handle_doctor(
    ctx: &Context,
    settings: &Settings,
    engine: &ConfigSyncEngine,
) -> Result<(), SrError> {
    let mut checks = Vec::new();
    for tool in ["sh", "base64"] {
        let found = which::which(tool).is_ok();
        checks.push(doctor_check(
            tool,
            found,
            if found {
                format!("{tool} found in PATH")
            } else {
                format!("{tool} is not in PATH")
            },
            "Run srctl inside a shell environment that provides the tool (adb shell, Termux).",
        ));
    }

    let daemon_bin = settings.daemon_bin();
    let bin_ok = daemon_bin.is_file();
    checks.push(doctor_check(
        "daemon_bin",
        bin_ok,
        format!("daemonctl at {}", daemon_bin.display()),
        "Install the module or set paths.daemon_bin in the srctl config.",
    ));

    let config_dir = settings.config_dir();
    let config_ok = config_dir.is_dir();
    checks.push(doctor_check(
        "config_dir",
        config_ok,
        format!("configuration directory {}", config_dir.display()),
        "Check paths.module_dir or paths.config_dir; the directory is created on first save.",
    ));

    let status = engine.check_daemon().await;
    checks.push(doctor_check(
        "daemon_ping",
        status.online,
        if status.online {
            format!("daemon answered ping (version {})", status.version)
        } else {
            "daemon did not answer ping; saves will go to the configuration files".to_string()
        },
        "Start the daemon or reboot the device so the module service starts it.",
    ));

    let ok = checks.iter().all(|check| check.ok);
    let primary_error = checks
        .iter()
        .find(|check| !check.ok)
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "mode": engine.mode() })),
            error: primary_error,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!("[{}] {} - {}", state, check.id, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match primary_error {
        None => Ok(()),
        Some(message) => Err(SrError::Process(message)),
    }
}

async fn handle_apps(
    ctx: &Context,
    engine: &ConfigSyncEngine,
    scope: PackageScope,
    with_rules: bool,
    without_rules: bool,
) -> Result<(), SrError> {
    let mut apps = engine.load_apps(scope).await;
    if apps.is_empty() {
        if let Some(message) = engine.load_error() {
            return Err(SrError::Host(message));
        }
    }
    if with_rules || without_rules {
        engine.load_app_configs().await;
        let listed: BTreeSet<String> = apps.iter().map(|app| app.package_id.clone()).collect();
        apps = if with_rules {
            engine.apps_with_rules()
        } else {
            engine.apps_without_rules()
        };
        apps.retain(|app| listed.contains(&app.package_id));
    }
    output(ctx, json!({"count": apps.len(), "apps": apps}))
}

async fn handle_app(
    ctx: &Context,
    engine: &ConfigSyncEngine,
    command: AppCommand,
) -> Result<(), SrError> {
    match command {
        AppCommand::Get { pkg } => {
            validate_package_id(&pkg)?;
            let config = require_app_config(engine, &pkg).await?;
            output(ctx, json!({"pkg": pkg, "config": config}))
        }
        AppCommand::Set {
            pkg,
            data,
            enabled,
            redirects,
            read_only,
        } => {
            validate_package_id(&pkg)?;
            let patch = build_patch(data.as_deref(), enabled, &redirects, &read_only)?;
            if !engine.save_app_config(&pkg, patch).await {
                return Err(SrError::Process(format!(
                    "failed to save configuration for {pkg}"
                )));
            }
            let config = engine.get_app_config(&pkg).await;
            output(ctx, json!({"pkg": pkg, "saved": true, "config": config}))
        }
        AppCommand::Delete { pkg, yes } => {
            validate_package_id(&pkg)?;
            if !confirm(ctx, yes, &format!("Delete the configuration for {pkg}?"))? {
                return output(ctx, json!({"pkg": pkg, "deleted": false}));
            }
            if !engine.delete_app_config(&pkg).await {
                return Err(SrError::Process(format!(
                    "failed to delete configuration for {pkg}"
                )));
            }
            output(ctx, json!({"pkg": pkg, "deleted": true}))
        }
    }
}

async fn require_app_config(engine: &ConfigSyncEngine, pkg: &str) -> Result<AppConfig, SrError> {
    if let Some(config) = engine.get_app_config(pkg).await {
        return Ok(config);
    }
    match engine.load_error() {
        Some(message) => Err(SrError::Host(message)),
        None => Err(SrError::Daemon {
            code: ErrorCode::NotFound,
            message: format!("no configuration stored for {pkg}"),
        }),
    }
}

/// Rejects empty patches and relative rule paths before anything is sent.
fn build_patch(
    data: Option<&str>,
    enabled: Option<bool>,
    redirects: &[String],
    read_only: &[String],
) -> Result<AppConfigPatch, SrError> {
    let mut patch = match data {
        Some(text) => AppConfigPatch::from_value(serde_json::from_str(text)?)?,
        None => AppConfigPatch::new(),
    };
    if let Some(enabled) = enabled {
        patch = patch.enabled(enabled);
    }
    if !redirects.is_empty() {
        let rules = redirects
            .iter()
            .map(|item| parse_redirect(item))
            .collect::<Result<Vec<_>, _>>()?;
        patch = patch.redirect_rules(rules);
    }
    if !read_only.is_empty() {
        patch = patch.read_only_rules(read_only.iter().map(|p| ReadOnlyRule::new(p)).collect());
    }
    if patch.is_empty() {
        return Err(SrError::Config(
            "nothing to set; pass --data, --enabled, --redirect or --read-only".to_string(),
        ));
    }
    patch.apply_to(&AppConfig::default()).validate()?;
    Ok(patch)
}

fn parse_redirect(item: &str) -> Result<RedirectRule, SrError> {
    match item.split_once(':') {
        Some((src, dst)) if !src.is_empty() && !dst.is_empty() => Ok(RedirectRule::new(src, dst)),
        _ => Err(SrError::Config(format!(
            "redirect must look like SRC:DST, got {item:?}"
        ))),
    }
}

async fn handle_global(
    ctx: &Context,
    engine: &ConfigSyncEngine,
    command: GlobalCommand,
) -> Result<(), SrError> {
    match command {
        GlobalCommand::Get => {
            let global = engine.load_global_config().await;
            output(ctx, json!({"global": global}))
        }
        GlobalCommand::Set {
            data,
            file,
            recommended,
        } => {
            let global: GlobalConfig = if recommended {
                GlobalConfig::recommended()
            } else if let Some(text) = data {
                serde_json::from_str(&text)?
            } else if let Some(path) = file {
                serde_json::from_str(&read_input(&path)?)?
            } else {
                return Err(SrError::Config(
                    "pass --data, --file or --recommended".to_string(),
                ));
            };
            global.validate()?;
            if !engine.save_global_config(global).await {
                return Err(SrError::Process(
                    "failed to save global configuration".to_string(),
                ));
            }
            output(ctx, json!({"saved": true, "global": engine.global_config()}))
        }
    }
}

async fn handle_logs(
    ctx: &Context,
    engine: &ConfigSyncEngine,
    command: LogsCommand,
) -> Result<(), SrError> {
    match command {
        LogsCommand::Tail { pkg, n, op } => {
            let mut entries = engine.tail_logs(pkg.as_deref(), n).await;
            if let Some(op) = op {
                entries.retain(|entry| entry.op == op);
            }
            output(ctx, json!({"count": entries.len(), "entries": entries}))
        }
        LogsCommand::Clear { pkg, yes } => {
            if !confirm(ctx, yes, &format!("Clear all access log entries for {pkg}?"))? {
                return output(ctx, json!({"pkg": pkg, "cleared": false}));
            }
            if !engine.clear_logs(&pkg).await {
                return Err(SrError::Process(format!("failed to clear logs for {pkg:?}")));
            }
            output(ctx, json!({"pkg": pkg, "cleared": true}))
        }
        LogsCommand::Stats => {
            let stats = engine.log_stats().await;
            output(ctx, json!({"stats": stats}))
        }
    }
}

async fn handle_snapshot(
    ctx: &Context,
    engine: &ConfigSyncEngine,
    command: SnapshotCommand,
) -> Result<(), SrError> {
    match command {
        SnapshotCommand::Export { output: None } => {
            let snapshot = engine.export_snapshot().await;
            output(ctx, serde_json::to_value(&snapshot)?)
        }
        SnapshotCommand::Export { output: Some(path) } => {
            let snapshot = engine.export_snapshot().await;
            ensure_parent(&path)?;
            fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
            output(ctx, json!({"path": path, "apps": snapshot.apps.len()}))
        }
        SnapshotCommand::Import { file, yes } => {
            let snapshot: ConfigSnapshot = serde_json::from_str(&read_input(&file)?)?;
            snapshot.global.validate()?;
            for config in snapshot.apps.values() {
                config.validate()?;
            }
            let prompt = format!(
                "Overwrite the global configuration and {} app configurations?",
                snapshot.apps.len()
            );
            if !confirm(ctx, yes, &prompt)? {
                return output(ctx, json!({"imported": false}));
            }
            let apps = snapshot.apps.len();
            if !engine.import_snapshot(snapshot).await {
                return Err(SrError::Process(
                    "snapshot import finished with errors".to_string(),
                ));
            }
            output(ctx, json!({"imported": true, "apps": apps}))
        }
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SrError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, default_settings_yaml()?)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _settings = read_settings(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let settings = load_settings(&ctx.config_path)?;
            output(
                ctx,
                json!({
                    "path": ctx.config_path,
                    "exists": ctx.config_path.exists(),
                    "settings": settings,
                    "effective": {
                        "daemon_bin": settings.daemon_bin(),
                        "config_dir": settings.config_dir(),
                        "log_dir": settings.log_dir(),
                        "temp_dir": settings.temp_dir(),
                    },
                }),
            )
        }
    }
}

fn confirm(ctx: &Context, yes: bool, prompt: &str) -> Result<bool, SrError> {
    if yes || ctx.json {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        return Err(SrError::Config(format!(
            "{prompt} Re-run with --yes to confirm."
        )));
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn read_input(path: &Path) -> Result<String, SrError> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    Ok(fs::read_to_string(path)?)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SrError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SrError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_flags_need_both_sides() {
        let rule = parse_redirect("/sdcard/Download/:/sdcard/Sandbox/").unwrap();
        assert_eq!(rule.src, "/sdcard/Download/");
        assert_eq!(rule.dst, "/sdcard/Sandbox/");
        assert!(parse_redirect("/sdcard/Download/").is_err());
        assert!(parse_redirect(":/x").is_err());
    }

    #[test]
    fn patches_are_checked_before_any_io() {
        assert!(build_patch(None, None, &[], &[]).is_err());
        assert!(build_patch(None, None, &[], &["relative/path".to_string()]).is_err());
        assert!(build_patch(Some("[1]"), None, &[], &[]).is_err());

        let patch = build_patch(
            Some(r#"{"note":"kept"}"#),
            Some(true),
            &["/a/:/b/".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(patch.fields()["enabled"], true);
        assert_eq!(patch.fields()["note"], "kept");
        assert!(!patch.fields().contains_key("readOnlyRules"));
    }

    #[test]
    fn cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "srctl", "--json", "logs", "tail", "--pkg", "com.a", "--n", "5", "--op", "open",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Logs {
                command: LogsCommand::Tail { pkg, n, op },
            } => {
                assert_eq!(pkg.as_deref(), Some("com.a"));
                assert_eq!(n, 5);
                assert_eq!(op.as_deref(), Some("open"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["srctl", "apps", "--with-rules", "--without-rules"]).is_err());
    }
}
