//! labvm - disposable analysis machine control
//!
//! The entry point for the `labvm` binary:
//! - Startup checks of the virtualization tool, images and snapshots
//! - Machine status, start (revert + power on) and hard stop
//! - Analysis runs bracketed by a tcpdump capture

use clap::{Args, Parser, Subcommand};
use lv_common::{Error, OutputFormat, Result, SCHEMA_VERSION};
use lv_config::{load_config, ConfigOptions, LoadedConfig};
use lv_core::capture::{CaptureFilter, CaptureOptions};
use lv_core::exit_codes::ExitCode;
use lv_core::logging::{generate_run_id, init_logging, LogConfig, LogLevel};
use lv_core::machine::{
    ControllerSettings, MachineController, MachineRegistry, MachineState, RegisteredMachine,
};
use lv_core::runner::ProcessRunner;
use lv_core::window::AnalysisWindow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Control disposable analysis machines and capture their traffic
#[derive(Parser)]
#[command(name = "labvm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to labvm.toml
    #[arg(long, global = true, env = "LABVM_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the tool, every image and every snapshot
    Check,

    /// List configured machines
    List,

    /// Show whether machines are running
    Status(StatusArgs),

    /// Revert a machine to its snapshot and power it on
    Start(MachineArgs),

    /// Power a machine off (hard)
    Stop(MachineArgs),

    /// Start a machine, hold it for a duration with capture, then stop it
    Run(RunArgs),

    /// Print the capture filter used for a machine
    Filter(MachineArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Machine name or label (all machines when omitted)
    name: Option<String>,
}

#[derive(Args, Debug)]
struct MachineArgs {
    /// Machine name or label
    name: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Machine name or label
    name: String,

    /// Write captured traffic here (enables capture). Defaults to
    /// `sniffer.dump_dir` when the sniffer is enabled
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Seconds to keep the machine running
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Skip network capture even when enabled in the configuration
    #[arg(long, conflicts_with = "dump")]
    no_capture: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(ExitCode::ArgsError.as_i32());
        }
    };

    let log_config = LogConfig::from_env(
        LogLevel::from_flags(cli.global.verbose, cli.global.quiet),
        None,
    );
    init_logging(&log_config);

    let run_id = generate_run_id();
    let span = tracing::info_span!("labvm", run_id = %run_id);
    let _enter = span.enter();

    let ctx = Context {
        global: &cli.global,
        run_id: &run_id,
    };

    let exit_code = match &cli.command {
        Commands::Check => run_check(&ctx),
        Commands::List => run_list(&ctx),
        Commands::Status(args) => run_status(&ctx, args),
        Commands::Start(args) => run_start(&ctx, args),
        Commands::Stop(args) => run_stop(&ctx, args),
        Commands::Run(args) => run_window(&ctx, args),
        Commands::Filter(args) => run_filter(&ctx, args),
        Commands::Version => {
            print_version(&ctx);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

struct Context<'a> {
    global: &'a GlobalOpts,
    run_id: &'a str,
}

impl Context<'_> {
    fn format(&self) -> OutputFormat {
        self.global.format
    }

    fn load(&self) -> Result<LoadedConfig> {
        let options = ConfigOptions {
            config_path: self.global.config.clone(),
        };
        Ok(load_config(&options)?)
    }

    /// Load the configuration and build a controller over it.
    fn controller(&self, initialize: bool) -> Result<(LoadedConfig, MachineController)> {
        let loaded = self.load()?;
        let registry = MachineRegistry::from_config(&loaded.config, loaded.identity.clone())?;
        let controller = MachineController::new(
            Arc::new(registry),
            ControllerSettings::from(&loaded.config.vmware),
            Arc::new(ProcessRunner::default()),
        );
        if initialize {
            controller.initialize()?;
        }
        Ok((loaded, controller))
    }

    fn envelope(&self, command: &str, body: serde_json::Value) -> serde_json::Value {
        let mut response = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "run_id": self.run_id,
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "command": command,
            "status": "ok",
        });
        if let (Some(target), serde_json::Value::Object(fields)) = (response.as_object_mut(), body)
        {
            target.extend(fields);
        }
        response
    }

    fn fail(&self, command: &str, error: &Error) -> ExitCode {
        let exit_code = ExitCode::for_error(error);
        match self.format() {
            OutputFormat::Json => {
                let mut response = self.envelope(command, serde_json::json!({}));
                response["status"] = serde_json::json!("error");
                response["exit_code"] = serde_json::json!(exit_code.code_name());
                response["error"] = error.to_json();
                eprintln!("{}", pretty(&response));
            }
            OutputFormat::Human => eprintln!("{}", error.format_human()),
        }
        tracing::debug!(code = exit_code.as_i32(), error = %error, "command failed");
        exit_code
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn machine_json(machine: &RegisteredMachine) -> serde_json::Value {
    serde_json::json!({
        "name": machine.name(),
        "label": machine.raw_label(),
        "image": machine.image(),
        "snapshot": machine.label.snapshot(),
        "ip": machine.config.ip,
    })
}

// ============================================================================
// Command implementations
// ============================================================================

fn run_check(ctx: &Context) -> ExitCode {
    let (loaded, controller) = match ctx.controller(true) {
        Ok(pair) => pair,
        Err(e) => return ctx.fail("check", &e),
    };

    let machines: Vec<_> = controller
        .list_machines()
        .iter()
        .map(machine_json)
        .collect();

    match ctx.format() {
        OutputFormat::Json => {
            let response = ctx.envelope(
                "check",
                serde_json::json!({
                    "config": {
                        "path": loaded.path.display().to_string(),
                        "source": loaded.source.to_string(),
                        "identity": loaded.identity,
                    },
                    "tool": controller.settings().tool_path.display().to_string(),
                    "mode": controller.settings().mode,
                    "sniffer_enabled": loaded.config.sniffer.enabled,
                    "machines": machines,
                }),
            );
            println!("{}", pretty(&response));
        }
        OutputFormat::Human => {
            println!("# labvm check");
            println!();
            println!("✓ config: {} ({})", loaded.path.display(), loaded.source);
            println!("✓ tool: {}", controller.settings().tool_path.display());
            for machine in controller.list_machines() {
                println!("✓ {}: {}", machine.name(), machine.raw_label());
            }
        }
    }
    ExitCode::Clean
}

fn run_list(ctx: &Context) -> ExitCode {
    let loaded = match ctx.load() {
        Ok(loaded) => loaded,
        Err(e) => return ctx.fail("list", &e),
    };
    let registry = match MachineRegistry::from_config(&loaded.config, loaded.identity.clone()) {
        Ok(registry) => registry,
        Err(e) => return ctx.fail("list", &e),
    };

    match ctx.format() {
        OutputFormat::Json => {
            let machines: Vec<_> = registry.machines().iter().map(machine_json).collect();
            let response = ctx.envelope(
                "list",
                serde_json::json!({
                    "identity": registry.identity(),
                    "machines": machines,
                }),
            );
            println!("{}", pretty(&response));
        }
        OutputFormat::Human => {
            for machine in registry.machines() {
                println!(
                    "{:<16} {:<15} {}",
                    machine.name(),
                    machine.config.ip,
                    machine.raw_label()
                );
            }
        }
    }
    ExitCode::Clean
}

fn run_status(ctx: &Context, args: &StatusArgs) -> ExitCode {
    let (_loaded, controller) = match ctx.controller(false) {
        Ok(pair) => pair,
        Err(e) => return ctx.fail("status", &e),
    };

    let states: Vec<(&RegisteredMachine, MachineState)> = match &args.name {
        Some(name) => match controller.registry().resolve(name) {
            Ok(machine) => vec![(machine, controller.status(machine))],
            Err(e) => return ctx.fail("status", &e),
        },
        None => controller.status_all(),
    };

    match ctx.format() {
        OutputFormat::Json => {
            let machines: Vec<_> = states
                .iter()
                .map(|(m, state)| {
                    serde_json::json!({
                        "name": m.name(),
                        "label": m.raw_label(),
                        "state": state,
                    })
                })
                .collect();
            println!(
                "{}",
                pretty(&ctx.envelope("status", serde_json::json!({ "machines": machines })))
            );
        }
        OutputFormat::Human => {
            for (m, state) in &states {
                println!("{:<16} {}", m.name(), state);
            }
        }
    }

    match (args.name.as_ref(), states.first()) {
        (Some(_), Some((_, MachineState::Stopped))) => ExitCode::NotRunning,
        (Some(_), Some((_, MachineState::Unknown))) => ExitCode::OperationFailed,
        _ => ExitCode::Clean,
    }
}

fn run_start(ctx: &Context, args: &MachineArgs) -> ExitCode {
    let (_loaded, controller) = match ctx.controller(true) {
        Ok(pair) => pair,
        Err(e) => return ctx.fail("start", &e),
    };
    let result = controller
        .registry()
        .resolve(&args.name)
        .and_then(|machine| controller.start(machine).map(|()| machine));

    match result {
        Ok(machine) => {
            match ctx.format() {
                OutputFormat::Json => {
                    let response = ctx.envelope(
                        "start",
                        serde_json::json!({
                            "machine": machine_json(machine),
                            "mode": controller.settings().mode,
                        }),
                    );
                    println!("{}", pretty(&response));
                }
                OutputFormat::Human => println!("started {}", machine.name()),
            }
            ExitCode::Clean
        }
        Err(e) => ctx.fail("start", &e),
    }
}

fn run_stop(ctx: &Context, args: &MachineArgs) -> ExitCode {
    let (_loaded, controller) = match ctx.controller(true) {
        Ok(pair) => pair,
        Err(e) => return ctx.fail("stop", &e),
    };
    let result = controller
        .registry()
        .resolve(&args.name)
        .and_then(|machine| Ok((machine, controller.stop(machine)?)));

    match result {
        Ok((machine, outcome)) => {
            match ctx.format() {
                OutputFormat::Json => {
                    let response = ctx.envelope(
                        "stop",
                        serde_json::json!({
                            "machine": machine_json(machine),
                            "outcome": outcome,
                        }),
                    );
                    println!("{}", pretty(&response));
                }
                OutputFormat::Human => println!("{}: {}", machine.name(), outcome),
            }
            ExitCode::Clean
        }
        Err(e) => ctx.fail("stop", &e),
    }
}

fn capture_filter(loaded: &LoadedConfig, machine: &RegisteredMachine) -> CaptureFilter {
    CaptureFilter::for_guest(
        machine.config.ip.clone(),
        loaded.config.guest.control_port,
        loaded.config.resultserver.ip.clone(),
        loaded.config.resultserver.port,
    )
}

fn run_window(ctx: &Context, args: &RunArgs) -> ExitCode {
    let (loaded, controller) = match ctx.controller(true) {
        Ok(pair) => pair,
        Err(e) => return ctx.fail("run", &e),
    };
    let machine = match controller.registry().resolve(&args.name) {
        Ok(machine) => machine,
        Err(e) => return ctx.fail("run", &e),
    };

    let capture = !args.no_capture && (args.dump.is_some() || loaded.config.sniffer.enabled);
    let mut window = AnalysisWindow::new(&controller, machine);
    if capture {
        let dump = args.dump.clone().unwrap_or_else(|| {
            loaded
                .config
                .sniffer
                .dump_dir()
                .join(format!("{}-{}.pcap", machine.name(), ctx.run_id))
        });
        window = window.with_capture(CaptureOptions::from_config(
            &loaded.config.sniffer,
            capture_filter(&loaded, machine),
            dump,
        ));
    }

    let hold = Duration::from_secs(args.duration);
    let result = window.run(|m| {
        tracing::info!(machine = %m.name(), seconds = args.duration, "holding machine");
        std::thread::sleep(hold);
        Ok(())
    });

    match result {
        Ok(outcome) => {
            match ctx.format() {
                OutputFormat::Json => {
                    let response = ctx.envelope(
                        "run",
                        serde_json::json!({
                            "machine": machine_json(machine),
                            "duration_secs": args.duration,
                            "power_off": outcome.power_off,
                            "capture": outcome.capture,
                        }),
                    );
                    println!("{}", pretty(&response));
                }
                OutputFormat::Human => {
                    println!("ran {} for {}s", machine.name(), args.duration);
                    if let Some(capture) = &outcome.capture {
                        println!("capture: {}", capture.output_path.display());
                    }
                }
            }
            ExitCode::Clean
        }
        Err(e) => ctx.fail("run", &e),
    }
}

fn run_filter(ctx: &Context, args: &MachineArgs) -> ExitCode {
    let loaded = match ctx.load() {
        Ok(loaded) => loaded,
        Err(e) => return ctx.fail("filter", &e),
    };
    let registry = match MachineRegistry::from_config(&loaded.config, loaded.identity.clone()) {
        Ok(registry) => registry,
        Err(e) => return ctx.fail("filter", &e),
    };
    let machine = match registry.resolve(&args.name) {
        Ok(machine) => machine,
        Err(e) => return ctx.fail("filter", &e),
    };

    let filter = capture_filter(&loaded, machine);
    match ctx.format() {
        OutputFormat::Json => {
            let response = ctx.envelope(
                "filter",
                serde_json::json!({
                    "machine": machine.name(),
                    "expression": filter.to_string(),
                    "clauses": filter.clauses(),
                    "args": filter.to_args(),
                }),
            );
            println!("{}", pretty(&response));
        }
        OutputFormat::Human => println!("{filter}"),
    }
    ExitCode::Clean
}

fn print_version(ctx: &Context) {
    match ctx.format() {
        OutputFormat::Json => {
            let version_info = serde_json::json!({
                "schema_version": SCHEMA_VERSION,
                "labvm_version": env!("CARGO_PKG_VERSION"),
                "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            });
            println!("{}", pretty(&version_info));
        }
        OutputFormat::Human => {
            println!("labvm {}", env!("CARGO_PKG_VERSION"));
            println!("schema version: {}", SCHEMA_VERSION);
        }
    }
}
