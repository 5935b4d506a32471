use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use magic_mount::modules::catalog::ModuleCatalog;
use magic_mount::modules::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_MODULE_DIR, DEFAULT_MOUNT_SOURCE, NAMESPACE_PID,
};
use magic_mount::modules::namespace::{ensure_root, enter_mount_namespace};
use magic_mount::modules::partition::parse_partition_list;
use magic_mount::modules::staging::select_staging_root;
use magic_mount::{Config, MountReport, MountSession, MountStats, SessionConfig, SyscallMounter, SystemXattrs};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Module directory
    #[arg(short, long, global = true)]
    module_dir: Option<PathBuf>,

    /// Staging root, a writable tmpfs is picked when unset
    #[arg(short, long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Mount source shown in the mount table
    #[arg(short = 's', long, global = true)]
    mount_source: Option<String>,

    /// Extra partitions, comma separated
    #[arg(short, long, global = true)]
    partitions: Option<String>,

    /// Log file, `-` for stdout
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge module trees over the partitions (default)
    Mount,
    /// List the modules that would be mounted
    Scan {
        /// Print the modules as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
    /// Print the version as JSON
    Version,
}

/// Command line values take precedence over the configuration file.
fn effective_config(cli: &Cli, mut config: Config) -> Config {
    if let Some(dir) = &cli.module_dir {
        config.module_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.temp_dir {
        config.temp_dir = Some(dir.clone());
    }
    if let Some(source) = &cli.mount_source {
        config.mount_source = Some(source.clone());
    }
    if let Some(list) = &cli.partitions {
        config.partitions.extend(parse_partition_list(list));
    }
    if let Some(file) = &cli.log_file {
        config.log_file = Some(file.clone());
    }
    config.debug |= cli.verbose;

    config.module_dir.get_or_insert_with(|| PathBuf::from(DEFAULT_MODULE_DIR));
    config.mount_source.get_or_insert_with(|| DEFAULT_MOUNT_SOURCE.to_string());
    config.namespace_pid.get_or_insert(NAMESPACE_PID);
    config
}

fn init_logger(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));

    match log_file {
        Some(path) if path == Path::new("-") => {
            builder.target(env_logger::Target::Stdout);
        }
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {}
    }

    builder.try_init()?;
    Ok(())
}

fn mount(config: &Config) -> Result<ExitCode> {
    ensure_root()?;
    enter_mount_namespace(config.namespace_pid.unwrap_or(NAMESPACE_PID))?;

    let staging_root = match &config.temp_dir {
        Some(dir) => dir.clone(),
        None => select_staging_root(),
    };
    let session_config = SessionConfig {
        root: PathBuf::from("/"),
        module_dir: config
            .module_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_DIR)),
        staging_root,
        mount_source: config
            .mount_source
            .clone()
            .unwrap_or_else(|| DEFAULT_MOUNT_SOURCE.to_string()),
        extra_partitions: config.partitions.clone(),
    };

    info!("Magic mount starting");
    info!("module dir: {}", session_config.module_dir.display());
    info!("staging root: {}", session_config.staging_root.display());

    let report = MountSession::new(session_config, SyscallMounter, SystemXattrs).run()?;
    log_report(&report);

    Ok(if report.status() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn log_report(report: &MountReport) {
    let stats = &report.stats;
    info!(
        "modules: {}, nodes: {}, mounted: {}, skipped: {}, whiteouts: {}, failures: {}",
        stats.modules_total,
        stats.nodes_total,
        stats.nodes_mounted,
        stats.nodes_skipped,
        stats.nodes_whiteout,
        stats.nodes_fail
    );
    for module in &report.failed_modules {
        warn!("module {} failed to mount completely", module);
    }
}

fn scan(config: &Config, json: bool) -> Result<ExitCode> {
    let module_dir = config
        .module_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_DIR));
    let mut stats = MountStats::default();
    let modules = ModuleCatalog::scan(&module_dir, &mut stats)?.participating();

    if json {
        println!("{}", serde_json::to_string(&modules)?);
    } else {
        for module in modules {
            println!("{}", module.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn version_json() -> String {
    serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }).to_string()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (file_config, config_error) = match Config::load(&cli.config) {
        Ok(config) => (config.unwrap_or_default(), None),
        Err(e) => (Config::default(), Some(e)),
    };
    let config = effective_config(&cli, file_config);

    if let Err(e) = init_logger(config.debug, config.log_file.as_deref()) {
        eprintln!("magic_mount: {:#}", e);
    }
    if let Some(e) = config_error {
        error!("{:#}, using defaults", e);
    }

    let result = match cli.command.unwrap_or(Commands::Mount) {
        Commands::Mount => mount(&config),
        Commands::Scan { json } => scan(&config, json),
        Commands::Config => config.to_toml_string().map(|text| {
            print!("{}", text);
            ExitCode::SUCCESS
        }),
        Commands::Version => {
            println!("{}", version_json());
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
