//! hwprobe - CPU, GPU and TPM detection
//!
//! Prints what the library detects, either as a boxed text table or as JSON.
//! Logs go to stderr so JSON on stdout stays machine-readable.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use hwprobe::config::{self, Config};
use hwprobe::report::{self, Domains, Snapshot};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "windows")]
use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::Console::{
    GetConsoleMode, GetStdHandle, SetConsoleCP, SetConsoleMode, SetConsoleOutputCP,
    ENABLE_PROCESSED_OUTPUT, ENABLE_VIRTUAL_TERMINAL_PROCESSING, ENABLE_WRAP_AT_EOL_OUTPUT,
    STD_ERROR_HANDLE, STD_OUTPUT_HANDLE,
};

/// hwprobe - Detect CPU, GPU and TPM characteristics
#[derive(Parser)]
#[command(name = "hwprobe")]
#[command(version)]
#[command(about = "Best-effort CPU, GPU and TPM detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Log every degraded source to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    probes: ProbeFlags,
}

/// Optional probes, OR-ed onto the configuration file
#[derive(Args)]
struct ProbeFlags {
    /// Read CPU and GPU temperatures
    #[arg(long, global = true)]
    temp: bool,

    /// Break down CPU cores by performance level
    #[arg(long = "pe-cores", global = true)]
    pe_cores: bool,

    /// Query GPU memory, core count and clocks from the vendor driver
    #[arg(long, global = true)]
    driver_specific: bool,

    /// CPU utilization sampling interval in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the CPU
    Cpu,

    /// Detect GPUs
    Gpu,

    /// Detect the TPM
    Tpm,

    /// Detect everything (default)
    All,

    /// Show the configuration file
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,

        /// Write the default config file if it doesn't exist
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[cfg(target_os = "windows")]
fn init_windows_console() {
    // Best-effort enabling of ANSI/VT sequences and UTF-8 for the box drawing.
    // If the handle isn't a console (e.g., redirected), these calls will fail harmlessly.
    unsafe {
        let _ = SetConsoleOutputCP(65001);
        let _ = SetConsoleCP(65001);

        for handle_id in [STD_OUTPUT_HANDLE, STD_ERROR_HANDLE] {
            let handle = GetStdHandle(handle_id);
            if handle.is_null() || handle == INVALID_HANDLE_VALUE {
                continue;
            }

            let mut mode: u32 = 0;
            if GetConsoleMode(handle, &mut mode) == 0 {
                continue;
            }

            let desired = mode
                | ENABLE_PROCESSED_OUTPUT
                | ENABLE_WRAP_AT_EOL_OUTPUT
                | ENABLE_VIRTUAL_TERMINAL_PROCESSING;
            let _ = SetConsoleMode(handle, desired);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("hwprobe=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    #[cfg(target_os = "windows")]
    init_windows_console();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("{} {:#}", "Error:".bright_red(), err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let domains = match cli.command.unwrap_or(Commands::All) {
        Commands::Cpu => Domains {
            cpu: true,
            ..Domains::none()
        },
        Commands::Gpu => Domains {
            gpu: true,
            ..Domains::none()
        },
        Commands::Tpm => Domains {
            tpm: true,
            ..Domains::none()
        },
        Commands::All => Domains::all(),
        Commands::Config { path, init } => return show_config(path, init),
    };

    let mut config = Config::load()?;
    apply_flags(&mut config, &cli.probes);

    if matches!(cli.format, OutputFormat::Text) && domains.cpu {
        let seconds = config.cpu.sample_interval().as_secs_f64();
        println!(
            "{}",
            format!("Sampling CPU load for {seconds:.1}s...").bright_black()
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    let snapshot = rt.block_on(report::collect_async(config, domains))?;

    match cli.format {
        OutputFormat::Text => println!("{}", snapshot.display()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
    }

    single_domain_error(&snapshot, domains)
}

fn apply_flags(config: &mut Config, flags: &ProbeFlags) {
    config.cpu.temp |= flags.temp;
    config.cpu.show_pe_core_count |= flags.pe_cores;
    config.gpu.temp |= flags.temp;
    config.gpu.driver_specific |= flags.driver_specific;
    if let Some(ms) = flags.interval_ms.filter(|ms| *ms > 0) {
        config.cpu.sample_interval_ms = ms;
    }
}

/// A run for exactly one domain fails when that domain failed
fn single_domain_error(snapshot: &Snapshot, domains: Domains) -> Result<()> {
    let error = match domains {
        Domains {
            cpu: true,
            gpu: false,
            tpm: false,
        } => &snapshot.cpu_error,
        Domains {
            cpu: false,
            gpu: true,
            tpm: false,
        } => &snapshot.gpu_error,
        Domains {
            cpu: false,
            gpu: false,
            tpm: true,
        } => &snapshot.tpm_error,
        _ => return Ok(()),
    };
    match error {
        Some(err) => bail!("{err}"),
        None => Ok(()),
    }
}

fn show_config(path_only: bool, init: bool) -> Result<()> {
    let config = if init { Config::init()? } else { Config::load()? };
    let path = config::get_config_path()?;

    if path_only {
        println!("{path}");
        return Ok(());
    }

    println!("{} {}", "Config file:".bright_cyan(), path);
    println!();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
