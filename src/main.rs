//! Binary entrypoint for the plmgate CLI.
//!
//! Commands:
//! - `start [--port <path>] [--simulate]` - run the driver and log state updates
//! - `init` - write a starter `config.toml`
//! - `smoke-test --port <path> [-b <baud>] [--timeout <s>]` - ask the modem who it is
//!
//! See the library crate docs for module-level details: `plmgate::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use plmgate::config::Config;
use plmgate::device::LogPublisher;
use plmgate::driver::start_driver;
use plmgate::plm::address::DeviceAddress;
use plmgate::plm::memory::{simulated_plm, SimulatedLink};
use plmgate::plm::port::Connector;

#[derive(Parser)]
#[command(name = "plmgate")]
#[command(about = "Gateway driver for Insteon/X10 power-line modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the driver
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); overrides the config
        #[arg(short, long)]
        port: Option<String>,

        /// Talk to a simulated modem instead of hardware
        #[arg(long)]
        simulate: bool,
    },
    /// Write a default configuration file
    Init,
    /// Ask the modem for its address and firmware, print JSON
    SmokeTest {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, simulate } => {
            let mut config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting plmgate v{}", env!("CARGO_PKG_VERSION"));
            if let Some(p) = port {
                config.modem.port = p;
            }

            let connector: Arc<dyn Connector> = if simulate {
                info!("Using simulated modem");
                Arc::new(simulated_modem(&config).connector())
            } else {
                serial_connector(&config)?
            };

            let (driver, tasks) = start_driver(&config, connector, Arc::new(LogPublisher)).await?;
            info!("Driver running on {}; Ctrl-C to stop", config.modem.port);
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            if let Some(snapshot) = driver.snapshot().await {
                info!(
                    "{} devices, modem db complete: {}, writes: {}, retries: {}",
                    snapshot.devices.len(),
                    snapshot.db_complete,
                    snapshot.metrics.writes,
                    snapshot.metrics.retries
                );
            }
            driver.shutdown().await;
            for task in tasks {
                let _ = task.await;
            }
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::metadata(&cli.config).await.is_ok() {
                warn!("{} already exists, not overwriting", cli.config);
                return Ok(());
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::SmokeTest { port, baud, timeout } => {
            let pre_config = Config::load(&cli.config).await.ok();
            init_logging(&pre_config, cli.verbose);
            #[cfg(not(feature = "serial"))]
            {
                let _ = (port, baud, timeout);
                error!("SmokeTest requires the 'serial' feature");
                std::process::exit(2);
            }
            #[cfg(feature = "serial")]
            {
                let code = smoke_test(&port, baud, timeout).await?;
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

/// Modem that knows every configured Insteon device as a responder on group 1.
fn simulated_modem(config: &Config) -> plmgate::plm::memory::MemoryModem {
    let links = config
        .devices
        .iter()
        .filter_map(|d| d.parsed_address().ok())
        .filter(|a| !a.is_x10())
        .map(|address| SimulatedLink {
            address,
            controller: false,
            group: 1,
        })
        .collect();
    simulated_plm(DeviceAddress::insteon(0x44, 0x85, 0x11), links)
}

#[cfg(feature = "serial")]
fn serial_connector(config: &Config) -> Result<Arc<dyn Connector>> {
    use plmgate::plm::port::SerialConnector;
    Ok(Arc::new(SerialConnector {
        port_name: config.modem.port.clone(),
        baud_rate: config.modem.baud_rate,
        read_timeout: std::time::Duration::from_millis(config.modem.read_timeout_ms.max(1)),
    }))
}

#[cfg(not(feature = "serial"))]
fn serial_connector(_config: &Config) -> Result<Arc<dyn Connector>> {
    Err(anyhow!("built without the 'serial' feature; use --simulate"))
}

#[cfg(feature = "serial")]
async fn smoke_test(port: &str, baud: u32, timeout: u64) -> Result<i32> {
    use plmgate::plm::message::fields::*;
    use plmgate::plm::port::{start_port, MessageWriter, PortEvent, PortTuning, SerialConnector};
    use plmgate::plm::registry::MessageRegistry;
    use tokio::time::{timeout as with_timeout, Duration};

    let registry = Arc::new(MessageRegistry::standard());
    let tuning = PortTuning::default();
    let connector = Arc::new(SerialConnector {
        port_name: port.to_string(),
        baud_rate: baud,
        read_timeout: tuning.read_timeout,
    });
    info!("Starting smoke test on {} @ {} baud", port, baud);
    let (handle, tasks) = start_port(connector, registry.clone(), tuning).await?;
    let mut events = handle.subscribe();
    handle
        .write(registry.make("GetIMInfo")?)
        .map_err(|e| anyhow!("cannot send GetIMInfo: {}", e))?;

    let reply = with_timeout(Duration::from_secs(timeout), async {
        while let Some(event) = events.recv().await {
            if let PortEvent::Message(m) = event {
                if m.command_number() == 0x60 {
                    return Some(m);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    let payload = match &reply {
        Some(m) => serde_json::json!({
            "status": "ok",
            "port": port,
            "baud": baud,
            "modem_address": m.get_address(IM_ADDRESS).map(|a| a.to_string()).ok(),
            "device_category": m.get_byte(DEVICE_CATEGORY).ok(),
            "device_sub_category": m.get_byte(DEVICE_SUB_CATEGORY).ok(),
            "firmware_version": m.get_byte(FIRMWARE_VERSION).ok(),
            "timeout_seconds": timeout,
        }),
        None => serde_json::json!({
            "status": "no_reply",
            "port": port,
            "baud": baud,
            "timeout_seconds": timeout,
        }),
    };
    println!("{}", payload);
    handle.shutdown();
    for task in tasks {
        let _ = task.await;
    }
    Ok(if reply.is_some() { 0 } else { 1 })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when someone is watching
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
