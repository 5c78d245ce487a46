// GelSense HILS - Command-Line Entry Point
//
//   gelsense serve                 run the HILS sync server
//   gelsense touch set X Y         move the virtual touch (setter session)
//   gelsense touch clear           lift it
//   gelsense touch get             print the current state
//   gelsense monitor --model M     calibrate, then stream decisions as JSON
//
// `monitor` stops when stdin reaches EOF.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use gelsense::classifier::ClassifierModel;
use gelsense::config::{Backend, Config, CONNECT_TIMEOUT_MS};
use gelsense::drivers::hils::HilsClient;
use gelsense::drivers::ImpedanceSource;
use gelsense::events::Point;
use gelsense::protocol::Role;
use gelsense::server::HilsServer;
use gelsense::session::InferenceSession;
use gelsense::simulation::LocalSimulator;
use gelsense::tasks;

#[derive(Parser)]
#[command(name = "gelsense", version, about = "Ionic-gel touch sensing HILS toolkit")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `server.port`.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the synchronization server.
    Serve,
    /// Drive the shared touch state as a setter.
    Touch {
        #[command(subcommand)]
        action: TouchAction,
    },
    /// Run the inference pipeline and print events as JSON lines.
    Monitor {
        /// Model bundle (JSON).
        #[arg(short, long)]
        model: PathBuf,

        /// Overrides `backend`.
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Fixed touch position for the local backend.
        #[arg(long, num_args = 2, value_names = ["X", "Y"])]
        at: Option<Vec<f64>>,
    },
}

#[derive(Subcommand)]
enum TouchAction {
    Set { x: f64, y: f64 },
    Clear,
    Get,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    Local,
    Hils,
    Hardware,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => Backend::Local,
            BackendArg::Hils => Backend::Hils,
            BackendArg::Hardware => Backend::Hardware,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command {
        Command::Serve => serve(&config),
        Command::Touch { action } => touch(&config, action),
        Command::Monitor {
            model,
            backend,
            at,
        } => {
            if let Some(b) = backend {
                config.backend = b.into();
            }
            let at = at.map(|v| Point::new(v[0], v[1]));
            monitor(&config, &model, at)
        }
    }
}

fn serve(config: &Config) -> anyhow::Result<()> {
    let server = HilsServer::bind(config)
        .with_context(|| format!("binding {}", config.server.address()))?;
    server.run(Arc::new(AtomicBool::new(false)))?;
    Ok(())
}

fn touch(config: &Config, action: TouchAction) -> anyhow::Result<()> {
    let mut client = HilsClient::connect(
        &config.server.address(),
        Role::Setter,
        Some("gelsense-cli".into()),
        Duration::from_millis(CONNECT_TIMEOUT_MS),
    )
    .with_context(|| format!("connecting to {}", config.server.address()))?;

    match action {
        TouchAction::Set { x, y } => {
            let version = client.set_touch(x, y)?;
            log::info!("Touch at ({x}, {y}) committed as v{version}");
        }
        TouchAction::Clear => {
            let version = client.clear_touch()?;
            log::info!("Touch cleared as v{version}");
        }
        TouchAction::Get => {
            let state = client.get_state()?;
            println!("{}", serde_json::to_string(&state)?);
        }
    }
    Ok(())
}

fn open_source(config: &Config, at: Option<Point>) -> anyhow::Result<Box<dyn ImpedanceSource>> {
    match config.backend {
        Backend::Local => {
            let mut sim = LocalSimulator::new(&config.simulation);
            if at.is_some() {
                sim.set_touch(at);
            }
            Ok(Box::new(sim))
        }
        Backend::Hils => {
            let client = HilsClient::connect(
                &config.server.address(),
                Role::Consumer,
                Some("gelsense-monitor".into()),
                Duration::from_millis(config.inference.measure_timeout_ms),
            )
            .with_context(|| format!("connecting to {}", config.server.address()))?;
            Ok(Box::new(client))
        }
        Backend::Hardware => anyhow::bail!(
            "hardware backend needs an impedance analyzer integration; none is linked into this build"
        ),
    }
}

fn monitor(config: &Config, model_path: &Path, at: Option<Point>) -> anyhow::Result<()> {
    let model = Arc::new(ClassifierModel::load(model_path)?);
    let source = open_source(config, at)?;
    let session = InferenceSession::new(source, model, &config.inference, config.sweep)?;

    let (event_tx, event_rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));

    // Stdin EOF cancels the loop.
    let stdin_cancel = Arc::clone(&cancel);
    thread::Builder::new().name("stdin".into()).spawn(move || {
        let _ = io::stdin().read_to_end(&mut Vec::new());
        log::info!("stdin closed, stopping");
        stdin_cancel.store(true, Ordering::Relaxed);
    })?;

    let period = Duration::from_millis(config.inference.period_ms);
    let inference_cancel = Arc::clone(&cancel);
    let handle = thread::Builder::new()
        .name("inference".into())
        .spawn(move || tasks::inference::inference_task(session, event_tx, inference_cancel, period))?;

    for event in event_rx {
        println!("{}", serde_json::to_string(&event)?);
    }

    let session = handle
        .join()
        .map_err(|_| anyhow::anyhow!("inference thread panicked"))?;
    log::info!("Monitor finished in {:?}", session.state());
    Ok(())
}
