use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use frame_source::FrameSource;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Mode, Settings};
use crate::media::{StreamSupervisor, SupervisorHandle};
use crate::relay::{LocalLink, RelayClient, RelayServer};

mod api;
mod config;
mod media;
mod redirect;
mod relay;
mod ws;

type Tasks = JoinSet<anyhow::Result<()>>;

#[derive(Parser, Debug)]
#[command(version, about = "Relay a camera to WebSocket viewers")]
struct Args {
    /// YAML config file
    #[arg(short, long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Page served at `/`
    #[arg(long, default_value = "./index.html")]
    html_path: PathBuf,
}

fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("frame_source", level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    init_logging(settings.debug);
    let mode = settings.mode()?;
    log::info!("starting in {:?} mode", mode);
    if settings.debug {
        log::debug!("config:\n{}", serde_yaml::to_string(&settings)?);
    }

    frame_source::init()?;
    let cancel = CancellationToken::new();
    let mut tasks = Tasks::new();

    let capture = if mode.captures() {
        Some(start_capture(&settings, &mut tasks, &cancel).await?)
    } else {
        None
    };
    if mode.broadcasts() {
        start_broadcast(&settings, capture, &args.html_path, &mut tasks, &cancel).await?;
    }

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                break Ok(());
            },
            joined = tasks.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(anyhow::Error::new(e).context("task panicked")),
                None => break Ok(()),
            },
        }
    };

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("shutdown: {:#}", e),
            Err(e) => log::warn!("shutdown: task failed: {}", e),
        }
    }
    result
}

fn spawn_supervisor<S: FrameSource + 'static>(
    name: &str,
    source: S,
    settings: &Settings,
    tasks: &mut Tasks,
    cancel: &CancellationToken,
) -> SupervisorHandle {
    let (supervisor, handle) = StreamSupervisor::new(name, source, settings.supervisor_options());
    tasks.spawn(supervisor.run(cancel.clone()));
    handle
}

/// Camera plus, in capture-only mode, the relay server for remote broadcast
/// nodes.
async fn start_capture(
    settings: &Settings,
    tasks: &mut Tasks,
    cancel: &CancellationToken,
) -> anyhow::Result<SupervisorHandle> {
    if settings.debug {
        dump_devices();
    }
    let camera = settings.camera();
    let source = frame_source::open(&camera)
        .with_context(|| format!("open camera {}", camera.device_path))?;
    let handle = spawn_supervisor("capture", source, settings, tasks, cancel);

    if settings.mode()? == Mode::Capture {
        let server =
            RelayServer::bind(&settings.relay_listen, handle.clone(), settings.queue_capacity)
                .await?;
        tasks.spawn(server.run(cancel.clone()));
    }
    Ok(handle)
}

/// Relay link (TCP, or in-process next to a local capture supervisor) plus
/// the HTTP/WebSocket server.
async fn start_broadcast(
    settings: &Settings,
    capture: Option<SupervisorHandle>,
    html_path: &Path,
    tasks: &mut Tasks,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let supervisor = match capture {
        Some(upstream) => {
            let link = LocalLink::new(upstream, settings.queue_capacity);
            spawn_supervisor("broadcast", link, settings, tasks, cancel)
        }
        None => {
            let client = RelayClient::new(&settings.camera_addr, settings.connect_timeout());
            spawn_supervisor("broadcast", client, settings, tasks, cancel)
        }
    };

    if !html_path.is_file() {
        log::warn!("http: {} not found, `/` will answer 404", html_path.display());
    }
    let state = api::AppState {
        session: ws::SessionSettings {
            supervisor,
            queue_capacity: settings.queue_capacity,
            max_session: settings.max_session(),
        },
        advisor: settings.redirect_advisor()?.map(Arc::new),
        mode: settings.mode()?,
    };
    let listener = TcpListener::bind(&settings.broadcast_listen)
        .await
        .with_context(|| format!("http: bind {}", settings.broadcast_listen))?;
    tasks.spawn(api::serve(listener, api::router(state, html_path), cancel.clone()));
    Ok(())
}

fn dump_devices() {
    match frame_source::device::video_inputs() {
        Ok(inputs) if inputs.is_empty() => log::debug!("no video input devices found"),
        Ok(inputs) => {
            for input in inputs {
                log::debug!("video input: {}", input);
            }
        }
        Err(e) => log::debug!("listing video inputs failed: {:#}", e),
    }
}
