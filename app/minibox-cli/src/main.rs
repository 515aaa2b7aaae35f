//! minibox - a minimal educational container runtime.
//!
//! Pulls a Docker-V2 image, assembles its layers into an overlayfs
//! rootfs, and runs a command inside fresh namespaces behind a
//! veth-attached network interface.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use minibox_container::{child, launcher};
use minibox_image::{pull_image, ImageRef, LayerStore, RegistryClient, DEFAULT_REGISTRY};
use minibox_net::NetConfig;

#[derive(Parser)]
#[command(name = "minibox", version, about = "Minimal educational container runtime")]
struct Cli {
    /// Name of the container; keys the containers/ directory
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Image to run, Docker naming compatible (e.g. busybox:latest)
    #[arg(short = 'i', long = "image")]
    image: String,

    /// Location of image and container files
    #[arg(short = 'd', long = "data-dir", default_value = "/tmp/minibox")]
    data_dir: PathBuf,

    /// Command to run inside the container
    #[arg(short = 'c', long = "command", default_value = "/bin/sh")]
    command: String,

    /// Use http toward the registry
    #[arg(long = "http")]
    http: bool,

    /// Only download and mount the filesystem; do not launch
    #[arg(short = 'o', long = "fs-only")]
    fs_only: bool,
}

fn main() -> ExitCode {
    // The cloned container process re-executes this binary under a
    // sentinel first argument; dispatch before any flag parsing.
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).is_some_and(|a| a == launcher::CHILD_SENTINEL) {
        return child_entry(&args);
    }

    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "minibox=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Entry point for the re-executed in-namespace child.
fn child_entry(args: &[String]) -> ExitCode {
    init_tracing();

    let Some(child_args) = child::parse_argv(args) else {
        error!("malformed {} invocation", launcher::CHILD_SENTINEL);
        return ExitCode::FAILURE;
    };

    match child::child_main(&child_args, &NetConfig::default(), child::DEFAULT_HOSTNAME) {
        Ok(never) => match never {},
        Err(err) => {
            error!("container init failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let store = LayerStore::new(&cli.data_dir).context("initializing storage root")?;
    let image = ImageRef::parse(&cli.image, DEFAULT_REGISTRY)?;
    info!(image = %image, "resolved image reference");

    // The pull phase is the only async portion; the runtime is dropped
    // before any clone happens.
    let manifest = {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("building tokio runtime")?;
        let client = RegistryClient::new(&image.registry, cli.http);
        runtime.block_on(pull_image(&client, &store, &image))?
    };

    let rootfs = store.mount_overlay(&manifest, &cli.name)?;

    if cli.fs_only {
        info!(rootfs = %rootfs.display(), "filesystem-only mode, not launching");
        return Ok(());
    }

    let result = launch(&rootfs, &cli.command);

    if let Err(err) = LayerStore::unmount(&rootfs) {
        warn!(rootfs = %rootfs.display(), "unmount failed: {err}");
    }

    result
}

/// Clones the container, wires its network, releases it, and waits.
fn launch(rootfs: &Path, command: &str) -> Result<()> {
    let (container, gate) = launcher::spawn(rootfs, command)?;
    info!(pid = container.pid(), command = %container.command, "container cloned");

    if let Err(err) = minibox_net::host_setup(&NetConfig::default(), container.pid()) {
        // Dropping the gate closes the pipe; the child sees EOF and
        // exits before touching its namespaces.
        drop(gate);
        let _ = container.wait();
        return Err(err).context("host-side network setup");
    }

    gate.release()?;

    let status = container.wait()?;
    if status != 0 {
        bail!("container exited with status {status}");
    }
    Ok(())
}
