use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fbcast_capture::sink::{FileSink, FramebufferSink, FrameSink};
use fbcast_capture::stream::CaptureSession;
use fbcast_capture::v4l2::{discover_devices, V4l2Device};
use fbcast_core::CancelToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "fbcast")]
#[command(about = "Stream a multi-planar capture device to a framebuffer or file")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SinkKind {
    /// Framebuffer-style device, rewound before every frame
    Fb,
    /// Regular file holding the latest frame
    File,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture device nodes
    List,

    /// Capture, convert and stream frames until interrupted
    Stream {
        /// Capture device node
        #[arg(short, long, default_value = "/dev/video0")]
        device: PathBuf,

        /// Output path (framebuffer device or file)
        #[arg(short, long, default_value = "/dev/fb0")]
        output: PathBuf,

        /// How the output path is written
        #[arg(long, value_enum, default_value_t = SinkKind::Fb)]
        sink: SinkKind,

        /// Number of ring buffers to request
        #[arg(short, long, default_value_t = 4)]
        buffers: u32,

        /// Readiness wait bound in milliseconds
        #[arg(long, default_value_t = 2000)]
        wait_timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::List => list_devices(),
        Commands::Stream {
            device,
            output,
            sink,
            buffers,
            wait_timeout_ms,
        } => match sink {
            SinkKind::Fb => {
                let sink = FramebufferSink::open(&output)
                    .with_context(|| format!("opening sink {}", output.display()))?;
                stream(device, sink, buffers, wait_timeout_ms)
            }
            SinkKind::File => {
                let sink = FileSink::create(&output)
                    .with_context(|| format!("creating sink {}", output.display()))?;
                stream(device, sink, buffers, wait_timeout_ms)
            }
        },
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = discover_devices();
    if devices.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }
    for device in devices {
        println!("{}", device.display());
    }
    Ok(())
}

fn stream<S: FrameSink>(
    device_path: PathBuf,
    sink: S,
    buffers: u32,
    wait_timeout_ms: u64,
) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .context("installing interrupt handler")?;

    let device = V4l2Device::open(&device_path)
        .with_context(|| format!("opening device {}", device_path.display()))?;

    let mut session = CaptureSession::new(device, sink, cancel)
        .with_wait_timeout(Duration::from_millis(wait_timeout_ms));

    session.negotiate(buffers).context("negotiation failed")?;
    session.start().context("stream start failed")?;

    // Keep the streaming-phase error until after teardown so the mappings
    // are released even when the loop aborts.
    let run_result = session.run().context("streaming failed");
    let stop_result = session.stop().context("teardown failed");

    let frames = run_result?;
    stop_result?;
    info!(frames, "capture finished");
    Ok(())
}
