//! Time-tagger capture - command line entry point
//!
//! Connects to the acquisition peer (or the built-in simulator), starts
//! capture and periodically reports per-channel statistics.

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{after, select, tick};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timetag_capture::{
    config::CaptureConfig,
    consumers::{ConsumerConfig, ManagedConsumer},
    pipeline::{CapturePipeline, OutputRegistry, PipelineEvent},
    ControlBackend,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(version, about = "Capture binned photon counts from a time tagger")]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket of the acquisition peer
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Use the built-in simulated tagger
    #[arg(long)]
    simulate: bool,

    /// Capture bin time in seconds
    #[arg(short, long)]
    bin_time: Option<f64>,

    /// Bins kept per channel
    #[arg(short, long)]
    points: Option<usize>,

    /// Also record the raw bin stream to this file
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Seconds between statistics reports
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Attach the histogram, FRET and correlator consumers
    #[arg(long)]
    consumers: bool,

    /// Print statistics as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging(config: &CaptureConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,timetag_capture=debug"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &config.logging.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file {:?}", path))?;
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => CaptureConfig::load_or_default(),
    };
    if let Some(socket) = &args.socket {
        config.control.socket_path = socket.clone();
    }
    if args.simulate {
        config.control.backend = ControlBackend::Simulated;
    }
    if let Some(bin_time) = args.bin_time {
        config.binner.bin_time = bin_time;
    }
    if let Some(points) = args.points {
        config.buffer.points = points;
    }
    config.validate()?;
    Ok(config)
}

fn report(pipeline: &CapturePipeline, json: bool) {
    let stats = pipeline.stats();
    if json {
        match serde_json::to_string(&stats) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode stats: {}", e),
        }
        return;
    }
    println!("t = {:.3} s", pipeline.time_cursor());
    for s in &stats {
        println!(
            "  channel {:>2}: {:>10} photons, {:>6} lost, last bin {:.3} s",
            s.channel, s.photon_count, s.loss_count, s.latest_timestamp
        );
    }
}

fn report_consumers(consumers: &[ManagedConsumer]) {
    for consumer in consumers {
        match consumer {
            ManagedConsumer::Histogram(m) => {
                for (channel, buckets) in m.consumer().histograms() {
                    tracing::info!("Histogram channel {}: {} buckets", channel, buckets.len());
                }
            }
            ManagedConsumer::Fret(m) => {
                tracing::info!(
                    "FRET: {} pairs in {} buckets",
                    m.consumer().state().pair_count(),
                    m.consumer().histogram().len()
                );
            }
            ManagedConsumer::Correlator(m) => {
                if let Some(corr) = m.consumer().correlate(10) {
                    tracing::info!(
                        "Correlation over {} samples: g(0) = {:.4}",
                        corr.sample_count,
                        corr.values.first().copied().unwrap_or_default()
                    );
                }
            }
            ManagedConsumer::Buffer(_) => {}
        }
    }
}

fn run(args: &Args, pipeline: &Arc<CapturePipeline>) -> anyhow::Result<()> {
    let events = pipeline.subscribe();
    pipeline.start().context("Failed to start pipeline")?;

    let mut consumers = Vec::new();
    if args.consumers {
        let settings = &pipeline.config().consumers;
        let registry: Arc<dyn OutputRegistry> = pipeline.clone();
        for config in ConsumerConfig::all(settings, pipeline.config().buffer.points) {
            let consumer =
                ManagedConsumer::build(Arc::clone(&registry), config, settings.poll_period())?;
            consumer.watch()?;
            consumers.push(consumer);
        }
    }

    if let Some(path) = &args.record {
        pipeline.start_recording(path)?;
        tracing::info!("Recording to {:?}", path);
    }
    pipeline.start_capture()?;

    let ticker = tick(Duration::from_secs_f64(args.interval.max(0.05)));
    let deadline = match args.duration {
        Some(secs) => after(Duration::from_secs_f64(secs.max(0.0))),
        None => crossbeam_channel::never(),
    };

    let outcome = loop {
        select! {
            recv(ticker) -> _ => {
                report(pipeline, args.json);
                report_consumers(&consumers);
            }
            recv(deadline) -> _ => {
                tracing::info!("Capture duration elapsed");
                break Ok(());
            }
            recv(events) -> event => match event {
                Ok(PipelineEvent::Failed(reason)) => {
                    break Err(anyhow::anyhow!("Pipeline failed: {}", reason));
                }
                Ok(PipelineEvent::Stopped) | Err(_) => break Ok(()),
                Ok(_) => {}
            },
        }
    };

    for consumer in &consumers {
        consumer.unwatch();
        if let Err(e) = consumer.managed().stop_binner() {
            tracing::warn!("Failed to stop {}: {}", consumer.managed().id(), e);
        }
    }
    if pipeline.is_started() {
        if args.record.is_some() {
            pipeline.stop_recording()?;
        }
        report(pipeline, args.json);
        pipeline.stop()?;
    }
    outcome
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _guard = init_logging(&config)?;

    tracing::info!(
        "Starting capture ({} backend, bin time {} s)",
        config.control.backend,
        config.binner.bin_time
    );

    let pipeline = Arc::new(CapturePipeline::new(config)?);
    let result = run(&args, &pipeline);
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }

    tracing::info!("Shutting down...");
    result
}
