mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use futures::StreamExt;
use std::path::Path;

use th_core::config::Config;
use th_server::reader::{self, Source};
use th_ts::{pts_delta, DemuxEvent, Demuxer, PacketSync, ProgramSelection, PTS_CLOCK_HZ};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "tunehls=trace,th_server=trace,th_hls=trace,th_ts=debug,th_core=debug".to_string()
        } else {
            "tunehls=info,th_server=info,th_hls=info,th_ts=warn,th_core=info".to_string()
        }
    });

    // Logs go to stderr so `inspect --json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref());
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(
                "Starting tunehls {} on {}:{}",
                env!("CARGO_PKG_VERSION"),
                config.server.host,
                config.server.port
            );
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(th_server::start(config))
                .context("server exited with an error")
        }
        Commands::Inspect {
            source,
            max_bytes,
            json,
        } => {
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(inspect(&source, max_bytes, json, &config))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("tunehls {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// What `inspect` learned about a stream.
#[derive(Debug, Default)]
struct InspectReport {
    bytes: u64,
    selections: Vec<ProgramSelection>,
    video_units: u64,
    audio_units: u64,
    keyframes: u64,
    first_pts: Option<u64>,
    last_pts: Option<u64>,
    /// Sum of forward PTS steps, so wraparound does not break the span.
    span_ticks: u64,
}

impl InspectReport {
    fn record(&mut self, event: DemuxEvent) {
        match event {
            DemuxEvent::ProgramReady(selection) => self.selections.push(selection),
            DemuxEvent::VideoUnit { pts, keyframe } => {
                self.video_units += 1;
                if keyframe {
                    self.keyframes += 1;
                }
                if let Some(pts) = pts {
                    if let Some(last) = self.last_pts {
                        let step = pts_delta(last, pts);
                        // Backward steps show up as huge deltas; skip them.
                        if step < 60 * PTS_CLOCK_HZ {
                            self.span_ticks += step;
                        }
                    }
                    self.first_pts.get_or_insert(pts);
                    self.last_pts = Some(pts);
                }
            }
            DemuxEvent::AudioUnit { .. } => self.audio_units += 1,
            DemuxEvent::VideoUnitStart => {}
        }
    }

    fn span_secs(&self) -> f64 {
        self.span_ticks as f64 / PTS_CLOCK_HZ as f64
    }
}

async fn inspect(source: &str, max_bytes: Option<u64>, json: bool, config: &Config) -> Result<()> {
    let source = Source::parse(source)?;
    let mut stream = reader::open(&source, &config.source)
        .await
        .with_context(|| format!("Failed to open {}", source.describe()))?;

    let mut sync = PacketSync::new();
    let mut demux = Demuxer::new();
    let mut events = Vec::new();
    let mut report = InspectReport::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read {}", source.describe()))?;
        report.bytes += chunk.len() as u64;
        sync.push(&chunk, |packet| {
            demux.push(&packet, &mut events);
            for event in events.drain(..) {
                report.record(event);
            }
        });
        if max_bytes.is_some_and(|max| report.bytes >= max) {
            break;
        }
    }

    sync.finish(|packet| {
        demux.push(&packet, &mut events);
        for event in events.drain(..) {
            report.record(event);
        }
    });
    demux.flush(&mut events);
    for event in events.drain(..) {
        report.record(event);
    }

    let stats = sync.stats();

    if json {
        let selections: Vec<_> = report
            .selections
            .iter()
            .map(|s| {
                serde_json::json!({
                    "video_pid": s.video_pid,
                    "audio_pid": s.audio_pid,
                    "h264": s.is_h264,
                })
            })
            .collect();
        let out = serde_json::json!({
            "source": source.describe(),
            "bytes": report.bytes,
            "packets": stats.packets,
            "dropped_bytes": stats.dropped_bytes,
            "resyncs": stats.resyncs,
            "adaptation_overruns": stats.adaptation_overruns,
            "programs": selections,
            "video_units": report.video_units,
            "audio_units": report.audio_units,
            "keyframes": report.keyframes,
            "first_pts": report.first_pts,
            "last_pts": report.last_pts,
            "duration_secs": report.span_secs(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Source: {}", source.describe());
    println!("Bytes: {}", report.bytes);
    println!(
        "Packets: {} ({} bytes dropped, {} resyncs)",
        stats.packets, stats.dropped_bytes, stats.resyncs
    );
    if report.selections.is_empty() {
        println!("Program: none found");
    }
    for selection in &report.selections {
        let codec = if selection.is_h264 { "H.264" } else { "MPEG-2" };
        print!("Program: video PID {:#06x} ({codec})", selection.video_pid);
        match selection.audio_pid {
            Some(pid) => println!(", audio PID {pid:#06x}"),
            None => println!(", no audio"),
        }
    }
    println!(
        "Units: {} video ({} keyframes), {} audio",
        report.video_units, report.keyframes, report.audio_units
    );
    match (report.first_pts, report.last_pts) {
        (Some(first), Some(last)) => println!(
            "PTS: {first} .. {last} ({:.3}s)",
            report.span_secs()
        ),
        _ => println!("PTS: none"),
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let config = Config::load(p)
                .with_context(|| format!("Failed to load {}", p.display()))?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!(
        "  HLS: {}s target, window {}, keyframe aligned: {}",
        config.hls.target_duration_secs, config.hls.window_size, config.hls.keyframe_aligned
    );
    println!("  Session work dir: {}", config.session.work_dir().display());
    println!("  Channels: {}", config.channels.len());
    for channel in &config.channels {
        match &channel.name {
            Some(name) => println!("    {} ({name}) -> {}", channel.id, channel.url),
            None => println!("    {} -> {}", channel.id, channel.url),
        }
    }

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}
