//! CLI command implementations

use crate::output::{timestamp, to_json, OutputFormat};
use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabled::{Table, Tabled};
use tracing::{debug, error, info, warn};
use url::Url;
use zeromux_core::sink::MemorySinkStats;
use zeromux_core::{
    cache_bust, open_stream, Collaborators, HttpTransport, MemorySink, Metadata,
    PassthroughRemuxer, StreamArgs, StreamerConfig, Transport,
};

const CLOCK_STEP: Duration = Duration::from_millis(100);

/// Load a streamer configuration, falling back to defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<StreamerConfig> {
    let Some(path) = path else {
        return Ok(StreamerConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = StreamerConfig::from_json(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    debug!(path = %path.display(), "Loaded streamer config");
    Ok(config)
}

#[derive(Debug, Serialize, Tabled)]
struct SegmentRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Start")]
    start: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "URL")]
    url: String,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    metadata_url: String,
    segments: usize,
    duration: f64,
    entries: Vec<SegmentRow>,
}

/// Download and decode a segment index
pub async fn probe(metadata_url: &str, config: &StreamerConfig, format: &str) -> anyhow::Result<()> {
    let url = Url::parse(metadata_url)?;
    let transport = HttpTransport::new(config.request_timeout())?;

    let text = transport
        .fetch_text(&cache_bust(&url), "application/json")
        .await?;
    let metadata = Metadata::parse(&text)?;
    let descriptors = metadata.segments.resolve(&url)?;
    info!(url = %url, segments = descriptors.len(), "Segment index decoded");

    let report = ProbeReport {
        metadata_url: url.to_string(),
        segments: descriptors.len(),
        duration: metadata.segments.duration(),
        entries: descriptors
            .iter()
            .map(|d| SegmentRow {
                index: d.index,
                start: timestamp(d.start),
                duration: format!("{:.3}s", d.duration),
                url: d.url.to_string(),
            })
            .collect(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(&report)),
        OutputFormat::Text => {
            println!("{} {}", style("Segment index:").bold(), report.metadata_url);
            println!("  Segments: {}", report.segments);
            println!("  Duration: {}", timestamp(report.duration));
            if !report.entries.is_empty() {
                println!("\n{}", Table::new(&report.entries));
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct PlayReport {
    session_id: String,
    playback_url: String,
    position: f64,
    segments_fed: usize,
    complete: bool,
    failure: Option<String>,
    sink: MemorySinkStats,
}

/// Bootstrap a stream and play it against an in-memory sink
pub async fn play(
    metadata_url: &str,
    header_url: &str,
    codec: &str,
    seconds: u64,
    config: StreamerConfig,
    format: &str,
) -> anyhow::Result<()> {
    let format = OutputFormat::from(format);
    let args = StreamArgs::new(Url::parse(metadata_url)?, Url::parse(header_url)?, codec);
    let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
    let collaborators =
        Collaborators::new(transport, Arc::new(PassthroughRemuxer::engine())).with_config(config);
    let sink = MemorySink::default();

    let session = match open_stream(args, Arc::new(sink.clone()), collaborators).await {
        Ok(session) => session,
        Err(e) => {
            error!(code = e.error_code(), error = %e, "Stream bootstrap failed");
            match format {
                OutputFormat::Json => println!("{}", to_json(&e.envelope())),
                OutputFormat::Text => eprintln!("{} {}", style("error:").red().bold(), e),
            }
            std::process::exit(1);
        }
    };

    info!(session_id = %session.id(), url = session.playback_url(), seconds, "Playback started");
    if format == OutputFormat::Text {
        println!(
            "[{}] {} {}",
            chrono::Utc::now().format("%H:%M:%S"),
            style("Playing").green().bold(),
            session.playback_url()
        );
    }

    let target = seconds as f64;
    let bar = match format {
        OutputFormat::Text => ProgressBar::new(seconds * 10),
        OutputFormat::Json => ProgressBar::hidden(),
    };
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {msg}")?.progress_chars("=> "),
    );

    sink.play();
    let mut last = Instant::now();
    loop {
        tokio::time::sleep(CLOCK_STEP).await;
        let now = Instant::now();
        let position = sink.tick((now - last).as_secs_f64());
        last = now;

        let ahead = session.buffered_ranges().buffered_ahead(position);
        bar.set_position((position.min(target) * 10.0) as u64);
        bar.set_message(format!("{} (+{:.1}s buffered)", timestamp(position), ahead));

        if position >= target || session.failure().is_some() {
            break;
        }
        if session.is_complete() && ahead <= f64::EPSILON {
            break;
        }
    }
    bar.finish_and_clear();
    sink.pause();

    let report = PlayReport {
        session_id: session.id().to_string(),
        playback_url: session.playback_url().to_string(),
        position: session.current_position(),
        segments_fed: session.segments_fed(),
        complete: session.is_complete(),
        failure: session.failure(),
        sink: sink.stats(),
    };
    session.close();
    match &report.failure {
        Some(failure) => warn!(session_id = %report.session_id, failure = %failure, "Playback stopped on a feed failure"),
        None => info!(
            session_id = %report.session_id,
            position = report.position,
            segments = report.segments_fed,
            "Playback finished"
        ),
    }

    match format {
        OutputFormat::Json => println!("{}", to_json(&report)),
        OutputFormat::Text => {
            println!("\n{}", style("Playback summary:").bold());
            println!("  Position: {}", timestamp(report.position));
            println!("  Segments fed: {}", report.segments_fed);
            println!("  Chunks appended: {}", report.sink.appended_chunks);
            println!("  Bytes buffered: {}", report.sink.bytes_used);
            println!("  Seconds buffered: {:.1}", report.sink.buffered.total());
            for range in report.sink.buffered.iter() {
                println!("  Buffered: {} - {}", timestamp(range.start), timestamp(range.end));
            }
            if let Some(failure) = &report.failure {
                println!("  {} {}", style("Failed:").red().bold(), failure);
            }
        }
    }

    if report.failure.is_some() {
        std::process::exit(1);
    }
    Ok(())
}
