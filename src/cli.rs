use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordinator::{self, Coordinator, DownloadJob};
use crate::source::HttpSource;
use crate::store::DiskStore;

/// Options for a single download, as given on the command line.
#[derive(Debug, Default, PartialEq)]
pub struct DownloadArgs {
    pub output: Option<String>,
    pub segments: Option<usize>,
    pub verbose: bool,
}

pub fn parse_download_args(args: &[String]) -> Result<DownloadArgs> {
    let mut parsed = DownloadArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--segments" => {
                let v = args.get(i + 1).context("Missing value for --segments")?;
                let n: usize = v.parse().with_context(|| format!("Invalid segment count: '{}'", v))?;
                if n == 0 {
                    anyhow::bail!("Segment count must be at least 1");
                }
                parsed.segments = Some(n);
                i += 2;
            }
            "-o" | "--output" => {
                let v = args.get(i + 1).context("Missing value for --output")?;
                parsed.output = Some(v.clone());
                i += 2;
            }
            "-v" | "--verbose" => {
                parsed.verbose = true;
                i += 1;
            }
            other if !other.starts_with('-') && parsed.output.is_none() => {
                parsed.output = Some(other.to_string());
                i += 1;
            }
            other => anyhow::bail!("Unexpected argument: '{}'", other),
        }
    }
    Ok(parsed)
}

pub async fn run_download(
    cfg: &Config,
    url: String,
    output: PathBuf,
    segments: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let job = DownloadJob::new(url, output, segments)?;

    let source = HttpSource::new(&cfg.user_agent, cfg.connect_timeout(), cfg.read_timeout(), cfg.strict_status)
        .context("Failed to build HTTP client")?;
    let store = DiskStore::for_target(job.target());
    let segment_dir = store.dir().to_path_buf();

    eprintln!("  URL       : {}", job.url());
    eprintln!("  Output    : {}", job.target().display());
    eprintln!("  Segments  : {}", job.segments());
    eprintln!();

    let mut download = Coordinator::new(job, Arc::new(source), Arc::new(store), cancel);

    match download.run().await {
        Ok(report) => {
            let secs = report.elapsed.as_secs_f64();
            let avg = if secs > 0.1 { (report.bytes_written as f64 / secs) as u64 } else { 0 };
            eprintln!("  ✅ Download complete: {}", download.job().target().display());
            eprintln!(
                "  {} in {} segment(s), {:.2}s ({})",
                format_bytes(report.size),
                report.segments,
                secs,
                format_speed(avg),
            );
            Ok(())
        }
        Err(e) if coordinator::is_cancellation(&e) => {
            eprintln!("  Download cancelled.");
            Err(e.into())
        }
        Err(e) => {
            match e.segment() {
                Some(index) => eprintln!("  ❌ Download failed at segment #{}.", index),
                None => eprintln!("  ❌ Download failed."),
            }
            if segment_dir.exists() {
                eprintln!("  Segment buffers left in: {}", segment_dir.display());
            }
            Err(e.into())
        }
    }
}

pub fn filename_from_url(url: &str) -> String {
    extract_filename_from_url(url).unwrap_or_else(|| "download.bin".to_string())
}

/// Last path segment of the URL, decoded. The result must stay a bare file
/// name, so anything that decodes into a path is refused.
fn extract_filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.rsplit('/').next()?;
    let decoded = percent_decode(segment);
    let trimmed = decoded.trim();
    if trimmed.is_empty() || trimmed.contains("://") {
        return None;
    }
    if trimmed.contains(['/', '\\']) || trimmed == "." || trimmed == ".." {
        return None;
    }
    Some(trimmed.to_string())
}

/// Decodes `%XX` escapes. A `%` not followed by two hex digits is kept as is.
pub fn percent_decode(input: &str) -> String {
    let raw = input.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let escape = match raw.get(i + 1..i + 3) {
            Some(&[h, l]) if raw[i] == b'%' => hex_value(h).zip(hex_value(l)),
            _ => None,
        };
        match escape {
            Some((h, l)) => {
                bytes.push((h << 4) | l);
                i += 3;
            }
            None => {
                bytes.push(raw[i]);
                i += 1;
            }
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|_| input.to_string())
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 { return "-- MB/s".to_string(); }
    format!("{}/s", format_bytes_compact(bytes_per_sec))
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024; const MIB: u64 = KIB * 1024; const GIB: u64 = MIB * 1024;
    if bytes >= GIB { format!("{:.2} GiB ({} bytes)", bytes as f64 / GIB as f64, bytes) }
    else if bytes >= MIB { format!("{:.2} MiB ({} bytes)", bytes as f64 / MIB as f64, bytes) }
    else if bytes >= KIB { format!("{:.2} KiB ({} bytes)", bytes as f64 / KIB as f64, bytes) }
    else { format!("{} bytes", bytes) }
}

fn format_bytes_compact(bytes: u64) -> String {
    const KIB: f64 = 1024.0; const MIB: f64 = KIB * 1024.0; const GIB: f64 = MIB * 1024.0;
    let b = bytes as f64;
    if b >= GIB { format!("{:.2} GiB", b / GIB) }
    else if b >= MIB { format!("{:.1} MiB", b / MIB) }
    else if b >= KIB { format!("{:.1} KiB", b / KIB) }
    else { format!("{} B", bytes) }
}
