//! Harcap CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use harcap::capture::CaptureSession;
use harcap::config::CaptureOptions;
use harcap::har::codec;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command = &args[1];

    let result = match command.as_str() {
        "capture" => {
            if args.len() < 4 {
                eprintln!("Usage: harcap capture <devtools-ws-url> <output.har[.gz]> [config.toml]");
                process::exit(1);
            }
            let config = args.get(4).map(PathBuf::from);
            run_capture(&args[2], &PathBuf::from(&args[3]), config.as_deref())
        }
        "stats" => {
            if args.len() < 3 {
                eprintln!("Usage: harcap stats <file.har[.gz]>");
                process::exit(1);
            }
            show_stats(&PathBuf::from(&args[2]))
        }
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'harcap' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Harcap v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: harcap <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  capture   Capture a browser page until Ctrl-C and write a HAR file");
    eprintln!("  stats     Summarize a HAR file");
    eprintln!();
    eprintln!("Files ending in .gz are read and written gzip-compressed.");
}

fn run_capture(devtools_url: &str, output: &Path, config: Option<&Path>) -> Result<()> {
    let options = match config {
        Some(path) => CaptureOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CaptureOptions::default(),
    }
    .with_devtools_url(devtools_url);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async {
        let mut session = CaptureSession::new(options)?;
        session.start().await?;
        if session.source_name() != Some("devtools") {
            anyhow::bail!("could not attach to {devtools_url}");
        }

        info!("Capturing; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;

        let cancel = CancellationToken::new();
        let stop_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop_cancel.cancel();
            }
        });

        let har = session.stop(&cancel).await?;
        let entries = har.log.entries.len();
        codec::save_async(har, output.to_path_buf(), true).await?;
        info!("Wrote {} entries to {}", entries, output.display());
        Ok(())
    })
}

fn show_stats(path: &Path) -> Result<()> {
    let har = codec::load(path).with_context(|| format!("reading {}", path.display()))?;
    let log = &har.log;

    let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();
    let mut transferred: i64 = 0;
    let mut content: i64 = 0;
    let mut failed = 0;
    for entry in &log.entries {
        *statuses.entry(entry.response.status).or_default() += 1;
        transferred += entry.response.body_size.max(0);
        content += entry.response.content.size.max(0);
        if entry.response.status == 0 {
            failed += 1;
        }
    }

    println!("Archive: {}", path.display());
    println!(
        "Creator: {} {}",
        log.creator.name, log.creator.version
    );
    if let Some(browser) = &log.browser {
        println!("Browser: {} {}", browser.name, browser.version);
    }
    println!("Pages:   {}", log.pages.len());
    println!("Entries: {} ({} failed)", log.entries.len(), failed);
    println!("Bytes:   {transferred} transferred, {content} decoded");
    println!();
    println!("Status histogram:");
    for (status, count) in &statuses {
        println!("  {status:>3}  {count}");
    }

    if let Err(e) = har.validate() {
        println!();
        println!("Warning: {e}");
    }
    Ok(())
}
