use std::path::PathBuf;
use std::sync::Arc;

use tracksheet_engine::hosts;
use tracksheet_engine::http;
use tracksheet_engine::runner::{self, RunControl, RunOptions, StatusSink};
use tracksheet_engine::sheet;
use tracksheet_engine::ytdlp::OutputProfile;

struct StdoutSink;

impl StatusSink for StdoutSink {
    fn report(&self, line: &str) {
        println!("{line}");
    }
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut sheet_url: Option<String> = None;
    let mut options = RunOptions::default();
    let mut gid: Option<String> = None;
    let mut list_tabs = false;
    let mut dry_run = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--out" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--out requires a value".to_string())?;
                options.output_root = PathBuf::from(v);
            }
            "--tab" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--tab requires a value".to_string())?;
                gid = Some(v.to_string());
            }
            "--profile" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--profile requires a value".to_string())?;
                let profile = OutputProfile::parse(v)
                    .ok_or_else(|| format!("unknown profile: {v} (try --help)"))?;
                options.ytdlp.youtube_profile = profile;
                options.ytdlp.soundcloud_profile = profile;
            }
            "--no-covers" => options.download_covers = false,
            "--no-metadata" => options.save_metadata = false,
            "--zip" => options.zip_when_done = true,
            "--list-tabs" => list_tabs = true,
            "--dry-run" => dry_run = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown arg: {other} (try --help)"));
            }
            other => {
                if sheet_url.is_some() {
                    return Err(format!("unexpected extra argument: {other}"));
                }
                sheet_url = Some(other.to_string());
            }
        }
        i += 1;
    }

    let sheet_url = sheet_url.ok_or_else(|| "a sheet url is required (try --help)".to_string())?;

    if list_tabs {
        return print_tabs(&sheet_url);
    }
    if dry_run {
        return print_plan(&sheet_url, gid.as_deref(), &options);
    }

    let control = Arc::new(RunControl::new());
    let handle = control.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("cancel requested, finishing the current chunk...");
        handle.cancel();
    })
    .map_err(|e| format!("could not install the interrupt handler: {e}"))?;

    let summary = runner::run_sheet(&sheet_url, gid.as_deref(), &options, &control, &StdoutSink)
        .map_err(|e| e.to_string())?;

    if !summary.failures.is_empty() {
        println!();
        println!("failed downloads:");
        for failure in &summary.failures {
            println!("  {} <{}>: {}", failure.title, failure.url, failure.error);
        }
    }
    if summary.canceled {
        return Err("run canceled".to_string());
    }
    Ok(())
}

fn print_tabs(sheet_url: &str) -> Result<(), String> {
    let agent = http::build_http_agent(http::PAGE_TIMEOUT_SECS);
    let sheet_id = sheet::extract_sheet_id(sheet_url)
        .ok_or_else(|| format!("not a sheet url: {sheet_url}"))?;
    let tabs = sheet::fetch_sheet_tabs(&agent, &sheet_id);
    if tabs.is_empty() {
        println!("no tabs discovered (the sheet may not be public)");
        return Ok(());
    }
    for tab in tabs {
        println!("{}\t{}", tab.gid, tab.title);
    }
    Ok(())
}

fn print_plan(sheet_url: &str, gid: Option<&str>, options: &RunOptions) -> Result<(), String> {
    let agent = http::build_http_agent(http::PAGE_TIMEOUT_SECS);
    let data = sheet::load_sheet(&agent, sheet_url, gid).map_err(|e| e.to_string())?;

    println!("sheet: {}", data.title);
    println!("rows:  {}", data.tracks.len());
    for warning in &data.warnings {
        println!("note:  {warning}");
    }

    let jobs = runner::plan_jobs(&data, options);
    println!("jobs:  {}", jobs.len());
    for (index, job) in jobs.iter().enumerate() {
        let (kind, _) = hosts::select_host(&job.source_url);
        println!("[{}] {}", index + 1, job.title);
        println!("    type: {}, url: {}", kind.label(), job.source_url);
        println!("    into: {}", job.target_folder.display());
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"tracksheet_fetch

Downloads every track linked from a public Google Sheets tracker into an
organized local folder tree, with per-track metadata and cover art.

Usage:
  cargo run --bin tracksheet_fetch -- <sheet-url>
  cargo run --bin tracksheet_fetch -- <sheet-url> --out ./music --zip
  cargo run --bin tracksheet_fetch -- <sheet-url> --list-tabs

Options:
  --out <dir>        Output root folder (default: ./downloads)
  --tab <gid>        Download a specific sheet tab instead of the default one
  --profile <name>   yt-dlp output profile for YouTube/SoundCloud links:
                     audio_m4a, audio_mp3, video_mp4, video_best
  --no-covers        Skip cover art downloads
  --no-metadata      Skip the per-track metadata text files
  --zip              Pack the finished sheet folder into a zip archive
  --list-tabs        Print the sheet's tabs (gid and title) and exit
  --dry-run          Parse the sheet and print the planned jobs, no downloads
"#
    );
}
