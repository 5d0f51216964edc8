//! Sequential download runs.
//!
//! The runner turns a parsed sheet into an ordered job list, executes it one
//! job at a time against the host strategies, and handles the per-row
//! follow-ups (cover art, the metadata text file) plus the optional archive
//! at the end. Progress goes to a [`StatusSink`]; machine-readable events go
//! to a JSONL run log under the output root.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::archive;
use crate::error::{EngineError, Result};
use crate::hosts::{self, FetchContext};
use crate::http;
use crate::paths::{self, OutputLayout};
use crate::sheet::{SheetData, Track};
use crate::ytdlp::YtdlpConfig;

const PAUSE_POLL_MS: u64 = 250;

/// Cooperative cancel/pause token shared with whoever drives the run.
/// Cancel is sticky and checked both between jobs and inside streaming
/// loops; pause only holds the runner between jobs.
#[derive(Debug, Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Receives human-readable progress lines as the run advances.
pub trait StatusSink {
    fn report(&self, line: &str);
}

/// Discards all progress; for callers that only want the summary.
pub struct NullSink;

impl StatusSink for NullSink {
    fn report(&self, _line: &str) {}
}

/// One URL to fetch into one folder. `prefer_remote_name` is set for jobs
/// whose title is only a positional placeholder, so the host's own filename
/// wins when one is learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub source_url: String,
    pub target_folder: PathBuf,
    pub title: String,
    pub artist: String,
    pub prefer_remote_name: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub output_root: PathBuf,
    pub save_metadata: bool,
    pub download_covers: bool,
    pub zip_when_done: bool,
    pub ytdlp: YtdlpConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("downloads"),
            save_metadata: true,
            download_covers: true,
            zip_when_done: false,
            ytdlp: YtdlpConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedJob {
    pub title: String,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub canceled: bool,
    pub failures: Vec<FailedJob>,
    pub saved_files: Vec<PathBuf>,
    pub archive_path: Option<PathBuf>,
}

/// One sheet row's share of the run: the folder its files land in, the jobs
/// for each link in its URL cell, and the row it came from (absent for
/// unpaired embedded links).
#[derive(Debug)]
pub struct TrackPlan {
    pub row: Option<usize>,
    pub folder: PathBuf,
    pub jobs: Vec<DownloadJob>,
}

/// Expands a parsed sheet into per-row plans. Rows without links are skipped
/// outright; rows with several links get a ` (Link N)` suffix on every one
/// so the files sort together.
pub fn plan_track_jobs(sheet: &SheetData, options: &RunOptions) -> Vec<TrackPlan> {
    let layout = OutputLayout::new(options.output_root.clone());

    if sheet.embedded_mode() {
        return plan_embedded_jobs(sheet, &layout);
    }

    let mut plans = Vec::new();
    for (index, track) in sheet.tracks.iter().enumerate() {
        if track.urls.is_empty() {
            continue;
        }
        let folder = layout.track_dir(&sheet.title, Some(&track.album));
        let multiple = track.urls.len() > 1;
        let jobs = track
            .urls
            .iter()
            .enumerate()
            .map(|(link_index, url)| DownloadJob {
                source_url: url.clone(),
                target_folder: folder.clone(),
                title: if multiple {
                    format!("{} (Link {})", track.title, link_index + 1)
                } else {
                    track.title.clone()
                },
                artist: track.artist.clone(),
                prefer_remote_name: false,
            })
            .collect();
        plans.push(TrackPlan {
            row: Some(index),
            folder,
            jobs,
        });
    }
    plans
}

/// Embedded links are positional. When the link count matches the row count
/// the rows lend their titles and folders; otherwise every link becomes a
/// numbered placeholder in the sheet folder and keeps the host's filename.
fn plan_embedded_jobs(sheet: &SheetData, layout: &OutputLayout) -> Vec<TrackPlan> {
    let links = &sheet.embedded_links;
    let paired = !sheet.tracks.is_empty() && sheet.tracks.len() == links.len();

    links
        .iter()
        .enumerate()
        .map(|(index, url)| {
            let (row, folder, title, artist) = if paired {
                let track = &sheet.tracks[index];
                (
                    Some(index),
                    layout.track_dir(&sheet.title, Some(&track.album)),
                    track.title.clone(),
                    track.artist.clone(),
                )
            } else {
                (
                    None,
                    layout.sheet_dir(&sheet.title),
                    format!("Track {}", index + 1),
                    sheet.title.clone(),
                )
            };
            TrackPlan {
                row,
                folder: folder.clone(),
                jobs: vec![DownloadJob {
                    source_url: url.clone(),
                    target_folder: folder,
                    title,
                    artist,
                    prefer_remote_name: !paired,
                }],
            }
        })
        .collect()
}

/// Flat job list in run order.
pub fn plan_jobs(sheet: &SheetData, options: &RunOptions) -> Vec<DownloadJob> {
    plan_track_jobs(sheet, options)
        .into_iter()
        .flat_map(|plan| plan.jobs)
        .collect()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One JSON object per line under `<output_root>/logs/<run_id>.jsonl`.
/// Logging never interferes with the run; write failures are dropped.
struct RunLog {
    run_id: String,
    path: Option<PathBuf>,
}

impl RunLog {
    fn create(output_root: &Path) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let dir = output_root.join("logs");
        let path = match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir.join(format!("{run_id}.jsonl"))),
            Err(_) => None,
        };
        Self { run_id, path }
    }

    fn event(&self, level: &str, event: &str, data: Value) {
        let Some(path) = &self.path else {
            return;
        };
        let line = json!({
            "ts_ms": now_ms(),
            "run_id": self.run_id,
            "level": level,
            "event": event,
            "data": data,
        });
        let Ok(mut file) = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
        else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

/// Blocks while paused. Returns true when the run is (or becomes) cancelled.
fn wait_if_paused(control: &RunControl) -> bool {
    loop {
        if control.is_cancelled() {
            return true;
        }
        if !control.is_paused() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(PAUSE_POLL_MS));
    }
}

/// One attempt plus a single retry. Cancellation is never retried.
fn run_single_job(job: &DownloadJob, ctx: &FetchContext, sink: &dyn StatusSink) -> Result<PathBuf> {
    match hosts::fetch_job(job, ctx) {
        Ok(path) => Ok(path),
        Err(EngineError::Canceled) => Err(EngineError::Canceled),
        Err(first) => {
            if ctx.control.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            sink.report(&format!("  retrying after: {first}"));
            hosts::fetch_job(job, ctx)
        }
    }
}

fn download_album_cover(
    agent: &ureq::Agent,
    url: &str,
    folder: &Path,
    cache: &mut HashSet<PathBuf>,
    sink: &dyn StatusSink,
) -> Option<PathBuf> {
    if std::fs::create_dir_all(folder).is_err() {
        return None;
    }
    if cache.contains(folder) {
        if let Some(existing) = paths::find_existing_cover(folder) {
            return Some(existing);
        }
    }
    if let Some(existing) = paths::find_existing_cover(folder) {
        cache.insert(folder.to_path_buf());
        return Some(existing);
    }

    let mut response = match http::call_get_with_headers(agent, url, &[]) {
        Ok(response) if response.status().as_u16() < 400 => response,
        Ok(response) => {
            sink.report(&format!(
                "  cover download failed: http {}",
                response.status().as_u16()
            ));
            return None;
        }
        Err(err) => {
            sink.report(&format!("  cover download failed: {err}"));
            return None;
        }
    };

    let content_type = http::header_string(&response, "content-type");
    let ext = http::image_extension_for(url, &content_type);
    let dest = paths::resolve_duplicate(&folder.join(format!("cover.{ext}")));

    let mut reader = response.body_mut().as_reader();
    let mut file = match std::fs::File::create(&dest) {
        Ok(file) => file,
        Err(_) => return None,
    };
    if std::io::copy(&mut reader, &mut file).is_err() {
        drop(file);
        let _ = std::fs::remove_file(&dest);
        return None;
    }

    cache.insert(folder.to_path_buf());
    let saved_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("cover");
    sink.report(&format!("  saved cover art: {saved_name}"));
    Some(dest)
}

fn or_na(value: &str) -> &str {
    if value.trim().is_empty() {
        "N/A"
    } else {
        value
    }
}

/// The per-track summary file: blank-line separated `Field: value` sections,
/// named after the track and never overwriting an earlier file.
fn write_track_metadata(folder: &Path, track: &Track, cover_saved: Option<&str>) -> Result<()> {
    let safe = paths::sanitize_title(&track.title);
    let stem = if safe.is_empty() {
        "Track".to_string()
    } else {
        safe
    };
    let dest = paths::resolve_duplicate(&folder.join(format!("{stem}.txt")));

    let mut sections: Vec<String> = vec![format!("Title: {}", track.title)];
    if !track.additional_info.is_empty() {
        sections.push(format!("Additional Info:\n{}", track.additional_info));
    }
    sections.push(format!("Artist: {}", track.artist));
    sections.push(format!("Album/Project: {}", or_na(&track.album)));
    sections.push(format!("Genre/Category: {}", or_na(&track.genre)));
    sections.push(format!("Notes: {}", or_na(&track.notes)));
    sections.push(format!("File Date: {}", or_na(&track.file_date)));
    sections.push(format!("Leak/Release Date: {}", or_na(&track.leak_date)));
    sections.push(format!("Type: {}", or_na(&track.track_type)));
    sections.push(format!("Format: {}", or_na(&track.format)));
    sections.push(format!("Cover Source: {}", or_na(&track.cover_url)));
    sections.push(format!("Cover Saved: {}", cover_saved.unwrap_or("N/A")));
    sections.push("Download Links:".to_string());
    if track.urls.is_empty() {
        sections.push("  - None".to_string());
    } else {
        for url in &track.urls {
            sections.push(format!("  - {url}"));
        }
    }
    sections.push(format!(
        "Generated: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));

    std::fs::write(&dest, sections.join("\n\n"))?;
    Ok(())
}

/// Runs every plan in order. Stops at the first cancellation; failures are
/// tallied and the run moves on.
pub fn execute_plans(
    sheet: &SheetData,
    plans: &[TrackPlan],
    options: &RunOptions,
    control: &RunControl,
    sink: &dyn StatusSink,
) -> RunSummary {
    let page_agent = http::build_http_agent(http::PAGE_TIMEOUT_SECS);
    let stream_agent = http::build_http_agent(http::STREAM_TIMEOUT_SECS);
    let api_agent = http::build_http_agent(http::API_TIMEOUT_SECS);
    let ctx = FetchContext::new(&page_agent, &stream_agent, &api_agent, control, &options.ytdlp);

    let log = RunLog::create(&options.output_root);
    let total_jobs: usize = plans.iter().map(|plan| plan.jobs.len()).sum();
    log.event(
        "info",
        "run_started",
        json!({ "sheet": sheet.title, "rows": sheet.tracks.len(), "jobs": total_jobs }),
    );

    let mut summary = RunSummary::default();
    let mut cover_cache: HashSet<PathBuf> = HashSet::new();
    let mut job_number = 0_usize;

    'plans: for plan in plans {
        let track = plan.row.and_then(|row| sheet.tracks.get(row));
        let mut row_succeeded = false;

        for job in &plan.jobs {
            job_number += 1;
            if wait_if_paused(control) {
                summary.canceled = true;
                sink.report("run canceled");
                log.event("warn", "run_canceled", json!({ "at_job": job_number }));
                break 'plans;
            }

            let (kind, _) = hosts::select_host(&job.source_url);
            sink.report(&format!("[{job_number}/{total_jobs}] {}", job.title));
            sink.report(&format!("  type: {}, url: {}", kind.label(), job.source_url));
            log.event(
                "info",
                "job_started",
                json!({ "url": job.source_url, "title": job.title, "host": kind.label() }),
            );

            match run_single_job(job, &ctx, sink) {
                Ok(path) => {
                    row_succeeded = true;
                    summary.completed += 1;
                    let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    let digest = http::sha256_file_hex(&path).unwrap_or_default();
                    sink.report(&format!("  saved {}", path.display()));
                    log.event(
                        "info",
                        "job_completed",
                        json!({
                            "path": path.display().to_string(),
                            "bytes": bytes,
                            "sha256": digest,
                        }),
                    );
                    summary.saved_files.push(path);
                }
                Err(EngineError::Canceled) => {
                    summary.canceled = true;
                    sink.report("run canceled");
                    log.event("warn", "run_canceled", json!({ "at_job": job_number }));
                    break 'plans;
                }
                Err(err) => {
                    summary.failed += 1;
                    sink.report(&format!("  failed: {err}"));
                    log.event(
                        "error",
                        "job_failed",
                        json!({ "url": job.source_url, "error": err.to_string() }),
                    );
                    summary.failures.push(FailedJob {
                        title: job.title.clone(),
                        url: job.source_url.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        // Covers and metadata only for rows that produced at least one file.
        if !row_succeeded {
            continue;
        }
        let Some(track) = track else {
            continue;
        };

        let mut cover_saved: Option<String> = None;
        if options.download_covers && !track.cover_url.is_empty() {
            cover_saved = download_album_cover(
                &page_agent,
                &track.cover_url,
                &plan.folder,
                &mut cover_cache,
                sink,
            )
            .and_then(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            });
        }

        if options.save_metadata {
            if let Err(err) = write_track_metadata(&plan.folder, track, cover_saved.as_deref()) {
                sink.report(&format!("  metadata write failed: {err}"));
            }
        }
    }

    if options.zip_when_done && summary.completed > 0 && !summary.canceled {
        let sheet_dir = OutputLayout::new(options.output_root.clone()).sheet_dir(&sheet.title);
        match archive::zip_output_folder(&sheet_dir) {
            Ok(path) => {
                sink.report(&format!("archive written: {}", path.display()));
                log.event(
                    "info",
                    "archive_written",
                    json!({ "path": path.display().to_string() }),
                );
                summary.archive_path = Some(path);
            }
            Err(err) => {
                sink.report(&format!("archive failed: {err}"));
                log.event("error", "archive_failed", json!({ "error": err.to_string() }));
            }
        }
    }

    sink.report(&format!(
        "done. success: {} | failed: {}",
        summary.completed, summary.failed
    ));
    log.event(
        "info",
        "run_finished",
        json!({
            "completed": summary.completed,
            "failed": summary.failed,
            "canceled": summary.canceled,
        }),
    );
    summary
}

/// Loads the sheet behind `sheet_url`, plans it, and downloads everything.
pub fn run_sheet(
    sheet_url: &str,
    gid_override: Option<&str>,
    options: &RunOptions,
    control: &RunControl,
    sink: &dyn StatusSink,
) -> Result<RunSummary> {
    let page_agent = http::build_http_agent(http::PAGE_TIMEOUT_SECS);
    let sheet = crate::sheet::load_sheet(&page_agent, sheet_url, gid_override)?;

    sink.report(&format!(
        "sheet \"{}\": {} rows",
        sheet.title,
        sheet.tracks.len()
    ));
    for warning in &sheet.warnings {
        sink.report(&format!("note: {warning}"));
    }

    let plans = plan_track_jobs(&sheet, options);
    if plans.is_empty() {
        sink.report("nothing to download");
        return Ok(RunSummary::default());
    }

    Ok(execute_plans(&sheet, &plans, options, control, sink))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(title: &str, album: &str, urls: &[&str]) -> Track {
        Track {
            title: title.to_string(),
            additional_info: String::new(),
            artist: "Artist".to_string(),
            album: album.to_string(),
            genre: String::new(),
            cover_url: String::new(),
            notes: String::new(),
            file_date: String::new(),
            leak_date: String::new(),
            track_type: String::new(),
            format: String::new(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn sheet_with_tracks(tracks: Vec<Track>) -> SheetData {
        SheetData {
            sheet_id: "abc".to_string(),
            gid: "0".to_string(),
            title: "Best Sheet".to_string(),
            tracks,
            embedded_links: Vec::new(),
            warnings: Vec::new(),
            working_csv_url: String::new(),
        }
    }

    #[test]
    fn multi_link_rows_get_link_suffixes() {
        let sheet = sheet_with_tracks(vec![
            track("Solo", "Era A", &["https://a/1.mp3"]),
            track("Pair", "Era A", &["https://a/2.mp3", "https://a/3.mp3"]),
        ]);
        let jobs = plan_jobs(&sheet, &RunOptions::default());

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].title, "Solo");
        assert_eq!(jobs[1].title, "Pair (Link 1)");
        assert_eq!(jobs[2].title, "Pair (Link 2)");
        assert!(jobs.iter().all(|job| !job.prefer_remote_name));
        assert!(jobs[0]
            .target_folder
            .ends_with(Path::new("Best Sheet").join("Era A")));
    }

    #[test]
    fn rows_without_links_plan_nothing() {
        let sheet = sheet_with_tracks(vec![
            track("Has", "", &["https://a/1.mp3"]),
            track("Empty", "", &[]),
        ]);
        let plans = plan_track_jobs(&sheet, &RunOptions::default());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].row, Some(0));
    }

    #[test]
    fn unpaired_embedded_links_become_numbered_placeholders() {
        let mut sheet = sheet_with_tracks(vec![track("Row 1", "", &[]), track("Row 2", "", &[])]);
        sheet.embedded_links = vec![
            "https://krakenfiles.com/view/a".to_string(),
            "https://krakenfiles.com/view/b".to_string(),
            "https://krakenfiles.com/view/c".to_string(),
        ];

        let plans = plan_track_jobs(&sheet, &RunOptions::default());
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].row, None);
        assert_eq!(plans[0].jobs[0].title, "Track 1");
        assert_eq!(plans[2].jobs[0].title, "Track 3");
        assert!(plans.iter().all(|plan| plan.jobs[0].prefer_remote_name));
        assert!(plans[0].jobs[0].target_folder.ends_with("Best Sheet"));
    }

    #[test]
    fn matching_embedded_counts_pair_rows_with_links() {
        let mut sheet = sheet_with_tracks(vec![
            track("First", "Era", &[]),
            track("Second", "Era", &[]),
        ]);
        sheet.embedded_links = vec![
            "https://pixeldrain.com/u/x1".to_string(),
            "https://pixeldrain.com/u/x2".to_string(),
        ];

        let plans = plan_track_jobs(&sheet, &RunOptions::default());
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].row, Some(0));
        assert_eq!(plans[0].jobs[0].title, "First");
        assert!(!plans[0].jobs[0].prefer_remote_name);
        assert!(plans[1].jobs[0]
            .target_folder
            .ends_with(Path::new("Best Sheet").join("Era")));
    }

    #[test]
    fn control_token_latches_cancel_and_pause() {
        let control = RunControl::new();
        assert!(!control.is_cancelled());
        assert!(!control.is_paused());

        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());

        control.cancel();
        assert!(control.is_cancelled());
        assert!(wait_if_paused(&control));
    }

    #[test]
    fn empty_run_still_writes_its_log_and_skips_the_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sheet = sheet_with_tracks(vec![track("Row", "", &[])]);
        let options = RunOptions {
            output_root: dir.path().to_path_buf(),
            zip_when_done: true,
            ..RunOptions::default()
        };

        let summary = execute_plans(&sheet, &[], &options, &RunControl::new(), &NullSink);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert!(!summary.canceled);
        assert!(summary.archive_path.is_none(), "archive is gated on successes");

        let logs_dir = dir.path().join("logs");
        let entries: Vec<_> = std::fs::read_dir(&logs_dir)
            .expect("logs dir")
            .collect::<std::io::Result<Vec<_>>>()
            .expect("log entries");
        assert_eq!(entries.len(), 1);
        let text = std::fs::read_to_string(entries[0].path()).expect("log text");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["event"], "run_started");
        let last: Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(last["event"], "run_finished");
    }

    #[test]
    fn metadata_file_lists_every_field_and_link() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut subject = track("My Song", "Era X", &["https://a/1.mp3", "https://a/2.mp3"]);
        subject.notes = "rough mix".to_string();
        subject.file_date = "3/14/2019".to_string();

        write_track_metadata(dir.path(), &subject, Some("cover.png")).expect("write");
        let text =
            std::fs::read_to_string(dir.path().join("My Song.txt")).expect("metadata file");

        assert!(text.starts_with("Title: My Song"));
        assert!(text.contains("\n\nArtist: Artist"));
        assert!(text.contains("Album/Project: Era X"));
        assert!(text.contains("Genre/Category: N/A"));
        assert!(text.contains("Notes: rough mix"));
        assert!(text.contains("File Date: 3/14/2019"));
        assert!(text.contains("Cover Saved: cover.png"));
        assert!(text.contains("  - https://a/1.mp3"));
        assert!(text.contains("Generated: "));

        // A second write for the same title must not clobber the first.
        write_track_metadata(dir.path(), &subject, None).expect("write again");
        assert!(dir.path().join("My Song (2).txt").exists());
    }

    #[test]
    fn metadata_includes_additional_info_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut subject = track("Song", "", &[]);
        subject.additional_info = "(feat. Somebody)".to_string();

        write_track_metadata(dir.path(), &subject, None).expect("write");
        let text = std::fs::read_to_string(dir.path().join("Song.txt")).expect("metadata file");

        assert!(text.contains("Additional Info:\n(feat. Somebody)"));
        assert!(text.contains("Download Links:\n\n  - None"));
    }
}
