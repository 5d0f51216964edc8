//! YouTube and SoundCloud retrieval through the yt-dlp tool.
//!
//! yt-dlp is spawned rather than linked; the launcher tries a configured
//! binary, then `yt-dlp` on PATH, then the python module forms, and reports
//! every failure when none of them works. While a download runs, the child is
//! polled against the run control so cancellation kills the whole process
//! tree promptly.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::hosts::{FetchContext, HostKind};
use crate::paths;
use crate::runner::{DownloadJob, RunControl};

const POLL_INTERVAL_MS: u64 = 200;
const SOCKET_TIMEOUT_SECS: u64 = 30;

/// Spawns tools without flashing a console window on Windows.
pub(crate) fn background_command(program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// What yt-dlp should produce for a given link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputProfile {
    AudioM4a,
    AudioMp3,
    VideoMp4,
    VideoBest,
}

impl OutputProfile {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "audio_m4a" | "m4a" => Some(Self::AudioM4a),
            "audio_mp3" | "mp3" => Some(Self::AudioMp3),
            "video_mp4" | "mp4" => Some(Self::VideoMp4),
            "video_best" | "best" => Some(Self::VideoBest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AudioM4a => "audio_m4a",
            Self::AudioMp3 => "audio_mp3",
            Self::VideoMp4 => "video_mp4",
            Self::VideoBest => "video_best",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YtdlpConfig {
    /// Explicit yt-dlp binary; tried before PATH and the python fallbacks.
    pub tool_path: Option<PathBuf>,
    /// Explicit ffmpeg binary; `ffmpeg` on PATH is probed when unset.
    pub ffmpeg_path: Option<PathBuf>,
    pub youtube_profile: OutputProfile,
    pub soundcloud_profile: OutputProfile,
    pub timeout_secs: u64,
}

impl Default for YtdlpConfig {
    fn default() -> Self {
        Self {
            tool_path: None,
            ffmpeg_path: None,
            youtube_profile: OutputProfile::VideoMp4,
            soundcloud_profile: OutputProfile::AudioM4a,
            timeout_secs: 30 * 60,
        }
    }
}

fn resolve_ffmpeg(config: &YtdlpConfig) -> Option<PathBuf> {
    if let Some(path) = &config.ffmpeg_path {
        if path.exists() {
            return Some(path.clone());
        }
    }
    let probe = background_command("ffmpeg").arg("-version").output().ok()?;
    if probe.status.success() {
        Some(PathBuf::from("ffmpeg"))
    } else {
        None
    }
}

/// Format selector plus any extra arguments the profile needs. The mp3
/// profile re-encodes and therefore only applies when ffmpeg is around;
/// without it the best pre-encoded audio stream is taken as-is.
fn format_selection(profile: OutputProfile, have_ffmpeg: bool) -> (String, Vec<String>) {
    match profile {
        OutputProfile::AudioM4a => (
            "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio[ext=aac]/bestaudio".to_string(),
            Vec::new(),
        ),
        OutputProfile::AudioMp3 if have_ffmpeg => (
            "bestaudio/best".to_string(),
            vec![
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "192K".to_string(),
            ],
        ),
        OutputProfile::AudioMp3 => (
            "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio".to_string(),
            Vec::new(),
        ),
        OutputProfile::VideoMp4 => (
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
            vec!["--merge-output-format".to_string(), "mp4".to_string()],
        ),
        OutputProfile::VideoBest => ("bestvideo+bestaudio/best".to_string(), Vec::new()),
    }
}

/// The output template fixes the stem before the extension is known, so the
/// stem itself is bumped until no existing file in the folder shares it.
fn unique_title_stem(dir: &Path, base: &str) -> String {
    let taken: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect(),
        Err(_) => return base.to_string(),
    };
    if !taken.iter().any(|stem| stem == base) {
        return base.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base} ({counter})");
        if !taken.iter().any(|stem| stem == &candidate) {
            return candidate;
        }
        counter += 1;
    }
}

enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Canceled,
    TimedOut(u64),
}

fn kill_child_process_tree(child: &mut std::process::Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = background_command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn run_command_output_with_control(
    cmd: &mut Command,
    control: &RunControl,
    timeout_secs: u64,
) -> std::result::Result<std::process::Output, CommandRunError> {
    use std::io::ErrorKind;
    use std::process::Stdio;

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing"))
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing"))
    })?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut abort_reason: Option<CommandRunError> = None;

    loop {
        if abort_reason.is_none() && control.is_cancelled() {
            kill_child_process_tree(&mut child);
            abort_reason = Some(CommandRunError::Canceled);
        }
        if abort_reason.is_none()
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            kill_child_process_tree(&mut child);
            abort_reason = Some(CommandRunError::TimedOut(timeout_secs));
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                if let Some(reason) = abort_reason {
                    return Err(reason);
                }
                return Ok(std::process::Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            Err(err) => {
                kill_child_process_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}

/// Tries every launcher candidate in order and keeps the per-candidate
/// failures so the final error names everything that was attempted.
fn run_ytdlp_tool(
    config: &YtdlpConfig,
    args: &[String],
    control: &RunControl,
) -> Result<std::process::Output> {
    let mut failures: Vec<String> = Vec::new();
    let mut candidates: Vec<(String, Vec<String>)> = Vec::new();
    if let Some(path) = &config.tool_path {
        if path.exists() {
            candidates.push((path.to_string_lossy().to_string(), Vec::new()));
        } else {
            failures.push(format!("configured yt-dlp not found at {}", path.display()));
        }
    }
    candidates.push(("yt-dlp".to_string(), Vec::new()));
    candidates.push((
        "python".to_string(),
        vec!["-m".to_string(), "yt_dlp".to_string()],
    ));
    candidates.push((
        "python3".to_string(),
        vec!["-m".to_string(), "yt_dlp".to_string()],
    ));

    for (program, prefix) in candidates {
        let mut cmd = background_command(&program);
        cmd.args(prefix);
        cmd.args(args);
        match run_command_output_with_control(&mut cmd, control, config.timeout_secs) {
            Ok(output) => {
                if output.status.success() {
                    return Ok(output);
                }
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                failures.push(format!(
                    "{program} failed (code={:?}): {}",
                    output.status.code(),
                    if stderr.is_empty() {
                        "unknown error".to_string()
                    } else {
                        stderr
                    }
                ));
                continue;
            }
            Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                continue;
            }
            Err(CommandRunError::Spawn(e)) => {
                failures.push(format!("{program} could not start: {e}"));
                continue;
            }
            Err(CommandRunError::Wait(e)) => {
                failures.push(format!("{program} failed while running: {e}"));
                continue;
            }
            Err(CommandRunError::Canceled) => {
                return Err(EngineError::Canceled);
            }
            Err(CommandRunError::TimedOut(limit)) => {
                failures.push(format!("{program} timed out after {limit}s"));
                continue;
            }
        }
    }

    if failures.is_empty() {
        return Err(EngineError::ExternalToolMissing {
            tool: "yt-dlp".to_string(),
        });
    }
    Err(EngineError::ExternalToolFailed {
        tool: "yt-dlp".to_string(),
        code: None,
        stderr: failures.join(" | "),
    })
}

/// Downloads one link with the profile configured for its host and returns
/// the file yt-dlp reports it moved into place.
pub fn fetch(url: &str, kind: HostKind, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let profile = match kind {
        HostKind::SoundCloud => ctx.ytdlp.soundcloud_profile,
        _ => ctx.ytdlp.youtube_profile,
    };

    std::fs::create_dir_all(&job.target_folder)?;
    let safe_title = {
        let safe = paths::sanitize_title(&job.title);
        if safe.is_empty() {
            "Track".to_string()
        } else {
            safe
        }
    };
    let stem = unique_title_stem(&job.target_folder, &safe_title);
    let template = format!("{stem}.%(ext)s");

    let ffmpeg = resolve_ffmpeg(ctx.ytdlp);
    let (format, mut profile_args) = format_selection(profile, ffmpeg.is_some());

    let mut args = vec![
        "--no-playlist".to_string(),
        "--socket-timeout".to_string(),
        SOCKET_TIMEOUT_SECS.to_string(),
        "--retries".to_string(),
        "3".to_string(),
        "--fragment-retries".to_string(),
        "3".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-f".to_string(),
        format,
        "-P".to_string(),
        job.target_folder.to_string_lossy().to_string(),
        "-o".to_string(),
        template,
    ];
    args.append(&mut profile_args);
    if let Some(ffmpeg) = &ffmpeg {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }
    args.push(url.to_string());

    let output = run_ytdlp_tool(ctx.ytdlp, &args, ctx.control)?;
    let reported = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(PathBuf::from)
        .ok_or_else(|| EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: output.status.code(),
            stderr: format!("no output file reported for {url}"),
        })?;

    let resolved = if reported.is_absolute() {
        reported
    } else {
        job.target_folder.join(reported)
    };
    if !resolved.exists() {
        return Err(EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: output.status.code(),
            stderr: format!("reported output file is missing: {}", resolved.display()),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_names_parse_with_short_aliases() {
        assert_eq!(OutputProfile::parse("audio_m4a"), Some(OutputProfile::AudioM4a));
        assert_eq!(OutputProfile::parse("MP3"), Some(OutputProfile::AudioMp3));
        assert_eq!(OutputProfile::parse(" video_mp4 "), Some(OutputProfile::VideoMp4));
        assert_eq!(OutputProfile::parse("best"), Some(OutputProfile::VideoBest));
        assert_eq!(OutputProfile::parse("flac"), None);
        assert_eq!(OutputProfile::VideoMp4.as_str(), "video_mp4");
    }

    #[test]
    fn mp3_profile_only_reencodes_with_ffmpeg() {
        let (format, extra) = format_selection(OutputProfile::AudioMp3, true);
        assert_eq!(format, "bestaudio/best");
        assert!(extra.contains(&"--audio-format".to_string()));

        let (format, extra) = format_selection(OutputProfile::AudioMp3, false);
        assert!(format.starts_with("bestaudio[ext=m4a]"));
        assert!(extra.is_empty());
    }

    #[test]
    fn mp4_profile_asks_for_a_merged_container() {
        let (format, extra) = format_selection(OutputProfile::VideoMp4, true);
        assert!(format.contains("bestvideo[ext=mp4]+bestaudio[ext=m4a]"));
        assert_eq!(extra, vec!["--merge-output-format".to_string(), "mp4".to_string()]);
    }

    #[test]
    fn stems_bump_past_existing_files_regardless_of_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_title_stem(dir.path(), "My Song"), "My Song");

        std::fs::write(dir.path().join("My Song.webm"), b"x").unwrap();
        assert_eq!(unique_title_stem(dir.path(), "My Song"), "My Song (2)");

        std::fs::write(dir.path().join("My Song (2).mp4"), b"x").unwrap();
        assert_eq!(unique_title_stem(dir.path(), "My Song"), "My Song (3)");
    }
}
