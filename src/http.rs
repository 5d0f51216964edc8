use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::runner::RunControl;

pub const DEFAULT_HTTP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const PAGE_TIMEOUT_SECS: u64 = 30;
pub const STREAM_TIMEOUT_SECS: u64 = 60;
pub const API_TIMEOUT_SECS: u64 = 120;

const STREAM_BUF_BYTES: usize = 64 * 1024;

pub fn build_http_agent(timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .user_agent(DEFAULT_HTTP_USER_AGENT);
    config.build().into()
}

pub fn call_get_with_headers(
    agent: &ureq::Agent,
    url: &str,
    headers: &[(&str, &str)],
) -> std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    let mut request = agent.get(url);
    for (name, value) in headers {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            request = request.header(*name, trimmed);
        }
    }
    request.call()
}

pub fn header_string(response: &ureq::http::Response<ureq::Body>, key: &str) -> String {
    response
        .headers()
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// `name=value` pairs from every `set-cookie` response header, ready to be
/// joined with `"; "` and replayed through a `Cookie` request header.
pub fn collect_set_cookies(response: &ureq::http::Response<ureq::Body>) -> Vec<String> {
    let mut cookies = Vec::new();
    for value in response.headers().get_all("set-cookie") {
        if let Ok(text) = value.to_str() {
            if let Some(pair) = text.split(';').next() {
                let pair = pair.trim();
                if !pair.is_empty() {
                    cookies.push(pair.to_string());
                }
            }
        }
    }
    cookies
}

/// Fetches a page and returns its body text, treating any status >= 400 as an
/// error. Used for scraping and small JSON endpoints, never for media bodies.
pub fn fetch_text(
    agent: &ureq::Agent,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<String> {
    let mut response = call_get_with_headers(agent, url, headers)
        .map_err(|err| EngineError::Fetch(format!("{url}: {err}")))?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::HttpStatus {
            status,
            url: url.to_string(),
        });
    }
    let mut body = String::new();
    response
        .body_mut()
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|err| EngineError::Fetch(format!("{url}: {err}")))?;
    Ok(body)
}

pub fn content_disposition_filename(header_value: &str) -> Option<String> {
    let lowered = header_value.to_lowercase();
    let idx = lowered.find("filename")?;
    let rest = &header_value[idx..];
    let eq = rest.find('=')?;
    let mut value = rest[eq + 1..].trim();
    if let Some(stripped) = value.strip_prefix("UTF-8''") {
        value = stripped;
    }
    let value = value.trim_matches('"');
    let value = value.split(';').next().unwrap_or(value).trim();
    let value = value.trim_matches('"').trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn looks_like_html(content_type: &str) -> bool {
    let lowered = content_type.to_lowercase();
    lowered.contains("text/html") || lowered.contains("application/xhtml")
}

/// Audio extension from a free-form format hint ("FLAC", "320 kbps mp3", ...).
pub fn audio_extension_for_format(format_hint: &str) -> &'static str {
    let lowered = format_hint.to_lowercase();
    if lowered.contains("flac") {
        "flac"
    } else if lowered.contains("wav") {
        "wav"
    } else if lowered.contains("ogg") {
        "ogg"
    } else if lowered.contains("m4a") {
        "m4a"
    } else if lowered.contains("aac") {
        "aac"
    } else {
        "mp3"
    }
}

pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/x-m4a" | "audio/m4a" => Some("m4a"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "audio/aac" => Some("aac"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "application/zip" => Some("zip"),
        _ => None,
    }
}

/// Extension for a cover image, preferring the URL path over the
/// content-type. Anything unrecognized lands on jpg.
pub fn image_extension_for(url: &str, content_type: &str) -> &'static str {
    if let Some(ext) = extension_from_url_path(url) {
        match ext.as_str() {
            "jpg" => return "jpg",
            "jpeg" => return "jpeg",
            "png" => return "png",
            "gif" => return "gif",
            "webp" => return "webp",
            _ => {}
        }
    }
    let lowered = content_type.to_lowercase();
    if lowered.contains("png") {
        "png"
    } else if lowered.contains("gif") {
        "gif"
    } else if lowered.contains("webp") {
        "webp"
    } else {
        "jpg"
    }
}

/// Extension taken from the last path segment of a URL, query stripped.
pub fn extension_from_url_path(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 4 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub bytes_written: u64,
    pub sha256_hex: String,
}

/// Streams `reader` into `dest` through a `.part` temp file, renaming into
/// place only after the body completed. Cancellation is polled once per chunk;
/// a canceled stream stops writing but keeps the `.part` file on disk, so
/// whatever arrived is inspectable and `dest` itself never holds a truncated
/// body. Failed streams remove their temp file.
pub fn stream_to_file(
    reader: &mut dyn Read,
    dest: &Path,
    control: &RunControl,
) -> Result<StreamOutcome> {
    let temp_path = part_path(dest);
    let _ = std::fs::remove_file(&temp_path);

    let mut output = std::fs::File::create(&temp_path)?;
    let mut buf = [0_u8; STREAM_BUF_BYTES];
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;

    loop {
        if control.is_cancelled() {
            let _ = output.flush();
            return Err(EngineError::Canceled);
        }

        let read = match reader.read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                drop(output);
                let _ = std::fs::remove_file(&temp_path);
                return Err(EngineError::Fetch(format!("body read failed: {err}")));
            }
        };
        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
        if let Err(err) = output.write_all(&buf[..read]) {
            drop(output);
            let _ = std::fs::remove_file(&temp_path);
            return Err(EngineError::Io(err));
        }
        bytes_written = bytes_written.saturating_add(read as u64);
    }

    output.flush()?;
    drop(output);
    std::fs::rename(&temp_path, dest)?;

    Ok(StreamOutcome {
        bytes_written,
        sha256_hex: hex::encode(hasher.finalize()),
    })
}

pub fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("download.bin");
    dest.with_file_name(format!("{name}.part"))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; STREAM_BUF_BYTES];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
