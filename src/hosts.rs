//! URL dispatch and the per-host retrieval protocols.
//!
//! Every strategy here follows the same contract: resolve the real payload
//! URL with whatever scraping or API calls the host requires, stream it to a
//! freshly resolved output path, and hand back that path. Strategies never
//! panic across the runner boundary; anything unexpected becomes an error
//! message on the failed job.

use std::cell::RefCell;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::http;
use crate::mega;
use crate::paths;
use crate::runner::{DownloadJob, RunControl};
use crate::ytdlp::{self, YtdlpConfig};

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const BINARY_ACCEPT: &str = "application/octet-stream,application/json;q=0.9,*/*;q=0.8";
const GOFILE_WEBSITE_TOKEN: &str = "4fd6sg89d7s6";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Pillows,
    Krakenfiles,
    Froste,
    Pixeldrain,
    Fileditch,
    Bumpworthy,
    GoogleDrive,
    Mega,
    YouTube,
    SoundCloud,
    ImgurGg,
    Imgur,
    Ibb,
    Gofile,
    Mediafire,
    S3,
    Direct,
}

impl HostKind {
    pub fn label(self) -> &'static str {
        match self {
            HostKind::Pillows => "pillows.su",
            HostKind::Krakenfiles => "KrakenFiles",
            HostKind::Froste => "Froste.lol",
            HostKind::Pixeldrain => "Pixeldrain",
            HostKind::Fileditch => "FileDitch",
            HostKind::Bumpworthy => "BumpWorthy",
            HostKind::GoogleDrive => "Google Drive",
            HostKind::Mega => "MEGA.nz",
            HostKind::YouTube => "YouTube",
            HostKind::SoundCloud => "SoundCloud",
            HostKind::ImgurGg => "imgur.gg",
            HostKind::Imgur => "Imgur",
            HostKind::Ibb => "ImgBB",
            HostKind::Gofile => "Gofile",
            HostKind::Mediafire => "MediaFire",
            HostKind::S3 => "S3",
            HostKind::Direct => "Direct download",
        }
    }
}

/// The retired pillows domain still appears all over older sheets.
pub fn normalize_legacy_domains(url: &str) -> String {
    url.replace("plwcse.top", "pillows.su")
}

type HostPredicate = fn(&str) -> bool;

/// Ordered most-specific-first; anything unmatched streams as a direct URL.
/// New hosts are appended here, never branched elsewhere.
const DISPATCH_TABLE: &[(HostKind, HostPredicate)] = &[
    (HostKind::Pillows, |u| u.contains("pillows.su")),
    (HostKind::Krakenfiles, |u| u.contains("krakenfiles.com")),
    (HostKind::Froste, |u| {
        u.contains("music.froste.lol") || u.contains("froste.lol/song")
    }),
    (HostKind::Pixeldrain, |u| u.contains("pixeldrain.com")),
    (HostKind::Fileditch, |u| u.contains("fileditch")),
    (HostKind::Bumpworthy, |u| u.contains("bumpworthy.com")),
    (HostKind::GoogleDrive, |u| {
        u.contains("drive.google.com")
            || u.contains("docs.google.com")
            || u.contains("drive.usercontent.google.com")
    }),
    (HostKind::Mega, |u| u.contains("mega.nz") || u.contains("mega.co.nz")),
    (HostKind::YouTube, |u| {
        u.contains("youtube.com") || u.contains("youtu.be")
    }),
    (HostKind::SoundCloud, |u| u.contains("soundcloud.com")),
    (HostKind::ImgurGg, |u| u.contains("imgur.gg")),
    (HostKind::Imgur, |u| u.contains("imgur.com")),
    (HostKind::Ibb, |u| u.contains("ibb.co/")),
    (HostKind::Gofile, |u| u.contains("gofile.io")),
    (HostKind::Mediafire, |u| u.contains("mediafire.com")),
    (HostKind::S3, |u| u.contains("amazonaws.com") && u.contains("s3")),
];

/// Pure dispatch decision: legacy domains rewritten, exactly one host picked.
pub fn select_host(url: &str) -> (HostKind, String) {
    let normalized = normalize_legacy_domains(url);
    let lowered = normalized.to_lowercase();
    for (kind, predicate) in DISPATCH_TABLE {
        if predicate(&lowered) {
            return (*kind, normalized);
        }
    }
    (HostKind::Direct, normalized)
}

/// Shared state every strategy call gets: the agents, the control token, and
/// the yt-dlp configuration. One context lives for one run.
pub struct FetchContext<'a> {
    pub page_agent: &'a ureq::Agent,
    pub stream_agent: &'a ureq::Agent,
    pub api_agent: &'a ureq::Agent,
    pub control: &'a RunControl,
    pub ytdlp: &'a YtdlpConfig,
    gofile_token: RefCell<Option<String>>,
}

impl<'a> FetchContext<'a> {
    pub fn new(
        page_agent: &'a ureq::Agent,
        stream_agent: &'a ureq::Agent,
        api_agent: &'a ureq::Agent,
        control: &'a RunControl,
        ytdlp: &'a YtdlpConfig,
    ) -> Self {
        Self {
            page_agent,
            stream_agent,
            api_agent,
            control,
            ytdlp,
            gofile_token: RefCell::new(None),
        }
    }

    /// Guest token minted once per run and reused for every gofile job.
    fn gofile_token(&self) -> Result<String> {
        if let Some(token) = self.gofile_token.borrow().clone() {
            return Ok(token);
        }
        let mut response = self
            .api_agent
            .post("https://api.gofile.io/accounts")
            .header("Content-Type", "application/json")
            .send("{}")
            .map_err(|err| EngineError::Fetch(format!("gofile account mint: {err}")))?;
        let mut body = String::new();
        response
            .body_mut()
            .as_reader()
            .read_to_string(&mut body)
            .map_err(|err| EngineError::Fetch(format!("gofile account mint: {err}")))?;
        let value: Value = serde_json::from_str(&body)?;
        let token = value["data"]["token"]
            .as_str()
            .ok_or_else(|| EngineError::Fetch("gofile did not return a guest token".to_string()))?
            .to_string();
        *self.gofile_token.borrow_mut() = Some(token.clone());
        Ok(token)
    }
}

/// Runs the strategy selected for a job and returns the saved path.
pub fn fetch_job(job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let (kind, url) = select_host(&job.source_url);
    match kind {
        HostKind::Pillows => fetch_pillows(&url, job, ctx),
        HostKind::Krakenfiles => fetch_krakenfiles(&url, job, ctx),
        HostKind::Froste => fetch_froste(&url, job, ctx),
        HostKind::Pixeldrain => fetch_pixeldrain(&url, job, ctx),
        HostKind::Fileditch => fetch_fileditch(&url, job, ctx),
        HostKind::Bumpworthy => fetch_bumpworthy(&url, job, ctx),
        HostKind::GoogleDrive => fetch_google_drive(&url, job, ctx),
        HostKind::Mega => mega::fetch(&url, job, ctx),
        HostKind::YouTube | HostKind::SoundCloud => ytdlp::fetch(&url, kind, job, ctx),
        HostKind::ImgurGg => fetch_imgur_gg(&url, job, ctx),
        HostKind::Imgur => fetch_imgur(&url, job, ctx),
        HostKind::Ibb => fetch_ibb(&url, job, ctx),
        HostKind::Gofile => fetch_gofile(&url, job, ctx),
        HostKind::Mediafire => fetch_mediafire(&url, job, ctx),
        HostKind::S3 => fetch_s3(&url, job, ctx),
        HostKind::Direct => fetch_direct(&url, job, ctx),
    }
}

/// Output file name for one job. Embedded-mode jobs carry placeholder titles
/// and take the host's original filename instead when one was learned.
pub(crate) fn target_file_name(job: &DownloadJob, remote_name: Option<&str>, ext: &str) -> String {
    if job.prefer_remote_name {
        if let Some(name) = remote_name {
            let safe = paths::sanitize_title(name);
            if !safe.is_empty() {
                return safe;
            }
        }
    }
    let safe = paths::sanitize_title(&job.title);
    let base = if safe.is_empty() { "Track".to_string() } else { safe };
    format!("{base}.{ext}")
}

pub(crate) fn save_response_stream(
    response: &mut ureq::http::Response<ureq::Body>,
    dir: &Path,
    file_name: &str,
    control: &RunControl,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let dest = paths::resolve_duplicate(&dir.join(file_name));
    let mut reader = response.body_mut().as_reader();
    http::stream_to_file(&mut reader, &dest, control)?;
    Ok(dest)
}

fn require_ok(response: &ureq::http::Response<ureq::Body>, url: &str) -> Result<()> {
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::HttpStatus {
            status,
            url: url.to_string(),
        });
    }
    Ok(())
}

fn require_binary(response: &ureq::http::Response<ureq::Body>, url: &str) -> Result<()> {
    let content_type = http::header_string(response, "content-type");
    if http::looks_like_html(&content_type) {
        return Err(EngineError::Fetch(format!(
            "got an html page instead of a file from {url}"
        )));
    }
    Ok(())
}

fn scrape_anchor_href(page_html: &str, needle: &str) -> Option<String> {
    let document = Html::parse_document(page_html);
    let selector = Selector::parse("a[href]").expect("anchor selector");
    for anchor in document.select(&selector) {
        if let Some(href) = anchor.value().attr("href") {
            if href.contains(needle) {
                return Some(href.to_string());
            }
        }
    }
    None
}

fn scrape_meta_content(page_html: &str, properties: &[&str]) -> Option<String> {
    let document = Html::parse_document(page_html);
    for property in properties {
        let selector =
            Selector::parse(&format!(r#"meta[property="{property}"]"#)).expect("meta selector");
        if let Some(el) = document.select(&selector).next() {
            if let Some(content) = el.value().attr("content") {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }
        }
    }
    None
}

pub(crate) fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn remote_name_from_path(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(percent_decode(segment))
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

// pillows.su: the page links to the download API, or the link is rebuilt
// straight from the /f/<hex> file id.

fn pillows_api_link(url: &str, page_html: Option<&str>) -> Option<String> {
    if let Some(html) = page_html {
        if let Some(href) = scrape_anchor_href(html, "api.pillows.su/api/download") {
            return Some(href);
        }
    }
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| Regex::new(r"/f/([a-f0-9A-F]+)").unwrap());
    re.captures(url)
        .map(|caps| format!("https://api.pillows.su/api/download/{}", &caps[1]))
}

fn fetch_pillows(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let page = http::fetch_text(
        ctx.page_agent,
        url,
        &[("Referer", "https://pillows.su/"), ("Accept", HTML_ACCEPT)],
    )
    .ok();

    let download_link = pillows_api_link(url, page.as_deref())
        .ok_or_else(|| EngineError::Fetch(format!("no download link found for {url}")))?;

    let mut response = http::call_get_with_headers(
        ctx.stream_agent,
        &download_link,
        &[("Referer", url), ("Accept", BINARY_ACCEPT)],
    )
    .map_err(|err| EngineError::Fetch(format!("{download_link}: {err}")))?;
    require_ok(&response, &download_link)?;

    let ext = http::extension_from_url_path(&download_link).unwrap_or_else(|| {
        let content_type = http::header_string(&response, "content-type");
        http::extension_from_content_type(&content_type)
            .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
            .to_string()
    });
    let name = target_file_name(job, None, &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// krakenfiles.com: JSON metadata endpoint, then the original-quality path
// when it answers, else the lower-fidelity m4a stream endpoints.

fn krakenfiles_hash(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"/(?:view|embed-audio)/([a-zA-Z0-9]+)").unwrap());
    re.captures(url).map(|caps| caps[1].to_string())
}

/// "14.11.2023 20:07" as reported by the API becomes the "14-11-2023" path
/// segment the upload servers use.
fn krakenfiles_date_segment(upload_date: &str) -> String {
    upload_date
        .split_whitespace()
        .next()
        .unwrap_or("")
        .replace('.', "-")
}

const KRAKEN_HEADERS: &[(&str, &str)] = &[
    ("Accept", "application/json, text/plain, */*"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Referer", "https://krakenfiles.com/"),
];

fn fetch_krakenfiles(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let hash = krakenfiles_hash(url)
        .ok_or_else(|| EngineError::Fetch(format!("no file hash in {url}")))?;

    // The page visit hands out the session cookies the json endpoint wants.
    let mut cookies: Vec<String> = Vec::new();
    if let Ok(response) = http::call_get_with_headers(ctx.page_agent, url, KRAKEN_HEADERS) {
        cookies = http::collect_set_cookies(&response);
    }
    let cookie_header = cookies.join("; ");
    let mut headers: Vec<(&str, &str)> = KRAKEN_HEADERS.to_vec();
    if !cookie_header.is_empty() {
        headers.push(("Cookie", &cookie_header));
    }

    let json_url = format!("https://krakenfiles.com/json/{hash}");
    let body = http::fetch_text(ctx.page_agent, &json_url, &headers)?;
    let info: Value = serde_json::from_str(&body)?;

    let original_title = info["title"].as_str().unwrap_or("");
    let server_url = info["serverUrl"].as_str().unwrap_or("");
    let upload_date = krakenfiles_date_segment(info["uploadDate"].as_str().unwrap_or(""));
    let file_type = info["type"].as_str().unwrap_or("");
    let original_ext = extension_of(original_title);

    let mut candidates: Vec<(String, String)> = Vec::new();
    if !server_url.is_empty() && !upload_date.is_empty() {
        candidates.push((
            format!("{server_url}/uploads/{upload_date}/{hash}/file"),
            original_ext.clone().unwrap_or_else(|| "mp3".to_string()),
        ));
    }
    if file_type == "music" && !server_url.is_empty() {
        if !upload_date.is_empty() {
            candidates.push((
                format!("{server_url}/uploads/{upload_date}/{hash}/music.m4a"),
                "m4a".to_string(),
            ));
        }
        candidates.push((
            format!("{server_url}/uploads/{hash}.m4a"),
            "m4a".to_string(),
        ));
    }
    if let Ok(embed_page) =
        http::fetch_text(ctx.page_agent, &format!("https://krakenfiles.com/embed-audio/{hash}"), &headers)
    {
        static M4A_RE: OnceLock<Regex> = OnceLock::new();
        let re = M4A_RE.get_or_init(|| Regex::new(r#"m4a:\s*['"]([^'"]+)['"]"#).unwrap());
        if let Some(caps) = re.captures(&embed_page) {
            let mut stream_url = caps[1].to_string();
            if stream_url.starts_with("//") {
                stream_url = format!("https:{stream_url}");
            }
            candidates.push((stream_url, "m4a".to_string()));
        }
    }

    if candidates.is_empty() {
        return Err(EngineError::Fetch(format!(
            "no stream endpoint resolved for krakenfiles {hash}"
        )));
    }

    let mut last_error = EngineError::Fetch(format!("all endpoints failed for {url}"));
    for (candidate, ext) in candidates {
        let response = http::call_get_with_headers(ctx.stream_agent, &candidate, &headers);
        let mut response = match response {
            Ok(response) => response,
            Err(err) => {
                last_error = EngineError::Fetch(format!("{candidate}: {err}"));
                continue;
            }
        };
        if let Err(err) = require_ok(&response, &candidate).and_then(|_| require_binary(&response, &candidate)) {
            last_error = err;
            continue;
        }
        let remote = if original_title.is_empty() { None } else { Some(original_title) };
        let name = target_file_name(job, remote, &ext);
        return save_response_stream(&mut response, &job.target_folder, &name, ctx.control);
    }
    Err(last_error)
}

// froste.lol: the song id maps straight onto a /file endpoint.

fn froste_file_url(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"/song/([a-fA-F0-9]+)").unwrap());
    re.captures(url)
        .map(|caps| format!("https://music.froste.lol/song/{}/file", &caps[1]))
}

fn fetch_froste(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let download_url = froste_file_url(url)
        .ok_or_else(|| EngineError::Fetch(format!("no song id in {url}")))?;

    let mut response = http::call_get_with_headers(
        ctx.stream_agent,
        &download_url,
        &[
            ("Referer", "https://music.froste.lol/"),
            ("Accept", "audio/*,application/octet-stream,*/*;q=0.8"),
        ],
    )
    .map_err(|err| EngineError::Fetch(format!("{download_url}: {err}")))?;
    require_ok(&response, &download_url)?;

    let disposition = http::header_string(&response, "content-disposition");
    let remote_name = http::content_disposition_filename(&disposition);
    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });

    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// pixeldrain.com: /info for the original name, then the file API endpoint.

fn pixeldrain_id(url: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"pixeldrain\.com/u/([a-zA-Z0-9]+)",
            r"pixeldrain\.com/api/file/([a-zA-Z0-9]+)",
            r"pixeldrain\.com/l/[^#]+#([a-zA-Z0-9]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    patterns
        .iter()
        .find_map(|re| re.captures(url).map(|caps| caps[1].to_string()))
}

fn fetch_pixeldrain(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let file_id = pixeldrain_id(url)
        .ok_or_else(|| EngineError::Fetch(format!("no file id in {url}")))?;

    let headers = [("Accept", "application/octet-stream,*/*")];
    let remote_name = http::fetch_text(
        ctx.page_agent,
        &format!("https://pixeldrain.com/api/file/{file_id}/info"),
        &headers,
    )
    .ok()
    .and_then(|body| serde_json::from_str::<Value>(&body).ok())
    .and_then(|info| info["name"].as_str().map(str::to_string));

    let download_url = format!("https://pixeldrain.com/api/file/{file_id}");
    let mut response = http::call_get_with_headers(ctx.stream_agent, &download_url, &headers)
        .map_err(|err| EngineError::Fetch(format!("{download_url}: {err}")))?;
    require_ok(&response, &download_url)?;
    require_binary(&response, &download_url)?;

    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });

    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// fileditch: direct file URLs pass through, pages are scraped for one.

fn fetch_fileditch(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let download_url = if url.contains("files.fileditch") {
        url.to_string()
    } else {
        let page = http::fetch_text(ctx.page_agent, url, &[("Accept", HTML_ACCEPT)])?;
        scrape_anchor_href(&page, "files.fileditch")
            .ok_or_else(|| EngineError::Fetch(format!("no file link on {url}")))?
    };
    let remote_name = remote_name_from_path(&download_url);

    let mut response = http::call_get_with_headers(ctx.stream_agent, &download_url, &[])
        .map_err(|err| EngineError::Fetch(format!("{download_url}: {err}")))?;
    require_ok(&response, &download_url)?;
    require_binary(&response, &download_url)?;

    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });

    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// bumpworthy.com: numeric bump id, audio or video endpoint chosen by the URL.

fn bumpworthy_target(url: &str) -> Option<(String, &'static str)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"bumpworthy\.com/(?:bumps|download/(?:video|audio))/(\d+)").unwrap()
    });
    let bump_id = re.captures(url).map(|caps| caps[1].to_string())?;
    if url.contains("/download/audio/") {
        Some((
            format!("https://www.bumpworthy.com/download/audio/{bump_id}"),
            "mp3",
        ))
    } else {
        Some((
            format!("https://www.bumpworthy.com/download/video/{bump_id}"),
            "mp4",
        ))
    }
}

fn fetch_bumpworthy(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let (download_url, default_ext) = bumpworthy_target(url)
        .ok_or_else(|| EngineError::Fetch(format!("no bump id in {url}")))?;

    let mut response = http::call_get_with_headers(ctx.stream_agent, &download_url, &[])
        .map_err(|err| EngineError::Fetch(format!("{download_url}: {err}")))?;
    require_ok(&response, &download_url)?;
    require_binary(&response, &download_url)?;

    let content_type = http::header_string(&response, "content-type");
    let ext = http::extension_from_content_type(&content_type)
        .unwrap_or(default_ext)
        .to_string();
    let name = target_file_name(job, None, &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// Google Drive: the large-file interstitial wants a confirmation token from
// cookies or the page body; the usercontent endpoint is the last resort.

fn gdrive_file_id(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?:/d/|id=|/file/d/)([a-zA-Z0-9_-]+)").unwrap());
    re.captures(url).map(|caps| caps[1].to_string())
}

fn gdrive_confirm_from_html(page_html: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"confirm=([0-9A-Za-z_-]+)",
            r#"name="confirm" value="([^"]+)""#,
            r"/uc\?export=download&amp;confirm=([^&]+)",
            r#"download&amp;confirm=([^&"]+)"#,
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    patterns
        .iter()
        .find_map(|re| re.captures(page_html).map(|caps| caps[1].to_string()))
}

fn gdrive_confirm_from_cookies(cookies: &[String]) -> Option<String> {
    cookies.iter().find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.contains("download_warning") {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn fetch_google_drive(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let file_id = gdrive_file_id(url)
        .ok_or_else(|| EngineError::Fetch(format!("no drive file id in {url}")))?;

    let mut cookies: Vec<String> = Vec::new();
    let mut attempt_url = format!("https://drive.google.com/uc?export=download&id={file_id}");

    for attempt in 0..3 {
        let cookie_header = cookies.join("; ");
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if !cookie_header.is_empty() {
            headers.push(("Cookie", &cookie_header));
        }

        let mut response = http::call_get_with_headers(ctx.stream_agent, &attempt_url, &headers)
            .map_err(|err| EngineError::Fetch(format!("{attempt_url}: {err}")))?;
        require_ok(&response, &attempt_url)?;
        for cookie in http::collect_set_cookies(&response) {
            if !cookies.contains(&cookie) {
                cookies.push(cookie);
            }
        }

        let content_type = http::header_string(&response, "content-type");
        if !http::looks_like_html(&content_type) {
            let disposition = http::header_string(&response, "content-disposition");
            let remote_name = http::content_disposition_filename(&disposition)
                .map(|name| percent_decode(&name));
            let ext = remote_name
                .as_deref()
                .and_then(extension_of)
                .or_else(|| http::extension_from_content_type(&content_type).map(str::to_string))
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type).to_string());
            let name = target_file_name(job, remote_name.as_deref(), &ext);
            return save_response_stream(&mut response, &job.target_folder, &name, ctx.control);
        }

        // Interstitial page. Dig a confirmation token out and go again.
        let mut page = String::new();
        let _ = response.body_mut().as_reader().read_to_string(&mut page);
        match attempt {
            0 => {
                let confirm = gdrive_confirm_from_cookies(&cookies)
                    .or_else(|| gdrive_confirm_from_html(&page))
                    .unwrap_or_else(|| "t".to_string());
                attempt_url = format!(
                    "https://drive.google.com/uc?export=download&confirm={confirm}&id={file_id}"
                );
            }
            1 => {
                attempt_url = format!(
                    "https://drive.usercontent.google.com/download?id={file_id}&export=download&confirm=t"
                );
            }
            _ => break,
        }
    }

    Err(EngineError::Fetch(format!(
        "drive file {file_id} kept answering with html; it may require login or be restricted"
    )))
}

// imgur: direct i.imgur.com assets pass through, pages resolve via og tags.

fn fetch_imgur(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let asset_url = if url.contains("i.imgur.com") {
        url.to_string()
    } else {
        let page = http::fetch_text(ctx.page_agent, url, &[("Accept", HTML_ACCEPT)])?;
        scrape_meta_content(&page, &["og:video", "og:video:url", "og:image"])
            .ok_or_else(|| EngineError::Fetch(format!("no media meta tags on {url}")))?
    };
    stream_scraped_asset(&asset_url, url, job, ctx)
}

// ibb.co: the share page's og:image points at the full-size asset.

fn fetch_ibb(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let page = http::fetch_text(ctx.page_agent, url, &[("Accept", HTML_ACCEPT)])?;
    let asset_url = scrape_meta_content(&page, &["og:image"])
        .ok_or_else(|| EngineError::Fetch(format!("no og:image on {url}")))?;
    stream_scraped_asset(&asset_url, url, job, ctx)
}

// imgur.gg: a file host despite the name; a download anchor when present,
// og tags otherwise.

fn fetch_imgur_gg(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let page = http::fetch_text(ctx.page_agent, url, &[("Accept", HTML_ACCEPT)])?;
    let asset_url = scrape_anchor_href(&page, "/download")
        .map(|href| absolutize(&href, url))
        .or_else(|| scrape_meta_content(&page, &["og:video", "og:image"]))
        .ok_or_else(|| EngineError::Fetch(format!("no download link on {url}")))?;
    stream_scraped_asset(&asset_url, url, job, ctx)
}

fn absolutize(href: &str, base: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match url::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(joined) => joined.to_string(),
        Err(_) => href.to_string(),
    }
}

fn stream_scraped_asset(
    asset_url: &str,
    referer: &str,
    job: &DownloadJob,
    ctx: &FetchContext,
) -> Result<PathBuf> {
    let mut response =
        http::call_get_with_headers(ctx.stream_agent, asset_url, &[("Referer", referer)])
            .map_err(|err| EngineError::Fetch(format!("{asset_url}: {err}")))?;
    require_ok(&response, asset_url)?;
    require_binary(&response, asset_url)?;

    let remote_name = remote_name_from_path(asset_url);
    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type).map(str::to_string)
        })
        .unwrap_or_else(|| "jpg".to_string());

    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// gofile.io: guest token, content listing, then the child link with the
// account cookie.

fn gofile_content_id(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"gofile\.io/d/([a-zA-Z0-9]+)").unwrap());
    re.captures(url).map(|caps| caps[1].to_string())
}

fn fetch_gofile(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let content_id = gofile_content_id(url)
        .ok_or_else(|| EngineError::Fetch(format!("no content id in {url}")))?;
    let token = ctx.gofile_token()?;

    let listing_url = format!(
        "https://api.gofile.io/contents/{content_id}?wt={GOFILE_WEBSITE_TOKEN}&cache=true"
    );
    let bearer = format!("Bearer {token}");
    let body = http::fetch_text(ctx.page_agent, &listing_url, &[("Authorization", &bearer)])?;
    let listing: Value = serde_json::from_str(&body)?;

    let children = listing["data"]["children"]
        .as_object()
        .ok_or_else(|| EngineError::Fetch(format!("gofile listing for {content_id} had no children")))?;
    let file_child = children
        .values()
        .find(|child| child["type"].as_str() == Some("file"))
        .ok_or_else(|| EngineError::Fetch(format!("no file entries under gofile {content_id}")))?;

    let link = file_child["link"]
        .as_str()
        .ok_or_else(|| EngineError::Fetch("gofile child had no link".to_string()))?;
    let remote_name = file_child["name"].as_str();

    let cookie = format!("accountToken={token}");
    let mut response = http::call_get_with_headers(ctx.stream_agent, link, &[("Cookie", &cookie)])
        .map_err(|err| EngineError::Fetch(format!("{link}: {err}")))?;
    require_ok(&response, link)?;
    require_binary(&response, link)?;

    let ext = remote_name
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });
    let name = target_file_name(job, remote_name, &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// mediafire: the page's download button carries the direct link.

fn fetch_mediafire(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let page = http::fetch_text(ctx.page_agent, url, &[("Accept", HTML_ACCEPT)])?;

    let document = Html::parse_document(&page);
    let selector = Selector::parse("a#downloadButton").expect("download button selector");
    let mut download_url = document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string);

    if download_url.is_none() {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r#"https?://download[^\s"']+"#).unwrap());
        download_url = re.find(&page).map(|m| m.as_str().to_string());
    }
    let download_url = download_url
        .ok_or_else(|| EngineError::Fetch(format!("no download button on {url}")))?;

    let remote_name = remote_name_from_path(&download_url);
    let mut response = http::call_get_with_headers(ctx.stream_agent, &download_url, &[])
        .map_err(|err| EngineError::Fetch(format!("{download_url}: {err}")))?;
    require_ok(&response, &download_url)?;
    require_binary(&response, &download_url)?;

    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });
    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// s3: bucket URLs stream as-is; the object key is the natural filename.

fn fetch_s3(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let remote_name = remote_name_from_path(url);

    let mut response = http::call_get_with_headers(ctx.stream_agent, url, &[])
        .map_err(|err| EngineError::Fetch(format!("{url}: {err}")))?;
    require_ok(&response, url)?;

    let ext = remote_name
        .as_deref()
        .and_then(extension_of)
        .unwrap_or_else(|| {
            let content_type = http::header_string(&response, "content-type");
            http::extension_from_content_type(&content_type)
                .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
                .to_string()
        });
    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}

// Catch-all: stream the URL exactly as given.

fn fetch_direct(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    let mut response = http::call_get_with_headers(ctx.stream_agent, url, &[])
        .map_err(|err| EngineError::Fetch(format!("{url}: {err}")))?;
    require_ok(&response, url)?;
    require_binary(&response, url)?;

    let ext = http::extension_from_url_path(url).unwrap_or_else(|| {
        let content_type = http::header_string(&response, "content-type");
        http::extension_from_content_type(&content_type)
            .unwrap_or_else(|| http::audio_extension_for_format(&content_type))
            .to_string()
    });
    let remote_name = remote_name_from_path(url);
    let name = target_file_name(job, remote_name.as_deref(), &ext);
    save_response_stream(&mut response, &job.target_folder, &name, ctx.control)
}
