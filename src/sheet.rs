use std::collections::HashSet;
use std::sync::OnceLock;

use csv::ReaderBuilder;
use regex::Regex;
use scraper::{Html, Selector};

use crate::embedded;
use crate::error::{EngineError, Result};
use crate::http;
use crate::paths::is_junk_value;

/// Responses shorter than this are treated as an error page, not sheet data.
const MIN_CSV_BYTES: usize = 50;

/// How many leading data rows are sampled when probing a column for links.
const URL_PROBE_ROWS: usize = 20;

/// One spreadsheet tab as advertised by the sheet edit page.
#[derive(Debug, Clone)]
pub struct SheetTab {
    pub gid: String,
    pub title: String,
}

/// One normalized spreadsheet row. Empty strings mean "not present".
#[derive(Debug, Clone)]
pub struct Track {
    pub title: String,
    pub additional_info: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub cover_url: String,
    pub notes: String,
    pub file_date: String,
    pub leak_date: String,
    pub track_type: String,
    pub format: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Title,
    Album,
    Artist,
    Genre,
    Cover,
    Url,
    Notes,
    FileDate,
    LeakDate,
    Type,
    Format,
}

impl ColumnRole {
    pub const ALL: [ColumnRole; 11] = [
        ColumnRole::Title,
        ColumnRole::Album,
        ColumnRole::Artist,
        ColumnRole::Genre,
        ColumnRole::Cover,
        ColumnRole::Url,
        ColumnRole::Notes,
        ColumnRole::FileDate,
        ColumnRole::LeakDate,
        ColumnRole::Type,
        ColumnRole::Format,
    ];

    /// Header synonyms tried in order; the first header matching the earliest
    /// synonym wins the role.
    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            ColumnRole::Title => &["Name", "Title", "Track", "Song"],
            ColumnRole::Album => &["Era", "Album", "Project", "Release"],
            ColumnRole::Artist => &["Artist", "Credited", "Singer"],
            ColumnRole::Genre => &["Genre", "Category", "Type"],
            ColumnRole::Cover => &["Cover", "Artwork", "Image"],
            ColumnRole::Url => &["Link(s)", "Links", "Link", "URL", "Download"],
            ColumnRole::Notes => &["Notes", "Note", "Description", "Info"],
            ColumnRole::FileDate => &["File Date", "Date", "Recording Date"],
            ColumnRole::LeakDate => &["Leak Date", "Release Date", "Leaked"],
            ColumnRole::Type => &["Type", "Version", "Status"],
            ColumnRole::Format => &["Format", "Quality", "Media Type", "Output"],
        }
    }
}

/// Column index per role, after inference. `None` means the role is absent.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    pub title: Option<usize>,
    pub album: Option<usize>,
    pub url: Option<usize>,
    pub artist: Option<usize>,
    pub genre: Option<usize>,
    pub cover: Option<usize>,
    pub notes: Option<usize>,
    pub format: Option<usize>,
    pub track_type: Option<usize>,
    pub file_date: Option<usize>,
    pub leak_date: Option<usize>,
}

impl ColumnMap {
    fn slot_mut(&mut self, role: ColumnRole) -> &mut Option<usize> {
        match role {
            ColumnRole::Title => &mut self.title,
            ColumnRole::Album => &mut self.album,
            ColumnRole::Artist => &mut self.artist,
            ColumnRole::Genre => &mut self.genre,
            ColumnRole::Cover => &mut self.cover,
            ColumnRole::Url => &mut self.url,
            ColumnRole::Notes => &mut self.notes,
            ColumnRole::FileDate => &mut self.file_date,
            ColumnRole::LeakDate => &mut self.leak_date,
            ColumnRole::Type => &mut self.track_type,
            ColumnRole::Format => &mut self.format,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub headers: Vec<String>,
    pub columns: ColumnMap,
    pub tracks: Vec<Track>,
    pub warnings: Vec<String>,
}

/// Everything the runner needs about one loaded sheet tab.
#[derive(Debug, Clone)]
pub struct SheetData {
    pub sheet_id: String,
    pub gid: String,
    pub title: String,
    pub tracks: Vec<Track>,
    /// Flat link list from the rendered-page fallback; empty in normal mode.
    pub embedded_links: Vec<String>,
    pub warnings: Vec<String>,
    pub working_csv_url: String,
}

impl SheetData {
    pub fn embedded_mode(&self) -> bool {
        !self.embedded_links.is_empty()
    }
}

pub fn extract_sheet_id(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"/spreadsheets/d/([a-zA-Z0-9-_]+)").unwrap());
    re.captures(url).map(|c| c[1].to_string())
}

pub fn extract_gid(url: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"gid=([0-9]+)").unwrap());
    re.captures(url).map(|c| c[1].to_string())
}

/// Export URL forms tried in order; published sheets answer the first form,
/// merely link-shared sheets one of the others.
pub fn csv_export_candidates(sheet_id: &str, gid: &str) -> Vec<String> {
    vec![
        format!("https://docs.google.com/spreadsheets/d/e/{sheet_id}/pub?output=csv&gid={gid}"),
        format!("https://docs.google.com/spreadsheets/d/{sheet_id}/export?format=csv&gid={gid}"),
        format!("https://docs.google.com/spreadsheets/d/{sheet_id}/gviz/tq?tqx=out:csv&gid={gid}"),
    ]
}

pub fn fetch_sheet_tabs(agent: &ureq::Agent, sheet_id: &str) -> Vec<SheetTab> {
    let url = format!("https://docs.google.com/spreadsheets/d/{sheet_id}/edit");
    let Ok(body) = http::fetch_text(agent, &url, &[]) else {
        return Vec::new();
    };
    parse_sheet_tabs(&body)
}

pub fn parse_sheet_tabs(page_html: &str) -> Vec<SheetTab> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#""gid":(\d+),"title":"(.*?)""#).unwrap());

    let mut tabs = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for caps in re.captures_iter(page_html) {
        let gid = caps[1].to_string();
        if !seen.insert(gid.clone()) {
            continue;
        }
        tabs.push(SheetTab {
            gid,
            title: unescape_html_entities(&caps[2]),
        });
    }
    tabs
}

/// Tabs named after the unreleased/main tracker convention are preferred.
pub fn choose_default_tab(tabs: &[SheetTab]) -> Option<&SheetTab> {
    for keyword in ["unreleased", "main"] {
        if let Some(tab) = tabs.iter().find(|t| t.title.to_lowercase().contains(keyword)) {
            return Some(tab);
        }
    }
    tabs.first()
}

pub fn fetch_sheet_title(agent: &ureq::Agent, sheet_url: &str, sheet_id: &str) -> String {
    let mut candidates = Vec::new();
    if !sheet_url.is_empty() {
        candidates.push(sheet_url.split('#').next().unwrap_or(sheet_url).to_string());
    }
    candidates.push(format!("https://docs.google.com/spreadsheets/d/{sheet_id}/edit"));
    candidates.push(format!("https://docs.google.com/spreadsheets/d/{sheet_id}/view"));
    candidates.push(format!("https://docs.google.com/spreadsheets/d/{sheet_id}/pubhtml"));

    for target in candidates {
        let Ok(body) = http::fetch_text(agent, &target, &[]) else {
            continue;
        };
        if let Some(raw) = extract_page_title(&body) {
            let title = raw.replace(" - Google Sheets", "");
            static TRACKER_RE: OnceLock<Regex> = OnceLock::new();
            let tracker = TRACKER_RE.get_or_init(|| Regex::new(r"(?i)tracker").unwrap());
            let title = tracker.replace_all(&title, "");
            let title = title.trim_matches([' ', '-', '_']).to_string();
            if !title.is_empty() {
                return title;
            }
        }
    }
    "Sheet".to_string()
}

fn extract_page_title(page_html: &str) -> Option<String> {
    let document = Html::parse_document(page_html);

    let title_sel = Selector::parse("title").expect("title selector");
    if let Some(el) = document.select(&title_sel).next() {
        let text = el.text().collect::<String>().trim().to_string();
        if !text.is_empty() && !text.to_lowercase().contains("google accounts") {
            return Some(text);
        }
    }

    let og_sel = Selector::parse(r#"meta[property="og:title"]"#).expect("og:title selector");
    if let Some(el) = document.select(&og_sel).next() {
        if let Some(content) = el.value().attr("content") {
            let text = content.trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// First export candidate that answers with plausible CSV wins; remembered so
/// later refetches within the run skip the probing.
pub fn fetch_csv_text(
    agent: &ureq::Agent,
    sheet_id: &str,
    gid: &str,
) -> Result<(String, String)> {
    let mut last_error = String::new();
    for candidate in csv_export_candidates(sheet_id, gid) {
        match http::fetch_text(agent, &candidate, &[]) {
            Ok(text) if text.len() > MIN_CSV_BYTES => return Ok((text, candidate)),
            Ok(_) => last_error = format!("{candidate}: response too small"),
            Err(err) => last_error = format!("{candidate}: {err}"),
        }
    }
    Err(EngineError::SheetUnavailable(last_error))
}

/// Pulls just the header name out of a stacked first-row cell, where the real
/// header is fused with the first data row ("Era 47 Full 0 Tagged...").
pub fn reconstruct_header(cell_text: &str) -> String {
    let first_line = cell_text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return String::new();
    }

    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"(?i)^Era\b", "Era"),
            (r"(?i)^Name\b", "Name"),
            (r"(?i)^Notes?\b", "Notes"),
            (r"(?i)^Track Length\b", "Track Length"),
            (r"(?i)^File Date\b", "File Date"),
            (r"(?i)^Leak Date\b", "Leak Date"),
            (r"(?i)^Type\b", "Type"),
            (r"(?i)^Available\b", "Available"),
            (r"(?i)^Quality\b", "Quality"),
            (r"(?i)^Link\(?s?\)?\b", "Link(s)"),
            (r"(?i)^Artist\b", "Artist"),
            (r"(?i)^Title\b", "Title"),
            (r"(?i)^Album\b", "Album"),
            (r"(?i)^Genre\b", "Genre"),
            (r"(?i)^Cover\b", "Cover"),
            (r"(?i)^URL\b", "URL"),
            (r"(?i)^Download\b", "Download"),
            (r"(?i)^Project\b", "Project"),
        ]
        .iter()
        .map(|(pattern, name)| (Regex::new(pattern).unwrap(), *name))
        .collect()
    });

    for (pattern, name) in patterns.iter() {
        if pattern.is_match(first_line) {
            return (*name).to_string();
        }
    }

    if first_line.len() < 50 && !first_line.to_lowercase().contains("http") {
        return first_line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
    }
    String::new()
}

/// First non-blank line of a cell with inner whitespace collapsed.
pub fn clean_multiline_value(value: &str) -> String {
    let normalized = value.replace('\r', "\n");
    let first = normalized
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    static WS_RE: OnceLock<Regex> = OnceLock::new();
    let ws = WS_RE.get_or_init(|| Regex::new(r"\s+").unwrap());
    ws.replace_all(first, " ").trim().to_string()
}

/// Every line after the first from a multi-line title cell (performer notes,
/// alternate names) joined back together for metadata output.
pub fn extra_title_lines(value: &str) -> String {
    let lines: Vec<String> = value
        .replace('\r', "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() > 1 {
        lines[1..].join("\n")
    } else {
        String::new()
    }
}

pub fn extract_urls_from_cell(cell_value: &str) -> Vec<String> {
    let text = cell_value.replace(['\n', '\r'], " ").trim().to_string();
    if text.is_empty() {
        return Vec::new();
    }

    static URL_RE: OnceLock<Regex> = OnceLock::new();
    static PILLOWS_RE: OnceLock<Regex> = OnceLock::new();
    let url_re = URL_RE.get_or_init(|| Regex::new(r"(?i)(https?://[^\s,]+)").unwrap());
    let pillows_re = PILLOWS_RE
        .get_or_init(|| Regex::new(r"(?i)((?:https?://)?pillows\.su/[^\s,]+)").unwrap());

    let mut found: Vec<String> = url_re
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect();
    if found.is_empty() && text.to_lowercase().contains("pillows.su") {
        found = pillows_re
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .collect();
    }

    let mut cleaned = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for url in found {
        let trimmed = url.trim().trim_end_matches([')', '.', ',', ';', '\'', '"']);
        if trimmed.is_empty() {
            continue;
        }
        let with_scheme = if trimmed.to_lowercase().starts_with("http") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let normalized = with_scheme.trim_end_matches('/').to_lowercase();
        if seen.insert(normalized) {
            cleaned.push(with_scheme);
        }
    }
    cleaned
}

pub fn is_image_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if [".jpg", ".jpeg", ".png", ".gif", ".webp"]
        .iter()
        .any(|ext| path.ends_with(ext))
    {
        return true;
    }
    let lowered = url.to_lowercase();
    ["googleusercontent", "imgur", "ibb.co", "postimg", "cdn.discordapp.com"]
        .iter()
        .any(|host| lowered.contains(host))
}

/// First image-looking URL in a cover cell, else the first URL at all.
pub fn extract_cover_url(cell_value: &str) -> String {
    let urls = extract_urls_from_cell(cell_value);
    urls.iter()
        .find(|u| is_image_url(u))
        .or_else(|| urls.first())
        .cloned()
        .unwrap_or_default()
}

/// Best date-like value anywhere in the row, preferring real date shapes over
/// bare years, skipping the noisy columns the caller names.
pub fn find_first_date_in_row(values: &[String], exclude: &[Option<usize>]) -> String {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    static MONTH_RE: OnceLock<Regex> = OnceLock::new();
    static YEAR_RE: OnceLock<Regex> = OnceLock::new();
    let date_re =
        DATE_RE.get_or_init(|| Regex::new(r"\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\b").unwrap());
    let month_re = MONTH_RE.get_or_init(|| {
        Regex::new(r"(?i)\b((?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4})\b").unwrap()
    });
    let year_re = YEAR_RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").unwrap());

    let excluded = |idx: usize| exclude.iter().any(|e| *e == Some(idx));

    for (idx, value) in values.iter().enumerate() {
        if excluded(idx) {
            continue;
        }
        let text = value.trim();
        if text.is_empty() || text.len() > 100 {
            continue;
        }
        if let Some(caps) = date_re.captures(text) {
            return caps[1].to_string();
        }
        if let Some(caps) = month_re.captures(text) {
            return caps[1].to_string();
        }
    }

    for (idx, value) in values.iter().enumerate() {
        if excluded(idx) {
            continue;
        }
        let text = value.trim();
        if text.is_empty() || text.len() > 20 {
            continue;
        }
        if let Some(caps) = year_re.captures(text) {
            return caps[1].to_string();
        }
    }
    String::new()
}

fn find_best_column(headers: &[String], preferred: &[&str]) -> Option<usize> {
    for pref in preferred {
        for (idx, name) in headers.iter().enumerate() {
            if name.eq_ignore_ascii_case(pref) {
                return Some(idx);
            }
        }
    }
    None
}

fn sample_has_links(rows: &[Vec<String>], column: usize) -> bool {
    rows.iter().take(URL_PROBE_ROWS).any(|row| {
        row.get(column)
            .map(|value| {
                let lowered = value.to_lowercase();
                lowered.contains("http") || lowered.contains("pillows")
            })
            .unwrap_or(false)
    })
}

pub fn infer_columns(
    headers: &[String],
    rows: &[Vec<String>],
    warnings: &mut Vec<String>,
) -> ColumnMap {
    let mut map = ColumnMap::default();
    for role in ColumnRole::ALL {
        *map.slot_mut(role) = find_best_column(headers, role.synonyms());
    }

    if map.title.is_none() {
        let fallback = if headers.len() > 1 { 1 } else { 0 };
        warnings.push(format!(
            "no title column found, falling back to '{}'",
            headers.get(fallback).map(String::as_str).unwrap_or("?")
        ));
        map.title = Some(fallback);
    }

    let url_ok = map.url.map(|idx| sample_has_links(rows, idx)).unwrap_or(false);
    if !url_ok {
        let promoted = (0..headers.len()).find(|idx| sample_has_links(rows, *idx));
        match promoted {
            Some(idx) => {
                if map.url != Some(idx) {
                    warnings.push(format!("found links in column '{}'", headers[idx]));
                    map.url = Some(idx);
                }
            }
            None => {
                warnings.push("no column with literal links detected".to_string());
            }
        }
    }

    map
}

/// Parses the raw CSV export into Tracks. Pure text-in, tracks-out so it can
/// be exercised without any network.
pub fn parse_sheet_text(csv_text: &str, sheet_title: &str) -> Result<ParsedSheet> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for record in rdr.records() {
        let record = record?;
        raw_rows.push(record.iter().map(str::to_string).collect());
    }
    if raw_rows.is_empty() {
        return Err(EngineError::SheetUnavailable("sheet returned no rows".to_string()));
    }

    let header_row = raw_rows.remove(0);
    let mut headers: Vec<String> = header_row
        .iter()
        .map(|cell| reconstruct_header(cell))
        .collect();
    for (idx, header) in headers.iter_mut().enumerate() {
        if header.is_empty() {
            *header = format!("Column {}", idx + 1);
        }
    }

    // Materialized view: first line of every cell, the shape role probing and
    // date scanning work on. Raw cells stay around for multi-line title info.
    let materialized: Vec<Vec<String>> = raw_rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| cell.lines().next().unwrap_or("").trim().to_string())
                .collect()
        })
        .collect();

    let mut warnings = Vec::new();
    let columns = infer_columns(&headers, &materialized, &mut warnings);

    let mut tracks = Vec::new();
    for (raw, values) in raw_rows.iter().zip(materialized.iter()) {
        if values.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        let cell = |idx: Option<usize>| -> &str {
            idx.and_then(|i| raw.get(i)).map(String::as_str).unwrap_or("")
        };

        let idx = tracks.len();
        let raw_title = cell(columns.title);
        let mut title = clean_multiline_value(raw_title);
        let additional_info = extra_title_lines(raw_title);
        let album = clean_multiline_value(cell(columns.album));
        let mut artist = clean_multiline_value(cell(columns.artist));
        let genre = clean_multiline_value(cell(columns.genre));
        let cover_url = extract_cover_url(cell(columns.cover));
        let notes = clean_multiline_value(cell(columns.notes));
        let track_type = clean_multiline_value(cell(columns.track_type));
        let format = clean_multiline_value(cell(columns.format));
        let leak_date = clean_multiline_value(cell(columns.leak_date));
        let mut file_date = clean_multiline_value(cell(columns.file_date));
        if file_date.is_empty() {
            file_date = find_first_date_in_row(values, &[columns.notes, columns.title]);
        }

        if is_junk_value(&artist) {
            artist = if sheet_title.is_empty() {
                "Unknown Artist".to_string()
            } else {
                sheet_title.to_string()
            };
        }
        if is_junk_value(&title) {
            title = format!("Track {}", idx + 1);
        }

        let urls = extract_urls_from_cell(cell(columns.url));

        tracks.push(Track {
            title,
            additional_info,
            artist,
            album,
            genre,
            cover_url,
            notes,
            file_date,
            leak_date,
            track_type,
            format,
            urls,
        });
    }

    Ok(ParsedSheet {
        headers,
        columns,
        tracks,
        warnings,
    })
}

/// Resolves, fetches, and parses one sheet tab; drops to the rendered-page
/// link fallback when no row carried a literal link.
pub fn load_sheet(
    agent: &ureq::Agent,
    sheet_url: &str,
    gid_override: Option<&str>,
) -> Result<SheetData> {
    let sheet_id = extract_sheet_id(sheet_url)
        .ok_or_else(|| EngineError::InvalidInput(format!("not a sheet url: {sheet_url}")))?;

    let gid = match gid_override {
        Some(gid) => gid.to_string(),
        None => match extract_gid(sheet_url) {
            Some(gid) => gid,
            None => {
                let tabs = fetch_sheet_tabs(agent, &sheet_id);
                choose_default_tab(&tabs)
                    .map(|tab| tab.gid.clone())
                    .unwrap_or_else(|| "0".to_string())
            }
        },
    };

    let title = fetch_sheet_title(agent, sheet_url, &sheet_id);
    let (csv_text, working_csv_url) = fetch_csv_text(agent, &sheet_id, &gid)?;
    let parsed = parse_sheet_text(&csv_text, &title)?;

    let mut warnings = parsed.warnings;
    let mut embedded_links = Vec::new();
    let usable_rows = parsed.tracks.len();
    if usable_rows > 0 && parsed.tracks.iter().all(|t| t.urls.is_empty()) {
        embedded_links = embedded::extract_known_host_links(agent, &sheet_id, &gid);
        if embedded_links.is_empty() {
            warnings.push("no links in cells and none embedded in the page".to_string());
        } else if embedded_links.len() != usable_rows {
            warnings.push(format!(
                "link/row count mismatch: {} embedded links for {} rows, titles will be positional",
                embedded_links.len(),
                usable_rows
            ));
        }
    }

    Ok(SheetData {
        sheet_id,
        gid,
        title,
        tracks: parsed.tracks,
        embedded_links,
        warnings,
        working_csv_url,
    })
}

fn unescape_html_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_reconstruction_extracts_known_names() {
        assert_eq!(reconstruct_header("Era 47 Full 0 Tagged"), "Era");
        assert_eq!(reconstruct_header("Name\nSong One"), "Name");
        assert_eq!(reconstruct_header("links"), "Link(s)");
        assert_eq!(reconstruct_header("Link(s)"), "Link(s)");
        assert_eq!(reconstruct_header("Quality 128kbps"), "Quality");
    }

    #[test]
    fn header_reconstruction_falls_back_to_first_word() {
        assert_eq!(reconstruct_header("Weird Header"), "Weird");
        assert_eq!(reconstruct_header(""), "");
        assert_eq!(reconstruct_header("https://example.com/file.mp3"), "");
        let long = "x".repeat(60);
        assert_eq!(reconstruct_header(&long), "");
    }

    #[test]
    fn url_extraction_dedupes_and_trims() {
        let urls = extract_urls_from_cell(
            "https://host/a.mp3, https://host/a.mp3/ (https://host/b.mp3),",
        );
        assert_eq!(urls, vec!["https://host/a.mp3", "https://host/b.mp3"]);
    }

    #[test]
    fn url_extraction_recovers_schemeless_pillows() {
        let urls = extract_urls_from_cell("pillows.su/f/abc123");
        assert_eq!(urls, vec!["https://pillows.su/f/abc123"]);
    }

    #[test]
    fn multiline_link_cells_keep_every_line() {
        let csv = "Name,Link(s)\nSong A,\"https://host/a.mp3\nhttps://host/b.mp3\"\n";
        let parsed = parse_sheet_text(csv, "Sheet").expect("parse");
        assert_eq!(
            parsed.tracks[0].urls,
            vec!["https://host/a.mp3", "https://host/b.mp3"]
        );
    }

    #[test]
    fn multiline_values_pick_first_line_and_keep_extras() {
        assert_eq!(
            clean_multiline_value("Main   Title\nft. Someone\n(alt name)"),
            "Main Title"
        );
        assert_eq!(
            extra_title_lines("Main Title\nft. Someone\n(alt name)"),
            "ft. Someone\n(alt name)"
        );
        assert_eq!(extra_title_lines("Only Line"), "");
    }

    #[test]
    fn date_scanning_prefers_full_dates_over_years() {
        let values = vec![
            "Song".to_string(),
            "recorded 3/14/2019 in studio".to_string(),
            "1998".to_string(),
        ];
        assert_eq!(find_first_date_in_row(&values, &[Some(0)]), "3/14/2019");

        let only_year = vec!["Song".to_string(), "1998".to_string()];
        assert_eq!(find_first_date_in_row(&only_year, &[Some(0)]), "1998");

        let excluded = vec!["4/1/2020".to_string()];
        assert_eq!(find_first_date_in_row(&excluded, &[Some(0)]), "");
    }

    #[test]
    fn three_row_scenario_parses_as_specified() {
        let csv = "Name,Era,Link(s)\n\
                   Song A,Album X,https://host/a.mp3\n\
                   Song B,,\n\
                   Song C,Album X,\"https://host/c.mp3,https://host/c2.mp3\"\n";
        let parsed = parse_sheet_text(csv, "My Sheet").expect("parse");

        assert_eq!(parsed.headers, vec!["Name", "Era", "Link(s)"]);
        assert_eq!(parsed.columns.title, Some(0));
        assert_eq!(parsed.columns.album, Some(1));
        assert_eq!(parsed.columns.url, Some(2));

        assert_eq!(parsed.tracks.len(), 3);
        assert_eq!(parsed.tracks[0].title, "Song A");
        assert_eq!(parsed.tracks[0].album, "Album X");
        assert_eq!(parsed.tracks[0].urls, vec!["https://host/a.mp3"]);
        assert!(parsed.tracks[1].urls.is_empty());
        assert_eq!(parsed.tracks[2].urls.len(), 2);
    }

    #[test]
    fn blank_rows_are_dropped() {
        let csv = "Name,Link(s)\n,,\nSong A,https://host/a.mp3\n  ,\n";
        let parsed = parse_sheet_text(csv, "Sheet").expect("parse");
        assert_eq!(parsed.tracks.len(), 1);
        assert_eq!(parsed.tracks[0].title, "Song A");
    }

    #[test]
    fn junk_titles_and_artists_get_fallbacks() {
        let csv = "Name,Artist,Link(s)\nunknown,n/a,https://host/a.mp3\n";
        let parsed = parse_sheet_text(csv, "Best Sheet").expect("parse");
        assert_eq!(parsed.tracks[0].title, "Track 1");
        assert_eq!(parsed.tracks[0].artist, "Best Sheet");
    }

    #[test]
    fn url_column_promoted_when_named_column_has_no_links() {
        let csv = "Name,Link(s),Mirror\nSong A,MP3,https://host/a.mp3\n";
        let mut warnings = Vec::new();
        let rows = vec![vec![
            "Song A".to_string(),
            "MP3".to_string(),
            "https://host/a.mp3".to_string(),
        ]];
        let headers = vec!["Name".to_string(), "Link(s)".to_string(), "Mirror".to_string()];
        let map = infer_columns(&headers, &rows, &mut warnings);
        assert_eq!(map.url, Some(2));
        assert!(warnings.iter().any(|w| w.contains("Mirror")));

        let parsed = parse_sheet_text(csv, "Sheet").expect("parse");
        assert_eq!(parsed.tracks[0].urls, vec!["https://host/a.mp3"]);
    }

    #[test]
    fn title_column_falls_back_to_second_physical_column() {
        let headers = vec!["Column 1".to_string(), "Column 2".to_string()];
        let mut warnings = Vec::new();
        let map = infer_columns(&headers, &[], &mut warnings);
        assert_eq!(map.title, Some(1));
        assert!(!warnings.is_empty());
    }

    #[test]
    fn sheet_ids_and_gids_parse_from_urls() {
        let url = "https://docs.google.com/spreadsheets/d/abc_DEF-123/edit#gid=42";
        assert_eq!(extract_sheet_id(url), Some("abc_DEF-123".to_string()));
        assert_eq!(extract_gid(url), Some("42".to_string()));
        assert_eq!(extract_sheet_id("https://example.com/"), None);
    }

    #[test]
    fn tab_listing_dedupes_gids_and_unescapes_titles() {
        let html = r#"{"gid":0,"title":"Main &amp; Extras"},{"gid":42,"title":"Unreleased"},{"gid":0,"title":"dup"}"#;
        let tabs = parse_sheet_tabs(html);
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].title, "Main & Extras");
        let default = choose_default_tab(&tabs).expect("default tab");
        assert_eq!(default.gid, "42");
    }

    #[test]
    fn cover_urls_prefer_images() {
        let cell = "https://host/page.html https://i.imgur.com/x.png";
        assert_eq!(extract_cover_url(cell), "https://i.imgur.com/x.png");
        assert!(is_image_url("https://files.example/cover.jpg"));
        assert!(!is_image_url("https://files.example/cover.txt"));
    }
}
