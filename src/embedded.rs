use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::http;

/// URL shapes for every host the engine can download from. Scanned over the
/// rendered sheet page when cells hold display text instead of links.
const KNOWN_HOST_PATTERNS: &[&str] = &[
    r#"https?://api\.pillows\.su/api/download[^\s"'<>\\]*"#,
    r#"https?://(?:www\.)?pillows\.su/f/[A-Za-z0-9]+"#,
    r#"https?://(?:www\.)?plwcse\.top/f/[A-Za-z0-9]+"#,
    r#"https?://(?:www\.)?krakenfiles\.com/(?:view|embed-audio)/[A-Za-z0-9]+[^\s"'<>\\]*"#,
    r#"https?://music\.froste\.lol/song/[A-Za-z0-9]+[^\s"'<>\\]*"#,
    r#"https?://(?:www\.)?froste\.lol/song/[A-Za-z0-9]+[^\s"'<>\\]*"#,
    r#"https?://(?:www\.)?pixeldrain\.com/(?:u|l)/[A-Za-z0-9]+[^\s"'<>\\]*"#,
    r#"https?://[a-z0-9.-]*fileditch[a-z0-9.-]*/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?bumpworthy\.com/(?:bumps|download/(?:video|audio))/\d+"#,
    r#"https?://drive\.google\.com/[^\s"'<>\\]+"#,
    r#"https?://docs\.google\.com/(?:uc|open|file/d/)[^\s"'<>\\]+"#,
    r#"https?://mega(?:\.co)?\.nz/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?youtube\.com/watch[^\s"'<>\\]+"#,
    r#"https?://youtu\.be/[^\s"'<>\\]+"#,
    r#"https?://(?:on\.)?soundcloud\.com/[^\s"'<>\\]+"#,
    r#"https?://i\.imgur\.com/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?imgur\.com/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?imgur\.gg/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?ibb\.co/[^\s"'<>\\]+"#,
    r#"https?://(?:www\.)?gofile\.io/d/[A-Za-z0-9]+"#,
    r#"https?://(?:www\.)?mediafire\.com/[^\s"'<>\\]+"#,
    r#"https?://[a-z0-9.-]*s3[a-z0-9.-]*\.amazonaws\.com/[^\s"'<>\\]+"#,
];

/// Fetches the rendered view of the sheet and pulls out every known-host link
/// in document order. Best effort: network trouble yields an empty list.
pub fn extract_known_host_links(agent: &ureq::Agent, sheet_id: &str, gid: &str) -> Vec<String> {
    let url = format!("https://docs.google.com/spreadsheets/d/{sheet_id}/htmlview?gid={gid}");
    match http::fetch_text(agent, &url, &[]) {
        Ok(body) => scan_links(&body),
        Err(_) => Vec::new(),
    }
}

/// Document-order scan of `page_text` for known host URLs. Escaped slashes are
/// decoded first since the page embeds cell data inside JSON string literals.
pub fn scan_links(page_text: &str) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        KNOWN_HOST_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
            .collect()
    });

    let unescaped = page_text.replace("\\/", "/");

    let mut hits: Vec<(usize, String)> = Vec::new();
    for pattern in patterns.iter() {
        for m in pattern.find_iter(&unescaped) {
            hits.push((m.start(), m.as_str().to_string()));
        }
    }
    hits.sort_by_key(|(start, _)| *start);

    let mut links = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (_, url) in hits {
        let trimmed = url.trim_end_matches(['.', ',', ';']).to_string();
        let normalized = trimmed.trim_end_matches('/').to_lowercase();
        if seen.insert(normalized) {
            links.push(trimmed);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_links_in_document_order() {
        let page = r#"{"c":[{"v":"https:\/\/krakenfiles.com\/view\/abc123\/file.html"}]}
            <a href="https://pixeldrain.com/u/XYZ9">MP3</a>
            <td>https://pillows.su/f/00ff00</td>"#;
        let links = scan_links(page);
        assert_eq!(
            links,
            vec![
                "https://krakenfiles.com/view/abc123/file.html",
                "https://pixeldrain.com/u/XYZ9",
                "https://pillows.su/f/00ff00",
            ]
        );
    }

    #[test]
    fn scan_dedupes_case_insensitively() {
        let page = "https://pixeldrain.com/u/AAA https://PIXELDRAIN.com/u/AAA/";
        assert_eq!(scan_links(page), vec!["https://pixeldrain.com/u/AAA"]);
    }

    #[test]
    fn scan_ignores_unknown_hosts_and_sheet_chrome() {
        let page = r#"<a href="https://docs.google.com/spreadsheets/d/abc/edit">self</a>
            <a href="https://example.com/x.mp3">direct</a>
            <a href="https://mega.nz/file/id#keykeykey">mega</a>"#;
        let links = scan_links(page);
        assert_eq!(links, vec!["https://mega.nz/file/id#keykeykey"]);
    }
}
