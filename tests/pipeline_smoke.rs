use std::io::Cursor;
use std::path::PathBuf;

use tracksheet_engine::http;
use tracksheet_engine::runner::{self, RunControl, RunOptions};
use tracksheet_engine::sheet::{self, SheetData};
use tracksheet_engine::EngineError;

const SMOKE_SHEET_ENV_VAR: &str = "TRACKSHEET_SMOKE_SHEET";

/// A trimmed-down tracker export: multi-line header cells, a multi-link row,
/// a row with no links, and a blank spacer row.
const NOISY_EXPORT: &str = "\
Era,\"Name\n(as tagged)\",Quality,\"Link(s)\nclick to open\",Notes,Leak Date\n\
Debut,Intro,256 kbps,https://pillows.su/f/abc123def,solid rip,2021-03-01\n\
Debut,Duet,FLAC,\"https://krakenfiles.com/view/a1B2c3d4/file.html https://pixeldrain.com/u/xYz12345\",second source,\n\
Debut,Sketch,,not leaked,,\n\
,,,,,\n";

fn parsed_sheet_data(csv_text: &str, title: &str) -> SheetData {
    let parsed = sheet::parse_sheet_text(csv_text, title)
        .unwrap_or_else(|e| panic!("export should parse: {e}"));
    SheetData {
        sheet_id: "smoke".to_string(),
        gid: "0".to_string(),
        title: title.to_string(),
        tracks: parsed.tracks,
        embedded_links: Vec::new(),
        warnings: parsed.warnings,
        working_csv_url: String::new(),
    }
}

#[test]
fn multiline_headers_recover_their_roles() {
    let parsed = sheet::parse_sheet_text(NOISY_EXPORT, "Best Sheet")
        .unwrap_or_else(|e| panic!("export should parse: {e}"));

    assert_eq!(parsed.headers[1], "Name");
    assert_eq!(parsed.headers[3], "Link(s)");
    assert_eq!(parsed.columns.album, Some(0));
    assert_eq!(parsed.columns.title, Some(1));
    assert_eq!(parsed.columns.format, Some(2));
    assert_eq!(parsed.columns.url, Some(3));
    assert_eq!(parsed.columns.notes, Some(4));
    assert_eq!(parsed.columns.leak_date, Some(5));
}

#[test]
fn noisy_export_plans_one_job_per_link() {
    let dir = tempfile::tempdir().unwrap();
    let data = parsed_sheet_data(NOISY_EXPORT, "Best Sheet");

    assert_eq!(data.tracks.len(), 3, "blank spacer row should be dropped");
    assert_eq!(data.tracks[0].urls.len(), 1);
    assert_eq!(data.tracks[1].urls.len(), 2);
    assert!(data.tracks[2].urls.is_empty(), "'not leaked' is not a link");

    let mut options = RunOptions::default();
    options.output_root = dir.path().to_path_buf();
    let jobs = runner::plan_jobs(&data, &options);

    let titles: Vec<&str> = jobs.iter().map(|j| j.title.as_str()).collect();
    assert_eq!(titles, ["Intro", "Duet (Link 1)", "Duet (Link 2)"]);

    let era_dir: PathBuf = dir.path().join("Best Sheet").join("Debut");
    for job in &jobs {
        assert_eq!(job.target_folder, era_dir, "all rows share the era folder");
        assert!(!job.prefer_remote_name);
    }
    assert_eq!(jobs[1].source_url, data.tracks[1].urls[0]);
}

#[test]
fn finished_streams_hash_and_land_without_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("payload.bin");
    let body = vec![7_u8; 200_000];
    let control = RunControl::new();

    let outcome = http::stream_to_file(&mut Cursor::new(body), &dest, &control)
        .unwrap_or_else(|e| panic!("stream should finish: {e}"));

    assert_eq!(outcome.bytes_written, 200_000);
    assert!(dest.exists());
    assert!(!http::part_path(&dest).exists(), "temp file should be renamed away");

    let on_disk = http::sha256_file_hex(&dest).unwrap();
    assert_eq!(outcome.sha256_hex, on_disk);
}

#[test]
fn canceled_streams_never_reach_the_final_path() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("payload.bin");
    let body = vec![0_u8; 500_000];
    let control = RunControl::new();
    control.cancel();

    let err = http::stream_to_file(&mut Cursor::new(body), &dest, &control)
        .expect_err("canceled control should stop the stream");

    assert!(matches!(err, EngineError::Canceled));
    assert!(!dest.exists(), "a truncated body must never land at the final path");
    let partial = std::fs::read(http::part_path(&dest)).unwrap();
    assert!(partial.is_empty(), "cancel came before the first chunk");
}

#[test]
#[ignore = "manual smoke against a live public sheet"]
fn live_sheet_loads_and_plans() -> Result<(), String> {
    let sheet_url = std::env::var(SMOKE_SHEET_ENV_VAR)
        .map_err(|_| format!("set {SMOKE_SHEET_ENV_VAR} to a public sheet url"))?;

    let agent = http::build_http_agent(http::PAGE_TIMEOUT_SECS);
    let data = sheet::load_sheet(&agent, &sheet_url, None)
        .map_err(|e| format!("load_sheet failed: {e}"))?;

    println!("sheet: {} ({} rows)", data.title, data.tracks.len());
    for warning in &data.warnings {
        println!("note: {warning}");
    }

    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let mut options = RunOptions::default();
    options.output_root = dir.path().to_path_buf();
    let jobs = runner::plan_jobs(&data, &options);
    println!("planned {} jobs", jobs.len());
    if jobs.is_empty() {
        return Err("live sheet produced no jobs".to_string());
    }
    Ok(())
}
