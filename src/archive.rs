//! Zip packaging of a finished run's output tree.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

fn zip_err_to_io(err: zip::result::ZipError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Packs every file under `folder` into a timestamped `tracks_*.zip` written
/// next to the folder. Earlier archives and leftover `.part` temp files are
/// left out.
pub fn zip_output_folder(folder: &Path) -> Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let parent = folder.parent().unwrap_or(folder);
    let zip_path = parent.join(format!("tracks_{timestamp}.zip"));

    let mut files = Vec::new();
    collect_files(folder, &mut files)?;
    files.sort();

    let file = std::fs::File::create(&zip_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut buf = [0_u8; 64 * 1024];
    for path in files {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".zip") || name.ends_with(".part") {
            continue;
        }
        let Ok(relative) = path.strip_prefix(folder) else {
            continue;
        };
        let arc_name = relative.to_string_lossy().replace('\\', "/");

        zip.start_file(arc_name, options).map_err(zip_err_to_io)?;
        let mut source = std::fs::File::open(&path)?;
        loop {
            let read = source.read(&mut buf)?;
            if read == 0 {
                break;
            }
            zip.write_all(&buf[..read])?;
        }
    }

    zip.finish().map_err(zip_err_to_io)?;
    Ok(zip_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_tree_and_skips_zips_and_temps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sheet_dir = dir.path().join("My Sheet");
        std::fs::create_dir_all(sheet_dir.join("Era A")).expect("mkdir");
        std::fs::write(sheet_dir.join("Era A").join("track.mp3"), b"audio").expect("write");
        std::fs::write(sheet_dir.join("cover.jpg"), b"img").expect("write");
        std::fs::write(sheet_dir.join("stale.zip"), b"old").expect("write");
        std::fs::write(sheet_dir.join("half.mp3.part"), b"tmp").expect("write");

        let zip_path = zip_output_folder(&sheet_dir).expect("zip");
        assert_eq!(zip_path.parent(), Some(dir.path()));
        let zip_name = zip_path.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(zip_name.starts_with("tracks_") && zip_name.ends_with(".zip"));

        let archive =
            zip::ZipArchive::new(std::fs::File::open(&zip_path).expect("open")).expect("read zip");
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Era A/track.mp3", "cover.jpg"]);
    }
}
