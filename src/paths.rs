use std::path::{Path, PathBuf};

/// Characters that are never allowed in a produced file or folder name.
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '*'];

/// Placeholder-ish cell values that mean "no real value here".
const JUNK_VALUES: &[&str] = &["unknown", "untitled", "n/a", "na", "tbd"];

/// Makes a track or folder title safe for every filesystem we target.
///
/// Question marks are kept visible as `¿` so titles like "???" survive instead
/// of collapsing to an empty name.
pub fn sanitize_title(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch == '?' {
            out.push('¿');
        } else if !FORBIDDEN_NAME_CHARS.contains(&ch) {
            out.push(ch);
        }
    }
    out.trim().to_string()
}

pub fn is_junk_value(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    JUNK_VALUES.iter().any(|junk| *junk == lowered)
}

/// Returns `path` if nothing exists there yet, otherwise the first
/// ` (2)`, ` (3)`, ... variant that is free. Never touches existing files.
pub fn resolve_duplicate(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|v| v.to_str())
        .unwrap_or("track")
        .to_string();
    let ext = path.extension().and_then(|v| v.to_str()).map(str::to_string);
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut counter = 2_u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({counter}).{ext}"),
            None => format!("{stem} ({counter})"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

const COVER_IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Any already-saved artwork in the folder, checking the conventional cover
/// file names in order.
pub fn find_existing_cover(folder: &Path) -> Option<PathBuf> {
    for stem in ["cover", "folder", "front"] {
        for ext in COVER_IMAGE_EXTS {
            let candidate = folder.join(format!("{stem}.{ext}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Owns the on-disk layout of one run: `root/<sheet>/[<album>/]<file>`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn sheet_dir(&self, sheet_title: &str) -> PathBuf {
        let safe = sanitize_title(sheet_title);
        if safe.is_empty() {
            self.root.join("sheet")
        } else {
            self.root.join(safe)
        }
    }

    /// Album folder under the sheet folder; falls back to the sheet folder when
    /// the album is unknown or a junk placeholder.
    pub fn track_dir(&self, sheet_title: &str, album: Option<&str>) -> PathBuf {
        let sheet = self.sheet_dir(sheet_title);
        match album {
            Some(album) if !is_junk_value(album) => {
                let safe = sanitize_title(album);
                if safe.is_empty() {
                    sheet
                } else {
                    sheet.join(safe)
                }
            }
            _ => sheet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_preserves_question_marks_as_stand_ins() {
        let out = sanitize_title("??? [V1]");
        assert_eq!(out, "¿¿¿ [V1]");
        assert!(!out.contains('?'));
        for ch in FORBIDDEN_NAME_CHARS {
            assert!(!out.contains(*ch));
        }
    }

    #[test]
    fn sanitize_strips_forbidden_characters() {
        assert_eq!(sanitize_title("a<b>c:d\"e/f\\g|h*i"), "abcdefghi");
        assert_eq!(sanitize_title("  padded  "), "padded");
    }

    #[test]
    fn junk_values_are_case_insensitive() {
        assert!(is_junk_value("Unknown"));
        assert!(is_junk_value(" N/A "));
        assert!(is_junk_value(""));
        assert!(!is_junk_value("Album X"));
    }

    #[test]
    fn resolve_duplicate_yields_distinct_monotonic_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("song.mp3");

        let first = resolve_duplicate(&base);
        assert_eq!(first, base);
        std::fs::write(&first, b"one").expect("write first");

        let second = resolve_duplicate(&base);
        assert_eq!(second, dir.path().join("song (2).mp3"));
        std::fs::write(&second, b"two").expect("write second");

        let third = resolve_duplicate(&base);
        assert_eq!(third, dir.path().join("song (3).mp3"));

        assert_eq!(std::fs::read(&base).expect("read first"), b"one");
        assert_eq!(std::fs::read(&second).expect("read second"), b"two");
    }

    #[test]
    fn resolve_duplicate_handles_extensionless_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("cover");
        std::fs::write(&base, b"x").expect("write");
        assert_eq!(resolve_duplicate(&base), dir.path().join("cover (2)"));
    }

    #[test]
    fn existing_covers_are_found_under_conventional_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(find_existing_cover(dir.path()), None);

        std::fs::write(dir.path().join("front.webp"), b"x").expect("write");
        assert_eq!(
            find_existing_cover(dir.path()),
            Some(dir.path().join("front.webp"))
        );

        // "cover" wins over the other stems.
        std::fs::write(dir.path().join("cover.png"), b"x").expect("write");
        assert_eq!(
            find_existing_cover(dir.path()),
            Some(dir.path().join("cover.png"))
        );
    }

    #[test]
    fn track_dir_omits_unknown_album() {
        let layout = OutputLayout::new(PathBuf::from("/tmp/out"));
        assert_eq!(
            layout.track_dir("My Sheet", Some("Album X")),
            PathBuf::from("/tmp/out/My Sheet/Album X")
        );
        assert_eq!(
            layout.track_dir("My Sheet", Some("unknown")),
            PathBuf::from("/tmp/out/My Sheet")
        );
        assert_eq!(
            layout.track_dir("My Sheet", None),
            PathBuf::from("/tmp/out/My Sheet")
        );
    }
}
