//! Upload validation and scratch-file handling for image classification.

use std::{fs, io::Write, path::Path};

use tempfile::{Builder, NamedTempFile};
use unicode_normalization::UnicodeNormalization;

use crate::error::ServiceError;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Longest client-derived stem kept in a scratch file name.
pub const MAX_STEM_CHARS: usize = 64;

/// Lowercased text after the last `.`, if any.
pub fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

pub fn allowed_file(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Reduces a client supplied filename to a flat, ASCII-only name that is
/// safe to join onto the scratch directory. Accented letters are decomposed
/// (NFKD) so their base letter survives. May return an empty string.
pub fn secure_filename(filename: &str) -> String {
    let flattened: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// An uploaded file persisted into the scratch directory.
///
/// The file is created under a unique name derived from the sanitized client
/// filename and is removed when the guard is dropped, whatever the outcome of
/// the request. If persisting fails nothing is left behind.
#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    pub fn persist(dir: &Path, filename: &str, contents: &[u8]) -> Result<Self, ServiceError> {
        let ext: String = extension(filename)
            .unwrap_or_default()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let sanitized = secure_filename(filename);
        let stem = sanitized
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(sanitized.as_str());
        // sanitized names are ASCII, so char count equals byte count
        let stem = &stem[..stem.len().min(MAX_STEM_CHARS)];
        let stem = if stem.is_empty() { "upload" } else { stem };

        let mut file = Builder::new()
            .prefix(&format!("{stem}-"))
            .suffix(&format!(".{ext}"))
            .tempfile_in(dir)?;
        file.write_all(contents)?;
        file.flush()?;

        tracing::debug!(
            path = %file.path().display(),
            bytes = contents.len(),
            "upload persisted"
        );
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Creates the scratch directory if it does not exist yet.
pub fn ensure_scratch_dir(dir: &Path) -> Result<(), ServiceError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        tracing::info!(path = %dir.display(), "created scratch directory");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn extension_checks_are_case_insensitive() {
        assert!(allowed_file("cat.JPG"));
        assert!(allowed_file("archive.tar.png"));
        assert!(allowed_file("photo.jpeg"));
        assert!(!allowed_file("malware.exe"));
        assert!(!allowed_file("png"));
        assert!(!allowed_file("image.png.exe"));
    }

    #[test]
    fn sanitizes_traversal_and_unsafe_characters() {
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("..\\windows\\cat.jpg"), "windows_cat.jpg");
        assert_eq!(
            secure_filename("i contain cool \u{fc}ml\u{e4}uts.png"),
            "i_contain_cool_umlauts.png"
        );
        assert_eq!(secure_filename("../.."), "");
    }

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchFile::persist(dir.path(), "../sample.jpg", b"bytes").unwrap();
        let path = scratch.path().to_path_buf();

        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("sample-"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(fs::read(&path).unwrap(), b"bytes");

        drop(scratch);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn same_name_uploads_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let first = ScratchFile::persist(dir.path(), "sample.png", b"one").unwrap();
        let second = ScratchFile::persist(dir.path(), "sample.png", b"two").unwrap();
        assert_ne!(first.path(), second.path());

        drop(first);
        assert_eq!(fs::read(second.path()).unwrap(), b"two");
    }

    #[test]
    fn non_ascii_names_stay_inside_scratch_dir() {
        let dir = TempDir::new().unwrap();
        let scratch =
            ScratchFile::persist(dir.path(), "\u{4e2d}/../\u{6587}.png", b"x").unwrap();
        assert_eq!(scratch.path().parent(), Some(dir.path()));
        let name = scratch.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.is_ascii());
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn long_filenames_are_truncated_to_fit() {
        let dir = TempDir::new().unwrap();
        let filename = format!("{}.jpg", "a".repeat(300));
        assert!(allowed_file(&filename));

        let scratch = ScratchFile::persist(dir.path(), &filename, b"x").unwrap();
        let name = scratch.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(&format!("{}-", "a".repeat(MAX_STEM_CHARS))));
        assert!(!name.starts_with(&"a".repeat(MAX_STEM_CHARS + 1)));
        assert!(name.ends_with(".jpg"));
        assert!(name.len() < 100);

        drop(scratch);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn persist_into_missing_dir_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert!(ScratchFile::persist(&missing, "a.png", b"x").is_err());
        assert!(!missing.exists());

        ensure_scratch_dir(&missing).unwrap();
        assert!(missing.is_dir());
    }
}
