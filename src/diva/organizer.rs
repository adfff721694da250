use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lofty::{Accessor, Tag, TagExt, TagType};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Directory under the download root holding in-flight temp files.
const PARTIAL_DIR_NAME: &str = ".partial";

/// Longest sanitized file stem written to disk.
const MAX_STEM_LEN: usize = 120;

/// Tag metadata could not be written to a finished file.
#[derive(Error, Debug)]
#[error("could not write tags: {0}")]
pub(crate) struct TagError(#[from] lofty::error::LoftyError);

/// Lays out the download root: one folder per performer, finished files
/// renamed into place from a partials directory on the same filesystem.
pub(crate) struct FileOrganizer {
    root: PathBuf,
    partial_dir: PathBuf,
    placement_lock: Mutex<()>,
}

impl FileOrganizer {
    /// Creates the root and partials directories, sweeping any temp files a
    /// previous run left behind.
    pub(crate) fn new(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let partial_dir = root.join(PARTIAL_DIR_NAME);
        fs::create_dir_all(&partial_dir)?;

        let mut swept = 0usize;
        for entry in fs::read_dir(&partial_dir)? {
            let stale = entry?.path();
            match fs::remove_file(&stale) {
                Ok(()) => swept += 1,
                Err(err) => warn!("Could not sweep stale partial {:?}: {}", stale, err),
            }
        }
        if swept > 0 {
            debug!("Swept {} stale partial file(s)", swept);
        }

        Ok(FileOrganizer {
            root: root.to_path_buf(),
            partial_dir,
            placement_lock: Mutex::new(()),
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh temp path for one download, on the same filesystem as the
    /// final destination so the closing rename stays atomic.
    pub(crate) fn temp_path(&self) -> PathBuf {
        self.partial_dir.join(format!("{}.part", Uuid::new_v4()))
    }

    /// Where a download with this exact name already sits, if anywhere.
    /// Numbered variants from earlier collisions are not considered.
    pub(crate) fn existing_destination(
        &self,
        hint: &str,
        title: &str,
        ext: &str,
    ) -> Option<PathBuf> {
        let candidate = self
            .root
            .join(remove_invalid_chars(hint))
            .join(format!("{}.{}", remove_invalid_chars(title), ext));
        candidate.exists().then_some(candidate)
    }

    /// Moves a finished temp file to its final destination, picking a
    /// numbered name when the plain one is taken. Existing files are never
    /// overwritten.
    pub(crate) fn place(
        &self,
        temp: &Path,
        hint: &str,
        title: &str,
        ext: &str,
    ) -> io::Result<PathBuf> {
        let directory = self.root.join(remove_invalid_chars(hint));
        fs::create_dir_all(&directory)?;
        let stem = remove_invalid_chars(title);

        let _guard = self.placement_lock.lock();
        let mut suffix = 1u32;
        let destination = loop {
            let file_name = if suffix == 1 {
                format!("{stem}.{ext}")
            } else {
                format!("{stem} ({suffix}).{ext}")
            };
            let candidate = directory.join(file_name);
            if !candidate.exists() {
                break candidate;
            }
            suffix += 1;
        };

        fs::rename(temp, &destination)?;
        Ok(destination)
    }

    /// Writes title, artist and comment atoms into a placed file.
    pub(crate) fn tag(
        &self,
        path: &Path,
        title: &str,
        artist: &str,
        description: Option<&str>,
    ) -> Result<(), TagError> {
        let mut tag = Tag::new(TagType::Mp4Ilst);
        tag.set_title(title.to_string());
        tag.set_artist(artist.to_string());
        if let Some(description) = description {
            tag.set_comment(description.to_string());
        }
        tag.save_to_path(path)?;
        Ok(())
    }
}

/// Remove invalid characters from a file name component.
fn remove_invalid_chars(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| match c {
            '?' | ':' | '*' | '<' | '>' | '"' | '|' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return String::from("untitled");
    }
    trimmed.chars().take(MAX_STEM_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_temp(organizer: &FileOrganizer, content: &[u8]) -> PathBuf {
        let temp = organizer.temp_path();
        let mut file = File::create(&temp).unwrap();
        file.write_all(content).unwrap();
        temp
    }

    #[test]
    fn reserved_characters_become_underscores() {
        assert_eq!(
            remove_invalid_chars("who? what: a/b\\c*d<e>f\"g|h"),
            "who_ what_ a_b_c_d_e_f_g_h"
        );
        assert_eq!(remove_invalid_chars("trailing dots..."), "trailing dots");
        assert_eq!(remove_invalid_chars("   "), "untitled");
        assert_eq!(remove_invalid_chars("tab\there"), "tab_here");

        let oversized = "x".repeat(400);
        assert_eq!(remove_invalid_chars(&oversized).chars().count(), 120);
    }

    #[test]
    fn placed_file_lands_under_the_performer_folder() {
        let dir = tempdir().unwrap();
        let organizer = FileOrganizer::new(dir.path()).unwrap();

        let temp = write_temp(&organizer, b"audio-bytes");
        let placed = organizer
            .place(&temp, "velvet-voice", "Midnight Story", "m4a")
            .unwrap();

        assert_eq!(
            placed,
            dir.path().join("velvet-voice").join("Midnight Story.m4a")
        );
        assert_eq!(fs::read(&placed).unwrap(), b"audio-bytes");
        assert!(!temp.exists());
    }

    #[test]
    fn colliding_titles_get_numbered_names() {
        let dir = tempdir().unwrap();
        let organizer = FileOrganizer::new(dir.path()).unwrap();

        let mut placed = Vec::new();
        for content in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            let temp = write_temp(&organizer, content);
            placed.push(organizer.place(&temp, "reader", "Same Title", "m4a").unwrap());
        }

        let names: Vec<String> = placed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["Same Title.m4a", "Same Title (2).m4a", "Same Title (3).m4a"]
        );
        assert_eq!(fs::read(&placed[0]).unwrap(), b"first");
        assert_eq!(fs::read(&placed[1]).unwrap(), b"second");
        assert_eq!(fs::read(&placed[2]).unwrap(), b"third");
    }

    #[test]
    fn existing_destination_only_reports_exact_names() {
        let dir = tempdir().unwrap();
        let organizer = FileOrganizer::new(dir.path()).unwrap();

        assert!(organizer
            .existing_destination("reader", "Fresh", "m4a")
            .is_none());

        let temp = write_temp(&organizer, b"bytes");
        let placed = organizer.place(&temp, "reader", "Fresh", "m4a").unwrap();
        assert_eq!(
            organizer.existing_destination("reader", "Fresh", "m4a"),
            Some(placed)
        );
    }

    #[test]
    fn tagging_a_non_audio_file_fails_cleanly() {
        let dir = tempdir().unwrap();
        let organizer = FileOrganizer::new(dir.path()).unwrap();

        let temp = write_temp(&organizer, b"definitely not an mp4 container");
        let placed = organizer.place(&temp, "reader", "Broken", "m4a").unwrap();

        let result = organizer.tag(&placed, "Broken", "reader", Some("desc"));
        assert!(result.is_err());
        assert!(placed.exists());
    }

    #[test]
    fn stale_partials_are_swept_at_startup() {
        let dir = tempdir().unwrap();
        let partial_dir = dir.path().join(PARTIAL_DIR_NAME);
        fs::create_dir_all(&partial_dir).unwrap();
        fs::write(partial_dir.join("leftover.part"), b"junk").unwrap();

        let _organizer = FileOrganizer::new(dir.path()).unwrap();
        assert!(fs::read_dir(&partial_dir).unwrap().next().is_none());
    }
}
