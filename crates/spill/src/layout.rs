use std::fs;
use std::path::{Path, PathBuf};

use rowflow_common::Result;
use tempfile::NamedTempFile;

pub const SPILL_SUFFIX: &str = ".spill";

/// Where one stage puts its spill files: `<dir>/<prefix><unique suffix>.spill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillLayout {
    dir: PathBuf,
    prefix: String,
}

impl SpillLayout {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create a new uniquely named, delete-on-drop spill file.
    pub fn create_file(&self) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.dir)?;
        let file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .suffix(SPILL_SUFFIX)
            .tempfile_in(&self.dir)?;
        Ok(file)
    }

    /// Spill files of this layout currently on disk.
    pub fn existing_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&self.prefix) && name.ends_with(SPILL_SUFFIX)
            })
            .map(|e| e.path())
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::SpillLayout;

    #[test]
    fn file_names_follow_prefix_and_suffix() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = SpillLayout::new(dir.path(), "grp");
        let file = layout.create_file().expect("spill file");
        let name = file
            .path()
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("grp"));
        assert!(name.ends_with(".spill"));
        assert_eq!(layout.existing_files().expect("list").len(), 1);

        drop(file);
        assert!(layout.existing_files().expect("list").is_empty());
    }
}
