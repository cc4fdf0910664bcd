use std::path::Path;

use snafu::ResultExt;

use crate::error::{AtomicWriteError, CreateDirSnafu, RenameTempFileSnafu, WriteFileSnafu};

/// Replaces `path` with `contents` through a sibling temp file, so readers never see a
/// half-written file.
pub(crate) fn write_atomically(path: &Path, contents: &str) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-parent-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, contents).context(WriteFileSnafu {
        stage: "write-temporary-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-file",
        from: temp_path,
        to: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_directories_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("state.json");

        write_atomically(&path, "{\"a\":1}").expect("first write");
        write_atomically(&path, "{\"a\":2}").expect("overwrite");

        assert_eq!(
            std::fs::read_to_string(&path).expect("file exists"),
            "{\"a\":2}"
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_in_place_of_parent_is_a_create_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").expect("write blocker");

        let error = write_atomically(&blocker.join("state.json"), "{}")
            .expect_err("parent is a regular file");
        assert!(matches!(error, AtomicWriteError::CreateDir { .. }));
    }
}
