//! Line providers over a directory tree.

use super::{DataSourceIteratorProvider, ProviderIter};
use crate::traits::{EngineError, EngineResult};
use partflow_common::CommonError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A line together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedLine {
    pub file_name: String,
    /// Zero-based position of the line in its file.
    pub line_index: u64,
    pub line: String,
}

/// Regular files below `base_dir`, sorted by path. When `pattern` is given,
/// only files whose name fully matches it are kept.
fn list_files(base_dir: &str, pattern: Option<&str>) -> EngineResult<Vec<PathBuf>> {
    if base_dir.is_empty() {
        return Err(EngineError::invalid_argument("base directory is empty"));
    }
    let root = Path::new(base_dir);
    if !root.is_dir() {
        return Err(EngineError::invalid_argument(format!(
            "base directory {} does not exist or is not a directory",
            base_dir
        )));
    }

    let filter = match pattern.filter(|p| !p.is_empty()) {
        Some(p) => Some(Regex::new(&format!("^(?:{})$", p)).map_err(|e| {
            EngineError::invalid_argument(format!("invalid file name pattern {}: {}", p, e))
        })?),
        None => None,
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            CommonError::io_error_with_source(format!("walking {}", base_dir), e)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let keep = filter
            .as_ref()
            .is_none_or(|re| re.is_match(&entry.file_name().to_string_lossy()));
        if keep {
            files.push(entry.into_path());
        }
    }
    debug!("Listed {} files under {}", files.len(), base_dir);
    Ok(files)
}

/// Streams the lines of a list of files, one file open at a time.
struct FileLines {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<(PathBuf, Lines<BufReader<File>>, u64)>,
}

impl FileLines {
    fn new(files: &[PathBuf]) -> Self {
        Self {
            pending: files.to_vec().into_iter(),
            current: None,
        }
    }
}

impl Iterator for FileLines {
    type Item = EngineResult<(PathBuf, u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((path, lines, index)) = self.current.as_mut() {
                match lines.next() {
                    Some(Ok(line)) => {
                        let item = (path.clone(), *index, line);
                        *index += 1;
                        return Some(Ok(item));
                    }
                    Some(Err(e)) => {
                        let err = CommonError::io_error_with_source(
                            format!("reading {}", path.display()),
                            e,
                        );
                        self.current = None;
                        return Some(Err(err.into()));
                    }
                    None => self.current = None,
                }
            }

            let path = self.pending.next()?;
            match File::open(&path) {
                Ok(file) => self.current = Some((path, BufReader::new(file).lines(), 0)),
                Err(e) => {
                    return Some(Err(CommonError::io_error_with_source(
                        format!("opening {}", path.display()),
                        e,
                    )
                    .into()));
                }
            }
        }
    }
}

/// Every line of every matching file below a base directory.
///
/// Size is available by scanning all files; `contains` and `take` are not
/// supported.
#[derive(Debug, Clone)]
pub struct RecursiveFileLineProvider {
    files: Vec<PathBuf>,
}

impl RecursiveFileLineProvider {
    pub fn new(base_dir: &str, file_name_pattern: Option<&str>) -> EngineResult<Self> {
        Ok(Self {
            files: list_files(base_dir, file_name_pattern)?,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl DataSourceIteratorProvider<String> for RecursiveFileLineProvider {
    fn iter(&self) -> EngineResult<ProviderIter<'_, String>> {
        Ok(Box::new(
            FileLines::new(&self.files).map(|item| item.map(|(_, _, line)| line)),
        ))
    }

    fn size_enabled(&self) -> bool {
        true
    }

    fn size(&self) -> EngineResult<Option<u64>> {
        let mut count = 0;
        for line in FileLines::new(&self.files) {
            line?;
            count += 1;
        }
        Ok(Some(count))
    }
}

/// Like `RecursiveFileLineProvider`, but yields each line with its file
/// name and index within the file.
#[derive(Debug, Clone)]
pub struct IndexedFileLineProvider {
    files: Vec<PathBuf>,
}

impl IndexedFileLineProvider {
    pub fn new(base_dir: &str, file_name_pattern: Option<&str>) -> EngineResult<Self> {
        Ok(Self {
            files: list_files(base_dir, file_name_pattern)?,
        })
    }
}

impl DataSourceIteratorProvider<IndexedLine> for IndexedFileLineProvider {
    fn iter(&self) -> EngineResult<ProviderIter<'_, IndexedLine>> {
        Ok(Box::new(FileLines::new(&self.files).map(|item| {
            item.map(|(path, line_index, line)| IndexedLine {
                file_name: path.to_string_lossy().into_owned(),
                line_index,
                line,
            })
        })))
    }

    fn size_enabled(&self) -> bool {
        true
    }

    fn size(&self) -> EngineResult<Option<u64>> {
        let mut count = 0;
        for line in FileLines::new(&self.files) {
            line?;
            count += 1;
        }
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("b.txt"), "three\n").unwrap();
        fs::write(dir.path().join("skip.log"), "ignored\n").unwrap();
        dir
    }

    #[test]
    fn test_reads_all_files_recursively() {
        let dir = fixture();
        let provider =
            RecursiveFileLineProvider::new(dir.path().to_str().unwrap(), None).unwrap();
        let lines: Vec<String> = provider.iter().unwrap().map(|l| l.unwrap()).collect();

        assert_eq!(lines, vec!["one", "two", "three", "ignored"]);
        assert_eq!(provider.size().unwrap(), Some(4));
        assert!(!provider.contains_enabled());
        assert_eq!(provider.take(0, 1).unwrap(), None);
    }

    #[test]
    fn test_pattern_matches_whole_file_name() {
        let dir = fixture();
        let provider =
            RecursiveFileLineProvider::new(dir.path().to_str().unwrap(), Some(r".*\.txt"))
                .unwrap();
        assert_eq!(provider.files().len(), 2);

        let provider =
            RecursiveFileLineProvider::new(dir.path().to_str().unwrap(), Some("txt")).unwrap();
        assert!(provider.files().is_empty());
    }

    #[test]
    fn test_indexed_lines() {
        let dir = fixture();
        let provider =
            IndexedFileLineProvider::new(dir.path().to_str().unwrap(), Some(r"a\.txt")).unwrap();
        let lines: Vec<IndexedLine> = provider.iter().unwrap().map(|l| l.unwrap()).collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].file_name.ends_with("a.txt"));
        assert_eq!(lines[1].line_index, 1);
        assert_eq!(lines[1].line, "two");
    }

    #[test]
    fn test_missing_or_empty_base_dir() {
        let err = RecursiveFileLineProvider::new("", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = IndexedFileLineProvider::new("/definitely/not/here", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let dir = fixture();
        let err = RecursiveFileLineProvider::new(dir.path().to_str().unwrap(), Some("("))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
