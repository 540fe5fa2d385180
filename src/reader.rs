use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One line of input that cards are generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// 1-based position among the kept lines
    pub position: usize,

    /// Trimmed line text
    pub text: String,
}

impl Item {
    /// Creates a new item.
    #[must_use]
    pub fn new(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            text: text.into(),
        }
    }
}

/// Returns the item text for a raw line, or `None` for blank and comment lines.
#[must_use]
pub fn item_text(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        None
    } else {
        Some(trimmed)
    }
}

/// Lazily reads items from an input file.
///
/// Reading is restartable by opening the file again; positions are stable
/// as long as the file is unchanged.
pub struct LineReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    next_position: usize,
}

impl LineReader {
    /// Opens `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputNotFound`] if the path is not a readable file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::input_not_found(path));
        }

        let file = File::open(path).map_err(|_| Error::input_not_found(path))?;

        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            next_position: 1,
        })
    }

    /// Reads every item of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputNotFound`] for a missing file, [`Error::EmptyInput`]
    /// when nothing survives filtering, and IO errors for unreadable content.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Item>> {
        let reader = Self::open(path)?;
        let path = reader.path.clone();
        let items = reader.collect::<Result<Vec<_>>>()?;

        if items.is_empty() {
            return Err(Error::empty_input(path));
        }

        debug!("Read {} items from {}", items.len(), path.display());
        Ok(items)
    }
}

impl Iterator for LineReader {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::io(&self.path, e))),
            };

            if let Some(text) = item_text(&line) {
                let item = Item::new(self.next_position, text);
                self.next_position += 1;
                return Some(Ok(item));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_filters_blank_and_comment_lines() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("words.txt");
        input
            .write_str("# header\nbusy\n\n   \n  # indented comment\nslow  \n\tfast\n")
            .unwrap();

        let items = LineReader::read_all(input.path()).unwrap();

        assert_eq!(
            items,
            vec![Item::new(1, "busy"), Item::new(2, "slow"), Item::new(3, "fast")]
        );
    }

    #[test]
    fn test_item_count_matches_content_lines() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("words.txt");
        let content = "a\n#b\nc\n\nd # not a comment\n#\ne";
        input.write_str(content).unwrap();

        let expected = content
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .count();

        let items = LineReader::read_all(input.path()).unwrap();
        assert_eq!(items.len(), expected);
        assert_eq!(items[2].text, "d # not a comment");
    }

    #[test]
    fn test_handles_crlf_line_endings() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("words.txt");
        input.write_str("one\r\ntwo\r\n").unwrap();

        let items = LineReader::read_all(input.path()).unwrap();
        assert_eq!(items[0].text, "one");
        assert_eq!(items[1].text, "two");
    }

    #[test]
    fn test_missing_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        let err = LineReader::read_all(temp.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, Error::InputNotFound { .. }));
    }

    #[test]
    fn test_directory_is_not_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        let err = LineReader::read_all(temp.path()).unwrap_err();
        assert!(matches!(err, Error::InputNotFound { .. }));
    }

    #[test]
    fn test_empty_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("words.txt");
        input.write_str("# only comments\n\n").unwrap();

        let err = LineReader::read_all(input.path()).unwrap_err();
        assert!(matches!(err, Error::EmptyInput { .. }));
    }

    #[test]
    fn test_reader_is_lazy_iterator() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("words.txt");
        input.write_str("a\nb\nc\n").unwrap();

        let first: Vec<_> = LineReader::open(input.path())
            .unwrap()
            .take(2)
            .map(|r| r.unwrap().text)
            .collect();
        assert_eq!(first, vec!["a", "b"]);
    }
}
