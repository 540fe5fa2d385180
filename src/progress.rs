//! Resumable run state kept next to the output file.
//!
//! Two files are involved:
//! - `<output>.partial`: JSON Lines, one [`GenerationResult`] per item
//! - `<output>.progress`: position of the last item whose result is durable
//!
//! Results are appended and synced before the marker moves, so the marker
//! never points past what the partial file holds.

use crate::{
    error::{Error, Result},
    reader::Item,
    validator::GenerationResult,
    writer::DurableWriter,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a previous run left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    /// Position of the last durable item; 0 when starting fresh
    pub marker: usize,

    /// Results for items `1..=marker`, in order
    pub results: Vec<GenerationResult>,
}

/// Tracks which items are durably done.
#[derive(Debug)]
pub struct ProgressRecorder {
    partial_path: PathBuf,
    marker_path: PathBuf,
    writer: DurableWriter,
    marker: usize,
}

impl ProgressRecorder {
    /// Creates a recorder whose files sit next to `output`.
    #[must_use]
    pub fn for_output(output: &Path) -> Self {
        Self {
            partial_path: output.with_extension("partial"),
            marker_path: output.with_extension("progress"),
            writer: DurableWriter::new(false),
            marker: 0,
        }
    }

    /// Path of the partial results file.
    #[must_use]
    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    /// Path of the marker file.
    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Position of the last durable item.
    #[must_use]
    pub const fn marker(&self) -> usize {
        self.marker
    }

    /// Loads saved progress for `items`.
    ///
    /// Records beyond the marker come from an interrupted append and are
    /// dropped from the partial file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Progress`] if the marker is unreadable, lies past the
    /// end of the input, or the saved results don't match the input.
    pub fn load(&mut self, items: &[Item]) -> Result<ResumeState> {
        let marker = self.read_marker()?;
        if marker == 0 {
            self.discard_partial()?;
            self.marker = 0;
            return Ok(ResumeState::default());
        }

        if marker > items.len() {
            return Err(Error::progress(
                &self.marker_path,
                format!(
                    "marker {marker} is past the end of the input ({} items); rerun with --fresh",
                    items.len()
                ),
            ));
        }

        let (results, dropped) = self.read_partial(marker)?;
        Self::check_against_input(&self.partial_path, &results, &items[..marker])?;

        if dropped > 0 {
            warn!(
                "Dropping {} unconfirmed result(s) from {}",
                dropped,
                self.partial_path.display()
            );
            self.writer
                .replace(&self.partial_path, &to_json_lines(&results)?)?;
        }

        info!("Resuming after item {} of {}", marker, items.len());
        self.marker = marker;
        Ok(ResumeState { marker, results })
    }

    /// Durably appends `results` and advances the marker to the last one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Progress`] if the results don't continue from the
    /// current marker, and IO errors from writing either file.
    pub fn record(&mut self, results: &[GenerationResult]) -> Result<()> {
        let Some(last) = results.last() else {
            return Ok(());
        };

        for (offset, result) in results.iter().enumerate() {
            let expected = self.marker + offset + 1;
            if result.item.position != expected {
                return Err(Error::progress(
                    &self.partial_path,
                    format!(
                        "expected result for item {expected}, got item {}",
                        result.item.position
                    ),
                ));
            }
        }

        if let Some(parent) = self
            .partial_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        self.writer
            .append(&self.partial_path, &to_json_lines(results)?)?;
        self.writer
            .replace(&self.marker_path, &last.item.position.to_string())?;

        self.marker = last.item.position;
        debug!("Progress marker at item {}", self.marker);
        Ok(())
    }

    /// Removes both progress files, e.g. after a successful run or for `--fresh`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a file exists but cannot be removed.
    pub fn clear(&mut self) -> Result<()> {
        self.writer.remove(&self.marker_path)?;
        self.writer.remove(&self.partial_path)?;
        self.marker = 0;
        Ok(())
    }

    fn read_marker(&self) -> Result<usize> {
        let text = match fs::read_to_string(&self.marker_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(&self.marker_path, e)),
        };

        text.trim().parse().map_err(|_| {
            Error::progress(
                &self.marker_path,
                format!("invalid marker {:?}; rerun with --fresh", text.trim()),
            )
        })
    }

    /// Reads results up to `marker`, returning them with the count of dropped records.
    fn read_partial(&self, marker: usize) -> Result<(Vec<GenerationResult>, usize)> {
        let content = fs::read_to_string(&self.partial_path)
            .map_err(|e| Error::io(&self.partial_path, e))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut results = Vec::with_capacity(marker);
        let mut dropped = 0;

        for (index, line) in lines.iter().enumerate() {
            let result: GenerationResult = match serde_json::from_str(line) {
                Ok(result) => result,
                // a torn final line is an append that never completed
                Err(_) if index + 1 == lines.len() && results.len() == marker => {
                    dropped += 1;
                    continue;
                }
                Err(e) => {
                    return Err(Error::progress(
                        &self.partial_path,
                        format!("line {}: {e}", index + 1),
                    ));
                }
            };

            if result.item.position > marker {
                dropped += 1;
            } else {
                results.push(result);
            }
        }

        Ok((results, dropped))
    }

    fn check_against_input(
        path: &Path,
        results: &[GenerationResult],
        items: &[Item],
    ) -> Result<()> {
        if results.len() != items.len() {
            return Err(Error::progress(
                path,
                format!(
                    "holds {} result(s) but the marker covers {} item(s); rerun with --fresh",
                    results.len(),
                    items.len()
                ),
            ));
        }

        for (result, item) in results.iter().zip(items) {
            if result.item != *item {
                return Err(Error::progress(
                    path,
                    format!(
                        "item {} was {:?} but the input now has {:?}; rerun with --fresh",
                        item.position, result.item.text, item.text
                    ),
                ));
            }
        }

        Ok(())
    }

    fn discard_partial(&self) -> Result<()> {
        if self.partial_path.exists() {
            debug!("No marker; discarding {}", self.partial_path.display());
        }
        self.writer.remove(&self.partial_path)
    }
}

fn to_json_lines(results: &[GenerationResult]) -> Result<String> {
    let mut out = String::new();
    for result in results {
        out.push_str(&serde_json::to_string(result)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::Card;
    use assert_fs::prelude::*;

    fn items(n: usize) -> Vec<Item> {
        (1..=n).map(|i| Item::new(i, format!("item {i}"))).collect()
    }

    fn result(position: usize) -> GenerationResult {
        GenerationResult {
            item: Item::new(position, format!("item {position}")),
            cards: vec![Card::new(format!("q{position}"), format!("a{position}"))],
        }
    }

    fn results(range: std::ops::RangeInclusive<usize>) -> Vec<GenerationResult> {
        range.map(result).collect()
    }

    #[test]
    fn test_paths_replace_extension() {
        let recorder = ProgressRecorder::for_output(Path::new("out/deck.txt"));
        assert_eq!(recorder.partial_path(), Path::new("out/deck.partial"));
        assert_eq!(recorder.marker_path(), Path::new("out/deck.progress"));
    }

    #[test]
    fn test_fresh_start() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut recorder = ProgressRecorder::for_output(&temp.path().join("deck.txt"));

        let state = recorder.load(&items(3)).unwrap();
        assert_eq!(state, ResumeState::default());
        assert_eq!(recorder.marker(), 0);
    }

    #[test]
    fn test_record_then_load() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.path().join("deck.txt");

        let mut recorder = ProgressRecorder::for_output(&output);
        recorder.record(&results(1..=2)).unwrap();
        recorder.record(&results(3..=3)).unwrap();
        temp.child("deck.progress").assert("3");

        let mut reloaded = ProgressRecorder::for_output(&output);
        let state = reloaded.load(&items(5)).unwrap();
        assert_eq!(state.marker, 3);
        assert_eq!(state.results, results(1..=3));
        assert_eq!(reloaded.marker(), 3);
    }

    #[test]
    fn test_record_rejects_gaps() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut recorder = ProgressRecorder::for_output(&temp.path().join("deck.txt"));

        recorder.record(&results(1..=2)).unwrap();
        let err = recorder.record(&results(4..=5)).unwrap_err();
        assert!(matches!(err, Error::Progress { .. }));
        assert_eq!(recorder.marker(), 2);

        let err = recorder.record(&results(1..=1)).unwrap_err();
        assert!(matches!(err, Error::Progress { .. }));
    }

    #[test]
    fn test_records_beyond_marker_are_dropped() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.path().join("deck.txt");

        let mut recorder = ProgressRecorder::for_output(&output);
        recorder.record(&results(1..=2)).unwrap();

        // crash between the append and the marker update
        let extra = to_json_lines(&results(3..=4)).unwrap();
        DurableWriter::new(false)
            .append(recorder.partial_path(), &extra)
            .unwrap();

        let mut reloaded = ProgressRecorder::for_output(&output);
        let state = reloaded.load(&items(4)).unwrap();
        assert_eq!(state.marker, 2);
        assert_eq!(state.results, results(1..=2));

        let rewritten = fs::read_to_string(reloaded.partial_path()).unwrap();
        assert_eq!(rewritten.lines().count(), 2);
    }

    #[test]
    fn test_torn_last_line_is_dropped() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.path().join("deck.txt");

        let mut recorder = ProgressRecorder::for_output(&output);
        recorder.record(&results(1..=1)).unwrap();
        DurableWriter::new(false)
            .append(recorder.partial_path(), "{\"item\":{\"posi")
            .unwrap();

        let state = ProgressRecorder::for_output(&output)
            .load(&items(2))
            .unwrap();
        assert_eq!(state.results, results(1..=1));
    }

    #[test]
    fn test_partial_without_marker_is_discarded() {
        let temp = assert_fs::TempDir::new().unwrap();
        let partial = temp.child("deck.partial");
        partial
            .write_str(&to_json_lines(&results(1..=1)).unwrap())
            .unwrap();

        let mut recorder = ProgressRecorder::for_output(&temp.path().join("deck.txt"));
        let state = recorder.load(&items(2)).unwrap();

        assert_eq!(state.marker, 0);
        assert!(!partial.path().exists());
    }

    #[test]
    fn test_marker_past_input_end() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("deck.progress").write_str("7").unwrap();

        let err = ProgressRecorder::for_output(&temp.path().join("deck.txt"))
            .load(&items(3))
            .unwrap_err();
        assert!(matches!(err, Error::Progress { .. }));
    }

    #[test]
    fn test_invalid_marker() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("deck.progress").write_str("three").unwrap();

        let err = ProgressRecorder::for_output(&temp.path().join("deck.txt"))
            .load(&items(3))
            .unwrap_err();
        assert!(err.to_string().contains("three"));
    }

    #[test]
    fn test_changed_input_is_detected() {
        let temp = assert_fs::TempDir::new().unwrap();
        let output = temp.path().join("deck.txt");
        ProgressRecorder::for_output(&output)
            .record(&results(1..=2))
            .unwrap();

        let mut changed = items(3);
        changed[1].text = "something else".to_string();

        let err = ProgressRecorder::for_output(&output)
            .load(&changed)
            .unwrap_err();
        assert!(err.to_string().contains("something else"));
    }

    #[test]
    fn test_clear_removes_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        let mut recorder = ProgressRecorder::for_output(&temp.path().join("deck.txt"));
        recorder.record(&results(1..=1)).unwrap();

        recorder.clear().unwrap();
        assert!(!temp.child("deck.partial").path().exists());
        assert!(!temp.child("deck.progress").path().exists());
        assert_eq!(recorder.marker(), 0);

        // clearing twice is fine
        recorder.clear().unwrap();
    }
}
