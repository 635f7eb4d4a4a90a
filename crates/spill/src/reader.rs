use std::fs::File;
use std::io::BufReader;

use rowflow_common::{Result, RowflowError};
use rowflow_execution::Row;
use tempfile::NamedTempFile;

use crate::codec::{read_frame, read_header};

/// Replays a spill file's rows in the order they were written.
///
/// Owns the file handle; the file is deleted when the reader is dropped.
pub struct SpillReader {
    _file: NamedTempFile,
    input: BufReader<File>,
    remaining: u64,
}

impl SpillReader {
    pub(crate) fn open(file: NamedTempFile, input: File, rows: u64) -> Result<Self> {
        let mut input = BufReader::new(input);
        read_header(&mut input)?;
        Ok(Self {
            _file: file,
            input,
            remaining: rows,
        })
    }
}

impl Iterator for SpillReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_frame(&mut self.input) {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                let missing = self.remaining + 1;
                self.remaining = 0;
                Some(Err(RowflowError::Spill(format!(
                    "spill file ended {missing} rows early"
                ))))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (0, Some(n))
    }
}

impl std::fmt::Debug for SpillReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillReader")
            .field("path", &self._file.path())
            .field("remaining", &self.remaining)
            .finish()
    }
}
