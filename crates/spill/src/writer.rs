use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rowflow_common::Result;
use rowflow_execution::Row;
use tempfile::NamedTempFile;

use crate::codec::{SPILL_HEADER_LEN, write_frame, write_header};
use crate::layout::SpillLayout;
use crate::reader::SpillReader;

/// Append-only spill file. The file is deleted when the writer (or the reader it turns into)
/// is dropped.
pub struct SpillWriter {
    file: NamedTempFile,
    out: BufWriter<File>,
    rows: u64,
    bytes: u64,
}

impl SpillWriter {
    pub fn create(layout: &SpillLayout) -> Result<Self> {
        let file = layout.create_file()?;
        let mut out = BufWriter::new(file.as_file().try_clone()?);
        write_header(&mut out)?;
        Ok(Self {
            file,
            out,
            rows: 0,
            bytes: SPILL_HEADER_LEN,
        })
    }

    /// Append rows in order. Returns the bytes written by this call.
    pub fn append<'a>(&mut self, rows: impl IntoIterator<Item = &'a Row>) -> Result<u64> {
        let mut written = 0;
        for row in rows {
            written += write_frame(&mut self.out, row)?;
            self.rows += 1;
        }
        self.bytes += written;
        Ok(written)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Flush and reopen the file for reading from the first row.
    pub fn into_reader(mut self) -> Result<SpillReader> {
        self.out.flush()?;
        let rows = self.rows;
        let input = self.file.reopen()?;
        SpillReader::open(self.file, input, rows)
    }
}

impl std::fmt::Debug for SpillWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillWriter")
            .field("path", &self.file.path())
            .field("rows", &self.rows)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rowflow_execution::{Row, Value};

    use super::SpillWriter;
    use crate::layout::SpillLayout;

    fn row(k: &str, v: i64) -> Row {
        Row::new(vec![Value::from(k), Value::Integer(v)])
    }

    #[test]
    fn appends_across_calls_and_replays_in_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = SpillLayout::new(dir.path(), "grp");
        let mut writer = SpillWriter::create(&layout).expect("create");
        let first = vec![row("B", 1), row("B", 2), row("B", 3)];
        let second = vec![row("B", 4)];
        let first_bytes = writer.append(&first).expect("first append");
        let second_bytes = writer.append(&second).expect("second append");
        assert_eq!(writer.rows(), 4);
        assert!(first_bytes > second_bytes);

        let reader = writer.into_reader().expect("reader");
        let replayed = reader.collect::<rowflow_common::Result<Vec<_>>>().expect("replay");
        assert_eq!(replayed, [first, second].concat());
        assert!(layout.existing_files().expect("list").is_empty());
    }

    #[test]
    fn dropping_writer_removes_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = SpillLayout::new(dir.path(), "grp");
        let mut writer = SpillWriter::create(&layout).expect("create");
        writer.append(&[row("A", 1)]).expect("append");
        let path = writer.path().to_path_buf();
        assert!(path.exists());
        drop(writer);
        assert!(!path.exists());
    }
}
