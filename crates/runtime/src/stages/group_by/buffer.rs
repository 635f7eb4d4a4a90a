use std::time::Instant;

use rowflow_common::Result;
use rowflow_execution::Row;
use rowflow_spill::{SpillLayout, SpillReader, SpillWriter};

/// One overflow written to disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpillEvent {
    pub rows: u64,
    pub bytes: u64,
    pub secs: f64,
}

/// Rows of the open group, in arrival order.
///
/// Holds at most `threshold` rows in memory; past that the memory rows are appended to the
/// group's spill file, created on first overflow. Dropping the buffer deletes the file.
#[derive(Debug)]
pub struct GroupBuffer {
    threshold: usize,
    layout: SpillLayout,
    memory: Vec<Row>,
    spill: Option<SpillWriter>,
}

impl GroupBuffer {
    pub fn new(threshold: usize, layout: SpillLayout) -> Self {
        Self {
            threshold: threshold.max(1),
            layout,
            memory: Vec::new(),
            spill: None,
        }
    }

    pub fn push(&mut self, row: Row) -> Result<Option<SpillEvent>> {
        self.memory.push(row);
        if self.memory.len() <= self.threshold {
            return Ok(None);
        }
        let started = Instant::now();
        let writer = match self.spill.take() {
            Some(w) => w,
            None => SpillWriter::create(&self.layout)?,
        };
        let writer = self.spill.insert(writer);
        let bytes = writer.append(&self.memory)?;
        let rows = self.memory.len() as u64;
        self.memory.clear();
        Ok(Some(SpillEvent {
            rows,
            bytes,
            secs: started.elapsed().as_secs_f64(),
        }))
    }

    pub fn spilled_rows(&self) -> u64 {
        self.spill.as_ref().map_or(0, SpillWriter::rows)
    }

    /// Replay every row in arrival order: spilled rows first, then memory rows.
    pub fn into_replay(self) -> Result<GroupReplay> {
        let spilled = self.spill.map(SpillWriter::into_reader).transpose()?;
        Ok(GroupReplay {
            spilled,
            memory: self.memory.into_iter(),
        })
    }
}

/// Iterator over a closed group's rows. The spill file is deleted once its rows are read.
#[derive(Debug)]
pub struct GroupReplay {
    spilled: Option<SpillReader>,
    memory: std::vec::IntoIter<Row>,
}

impl Iterator for GroupReplay {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(reader) = self.spilled.as_mut() {
            match reader.next() {
                Some(row) => return Some(row),
                None => self.spilled = None,
            }
        }
        self.memory.next().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use rowflow_execution::{Row, Value};
    use rowflow_spill::SpillLayout;

    use super::GroupBuffer;

    fn row(v: i64) -> Row {
        Row::new(vec![Value::from("B"), Value::Integer(v)])
    }

    #[test]
    fn spills_past_threshold_and_replays_in_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = SpillLayout::new(dir.path(), "grp");
        let mut buffer = GroupBuffer::new(2, layout.clone());

        let mut events = Vec::new();
        for v in 1..=5 {
            if let Some(e) = buffer.push(row(v)).expect("push") {
                events.push(e);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rows, 3);
        assert_eq!(buffer.spilled_rows(), 3);
        assert_eq!(layout.existing_files().expect("list").len(), 1);

        let replayed = buffer
            .into_replay()
            .expect("replay")
            .collect::<rowflow_common::Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(replayed, (1..=5).map(row).collect::<Vec<_>>());
        assert!(layout.existing_files().expect("list").is_empty());
    }

    #[test]
    fn dropping_buffer_removes_spill_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = SpillLayout::new(dir.path(), "grp");
        let mut buffer = GroupBuffer::new(1, layout.clone());
        buffer.push(row(1)).expect("push");
        buffer.push(row(2)).expect("push");
        assert_eq!(layout.existing_files().expect("list").len(), 1);
        drop(buffer);
        assert!(layout.existing_files().expect("list").is_empty());
    }
}
