//! Scalar summaries, one JSON object per line in `<run_dir>/summaries.jsonl`.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const SUMMARY_FILE: &str = "summaries.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct SummaryRecord {
    pub step: usize,
    pub tag: String,
    pub value: f64,
}

pub struct SummaryWriter {
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Appends to an existing file so a resumed run keeps its history.
    pub fn open(run_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(SUMMARY_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn scalar(&mut self, step: usize, tag: &str, value: f64) -> io::Result<()> {
        let record = SummaryRecord {
            step,
            tag: tag.to_string(),
            value,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

pub fn read_summaries(path: &Path) -> io::Result<Vec<SummaryRecord>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(io::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_across_writers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut w = SummaryWriter::open(dir.path())?;
            w.scalar(100, "total_loss", 0.5)?;
            w.flush()?;
        }
        let mut w = SummaryWriter::open(dir.path())?;
        w.scalar(200, "learning_rate", 1e-4)?;
        w.flush()?;
        let records = read_summaries(&dir.path().join(SUMMARY_FILE))?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, "total_loss");
        assert_eq!(records[1].step, 200);
        Ok(())
    }
}
