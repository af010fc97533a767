//! Durable, append-only log of relayed samples

use crate::processing::sample::{DistanceSample, SamplePayload};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sample log writer. Every record is flushed before `append` returns.
pub struct SampleLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_index: u64,
}

/// Highest leading index in an existing log
fn last_index(path: &Path) -> io::Result<Option<u64>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(index) = line.split_whitespace().next().and_then(|token| token.parse::<u64>().ok()) {
            last = last.max(Some(index));
        }
    }
    Ok(last)
}

impl SampleLog {
    /// Open `path` for appending; indices continue after any existing records
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let next_index = last_index(&path)?.map_or(1, |index| index + 1);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), next_index, "sample log opened");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn append(
        &mut self,
        receipt_ms: u64,
        payload: SamplePayload,
        request_duration_ms: u64,
    ) -> io::Result<DistanceSample> {
        let sample = DistanceSample {
            request_duration_ms: Some(request_duration_ms),
            ..DistanceSample::from_payload(self.next_index, receipt_ms, payload)
        };
        writeln!(self.writer, "{}", sample.to_record())?;
        self.writer.flush()?;
        self.next_index += 1;
        debug!(index = sample.index, tag = sample.tag_id, "sample logged");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Range;
    use crate::processing::store::parse_samples;

    fn payload(tag_id: u16) -> SamplePayload {
        SamplePayload {
            tag_id,
            ranges: vec![(101, Range::Measured(2.5)), (102, Range::Failed)],
            onboard_duration_ms: None,
        }
    }

    #[test]
    fn test_records_are_flushed_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.txt");
        let mut log = SampleLog::open(&path).unwrap();
        log.append(1_000, payload(1), 45).unwrap();
        log.append(1_100, payload(2), 52).unwrap();

        // Readable without dropping the writer
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.lines().next(),
            Some("1 1000 1 101 2.5 102 fail, overall request duration: 45ms")
        );

        let samples = parse_samples(contents.as_bytes()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].index, 2);
        assert_eq!(samples[1].tag_id, 2);
        assert_eq!(samples[1].range_to(102), Some(Range::Failed));
        assert_eq!(samples[1].request_duration_ms, Some(52));
    }

    #[test]
    fn test_reopen_continues_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.txt");
        {
            let mut log = SampleLog::open(&path).unwrap();
            log.append(1_000, payload(1), 10).unwrap();
            log.append(1_010, payload(1), 10).unwrap();
        }
        let mut log = SampleLog::open(&path).unwrap();
        assert_eq!(log.next_index(), 3);
        assert_eq!(log.append(1_020, payload(1), 10).unwrap().index, 3);
    }
}
