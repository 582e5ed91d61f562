use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{PipelineError, Result};
use crate::record::{ListEncoding, Record, RecordSchema};

/// Append-only CSV writer for records. Exactly one owner writes to it.
pub struct ResultSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    encoding: ListEncoding,
}

/// What a previous run already left in the output file.
#[derive(Debug, Default)]
pub struct ExistingRows {
    pub ids: HashSet<String>,
    pub rows: usize,
}

impl ResultSink {
    /// Resuming appends to the existing file; otherwise the file is created
    /// (or truncated) and gets a header row.
    pub fn open<P: AsRef<Path>>(
        path: P,
        schema: RecordSchema,
        encoding: ListEncoding,
        resume: bool,
    ) -> Result<(Self, ExistingRows)> {
        let path = path.as_ref().to_path_buf();
        let output_err = |source| PipelineError::Output { path: path.clone(), source };

        let existing = if resume && path.exists() {
            Some(scan_existing(&path, schema)?)
        } else {
            None
        };

        let (file, existing, write_header) = match existing {
            Some(existing) => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| output_err(e.into()))?;
                let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
                info!("Appending to {:?} ({} rows already present)", path, existing.rows);
                (file, existing, empty)
            }
            None => {
                if resume {
                    warn!("Output {:?} missing, creating it fresh", path);
                }
                let file = File::create(&path).map_err(|e| output_err(e.into()))?;
                (file, ExistingRows::default(), true)
            }
        };

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(schema.header()).map_err(output_err)?;
            writer.flush().map_err(|e| output_err(e.into()))?;
        }

        let sink = ResultSink {
            path,
            writer,
            encoding,
        };
        Ok((sink, existing))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durable once it returns: the row is flushed and synced to disk.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let output_err = |source| PipelineError::Output { path: self.path.clone(), source };

        self.writer.write_record(record.to_row(self.encoding)).map_err(output_err)?;
        self.writer.flush().map_err(|e| output_err(e.into()))?;
        self.writer.get_ref().sync_data().map_err(|e| output_err(e.into()))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let output_err = |source| PipelineError::Output { path: self.path.clone(), source };
        self.writer.flush().map_err(|e| output_err(e.into()))?;
        self.writer.get_ref().sync_all().map_err(|e| output_err(e.into()))?;
        Ok(())
    }
}

/// Collects ids already written and cuts off a torn final row, i.e. one
/// whose append never returned because the process died mid-write.
fn scan_existing(path: &Path, schema: RecordSchema) -> Result<ExistingRows> {
    let output_err = |source| PipelineError::Output { path: path.to_path_buf(), source };
    let bytes = fs::read(path).map_err(|e| output_err(e.into()))?;

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes.as_slice());

    let header_ok = rdr
        .byte_headers()
        .map(|h| h.iter().eq(schema.header().iter().map(|s| s.as_bytes())))
        .unwrap_or(false);
    if !header_ok && !bytes.is_empty() {
        warn!("Header of {:?} does not match the {:?} schema", path, schema);
    }

    let mut ids = Vec::new();
    let mut record = csv::ByteRecord::new();
    let mut last_start = rdr.position().byte();
    loop {
        let start = rdr.position().byte();
        match rdr.read_byte_record(&mut record) {
            Ok(true) => {
                last_start = start;
                ids.push(String::from_utf8_lossy(record.get(0).unwrap_or_default()).into_owned());
            }
            Ok(false) => break,
            Err(e) => return Err(output_err(e)),
        }
    }

    let torn = !bytes.is_empty() && !bytes.ends_with(b"\n");
    if torn {
        // A torn header leaves nothing worth keeping.
        let keep = if ids.pop().is_some() { last_start } else { 0 };
        warn!("Dropping incomplete last row of {:?} ({} bytes)", path, bytes.len() as u64 - keep);
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| output_err(e.into()))?;
        file.set_len(keep).map_err(|e| output_err(e.into()))?;
        file.sync_all().map_err(|e| output_err(e.into()))?;
    }

    Ok(ExistingRows {
        rows: ids.len(),
        ids: ids.into_iter().collect(),
    })
}
