use std::fs::File;
use std::path::Path;

use log::{error, info, warn};
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::record::Job;

#[derive(Debug, Deserialize, Clone)]
pub struct InputRecord {
    #[serde(rename = "id", alias = "ID", alias = "Id", alias = "game_id", alias = "objectid")]
    pub id: String,
    #[serde(rename = "name", alias = "Name", alias = "title", alias = "Title")]
    pub name: String,
}

/// Reads the master list. Rows that fail to deserialize are logged and
/// skipped; a missing or unreadable file is fatal.
///
/// Job indices are dense over the accepted rows so the same file always
/// yields the same indices.
pub fn load_jobs<P: AsRef<Path>>(filename: P, limit: Option<usize>) -> Result<Vec<Job>> {
    let path = filename.as_ref();
    let input_err = |source| PipelineError::Input { path: path.to_path_buf(), source };

    let file = File::open(path).map_err(|e| input_err(csv::Error::from(e)))?;
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file);

    // Non UTF-8 headers surface as a read error here.
    rdr.headers().map_err(input_err)?;

    let mut jobs = Vec::new();
    for (row, result) in rdr.deserialize::<InputRecord>().enumerate() {
        if limit.is_some_and(|max| jobs.len() >= max) {
            break;
        }
        match result {
            Ok(record) if record.id.is_empty() => {
                warn!("Skipping row {} with empty id", row + 1);
            }
            Ok(record) => jobs.push(Job {
                index: jobs.len(),
                external_id: record.id,
                label: record.name,
            }),
            Err(e) => {
                error!("Error parsing CSV record {}: {}", row + 1, e);
            }
        }
    }

    if jobs.is_empty() {
        return Err(PipelineError::EmptyInput(path.to_path_buf()));
    }

    info!("Loaded {} games from {:?}", jobs.len(), path);
    Ok(jobs)
}
