use std::path::{Path, PathBuf};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs as async_fs;
use crate::collection::collectors::Collector;
use crate::collection::{normalize_name, FetchOutcome, RawSnapshotRecord};
use crate::error::CollectorError;

/// Reads an NDJSON spool file that an external scraper rewrites on each pass.
///
/// Each line is one `RawSnapshotRecord`. Lines that fail to parse are skipped and the fetch
/// reports a parse error alongside the records that did parse. A missing `source` field is
/// filled with this collector's source name.
pub struct FileFeedCollector {
    source: String,
    path: PathBuf,
}

impl FileFeedCollector {
    pub fn new(source: &str, path: impl AsRef<Path>) -> Self {
        FileFeedCollector {
            source: normalize_name(source),
            path: path.as_ref().to_path_buf(),
        }
    }

    fn parse(&self, contents: &str) -> FetchOutcome {
        let mut records = Vec::new();
        let mut bad_lines = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawSnapshotRecord>(line) {
                Ok(mut record) => {
                    if record.source.trim().is_empty() {
                        record.source = self.source.clone();
                    }
                    if record.raw_payload_ref.is_none() {
                        record.raw_payload_ref = Some(payload_ref(line));
                    }
                    records.push(record);
                }
                Err(e) => {
                    tracing::debug!(source = %self.source, line = idx + 1, "Unparsable feed line: {}", e);
                    bad_lines.push(idx + 1);
                }
            }
        }

        if bad_lines.is_empty() {
            FetchOutcome::ok(records)
        } else {
            FetchOutcome::partial(
                records,
                CollectorError::Parse(format!(
                    "{} unparsable line(s) in {}, first at line {}",
                    bad_lines.len(),
                    self.path.display(),
                    bad_lines[0]
                )),
            )
        }
    }
}

fn payload_ref(line: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(line.as_bytes())))
}

#[async_trait]
impl Collector for FileFeedCollector {
    async fn fetch(&self) -> FetchOutcome {
        match async_fs::read_to_string(&self.path).await {
            Ok(contents) => self.parse(&contents),
            Err(e) => FetchOutcome::failed(CollectorError::Network(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GOOD: &str = r#"{"external_entity_id":"game42","market_type":"moneyline","side":"home","price":-110,"observed_at":"2024-03-01T12:00:00Z"}"#;

    fn spool(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_records_and_fills_source() {
        let file = spool(&format!("{}\n\n{}\n", GOOD, GOOD));
        let collector = FileFeedCollector::new("FeedA", file.path());

        let outcome = collector.fetch().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].source, "feeda");
        assert!(outcome.records[0].raw_payload_ref.as_deref().unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_bad_line_yields_partial_result() {
        let file = spool(&format!("{}\nnot json\n", GOOD));
        let collector = FileFeedCollector::new("feedA", file.path());

        let outcome = collector.fetch().await;
        assert_eq!(outcome.records.len(), 1);
        assert!(matches!(outcome.error, Some(CollectorError::Parse(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_failure() {
        let collector = FileFeedCollector::new("feedA", "/definitely/not/here.ndjson");
        let outcome = collector.fetch().await;
        assert!(outcome.records.is_empty());
        assert!(matches!(outcome.error, Some(CollectorError::Network(_))));
    }
}
