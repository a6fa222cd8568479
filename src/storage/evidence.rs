//! Evidence artifacts: metadata rows, ordered text chunks, and aggregation
//! into files on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Store;

/// Who an evidence artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceScope {
    Job,
    Case,
}

impl EvidenceScope {
    pub fn type_id(self) -> i64 {
        match self {
            EvidenceScope::Job => 1,
            EvidenceScope::Case => 2,
        }
    }

    fn from_type_id(id: i64) -> Self {
        if id == 1 {
            EvidenceScope::Job
        } else {
            EvidenceScope::Case
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "job" | "global" => Some(EvidenceScope::Job),
            "case" | "unitary" => Some(EvidenceScope::Case),
            _ => None,
        }
    }
}

/// Metadata row for one named artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceFile {
    pub evidence_id: String,
    pub file_name: String,
    pub uri: PathBuf,
    pub scope: EvidenceScope,
    pub execution_id: String,
    pub case_id: Option<String>,
}

impl Store {
    /// Append a chunk to an artifact, creating its metadata row on first write.
    ///
    /// `case_id` is `None` for job-level artifacts.
    pub fn append_evidence(
        &self,
        execution_id: &str,
        case_id: Option<&str>,
        file_name: &str,
        uri: &Path,
        content: &str,
    ) -> Result<()> {
        let mut conn = self.pool().get()?;
        // Write lock up front: a deferred snapshot cannot upgrade once
        // another appender has committed.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let scope = if case_id.is_some() {
            EvidenceScope::Case
        } else {
            EvidenceScope::Job
        };
        let case_key = case_id.unwrap_or("");

        tx.execute(
            "INSERT INTO evidence_file
                (evidence_id, file_name, evidence_uri, type_id, test_execution_id, case_execution_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (test_execution_id, case_execution_id, file_name) DO NOTHING",
            params![
                format!("ef-{}", uuid::Uuid::new_v4().simple()),
                file_name,
                uri.to_string_lossy(),
                scope.type_id(),
                execution_id,
                case_key
            ],
        )
        .context("Failed to insert evidence file")?;

        let evidence_id: String = tx
            .query_row(
                "SELECT evidence_id FROM evidence_file
                 WHERE test_execution_id = ?1 AND case_execution_id = ?2 AND file_name = ?3",
                params![execution_id, case_key, file_name],
                |row| row.get(0),
            )
            .context("Failed to look up evidence file")?;

        tx.execute(
            "INSERT INTO evidence_text (evidence_id, evidence_text) VALUES (?1, ?2)",
            params![evidence_id, content],
        )
        .context("Failed to append evidence text")?;

        tx.commit()?;
        Ok(())
    }

    /// All artifacts recorded for a job, ordered by target path.
    pub fn evidence_for_job(&self, execution_id: &str) -> Result<Vec<EvidenceFile>> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT evidence_id, file_name, evidence_uri, type_id, test_execution_id, case_execution_id
             FROM evidence_file WHERE test_execution_id = ?1
             ORDER BY evidence_uri ASC",
        )?;

        let rows = stmt.query_map(params![execution_id], |row| {
            let case_id: String = row.get(5)?;
            Ok(EvidenceFile {
                evidence_id: row.get(0)?,
                file_name: row.get(1)?,
                uri: PathBuf::from(row.get::<_, String>(2)?),
                scope: EvidenceScope::from_type_id(row.get(3)?),
                execution_id: row.get(4)?,
                case_id: (!case_id.is_empty()).then_some(case_id),
            })
        })?;

        let mut files = Vec::new();
        for r in rows {
            files.push(r?);
        }
        Ok(files)
    }

    /// Text chunks of one artifact in write order.
    pub fn evidence_chunks(&self, evidence_id: &str) -> Result<Vec<String>> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT evidence_text FROM evidence_text WHERE evidence_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![evidence_id], |row| row.get::<_, String>(0))?;
        let mut chunks = Vec::new();
        for r in rows {
            chunks.push(r?);
        }
        Ok(chunks)
    }
}

/// Render chunks the way artifact files are laid out: one chunk per line.
pub fn render_chunks(chunks: &[String]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(chunk);
        out.push('\n');
    }
    out
}

/// Write every artifact of a job to its file. Re-running against an unchanged
/// evidence table rewrites the same bytes.
pub fn collect_job_evidence(store: &Store, execution_id: &str) -> Result<Vec<PathBuf>> {
    let files = store.evidence_for_job(execution_id)?;
    let mut written = Vec::with_capacity(files.len());

    for file in files {
        let chunks = store.evidence_chunks(&file.evidence_id)?;
        if chunks.is_empty() {
            debug!(evidence_id = %file.evidence_id, "no chunks, skipping artifact");
            continue;
        }
        if let Some(parent) = file.uri.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&file.uri, render_chunks(&chunks))
            .with_context(|| format!("failed to write {}", file.uri.display()))?;
        written.push(file.uri);
    }

    info!(job_id = %execution_id, artifacts = written.len(), "evidence collected");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_store;

    #[test]
    fn test_concurrent_appends_keep_every_chunk() {
        let (dir, store) = temp_store();
        let uri = dir.path().join("ex-1/summary.txt");

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                let uri = uri.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        store
                            .append_evidence("ex-1", None, "summary.txt", &uri, &format!("{worker}-{n}"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let files = store.evidence_for_job("ex-1").unwrap();
        assert_eq!(files.len(), 1);
        let chunks = store.evidence_chunks(&files[0].evidence_id).unwrap();
        assert_eq!(chunks.len(), 200);
        for worker in 0..4 {
            let mine: Vec<_> = chunks
                .iter()
                .filter(|c| c.starts_with(&format!("{worker}-")))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..50).map(|n| format!("{worker}-{n}")).collect();
            assert_eq!(mine, expected);
        }
    }

    #[test]
    fn test_append_creates_metadata_once() {
        let (dir, store) = temp_store();
        let uri = dir.path().join("ex-1/ce-1/log.txt");

        store
            .append_evidence("ex-1", Some("ce-1"), "log.txt", &uri, "first")
            .unwrap();
        store
            .append_evidence("ex-1", Some("ce-1"), "log.txt", &uri, "second")
            .unwrap();

        let files = store.evidence_for_job("ex-1").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].scope, EvidenceScope::Case);
        assert_eq!(files[0].case_id.as_deref(), Some("ce-1"));

        let chunks = store.evidence_chunks(&files[0].evidence_id).unwrap();
        assert_eq!(chunks, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_same_name_different_scope_is_distinct() {
        let (dir, store) = temp_store();
        store
            .append_evidence("ex-1", None, "summary.txt", &dir.path().join("a"), "job")
            .unwrap();
        store
            .append_evidence("ex-1", Some("ce-1"), "summary.txt", &dir.path().join("b"), "case")
            .unwrap();

        let files = store.evidence_for_job("ex-1").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.scope == EvidenceScope::Job));
    }

    #[test]
    fn test_collection_is_idempotent() {
        let (dir, store) = temp_store();
        let job_uri = dir.path().join("evidence/ex-1/report.txt");
        let case_uri = dir.path().join("evidence/ex-1/ce-9/steps.txt");

        store
            .append_evidence("ex-1", None, "report.txt", &job_uri, "header")
            .unwrap();
        store
            .append_evidence("ex-1", Some("ce-9"), "steps.txt", &case_uri, "clicked login")
            .unwrap();
        store
            .append_evidence("ex-1", None, "report.txt", &job_uri, "footer")
            .unwrap();

        let first = collect_job_evidence(&store, "ex-1").unwrap();
        let job_bytes = std::fs::read(&job_uri).unwrap();
        let case_bytes = std::fs::read(&case_uri).unwrap();

        let second = collect_job_evidence(&store, "ex-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&job_uri).unwrap(), job_bytes);
        assert_eq!(std::fs::read(&case_uri).unwrap(), case_bytes);
        assert_eq!(job_bytes, b"header\nfooter\n");
    }

    #[test]
    fn test_scope_parse_accepts_legacy_names() {
        assert_eq!(EvidenceScope::parse("global"), Some(EvidenceScope::Job));
        assert_eq!(EvidenceScope::parse("Case"), Some(EvidenceScope::Case));
        assert_eq!(EvidenceScope::parse("other"), None);
    }
}
