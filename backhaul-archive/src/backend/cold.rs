//! Cold-storage backend: HTTP object store plus a key-value record index.
//!
//! The gateway stores opaque blobs under `/blobs/<key>` and JSON records
//! under `/records/<key>`; `GET /records` returns the whole index. Cold
//! tiers carry early-deletion penalties, so profiles for this backend
//! default to a 90-day protection window — the prune path refuses to
//! delete a protected set no matter what keep-count says.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::backend::{ArchiveRecord, ArchiverBackend};
use crate::error::{io_err, ArchiveError};

pub struct ColdArchiver {
    endpoint: String,
    access_token: Option<String>,
    agent: ureq::Agent,
}

impl ColdArchiver {
    pub fn new(endpoint: impl Into<String>, access_token: Option<String>) -> Self {
        ColdArchiver {
            endpoint: endpoint.into(),
            access_token,
            agent: ureq::Agent::new(),
        }
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/blobs/{key}", self.endpoint.trim_end_matches('/'))
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/records/{key}", self.endpoint.trim_end_matches('/'))
    }

    fn index_url(&self) -> String {
        format!("{}/records", self.endpoint.trim_end_matches('/'))
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.access_token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    fn http(e: ureq::Error) -> ArchiveError {
        ArchiveError::Backend(Box::new(e))
    }
}

impl ArchiverBackend for ColdArchiver {
    fn put_blob(&self, key: &str, path: &Path) -> Result<(), ArchiveError> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let size = file.metadata().map_err(|e| io_err(path, e))?.len();
        let request = self
            .authorize(self.agent.put(&self.blob_url(key)))
            .set("Content-Type", "application/octet-stream")
            .set("Content-Length", &size.to_string());
        request
            .send(file)
            .map_err(|e| ArchiveError::Upload {
                key: key.to_owned(),
                detail: e.to_string(),
            })
            .map(|_| ())
    }

    fn get_blob(&self, key: &str, out: &mut dyn Write) -> Result<u64, ArchiveError> {
        let response = self
            .authorize(self.agent.get(&self.blob_url(key)))
            .call()
            .map_err(Self::http)?;
        let mut reader = response.into_reader();
        let mut buf = vec![0u8; 256 << 10];
        let mut total = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| io_err(self.blob_url(key), e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| io_err(self.blob_url(key), e))?;
            total += n as u64;
        }
        Ok(total)
    }

    fn delete_blob(&self, key: &str) -> Result<(), ArchiveError> {
        self.authorize(self.agent.delete(&self.blob_url(key)))
            .call()
            .map_err(Self::http)
            .map(|_| ())
    }

    fn put_record(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        self.authorize(self.agent.put(&self.record_url(&record.key)))
            .send_json(record)
            .map_err(Self::http)
            .map(|_| ())
    }

    fn list_records(&self) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let response = self
            .authorize(self.agent.get(&self.index_url()))
            .call()
            .map_err(Self::http)?;
        let records: Vec<ArchiveRecord> = serde_json::from_reader(response.into_reader())?;
        Ok(records)
    }

    fn delete_record(&self, key: &str) -> Result<(), ArchiveError> {
        self.authorize(self.agent.delete(&self.record_url(key)))
            .call()
            .map_err(Self::http)
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_at_endpoint() {
        let archiver = ColdArchiver::new("https://cold.example.org/vault/", None);
        assert_eq!(
            archiver.blob_url("20260807-030000/remote-fs-db01"),
            "https://cold.example.org/vault/blobs/20260807-030000/remote-fs-db01"
        );
        assert_eq!(
            archiver.record_url("k"),
            "https://cold.example.org/vault/records/k"
        );
        assert_eq!(archiver.index_url(), "https://cold.example.org/vault/records");
    }
}
