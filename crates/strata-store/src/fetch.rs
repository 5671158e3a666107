//! Opening the bytes behind a [`Source`].

use std::fs::File;
use std::io::{BufReader, Read};
use std::time::Duration;

use strata_types::Source;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Opens a [`Source`] for reading.
pub trait SourceFetcher: Send + Sync {
    fn open(&self, source: &Source) -> StoreResult<Box<dyn Read + Send>>;
}

/// Fetches `file`, `http` and `https` URIs.
#[derive(Debug)]
pub struct UriFetcher {
    client: reqwest::blocking::Client,
}

fn fetch_error(source: &Source, reason: impl ToString) -> StoreError {
    StoreError::Fetch {
        uri: source.uri().to_string(),
        reason: reason.to_string(),
    }
}

impl UriFetcher {
    pub fn new() -> StoreResult<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// A fetcher whose HTTP connections give up after `timeout`. Transfers
    /// themselves are not time-limited.
    pub fn with_connect_timeout(timeout: Duration) -> StoreResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(None)
            .build()
            .map_err(|e| StoreError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl SourceFetcher for UriFetcher {
    fn open(&self, source: &Source) -> StoreResult<Box<dyn Read + Send>> {
        let uri = source.uri();
        match uri.scheme() {
            "file" => {
                let path = uri
                    .to_file_path()
                    .map_err(|()| fetch_error(source, "not a local path"))?;
                let file = File::open(&path).map_err(|e| fetch_error(source, e))?;
                debug!(path = %path.display(), "source opened");
                Ok(Box::new(BufReader::new(file)))
            }
            "http" | "https" => {
                let response = self
                    .client
                    .get(uri.clone())
                    .send()
                    .map_err(|e| fetch_error(source, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(fetch_error(source, format!("HTTP {status}")));
                }
                debug!(%uri, length = ?response.content_length(), "source fetched");
                Ok(Box::new(response))
            }
            other => Err(fetch_error(source, format!("unsupported scheme {other:?}"))),
        }
    }
}
