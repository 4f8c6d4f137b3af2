//! HTTP relay client.
//!
//! A second drain path for the fragment log. Before uploading, the relay's
//! last acknowledged sequence is fetched and fed to the ack tracker so the
//! `http_acked` mark matches what the relay actually holds.
//!
//! ```text
//! GET  {base}/succinct/api/v1/ack/{team}             404 | 200 "<seq>"
//! POST {base}/succinct/api/v1/uploadFragment/{team}  200 "<seq>"
//! ```

use reqwest::StatusCode;
use succinct_core::PeerId;

use crate::fragment_log::{Fragment, HTTP_ACKED, SENDING};
use crate::queue::{MessageQueue, QueueError};

pub const API_PREFIX: &str = "/succinct/api/v1";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay answered {0}")]
    Status(StatusCode),

    #[error("relay sent an unreadable sequence: {0:?}")]
    BadBody(String),
}

#[derive(Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Last sequence the relay holds for `team`; `None` when it holds nothing.
    pub async fn get_ack(&self, team: &PeerId) -> Result<Option<i64>, RelayError> {
        let url = format!("{}{}/ack/{}", self.base_url, API_PREFIX, team);
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => parse_seq(&resp.text().await?).map(Some),
            status => Err(RelayError::Status(status)),
        }
    }

    /// Upload one fragment; returns the relay's new last sequence.
    pub async fn upload(&self, team: &PeerId, fragment: &Fragment) -> Result<i64, RelayError> {
        let url = format!("{}{}/uploadFragment/{}", self.base_url, API_PREFIX, team);
        let resp = self
            .client
            .post(&url)
            .body(fragment.bytes.clone())
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => parse_seq(&resp.text().await?),
            status => Err(RelayError::Status(status)),
        }
    }

    /// Reconcile with the relay and upload whatever it lacks. Relay failures
    /// end the pass quietly; only log inconsistencies are returned.
    pub async fn send_pass(&self, queue: &mut MessageQueue) -> Result<(), QueueError> {
        match self.drain(queue).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(relay = %self.base_url, error = %e, "relay pass aborted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn drain(&self, queue: &mut MessageQueue) -> Result<Result<(), RelayError>, QueueError> {
        let team = queue.team_id();
        let log = queue.fragments_mut();
        log.cursor().reset(HTTP_ACKED)?;
        if log.cursor().next()? {
            let acked = match self.get_ack(&team).await {
                Ok(acked) => acked,
                Err(e) => return Ok(Err(e)),
            };
            tracing::debug!(?acked, "relay ack fetched");
            queue.ack_up_to(acked.unwrap_or(-1))?;
        }

        loop {
            let fragment = match queue.fragments_mut().current()? {
                Some(fragment) => fragment,
                None => {
                    if queue.next_message()? && queue.fragments_mut().cursor().next()? {
                        continue;
                    }
                    queue.fragments_mut().cursor().commit_mark_as(SENDING)?;
                    return Ok(Ok(()));
                }
            };

            let acked = match self.upload(&team, &fragment).await {
                Ok(acked) => acked,
                Err(e) => return Ok(Err(e)),
            };
            tracing::debug!(seq = fragment.seq, acked, "fragment uploaded");
            queue.ack_up_to(acked)?;
            if acked < i64::from(fragment.seq) {
                // relay is missing earlier fragments; resume from its ack next wake
                tracing::info!(seq = fragment.seq, acked, "relay behind, rewinding");
                return Ok(Ok(()));
            }
        }
    }
}

fn parse_seq(body: &str) -> Result<i64, RelayError> {
    body.trim()
        .parse()
        .map_err(|_| RelayError::BadBody(body.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_bodies() {
        assert_eq!(parse_seq("17\n").unwrap(), 17);
        assert_eq!(parse_seq("-1").unwrap(), -1);
        assert!(matches!(parse_seq("seventeen"), Err(RelayError::BadBody(_))));
    }

    #[test]
    fn base_url_is_normalised() {
        assert_eq!(RelayClient::new("http://relay:8080/").base_url(), "http://relay:8080");
    }
}
