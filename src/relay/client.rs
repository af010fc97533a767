//! Tag side of the relay stream protocol

use crate::processing::sample::{SamplePayload, RANGES_PER_PAYLOAD};
use crate::ranging::tag::RoundReport;
use crate::relay::server::{ACK_TOKEN, GRANT_TOKEN};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("relay closed the connection")]
    Closed,
    #[error("expected token {expected:?}, got {got:?}")]
    UnexpectedToken { expected: char, got: String },
    #[error("ranging round aborted: {reason}")]
    RoundAborted { reason: String },
    #[error("round ranged {ranges} anchors, a payload needs two")]
    IncompleteRound { ranges: usize },
}

/// Payload line for a finished round; the round duration rides along as
/// the onboard duration
pub fn payload_from_report(report: &RoundReport) -> Result<SamplePayload, ClientError> {
    if report.ranges.len() != RANGES_PER_PAYLOAD {
        return Err(ClientError::IncompleteRound {
            ranges: report.ranges.len(),
        });
    }
    Ok(SamplePayload {
        tag_id: report.tag_id,
        ranges: report.ranges.clone(),
        onboard_duration_ms: Some(report.duration_ms as f64),
    })
}

pub struct RelayClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RelayClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(peer = ?stream.peer_addr().ok(), "connected to relay");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn expect_token(&mut self, token: u8) -> Result<(), ClientError> {
        let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
        if line.trim().as_bytes() != [token] {
            return Err(ClientError::UnexpectedToken {
                expected: char::from(token),
                got: line,
            });
        }
        Ok(())
    }

    pub async fn wait_for_grant(&mut self) -> Result<(), ClientError> {
        self.expect_token(GRANT_TOKEN).await
    }

    /// Send one payload line and wait for the acknowledgement
    pub async fn submit(&mut self, payload: &SamplePayload) -> Result<(), ClientError> {
        let line = format!("{payload}\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.expect_token(ACK_TOKEN).await?;
        debug!(tag = payload.tag_id, "sample acknowledged");
        Ok(())
    }

    /// Measure once per granted turn, `turns` times or until an error.
    ///
    /// A failed measurement ends the session; the relay sees the
    /// connection drop and releases the turn.
    pub async fn run<F, E>(&mut self, turns: Option<u64>, mut measure: F) -> Result<u64, ClientError>
    where
        F: FnMut() -> Result<SamplePayload, E>,
        E: std::fmt::Display,
    {
        let mut served = 0;
        while turns.map_or(true, |limit| served < limit) {
            self.wait_for_grant().await?;
            let payload = measure().map_err(|e| {
                warn!(error = %e, "measurement failed during turn");
                ClientError::RoundAborted { reason: e.to_string() }
            })?;
            self.submit(&payload).await?;
            served += 1;
        }
        Ok(served)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AnchorPosition, Range};
    use crate::processing::store::parse_samples;
    use crate::ranging::sim::Simulation;
    use crate::relay::server::RelayServer;
    use crate::utils::config::{RangingConfig, RelayConfig};
    use tokio::sync::oneshot;

    #[test]
    fn test_payload_from_report() {
        let report = RoundReport {
            tag_id: 4,
            ranges: vec![(101, Range::Measured(1.5)), (102, Range::Failed)],
            duration_ms: 12,
        };
        assert_eq!(payload_from_report(&report).unwrap().to_string(), "4 101 1.5 102 fail 12");
    }

    #[test]
    fn test_single_anchor_round_is_not_a_payload() {
        let report = RoundReport {
            tag_id: 4,
            ranges: vec![(101, Range::Measured(1.5))],
            duration_ms: 12,
        };
        assert!(matches!(
            payload_from_report(&report),
            Err(ClientError::IncompleteRound { ranges: 1 })
        ));
    }

    #[tokio::test]
    async fn test_simulated_tag_relays_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("samples.txt");
        let server = RelayServer::bind(RelayConfig {
            bind_address: "127.0.0.1:0".to_string(),
            sample_log_path: log_path.clone(),
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        let anchors = [AnchorPosition::origin(101, 0.0, 0.0), AnchorPosition::new(102, 2.5, 0.0)];
        let mut sim = Simulation::new(RangingConfig::default(), 1, (1.25, 2.0), &anchors);
        let mut client = RelayClient::connect(addr).await.unwrap();
        let served = client
            .run(Some(2), || -> Result<SamplePayload, Box<dyn std::error::Error>> {
                Ok(payload_from_report(&sim.run_round(1_000)?)?)
            })
            .await
            .unwrap();
        assert_eq!(served, 2);

        stop.send(()).unwrap();
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let samples = parse_samples(contents.as_bytes()).unwrap();
        assert_eq!(samples.len(), 2);
        let distance = samples[0].range_to(101).and_then(Range::distance).unwrap();
        assert!((distance - (1.25f64.powi(2) + 4.0).sqrt()).abs() < 0.01);
    }
}
