//! Relay server: grants turns to connected tags and logs their samples
//!
//! Everything runs in one loop on one task. The loop waits on the listener,
//! the socket of the tag holding the turn and a bounded timer, so at most
//! one tag is ever busy and no state is shared.

use crate::processing::sample::SamplePayload;
use crate::relay::log::SampleLog;
use crate::relay::scheduler::{ClientId, TurnOutcome, TurnScheduler, TurnState};
use crate::utils::config::RelayConfig;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Server → tag: your turn
pub const GRANT_TOKEN: u8 = b'1';
/// Server → tag: sample received
pub const ACK_TOKEN: u8 = b'7';

/// Startup failures. Nothing after startup is fatal.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to open sample log {path}: {source}")]
    LogOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub samples_logged: u64,
    pub turns_completed: u64,
    pub turns_lost: u64,
    pub rejected_payloads: u64,
}

struct Connection {
    peer: SocketAddr,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

enum LoopEvent {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Response(ClientId, io::Result<Option<String>>),
    Tick,
    Shutdown,
}

/// Wall-clock milliseconds since the Unix epoch
pub fn wall_clock_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

async fn read_response(connections: &mut HashMap<ClientId, Connection>, holder: Option<ClientId>) -> LoopEvent {
    let Some(connection) = holder.and_then(|client| connections.get_mut(&client).map(|c| (client, c))) else {
        return std::future::pending().await;
    };
    let (client, connection) = connection;
    LoopEvent::Response(client, connection.lines.next_line().await)
}

pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    log: SampleLog,
    scheduler: TurnScheduler,
    connections: HashMap<ClientId, Connection>,
    next_client: ClientId,
    started: Instant,
    stats: RelayStats,
}

impl RelayServer {
    /// Bind the listener and open the sample log
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|source| RelayError::Bind {
                address: config.bind_address.clone(),
                source,
            })?;
        let log = SampleLog::open(&config.sample_log_path).map_err(|source| RelayError::LogOpen {
            path: config.sample_log_path.clone(),
            source,
        })?;
        info!(address = %config.bind_address, log = %config.sample_log_path.display(), "relay listening");
        Ok(Self {
            config,
            listener,
            log,
            scheduler: TurnScheduler::new(),
            connections: HashMap::new(),
            next_client: 1,
            started: Instant::now(),
            stats: RelayStats::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> RelayStats {
        tokio::pin!(shutdown);
        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);

        loop {
            let holder = match self.scheduler.state() {
                TurnState::AwaitingResponse { client, .. } => Some(client),
                _ => None,
            };
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => LoopEvent::Shutdown,
                accepted = self.listener.accept() => LoopEvent::Accepted(accepted),
                response = read_response(&mut self.connections, holder) => response,
                _ = tokio::time::sleep(poll_timeout) => LoopEvent::Tick,
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Accepted(Ok((stream, peer))) => self.accept(stream, peer),
                LoopEvent::Accepted(Err(e)) => warn!(error = %e, "accept failed"),
                LoopEvent::Response(client, Ok(Some(line))) => self.complete_turn(client, &line).await,
                LoopEvent::Response(client, Ok(None)) => self.drop_client(client, "closed by peer"),
                LoopEvent::Response(client, Err(e)) => self.drop_client(client, &e.to_string()),
                LoopEvent::Tick => self.expire_turn(),
            }

            self.grant_turns().await;
        }

        info!(stats = ?self.stats, "relay stopped");
        self.stats
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to disable nagle");
        }
        let client = self.next_client;
        self.next_client += 1;
        let (reader, writer) = stream.into_split();
        self.connections.insert(
            client,
            Connection {
                peer,
                lines: BufReader::new(reader).lines(),
                writer,
            },
        );
        if let Err(e) = self.scheduler.connect(client) {
            warn!(client, error = %e, "scheduler rejected connection");
        }
        info!(client, %peer, "tag connected");
    }

    /// Log the holder's sample and ack it. An unparseable line ends the
    /// turn as lost and closes the connection, so the log stays loadable.
    async fn complete_turn(&mut self, client: ClientId, line: &str) {
        let receipt_ms = wall_clock_ms();
        let payload = match line.parse::<SamplePayload>() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.rejected_payloads += 1;
                warn!(client, line, error = %e, "rejected malformed payload");
                self.drop_client(client, "malformed payload");
                return;
            }
        };
        let outcome = match self.scheduler.response(client, self.now_ms()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(client, error = %e, "unexpected response");
                return;
            }
        };
        let TurnOutcome::Completed { latency_ms, .. } = outcome else {
            return;
        };
        self.stats.turns_completed += 1;

        match self.log.append(receipt_ms, payload, latency_ms) {
            Ok(sample) => {
                self.stats.samples_logged += 1;
                debug!(client, index = sample.index, latency_ms, "sample relayed");
            }
            Err(e) => error!(client, error = %e, "failed to write sample log"),
        }

        let acked = match self.connections.get_mut(&client) {
            Some(connection) => connection.writer.write_all(&[ACK_TOKEN, b'\n']).await,
            None => return,
        };
        if let Err(e) = acked {
            self.drop_client(client, &e.to_string());
        }
    }

    fn drop_client(&mut self, client: ClientId, reason: &str) {
        let peer = self.connections.remove(&client).map(|connection| connection.peer);
        match self.scheduler.disconnect(client) {
            Ok(Some(TurnOutcome::ConnectionLost { .. })) => {
                self.stats.turns_lost += 1;
                warn!(client, ?peer, reason, "connection lost during turn");
            }
            Ok(_) => info!(client, ?peer, reason, "tag disconnected"),
            Err(e) => debug!(client, error = %e, "already disconnected"),
        }
    }

    fn expire_turn(&mut self) {
        if let TurnState::AwaitingResponse { client, since_ms } = self.scheduler.state() {
            if self.now_ms().saturating_sub(since_ms) >= self.config.response_timeout_ms {
                self.drop_client(client, "response timed out");
            }
        }
    }

    async fn grant_turns(&mut self) {
        while let Some(client) = self.scheduler.next_grant() {
            let sent = match self.connections.get_mut(&client) {
                Some(connection) => connection.writer.write_all(&[GRANT_TOKEN, b'\n']).await,
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
            };
            match sent {
                Ok(()) => {
                    let now_ms = self.now_ms();
                    if let Err(e) = self.scheduler.grant_sent(client, now_ms) {
                        warn!(client, error = %e, "grant bookkeeping failed");
                    }
                    debug!(client, "grant sent");
                    return;
                }
                Err(e) => self.drop_client(client, &e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::store::parse_samples;
    use tokio::sync::oneshot;

    struct TestTag {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestTag {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn expect(&mut self, token: &str) {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(line.as_deref(), Some(token));
        }

        async fn expect_closed(&mut self) {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap();
            assert!(!matches!(line, Ok(Some(_))), "unexpected line {line:?}");
        }

        async fn send(&mut self, payload: &str) {
            self.writer.write_all(format!("{payload}\n").as_bytes()).await.unwrap();
        }
    }

    async fn start(dir: &tempfile::TempDir) -> (SocketAddr, PathBuf, oneshot::Sender<()>, tokio::task::JoinHandle<RelayStats>) {
        let log_path = dir.path().join("samples.txt");
        let config = RelayConfig {
            bind_address: "127.0.0.1:0".to_string(),
            sample_log_path: log_path.clone(),
            poll_timeout_ms: 20,
            response_timeout_ms: 10_000,
        };
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        (addr, log_path, stop, handle)
    }

    fn logged_tags(path: &std::path::Path) -> Vec<u16> {
        let contents = std::fs::read_to_string(path).unwrap();
        parse_samples(contents.as_bytes()).unwrap().iter().map(|sample| sample.tag_id).collect()
    }

    #[tokio::test]
    async fn test_turns_follow_connection_order() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, log_path, stop, handle) = start(&dir).await;

        let mut t1 = TestTag::connect(addr).await;
        t1.expect("1").await;
        let mut t2 = TestTag::connect(addr).await;
        let mut t3 = TestTag::connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        t1.send("1 101 2.5 102 2.0 40").await;
        t1.expect("7").await;
        t2.expect("1").await;
        t2.send("2 101 1.5 102 fail").await;
        t2.expect("7").await;
        t3.expect("1").await;
        t3.send("3 103 0.5 104 0.75").await;
        t3.expect("7").await;
        t1.expect("1").await;

        assert_eq!(logged_tags(&log_path), vec![1, 2, 3]);

        stop.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.samples_logged, 3);
        assert_eq!(stats.turns_lost, 0);
    }

    #[tokio::test]
    async fn test_lost_holder_releases_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, log_path, stop, handle) = start(&dir).await;

        let mut t1 = TestTag::connect(addr).await;
        t1.expect("1").await;
        let mut t2 = TestTag::connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(t1);
        t2.expect("1").await;
        t2.send("2 101 1.5 102 1.0").await;
        t2.expect("7").await;

        assert_eq!(logged_tags(&log_path), vec![2]);

        stop.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.turns_lost, 1);
        assert_eq!(stats.samples_logged, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_ends_turn_as_lost() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, log_path, stop, handle) = start(&dir).await;

        let mut t1 = TestTag::connect(addr).await;
        t1.expect("1").await;
        let mut t2 = TestTag::connect(addr).await;
        let mut t3 = TestTag::connect(addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        t1.send("garbage line").await;
        t1.expect_closed().await;
        t2.expect("1").await;
        t2.send("2 101 2.5 102").await;
        t2.expect_closed().await;
        t3.expect("1").await;
        t3.send("3 101 1.5 102 1.0").await;
        t3.expect("7").await;

        assert_eq!(logged_tags(&log_path), vec![3]);

        stop.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.rejected_payloads, 2);
        assert_eq!(stats.turns_lost, 2);
        assert_eq!(stats.turns_completed, 1);
        assert_eq!(stats.samples_logged, 1);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            bind_address: "not an address".to_string(),
            sample_log_path: dir.path().join("samples.txt"),
            ..RelayConfig::default()
        };
        assert!(matches!(RelayServer::bind(config).await, Err(RelayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_log_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            bind_address: "127.0.0.1:0".to_string(),
            sample_log_path: dir.path().join("missing").join("samples.txt"),
            ..RelayConfig::default()
        };
        assert!(matches!(RelayServer::bind(config).await, Err(RelayError::LogOpen { .. })));
    }
}
