//! Turn-taking between connected tags
//!
//! Exactly one client may hold the turn at a time. Clients wait in a FIFO
//! queue, are granted the turn in arrival order and rejoin the back of the
//! queue after delivering their sample.

use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    /// Turn assigned; grant token not yet on the wire
    Granted { client: ClientId },
    AwaitingResponse { client: ClientId, since_ms: u64 },
}

impl TurnState {
    pub fn holder(&self) -> Option<ClientId> {
        match *self {
            TurnState::Idle => None,
            TurnState::Granted { client } | TurnState::AwaitingResponse { client, .. } => Some(client),
        }
    }
}

/// How a granted turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { client: ClientId, latency_ms: u64 },
    ConnectionLost { client: ClientId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("client {client} is already connected")]
    AlreadyConnected { client: ClientId },
    #[error("client {client} is not connected")]
    UnknownClient { client: ClientId },
    #[error("client {client} does not hold the turn in the expected phase (state {state:?})")]
    NotHolder { client: ClientId, state: TurnState },
}

#[derive(Debug, Default)]
pub struct TurnScheduler {
    queue: VecDeque<ClientId>,
    connected: HashSet<ClientId>,
    state: TurnState,
    completed: u64,
    lost: u64,
}

impl TurnScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn busy_client(&self) -> Option<ClientId> {
        self.state.holder()
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        self.connected.contains(&client)
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Clients waiting for a turn, head first
    pub fn queued(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.queue.iter().copied()
    }

    /// Turns that ended `(completed, connection lost)`
    pub fn turn_counts(&self) -> (u64, u64) {
        (self.completed, self.lost)
    }

    pub fn connect(&mut self, client: ClientId) -> Result<(), SchedulerError> {
        if !self.connected.insert(client) {
            return Err(SchedulerError::AlreadyConnected { client });
        }
        self.queue.push_back(client);
        info!(client, queued = self.queue.len(), "client connected");
        Ok(())
    }

    /// Hand the turn to the queue head, if nobody holds it
    pub fn next_grant(&mut self) -> Option<ClientId> {
        if self.state != TurnState::Idle {
            return None;
        }
        let client = self.queue.pop_front()?;
        self.state = TurnState::Granted { client };
        debug!(client, "turn granted");
        Some(client)
    }

    pub fn grant_sent(&mut self, client: ClientId, now_ms: u64) -> Result<(), SchedulerError> {
        match self.state {
            TurnState::Granted { client: holder } if holder == client => {
                self.state = TurnState::AwaitingResponse { client, since_ms: now_ms };
                Ok(())
            }
            state => Err(SchedulerError::NotHolder { client, state }),
        }
    }

    /// The holder delivered its sample; it rejoins the back of the queue
    pub fn response(&mut self, client: ClientId, now_ms: u64) -> Result<TurnOutcome, SchedulerError> {
        match self.state {
            TurnState::AwaitingResponse { client: holder, since_ms } if holder == client => {
                self.state = TurnState::Idle;
                self.queue.push_back(client);
                self.completed += 1;
                Ok(TurnOutcome::Completed {
                    client,
                    latency_ms: now_ms.saturating_sub(since_ms),
                })
            }
            state => Err(SchedulerError::NotHolder { client, state }),
        }
    }

    /// Forget a client. Ends its turn as lost if it held one.
    pub fn disconnect(&mut self, client: ClientId) -> Result<Option<TurnOutcome>, SchedulerError> {
        if !self.connected.remove(&client) {
            return Err(SchedulerError::UnknownClient { client });
        }
        self.queue.retain(|queued| *queued != client);
        info!(client, "client disconnected");

        if self.state.holder() == Some(client) {
            self.state = TurnState::Idle;
            self.lost += 1;
            return Ok(Some(TurnOutcome::ConnectionLost { client }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_turn(scheduler: &mut TurnScheduler, now_ms: u64) -> ClientId {
        let client = scheduler.next_grant().unwrap();
        scheduler.grant_sent(client, now_ms).unwrap();
        assert_eq!(scheduler.next_grant(), None);
        scheduler.response(client, now_ms + 40).unwrap();
        client
    }

    #[test]
    fn test_fifo_grants() {
        let mut scheduler = TurnScheduler::new();
        for client in [1, 2, 3] {
            scheduler.connect(client).unwrap();
        }

        let order: Vec<ClientId> = (0..6).map(|turn| complete_turn(&mut scheduler, turn * 100)).collect();
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(scheduler.turn_counts(), (6, 0));
    }

    #[test]
    fn test_response_reports_latency() {
        let mut scheduler = TurnScheduler::new();
        scheduler.connect(9).unwrap();
        let client = scheduler.next_grant().unwrap();
        scheduler.grant_sent(client, 1_000).unwrap();
        assert_eq!(
            scheduler.response(client, 1_250),
            Ok(TurnOutcome::Completed { client: 9, latency_ms: 250 })
        );
        assert_eq!(scheduler.queued().collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_at_most_one_busy() {
        let mut scheduler = TurnScheduler::new();
        scheduler.connect(1).unwrap();
        scheduler.connect(2).unwrap();
        assert_eq!(scheduler.next_grant(), Some(1));
        assert_eq!(scheduler.next_grant(), None);
        scheduler.grant_sent(1, 0).unwrap();
        assert_eq!(scheduler.next_grant(), None);
        assert_eq!(scheduler.busy_client(), Some(1));

        // Only the holder may respond
        assert!(matches!(scheduler.response(2, 5), Err(SchedulerError::NotHolder { client: 2, .. })));
    }

    #[test]
    fn test_holder_disconnect_loses_turn() {
        let mut scheduler = TurnScheduler::new();
        scheduler.connect(1).unwrap();
        scheduler.connect(2).unwrap();
        scheduler.next_grant();
        scheduler.grant_sent(1, 0).unwrap();

        assert_eq!(scheduler.disconnect(1), Ok(Some(TurnOutcome::ConnectionLost { client: 1 })));
        assert_eq!(scheduler.state(), TurnState::Idle);
        assert_eq!(scheduler.next_grant(), Some(2));
        assert_eq!(scheduler.turn_counts(), (0, 1));
    }

    #[test]
    fn test_waiting_client_disconnect_leaves_queue() {
        let mut scheduler = TurnScheduler::new();
        for client in [1, 2, 3] {
            scheduler.connect(client).unwrap();
        }
        assert_eq!(scheduler.disconnect(2), Ok(None));
        assert_eq!(scheduler.queued().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(scheduler.disconnect(2), Err(SchedulerError::UnknownClient { client: 2 }));
        assert_eq!(scheduler.connect(1), Err(SchedulerError::AlreadyConnected { client: 1 }));
    }
}
