//! Line-protocol match sessions

use arena_core::config::SessionConfig;
use arena_core::{Action, ConnectionError, Observation, ResetConfig, SessionError, Transition};
use arena_env::{MatchSession, SessionConnector, SessionState};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::{ObservationPayload, WireMessage, deserialize, serialize};
use crate::tcp::{self, TcpReadWrapper, TcpWriteWrapper};
use crate::transport::{RecordReader, RecordWriter, TransportError};

/// Session over the TCP training bridge
pub type TcpSession = LineSession<TcpReadWrapper, TcpWriteWrapper>;

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(_) | TransportError::Truncated => SessionError::Disconnected,
            TransportError::RecordTooLarge { .. } => SessionError::Protocol(err.to_string()),
        }
    }
}

/// One match over a record transport. Lock-step: each call writes one request
/// and waits for its reply before returning.
pub struct LineSession<R, W> {
    id: String,
    slot: usize,
    state: SessionState,
    reader: R,
    writer: W,
    io_timeout: Duration,
    last_observation: Option<Observation>,
    pending_action: Option<Action>,
    last_error: Option<SessionError>,
}

impl<R: RecordReader, W: RecordWriter> LineSession<R, W> {
    pub fn new(id: impl Into<String>, slot: usize, reader: R, writer: W, io_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            slot,
            state: SessionState::Ready,
            reader,
            writer,
            io_timeout,
            last_observation: None,
            pending_action: None,
            last_error: None,
        }
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.last_observation.as_ref()
    }

    /// Action sent but not yet answered, if a step was interrupted
    pub fn pending_action(&self) -> Option<&Action> {
        self.pending_action.as_ref()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Mark the session failed. Every later call short-circuits.
    fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(session = %self.id, error = %err, "Session failed");
        self.state = SessionState::Failed;
        self.last_error = Some(err.clone());
        err
    }

    /// Recoverable rejection; state is unchanged
    fn reject(&mut self, err: SessionError) -> SessionError {
        self.last_error = Some(err.clone());
        err
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Failed | SessionState::Closed => Err(SessionError::Disconnected),
            _ => Ok(()),
        }
    }

    async fn send(&mut self, msg: &WireMessage) -> Result<(), SessionError> {
        let data = serialize(msg)?;
        let json_preview: String = String::from_utf8_lossy(&data).chars().take(200).collect();
        debug!("[Rust→Sim] session={} len={} json={}", self.id, data.len(), json_preview);

        match timeout(self.io_timeout, self.writer.write_record(&data)).await {
            Err(_) => Err(self.fail(SessionError::Timeout)),
            Ok(Err(e)) => Err(self.fail(e.into())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn receive(&mut self) -> Result<WireMessage, SessionError> {
        let data = match timeout(self.io_timeout, self.reader.read_record()).await {
            Err(_) => return Err(self.fail(SessionError::Timeout)),
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Ok(Ok(None)) => return Err(self.fail(SessionError::Disconnected)),
            Ok(Ok(Some(data))) => data,
        };

        let json_preview: String = String::from_utf8_lossy(&data).chars().take(200).collect();
        debug!("[Sim→Rust] session={} len={} json={}", self.id, data.len(), json_preview);

        deserialize(&data).map_err(|e| self.fail(e.into()))
    }

    /// Send a request and wait for its observation
    async fn exchange(
        &mut self,
        msg: &WireMessage,
    ) -> Result<ObservationPayload, SessionError> {
        self.send(msg).await?;
        match self.receive().await? {
            WireMessage::Observation { payload } => Ok(payload),
            WireMessage::Error { message } => Err(self.reject(SessionError::Protocol(message))),
            other => Err(self.fail(SessionError::Protocol(format!(
                "unexpected {} record",
                other.kind()
            )))),
        }
    }
}

#[async_trait]
impl<R: RecordReader + 'static, W: RecordWriter + 'static> MatchSession for LineSession<R, W> {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn reset(&mut self, config: &ResetConfig) -> Result<Observation, SessionError> {
        self.ensure_open()?;
        let payload = self
            .exchange(&WireMessage::Reset {
                config: config.clone(),
            })
            .await?;
        if payload.done {
            return Err(self.fail(SessionError::Protocol(
                "reset answered with a terminal observation".into(),
            )));
        }

        let observation = payload.observation();
        self.last_observation = Some(observation.clone());
        self.pending_action = None;
        self.state = SessionState::Stepping;
        Ok(observation)
    }

    async fn step(&mut self, action: &Action) -> Result<Transition, SessionError> {
        self.ensure_open()?;
        match self.state {
            SessionState::Stepping => {}
            SessionState::Terminal => {
                return Err(self.reject(SessionError::Protocol("step after terminal".into())));
            }
            _ => return Err(self.reject(SessionError::Protocol("step before reset".into()))),
        }

        let masks = self
            .last_observation
            .as_ref()
            .map(|o| o.action_masks.clone())
            .unwrap_or_default();
        self.pending_action = Some(action.clone());
        let payload = self
            .exchange(&WireMessage::Step {
                action: action.clone(),
                masks,
            })
            .await?;
        self.pending_action = None;

        let transition = payload.into_transition(self.slot);
        if transition.done {
            debug!(session = %self.id, end_reason = ?transition.end_reason, "Match ended");
            self.state = SessionState::Terminal;
        }
        self.last_observation = Some(transition.observation.clone());
        Ok(transition)
    }

    async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state != SessionState::Failed {
            // Best effort; the peer may already be gone
            if let Ok(data) = serialize(&WireMessage::Close) {
                let _ = timeout(self.io_timeout, self.writer.write_record(&data)).await;
            }
        }
        let _ = timeout(self.io_timeout, self.writer.shutdown()).await;
        self.state = SessionState::Closed;
        debug!(session = %self.id, "Session closed");
    }
}

/// Opens `TcpSession`s against the simulation's training bridge
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    config: SessionConfig,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            address: address.into(),
            config,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect a concrete `TcpSession`
    pub async fn connect_tcp(&self, slot: usize) -> Result<TcpSession, ConnectionError> {
        let (reader, writer) = tcp::dial(&self.address, self.config.connect_timeout()).await?;
        Ok(LineSession::new(
            format!("{}#{}", self.address, slot),
            slot,
            reader,
            writer,
            self.config.io_timeout(),
        ))
    }
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self, slot: usize) -> Result<Box<dyn MatchSession>, ConnectionError> {
        Ok(Box::new(self.connect_tcp(slot).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObservationPayload;
    use crate::transport::{LineReader, LineWriter};
    use arena_core::{EndReason, OpponentRef, TaskKind};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type TestSession = LineSession<LineReader<ReadHalf<DuplexStream>>, LineWriter<WriteHalf<DuplexStream>>>;
    type Peer = (LineReader<ReadHalf<DuplexStream>>, LineWriter<WriteHalf<DuplexStream>>);

    fn pair(io_timeout: Duration) -> (TestSession, Peer) {
        let (ours, theirs) = duplex(64 * 1024);
        let (r, w) = split(ours);
        let (pr, pw) = split(theirs);
        let session = LineSession::new("test#0", 0, LineReader::new(r), LineWriter::new(w), io_timeout);
        (session, (LineReader::new(pr), LineWriter::new(pw)))
    }

    fn observation(tick: u64, done: bool) -> Vec<u8> {
        serialize(&WireMessage::Observation {
            payload: ObservationPayload {
                features: vec![tick as f32],
                action_masks: Default::default(),
                reward: 0.5,
                done,
                end_reason: done.then_some(EndReason::Win),
                tick,
                info: Default::default(),
            },
        })
        .unwrap()
    }

    fn config() -> ResetConfig {
        ResetConfig::new(TaskKind::Combat, OpponentRef::Scripted("nh_baseline".into()))
    }

    #[tokio::test]
    async fn test_lockstep_episode() {
        let (mut session, (mut pr, mut pw)) = pair(Duration::from_secs(5));
        let sim = tokio::spawn(async move {
            let mut kinds = Vec::new();
            for tick in 0..3u64 {
                let msg = deserialize(&pr.read_record().await.unwrap().unwrap()).unwrap();
                kinds.push(msg.kind());
                pw.write_record(&observation(tick, tick == 2)).await.unwrap();
            }
            let msg = deserialize(&pr.read_record().await.unwrap().unwrap()).unwrap();
            kinds.push(msg.kind());
            kinds
        });

        assert_eq!(session.state(), SessionState::Ready);
        let obs = session.reset(&config()).await.unwrap();
        assert_eq!(obs.tick, 0);
        assert_eq!(session.state(), SessionState::Stepping);

        let t = session.step(&Action::new(vec![1])).await.unwrap();
        assert!(!t.done);
        let t = session.step(&Action::new(vec![1])).await.unwrap();
        assert!(t.is_terminal());
        assert_eq!(t.end_reason, Some(EndReason::Win));
        assert_eq!(session.state(), SessionState::Terminal);

        // No auto-reset
        let err = session.step(&Action::new(vec![1])).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Terminal);

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(sim.await.unwrap(), vec!["reset", "step", "step", "close"]);
    }

    #[tokio::test]
    async fn test_error_record_keeps_session() {
        let (mut session, (mut pr, mut pw)) = pair(Duration::from_secs(5));
        tokio::spawn(async move {
            pr.read_record().await.unwrap();
            pw.write_record(&observation(0, false)).await.unwrap();
            pr.read_record().await.unwrap();
            pw.write_record(br#"{"kind":"error","message":"illegal action"}"#)
                .await
                .unwrap();
            pr.read_record().await.unwrap();
            pw.write_record(&observation(1, false)).await.unwrap();
        });

        session.reset(&config()).await.unwrap();
        let err = session.step(&Action::new(vec![9])).await.unwrap_err();
        assert_eq!(err, SessionError::Protocol("illegal action".into()));
        assert_eq!(session.state(), SessionState::Stepping);
        assert!(session.step(&Action::new(vec![0])).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_record_fails_session() {
        let (mut session, (mut pr, mut pw)) = pair(Duration::from_secs(5));
        tokio::spawn(async move {
            pr.read_record().await.unwrap();
            pw.write_record(b"{not json").await.unwrap();
        });

        let err = session.reset(&config()).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Failed);

        // Failed sessions never retry
        let err = session.reset(&config()).await.unwrap_err();
        assert_eq!(err, SessionError::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_mid_step() {
        let (mut session, (mut pr, mut pw)) = pair(Duration::from_millis(200));
        let sim = tokio::spawn(async move {
            pr.read_record().await.unwrap();
            pw.write_record(&observation(0, false)).await.unwrap();
            // Read the step and never answer
            pr.read_record().await.unwrap();
            pr.read_record().await.ok();
        });

        session.reset(&config()).await.unwrap();
        let err = session.step(&Action::new(vec![2])).await.unwrap_err();
        assert_eq!(err, SessionError::Timeout);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.pending_action(), Some(&Action::new(vec![2])));
        assert_eq!(session.last_error(), Some(&SessionError::Timeout));

        session.close().await;
        drop(session);
        sim.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_disconnect() {
        let (mut session, (pr, pw)) = pair(Duration::from_secs(5));
        drop((pr, pw));
        let err = session.reset(&config()).await.unwrap_err();
        assert_eq!(err, SessionError::Disconnected);
        assert_eq!(session.state(), SessionState::Failed);
    }
}
