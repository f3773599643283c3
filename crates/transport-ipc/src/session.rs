use std::time::Duration;

use harness_proto::{decode_token, encode_token, Command, ProtocolError, Role, SessionPhase, TOKEN_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{TransportError, TransportResult};

/// Any byte stream a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> SessionStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

const IN_MEMORY_BUFFER: usize = 64;

/// One controller–worker pairing for the lifetime of a connected stream.
///
/// The session owns the stream exclusively and validates every command
/// against the shared phase machine. Any failure (timeout, protocol
/// violation, io error) poisons it: later calls return
/// [`TransportError::Closed`]. The stream is released on drop.
pub struct Session {
    role: Role,
    peer: String,
    phase: SessionPhase,
    stream: Option<Box<dyn SessionStream>>,
    sent: u64,
    received: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("open", &self.stream.is_some())
            .field("sent", &self.sent)
            .field("received", &self.received)
            .finish()
    }
}

impl Session {
    pub fn new<S>(role: Role, peer: impl Into<String>, stream: S) -> Self
    where
        S: SessionStream + 'static,
    {
        Self {
            role,
            peer: peer.into(),
            phase: SessionPhase::Idle,
            stream: Some(Box::new(stream)),
            sent: 0,
            received: 0,
        }
    }

    /// Connected `(controller, worker)` pair over an in-process pipe.
    pub fn in_memory_pair() -> (Session, Session) {
        let (controller, worker) = tokio::io::duplex(IN_MEMORY_BUFFER);
        (
            Session::new(Role::Controller, "in-memory worker", controller),
            Session::new(Role::Worker, "in-memory controller", worker),
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Number of commands written and read so far.
    pub fn counters(&self) -> (u64, u64) {
        (self.sent, self.received)
    }

    pub async fn send(&mut self, command: Command) -> TransportResult<()> {
        if self.stream.is_none() {
            return Err(TransportError::Closed);
        }
        let next = match self.phase.advance(self.role, command) {
            Ok(next) => next,
            Err(err) => return Err(self.fail(err.into())),
        };
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let token = encode_token(command);
        let written = async {
            stream.write_all(&token).await?;
            stream.flush().await
        }
        .await;
        if let Err(err) = written {
            return Err(self.fail(err.into()));
        }
        self.sent += 1;
        self.phase = next;
        trace!(role = %self.role, %command, phase = %self.phase, "sent command");
        Ok(())
    }

    /// Blocks until a whole token arrives. `Ok(None)` means the peer closed
    /// the stream cleanly on a token boundary.
    pub async fn receive(&mut self) -> TransportResult<Option<Command>> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let token = match read_token(&mut **stream).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(role = %self.role, peer = %self.peer, phase = %self.phase, "peer closed session");
                self.teardown();
                return Ok(None);
            }
            Err(err) => return Err(self.fail(err)),
        };
        let command = match decode_token(&token) {
            Ok(command) => command,
            Err(err) => return Err(self.fail(err.into())),
        };
        match self.phase.advance(self.role.peer(), command) {
            Ok(next) => {
                self.received += 1;
                self.phase = next;
                trace!(role = %self.role, %command, phase = %self.phase, "received command");
                Ok(Some(command))
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// [`Session::receive`] bounded by `timeout`. Expiry tears the session
    /// down; nothing is sent to the peer.
    pub async fn receive_within(&mut self, timeout: Duration) -> TransportResult<Option<Command>> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(self.fail(TransportError::Timeout(timeout))),
        }
    }

    /// Shuts the write half down and releases the stream.
    pub async fn close(mut self) -> TransportResult<()> {
        let result = match self.stream.as_mut() {
            Some(stream) => stream.shutdown().await.map_err(TransportError::from),
            None => Ok(()),
        };
        self.teardown();
        match result {
            Err(err) if err.is_disconnect() => Ok(()),
            other => other,
        }
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        debug!(role = %self.role, peer = %self.peer, phase = %self.phase, error = %err, "session torn down");
        self.teardown();
        err
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.phase = SessionPhase::Terminated;
    }
}

async fn read_token(
    stream: &mut (dyn SessionStream + '_),
) -> TransportResult<Option<[u8; TOKEN_LEN]>> {
    let mut buf = [0u8; TOKEN_LEN];
    let mut filled = 0;
    while filled < TOKEN_LEN {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated { received: filled }.into());
        }
        filled += n;
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_runs_one_cycle() {
        let (mut controller, mut worker) = Session::in_memory_pair();

        worker.send(Command::Ready).await.expect("ready");
        assert_eq!(controller.receive().await.expect("recv"), Some(Command::Ready));
        controller.send(Command::Go).await.expect("go");
        assert_eq!(worker.receive().await.expect("recv"), Some(Command::Go));
        worker.send(Command::Done).await.expect("done");
        assert_eq!(controller.receive().await.expect("recv"), Some(Command::Done));

        assert_eq!(controller.phase(), SessionPhase::AwaitingAck);
        assert_eq!(worker.phase(), SessionPhase::AwaitingAck);
        assert_eq!(controller.counters(), (1, 2));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (controller, mut worker) = Session::in_memory_pair();
        controller.close().await.expect("close");
        assert_eq!(worker.receive().await.expect("recv"), None);
        assert!(!worker.is_open());
        assert!(matches!(
            worker.send(Command::Ready).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn closing_mid_token_is_a_protocol_error() {
        let (mut raw, stream) = tokio::io::duplex(16);
        let mut controller = Session::new(Role::Controller, "raw", stream);
        raw.write_all(&[1, 0]).await.expect("partial write");
        drop(raw);
        let err = controller.receive().await.expect_err("truncated");
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::Truncated { received: 2 })
        ));
        assert_eq!(controller.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn split_token_is_reassembled() {
        let (mut raw, stream) = tokio::io::duplex(16);
        let mut controller = Session::new(Role::Controller, "raw", stream);
        let token = encode_token(Command::Ready);
        let writer = tokio::spawn(async move {
            raw.write_all(&token[..1]).await.expect("first byte");
            tokio::task::yield_now().await;
            raw.write_all(&token[1..]).await.expect("rest");
            raw
        });
        assert_eq!(controller.receive().await.expect("recv"), Some(Command::Ready));
        drop(writer.await.expect("writer"));
    }

    #[tokio::test]
    async fn unknown_token_poisons_session() {
        let (mut raw, stream) = tokio::io::duplex(16);
        let mut controller = Session::new(Role::Controller, "raw", stream);
        raw.write_all(&[9, 0, 0, 0]).await.expect("write");
        let err = controller.receive().await.expect_err("unknown");
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::UnknownToken(9))
        ));
        assert!(matches!(
            controller.receive().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn out_of_sequence_receive_is_rejected() {
        let (mut raw, stream) = tokio::io::duplex(16);
        let mut controller = Session::new(Role::Controller, "raw", stream);
        raw.write_all(&encode_token(Command::Done)).await.expect("write");
        let err = controller.receive().await.expect_err("done before ready");
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::OutOfSequence {
                phase: SessionPhase::Idle,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn local_send_is_checked_before_writing() {
        let (mut controller, _worker) = Session::in_memory_pair();
        let err = controller.send(Command::Go).await.expect_err("go before ready");
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::OutOfSequence { .. })
        ));
        assert_eq!(controller.counters(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_within_times_out() {
        let (mut controller, _worker) = Session::in_memory_pair();
        let err = controller
            .receive_within(Duration::from_millis(5_000))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(5_000)));
        assert!(!controller.is_open());
    }
}
