use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{FrameKind, Leg, LegWriter, Transport};

/// Direction of frame flow within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client -> upstream
    ClientToUpstream,
    /// Upstream -> client
    UpstreamToClient,
}

impl Direction {
    pub fn source(self) -> Leg {
        match self {
            Direction::ClientToUpstream => Leg::Client,
            Direction::UpstreamToClient => Leg::Upstream,
        }
    }

    pub fn destination(self) -> Leg {
        match self {
            Direction::ClientToUpstream => Leg::Upstream,
            Direction::UpstreamToClient => Leg::Client,
        }
    }
}

/// Why a forwarding loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEnd {
    /// The source delivered a close frame (forwarded before stopping).
    CloseReceived,
    /// The source stream ended without a close frame.
    SourceEnded,
    ReadError(String),
    WriteError(String),
    /// Neither direction relayed a frame within the configured idle timeout.
    IdleTimeout,
    /// The session told the loop to stop because the other loop ended first.
    Cancelled,
    /// The loop's task panicked or was aborted.
    Aborted(String),
}

impl fmt::Display for LoopEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopEnd::CloseReceived => f.write_str("close frame received"),
            LoopEnd::SourceEnded => f.write_str("source ended"),
            LoopEnd::ReadError(err) => write!(f, "read error: {err}"),
            LoopEnd::WriteError(err) => write!(f, "write error: {err}"),
            LoopEnd::IdleTimeout => f.write_str("idle timeout"),
            LoopEnd::Cancelled => f.write_str("cancelled"),
            LoopEnd::Aborted(err) => write!(f, "aborted: {err}"),
        }
    }
}

/// Frame and byte counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub frames: u64,
    pub bytes: u64,
}

impl DirectionStats {
    fn record(&mut self, len: usize) {
        self.frames += 1;
        self.bytes += len as u64;
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    /// The loop that stopped first and so ended the session.
    pub ended_by: Direction,
    pub reason: LoopEnd,
    /// How the other loop stopped once the session tore it down.
    pub follower: LoopEnd,
    pub client_to_upstream: DirectionStats,
    pub upstream_to_client: DirectionStats,
    pub duration: Duration,
}

/// What a forwarding loop hands back to the session when it stops.
struct LoopExit {
    end: LoopEnd,
    stats: DirectionStats,
}

impl LoopExit {
    fn aborted(reason: String) -> Self {
        Self {
            end: LoopEnd::Aborted(reason),
            stats: DirectionStats::default(),
        }
    }
}

/// Write half of a leg, shared between the loop that sends on it and the
/// session that closes it. The session keeps its own handle, so the leg can
/// still be closed if the loop task panics.
type SharedWriter<T> = Arc<Mutex<LegWriter<SplitSink<T, Message>>>>;

/// Time of the last frame relayed in either direction.
#[derive(Clone)]
struct Activity {
    origin: tokio::time::Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> tokio::time::Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Pairs one client connection with one upstream connection and relays
/// frames both ways until either side ends.
///
/// The session owns both legs. Forwarding loops only send; closing is done
/// by the session, once per leg, after both loops have stopped.
pub struct RelaySession<C: Transport, U: Transport> {
    id: Uuid,
    client: C,
    upstream: U,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<C: Transport, U: Transport> RelaySession<C, U> {
    pub fn new(id: Uuid, client: C, upstream: U) -> Self {
        Self {
            id,
            client,
            upstream,
            idle_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// End the session once no frame has been relayed in either direction
    /// for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Use `token` for cancellation so an outer owner can end the session.
    /// The session cancels the token itself when it ends, so pass a child
    /// token if the owner's token is shared.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay until either loop stops, then tear both legs down.
    ///
    /// Resolves once both loops have exited and both legs were closed. If
    /// this future is dropped early the loop tasks are aborted with it.
    pub async fn run(self) -> FinishedSession<C, U> {
        let RelaySession {
            id,
            client,
            upstream,
            idle_timeout,
            cancel,
        } = self;
        let started = Instant::now();
        let activity = Activity::new();

        let (client_sink, client_stream): (SplitSink<C, Message>, SplitStream<C>) = client.split();
        let (upstream_sink, upstream_stream): (SplitSink<U, Message>, SplitStream<U>) =
            upstream.split();

        let client_writer: SharedWriter<C> =
            Arc::new(Mutex::new(LegWriter::new(Leg::Client, client_sink)));
        let upstream_writer: SharedWriter<U> =
            Arc::new(Mutex::new(LegWriter::new(Leg::Upstream, upstream_sink)));

        let mut loops = JoinSet::new();
        let up_task = loops
            .spawn(forward(
                client_stream,
                Arc::clone(&upstream_writer),
                Direction::ClientToUpstream,
                idle_timeout,
                activity.clone(),
                cancel.clone(),
                id,
            ))
            .id();
        loops.spawn(forward(
            upstream_stream,
            Arc::clone(&client_writer),
            Direction::UpstreamToClient,
            idle_timeout,
            activity,
            cancel.clone(),
            id,
        ));

        // The first loop to stop ends the session; the other is forced out.
        let mut ended_by = None;
        let mut up_exit = None;
        let mut down_exit = None;
        while let Some(result) = loops.join_next_with_id().await {
            let (task, exit) = match result {
                Ok((task, exit)) => (task, exit),
                Err(err) => (err.id(), joined_err(err)),
            };
            let direction = if task == up_task {
                Direction::ClientToUpstream
            } else {
                Direction::UpstreamToClient
            };
            if ended_by.is_none() {
                ended_by = Some(direction);
                cancel.cancel();
            }
            match direction {
                Direction::ClientToUpstream => up_exit = Some(exit),
                Direction::UpstreamToClient => down_exit = Some(exit),
            }
        }

        let ended_by = ended_by.unwrap_or(Direction::ClientToUpstream);
        let missing = || LoopExit::aborted("loop did not report".to_string());
        let up_exit = up_exit.unwrap_or_else(missing);
        let down_exit = down_exit.unwrap_or_else(missing);

        let (reason, follower) = match ended_by {
            Direction::ClientToUpstream => (up_exit.end.clone(), down_exit.end.clone()),
            Direction::UpstreamToClient => (down_exit.end.clone(), up_exit.end.clone()),
        };

        tracing::debug!(
            session_id = %id,
            ?ended_by,
            %reason,
            %follower,
            "relay loops stopped"
        );

        let mut finished = FinishedSession {
            report: SessionReport {
                session_id: id,
                ended_by,
                reason,
                follower,
                client_to_upstream: up_exit.stats,
                upstream_to_client: down_exit.stats,
                duration: Duration::ZERO,
            },
            client_writer,
            upstream_writer,
        };
        finished.close().await;
        finished.report.duration = started.elapsed();
        finished
    }
}

/// A session whose loops have stopped. Holds the legs' write halves so the
/// owner can close again without reaching the transport twice.
pub struct FinishedSession<C: Transport, U: Transport> {
    report: SessionReport,
    client_writer: SharedWriter<C>,
    upstream_writer: SharedWriter<U>,
}

impl<C: Transport, U: Transport> FinishedSession<C, U> {
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn into_report(self) -> SessionReport {
        self.report
    }

    /// Close both legs. Safe to call any number of times; each leg is closed
    /// at most once.
    pub async fn close(&mut self) {
        let id = self.report.session_id;
        let client = close_leg(&self.client_writer, id);
        let upstream = close_leg(&self.upstream_writer, id);
        tokio::join!(client, upstream);
    }
}

async fn close_leg<W>(writer: &Mutex<LegWriter<W>>, session_id: Uuid)
where
    W: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(err) = writer.close().await {
        tracing::debug!(%session_id, leg = %writer.leg(), %err, "error closing leg");
    }
}

fn joined_err(err: JoinError) -> LoopExit {
    tracing::error!(%err, "relay loop task failed");
    LoopExit::aborted(err.to_string())
}

/// Forward frames from `source` to `writer` until a terminal condition.
///
/// Frames are sent in the order they are received, unchanged. The loop stops
/// on the first read error, write error, close frame, end of stream, idle
/// timeout, or cancellation, and never closes either leg itself.
async fn forward<R, W>(
    mut source: R,
    writer: Arc<Mutex<LegWriter<W>>>,
    direction: Direction,
    idle_timeout: Option<Duration>,
    activity: Activity,
    cancel: CancellationToken,
    session_id: Uuid,
) -> LoopExit
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let mut stats = DirectionStats::default();

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoopEnd::Cancelled,
            next = receive(&mut source, idle_timeout, &activity) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => break LoopEnd::ReadError(err.to_string()),
            Ok(None) => break LoopEnd::SourceEnded,
            Err(Idle) => break LoopEnd::IdleTimeout,
        };

        let kind = FrameKind::of(&msg);
        let len = msg.len();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break LoopEnd::Cancelled,
            sent = async { writer.lock().await.send(msg).await } => sent,
        };
        if let Err(err) = sent {
            break LoopEnd::WriteError(err.to_string());
        }
        stats.record(len);
        activity.touch();

        tracing::trace!(%session_id, ?direction, ?kind, len, "frame relayed");

        if kind == FrameKind::Close {
            break LoopEnd::CloseReceived;
        }
    };

    tracing::debug!(%session_id, ?direction, %end, frames = stats.frames, "relay loop ended");

    LoopExit { end, stats }
}

/// The session went idle while waiting for a frame.
struct Idle;

/// Wait for the next frame. With an idle limit, give up only once the whole
/// session, not just this direction, has been silent for that long.
async fn receive<R>(
    source: &mut R,
    idle_timeout: Option<Duration>,
    activity: &Activity,
) -> Result<Option<Result<Message, WsError>>, Idle>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let Some(limit) = idle_timeout else {
        return Ok(source.next().await);
    };
    loop {
        let deadline = activity.last() + limit;
        match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(next) => return Ok(next),
            // The other direction may have relayed a frame meanwhile.
            Err(_) if activity.last() + limit > tokio::time::Instant::now() => continue,
            Err(_) => return Err(Idle),
        }
    }
}

/// Spawn `session` onto the runtime, returning a handle that resolves with
/// its report once both legs are closed.
pub fn spawn<C: Transport, U: Transport>(session: RelaySession<C, U>) -> JoinHandle<SessionReport> {
    tokio::spawn(async move { session.run().await.into_report() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;

    /// In-memory leg. The test pushes inbound items through `inbound` and
    /// reads what the relay sent from `outbound`.
    struct MockLeg {
        inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
        outbound: mpsc::UnboundedSender<Message>,
        closes: Arc<AtomicUsize>,
    }

    struct MockPeer {
        inbound: mpsc::UnboundedSender<Result<Message, WsError>>,
        outbound: mpsc::UnboundedReceiver<Message>,
        closes: Arc<AtomicUsize>,
    }

    fn mock_leg() -> (MockLeg, MockPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        (
            MockLeg {
                inbound: in_rx,
                outbound: out_tx,
                closes: Arc::clone(&closes),
            },
            MockPeer {
                inbound: in_tx,
                outbound: out_rx,
                closes,
            },
        )
    }

    impl Stream for MockLeg {
        type Item = Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_recv(cx)
        }
    }

    impl futures_util::Sink<Message> for MockLeg {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            if item == Message::text("panic") {
                panic!("mock sink failure");
            }
            self.outbound
                .send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    fn session(client: MockLeg, upstream: MockLeg) -> RelaySession<MockLeg, MockLeg> {
        RelaySession::new(Uuid::new_v4(), client, upstream)
    }

    async fn recv(peer: &mut MockPeer) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(2), peer.outbound.recv())
            .await
            .expect("timed out waiting for relayed frame")
    }

    #[tokio::test]
    async fn relays_both_directions_in_order() {
        let (client, mut client_peer) = mock_leg();
        let (upstream, mut upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));

        let outbound = [
            Message::text("one"),
            Message::binary(vec![0u8, 1, 2, 255]),
            Message::text("three"),
        ];
        for msg in outbound.iter().cloned() {
            client_peer.inbound.send(Ok(msg)).unwrap();
        }
        for expected in &outbound {
            assert_eq!(recv(&mut upstream_peer).await.as_ref(), Some(expected));
        }

        upstream_peer.inbound.send(Ok(Message::text("reply"))).unwrap();
        assert_eq!(recv(&mut client_peer).await, Some(Message::text("reply")));

        drop(client_peer.inbound);
        let report = handle.await.unwrap();

        assert_eq!(report.ended_by, Direction::ClientToUpstream);
        assert_eq!(report.reason, LoopEnd::SourceEnded);
        assert_eq!(report.follower, LoopEnd::Cancelled);
        assert_eq!(report.client_to_upstream.frames, 3);
        assert_eq!(report.client_to_upstream.bytes, 3 + 4 + 5);
        assert_eq!(report.upstream_to_client.frames, 1);
    }

    #[tokio::test]
    async fn upstream_close_is_forwarded_and_closes_both_legs() {
        let (client, mut client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));

        upstream_peer.inbound.send(Ok(Message::Close(None))).unwrap();

        assert_eq!(recv(&mut client_peer).await, Some(Message::Close(None)));
        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not terminate")
            .unwrap();

        assert_eq!(report.ended_by, Direction::UpstreamToClient);
        assert_eq!(report.reason, LoopEnd::CloseReceived);
        assert_eq!(client_peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream_peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_reset_before_any_frame_terminates_cleanly() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        client_peer.inbound.send(Err(WsError::Io(reset))).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.ended_by, Direction::ClientToUpstream);
        assert!(matches!(report.reason, LoopEnd::ReadError(_)));
        assert_eq!(report.client_to_upstream, DirectionStats::default());
        assert_eq!(report.upstream_to_client, DirectionStats::default());
        assert_eq!(client_peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream_peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_error_ends_session() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));

        // The upstream stops accepting frames.
        drop(upstream_peer.outbound);
        client_peer.inbound.send(Ok(Message::text("lost"))).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.ended_by, Direction::ClientToUpstream);
        assert!(matches!(report.reason, LoopEnd::WriteError(_)));
        assert_eq!(report.client_to_upstream.frames, 0);
    }

    #[tokio::test]
    async fn repeated_close_does_not_reach_transport_again() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        drop(upstream_peer.inbound);
        let mut finished = session(client, upstream).run().await;
        assert_eq!(finished.report().reason, LoopEnd::SourceEnded);

        finished.close().await;
        finished.close().await;

        assert_eq!(client_peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream_peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_timeout_ends_silent_session() {
        let (client, _client_peer) = mock_leg();
        let (upstream, _upstream_peer) = mock_leg();
        let session =
            session(client, upstream).with_idle_timeout(Some(Duration::from_millis(50)));

        let finished = tokio::time::timeout(Duration::from_secs(2), session.run())
            .await
            .expect("idle session was not reaped");
        assert_eq!(finished.report().reason, LoopEnd::IdleTimeout);
    }

    #[tokio::test]
    async fn idle_timeout_spares_one_way_stream() {
        let (client, mut client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(
            session(client, upstream).with_idle_timeout(Some(Duration::from_millis(200))),
        );

        // The client never speaks; the upstream streams for three idle periods.
        for i in 0..12 {
            upstream_peer
                .inbound
                .send(Ok(Message::text(format!("tick {i}"))))
                .unwrap();
            assert_eq!(recv(&mut client_peer).await, Some(Message::text(format!("tick {i}"))));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!handle.is_finished(), "live session was reaped as idle");

        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not go idle")
            .unwrap();
        assert_eq!(report.reason, LoopEnd::IdleTimeout);
        assert_eq!(report.upstream_to_client.frames, 12);
        assert_eq!(report.client_to_upstream.frames, 0);
    }

    #[tokio::test]
    async fn panicking_loop_still_closes_both_legs() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));

        client_peer.inbound.send(Ok(Message::text("panic"))).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not terminate")
            .unwrap();
        assert_eq!(report.ended_by, Direction::ClientToUpstream);
        assert!(matches!(report.reason, LoopEnd::Aborted(_)));
        assert_eq!(report.follower, LoopEnd::Cancelled);
        assert_eq!(client_peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream_peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn aborting_the_session_stops_its_loops() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let handle = spawn(session(client, upstream));
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both read halves were dropped with the loop tasks.
        assert!(client_peer.inbound.is_closed());
        assert!(upstream_peer.inbound.is_closed());
    }

    #[tokio::test]
    async fn external_cancellation_tears_session_down() {
        let (client, client_peer) = mock_leg();
        let (upstream, upstream_peer) = mock_leg();
        let token = CancellationToken::new();
        let handle = spawn(session(client, upstream).with_cancellation(token.clone()));

        token.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.reason, LoopEnd::Cancelled);
        assert_eq!(report.follower, LoopEnd::Cancelled);
        assert_eq!(client_peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(upstream_peer.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn directions_map_to_legs() {
        assert_eq!(Direction::ClientToUpstream.source(), Leg::Client);
        assert_eq!(Direction::ClientToUpstream.destination(), Leg::Upstream);
        assert_eq!(Direction::UpstreamToClient.source(), Leg::Upstream);
        assert_eq!(Direction::UpstreamToClient.destination(), Leg::Client);
    }
}
