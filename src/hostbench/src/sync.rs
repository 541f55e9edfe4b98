//! Two-phase ready/done barrier between the sender and the receiver.
//!
//! The receiver hosts a [`SyncServer`]; the sender drives each phase through a
//! [`SyncClient`]:
//!
//! ```text
//! sender                      receiver
//! mark_sender_ready  ------>  wait_sender_ready
//!                             (start listeners, profiler)
//! is_receiver_ready  <------  mark_receiver_ready
//! (traffic)
//! mark_sender_done   ------>  wait_sender_done
//! ```
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use litemsg::utils::{call_sync, connect_once, recv_cmd_sync, send_cmd_sync};
use litemsg::{Node, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    MarkSenderReady,
    IsReceiverReady,
    MarkSenderDone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ack,
    Ready(bool),
    Violation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    SenderReady,
    ReceiverReady,
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("phase {phase}: sender done while {stage:?}, before the receiver confirmed ready")]
    DoneBeforeReady { phase: u64, stage: Stage },
    #[error("phase {phase}: receiver readiness queried before the sender was ready")]
    QueryBeforeReady { phase: u64 },
    #[error("phase {phase}: receiver ready while {stage:?}")]
    ReceiverOutOfTurn { phase: u64, stage: Stage },
}

/// Barrier state of one phase. Transitions return `Ok(None)` when the caller
/// must block until the other side moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierState {
    phase: u64,
    stage: Stage,
}

impl Default for BarrierState {
    fn default() -> Self {
        BarrierState {
            phase: 0,
            stage: Stage::Idle,
        }
    }
}

impl BarrierState {
    #[inline]
    pub fn phase(&self) -> u64 {
        self.phase
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Idempotent within a phase; waits for the receiver to close a finished one.
    pub fn sender_ready(&mut self) -> Option<u64> {
        match self.stage {
            Stage::Idle => {
                self.stage = Stage::SenderReady;
                Some(self.phase)
            }
            Stage::Done => None,
            _ => Some(self.phase),
        }
    }

    pub fn receiver_ready_query(&mut self) -> std::result::Result<Option<u64>, ProtocolViolation> {
        match self.stage {
            Stage::Idle => Err(ProtocolViolation::QueryBeforeReady { phase: self.phase }),
            Stage::SenderReady => Ok(None),
            Stage::ReceiverReady => {
                self.stage = Stage::Running;
                Ok(Some(self.phase))
            }
            Stage::Running | Stage::Done => Ok(Some(self.phase)),
        }
    }

    pub fn sender_done(&mut self) -> std::result::Result<u64, ProtocolViolation> {
        match self.stage {
            Stage::Running | Stage::Done => {
                self.stage = Stage::Done;
                Ok(self.phase)
            }
            stage => Err(ProtocolViolation::DoneBeforeReady {
                phase: self.phase,
                stage,
            }),
        }
    }

    #[inline]
    pub fn sender_is_ready(&self) -> bool {
        self.stage == Stage::SenderReady
    }

    pub fn receiver_ready(&mut self) -> std::result::Result<u64, ProtocolViolation> {
        match self.stage {
            Stage::SenderReady => {
                self.stage = Stage::ReceiverReady;
                Ok(self.phase)
            }
            stage => Err(ProtocolViolation::ReceiverOutOfTurn {
                phase: self.phase,
                stage,
            }),
        }
    }

    /// Close a finished phase and return its number.
    pub fn take_done(&mut self) -> Option<u64> {
        if self.stage != Stage::Done {
            return None;
        }
        let finished = self.phase;
        self.phase += 1;
        self.stage = Stage::Idle;
        Some(finished)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(#[from] litemsg::Error),
    #[error("receiver unreachable: {0}")]
    Unreachable(litemsg::Error),
    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
    #[error("receiver rejected request: {0}")]
    Remote(String),
    #[error("unexpected response {response:?} to {request:?}")]
    Unexpected { request: Request, response: Response },
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How often a blocked request checks whether its sender hung up.
const PEER_CHECK: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BarrierState>,
    cond: Condvar,
    connections: AtomicUsize,
}

/// A closed or broken connection; never consumes buffered requests.
fn peer_gone(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut buf = [0u8; 1];
    let gone = match stream.peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() != std::io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_err() || gone
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` until it stops asking to block, waking every waiter after.
    fn block_on<T, F>(&self, mut f: F) -> std::result::Result<T, ProtocolViolation>
    where
        F: FnMut(&mut BarrierState) -> std::result::Result<Option<T>, ProtocolViolation>,
    {
        let mut state = self.lock();
        loop {
            match f(&mut state)? {
                Some(v) => {
                    self.cond.notify_all();
                    return Ok(v);
                }
                None => {
                    state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Like [`Shared::block_on`] for a request of `peer`. `None` once the
    /// peer hung up while blocked; the state is left untouched then.
    fn block_on_peer<T, F>(&self, peer: &TcpStream, mut f: F) -> std::result::Result<Option<T>, ProtocolViolation>
    where
        F: FnMut(&mut BarrierState) -> std::result::Result<Option<T>, ProtocolViolation>,
    {
        let mut state = self.lock();
        loop {
            if let Some(v) = f(&mut state)? {
                self.cond.notify_all();
                return Ok(Some(v));
            }
            if peer_gone(peer) {
                return Ok(None);
            }
            state = match self.cond.wait_timeout(state, PEER_CHECK) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Answer `req`, or `None` if `peer` left while it was blocked.
    fn handle(&self, req: &Request, peer: &TcpStream) -> Option<Response> {
        let result = match req {
            Request::Ping => return Some(Response::Pong),
            Request::MarkSenderReady => self
                .block_on_peer(peer, |s| Ok(s.sender_ready()))
                .map(|v| v.map(|_| Response::Ack)),
            Request::IsReceiverReady => self
                .block_on_peer(peer, |s| s.receiver_ready_query())
                .map(|v| v.map(|_| Response::Ready(true))),
            Request::MarkSenderDone => self
                .block_on_peer(peer, |s| s.sender_done().map(Some))
                .map(|v| v.map(|_| Response::Ack)),
        };
        match result {
            Ok(resp) => resp,
            Err(v) => {
                log::warn!("{}", v);
                Some(Response::Violation(v.to_string()))
            }
        }
    }
}

fn serve(shared: Arc<Shared>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_owned());
    log::debug!("sync connection from {}", peer);
    shared.connections.fetch_add(1, Ordering::SeqCst);
    loop {
        let req: Request = match recv_cmd_sync(&mut stream) {
            Ok(req) => req,
            Err(litemsg::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                log::warn!("sync connection from {}: {}", peer, e);
                break;
            }
        };
        log::trace!("{} -> {:?}", peer, req);
        let resp = match shared.handle(&req, &stream) {
            Some(resp) => resp,
            None => {
                log::warn!("{} hung up during {:?}", peer, req);
                break;
            }
        };
        if let Err(e) = send_cmd_sync(&mut stream, &resp) {
            log::warn!("failed to answer {}: {}", peer, e);
            break;
        }
    }
    shared.connections.fetch_sub(1, Ordering::SeqCst);
    log::debug!("sync connection from {} closed", peer);
}

/// Barrier endpoint hosted by the receiver.
pub struct SyncServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Bind and start accepting in the background; one thread per connection.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(litemsg::Error::from)?;
        let local_addr = listener.local_addr().map_err(litemsg::Error::from)?;
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let shared = Arc::clone(&accept_shared);
                        std::thread::spawn(move || serve(shared, stream));
                    }
                    Err(e) => log::warn!("sync accept failed: {}", e),
                }
            }
        });

        log::info!("sync server listening on {}", local_addr);
        Ok(SyncServer { local_addr, shared })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn barrier(&self) -> ReceiverBarrier {
        ReceiverBarrier {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> BarrierState {
        *self.shared.lock()
    }

    /// Sender connections currently being served.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

/// The receiver's local side of the barrier.
#[derive(Clone)]
pub struct ReceiverBarrier {
    shared: Arc<Shared>,
}

impl ReceiverBarrier {
    /// Block until the sender marked the current phase ready.
    pub fn wait_sender_ready(&self) -> u64 {
        let waited = self
            .shared
            .block_on(|s| Ok(if s.sender_is_ready() { Some(s.phase()) } else { None }));
        // the closure never fails
        waited.unwrap_or_default()
    }

    pub fn mark_receiver_ready(&self) -> Result<u64> {
        Ok(self.shared.block_on(|s| s.receiver_ready().map(Some))?)
    }

    /// Block until the sender is done, then move on to the next phase.
    pub fn wait_sender_done(&self) -> u64 {
        self.shared.block_on(|s| Ok(s.take_done())).unwrap_or_default()
    }
}

/// The sender's view of the barrier.
pub trait SenderBarrier {
    fn mark_sender_ready(&mut self) -> Result<()>;
    /// Blocks until the receiver confirmed; `true` afterwards.
    fn is_receiver_ready(&mut self) -> Result<bool>;
    fn mark_sender_done(&mut self) -> Result<()>;
}

impl<T: SenderBarrier + ?Sized> SenderBarrier for &mut T {
    fn mark_sender_ready(&mut self) -> Result<()> {
        (**self).mark_sender_ready()
    }
    fn is_receiver_ready(&mut self) -> Result<bool> {
        (**self).is_receiver_ready()
    }
    fn mark_sender_done(&mut self) -> Result<()> {
        (**self).mark_sender_done()
    }
}

/// TCP client of a [`SyncServer`].
pub struct SyncClient {
    stream: TcpStream,
    phase: u64,
    ready: bool,
}

fn ping(node: &Node, policy: &RetryPolicy) -> Result<TcpStream> {
    let mut stream = connect_once(node, policy.connect_timeout())?;
    match call_sync(&mut stream, &Request::Ping)? {
        Response::Pong => Ok(stream),
        response => Err(SyncError::Unexpected {
            request: Request::Ping,
            response,
        }),
    }
}

impl SyncClient {
    /// Probe `node` until it answers a ping; unbounded unless the policy
    /// sets a ceiling.
    pub fn connect(node: &Node, policy: &RetryPolicy) -> Result<Self> {
        let stream = policy
            .run(&format!("reach receiver {}", node), |_| ping(node, policy))
            .map_err(|e| match e {
                e @ litemsg::Error::Exhausted { .. } => SyncError::Unreachable(e),
                e => SyncError::Transport(e),
            })?;
        log::info!("connected to receiver {}", node);
        Ok(SyncClient {
            stream,
            phase: 0,
            ready: false,
        })
    }

    #[inline]
    pub fn phase(&self) -> u64 {
        self.phase
    }

    fn call(&mut self, request: Request) -> Result<Response> {
        match call_sync(&mut self.stream, &request)? {
            Response::Violation(msg) => Err(SyncError::Remote(msg)),
            response => Ok(response),
        }
    }
}

impl SenderBarrier for SyncClient {
    fn mark_sender_ready(&mut self) -> Result<()> {
        match self.call(Request::MarkSenderReady)? {
            Response::Ack => {
                self.ready = true;
                Ok(())
            }
            response => Err(SyncError::Unexpected {
                request: Request::MarkSenderReady,
                response,
            }),
        }
    }

    fn is_receiver_ready(&mut self) -> Result<bool> {
        if !self.ready {
            return Err(ProtocolViolation::QueryBeforeReady { phase: self.phase }.into());
        }
        match self.call(Request::IsReceiverReady)? {
            Response::Ready(ready) => Ok(ready),
            response => Err(SyncError::Unexpected {
                request: Request::IsReceiverReady,
                response,
            }),
        }
    }

    fn mark_sender_done(&mut self) -> Result<()> {
        if !self.ready {
            return Err(ProtocolViolation::DoneBeforeReady {
                phase: self.phase,
                stage: Stage::Idle,
            }
            .into());
        }
        match self.call(Request::MarkSenderDone)? {
            Response::Ack => {
                self.ready = false;
                self.phase += 1;
                Ok(())
            }
            response => Err(SyncError::Unexpected {
                request: Request::MarkSenderDone,
                response,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_phase_in_order() {
        let mut s = BarrierState::default();
        assert_eq!(s.sender_ready(), Some(0));
        assert_eq!(s.sender_ready(), Some(0));
        assert_eq!(s.receiver_ready_query(), Ok(None));
        assert_eq!(s.receiver_ready(), Ok(0));
        assert_eq!(s.receiver_ready_query(), Ok(Some(0)));
        assert_eq!(s.stage(), Stage::Running);
        // repeated queries keep answering
        assert_eq!(s.receiver_ready_query(), Ok(Some(0)));
        assert_eq!(s.sender_done(), Ok(0));
        // a new phase waits for the receiver to close this one
        assert_eq!(s.sender_ready(), None);
        assert_eq!(s.take_done(), Some(0));
        assert_eq!(s.phase(), 1);
        assert_eq!(s.stage(), Stage::Idle);
        assert_eq!(s.take_done(), None);
    }

    #[test]
    fn violations() {
        let mut s = BarrierState::default();
        assert_eq!(
            s.sender_done(),
            Err(ProtocolViolation::DoneBeforeReady {
                phase: 0,
                stage: Stage::Idle
            })
        );
        assert_eq!(
            s.receiver_ready_query(),
            Err(ProtocolViolation::QueryBeforeReady { phase: 0 })
        );
        assert!(s.receiver_ready().is_err());

        s.sender_ready();
        assert_eq!(
            s.sender_done(),
            Err(ProtocolViolation::DoneBeforeReady {
                phase: 0,
                stage: Stage::SenderReady
            })
        );
        s.receiver_ready().unwrap();
        // done needs the sender to have seen the receiver ready
        assert!(s.sender_done().is_err());
    }

    #[test]
    fn client_rejects_done_before_ready_locally() {
        logging::init_test_log();
        let server = SyncServer::bind("127.0.0.1:0").unwrap();
        let node = Node::new("127.0.0.1", server.local_addr().port());
        let mut client = SyncClient::connect(&node, &RetryPolicy::new(10, 100, Some(5))).unwrap();
        assert!(matches!(
            client.mark_sender_done(),
            Err(SyncError::Violation(ProtocolViolation::DoneBeforeReady { .. }))
        ));
        assert!(matches!(
            client.is_receiver_ready(),
            Err(SyncError::Violation(ProtocolViolation::QueryBeforeReady { .. }))
        ));
        // nothing reached the server
        assert_eq!(server.state(), BarrierState::default());
    }

    #[test]
    fn server_reports_violations() {
        let server = SyncServer::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        let resp: Response = call_sync(&mut stream, &Request::MarkSenderDone).unwrap();
        assert!(matches!(resp, Response::Violation(_)));
        let resp: Response = call_sync(&mut stream, &Request::Ping).unwrap();
        assert_eq!(resp, Response::Pong);
    }

    #[test]
    fn unreachable_with_ceiling() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let node = Node::new("127.0.0.1", port);
        match SyncClient::connect(&node, &RetryPolicy::new(1, 50, Some(2))) {
            Err(SyncError::Unreachable(litemsg::Error::Exhausted { attempts, .. })) => assert_eq!(attempts, 2),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[test]
    fn blocked_request_ends_when_sender_hangs_up() {
        logging::init_test_log();
        let server = SyncServer::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        let resp: Response = call_sync(&mut stream, &Request::MarkSenderReady).unwrap();
        assert_eq!(resp, Response::Ack);
        assert_eq!(server.connections(), 1);

        // nobody marks the receiver ready, so this query blocks
        send_cmd_sync(&mut stream, &Request::IsReceiverReady).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connections(), 1);
        drop(stream);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while server.connections() > 0 {
            assert!(std::time::Instant::now() < deadline, "serve thread still blocked");
            std::thread::sleep(Duration::from_millis(50));
        }
        // the receiver can still take the phase over
        assert_eq!(server.state().stage(), Stage::SenderReady);
        assert_eq!(server.barrier().mark_receiver_ready().unwrap(), 0);
    }
}
