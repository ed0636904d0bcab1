// src/protocols/cip/session.rs - EtherNet/IP session over TCP
use super::epath;
use super::frame::{Command, Encapsulation, EncapsulationCodec};
use super::message::{self, chunk_requests, Reply, ResponseKind, MULTI_SERVICE_THRESHOLD};
use super::status::{EMBEDDED_SERVICE_ERROR, UNKNOWN_REPLY};
use crate::config::ConnectionConfig;
use crate::error::{PlcError, Result};
use crate::protocols::{Controller, ControllerIdentity, SessionState};
use crate::tag::Tag;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 44818;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum Response {
    Registered(u32),
    Reply(Reply),
}

type PendingMap = Arc<Mutex<HashMap<ResponseKind, oneshot::Sender<Result<Response>>>>>;

struct Link {
    writer: FramedWrite<OwnedWriteHalf, EncapsulationCodec>,
    router: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Explicit-messaging session with a Logix-style controller
///
/// One background task reads encapsulation packets and completes the waiting
/// request by reply kind. At most one request per kind may be outstanding;
/// the [`Scheduler`](crate::scheduler::Scheduler) guarantees a single one
/// overall.
pub struct CipSession {
    port: u16,
    request_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
    pending: PendingMap,
    link: tokio::sync::Mutex<Option<Link>>,
    handle: AtomicU32,
    route: Mutex<Vec<u8>>,
    identity: Mutex<Option<ControllerIdentity>>,
}

impl Default for CipSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CipSession {
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            link: tokio::sync::Mutex::new(None),
            handle: AtomicU32::new(0),
            route: Mutex::new(epath::backplane(0)),
            identity: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new()
            .with_port(config.port)
            .with_request_timeout(config.timeout())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Session handle assigned by the controller, 0 while not registered
    pub fn session_handle(&self) -> u32 {
        self.handle.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> Result<()> {
        match *lock(&self.state) {
            SessionState::Connected => Ok(()),
            other => Err(PlcError::Connection(format!("Session is {}", other))),
        }
    }

    async fn send(&self, packet: Encapsulation) -> Result<()> {
        let mut link = self.link.lock().await;
        let link = link
            .as_mut()
            .ok_or_else(|| PlcError::Connection("Session is not open".into()))?;
        link.writer.send(packet).await
    }

    /// Send a packet and wait for the reply of the given kind
    async fn exchange(
        &self,
        kind: ResponseKind,
        packet: Encapsulation,
        window: Duration,
    ) -> Result<Response> {
        let rx = {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&kind) {
                return Err(PlcError::Connection(format!(
                    "A {} request is already in flight",
                    kind
                )));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(kind, tx);
            rx
        };

        if let Err(e) = self.send(packet).await {
            lock(&self.pending).remove(&kind);
            return Err(e);
        }

        match tokio::time::timeout(window, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PlcError::Connection(format!(
                "Session closed while waiting for {} reply",
                kind
            ))),
            Err(_) => {
                lock(&self.pending).remove(&kind);
                Err(PlcError::Timeout(format!(
                    "{} reply not received within {}ms",
                    kind,
                    window.as_millis()
                )))
            }
        }
    }

    /// Route a CIP request through Unconnected Send and wait for its reply
    async fn request(&self, kind: ResponseKind, msg: Vec<u8>, window: Duration) -> Result<Reply> {
        let route = lock(&self.route).clone();
        let cip = message::unconnected_send(&msg, &route);
        let timeout_s = window.as_secs().clamp(1, u64::from(u16::MAX)) as u16;
        let packet = Encapsulation::send_rr_data(self.session_handle(), timeout_s, &cip);
        match self.exchange(kind, packet, window).await? {
            Response::Reply(reply) => Ok(reply),
            Response::Registered(_) => Err(PlcError::Protocol {
                status: UNKNOWN_REPLY,
                extended: Vec::new(),
                message: format!("Unexpected session reply to {}", kind),
            }),
        }
    }

    async fn multiple(&self, requests: &[Vec<u8>]) -> Result<Reply> {
        let reply = self
            .request(
                ResponseKind::MultipleService,
                message::multiple_service(requests),
                self.request_timeout,
            )
            .await?;
        if reply.status != EMBEDDED_SERVICE_ERROR {
            reply.check()?;
        }
        if reply.nested.len() != requests.len() {
            return Err(PlcError::Protocol {
                status: UNKNOWN_REPLY,
                extended: Vec::new(),
                message: format!(
                    "Expected {} sub-replies, got {}",
                    requests.len(),
                    reply.nested.len()
                ),
            });
        }
        Ok(reply)
    }

    async fn establish(&self, ip: Ipv4Addr, slot: u8, window: Duration) -> Result<ControllerIdentity> {
        let stream = tokio::time::timeout(window, TcpStream::connect((ip, self.port)))
            .await
            .map_err(|_| {
                PlcError::Timeout(format!(
                    "Connecting to {}:{} took longer than {}ms",
                    ip,
                    self.port,
                    window.as_millis()
                ))
            })?
            .map_err(|e| {
                PlcError::Connection(format!("Failed to connect to {}:{}: {}", ip, self.port, e))
            })?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let router = tokio::spawn(route_replies(
            FramedRead::new(read, EncapsulationCodec),
            self.pending.clone(),
            self.state.clone(),
        ));
        *self.link.lock().await = Some(Link {
            writer: FramedWrite::new(write, EncapsulationCodec),
            router,
        });
        *lock(&self.route) = epath::backplane(slot);

        match self
            .exchange(ResponseKind::RegisterSession, Encapsulation::register_session(), window)
            .await?
        {
            Response::Registered(handle) => self.handle.store(handle, Ordering::Release),
            Response::Reply(_) => {
                return Err(PlcError::Connection("Session registration was not acknowledged".into()))
            }
        }
        debug!("Registered session 0x{:08X}", self.session_handle());

        let reply = self
            .request(ResponseKind::GetAttributeAll, message::identity(), window)
            .await?;
        reply.check()?;
        message::parse_identity(&reply.data)
    }

    async fn teardown(&self) {
        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            let handle = self.handle.swap(0, Ordering::AcqRel);
            if handle != 0 {
                if let Err(e) = link.writer.send(Encapsulation::unregister_session(handle)).await {
                    debug!("Unregister session failed: {}", e);
                }
            }
            link.router.abort();
            let _ = link.writer.close().await;
        }
        *lock(&self.state) = SessionState::Disconnected;
        fail_all(&self.pending, || PlcError::Connection("Session closed".into()));
    }
}

#[async_trait]
impl Controller for CipSession {
    async fn open(&self, address: &str, slot: u8, timeout: Duration) -> Result<()> {
        let ip: Ipv4Addr = address.trim().parse().map_err(|_| {
            PlcError::Connection(format!("'{}' is not a valid IPv4 address", address))
        })?;
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Disconnected {
                return Err(PlcError::Connection(format!("Session is already {}", *state)));
            }
            *state = SessionState::Connecting;
        }

        info!("Connecting to controller at {}:{} slot {}", ip, self.port, slot);
        match self.establish(ip, slot, timeout).await {
            Ok(identity) => {
                info!(
                    "Connected to {} (rev {}, serial {:08X}){}",
                    identity.name,
                    identity.version,
                    identity.serial_number,
                    if identity.faulted { " - controller reports a fault" } else { "" }
                );
                *lock(&self.identity) = Some(identity);
                *lock(&self.state) = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open session with {}: {}", ip, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let open = self.link.lock().await.is_some();
        if !open && *lock(&self.state) == SessionState::Disconnected {
            return Ok(());
        }
        self.teardown().await;
        info!("Session closed");
        Ok(())
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn identity(&self) -> Option<ControllerIdentity> {
        lock(&self.identity).clone()
    }

    async fn read_tag(&self, tag: &mut Tag) -> Result<()> {
        self.ensure_connected()?;
        let reply = self
            .request(
                ResponseKind::ReadTag,
                message::read_tag(tag.address().path()),
                self.request_timeout,
            )
            .await?;
        let (data_type, value) = reply.read_value()?;
        if data_type != tag.data_type {
            debug!("Tag {} is {} on the controller, configured as {}", tag.name, data_type, tag.data_type);
        }
        tag.accept_read(value);
        Ok(())
    }

    async fn write_tag(&self, tag: &mut Tag) -> Result<()> {
        self.ensure_connected()?;
        let pending = tag
            .pending
            .ok_or_else(|| PlcError::Validation(format!("Tag {} has no staged write", tag.name)))?;
        let (kind, msg) = message::staged_write(tag.address().path(), tag.data_type, &pending);
        let reply = self.request(kind, msg, self.request_timeout).await?;
        reply.check()?;
        tag.accept_write();
        Ok(())
    }

    async fn read_tags(&self, tags: &mut [Tag]) -> Result<()> {
        self.ensure_connected()?;
        let requests: Vec<Vec<u8>> = tags
            .iter()
            .map(|tag| message::read_tag(tag.address().path()))
            .collect();

        let mut first_error = None;
        for range in chunk_requests(&requests, MULTI_SERVICE_THRESHOLD) {
            let reply = self.multiple(&requests[range.clone()]).await?;
            for (tag, sub) in tags[range].iter_mut().zip(&reply.nested) {
                match sub.read_value() {
                    Ok((_, value)) => tag.accept_read(value),
                    Err(e) => {
                        warn!("Reading {} failed: {}", tag.name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn write_tags(&self, tags: &mut [Tag]) -> Result<()> {
        self.ensure_connected()?;
        let mut requests = Vec::with_capacity(tags.len());
        for tag in tags.iter() {
            let pending = tag.pending.ok_or_else(|| {
                PlcError::Validation(format!("Tag {} has no staged write", tag.name))
            })?;
            let (_, msg) = message::staged_write(tag.address().path(), tag.data_type, &pending);
            requests.push(msg);
        }

        let mut first_error = None;
        for range in chunk_requests(&requests, MULTI_SERVICE_THRESHOLD) {
            let reply = self.multiple(&requests[range.clone()]).await?;
            for (tag, sub) in tags[range].iter_mut().zip(&reply.nested) {
                match sub.check() {
                    Ok(()) => tag.accept_write(),
                    Err(e) => {
                        warn!("Writing {} failed: {}", tag.name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn protocol_name(&self) -> &'static str {
        "EtherNet/IP"
    }
}

// ============================================================================
// REPLY ROUTING
// ============================================================================

async fn route_replies(
    mut reader: FramedRead<OwnedReadHalf, EncapsulationCodec>,
    pending: PendingMap,
    state: Arc<Mutex<SessionState>>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(packet) => dispatch(&pending, packet),
            Err(e) => {
                warn!("Dropping connection after framing error: {}", e);
                break;
            }
        }
    }
    warn!("Connection to controller lost");
    *lock(&state) = SessionState::Disconnected;
    fail_all(&pending, || PlcError::Connection("Connection to controller lost".into()));
}

fn dispatch(pending: &PendingMap, packet: Encapsulation) {
    match packet.command() {
        Some(Command::RegisterSession) => {
            let result = if packet.status == 0 {
                Ok(Response::Registered(packet.session))
            } else {
                Err(encapsulation_error("Register Session", packet.status))
            };
            complete(pending, ResponseKind::RegisterSession, result);
        }
        Some(Command::SendRRData) => {
            if packet.status != 0 {
                let status = packet.status;
                fail_all(pending, || encapsulation_error("SendRRData", status));
                return;
            }
            let reply = match packet
                .unconnected_payload()
                .and_then(|payload| Reply::parse(&payload))
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Discarding unparseable reply: {}", e);
                    return;
                }
            };
            match reply.kind() {
                ResponseKind::UnconnectedSend => {
                    warn!("Unconnected Send failed with status 0x{:02X}", reply.status);
                    fail_all(pending, || routing_error(&reply));
                }
                kind => complete(pending, kind, Ok(Response::Reply(reply))),
            }
        }
        _ => debug!("Ignoring encapsulation command 0x{:04X}", packet.command),
    }
}

fn complete(pending: &PendingMap, kind: ResponseKind, result: Result<Response>) {
    match lock(pending).remove(&kind) {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => debug!("No request waiting for {} reply", kind),
    }
}

fn fail_all(pending: &PendingMap, error: impl Fn() -> PlcError) {
    let drained: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(error()));
    }
}

fn encapsulation_error(command: &str, status: u32) -> PlcError {
    PlcError::Connection(format!(
        "{} rejected with encapsulation status 0x{:04X}",
        command, status
    ))
}

fn routing_error(reply: &Reply) -> PlcError {
    reply.error().unwrap_or_else(|| PlcError::Protocol {
        status: UNKNOWN_REPLY,
        extended: Vec::new(),
        message: "Unexpected Unconnected Send reply".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let session = CipSession::new();
        let err = session
            .open("not-an-ip", 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Connection(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let session = CipSession::new();
        let mut tag = Tag::new(&crate::project::TagConfig::new(
            1,
            "a",
            crate::value::DataType::Dint,
        ))
        .unwrap();
        assert!(matches!(
            session.read_tag(&mut tag).await,
            Err(PlcError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = CipSession::new();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_dispatch_routes_by_kind() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(ResponseKind::ReadTag, tx);

        let cip = [0xCC, 0, 0, 0, 0xC1, 0, 0xFF];
        dispatch(&pending, Encapsulation::send_rr_data(1, 10, &cip));

        match rx.try_recv() {
            Ok(Ok(Response::Reply(reply))) => assert_eq!(reply.kind(), ResponseKind::ReadTag),
            _ => panic!("read completion not resolved"),
        }
        assert!(lock(&pending).is_empty());
    }

    #[test]
    fn test_routing_failure_fails_everything() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(ResponseKind::WriteTag, tx);

        let cip = [0xD2, 0, 0x01, 1, 0x04, 0x01];
        dispatch(&pending, Encapsulation::send_rr_data(1, 10, &cip));

        match rx.try_recv() {
            Ok(Err(PlcError::Protocol { status, extended, .. })) => {
                assert_eq!(status, 0x01);
                assert_eq!(extended, vec![0x0104]);
            }
            _ => panic!("write completion not failed"),
        }
    }
}
