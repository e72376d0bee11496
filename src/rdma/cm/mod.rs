//! Connection manager.
//!
//! A software counterpart of `rdma_cm`: communication identifiers are bound
//! to socket addresses in a process-wide table that plays the role of the
//! network, and connection establishment is an exchange of events between
//! the two identifiers' event channels. Private data of up to
//! [`MAX_PRIVATE_DATA`] bytes rides on connect, accept, and reject.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Error as IoError, ErrorKind as IoErrorKind};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::rdma::context::Context;
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpCreationError};
use crate::utils::sync::LockExt;

/// Maximum private data length carried by a connect request.
pub const MAX_PRIVATE_DATA: usize = 56;

/// First port handed out when binding to port 0.
const EPHEMERAL_PORT_BASE: u16 = 49152;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static NEXT_PORT: AtomicU16 = AtomicU16::new(EPHEMERAL_PORT_BASE);

/// Bound addresses of the process.
static BOUND: Mutex<BTreeMap<SocketAddr, Weak<CmIdInner>>> = Mutex::new(BTreeMap::new());

/// Type of a connection manager event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    Established,
    Rejected,
    Unreachable,
    Disconnected,
}

/// Connection manager event.
pub struct CmEvent {
    ty: CmEventType,
    id: u64,
    conn: Option<CmId>,
    private_data: Vec<u8>,
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("ty", &self.ty)
            .field("id", &self.id)
            .field("private_data_len", &self.private_data.len())
            .finish()
    }
}

impl CmEvent {
    /// Get the event type.
    #[inline]
    pub fn ty(&self) -> CmEventType {
        self.ty
    }

    /// Get the handle of the identifier this event concerns.
    ///
    /// For [`CmEventType::ConnectRequest`] this is the handle of the newly
    /// created identifier for the incoming connection.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the private data carried by the event.
    #[inline]
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Take the identifier of an incoming connection out of a
    /// [`CmEventType::ConnectRequest`] event.
    #[inline]
    pub fn take_conn(&mut self) -> Option<CmId> {
        self.conn.take()
    }
}

/// Event channel that reports events of every identifier created on it.
pub struct EventChannel {
    tx: Sender<CmEvent>,
    rx: Receiver<CmEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    /// Create an event channel.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Block until the next event arrives.
    pub fn get_event(&self) -> io::Result<CmEvent> {
        self.rx
            .recv()
            .map_err(|_| IoError::new(IoErrorKind::BrokenPipe, "event channel closed"))
    }

    /// Wait at most `timeout` for the next event.
    pub fn get_event_timeout(&self, timeout: Duration) -> Option<CmEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Get the next event if one is pending.
    pub fn try_get_event(&self) -> Option<CmEvent> {
        self.rx.try_recv().ok()
    }

    /// Get the receiving end, e.g. for `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<CmEvent> {
        &self.rx
    }
}

#[derive(Default)]
struct CmIdState {
    local: Option<SocketAddr>,
    bound: bool,
    peer_addr: Option<SocketAddr>,
    resolved: Vec<SocketAddr>,
    route_resolved: bool,

    /// Backlog limit and pending connect requests, if listening.
    listening: Option<(u32, u32)>,

    qp: Option<Qp>,
    peer: Option<Weak<CmIdInner>>,

    /// Listener whose backlog this identifier occupies until accepted or rejected.
    listener: Option<Weak<CmIdInner>>,
    connected: bool,
}

struct CmIdInner {
    handle: u64,
    ctx: Context,
    events: Sender<CmEvent>,
    state: Mutex<CmIdState>,
}

impl CmIdInner {
    fn emit(&self, ty: CmEventType, conn: Option<CmId>, private_data: Vec<u8>) {
        let id = conn.as_ref().map_or(self.handle, CmId::handle);
        log::trace!("CM event {:?} for id {}", ty, id);
        let event = CmEvent {
            ty,
            id,
            conn,
            private_data,
        };
        if self.events.send(event).is_err() {
            log::debug!("CM event {:?} for id {} dropped, channel closed", ty, id);
        }
    }

    /// Give back a slot of the listener's backlog.
    fn leave_backlog(listener: Option<Weak<CmIdInner>>) {
        if let Some(listener) = listener.and_then(|w| w.upgrade()) {
            if let Some((_, pending)) = listener.state.locked().listening.as_mut() {
                *pending = pending.saturating_sub(1);
            }
        }
    }

    /// The peer tore the connection down.
    fn remote_disconnect(&self) {
        let qp = {
            let mut st = self.state.locked();
            if !st.connected {
                return;
            }
            st.connected = false;
            st.peer = None;
            st.qp.clone()
        };
        if let Some(qp) = qp {
            qp.modify_to_error();
        }
        self.emit(CmEventType::Disconnected, None, Vec::new());
    }
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        let me = self as *const CmIdInner;
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if st.connected {
            if let Some(qp) = st.qp.take() {
                qp.modify_to_error();
            }
            if let Some(peer) = st.peer.take().and_then(|w| w.upgrade()) {
                peer.remote_disconnect();
            }
        }
        Self::leave_backlog(st.listener.take());

        if st.bound {
            if let Some(addr) = st.local {
                let mut bound = BOUND.locked();
                if bound.get(&addr).is_some_and(|w| w.as_ptr() == me) {
                    bound.remove(&addr);
                }
            }
        }
    }
}

fn addr_conflicts(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.port() == b.port() && (a.ip() == b.ip() || a.ip().is_unspecified() || b.ip().is_unspecified())
}

fn addr_reaches(dst: &SocketAddr, listen: &SocketAddr) -> bool {
    dst.port() == listen.port()
        && (dst.ip() == listen.ip()
            || listen.ip().is_unspecified()
            || (dst.ip().is_loopback() && listen.ip().is_loopback()))
}

/// Find a live listener reachable at `dst`.
fn find_listener(dst: &SocketAddr) -> Option<Arc<CmIdInner>> {
    let candidates = BOUND
        .locked()
        .iter()
        .filter(|(addr, _)| addr_reaches(dst, addr))
        .map(|(_, w)| w.clone())
        .collect::<Vec<_>>();
    candidates
        .into_iter()
        .filter_map(|w| w.upgrade())
        .find(|id| id.state.locked().listening.is_some())
}

fn ephemeral_port(ip: IpAddr, bound: &BTreeMap<SocketAddr, Weak<CmIdInner>>) -> Option<u16> {
    for _ in 0..(u16::MAX - EPHEMERAL_PORT_BASE) {
        let port = NEXT_PORT
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(if p == u16::MAX { EPHEMERAL_PORT_BASE } else { p + 1 })
            })
            .unwrap_or(EPHEMERAL_PORT_BASE);
        let candidate = SocketAddr::new(ip, port);
        if !bound
            .iter()
            .any(|(addr, w)| w.strong_count() > 0 && addr_conflicts(addr, &candidate))
        {
            return Some(port);
        }
    }
    None
}

fn not_ready(msg: &str) -> IoError {
    IoError::new(IoErrorKind::InvalidInput, msg.to_owned())
}

/// Communication identifier.
///
/// This type is a simple wrapper of an `Arc`. Dropping the last handle of a
/// connected identifier disconnects it.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("CmId<{}>", self.inner.handle))
    }
}

impl CmId {
    /// Create an identifier whose events are reported to `ec`.
    pub fn new(ec: &EventChannel, ctx: &Context) -> Self {
        Self::with_sender(ec.tx.clone(), ctx)
    }

    fn with_sender(events: Sender<CmEvent>, ctx: &Context) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
                ctx: ctx.clone(),
                events,
                state: Mutex::new(CmIdState::default()),
            }),
        }
    }

    /// Get the process-unique handle of this identifier.
    #[inline]
    pub fn handle(&self) -> u64 {
        self.inner.handle
    }

    /// Get the device context of this identifier.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the local address, if bound or connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.locked().local
    }

    /// Get the address of the connected peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.locked().peer_addr
    }

    /// Get the QP created on this identifier.
    pub fn qp(&self) -> Option<Qp> {
        self.inner.state.locked().qp.clone()
    }

    /// Bind to a local address. Port 0 picks an ephemeral port.
    pub fn bind_addr(&self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.inner.state.locked();
        if st.bound {
            return Err(not_ready("identifier is already bound"));
        }

        let mut bound = BOUND.locked();
        let addr = if addr.port() == 0 {
            let port = ephemeral_port(addr.ip(), &bound).ok_or_else(|| {
                IoError::new(IoErrorKind::AddrInUse, "ephemeral ports exhausted")
            })?;
            SocketAddr::new(addr.ip(), port)
        } else {
            if bound
                .iter()
                .any(|(a, w)| w.strong_count() > 0 && addr_conflicts(a, &addr))
            {
                return Err(IoError::new(
                    IoErrorKind::AddrInUse,
                    format!("address {} is in use", addr),
                ));
            }
            addr
        };

        bound.insert(addr, Arc::downgrade(&self.inner));
        st.local = Some(addr);
        st.bound = true;
        log::debug!("CM id {} bound to {}", self.inner.handle, addr);
        Ok(())
    }

    /// Start listening for connect requests.
    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        let mut st = self.inner.state.locked();
        if !st.bound {
            return Err(not_ready("cannot listen on an unbound identifier"));
        }
        st.listening = Some((backlog.max(1), 0));
        Ok(())
    }

    /// Resolve a destination address.
    ///
    /// Reports [`CmEventType::AddrResolved`] on success, or
    /// [`CmEventType::AddrError`] if the host resolves to no address.
    pub fn resolve_addr(&self, host: &str, port: u16) -> io::Result<()> {
        let resolved = (host, port).to_socket_addrs()?.collect::<Vec<_>>();
        let ty = if resolved.is_empty() {
            CmEventType::AddrError
        } else {
            CmEventType::AddrResolved
        };
        self.inner.state.locked().resolved = resolved;
        self.inner.emit(ty, None, Vec::new());
        Ok(())
    }

    /// Resolve the route to the destination resolved by [`CmId::resolve_addr`].
    pub fn resolve_route(&self) -> io::Result<()> {
        let ty = {
            let mut st = self.inner.state.locked();
            if st.resolved.is_empty() {
                return Err(not_ready("address is not resolved"));
            }
            st.route_resolved = true;
            CmEventType::RouteResolved
        };
        self.inner.emit(ty, None, Vec::new());
        Ok(())
    }

    /// Create the QP used by this identifier's connection.
    pub fn create_qp(
        &self,
        pd: &Pd,
        send_cq: &Cq,
        recv_cq: &Cq,
        caps: QpCaps,
    ) -> Result<Qp, QpCreationError> {
        let qp = Qp::builder()
            .send_cq(send_cq)
            .recv_cq(recv_cq)
            .caps(caps)
            .sq_sig_all(false)
            .build(pd)?;
        self.inner.state.locked().qp = Some(qp.clone());
        Ok(qp)
    }

    /// Send a connect request to the resolved destination.
    ///
    /// The outcome is reported as [`CmEventType::Established`],
    /// [`CmEventType::Rejected`], or [`CmEventType::Unreachable`].
    pub fn connect(&self, private_data: &[u8]) -> io::Result<()> {
        if private_data.len() > MAX_PRIVATE_DATA {
            return Err(not_ready("private data too long"));
        }
        let (dsts, local) = {
            let mut st = self.inner.state.locked();
            if !st.route_resolved {
                return Err(not_ready("route is not resolved"));
            }
            if st.qp.is_none() {
                return Err(not_ready("connect without a QP"));
            }
            let local = match st.local {
                Some(local) => local,
                None => {
                    let ip = st.resolved[0].ip();
                    let port = ephemeral_port(ip, &BOUND.locked()).ok_or_else(|| {
                        IoError::new(IoErrorKind::AddrInUse, "ephemeral ports exhausted")
                    })?;
                    let local = SocketAddr::new(ip, port);
                    st.local = Some(local);
                    local
                }
            };
            (st.resolved.clone(), local)
        };

        let Some((dst, listener)) = dsts
            .iter()
            .find_map(|dst| find_listener(dst).map(|l| (*dst, l)))
        else {
            self.inner
                .emit(CmEventType::Unreachable, None, Vec::new());
            return Ok(());
        };

        let admitted = {
            let mut st = listener.state.locked();
            match st.listening.as_mut() {
                Some((backlog, pending)) if *pending < *backlog => {
                    *pending += 1;
                    true
                }
                _ => false,
            }
        };
        if !admitted {
            log::debug!("connect request to {} rejected, backlog full", dst);
            self.inner.emit(CmEventType::Rejected, None, Vec::new());
            return Ok(());
        }

        let listen_addr = listener.state.locked().local;
        let child = CmId::with_sender(listener.events.clone(), &listener.ctx);
        {
            let mut st = child.inner.state.locked();
            st.local = listen_addr;
            st.peer_addr = Some(local);
            st.peer = Some(Arc::downgrade(&self.inner));
            st.listener = Some(Arc::downgrade(&listener));
        }
        self.inner.state.locked().peer_addr = Some(dst);
        listener.emit(CmEventType::ConnectRequest, Some(child), private_data.to_vec());
        Ok(())
    }

    /// Accept an incoming connection.
    ///
    /// The QP must have been created with [`CmId::create_qp`]. Both ends
    /// receive [`CmEventType::Established`].
    pub fn accept(&self, private_data: &[u8]) -> io::Result<()> {
        let (qp, client) = {
            let st = self.inner.state.locked();
            let qp = st.qp.clone().ok_or_else(|| not_ready("accept without a QP"))?;
            let client = st
                .peer
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| IoError::new(IoErrorKind::NotConnected, "connecting peer is gone"))?;
            (qp, client)
        };
        let client_qp = client
            .state
            .locked()
            .qp
            .clone()
            .ok_or_else(|| IoError::new(IoErrorKind::NotConnected, "connecting peer has no QP"))?;
        Qp::connect_local(&qp, &client_qp)?;

        let listener = {
            let mut st = self.inner.state.locked();
            st.connected = true;
            st.listener.take()
        };
        CmIdInner::leave_backlog(listener);
        {
            let mut st = client.state.locked();
            st.peer = Some(Arc::downgrade(&self.inner));
            st.connected = true;
        }

        client.emit(CmEventType::Established, None, private_data.to_vec());
        self.inner.emit(CmEventType::Established, None, Vec::new());
        Ok(())
    }

    /// Reject an incoming connection.
    pub fn reject(&self, private_data: &[u8]) -> io::Result<()> {
        let (client, listener) = {
            let mut st = self.inner.state.locked();
            (st.peer.take().and_then(|w| w.upgrade()), st.listener.take())
        };
        CmIdInner::leave_backlog(listener);
        if let Some(client) = client {
            client.emit(CmEventType::Rejected, None, private_data.to_vec());
        }
        Ok(())
    }

    /// Disconnect an established connection.
    ///
    /// The QPs of both ends move to the error state and both ends receive
    /// [`CmEventType::Disconnected`]. Disconnecting twice is a no-op.
    pub fn disconnect(&self) -> io::Result<()> {
        let (peer, qp) = {
            let mut st = self.inner.state.locked();
            if !st.connected {
                return Ok(());
            }
            st.connected = false;
            (st.peer.take().and_then(|w| w.upgrade()), st.qp.clone())
        };
        if let Some(qp) = qp {
            qp.modify_to_error();
        }
        self.inner.emit(CmEventType::Disconnected, None, Vec::new());
        if let Some(peer) = peer {
            peer.remote_disconnect();
        }
        Ok(())
    }
}
