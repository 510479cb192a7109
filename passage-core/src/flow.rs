//! Flow manager
//!
//! Ties NAT entries to stack sockets and upstream sockets and drives the
//! per-flow lifecycle:
//!
//! ```text
//! New --classify--> Connecting --upstream ready--> Established
//! Connecting --upstream error--> Closing (RST for TCP)
//! Established --FIN/RST either side--> Closing
//! Established --idle>timeout (UDP)--> Closing
//! Closing --buffers flushed--> Closed --linger--> reclaimed
//! ```
//!
//! Upstream socket I/O and the SOCKS5 handshake are the only asynchronous
//! work in the engine. They run on a single-worker tokio runtime owned
//! here; completions post events into a queue drained at the start of every
//! poll tick, so the boundary lock is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{PassageError, Result};
use crate::nat::{FlowKey, FlowState, NatTable};
use crate::packet::{build_ipv4_tcp_rst, build_ipv4_udp};
use crate::proxy::ProxyManager;
use crate::rule::RouteAction;
use crate::sniff;
use crate::socks5::{client_from_parts, TargetAddr};
use crate::stack::StackManager;

/// Chunks in flight per direction before backpressure bites
const UPSTREAM_CHANNEL_CAP: usize = 32;
/// Staged bytes per flow per direction
const PENDING_CAP_BYTES: usize = 64 * 1024;
/// Read chunk for socket drains and upstream reads
const STREAM_CHUNK: usize = 16 * 1024;
/// Payload collected before giving up on host sniffing
const SNIFF_MAX_BYTES: usize = 4096;
/// A flow waiting for its first payload is classified host-less after this
const SNIFF_TIMEOUT: Duration = Duration::from_secs(3);

/// Completion posted by an upstream task
enum UpstreamEvent {
    Connected { key: FlowKey },
    ConnectFailed { key: FlowKey, reason: String },
    Closed { key: FlowKey },
}

enum UpstreamRoute {
    Direct,
    Proxy { host: Option<String> },
}

/// Engine-side handles for one flow
struct FlowRuntime {
    stack_socket: Option<SocketHandle>,
    to_upstream: Option<mpsc::Sender<Bytes>>,
    from_upstream: Option<mpsc::Receiver<Bytes>>,
    task: Option<tokio::task::JoinHandle<()>>,
    /// Client bytes staged for the upstream channel
    pending_to_upstream: VecDeque<Bytes>,
    pending_to_upstream_bytes: usize,
    /// Upstream bytes staged for the stack socket
    pending_to_stack: VecDeque<Bytes>,
    pending_to_stack_bytes: usize,
    /// Classification deferred until the first payload is sniffable
    awaiting_host: bool,
    /// Upstream hit EOF; FIN the client once pending_to_stack drains
    fin_after_flush: bool,
}

impl FlowRuntime {
    fn new(stack_socket: Option<SocketHandle>) -> Self {
        Self {
            stack_socket,
            to_upstream: None,
            from_upstream: None,
            task: None,
            pending_to_upstream: VecDeque::new(),
            pending_to_upstream_bytes: 0,
            pending_to_stack: VecDeque::new(),
            pending_to_stack_bytes: 0,
            awaiting_host: false,
            fin_after_flush: false,
        }
    }

    fn release(&mut self) {
        self.to_upstream = None;
        self.from_upstream = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Aggregate traffic totals that survive entry reclamation
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_connections: u64,
    pub udp_proxy_fallback: u64,
}

pub struct FlowManager {
    nat: NatTable,
    flows: HashMap<FlowKey, FlowRuntime>,
    events_tx: std_mpsc::Sender<UpstreamEvent>,
    events_rx: std_mpsc::Receiver<UpstreamEvent>,
    runtime: tokio::runtime::Runtime,
    config: EngineConfig,
    totals: FlowTotals,
}

impl FlowManager {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("passage-upstream")
            .enable_all()
            .build()
            .map_err(|e| PassageError::IoError(format!("upstream runtime: {}", e)))?;

        let (events_tx, events_rx) = std_mpsc::channel();

        Ok(Self {
            nat: NatTable::new(config.max_connections),
            flows: HashMap::new(),
            events_tx,
            events_rx,
            runtime,
            config,
            totals: FlowTotals::default(),
        })
    }

    pub fn totals(&self) -> FlowTotals {
        self.totals
    }

    /// Flows in any state other than Closed.
    pub fn active_flows(&self) -> usize {
        self.nat
            .iter()
            .filter(|(_, e)| e.state != FlowState::Closed)
            .count()
    }

    pub fn tracked_flows(&self) -> usize {
        self.nat.len()
    }

    pub fn flow_state(&self, key: &FlowKey) -> Option<FlowState> {
        self.nat.get(key).map(|e| e.state)
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    /// Admit a TCP SYN for an unknown (or lingering) key.
    ///
    /// Returns true when the segment should be fed to the stack, false when
    /// it was consumed here (immediate reject). NatTableFull propagates so
    /// the engine can drop the packet and count it.
    pub fn admit_tcp_syn(
        &mut self,
        key: FlowKey,
        syn_seq: u32,
        stack: &mut StackManager,
        proxy: &mut ProxyManager,
        now: Instant,
    ) -> Result<bool> {
        if let Some(entry) = self.nat.get(&key) {
            match entry.state {
                // fresh SYN against a dying entry: reclaim and start over
                FlowState::Closed => {
                    self.release_flow(&key, stack);
                    self.nat.remove(&key);
                }
                // retransmitted SYN; the stack handles it
                _ => return Ok(true),
            }
        }

        self.nat.create(key, now)?;
        self.totals.total_connections += 1;

        let defer = proxy.is_enabled()
            && proxy.has_domain_rules()
            && sniff::is_sniffable_port(key.dst_port);

        if defer {
            let handle = stack.create_listening_socket(key.dst_addr())?;
            let mut runtime = FlowRuntime::new(Some(handle));
            runtime.awaiting_host = true;
            self.flows.insert(key, runtime);
            log::debug!(
                "flow {} -> {} admitted, awaiting host sniff",
                key.src_addr(),
                key.dst_addr()
            );
            return Ok(true);
        }

        let decision = proxy.evaluate_route(None, Some(key.dst_ip), key.dst_port);
        let action = decision.action;
        if let Some(entry) = self.nat.get_mut(&key) {
            entry.set_route(decision);
        }

        match action {
            RouteAction::Reject => {
                if let Some(entry) = self.nat.get_mut(&key) {
                    entry.set_state(FlowState::Closed, now);
                }
                // RST back to the client: seq 0, ack = SYN seq + 1
                if let Some(rst) =
                    build_ipv4_tcp_rst(key.dst_addr(), key.src_addr(), 0, syn_seq.wrapping_add(1))
                {
                    stack.push_tx(rst);
                }
                log::debug!("flow {} -> {} rejected", key.src_addr(), key.dst_addr());
                Ok(false)
            }
            RouteAction::Direct | RouteAction::Proxy => {
                let handle = stack.create_listening_socket(key.dst_addr())?;
                let mut runtime = FlowRuntime::new(Some(handle));
                let route = match action {
                    RouteAction::Proxy => UpstreamRoute::Proxy { host: None },
                    _ => UpstreamRoute::Direct,
                };
                self.spawn_tcp_upstream(key, route, &mut runtime);
                self.flows.insert(key, runtime);
                if let Some(entry) = self.nat.get_mut(&key) {
                    entry.set_state(FlowState::Connecting, now);
                }
                Ok(true)
            }
        }
    }

    /// Touch an existing flow on any further packet.
    pub fn note_activity(&mut self, key: &FlowKey, now: Instant) {
        if let Some(entry) = self.nat.get_mut(key) {
            entry.touch(now);
        }
    }

    /// Handle one inbound UDP datagram, creating the flow if needed.
    pub fn handle_udp_datagram(
        &mut self,
        key: FlowKey,
        payload: &[u8],
        proxy: &mut ProxyManager,
        now: Instant,
    ) -> Result<()> {
        if self.nat.get(&key).is_none()
            || self.nat.get(&key).map(|e| e.state) == Some(FlowState::Closed)
        {
            if self.nat.get(&key).is_some() {
                if let Some(mut stale) = self.flows.remove(&key) {
                    stale.release();
                }
                self.nat.remove(&key);
            }

            self.nat.create(key, now)?;
            self.totals.total_connections += 1;

            let decision = proxy.evaluate_route(None, Some(key.dst_ip), key.dst_port);
            let mut action = decision.action;
            if let Some(entry) = self.nat.get_mut(&key) {
                entry.set_route(decision);
            }

            if action == RouteAction::Proxy {
                // UDP over SOCKS5 is out of scope; fall back to direct
                self.totals.udp_proxy_fallback += 1;
                log::warn!(
                    "UDP flow {} -> {} matched Proxy, falling back to Direct",
                    key.src_addr(),
                    key.dst_addr()
                );
                action = RouteAction::Direct;
            }

            match action {
                RouteAction::Reject => {
                    if let Some(entry) = self.nat.get_mut(&key) {
                        entry.set_state(FlowState::Closed, now);
                    }
                    // UDP rejects are silent drops
                    return Ok(());
                }
                _ => {
                    let mut runtime = FlowRuntime::new(None);
                    self.spawn_udp_upstream(key, &mut runtime);
                    self.flows.insert(key, runtime);
                    if let Some(entry) = self.nat.get_mut(&key) {
                        entry.set_state(FlowState::Connecting, now);
                    }
                }
            }
        }

        let state = self.nat.get(&key).map(|e| e.state);
        if matches!(state, Some(FlowState::Closed) | Some(FlowState::Closing)) {
            return Ok(());
        }

        let sent = {
            let runtime = match self.flows.get_mut(&key) {
                Some(r) => r,
                None => return Ok(()),
            };
            match &runtime.to_upstream {
                Some(tx) => tx.try_send(Bytes::copy_from_slice(payload)).is_ok(),
                None => false,
            }
        };

        if sent {
            let len = payload.len() as u64;
            self.nat.add_bytes_out(&key, len, now);
            self.totals.bytes_sent += len;
        } else {
            // datagram semantics: drop on backpressure
            self.note_activity(&key, now);
        }

        Ok(())
    }

    fn spawn_tcp_upstream(&self, key: FlowKey, route: UpstreamRoute, runtime: &mut FlowRuntime) {
        let events = self.events_tx.clone();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Bytes>(UPSTREAM_CHANNEL_CAP);
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(UPSTREAM_CHANNEL_CAP);
        let config = self.config.clone();
        let dst = key.dst_addr();

        let task = self.runtime.spawn(async move {
            let connected = match route {
                UpstreamRoute::Direct => TcpStream::connect(dst)
                    .await
                    .map_err(|e| format!("direct connect {}: {}", dst, e)),
                UpstreamRoute::Proxy { host } => {
                    let target = match host {
                        Some(h) => TargetAddr::from_domain(h, dst.port()),
                        None => TargetAddr::from_socket_addr(dst),
                    };
                    match client_from_parts(
                        &config.server_host,
                        config.server_port,
                        config.username.as_deref(),
                        config.password.as_deref(),
                        config.handshake_timeout,
                    ) {
                        Ok(client) => client.connect(target).await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            };

            let stream = match connected {
                Ok(stream) => {
                    let _ = events.send(UpstreamEvent::Connected { key });
                    stream
                }
                Err(reason) => {
                    let _ = events.send(UpstreamEvent::ConnectFailed { key, reason });
                    return;
                }
            };

            let (mut reader, mut writer) = stream.into_split();
            let mut buf = vec![0u8; STREAM_CHUNK];

            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => {
                            let _ = events.send(UpstreamEvent::Closed { key });
                            break;
                        }
                        Ok(n) => {
                            if data_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    },
                    chunk = cmd_rx.recv() => match chunk {
                        Some(data) => {
                            if writer.write_all(&data).await.is_err() {
                                let _ = events.send(UpstreamEvent::Closed { key });
                                break;
                            }
                        }
                        None => {
                            // client side finished; half-close toward the server
                            let _ = writer.shutdown().await;
                            // keep reading until the server closes
                            loop {
                                match reader.read(&mut buf).await {
                                    Ok(0) | Err(_) => {
                                        let _ = events.send(UpstreamEvent::Closed { key });
                                        return;
                                    }
                                    Ok(n) => {
                                        if data_tx
                                            .send(Bytes::copy_from_slice(&buf[..n]))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    },
                }
            }
        });

        runtime.to_upstream = Some(cmd_tx);
        runtime.from_upstream = Some(data_rx);
        runtime.task = Some(task);
    }

    fn spawn_udp_upstream(&self, key: FlowKey, runtime: &mut FlowRuntime) {
        let events = self.events_tx.clone();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Bytes>(UPSTREAM_CHANNEL_CAP);
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(UPSTREAM_CHANNEL_CAP);
        let dst = key.dst_addr();

        let task = self.runtime.spawn(async move {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(e) => {
                    let _ = events.send(UpstreamEvent::ConnectFailed {
                        key,
                        reason: format!("udp bind: {}", e),
                    });
                    return;
                }
            };
            if let Err(e) = socket.connect(dst).await {
                let _ = events.send(UpstreamEvent::ConnectFailed {
                    key,
                    reason: format!("udp connect {}: {}", dst, e),
                });
                return;
            }

            let _ = events.send(UpstreamEvent::Connected { key });
            let mut buf = vec![0u8; STREAM_CHUNK];

            loop {
                tokio::select! {
                    received = socket.recv(&mut buf) => match received {
                        Ok(n) => {
                            if data_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = events.send(UpstreamEvent::Closed { key });
                            break;
                        }
                    },
                    chunk = cmd_rx.recv() => match chunk {
                        Some(data) => {
                            let _ = socket.send(&data).await;
                        }
                        None => break,
                    },
                }
            }
        });

        runtime.to_upstream = Some(cmd_tx);
        runtime.from_upstream = Some(data_rx);
        runtime.task = Some(task);
    }

    /// One poll tick: drain completions, advance the stack, run the copy
    /// loops, sweep timers, reclaim lingered entries.
    pub fn poll(
        &mut self,
        stack: &mut StackManager,
        proxy: &mut ProxyManager,
        now: Instant,
        smol_now: smoltcp::time::Instant,
    ) {
        self.drain_events(stack, now);

        stack.poll(smol_now);

        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            if key.is_tcp() {
                self.service_tcp_flow(&key, stack, proxy, now);
            } else {
                self.service_udp_flow(&key, stack, now);
            }
        }

        self.sweep(stack, now);

        stack.poll(smol_now);
    }

    fn drain_events(&mut self, stack: &mut StackManager, now: Instant) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                UpstreamEvent::Connected { key } => {
                    if let Some(entry) = self.nat.get_mut(&key) {
                        if entry.state == FlowState::Connecting {
                            entry.set_state(FlowState::Established, now);
                            log::debug!(
                                "flow {} -> {} established",
                                key.src_addr(),
                                key.dst_addr()
                            );
                        }
                    }
                }
                UpstreamEvent::ConnectFailed { key, reason } => {
                    log::warn!(
                        "upstream for {} -> {} failed: {}",
                        key.src_addr(),
                        key.dst_addr(),
                        reason
                    );
                    if let Some(runtime) = self.flows.get_mut(&key) {
                        if let Some(handle) = runtime.stack_socket {
                            stack.abort_socket(handle);
                        }
                        runtime.release();
                    }
                    if let Some(entry) = self.nat.get_mut(&key) {
                        entry.set_state(FlowState::Closing, now);
                    }
                }
                UpstreamEvent::Closed { key } => {
                    if let Some(runtime) = self.flows.get_mut(&key) {
                        runtime.fin_after_flush = true;
                    }
                    if let Some(entry) = self.nat.get_mut(&key) {
                        if entry.state == FlowState::Established
                            || entry.state == FlowState::Connecting
                        {
                            entry.set_state(FlowState::Closing, now);
                        }
                    }
                }
            }
        }
    }

    fn service_tcp_flow(
        &mut self,
        key: &FlowKey,
        stack: &mut StackManager,
        proxy: &mut ProxyManager,
        now: Instant,
    ) {
        let Some(runtime) = self.flows.get_mut(key) else {
            return;
        };
        let Some(handle) = runtime.stack_socket else {
            return;
        };

        // upstream -> staging
        if let Some(rx) = runtime.from_upstream.as_mut() {
            while runtime.pending_to_stack_bytes < PENDING_CAP_BYTES {
                match rx.try_recv() {
                    Ok(chunk) => {
                        runtime.pending_to_stack_bytes += chunk.len();
                        runtime.pending_to_stack.push_back(chunk);
                    }
                    Err(_) => break,
                }
            }
        }

        // staging -> stack socket
        let mut wrote_to_stack: u64 = 0;
        {
            let socket = stack.socket_mut(handle);
            while let Some(front) = runtime.pending_to_stack.front_mut() {
                if !socket.can_send() {
                    break;
                }
                match socket.send_slice(front) {
                    Ok(sent) if sent == front.len() => {
                        wrote_to_stack += sent as u64;
                        runtime.pending_to_stack_bytes -= sent;
                        runtime.pending_to_stack.pop_front();
                    }
                    Ok(sent) => {
                        wrote_to_stack += sent as u64;
                        runtime.pending_to_stack_bytes -= sent;
                        let rest = front.slice(sent..);
                        *front = rest;
                        break;
                    }
                    Err(_) => break,
                }
            }

            // client -> staging, bounded so the TCP window closes naturally
            // once the upstream stops draining
            while socket.can_recv() && runtime.pending_to_upstream_bytes < PENDING_CAP_BYTES {
                let mut buf = [0u8; STREAM_CHUNK];
                match socket.recv_slice(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        runtime.pending_to_upstream_bytes += n;
                        runtime
                            .pending_to_upstream
                            .push_back(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(_) => break,
                }
            }
        }

        if wrote_to_stack > 0 {
            self.nat.add_bytes_in(key, wrote_to_stack, now);
            self.totals.bytes_received += wrote_to_stack;
        }

        let runtime = self.flows.get_mut(key).expect("present above");

        // deferred classification once the first payload arrived
        if runtime.awaiting_host {
            let collected = runtime.pending_to_upstream_bytes;
            let timed_out = self
                .nat
                .get(key)
                .map(|e| now.duration_since(e.created_at) > SNIFF_TIMEOUT)
                .unwrap_or(true);

            if collected > 0 || timed_out {
                let host = if collected > 0 {
                    let mut head = Vec::with_capacity(collected.min(SNIFF_MAX_BYTES));
                    for chunk in &runtime.pending_to_upstream {
                        head.extend_from_slice(chunk);
                        if head.len() >= SNIFF_MAX_BYTES {
                            break;
                        }
                    }
                    sniff::sniff_host(&head, key.dst_port)
                } else {
                    None
                };

                // an unrecognizable head may just be a split hello; wait for
                // more unless we are past the cap or the deadline
                let give_up = host.is_none() && (collected >= SNIFF_MAX_BYTES || timed_out);
                if host.is_some() || give_up {
                    runtime.awaiting_host = false;
                    self.classify_deferred(key, host, stack, proxy, now);
                }
            }
        }

        let Some(runtime) = self.flows.get_mut(key) else {
            return;
        };

        // staging -> upstream channel
        let mut sent_upstream: u64 = 0;
        if let Some(tx) = runtime.to_upstream.clone() {
            while let Some(chunk) = runtime.pending_to_upstream.pop_front() {
                let len = chunk.len();
                match tx.try_send(chunk) {
                    Ok(()) => {
                        runtime.pending_to_upstream_bytes -= len;
                        sent_upstream += len as u64;
                    }
                    Err(mpsc::error::TrySendError::Full(chunk)) => {
                        runtime.pending_to_upstream.push_front(chunk);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        runtime.pending_to_upstream.clear();
                        runtime.pending_to_upstream_bytes = 0;
                        break;
                    }
                }
            }
        }

        if sent_upstream > 0 {
            self.nat.add_bytes_out(key, sent_upstream, now);
            self.totals.bytes_sent += sent_upstream;
        }

        let Some(runtime) = self.flows.get_mut(key) else {
            return;
        };

        // client sent FIN and everything it wrote has been handed upstream:
        // close the upstream write side
        {
            let socket = stack.socket(handle);
            if !socket.may_recv()
                && runtime.pending_to_upstream.is_empty()
                && runtime.to_upstream.is_some()
                && !runtime.awaiting_host
            {
                runtime.to_upstream = None;
                if let Some(entry) = self.nat.get_mut(key) {
                    if entry.state == FlowState::Established {
                        entry.set_state(FlowState::Closing, now);
                    }
                }
            }
        }

        // upstream finished and its tail is flushed: FIN toward the client
        if runtime.fin_after_flush && runtime.pending_to_stack.is_empty() {
            runtime.fin_after_flush = false;
            stack.close_socket(handle);
        }

        // socket fully closed: flow is done
        if stack.socket_state(handle) == smoltcp::socket::tcp::State::Closed {
            let runtime = self.flows.get_mut(key).expect("present above");
            runtime.release();
            if let Some(entry) = self.nat.get_mut(key) {
                entry.set_state(FlowState::Closed, now);
            }
        }
    }

    fn classify_deferred(
        &mut self,
        key: &FlowKey,
        host: Option<String>,
        stack: &mut StackManager,
        proxy: &mut ProxyManager,
        now: Instant,
    ) {
        let decision = proxy.evaluate_route(host.as_deref(), Some(key.dst_ip), key.dst_port);
        let action = decision.action;
        if let Some(entry) = self.nat.get_mut(key) {
            entry.set_route(decision);
        }

        let Some(runtime) = self.flows.get_mut(key) else {
            return;
        };

        match action {
            RouteAction::Reject => {
                if let Some(handle) = runtime.stack_socket {
                    stack.abort_socket(handle);
                }
                runtime.release();
                runtime.pending_to_upstream.clear();
                runtime.pending_to_upstream_bytes = 0;
                if let Some(entry) = self.nat.get_mut(key) {
                    entry.set_state(FlowState::Closing, now);
                }
                log::debug!(
                    "flow {} -> {} rejected ({})",
                    key.src_addr(),
                    key.dst_addr(),
                    host.as_deref().unwrap_or("no host")
                );
            }
            RouteAction::Direct | RouteAction::Proxy => {
                let route = match action {
                    RouteAction::Proxy => UpstreamRoute::Proxy { host },
                    _ => UpstreamRoute::Direct,
                };
                let mut taken = std::mem::replace(runtime, FlowRuntime::new(None));
                self.spawn_tcp_upstream(*key, route, &mut taken);
                *self.flows.get_mut(key).expect("present above") = taken;
                if let Some(entry) = self.nat.get_mut(key) {
                    entry.set_state(FlowState::Connecting, now);
                }
            }
        }
    }

    fn service_udp_flow(&mut self, key: &FlowKey, stack: &mut StackManager, now: Instant) {
        let Some(runtime) = self.flows.get_mut(key) else {
            return;
        };

        let mut received: u64 = 0;
        if let Some(rx) = runtime.from_upstream.as_mut() {
            // replies become datagrams straight onto the tx queue
            while let Ok(chunk) = rx.try_recv() {
                received += chunk.len() as u64;
                if let Some(datagram) = build_ipv4_udp(key.dst_addr(), key.src_addr(), &chunk) {
                    stack.push_tx(datagram);
                }
            }
        }

        if received > 0 {
            self.nat.add_bytes_in(key, received, now);
            self.totals.bytes_received += received;
        }
    }

    fn sweep(&mut self, stack: &mut StackManager, now: Instant) {
        // idle UDP conversations
        for key in self.nat.idle_udp_keys(self.config.udp_idle_timeout, now) {
            log::debug!(
                "UDP flow {} -> {} idle, closing",
                key.src_addr(),
                key.dst_addr()
            );
            if let Some(runtime) = self.flows.get_mut(&key) {
                runtime.release();
            }
            if let Some(entry) = self.nat.get_mut(&key) {
                entry.set_state(FlowState::Closed, now);
            }
        }

        // flows whose runtime is gone settle into Closed
        let settled: Vec<FlowKey> = self
            .nat
            .iter()
            .filter(|(k, e)| {
                e.state == FlowState::Closing
                    && self
                        .flows
                        .get(k)
                        .map(|r| {
                            r.stack_socket
                                .map(|h| {
                                    stack.socket_state(h) == smoltcp::socket::tcp::State::Closed
                                })
                                .unwrap_or(true)
                        })
                        .unwrap_or(true)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in settled {
            if let Some(runtime) = self.flows.get_mut(&key) {
                runtime.release();
            }
            if let Some(entry) = self.nat.get_mut(&key) {
                entry.set_state(FlowState::Closed, now);
            }
        }

        // reclaim entries past their linger
        for entry in self.nat.reclaim_lingered(self.config.linger, now) {
            self.release_flow(&entry.key, stack);
        }
    }

    fn release_flow(&mut self, key: &FlowKey, stack: &mut StackManager) {
        if let Some(mut runtime) = self.flows.remove(key) {
            runtime.release();
            if let Some(handle) = runtime.stack_socket.take() {
                stack.remove_socket(handle);
            }
        }
    }

    /// Tear everything down: RST every live TCP flow, cancel upstream I/O,
    /// mark every entry Closed. The caller drains tx afterwards.
    pub fn shutdown(&mut self, stack: &mut StackManager, now: Instant) {
        for key in self.nat.keys() {
            if let Some(runtime) = self.flows.get_mut(&key) {
                if let Some(handle) = runtime.stack_socket {
                    if key.is_tcp() {
                        stack.abort_socket(handle);
                    }
                }
                runtime.release();
            }
            if let Some(entry) = self.nat.get_mut(&key) {
                entry.set_state(FlowState::Closed, now);
            }
        }

        // let the stack emit the RSTs
        stack.poll(crate::stack::smoltcp_now());

        for key in self.nat.keys() {
            self.release_flow(&key, stack);
            self.nat.remove(&key);
        }

        while self.events_rx.try_recv().is_ok() {}
        self.totals = FlowTotals::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TcpFlags;
    use crate::testutil;

    fn setup() -> (FlowManager, StackManager, ProxyManager) {
        let config = EngineConfig::default();
        let flows = FlowManager::new(config.clone()).unwrap();
        let stack = StackManager::new(config.queue_capacity, config.mtu, false);
        let proxy = ProxyManager::new(config);
        (flows, stack, proxy)
    }

    fn tcp_key(src_port: u16, dst: [u8; 4], dst_port: u16) -> FlowKey {
        FlowKey::tcp(
            format!("10.0.0.2:{}", src_port).parse().unwrap(),
            format!(
                "{}.{}.{}.{}:{}",
                dst[0], dst[1], dst[2], dst[3], dst_port
            )
            .parse()
            .unwrap(),
        )
    }

    #[test]
    fn test_reject_synthesizes_rst() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("IP-CIDR,9.9.9.0/24,REJECT\nFINAL,DIRECT");

        let key = tcp_key(40000, [9, 9, 9, 9], 80);
        let feed = flows
            .admit_tcp_syn(key, 7000, &mut stack, &mut proxy, Instant::now())
            .unwrap();

        assert!(!feed, "rejected SYN must not reach the stack");
        assert_eq!(flows.flow_state(&key), Some(FlowState::Closed));
        assert_eq!(proxy.counters().rejected, 1);

        let out = stack.pop_tx_batch();
        assert_eq!(out.len(), 1);
        let parsed = crate::packet::ParsedPacket::parse(&out[0]).unwrap();
        assert!(parsed.is_tcp_rst());
        let tcp = parsed.tcp.as_ref().unwrap();
        assert_eq!(tcp.ack_num, 7001);
        assert_eq!(tcp.src_port, 80);
    }

    #[test]
    fn test_admit_creates_connecting_flow() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("FINAL,DIRECT");

        let key = tcp_key(40001, [1, 2, 3, 4], 80);
        let feed = flows
            .admit_tcp_syn(key, 1, &mut stack, &mut proxy, Instant::now())
            .unwrap();

        assert!(feed);
        assert_eq!(flows.flow_state(&key), Some(FlowState::Connecting));
        assert_eq!(flows.totals().total_connections, 1);
        assert_eq!(stack.socket_count(), 1);
        assert_eq!(
            flows.nat().get(&key).unwrap().route().unwrap().action,
            RouteAction::Direct
        );
    }

    #[test]
    fn test_nat_full_propagates() {
        let config = EngineConfig::default().with_max_connections(2);
        let mut flows = FlowManager::new(config.clone()).unwrap();
        let mut stack = StackManager::new(config.queue_capacity, config.mtu, false);
        let mut proxy = ProxyManager::new(config);
        proxy.load_rules("FINAL,DIRECT");

        let now = Instant::now();
        flows
            .admit_tcp_syn(tcp_key(1, [1, 2, 3, 4], 80), 1, &mut stack, &mut proxy, now)
            .unwrap();
        flows
            .admit_tcp_syn(tcp_key(2, [1, 2, 3, 4], 80), 1, &mut stack, &mut proxy, now)
            .unwrap();

        let third = flows.admit_tcp_syn(tcp_key(3, [1, 2, 3, 4], 80), 1, &mut stack, &mut proxy, now);
        assert!(matches!(third, Err(PassageError::NatTableFull)));
        assert_eq!(flows.tracked_flows(), 2);
    }

    #[test]
    fn test_syn_against_lingering_entry_reclaims() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("FINAL,DIRECT");

        let key = tcp_key(5, [1, 2, 3, 4], 80);
        let t0 = Instant::now();
        flows.admit_tcp_syn(key, 1, &mut stack, &mut proxy, t0).unwrap();

        // force the entry Closed, then re-admit
        flows.nat.get_mut(&key).unwrap().set_state(FlowState::Closed, t0);
        let feed = flows.admit_tcp_syn(key, 2, &mut stack, &mut proxy, t0).unwrap();

        assert!(feed);
        assert_eq!(flows.flow_state(&key), Some(FlowState::Connecting));
        assert_eq!(flows.totals().total_connections, 2);
    }

    #[test]
    fn test_deferred_classification_with_domain_rules() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("DOMAIN-KEYWORD,ads,REJECT\nFINAL,DIRECT");

        let key = tcp_key(40002, [1, 2, 3, 4], 80);
        let feed = flows
            .admit_tcp_syn(key, 1, &mut stack, &mut proxy, Instant::now())
            .unwrap();

        assert!(feed);
        // no decision yet, flow still New
        assert_eq!(flows.flow_state(&key), Some(FlowState::New));
        assert!(flows.nat().get(&key).unwrap().route().is_none());
        // the rule engine has not been consulted
        assert_eq!(proxy.counters().rejected, 0);
        assert_eq!(proxy.counters().direct, 0);
    }

    #[test]
    fn test_sniffed_reject_closes_flow() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("DOMAIN-KEYWORD,ads,REJECT\nFINAL,DIRECT");

        let key = tcp_key(40100, [1, 2, 3, 4], 80);
        let now = Instant::now();
        flows.admit_tcp_syn(key, 100, &mut stack, &mut proxy, now).unwrap();

        // complete the handshake so payload can arrive
        let syn = testutil::tcp_packet(
            [10, 0, 0, 2],
            [1, 2, 3, 4],
            40100,
            80,
            TcpFlags { syn: true, ..Default::default() },
            100,
            0,
        );
        stack.push_rx(syn);
        let smol_now = crate::stack::smoltcp_now();
        flows.poll(&mut stack, &mut proxy, now, smol_now);

        let syn_ack = stack
            .pop_tx_batch()
            .into_iter()
            .find(|p| {
                crate::packet::ParsedPacket::parse(p)
                    .map(|pp| pp.tcp.as_ref().map(|t| t.flags.is_syn_ack()).unwrap_or(false))
                    .unwrap_or(false)
            })
            .expect("SYN-ACK expected");
        let parsed = crate::packet::ParsedPacket::parse(&syn_ack).unwrap();
        let server_seq = parsed.tcp.as_ref().unwrap().seq_num;

        // ACK + HTTP request with a matching Host
        let ack = testutil::tcp_packet(
            [10, 0, 0, 2],
            [1, 2, 3, 4],
            40100,
            80,
            TcpFlags { ack: true, ..Default::default() },
            101,
            server_seq.wrapping_add(1),
        );
        stack.push_rx(ack);
        let request = testutil::tcp_packet_with_payload(
            [10, 0, 0, 2],
            [1, 2, 3, 4],
            40100,
            80,
            TcpFlags { psh: true, ack: true, ..Default::default() },
            101,
            server_seq.wrapping_add(1),
            b"GET / HTTP/1.1\r\nHost: tracker-ads.net\r\n\r\n",
        );
        stack.push_rx(request);

        flows.poll(&mut stack, &mut proxy, now, smol_now);

        assert_eq!(proxy.counters().rejected, 1);
        let state = flows.flow_state(&key).unwrap();
        assert!(matches!(state, FlowState::Closing | FlowState::Closed));

        // the abort surfaces as a RST on a later tick
        flows.poll(&mut stack, &mut proxy, now, smol_now);
        let out = stack.pop_tx_batch();
        assert!(out.iter().any(|p| {
            crate::packet::ParsedPacket::parse(p)
                .map(|pp| pp.is_tcp_rst())
                .unwrap_or(false)
        }));
    }

    #[test]
    fn test_udp_reject_is_silent() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("DST-PORT,53,REJECT\nFINAL,DIRECT");

        let key = FlowKey::udp(
            "10.0.0.2:5353".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        );
        flows
            .handle_udp_datagram(key, b"query", &mut proxy, Instant::now())
            .unwrap();

        assert_eq!(flows.flow_state(&key), Some(FlowState::Closed));
        assert_eq!(proxy.counters().rejected, 1);
        assert!(stack.pop_tx_batch().is_empty());
    }

    #[test]
    fn test_udp_proxy_falls_back_to_direct() {
        let (mut flows, _stack, mut proxy) = setup();
        proxy.load_rules("FINAL,PROXY");

        let key = FlowKey::udp(
            "10.0.0.2:5353".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        );
        flows
            .handle_udp_datagram(key, b"query", &mut proxy, Instant::now())
            .unwrap();

        assert_eq!(flows.totals().udp_proxy_fallback, 1);
        assert_ne!(flows.flow_state(&key), Some(FlowState::Closed));
    }

    #[test]
    fn test_shutdown_drops_everything() {
        let (mut flows, mut stack, mut proxy) = setup();
        proxy.load_rules("FINAL,DIRECT");

        let now = Instant::now();
        for port in [41000u16, 41001, 41002] {
            flows
                .admit_tcp_syn(tcp_key(port, [1, 2, 3, 4], 80), 1, &mut stack, &mut proxy, now)
                .unwrap();
        }
        assert_eq!(flows.tracked_flows(), 3);

        flows.shutdown(&mut stack, now);

        assert_eq!(flows.tracked_flows(), 0);
        assert_eq!(flows.active_flows(), 0);
        assert_eq!(stack.socket_count(), 0);
    }
}
