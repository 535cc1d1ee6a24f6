//! TCP+UDP Modbus server (§4.6): one thread multiplexes the TCP listener
//! plus every accepted connection with a 1-second readiness poll; a sibling
//! thread answers UDP datagrams on the same port. Both frame requests
//! through the MBAP header and drive them through the shared [`Dispatcher`].
//!
//! Grounded on the synchronous, thread-light style the rest of this
//! workspace uses for its blocking I/O (`gw-runtime::cycle_engine`'s driver
//! calls, `gw-runtime::watchdog`'s tick loop): no async runtime is pulled in
//! here, and multiplexing uses `nix::poll`, a dependency already carried for
//! the real-time and network glue elsewhere in the workspace.

use crate::codec::MbapHeader;
use crate::dispatcher::Dispatcher;
use gw_common::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Readiness poll timeout for both the TCP multiplexer and the UDP thread
/// (§4.6, §5 "socket readiness waits with 1 s timeout").
const POLL_TIMEOUT: PollTimeout = PollTimeout::from(1_000u16);
/// Largest PDU this server will frame; larger MBAP `length` fields are
/// rejected rather than trusted, since they'd otherwise let a peer make us
/// allocate arbitrarily.
const MAX_PDU_LEN: usize = 253;

/// A running Modbus server. Owns the TCP multiplexer and UDP threads; call
/// [`ServerHandle::shutdown`] to stop them and join.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    tcp_thread: Option<JoinHandle<()>>,
    udp_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal both server threads to stop and join them.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(t) = self.tcp_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.udp_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// The Modbus-TCP/UDP server: binds one port for both protocols and drives
/// every accepted request through a shared [`Dispatcher`].
pub struct ModbusServer {
    dispatcher: Arc<Dispatcher>,
    port: u16,
    max_tcp_connections: usize,
    response_delay: Duration,
}

impl ModbusServer {
    /// Build a server bound to `127.0.0.1:port`. `max_tcp_connections` caps
    /// how many TCP connections the multiplexer keeps open at once (§4.6,
    /// §6) — `std::net` exposes no portable way to size the kernel listen
    /// backlog itself, so this is enforced as the multiplexer accepts:
    /// once at capacity, further accepts are drained (so the poll loop
    /// never stalls on a full backlog) and closed immediately. See
    /// DESIGN.md for this tradeoff. `response_delay` is the fixed
    /// post-send delay (`modbus_delay_ms`) applied before every reply.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, port: u16, max_tcp_connections: i32, response_delay: Duration) -> Self {
        Self {
            dispatcher,
            port,
            max_tcp_connections: max_tcp_connections.max(1) as usize,
            response_delay,
        }
    }

    /// Bind the TCP and UDP sockets and spawn the server threads.
    ///
    /// # Errors
    ///
    /// Returns an error if either socket fails to bind.
    pub fn start(self) -> GatewayResult<ServerHandle> {
        let tcp_listener = TcpListener::bind(("127.0.0.1", self.port))
            .map_err(|e| GatewayError::Socket(format!("binding TCP {}: {e}", self.port)))?;
        tcp_listener
            .set_nonblocking(true)
            .map_err(|e| GatewayError::Socket(format!("setting TCP listener nonblocking: {e}")))?;

        let udp_socket = UdpSocket::bind(("127.0.0.1", self.port))
            .map_err(|e| GatewayError::Socket(format!("binding UDP {}: {e}", self.port)))?;
        udp_socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(|e| GatewayError::Socket(format!("setting UDP read timeout: {e}")))?;

        let shutdown = Arc::new(AtomicBool::new(false));

        let tcp_thread = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = Arc::clone(&shutdown);
            let max_conn = self.max_tcp_connections;
            let delay = self.response_delay;
            thread::Builder::new()
                .name("modbus-tcp".into())
                .spawn(move || tcp_multiplex_loop(tcp_listener, &dispatcher, &shutdown, max_conn, delay))
                .map_err(|e| GatewayError::Socket(format!("spawning TCP server thread: {e}")))?
        };

        let udp_thread = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = Arc::clone(&shutdown);
            let delay = self.response_delay;
            thread::Builder::new()
                .name("modbus-udp".into())
                .spawn(move || udp_loop(&udp_socket, &dispatcher, &shutdown, delay))
                .map_err(|e| GatewayError::Socket(format!("spawning UDP thread: {e}")))?
        };

        info!(port = self.port, "modbus server listening (tcp+udp)");
        Ok(ServerHandle {
            shutdown,
            tcp_thread: Some(tcp_thread),
            udp_thread: Some(udp_thread),
        })
    }
}

struct Connection {
    stream: TcpStream,
    peer: String,
    /// Bytes read so far toward the 7-byte MBAP header.
    header_buf: Vec<u8>,
    /// Once the header is complete, the PDU bytes read so far and the
    /// target length.
    pdu_buf: Vec<u8>,
    pdu_len: Option<usize>,
    header: Option<MbapHeader>,
}

impl Connection {
    fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            header_buf: Vec::with_capacity(MbapHeader::SIZE),
            pdu_buf: Vec::new(),
            pdu_len: None,
            header: None,
        }
    }

    /// Read whatever is currently available (non-blocking) and, if a full
    /// request has accumulated, dispatch it and write the reply. Returns
    /// `false` if the connection should be closed.
    fn service(&mut self, dispatcher: &Dispatcher, delay: Duration) -> bool {
        loop {
            if self.header.is_none() {
                let mut byte = [0u8; 1];
                match self.stream.read(&mut byte) {
                    Ok(0) => return false,
                    Ok(_) => {
                        self.header_buf.push(byte[0]);
                        if self.header_buf.len() == MbapHeader::SIZE {
                            match MbapHeader::from_bytes(&self.header_buf) {
                                Ok(header) => {
                                    let pdu_len = header.length.saturating_sub(1) as usize;
                                    if pdu_len == 0 || pdu_len > MAX_PDU_LEN {
                                        warn!(peer = %self.peer, pdu_len, "mbap length out of range");
                                        return false;
                                    }
                                    self.pdu_len = Some(pdu_len);
                                    self.header = Some(header);
                                    self.header_buf.clear();
                                }
                                Err(e) => {
                                    warn!(peer = %self.peer, %e, "malformed mbap header");
                                    return false;
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        debug!(peer = %self.peer, %e, "tcp read failed");
                        return false;
                    }
                }
            } else {
                let target = self.pdu_len.unwrap();
                let mut chunk = vec![0u8; target - self.pdu_buf.len()];
                match self.stream.read(&mut chunk) {
                    Ok(0) => return false,
                    Ok(n) => {
                        self.pdu_buf.extend_from_slice(&chunk[..n]);
                        if self.pdu_buf.len() == target {
                            let header = self.header.take().unwrap();
                            self.pdu_len = None;
                            let pdu = std::mem::take(&mut self.pdu_buf);
                            if !self.respond(&header, &pdu, dispatcher, delay) {
                                return false;
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        debug!(peer = %self.peer, %e, "tcp read failed");
                        return false;
                    }
                }
            }
        }
    }

    fn respond(&mut self, header: &MbapHeader, pdu: &[u8], dispatcher: &Dispatcher, delay: Duration) -> bool {
        let reply_pdu = dispatcher.dispatch(pdu);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let reply_header = header.reply(reply_pdu.len() as u16);
        let mut frame = Vec::with_capacity(MbapHeader::SIZE + reply_pdu.len());
        frame.extend_from_slice(&reply_header.to_bytes());
        frame.extend_from_slice(&reply_pdu);

        if let Err(e) = self.stream.write_all(&frame) {
            debug!(peer = %self.peer, %e, "failed to write tcp reply");
            return false;
        }
        true
    }
}

/// Single-threaded readiness multiplexer: the listening socket and every
/// accepted connection share one `poll` call with a 1-second timeout
/// (§4.6, §5). A read failure on a connected socket closes and drops it
/// from the set.
fn tcp_multiplex_loop(
    listener: TcpListener,
    dispatcher: &Dispatcher,
    shutdown: &AtomicBool,
    max_connections: usize,
    delay: Duration,
) {
    let mut connections: HashMap<RawFd, Connection> = HashMap::new();

    while !shutdown.load(Ordering::SeqCst) {
        let mut fds: Vec<PollFd> = Vec::with_capacity(1 + connections.len());
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        let conn_fds: Vec<RawFd> = connections.keys().copied().collect();
        for &fd in &conn_fds {
            let borrowed = connections[&fd].stream.as_fd();
            fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
        }

        let ready = match poll(&mut fds, POLL_TIMEOUT) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(%e, "tcp poll failed");
                thread::sleep(Duration::from_millis(200));
                continue;
            }
        };
        if ready == 0 {
            continue;
        }

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            accept_pending(&listener, &mut connections, max_connections);
        }

        for (i, &fd) in conn_fds.iter().enumerate() {
            let revents = fds[i + 1].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                let keep = connections.get_mut(&fd).is_some_and(|c| c.service(dispatcher, delay));
                if !keep {
                    if let Some(c) = connections.remove(&fd) {
                        let _ = c.stream.shutdown(Shutdown::Both);
                        debug!(peer = %c.peer, "closed tcp connection");
                    }
                }
            }
        }
    }
}

fn accept_pending(listener: &TcpListener, connections: &mut HashMap<RawFd, Connection>, max_connections: usize) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.len() >= max_connections {
                    debug!(%peer, max_connections, "rejecting tcp connection, at capacity");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(%peer, %e, "failed to set tcp stream nonblocking");
                    continue;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%peer, %e, "failed to set tcp nodelay");
                }
                let fd = stream.as_raw_fd();
                connections.insert(fd, Connection::new(stream, peer.to_string()));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                error!(%e, "tcp accept failed");
                return;
            }
        }
    }
}

fn udp_loop(socket: &UdpSocket, dispatcher: &Dispatcher, shutdown: &AtomicBool, delay: Duration) {
    let mut buf = [0u8; 260];
    while !shutdown.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                if n < MbapHeader::SIZE {
                    debug!(%peer, n, "short udp datagram, ignoring");
                    continue;
                }
                let header = match MbapHeader::from_bytes(&buf[..MbapHeader::SIZE]) {
                    Ok(h) => h,
                    Err(e) => {
                        debug!(%peer, %e, "malformed udp mbap header, ignoring");
                        continue;
                    }
                };
                let pdu = &buf[MbapHeader::SIZE..n];

                let reply_pdu = dispatcher.dispatch(pdu);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }

                let reply_header = header.reply(reply_pdu.len() as u16);
                let mut frame = Vec::with_capacity(MbapHeader::SIZE + reply_pdu.len());
                frame.extend_from_slice(&reply_header.to_bytes());
                frame.extend_from_slice(&reply_pdu);

                if let Err(e) = socket.send_to(&frame, peer) {
                    warn!(%peer, %e, "failed to send udp reply");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                error!(%e, "udp recv failed");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banks::GatewayBanks;
    use crate::watchdog_bank::WatchdogBank;
    use gw_common::RuntimeState;
    use gw_runtime::CycleControl;
    use std::net::TcpStream as ClientStream;

    struct AlwaysRunning;
    impl CycleControl for AlwaysRunning {
        fn force_update(&self) {}
        fn runtime_state(&self) -> RuntimeState {
            RuntimeState::Running
        }
        fn get_error(&self) -> i32 {
            0
        }
    }

    fn build_dispatcher() -> Arc<Dispatcher> {
        let banks = Arc::new(GatewayBanks::new("0.1.0"));
        let watchdog = Arc::new(WatchdogBank::new({
            let banks = Arc::clone(&banks);
            move || banks.zero_outputs()
        }));
        Arc::new(Dispatcher::new(banks, watchdog, Arc::new(AlwaysRunning)))
    }

    #[test]
    fn test_tcp_multiplexer_round_trip_read_input_register() {
        let dispatcher = build_dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_dispatcher = Arc::clone(&dispatcher);
        let server_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            tcp_multiplex_loop(listener, &server_dispatcher, &server_shutdown, 5, Duration::ZERO);
        });

        let mut client = ClientStream::connect(addr).unwrap();
        let header = MbapHeader {
            transaction_id: 7,
            protocol_id: 0,
            length: 6,
            unit_id: 1,
        };
        let mut request = header.to_bytes().to_vec();
        request.extend_from_slice(&[0x04, 0x00, 0x00, 0x00, 0x01]); // FC 0x04 addr 0 qty 1
        client.write_all(&request).unwrap();

        let mut reply_header = [0u8; MbapHeader::SIZE];
        client.read_exact(&mut reply_header).unwrap();
        let parsed = MbapHeader::from_bytes(&reply_header).unwrap();
        assert_eq!(parsed.transaction_id, 7);

        let mut reply_pdu = vec![0u8; parsed.length as usize - 1];
        client.read_exact(&mut reply_pdu).unwrap();
        assert_eq!(reply_pdu, vec![0x04, 0x02, 0x00, 0x00]);

        drop(client);
        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.join();
    }

    #[test]
    fn test_tcp_multiplexer_rejects_past_capacity() {
        let dispatcher = build_dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let server_dispatcher = Arc::clone(&dispatcher);
        let server_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            tcp_multiplex_loop(listener, &server_dispatcher, &server_shutdown, 1, Duration::ZERO);
        });

        let _first = ClientStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(150));
        let mut second = ClientStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut probe = [0u8; 1];
        let result = second.read(&mut probe);
        // The rejected connection is closed by the server before it ever
        // answers a request: either an immediate EOF or a reset.
        assert!(matches!(result, Ok(0)) || result.is_err());

        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.join();
    }
}
