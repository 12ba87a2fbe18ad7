//! Single-threaded poll reactor.
//!
//! Owns every socket and timer of the daemon and drives the protocol state
//! machine: bytes and connection events go in, [`Io`] instructions come
//! back out. Peer failures never leave this loop; the only exits are a
//! bind error at startup and the machine's own shutdown event.
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;
use log::*;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use finney_common::bitcoin::network::message::RawNetworkMessage;
use finney_common::block::store::ChainStore;
use finney_common::p2p::peer::Store;
use finney_net::time::{Clock, LocalTime, RefClock};
use finney_net::{Disconnect, Io, Link, StateMachine as _};
use finney_p2p::fsm::wire::{self, StreamDecoder};
use finney_p2p::fsm::{Command, DisconnectReason, Event, StateMachine};

/// Token of the admin listener.
const ADMIN: Token = Token(0);
/// First token handed out to sockets.
const FIRST_TOKEN: usize = 1;
/// Size of the socket read chunk.
const READ_BUFFER_SIZE: usize = 4096;
/// Poll timeout when no timer is armed.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Admin payload that stops the node.
const KILL_COMMAND: &[u8] = b"KILL";

/// A message queued for writing. The buffer lives here, not with the
/// socket registration, so a peer replacement can never free bytes that a
/// write still references.
struct PendingWrite {
    buf: Vec<u8>,
    offset: usize,
    message: RawNetworkMessage,
}

/// A peer socket and its stream state.
struct Session {
    stream: TcpStream,
    addr: net::SocketAddr,
    decoder: StreamDecoder,
    queue: VecDeque<PendingWrite>,
    /// Whether the TCP connect has completed.
    connected: bool,
}

/// The poll reactor driving a protocol state machine.
pub struct Reactor<T, P> {
    poll: Poll,
    machine: StateMachine<T, P, RefClock>,
    clock: RefClock,
    magic: u32,
    peers: HashMap<Token, Session>,
    tokens: HashMap<net::SocketAddr, Token>,
    admin: TcpListener,
    admin_conns: HashMap<Token, TcpStream>,
    commands: chan::Receiver<Command>,
    timers: Vec<LocalTime>,
    next_token: usize,
    shutdown: bool,
}

impl<T: ChainStore, P: Store> Reactor<T, P> {
    /// Create a reactor, binding the admin listener.
    pub fn new(
        machine: StateMachine<T, P, RefClock>,
        clock: RefClock,
        magic: u32,
        commands: chan::Receiver<Command>,
        admin_addr: net::SocketAddr,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut admin = TcpListener::bind(admin_addr)?;

        poll.registry()
            .register(&mut admin, ADMIN, Interest::READABLE)?;

        Ok(Self {
            poll,
            machine,
            clock,
            magic,
            peers: HashMap::new(),
            tokens: HashMap::new(),
            admin,
            admin_conns: HashMap::new(),
            commands,
            timers: Vec::new(),
            next_token: FIRST_TOKEN,
            shutdown: false,
        })
    }

    /// Run the event loop until the machine shuts down.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);

        self.machine.initialize(LocalTime::now());
        self.process_outputs();

        while !self.shutdown {
            let timeout = self.poll_timeout();

            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let now = LocalTime::now();
            self.machine.tick(now);

            for event in events.iter() {
                match event.token() {
                    ADMIN => self.accept_admin(),
                    token if self.admin_conns.contains_key(&token) => {
                        self.admin_command(token);
                    }
                    token => {
                        if event.is_writable() {
                            self.peer_writable(token);
                        }
                        if event.is_readable() || event.is_read_closed() {
                            self.peer_readable(token);
                        }
                    }
                }
            }
            if self.timers.iter().any(|t| *t <= now) {
                self.timers.retain(|t| *t > now);
                self.machine.timer_expired();
            }
            for command in self.commands.try_iter().collect::<Vec<_>>() {
                self.machine.command(command);
            }
            self.process_outputs();
        }
        info!(target: "node", "Event loop stopped");

        Ok(())
    }

    /// Time until the nearest timer deadline, capped so command and admin
    /// handling stays responsive.
    fn poll_timeout(&self) -> Duration {
        let now = self.clock.local_time();

        self.timers
            .iter()
            .min()
            .map(|deadline| Duration::from(*deadline - now).min(DEFAULT_TIMEOUT))
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Drain the machine's pending outputs.
    fn process_outputs(&mut self) {
        while let Some(output) = self.machine.next() {
            match output {
                Io::Write(addr, message) => self.write(addr, message),
                Io::Connect(addr) => self.dial(addr),
                Io::Disconnect(addr, reason) => {
                    debug!(target: "node", "{}: Disconnecting: {}", addr, reason);
                    self.close_peer(addr, Disconnect::StateMachine(reason));
                }
                Io::SetTimer(duration) => {
                    self.timers.push(self.clock.local_time() + duration);
                }
                Io::Event(Event::ShuttingDown) => {
                    self.shutdown = true;
                }
                Io::Event(event) => {
                    trace!(target: "node", "{}", event);
                }
            }
        }
    }

    /// Start an asynchronous connect to a peer.
    fn dial(&mut self, addr: net::SocketAddr) {
        self.machine.attempted(&addr);

        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = Token(self.next_token);
                self.next_token += 1;

                if let Err(err) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    self.machine
                        .disconnected(&addr, Disconnect::DialError(Arc::new(err)));
                    return;
                }
                debug!(target: "node", "{}: Dialing..", addr);

                self.tokens.insert(addr, token);
                self.peers.insert(
                    token,
                    Session {
                        stream,
                        addr,
                        decoder: StreamDecoder::new(self.magic),
                        queue: VecDeque::new(),
                        connected: false,
                    },
                );
            }
            Err(err) => {
                self.machine
                    .disconnected(&addr, Disconnect::DialError(Arc::new(err)));
            }
        }
    }

    /// Queue a message for a peer and flush if the socket is up.
    fn write(&mut self, addr: net::SocketAddr, message: RawNetworkMessage) {
        let token = match self.tokens.get(&addr) {
            Some(token) => *token,
            None => {
                debug!(target: "node", "{}: Dropping `{}` for unknown peer", addr, message.cmd());
                return;
            }
        };
        let connected = match self.peers.get_mut(&token) {
            Some(session) => {
                let buf = wire::serialize(&message);

                session.queue.push_back(PendingWrite {
                    buf,
                    offset: 0,
                    message,
                });
                session.connected
            }
            None => return,
        };
        if connected {
            self.flush(token);
        }
    }

    /// Write out as much of the peer's queue as the socket accepts. Each
    /// completed message triggers the machine's post-send hook.
    fn flush(&mut self, token: Token) {
        let mut completed = Vec::new();
        let addr;

        {
            let session = match self.peers.get_mut(&token) {
                Some(session) => session,
                None => return,
            };
            addr = session.addr;

            while let Some(front) = session.queue.front_mut() {
                match session.stream.write(&front.buf[front.offset..]) {
                    Ok(n) => {
                        front.offset += n;

                        if front.offset >= front.buf.len() {
                            let done = session.queue.pop_front().expect("the front exists");
                            completed.push(done.message);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        // Write failures don't close the peer; the liveness
                        // sweep or a read error will.
                        warn!(target: "node", "{}: Write error: {}", addr, err);
                        break;
                    }
                }
            }
            let interest = if session.queue.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if let Err(err) = self
                .poll
                .registry()
                .reregister(&mut session.stream, token, interest)
            {
                warn!(target: "node", "{}: Couldn't update socket registration: {}", addr, err);
            }
        }
        for message in completed {
            self.machine.message_sent(&addr, &message);
        }
    }

    /// Writable readiness: either the pending connect resolved, or queued
    /// bytes can move.
    fn peer_writable(&mut self, token: Token) {
        enum Readiness {
            AlreadyUp,
            JustConnected(net::SocketAddr),
            Failed(io::Error, bool),
            Pending,
        }

        let (addr, readiness) = {
            let session = match self.peers.get_mut(&token) {
                Some(session) => session,
                None => return,
            };
            let readiness = if session.connected {
                Readiness::AlreadyUp
            } else {
                match session.stream.take_error() {
                    Ok(Some(err)) | Err(err) => Readiness::Failed(err, session.connected),
                    Ok(None) => match session.stream.peer_addr() {
                        Ok(_) => {
                            session.connected = true;

                            let local = session
                                .stream
                                .local_addr()
                                .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());

                            Readiness::JustConnected(local)
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                            Readiness::Pending
                        }
                        Err(err) => Readiness::Failed(err, session.connected),
                    },
                }
            };
            (session.addr, readiness)
        };

        match readiness {
            Readiness::JustConnected(local) => {
                debug!(target: "node", "{}: Connected", addr);

                self.machine.connected(addr, &local, Link::Outbound);
                self.flush(token);
            }
            Readiness::AlreadyUp => self.flush(token),
            Readiness::Failed(err, was_connected) => {
                let reason = if was_connected {
                    Disconnect::ConnectionError(Arc::new(err))
                } else {
                    Disconnect::DialError(Arc::new(err))
                };
                self.close_peer(addr, reason);
            }
            Readiness::Pending => {}
        }
    }

    /// Readable readiness: pull bytes, extract frames, dispatch messages.
    fn peer_readable(&mut self, token: Token) {
        let mut received = Vec::new();
        let mut closed: Option<Disconnect<DisconnectReason>> = None;
        let addr;

        {
            let session = match self.peers.get_mut(&token) {
                Some(session) => session,
                None => return,
            };
            addr = session.addr;

            let mut buf = [0u8; READ_BUFFER_SIZE];

            'read: loop {
                match session.stream.read(&mut buf) {
                    Ok(0) => {
                        closed = Some(Disconnect::ConnectionError(Arc::new(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        ))));
                        break;
                    }
                    Ok(n) => {
                        if let Err(err) = session.decoder.input(&buf[..n]) {
                            warn!(target: "node", "{}: {}", addr, err);

                            closed = Some(Disconnect::ConnectionError(Arc::new(io::Error::new(
                                io::ErrorKind::InvalidData,
                                err.to_string(),
                            ))));
                            break;
                        }
                        loop {
                            match session.decoder.decode_next() {
                                Ok(Some(message)) => received.push(message),
                                Ok(None) => break,
                                Err(err) if err.is_fatal() => {
                                    warn!(target: "node", "{}: {}", addr, err);

                                    closed =
                                        Some(Disconnect::ConnectionError(Arc::new(io::Error::new(
                                            io::ErrorKind::InvalidData,
                                            err.to_string(),
                                        ))));
                                    break 'read;
                                }
                                Err(err) => {
                                    // The frame was dropped; the stream
                                    // remains usable.
                                    warn!(target: "node", "{}: Dropping frame: {}", addr, err);
                                }
                            }
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        closed = Some(Disconnect::ConnectionError(Arc::new(err)));
                        break;
                    }
                }
            }
        }
        for message in received {
            self.machine.message_received(&addr, Cow::Owned(message));
        }
        if let Some(reason) = closed {
            self.close_peer(addr, reason);
        }
    }

    /// Tear down a peer socket and report the close completion. Dropping
    /// the session drops its write queue with it.
    fn close_peer(&mut self, addr: net::SocketAddr, reason: Disconnect<DisconnectReason>) {
        if let Some(token) = self.tokens.remove(&addr) {
            if let Some(mut session) = self.peers.remove(&token) {
                if let Err(err) = self.poll.registry().deregister(&mut session.stream) {
                    warn!(target: "node", "{}: Couldn't deregister socket: {}", addr, err);
                }
            }
            self.machine.disconnected(&addr, reason);
        }
    }

    /// Accept pending admin connections.
    fn accept_admin(&mut self) {
        loop {
            match self.admin.accept() {
                Ok((mut stream, from)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    debug!(target: "node", "Admin connection from {}", from);

                    if self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .is_ok()
                    {
                        self.admin_conns.insert(token, stream);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(target: "node", "Admin accept error: {}", err);
                    break;
                }
            }
        }
    }

    /// Read one segment from an admin connection; `KILL` stops the loop.
    fn admin_command(&mut self, token: Token) {
        let mut stream = match self.admin_conns.remove(&token) {
            Some(stream) => stream,
            None => return,
        };
        if let Err(err) = self.poll.registry().deregister(&mut stream) {
            warn!(target: "node", "Couldn't deregister admin connection: {}", err);
        }

        let mut buf = [0u8; 64];

        match stream.read(&mut buf) {
            Ok(n) if buf[..n].starts_with(KILL_COMMAND) => {
                info!(target: "node", "Received `KILL` on the admin port");
                self.machine.command(Command::Shutdown);
            }
            Ok(_) => debug!(target: "node", "Ignoring unknown admin command"),
            Err(err) => debug!(target: "node", "Admin read error: {}", err),
        }
    }
}
