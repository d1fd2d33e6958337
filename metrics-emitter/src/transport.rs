use std::{
    io::{self, Read as _, Write as _},
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs as _, UdpSocket},
    thread,
    time::Duration,
};

use tracing::{debug, trace};

use crate::{forwarder::RemoteAddr, state::CloseNotifier, writer::Protocol};

/// An open connection to the collector.
pub trait Transport: Send {
    /// Writes a single payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be written in full, an error is returned. For stream transports this means the
    /// connection is considered lost and will be reopened; the payload is written again on the new connection.
    fn write(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Closes the transport.
    fn close(&mut self);
}

/// Opens transports to the collector.
pub trait Connector: Send {
    /// Opens a new transport.
    ///
    /// If the remote end closes a stream transport on its own, the implementation should call
    /// [`CloseNotifier::notify`] so that the connection is reopened.
    ///
    /// # Errors
    ///
    /// If the transport could not be opened, an error is returned and another attempt is scheduled according to the
    /// retry policy.
    fn connect(&mut self, closed: CloseNotifier) -> io::Result<Box<dyn Transport>>;
}

enum Client {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Transport for Client {
    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Client::Tcp(stream) => stream.write_all(payload),
            Client::Udp(socket) => {
                let sent = socket.send(payload)?;
                if sent < payload.len() {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"));
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if let Client::Tcp(stream) = self {
            // Also unblocks the watcher thread, whose notification is stale by now.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Opens TCP or UDP sockets to the collector, depending on the protocol.
pub struct SocketConnector {
    remote_addr: RemoteAddr,
    protocol: Protocol,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl SocketConnector {
    pub(crate) fn new(
        remote_addr: RemoteAddr,
        protocol: Protocol,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        SocketConnector { remote_addr, protocol, connect_timeout, write_timeout }
    }

    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        // Resolved on every attempt, so that a collector moving to a new address is picked up on reconnect.
        let addrs = (self.remote_addr.host(), self.remote_addr.port()).to_socket_addrs()?.collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for '{}'", self.remote_addr),
            ));
        }
        Ok(addrs)
    }

    fn connect_tcp(&self, addrs: &[SocketAddr], closed: CloseNotifier) -> io::Result<Client> {
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    stream.set_nodelay(true)?;
                    spawn_watcher(stream.try_clone()?, closed)?;
                    return Ok(Client::Tcp(stream));
                }
                Err(e) => {
                    trace!(%addr, error = %e, "Failed to connect to address.");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to")))
    }

    fn connect_udp(&self, addrs: &[SocketAddr]) -> io::Result<Client> {
        let local: SocketAddr = match addrs[0] {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local)?;
        socket.connect(addrs)?;
        socket.set_write_timeout(Some(self.write_timeout))?;
        Ok(Client::Udp(socket))
    }
}

impl Connector for SocketConnector {
    fn connect(&mut self, closed: CloseNotifier) -> io::Result<Box<dyn Transport>> {
        let addrs = self.resolve()?;
        let client = if self.protocol.is_connectionless() {
            self.connect_udp(&addrs)?
        } else {
            self.connect_tcp(&addrs, closed)?
        };

        debug!(remote_addr = %self.remote_addr, protocol = %self.protocol, "Opened transport.");
        Ok(Box::new(client))
    }
}

// The collector never sends anything back, so a read only ever returns once the connection is gone.
fn spawn_watcher(mut stream: TcpStream, closed: CloseNotifier) -> io::Result<()> {
    thread::Builder::new().name("metrics-emitter-watcher".to_string()).spawn(move || {
        let mut buf = [0; 512];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(error = %e, "Watcher read failed.");
                    break;
                }
            }
        }
        closed.notify();
    })?;
    Ok(())
}
