//! UDP "air": a broadcast datagram socket standing in for the radio medium.
//! Every packet is sent to all configured destinations; every datagram heard
//! is one packet. Our own broadcasts come back to us and are filtered out by
//! source address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use loralink_core::transport::check_packet_size;
use loralink_core::{Transport, TransportError};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RECV_BUF: usize = 512;
const QUEUE_DEPTH: usize = 64;

pub struct UdpAir {
    socket: Arc<UdpSocket>,
    destinations: Vec<SocketAddr>,
    rx: mpsc::Receiver<Vec<u8>>,
    peeked: Option<Vec<u8>>,
    recv_task: JoinHandle<()>,
}

impl UdpAir {
    /// Bind `local` with broadcast enabled and start the receive task.
    /// Must be called inside a tokio runtime.
    pub async fn bind(local: SocketAddr, destinations: Vec<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        let own = own_addresses(local, &destinations);
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let recv_task = tokio::spawn(recv_loop(socket.clone(), local, own, tx));
        tracing::info!(%local, destinations = ?destinations, "air socket up");
        Ok(Self {
            socket,
            destinations,
            rx,
            peeked: None,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpAir {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        check_packet_size(packet)?;
        let mut delivered = false;
        let mut last_err = None;
        for dest in &self.destinations {
            match self.socket.try_send_to(packet, *dest) {
                Ok(_) => delivered = true,
                Err(e) => {
                    tracing::debug!(%dest, "send failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        if delivered {
            return Ok(());
        }
        match last_err {
            Some(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Busy),
            Some(e) => Err(TransportError::Io(e)),
            None => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no air destinations configured",
            ))),
        }
    }

    fn has_data(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.rx.try_recv().ok();
        }
        self.peeked.is_some()
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.peeked.take().or_else(|| self.rx.try_recv().ok())
    }
}

impl Drop for UdpAir {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Addresses our own broadcasts can arrive from: the bound address, loopback,
/// and the interface address the kernel routes each destination through.
fn own_addresses(local: SocketAddr, destinations: &[SocketAddr]) -> Vec<IpAddr> {
    let mut own = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];
    if !local.ip().is_unspecified() {
        own.push(local.ip());
    }
    for dest in destinations {
        match route_source(*dest) {
            Ok(ip) if !ip.is_unspecified() && !own.contains(&ip) => own.push(ip),
            Ok(_) => {}
            Err(e) => tracing::debug!(%dest, "no route source: {}", e),
        }
    }
    own
}

/// Connecting a UDP socket sends nothing; it only selects the outgoing interface.
fn route_source(dest: SocketAddr) -> io::Result<IpAddr> {
    let any: SocketAddr = match dest {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = std::net::UdpSocket::bind(any)?;
    socket.set_broadcast(true)?;
    socket.connect(dest)?;
    Ok(socket.local_addr()?.ip())
}

fn is_own_echo(from: SocketAddr, local: SocketAddr, own: &[IpAddr]) -> bool {
    from == local || (from.port() == local.port() && own.contains(&from.ip()))
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    own: Vec<IpAddr>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = [0u8; RECV_BUF];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("air receive failed: {}", e);
                continue;
            }
        };
        if n == 0 || is_own_echo(from, local, &own) {
            continue;
        }
        tracing::trace!(%from, len = n, "datagram");
        match tx.try_send(buf[..n].to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%from, "receive queue full, datagram dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}
