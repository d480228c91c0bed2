use crate::pipeline::wire;
use anyhow::{Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Write-only datagram destination. Shared read-only between threads.
pub trait DatagramSink: Send + Sync {
    fn send(&self, datagram: &[u8]) -> Result<()>;
}

/// Fire-and-forget UDP sender bound to an ephemeral local port.
pub struct UdpSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSender {
    pub fn new(target: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr)
            .with_context(|| format!("Failed to bind UDP socket for {}", target))?;
        Ok(Self { socket, target })
    }
}

impl DatagramSink for UdpSender {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket
            .send_to(datagram, self.target)
            .with_context(|| format!("Failed to send {} bytes to {}", datagram.len(), self.target))?;
        Ok(())
    }
}

/// Pause inserted between full fragments so a large packet is not sent as one burst.
#[derive(Debug, Clone, Copy)]
pub struct FragmentPacing {
    /// Pause after every `every` fragments; 0 disables pacing.
    pub every: usize,
    pub pause: Duration,
}

impl Default for FragmentPacing {
    fn default() -> Self {
        Self {
            every: 4,
            pause: Duration::from_millis(1),
        }
    }
}

impl FragmentPacing {
    pub fn disabled() -> Self {
        Self {
            every: 0,
            pause: Duration::ZERO,
        }
    }

    fn should_pause(&self, index: usize, is_last: bool) -> bool {
        self.every > 0 && !self.pause.is_zero() && !is_last && index % self.every == 0
    }
}

/// Fragments `data` and sends every fragment in index order.
/// Returns the number of datagrams sent; stops at the first send failure.
pub fn send_fragmented(sink: &dyn DatagramSink, data: &[u8], pacing: FragmentPacing) -> Result<usize> {
    let frags = wire::fragments(data);
    let total = frags.len();
    let mut sent = 0;
    for (index, datagram) in frags.enumerate() {
        sink.send(&datagram)
            .with_context(|| format!("Fragment {}/{} not sent", index, total))?;
        sent += 1;
        if pacing.should_pause(index, index + 1 == total) {
            std::thread::sleep(pacing.pause);
        }
    }
    Ok(sent)
}
