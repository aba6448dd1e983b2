//! Coordinator discovery over UDP broadcast
//!
//! The coordinator announces `"<ip>:<port>"` of its task listener every few
//! seconds while it is discoverable. A worker that needs a coordinator binds the
//! discovery port, takes the first well-formed announcement and stops listening.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest datagram a listener will read
const MAX_DATAGRAM: usize = 512;

/// Format an announcement body
pub fn announcement(advertised: &SocketAddr) -> String {
    format!("{}:{}", advertised.ip(), advertised.port())
}

/// Parse an announcement body into the coordinator's task address
pub fn parse_announcement(body: &[u8]) -> Result<SocketAddr> {
    let text = std::str::from_utf8(body).context("Announcement is not UTF-8")?;
    text.trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid announcement: {:?}", text))
}

/// Best-effort address of this host on the default route
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface. Falls back to loopback when there is no route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Announcer settings
#[derive(Debug, Clone)]
pub struct AnnounceSettings {
    /// Address workers should connect to
    pub advertised: SocketAddr,
    /// Broadcast address and discovery port
    pub target: SocketAddr,
    /// Delay between announcements
    pub interval: Duration,
}

/// Periodic announcer running on its own task
///
/// Announcements are only sent while the discoverable flag is set. Clearing the
/// flag pauses announcing without stopping the task.
pub struct Announcer {
    discoverable: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Announcer {
    /// Bind a broadcast socket and start announcing
    pub async fn spawn(settings: AnnounceSettings) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind discovery socket")?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on discovery socket")?;

        let discoverable = Arc::new(AtomicBool::new(true));
        let flag = discoverable.clone();
        let body = announcement(&settings.advertised);

        info!(
            "Announcing {} to {} every {:?}",
            body, settings.target, settings.interval
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.interval);
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::Relaxed) {
                    continue;
                }
                match socket.send_to(body.as_bytes(), settings.target).await {
                    Ok(_) => debug!("Announced {} to {}", body, settings.target),
                    Err(e) => warn!("Discovery announcement to {} failed: {}", settings.target, e),
                }
            }
        });

        Ok(Self { discoverable, task })
    }

    pub fn set_discoverable(&self, discoverable: bool) {
        self.discoverable.store(discoverable, Ordering::Relaxed);
    }

    pub fn is_discoverable(&self) -> bool {
        self.discoverable.load(Ordering::Relaxed)
    }

    /// Stop the announcer task for good
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One-shot listener for coordinator announcements
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind discovery listener on {}", addr))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Block until one well-formed announcement arrives
    ///
    /// Malformed datagrams are logged and skipped.
    pub async fn recv_announcement(&self) -> Result<SocketAddr> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("Failed to receive discovery datagram")?;
            match parse_announcement(&buf[..n]) {
                Ok(addr) => {
                    debug!("Announcement from {}: {}", from, addr);
                    return Ok(addr);
                }
                Err(e) => warn!("Ignoring datagram from {}: {:#}", from, e),
            }
        }
    }
}

/// Bind the discovery port, wait for one announcement, and release the port
pub async fn discover_coordinator(port: u16) -> Result<SocketAddr> {
    let listener = DiscoveryListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    listener.recv_announcement().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_format() {
        let addr: SocketAddr = "192.168.1.20:5000".parse().unwrap();
        assert_eq!(announcement(&addr), "192.168.1.20:5000");
        assert_eq!(parse_announcement(b"192.168.1.20:5000").unwrap(), addr);
        assert_eq!(parse_announcement(b"192.168.1.20:5000\n").unwrap(), addr);
    }

    #[test]
    fn test_parse_announcement_rejects_garbage() {
        assert!(parse_announcement(b"hello").is_err());
        assert!(parse_announcement(b"10.0.0.1").is_err());
        assert!(parse_announcement(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_listener_receives_announcement() {
        let listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = listener.local_addr().unwrap();
        let advertised: SocketAddr = "10.1.2.3:5000".parse().unwrap();

        let announcer = Announcer::spawn(AnnounceSettings {
            advertised,
            target,
            interval: Duration::from_millis(20),
        })
        .await
        .unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), listener.recv_announcement())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, advertised);
        announcer.stop();
    }

    #[tokio::test]
    async fn test_listener_skips_malformed_datagrams() {
        let listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not an address", target).await.unwrap();
        sender.send_to(b"127.0.0.1:6000", target).await.unwrap();

        let found = listener.recv_announcement().await.unwrap();
        assert_eq!(found, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_not_discoverable_sends_nothing() {
        let listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = listener.local_addr().unwrap();

        let announcer = Announcer::spawn(AnnounceSettings {
            advertised: "10.1.2.3:5000".parse().unwrap(),
            target,
            interval: Duration::from_millis(10),
        })
        .await
        .unwrap();
        announcer.set_discoverable(false);
        assert!(!announcer.is_discoverable());

        // The first tick fires immediately; drain anything sent before the flag flipped
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut buf = [0u8; MAX_DATAGRAM];
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(30), listener.socket.recv_from(&mut buf)).await
        {}

        let quiet = tokio::time::timeout(Duration::from_millis(100), listener.recv_announcement()).await;
        assert!(quiet.is_err(), "announcer kept sending while not discoverable");
        announcer.stop();
    }
}
