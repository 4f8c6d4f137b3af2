//! Fragment delivery to a gateway on the local network, one datagram per
//! fragment.
//!
//! A full socket buffer answers `Unavailable` and arms a single retry that
//! wakes the worker after [`RETRY_AFTER`]. A gateway off every subnet needs
//! no retry: the interface coming up wakes the worker itself.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use succinct_core::config::TransportConfig;
use succinct_services::{Fragment, LivenessTracker, SendStatus, Transport, Waker};

pub const RETRY_AFTER: Duration = Duration::from_millis(250);

pub struct UdpGateway {
    name: String,
    target: SocketAddr,
    mtu: u32,
    tracker: Arc<LivenessTracker>,
    waker: Waker,
    retry_armed: Arc<AtomicBool>,
    socket: Option<UdpSocket>,
}

impl UdpGateway {
    pub fn new(target: SocketAddr, mtu: u32, tracker: Arc<LivenessTracker>, waker: Waker) -> Self {
        Self {
            name: format!("udp:{target}"),
            target,
            mtu,
            tracker,
            waker,
            retry_armed: Arc::default(),
            socket: None,
        }
    }

    pub fn from_config(
        config: &TransportConfig,
        tracker: Arc<LivenessTracker>,
        waker: Waker,
    ) -> Result<Self> {
        match config {
            TransportConfig::Udp { target, mtu } => {
                let target: SocketAddr = target
                    .parse()
                    .with_context(|| format!("invalid UDP transport target {target:?}"))?;
                Ok(Self::new(target, *mtu, tracker, waker))
            }
        }
    }

    /// Wake the worker once the send buffer had time to drain. At most one
    /// retry is outstanding.
    fn arm_retry(&self) {
        if self.retry_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.retry_armed.store(false, Ordering::Release);
            return;
        };
        let waker = self.waker.clone();
        let armed = self.retry_armed.clone();
        runtime.spawn(async move {
            tokio::time::sleep(RETRY_AFTER).await;
            armed.store(false, Ordering::Release);
            waker.wake();
        });
    }

    fn reachable(&self) -> bool {
        match self.target.ip() {
            IpAddr::V4(ip) if ip.is_loopback() => true,
            IpAddr::V4(ip) => self.tracker.interface_for(&ip).is_some(),
            IpAddr::V6(ip) => ip.is_loopback(),
        }
    }

    fn socket(&mut self) -> std::io::Result<&UdpSocket> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
            socket.set_nonblocking(true)?;
            self.socket = Some(socket);
        }
        match &self.socket {
            Some(socket) => Ok(socket),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }
}

impl Transport for UdpGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn check_available(&mut self) -> SendStatus {
        if self.reachable() {
            SendStatus::Success
        } else {
            SendStatus::Unavailable
        }
    }

    fn try_send(&mut self, fragment: &Fragment) -> SendStatus {
        let target = self.target;
        let result = self
            .socket()
            .and_then(|socket| socket.send_to(&fragment.bytes, target));
        match result {
            Ok(_) => SendStatus::Success,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(transport = %self.name, "send buffer full; retry armed");
                self.arm_retry();
                SendStatus::Unavailable
            }
            Err(e) => {
                self.socket = None;
                SendStatus::Failed(e.to_string())
            }
        }
    }

    fn done(&mut self) {
        self.socket = None;
    }
}
