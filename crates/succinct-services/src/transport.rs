//! Transport capability interface and registry.
//!
//! A transport is anything that can carry one fragment at a time: the local
//! network gateway, an SMS modem, a satellite modem. Transports are plugged
//! in at startup; the registry fixes the MTU for its lifetime.

use std::fmt;
use std::sync::Arc;

use succinct_core::wire::MTU_GRANULARITY;

use crate::fragment_log::Fragment;
use crate::queue::QueueError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    /// Not ready yet; ask again later.
    Unavailable,
    /// Transport-specific failure.
    Failed(String),
}

/// Asks the queue worker for another send pass.
///
/// Handed to transports at construction. A transport that answered
/// `Unavailable` calls [`Waker::wake`] once it can carry fragments again.
#[derive(Clone)]
pub struct Waker(Arc<dyn Fn() + Send + Sync>);

impl Waker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    /// A waker that does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Waker")
    }
}

/// One delivery channel.
///
/// Calls may block for seconds (dialing a modem); they are only made from
/// the queue worker.
pub trait Transport: Send {
    fn name(&self) -> &str;

    /// Largest fragment this transport can carry.
    fn mtu(&self) -> u32;

    fn check_available(&mut self) -> SendStatus;

    fn try_send(&mut self, fragment: &Fragment) -> SendStatus;

    /// The log is drained; release held connections.
    fn done(&mut self);
}

/// Minimum MTU over `mtus`, rounded down to a multiple of 50.
pub fn negotiate_mtu(mtus: impl IntoIterator<Item = u32>) -> Result<u32, QueueError> {
    let min = mtus.into_iter().min().ok_or(QueueError::NoTransports)?;
    let mtu = min - min % MTU_GRANULARITY;
    if mtu < MTU_GRANULARITY {
        return Err(QueueError::MtuTooSmall(min));
    }
    Ok(mtu)
}

pub struct TransportRegistry {
    transports: Vec<Box<dyn Transport>>,
    mtu: u32,
}

impl TransportRegistry {
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Result<Self, QueueError> {
        let mtu = negotiate_mtu(transports.iter().map(|t| t.mtu()))?;
        tracing::info!(
            mtu,
            transports = ?transports.iter().map(|t| t.name().to_owned()).collect::<Vec<_>>(),
            "transport MTU negotiated"
        );
        Ok(Self { transports, mtu })
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Poll every transport; `Success` if any is ready, `Unavailable` if at
    /// least one might become ready, otherwise the last failure.
    pub fn check_available(&mut self) -> SendStatus {
        let mut status = SendStatus::Failed("no transports".into());
        for transport in &mut self.transports {
            match transport.check_available() {
                SendStatus::Success => return SendStatus::Success,
                SendStatus::Unavailable => status = SendStatus::Unavailable,
                SendStatus::Failed(reason) => {
                    tracing::warn!(transport = transport.name(), %reason, "transport check failed");
                    if status != SendStatus::Unavailable {
                        status = SendStatus::Failed(reason);
                    }
                }
            }
        }
        status
    }

    /// Offer `fragment` to each transport in registration order until one
    /// accepts it.
    pub fn try_send(&mut self, fragment: &Fragment) -> SendStatus {
        let mut status = SendStatus::Failed("no transports".into());
        for transport in &mut self.transports {
            match transport.try_send(fragment) {
                SendStatus::Success => {
                    tracing::debug!(transport = transport.name(), seq = fragment.seq, "fragment sent");
                    return SendStatus::Success;
                }
                SendStatus::Unavailable => status = SendStatus::Unavailable,
                SendStatus::Failed(reason) => {
                    tracing::warn!(transport = transport.name(), seq = fragment.seq, %reason, "send failed");
                    if status != SendStatus::Unavailable {
                        status = SendStatus::Failed(reason);
                    }
                }
            }
        }
        status
    }

    pub fn done(&mut self) {
        for transport in &mut self.transports {
            transport.done();
        }
    }
}
