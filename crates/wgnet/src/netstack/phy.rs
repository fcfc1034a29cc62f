use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use smoltcp::phy::{DeviceCapabilities, Medium, RxToken, TxToken};

/// IP-medium smoltcp device backed by two packet queues.
///
/// `received` is filled from the tunnel side and drained by smoltcp,
/// `sent` is filled by smoltcp and drained towards the tunnel.
#[derive(Debug)]
pub struct Phy {
    received: VecDeque<Bytes>,
    sent: VecDeque<Bytes>,
    mtu: usize,
}

pub struct Rx(Bytes);

pub struct Tx<'a>(&'a mut VecDeque<Bytes>);

impl Phy {
    pub fn new(mtu: u16) -> Self {
        Self {
            received: VecDeque::new(),
            sent: VecDeque::new(),
            mtu: mtu.into(),
        }
    }

    pub fn enqueue_received(&mut self, packet: Bytes) {
        if packet.len() > self.mtu {
            tracing::trace!(len = packet.len(), mtu = self.mtu, "dropping oversized packet");
            return;
        }
        self.received.push_back(packet);
    }

    pub fn dequeue_sent(&mut self) -> Option<Bytes> {
        self.sent.pop_front()
    }

    pub fn can_send(&self) -> bool {
        !self.sent.is_empty()
    }
}

impl smoltcp::phy::Device for Phy {
    type RxToken<'a> = Rx;
    type TxToken<'a> = Tx<'a>;

    fn receive(
        &mut self,
        _: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.received.pop_front()?;
        Some((Rx(packet), Tx(&mut self.sent)))
    }

    fn transmit(&mut self, _: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(Tx(&mut self.sent))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ip;
        capabilities.max_transmission_unit = self.mtu;
        capabilities.max_burst_size = None;
        capabilities
    }
}

impl RxToken for Rx {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut BytesMut::from(self.0))
    }
}

impl<'a> TxToken for Tx<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = BytesMut::zeroed(len);
        let result = f(&mut buffer);
        self.0.push_back(buffer.freeze());
        result
    }
}

#[cfg(test)]
mod tests {
    use smoltcp::phy::Device;

    use super::*;

    #[test]
    fn queues_are_fifo() {
        let mut phy = Phy::new(1280);
        phy.enqueue_received(Bytes::from_static(b"one"));
        phy.enqueue_received(Bytes::from_static(b"two"));

        let now = smoltcp::time::Instant::now();
        let (rx, _) = phy.receive(now).unwrap();
        assert_eq!(rx.consume(|p| p.to_vec()), b"one");

        let tx = phy.transmit(now).unwrap();
        tx.consume(3, |b| b.copy_from_slice(b"out"));
        assert!(phy.can_send());
        assert_eq!(phy.dequeue_sent().unwrap(), &b"out"[..]);
        assert!(!phy.can_send());
    }

    #[test]
    fn oversized_packets_are_dropped() {
        let mut phy = Phy::new(4);
        phy.enqueue_received(Bytes::from_static(b"too long"));
        assert!(phy.receive(smoltcp::time::Instant::now()).is_none());
        assert_eq!(phy.capabilities().max_transmission_unit, 4);
    }
}
