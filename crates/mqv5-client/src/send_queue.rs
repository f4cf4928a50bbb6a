//! Ordered serialization of outbound packets.
//!
//! The queue decides what goes on the wire next. Prioritized packets
//! (acknowledgements, PINGREQ, DISCONNECT) always drain before regular
//! traffic; throttled packets (QoS 1/2 publishes) additionally wait for the
//! flow-control window. A terminal packet closes the queue: nothing further
//! is accepted, and the connection shuts down once it is written.
//!
//! Each packet carries a monotonically increasing serial so ordering stays
//! stable across requeues.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{ClientError, Result};

/// Send-behavior flags.
pub mod send_flags {
    pub const NONE: u8 = 0;
    /// Subject to the Receive Maximum window.
    pub const THROTTLED: u8 = 0b001;
    /// Bypasses FIFO order.
    pub const PRIORITIZED: u8 = 0b010;
    /// No further sends are permitted after this packet.
    pub const TERMINAL: u8 = 0b100;
}

/// One encoded packet waiting for the wire.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub serial: u32,
    pub flags: u8,
    /// 0 when the packet type carries no identifier.
    pub packet_id: u16,
    pub bytes: Bytes,
}

impl QueuedPacket {
    pub fn is(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Outbound packet queue with priority lanes and serial numbering.
#[derive(Debug, Default)]
pub struct SendQueue {
    prioritized: VecDeque<QueuedPacket>,
    regular: VecDeque<QueuedPacket>,
    next_serial: u32,
    terminal_queued: bool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next serial number.
    pub fn next_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        self.next_serial
    }

    /// Enqueue a packet. Fails once a terminal packet was accepted.
    pub fn push(&mut self, packet: QueuedPacket) -> Result<()> {
        if self.terminal_queued {
            return Err(ClientError::InvalidState(
                "send queue closed by terminal packet".to_string(),
            ));
        }
        if packet.is(send_flags::TERMINAL) {
            self.terminal_queued = true;
        }
        if packet.is(send_flags::PRIORITIZED) {
            self.prioritized.push_back(packet);
        } else {
            self.regular.push_back(packet);
        }
        Ok(())
    }

    /// Re-enqueue replayed in-flight packets at the head of the regular
    /// lane, ahead of everything queued but not yet sent.
    pub fn requeue_front(&mut self, packets: Vec<QueuedPacket>) {
        for packet in packets.into_iter().rev() {
            self.regular.push_front(packet);
        }
    }

    /// Take the next packet eligible for the wire.
    ///
    /// `window_available` reports whether another throttled packet fits the
    /// Receive Maximum window; a throttled packet at the head of the regular
    /// lane blocks that lane (but not the prioritized one) until the window
    /// opens.
    pub fn pop(&mut self, window_available: bool) -> Option<QueuedPacket> {
        if let Some(packet) = self.prioritized.pop_front() {
            return Some(packet);
        }
        match self.regular.front() {
            Some(packet) if packet.is(send_flags::THROTTLED) && !window_available => None,
            Some(_) => self.regular.pop_front(),
            None => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prioritized.is_empty() && self.regular.is_empty()
    }

    /// Drop any queued terminal packet and reopen the queue. Non-terminal
    /// packets survive a reconnect.
    pub fn reopen(&mut self) {
        if self.terminal_queued {
            self.prioritized.retain(|p| !p.is(send_flags::TERMINAL));
            self.regular.retain(|p| !p.is(send_flags::TERMINAL));
            self.terminal_queued = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(serial: u32, flags: u8) -> QueuedPacket {
        QueuedPacket {
            serial,
            flags,
            packet_id: 0,
            bytes: Bytes::from_static(&[0xC0, 0x00]),
        }
    }

    #[test]
    fn serials_increase() {
        let mut queue = SendQueue::new();
        let a = queue.next_serial();
        let b = queue.next_serial();
        assert!(b > a);
    }

    #[test]
    fn prioritized_drains_before_regular() {
        let mut queue = SendQueue::new();
        queue.push(packet(1, send_flags::NONE)).unwrap();
        queue.push(packet(2, send_flags::PRIORITIZED)).unwrap();
        queue.push(packet(3, send_flags::NONE)).unwrap();

        assert_eq!(queue.pop(true).unwrap().serial, 2);
        assert_eq!(queue.pop(true).unwrap().serial, 1);
        assert_eq!(queue.pop(true).unwrap().serial, 3);
        assert!(queue.pop(true).is_none());
    }

    #[test]
    fn throttled_waits_for_window() {
        let mut queue = SendQueue::new();
        queue.push(packet(1, send_flags::THROTTLED)).unwrap();
        queue.push(packet(2, send_flags::PRIORITIZED)).unwrap();

        // window closed: the prioritized lane still drains
        assert_eq!(queue.pop(false).unwrap().serial, 2);
        assert!(queue.pop(false).is_none());
        assert!(!queue.is_empty());
        // window open: throttled packet goes out
        assert_eq!(queue.pop(true).unwrap().serial, 1);
    }

    #[test]
    fn terminal_closes_the_queue() {
        let mut queue = SendQueue::new();
        queue
            .push(packet(1, send_flags::PRIORITIZED | send_flags::TERMINAL))
            .unwrap();
        assert!(queue.push(packet(2, send_flags::NONE)).is_err());

        queue.reopen();
        assert!(queue.pop(true).is_none());
        queue.push(packet(3, send_flags::NONE)).unwrap();
        assert_eq!(queue.pop(true).unwrap().serial, 3);
    }

    #[test]
    fn requeue_front_preserves_replay_order() {
        let mut queue = SendQueue::new();
        queue.push(packet(10, send_flags::NONE)).unwrap();
        queue.requeue_front(vec![
            packet(1, send_flags::THROTTLED),
            packet(2, send_flags::THROTTLED),
        ]);

        assert_eq!(queue.pop(true).unwrap().serial, 1);
        assert_eq!(queue.pop(true).unwrap().serial, 2);
        assert_eq!(queue.pop(true).unwrap().serial, 10);
    }
}
