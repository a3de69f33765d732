//! Broadcast sync channel
//!
//! The master announces itself every 500 ms with a 16-byte datagram carrying
//! a per-boot random run_id and its unwrapped MAC clock. The slave watches
//! the stream only to notice master reboots: a changed run_id is logged and
//! counted, and the CRM/DTR absorb the new timebase naturally.

use crate::mac_clock::MacClock;
use crate::status::SyncStatus;
use crate::traits::MacCounter;
use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

/// "FTS0"
pub const SYNC_MAGIC: u32 = 0x4654_5330;
pub const SYNC_PACKET_SIZE: usize = 16;
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// Broadcast sync packet, 16 bytes little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    /// Random per-boot value; a change signals a master reboot.
    pub run_id: u32,
    /// Unwrapped 64-bit MAC microseconds at send time.
    pub mac_clock_us: u64,
}

impl SyncPacket {
    pub fn encode(&self) -> [u8; SYNC_PACKET_SIZE] {
        let mut buf = [0u8; SYNC_PACKET_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], SYNC_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.run_id);
        LittleEndian::write_u64(&mut buf[8..16], self.mac_clock_us);
        buf
    }

    /// Parse and validate a datagram. Wrong size or magic returns None.
    pub fn decode(buf: &[u8]) -> Option<SyncPacket> {
        if buf.len() != SYNC_PACKET_SIZE {
            return None;
        }
        if LittleEndian::read_u32(&buf[0..4]) != SYNC_MAGIC {
            return None;
        }
        Some(SyncPacket {
            run_id: LittleEndian::read_u32(&buf[4..8]),
            mac_clock_us: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

/// Tracks the master's run_id across packets.
#[derive(Debug, Default)]
pub struct RebootDetector {
    last_run_id: Option<u32>,
    reboots: u32,
}

impl RebootDetector {
    pub fn new() -> Self {
        RebootDetector::default()
    }

    /// Feed one valid packet. Returns true when a reboot was detected.
    pub fn observe(&mut self, pkt: &SyncPacket) -> bool {
        match self.last_run_id {
            Some(prev) if prev != pkt.run_id => {
                self.last_run_id = Some(pkt.run_id);
                self.reboots += 1;
                warn!(
                    "master reboot detected: run_id {:08x} -> {:08x}",
                    prev, pkt.run_id
                );
                true
            }
            Some(_) => false,
            None => {
                info!("master run_id {:08x}", pkt.run_id);
                self.last_run_id = Some(pkt.run_id);
                false
            }
        }
    }

    pub fn reboots(&self) -> u32 {
        self.reboots
    }
}

pub fn create_broadcast_sender() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

pub fn create_broadcast_receiver(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    let udp: UdpSocket = socket.into();
    udp.set_read_timeout(Some(BROADCAST_INTERVAL))?;
    Ok(udp)
}

/// Master side: broadcast the sync packet at the fixed cadence until
/// `running` clears. Send errors are logged and the cadence continues.
pub fn run_master_broadcast<C: MacCounter + 'static>(
    sock: UdpSocket,
    mac: Arc<MacClock<C>>,
    port: u16,
    run_id: u32,
    running: Arc<AtomicBool>,
) {
    let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
    info!("broadcasting sync packets to {} (run_id {:08x})", dest, run_id);

    while running.load(Ordering::SeqCst) {
        let pkt = SyncPacket {
            run_id,
            mac_clock_us: mac.read() as u64,
        };
        if let Err(e) = sock.send_to(&pkt.encode(), dest) {
            warn!("sync broadcast send failed: {}", e);
        }
        thread::sleep(BROADCAST_INTERVAL);
    }
}

/// Slave side: receive sync packets, validate, track master reboots.
pub fn run_slave_receiver(
    sock: UdpSocket,
    status: Option<Arc<RwLock<SyncStatus>>>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let mut detector = RebootDetector::new();
    let mut buf = [0u8; 64];

    while running.load(Ordering::SeqCst) {
        let n = match sock.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(anyhow!("sync receiver failed: {}", e)),
        };

        if let Some(pkt) = SyncPacket::decode(&buf[..n]) {
            if detector.observe(&pkt) {
                if let Some(status) = &status {
                    if let Ok(mut s) = status.write() {
                        s.master_reboots = detector.reboots();
                    }
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_layout() {
        let pkt = SyncPacket {
            run_id: 0xAABBCCDD,
            mac_clock_us: 0x0102030405060708,
        };
        let buf = pkt.encode();
        assert_eq!(&buf[0..4], &[0x30, 0x53, 0x54, 0x46]); // "0STF" on the wire
        assert_eq!(&buf[4..8], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&buf[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_packet_roundtrip() {
        let pkt = SyncPacket {
            run_id: 42,
            mac_clock_us: 1_234_567_890_123,
        };
        assert_eq!(SyncPacket::decode(&pkt.encode()), Some(pkt));
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_size() {
        let mut buf = SyncPacket {
            run_id: 1,
            mac_clock_us: 2,
        }
        .encode();
        assert!(SyncPacket::decode(&buf[..15]).is_none());
        buf[0] ^= 0xFF;
        assert!(SyncPacket::decode(&buf).is_none());
    }

    #[test]
    fn test_reboot_detection() {
        let mut det = RebootDetector::new();
        let pkt = |run_id| SyncPacket {
            run_id,
            mac_clock_us: 0,
        };

        // First packet establishes the run_id
        assert!(!det.observe(&pkt(7)));
        assert!(!det.observe(&pkt(7)));
        assert_eq!(det.reboots(), 0);

        // Changed run_id is a reboot
        assert!(det.observe(&pkt(8)));
        assert_eq!(det.reboots(), 1);
        assert!(!det.observe(&pkt(8)));

        assert!(det.observe(&pkt(9)));
        assert_eq!(det.reboots(), 2);
    }

    #[test]
    fn test_broadcast_loopback() {
        let recv = create_broadcast_receiver(0).expect("receiver");
        let port = recv.local_addr().expect("addr").port();
        let send = create_broadcast_sender().expect("sender");

        let pkt = SyncPacket {
            run_id: 0xFEEDF00D,
            mac_clock_us: 99,
        };
        send.send_to(
            &pkt.encode(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        )
        .expect("send");

        let mut buf = [0u8; 64];
        let (n, _) = recv.recv_from(&mut buf).expect("recv");
        assert_eq!(SyncPacket::decode(&buf[..n]), Some(pkt));
    }
}
