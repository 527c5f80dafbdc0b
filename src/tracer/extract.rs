//! Bounds-checked L2/L3/L4 header extraction.
//!
//! Every read checks `offset + size` against the snapshot length before
//! touching the bytes. Any failure stops extraction and leaves the fields
//! that were not reached at zero; a partly filled record is still worth
//! emitting.

use super::context::PacketSnapshot;
use super::event::{Family, IPPROTO_TCP, IPPROTO_UDP};
use super::record::{MacAddr, TraceRecord};

const ETH_HLEN: usize = 14;
const IPV4_MIN_HLEN: usize = 20;
const IPV6_HLEN: usize = 40;
const TCP_MIN_HLEN: usize = 20;
const UDP_HLEN: usize = 8;

// ----------------------------------------------------------------------------
// Checked reads
// ----------------------------------------------------------------------------

/// Borrow `N` bytes at `off`, or `None` when they run past the end.
#[inline]
fn read_fixed<const N: usize>(data: &[u8], off: usize) -> Option<[u8; N]> {
    let end = off.checked_add(N)?;
    data.get(off..end)?.try_into().ok()
}

#[inline]
fn read_u8(data: &[u8], off: usize) -> Option<u8> {
    data.get(off).copied()
}

#[inline]
fn read_u16_be(data: &[u8], off: usize) -> Option<u16> {
    read_fixed::<2>(data, off).map(u16::from_be_bytes)
}

/// Ensure `len` bytes are readable at `off`.
#[inline]
fn ensure(data: &[u8], off: usize, len: usize) -> Option<()> {
    let end = off.checked_add(len)?;
    (end <= data.len()).then_some(())
}

// ----------------------------------------------------------------------------
// Extraction
// ----------------------------------------------------------------------------

/// Fill the network-context fields of `rec` from `packet`.
///
/// `nfproto` is the hook's protocol family and selects the L3 parser. Hooks
/// that are not bound to one IP version (inet, bridge, netdev) fall back to
/// the version nibble of the network header.
pub fn extract_headers(packet: &PacketSnapshot, nfproto: u8, rec: &mut TraceRecord) {
    let data = packet.data.as_slice();

    if let Some(mac_off) = packet.mac_header {
        if extract_l2(data, usize::from(mac_off), rec).is_none() {
            return;
        }
    }

    let net_off = usize::from(packet.network_header);
    let family = match Family::from_u8(nfproto) {
        Some(f @ (Family::Ipv4 | Family::Ipv6)) => Some(f),
        _ => sniff_ip_version(data, net_off),
    };

    let _ = match family {
        Some(Family::Ipv4) => extract_ipv4(data, net_off, rec),
        Some(Family::Ipv6) => extract_ipv6(data, net_off, rec),
        _ => None,
    };
}

fn sniff_ip_version(data: &[u8], off: usize) -> Option<Family> {
    match read_u8(data, off)? >> 4 {
        4 => Some(Family::Ipv4),
        6 => Some(Family::Ipv6),
        _ => None,
    }
}

/// Ethernet header: destination MAC then source MAC.
fn extract_l2(data: &[u8], off: usize, rec: &mut TraceRecord) -> Option<()> {
    ensure(data, off, ETH_HLEN)?;
    rec.dst_mac = MacAddr(read_fixed::<6>(data, off)?);
    rec.src_mac = MacAddr(read_fixed::<6>(data, off + 6)?);
    Some(())
}

/// IPv4 header: 20 bytes minimum, L4 at `ihl * 4`.
fn extract_ipv4(data: &[u8], off: usize, rec: &mut TraceRecord) -> Option<()> {
    ensure(data, off, IPV4_MIN_HLEN)?;

    let ihl = usize::from(read_u8(data, off)? & 0x0f) * 4;
    rec.ip_proto = read_u8(data, off + 9)?;
    rec.len = read_u16_be(data, off + 2)?;
    rec.src_ip = read_fixed::<4>(data, off + 12)?;
    rec.dst_ip = read_fixed::<4>(data, off + 16)?;

    extract_l4(data, off.checked_add(ihl)?, rec.ip_proto, rec)
}

/// IPv6 base header: fixed 40 bytes, no extension header walk.
fn extract_ipv6(data: &[u8], off: usize, rec: &mut TraceRecord) -> Option<()> {
    ensure(data, off, IPV6_HLEN)?;

    rec.len = read_u16_be(data, off + 4)?;
    rec.ip_proto = read_u8(data, off + 6)?;
    rec.src_ip6 = read_fixed::<16>(data, off + 8)?;
    rec.dst_ip6 = read_fixed::<16>(data, off + 24)?;

    extract_l4(data, off.checked_add(IPV6_HLEN)?, rec.ip_proto, rec)
}

fn extract_l4(data: &[u8], off: usize, proto: u8, rec: &mut TraceRecord) -> Option<()> {
    let min_len = match proto {
        IPPROTO_TCP => TCP_MIN_HLEN,
        IPPROTO_UDP => UDP_HLEN,
        _ => return Some(()),
    };

    ensure(data, off, min_len)?;
    rec.src_port = read_u16_be(data, off)?;
    rec.dst_port = read_u16_be(data, off + 2)?;
    Some(())
}
