// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network interface discovery and multicast socket construction.
//!
//! Discovery traffic must stay on the local broadcast domain, so every
//! multicast socket built here carries TTL 1. Loopback stays enabled for
//! same-host nodes and tests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// All non-loopback IPv4 interfaces suitable for multicast.
///
/// Honors the `MIDIMESH_MULTICAST_IF` environment variable as an override
/// for multi-homed machines.
pub fn multicast_interfaces() -> Vec<Ipv4Addr> {
    if let Ok(var) = std::env::var("MIDIMESH_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[UDP] Using MIDIMESH_MULTICAST_IF override: {}", addr);
            return vec![addr];
        }
        log::debug!(
            "[UDP] Invalid MIDIMESH_MULTICAST_IF='{}', falling back to auto-detect",
            var
        );
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[UDP] Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    addrs
}

/// Primary interface IP, or UNSPECIFIED when none can be determined.
#[must_use]
pub fn primary_interface_ip() -> Ipv4Addr {
    multicast_interfaces()
        .first()
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Best-effort hostname for discovery announcements.
#[must_use]
pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    let ip = primary_interface_ip();
    if ip.is_unspecified() {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

/// Build the socket used to transmit discovery announcements.
///
/// Unbound port (OS-assigned); TTL 1 so announcements never leave the
/// subnet; loopback enabled for same-host peers.
pub fn announce_socket(iface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if !iface.is_unspecified() {
        socket.set_multicast_if_v4(&iface)?;
    }
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&SocketAddr::from(bind_addr).into())?;
    Ok(socket.into())
}

/// Build the socket that listens on a multicast group.
///
/// Binds to the group port with reuse-address so several mesh processes
/// can coexist on one host, then joins the group on every suitable
/// interface. Join failures on individual interfaces are tolerated; at
/// least the unspecified-interface join must succeed when no interface is
/// found at all.
pub fn listener_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SocketAddr::from(bind_addr).into())?;

    let socket: UdpSocket = socket.into();
    join_group(&socket, group)?;
    Ok(socket)
}

/// Join `group` on all available interfaces (and loopback for tests).
fn join_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    let interfaces = multicast_interfaces();

    if interfaces.is_empty() {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        log::debug!("[UDP] join_multicast_v4({}) on UNSPECIFIED", group);
    } else {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, iface) {
                Ok(()) => {
                    log::debug!("[UDP] join_multicast_v4({}) on interface {}", group, iface);
                }
                Err(e) if e.raw_os_error() == Some(98) => {
                    // EADDRINUSE: already joined via the same physical NIC
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} - already joined, skipping",
                        group,
                        iface
                    );
                }
                Err(e) => {
                    // Non-fatal: some adapters cannot join multicast
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} failed (non-fatal): {}",
                        group,
                        iface,
                        e
                    );
                }
            }
        }
    }

    socket.set_multicast_loop_v4(true)?;
    let _ = socket.set_multicast_ttl_v4(1);
    Ok(())
}
