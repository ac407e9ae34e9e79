// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Netlink interface-status feed.
//!
//! Opens a raw `AF_NETLINK`/`NETLINK_ROUTE` socket subscribed to link and
//! IPv4 address/route multicast groups (IPv6 groups additionally under the
//! `ipv6-netlink` feature) and exposes it as a pollable fd. Decoding the
//! `nlmsghdr` stream is out of scope: the event loop only needs to know
//! that *something* changed on an interface, not what.

use crate::error::{LispError, Result};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const AF_NETLINK: i32 = 16;
const NETLINK_ROUTE: i32 = 0;
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTMGRP_IPV4_ROUTE: u32 = 0x40;
#[cfg(feature = "ipv6-netlink")]
const RTMGRP_IPV6_IFADDR: u32 = 0x100;
#[cfg(feature = "ipv6-netlink")]
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

#[repr(C)]
#[derive(Default)]
struct SockaddrNl {
    nl_family: u16,
    nl_pad: u16,
    nl_pid: u32,
    nl_groups: u32,
}

/// A bound, nonblocking netlink route socket.
pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    pub fn open() -> Result<NetlinkSocket> {
        let raw = unsafe { libc::socket(AF_NETLINK, libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, NETLINK_ROUTE) };
        if raw < 0 {
            return Err(LispError::SocketError(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut groups = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV4_ROUTE;
        #[cfg(feature = "ipv6-netlink")]
        {
            groups |= RTMGRP_IPV6_IFADDR | RTMGRP_IPV6_ROUTE;
        }

        let addr = SockaddrNl {
            nl_family: AF_NETLINK as u16,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: groups,
        };
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrNl as *const libc::sockaddr,
                std::mem::size_of::<SockaddrNl>() as u32,
            )
        };
        if rc < 0 {
            return Err(LispError::SocketError(io::Error::last_os_error()));
        }
        Ok(NetlinkSocket { fd })
    }

    /// Drain the socket after a readiness notification. Returns the number
    /// of datagrams drained; the content is discarded -- any drain at all
    /// means the interface-status feed has something to report, which is
    /// all the SMR trigger needs.
    pub fn drain(&self) -> Result<usize> {
        let mut buf = [0u8; 8192];
        let mut count = 0;
        loop {
            let n = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(LispError::SocketError(err));
            }
            if n == 0 {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
