// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process daemon configuration: constructed programmatically by a
//! caller (a thin `main.rs`, or a test), validated once at
//! [`crate::daemon::Daemon::new`]. There is no file or CLI parsing here --
//! that layer is a collaborator outside this crate.

use crate::address::Family;
use crate::constants::{key_id, LISP_SHA1_AUTH_DATA_LEN, LISP_SHA256_AUTH_DATA_LEN};
use crate::error::{LispError, Result};
use crate::mapping::Mapping;
use std::net::IpAddr;

/// Whether this daemon acts as a site xTR (registering owned prefixes and
/// resolving remote ones) or as a roaming Mobile Node (typically a single
/// /32 or /128 EID whose RLOC changes as it moves between networks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    Xtr,
    MobileNode,
}



#[derive(Debug, Clone)]
pub struct MapServerConfig {
    pub addr: IpAddr,
    pub key_id: u8,
    pub key: Vec<u8>,
    pub proxy_reply: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub router_mode: RouterMode,
    pub map_resolvers: Vec<IpAddr>,
    pub map_servers: Vec<MapServerConfig>,
    pub proxy_etrs: Vec<IpAddr>,
    pub proxy_itrs: Vec<IpAddr>,
    pub rtrs: Vec<IpAddr>,
    pub local_mappings: Vec<Mapping>,
    pub nat_aware: bool,
    pub map_request_retries: u8,
    pub rloc_probe_interval: u64,
    pub rloc_probe_retries: u8,
    pub default_rloc_afi: Family,
    pub site_id: [u8; 8],
    pub xtr_id: [u8; 16],
    /// Install a short-TTL `NativeForward` entry when resolution times
    /// out with no reply, rather than quietly abandoning the lookup.
    pub negative_cache_on_timeout: bool,
    pub negative_ttl_seconds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            router_mode: RouterMode::Xtr,
            map_resolvers: Vec::new(),
            map_servers: Vec::new(),
            proxy_etrs: Vec::new(),
            proxy_itrs: Vec::new(),
            rtrs: Vec::new(),
            local_mappings: Vec::new(),
            nat_aware: false,
            map_request_retries: crate::constants::LISPD_MAX_MR_RETRANSMIT,
            rloc_probe_interval: crate::constants::RLOC_PROBING_INTERVAL,
            rloc_probe_retries: crate::constants::DEFAULT_RLOC_PROBING_RETRIES,
            default_rloc_afi: Family::V4,
            site_id: [0u8; 8],
            xtr_id: [0u8; 16],
            negative_cache_on_timeout: true,
            negative_ttl_seconds: 15,
        }
    }
}

impl Config {
    /// Reject a configuration that couldn't possibly run: prefix lengths
    /// out of bounds for their family, xTR mode with owned prefixes but no
    /// Map Server to register them with, a Map Server whose key length
    /// doesn't match its declared key-id, or NAT-aware mode with no RTR
    /// to traverse through.
    pub fn validate(&self) -> Result<()> {
        for mapping in &self.local_mappings {
            let max_plen = match mapping.eid.family() {
                Some(Family::V4) => 32,
                Some(Family::V6) => 128,
                None => {
                    return Err(LispError::Config(format!(
                        "local mapping {} has no routable address family",
                        mapping.eid.string_form()
                    )))
                }
            };
            if mapping.plen > max_plen {
                return Err(LispError::Config(format!(
                    "local mapping {} has plen {} exceeding family maximum {}",
                    mapping.eid.string_form(),
                    mapping.plen,
                    max_plen
                )));
            }
            if mapping.iid >= 1 << 24 {
                return Err(LispError::Config(format!(
                    "local mapping {} has iid {} outside the 24-bit instance-id range",
                    mapping.eid.string_form(),
                    mapping.iid
                )));
            }
        }

        if self.router_mode == RouterMode::Xtr && !self.local_mappings.is_empty() && self.map_servers.is_empty() {
            return Err(LispError::Config(
                "xTR mode with local mappings requires at least one map server".into(),
            ));
        }

        for ms in &self.map_servers {
            let expected_len = match ms.key_id {
                key_id::NONE => 0,
                key_id::HMAC_SHA1_96 => LISP_SHA1_AUTH_DATA_LEN,
                key_id::HMAC_SHA256_128 => LISP_SHA256_AUTH_DATA_LEN,
                other => return Err(LispError::BadAuth { key_id: other }),
            };
            if ms.key_id != key_id::NONE && ms.key.is_empty() {
                return Err(LispError::Config(format!(
                    "map server {} declares key_id {} but carries no key",
                    ms.addr, ms.key_id
                )));
            }
            let _ = expected_len; // HMAC key length itself is independent of digest length
        }

        if self.nat_aware && self.rtrs.is_empty() {
            return Err(LispError::Config(
                "nat_aware mode requires at least one RTR".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::net::Ipv4Addr;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn xtr_mode_with_local_mappings_requires_a_map_server() {
        let mut cfg = Config::default();
        cfg.local_mappings.push(Mapping::new_local(
            Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24),
            24,
            0,
        ));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LispError::Config(_)));
    }

    #[test]
    fn map_server_with_hmac_key_id_and_no_key_is_rejected() {
        let mut cfg = Config::default();
        cfg.map_servers.push(MapServerConfig {
            addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
            key_id: key_id::HMAC_SHA1_96,
            key: Vec::new(),
            proxy_reply: true,
        });
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LispError::Config(_)));
    }

    #[test]
    fn nat_aware_without_rtrs_is_rejected() {
        let mut cfg = Config::default();
        cfg.nat_aware = true;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LispError::Config(_)));
    }

    #[test]
    fn mapping_plen_exceeding_family_maximum_is_rejected() {
        let mut cfg = Config::default();
        cfg.local_mappings.push(Mapping::new_local(
            Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 33),
            33,
            0,
        ));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LispError::Config(_)));
    }

    #[test]
    fn mapping_iid_outside_24_bits_is_rejected() {
        let mut cfg = Config::default();
        cfg.local_mappings.push(Mapping::new_local(
            Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24),
            24,
            1 << 24,
        ));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LispError::Config(_)));
    }
}
