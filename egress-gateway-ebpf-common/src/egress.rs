use core::net::Ipv4Addr;

/// Gateway value meaning no gateway node could be resolved for the policy.
/// The datapath drops or falls back on entries carrying it.
pub const GATEWAY_NOT_FOUND_IPV4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

/// Gateway value marking an excluded destination CIDR. The datapath skips
/// egress gateway rewriting for entries carrying it.
pub const EXCLUDED_CIDR_IPV4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EgressPolicyKey {
    pub source_ip: u32,
    pub dest_ip: u32,
    pub prefix_len: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EgressPolicyKey {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EgressPolicyValue {
    pub egress_ip: u32,
    pub gateway_ip: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EgressPolicyValue {}

#[cfg(feature = "user")]
mod user {
    use ipnet::Ipv4Net;

    use super::*;

    impl EgressPolicyKey {
        pub fn new(source_ip: Ipv4Addr, dest_cidr: Ipv4Net) -> Self {
            Self {
                source_ip: source_ip.into(),
                dest_ip: dest_cidr.network().into(),
                prefix_len: u32::from(dest_cidr.prefix_len()),
            }
        }

        pub fn source_ip(&self) -> Ipv4Addr {
            Ipv4Addr::from(self.source_ip)
        }

        pub fn dest_cidr(&self) -> Ipv4Net {
            let addr = Ipv4Addr::from(self.dest_ip);
            // clamped so the constructor cannot fail on a corrupt entry
            let prefix = self.prefix_len.min(32) as u8;
            Ipv4Net::new(addr, prefix).unwrap_or_else(|_| Ipv4Net::from(addr))
        }

        /// Exact key equality against a source IP and a destination CIDR,
        /// prefix length included.
        pub fn matches(&self, source_ip: Ipv4Addr, dest_cidr: Ipv4Net) -> bool {
            self.source_ip == u32::from(source_ip)
                && self.dest_ip == u32::from(dest_cidr.network())
                && self.prefix_len == u32::from(dest_cidr.prefix_len())
        }
    }

    impl EgressPolicyValue {
        pub fn new(egress_ip: Ipv4Addr, gateway_ip: Ipv4Addr) -> Self {
            Self {
                egress_ip: egress_ip.into(),
                gateway_ip: gateway_ip.into(),
            }
        }

        pub fn egress_ip(&self) -> Ipv4Addr {
            Ipv4Addr::from(self.egress_ip)
        }

        pub fn gateway_ip(&self) -> Ipv4Addr {
            Ipv4Addr::from(self.gateway_ip)
        }

        pub fn matches(&self, egress_ip: Ipv4Addr, gateway_ip: Ipv4Addr) -> bool {
            self.egress_ip == u32::from(egress_ip) && self.gateway_ip == u32::from(gateway_ip)
        }
    }
}
