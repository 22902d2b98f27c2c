use log::debug;
use std::{
    collections::BTreeSet,
    net::{SocketAddr, TcpListener, UdpSocket},
};

use crate::{catalog::ProtocolFamily, error::ConfError};

/// Answers "can something bind this port right now".
pub trait PortProbe {
    fn is_free(&self, port: u16) -> bool;
}

/// Binds TCP and UDP on the wildcard address; both must succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn is_free(&self, port: u16) -> bool {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let tcp = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(_) => return false,
        };
        let udp = UdpSocket::bind(addr).is_ok();
        drop(tcp);
        udp
    }
}

/// Ports tried first when no port was requested, then the fallback range.
fn preferred_ports(family: ProtocolFamily) -> &'static [u16] {
    match family {
        ProtocolFamily::Reality => &[443, 8443],
        ProtocolFamily::WebSocketTls | ProtocolFamily::HttpUpgrade => &[443, 80, 8443, 2053, 2083],
        ProtocolFamily::Shadowsocks | ProtocolFamily::Shadowsocks2022 => &[8388, 8389],
    }
}

pub fn family_range(family: ProtocolFamily) -> (u16, u16) {
    match family {
        ProtocolFamily::Reality => (10000, 19999),
        ProtocolFamily::WebSocketTls | ProtocolFamily::HttpUpgrade => (20000, 29999),
        ProtocolFamily::Shadowsocks | ProtocolFamily::Shadowsocks2022 => (30000, 39999),
    }
}

pub struct PortAllocator<'a> {
    probe: &'a dyn PortProbe,
    /// Ports declared by fragments on disk. Taken even when xray isn't running.
    reserved: BTreeSet<u16>,
}

impl<'a> PortAllocator<'a> {
    pub fn new(probe: &'a dyn PortProbe, reserved: BTreeSet<u16>) -> Self {
        Self { probe, reserved }
    }

    pub fn is_available(&self, port: u16) -> bool {
        port != 0 && !self.reserved.contains(&port) && self.probe.is_free(port)
    }

    /// First free port in `start..=end`, scanned in order.
    pub fn find_available(&self, start: u16, end: u16) -> Result<u16, ConfError> {
        (start.max(1)..=end)
            .find(|&p| self.is_available(p))
            .ok_or(ConfError::NoPortAvailable { start, end })
    }

    /// An explicit port is returned only if free; it is never swapped for another.
    /// Zero means "pick one": family preferences first, then the family range.
    pub fn suggest(&self, family: ProtocolFamily, preferred: u16) -> Result<u16, ConfError> {
        if preferred != 0 {
            if self.is_available(preferred) {
                return Ok(preferred);
            }
            return Err(ConfError::PortUnavailable { port: preferred });
        }

        if let Some(&p) = preferred_ports(family).iter().find(|&&p| self.is_available(p)) {
            debug!("port: picked preferred {p} for {family:?}");
            return Ok(p);
        }

        let (start, end) = family_range(family);
        let p = self.find_available(start, end)?;
        debug!("port: picked {p} from {start}-{end} for {family:?}");
        Ok(p)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Every port is free except the listed ones.
    pub(crate) struct BusyProbe(pub BTreeSet<u16>);

    impl PortProbe for BusyProbe {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn busy(ports: &[u16]) -> BusyProbe {
        BusyProbe(ports.iter().copied().collect())
    }

    #[test]
    fn explicit_port_is_never_substituted() {
        let probe = busy(&[443]);
        let a = PortAllocator::new(&probe, BTreeSet::new());
        assert!(matches!(
            a.suggest(ProtocolFamily::Reality, 443),
            Err(ConfError::PortUnavailable { port: 443 })
        ));
        assert_eq!(a.suggest(ProtocolFamily::Reality, 8443).unwrap(), 8443);
    }

    #[test]
    fn reserved_ports_count_as_taken() {
        let probe = busy(&[]);
        let a = PortAllocator::new(&probe, [8388].into_iter().collect());
        assert!(!a.is_available(8388));
        assert_eq!(a.suggest(ProtocolFamily::Shadowsocks, 0).unwrap(), 8389);
        assert!(a.suggest(ProtocolFamily::Shadowsocks, 8388).is_err());
    }

    #[test]
    fn falls_back_to_family_range() {
        let probe = busy(&[443, 8443, 10000, 10001]);
        let a = PortAllocator::new(&probe, BTreeSet::new());
        assert_eq!(a.suggest(ProtocolFamily::Reality, 0).unwrap(), 10002);
    }

    #[test]
    fn find_available_scans_inclusive_range() {
        let probe = busy(&[5000, 5001]);
        let a = PortAllocator::new(&probe, BTreeSet::new());
        assert_eq!(a.find_available(5000, 5002).unwrap(), 5002);
        assert!(matches!(
            a.find_available(5000, 5001),
            Err(ConfError::NoPortAvailable { start: 5000, end: 5001 })
        ));
    }

    #[test]
    fn system_probe_sees_bound_port() {
        let l = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(!SystemProbe.is_free(port));
        drop(l);
    }
}
