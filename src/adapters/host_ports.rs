use crate::domain::model::{Environment, Protocol};
use crate::domain::ports::PortScanner;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};

/// 嘗試在綁定位址上 bind 來判斷 port 是否被佔用
#[derive(Debug, Clone)]
pub struct HostPortScanner {
    bind_address: IpAddr,
}

impl HostPortScanner {
    pub fn new(bind_address: IpAddr) -> Self {
        Self { bind_address }
    }

    pub fn for_environment(environment: Environment) -> Self {
        let address = environment
            .bind_address()
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self::new(address)
    }

    fn is_taken(&self, port: u16, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Tcp => TcpListener::bind((self.bind_address, port)).is_err(),
            Protocol::Udp => UdpSocket::bind((self.bind_address, port)).is_err(),
        }
    }
}

impl PortScanner for HostPortScanner {
    fn in_use(&self, candidates: &[(u16, Protocol)]) -> BTreeSet<u16> {
        let taken: BTreeSet<u16> = candidates
            .iter()
            .filter(|(port, _)| *port != 0)
            .filter(|(port, protocol)| self.is_taken(*port, *protocol))
            .map(|(port, _)| *port)
            .collect();

        tracing::debug!(
            "🔎 Scanned {} candidate ports on {}, {} in use",
            candidates.len(),
            self.bind_address,
            taken.len()
        );
        taken
    }
}
