/// HAProxy PROXY protocol v1 preamble
///
/// `PROXY TCP4 <src> <dst> <sport> <dport>` as the first line of a
/// connection carries the real client address when the pool sits behind a
/// TCP load balancer.

use std::net::{IpAddr, SocketAddr};

use crate::config::TcpProxyProtocolConfig;

const PREFIX: &str = "PROXY ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyProtocolError {
    #[error("malformed PROXY header: {0}")]
    Malformed(String),

    #[error("PROXY header from {0}, which is not an allowed proxy")]
    Spoofed(IpAddr),

    #[error("connection did not start with a PROXY header")]
    Missing,
}

/// What to do with the first line of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// A valid header. `None` for `PROXY UNKNOWN`, keep the peer address.
    Header(Option<SocketAddr>),
    /// Not a PROXY line; treat it as a regular request.
    Request,
}

pub fn is_proxy_line(line: &str) -> bool {
    line.starts_with(PREFIX)
}

/// Parse one header line (without the trailing CRLF).
pub fn parse_header(line: &str) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let malformed = || ProxyProtocolError::Malformed(line.to_string());
    let rest = line.strip_prefix(PREFIX).ok_or_else(malformed)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        ["UNKNOWN", ..] => Ok(None),
        [proto @ ("TCP4" | "TCP6"), src, _dst, sport, _dport] => {
            let ip: IpAddr = src.parse().map_err(|_| malformed())?;
            if (*proto == "TCP4") != ip.is_ipv4() {
                return Err(malformed());
            }
            let port: u16 = sport.parse().map_err(|_| malformed())?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        _ => Err(malformed()),
    }
}

/// Apply the port's PROXY policy to the first line received from `peer`.
pub fn inspect_first_line(
    cfg: &TcpProxyProtocolConfig,
    peer: IpAddr,
    line: &str,
) -> Result<Preamble, ProxyProtocolError> {
    if !is_proxy_line(line) {
        return if cfg.mandatory {
            Err(ProxyProtocolError::Missing)
        } else {
            Ok(Preamble::Request)
        };
    }
    if !cfg.proxy_addresses.contains(&peer) {
        return Err(ProxyProtocolError::Spoofed(peer));
    }
    parse_header(line).map(Preamble::Header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use test_case::test_case;

    fn cfg(mandatory: bool) -> TcpProxyProtocolConfig {
        TcpProxyProtocolConfig {
            enable: true,
            mandatory,
            ..Default::default()
        }
    }

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_parse_tcp4() {
        let addr = parse_header("PROXY TCP4 192.0.2.10 10.0.0.1 51234 3333").unwrap();
        assert_eq!(addr, Some("192.0.2.10:51234".parse().unwrap()));
    }

    #[test]
    fn test_parse_tcp6_and_unknown() {
        let addr = parse_header("PROXY TCP6 2001:db8::1 2001:db8::2 4000 3333").unwrap();
        assert_eq!(addr, Some("[2001:db8::1]:4000".parse().unwrap()));
        assert_eq!(parse_header("PROXY UNKNOWN").unwrap(), None);
    }

    #[test_case("PROXY TCP4 192.0.2.10 10.0.0.1 51234" ; "missing field")]
    #[test_case("PROXY TCP4 2001:db8::1 10.0.0.1 1 2" ; "family mismatch")]
    #[test_case("PROXY TCP4 192.0.2.10 10.0.0.1 port 3333" ; "bad port")]
    #[test_case("PROXY UDP4 192.0.2.10 10.0.0.1 1 2" ; "bad protocol")]
    fn test_malformed(line: &str) {
        assert!(matches!(parse_header(line), Err(ProxyProtocolError::Malformed(_))));
    }

    #[test]
    fn test_policy() {
        let line = "PROXY TCP4 192.0.2.10 10.0.0.1 51234 3333";
        assert!(matches!(inspect_first_line(&cfg(false), LOOPBACK, line), Ok(Preamble::Header(Some(_)))));

        let outsider = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(
            inspect_first_line(&cfg(false), outsider, line),
            Err(ProxyProtocolError::Spoofed(outsider))
        );

        let request = r#"{"id":1,"method":"mining.subscribe","params":[]}"#;
        assert_eq!(inspect_first_line(&cfg(false), LOOPBACK, request), Ok(Preamble::Request));
        assert_eq!(inspect_first_line(&cfg(true), LOOPBACK, request), Err(ProxyProtocolError::Missing));
    }
}
