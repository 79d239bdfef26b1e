use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::wire::message_id::MessageId;

/// A client endpoint as observed by the server: IPv4 address bits plus UDP port, compared
///  bitwise for identity. This is what the pairing messages reveal to the opposite peer so
///  that it can attempt a hole punch.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerEndpoint {
    pub host: u32,
    pub port: u16,
}

/// `[id:u32][host:u32][port:u16]`
pub const PAIRING_DATAGRAM_LEN: usize = 10;

impl Debug for PeerEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", Ipv4Addr::from_bits(self.host), self.port)
    }
}

impl PeerEndpoint {
    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from_bits(self.host), self.port))
    }

    /// The protocol is IPv4 only - the pairing layout has no room for anything else.
    pub fn try_from_socket_addr(addr: SocketAddr) -> anyhow::Result<PeerEndpoint> {
        match addr {
            SocketAddr::V4(a) => Ok(PeerEndpoint {
                host: a.ip().to_bits(),
                port: a.port(),
            }),
            SocketAddr::V6(a) => Err(anyhow!("not an IPv4 endpoint: {}", a)),
        }
    }

    /// Serialize the full 10-byte pairing datagram: `requestHost` towards the waiting host
    ///  (carrying the joiner) and `foundHost` towards the joiner (carrying the host).
    pub fn ser_pairing(&self, id: MessageId, buf: &mut impl BufMut) {
        buf.put_u32(id.into());
        buf.put_u32(self.host);
        buf.put_u16(self.port);
    }

    /// Deserialize the endpoint part of a pairing datagram, i.e. everything after the
    ///  leading message id.
    pub fn try_deser_pairing(buf: &mut impl Buf) -> anyhow::Result<PeerEndpoint> {
        let host = buf.try_get_u32()?;
        let port = buf.try_get_u16()?;
        Ok(PeerEndpoint { host, port })
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn endpoint(a: u8, b: u8, c: u8, d: u8, port: u16) -> PeerEndpoint {
        PeerEndpoint {
            host: Ipv4Addr::new(a, b, c, d).to_bits(),
            port,
        }
    }

    #[test]
    fn test_pairing_layout() {
        let mut buf = BytesMut::new();
        endpoint(192, 168, 0, 17, 0x1234).ser_pairing(MessageId::FoundHost, &mut buf);

        // [0x0000EA65][192.168.0.17][0x1234]
        assert_eq!(
            buf.as_ref(),
            &[0x00, 0x00, 0xEA, 0x65, 192, 168, 0, 17, 0x12, 0x34]
        );
        assert_eq!(buf.len(), PAIRING_DATAGRAM_LEN);
    }

    #[rstest]
    #[case(endpoint(10, 0, 0, 1, 55777))]
    #[case(endpoint(255, 255, 255, 255, 0))]
    #[case(endpoint(0, 0, 0, 0, 65535))]
    fn test_pairing_round_trip(#[case] ep: PeerEndpoint) {
        let mut buf = BytesMut::new();
        ep.ser_pairing(MessageId::RequestHost, &mut buf);

        let mut parse = &buf[..];
        assert_eq!(parse.get_u32(), u32::from(MessageId::RequestHost));
        assert_eq!(PeerEndpoint::try_deser_pairing(&mut parse).unwrap(), ep);
        assert_eq!(parse.remaining(), 0);
    }

    #[test]
    fn test_deser_rejects_truncated_input() {
        let mut parse: &[u8] = &[0, 0, 0];
        assert!(PeerEndpoint::try_deser_pairing(&mut parse).is_err());
    }

    #[test]
    fn test_socket_addr_conversion() {
        let ep = endpoint(127, 0, 0, 1, 4711);
        let addr = ep.to_socket_addr();
        assert_eq!(addr.to_string(), "127.0.0.1:4711");
        assert_eq!(PeerEndpoint::try_from_socket_addr(addr).unwrap(), ep);

        let v6: SocketAddr = "[::1]:4711".parse().unwrap();
        assert!(PeerEndpoint::try_from_socket_addr(v6).is_err());
    }
}
