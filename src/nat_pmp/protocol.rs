//! Wire format of the NAT-PMP protocol, as defined by [RFC 6886].
//!
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use nested_enum_utils::common_fields;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use snafu::{ensure, Backtrace, Snafu};

/// Protocol version this codec implements.
pub(crate) const VERSION: u8 = 0;

/// Bit set in the opcode of every server response.
const RESPONSE_INDICATOR: u8 = 1 << 7;

/// Transport selector of a mapping request. Its value is the request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum MapProtocol {
    Udp = 1,
    Tcp = 2,
}

/// Result codes a server may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

/// A request sent to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Opcode 0, ask the gateway for its public address.
    ExternalAddress,
    /// Opcode 1/2, map a port. A zero lifetime deletes the mapping, zeroed
    /// ports delete every mapping of the protocol.
    Mapping {
        proto: MapProtocol,
        local_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(VERSION);
        match self {
            Request::ExternalAddress => buf.put_u8(0),
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                buf.put_u8((*proto).into());
                buf.put_u16(0); // reserved
                buf.put_u16(*local_port);
                buf.put_u16(*external_port);
                buf.put_u32(*lifetime_seconds);
            }
        }
        buf.freeze()
    }
}

/// A response received from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    /// Response to an [`Request::ExternalAddress`] request.
    PublicAddress {
        epoch_time: u32,
        public_ip: Ipv4Addr,
    },
    /// Response to a [`Request::Mapping`] request.
    PortMap {
        proto: MapProtocol,
        epoch_time: u32,
        private_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

#[common_fields({
    backtrace: Option<Backtrace>
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("response is too short ({len} bytes)"))]
    TooShort { len: usize },
    #[snafu(display("received unsupported protocol version {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("received a request where a response was expected"))]
    NotAResponse {},
    #[snafu(display("received unsupported opcode {opcode}"))]
    UnsupportedOpcode { opcode: u8 },
    #[snafu(display("server reported failure {code:?}"))]
    Failure { code: ResultCode },
    #[snafu(display("server reported unknown failure code {code}"))]
    UndefinedFailure { code: u16 },
}

impl Error {
    /// Whether the error counts against the gateway.
    ///
    /// Malformed datagrams are noise on the socket and are simply re-read;
    /// everything the server explicitly reported is fatal.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, Error::TooShort { .. } | Error::NotAResponse { .. })
    }
}

impl Response {
    /// Size of the largest response defined by the protocol.
    pub(crate) const MAX_SIZE: usize = 16;

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(buf.len() >= 8, TooShortSnafu { len: buf.len() });
        let version = buf[0];
        ensure!(version == VERSION, UnsupportedVersionSnafu { version });
        let opcode = buf[1];
        ensure!(opcode & RESPONSE_INDICATOR != 0, NotAResponseSnafu);
        let opcode = opcode & !RESPONSE_INDICATOR;

        let code = u16::from_be_bytes([buf[2], buf[3]]);
        match ResultCode::try_from(code) {
            Ok(ResultCode::Success) => {}
            Ok(code) => return FailureSnafu { code }.fail(),
            Err(_) => return UndefinedFailureSnafu { code }.fail(),
        }
        let epoch_time = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        match opcode {
            0 => {
                ensure!(buf.len() >= 12, TooShortSnafu { len: buf.len() });
                Ok(Response::PublicAddress {
                    epoch_time,
                    public_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
                })
            }
            1 | 2 => {
                ensure!(buf.len() >= Self::MAX_SIZE, TooShortSnafu { len: buf.len() });
                let proto = if opcode == 1 {
                    MapProtocol::Udp
                } else {
                    MapProtocol::Tcp
                };
                Ok(Response::PortMap {
                    proto,
                    epoch_time,
                    private_port: u16::from_be_bytes([buf[8], buf[9]]),
                    external_port: u16::from_be_bytes([buf[10], buf[11]]),
                    lifetime_seconds: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
                })
            }
            opcode => UnsupportedOpcodeSnafu { opcode }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_external_address_request() {
        let req = Request::ExternalAddress;
        assert_eq!(&req.encode()[..], &[0, 0]);
    }

    #[test]
    fn encode_mapping_request() {
        let req = Request::Mapping {
            proto: MapProtocol::Udp,
            local_port: 5000,
            external_port: 5000,
            lifetime_seconds: 3600,
        };
        assert_eq!(
            &req.encode()[..],
            &[0, 1, 0, 0, 0x13, 0x88, 0x13, 0x88, 0, 0, 0x0e, 0x10]
        );

        let remove_all = Request::Mapping {
            proto: MapProtocol::Tcp,
            local_port: 0,
            external_port: 0,
            lifetime_seconds: 0,
        };
        assert_eq!(&remove_all.encode()[..], &[0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn decode_public_address_response() {
        let buf = [0, 128, 0, 0, 0, 0, 0, 7, 203, 0, 113, 7];
        let response = Response::decode(&buf).unwrap();
        assert_eq!(
            response,
            Response::PublicAddress {
                epoch_time: 7,
                public_ip: Ipv4Addr::new(203, 0, 113, 7),
            }
        );
    }

    #[test]
    fn decode_port_map_response() {
        let mut buf = vec![0, 129, 0, 0, 0, 0, 0, 7];
        buf.extend_from_slice(&20123u16.to_be_bytes());
        buf.extend_from_slice(&20999u16.to_be_bytes());
        buf.extend_from_slice(&3600u32.to_be_bytes());
        let response = Response::decode(&buf).unwrap();
        assert_eq!(
            response,
            Response::PortMap {
                proto: MapProtocol::Udp,
                epoch_time: 7,
                private_port: 20123,
                external_port: 20999,
                lifetime_seconds: 3600,
            }
        );
    }

    #[test]
    fn decode_reports_failures() {
        // result code 2: not authorized
        let buf = [0, 129, 0, 2, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0];
        match Response::decode(&buf) {
            Err(Error::Failure { code, .. }) => assert_eq!(code, ResultCode::NotAuthorized),
            other => panic!("expected a failure, got {other:?}"),
        }

        // an unknown result code is still a failure
        let buf = [0, 129, 0, 99, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0];
        match Response::decode(&buf) {
            Err(Error::UndefinedFailure { code, .. }) => assert_eq!(code, 99),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Response::decode(&[0, 128]),
            Err(Error::TooShort { .. })
        ));
        assert!(matches!(
            Response::decode(&[1, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::UnsupportedVersion { version: 1, .. })
        ));
        // echo of our own request, not a response
        assert!(matches!(
            Response::decode(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::NotAResponse { .. })
        ));
        assert!(matches!(
            Response::decode(&[0, 131, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::UnsupportedOpcode { opcode: 3, .. })
        ));
    }

    #[test]
    fn fatality_taxonomy() {
        assert!(!Error::TooShort { len: 0, backtrace: None }.is_fatal());
        assert!(!Error::NotAResponse { backtrace: None }.is_fatal());
        assert!(Error::UnsupportedVersion { version: 1, backtrace: None }.is_fatal());
        assert!(Error::Failure { code: ResultCode::NetworkFailure, backtrace: None }.is_fatal());
        assert!(Error::UndefinedFailure { code: 77, backtrace: None }.is_fatal());
    }
}
