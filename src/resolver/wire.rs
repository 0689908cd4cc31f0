//! DNS wire-format resolution over a pluggable transport.
//!
//! # Responsibilities
//! - Encode A and AAAA queries and decode their replies
//! - Check that a reply answers the query that was sent
//! - Map NXDOMAIN to `NotFound` and other response codes to errors
//!
//! # Design Decisions
//! - A transport only moves encoded messages; UDP, TCP, DoT and DoH
//!   share the same codec and lookup logic
//! - A and AAAA are queried one after the other; the lookup succeeds if
//!   either yields an address

use std::io;
use std::net::IpAddr;

use futures_util::future::BoxFuture;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use thiserror::Error;

use super::LookupHost;
use crate::context::ContextError;
use crate::http::{BoxError, HttpError};
use crate::net::{DialError, TlsError};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid resolver URL {0:?}")]
    InvalidUrl(String),
    #[error("invalid resolver address {0:?}")]
    InvalidAddress(String),
    #[error("invalid DNS name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("resolver answered with HTTP status {0}")]
    Status(u16),
    #[error("resolver answered with content type {0:?}")]
    ContentType(String),
    #[error("reading resolver response: {0}")]
    Body(BoxError),
    #[error("dns exchange: {0}")]
    Io(#[from] io::Error),
    #[error("dns exchange: {0}")]
    Timeout(#[from] ContextError),
    #[error("malformed DNS message: {0}")]
    Decode(#[from] ProtoError),
    #[error("reply ID {received} does not match query ID {sent}")]
    IdMismatch { sent: u16, received: u16 },
    #[error("no such host")]
    NoSuchHost,
    #[error("DNS response code {0}")]
    Rcode(ResponseCode),
}

impl From<ResolverError> for io::Error {
    fn from(err: ResolverError) -> Self {
        let kind = match &err {
            ResolverError::NoSuchHost => io::ErrorKind::NotFound,
            ResolverError::InvalidUrl(_) | ResolverError::InvalidAddress(_) | ResolverError::InvalidName(_) => {
                io::ErrorKind::InvalidInput
            }
            ResolverError::Decode(_) | ResolverError::IdMismatch { .. } | ResolverError::ContentType(_) => {
                io::ErrorKind::InvalidData
            }
            ResolverError::Timeout(_) => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Moves one encoded DNS message to a server and returns the encoded reply.
pub trait DnsTransport: Send + Sync {
    fn round_trip<'a>(&'a self, query: Vec<u8>) -> BoxFuture<'a, Result<Vec<u8>, ResolverError>>;

    /// Short name of the protocol, for logs.
    fn network(&self) -> &'static str;

    /// ID for the next query message.
    fn next_query_id(&self) -> u16 {
        rand::random()
    }
}

pub(crate) fn encode_query(id: u16, host: &str, record_type: RecordType) -> Result<Vec<u8>, ResolverError> {
    let name = Name::from_ascii(host).map_err(|_| ResolverError::InvalidName(host.to_string()))?;
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    Ok(message.to_vec()?)
}

pub(crate) fn decode_reply(id: u16, record_type: RecordType, reply: &[u8]) -> Result<Vec<IpAddr>, ResolverError> {
    let message = Message::from_vec(reply)?;
    if message.id() != id {
        return Err(ResolverError::IdMismatch {
            sent: id,
            received: message.id(),
        });
    }
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(ResolverError::NoSuchHost),
        rcode => return Err(ResolverError::Rcode(rcode)),
    }
    Ok(message
        .answers()
        .iter()
        .filter_map(|record| match (record_type, record.data()) {
            (RecordType::A, Some(RData::A(a))) => Some(IpAddr::V4(a.0)),
            (RecordType::AAAA, Some(RData::AAAA(aaaa))) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

/// Resolver speaking the DNS wire format over `T`.
#[derive(Debug, Clone)]
pub struct WireResolver<T> {
    transport: T,
}

impl<T: DnsTransport> WireResolver<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Resolve `host` to its IPv4 then IPv6 addresses.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolverError> {
        let mut addrs = Vec::new();
        let mut first_error = None;
        for record_type in [RecordType::A, RecordType::AAAA] {
            match self.query(host, record_type).await {
                Ok(found) => addrs.extend(found),
                Err(e) => {
                    tracing::debug!(
                        host,
                        network = self.transport.network(),
                        record = %record_type,
                        error = %e,
                        "dns query failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if addrs.is_empty() => Err(e),
            _ if addrs.is_empty() => Err(ResolverError::NoSuchHost),
            _ => Ok(addrs),
        }
    }

    async fn query(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>, ResolverError> {
        let id = self.transport.next_query_id();
        let query = encode_query(id, host, record_type)?;
        let reply = self.transport.round_trip(query).await?;
        decode_reply(id, record_type, &reply)
    }
}

impl<T: DnsTransport> LookupHost for WireResolver<T> {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move { self.resolve(host).await.map_err(io::Error::from) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::sync::Mutex;

    /// Answers from a fixed table, echoing the query ID.
    struct Table {
        seen: Mutex<Vec<RecordType>>,
        reply_id: Option<u16>,
    }

    impl Table {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                reply_id: None,
            }
        }
    }

    impl DnsTransport for Table {
        fn round_trip<'a>(&'a self, query: Vec<u8>) -> BoxFuture<'a, Result<Vec<u8>, ResolverError>> {
            Box::pin(async move {
                let query = Message::from_vec(&query)?;
                let question = query.queries()[0].clone();
                self.seen.lock().unwrap().push(question.query_type());
                let mut reply = Message::new();
                reply
                    .set_id(self.reply_id.unwrap_or(query.id()))
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query);
                let name = question.name().clone();
                if name.to_ascii().trim_end_matches('.') == "missing.test" {
                    reply.set_response_code(ResponseCode::NXDomain);
                } else if question.query_type() == RecordType::A {
                    reply.add_answer(Record::from_rdata(name, 60, RData::A(A("192.0.2.7".parse().unwrap()))));
                } else {
                    reply.add_answer(Record::from_rdata(
                        name,
                        60,
                        RData::AAAA(AAAA("2001:db8::1".parse().unwrap())),
                    ));
                }
                reply.add_query(question);
                Ok(reply.to_vec()?)
            })
        }

        fn network(&self) -> &'static str {
            "table"
        }

        fn next_query_id(&self) -> u16 {
            1
        }
    }

    #[tokio::test]
    async fn combines_a_and_aaaa() {
        let resolver = WireResolver::new(Table::new());
        let addrs = resolver.resolve("x.test").await.unwrap();
        assert_eq!(
            addrs,
            vec!["192.0.2.7".parse::<IpAddr>().unwrap(), "2001:db8::1".parse().unwrap()]
        );
        assert_eq!(*resolver.transport().seen.lock().unwrap(), vec![RecordType::A, RecordType::AAAA]);
    }

    #[tokio::test]
    async fn nxdomain_is_not_found() {
        let resolver = WireResolver::new(Table::new());
        let err = resolver.lookup_host("missing.test").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reply_for_another_query_is_rejected() {
        let mut table = Table::new();
        table.reply_id = Some(7);
        let resolver = WireResolver::new(table);
        let err = resolver.resolve("x.test").await.unwrap_err();
        assert!(matches!(err, ResolverError::IdMismatch { received: 7, .. }), "{err:?}");
    }

    #[test]
    fn query_asks_for_recursion() {
        let bytes = encode_query(0x1234, "example.com", RecordType::AAAA).unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.id(), 0x1234);
        assert!(message.recursion_desired());
        assert_eq!(message.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(message.queries()[0].name().to_ascii().trim_end_matches('.'), "example.com");
    }

    #[test]
    fn answers_of_other_types_are_skipped() {
        let mut reply = Message::new();
        reply.set_id(1).set_message_type(MessageType::Response);
        let name = Name::from_ascii("x.test").unwrap();
        reply.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A("192.0.2.1".parse().unwrap()))));
        let bytes = reply.to_vec().unwrap();
        assert!(decode_reply(1, RecordType::AAAA, &bytes).unwrap().is_empty());
        assert_eq!(decode_reply(1, RecordType::A, &bytes).unwrap().len(), 1);
        assert!(matches!(decode_reply(1, RecordType::A, b"\x00"), Err(ResolverError::Decode(_))));
    }
}
