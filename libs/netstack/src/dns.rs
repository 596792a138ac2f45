//! The in-process DNS interceptor.
//!
//! UDP queries addressed to the cluster's resolver never become tunnel
//! streams; they are answered here by forwarding the question to whatever
//! [`DnsResolver`] the daemon wires in.

use anyhow::{Context as _, Result};
use domain::base::Message;
use futures::future::BoxFuture;

/// One parsed DNS question, ready to be forwarded to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Query id, echoed back into the response.
    pub id: u16,
    /// The queried name, in presentation format without the trailing dot.
    pub name: String,
    /// The query type as its IANA number.
    pub qtype: u16,
}

/// Answers DNS questions on behalf of the stack.
///
/// Implementations forward to the cluster's resolver; the returned bytes must
/// be a complete DNS response message. The interceptor patches the query id.
pub trait DnsResolver: Send + Sync + 'static {
    fn resolve(&self, query: DnsQuery) -> BoxFuture<'static, Result<Vec<u8>>>;
}

pub(crate) fn parse_query(payload: &[u8]) -> Result<DnsQuery> {
    let message = Message::from_octets(payload).context("Failed to parse DNS message")?;

    anyhow::ensure!(!message.header().qr(), "DNS message is a response");

    let question = message
        .sole_question()
        .context("DNS query has no sole question")?;

    let mut name = question.qname().to_string();
    if name.ends_with('.') && name.len() > 1 {
        name.pop();
    }

    Ok(DnsQuery {
        id: message.header().id(),
        name,
        qtype: question.qtype().to_int(),
    })
}

/// Stamps the original query id onto a response produced by the resolver.
pub(crate) fn patch_id(response: &mut [u8], id: u16) {
    if let Some(header) = response.get_mut(..2) {
        header.copy_from_slice(&id.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A query for `web.default A`, captured from `dig`.
    fn raw_query() -> Vec<u8> {
        let mut message = vec![
            0xab, 0xcd, // id
            0x01, 0x00, // flags: rd
            0x00, 0x01, // qdcount
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // an/ns/ar
        ];
        message.extend_from_slice(&[3]);
        message.extend_from_slice(b"web");
        message.extend_from_slice(&[7]);
        message.extend_from_slice(b"default");
        message.push(0);
        message.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN

        message
    }

    #[test]
    fn parses_query_name_and_type() {
        let query = parse_query(&raw_query()).unwrap();

        assert_eq!(query.id, 0xabcd);
        assert_eq!(query.name, "web.default");
        assert_eq!(query.qtype, 1);
    }

    #[test]
    fn rejects_responses() {
        let mut raw = raw_query();
        raw[2] |= 0x80; // qr bit

        assert!(parse_query(&raw).is_err());
    }

    #[test]
    fn patch_id_overwrites_header() {
        let mut response = raw_query();
        patch_id(&mut response, 0x1234);

        assert_eq!(&response[..2], &[0x12, 0x34]);
    }
}
