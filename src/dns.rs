//! DNS for the child process.
//!
//! The child's resolver is pointed at the gateway, so every lookup arrives
//! here as a UDP flow on port 53. Queries are resolved through the host's
//! own resolver and answered on the flow's reply handle.

use crate::errors::{Error, Result};
use crate::mux::UdpHandler;
use crate::net::udp::UdpFlowStream;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use std::sync::Arc;

/// TTL placed on synthesized answers.
const ANSWER_TTL: u32 = 60;

/// Answers the child's DNS queries via the host resolver.
pub struct DnsProxy {
  resolver: Arc<TokioResolver>,
}

impl DnsProxy {
  /// Build a proxy around the host's system resolver configuration, falling
  /// back to well-known public resolvers when none can be read.
  pub fn new() -> Result<Self> {
    let builder = match TokioResolver::builder_tokio() {
      Ok(builder) => builder,
      Err(e) => {
        tracing::debug!("no usable system resolver config ({}), using defaults", e);
        TokioResolver::builder_with_config(
          ResolverConfig::default(),
          TokioConnectionProvider::default(),
        )
      }
    };
    Ok(Self {
      resolver: Arc::new(builder.build()),
    })
  }

  async fn answer(&self, query: &[u8]) -> Result<Vec<u8>> {
    let request =
      Message::from_vec(query).map_err(|e| Error::Dns(format!("failed to parse query: {}", e)))?;
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for query in request.queries() {
      response.add_query(query.clone());
    }

    let Some(question) = request.queries().first() else {
      response.set_response_code(ResponseCode::FormErr);
      return serialize(&response);
    };
    let name = question.name().clone();
    let host = name.to_utf8();

    match question.query_type() {
      RecordType::A | RecordType::AAAA => match self.resolver.lookup_ip(host.as_str()).await {
        Ok(lookup) => {
          for ip in lookup.iter() {
            match (ip, question.query_type()) {
              (IpAddr::V4(v4), RecordType::A) => {
                response.add_answer(Record::from_rdata(name.clone(), ANSWER_TTL, RData::A(A(v4))));
              }
              (IpAddr::V6(v6), RecordType::AAAA) => {
                response.add_answer(Record::from_rdata(
                  name.clone(),
                  ANSWER_TTL,
                  RData::AAAA(AAAA(v6)),
                ));
              }
              _ => {}
            }
          }
          tracing::debug!("resolved {} to {} answers", host, response.answers().len());
        }
        Err(e) => {
          tracing::debug!("resolution of {} failed: {}", host, e);
          response.set_response_code(ResponseCode::NXDomain);
        }
      },
      other => {
        tracing::debug!("unsupported query type {} for {}", other, host);
        response.set_response_code(ResponseCode::NotImp);
      }
    }
    serialize(&response)
  }
}

fn serialize(message: &Message) -> Result<Vec<u8>> {
  message
    .to_vec()
    .map_err(|e| Error::Dns(format!("failed to serialize response: {}", e)))
}

#[async_trait]
impl UdpHandler for DnsProxy {
  async fn handle(&self, mut flow: UdpFlowStream) {
    while let Some(datagram) = flow.recv().await {
      match self.answer(&datagram).await {
        Ok(reply) => {
          if let Err(e) = flow.reply(&reply) {
            tracing::debug!("failed to send DNS reply: {}", e);
          }
        }
        Err(e) => tracing::debug!("{}", e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use hickory_proto::op::Query;
  use hickory_proto::rr::Name;
  use std::str::FromStr;

  fn query(name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(0x1234);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
    message.to_vec().unwrap()
  }

  #[tokio::test]
  async fn unsupported_types_get_not_implemented() {
    let proxy = DnsProxy::new().unwrap();
    let reply = proxy
      .answer(&query("example.com.", RecordType::MX))
      .await
      .unwrap();
    let parsed = Message::from_vec(&reply).unwrap();
    assert_eq!(parsed.id(), 0x1234);
    assert_eq!(parsed.response_code(), ResponseCode::NotImp);
    assert_eq!(parsed.queries().len(), 1);
  }

  #[tokio::test]
  async fn empty_questions_get_form_error() {
    let proxy = DnsProxy::new().unwrap();
    let mut message = Message::new();
    message.set_id(7);
    let reply = proxy.answer(&message.to_vec().unwrap()).await.unwrap();
    let parsed = Message::from_vec(&reply).unwrap();
    assert_eq!(parsed.response_code(), ResponseCode::FormErr);
  }
}
