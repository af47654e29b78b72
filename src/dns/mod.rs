pub mod records;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use russh::client::Handle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::credentials::BastionHandler;
use crate::error::{MoguraError, MoguraResult};
use crate::ssh_stream::SshChannelStream;

pub use records::{ARecord, CnameRecord, SrvRecord};

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Issues A / SRV / CNAME queries over a TCP channel tunneled through the
/// bastion's SSH session, using the standard DNS-over-TCP wire format
/// (2-byte big-endian length prefix, RFC 1035 §4.2.2).
#[derive(Clone)]
pub struct DnsClient {
    remote_host: String,
    remote_port: u16,
}

impl DnsClient {
    pub fn new(remote_dns: &str) -> MoguraResult<Self> {
        let (host, port) = remote_dns.rsplit_once(':').ok_or_else(|| {
            MoguraError::Config(format!("remote_dns must be host:port, got {}", remote_dns))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| MoguraError::Config(format!("invalid remote_dns port: {}", port)))?;
        Ok(Self {
            remote_host: host.to_string(),
            remote_port: port,
        })
    }

    pub async fn query_a(
        &self,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        name: &str,
    ) -> MoguraResult<Vec<ARecord>> {
        let lines = self.query(session, name, RecordType::A).await?;
        lines.iter().map(|l| records::parse_a(l)).collect()
    }

    pub async fn query_srv(
        &self,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        name: &str,
    ) -> MoguraResult<Vec<SrvRecord>> {
        let lines = self.query(session, name, RecordType::SRV).await?;
        lines.iter().map(|l| records::parse_srv(l)).collect()
    }

    pub async fn query_cname(
        &self,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        name: &str,
    ) -> MoguraResult<Vec<CnameRecord>> {
        let lines = self.query(session, name, RecordType::CNAME).await?;
        lines.iter().map(|l| records::parse_cname(l)).collect()
    }

    /// Dials a channel, sends one query, reads one response, and returns the
    /// answer section rendered as presentation-format lines.
    async fn query(
        &self,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        name: &str,
        record_type: RecordType,
    ) -> MoguraResult<Vec<String>> {
        let channel = {
            let session_guard = session.lock().await;
            session_guard
                .channel_open_direct_tcpip(&self.remote_host, self.remote_port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| MoguraError::ChannelOpen(e.to_string()))?
        };
        let mut stream = SshChannelStream::new(channel);

        let query_bytes = build_query(name, record_type)?;
        let mut framed = Vec::with_capacity(query_bytes.len() + 2);
        framed.extend_from_slice(&(query_bytes.len() as u16).to_be_bytes());
        framed.extend_from_slice(&query_bytes);

        // Both read and write deadlines are fixed at 2 seconds from send,
        // matching the original's single SetReadDeadline/SetWriteDeadline
        // call before WriteMsg+ReadMsg: one deadline covers the whole
        // request/response, not a fresh window per I/O call.
        let deadline = tokio::time::Instant::now() + QUERY_TIMEOUT;

        tokio::time::timeout_at(deadline, stream.write_all(&framed))
            .await
            .map_err(|_| MoguraError::DnsQuery(format!("write timed out for {}", name)))?
            .map_err(|e| MoguraError::DnsQuery(e.to_string()))?;

        let mut len_buf = [0u8; 2];
        tokio::time::timeout_at(deadline, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| MoguraError::DnsQuery(format!("read timed out for {}", name)))?
            .map_err(|e| MoguraError::DnsQuery(e.to_string()))?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;

        let mut resp_buf = vec![0u8; resp_len];
        tokio::time::timeout_at(deadline, stream.read_exact(&mut resp_buf))
            .await
            .map_err(|_| MoguraError::DnsQuery(format!("read timed out for {}", name)))?
            .map_err(|e| MoguraError::DnsQuery(e.to_string()))?;

        let message = Message::from_bytes(&resp_buf)
            .map_err(|e| MoguraError::DnsParse(format!("malformed DNS response: {}", e)))?;

        if message.answers().is_empty() {
            return Err(MoguraError::DnsEmptyAnswer(name.to_string()));
        }

        Ok(message
            .answers()
            .iter()
            .map(|record| record.to_string())
            .collect())
    }
}

fn build_query(name: &str, record_type: RecordType) -> MoguraResult<Vec<u8>> {
    let fqdn = Name::from_ascii(name)
        .map_err(|e| MoguraError::DnsQuery(format!("invalid name {}: {}", name, e)))?;

    let mut message = Message::new();
    message
        .set_id(next_query_id())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(fqdn, record_type));

    message
        .to_bytes()
        .map_err(|e| MoguraError::DnsQuery(format!("failed to encode query: {}", e)))
}

/// Cheap pseudo-random 16-bit query id; collisions are harmless since each
/// channel carries exactly one request/response pair.
fn next_query_id() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos as u16
}
