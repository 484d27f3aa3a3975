use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::time::timeout;

use super::resolv_conf::parse_nameservers;
use super::{DiscoveryError, TxtFuture, TxtResolver};
use crate::config::IpFamily;
use crate::constants::{DEFAULT_DNS_SERVER_TIMEOUT, MAX_UDP_DNS_PAYLOAD, RESOLV_CONF_PATH};
use crate::interface::{InterfaceBinder, SelectedInterface};
use crate::net::{connect_tcp, connect_udp};
use crate::prelude::debug;

/// Minimal recursive-client resolver for TXT records.
///
/// Sends one query per nameserver (in order) over UDP through the selected interface,
/// and repeats it over TCP when the answer is truncated. The first server giving a
/// definitive answer wins; `NXDOMAIN` is definitive.
#[derive(Clone)]
pub struct StubResolver {
    binder: Arc<dyn InterfaceBinder>,
    nameservers: Vec<SocketAddr>,
    resolv_conf: PathBuf,
    family: IpFamily,
    server_timeout: Duration,
}

impl std::fmt::Debug for StubResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubResolver")
            .field("binder", &"<InterfaceBinder>")
            .field("nameservers", &self.nameservers)
            .field("resolv_conf", &self.resolv_conf)
            .field("family", &self.family)
            .field("server_timeout", &self.server_timeout)
            .finish()
    }
}

impl StubResolver {
    /// Creates a resolver that reads nameservers from `/etc/resolv.conf` on every lookup.
    pub fn new(binder: Arc<dyn InterfaceBinder>) -> Self {
        Self {
            binder,
            nameservers: Vec::new(),
            resolv_conf: PathBuf::from(RESOLV_CONF_PATH),
            family: IpFamily::Any,
            server_timeout: DEFAULT_DNS_SERVER_TIMEOUT,
        }
    }

    /// Uses a fixed nameserver list instead of resolv.conf.
    #[must_use]
    pub fn nameservers(mut self, nameservers: Vec<SocketAddr>) -> Self {
        self.nameservers = nameservers;
        self
    }

    /// Reads nameservers from `path` instead of `/etc/resolv.conf`.
    #[must_use]
    pub fn resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Only talks to nameservers of the given IP family.
    #[must_use]
    pub const fn ip_family(mut self, family: IpFamily) -> Self {
        self.family = family;
        self
    }

    /// Time allowed for one server (UDP plus optional TCP retry).
    #[must_use]
    pub const fn server_timeout(mut self, server_timeout: Duration) -> Self {
        self.server_timeout = server_timeout;
        self
    }

    async fn servers(&self) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let configured = if self.nameservers.is_empty() {
            let text = tokio::fs::read_to_string(&self.resolv_conf)
                .await
                .map_err(DiscoveryError::Io)?;
            parse_nameservers(&text)
        } else {
            self.nameservers.clone()
        };

        let servers = self.family.filter(configured);
        if servers.is_empty() {
            return Err(DiscoveryError::NoNameservers);
        }
        Ok(servers)
    }

    async fn lookup(
        &self,
        name: &str,
        iface: &SelectedInterface,
    ) -> Result<Vec<String>, DiscoveryError> {
        let mut qname = Name::from_ascii(name).map_err(|e| {
            DiscoveryError::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        qname.set_fqdn(true);

        let id = fastrand::u16(..);
        let request = build_query(id, &qname)?;

        let mut last_err = DiscoveryError::NoNameservers;
        for server in self.servers().await? {
            let attempt = timeout(
                self.server_timeout,
                self.query_server(server, iface, &request, id, &qname),
            )
            .await
            .unwrap_or(Err(DiscoveryError::Timeout));

            match attempt {
                Ok(records) => return Ok(records),
                Err(err @ DiscoveryError::NxDomain { .. }) => return Err(err),
                Err(err) => {
                    debug!("nameserver {server} failed for {name}: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn query_server(
        &self,
        server: SocketAddr,
        iface: &SelectedInterface,
        request: &[u8],
        id: u16,
        qname: &Name,
    ) -> Result<Vec<String>, DiscoveryError> {
        let mut response = self.exchange_udp(server, iface, request, id, qname).await?;
        if response.truncated() {
            debug!("truncated answer from {server}, retrying over tcp");
            response = self.exchange_tcp(server, iface, request, id, qname).await?;
        }
        interpret(&response, qname)
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        iface: &SelectedInterface,
        request: &[u8],
        id: u16,
        qname: &Name,
    ) -> Result<Message, DiscoveryError> {
        let socket = connect_udp(self.binder.as_ref(), iface, server)
            .await
            .map_err(DiscoveryError::from_io)?;
        socket.send(request).await.map_err(DiscoveryError::from_io)?;

        let mut buf = vec![0u8; usize::from(MAX_UDP_DNS_PAYLOAD)];
        loop {
            let len = socket.recv(&mut buf).await.map_err(DiscoveryError::from_io)?;
            // Stray or spoofed datagrams do not end the exchange; the real answer may
            // still arrive within the server timeout.
            let response = match Message::from_vec(&buf[..len]) {
                Ok(response) if response.id() == id => response,
                Ok(_) => continue,
                Err(err) => {
                    debug!("ignoring undecodable datagram from {server}: {err}");
                    continue;
                }
            };
            if let Err(err) = check_matches_query(&response, qname) {
                debug!("ignoring datagram from {server}: {err}");
                continue;
            }
            return Ok(response);
        }
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        iface: &SelectedInterface,
        request: &[u8],
        id: u16,
        qname: &Name,
    ) -> Result<Message, DiscoveryError> {
        let mut stream = connect_tcp(self.binder.as_ref(), iface, server)
            .await
            .map_err(DiscoveryError::from_io)?;

        let len = u16::try_from(request.len())
            .map_err(|_| DiscoveryError::MalformedResponse("query too large".into()))?;
        let mut framed = Vec::with_capacity(request.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(request);
        stream.write_all(&framed).await.map_err(DiscoveryError::from_io)?;

        let len = stream.read_u16().await.map_err(DiscoveryError::from_io)?;
        let mut buf = vec![0u8; usize::from(len)];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(DiscoveryError::from_io)?;

        let response = Message::from_vec(&buf)
            .map_err(|e| DiscoveryError::MalformedResponse(e.to_string()))?;
        if response.id() != id {
            return Err(DiscoveryError::MalformedResponse(
                "response id does not match query".into(),
            ));
        }
        check_matches_query(&response, qname)?;
        Ok(response)
    }
}

impl TxtResolver for StubResolver {
    fn lookup_txt<'a>(&'a self, name: &'a str, iface: &'a SelectedInterface) -> TxtFuture<'a> {
        Box::pin(self.lookup(name, iface))
    }
}

fn build_query(id: u16, qname: &Name) -> Result<Vec<u8>, DiscoveryError> {
    let mut edns = Edns::new();
    edns.set_max_payload(MAX_UDP_DNS_PAYLOAD);

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(qname.clone(), RecordType::TXT));
    message.set_edns(edns);

    message
        .to_vec()
        .map_err(|e| DiscoveryError::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))
}

fn check_matches_query(response: &Message, qname: &Name) -> Result<(), DiscoveryError> {
    if response.message_type() != MessageType::Response {
        return Err(DiscoveryError::MalformedResponse("not a response".into()));
    }
    let matches = response
        .queries()
        .first()
        .is_some_and(|q| q.name() == qname && q.query_type() == RecordType::TXT);
    if !matches {
        return Err(DiscoveryError::MalformedResponse(
            "response question does not match query".into(),
        ));
    }
    Ok(())
}

fn interpret(response: &Message, qname: &Name) -> Result<Vec<String>, DiscoveryError> {
    match response.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => {
            return Err(DiscoveryError::NxDomain {
                name: qname.to_ascii(),
            })
        }
        code @ (ResponseCode::ServFail | ResponseCode::Refused) => {
            return Err(DiscoveryError::ServerFailure {
                rcode: code.to_string(),
            })
        }
        other => {
            return Err(DiscoveryError::MalformedResponse(format!(
                "unexpected response code {other}"
            )))
        }
    }

    let records = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::TXT(txt)) => Some(
                txt.txt_data()
                    .iter()
                    .map(|segment| String::from_utf8_lossy(segment))
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect();
    Ok(records)
}
