// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The WS-Discovery protocol machine for one served address.
//!
//! Pure state: no sockets. The manager feeds it inbound documents and
//! transmits whatever it returns. Responsibilities: Hello/Bye lifecycle
//! announcements, Probe/Resolve/Get handling, at-most-once response
//! generation via a bounded message-id LRU, and the per-server message
//! sequence counter.

use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::config::{Config, MemberOf};
use crate::net::NetworkInterface;
use crate::soap::{
    self, anonymous_role, ns, AppSequence, Body, EnvelopeBuilder, GetResponseData,
};
use crate::transport::WSD_HTTP_PORT;

/// Inbound request ids remembered for duplicate suppression.
const MAX_KNOWN_MESSAGE_IDS: usize = 10;

/// Server lifecycle. Monotonic: no transition ever goes backwards, and a
/// `Stopped` server is replaced, never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsdState {
    NotStarted,
    Running,
    Stopped,
}

/// Which transport delivered a request; constrains the accepted actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTransport {
    Udp,
    Http,
}

pub struct WsdServer {
    config: Arc<Config>,
    iface: NetworkInterface,
    addr: IpAddr,
    full_computer_name: String,
    state: WsdState,
    message_number: u64,
    known_message_ids: LruCache<String, ()>,
}

impl WsdServer {
    pub fn new(config: Arc<Config>, iface: NetworkInterface, addr: IpAddr) -> Self {
        let full_computer_name = build_full_computer_name(&config);
        Self {
            config,
            iface,
            addr,
            full_computer_name,
            state: WsdState::NotStarted,
            message_number: 0,
            #[allow(clippy::expect_used)] // capacity is a nonzero constant
            known_message_ids: LruCache::new(
                NonZeroUsize::new(MAX_KNOWN_MESSAGE_IDS).expect("capacity > 0"),
            ),
        }
    }

    pub fn state(&self) -> WsdState {
        self.state
    }

    pub fn iface(&self) -> &NetworkInterface {
        &self.iface
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn full_computer_name(&self) -> &str {
        &self.full_computer_name
    }

    /// `http://<addr>:5357/<uuid>`, bracketed for IPv6 with the scope
    /// stripped.
    pub fn http_url(&self) -> String {
        match self.addr {
            IpAddr::V4(v4) => format!(
                "http://{}:{}/{}",
                v4, WSD_HTTP_PORT, self.config.http_path
            ),
            IpAddr::V6(v6) => format!(
                "http://[{}]:{}/{}",
                v6, WSD_HTTP_PORT, self.config.http_path
            ),
        }
    }

    /// Transition `NotStarted -> Running` and produce the Hello payload.
    pub fn start(&mut self) -> io::Result<Vec<u8>> {
        if self.state != WsdState::NotStarted {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WSD server started twice",
            ));
        }
        log::info!("Starting WSD server on {}", self.iface);
        self.state = WsdState::Running;

        let seq = self.next_app_sequence();
        EnvelopeBuilder::new(
            ns::DISCOVERY_URN,
            format!("{}/Hello", ns::WSD),
            Body::Hello {
                endpoint: &self.config.endpoint_urn,
            },
        )
        .app_sequence(seq)
        .build()
    }

    /// Produce the Bye payload for a graceful stop. The caller transmits it
    /// and calls [`WsdServer::mark_stopped`] once the last repetition is
    /// out.
    pub fn bye_payload(&mut self) -> io::Result<Vec<u8>> {
        log::info!("WSD on {}: sending Bye", self.iface);
        let seq = self.next_app_sequence();
        EnvelopeBuilder::new(
            ns::DISCOVERY_URN,
            format!("{}/Bye", ns::WSD),
            Body::Bye {
                endpoint: &self.config.endpoint_urn,
            },
        )
        .app_sequence(seq)
        .build()
    }

    /// Terminal transition. Idempotent.
    pub fn mark_stopped(&mut self) {
        if self.state != WsdState::Stopped {
            log::info!("Stopping WSD server on {}", self.iface);
            self.state = WsdState::Stopped;
        }
    }

    pub fn handle_udp(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        self.handle_request(RequestTransport::Udp, payload)
    }

    pub fn handle_http(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        self.handle_request(RequestTransport::Http, payload)
    }

    fn handle_request(&mut self, transport: RequestTransport, payload: &[u8]) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(payload).ok()?;
        let doc = match roxmltree::Document::parse(text) {
            Ok(doc) => doc,
            Err(err) => {
                log::debug!("WSD on {}: ignoring unparsable request: {}", self.iface, err);
                return None;
            }
        };

        let header = soap::parse_request_header(&doc)?;
        if !self.check_new_message_id(&header.message_id) {
            log::debug!("repeated message {}, ignoring", header.message_id);
            return None;
        }

        let (uri, method) = header.action.rsplit_once('/').unwrap_or(("", ""));

        let reply = match (transport, uri) {
            (RequestTransport::Udp, ns::WSD) => match method {
                "Probe" => {
                    log::debug!("Probe message");
                    self.handle_probe(&doc, &header.message_id)
                }
                "Resolve" => {
                    log::debug!("Resolve message");
                    self.handle_resolve(&doc, &header.message_id)
                }
                _ => {
                    log::warn!("Unknown UDP message, {}/{}", uri, method);
                    None
                }
            },
            (RequestTransport::Http, ns::WSDT) if method == "Get" => {
                self.handle_get(&header.message_id)
            }
            _ => {
                log::warn!("Unknown message, {}/{}", uri, method);
                None
            }
        };

        match reply? {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::error!("WSD on {}: error building response: {}", self.iface, err);
                None
            }
        }
    }

    fn handle_probe(
        &mut self,
        doc: &roxmltree::Document<'_>,
        relates_to: &str,
    ) -> Option<io::Result<Vec<u8>>> {
        let body = soap::body(doc)?;
        let Some(probe) = soap::find_child(body, ns::WSD, "Probe") else {
            log::warn!("No wsd:Probe in Probe message");
            return None;
        };

        // Scope filtering is not supported; a scoped Probe gets no answer.
        if soap::find_child(probe, ns::WSD, "Scopes").is_some() {
            log::warn!("wsd:Scopes in Probe message");
            return None;
        }

        let Some(types_node) = soap::find_child(probe, ns::WSD, "Types") else {
            log::warn!("No wsd:Types in Probe message");
            return None;
        };
        let types = types_node.text().unwrap_or("").trim();
        let Some((prefix, local)) = types.split_once(':') else {
            log::warn!("Invalid type '{}' in Probe message", types);
            return None;
        };
        if prefix.is_empty() || local != "Device" {
            log::warn!("Invalid type '{}' in Probe message", local);
            return None;
        }
        if types_node.lookup_namespace_uri(Some(prefix)) != Some(ns::WSDP) {
            log::warn!("Invalid type prefix '{}' in Probe message", prefix);
            return None;
        }

        let seq = self.next_app_sequence();
        let to = anonymous_role();
        Some(
            EnvelopeBuilder::new(
                &to,
                format!("{}/ProbeMatches", ns::WSD),
                Body::ProbeMatches {
                    endpoint: &self.config.endpoint_urn,
                },
            )
            .relates_to(relates_to)
            .app_sequence(seq)
            .build(),
        )
    }

    fn handle_resolve(
        &mut self,
        doc: &roxmltree::Document<'_>,
        relates_to: &str,
    ) -> Option<io::Result<Vec<u8>>> {
        let body = soap::body(doc)?;
        let resolve = soap::find_child(body, ns::WSD, "Resolve")?;
        let endpoint_ref = soap::find_child(resolve, ns::WSA, "EndpointReference")?;
        let address = soap::child_text(endpoint_ref, ns::WSA, "Address");
        if address != Some(self.config.endpoint_urn.as_str()) {
            log::warn!("Resolve message does not address this endpoint");
            return None;
        }

        let xaddrs = self.http_url();
        let seq = self.next_app_sequence();
        let to = anonymous_role();
        Some(
            EnvelopeBuilder::new(
                &to,
                format!("{}/ResolveMatches", ns::WSD),
                Body::ResolveMatches {
                    endpoint: &self.config.endpoint_urn,
                    xaddrs: &xaddrs,
                },
            )
            .relates_to(relates_to)
            .app_sequence(seq)
            .build(),
        )
    }

    fn handle_get(&mut self, relates_to: &str) -> Option<io::Result<Vec<u8>>> {
        let host_addr = self.addr.to_string();
        let to = anonymous_role();
        Some(
            EnvelopeBuilder::new(
                &to,
                format!("{}/GetResponse", ns::WSDT),
                Body::GetResponse(GetResponseData {
                    endpoint: &self.config.endpoint_urn,
                    friendly_name: &self.config.win_net_info.host_description,
                    full_computer_name: &self.full_computer_name,
                    host_addr: &host_addr,
                    metadata_template: self.config.metadata_template.as_deref(),
                }),
            )
            .relates_to(relates_to)
            .build(),
        )
    }

    /// At-most-once gate: false when the id was already seen. Insertion
    /// evicts the least recently inserted id beyond capacity 10.
    fn check_new_message_id(&mut self, message_id: &str) -> bool {
        if self.known_message_ids.contains(message_id) {
            return false;
        }
        self.known_message_ids.push(message_id.to_owned(), ());
        true
    }

    fn next_app_sequence(&mut self) -> AppSequence {
        let seq = AppSequence {
            instance_id: self.config.instance_id,
            message_number: self.message_number,
        };
        self.message_number += 1;
        seq
    }
}

fn build_full_computer_name(config: &Config) -> String {
    let info = &config.win_net_info;
    let separator = match info.member_of {
        MemberOf::Workgroup(_) => "/Workgroup:",
        MemberOf::Domain(_) => "/Domain:",
    };
    format!("{}{}{}", info.host_name, separator, info.member_of.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use std::net::Ipv6Addr;

    const UUID: &str = "0f202b95-2f9d-4c3d-9aa1-9e675c29d0f1";
    const URN: &str = "urn:uuid:0f202b95-2f9d-4c3d-9aa1-9e675c29d0f1";

    fn server_with(opts: Options) -> WsdServer {
        let opts = Options {
            uuid: Some(UUID.into()),
            ..opts
        };
        let config = Arc::new(Config::build(&opts).unwrap());
        WsdServer::new(
            config,
            NetworkInterface::new(2, "eth0"),
            "192.168.1.10".parse().unwrap(),
        )
    }

    fn server() -> WsdServer {
        server_with(Options::default())
    }

    fn envelope(action_method: &str, message_id: &str, body: &str) -> Vec<u8> {
        format!(
            r#"<soap:Envelope xmlns:soap="{soap}" xmlns:wsa="{wsa}" xmlns:wsd="{wsd}" xmlns:wsdp="{wsdp}">
  <soap:Header>
    <wsa:To>{to}</wsa:To>
    <wsa:Action>{action}</wsa:Action>
    <wsa:MessageID>{message_id}</wsa:MessageID>
  </soap:Header>
  <soap:Body>{body}</soap:Body>
</soap:Envelope>"#,
            soap = ns::SOAP,
            wsa = ns::WSA,
            wsd = ns::WSD,
            wsdp = ns::WSDP,
            to = ns::DISCOVERY_URN,
            action = action_method,
        )
        .into_bytes()
    }

    fn probe(message_id: &str) -> Vec<u8> {
        envelope(
            &format!("{}/Probe", ns::WSD),
            message_id,
            "<wsd:Probe><wsd:Types>wsdp:Device</wsd:Types></wsd:Probe>",
        )
    }

    fn resolve(message_id: &str, address: &str) -> Vec<u8> {
        envelope(
            &format!("{}/Resolve", ns::WSD),
            message_id,
            &format!(
                "<wsd:Resolve><wsa:EndpointReference><wsa:Address>{address}</wsa:Address></wsa:EndpointReference></wsd:Resolve>"
            ),
        )
    }

    fn get(message_id: &str) -> Vec<u8> {
        envelope(&format!("{}/Get", ns::WSDT), message_id, "")
    }

    fn parse(reply: &[u8]) -> (String, roxmltree::Document<'static>) {
        let text = String::from_utf8(reply.to_vec()).unwrap();
        let leaked: &'static str = Box::leak(text.clone().into_boxed_str());
        (text, roxmltree::Document::parse(leaked).unwrap())
    }

    #[test]
    fn hello_transitions_and_announces() {
        let mut server = server();
        assert_eq!(server.state(), WsdState::NotStarted);
        let hello = server.start().unwrap();
        assert_eq!(server.state(), WsdState::Running);

        let (_, doc) = parse(&hello);
        let header = soap::parse_request_header(&doc).unwrap();
        assert_eq!(header.action, format!("{}/Hello", ns::WSD));
        let hello_body = soap::find_child(soap::body(&doc).unwrap(), ns::WSD, "Hello").unwrap();
        let epr = soap::find_child(hello_body, ns::WSA, "EndpointReference").unwrap();
        assert_eq!(soap::child_text(epr, ns::WSA, "Address"), Some(URN));

        // Starting twice is an error.
        assert!(server.start().is_err());
    }

    #[test]
    fn bye_then_stop_is_terminal_and_idempotent() {
        let mut server = server();
        server.start().unwrap();
        let bye = server.bye_payload().unwrap();
        let (_, doc) = parse(&bye);
        let header = soap::parse_request_header(&doc).unwrap();
        assert_eq!(header.action, format!("{}/Bye", ns::WSD));

        server.mark_stopped();
        assert_eq!(server.state(), WsdState::Stopped);
        server.mark_stopped();
        assert_eq!(server.state(), WsdState::Stopped);
        assert!(server.start().is_err());
    }

    #[test]
    fn probe_round_trip() {
        let mut server = server();
        server.start().unwrap();
        let request_id = "urn:uuid:11111111-1111-1111-1111-111111111111";
        let reply = server.handle_udp(&probe(request_id)).unwrap();

        let (_, doc) = parse(&reply);
        let header =
            soap::find_child(doc.root_element(), ns::SOAP, "Header").unwrap();
        assert_eq!(
            soap::child_text(header, ns::WSA, "Action").unwrap(),
            format!("{}/ProbeMatches", ns::WSD)
        );
        assert_eq!(
            soap::child_text(header, ns::WSA, "RelatesTo"),
            Some(request_id)
        );
        assert_eq!(
            soap::child_text(header, ns::WSA, "To").unwrap(),
            anonymous_role()
        );
        assert!(soap::find_child(header, ns::WSD, "AppSequence").is_some());

        let matches =
            soap::find_child(soap::body(&doc).unwrap(), ns::WSD, "ProbeMatches").unwrap();
        let single = soap::find_child(matches, ns::WSD, "ProbeMatch").unwrap();
        let epr = soap::find_child(single, ns::WSA, "EndpointReference").unwrap();
        assert_eq!(soap::child_text(epr, ns::WSA, "Address"), Some(URN));
        assert_eq!(
            soap::child_text(single, ns::WSD, "Types"),
            Some("wsdp:Device pub:Computer")
        );
    }

    #[test]
    fn duplicate_probe_is_answered_once() {
        let mut server = server();
        server.start().unwrap();
        let request = probe("urn:uuid:11111111-1111-1111-1111-111111111111");
        assert!(server.handle_udp(&request).is_some());
        assert!(server.handle_udp(&request).is_none());
    }

    #[test]
    fn message_id_lru_evicts_beyond_capacity() {
        let mut server = server();
        server.start().unwrap();
        let first = probe("urn:uuid:00000000-0000-0000-0000-000000000000");
        assert!(server.handle_udp(&first).is_some());

        for i in 1..=10 {
            let request = probe(&format!("urn:uuid:00000000-0000-0000-0000-{:012}", i));
            assert!(server.handle_udp(&request).is_some());
        }

        // The first id has been evicted from the bounded history, so the
        // same request is answered again.
        assert!(server.handle_udp(&first).is_some());
    }

    #[test]
    fn scoped_probe_is_dropped() {
        let mut server = server();
        server.start().unwrap();
        let request = envelope(
            &format!("{}/Probe", ns::WSD),
            "urn:uuid:22222222-2222-2222-2222-222222222222",
            "<wsd:Probe><wsd:Scopes/><wsd:Types>wsdp:Device</wsd:Types></wsd:Probe>",
        );
        assert!(server.handle_udp(&request).is_none());
    }

    #[test]
    fn probe_with_wrong_type_is_dropped() {
        let mut server = server();
        server.start().unwrap();
        for (id, types) in [
            ("urn:uuid:a0000000-0000-0000-0000-000000000001", "wsdp:Printer"),
            ("urn:uuid:a0000000-0000-0000-0000-000000000002", "Device"),
            ("urn:uuid:a0000000-0000-0000-0000-000000000003", "wsa:Device"),
        ] {
            let request = envelope(
                &format!("{}/Probe", ns::WSD),
                id,
                &format!("<wsd:Probe><wsd:Types>{types}</wsd:Types></wsd:Probe>"),
            );
            assert!(server.handle_udp(&request).is_none(), "types = {types}");
        }
    }

    #[test]
    fn resolve_returns_xaddrs() {
        let mut server = server();
        server.start().unwrap();
        let reply = server
            .handle_udp(&resolve("urn:uuid:33333333-3333-3333-3333-333333333333", URN))
            .unwrap();
        let (_, doc) = parse(&reply);
        let matches =
            soap::find_child(soap::body(&doc).unwrap(), ns::WSD, "ResolveMatches").unwrap();
        let single = soap::find_child(matches, ns::WSD, "ResolveMatch").unwrap();
        assert_eq!(
            soap::child_text(single, ns::WSD, "XAddrs").unwrap(),
            format!("http://192.168.1.10:5357/{UUID}")
        );
    }

    #[test]
    fn resolve_for_other_endpoint_is_dropped() {
        let mut server = server();
        server.start().unwrap();
        let request = resolve(
            "urn:uuid:44444444-4444-4444-4444-444444444444",
            "urn:uuid:ffffffff-ffff-ffff-ffff-ffffffffffff",
        );
        assert!(server.handle_udp(&request).is_none());
    }

    #[test]
    fn ipv6_url_is_bracketed() {
        let config = Arc::new(
            Config::build(&Options {
                uuid: Some(UUID.into()),
                ..Options::default()
            })
            .unwrap(),
        );
        let server = WsdServer::new(
            config,
            NetworkInterface::new(3, "eth1"),
            IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()),
        );
        assert_eq!(server.http_url(), format!("http://[fe80::1]:5357/{UUID}"));
    }

    #[test]
    fn get_produces_metadata_without_app_sequence() {
        let mut server = server();
        server.start().unwrap();
        let reply = server
            .handle_http(&get("urn:uuid:55555555-5555-5555-5555-555555555555"))
            .unwrap();
        let (_, doc) = parse(&reply);
        let header = soap::find_child(doc.root_element(), ns::SOAP, "Header").unwrap();
        assert_eq!(
            soap::child_text(header, ns::WSA, "Action").unwrap(),
            format!("{}/GetResponse", ns::WSDT)
        );
        assert!(soap::find_child(header, ns::WSD, "AppSequence").is_none());

        let metadata =
            soap::find_child(soap::body(&doc).unwrap(), ns::WSX, "Metadata").unwrap();
        let computer = metadata
            .descendants()
            .find(|node| soap::is_named(*node, ns::PUB, "Computer"))
            .unwrap();
        assert_eq!(computer.text(), Some(server.full_computer_name()));
    }

    #[test]
    fn get_with_template_substitutes_endpoint() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "<meta>$ENDPOINT_ID at $IP_ADDR</meta>").unwrap();
        let mut server = server_with(Options {
            metadata: Some(file.path().to_path_buf()),
            ..Options::default()
        });
        server.start().unwrap();
        let reply = server
            .handle_http(&get("urn:uuid:66666666-6666-6666-6666-666666666666"))
            .unwrap();
        let (text, _) = parse(&reply);
        assert!(text.contains(&format!("{URN} at 192.168.1.10")));
    }

    #[test]
    fn transport_action_mismatch_is_ignored() {
        let mut server = server();
        server.start().unwrap();
        // Get over UDP and Probe over HTTP are both unknown messages.
        assert!(server
            .handle_udp(&get("urn:uuid:77777777-7777-7777-7777-777777777777"))
            .is_none());
        assert!(server
            .handle_http(&probe("urn:uuid:88888888-8888-8888-8888-888888888888"))
            .is_none());
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let mut server = server();
        server.start().unwrap();
        assert!(server.handle_udp(b"not xml at all").is_none());
        assert!(server.handle_udp(b"<unrelated/>").is_none());
        assert!(server.handle_udp(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn sequenced_message_numbers_increase() {
        let mut server = server();
        let hello = server.start().unwrap();
        let reply = server
            .handle_udp(&probe("urn:uuid:99999999-9999-9999-9999-999999999999"))
            .unwrap();

        let number = |payload: &[u8]| -> u64 {
            let (_, doc) = parse(payload);
            let header = soap::find_child(doc.root_element(), ns::SOAP, "Header").unwrap();
            let seq = soap::find_child(header, ns::WSD, "AppSequence").unwrap();
            seq.attribute("MessageNumber").unwrap().parse().unwrap()
        };

        assert!(number(&reply) > number(&hello));
        let bye = server.bye_payload().unwrap();
        assert!(number(&bye) > number(&reply));
    }

    #[test]
    fn full_computer_name_reflects_membership() {
        let server = server_with(Options {
            hostname: Some("storage".into()),
            domain: Some("CORP".into()),
            ..Options::default()
        });
        assert_eq!(server.full_computer_name(), "storage/Domain:CORP");

        let server = server_with(Options {
            hostname: Some("storage".into()),
            workgroup: Some("HOME".into()),
            ..Options::default()
        });
        assert_eq!(server.full_computer_name(), "storage/Workgroup:HOME");
    }
}
