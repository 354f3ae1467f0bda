// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SOAP 1.2 envelope construction and inspection.
//!
//! Outbound envelopes are built with the `quick-xml` event writer; inbound
//! documents are parsed with `roxmltree` and inspected through the
//! namespace-aware helpers here. Every outbound envelope declares the full
//! prefix set Windows expects (`soap wsa wsd pub wsx wsdp pnpx`) on the
//! envelope element.

pub mod metadata;

use std::io;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use uuid::Uuid;

/// Namespace URIs used by WS-Discovery and the Devices Profile.
pub mod ns {
    pub const SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
    pub const WSA: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
    pub const WSD: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
    pub const WSDP: &str = "http://schemas.xmlsoap.org/ws/2006/02/devprof";
    pub const PUB: &str = "http://schemas.microsoft.com/windows/pub/2005/07";
    pub const WSX: &str = "http://schemas.xmlsoap.org/ws/2004/09/mex";
    pub const PNPX: &str = "http://schemas.microsoft.com/windows/pnpx/2005/10";
    pub const WSDT: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer";

    /// The discovery "To" URN.
    pub const DISCOVERY_URN: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";
}

/// `To` value for addressed replies.
pub fn anonymous_role() -> String {
    format!("{}/role/anonymous", ns::WSA)
}

/// The type string advertised for this host.
pub const COMPUTER_TYPES: &str = "wsdp:Device pub:Computer";

/// Normalize writer errors to `io::Error` regardless of the underlying
/// error type quick-xml reports.
fn io_err<E>(err: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Ordering triple attached to sequenced messages so receivers can detect
/// restarts and gaps.
#[derive(Debug, Clone, Copy)]
pub struct AppSequence {
    pub instance_id: u64,
    pub message_number: u64,
}

/// Data for a `GetResponse` body.
#[derive(Debug)]
pub struct GetResponseData<'a> {
    pub endpoint: &'a str,
    pub friendly_name: &'a str,
    pub full_computer_name: &'a str,
    /// Listener address, stringified without brackets or scope.
    pub host_addr: &'a str,
    /// Raw XML of a user-provided metadata template, if configured.
    pub metadata_template: Option<&'a str>,
}

/// Body variants an envelope can carry.
#[derive(Debug)]
pub enum Body<'a> {
    Hello { endpoint: &'a str },
    Bye { endpoint: &'a str },
    ProbeMatches { endpoint: &'a str },
    ResolveMatches { endpoint: &'a str, xaddrs: &'a str },
    GetResponse(GetResponseData<'a>),
}

/// Builder for outbound envelopes, mirroring the header/body split of the
/// wire format.
#[derive(Debug)]
pub struct EnvelopeBuilder<'a> {
    to: &'a str,
    action: String,
    relates_to: Option<&'a str>,
    app_sequence: Option<AppSequence>,
    body: Body<'a>,
}

impl<'a> EnvelopeBuilder<'a> {
    pub fn new(to: &'a str, action: String, body: Body<'a>) -> Self {
        Self {
            to,
            action,
            relates_to: None,
            app_sequence: None,
            body,
        }
    }

    pub fn relates_to(mut self, message_id: &'a str) -> Self {
        self.relates_to = Some(message_id);
        self
    }

    pub fn app_sequence(mut self, seq: AppSequence) -> Self {
        self.app_sequence = Some(seq);
        self
    }

    /// Serialize to UTF-8 bytes.
    pub fn build(&self) -> io::Result<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(io_err)?;

        let mut envelope = BytesStart::new("soap:Envelope");
        envelope.push_attribute(("xmlns:soap", ns::SOAP));
        envelope.push_attribute(("xmlns:wsa", ns::WSA));
        envelope.push_attribute(("xmlns:wsd", ns::WSD));
        envelope.push_attribute(("xmlns:pub", ns::PUB));
        envelope.push_attribute(("xmlns:wsx", ns::WSX));
        envelope.push_attribute(("xmlns:wsdp", ns::WSDP));
        envelope.push_attribute(("xmlns:pnpx", ns::PNPX));
        writer.write_event(Event::Start(envelope)).map_err(io_err)?;

        self.write_header(&mut writer)?;
        self.write_body(&mut writer)?;

        writer
            .write_event(Event::End(BytesEnd::new("soap:Envelope")))
            .map_err(io_err)?;
        Ok(writer.into_inner())
    }

    fn write_header(&self, writer: &mut Writer<Vec<u8>>) -> io::Result<()> {
        start(writer, "soap:Header")?;
        text_element(writer, "wsa:To", self.to)?;
        text_element(writer, "wsa:Action", &self.action)?;
        text_element(writer, "wsa:MessageID", &Uuid::new_v4().urn().to_string())?;

        if let Some(relates_to) = self.relates_to {
            text_element(writer, "wsa:RelatesTo", relates_to)?;
        }

        if let Some(seq) = self.app_sequence {
            let instance_id = seq.instance_id.to_string();
            let sequence_id = Uuid::new_v4().urn().to_string();
            let message_number = seq.message_number.to_string();
            let mut elem = BytesStart::new("wsd:AppSequence");
            elem.push_attribute(("InstanceId", instance_id.as_str()));
            elem.push_attribute(("SequenceId", sequence_id.as_str()));
            elem.push_attribute(("MessageNumber", message_number.as_str()));
            writer.write_event(Event::Empty(elem)).map_err(io_err)?;
        }

        end(writer, "soap:Header")
    }

    fn write_body(&self, writer: &mut Writer<Vec<u8>>) -> io::Result<()> {
        start(writer, "soap:Body")?;
        match &self.body {
            Body::Hello { endpoint } => {
                start(writer, "wsd:Hello")?;
                write_endpoint_reference(writer, endpoint)?;
                text_element(writer, "wsd:Types", COMPUTER_TYPES)?;
                text_element(writer, "wsd:MetadataVersion", "1")?;
                end(writer, "wsd:Hello")?;
            }
            Body::Bye { endpoint } => {
                start(writer, "wsd:Bye")?;
                write_endpoint_reference(writer, endpoint)?;
                end(writer, "wsd:Bye")?;
            }
            Body::ProbeMatches { endpoint } => {
                start(writer, "wsd:ProbeMatches")?;
                start(writer, "wsd:ProbeMatch")?;
                write_endpoint_reference(writer, endpoint)?;
                text_element(writer, "wsd:Types", COMPUTER_TYPES)?;
                text_element(writer, "wsd:MetadataVersion", "1")?;
                end(writer, "wsd:ProbeMatch")?;
                end(writer, "wsd:ProbeMatches")?;
            }
            Body::ResolveMatches { endpoint, xaddrs } => {
                start(writer, "wsd:ResolveMatches")?;
                start(writer, "wsd:ResolveMatch")?;
                write_endpoint_reference(writer, endpoint)?;
                text_element(writer, "wsd:Types", COMPUTER_TYPES)?;
                text_element(writer, "wsd:XAddrs", xaddrs)?;
                text_element(writer, "wsd:MetadataVersion", "1")?;
                end(writer, "wsd:ResolveMatch")?;
                end(writer, "wsd:ResolveMatches")?;
            }
            Body::GetResponse(data) => {
                metadata::write_metadata(writer, data)?;
            }
        }
        end(writer, "soap:Body")
    }
}

pub(crate) fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> io::Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(io_err)
}

pub(crate) fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> io::Result<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(io_err)
}

pub(crate) fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> io::Result<()> {
    start(writer, name)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(io_err)?;
    end(writer, name)
}

pub(crate) fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> io::Result<()> {
    writer.write_event(event).map_err(io_err)
}

fn write_endpoint_reference(writer: &mut Writer<Vec<u8>>, address: &str) -> io::Result<()> {
    start(writer, "wsa:EndpointReference")?;
    text_element(writer, "wsa:Address", address)?;
    end(writer, "wsa:EndpointReference")
}

// ===== Inbound inspection =====

/// First child element with the given namespace and local name.
pub fn find_child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    namespace: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && is_named(*child, namespace, name))
}

/// True when the element carries the given expanded name.
pub fn is_named(node: roxmltree::Node<'_, '_>, namespace: &str, name: &str) -> bool {
    node.tag_name().name() == name && node.tag_name().namespace() == Some(namespace)
}

/// Trimmed text content of the first matching child, if any.
pub fn child_text<'a>(
    node: roxmltree::Node<'a, '_>,
    namespace: &str,
    name: &str,
) -> Option<&'a str> {
    find_child(node, namespace, name).and_then(|child| child.text()).map(str::trim)
}

/// The `soap:Header` fields the protocol machine cares about.
#[derive(Debug)]
pub struct RequestHeader {
    pub message_id: String,
    pub action: String,
}

/// Extract `MessageID` and `Action` from a parsed envelope. Returns `None`
/// when the document is not an addressed SOAP envelope.
pub fn parse_request_header(doc: &roxmltree::Document<'_>) -> Option<RequestHeader> {
    let envelope = doc.root_element();
    if !is_named(envelope, ns::SOAP, "Envelope") {
        return None;
    }
    let header = find_child(envelope, ns::SOAP, "Header")?;
    let message_id = child_text(header, ns::WSA, "MessageID")?.to_owned();
    let action = child_text(header, ns::WSA, "Action")?.to_owned();
    Some(RequestHeader { message_id, action })
}

/// `soap:Body` of a parsed envelope.
pub fn body<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
) -> Option<roxmltree::Node<'a, 'input>> {
    let envelope = doc.root_element();
    if !is_named(envelope, ns::SOAP, "Envelope") {
        return None;
    }
    find_child(envelope, ns::SOAP, "Body")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_hello() -> String {
        let bytes = EnvelopeBuilder::new(
            ns::DISCOVERY_URN,
            format!("{}/Hello", ns::WSD),
            Body::Hello {
                endpoint: "urn:uuid:11111111-2222-3333-4444-555555555555",
            },
        )
        .app_sequence(AppSequence {
            instance_id: 77,
            message_number: 1,
        })
        .build()
        .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn hello_has_expected_shape() {
        let xml = build_hello();
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let envelope = doc.root_element();
        assert!(is_named(envelope, ns::SOAP, "Envelope"));

        let header = find_child(envelope, ns::SOAP, "Header").unwrap();
        assert_eq!(child_text(header, ns::WSA, "To"), Some(ns::DISCOVERY_URN));
        assert_eq!(
            child_text(header, ns::WSA, "Action").unwrap(),
            format!("{}/Hello", ns::WSD)
        );
        assert!(child_text(header, ns::WSA, "MessageID")
            .unwrap()
            .starts_with("urn:uuid:"));

        let seq = find_child(header, ns::WSD, "AppSequence").unwrap();
        assert_eq!(seq.attribute("InstanceId"), Some("77"));
        assert_eq!(seq.attribute("MessageNumber"), Some("1"));
        assert!(seq.attribute("SequenceId").unwrap().starts_with("urn:uuid:"));

        let body_node = body(&doc).unwrap();
        let hello = find_child(body_node, ns::WSD, "Hello").unwrap();
        let epr = find_child(hello, ns::WSA, "EndpointReference").unwrap();
        assert_eq!(
            child_text(epr, ns::WSA, "Address"),
            Some("urn:uuid:11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(child_text(hello, ns::WSD, "Types"), Some(COMPUTER_TYPES));
        assert_eq!(child_text(hello, ns::WSD, "MetadataVersion"), Some("1"));
    }

    #[test]
    fn reply_headers_round_trip() {
        let bytes = EnvelopeBuilder::new(
            &anonymous_role(),
            format!("{}/ProbeMatches", ns::WSD),
            Body::ProbeMatches {
                endpoint: "urn:uuid:abc",
            },
        )
        .relates_to("urn:uuid:11111111-1111-1111-1111-111111111111")
        .app_sequence(AppSequence {
            instance_id: 1,
            message_number: 2,
        })
        .build()
        .unwrap();

        let xml = String::from_utf8(bytes).unwrap();
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let parsed = parse_request_header(&doc).unwrap();
        assert_eq!(parsed.action, format!("{}/ProbeMatches", ns::WSD));

        let header = find_child(doc.root_element(), ns::SOAP, "Header").unwrap();
        assert_eq!(
            child_text(header, ns::WSA, "RelatesTo"),
            Some("urn:uuid:11111111-1111-1111-1111-111111111111")
        );

        let matches = find_child(body(&doc).unwrap(), ns::WSD, "ProbeMatches").unwrap();
        assert!(find_child(matches, ns::WSD, "ProbeMatch").is_some());
    }

    #[test]
    fn resolve_matches_carries_xaddrs() {
        let bytes = EnvelopeBuilder::new(
            &anonymous_role(),
            format!("{}/ResolveMatches", ns::WSD),
            Body::ResolveMatches {
                endpoint: "urn:uuid:abc",
                xaddrs: "http://192.168.1.10:5357/abc",
            },
        )
        .build()
        .unwrap();
        let xml = String::from_utf8(bytes).unwrap();
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let matches = find_child(body(&doc).unwrap(), ns::WSD, "ResolveMatches").unwrap();
        let single = find_child(matches, ns::WSD, "ResolveMatch").unwrap();
        assert_eq!(
            child_text(single, ns::WSD, "XAddrs"),
            Some("http://192.168.1.10:5357/abc")
        );
    }

    #[test]
    fn header_parse_rejects_foreign_documents() {
        let doc = roxmltree::Document::parse("<not-soap/>").unwrap();
        assert!(parse_request_header(&doc).is_none());
        assert!(body(&doc).is_none());
    }

    #[test]
    fn text_content_is_escaped() {
        let bytes = EnvelopeBuilder::new(
            ns::DISCOVERY_URN,
            format!("{}/Bye", ns::WSD),
            Body::Bye {
                endpoint: "urn:uuid:a&b<c>",
            },
        )
        .build()
        .unwrap();
        let xml = String::from_utf8(bytes).unwrap();
        assert!(xml.contains("urn:uuid:a&amp;b&lt;c&gt;"));
        // And it must parse back to the original value.
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let bye = find_child(body(&doc).unwrap(), ns::WSD, "Bye").unwrap();
        let epr = find_child(bye, ns::WSA, "EndpointReference").unwrap();
        assert_eq!(child_text(epr, ns::WSA, "Address"), Some("urn:uuid:a&b<c>"));
    }
}
