// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device metadata bodies for `GetResponse`.
//!
//! Either a user-supplied XML template (with `$`-placeholder substitution in
//! every text node and attribute value) or the built-in three-section
//! `wsx:Metadata` document.

use std::io;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{end, ns, start, text_element, write_event, GetResponseData};

/// Write the `GetResponse` body: the rendered template when one is
/// configured, the built-in metadata otherwise.
pub(super) fn write_metadata(
    writer: &mut Writer<Vec<u8>>,
    data: &GetResponseData<'_>,
) -> io::Result<()> {
    match data.metadata_template {
        Some(template) => write_template(writer, template, data),
        None => write_builtin(writer, data),
    }
}

fn write_builtin(writer: &mut Writer<Vec<u8>>, data: &GetResponseData<'_>) -> io::Result<()> {
    start(writer, "wsx:Metadata")?;

    let dialect = format!("{}/ThisDevice", ns::WSDP);
    let mut section = BytesStart::new("wsx:MetadataSection");
    section.push_attribute(("Dialect", dialect.as_str()));
    write_event(writer, Event::Start(section))?;
    start(writer, "wsdp:ThisDevice")?;
    text_element(writer, "wsdp:FriendlyName", data.friendly_name)?;
    text_element(writer, "wsdp:FirmwareVersion", "1.0")?;
    text_element(writer, "wsdp:SerialNumber", "1")?;
    end(writer, "wsdp:ThisDevice")?;
    end(writer, "wsx:MetadataSection")?;

    let dialect = format!("{}/ThisModel", ns::WSDP);
    let mut section = BytesStart::new("wsx:MetadataSection");
    section.push_attribute(("Dialect", dialect.as_str()));
    write_event(writer, Event::Start(section))?;
    start(writer, "wsdp:ThisModel")?;
    text_element(writer, "wsdp:Manufacturer", "wsdd")?;
    text_element(writer, "wsdp:ModelName", "wsdd")?;
    text_element(writer, "pnpx:DeviceCategory", "Computers")?;
    end(writer, "wsdp:ThisModel")?;
    end(writer, "wsx:MetadataSection")?;

    let dialect = format!("{}/Relationship", ns::WSDP);
    let mut section = BytesStart::new("wsx:MetadataSection");
    section.push_attribute(("Dialect", dialect.as_str()));
    write_event(writer, Event::Start(section))?;
    let relationship_type = format!("{}/host", ns::WSDP);
    let mut relationship = BytesStart::new("wsdp:Relationship");
    relationship.push_attribute(("Type", relationship_type.as_str()));
    write_event(writer, Event::Start(relationship))?;
    start(writer, "wsdp:Host")?;
    start(writer, "wsa:EndpointReference")?;
    text_element(writer, "wsa:Address", data.endpoint)?;
    end(writer, "wsa:EndpointReference")?;
    text_element(writer, "wsdp:Types", "pub:Computer")?;
    text_element(writer, "wsdp:ServiceId", data.endpoint)?;
    text_element(writer, "pub:Computer", data.full_computer_name)?;
    end(writer, "wsdp:Host")?;
    end(writer, "wsdp:Relationship")?;
    end(writer, "wsx:MetadataSection")?;

    end(writer, "wsx:Metadata")
}

/// Re-serialize the parsed template into the response, substituting
/// placeholders in text nodes and attribute values. Namespace declarations
/// are re-emitted where the template introduced them.
fn write_template(
    writer: &mut Writer<Vec<u8>>,
    template: &str,
    data: &GetResponseData<'_>,
) -> io::Result<()> {
    let doc = roxmltree::Document::parse(template)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_template_element(writer, doc.root_element(), None, data)
}

fn write_template_element(
    writer: &mut Writer<Vec<u8>>,
    node: roxmltree::Node<'_, '_>,
    parent: Option<roxmltree::Node<'_, '_>>,
    data: &GetResponseData<'_>,
) -> io::Result<()> {
    let name = qualified_name(node);

    // Namespace declarations this element introduces (everything for the
    // root), then the regular attributes with substitution applied.
    let mut attrs: Vec<(String, String)> = Vec::new();
    for namespace in node.namespaces() {
        let inherited = parent.map_or(false, |p| {
            p.namespaces()
                .any(|pn| pn.name() == namespace.name() && pn.uri() == namespace.uri())
        });
        if inherited {
            continue;
        }
        let key = match namespace.name() {
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        attrs.push((key, namespace.uri().to_string()));
    }
    for attr in node.attributes() {
        let attr_name = match attr.namespace() {
            Some(uri) => match node.lookup_prefix(uri) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", attr.name()),
                _ => attr.name().to_string(),
            },
            None => attr.name().to_string(),
        };
        attrs.push((attr_name, substitute(attr.value(), data)));
    }

    let mut elem = BytesStart::new(name.as_str());
    for (key, value) in &attrs {
        elem.push_attribute((key.as_str(), value.as_str()));
    }

    if !node.children().any(|child| child.is_element() || child.is_text()) {
        return write_event(writer, Event::Empty(elem));
    }

    write_event(writer, Event::Start(elem))?;
    for child in node.children() {
        if child.is_element() {
            write_template_element(writer, child, Some(node), data)?;
        } else if child.is_text() {
            if let Some(text) = child.text() {
                let replaced = substitute(text, data);
                write_event(writer, Event::Text(BytesText::new(&replaced)))?;
            }
        }
    }
    write_event(writer, Event::End(BytesEnd::new(name.as_str())))
}

fn qualified_name(node: roxmltree::Node<'_, '_>) -> String {
    match node.tag_name().namespace() {
        Some(uri) => match node.lookup_prefix(uri) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", node.tag_name().name()),
            _ => node.tag_name().name().to_string(),
        },
        None => node.tag_name().name().to_string(),
    }
}

/// Replace `$$` with `$` and the known `$TOKEN`s with their values. An
/// unrecognized `$` marker is dropped together with the character that
/// follows it.
pub fn substitute(input: &str, data: &GetResponseData<'_>) -> String {
    if !input.contains('$') {
        return input.to_owned();
    }

    const TOKENS: [(&str, for<'a> fn(&'a GetResponseData<'a>) -> &'a str); 4] = [
        ("ENDPOINT_ID", |d| d.endpoint),
        ("SMB_HOST_DESCRIPTION", |d| d.friendly_name),
        ("SMB_FULL_HOST_NAME", |d| d.full_computer_name),
        ("IP_ADDR", |d| d.host_addr),
    ];

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(tail) = rest.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        let mut matched = false;
        for (token, value) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(value(data));
                rest = tail;
                matched = true;
                break;
            }
        }
        if !matched && !rest.is_empty() {
            let mut chars = rest.chars();
            chars.next();
            rest = chars.as_str();
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::{anonymous_role, Body, EnvelopeBuilder};

    fn sample_data<'a>(template: Option<&'a str>) -> GetResponseData<'a> {
        GetResponseData {
            endpoint: "urn:uuid:0f202b95-2f9d-5c3d-9aa1-9e675c29d0f1",
            friendly_name: "storage box",
            full_computer_name: "storage/Workgroup:WORKGROUP",
            host_addr: "192.168.1.20",
            metadata_template: template,
        }
    }

    fn build_get_response(template: Option<&str>) -> String {
        let bytes = EnvelopeBuilder::new(
            &anonymous_role(),
            format!("{}/GetResponse", ns::WSDT),
            Body::GetResponse(sample_data(template)),
        )
        .build()
        .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn builtin_metadata_has_three_sections() {
        let xml = build_get_response(None);
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let sections: Vec<_> = doc
            .descendants()
            .filter(|node| crate::soap::is_named(*node, ns::WSX, "MetadataSection"))
            .collect();
        assert_eq!(sections.len(), 3);

        let dialects: Vec<_> = sections
            .iter()
            .filter_map(|section| section.attribute("Dialect"))
            .collect();
        assert!(dialects.contains(&format!("{}/ThisDevice", ns::WSDP).as_str()));
        assert!(dialects.contains(&format!("{}/ThisModel", ns::WSDP).as_str()));
        assert!(dialects.contains(&format!("{}/Relationship", ns::WSDP).as_str()));

        let computer = doc
            .descendants()
            .find(|node| crate::soap::is_named(*node, ns::PUB, "Computer"))
            .unwrap();
        assert_eq!(computer.text(), Some("storage/Workgroup:WORKGROUP"));
    }

    #[test]
    fn template_placeholders_are_substituted() {
        let template = r#"<wsx:Metadata xmlns:wsx="http://schemas.xmlsoap.org/ws/2004/09/mex" note="$IP_ADDR"><wsx:MetadataSection Dialect="d">$ENDPOINT_ID and $$literal</wsx:MetadataSection></wsx:Metadata>"#;
        let xml = build_get_response(Some(template));
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let metadata = doc
            .descendants()
            .find(|node| crate::soap::is_named(*node, ns::WSX, "Metadata"))
            .unwrap();
        assert_eq!(metadata.attribute("note"), Some("192.168.1.20"));
        let section = crate::soap::find_child(metadata, ns::WSX, "MetadataSection").unwrap();
        assert_eq!(
            section.text(),
            Some("urn:uuid:0f202b95-2f9d-5c3d-9aa1-9e675c29d0f1 and $literal")
        );
    }

    #[test]
    fn substitution_is_identity_without_dollars() {
        let data = sample_data(None);
        assert_eq!(substitute("plain text", &data), "plain text");
    }

    #[test]
    fn double_dollar_collapses() {
        let data = sample_data(None);
        assert_eq!(substitute("a$$b", &data), "a$b");
        assert_eq!(substitute("$$$IP_ADDR", &data), "$192.168.1.20");
    }

    #[test]
    fn all_tokens_substitute() {
        let data = sample_data(None);
        assert_eq!(
            substitute("$ENDPOINT_ID|$SMB_HOST_DESCRIPTION|$SMB_FULL_HOST_NAME|$IP_ADDR", &data),
            "urn:uuid:0f202b95-2f9d-5c3d-9aa1-9e675c29d0f1|storage box|storage/Workgroup:WORKGROUP|192.168.1.20"
        );
    }
}
