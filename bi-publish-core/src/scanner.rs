//! Locates embedded connection descriptors in raw document XML.
//!
//! The scan is event based and does not validate the document: only
//! `<named-connections>`, `<named-connection>` and the first `<connection>`
//! nested in each named connection are looked at. Descriptors come back in
//! document order.

use std::collections::HashMap;
use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::contract::RemoteConnection;
use crate::error::PublishError;

const NAMED_CONNECTIONS: &[u8] = b"named-connections";
const NAMED_CONNECTION: &[u8] = b"named-connection";
const CONNECTION: &[u8] = b"connection";

/// Attributes of the `<connection>` element nested in a named connection,
/// as they appear in the source document (unescaped).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionAttributes {
    pub class: String,
    pub server: String,
    pub port: String,
    pub username: String,
    pub schema: String,
    pub dbname: String,
}

/// One `<named-connection>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedConnection {
    /// Author-assigned caption; the identity the resolver understands.
    pub caption: String,
    /// Internal name referenced by `<relation connection='..'>`.
    pub name: String,
    pub connection: ConnectionAttributes,
}

/// (engine type, server, port, username): how a server-side connection is
/// matched back to the caption embedded in the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub engine: String,
    pub server: String,
    pub port: String,
    pub username: String,
}

impl CompositeKey {
    pub fn from_named(connection: &ConnectionAttributes) -> Self {
        CompositeKey {
            engine: connection.class.clone(),
            server: connection.server.clone(),
            port: connection.port.clone(),
            username: connection.username.clone(),
        }
    }

    pub fn from_remote(connection: &RemoteConnection) -> Self {
        CompositeKey {
            engine: connection.connection_type.clone(),
            server: connection.server_address.clone(),
            port: connection.server_port.clone(),
            username: connection.user_name.clone(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.engine, self.server, self.port, self.username
        )
    }
}

/// Result of a full scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub connections: Vec<NamedConnection>,
    /// Number of `<named-connections>` sections seen.
    pub sections: usize,
}

/// Scans `xml` for every named connection, in document order.
pub fn scan(xml: &str) -> Result<ScanResult, PublishError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();
    let mut result = ScanResult::default();
    let mut current: Option<NamedConnection> = None;
    let mut connection_seen = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| PublishError::parse("document XML", e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    NAMED_CONNECTIONS => result.sections += 1,
                    NAMED_CONNECTION => {
                        let named = NamedConnection {
                            caption: attribute(e, b"caption")?,
                            name: attribute(e, b"name")?,
                            connection: ConnectionAttributes::default(),
                        };
                        if is_empty {
                            result.connections.push(named);
                        } else {
                            current = Some(named);
                            connection_seen = false;
                        }
                    }
                    CONNECTION if !connection_seen => {
                        if let Some(named) = current.as_mut() {
                            named.connection = ConnectionAttributes {
                                class: attribute(e, b"class")?,
                                server: attribute(e, b"server")?,
                                port: attribute(e, b"port")?,
                                username: attribute(e, b"username")?,
                                schema: attribute(e, b"schema")?,
                                dbname: attribute(e, b"dbname")?,
                            };
                            connection_seen = true;
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) if e.name().as_ref() == NAMED_CONNECTION => {
                if let Some(named) = current.take() {
                    result.connections.push(named);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    debug!(
        connections = result.connections.len(),
        sections = result.sections,
        "Scanned named connections"
    );
    Ok(result)
}

/// Captions of every named connection, in document order. Empty captions
/// are skipped; duplicates are kept.
pub fn scan_captions(xml: &str) -> Result<Vec<String>, PublishError> {
    Ok(scan(xml)?
        .connections
        .into_iter()
        .map(|c| c.caption)
        .filter(|caption| !caption.is_empty())
        .collect())
}

/// Builds the composite key → caption lookup of a data-source document.
/// Exactly one `<named-connections>` section is expected.
pub fn caption_lookup(xml: &str) -> Result<HashMap<CompositeKey, String>, PublishError> {
    let scanned = scan(xml)?;
    if scanned.sections != 1 {
        return Err(PublishError::parse(
            "data source named connections",
            format!(
                "expected exactly one <named-connections> section, found {}",
                scanned.sections
            ),
        ));
    }
    Ok(scanned
        .connections
        .into_iter()
        .map(|named| (CompositeKey::from_named(&named.connection), named.caption))
        .collect())
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<String, PublishError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| PublishError::parse("document XML attribute", e))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| PublishError::parse("document XML attribute value", e))?;
            return Ok(value.into_owned());
        }
    }
    Ok(String::new())
}
