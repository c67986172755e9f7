//! Position-scoped rewriting of workbook connection blocks.
//!
//! The document is never re-serialised. Each edit is a [`Splice`] over byte
//! offsets of the original text; splices are applied in one pass sorted by
//! start offset and must not overlap. Bytes outside the splices are copied
//! verbatim.

use std::collections::HashMap;
use std::ops::Range;

use quick_xml::escape::{escape, unescape};
use regex::Regex;
use tracing::{debug, info};

use crate::contract::{ConnectionResolver, TargetConnection};
use crate::error::PublishError;
use crate::scanner::{self, NamedConnection};

const NAMED_CONNECTION_END: &str = "</named-connection>";

/// Replace `start..end` of the source text with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

/// Outcome of rewriting a single-file workbook.
#[derive(Debug, Clone)]
pub struct RewrittenWorkbook {
    pub text: String,
    /// Internal connection name → new schema, for connections that received
    /// a schema override.
    pub schema_overrides: HashMap<String, String>,
    pub connections_rewritten: usize,
}

/// Applies non-overlapping splices to `text` in one pass.
pub fn apply_splices(text: &str, mut splices: Vec<Splice>) -> Result<String, PublishError> {
    splices.sort_by_key(|s| (s.start, s.end));
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for splice in &splices {
        if splice.start < pos || splice.end < splice.start || splice.end > text.len() {
            return Err(PublishError::Rewrite {
                context: "document".into(),
                details: format!(
                    "splice {}..{} overlaps a previous edit or lies outside the document",
                    splice.start, splice.end
                ),
            });
        }
        out.push_str(&text[pos..splice.start]);
        out.push_str(&splice.replacement);
        pos = splice.end;
    }
    out.push_str(&text[pos..]);
    Ok(out)
}

/// Rewrites server, username and schema of every captioned named connection
/// in a single-file workbook, then points dependent `<relation>` tables at
/// the new schemas.
///
/// Any caption the resolver does not know fails the whole rewrite.
pub fn rewrite_workbook<R>(xml: &str, resolver: &R) -> Result<RewrittenWorkbook, PublishError>
where
    R: ConnectionResolver + ?Sized,
{
    let named = scanner::scan(xml)?.connections;
    let mut splices = Vec::new();
    let mut schema_overrides = HashMap::new();
    let mut cursor = 0;
    let mut rewritten = 0;

    for connection in named.iter().filter(|c| !c.caption.is_empty()) {
        let target = resolver
            .resolve(&connection.caption)
            .map_err(|e| PublishError::Resolution {
                identity: connection.caption.clone(),
                reason: e.to_string(),
            })?;
        let block = locate_named_connection(xml, &connection.name, cursor)?;
        cursor = block.end;
        splices.extend(connection_splices(xml, block, connection, &target)?);
        if !target.schema.is_empty() {
            schema_overrides.insert(connection.name.clone(), target.schema.clone());
        }
        rewritten += 1;
        debug!(
            caption = %connection.caption,
            name = %connection.name,
            server = %target.server_address,
            "Rewrote named connection"
        );
    }

    let text = apply_splices(xml, splices)?;
    let relation_splices = relation_schema_splices(&text, &schema_overrides)?;
    let relations = relation_splices.len();
    let text = apply_splices(&text, relation_splices)?;

    info!(
        connections = rewritten,
        relations,
        "Rewrote workbook connections"
    );
    Ok(RewrittenWorkbook {
        text,
        schema_overrides,
        connections_rewritten: rewritten,
    })
}

/// Byte range of the `<named-connection>` element named `name`, searching
/// from `from` onwards.
fn locate_named_connection(xml: &str, name: &str, from: usize) -> Result<Range<usize>, PublishError> {
    let escaped = regex::escape(&escape(name));
    let start_tag = Regex::new(&format!(
        r#"<named-connection\b[^>]*\sname\s*=\s*(?:'{escaped}'|"{escaped}")[^>]*>"#
    ))
    .map_err(|e| rewrite_error(name, e))?;

    let tag = start_tag
        .find_at(xml, from)
        .ok_or_else(|| rewrite_error(name, "start tag not found"))?;
    if tag.as_str().ends_with("/>") {
        return Ok(tag.range());
    }
    let end = xml[tag.end()..]
        .find(NAMED_CONNECTION_END)
        .ok_or_else(|| rewrite_error(name, "end tag not found"))?;
    Ok(tag.start()..tag.end() + end + NAMED_CONNECTION_END.len())
}

fn connection_splices(
    xml: &str,
    block: Range<usize>,
    connection: &NamedConnection,
    target: &TargetConnection,
) -> Result<Vec<Splice>, PublishError> {
    let connection_tag = Regex::new(r"<connection\b[^>]*>").map_err(|e| rewrite_error(&connection.name, e))?;
    let Some(tag) = connection_tag.find(&xml[block.clone()]) else {
        return Ok(Vec::new());
    };
    let tag_start = block.start + tag.start();
    let tag_text = tag.as_str();

    let mut replacements = vec![
        ("server", target.server_address.as_str()),
        ("username", target.user_name.as_str()),
    ];
    if !target.schema.is_empty() {
        replacements.push(("schema", target.schema.as_str()));
    }

    let mut splices = Vec::new();
    for (attribute, value) in replacements {
        if let Some(range) = attribute_value_range(tag_text, attribute)? {
            let current = &tag_text[range.clone()];
            if decoded_equals(current, value) {
                continue;
            }
            splices.push(Splice {
                start: tag_start + range.start,
                end: tag_start + range.end,
                replacement: escape(value).into_owned(),
            });
        }
    }
    Ok(splices)
}

/// Splices pointing `<relation table='[schema].[table]'>` at the overridden
/// schema of the relation's connection.
fn relation_schema_splices(
    xml: &str,
    schema_overrides: &HashMap<String, String>,
) -> Result<Vec<Splice>, PublishError> {
    if schema_overrides.is_empty() {
        return Ok(Vec::new());
    }
    let relation_tag =
        Regex::new(r"<relation\b[^>]*>").map_err(|e| rewrite_error("relation", e))?;
    let schema_segment =
        Regex::new(r"^\[([^\]]*)\]\.").map_err(|e| rewrite_error("relation", e))?;

    let mut splices = Vec::new();
    for tag in relation_tag.find_iter(xml) {
        let tag_text = tag.as_str();
        let Some(conn_range) = attribute_value_range(tag_text, "connection")? else {
            continue;
        };
        let connection = decode(&tag_text[conn_range]);
        let Some(schema) = schema_overrides.get(connection.as_str()) else {
            continue;
        };
        let Some(table_range) = attribute_value_range(tag_text, "table")? else {
            continue;
        };
        let table = &tag_text[table_range.clone()];
        let Some(segment) = schema_segment.captures(table).and_then(|c| c.get(1)) else {
            continue;
        };
        if decoded_equals(segment.as_str(), schema) {
            continue;
        }
        let start = tag.start() + table_range.start + segment.start();
        splices.push(Splice {
            start,
            end: start + segment.len(),
            replacement: escape(schema.as_str()).into_owned(),
        });
    }
    Ok(splices)
}

/// Range of the raw (escaped) value of `attribute` inside one tag.
fn attribute_value_range(tag: &str, attribute: &str) -> Result<Option<Range<usize>>, PublishError> {
    let pattern = Regex::new(&format!(
        r#"\s{}\s*=\s*(?:'([^']*)'|"([^"]*)")"#,
        regex::escape(attribute)
    ))
    .map_err(|e| rewrite_error(attribute, e))?;
    Ok(pattern
        .captures(tag)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.range()))
}

fn decode(raw: &str) -> String {
    unescape(raw)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn decoded_equals(raw: &str, value: &str) -> bool {
    decode(raw) == value
}

fn rewrite_error(context: &str, details: impl std::fmt::Display) -> PublishError {
    PublishError::Rewrite {
        context: format!("named connection '{context}'"),
        details: details.to_string(),
    }
}
