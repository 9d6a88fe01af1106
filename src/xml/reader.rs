//! Fragment parser: quick-xml events into the arena document model.
//!
//! Whitespace between sibling elements is dropped at parse time (the
//! writer regenerates indentation), while genuine text content and tails
//! are kept verbatim. Attribute order is preserved exactly as read,
//! including `xmlns:*` declarations and `xmi:version`, which are treated
//! as ordinary attributes.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{Document, NodeId};
use crate::error::{Error, Result};

/// Parse one fragment file into a [`Document`].
///
/// `fragment` is only used for error context.
pub fn parse(input: &[u8], fragment: &Path) -> Result<Document> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();

    let mut doc: Option<Document> = None;
    let mut stack: Vec<NodeId> = Vec::new();
    // Top-level comments seen before the root element exists.
    let mut leading: Vec<String> = Vec::new();

    let bad = |reader: &Reader<&[u8]>, message: String| {
        Error::malformed(
            fragment,
            format!("at byte {}: {message}", reader.buffer_position()),
        )
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let id = open_element(&mut doc, &stack, &mut leading, e, fragment, &reader)?;
                stack.push(id);
            }
            Ok(Event::Empty(ref e)) => {
                open_element(&mut doc, &stack, &mut leading, e, fragment, &reader)?;
            }
            Ok(Event::End(_)) => {
                // Tag mismatches surface as Err from quick-xml.
                stack.pop();
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| bad(&reader, format!("bad text content: {err}")))?;
                if text.trim().is_empty() {
                    continue;
                }
                let Some(parent) = stack.last().copied() else {
                    return Err(bad(
                        &reader,
                        "text content outside of the root element".into(),
                    ));
                };
                attach_text(doc.as_mut().expect("parent implies document"), parent, &text);
            }
            Ok(Event::CData(ref e)) => {
                let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                let Some(parent) = stack.last().copied() else {
                    return Err(bad(&reader, "CDATA outside of the root element".into()));
                };
                attach_text(doc.as_mut().expect("parent implies document"), parent, &text);
            }
            Ok(Event::Comment(ref e)) => {
                // Comment content is not entity-parsed in XML; keep the
                // raw bytes.
                let text = std::str::from_utf8(e.as_ref())
                    .map_err(|err| bad(&reader, format!("bad comment: {err}")))?
                    .to_owned();
                match (stack.last().copied(), doc.as_mut()) {
                    (Some(parent), Some(doc)) => {
                        let comment = doc.create_comment(text);
                        doc.append_child(parent, comment);
                    }
                    (None, Some(doc)) => doc.trailing_comments.push(text),
                    (None, None) => leading.push(text),
                    (Some(_), None) => unreachable!("stack implies document"),
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(bad(&reader, format!("XML parse error: {e}")));
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(Error::malformed(
            fragment,
            "unterminated element at end of file",
        ));
    }
    doc.ok_or_else(|| Error::malformed(fragment, "no root element"))
}

fn open_element(
    doc: &mut Option<Document>,
    stack: &[NodeId],
    leading: &mut Vec<String>,
    e: &BytesStart<'_>,
    fragment: &Path,
    reader: &Reader<&[u8]>,
) -> Result<NodeId> {
    let tag = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| Error::malformed(fragment, format!("invalid tag name: {err}")))?
        .to_owned();

    let id = match (doc.as_mut(), stack.last().copied()) {
        (None, _) => {
            let mut new = Document::new(tag);
            new.leading_comments = std::mem::take(leading);
            let root = new.root();
            *doc = Some(new);
            root
        }
        (Some(doc), Some(parent)) => {
            let id = doc.create_element(tag);
            doc.append_child(parent, id);
            id
        }
        (Some(_), None) => {
            return Err(Error::malformed(
                fragment,
                format!(
                    "multiple root elements (second one at byte {})",
                    reader.buffer_position()
                ),
            ));
        }
    };

    let doc = doc.as_mut().expect("document was just ensured");
    for attr in e.attributes() {
        let attr =
            attr.map_err(|err| Error::malformed(fragment, format!("bad attribute syntax: {err}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| Error::malformed(fragment, format!("invalid attribute key: {err}")))?
            .to_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| Error::malformed(fragment, format!("bad attribute value: {err}")))?
            .into_owned();
        doc.node_mut(id).attrs.insert(key, value);
    }
    Ok(id)
}

/// Attach text content: before the first child it becomes the parent's
/// `text`, after a child it becomes that child's `tail`.
fn attach_text(doc: &mut Document, parent: NodeId, text: &str) {
    if let Some(last) = doc.node(parent).children.last().copied() {
        let tail = doc.node_mut(last).tail.get_or_insert_with(String::new);
        tail.push_str(text);
    } else {
        let own = doc.node_mut(parent).text.get_or_insert_with(String::new);
        own.push_str(text);
    }
}
