//! An Eclipse-like XML serializer.
//!
//! Stock XML writers produce very different output from the one Capella
//! uses, so a file saved through them would look completely rewritten
//! even when nothing changed semantically. This serializer reproduces
//! the Eclipse output convention byte for byte: two-space indentation,
//! attribute wrapping past a line-length limit, a forced break after the
//! root element's `id`, and Capella's exact entity escaping. Parsing a
//! fragment and serializing it again yields the original bytes.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use super::{Document, NodeId, NodeKind};
use crate::error::{Error, Result};

/// Line length after which attributes wrap, for semantic fragments.
/// Diagram fragments are written with [`usize::MAX`] instead.
pub const LINE_LENGTH: usize = 80;

const INDENT: &[u8] = b"  ";
const LINESEP: &[u8] = b"\n";
const DECLARATION: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Tags that are never collapsed to `<tag/>` when empty.
const ALWAYS_EXPANDED_TAGS: [&str; 2] = ["bodies", "semanticResources"];

/// Serialize `doc` in the Eclipse convention, declaration included.
pub fn to_bytes(doc: &Document, line_length: usize) -> Vec<u8> {
    let mut ser = Serializer {
        buf: Vec::with_capacity(64 * 1024),
        pos: 0,
        line_length,
    };
    ser.emit_raw(DECLARATION);
    ser.emit_linebreak(0);
    for comment in &doc.leading_comments {
        ser.emit_comment(comment);
        ser.emit_linebreak(0);
    }
    ser.emit_element(doc, doc.root(), 0);
    for comment in &doc.trailing_comments {
        ser.emit_linebreak(0);
        ser.emit_comment(comment);
    }
    ser.emit_linebreak(0);
    ser.buf
}

/// Write `doc` to `path` through a staging file in the same directory.
///
/// The target is replaced only by the final rename, so a failure at any
/// point leaves the previously persisted file untouched.
pub fn write_file(doc: &Document, path: &Path, line_length: usize) -> Result<()> {
    let payload = to_bytes(doc, line_length);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| Error::serialization(path, format!("cannot stage: {err}")))?;
    staged
        .write_all(&payload)
        .map_err(|err| Error::serialization(path, err.to_string()))?;
    staged
        .persist(path)
        .map_err(|err| Error::serialization(path, err.to_string()))?;
    Ok(())
}

/// Canonical boolean representation for stored attribute values.
pub fn format_bool(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Canonical float representation for stored attribute values: fixed
/// notation, never scientific, and always at least one fractional digit.
pub fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    if value == value.trunc() {
        return format!("{value:.1}");
    }
    // Shortest fixed-notation form that parses back to the same value;
    // `{}` would switch to scientific notation for small magnitudes.
    for precision in 1..=17 {
        let formatted = format!("{value:.precision$}");
        if formatted.parse() == Ok(value) {
            return formatted;
        }
    }
    format!("{value:.17}")
}

struct Serializer {
    buf: Vec<u8>,
    /// Width of the current output line so far.
    pos: usize,
    line_length: usize,
}

impl Serializer {
    fn emit_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn emit_linebreak(&mut self, indent: usize) {
        self.buf.extend_from_slice(LINESEP);
        for _ in 0..indent {
            self.buf.extend_from_slice(INDENT);
        }
        self.pos = INDENT.len() * indent;
    }

    fn emit_escaped(&mut self, string: &str, charset: EscapeCharset) {
        let escaped = escape(string, charset);
        self.emit_raw(escaped.as_bytes());
    }

    /// Text content with embedded newlines restarts the line position.
    fn emit_multiline(&mut self, text: &str, charset: EscapeCharset) {
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                self.emit_linebreak(0);
            }
            self.emit_escaped(line, charset);
        }
    }

    fn emit_comment(&mut self, text: &str) {
        self.emit_raw(b"<!--");
        self.emit_multiline(text, EscapeCharset::Comment);
        self.emit_raw(b"-->");
    }

    fn emit_element(&mut self, doc: &Document, id: NodeId, indent: usize) {
        let node = doc.node(id);
        self.emit_raw(b"<");
        self.emit_raw(node.tag.as_bytes());

        let is_root = node.parent.is_none();
        let mut force_break = false;
        for (key, value) in &node.attrs {
            if force_break || self.pos > self.line_length {
                self.emit_linebreak(indent + 2);
            } else {
                self.emit_raw(b" ");
            }
            self.emit_raw(key.as_bytes());
            self.emit_raw(b"=\"");
            self.emit_escaped(value, EscapeCharset::Attribute);
            self.emit_raw(b"\"");
            // Capella puts everything after the root's id on fresh lines.
            force_break = is_root && key == "id";
        }

        let has_children = !node.children.is_empty();
        if node.text.is_none()
            && !has_children
            && !ALWAYS_EXPANDED_TAGS.contains(&node.tag.as_str())
        {
            self.emit_raw(b"/>");
            return;
        }
        self.emit_raw(b">");

        let mut trailing_text = match &node.text {
            Some(text) => {
                self.emit_multiline(text, EscapeCharset::Text);
                true
            }
            None => false,
        };
        for &child in &node.children {
            if !trailing_text {
                self.emit_linebreak(indent + 1);
            }
            match doc.node(child).kind {
                NodeKind::Element => self.emit_element(doc, child, indent + 1),
                NodeKind::Comment => {
                    self.emit_comment(doc.node(child).text.as_deref().unwrap_or(""));
                }
            }
            trailing_text = match &doc.node(child).tail {
                Some(tail) => {
                    self.emit_multiline(tail, EscapeCharset::Text);
                    true
                }
                None => false,
            };
        }

        if has_children && !trailing_text {
            self.emit_linebreak(indent);
        }
        self.emit_raw(b"</");
        self.emit_raw(node.tag.as_bytes());
        self.emit_raw(b">");
    }
}

#[derive(Clone, Copy, Debug)]
enum EscapeCharset {
    Attribute,
    Text,
    Comment,
}

fn escape(string: &str, charset: EscapeCharset) -> Cow<'_, str> {
    let mut output: Option<String> = None;
    for (i, c) in string.char_indices() {
        let needs_escape = match (charset, c) {
            (_, '\x00'..='\x08' | '\x0A'..='\x1F' | '\x7F') => true,
            (EscapeCharset::Attribute, '\x09') => true,
            (EscapeCharset::Attribute | EscapeCharset::Text, '"' | '&' | '<') => true,
            (EscapeCharset::Comment, '>') => true,
            _ => false,
        };

        if needs_escape {
            let out = output.get_or_insert_with(|| string[..i].to_owned());
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                c => {
                    let _ = write!(out, "&#x{:X};", c as u32);
                }
            }
        } else if let Some(out) = output.as_mut() {
            out.push(c);
        }
    }

    match output {
        Some(output) => Cow::Owned(output),
        None => Cow::Borrowed(string),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::xml::reader;

    const DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

    fn roundtrip(input: &str, line_length: usize) -> Vec<u8> {
        let doc = reader::parse(input.as_bytes(), Path::new("test.capella")).expect("parse");
        to_bytes(&doc, line_length)
    }

    #[rstest]
    #[case::attribute("<p title=\"&#x9;&amp;Hello, &lt;&quot;World&quot;>!\"/>\n")]
    #[case::text("<p>\t&amp;Hello, &lt;&quot;World&quot;>!</p>\n")]
    #[case::comment("<!--\t&Hello, <\"World\"&gt;!-->\n<p/>\n")]
    fn escaping_roundtrips(#[case] body: &str) {
        let input = format!("{DECL}{body}");
        assert_eq!(roundtrip(&input, usize::MAX), input.as_bytes());
    }

    #[rstest]
    #[case('\x01', "&#x1;")]
    #[case('\x1f', "&#x1F;")]
    #[case('\x7f', "&#x7F;")]
    fn control_characters_use_uppercase_hex(#[case] c: char, #[case] expected: &str) {
        let s = c.to_string();
        let escaped = escape(&s, EscapeCharset::Text);
        assert_eq!(escaped, expected);
    }

    #[test]
    fn tab_is_escaped_only_in_attributes() {
        assert_eq!(escape("\t", EscapeCharset::Attribute), "&#x9;");
        assert_eq!(escape("\t", EscapeCharset::Text), "\t");
        assert_eq!(escape("\t", EscapeCharset::Comment), "\t");
    }

    #[test]
    fn indents_children_two_spaces_per_level() {
        let input = format!("{DECL}<root>\n  <a>\n    <b/>\n  </a>\n</root>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn root_id_forces_break_for_following_attributes() {
        let input = format!("{DECL}<root id=\"r\"\n    name=\"n\" other=\"o\"/>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn non_root_id_does_not_force_break() {
        let input = format!("{DECL}<root>\n  <a id=\"x\" name=\"n\"/>\n</root>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn long_lines_wrap_at_depth_plus_two() {
        let input = format!(
            "{DECL}<root>\n  <element name=\"{}\"\n      next=\"short\"/>\n</root>\n",
            "x".repeat(80),
        );
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn unlimited_line_length_never_wraps() {
        let long = "x".repeat(200);
        let input = format!("{DECL}<root>\n  <element name=\"{long}\" next=\"short\"/>\n</root>\n");
        assert_eq!(roundtrip(&input, usize::MAX), input.as_bytes());
    }

    #[test]
    fn always_expanded_tags_never_collapse() {
        let input = format!("{DECL}<root>\n  <bodies></bodies>\n  <semanticResources></semanticResources>\n  <other/>\n</root>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn multiline_text_resets_line_position() {
        let input = format!("{DECL}<root>\n  <bodies>first line\nsecond line</bodies>\n</root>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[test]
    fn leading_version_comment_roundtrips() {
        let input = format!("{DECL}<!--Capella_Version_5.2.0-->\n<root/>\n");
        assert_eq!(roundtrip(&input, LINE_LENGTH), input.as_bytes());
    }

    #[rstest]
    #[case(1.5, "1.5")]
    #[case(100.0, "100.0")]
    #[case(2.0, "2.0")]
    #[case(0.0000001, "0.0000001")]
    #[case(-4.25, "-4.25")]
    fn float_formatting_is_fixed_notation(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_float(value), expected);
    }

    #[test]
    fn bool_formatting() {
        assert_eq!(format_bool(true), "true");
        assert_eq!(format_bool(false), "false");
    }

    #[test]
    fn write_file_persists_exact_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scratch.capella");
        let input = format!("{DECL}<root id=\"r\"/>\n");
        let doc = reader::parse(input.as_bytes(), &path).expect("parse");

        write_file(&doc, &path, LINE_LENGTH).expect("write");

        assert_eq!(std::fs::read(&path).expect("read back"), input.as_bytes());
    }
}
