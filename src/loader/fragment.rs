//! A single physical model fragment.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::xml::writer::LINE_LENGTH;
use crate::xml::{Document, NodeId, reader};

/// File extensions that may hold model fragments.
pub const VALID_EXTENSIONS: [&str; 7] = [
    "afm",
    "aird",
    "airdfragment",
    "capella",
    "capellafragment",
    "melodyfragment",
    "melodymodeller",
];

/// Extensions of semantic fragments, which are wrapped at 80 columns.
/// Everything else (the diagram family) is written without wrapping.
const SEMANTIC_EXTENSIONS: [&str; 4] = [
    "capella",
    "capellafragment",
    "melodyfragment",
    "melodymodeller",
];

const VERSION_COMMENT_PREFIX: &str = "Capella_Version_";

/// One physical file of the model.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub(super) path: PathBuf,
    pub(super) doc: Document,
    /// Target uuid -> placeholder node in *this* fragment that links to
    /// it. Used to walk "upward" out of other fragments' physical roots.
    pub(super) hrefsources: FxHashMap<String, NodeId>,
}

impl Fragment {
    /// Parse `bytes` as the content of the fragment file at `path`.
    pub fn parse(path: PathBuf, bytes: &[u8]) -> Result<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !VALID_EXTENSIONS.contains(&extension) {
            return Err(Error::malformed(
                &path,
                format!("unsupported fragment extension {extension:?}"),
            ));
        }
        let doc = reader::parse(bytes, &path)?;

        let mut fragment = Self {
            path,
            doc,
            hrefsources: FxHashMap::default(),
        };
        for node in fragment.doc.iter_subtree(fragment.doc.root()) {
            if let Some(href) = fragment.doc.node(node).attr("href") {
                fragment.hrefsources.insert(href_target(href), node);
            }
        }
        Ok(fragment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Line length to use when serializing this fragment.
    pub fn line_length(&self) -> usize {
        let extension = self.path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if SEMANTIC_EXTENSIONS.contains(&extension) {
            LINE_LENGTH
        } else {
            usize::MAX
        }
    }

    /// Placeholder in this fragment linking to the element `id`, if any.
    pub fn unfollow_href(&self, id: &str) -> Option<NodeId> {
        self.hrefsources.get(id).copied()
    }

    /// The version recorded in the leading tool comment, if present.
    pub fn version_comment(&self) -> Option<&str> {
        self.doc
            .leading_comments
            .iter()
            .find_map(|c| c.strip_prefix(VERSION_COMMENT_PREFIX))
    }
}

/// The uuid part of an `href` value (everything after the last `#`).
pub(super) fn href_target(href: &str) -> String {
    href.rsplit('#').next().unwrap_or(href).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_extensions() {
        let err = Fragment::parse("model.xml".into(), b"<root/>").unwrap_err();
        assert!(matches!(err, Error::MalformedFragment { .. }), "{err}");
    }

    #[test]
    fn indexes_href_sources() {
        let frag = Fragment::parse(
            "model.aird".into(),
            b"<root><referencedAnalysis href=\"sub.aird#1234\"/></root>",
        )
        .unwrap();
        assert!(frag.unfollow_href("1234").is_some());
        assert!(frag.unfollow_href("9999").is_none());
    }

    #[test]
    fn href_target_strips_xtype_and_path() {
        assert_eq!(href_target("ns:Type frag.capella#abcd"), "abcd");
        assert_eq!(href_target("#abcd"), "abcd");
        assert_eq!(href_target("abcd"), "abcd");
    }

    #[test]
    fn line_length_depends_on_extension() {
        let semantic = Fragment::parse("m.capella".into(), b"<root/>").unwrap();
        let diagram = Fragment::parse("m.aird".into(), b"<root/>").unwrap();
        assert_eq!(semantic.line_length(), LINE_LENGTH);
        assert_eq!(diagram.line_length(), usize::MAX);
    }

    #[test]
    fn finds_the_version_comment() {
        let frag = Fragment::parse(
            "m.capella".into(),
            b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!--Capella_Version_5.2.0-->\n<root/>\n",
        )
        .unwrap();
        assert_eq!(frag.version_comment(), Some("5.2.0"));
    }
}
