//! Fragment store, cross-fragment navigation, and reference resolution.
//!
//! A model is a set of XML fragment files that together form one logical
//! document graph. [`ModelLoader`] owns every fragment, keeps the global
//! [`IdCache`] consistent through every insertion and removal, and
//! resolves the `href` links with which one fragment embeds content that
//! physically lives in another.

pub mod fragment;
pub mod idcache;

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

pub use fragment::Fragment;
pub use idcache::{IdCache, LoaderConfig};

use crate::error::{Error, Result};
use crate::xml::{Document, Node, NodeId, writer};

/// Handle to one loaded fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentId(pub(crate) u32);

impl FragmentId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Crate-wide address of one element: which fragment, which node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElementRef {
    pub fragment: FragmentId,
    pub node: NodeId,
}

/// A raw attribute value, classified by [`ModelLoader::materialize`].
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    /// The value is link syntax and resolves to a loaded element.
    Reference(ElementRef),
    /// Anything else.
    Scalar(String),
}

/// Basic information about a loaded model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInfo {
    /// The first fragment that was loaded.
    pub entrypoint: Option<PathBuf>,
    /// Version from the leading tool comment of the main semantic
    /// fragment, e.g. `5.2.0`.
    pub capella_version: Option<String>,
}

/// The complete in-memory model: all fragments plus the identity cache.
///
/// Cloning a loader clones the whole model state; the reconciliation
/// engine relies on this to apply batches onto a scratch copy.
#[derive(Clone, Debug)]
pub struct ModelLoader {
    fragments: Vec<Fragment>,
    by_path: FxHashMap<PathBuf, FragmentId>,
    cache: IdCache,
}

impl ModelLoader {
    /// Load `paths` and everything they reference, with configuration
    /// read from the process environment.
    pub fn load<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::load_with_config(paths, LoaderConfig::from_env())
    }

    /// Load `paths`, then follow `referencedAnalysis` hrefs and
    /// `semanticResources` entries until the transitive closure of
    /// fragments is in memory.
    pub fn load_with_config<I, P>(paths: I, config: LoaderConfig) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut loader = Self {
            fragments: Vec::new(),
            by_path: FxHashMap::default(),
            cache: IdCache::new(config),
        };
        let mut queue: VecDeque<PathBuf> = paths.into_iter().map(Into::into).collect();
        while let Some(path) = queue.pop_front() {
            if loader.by_path.contains_key(&path) {
                continue;
            }
            let id = loader.load_fragment(path)?;
            queue.extend(loader.referenced_paths(id));
        }
        debug!(
            "Loaded {} fragments, cached {} element IDs",
            loader.fragments.len(),
            loader.cache.len()
        );
        Ok(loader)
    }

    fn load_fragment(&mut self, path: PathBuf) -> Result<FragmentId> {
        debug!("Indexing fragment {}", path.display());
        let bytes = std::fs::read(&path)
            .map_err(|err| Error::malformed(&path, format!("cannot read file: {err}")))?;
        let fragment = Fragment::parse(path.clone(), &bytes)?;
        let id = FragmentId(u32::try_from(self.fragments.len()).expect("too many fragments"));
        self.fragments.push(fragment);
        self.by_path.insert(path, id);

        let root = self.root(id);
        self.index_subtree(root).map_err(|err| match err {
            // Within a single file, a duplicate is file corruption.
            Error::DuplicateIdentifier { id: dup }
                if self.cache.lookup(&dup).is_some_and(|e| e.fragment == id) =>
            {
                Error::malformed(
                    &self.fragments[id.index()].path,
                    format!("duplicate identifier {dup}"),
                )
            }
            other => other,
        })?;
        Ok(id)
    }

    /// Paths referenced by fragment `id`, normalized against its
    /// directory.
    fn referenced_paths(&self, id: FragmentId) -> Vec<PathBuf> {
        let fragment = &self.fragments[id.index()];
        let base = fragment.path().parent().unwrap_or(Path::new(""));
        let mut out = Vec::new();
        for node in fragment.doc.iter_subtree(fragment.doc.root()) {
            let node = fragment.doc.node(node);
            match node.tag.as_str() {
                "referencedAnalysis" => {
                    if let Some(href) = node.attr("href") {
                        let path = href.split('#').next().unwrap_or("");
                        if !path.is_empty() {
                            out.push(normalize_path(base, &percent_decode(path)));
                        }
                    }
                }
                "semanticResources" => {
                    if let Some(text) = &node.text {
                        for part in text.split_whitespace() {
                            out.push(normalize_path(base, &percent_decode(part)));
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn fragments(&self) -> impl Iterator<Item = FragmentId> {
        (0..self.fragments.len() as u32).map(FragmentId)
    }

    pub fn fragment_path(&self, id: FragmentId) -> &Path {
        self.fragments[id.index()].path()
    }

    pub fn document(&self, id: FragmentId) -> &Document {
        &self.fragments[id.index()].doc
    }

    pub fn document_mut(&mut self, id: FragmentId) -> &mut Document {
        &mut self.fragments[id.index()].doc
    }

    /// The physical root element of a fragment.
    pub fn root(&self, id: FragmentId) -> ElementRef {
        ElementRef {
            fragment: id,
            node: self.fragments[id.index()].doc.root(),
        }
    }

    pub fn node(&self, elem: ElementRef) -> &Node {
        self.fragments[elem.fragment.index()].doc.node(elem.node)
    }

    pub fn node_mut(&mut self, elem: ElementRef) -> &mut Node {
        self.fragments[elem.fragment.index()]
            .doc
            .node_mut(elem.node)
    }

    /// Look up an element by its universal identifier.
    pub fn lookup(&self, id: &str) -> Option<ElementRef> {
        self.cache.lookup(id)
    }

    /// Like [`lookup`](Self::lookup), but a miss is a hard error.
    pub fn element_by_id(&self, id: &str) -> Result<ElementRef> {
        self.cache
            .lookup(id)
            .ok_or_else(|| Error::UnresolvedReference { link: id.to_owned() })
    }

    /// Generate and reserve a model-wide unique identifier.
    pub fn generate_uuid(&mut self) -> String {
        self.cache.generate_uuid()
    }

    // ------------------------------------------------------------------
    // Cache bookkeeping
    // ------------------------------------------------------------------

    /// Register every identified element below (and including) `elem`.
    ///
    /// Must be called after inserting a subtree into a document.
    pub fn index_subtree(&mut self, elem: ElementRef) -> Result<()> {
        let fragment = &self.fragments[elem.fragment.index()];
        let mut ids = Vec::new();
        let mut hrefs = Vec::new();
        for node in fragment.doc.iter_subtree(elem.node) {
            let n = fragment.doc.node(node);
            if let Some(id) = n.id() {
                ids.push((id.to_owned(), node));
            }
            if let Some(href) = n.attr("href") {
                hrefs.push((fragment::href_target(href), node));
            }
        }
        for (id, node) in ids {
            self.cache.index(
                id,
                ElementRef {
                    fragment: elem.fragment,
                    node,
                },
            )?;
        }
        let fragment = &mut self.fragments[elem.fragment.index()];
        for (href, node) in hrefs {
            fragment.hrefsources.insert(href, node);
        }
        Ok(())
    }

    /// Detach `elem` from its parent and drop every cache entry of its
    /// subtree. Tree removal and cache removal are one operation; there
    /// is no way to do one without the other.
    pub fn remove_subtree(&mut self, elem: ElementRef) {
        let fragment = &mut self.fragments[elem.fragment.index()];
        let mut ids = Vec::new();
        let mut hrefs = Vec::new();
        for node in fragment.doc.iter_subtree(elem.node) {
            let n = fragment.doc.node(node);
            if let Some(id) = n.id() {
                ids.push(id.to_owned());
            }
            if let Some(href) = n.attr("href") {
                hrefs.push(fragment::href_target(href));
            }
        }
        fragment.doc.detach(elem.node);
        for href in &hrefs {
            fragment.hrefsources.remove(href);
        }
        for id in &ids {
            self.cache.remove(id);
        }
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Element children of `elem`, in document order. Placeholders are
    /// returned as-is; use [`resolve`](Self::resolve) for their content.
    pub fn children(&self, elem: ElementRef) -> impl Iterator<Item = ElementRef> + '_ {
        self.document(elem.fragment)
            .element_children(elem.node)
            .map(move |node| ElementRef {
                fragment: elem.fragment,
                node,
            })
    }

    /// Ancestors of `elem`, nearest first.
    ///
    /// At a fragment's physical root this continues from the placeholder
    /// that links to the root, so logical nesting across fragment files
    /// is walked transparently. Ends silently if the model contains a
    /// reference loop.
    pub fn ancestors(&self, elem: ElementRef) -> impl Iterator<Item = ElementRef> + '_ {
        let mut current = elem;
        let mut seen: FxHashSet<ElementRef> = FxHashSet::default();
        std::iter::from_fn(move || {
            let doc = self.document(current.fragment);
            let next = match doc.node(current.node).parent {
                Some(parent) => ElementRef {
                    fragment: current.fragment,
                    node: parent,
                },
                None => {
                    let id = doc.node(current.node).id()?;
                    let placeholder = self.unfollow_href(id)?;
                    let pdoc = self.document(placeholder.fragment);
                    let parent = pdoc.node(placeholder.node).parent?;
                    ElementRef {
                        fragment: placeholder.fragment,
                        node: parent,
                    }
                }
            };
            if !seen.insert(next) {
                return None;
            }
            current = next;
            Some(next)
        })
    }

    /// All descendants of `elem` in depth-first order, following
    /// placeholders into their target fragments. A dangling placeholder
    /// yields an `Err` item. Each element is visited at most once, so
    /// reference cycles between fragments terminate.
    pub fn descendants(&self, elem: ElementRef) -> impl Iterator<Item = Result<ElementRef>> + '_ {
        let mut stack: Vec<ElementRef> = self.children(elem).collect();
        stack.reverse();
        let mut seen: FxHashSet<ElementRef> = FxHashSet::default();
        std::iter::from_fn(move || {
            loop {
                let next = stack.pop()?;
                let real = if let Some(href) = self.node(next).attr("href") {
                    match self.follow_link(Some(next), href) {
                        Ok(real) => real,
                        Err(err) => return Some(Err(err)),
                    }
                } else {
                    next
                };
                if !seen.insert(real) {
                    continue;
                }
                let first = stack.len();
                stack.extend(self.children(real));
                stack[first..].reverse();
                return Some(Ok(real));
            }
        })
    }

    /// The placeholder element that links to the element `id`, if any
    /// fragment contains one.
    fn unfollow_href(&self, id: &str) -> Option<ElementRef> {
        self.fragments
            .iter()
            .enumerate()
            .find_map(|(i, fragment)| {
                fragment.unfollow_href(id).map(|node| ElementRef {
                    fragment: FragmentId(i as u32),
                    node,
                })
            })
    }

    // ------------------------------------------------------------------
    // Reference resolution
    // ------------------------------------------------------------------

    /// Follow a stored link and return its target.
    ///
    /// Accepted formats: `xtype fragment#uuid`, `fragment#uuid`,
    /// `#uuid`, and a bare `uuid`. A fragment part is resolved relative
    /// to `origin`'s fragment when given, otherwise matched by file
    /// name. A present `xtype` must match the target's `xsi:type`.
    pub fn follow_link(&self, origin: Option<ElementRef>, link: &str) -> Result<ElementRef> {
        let unresolved = || Error::UnresolvedReference {
            link: link.to_owned(),
        };
        let (xtype, frag_path, uuid) = parse_link(link).ok_or_else(unresolved)?;
        let target = self.cache.lookup(uuid).ok_or_else(unresolved)?;

        if let Some(frag_path) = frag_path {
            let frag_path = percent_decode(frag_path);
            let matches = match origin {
                Some(origin) => {
                    let base = self
                        .fragment_path(origin.fragment)
                        .parent()
                        .unwrap_or(Path::new(""));
                    self.fragment_path(target.fragment) == normalize_path(base, &frag_path)
                }
                None => {
                    self.fragment_path(target.fragment).file_name()
                        == Path::new(&frag_path).file_name()
                }
            };
            if !matches {
                return Err(unresolved());
            }
        }
        if let Some(xtype) = xtype {
            // Fragment roots carry their type in the tag name instead
            // of an xsi:type attribute.
            let node = self.node(target);
            if node.type_tag() != Some(xtype) && node.tag != xtype {
                return Err(unresolved());
            }
        }
        Ok(target)
    }

    /// Resolve a placeholder to its target; non-placeholders resolve to
    /// themselves. A dangling placeholder is a hard error.
    pub fn resolve(&self, elem: ElementRef) -> Result<ElementRef> {
        match self.node(elem).attr("href") {
            Some(href) => self.follow_link(Some(elem), href),
            None => Ok(elem),
        }
    }

    /// Classify a raw attribute value as a reference or a plain scalar.
    ///
    /// A value in unambiguous link syntax (anything carrying a `#`) that
    /// does not resolve is an [`Error::UnresolvedReference`]; only
    /// values that do not look like links fall back to scalars.
    pub fn materialize(&self, origin: Option<ElementRef>, raw: &str) -> Result<AttrValue> {
        if raw.contains('#') && parse_link(raw).is_some() {
            return self.follow_link(origin, raw).map(AttrValue::Reference);
        }
        match self.follow_link(origin, raw) {
            Ok(elem) => Ok(AttrValue::Reference(elem)),
            Err(_) => Ok(AttrValue::Scalar(raw.to_owned())),
        }
    }

    /// Create a link record pointing at `to`, valid for storage inside
    /// `from`'s fragment. Content is never copied; the link carries only
    /// the identifier, and for cross-fragment targets the relative
    /// fragment path and the target's type.
    pub fn create_link(&self, from: ElementRef, to: ElementRef) -> Result<String> {
        let to_node = self.node(to);
        let uuid = to_node.id().ok_or_else(|| Error::UnresolvedReference {
            link: format!("<{} element without identifier>", to_node.tag),
        })?;
        if from.fragment == to.fragment {
            return Ok(format!("#{uuid}"));
        }
        let from_dir = self
            .fragment_path(from.fragment)
            .parent()
            .unwrap_or(Path::new(""));
        let relative = relativize(from_dir, self.fragment_path(to.fragment));
        let relative = percent_encode(&posix_path(&relative));
        match to_node.type_tag() {
            Some(xtype) => Ok(format!("{xtype} {relative}#{uuid}")),
            None => Ok(format!("{relative}#{uuid}")),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write every fragment back to its original location. Each file is
    /// staged and atomically renamed; a failure leaves the already
    /// persisted files valid and the failing one untouched.
    pub fn save(&self) -> Result<()> {
        debug!("Saving {} fragments", self.fragments.len());
        for fragment in &self.fragments {
            debug!("Saving fragment {}", fragment.path().display());
            writer::write_file(&fragment.doc, fragment.path(), fragment.line_length())?;
        }
        Ok(())
    }

    /// Entry fragment and tool version information.
    pub fn get_model_info(&self) -> ModelInfo {
        let capella_version = self
            .fragments
            .iter()
            .filter(|f| {
                matches!(
                    f.path().extension().and_then(|e| e.to_str()),
                    Some("capella" | "melodymodeller")
                )
            })
            .find_map(|f| f.version_comment())
            .map(str::to_owned);
        ModelInfo {
            entrypoint: self.fragments.first().map(|f| f.path().to_owned()),
            capella_version,
        }
    }
}

/// Split a link into `(xtype, fragment, uuid)`.
fn parse_link(link: &str) -> Option<(Option<&str>, Option<&str>, &str)> {
    let (xtype, rest) = match link.split_once(' ') {
        Some((x, rest)) if !x.is_empty() => (Some(x), rest),
        Some(_) => return None,
        None => (None, link),
    };
    let (fragment, uuid) = match rest.split_once('#') {
        Some((f, uuid)) => ((!f.is_empty()).then_some(f), uuid),
        None => (None, rest),
    };
    // An xtype is only valid together with a fragment path.
    if xtype.is_some() && fragment.is_none() {
        return None;
    }
    if uuid.is_empty() || uuid.contains(['#', ' ']) {
        return None;
    }
    Some((xtype, fragment, uuid))
}

/// Lexically resolve `relative` against the directory `base`.
fn normalize_path(base: &Path, relative: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                out = PathBuf::from(component.as_os_str());
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Lexical relative path from the directory `from` to the file `to`.
fn relativize(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let mut common = 0;
    while common < from.len() && common < to.len() && from[common] == to[common] {
        common += 1;
    }
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component);
    }
    out
}

/// Render a path with forward slashes, as stored in link records.
fn posix_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn percent_encode(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            )
        {
            out.push(hi * 16 + lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
