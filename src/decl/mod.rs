//! Declarative reconciliation engine.
//!
//! An instruction document is a YAML stream: an optional metadata
//! document followed by an ordered list of instructions. Each
//! instruction selects a parent element and applies `extend`, `set`,
//! `sync`, and `delete` operations to it. Element references use local
//! tags: `!uuid` for explicit identifiers, `!find` for predicate
//! selection, `!promise` for forward references that may be declared
//! after first use.
//!
//! A batch applies atomically: everything runs against a scratch copy
//! of the model, which replaces the live model only on full success.

pub mod schema;

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, warn};
use uuid::Uuid;

pub use schema::{AttrKind, Metamodel, Ownership, RuleMetamodel};

use crate::error::{Error, Result};
use crate::loader::{AttrValue, ElementRef, ModelLoader};
use crate::xml::writer;

// ======================================================================
// Metadata
// ======================================================================

/// Optional leading metadata document of an instruction stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_by: Option<WriterMetadata>,
}

/// Identity of the model a document was written against.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

/// Identity of the tool that produced a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterMetadata {
    /// Engine version the document was written with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub melodel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

// ======================================================================
// Parsed instruction model
// ======================================================================

#[derive(Clone, Debug)]
enum Selector {
    Uuid(String),
    Find(FindSpec),
    Promise(String),
}

#[derive(Clone, Debug, Default)]
struct FindSpec {
    /// Constrains the element's `xsi:type` (short or qualified form).
    type_name: Option<String>,
    /// Dotted attribute paths and their expected values.
    constraints: Vec<(String, ValueSpec)>,
}

#[derive(Clone, Debug)]
enum ValueSpec {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Uuid(String),
    Promise(String),
    Find(FindSpec),
}

/// One entry in an `extend` list.
#[derive(Clone, Debug)]
enum NewEntry {
    /// Descriptor of a new element to create in place.
    Object(ObjectSpec),
    /// Reference to an existing element, inserted as a link.
    Reference(Selector),
}

#[derive(Clone, Debug, Default)]
struct ObjectSpec {
    type_tag: Option<String>,
    promise_id: Option<String>,
    attrs: Vec<(String, ValueSpec)>,
    /// Nested collections, recursed after the element exists.
    children: Vec<(String, Vec<NewEntry>)>,
}

#[derive(Clone, Debug)]
struct SyncSpec {
    find: FindSpec,
    set: Vec<(String, ValueSpec)>,
    extend: Vec<(String, Vec<NewEntry>)>,
    sync: Vec<(String, Vec<SyncSpec>)>,
    promise_id: Option<String>,
}

#[derive(Clone, Debug)]
enum DeleteTarget {
    Uuid(String),
    Find(FindSpec),
}

#[derive(Clone, Debug)]
enum Op {
    Extend(Vec<(String, Vec<NewEntry>)>),
    Set(Vec<(String, ValueSpec)>),
    Sync(Vec<(String, Vec<SyncSpec>)>),
    Delete(Vec<(String, Vec<DeleteTarget>)>),
}

#[derive(Clone, Debug)]
struct Instruction {
    /// Position in the document, for error context.
    index: usize,
    parent: Selector,
    ops: Vec<Op>,
}

// ======================================================================
// Batch
// ======================================================================

/// A parsed instruction document, ready to apply.
#[derive(Clone, Debug)]
pub struct Batch {
    pub metadata: Option<Metadata>,
    instructions: Vec<Instruction>,
}

impl Batch {
    /// Parse a YAML stream of zero, one, or two documents.
    ///
    /// With two documents the first is metadata and the second the
    /// instruction list; with one, it is the instruction list alone.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_slice(input) {
            docs.push(
                Value::deserialize(doc)
                    .map_err(|err| Error::document(format!("cannot parse YAML: {err}")))?,
            );
        }
        let (metadata, instructions) = match docs.len() {
            0 => (None, Value::Null),
            1 => (None, docs.remove(0)),
            2 => {
                let body = docs.remove(1);
                let metadata = serde_yaml::from_value(docs.remove(0))
                    .map_err(|err| Error::document(format!("invalid metadata: {err}")))?;
                (Some(metadata), body)
            }
            n => {
                return Err(Error::document(format!(
                    "expected at most 2 YAML documents, found {n}"
                )));
            }
        };
        Ok(Self {
            metadata,
            instructions: parse_instructions(&instructions)?,
        })
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Check the metadata block against the loaded model.
    ///
    /// In strict mode a mismatch is [`Error::MetadataMismatch`], a
    /// missing metadata document is an error, and metadata fields the
    /// loader cannot confirm (`url`, `revision`) are rejected as
    /// unverifiable. Otherwise every discrepancy is logged and ignored.
    pub fn verify_metadata(&self, loader: &ModelLoader, strict: bool) -> Result<()> {
        let Some(metadata) = &self.metadata else {
            if strict {
                return Err(Error::document(
                    "strict metadata checking requires a metadata document",
                ));
            }
            return Ok(());
        };
        let report = |field: &'static str, expected: &str, actual: &str| -> Result<()> {
            if strict {
                Err(Error::MetadataMismatch {
                    field,
                    expected: expected.to_owned(),
                    actual: actual.to_owned(),
                })
            } else {
                warn!("Metadata mismatch: {field} is {actual:?}, document expects {expected:?}");
                Ok(())
            }
        };

        if let Some(model) = &metadata.model {
            if let Some(expected) = model.entrypoint.as_deref() {
                let actual = loader
                    .get_model_info()
                    .entrypoint
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .unwrap_or_default();
                let expected_name = std::path::Path::new(expected)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if expected_name != actual {
                    report("entrypoint", expected, &actual)?;
                }
            }
            // The loader records no origin URL or version-control
            // revision, so these two can only be flagged, never
            // confirmed.
            if let Some(expected) = model.url.as_deref() {
                report("url", expected, "<not recorded by the loader>")?;
            }
            if let Some(expected) = model.revision.as_deref() {
                report("revision", expected, "<not recorded by the loader>")?;
            }
        }
        if let Some(written) = metadata.written_by.as_ref().and_then(|w| w.melodel.as_deref()) {
            let current = env!("CARGO_PKG_VERSION");
            // Documents from a newer engine may use features this one
            // does not know about.
            if version_components(written) > version_components(current) {
                report("melodel version", written, current)?;
            }
        }
        Ok(())
    }

    /// Apply the batch to `loader`.
    ///
    /// Runs against a clone of the model state and swaps it in only
    /// when every instruction succeeded and every promise resolved; on
    /// error the model is left untouched. Returns the promise bindings
    /// established during the pass.
    pub fn apply(
        &self,
        loader: &mut ModelLoader,
        metamodel: &dyn Metamodel,
    ) -> Result<FxHashMap<String, ElementRef>> {
        debug!("Applying {} instructions", self.instructions.len());
        let mut scratch = loader.clone();
        let promises = run_batch(&mut scratch, metamodel, self.instructions.clone())?;
        *loader = scratch;
        Ok(promises)
    }
}

/// Parse `input` and apply it to `loader` with lenient metadata checks.
pub fn apply(
    loader: &mut ModelLoader,
    input: &[u8],
    metamodel: &dyn Metamodel,
) -> Result<FxHashMap<String, ElementRef>> {
    let batch = Batch::parse(input)?;
    batch.verify_metadata(loader, false)?;
    batch.apply(loader, metamodel)
}

/// Emit an instruction stream: optional metadata document, then the
/// instruction list. Tagged values keep their `!uuid`/`!promise`/`!find`
/// tags.
pub fn dump(metadata: Option<&Metadata>, instructions: &[Value]) -> Result<String> {
    let mut out = String::new();
    if let Some(metadata) = metadata {
        out.push_str(
            &serde_yaml::to_string(metadata).map_err(|err| Error::document(err.to_string()))?,
        );
        out.push_str("---\n");
    }
    out.push_str(
        &serde_yaml::to_string(instructions).map_err(|err| Error::document(err.to_string()))?,
    );
    Ok(out)
}

/// Numeric prefix of a dotted version string, for ordering.
fn version_components(version: &str) -> Vec<u64> {
    version
        .split(['.', '-', '+'])
        .map_while(|part| part.parse().ok())
        .collect()
}

// ======================================================================
// YAML parsing
// ======================================================================

fn parse_instructions(value: &Value) -> Result<Vec<Instruction>> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Sequence(seq) => seq,
        _ => {
            return Err(Error::document(
                "the instruction document must be a sequence",
            ));
        }
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_instruction(index, item))
        .collect()
}

fn parse_instruction(index: usize, value: &Value) -> Result<Instruction> {
    let Value::Mapping(map) = value else {
        return Err(Error::instruction(index, "expected a mapping"));
    };
    let mut parent = None;
    let mut extend = Vec::new();
    let mut set = Vec::new();
    let mut sync = Vec::new();
    let mut delete = Vec::new();
    for (key, value) in map {
        match key_str(index, key)? {
            "parent" => parent = Some(parse_selector(index, value)?),
            "extend" | "create" => {
                extend.extend(parse_entry_groups(index, value, parse_new_entry)?);
            }
            "set" => set.extend(parse_assignments(index, value)?),
            "sync" => sync.extend(parse_entry_groups(index, value, parse_sync_spec)?),
            "delete" => delete.extend(parse_entry_groups(index, value, parse_delete_target)?),
            other => {
                return Err(Error::instruction(index, format!("unknown key {other:?}")));
            }
        }
    }
    let parent = parent.ok_or_else(|| Error::instruction(index, "missing `parent` selector"))?;

    // Fixed operation order within one instruction, regardless of key
    // order in the document.
    let mut ops = Vec::new();
    if !extend.is_empty() {
        ops.push(Op::Extend(extend));
    }
    if !set.is_empty() {
        ops.push(Op::Set(set));
    }
    if !sync.is_empty() {
        ops.push(Op::Sync(sync));
    }
    if !delete.is_empty() {
        ops.push(Op::Delete(delete));
    }
    Ok(Instruction { index, parent, ops })
}

fn key_str<'a>(index: usize, key: &'a Value) -> Result<&'a str> {
    key.as_str()
        .ok_or_else(|| Error::instruction(index, format!("mapping keys must be strings: {key:?}")))
}

fn parse_selector(index: usize, value: &Value) -> Result<Selector> {
    match value {
        Value::String(s) => Ok(Selector::Uuid(s.clone())),
        Value::Tagged(tagged) if tagged.tag == "uuid" => {
            Ok(Selector::Uuid(parse_uuid(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "promise" => {
            Ok(Selector::Promise(parse_token(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "find" => {
            Ok(Selector::Find(parse_find(index, &tagged.value)?))
        }
        other => Err(Error::instruction(
            index,
            format!("expected !uuid, !find or !promise, got {other:?}"),
        )),
    }
}

fn parse_uuid(index: usize, value: &Value) -> Result<String> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::instruction(index, "!uuid takes a string"))?;
    Uuid::parse_str(raw)
        .map_err(|_| Error::instruction(index, format!("not a valid UUID: {raw:?}")))?;
    Ok(raw.to_owned())
}

fn parse_token(index: usize, value: &Value) -> Result<String> {
    match value.as_str() {
        Some(token) if !token.is_empty() => Ok(token.to_owned()),
        _ => Err(Error::instruction(
            index,
            "!promise takes a non-empty string token",
        )),
    }
}

fn parse_find(index: usize, value: &Value) -> Result<FindSpec> {
    let Value::Mapping(map) = value else {
        return Err(Error::instruction(index, "!find takes a mapping"));
    };
    let mut spec = FindSpec::default();
    for (key, value) in map {
        let key = key_str(index, key)?;
        if key == "_type" {
            spec.type_name = Some(
                value
                    .as_str()
                    .ok_or_else(|| Error::instruction(index, "_type must be a string"))?
                    .to_owned(),
            );
        } else {
            let value = parse_value_spec(index, value)?;
            if matches!(value, ValueSpec::Find(_)) {
                return Err(Error::instruction(
                    index,
                    "nested !find is not supported inside a predicate",
                ));
            }
            spec.constraints.push((key.to_owned(), value));
        }
    }
    Ok(spec)
}

fn parse_value_spec(index: usize, value: &Value) -> Result<ValueSpec> {
    match value {
        Value::String(s) => Ok(ValueSpec::Str(s.clone())),
        Value::Bool(b) => Ok(ValueSpec::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ValueSpec::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(ValueSpec::Float(f))
            } else {
                Err(Error::instruction(index, format!("unsupported number {n}")))
            }
        }
        Value::Tagged(tagged) if tagged.tag == "uuid" => {
            Ok(ValueSpec::Uuid(parse_uuid(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "promise" => {
            Ok(ValueSpec::Promise(parse_token(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "find" => {
            Ok(ValueSpec::Find(parse_find(index, &tagged.value)?))
        }
        other => Err(Error::instruction(
            index,
            format!("unsupported attribute value {other:?}"),
        )),
    }
}

fn parse_assignments(index: usize, value: &Value) -> Result<Vec<(String, ValueSpec)>> {
    let Value::Mapping(map) = value else {
        return Err(Error::instruction(index, "`set` takes a mapping"));
    };
    map.iter()
        .map(|(key, value)| {
            Ok((
                key_str(index, key)?.to_owned(),
                parse_value_spec(index, value)?,
            ))
        })
        .collect()
}

/// Parse a `collection -> [entries]` mapping, one parser per entry.
fn parse_entry_groups<T>(
    index: usize,
    value: &Value,
    parse: impl Fn(usize, &Value) -> Result<T>,
) -> Result<Vec<(String, Vec<T>)>> {
    let Value::Mapping(map) = value else {
        return Err(Error::instruction(
            index,
            "expected a mapping of collection names to lists",
        ));
    };
    map.iter()
        .map(|(key, value)| {
            let key = key_str(index, key)?.to_owned();
            let Value::Sequence(items) = value else {
                return Err(Error::instruction(
                    index,
                    format!("collection {key:?} must hold a list"),
                ));
            };
            let items = items
                .iter()
                .map(|item| parse(index, item))
                .collect::<Result<Vec<_>>>()?;
            Ok((key, items))
        })
        .collect()
}

fn parse_new_entry(index: usize, value: &Value) -> Result<NewEntry> {
    match value {
        Value::Mapping(map) => Ok(NewEntry::Object(parse_object(index, map)?)),
        Value::Tagged(tagged) if tagged.tag == "new_object" => match &tagged.value {
            Value::Mapping(map) => Ok(NewEntry::Object(parse_object(index, map)?)),
            _ => Err(Error::instruction(index, "!new_object takes a mapping")),
        },
        Value::String(s) => Ok(NewEntry::Reference(Selector::Uuid(s.clone()))),
        Value::Tagged(_) => Ok(NewEntry::Reference(parse_selector(index, value)?)),
        other => Err(Error::instruction(
            index,
            format!("unsupported extend entry {other:?}"),
        )),
    }
}

fn parse_object(index: usize, map: &serde_yaml::Mapping) -> Result<ObjectSpec> {
    let mut spec = ObjectSpec::default();
    for (key, value) in map {
        let key = key_str(index, key)?;
        match (key, value) {
            ("_type", value) => {
                spec.type_tag = Some(
                    value
                        .as_str()
                        .ok_or_else(|| Error::instruction(index, "_type must be a string"))?
                        .to_owned(),
                );
            }
            ("promise_id", value) => {
                spec.promise_id = Some(parse_token(index, value)?);
            }
            (key, Value::Sequence(items)) => {
                let items = items
                    .iter()
                    .map(|item| parse_new_entry(index, item))
                    .collect::<Result<Vec<_>>>()?;
                spec.children.push((key.to_owned(), items));
            }
            (key, value) => {
                spec.attrs
                    .push((key.to_owned(), parse_value_spec(index, value)?));
            }
        }
    }
    Ok(spec)
}

fn parse_sync_spec(index: usize, value: &Value) -> Result<SyncSpec> {
    let Value::Mapping(map) = value else {
        return Err(Error::instruction(index, "sync entries must be mappings"));
    };
    let mut find = None;
    let mut set = Vec::new();
    let mut extend = Vec::new();
    let mut sync = Vec::new();
    let mut promise_id = None;
    for (key, value) in map {
        match key_str(index, key)? {
            "find" => {
                find = Some(match value {
                    Value::Tagged(tagged) if tagged.tag == "find" => {
                        parse_find(index, &tagged.value)?
                    }
                    other => parse_find(index, other)?,
                });
            }
            "set" => set.extend(parse_assignments(index, value)?),
            "extend" => extend.extend(parse_entry_groups(index, value, parse_new_entry)?),
            "sync" => sync.extend(parse_entry_groups(index, value, parse_sync_spec)?),
            "promise_id" => promise_id = Some(parse_token(index, value)?),
            other => {
                return Err(Error::instruction(
                    index,
                    format!("unknown sync key {other:?}"),
                ));
            }
        }
    }
    Ok(SyncSpec {
        find: find.ok_or_else(|| Error::instruction(index, "sync entries need a `find` block"))?,
        set,
        extend,
        sync,
        promise_id,
    })
}

fn parse_delete_target(index: usize, value: &Value) -> Result<DeleteTarget> {
    match value {
        Value::String(s) => Ok(DeleteTarget::Uuid(s.clone())),
        Value::Tagged(tagged) if tagged.tag == "uuid" => {
            Ok(DeleteTarget::Uuid(parse_uuid(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "find" => {
            Ok(DeleteTarget::Find(parse_find(index, &tagged.value)?))
        }
        Value::Tagged(tagged) if tagged.tag == "promise" => Err(Error::instruction(
            index,
            "!promise is not allowed in delete",
        )),
        other => Err(Error::instruction(
            index,
            format!("unsupported delete target {other:?}"),
        )),
    }
}

// ======================================================================
// Promise bookkeeping
// ======================================================================

type Promises = FxHashMap<String, ElementRef>;
type Fulfilled = Vec<(String, ElementRef)>;

/// One queued or parked unit of work: a whole instruction, or a single
/// operation split off an instruction whose parent is already resolved.
struct WorkItem {
    index: usize,
    parent: Parent,
    ops: Vec<Op>,
}

enum Parent {
    Unresolved(Selector),
    Resolved(ElementRef),
}

/// Work queue with deferred re-enqueueing (the promise algorithm).
///
/// Work referencing an unresolved promise is parked under that token
/// before it is applied; fulfilling the token re-enqueues the parked
/// work ahead of the remaining queue. Parking happens at operation
/// granularity: when one operation of an instruction is blocked, the
/// remaining operations still run, so an instruction may use a promise
/// that a later operation of the same instruction declares.
fn run_batch(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    instructions: Vec<Instruction>,
) -> Result<Promises> {
    let mut queue: VecDeque<WorkItem> = instructions
        .into_iter()
        .map(|instruction| WorkItem {
            index: instruction.index,
            parent: Parent::Unresolved(instruction.parent),
            ops: instruction.ops,
        })
        .collect();
    let mut promises = Promises::default();
    let mut deferred: FxHashMap<String, Vec<WorkItem>> = FxHashMap::default();

    while let Some(item) = queue.pop_front() {
        let parent = match &item.parent {
            Parent::Resolved(elem) => *elem,
            Parent::Unresolved(selector) => {
                if let Some(token) = selector_unresolved(selector, &promises) {
                    debug!("Deferring instruction {} on promise {token:?}", item.index);
                    deferred.entry(token).or_default().push(item);
                    continue;
                }
                resolve_parent(loader, &promises, selector, item.index)?
            }
        };
        for op in item.ops {
            if let Some(token) = op_unresolved(&op, &promises) {
                debug!(
                    "Deferring one operation of instruction {} on promise {token:?}",
                    item.index
                );
                deferred.entry(token).or_default().push(WorkItem {
                    index: item.index,
                    parent: Parent::Resolved(parent),
                    ops: vec![op],
                });
                continue;
            }
            let fulfilled = apply_op(loader, metamodel, &promises, parent, &op, item.index)?;
            for (token, elem) in fulfilled {
                if promises.insert(token.clone(), elem).is_some() {
                    return Err(Error::instruction(
                        item.index,
                        format!("promise {token:?} is fulfilled twice"),
                    ));
                }
                if let Some(parked) = deferred.remove(&token) {
                    for parked_item in parked.into_iter().rev() {
                        queue.push_front(parked_item);
                    }
                }
            }
        }
    }

    if !deferred.is_empty() {
        let mut tokens: Vec<String> = deferred.into_keys().collect();
        tokens.sort();
        return Err(Error::UnresolvedPromise { tokens });
    }
    Ok(promises)
}

/// Promise token a parent selector references without it being resolved.
fn selector_unresolved(selector: &Selector, promises: &Promises) -> Option<String> {
    let scan = PromiseScan {
        declared: FxHashSet::default(),
        promises,
    };
    scan.in_selector(selector)
}

/// The first promise token this operation *references* without it being
/// resolved yet. Tokens the operation itself declares do not count;
/// they become available while the operation runs.
fn op_unresolved(op: &Op, promises: &Promises) -> Option<String> {
    let mut declared = FxHashSet::default();
    match op {
        Op::Extend(groups) => {
            for (_, entries) in groups {
                collect_declared_entries(entries, &mut declared);
            }
        }
        Op::Sync(groups) => {
            for (_, specs) in groups {
                collect_declared_sync(specs, &mut declared);
            }
        }
        Op::Set(_) | Op::Delete(_) => {}
    }
    let scan = PromiseScan { declared, promises };

    match op {
        Op::Extend(groups) => groups
            .iter()
            .find_map(|(_, entries)| scan.in_entries(entries)),
        Op::Set(assignments) => assignments
            .iter()
            .find_map(|(_, value)| scan.in_value(value)),
        Op::Sync(groups) => groups.iter().find_map(|(_, specs)| scan.in_sync(specs)),
        Op::Delete(groups) => groups.iter().find_map(|(_, targets)| {
            targets.iter().find_map(|target| match target {
                DeleteTarget::Find(spec) => scan.in_find(spec),
                DeleteTarget::Uuid(_) => None,
            })
        }),
    }
}

fn collect_declared_entries(entries: &[NewEntry], out: &mut FxHashSet<String>) {
    for entry in entries {
        if let NewEntry::Object(spec) = entry {
            if let Some(token) = &spec.promise_id {
                out.insert(token.clone());
            }
            for (_, children) in &spec.children {
                collect_declared_entries(children, out);
            }
        }
    }
}

fn collect_declared_sync(specs: &[SyncSpec], out: &mut FxHashSet<String>) {
    for spec in specs {
        if let Some(token) = &spec.promise_id {
            out.insert(token.clone());
        }
        for (_, entries) in &spec.extend {
            collect_declared_entries(entries, out);
        }
        for (_, nested) in &spec.sync {
            collect_declared_sync(nested, out);
        }
    }
}

struct PromiseScan<'a> {
    declared: FxHashSet<String>,
    promises: &'a Promises,
}

impl PromiseScan<'_> {
    fn missing(&self, token: &str) -> Option<String> {
        (!self.declared.contains(token) && !self.promises.contains_key(token))
            .then(|| token.to_owned())
    }

    fn in_selector(&self, selector: &Selector) -> Option<String> {
        match selector {
            Selector::Promise(token) => self.missing(token),
            Selector::Find(spec) => self.in_find(spec),
            Selector::Uuid(_) => None,
        }
    }

    fn in_find(&self, spec: &FindSpec) -> Option<String> {
        spec.constraints
            .iter()
            .find_map(|(_, value)| self.in_value(value))
    }

    fn in_value(&self, value: &ValueSpec) -> Option<String> {
        match value {
            ValueSpec::Promise(token) => self.missing(token),
            ValueSpec::Find(spec) => self.in_find(spec),
            _ => None,
        }
    }

    fn in_entries(&self, entries: &[NewEntry]) -> Option<String> {
        entries.iter().find_map(|entry| match entry {
            NewEntry::Reference(selector) => self.in_selector(selector),
            NewEntry::Object(spec) => spec
                .attrs
                .iter()
                .find_map(|(_, value)| self.in_value(value))
                .or_else(|| {
                    spec.children
                        .iter()
                        .find_map(|(_, children)| self.in_entries(children))
                }),
        })
    }

    fn in_sync(&self, specs: &[SyncSpec]) -> Option<String> {
        specs.iter().find_map(|spec| {
            self.in_find(&spec.find)
                .or_else(|| spec.set.iter().find_map(|(_, value)| self.in_value(value)))
                .or_else(|| {
                    spec.extend
                        .iter()
                        .find_map(|(_, entries)| self.in_entries(entries))
                })
                .or_else(|| spec.sync.iter().find_map(|(_, nested)| self.in_sync(nested)))
        })
    }
}

// ======================================================================
// Instruction application
// ======================================================================

/// Apply one operation against an already resolved parent. Returns the
/// promise bindings the operation established.
fn apply_op(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    parent: ElementRef,
    op: &Op,
    index: usize,
) -> Result<Fulfilled> {
    let mut fulfilled = Fulfilled::new();
    match op {
        Op::Extend(groups) => apply_extend(
            loader,
            metamodel,
            promises,
            &mut fulfilled,
            parent,
            groups,
            index,
        )?,
        Op::Set(assignments) => apply_set(
            loader,
            metamodel,
            promises,
            &fulfilled,
            parent,
            assignments,
            index,
        )?,
        Op::Sync(groups) => apply_sync(
            loader,
            metamodel,
            promises,
            &mut fulfilled,
            parent,
            groups,
            index,
        )?,
        Op::Delete(groups) => apply_delete(
            loader,
            metamodel,
            promises,
            &fulfilled,
            parent,
            groups,
            index,
        )?,
    }
    Ok(fulfilled)
}

fn resolve_parent(
    loader: &ModelLoader,
    promises: &Promises,
    selector: &Selector,
    index: usize,
) -> Result<ElementRef> {
    match selector {
        Selector::Uuid(id) => loader.lookup(id).ok_or_else(|| Error::ParentNotFound {
            selector: format!("!uuid {id}"),
            instruction: index,
        }),
        Selector::Promise(token) => {
            promises
                .get(token)
                .copied()
                .ok_or_else(|| Error::ParentNotFound {
                    selector: format!("!promise {token}"),
                    instruction: index,
                })
        }
        Selector::Find(spec) => find_one_global(loader, promises, &[], spec, index),
    }
}

fn selector_target(
    loader: &ModelLoader,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    selector: &Selector,
    index: usize,
) -> Result<ElementRef> {
    match selector {
        Selector::Uuid(id) => loader.element_by_id(id),
        Selector::Promise(token) => promise_target(token, promises, fulfilled).ok_or_else(|| {
            Error::instruction(index, format!("unresolved promise {token:?}"))
        }),
        Selector::Find(spec) => find_one_global(loader, promises, fulfilled, spec, index),
    }
}

fn promise_target(
    token: &str,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
) -> Option<ElementRef> {
    promises.get(token).copied().or_else(|| {
        fulfilled
            .iter()
            .rev()
            .find(|(t, _)| t == token)
            .map(|(_, elem)| *elem)
    })
}

// ----------------------------------------------------------------------
// extend
// ----------------------------------------------------------------------

fn apply_extend(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &mut Fulfilled,
    parent: ElementRef,
    groups: &[(String, Vec<NewEntry>)],
    index: usize,
) -> Result<()> {
    for (collection, entries) in groups {
        for entry in entries {
            match entry {
                NewEntry::Object(spec) => {
                    create_object(
                        loader, metamodel, promises, fulfilled, parent, collection, spec, index,
                    )?;
                }
                NewEntry::Reference(selector) => {
                    let target = selector_target(loader, promises, fulfilled, selector, index)?;
                    append_reference(loader, parent, collection, target)?;
                }
            }
        }
    }
    Ok(())
}

/// Create a new element under `parent`, register it, then fill it.
///
/// The identifier is cached before the element is linked into the tree,
/// so generation within the same batch can never hand it out again.
fn create_object(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &mut Fulfilled,
    parent: ElementRef,
    collection: &str,
    spec: &ObjectSpec,
    index: usize,
) -> Result<ElementRef> {
    let id = loader.generate_uuid();
    let doc = loader.document_mut(parent.fragment);
    let node = doc.create_element(collection);
    if let Some(type_tag) = &spec.type_tag {
        doc.node_mut(node)
            .attrs
            .insert("xsi:type".into(), type_tag.clone());
    }
    doc.node_mut(node).attrs.insert("id".into(), id);
    let elem = ElementRef {
        fragment: parent.fragment,
        node,
    };
    loader.index_subtree(elem)?;
    loader
        .document_mut(parent.fragment)
        .append_child(parent.node, node);

    apply_set(
        loader, metamodel, promises, fulfilled, elem, &spec.attrs, index,
    )?;
    if let Some(token) = &spec.promise_id {
        fulfilled.push((token.clone(), elem));
    }
    for (child_collection, entries) in &spec.children {
        for entry in entries {
            match entry {
                NewEntry::Object(child) => {
                    create_object(
                        loader,
                        metamodel,
                        promises,
                        fulfilled,
                        elem,
                        child_collection,
                        child,
                        index,
                    )?;
                }
                NewEntry::Reference(selector) => {
                    let target = selector_target(loader, promises, fulfilled, selector, index)?;
                    append_reference(loader, elem, child_collection, target)?;
                }
            }
        }
    }
    Ok(elem)
}

/// Insert a link child pointing at an existing element. Content is
/// never copied; only the link record is stored.
fn append_reference(
    loader: &mut ModelLoader,
    parent: ElementRef,
    collection: &str,
    target: ElementRef,
) -> Result<()> {
    let link = loader.create_link(parent, target)?;
    let type_tag = loader.node(target).type_tag().map(str::to_owned);
    let doc = loader.document_mut(parent.fragment);
    let node = doc.create_element(collection);
    if let Some(type_tag) = type_tag {
        doc.node_mut(node).attrs.insert("xsi:type".into(), type_tag);
    }
    doc.node_mut(node).attrs.insert("href".into(), link);
    doc.append_child(parent.node, node);
    loader.index_subtree(ElementRef {
        fragment: parent.fragment,
        node,
    })?;
    Ok(())
}

// ----------------------------------------------------------------------
// set
// ----------------------------------------------------------------------

fn apply_set(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    elem: ElementRef,
    assignments: &[(String, ValueSpec)],
    index: usize,
) -> Result<()> {
    for (attribute, value) in assignments {
        let raw = stored_value(
            loader, metamodel, promises, fulfilled, elem, attribute, value, index,
        )?;
        loader
            .node_mut(elem)
            .attrs
            .insert(attribute.clone(), raw);
    }
    Ok(())
}

/// Type-check `value` against the attribute's declared kind and render
/// its stored string form. Undeclared attributes accept any scalar in
/// its string form; references always become link records.
fn stored_value(
    loader: &ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    elem: ElementRef,
    attribute: &str,
    value: &ValueSpec,
    index: usize,
) -> Result<String> {
    let kind = metamodel.attribute_kind(loader.node(elem).type_tag(), attribute);
    let mismatch = |expected: &'static str, got: String| Error::TypeMismatch {
        attribute: attribute.to_owned(),
        expected,
        value: got,
        instruction: index,
    };

    match value {
        ValueSpec::Uuid(_) | ValueSpec::Promise(_) | ValueSpec::Find(_) => {
            if let Some(kind) = kind
                && kind != AttrKind::Reference
            {
                return Err(mismatch(kind.name(), format!("{value:?}")));
            }
            let selector = match value {
                ValueSpec::Uuid(id) => Selector::Uuid(id.clone()),
                ValueSpec::Promise(token) => Selector::Promise(token.clone()),
                ValueSpec::Find(spec) => Selector::Find(spec.clone()),
                _ => unreachable!(),
            };
            let target = selector_target(loader, promises, fulfilled, &selector, index)?;
            loader.create_link(elem, target)
        }
        ValueSpec::Str(s) => match kind {
            None | Some(AttrKind::String) => Ok(s.clone()),
            Some(AttrKind::Enumerated(literals)) => {
                if literals.contains(&s.as_str()) {
                    Ok(s.clone())
                } else {
                    Err(mismatch("an enumeration literal", s.clone()))
                }
            }
            Some(kind) => Err(mismatch(kind.name(), s.clone())),
        },
        ValueSpec::Int(i) => match kind {
            None | Some(AttrKind::Integer) => Ok(i.to_string()),
            Some(AttrKind::Float) => Ok(writer::format_float(*i as f64)),
            Some(kind) => Err(mismatch(kind.name(), i.to_string())),
        },
        ValueSpec::Float(f) => match kind {
            None | Some(AttrKind::Float) => Ok(writer::format_float(*f)),
            Some(kind) => Err(mismatch(kind.name(), f.to_string())),
        },
        ValueSpec::Bool(b) => match kind {
            None | Some(AttrKind::Boolean) => Ok(writer::format_bool(*b).to_owned()),
            Some(kind) => Err(mismatch(kind.name(), b.to_string())),
        },
    }
}

// ----------------------------------------------------------------------
// sync
// ----------------------------------------------------------------------

fn apply_sync(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &mut Fulfilled,
    parent: ElementRef,
    groups: &[(String, Vec<SyncSpec>)],
    index: usize,
) -> Result<()> {
    for (collection, specs) in groups {
        for spec in specs {
            let matches =
                children_matching(loader, promises, fulfilled, parent, collection, &spec.find);
            let elem = match matches.len() {
                1 => {
                    // Hit: only `set` is applied, so re-running the same
                    // sync never grows the collection.
                    let elem = matches[0];
                    apply_set(
                        loader, metamodel, promises, fulfilled, elem, &spec.set, index,
                    )?;
                    elem
                }
                0 => {
                    let object = sync_creation_spec(spec, index)?;
                    create_object(
                        loader, metamodel, promises, fulfilled, parent, collection, &object, index,
                    )?
                }
                n => {
                    return Err(Error::AmbiguousSelector {
                        selector: describe_find(&spec.find),
                        instruction: index,
                        matches: n,
                    });
                }
            };
            apply_sync(
                loader, metamodel, promises, fulfilled, elem, &spec.sync, index,
            )?;
            if let Some(token) = &spec.promise_id {
                fulfilled.push((token.clone(), elem));
            }
        }
    }
    Ok(())
}

/// On a sync miss, the new element is built from the find predicate
/// merged with the `set` and `extend` blocks.
fn sync_creation_spec(spec: &SyncSpec, index: usize) -> Result<ObjectSpec> {
    let mut attrs = Vec::new();
    for (path, value) in &spec.find.constraints {
        if path.contains('.') {
            return Err(Error::instruction(
                index,
                format!("cannot create an element from the nested predicate path {path:?}"),
            ));
        }
        attrs.push((path.clone(), value.clone()));
    }
    attrs.extend(spec.set.iter().cloned());
    Ok(ObjectSpec {
        type_tag: spec.find.type_name.clone(),
        promise_id: None,
        attrs,
        children: spec.extend.clone(),
    })
}

// ----------------------------------------------------------------------
// delete
// ----------------------------------------------------------------------

fn apply_delete(
    loader: &mut ModelLoader,
    metamodel: &dyn Metamodel,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    parent: ElementRef,
    groups: &[(String, Vec<DeleteTarget>)],
    index: usize,
) -> Result<()> {
    for (collection, targets) in groups {
        let ownership = metamodel.ownership(collection);
        for target in targets {
            let child = match target {
                DeleteTarget::Uuid(id) => loader
                    .children(parent)
                    .filter(|c| loader.node(*c).tag == *collection)
                    .find(|c| child_refers_to(loader, *c, id)),
                DeleteTarget::Find(spec) => {
                    let matches =
                        children_matching(loader, promises, fulfilled, parent, collection, spec);
                    match matches.len() {
                        0 => None,
                        1 => Some(matches[0]),
                        n => {
                            return Err(Error::AmbiguousSelector {
                                selector: describe_find(spec),
                                instruction: index,
                                matches: n,
                            });
                        }
                    }
                }
            };
            let child = child.ok_or_else(|| Error::ParentNotFound {
                selector: describe_delete(target),
                instruction: index,
            })?;
            match ownership {
                Ownership::Contained => {
                    // Owned content behind a placeholder lives in another
                    // fragment; destroy both the link and the content.
                    let real = loader.resolve(child)?;
                    loader.remove_subtree(child);
                    if real != child {
                        loader.remove_subtree(real);
                    }
                }
                Ownership::Referenced => loader.remove_subtree(child),
            }
        }
    }
    Ok(())
}

fn child_refers_to(loader: &ModelLoader, child: ElementRef, id: &str) -> bool {
    let node = loader.node(child);
    if node.id() == Some(id) {
        return true;
    }
    node.is_placeholder()
        && loader
            .resolve(child)
            .is_ok_and(|real| loader.node(real).id() == Some(id))
}

// ----------------------------------------------------------------------
// Predicate matching
// ----------------------------------------------------------------------

fn find_one_global(
    loader: &ModelLoader,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    spec: &FindSpec,
    index: usize,
) -> Result<ElementRef> {
    let matches: Vec<ElementRef> = loader
        .fragments()
        .flat_map(|fragment| {
            let doc = loader.document(fragment);
            doc.iter_subtree(doc.root())
                .map(move |node| ElementRef { fragment, node })
        })
        .filter(|elem| find_matches(loader, promises, fulfilled, *elem, spec))
        .collect();
    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(Error::ParentNotFound {
            selector: describe_find(spec),
            instruction: index,
        }),
        n => Err(Error::AmbiguousSelector {
            selector: describe_find(spec),
            instruction: index,
            matches: n,
        }),
    }
}

fn children_matching(
    loader: &ModelLoader,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    parent: ElementRef,
    collection: &str,
    spec: &FindSpec,
) -> Vec<ElementRef> {
    loader
        .children(parent)
        .filter(|c| loader.node(*c).tag == collection)
        .filter(|c| find_matches(loader, promises, fulfilled, *c, spec))
        .collect()
}

/// Whether `elem` satisfies a predicate. Placeholders never match;
/// predicates select real content, not links.
fn find_matches(
    loader: &ModelLoader,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    elem: ElementRef,
    spec: &FindSpec,
) -> bool {
    let node = loader.node(elem);
    if node.is_placeholder() {
        return false;
    }
    if let Some(expected) = spec.type_name.as_deref()
        && node.type_name() != Some(expected)
        && node.type_tag() != Some(expected)
    {
        return false;
    }
    spec.constraints.iter().all(|(path, expected)| {
        attr_at_path(loader, elem, path)
            .is_some_and(|raw| constraint_matches(loader, promises, fulfilled, &raw, expected))
    })
}

/// Walk a dotted path: every segment but the last steps into the single
/// child element with that tag (resolving placeholders), the last names
/// an attribute.
fn attr_at_path(loader: &ModelLoader, elem: ElementRef, path: &str) -> Option<String> {
    let mut current = elem;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return loader.node(current).attr(part).map(str::to_owned);
        }
        let mut kids = loader
            .children(current)
            .filter(|c| loader.node(*c).tag == part);
        let child = kids.next()?;
        if kids.next().is_some() {
            return None;
        }
        current = loader.resolve(child).ok()?;
    }
    None
}

fn constraint_matches(
    loader: &ModelLoader,
    promises: &Promises,
    fulfilled: &[(String, ElementRef)],
    raw: &str,
    expected: &ValueSpec,
) -> bool {
    match expected {
        ValueSpec::Str(s) => raw == s,
        ValueSpec::Int(i) => raw.parse::<i64>() == Ok(*i),
        ValueSpec::Float(f) => raw.parse::<f64>().is_ok_and(|v| v == *f),
        ValueSpec::Bool(b) => raw.parse::<bool>() == Ok(*b),
        ValueSpec::Uuid(id) => {
            raw == id
                || reference_target(loader, raw)
                    .is_some_and(|target| loader.node(target).id() == Some(id))
        }
        ValueSpec::Promise(token) => {
            promise_target(token, promises, fulfilled).is_some_and(|elem| {
                reference_target(loader, raw) == Some(elem)
                    || loader.node(elem).id().is_some_and(|id| raw == id)
            })
        }
        // Rejected at parse time.
        ValueSpec::Find(_) => false,
    }
}

// A stored value that fails to resolve simply never matches a
// reference predicate.
fn reference_target(loader: &ModelLoader, raw: &str) -> Option<ElementRef> {
    match loader.materialize(None, raw) {
        Ok(AttrValue::Reference(elem)) => Some(elem),
        _ => None,
    }
}

fn describe_find(spec: &FindSpec) -> String {
    let mut parts = Vec::new();
    if let Some(type_name) = &spec.type_name {
        parts.push(format!("_type: {type_name}"));
    }
    parts.extend(spec.constraints.iter().map(|(path, _)| path.clone()));
    format!("!find {{{}}}", parts.join(", "))
}

fn describe_delete(target: &DeleteTarget) -> String {
    match target {
        DeleteTarget::Uuid(id) => id.clone(),
        DeleteTarget::Find(spec) => describe_find(spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "00000000-0000-4000-8000-00000000000a";

    #[test]
    fn empty_input_is_an_empty_batch() {
        let batch = Batch::parse(b"").unwrap();
        assert!(batch.is_empty());
        assert!(batch.metadata.is_none());
    }

    #[test]
    fn single_document_is_instructions_only() {
        let batch = Batch::parse(
            format!("- parent: !uuid {UUID_A}\n  set: {{name: Coffee Machine}}\n").as_bytes(),
        )
        .unwrap();
        assert!(batch.metadata.is_none());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn two_documents_are_metadata_and_instructions() {
        let input = format!(
            "model:\n  entrypoint: main.aird\nwritten_by:\n  generator: test\n\
             ---\n- parent: !uuid {UUID_A}\n  set: {{name: x}}\n"
        );
        let batch = Batch::parse(input.as_bytes()).unwrap();
        let metadata = batch.metadata.as_ref().expect("metadata");
        assert_eq!(
            metadata.model.as_ref().unwrap().entrypoint.as_deref(),
            Some("main.aird")
        );
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn three_documents_are_rejected() {
        let err = Batch::parse(b"a: 1\n---\n[]\n---\n[]\n").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)), "{err}");
    }

    #[test]
    fn unknown_instruction_keys_are_rejected() {
        let err = Batch::parse(
            format!("- parent: !uuid {UUID_A}\n  modify: {{name: x}}\n").as_bytes(),
        )
        .unwrap_err();
        assert!(
            matches!(err, Error::InvalidInstruction { instruction: 0, .. }),
            "{err}"
        );
    }

    #[test]
    fn missing_parent_is_rejected() {
        let err = Batch::parse(b"- set: {name: x}\n").unwrap_err();
        assert!(matches!(err, Error::InvalidInstruction { .. }), "{err}");
    }

    #[test]
    fn invalid_uuid_tag_is_rejected() {
        let err = Batch::parse(b"- parent: !uuid not-a-uuid\n  set: {name: x}\n").unwrap_err();
        assert!(matches!(err, Error::InvalidInstruction { .. }), "{err}");
    }

    #[test]
    fn promise_in_delete_is_rejected() {
        let err = Batch::parse(
            format!("- parent: !uuid {UUID_A}\n  delete:\n    functions:\n      - !promise p\n")
                .as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInstruction { .. }), "{err}");
    }

    #[test]
    fn version_components_compare_numerically() {
        assert!(version_components("0.10.0") > version_components("0.9.9"));
        assert_eq!(version_components("0.2.0-alpha"), vec![0, 2, 0]);
        assert!(version_components("1.0") < version_components("1.0.1"));
    }

    #[test]
    fn dump_keeps_tags_and_separator() {
        let metadata = Metadata {
            model: Some(ModelMetadata {
                entrypoint: Some("main.aird".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let instructions: Vec<Value> =
            serde_yaml::from_str(&format!(
                "- parent: !uuid {UUID_A}\n  set: {{owner: !promise the-owner}}\n"
            ))
            .unwrap();
        let out = dump(Some(&metadata), &instructions).unwrap();
        assert!(out.contains("entrypoint: main.aird"), "{out}");
        assert!(out.contains("---\n"), "{out}");
        assert!(out.contains("!uuid"), "{out}");
        assert!(out.contains("!promise the-owner"), "{out}");
    }

    #[test]
    fn sync_spec_requires_find() {
        let err = Batch::parse(
            format!("- parent: !uuid {UUID_A}\n  sync:\n    functions:\n      - set: {{name: x}}\n")
                .as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInstruction { .. }), "{err}");
    }
}
