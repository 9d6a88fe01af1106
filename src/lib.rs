//! # melodel
//!
//! Core library for reading and writing fragmented Capella-style XML
//! models: a fragment store with cross-file navigation, a global
//! identity cache, format-preserving serialization, and a declarative
//! YAML reconciliation engine.
//!
//! ## Module Structure (dependency order)
//!
//! ```text
//! decl      → Declarative reconciliation engine (extend/set/sync/delete)
//!   ↓
//! loader    → ModelLoader: fragment store, identity cache, link resolution
//!   ↓
//! xml       → Arena document model, fragment parser, Eclipse-style writer
//!   ↓
//! error     → Error taxonomy and crate-wide Result
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use melodel::{ModelLoader, decl, decl::RuleMetamodel};
//!
//! # fn main() -> melodel::Result<()> {
//! let mut model = ModelLoader::load(["demo/demo.aird"])?;
//! let instructions = std::fs::read("changes.yml")?;
//! decl::apply(&mut model, &instructions, &RuleMetamodel::new())?;
//! model.save()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// MODULES (dependency order: error → xml → loader → decl)
// ============================================================================

/// Error taxonomy and crate-wide Result alias
pub mod error;

/// Arena document model, fragment parser, format-preserving writer
pub mod xml;

/// Fragment store, identity cache, cross-fragment navigation and links
pub mod loader;

/// Declarative reconciliation engine
pub mod decl;

// Re-export the types nearly every caller needs
pub use error::{Error, Result};
pub use loader::{AttrValue, ElementRef, FragmentId, LoaderConfig, ModelInfo, ModelLoader};
pub use xml::{Document, Node, NodeId};
