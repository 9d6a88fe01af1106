//! Metamodel seam for the reconciliation engine.
//!
//! Which attribute holds which kind of value, and whether a collection
//! owns its children, are metamodel questions the engine cannot answer
//! on its own. Callers provide a [`Metamodel`]; the bundled
//! [`RuleMetamodel`] covers tests and simple tooling.

/// Declared kind of an attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    String,
    Integer,
    Float,
    Boolean,
    Enumerated(&'static [&'static str]),
    Reference,
}

impl AttrKind {
    /// Human-readable kind name for error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Float => "a float",
            Self::Boolean => "a boolean",
            Self::Enumerated(_) => "an enumeration literal",
            Self::Reference => "an element reference",
        }
    }
}

/// Whether a collection owns its children or only references them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ownership {
    /// Children physically live here; deleting destroys them.
    #[default]
    Contained,
    /// Children are links to elements owned elsewhere; deleting removes
    /// only the link.
    Referenced,
}

/// Source of metamodel facts consulted during reconciliation.
pub trait Metamodel {
    /// The declared kind of `attribute` on elements of `type_tag`, or
    /// `None` if the attribute is not declared. Undeclared attributes
    /// are treated as strings by the engine.
    fn attribute_kind(&self, type_tag: Option<&str>, attribute: &str) -> Option<AttrKind>;

    /// Ownership of the collection with the given tag name.
    fn ownership(&self, collection: &str) -> Ownership;
}

/// Rule for one attribute in a [`RuleMetamodel`].
#[derive(Clone, Copy, Debug)]
pub struct AttrRule {
    /// Unqualified type name this rule applies to, or `None` for all
    /// types.
    pub type_name: Option<&'static str>,
    pub attribute: &'static str,
    pub kind: AttrKind,
}

/// A declarative [`Metamodel`]: exact-name rules with a default.
#[derive(Clone, Debug, Default)]
pub struct RuleMetamodel {
    attributes: Vec<AttrRule>,
    referenced_collections: Vec<&'static str>,
}

impl RuleMetamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(
        mut self,
        type_name: Option<&'static str>,
        attribute: &'static str,
        kind: AttrKind,
    ) -> Self {
        self.attributes.push(AttrRule {
            type_name,
            attribute,
            kind,
        });
        self
    }

    /// Declare a collection as non-owning.
    pub fn referenced(mut self, collection: &'static str) -> Self {
        self.referenced_collections.push(collection);
        self
    }
}

impl Metamodel for RuleMetamodel {
    fn attribute_kind(&self, type_tag: Option<&str>, attribute: &str) -> Option<AttrKind> {
        let type_name = type_tag.map(|t| t.rsplit(':').next().unwrap_or(t));
        self.attributes
            .iter()
            .filter(|rule| rule.attribute == attribute)
            .find(|rule| rule.type_name.is_none() || rule.type_name == type_name.as_deref())
            .map(|rule| rule.kind)
    }

    fn ownership(&self, collection: &str) -> Ownership {
        if self.referenced_collections.contains(&collection) {
            Ownership::Referenced
        } else {
            Ownership::Contained
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> RuleMetamodel {
        RuleMetamodel::new()
            .attribute(None, "name", AttrKind::String)
            .attribute(Some("Function"), "cost", AttrKind::Float)
            .attribute(Some("Exchange"), "target", AttrKind::Reference)
            .referenced("allocatedFunctions")
    }

    #[test]
    fn typed_rule_beats_nothing_but_respects_type() {
        let m = model();
        assert_eq!(
            m.attribute_kind(Some("fa:Function"), "cost"),
            Some(AttrKind::Float)
        );
        assert_eq!(m.attribute_kind(Some("fa:Actor"), "cost"), None);
    }

    #[test]
    fn untyped_rule_applies_to_everything() {
        let m = model();
        assert_eq!(
            m.attribute_kind(Some("fa:Actor"), "name"),
            Some(AttrKind::String)
        );
        assert_eq!(m.attribute_kind(None, "name"), Some(AttrKind::String));
    }

    #[test]
    fn collections_default_to_contained() {
        let m = model();
        assert_eq!(m.ownership("ownedFunctions"), Ownership::Contained);
        assert_eq!(m.ownership("allocatedFunctions"), Ownership::Referenced);
    }
}
