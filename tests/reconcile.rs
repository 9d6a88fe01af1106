//! End-to-end reconciliation scenarios: extend, set, sync, delete,
//! promises, and batch atomicity against a small Capella-style model.

use melodel::decl::{self, AttrKind, Batch, RuleMetamodel};
use melodel::{AttrValue, ElementRef, Error, ModelLoader};

const PROJECT: &str = "11111111-1111-4111-8111-111111111111";
const GRIND: &str = "22222222-2222-4222-8222-222222222222";
const HEAT: &str = "33333333-3333-4333-8333-333333333333";
const BOILER: &str = "44444444-4444-4444-8444-444444444444";

fn fixture() -> (tempfile::TempDir, ModelLoader) {
    let dir = tempfile::tempdir().expect("tempdir");
    let content = format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<!--Capella_Version_5.2.0-->\n",
            "<capellamodeller:Project id=\"{project}\" name=\"Coffee\">\n",
            "  <ownedFunctions xsi:type=\"fa:Function\" id=\"{grind}\" name=\"grind beans\"/>\n",
            "  <ownedFunctions xsi:type=\"fa:Function\" id=\"{heat}\" name=\"heat water\"/>\n",
            "  <ownedComponents xsi:type=\"pa:Component\" id=\"{boiler}\" name=\"Boiler\">\n",
            "    <allocatedFunctions xsi:type=\"fa:Function\" href=\"#{heat}\"/>\n",
            "  </ownedComponents>\n",
            "</capellamodeller:Project>\n",
        ),
        project = PROJECT,
        grind = GRIND,
        heat = HEAT,
        boiler = BOILER,
    );
    let path = dir.path().join("coffee.capella");
    std::fs::write(&path, content).expect("write fixture");
    let loader = ModelLoader::load([path]).expect("load");
    (dir, loader)
}

fn metamodel() -> RuleMetamodel {
    RuleMetamodel::new()
        .attribute(None, "name", AttrKind::String)
        .attribute(Some("Function"), "cost", AttrKind::Float)
        .attribute(None, "target", AttrKind::Reference)
        .referenced("allocatedFunctions")
}

fn functions(loader: &ModelLoader) -> Vec<(ElementRef, String)> {
    let project = loader.lookup(PROJECT).unwrap();
    loader
        .children(project)
        .filter(|c| loader.node(*c).tag == "ownedFunctions")
        .map(|c| (c, loader.node(c).attr("name").unwrap_or("").to_owned()))
        .collect()
}

#[test]
fn extend_adds_a_cached_child() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  \
           extend:\n    \
             ownedFunctions:\n      \
               - _type: fa:Function\n        \
                 name: brew coffee\n"
    );
    decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    let funcs = functions(&loader);
    assert_eq!(funcs.len(), 3);
    let (elem, name) = funcs.last().unwrap();
    assert_eq!(name, "brew coffee");
    let id = loader.node(*elem).id().expect("generated id").to_owned();
    assert_eq!(loader.lookup(&id), Some(*elem));
}

#[test]
fn promises_resolve_regardless_of_declaration_order() {
    let declare = format!(
        "- parent: !uuid {PROJECT}\n  \
           extend:\n    \
             ownedFunctions:\n      \
               - _type: fa:Function\n        \
                 name: steam milk\n        \
                 promise_id: steam-output\n"
    );
    let reference = format!(
        "- parent: !uuid {BOILER}\n  \
           extend:\n    \
             allocatedFunctions:\n      \
               - !promise steam-output\n"
    );
    for yaml in [
        format!("{declare}{reference}"),
        format!("{reference}{declare}"),
    ] {
        let (_dir, mut loader) = fixture();
        let promises =
            decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

        let steam = promises["steam-output"];
        assert_eq!(loader.node(steam).attr("name"), Some("steam milk"));

        let boiler = loader.lookup(BOILER).unwrap();
        let link = loader
            .children(boiler)
            .filter(|c| loader.node(*c).is_placeholder())
            .find(|c| loader.resolve(*c).ok() == Some(steam));
        assert!(link.is_some(), "no link to the promised element");
    }
}

#[test]
fn delete_from_a_non_owning_collection_keeps_the_element() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {BOILER}\n  \
           delete:\n    \
             allocatedFunctions:\n      \
               - {HEAT}\n"
    );
    decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    let boiler = loader.lookup(BOILER).unwrap();
    assert_eq!(loader.children(boiler).count(), 0);
    assert!(loader.lookup(HEAT).is_some(), "referenced element was destroyed");
}

#[test]
fn delete_from_an_owning_collection_destroys_the_element() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  \
           delete:\n    \
             ownedFunctions:\n      \
               - {GRIND}\n"
    );
    decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    assert_eq!(loader.lookup(GRIND), None);
    assert_eq!(functions(&loader).len(), 1);
}

#[test]
fn sync_is_idempotent() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  \
           sync:\n    \
             ownedFunctions:\n      \
               - find:\n          \
                   name: froth milk\n        \
                 set:\n          \
                   description: adds foam\n        \
                 promise_id: froth\n"
    );
    let metamodel = metamodel();
    let first = decl::apply(&mut loader, yaml.as_bytes(), &metamodel).expect("first");
    let second = decl::apply(&mut loader, yaml.as_bytes(), &metamodel).expect("second");

    let froth: Vec<_> = functions(&loader)
        .into_iter()
        .filter(|(_, name)| name == "froth milk")
        .collect();
    assert_eq!(froth.len(), 1, "second sync must not create a duplicate");
    assert_eq!(
        loader.node(froth[0].0).attr("description"),
        Some("adds foam")
    );
    assert_eq!(first["froth"], second["froth"]);
}

#[test]
fn sync_hit_updates_the_existing_element() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  \
           sync:\n    \
             ownedFunctions:\n      \
               - find:\n          \
                   name: grind beans\n        \
                 set:\n          \
                   description: coarse\n"
    );
    decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    assert_eq!(functions(&loader).len(), 2, "no new element on a hit");
    let grind = loader.lookup(GRIND).unwrap();
    assert_eq!(loader.node(grind).attr("description"), Some("coarse"));
}

#[test]
fn set_enforces_declared_kinds() {
    let (_dir, mut loader) = fixture();
    let metamodel = metamodel();

    let ok = format!("- parent: !uuid {GRIND}\n  set: {{cost: 2.5}}\n");
    decl::apply(&mut loader, ok.as_bytes(), &metamodel).expect("float ok");
    let grind = loader.lookup(GRIND).unwrap();
    assert_eq!(loader.node(grind).attr("cost"), Some("2.5"));

    let whole = format!("- parent: !uuid {GRIND}\n  set: {{cost: 3}}\n");
    decl::apply(&mut loader, whole.as_bytes(), &metamodel).expect("int into float ok");
    let grind = loader.lookup(GRIND).unwrap();
    assert_eq!(loader.node(grind).attr("cost"), Some("3.0"));

    let bad = format!("- parent: !uuid {GRIND}\n  set: {{cost: cheap}}\n");
    let err = decl::apply(&mut loader, bad.as_bytes(), &metamodel).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }), "{err}");
}

#[test]
fn set_stores_references_as_links() {
    let (_dir, mut loader) = fixture();
    let yaml = format!("- parent: !uuid {GRIND}\n  set: {{target: !uuid {HEAT}}}\n");
    decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    let grind = loader.lookup(GRIND).unwrap();
    let raw = loader.node(grind).attr("target").expect("stored link");
    let heat = loader.lookup(HEAT).unwrap();
    assert_eq!(
        loader.materialize(Some(grind), raw).expect("resolves"),
        AttrValue::Reference(heat)
    );
}

#[test]
fn set_may_use_a_promise_declared_later_in_the_same_instruction() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  \
           set: {{target: !promise froth}}\n  \
           sync:\n    \
             ownedFunctions:\n      \
               - find:\n          \
                   name: froth milk\n        \
                 promise_id: froth\n"
    );
    let promises = decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).expect("apply");

    let froth = promises["froth"];
    assert_eq!(loader.node(froth).attr("name"), Some("froth milk"));
    let project = loader.lookup(PROJECT).unwrap();
    let raw = loader.node(project).attr("target").expect("stored link");
    assert_eq!(
        loader.materialize(Some(project), raw).expect("resolves"),
        AttrValue::Reference(froth)
    );
}

#[test]
fn a_failing_instruction_rolls_back_the_whole_batch() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {PROJECT}\n  set: {{name: Renamed}}\n\
         - parent: !uuid 99999999-9999-4999-8999-999999999999\n  set: {{name: x}}\n"
    );
    let err = decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).unwrap_err();
    assert!(matches!(err, Error::ParentNotFound { instruction: 1, .. }), "{err}");

    let project = loader.lookup(PROJECT).unwrap();
    assert_eq!(loader.node(project).attr("name"), Some("Coffee"));
    assert_eq!(functions(&loader).len(), 2);
}

#[test]
fn unfulfilled_promises_fail_the_batch() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "- parent: !uuid {BOILER}\n  \
           extend:\n    \
             allocatedFunctions:\n      \
               - !promise never-made\n"
    );
    let err = decl::apply(&mut loader, yaml.as_bytes(), &metamodel()).unwrap_err();
    assert!(
        matches!(&err, Error::UnresolvedPromise { tokens } if tokens == &["never-made"]),
        "{err}"
    );
    let boiler = loader.lookup(BOILER).unwrap();
    assert_eq!(loader.children(boiler).count(), 1, "batch must not apply");
}

#[test]
fn deleted_elements_never_resolve_again() {
    let (_dir, mut loader) = fixture();
    let metamodel = metamodel();

    let create = format!(
        "- parent: !uuid {PROJECT}\n  \
           extend:\n    \
             ownedFunctions:\n      \
               - _type: fa:Function\n        \
                 name: temporary\n        \
                 promise_id: tmp\n"
    );
    let promises = decl::apply(&mut loader, create.as_bytes(), &metamodel).expect("create");
    let elem = promises["tmp"];
    let id = loader.node(elem).id().unwrap().to_owned();
    assert_eq!(loader.lookup(&id), Some(elem));

    let delete = format!(
        "- parent: !uuid {PROJECT}\n  delete:\n    ownedFunctions:\n      - {id}\n"
    );
    decl::apply(&mut loader, delete.as_bytes(), &metamodel).expect("delete");
    assert_eq!(loader.lookup(&id), None);
}

#[test]
fn strict_metadata_mismatch_fails_lenient_passes() {
    let (_dir, mut loader) = fixture();
    let yaml = format!(
        "model:\n  entrypoint: other.aird\n\
         ---\n\
         - parent: !uuid {PROJECT}\n  set: {{name: Renamed}}\n"
    );
    let batch = Batch::parse(yaml.as_bytes()).expect("parse");

    let err = batch.verify_metadata(&loader, true).unwrap_err();
    assert!(matches!(err, Error::MetadataMismatch { field: "entrypoint", .. }), "{err}");

    batch.verify_metadata(&loader, false).expect("lenient");
    batch.apply(&mut loader, &metamodel()).expect("apply");
    let project = loader.lookup(PROJECT).unwrap();
    assert_eq!(loader.node(project).attr("name"), Some("Renamed"));
}

#[test]
fn strict_mode_requires_a_metadata_document() {
    let (_dir, loader) = fixture();
    let yaml = format!("- parent: !uuid {PROJECT}\n  set: {{name: x}}\n");
    let batch = Batch::parse(yaml.as_bytes()).expect("parse");

    let err = batch.verify_metadata(&loader, true).unwrap_err();
    assert!(matches!(err, Error::InvalidDocument(_)), "{err}");
    batch.verify_metadata(&loader, false).expect("lenient");
}

#[test]
fn strict_mode_rejects_unverifiable_revision() {
    let (_dir, loader) = fixture();
    let yaml = format!(
        "model:\n  entrypoint: coffee.capella\n  revision: abc123\n\
         ---\n\
         - parent: !uuid {PROJECT}\n  set: {{name: x}}\n"
    );
    let batch = Batch::parse(yaml.as_bytes()).expect("parse");

    let err = batch.verify_metadata(&loader, true).unwrap_err();
    assert!(matches!(err, Error::MetadataMismatch { field: "revision", .. }), "{err}");
    batch.verify_metadata(&loader, false).expect("lenient");
}
