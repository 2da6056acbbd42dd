//! Both backends run the same scenarios and must agree on every result.

use fidmerge_core::{
    AliasTable, AttrKind, AttrSpec, Backend, Change, CollectSession, CollectionBackend, DiffWriter,
    FormId, FormKey, GroupSchema, IdReplacements, IdReplacer, LocalBackend, LocalValue,
    MasterPolicy, MergeStore, Patcher, PluginFile, Policy, ReplaceOutcome, Schema,
    SourceCollector, SourceHandle, StoredRecord, TextCodec, Value, WriteOutcome, WriteState,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// =============================================================================
// FIXTURES
// =============================================================================

fn fact_schema() -> Schema {
    let mut schema = Schema::new();
    schema
        .register(
            GroupSchema::columns("FACT")
                .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String).optional())
                .attr(AttrSpec::new("rank", "Rank", AttrKind::Int).optional())
                .with_label("eid"),
        )
        .unwrap();
    schema
}

/// A.esm <- B.esp, plus a patch overriding one faction and one actor
fn write_fixture(dir: &Path) {
    let mut a = PluginFile::new(vec![]);
    a.add_record(
        "FACT",
        StoredRecord::new(FormId::new(0, 1)).with("eid", "Legion").with("rank", 1i64),
    );
    a.add_record("FACT", StoredRecord::new(FormId::new(0, 0x1F)).with("eid", "Mages"));
    a.add_record("NPC_", StoredRecord::new(FormId::new(0, 0x123A)).with("eid", "Guard01"));
    a.save_atomic(dir.join("A.esm")).unwrap();

    let mut links = BTreeMap::new();
    links.insert(FormId::new(0, 1), 2);
    links.insert(FormId::new(1, 2), 0);
    let mut b = PluginFile::new(vec!["A.esm".to_string()]);
    b.add_record("FACT", StoredRecord::new(FormId::new(0, 1)).with("rank", 3i64));
    b.add_record(
        "FACT",
        StoredRecord::new(FormId::new(1, 2)).with("eid", "Thieves").with("rank", 0i64),
    );
    b.add_record("FACT", StoredRecord::new(FormId::new(7, 9)).with("rank", 5i64));
    b.add_record(
        "NPC_",
        StoredRecord::new(FormId::new(0, 0x123A)).with("factions", Value::Links(links)),
    );
    b.save_atomic(dir.join("B.esp")).unwrap();

    let mut patch = PluginFile::new(vec!["A.esm".to_string()]);
    patch.add_record(
        "FACT",
        StoredRecord::new(FormId::new(0, 1)).with("eid", "Legion").with("rank", 1i64),
    );
    let mut existing = BTreeMap::new();
    existing.insert(FormId::new(0, 0x1F), 4);
    patch.add_record(
        "NPC_",
        StoredRecord::new(FormId::new(0, 0x123A)).with("factions", Value::Links(existing)),
    );
    patch.save_atomic(dir.join("Patch.esp")).unwrap();
}

fn order() -> Vec<String> {
    vec!["A.esm".to_string(), "B.esp".to_string()]
}

fn collect<B: Backend>(
    backend: &mut B,
    schema: &Schema,
    aliases: &AliasTable,
    groups: &[String],
) -> MergeStore {
    let mut store = MergeStore::new();
    SourceCollector::new(schema, aliases, Policy::LastWins)
        .with_label_groups(["FACT"])
        .collect(backend, &order(), groups, &mut CollectSession::new(), &mut store)
        .unwrap();
    store
}

/// Collect FACT, write it to the patch twice
fn fact_run<B: Backend>(backend: &mut B) -> (MergeStore, WriteOutcome, WriteOutcome) {
    let schema = fact_schema();
    let aliases = AliasTable::new();
    let groups = vec!["FACT".to_string()];
    let store = collect(backend, &schema, &aliases, &groups);
    let writer = DiffWriter::new(&schema, &aliases);
    let first = writer.write(backend, "Patch.esp", &store, &groups).unwrap();
    let second = writer.write(backend, "Patch.esp", &store, &groups).unwrap();
    (store, first, second)
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_override_rank_scenario_on_both_backends() {
    let local_dir = tempfile::tempdir().unwrap();
    let collection_dir = tempfile::tempdir().unwrap();
    write_fixture(local_dir.path());
    write_fixture(collection_dir.path());

    let local = fact_run(&mut LocalBackend::new(local_dir.path()));
    let collection = fact_run(&mut CollectionBackend::new(collection_dir.path()));

    let key = FormKey::new("A.esm", 1);
    let (store, first, second) = &local;
    assert_eq!(store.get("FACT", &key).unwrap().get("rank"), Some(&Value::Int(3)));
    assert!(store.get("FACT", &FormKey::new("B.esp", 9)).is_none());
    assert_eq!(
        first.changes,
        vec![Change {
            group: "FACT".to_string(),
            key: key.clone(),
            attribute: "rank".to_string(),
            old: Some(Value::Int(1)),
            new: Value::Int(3),
        }]
    );
    assert_eq!(first.state, WriteState::Saved);
    assert_eq!(second.state, WriteState::Unchanged);
    assert!(second.changes.is_empty());

    assert_eq!(local, collection);
    assert_eq!(
        fs::read(local_dir.path().join("Patch.esp")).unwrap(),
        fs::read(collection_dir.path().join("Patch.esp")).unwrap()
    );
}

#[test]
fn test_unchanged_write_does_not_touch_file() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let path = dir.path().join("Patch.esp");

    let mut backend = CollectionBackend::new(dir.path());
    fact_run(&mut backend);
    let before = fs::metadata(&path).unwrap().modified().unwrap();
    let bytes = fs::read(&path).unwrap();

    let (_, first, _) = fact_run(&mut backend);
    assert_eq!(first.state, WriteState::Unchanged);
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
    assert_eq!(fs::read(&path).unwrap(), bytes);
    assert_eq!(backend.engine().loaded().count(), 0);
}

fn faction_links_run<B: Backend>(
    backend: &mut B,
    dir: &Path,
) -> (WriteOutcome, BTreeMap<FormId, i64>) {
    let patcher = Patcher::factions();
    let schema = patcher.schema().unwrap();
    let aliases = AliasTable::new();
    let store = collect(backend, &schema, &aliases, &patcher.group_tags());
    let outcome = DiffWriter::new(&schema, &aliases)
        .with_master_policy(MasterPolicy::Extend)
        .write(backend, "Patch.esp", &store, &patcher.group_tags())
        .unwrap();
    let saved = PluginFile::load(dir.join("Patch.esp")).unwrap();
    let links = saved.records("NPC_")[0].fields["factions"].as_links().unwrap().clone();
    (outcome, links)
}

#[test]
fn test_links_are_only_added_and_masters_extended() {
    let local_dir = tempfile::tempdir().unwrap();
    let collection_dir = tempfile::tempdir().unwrap();
    write_fixture(local_dir.path());
    write_fixture(collection_dir.path());

    let local = faction_links_run(&mut LocalBackend::new(local_dir.path()), local_dir.path());
    let collection = faction_links_run(
        &mut CollectionBackend::new(collection_dir.path()),
        collection_dir.path(),
    );
    assert_eq!(local, collection);

    let (outcome, links) = local;
    assert_eq!(outcome.added_masters, vec!["B.esp".to_string()]);
    // existing member kept, both collected members added
    assert_eq!(links.len(), 3);
    assert_eq!(links[&FormId::new(0, 0x1F)], 4);
    assert_eq!(links[&FormId::new(0, 1)], 2);
    assert_eq!(links[&FormId::new(1, 2)], 0);
}

#[test]
fn test_strict_policy_fails_identically() {
    let local_dir = tempfile::tempdir().unwrap();
    let collection_dir = tempfile::tempdir().unwrap();
    write_fixture(local_dir.path());
    write_fixture(collection_dir.path());

    let patcher = Patcher::factions();
    let schema = patcher.schema().unwrap();
    let aliases = AliasTable::new();

    let mut local = LocalBackend::new(local_dir.path());
    let store = collect(&mut local, &schema, &aliases, &patcher.group_tags());
    let writer = DiffWriter::new(&schema, &aliases);
    let local_err = writer
        .write(&mut local, "Patch.esp", &store, &patcher.group_tags())
        .unwrap_err()
        .to_string();
    let mut collection = CollectionBackend::new(collection_dir.path());
    let collection_err = writer
        .write(&mut collection, "Patch.esp", &store, &patcher.group_tags())
        .unwrap_err()
        .to_string();
    assert_eq!(local_err, collection_err);
}

#[test]
fn test_handles_see_the_same_records() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());

    let mut local = LocalBackend::new(dir.path());
    let mut collection = CollectionBackend::new(dir.path());
    for name in ["A.esm", "B.esp", "Patch.esp"] {
        for group in ["FACT", "NPC_"] {
            let a = local.open_source(name, true, false).unwrap().records(group);
            let b = collection.open_source(name, true, false).unwrap().records(group);
            assert_eq!(a, b, "{} {}", name, group);
        }
    }
}

#[test]
fn test_aliases_make_text_and_binary_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    // C.esp was built against A.esm under its old name
    let mut c = PluginFile::new(vec!["Legacy.esm".to_string()]);
    c.add_record(
        "FACT",
        StoredRecord::new(FormId::new(0, 1)).with("eid", "Legion").with("rank", 7i64),
    );
    c.save_atomic(dir.path().join("C.esp")).unwrap();

    let schema = fact_schema();
    let mut aliases = AliasTable::new();
    aliases.insert("Legacy.esm", "A.esm");
    let sources = vec!["A.esm".to_string(), "B.esp".to_string(), "C.esp".to_string()];
    let groups = vec!["FACT".to_string()];

    let mut binary = MergeStore::new();
    SourceCollector::new(&schema, &aliases, Policy::LastWins)
        .collect(
            &mut LocalBackend::new(dir.path()),
            &sources,
            &groups,
            &mut CollectSession::new(),
            &mut binary,
        )
        .unwrap();
    let legion = FormKey::new("A.esm", 1);
    assert_eq!(binary.get("FACT", &legion).unwrap().get("rank"), Some(&Value::Int(7)));
    assert_eq!(binary.get("FACT", &legion).unwrap().origin("rank"), Some("C.esp"));
    assert!(binary.get("FACT", &FormKey::new("Legacy.esm", 1)).is_none());

    let mut text = MergeStore::new();
    let report = TextCodec::new(&schema, &aliases).decode_str(
        "\"FACT\",\"Legacy.esm\",\"0x000001\",\"Legion\",\"7\"\n\
         \"FACT\",\"B.esp\",\"0x000002\",\"Thieves\",\"0\"\n",
        &mut text,
    );
    assert_eq!(report.accepted, 2);

    let text_keys: Vec<&FormKey> = text.group("FACT").unwrap().keys().collect();
    assert_eq!(text_keys, vec![&legion, &FormKey::new("B.esp", 2)]);
    for key in text_keys {
        let from_text: Vec<_> = text.get("FACT", key).unwrap().attributes().collect();
        let from_binary: Vec<_> = binary.get("FACT", key).unwrap().attributes().collect();
        assert_eq!(from_text, from_binary);
    }
}

/// A.esm with unset, none and empty attributes
fn write_sparse_fixture(dir: &Path) {
    let mut a = PluginFile::new(vec![]);
    a.add_record("FACT", StoredRecord::new(FormId::new(0, 1)).with("eid", "Legion"));
    a.add_record(
        "FACT",
        StoredRecord::new(FormId::new(0, 2)).with("eid", "").with("full", "Mages"),
    );
    a.add_record(
        "FACT",
        StoredRecord::new(FormId::new(0, 3)).with("eid", "Thieves").with("full", LocalValue::None),
    );
    a.add_record(
        "WEAP",
        StoredRecord::new(FormId::new(0, 4)).with("eid", "Sword").with("value", 10i64),
    );
    a.add_record(
        "WEAP",
        StoredRecord::new(FormId::new(0, 5)).with("eid", "Bow").with("weight", 9i64),
    );
    a.save_atomic(dir.join("A.esm")).unwrap();
}

/// Collect `patcher` from A.esm, export, import the text unchanged and write
/// it back into A.esm
fn export_import_run<B: Backend>(backend: &mut B, patcher: &Patcher) -> WriteOutcome {
    let schema = patcher.schema().unwrap();
    let aliases = AliasTable::new();
    let mut store = MergeStore::new();
    SourceCollector::new(&schema, &aliases, patcher.policy)
        .collect(
            backend,
            &["A.esm".to_string()],
            &patcher.group_tags(),
            &mut CollectSession::new(),
            &mut store,
        )
        .unwrap();
    let codec = TextCodec::new(&schema, &aliases);
    let text = codec.encode_to_string(&store).unwrap();
    let mut back = MergeStore::new();
    let report = codec.decode_str(&text, &mut back);
    assert_eq!(report.skipped(), 0, "{}", text);
    assert_eq!(report.accepted, store.entry_count());

    DiffWriter::new(&schema, &aliases)
        .write(backend, "A.esm", &back, &patcher.group_tags())
        .unwrap()
}

#[test]
fn test_unedited_export_imports_as_no_change() {
    for patcher in [Patcher::full_names(), Patcher::item_stats()] {
        let local_dir = tempfile::tempdir().unwrap();
        let collection_dir = tempfile::tempdir().unwrap();
        write_sparse_fixture(local_dir.path());
        write_sparse_fixture(collection_dir.path());

        let local = export_import_run(&mut LocalBackend::new(local_dir.path()), &patcher);
        let collection =
            export_import_run(&mut CollectionBackend::new(collection_dir.path()), &patcher);
        assert_eq!(local.changes, vec![], "{}", patcher.name);
        assert_eq!(local.state, WriteState::Unchanged);
        assert_eq!(local, collection);
    }
}

fn replace_run<B: Backend>(backend: &mut B) -> ReplaceOutcome {
    let aliases = AliasTable::new();
    let replacements = IdReplacements::decode_str(
        "\"FACT\",\"A.esm\",\"0x00001F\",\"Mages\",\"Legion\",\"A.esm\",\"0x000001\"\n",
        &aliases,
    );
    IdReplacer::new(&aliases)
        .replace(backend, "Patch.esp", &replacements, &["NPC_".to_string()])
        .unwrap()
}

#[test]
fn test_id_replacement_on_both_backends() {
    let local_dir = tempfile::tempdir().unwrap();
    let collection_dir = tempfile::tempdir().unwrap();
    write_fixture(local_dir.path());
    write_fixture(collection_dir.path());

    let local = replace_run(&mut LocalBackend::new(local_dir.path()));
    let collection = replace_run(&mut CollectionBackend::new(collection_dir.path()));
    assert_eq!(local, collection);
    assert_eq!(local.counts[&FormKey::new("A.esm", 0x1F)], 1);
    assert_eq!(
        fs::read(local_dir.path().join("Patch.esp")).unwrap(),
        fs::read(collection_dir.path().join("Patch.esp")).unwrap()
    );

    let saved = PluginFile::load(local_dir.path().join("Patch.esp")).unwrap();
    let links = saved.records("NPC_")[0].fields["factions"].as_links().unwrap().clone();
    assert_eq!(links.into_iter().collect::<Vec<_>>(), vec![(FormId::new(0, 1), 4)]);
}
