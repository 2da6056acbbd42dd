//! CSV interchange for the merge store
//!
//! Exports are UTF-8 with a byte order mark, every field quoted. Each group
//! gets its own header row followed by its entries in store order. Imports are
//! forgiving: anything that does not look like a data row is skipped and
//! counted in the [`DecodeReport`] instead of failing the whole file.
//!
//! Field shapes for unset attributes, [`Value::None`] and empty strings are
//! described in [`crate::schema`].

use crate::alias::AliasTable;
use crate::error::{Error, Result};
use crate::formid::{parse_object_id, FormKey};
use crate::schema::{AttrKind, AttrSpec, GroupSchema, Layout, Schema};
use crate::script::RenameMap;
use crate::store::{MergeStore, Policy, UNKNOWN_LABEL};
use crate::value::Value;
use csv::{QuoteStyle, StringRecord, WriterBuilder};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Origin recorded for values read from text
pub const TEXT_ORIGIN: &str = "text";

/// What a decode pass accepted and dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Rows looked at, header rows excluded
    pub rows_read: usize,
    pub accepted: usize,
    /// Rows with an unknown type, a missing `0x` object id, a missing
    /// required column or broken quoting
    pub skipped_malformed: usize,
    /// Rows whose required attribute did not coerce
    pub skipped_coercion: usize,
    /// Labels rejected by a strict-label group (row skipped)
    pub bad_labels: Vec<String>,
    /// Labels accepted but not starting with a letter
    pub questionable_labels: Vec<String>,
    /// Explicit renames from the rename column
    pub renames: RenameMap,
}

impl DecodeReport {
    pub fn skipped(&self) -> usize {
        self.skipped_malformed + self.skipped_coercion + self.bad_labels.len()
    }
}

enum RowError {
    Malformed(&'static str),
    Coercion(Error),
    BadLabel(String),
}

type RowResult<T> = std::result::Result<T, RowError>;

/// Encodes and decodes a store against a schema
#[derive(Debug, Clone, Copy)]
pub struct TextCodec<'a> {
    schema: &'a Schema,
    aliases: &'a AliasTable,
    baseline: Option<&'a MergeStore>,
}

impl<'a> TextCodec<'a> {
    pub fn new(schema: &'a Schema, aliases: &'a AliasTable) -> Self {
        Self {
            schema,
            aliases,
            baseline: None,
        }
    }

    /// Fill comparison columns from `baseline` when encoding
    pub fn with_baseline(mut self, baseline: &'a MergeStore) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Merge every data row of `bytes` into `store` (later rows win)
    pub fn decode(&self, bytes: &[u8], store: &mut MergeStore) -> DecodeReport {
        let body = bytes.strip_prefix(BOM).unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body);

        let mut report = DecodeReport::default();
        for (line, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!("row {}: {}", line + 1, e);
                    report.rows_read += 1;
                    report.skipped_malformed += 1;
                    continue;
                }
            };
            if record.get(0) == Some("Type") {
                continue;
            }
            report.rows_read += 1;
            match self.decode_row(&record, store, &mut report) {
                Ok(()) => report.accepted += 1,
                Err(RowError::Malformed(why)) => {
                    tracing::debug!("row {}: {}", line + 1, why);
                    report.skipped_malformed += 1;
                }
                Err(RowError::Coercion(e)) => {
                    tracing::debug!("row {}: {}", line + 1, e);
                    report.skipped_coercion += 1;
                }
                Err(RowError::BadLabel(label)) => {
                    tracing::debug!("row {}: invalid label '{}'", line + 1, label);
                    report.bad_labels.push(label);
                }
            }
        }
        report
    }

    /// Decode text (a leading BOM is allowed)
    pub fn decode_str(&self, text: &str, store: &mut MergeStore) -> DecodeReport {
        self.decode(text.as_bytes(), store)
    }

    /// Decode a file
    pub fn read_file<P: AsRef<Path>>(
        &self,
        path: P,
        store: &mut MergeStore,
    ) -> Result<DecodeReport> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let report = self.decode(&bytes, store);
        tracing::info!(
            "read {}: {} row(s) accepted, {} skipped",
            path.display(),
            report.accepted,
            report.skipped()
        );
        Ok(report)
    }

    fn decode_row(
        &self,
        record: &StringRecord,
        store: &mut MergeStore,
        report: &mut DecodeReport,
    ) -> RowResult<()> {
        let tag = record.get(0).unwrap_or_default();
        let group = self.schema.group(tag).ok_or(RowError::Malformed("unknown record type"))?;
        match &group.layout {
            Layout::Columns => self.decode_columns(group, record, store, report),
            Layout::Links { .. } => self.decode_link(group, record, store),
        }
    }

    fn key_at(&self, record: &StringRecord, source: usize, object: usize) -> RowResult<FormKey> {
        let source = record
            .get(source)
            .ok_or(RowError::Malformed("missing source column"))?;
        let object = record
            .get(object)
            .ok_or(RowError::Malformed("missing object column"))?;
        if !object.starts_with("0x") {
            return Err(RowError::Malformed("object id lacks 0x"));
        }
        let object = parse_object_id(object).ok_or(RowError::Malformed("bad object id"))?;
        if source.is_empty() {
            return Err(RowError::Malformed("empty source"));
        }
        Ok(FormKey::new(self.aliases.resolve(source), object))
    }

    fn decode_columns(
        &self,
        group: &GroupSchema,
        record: &StringRecord,
        store: &mut MergeStore,
        report: &mut DecodeReport,
    ) -> RowResult<()> {
        let key = self.key_at(record, 1, 2)?;
        let mut attributes = Vec::with_capacity(group.attributes.len());
        let mut label = None;
        for (i, spec) in group.attributes.iter().enumerate() {
            let raw = match record.get(3 + i) {
                Some(raw) => raw,
                None if spec.required => {
                    return Err(RowError::Malformed("missing required column"))
                }
                None => continue,
            };
            let Some(value) = spec.read(raw).map_err(RowError::Coercion)? else {
                continue;
            };
            if group.label.as_deref() == Some(spec.name.as_str()) {
                if let Value::String(text) = &value {
                    label = Some(text.clone());
                }
            }
            attributes.push((spec.name.clone(), value));
        }

        if let Some(text) = &label {
            if group.strict_labels {
                if text.is_empty() || !text.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(RowError::BadLabel(text.clone()));
                }
                if !text.starts_with(|c: char| c.is_ascii_alphabetic()) {
                    report.questionable_labels.push(text.clone());
                }
            }
            if group.rename_column.is_some() {
                let column = 3 + group.attributes.len();
                if let Some(old) = record.get(column).filter(|s| !s.is_empty()) {
                    report.renames.insert(old, text);
                }
            }
        }

        store.put(&group.tag, &key, attributes, TEXT_ORIGIN, Policy::LastWins);
        if let Some(text) = &label {
            store.set_label(&key, text, Policy::LastWins);
        }
        Ok(())
    }

    fn decode_link(
        &self,
        group: &GroupSchema,
        record: &StringRecord,
        store: &mut MergeStore,
    ) -> RowResult<()> {
        let spec = group
            .links_attribute()
            .ok_or(RowError::Malformed("group has no links attribute"))?;
        let subject = self.key_at(record, 2, 3)?;
        let target = self.key_at(record, 5, 6)?;
        let raw_rank = record
            .get(7)
            .ok_or(RowError::Malformed("missing rank column"))?;
        let rank = AttrKind::Int
            .coerce(raw_rank)
            .map_err(RowError::Coercion)?
            .as_int()
            .unwrap_or_default();

        store.merge_link(&group.tag, &subject, &spec.name, target.clone(), rank, TEXT_ORIGIN);
        for (key, column) in [(&subject, 1), (&target, 4)] {
            match record.get(column) {
                Some(label) if label != UNKNOWN_LABEL => {
                    store.set_label(key, label, Policy::LastWins)
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Write every non-empty group of `store`
    pub fn encode<W: Write>(&self, store: &MergeStore, mut out: W) -> Result<()> {
        out.write_all(BOM)?;
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .flexible(true)
            .from_writer(out);
        for tag in store.group_tags() {
            let group = self.schema.require(tag)?;
            writer.write_record(group.headers())?;
            match &group.layout {
                Layout::Columns => self.encode_columns(group, store, &mut writer)?,
                Layout::Links { .. } => Self::encode_links(group, store, &mut writer)?,
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn encode_columns<W: Write>(
        &self,
        group: &GroupSchema,
        store: &MergeStore,
        writer: &mut csv::Writer<W>,
    ) -> Result<()> {
        for sorted in store.sorted_group(&group.tag) {
            let mut row = vec![
                group.tag.clone(),
                sorted.key.source.clone(),
                format!("0x{:06X}", sorted.key.object),
            ];
            for spec in &group.attributes {
                row.push(render_field(spec, sorted.entry.get(&spec.name), sorted.key)?);
            }
            if group.comparison_prefix.is_some() {
                let base = self
                    .baseline
                    .and_then(|b| b.get(&group.tag, sorted.key));
                for spec in group.compared_attributes() {
                    let value = base.and_then(|e| e.get(&spec.name));
                    row.push(render_field(spec, value, sorted.key)?);
                }
            }
            if group.rename_column.is_some() {
                row.push(String::new());
            }
            writer.write_record(&row)?;
        }
        Ok(())
    }

    fn encode_links<W: Write>(
        group: &GroupSchema,
        store: &MergeStore,
        writer: &mut csv::Writer<W>,
    ) -> Result<()> {
        let Some(spec) = group.links_attribute() else {
            return Ok(());
        };
        for sorted in store.sorted_group(&group.tag) {
            let links = match sorted.entry.get(&spec.name) {
                Some(Value::Links(links)) => links,
                None | Some(Value::None) => continue,
                Some(_) => {
                    return Err(Error::Encode {
                        attribute: spec.name.clone(),
                        key: sorted.key.clone(),
                    })
                }
            };
            let subject = format!("0x{:06X}", sorted.key.object);
            for (target, label, rank) in store.sorted_links(links) {
                let object = format!("0x{:06X}", target.object);
                let rank = rank.to_string();
                writer.write_record([
                    group.tag.as_str(),
                    sorted.label,
                    sorted.key.source.as_str(),
                    subject.as_str(),
                    label,
                    target.source.as_str(),
                    object.as_str(),
                    rank.as_str(),
                ])?;
            }
        }
        Ok(())
    }

    /// Encode to a string (BOM included)
    pub fn encode_to_string(&self, store: &MergeStore) -> Result<String> {
        let mut bytes = Vec::new();
        self.encode(store, &mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    /// Encode into a file, replacing it
    pub fn write_file<P: AsRef<Path>>(&self, store: &MergeStore, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        self.encode(store, &mut out)?;
        out.flush()?;
        tracing::info!("wrote {} entr(ies) to {}", store.entry_count(), path.display());
        Ok(())
    }
}

/// Text field for an attribute; empty when the attribute is not set
fn render_field(spec: &AttrSpec, value: Option<&Value>, key: &FormKey) -> Result<String> {
    match value {
        Some(value) => spec.render(value).ok_or_else(|| Error::Encode {
            attribute: spec.name.clone(),
            key: key.clone(),
        }),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .register(GroupSchema::links(
                "NPC_",
                AttrSpec::new("factions", "Rank", AttrKind::Links),
                "Actor",
                "Faction",
            ))
            .unwrap();
        schema
            .register(
                GroupSchema::columns("WEAP")
                    .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String).optional())
                    .attr(AttrSpec::new("value", "Value", AttrKind::Int))
                    .attr(AttrSpec::new("weight", "Weight", AttrKind::Float).optional())
                    .with_label("eid"),
            )
            .unwrap();
        schema
            .register(
                GroupSchema::columns("LIGH")
                    .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String))
                    .with_label("eid")
                    .with_strict_labels()
                    .with_rename_column("Old Editor Id"),
            )
            .unwrap();
        schema
    }

    const FACTION_ROW: &str = "\"NPC_\",\"Guard01\",\"Oblivion.esm\",\"0x00123A\",\
                               \"ImperialLegion\",\"Oblivion.esm\",\"0x00001F\",\"2\"";

    #[test]
    fn test_decode_faction_row() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let text = format!("\u{FEFF}{}\n", FACTION_ROW);
        let report = codec.decode_str(&text, &mut store);

        assert_eq!(report.accepted, 1);
        let actor = FormKey::new("Oblivion.esm", 0x123A);
        let faction = FormKey::new("Oblivion.esm", 0x1F);
        let links = store.get("NPC_", &actor).unwrap().get("factions").unwrap().as_links().unwrap();
        assert_eq!(links[&faction], 2);
        assert_eq!(store.label(&actor), Some("Guard01"));
        assert_eq!(store.label(&faction), Some("ImperialLegion"));
    }

    #[test]
    fn test_encode_faction_row() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        codec.decode_str(FACTION_ROW, &mut store);

        let text = codec.encode_to_string(&store).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some(
                "\u{FEFF}\"Type\",\"Actor Eid\",\"Actor Mod\",\"Actor Object\",\
                 \"Faction Eid\",\"Faction Mod\",\"Faction Object\",\"Rank\""
            )
        );
        assert_eq!(lines.next(), Some(FACTION_ROW));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_skips_rows_without_hex_prefix() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let text = "\"Type\",\"Mod Name\",\"ObjectIndex\",\"Editor Id\",\"Value\",\"Weight\"\n\
                    \"WEAP\",\"A.esm\",\"00123A\",\"Sword\",\"10\",\"1.5\"\n\
                    \"WEAP\",\"A.esm\",\"0x00123B\",\"Axe\",\"12\",\"2.5\"\n\
                    \"XXXX\",\"A.esm\",\"0x00123C\"\n";
        let report = codec.decode_str(text, &mut store);
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.skipped_malformed, 2);
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_required_coercion_skips_row_optional_becomes_none() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let text = "\"WEAP\",\"A.esm\",\"0x000001\",\"Sword\",\"ten\",\"1.5\"\n\
                    \"WEAP\",\"A.esm\",\"0x000002\",\"Axe\",\"12\",\"heavy\"\n";
        let report = codec.decode_str(text, &mut store);
        assert_eq!(report.skipped_coercion, 1);
        let axe = store.get("WEAP", &FormKey::new("A.esm", 2)).unwrap();
        assert_eq!(axe.get("weight"), Some(&Value::None));
        assert!(store.get("WEAP", &FormKey::new("A.esm", 1)).is_none());
    }

    #[test]
    fn test_missing_trailing_column_stays_absent() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        codec.decode_str("\"WEAP\",\"A.esm\",\"0x000002\",\"Axe\",\"12\"\n", &mut store);
        let axe = store.get("WEAP", &FormKey::new("A.esm", 2)).unwrap();
        assert!(!axe.contains("weight"));
    }

    #[test]
    fn test_missing_required_column_rejects_row() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let report = codec.decode_str("\"WEAP\",\"A.esm\",\"0x000002\",\"Axe\"\n", &mut store);
        assert_eq!(report.skipped_malformed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unset_attributes_survive_export_and_import() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        // no value (required) and no weight; eid explicitly empty
        store.put(
            "WEAP",
            &FormKey::new("A.esm", 1),
            vec![("eid".to_string(), Value::from(""))],
            "A.esm",
            Policy::LastWins,
        );
        store.put(
            "WEAP",
            &FormKey::new("A.esm", 2),
            vec![
                ("eid".to_string(), Value::None),
                ("value".to_string(), Value::Int(4)),
                ("weight".to_string(), Value::None),
            ],
            "A.esm",
            Policy::LastWins,
        );
        let text = codec.encode_to_string(&store).unwrap();
        assert!(text.contains("\"WEAP\",\"A.esm\",\"0x000001\",\"\\\",\"\",\"\""));
        assert!(text.contains("\"WEAP\",\"A.esm\",\"0x000002\",\"\\N\",\"4\",\"\\N\""));

        let mut back = MergeStore::new();
        let report = codec.decode_str(&text, &mut back);
        assert_eq!(report.accepted, 2);
        for object in [1, 2] {
            let key = FormKey::new("A.esm", object);
            let theirs: Vec<_> = store.get("WEAP", &key).unwrap().attributes().collect();
            let ours: Vec<_> = back.get("WEAP", &key).unwrap().attributes().collect();
            assert_eq!(ours, theirs);
        }
    }

    #[test]
    fn test_comparison_columns_come_from_baseline() {
        let mut schema = Schema::new();
        schema
            .register(
                GroupSchema::columns("NPC_")
                    .attr(AttrSpec::new("eid", "Actor Eid", AttrKind::String).optional())
                    .attr(AttrSpec::new("level", "Offset", AttrKind::Int))
                    .with_label("eid")
                    .with_comparison("Old"),
            )
            .unwrap();
        let aliases = AliasTable::new();
        let guard = FormKey::new("A.esm", 1);
        let added = FormKey::new("B.esp", 2);
        let mut store = MergeStore::new();
        let mut baseline = MergeStore::new();
        let level = |n: i64| vec![("level".to_string(), Value::Int(n))];
        store.put("NPC_", &guard, level(3), "B.esp", Policy::LastWins);
        store.put("NPC_", &added, level(5), "B.esp", Policy::LastWins);
        baseline.put("NPC_", &guard, level(1), "A.esm", Policy::LastWins);

        let codec = TextCodec::new(&schema, &aliases).with_baseline(&baseline);
        let text = codec.encode_to_string(&store).unwrap();
        assert!(text.contains("\"NPC_\",\"A.esm\",\"0x000001\",\"\",\"3\",\"1\""));
        assert!(text.contains("\"NPC_\",\"B.esp\",\"0x000002\",\"\",\"5\",\"\""));

        // comparison columns never flow back in
        let mut back = MergeStore::new();
        codec.decode_str(&text, &mut back);
        assert_eq!(back.get("NPC_", &guard).unwrap().get("level"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_aliases_applied_on_decode() {
        let schema = schema();
        let mut aliases = AliasTable::new();
        aliases.insert("Old.esp", "New.esp");
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        codec.decode_str("\"WEAP\",\"Old.esp\",\"0x000002\",\"Axe\",\"12\"\n", &mut store);
        assert!(store.get("WEAP", &FormKey::new("New.esp", 2)).is_some());
    }

    #[test]
    fn test_strict_labels_and_renames() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let text = "\"LIGH\",\"A.esm\",\"0x000001\",\"Torch Light\"\n\
                    \"LIGH\",\"A.esm\",\"0x000002\",\"1stLight\"\n\
                    \"LIGH\",\"A.esm\",\"0x000003\",\"Lantern\",\"OldLantern\"\n";
        let report = codec.decode_str(text, &mut store);
        assert_eq!(report.bad_labels, vec!["Torch Light".to_string()]);
        assert_eq!(report.questionable_labels, vec!["1stLight".to_string()]);
        assert_eq!(report.renames.get("oldlantern"), Some("Lantern"));
        assert_eq!(report.accepted, 2);
    }

    #[test]
    fn test_encode_quotes_and_floats() {
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        let key = FormKey::new("A.esm", 1);
        store.put(
            "WEAP",
            &key,
            vec![
                ("eid".to_string(), Value::from("Say \"Hi\"")),
                ("value".to_string(), Value::Int(10)),
                ("weight".to_string(), Value::Float(2.0)),
            ],
            "A.esm",
            Policy::LastWins,
        );
        let text = codec.encode_to_string(&store).unwrap();
        assert!(text.contains("\"WEAP\",\"A.esm\",\"0x000001\",\"Say \"\"Hi\"\"\",\"10\",\"2.0\""));
    }

    #[test]
    fn test_encode_rejects_texts() {
        let mut schema = Schema::new();
        schema
            .register(
                GroupSchema::columns("QUST")
                    .attr(AttrSpec::new("stage_scripts", "Stages", AttrKind::Texts)),
            )
            .unwrap();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        store.put(
            "QUST",
            &FormKey::new("A.esm", 1),
            vec![("stage_scripts".to_string(), Value::Texts(vec!["x".into()]))],
            "A.esm",
            Policy::LastWins,
        );
        assert!(matches!(codec.encode_to_string(&store), Err(Error::Encode { .. })));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factions.csv");
        let schema = schema();
        let aliases = AliasTable::new();
        let codec = TextCodec::new(&schema, &aliases);
        let mut store = MergeStore::new();
        codec.decode_str(FACTION_ROW, &mut store);
        codec.write_file(&store, &path).unwrap();

        let mut back = MergeStore::new();
        let report = codec.read_file(&path, &mut back).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(
            back.get("NPC_", &FormKey::new("Oblivion.esm", 0x123A)),
            store.get("NPC_", &FormKey::new("Oblivion.esm", 0x123A))
        );
    }
}
