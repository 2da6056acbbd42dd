//! Collect records from ordered sources into a [`MergeStore`]
//!
//! Sources are visited masters-first, so a plugin's values always land after
//! the values of everything it depends on. A [`CollectSession`] remembers which
//! `(source, group)` pairs were already read; it is owned by the run and can be
//! shared across several `collect` calls.

use crate::alias::AliasTable;
use crate::backend::{Backend, RecordView, SourceHandle};
use crate::error::{Error, Result};
use crate::formid::{AddressResolver, FormKey, MasterList};
use crate::schema::{GroupSchema, Schema};
use crate::store::{MergeStore, Policy};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Per-run memo of what has been collected
#[derive(Debug, Clone, Default)]
pub struct CollectSession {
    visited: BTreeSet<(String, String)>,
    labelled: BTreeSet<(String, String)>,
    failed: BTreeMap<String, String>,
}

impl CollectSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `group` of `source` has been read into the store
    pub fn is_collected(&self, source: &str, group: &str) -> bool {
        self.visited.contains(&(source.to_string(), group.to_string()))
    }

    /// Sources that could not be opened, with the reason
    pub fn failed(&self) -> &BTreeMap<String, String> {
        &self.failed
    }
}

/// Outcome of one `collect` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Sources read during this call, in visiting order
    pub sources: Vec<String>,
    /// Sources skipped because they failed to load
    pub failures: BTreeMap<String, String>,
    /// Records merged into the store
    pub records: usize,
    /// Records dropped because their address did not resolve
    pub unresolved: usize,
}

impl CollectReport {
    /// Fail if `target` is among the sources that could not be loaded
    pub fn ensure_loaded(&self, target: &str) -> Result<()> {
        match self.failures.get(target) {
            Some(message) => Err(Error::SourceLoad {
                name: target.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Reads the schema's attributes out of sources into a store
#[derive(Debug, Clone)]
pub struct SourceCollector<'a> {
    schema: &'a Schema,
    resolver: AddressResolver<'a>,
    policy: Policy,
    label_groups: Vec<String>,
}

impl<'a> SourceCollector<'a> {
    pub fn new(schema: &'a Schema, aliases: &'a AliasTable, policy: Policy) -> Self {
        Self {
            schema,
            resolver: AddressResolver::new(aliases),
            policy,
            label_groups: Vec::new(),
        }
    }

    /// Also read editor ids from `groups`, without collecting attributes.
    /// Link targets (factions, for instance) get their labels this way.
    pub fn with_label_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Collect `groups` from every source in `sources` (load order) and
    /// their masters
    pub fn collect<B: Backend>(
        &self,
        backend: &mut B,
        sources: &[String],
        groups: &[String],
        session: &mut CollectSession,
        store: &mut MergeStore,
    ) -> Result<CollectReport> {
        let schemas = groups
            .iter()
            .map(|g| self.schema.require(g))
            .collect::<Result<Vec<_>>>()?;
        let mut report = CollectReport::default();
        let mut pass = Pass {
            schemas: &schemas,
            session,
            store,
            report: &mut report,
            stack: Vec::new(),
        };
        for source in sources {
            self.visit(backend, source, &mut pass);
        }
        tracing::debug!(
            "{} collected {} record(s) from {} source(s) ({} failed)",
            backend.name(),
            report.records,
            report.sources.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn visit<B: Backend>(&self, backend: &mut B, name: &str, pass: &mut Pass<'_, '_>) {
        if let Some(message) = pass.session.failed.get(name) {
            pass.report.failures.insert(name.to_string(), message.clone());
            return;
        }
        if pass.stack.iter().any(|s| s == name) {
            // The source on top of the stack lists `name` as a master, closing the loop.
            let closing = pass.stack.last().cloned().unwrap_or_default();
            self.fail(pass, &closing, format!("master cycle through '{}'", name));
            return;
        }
        let data: Vec<&GroupSchema> = pass
            .schemas
            .iter()
            .copied()
            .filter(|g| !pass.session.visited.contains(&(name.to_string(), g.tag.clone())))
            .collect();
        let labels: Vec<&str> = self
            .label_groups
            .iter()
            .map(String::as_str)
            .filter(|g| !pass.session.labelled.contains(&(name.to_string(), g.to_string())))
            .collect();
        if data.is_empty() && labels.is_empty() {
            return;
        }

        let masters = match backend.open_source(name, false, false) {
            Ok(handle) => handle.masters().to_vec(),
            Err(e) => {
                self.fail(pass, name, e.to_string());
                return;
            }
        };
        pass.stack.push(name.to_string());
        for master in &masters {
            self.visit(backend, master, pass);
        }
        pass.stack.pop();
        if pass.session.failed.contains_key(name) {
            return;
        }

        let handle = match backend.open_source(name, false, false) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(pass, name, e.to_string());
                return;
            }
        };
        let origin = self.resolver.aliases().resolve(name).to_string();
        let mut merged = 0;
        for group in data {
            pass.session.visited.insert((name.to_string(), group.tag.clone()));
            for record in handle.records(&group.tag).iter().filter(|r| r.is_active()) {
                match self.read_record(&handle, group, record) {
                    Ok((key, attributes)) => {
                        if let Some(label) = record.eid() {
                            pass.store.set_label(&key, label, self.policy);
                        }
                        if !attributes.is_empty() {
                            pass.store.put(&group.tag, &key, attributes, &origin, self.policy);
                            merged += 1;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("skipping {} record in '{}': {}", group.tag, name, e);
                        pass.report.unresolved += 1;
                    }
                }
            }
        }
        for group in labels {
            pass.session.labelled.insert((name.to_string(), group.to_string()));
            for record in handle.records(group).iter().filter(|r| r.is_active()) {
                let Some(label) = record.eid() else {
                    continue;
                };
                match self.resolver.to_global(&handle, record.id) {
                    Ok(key) => pass.store.set_label(&key, label, self.policy),
                    Err(e) => tracing::debug!("skipping {} label in '{}': {}", group, name, e),
                }
            }
        }
        drop(handle);

        tracing::info!("collected {} record(s) from '{}'", merged, name);
        pass.report.records += merged;
        pass.report.sources.push(name.to_string());
    }

    /// Resolve a record and convert its schema attributes to global form
    fn read_record<H: SourceHandle>(
        &self,
        handle: &H,
        group: &GroupSchema,
        record: &RecordView,
    ) -> Result<(FormKey, Vec<(String, Value)>)> {
        let key = self.resolver.to_global(handle, record.id)?;
        let mut attributes = Vec::new();
        for spec in &group.attributes {
            let Some(local) = record.get(&spec.name) else {
                continue;
            };
            let value = local.map_refs(|id| self.resolver.to_global(handle, *id))?;
            if matches!(&value, Value::Links(links) if links.is_empty()) {
                continue;
            }
            attributes.push((spec.name.clone(), spec.conform(value)));
        }
        Ok((key, attributes))
    }

    fn fail(&self, pass: &mut Pass<'_, '_>, name: &str, message: String) {
        tracing::warn!("skipping source '{}': {}", name, message);
        pass.session.failed.insert(name.to_string(), message.clone());
        pass.report.failures.insert(name.to_string(), message);
    }
}

/// Mutable state threaded through one `collect` call
struct Pass<'s, 'g> {
    schemas: &'s [&'g GroupSchema],
    session: &'s mut CollectSession,
    store: &'s mut MergeStore,
    report: &'s mut CollectReport,
    stack: Vec<String>,
}
