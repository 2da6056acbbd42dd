//! fidmerge CLI
//!
//! Command-line tool for exporting merged plugin records to CSV, importing
//! edited CSV back into a target plugin, and explaining where merged values
//! came from.

use clap::{Parser, Subcommand};
use fidmerge_core::backend::BackendKind;
use fidmerge_core::{
    journal, Backend, CollectReport, CollectSession, CollectionBackend, DiffWriter, Error, FormKey,
    IdReplacements, IdReplacer, LocalBackend, MasterPolicy, MergeStore, Patcher, RenameMap,
    RunConfig, Schema, SourceCollector, TextCodec, WriteState,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fidmerge")]
#[command(about = "Load-order-aware plugin record merger", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the load order and export one patcher's records to CSV
    Export {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Patcher preset (see `fidmerge patchers`)
        #[arg(short, long)]
        patcher: String,

        /// Output CSV path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Apply edited CSV files to a target plugin
    Import {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Patcher preset
        #[arg(short, long)]
        patcher: String,

        /// CSV files to read, later files win
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Plugin to write into
        #[arg(short, long)]
        target: String,

        /// Merge the load order up to the target before applying the text
        #[arg(long)]
        merge_sources: bool,
    },

    /// Show the merged value of a record and which source supplied it
    Explain {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Patcher preset
        #[arg(short, long)]
        patcher: String,

        /// Record key, e.g. Oblivion.esm:0x00123A
        #[arg(short, long)]
        key: String,

        /// Only show this attribute
        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// Swap references to old records for new ones in a target plugin
    ReplaceIds {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// CSV list of old and new records
        #[arg(short, long)]
        input: PathBuf,

        /// Plugin to rewrite
        #[arg(short, long)]
        target: String,

        /// Record groups to scan (all when omitted)
        #[arg(short, long)]
        group: Vec<String>,
    },

    /// List the available patcher presets
    Patchers,

    /// Create a run configuration template
    CreateConfig {
        /// Output path for the configuration
        #[arg(short, long)]
        output: PathBuf,

        /// Directory holding the plugins
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Plugins in load order
        #[arg(short, long)]
        load_order: Vec<String>,

        /// Use the collection engine instead of reading files directly
        #[arg(long)]
        collection: bool,

        /// Let writes add missing masters to the target
        #[arg(long)]
        extend_masters: bool,
    },
}

fn main() {
    init_tracing();
    if let Err(e) = run() {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// FIDMERGE_LOG sets the filter, FIDMERGE_LOG_FORMAT=json switches to JSON lines.
fn init_tracing() {
    let log_format = std::env::var("FIDMERGE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_env("FIDMERGE_LOG")
        .unwrap_or_else(|_| "fidmerge=info,fidmerge_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run() -> fidmerge_core::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Export { config, patcher, output } => {
            let config = RunConfig::load(&config)?;
            let patcher = Patcher::require(&patcher)?;
            match config.backend {
                BackendKind::Local => {
                    let mut backend = LocalBackend::new(&config.data_dir);
                    cmd_export(&mut backend, &config, &patcher, &output)
                }
                BackendKind::Collection => {
                    let mut backend = CollectionBackend::new(&config.data_dir);
                    cmd_export(&mut backend, &config, &patcher, &output)
                }
            }
        }
        Commands::Import {
            config,
            patcher,
            input,
            target,
            merge_sources,
        } => {
            let config = RunConfig::load(&config)?;
            let patcher = Patcher::require(&patcher)?;
            let job = ImportJob {
                config: &config,
                patcher: &patcher,
                inputs: &input,
                target: &target,
                merge_sources,
            };
            match config.backend {
                BackendKind::Local => job.run(&mut LocalBackend::new(&config.data_dir)),
                BackendKind::Collection => job.run(&mut CollectionBackend::new(&config.data_dir)),
            }
        }
        Commands::Explain {
            config,
            patcher,
            key,
            attribute,
        } => {
            let config = RunConfig::load(&config)?;
            let patcher = Patcher::require(&patcher)?;
            let key = FormKey::parse(&key).ok_or(Error::Coercion {
                raw: key,
                expected: "a key like Oblivion.esm:0x00123A",
            })?;
            match config.backend {
                BackendKind::Local => cmd_explain(
                    &mut LocalBackend::new(&config.data_dir),
                    &config,
                    &patcher,
                    &key,
                    attribute.as_deref(),
                ),
                BackendKind::Collection => cmd_explain(
                    &mut CollectionBackend::new(&config.data_dir),
                    &config,
                    &patcher,
                    &key,
                    attribute.as_deref(),
                ),
            }
        }
        Commands::ReplaceIds {
            config,
            input,
            target,
            group,
        } => {
            let config = RunConfig::load(&config)?;
            let replacements = IdReplacements::read_file(&input, &config.aliases)?;
            match config.backend {
                BackendKind::Local => cmd_replace_ids(
                    &mut LocalBackend::new(&config.data_dir),
                    &config,
                    &replacements,
                    &target,
                    &group,
                ),
                BackendKind::Collection => cmd_replace_ids(
                    &mut CollectionBackend::new(&config.data_dir),
                    &config,
                    &replacements,
                    &target,
                    &group,
                ),
            }
        }
        Commands::Patchers => {
            for patcher in Patcher::all() {
                println!("{:<12} {}", patcher.name, patcher.description);
            }
            Ok(())
        }
        Commands::CreateConfig {
            output,
            data_dir,
            load_order,
            collection,
            extend_masters,
        } => cmd_create_config(&output, data_dir, load_order, collection, extend_masters),
    }
}

/// Collect the patcher's groups from `sources` into `store`
fn collect<B: Backend>(
    backend: &mut B,
    config: &RunConfig,
    patcher: &Patcher,
    schema: &Schema,
    sources: &[String],
    store: &mut MergeStore,
) -> fidmerge_core::Result<CollectReport> {
    let policy = config.policy.unwrap_or(patcher.policy);
    let collector = SourceCollector::new(schema, &config.aliases, policy)
        .with_label_groups(patcher.label_groups.iter().cloned());
    let report = collector.collect(
        backend,
        sources,
        &patcher.group_tags(),
        &mut CollectSession::new(),
        store,
    )?;
    if !report.failures.is_empty() {
        println!("Skipped {} source(s) that failed to load:", report.failures.len());
        for (name, why) in &report.failures {
            println!("  {}: {}", name, why);
        }
    }
    Ok(report)
}

fn cmd_export<B: Backend>(
    backend: &mut B,
    config: &RunConfig,
    patcher: &Patcher,
    output: &Path,
) -> fidmerge_core::Result<()> {
    let schema = patcher.schema()?;
    let mut store = MergeStore::new();
    let report = collect(backend, config, patcher, &schema, &config.load_order, &mut store)?;

    let mut baseline = MergeStore::new();
    if patcher.has_comparison() {
        // comparison columns show the first plugin in the load order
        let base = &config.load_order[..config.load_order.len().min(1)];
        collect(backend, config, patcher, &schema, base, &mut baseline)?;
    }
    TextCodec::new(&schema, &config.aliases)
        .with_baseline(&baseline)
        .write_file(&store, output)?;
    println!(
        "Exported {} {} entr(ies) from {} source(s) to {}",
        store.entry_count(),
        patcher.name,
        report.sources.len(),
        output.display()
    );
    Ok(())
}

struct ImportJob<'a> {
    config: &'a RunConfig,
    patcher: &'a Patcher,
    inputs: &'a [PathBuf],
    target: &'a str,
    merge_sources: bool,
}

impl ImportJob<'_> {
    fn run<B: Backend>(&self, backend: &mut B) -> fidmerge_core::Result<()> {
        let schema = self.patcher.schema()?;
        let mut store = MergeStore::new();
        if self.merge_sources {
            let sources = self.config.sources_for(self.target);
            let report = collect(backend, self.config, self.patcher, &schema, sources, &mut store)?;
            report.ensure_loaded(self.target)?;
        }

        let codec = TextCodec::new(&schema, &self.config.aliases);
        let mut renames = RenameMap::new();
        for input in self.inputs {
            let report = codec.read_file(input, &mut store)?;
            println!(
                "{}: {} row(s) accepted, {} skipped",
                input.display(),
                report.accepted,
                report.skipped()
            );
            for label in &report.bad_labels {
                println!("  invalid editor id: {}", label);
            }
            for label in &report.questionable_labels {
                println!("  questionable editor id: {}", label);
            }
            renames.extend(&report.renames);
        }

        let mut writer = DiffWriter::new(&schema, &self.config.aliases)
            .with_master_policy(self.config.master_policy);
        if self.patcher.renames_scripts && self.config.propagate_renames {
            writer = writer.with_rename_propagation(renames);
        }
        let outcome = writer.write(backend, self.target, &store, &self.patcher.group_tags())?;

        match outcome.state {
            WriteState::Unchanged => println!("{}: nothing to change", self.target),
            WriteState::Saved => {
                println!("{}: {} change(s)", self.target, outcome.changes.len());
                for (group, count) in &outcome.counts {
                    println!("  {:<4} {} record(s)", group, count);
                }
                for master in &outcome.added_masters {
                    println!("  added master {}", master);
                }
                if let Some(path) = &self.config.journal {
                    journal::record(path, self.patcher.name, &outcome)?;
                }
            }
        }
        Ok(())
    }
}

fn cmd_explain<B: Backend>(
    backend: &mut B,
    config: &RunConfig,
    patcher: &Patcher,
    key: &FormKey,
    attribute: Option<&str>,
) -> fidmerge_core::Result<()> {
    let schema = patcher.schema()?;
    let mut store = MergeStore::new();
    collect(backend, config, patcher, &schema, &config.load_order, &mut store)?;

    println!("Key: {}", key);
    println!("Label: {}", store.display_label(key));
    let mut found = false;
    for group in patcher.group_tags() {
        let Some(entry) = store.get(&group, key) else {
            continue;
        };
        found = true;
        println!();
        println!("Group: {}", group);
        for (name, value) in entry.attributes() {
            if attribute.is_some_and(|a| a != name) {
                continue;
            }
            println!("  {} = {}", name, value);
            println!("    from {}", entry.origin(name).unwrap_or("?"));
        }
    }
    if !found {
        println!("No {} data for this key in the load order", patcher.name);
    }
    Ok(())
}

fn cmd_replace_ids<B: Backend>(
    backend: &mut B,
    config: &RunConfig,
    replacements: &IdReplacements,
    target: &str,
    groups: &[String],
) -> fidmerge_core::Result<()> {
    let outcome = IdReplacer::new(&config.aliases).replace(backend, target, replacements, groups)?;
    match outcome.state {
        WriteState::Unchanged => println!("{}: no references to replace", target),
        WriteState::Saved => {
            println!("{}: {} reference(s) replaced", target, outcome.total());
            for line in outcome.report_lines(replacements) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn cmd_create_config(
    output: &Path,
    data_dir: PathBuf,
    load_order: Vec<String>,
    collection: bool,
    extend_masters: bool,
) -> fidmerge_core::Result<()> {
    let mut config = RunConfig::new(data_dir, load_order);
    if collection {
        config.backend = BackendKind::Collection;
    }
    if extend_masters {
        config.master_policy = MasterPolicy::Extend;
    }
    config.save(output)?;
    println!("Created run configuration: {}", output.display());
    println!("  {} plugin(s) in load order", config.load_order.len());
    Ok(())
}
