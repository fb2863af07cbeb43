use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use regent_kernel::cache::{
    AdmxCache, CacheConfig, CancellationToken, DefinitionLoader, LoadError, SearchFields,
};
use regent_kernel::model::{PolicyCatalog, PolicyDefinition, PolicyScope};
use regent_kernel::save::{build_buffers, PolicyChangeRequest};
use regent_kernel::store::PolFile;

/// Regent policy cache and POL tooling
#[derive(Parser, Debug)]
#[command(name = "regent")]
#[command(about = "Group Policy definition cache and registry.pol tooling", long_about = None)]
struct Cli {
    /// Path to cache config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache database path (overrides config and environment)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index definition bundles (`<root>/<culture>.json`) into the cache
    Scan {
        /// Definition root (overrides config and environment)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Cultures to index
        #[arg(long = "culture", default_value = "en-US")]
        cultures: Vec<String>,
    },

    /// Ranked policy search
    Search {
        query: String,

        #[arg(long, default_value = "en-US")]
        culture: String,

        #[arg(long = "field", value_enum)]
        fields: Vec<Field>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one policy by name, `ns:name` id or registry path
    Show {
        name: String,

        #[arg(long, default_value = "en-US")]
        culture: String,

        /// Treat NAME as a registry path
        #[arg(long)]
        registry: bool,
    },

    /// Compact the search index
    Optimize,

    /// POL file utilities
    Pol {
        #[command(subcommand)]
        command: PolCommand,
    },

    /// Apply change requests to machine and user POL files
    Apply {
        /// Policy definitions JSON (array)
        #[arg(long)]
        definitions: PathBuf,

        /// Change requests JSON (array)
        #[arg(long)]
        changes: PathBuf,

        #[arg(long)]
        machine: PathBuf,

        #[arg(long)]
        user: PathBuf,

        /// Print base64 buffers instead of writing the files
        #[arg(long)]
        base64: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PolCommand {
    /// Print every record of a POL file as JSON
    Dump { path: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Field {
    Name,
    Description,
    Id,
    Registry,
}

impl Field {
    fn flag(self) -> SearchFields {
        match self {
            Field::Name => SearchFields::NAME,
            Field::Description => SearchFields::DESCRIPTION,
            Field::Id => SearchFields::ID,
            Field::Registry => SearchFields::REGISTRY,
        }
    }
}

/// Reads `<root>/<culture>.json` definition bundles.
struct JsonBundleLoader;

impl DefinitionLoader for JsonBundleLoader {
    fn load_definitions(
        &self,
        root: &Path,
        culture: &str,
    ) -> std::result::Result<Vec<PolicyDefinition>, LoadError> {
        let data = fs::read_to_string(root.join(format!("{culture}.json")))?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Serialize)]
struct PolRecord<'a> {
    key: &'a str,
    value: &'a str,
    kind: u32,
    data: String,
}

#[derive(Debug, Serialize)]
struct ApplyOutput {
    outcomes: serde_json::Value,
    failed_scopes: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffers: Option<serde_json::Value>,
}

fn load_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<CacheConfig>(&data)?
        }
        None => CacheConfig::from_env(),
    };
    if let Some(path) = &cli.database {
        config.database_path = path.clone();
    }
    tracing::debug!(database = %config.database_path.display(), "using policy cache");
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Scan { root, cultures } => {
            let mut config = load_config(&cli)?;
            if let Some(root) = root {
                config.source_root = Some(root.clone());
            }
            let cache = AdmxCache::open(config)?;
            let cancel = CancellationToken::new();
            let report = cache.scan_and_update(&JsonBundleLoader, cultures, &cancel);
            print_json(&report)?;
        }
        Command::Search {
            query,
            culture,
            fields,
            limit,
        } => {
            let cache = AdmxCache::open(load_config(&cli)?)?;
            let fields = if fields.is_empty() {
                SearchFields::default()
            } else {
                fields.iter().fold(SearchFields::empty(), |acc, f| acc | f.flag())
            };
            let cancel = CancellationToken::new();
            print_json(&cache.search(query, culture, fields, *limit, &cancel))?;
        }
        Command::Show {
            name,
            culture,
            registry,
        } => {
            let cache = AdmxCache::open(load_config(&cli)?)?;
            let cancel = CancellationToken::new();
            let detail = if *registry {
                cache.get_by_registry_path(name, culture, &cancel)
            } else {
                cache.get_by_policy_name(name, culture, &cancel)
            };
            match detail {
                Some(detail) => print_json(&detail)?,
                None => anyhow::bail!("no policy `{name}` in culture {culture}"),
            }
        }
        Command::Optimize => {
            let cache = AdmxCache::open(load_config(&cli)?)?;
            cache.optimize()?;
        }
        Command::Pol {
            command: PolCommand::Dump { path },
        } => {
            let pol = PolFile::load(path).with_context(|| format!("reading {}", path.display()))?;
            let records: Vec<PolRecord<'_>> = pol
                .entries()
                .map(|(key, value, data)| PolRecord {
                    key,
                    value,
                    kind: data.kind(),
                    data: data
                        .to_display_string()
                        .unwrap_or_else(|| format!("{data:?}")),
                })
                .collect();
            print_json(&records)?;
        }
        Command::Apply {
            definitions,
            changes,
            machine,
            user,
            base64,
        } => {
            let defs: Vec<PolicyDefinition> =
                serde_json::from_str(&fs::read_to_string(definitions)?)?;
            let catalog: PolicyCatalog = defs.into_iter().collect();
            for (policy, control) in catalog.unbound_controls() {
                tracing::warn!(%policy, %control, "presentation control names no element");
            }
            tracing::debug!(policies = catalog.len(), "loaded policy definitions");
            let requests: Vec<PolicyChangeRequest> =
                serde_json::from_str(&fs::read_to_string(changes)?)?;

            let machine_bytes = read_optional(machine)?;
            let user_bytes = read_optional(user)?;
            let report = build_buffers(
                &catalog,
                machine_bytes.as_deref(),
                user_bytes.as_deref(),
                &requests,
            );

            let buffers = if *base64 {
                Some(serde_json::to_value(report.buffers.to_base64())?)
            } else {
                for (scope, path, bytes) in [
                    (PolicyScope::Machine, machine, &report.buffers.machine),
                    (PolicyScope::User, user, &report.buffers.user),
                ] {
                    if report.scope_failed(scope) {
                        tracing::warn!(
                            ?scope,
                            path = %path.display(),
                            "leaving unreadable POL file as is"
                        );
                        continue;
                    }
                    fs::write(path, bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                }
                None
            };
            print_json(&ApplyOutput {
                outcomes: serde_json::to_value(&report.outcomes)?,
                failed_scopes: serde_json::to_value(&report.failed_scopes)?,
                buffers,
            })?;
        }
    }

    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
