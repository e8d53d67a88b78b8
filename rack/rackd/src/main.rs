//! `rackd` CLI for assembling server configurations from a component catalog.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rack_core::{
    AddRequest, Assembler, AssemblyError, Catalog, CatalogOracle, EngineConfig, JsonFileStore,
};
use rack_spec::{ComponentKey, ComponentType, ConfigId, ConfigMode, Privilege, SlotId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit status for refused operations; usage and I/O failures exit 1.
const REFUSED: u8 = 2;

/// Rackd command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Component catalog.
    #[arg(
        long,
        env = "RACK_CATALOG",
        value_name = "FILE",
        help = "Path to a JSON component catalog"
    )]
    catalog: Option<PathBuf>,
    /// Persisted state.
    #[arg(
        long,
        env = "RACK_STATE",
        value_name = "FILE",
        default_value = "rack-state.json",
        help = "Path to the JSON state file"
    )]
    state: PathBuf,
    /// Engine policy.
    #[arg(
        long,
        env = "RACK_CONFIG",
        value_name = "FILE",
        help = "Path to a JSON engine configuration"
    )]
    config: Option<PathBuf>,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

/// Commands for rackd.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty draft configuration.
    Create {
        /// Configuration id.
        id: String,
        /// Display name.
        #[arg(long)]
        name: Option<String>,
        /// `real` or `test`.
        #[arg(long, default_value = "real")]
        mode: ConfigMode,
    },
    /// Add a component to a configuration.
    Add {
        #[command(flatten)]
        target: Target,
        /// Units to add.
        #[arg(short, long, default_value = "1")]
        quantity: u32,
        /// Preferred slot.
        #[arg(long)]
        slot: Option<String>,
        /// Take the component from another configuration.
        #[arg(long = "override")]
        allow_override: bool,
        /// Act with elevated privilege.
        #[arg(long)]
        elevated: bool,
    },
    /// Remove a component from a configuration.
    Remove {
        #[command(flatten)]
        target: Target,
        /// Act with elevated privilege.
        #[arg(long)]
        elevated: bool,
    },
    /// Check a configuration; a clean draft becomes validated.
    Validate {
        /// Configuration id.
        config: String,
    },
    /// Mark a validated configuration as built.
    Build {
        /// Configuration id.
        config: String,
    },
    /// Finalize a configuration.
    Finalize {
        /// Configuration id.
        config: String,
    },
    /// Reopen a finalized configuration.
    Reopen {
        /// Configuration id.
        config: String,
        /// Act with elevated privilege.
        #[arg(long)]
        elevated: bool,
    },
    /// Delete a configuration and release its components.
    Delete {
        /// Configuration id.
        config: String,
        /// Act with elevated privilege.
        #[arg(long)]
        elevated: bool,
    },
    /// Show one configuration, or list all of them.
    Show {
        /// Configuration id.
        config: Option<String>,
    },
    /// Show slot usage of a configuration.
    Pool {
        /// Configuration id.
        config: String,
    },
    /// List available components of a type that fit a configuration.
    Candidates {
        /// Configuration id.
        config: String,
        /// Component type.
        kind: ComponentType,
    },
    /// Take a component out of service.
    Fail {
        /// Component type.
        kind: ComponentType,
        /// Component id.
        id: String,
    },
    /// Return a failed component to service.
    Repair {
        /// Component type.
        kind: ComponentType,
        /// Component id.
        id: String,
    },
    /// Read the claim journal.
    Journal {
        /// Start offset.
        #[arg(short, long, default_value = "0")]
        offset: usize,
        /// Number of entries.
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only entries for this component, as `type:id`.
        #[arg(long)]
        component: Option<String>,
    },
    /// List component rows.
    Components,
}

/// A component within a configuration.
#[derive(Args, Debug, Clone)]
struct Target {
    /// Configuration id.
    config: String,
    /// Component type.
    kind: ComponentType,
    /// Component id.
    id: String,
}

impl Target {
    fn key(&self) -> ComponentKey {
        ComponentKey::new(self.kind, self.id.as_str())
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = load_engine_config(cli.config.as_deref())?;
    let assembler = open_assembler(cli.catalog.as_deref(), &cli.state, engine)?;

    match run(&assembler, cli.command) {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            warn!("operation refused: {err}");
            println!("{}", serde_json::to_string_pretty(&err.report())?);
            Ok(ExitCode::from(REFUSED))
        }
    }
}

fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading engine config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn open_assembler(
    catalog: Option<&Path>,
    state: &Path,
    engine: EngineConfig,
) -> anyhow::Result<Assembler> {
    let catalog = match catalog {
        Some(path) => Catalog::from_json_file(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => {
            debug!("no catalog given; structured lookups will find nothing");
            Catalog::default()
        }
    };
    let oracle: CatalogOracle = catalog.oracle();
    let store = JsonFileStore::open(state)
        .with_context(|| format!("opening state {}", state.display()))?;
    let assembler = Assembler::restore(Arc::new(oracle), Arc::new(store), engine)?;
    let added = assembler.provision(catalog.rows())?;
    if added > 0 {
        info!("onboarded {added} catalog component(s)");
    }
    Ok(assembler)
}

fn privilege(elevated: bool) -> Privilege {
    if elevated {
        Privilege::Elevated
    } else {
        Privilege::Standard
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, AssemblyError> {
    serde_json::to_value(value).map_err(|e| {
        AssemblyError::Storage(rack_core::StoreError::Encoding(format!("encode output: {e}")))
    })
}

fn run(assembler: &Assembler, command: Commands) -> Result<Value, AssemblyError> {
    match command {
        Commands::Create { id, name, mode } => {
            let name = name.unwrap_or_else(|| id.clone());
            to_value(&assembler.create_configuration(id.as_str(), name, mode)?)
        }
        Commands::Add {
            target,
            quantity,
            slot,
            allow_override,
            elevated,
        } => {
            let request = AddRequest {
                config: ConfigId::new(target.config.as_str()),
                component: target.key(),
                quantity,
                slot_hint: slot.map(SlotId::new),
                allow_override,
                privilege: privilege(elevated),
            };
            to_value(&assembler.add_component(request)?)
        }
        Commands::Remove { target, elevated } => to_value(&assembler.remove_component(
            &ConfigId::new(target.config.as_str()),
            &target.key(),
            privilege(elevated),
        )?),
        Commands::Validate { config } => to_value(&assembler.validate(&config.into())?),
        Commands::Build { config } => to_value(&assembler.mark_built(&config.into())?),
        Commands::Finalize { config } => to_value(&assembler.finalize(&config.into())?),
        Commands::Reopen { config, elevated } => {
            to_value(&assembler.reopen(&config.into(), privilege(elevated))?)
        }
        Commands::Delete { config, elevated } => {
            to_value(&assembler.delete_configuration(&config.into(), privilege(elevated))?)
        }
        Commands::Show { config: Some(config) } => {
            to_value(&assembler.configuration(&config.into())?)
        }
        Commands::Show { config: None } => to_value(&assembler.list()),
        Commands::Pool { config } => to_value(&assembler.pool_state(&config.into())?),
        Commands::Candidates { config, kind } => {
            to_value(&assembler.compatible_candidates(&config.into(), kind)?)
        }
        Commands::Fail { kind, id } => {
            to_value(&assembler.mark_failed(&ComponentKey::new(kind, id))?)
        }
        Commands::Repair { kind, id } => {
            to_value(&assembler.restore_component(&ComponentKey::new(kind, id))?)
        }
        Commands::Journal {
            offset,
            limit,
            component,
        } => {
            let journal = assembler.journal();
            match component {
                Some(text) => {
                    let key = parse_key(&text)?;
                    let entries: Vec<_> = journal
                        .entries_for(&key)
                        .into_iter()
                        .skip(offset)
                        .take(limit)
                        .collect();
                    to_value(&entries)
                }
                None => to_value(&journal.read(offset, limit)),
            }
        }
        Commands::Components => to_value(&assembler.ledger().rows()),
    }
}

fn parse_key(text: &str) -> Result<ComponentKey, AssemblyError> {
    let invalid = || AssemblyError::ValidationFailed {
        reason: format!("component must be written as type:id, got {text:?}"),
        findings: Vec::new(),
    };
    let (kind, id) = text.split_once(':').ok_or_else(invalid)?;
    let kind: ComponentType = kind.parse().map_err(|_| invalid())?;
    if id.is_empty() {
        return Err(invalid());
    }
    Ok(ComponentKey::new(kind, id))
}
