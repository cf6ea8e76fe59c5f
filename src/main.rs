use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::EngineConfig;
use waypoint_core::types::SpeechStage;
use waypoint_engine::{PathwayGraph, TransitionResolver};
use waypoint_voice::VoiceAdaptationEngine;

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Pathway execution engine for voice calls")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pathway file and print lint warnings
    Validate {
        /// Pathway JSON file
        pathway: PathBuf,
    },
    /// Resolve a transition target name against a pathway
    Resolve {
        /// Pathway JSON file
        pathway: PathBuf,
        /// Node the request comes from (default: entry node)
        #[arg(long)]
        from: Option<String>,
        /// Target name as the intelligence would say it
        #[arg(trailing_var_arg = true, required = true)]
        target: Vec<String>,
    },
    /// Show the voice adaptation for a sample utterance
    Analyze {
        /// Speech stage (greeting, conversation, apology, goodbye, ...)
        #[arg(long, default_value = "conversation")]
        stage: String,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { pathway } => {
            let graph = load_pathway(&pathway)?;
            println!(
                "{}: {} nodes, {} edges, entry '{}'",
                pathway.display(),
                graph.nodes().len(),
                graph.edges().len(),
                graph.entry_node()
            );
            let warnings = graph.lint();
            for warning in &warnings {
                println!("  warning: {}", warning);
            }
            if warnings.is_empty() {
                println!("  no warnings");
            }
        }
        Commands::Resolve {
            pathway,
            from,
            target,
        } => {
            let graph = load_pathway(&pathway)?;
            let from = from.unwrap_or_else(|| graph.entry_node().to_string());
            if graph.node(&from).is_none() {
                anyhow::bail!("node '{}' is not in {}", from, pathway.display());
            }
            let resolver = TransitionResolver::new(&config.resolver);
            let resolution = resolver.resolve(&graph, &target.join(" "), &from)?;
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Commands::Analyze { stage, text } => {
            let stage: SpeechStage = serde_json::from_value(serde_json::Value::String(stage.clone()))
                .with_context(|| format!("unknown speech stage '{}'", stage))?;
            let mut engine = VoiceAdaptationEngine::new(config.voice.clone());
            let decision = engine.adapt(&text.join(" "), stage);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        let config = EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(EngineConfig::default())
    }
}

fn load_pathway(path: &Path) -> anyhow::Result<PathwayGraph> {
    PathwayGraph::load(path).with_context(|| format!("loading pathway from {}", path.display()))
}
