//! Unified test harness entry point
//!
//! Runs every JSON test file in the specs directory against the deployment
//! at `--uri`, or against the in-memory deployment with `--memory`.
//! Run with: cargo test --package unified-runner --test unified -- --uri <uri>

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unified_common::{MemoryDeployment, MemoryDeploymentConfig, TopologyType};
use unified_runner::{RunnerConfig, TestFile, TestRunner};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Topology {
    Single,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

impl From<Topology> for TopologyType {
    fn from(topology: Topology) -> Self {
        match topology {
            Topology::Single => TopologyType::Single,
            Topology::ReplicaSet => TopologyType::ReplicaSet,
            Topology::Sharded => TopologyType::Sharded,
            Topology::LoadBalanced => TopologyType::LoadBalanced,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "unified-runner")]
#[command(about = "Unified test format runner")]
struct Args {
    /// Path to test specs directory
    #[arg(short, long, env = "UNIFIED_SPECS_DIR")]
    specs: Option<PathBuf>,

    /// Runner configuration file
    #[arg(short, long, default_value = "tests/runner.toml")]
    config: PathBuf,

    /// Run only this test file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Run only the test with this description
    #[arg(short, long)]
    test: Option<String>,

    /// Connection string of the deployment to test against
    #[arg(long, env = "MONGODB_URI")]
    uri: Option<String>,

    /// Run against the in-memory deployment instead of a server
    #[arg(long)]
    memory: bool,

    /// Topology of the in-memory deployment
    #[arg(long, value_enum)]
    topology: Option<Topology>,

    /// Number of in-memory mongos routers when sharded
    #[arg(long)]
    mongoses: Option<usize>,

    /// Server version the in-memory deployment reports
    #[arg(long)]
    server_version: Option<String>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    let result = tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")
        .and_then(|rt| rt.block_on(async_main(args)));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<bool> {
    let mut config = RunnerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(specs) = args.specs {
        config.specs_dir = specs;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    if let Some(uri) = args.uri {
        config.uri = uri;
    }

    let mut runner = if args.memory {
        let mut deployment = MemoryDeploymentConfig::default();
        if let Some(topology) = args.topology {
            deployment.topology = topology.into();
        }
        if let Some(mongoses) = args.mongoses {
            deployment.mongoses = mongoses;
        }
        if let Some(version) = args.server_version {
            deployment.version = version;
        }
        info!(
            "Unified runner v{} (in-memory {} deployment)",
            env!("CARGO_PKG_VERSION"),
            deployment.topology
        );
        TestRunner::with_deployment(config, Arc::new(MemoryDeployment::new(deployment)))
    } else {
        info!("Unified runner v{} ({})", env!("CARGO_PKG_VERSION"), config.uri);
        TestRunner::with_config(config)
    };
    if let Some(test) = args.test {
        runner.filter_test(test);
    }

    let paths = match args.file {
        Some(file) => vec![file],
        None => TestFile::discover(&runner.config().specs_dir)?,
    };
    let results = runner.run_paths(&paths).await?;
    runner.shutdown().await;

    runner.write_results(&results)?;
    Ok(results.success())
}
