// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the cluster provisioner against simulated
//! agents

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use provisioner::app::ClusterCreateParams;
use provisioner::catalog::TemplateCatalog;
use provisioner::executor::SimExecutor;
use provisioner::open_datastore;
use provisioner::Config;
use provisioner::Provisioner;
use provisioner_common::cmd::fatal;
use provisioner_common::cmd::CmdError;
use provisioner_types::job::JobStatus;
use slog::info;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(name = "provisioner", about = "Provisions clusters from templates")]
struct Args {
    /// Path to the provisioner's TOML configuration
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,

    /// Create a cluster from this template, wait for it to settle, print it
    /// as JSON, and exit
    #[clap(long, action)]
    create: Option<String>,

    /// Number of nodes for `--create` (default: 3)
    #[clap(long, action)]
    nodes: Option<usize>,

    /// Simulated latency of each agent action, in milliseconds
    #[clap(long, default_value_t = 10, action)]
    latency_ms: u64,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();
    if args.create.is_none() && args.nodes.is_some() {
        return Err(CmdError::Usage(String::from("--nodes requires --create")));
    }

    let config = Config::from_file(&args.config_file_path)
        .context("loading configuration")?;
    let log = config
        .log
        .to_logger("provisioner")
        .context("initializing logger")?;

    // The catalog path is relative to the configuration file.
    let catalog_path = match args.config_file_path.parent() {
        Some(dir) if config.templates.is_relative() => {
            dir.join(&config.templates)
        }
        _ => config.templates.clone(),
    };
    let catalog = TemplateCatalog::from_file(&catalog_path)
        .with_context(|| format!("loading templates from {catalog_path}"))?;
    let datastore = open_datastore(&config.storage)
        .await
        .context("opening datastore")?;
    let executor = Arc::new(SimExecutor::new(
        &log,
        Duration::from_millis(args.latency_ms),
    ));

    let provisioner =
        Provisioner::start(&config, catalog, datastore, executor, &log);

    let result = match args.create {
        Some(template) => {
            let nodes = args.nodes.unwrap_or(3);
            create_and_wait(&provisioner, template, nodes).await
        }
        None => {
            info!(log, "running; interrupt to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")
        }
    };
    provisioner.shutdown().await;
    Ok(result?)
}

async fn create_and_wait(
    provisioner: &Provisioner,
    template: String,
    node_count: usize,
) -> Result<(), anyhow::Error> {
    let orchestrator = provisioner.orchestrator();
    let job = orchestrator
        .cluster_create(ClusterCreateParams {
            name: format!("{template}-demo"),
            owner: "demo".to_string(),
            template,
            node_count,
            services: None,
            hardware_type: None,
            image_type: None,
        })
        .await?;

    let view = loop {
        let view = orchestrator.cluster_view(job.cluster_id).await?;
        let settled = view.job.as_ref().is_some_and(|job| {
            job.status() != JobStatus::Active
        }) && view.cluster.active_job.is_none();
        if settled {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let json = serde_json::to_string_pretty(&view)
        .context("serializing cluster")?;
    println!("{json}");
    Ok(())
}
