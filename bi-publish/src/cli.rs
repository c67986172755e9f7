//! Command-line surface of bi-publish.
//!
//! The publish pipeline itself lives in `bi-publish-core`; this module only
//! wires configuration, the file-backed resolver and the HTTP client into a
//! [`PublishSession`] and reports the outcome.
//!
//! Call [`run`] with a constructed [`Cli`] for programmatic use and tests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bi_publish_core::document::DocumentRef;
use bi_publish_core::rest::RestClient;
use bi_publish_core::session::{PublishReport, PublishSession};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crate::load_config::load_config;
use crate::resolver::FileConnectionResolver;

/// Publish BI workbooks and data sources with rewritten connection credentials.
#[derive(Parser)]
#[clap(
    name = "bi-publish",
    version,
    about = "Publish workbooks and data sources to an analytics server, embedding target connection credentials"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish one .twb, .twbx, .tds or .tdsx document
    Publish {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Document to publish
        #[clap(long)]
        document: PathBuf,
        /// Destination folder path, overriding `publish.project` from the config
        #[clap(long)]
        project: Option<String>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    info!("cli_started");

    match cli.command {
        Commands::Publish {
            config,
            document,
            project,
        } => {
            let report = publish(&config, &document, project).await?;
            let rendered = serde_json::to_string_pretty(&report)?;
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn publish(config_path: &Path, document: &Path, project: Option<String>) -> Result<PublishReport> {
    // Rejects unknown extensions before anything else happens.
    DocumentRef::from_path(document)?;

    let config = load_config(config_path)?;
    let resolver = FileConnectionResolver::from_path(&config.publish.target_connections)?;
    let destination = project.unwrap_or_else(|| config.publish.project.clone());

    let mut session = PublishSession::new(RestClient::new(&config.server.endpoint));
    session
        .sign_in(
            &config.server.username,
            config.password.expose(),
            &config.server.site,
        )
        .await
        .with_context(|| format!("Sign-in to {} failed", config.server.endpoint.server_url))?;

    let outcome = session.publish(document, &destination, &resolver).await;

    // Always attempted; a failure here does not mask the publish outcome.
    if let Err(e) = session.sign_out().await {
        warn!(error = %e, "Sign-out failed");
    }

    match outcome {
        Ok(report) => {
            info!(
                command = "publish",
                id = %report.document.id,
                folder_id = %report.folder_id,
                connections_bound = report.connections_bound,
                extract = ?report.extract,
                "Publish complete"
            );
            Ok(report)
        }
        Err(e) => match e.published_document_id().map(str::to_string) {
            Some(id) => {
                error!(
                    command = "publish",
                    document_id = %id,
                    error = %e,
                    "Document was created remotely but post-upload steps failed; follow up instead of retrying"
                );
                Err(anyhow::Error::new(e).context(format!(
                    "Partial publish: document {id} exists on the server and needs follow-up, do not retry blindly"
                )))
            }
            None => {
                error!(command = "publish", error = %e, "Publish failed");
                Err(anyhow::Error::new(e).context(format!("Publishing {} failed", document.display())))
            }
        },
    }
}
