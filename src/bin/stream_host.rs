//! Example hosting binary: serves one stream over HTTP. Real deployments
//! define their own `StreamEntry`; this binary hosts a generic
//! JSON-valued one so there is something concrete to point at for local
//! testing and demos.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};

use chronicle_stream::http::HttpEndpointConfig;
use chronicle_stream::persister::file::FilePersisterConfig;
use chronicle_stream::{SchemaInfo, Stream, StreamEntry};

#[derive(Parser)]
#[command(name = "stream-host", version, about = "Hosts one chronicle-stream event log over HTTP")]
struct Cli {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Route prefix the stream is served under, e.g. "/trades".
    #[arg(long, default_value = "")]
    route: String,
    /// Path to the log file. If omitted, a temp file is created and
    /// removed on exit (unless `--do-not-remove-autogen-data`).
    #[arg(long)]
    stream_data_filename: Option<PathBuf>,
    #[arg(long)]
    do_not_remove_autogen_data: bool,
}

/// A generic JSON-valued demo entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoEntry {
    value: serde_json::Value,
}

impl StreamEntry for DemoEntry {
    const ENTRY_NAME: &'static str = "DemoEntry";
    fn schema_info() -> SchemaInfo {
        SchemaInfo::from_fields(&[("value", "json")])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (stream, autogen_path) = open_stream(&cli)?;
    let stream = Arc::new(stream);
    info!("hosting namespace '{}' ({} records) on port {}", stream.namespace_name(), stream.size(), cli.port);

    let router = chronicle_stream::http_router::<DemoEntry>(Arc::clone(&stream), HttpEndpointConfig::default());
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    if let Some(path) = autogen_path {
        if !cli.do_not_remove_autogen_data {
            let _ = std::fs::remove_file(path);
        }
    }
    Ok(())
}

fn open_stream(cli: &Cli) -> anyhow::Result<(Stream<DemoEntry>, Option<PathBuf>)> {
    let namespace_name = cli.route.trim_start_matches('/').to_string();
    match &cli.stream_data_filename {
        Some(path) => {
            let stream = Stream::open_file(FilePersisterConfig::new(path.clone(), namespace_name))?;
            Ok((stream, None))
        }
        None => {
            let path = std::env::temp_dir().join(format!("stream_host_{}.log", std::process::id()));
            let stream = Stream::open_file(FilePersisterConfig::new(path.clone(), namespace_name))?;
            Ok((stream, Some(path)))
        }
    }
}
