//! One-shot CLI commands against a booted namespace.
//!
//! - `mounts` - List mount points, their driver and fault state
//! - `ls <path>` - List the children of a node
//! - `cat <path> <type>` - Write a stream's bytes to the output
//! - `stat <path>` - Describe a node as JSON
//! - `serve` - Expose mounts to remote proxies over HTTP until interrupted

use std::io::Write;
use std::net::SocketAddr;
use std::str::FromStr;

use clap::Subcommand;

use mountdb_core::{DatabaseManager, Error, Path, Result, StreamType};
use mountdb_remote::{HttpServerError, Server, ServerOptions};

/// A mount point exposed under an endpoint name, written `NAME=/mount/point`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub endpoint: String,
    pub mount: Path,
}

impl FromStr for Export {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (endpoint, mount) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=/mount/point, got {:?}", s))?;
        Path::validate_name(endpoint).map_err(|e| e.to_string())?;
        Ok(Export {
            endpoint: endpoint.to_string(),
            mount: Path::parse(mount).map_err(|e| e.to_string())?,
        })
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List mount points
    Mounts,
    /// List the children of a node
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print the contents of a stream
    Cat { path: String, stream_type: String },
    /// Describe a node
    Stat { path: String },
    /// Serve mounts to remote proxies at http://LISTEN/NAME
    Serve {
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,
        /// Mount to expose, as NAME=/mount/point (default: root=/)
        #[arg(long = "export")]
        exports: Vec<Export>,
        /// Reject every mutating request
        #[arg(long)]
        read_only: bool,
    },
}

/// A server exposing the database mounted at each export.
pub fn export_server(
    manager: &DatabaseManager,
    exports: &[Export],
    read_only: bool,
) -> Result<Server> {
    let root = [Export {
        endpoint: "root".to_string(),
        mount: Path::root(),
    }];
    let exports = if exports.is_empty() { &root[..] } else { exports };

    let server = Server::new();
    for export in exports {
        let resolved = manager.resolve_mount(&export.mount)?;
        if resolved.mount != export.mount {
            return Err(Error::invalid_path(format!(
                "{} is not a mount point",
                export.mount
            )));
        }
        server.register_with(
            export.endpoint.clone(),
            resolved.database,
            ServerOptions { read_only },
        )?;
    }
    Ok(server)
}

fn serve(server: Server, listen: SocketAddr, out: &mut impl Write) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(async {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            for endpoint in server.endpoints()? {
                writeln!(out, "http://{}/{}", listener.local_addr()?, endpoint)?;
            }
            out.flush()?;
            mountdb_remote::serve(server, listener, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|HttpServerError::ServingFailed(e)| Error::from(e))
        })
}

/// Run `command`, writing its output to `out`.
pub fn execute(manager: &DatabaseManager, command: &Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Mounts => {
            for mount in manager.mounts()? {
                match mount.faulted {
                    Some(reason) => writeln!(out, "{}\t{}\tfaulted: {}", mount.path, mount.driver, reason)?,
                    None => writeln!(out, "{}\t{}", mount.path, mount.driver)?,
                }
            }
        }
        Command::Ls { path } => {
            for name in manager.list(&Path::parse(path)?)? {
                writeln!(out, "{}", name)?;
            }
        }
        Command::Cat { path, stream_type } => {
            let data = manager.read_bytes(&Path::parse(path)?, &StreamType::new(stream_type.as_str()))?;
            out.write_all(&data)?;
        }
        Command::Stat { path } => {
            let info = manager.stat(&Path::parse(path)?)?;
            let json = serde_json::to_string_pretty(&info)
                .map_err(|e| Error::internal(format!("cannot render node info: {}", e)))?;
            writeln!(out, "{}", json)?;
        }
        Command::Serve {
            listen,
            exports,
            read_only,
        } => {
            let server = export_server(manager, exports, *read_only)?;
            serve(server, *listen, out)?;
        }
    }
    Ok(())
}
