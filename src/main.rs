//! TFTP server binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tracing_subscriber::EnvFilter;

use tftpd::{ServerConfig, TftpServer, TransferConfig};

#[derive(FromArgs, Debug)]
#[argh(description = "Lock-step TFTP file server with separate read and write roots")]
struct CliConfig {
    #[argh(
        option,
        short = 'b',
        default = "String::from(\"0.0.0.0:6969\")",
        description = "address and port for the request socket"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        default = "String::from(\"./tftp_read\")",
        description = "directory downloads are served from"
    )]
    read_root: String,

    #[argh(
        option,
        short = 'w',
        default = "String::from(\"./tftp_write\")",
        description = "directory uploads are stored in"
    )]
    write_root: String,

    #[argh(
        option,
        default = "2000",
        description = "per-attempt wait for the peer, in milliseconds"
    )]
    timeout_ms: u64,

    #[argh(
        option,
        default = "5",
        description = "send attempts per block before a session is abandoned"
    )]
    max_retries: usize,

    #[argh(
        option,
        default = "10 * 1024 * 1024",
        description = "upload size ceiling in bytes"
    )]
    max_upload_size: u64,

    #[argh(
        option,
        default = "String::from(\".txt,.pdf,.doc,.docx,.jpg,.png,.ul\")",
        description = "comma-separated list of allowed upload extensions"
    )]
    allow: String,

    #[argh(
        option,
        default = "32",
        description = "maximum number of concurrent transfers"
    )]
    max_transfers: usize,
}

impl CliConfig {
    fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind,
            max_transfers: self.max_transfers,
            transfer: TransferConfig {
                read_root: PathBuf::from(self.read_root),
                write_root: PathBuf::from(self.write_root),
                timeout: Duration::from_millis(self.timeout_ms),
                max_retries: self.max_retries,
                max_upload_size: self.max_upload_size,
                allowed_extensions: self
                    .allow
                    .split(',')
                    .map(|ext| ext.trim().to_string())
                    .filter(|ext| !ext.is_empty())
                    .collect(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli: CliConfig = argh::from_env();
    let mut server = TftpServer::new(cli.into_server_config());
    server.run().await
}
