use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use blockswarm::client::{self, ClientConfig};
use blockswarm::config::{Cli, Commands, DownloadArgs, ListArgs, ServeArgs};
use blockswarm::proto;
use blockswarm::server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Download(args) => download(args).await,
        Commands::List(args) => list(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        port: args.port,
        cs: args.cs,
        p: args.p,
        t: Duration::from_secs(args.t),
        files_dir: args.files_dir,
        b: args.b,
    };
    let server = Server::new(config).await?;
    info!("server ready");
    server.run().await
}

async fn download(args: DownloadArgs) -> Result<()> {
    let config = ClientConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        file: args.file,
        dc: args.dc,
        b: args.b,
        pc: args.pc,
        listen_port: args.port,
        downloads_dir: args.files_dir,
    };
    let listen_port = config.listen_port;
    client::run(config).await?;
    info!("download complete, serving as a trusted peer on port {listen_port}");
    // Keep the process alive so the trusted-peer server spawned by
    // `client::run` continues serving blocks, per spec.md §2's "it starts
    // its trusted-peer server" (lives until process exit, §3).
    std::future::pending::<()>().await;
    Ok(())
}

async fn list(args: ListArgs) -> Result<()> {
    let mut stream =
        tokio::net::TcpStream::connect((args.server_host.as_str(), args.server_port)).await?;
    proto::write_line(&mut stream, "LIST_FILES").await?;
    let mut reader = tokio::io::BufReader::new(&mut stream);
    loop {
        let line = match proto::read_line(&mut reader).await? {
            Some(line) => line,
            None => break,
        };
        if line == "END_OF_LIST" {
            break;
        }
        println!("{line}");
    }
    Ok(())
}
