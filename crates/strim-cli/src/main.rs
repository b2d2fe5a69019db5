mod mpv;
mod tui;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand};

use mpv::{MpvOptions, MpvProcess, Role};
use strim::{Client, ClientConfig, DEFAULT_PORT, Server, ServerConfig};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const PLAYER_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "strim")]
#[command(about = "Watch a local video together, in sync, over mpv")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, default_value = "mpv", help = "mpv binary to launch")]
    mpv: String,

    #[arg(
        long = "mpv-arg",
        global = true,
        allow_hyphen_values = true,
        help = "Extra argument passed to mpv (repeatable)"
    )]
    mpv_args: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Play a file and let viewers join
    Host {
        media: PathBuf,

        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(long, default_value_t = 64, help = "Packets queued per viewer before it is dropped")]
        queue_capacity: usize,

        #[arg(long, help = "Show the host dashboard instead of logging")]
        tui: bool,
    },
    /// Join a host
    Connect {
        #[arg(help = "Host address, with or without a port")]
        address: String,

        #[arg(long, default_value_t = 30, help = "Seconds to wait for the stream to load")]
        load_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Command::Host {
            media,
            bind,
            port,
            queue_capacity,
            tui,
        } => {
            if !tui {
                init_logger();
            }
            let options = MpvOptions {
                binary: args.mpv,
                extra_args: args.mpv_args,
                silence_output: tui,
            };
            let config = ServerConfig {
                bind: SocketAddr::new(bind, port),
                viewer_queue_capacity: queue_capacity,
                ..Default::default()
            };
            host(media, config, options, tui).await
        }
        Command::Connect {
            address,
            load_timeout,
        } => {
            init_logger();
            let options = MpvOptions {
                binary: args.mpv,
                extra_args: args.mpv_args,
                silence_output: false,
            };
            let config = ClientConfig {
                load_timeout: Duration::from_secs(load_timeout),
                ..Default::default()
            };
            connect(with_default_port(&address), config, options).await
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

async fn host(
    media: PathBuf,
    config: ServerConfig,
    options: MpvOptions,
    tui: bool,
) -> Result<ExitCode> {
    ensure!(media.is_file(), "{} is not a file", media.display());

    let bind = config.bind;
    let mut player = MpvProcess::spawn(&options, Role::Host(&media))?;
    let ipc = Arc::new(player.connect(SOCKET_TIMEOUT).await?);
    let server = Server::bind(ipc, config)
        .await
        .with_context(|| format!("failed to listen on {}", bind))?;

    let result = if tui {
        let events = server.subscribe_events();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        let dashboard = {
            let server = server.clone();
            tokio::task::spawn_blocking(move || tui::run(&server, events))
        };

        let dashboard = dashboard.await.context("dashboard panicked")?;
        server.shutdown();
        let served = running.await.context("server task panicked")?;
        dashboard
            .context("dashboard failed")
            .and(served.context("hosting failed"))
    } else {
        tokio::select! {
            served = server.run() => served.context("hosting failed"),
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                server.shutdown();
                Ok(())
            }
        }
    };

    finish(player, result).await
}

async fn connect(address: String, config: ClientConfig, options: MpvOptions) -> Result<ExitCode> {
    let mut player = MpvProcess::spawn(&options, Role::Viewer)?;
    let ipc = Arc::new(player.connect(SOCKET_TIMEOUT).await?);
    let mut client = Client::new(ipc, config);

    log::info!("Connecting to {}", address);
    let result = tokio::select! {
        session = client.connect(address.as_str()) => {
            session.with_context(|| format!("session with {} failed", address))
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, leaving");
            Ok(())
        }
    };

    finish(player, result).await
}

/// Exits with the player: its exit status decides the process status once
/// the session is over.
async fn finish(mut player: MpvProcess, result: Result<()>) -> Result<ExitCode> {
    if let Err(e) = result {
        let _ = player.kill().await;
        return Err(e);
    }

    match tokio::time::timeout(PLAYER_EXIT_GRACE, player.wait()).await {
        Ok(status) => Ok(exit_code(status.context("failed to wait for mpv")?)),
        Err(_) => {
            log::debug!("mpv still running, stopping it");
            player.kill().await.context("failed to stop mpv")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    if status.success() {
        ExitCode::SUCCESS
    } else {
        log::warn!("mpv exited with {}", status);
        ExitCode::FAILURE
    }
}

fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{}:{}", address, DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_is_appended() {
        assert_eq!(with_default_port("192.168.1.4"), "192.168.1.4:5300");
        assert_eq!(with_default_port("192.168.1.4:6000"), "192.168.1.4:6000");
        assert_eq!(with_default_port("movies.local"), "movies.local:5300");
        assert_eq!(with_default_port("movies.local:80"), "movies.local:80");
        assert_eq!(with_default_port("::1"), "[::1]:5300");
        assert_eq!(with_default_port("[::1]:7000"), "[::1]:7000");
    }

    #[test]
    fn test_parses_subcommands() {
        let args = Args::try_parse_from(["strim", "host", "movie.mkv", "--tui", "-p", "6000"]).unwrap();
        match args.command {
            Command::Host { media, port, tui, .. } => {
                assert_eq!(media, PathBuf::from("movie.mkv"));
                assert_eq!(port, 6000);
                assert!(tui);
            }
            Command::Connect { .. } => panic!("expected host"),
        }

        let args = Args::try_parse_from([
            "strim",
            "connect",
            "10.0.0.2",
            "--mpv-arg",
            "--volume=50",
        ])
        .unwrap();
        assert_eq!(args.mpv_args, vec!["--volume=50".to_string()]);
        assert!(matches!(args.command, Command::Connect { ref address, .. } if address == "10.0.0.2"));
    }
}
