use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use canvas_core::{CanvasConfig, GridSize, KeyLayout};
use clap::{Args, Parser, Subcommand};

/// Redis strings top out at 512 MiB.
const MAX_REGION_BITS: u64 = 512 * 1024 * 1024 * 8;

#[derive(Debug, Parser)]
#[command(
    name = "canvas-road",
    author,
    version,
    about = "Shared pixel canvas server and watch client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a running server and print pixel updates as they arrive
    Watch {
        /// Server base URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Actor id presented to the server
        #[arg(long)]
        actor: Option<String>,

        /// Request and summarize the current snapshot before streaming
        #[arg(long, default_value_t = false)]
        snapshot: bool,
    },
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "CANVAS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Redis connection URI for canvas state and cross-instance fan-out.
    #[arg(long, env = "CANVAS_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for every Redis key and pub/sub channel.
    #[arg(long, env = "CANVAS_KEY_PREFIX", default_value = "canvas")]
    pub key_prefix: String,

    #[arg(long, env = "CANVAS_WIDTH", default_value_t = 1000)]
    pub width: u32,

    #[arg(long, env = "CANVAS_HEIGHT", default_value_t = 1000)]
    pub height: u32,

    /// Side length of a heatmap zone, in cells.
    #[arg(long, env = "CANVAS_ZONE_SIZE", default_value_t = 50)]
    pub zone_size: u32,

    #[arg(long, env = "CANVAS_HEATMAP_TTL_SECS", default_value_t = 300)]
    pub heatmap_ttl_secs: u64,

    #[arg(long, env = "CANVAS_ZONE_RETENTION_HOURS", default_value_t = 168)]
    pub zone_retention_hours: u64,

    /// Rebuild the snapshot on this interval as well as after writes. 0 disables.
    #[arg(long, env = "CANVAS_SNAPSHOT_REFRESH_SECS", default_value_t = 0)]
    pub snapshot_refresh_secs: u64,

    /// Approximate cap on the placement log length.
    #[arg(long, env = "CANVAS_ACTIVITY_LOG_MAX_LEN", default_value_t = 100_000)]
    pub activity_log_max_len: usize,

    /// Keep all state in process and fan out locally (development only).
    #[arg(long, env = "CANVAS_IN_MEMORY", default_value_t = false)]
    pub in_memory: bool,

    /// Bearer token required by the admin endpoints. Unset disables them.
    #[arg(long, env = "CANVAS_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Websocket connections silent for longer than this are closed.
    #[arg(long, env = "CANVAS_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CANVAS_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub canvas: CanvasConfig,
    pub snapshot_refresh: Option<Duration>,
    pub activity_log_max_len: usize,
    pub in_memory: bool,
    pub admin_token: Option<String>,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        let canvas = CanvasConfig {
            grid: GridSize::new(args.width, args.height),
            zone_size: args.zone_size,
            heatmap_ttl: Duration::from_secs(args.heatmap_ttl_secs),
            zone_retention: Duration::from_secs(args.zone_retention_hours * 60 * 60),
            keys: KeyLayout::new(args.key_prefix),
            ..CanvasConfig::default()
        };
        canvas.validate().context("invalid canvas dimensions")?;
        if canvas.grid.cell_count() * 4 > MAX_REGION_BITS {
            bail!(
                "a {}x{} canvas does not fit in a single Redis string",
                args.width,
                args.height
            );
        }
        if args.activity_log_max_len == 0 {
            bail!("activity log max length must be positive");
        }

        Ok(ServerConfig {
            listen_addr,
            redis_url: args.redis_url,
            canvas,
            snapshot_refresh: (args.snapshot_refresh_secs > 0)
                .then(|| Duration::from_secs(args.snapshot_refresh_secs)),
            activity_log_max_len: args.activity_log_max_len,
            in_memory: args.in_memory,
            admin_token: args.admin_token.filter(|token| !token.is_empty()),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["canvas-road"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?.server)
    }

    #[test_timeout::timeout]
    fn defaults_describe_a_thousand_square_canvas() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.canvas.grid, GridSize::new(1000, 1000));
        assert_eq!(config.canvas.zone_size, 50);
        assert_eq!(config.canvas.heatmap_ttl, Duration::from_secs(300));
        assert_eq!(config.canvas.zone_retention, Duration::from_secs(168 * 3600));
        assert!(config.snapshot_refresh.is_none());
        assert!(config.admin_token.is_none());
        assert!(!config.in_memory);
    }

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let config = parse(&[
            "--width",
            "64",
            "--height",
            "32",
            "--zone-size",
            "8",
            "--snapshot-refresh-secs",
            "30",
            "--admin-token",
            "secret",
            "--in-memory",
        ])
        .unwrap();
        assert_eq!(config.canvas.grid, GridSize::new(64, 32));
        assert_eq!(config.canvas.zone_size, 8);
        assert_eq!(config.snapshot_refresh, Some(Duration::from_secs(30)));
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert!(config.in_memory);
    }

    #[test_timeout::timeout]
    fn rejects_unusable_settings() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--zone-size", "0"]).is_err());
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--width", "100000", "--height", "100000"]).is_err());
    }

    #[test_timeout::timeout]
    fn watch_subcommand_parses() {
        let cli = Cli::try_parse_from(["canvas-road", "watch", "--url", "ws://example:9000"]).unwrap();
        match cli.command {
            Some(Commands::Watch { url, snapshot, .. }) => {
                assert_eq!(url, "ws://example:9000");
                assert!(!snapshot);
            }
            None => panic!("expected watch subcommand"),
        }
    }
}
