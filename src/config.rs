//! CLI/env configuration (§6), the one piece of ambient stack the distilled
//! spec names directly. Environment variables shadow flags via clap's `env`
//! attribute, matching the `GUBLE_*` convention.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "topicbusd", about = "Topic-hierarchical publish/subscribe message bus")]
pub struct Config {
    /// WebSocket listen address.
    #[arg(long, env = "GUBLE_LISTEN", default_value = ":8080")]
    pub listen: String,

    /// Enable info-level logging.
    #[arg(long, env = "GUBLE_LOG_INFO", default_value_t = false)]
    pub log_info: bool,

    /// Enable debug-level logging.
    #[arg(long, env = "GUBLE_LOG_DEBUG", default_value_t = false)]
    pub log_debug: bool,

    /// Directory under which partition directories are created.
    #[arg(long, env = "GUBLE_STORAGE_PATH", default_value = "./data")]
    pub storage_path: String,

    /// This node's id, stamped into locally published messages.
    #[arg(long, env = "GUBLE_NODE_ID", default_value_t = 0)]
    pub node_id: u8,

    /// Per-route bounded queue depth.
    #[arg(long, env = "GUBLE_QUEUE_DEPTH", default_value_t = 50)]
    pub queue_depth: usize,

    /// Seconds a route may sit full before the router evicts it.
    #[arg(long, env = "GUBLE_SLOW_CONSUMER_DEADLINE_SECS", default_value_t = 3)]
    pub slow_consumer_deadline_secs: u64,

    /// Seconds a client connection may sit idle on read before timing out.
    #[arg(long, env = "GUBLE_IDLE_READ_TIMEOUT_SECS", default_value_t = 30)]
    pub idle_read_timeout_secs: u64,

    /// Data-file rotation threshold in bytes.
    #[arg(long, env = "GUBLE_SEGMENT_BYTES", default_value_t = 104_857_600)]
    pub segment_bytes: u64,
}

impl Config {
    /// Resolves `listen` into a `host:port` string usable by
    /// `TcpListener::bind`, filling in `0.0.0.0` for a bare `:port` form.
    pub fn listen_addr(&self) -> String {
        if let Some(port) = self.listen.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.listen.clone()
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.log_debug {
            log::LevelFilter::Debug
        } else if self.log_info {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        let config = Config::parse_from(["topicbusd", "--listen", ":9000"]);
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn explicit_host_passes_through() {
        let config = Config::parse_from(["topicbusd", "--listen", "127.0.0.1:9000"]);
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
    }
}
