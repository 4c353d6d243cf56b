//! Runtime configuration: environment variables with command-line flag
//! overrides. Flags win over the environment, the environment wins over
//! defaults.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "dogeindex", about = "Address-scoped Dogecoin indexer")]
pub struct Config {
    /// Dogecoin RPC host
    #[arg(long = "rpc-host", env = "DOGE_RPC_HOST", default_value = "127.0.0.1")]
    pub rpc_host: String,

    /// Dogecoin RPC port
    #[arg(long = "rpc-port", env = "DOGE_RPC_PORT", default_value_t = 22555)]
    pub rpc_port: u16,

    /// Dogecoin RPC username
    #[arg(long = "rpc-user", env = "DOGE_RPC_USER", default_value = "dogecoin")]
    pub rpc_user: String,

    /// Dogecoin RPC password
    #[arg(long = "rpc-pass", env = "DOGE_RPC_PASS", default_value = "dogecoin")]
    pub rpc_pass: String,

    /// Dogecoin ZMQ host
    #[arg(long = "zmq-host", env = "DOGE_ZMQ_HOST", default_value = "127.0.0.1")]
    pub zmq_host: String,

    /// Dogecoin ZMQ port
    #[arg(long = "zmq-port", env = "DOGE_ZMQ_PORT", default_value_t = 28332)]
    pub zmq_port: u16,

    /// PostgreSQL host
    #[arg(long = "db-host", env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// PostgreSQL port
    #[arg(long = "db-port", env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// PostgreSQL username
    #[arg(long = "db-user", env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// PostgreSQL password
    #[arg(long = "db-pass", env = "DB_PASS", default_value = "postgres")]
    pub db_pass: String,

    /// PostgreSQL database name
    #[arg(long = "db-name", env = "DB_NAME", default_value = "dogeindex")]
    pub db_name: String,

    /// API server port
    #[arg(long = "api-port", env = "API_PORT", default_value_t = 420)]
    pub api_port: u16,

    /// API bearer token
    #[arg(long = "api-token", env = "API_TOKEN", default_value = "")]
    pub api_token: String,

    /// Block hash or decimal height to start processing from. Falls back
    /// to the persisted cursor, then the node's current best block.
    #[arg(long = "start-block", env = "START_BLOCK")]
    pub start_block: Option<String>,

    /// Optional SPV peer (host:port) to run the peer session against.
    #[arg(long = "spv-peer", env = "DOGE_SPV_PEER")]
    pub spv_peer: Option<String>,
}

impl Config {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn zmq_endpoint(&self) -> (String, u16) {
        (self.zmq_host.clone(), self.zmq_port)
    }

    #[cfg(test)]
    pub fn for_tests(api_token: &str) -> Self {
        let mut config = Config::parse_from(["dogeindex"]);
        config.api_token = api_token.to_string();
        config
    }
}
