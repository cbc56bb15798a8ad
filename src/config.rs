use std::path::PathBuf;

const ENV_CERT_DIR: &str = "JOBWORKER_SERVER_CERT_DIR";
const ENV_PORT: &str = "JOBWORKER_SERVER_PORT";
const ENV_TEST_MODE: &str = "JOBWORKER_SERVER_TEST";

const DEFAULT_CERT_DIR: &str = "certs";
const DEFAULT_PORT: u16 = 5678;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding `server.crt`, `server.key` and `ca.crt`.
    pub cert_dir: PathBuf,
    pub port: u16,
    /// When set, jobs run without a cgroup and without namespace isolation
    /// so the server can be exercised unprivileged.
    pub test_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            port: DEFAULT_PORT,
            test_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            cert_dir: std::env::var(ENV_CERT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERT_DIR)),
            port: std::env::var(ENV_PORT)
                .ok()
                .and_then(|v| parse_port(&v))
                .unwrap_or(DEFAULT_PORT),
            test_mode: std::env::var(ENV_TEST_MODE).is_ok_and(|v| !v.is_empty()),
        }
    }
}

fn parse_port(value: &str) -> Option<u16> {
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!(value, "ignoring unparseable server port");
            None
        }
    }
}
