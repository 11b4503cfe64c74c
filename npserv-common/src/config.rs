// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::LazyLock;

const ENV_LOG_LEVEL: &str = "NPSERV_LOG_LEVEL";

const ENV_LOG_METHOD: &str = "NPSERV_LOG_METHOD";
const LOG_METHOD_DISABLED: &str = "disabled";
const LOG_METHOD_STDOUT: &str = "stdout";
const LOG_METHOD_STDERR: &str = "stderr";

const ENV_SOCKS_CONF: &str = "NPSERV_SOCKS_CONF";
const DEFAULT_SOCKS_CONF: &str = "socks.conf";

const ENV_USER_PIPE_DIR: &str = "NPSERV_USER_PIPE_DIR";
const DEFAULT_USER_PIPE_DIR: &str = "user_pipe";

const ENV_SHM_KEY: &str = "NPSERV_SHM_KEY";
const DEFAULT_SHM_KEY: i32 = 1127;

/// Sessions are identified by an id in `1..=MAX_CLIENTS`; the smallest free
/// id is always handed to the next connection.
pub const MAX_CLIENTS: usize = 30;

/// Shell variants fall back to this port when none is given on the CLI.
pub const DEFAULT_PORT: u16 = 7001;

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum LogMethod {
    Stdout,
    #[default]
    Stderr,
    File(PathBuf),
    Disabled,
}

impl std::fmt::Display for LogMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMethod::Disabled => write!(f, "{LOG_METHOD_DISABLED}"),
            LogMethod::Stdout => write!(f, "{LOG_METHOD_STDOUT}"),
            LogMethod::Stderr => write!(f, "{LOG_METHOD_STDERR}"),
            LogMethod::File(path) => write!(f, "file://{}", path.to_string_lossy()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_method: LogMethod,
    pub log_level: String,
    pub socks_conf: PathBuf,
    pub user_pipe_dir: PathBuf,
    pub shm_key: i32,
}

static ENV_CONFIG: LazyLock<Config> = LazyLock::new(FromEnv::config);

impl Config {
    pub fn get() -> &'static Self {
        &ENV_CONFIG
    }
}

pub struct FromEnv {}

impl FromEnv {
    pub fn log_method() -> LogMethod {
        let method = std::env::var(ENV_LOG_METHOD).unwrap_or_default();

        match method.as_str() {
            LOG_METHOD_DISABLED => LogMethod::Disabled,
            LOG_METHOD_STDOUT => LogMethod::Stdout,
            LOG_METHOD_STDERR => LogMethod::Stderr,
            method if method.starts_with("file://") => {
                // not a real uri, just a plain (unencoded) path prefixed
                // with file://
                LogMethod::File(PathBuf::from(&method[7..]))
            }
            _ => LogMethod::default(),
        }
    }

    pub fn log_level() -> String {
        std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string())
    }

    fn socks_conf() -> PathBuf {
        std::env::var_os(ENV_SOCKS_CONF)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKS_CONF))
    }

    fn user_pipe_dir() -> PathBuf {
        std::env::var_os(ENV_USER_PIPE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_USER_PIPE_DIR))
    }

    fn shm_key() -> i32 {
        std::env::var(ENV_SHM_KEY)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SHM_KEY)
    }

    pub fn config() -> Config {
        Config {
            log_method: Self::log_method(),
            log_level: Self::log_level(),
            socks_conf: Self::socks_conf(),
            user_pipe_dir: Self::user_pipe_dir(),
            shm_key: Self::shm_key(),
        }
    }
}

/// The single positional argument every binary takes is the listening port.
pub fn port_from_args(default: Option<u16>) -> anyhow::Result<u16> {
    match (std::env::args().nth(1), default) {
        (Some(arg), _) => arg
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port: {arg}")),
        (None, Some(port)) => Ok(port),
        (None, None) => anyhow::bail!("usage: {} <port>", std::env::args().next().unwrap_or_default()),
    }
}
