//! Command-line flags and environment configuration.
//!
//! All flags are numeric and optional. A value that does not start with a
//! digit is skipped with a warning and the default is kept; this mirrors
//! the lenient `atoi` tradition the CLI has always had, and promoting it
//! to a hard error would break existing launch scripts.

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use peregrine_core::db::PoolOptions;
use peregrine_core::{ActorModel, TrigMode};

/// Default listen port.
const DEFAULT_PORT: u16 = 9006;
/// Default database pool size.
const DEFAULT_SQL_CONNS: usize = 8;
/// Default worker thread count.
const DEFAULT_THREADS: usize = 8;

/// Records per log file before the sink rotates to a `.<k>` suffix.
pub const LOG_SPLIT_LINES: u64 = 800_000;
/// Log queue depth in asynchronous mode.
pub const LOG_QUEUE_SIZE: usize = 800;

/// Command line arguments. Values are captured raw so a non-numeric input
/// can be warned about and skipped instead of aborting startup.
#[derive(Parser, Debug, Default)]
#[command(name = "peregrine-server")]
#[command(about = "Epoll-driven HTTP/1.1 server with database-backed login")]
pub struct Args {
    /// Listen port (default 9006)
    #[arg(short = 'p', value_name = "PORT")]
    pub port: Option<String>,

    /// Log writes: 0 synchronous, 1 asynchronous (default 0)
    #[arg(short = 'l', value_name = "LOGWRITE")]
    pub log_write: Option<String>,

    /// Trigger mode: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (default 0)
    #[arg(short = 'm', value_name = "TRIGMODE")]
    pub trig_mode: Option<String>,

    /// Graceful close: 0 off, 1 SO_LINGER on (default 0)
    #[arg(short = 'o', value_name = "OPT_LINGER")]
    pub opt_linger: Option<String>,

    /// Database connection pool size (default 8)
    #[arg(short = 's', value_name = "SQLNUM")]
    pub sql_num: Option<String>,

    /// Worker thread count (default 8)
    #[arg(short = 't', value_name = "THREADNUM")]
    pub thread_num: Option<String>,

    /// Disable logging: 0 enabled, 1 disabled (default 0)
    #[arg(short = 'c', value_name = "CLOSE_LOG")]
    pub close_log: Option<String>,

    /// Concurrency model: 0 Proactor, 1 Reactor (default 0)
    #[arg(short = 'a', value_name = "ACTORMODEL")]
    pub actor_model: Option<String>,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the listener binds.
    pub port: u16,
    /// Whether the log sink drains on a background thread.
    pub async_log: bool,
    /// Listener socket trigger mode.
    pub listen_mode: TrigMode,
    /// Connection socket trigger mode.
    pub conn_mode: TrigMode,
    /// Whether the listener sets `SO_LINGER`.
    pub opt_linger: bool,
    /// Worker thread count.
    pub worker_threads: usize,
    /// Logging disabled entirely.
    pub close_log: bool,
    /// Proactor or Reactor dispatch.
    pub actor_model: ActorModel,
    /// Directory URL paths resolve under.
    pub doc_root: PathBuf,
    /// Configured log path (a bare name lands in `./serverLogs/`).
    pub log_path: PathBuf,
    /// Database endpoint and pool size.
    pub db: PoolOptions,
}

impl ServerConfig {
    /// Parse the process arguments and environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(&Args::parse())
    }

    /// Resolve `args` plus the environment into a configuration. The three
    /// `WEBSERVER_DB_*` credentials are required; everything else has a
    /// default.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        // Pick up a .env file when present.
        dotenvy::dotenv().ok();

        let user =
            env::var("WEBSERVER_DB_USER").context("WEBSERVER_DB_USER must be set")?;
        let password =
            env::var("WEBSERVER_DB_PASSWD").context("WEBSERVER_DB_PASSWD must be set")?;
        let database =
            env::var("WEBSERVER_DB_NAME").context("WEBSERVER_DB_NAME must be set")?;
        let host = env::var("WEBSERVER_DB_HOST").unwrap_or_else(|_| "localhost".to_owned());
        let db_port = env::var("WEBSERVER_DB_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(3306);
        let doc_root = env::var("WEBSERVER_DOC_ROOT").unwrap_or_else(|_| "./root".to_owned());

        let trig_mode = numeric_flag("-m", &args.trig_mode, 0u8);
        let (listen_mode, conn_mode) = match trig_mode {
            0 => (TrigMode::Level, TrigMode::Level),
            1 => (TrigMode::Level, TrigMode::Edge),
            2 => (TrigMode::Edge, TrigMode::Level),
            3 => (TrigMode::Edge, TrigMode::Edge),
            other => {
                // Config parsing runs before the log sink exists.
                eprintln!("unknown trigger mode {other}, using level-triggered");
                (TrigMode::Level, TrigMode::Level)
            }
        };

        let actor_model = match numeric_flag("-a", &args.actor_model, 0u8) {
            1 => ActorModel::Reactor,
            _ => ActorModel::Proactor,
        };

        Ok(Self {
            port: numeric_flag("-p", &args.port, DEFAULT_PORT),
            async_log: numeric_flag("-l", &args.log_write, 0u8) == 1,
            listen_mode,
            conn_mode,
            opt_linger: numeric_flag("-o", &args.opt_linger, 0u8) == 1,
            worker_threads: numeric_flag("-t", &args.thread_num, DEFAULT_THREADS),
            close_log: numeric_flag("-c", &args.close_log, 0u8) != 0,
            actor_model,
            doc_root: PathBuf::from(doc_root),
            log_path: PathBuf::from("log"),
            db: PoolOptions {
                host,
                port: db_port,
                user,
                password,
                database,
                size: numeric_flag("-s", &args.sql_num, DEFAULT_SQL_CONNS),
            },
        })
    }
}

/// Convert a raw flag value, keeping `default` (with a warning) for inputs
/// that do not start with a digit. Trailing garbage after the digits is
/// dropped, as `atoi` would.
fn numeric_flag<T>(flag: &str, raw: &Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let Some(raw) = raw else {
        return default;
    };
    if !raw.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        // Config parsing runs before the log sink exists; stderr it is.
        eprintln!("invalid value {raw:?} for {flag}: expected a number, keeping default");
        return default;
    }
    let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
    match digits.parse() {
        Ok(value) => value,
        Err(_) => {
            eprintln!("value {raw:?} for {flag} is out of range, keeping default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process environment is shared; serialize tests that touch it.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_db_env<R>(f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("WEBSERVER_DB_USER", "web");
        env::set_var("WEBSERVER_DB_PASSWD", "webpw");
        env::set_var("WEBSERVER_DB_NAME", "webdb");
        f()
    }

    #[test]
    fn test_defaults_apply_without_flags() {
        with_db_env(|| {
            let config = ServerConfig::from_args(&Args::default()).unwrap();
            assert_eq!(config.port, 9006);
            assert!(!config.async_log);
            assert_eq!(config.listen_mode, TrigMode::Level);
            assert_eq!(config.conn_mode, TrigMode::Level);
            assert_eq!(config.db.size, 8);
            assert_eq!(config.worker_threads, 8);
            assert!(!config.close_log);
            assert_eq!(config.actor_model, ActorModel::Proactor);
            assert_eq!(config.db.user, "web");
            assert_eq!(config.db.port, 3306);
        });
    }

    #[test]
    fn test_numeric_flags_are_applied() {
        with_db_env(|| {
            let args = Args {
                port: Some("8080".into()),
                trig_mode: Some("3".into()),
                actor_model: Some("1".into()),
                thread_num: Some("4".into()),
                sql_num: Some("2".into()),
                log_write: Some("1".into()),
                ..Args::default()
            };
            let config = ServerConfig::from_args(&args).unwrap();
            assert_eq!(config.port, 8080);
            assert_eq!(config.listen_mode, TrigMode::Edge);
            assert_eq!(config.conn_mode, TrigMode::Edge);
            assert_eq!(config.actor_model, ActorModel::Reactor);
            assert_eq!(config.worker_threads, 4);
            assert_eq!(config.db.size, 2);
            assert!(config.async_log);
        });
    }

    #[test]
    fn test_non_numeric_flag_keeps_default() {
        with_db_env(|| {
            let args = Args {
                port: Some("not-a-port".into()),
                ..Args::default()
            };
            let config = ServerConfig::from_args(&args).unwrap();
            assert_eq!(config.port, 9006);
        });
    }

    #[test]
    fn test_atoi_style_trailing_garbage_is_dropped() {
        assert_eq!(numeric_flag("-p", &Some("8080x".into()), 1u16), 8080);
        assert_eq!(numeric_flag("-p", &Some("99999999".into()), 7u16), 7);
        assert_eq!(numeric_flag("-p", &None, 42u16), 42);
    }

    #[test]
    fn test_missing_db_credentials_are_fatal() {
        with_db_env(|| {
            env::remove_var("WEBSERVER_DB_USER");
            let err = ServerConfig::from_args(&Args::default()).unwrap_err();
            assert!(err.to_string().contains("WEBSERVER_DB_USER"));
            env::set_var("WEBSERVER_DB_USER", "web");
        });
    }
}
