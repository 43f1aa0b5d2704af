//! Runtime configuration.
//!
//! Options are read from the environment once at Van start, mirroring the
//! deployment convention of the surrounding parameter-server launcher.

use std::env;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Use the shared-memory bypass for co-located peers.
    /// Env: `BYTEPS_ENABLE_IPC`. Default: false.
    pub enable_ipc: bool,
    /// Number of IPC copy worker threads.
    /// Env: `BYTEPS_IPC_COPY_NUM_THREADS`. Default: 4.
    pub ipc_copy_threads: usize,
    /// Perform IPC value copies on the worker pool instead of the send path.
    /// Env: `BYTEPS_IPC_ENABLE_ASYNC_COPY`. Default: true.
    pub ipc_async_copy: bool,
    /// Shared-memory partition stride before page rounding.
    /// Env: `BYTEPS_PARTITION_BYTES`. Default: 4_096_000.
    pub partition_bytes: usize,
    /// Number of co-located processes sharing a partition group.
    /// Env: `BYTEPS_LOCAL_SIZE`. Default: 8.
    pub local_size: usize,
    /// Optional source address for CM bind and resolve.
    /// Env: `DMLC_NODE_HOST`.
    pub node_host: Option<String>,
    /// Role string of this process ("worker", "server", "scheduler").
    /// Env: `DMLC_ROLE`.
    pub role: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_ipc: false,
            ipc_copy_threads: 4,
            ipc_async_copy: true,
            partition_bytes: 4_096_000,
            local_size: 8,
            node_host: None,
            role: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            enable_ipc: env_flag("BYTEPS_ENABLE_IPC", defaults.enable_ipc),
            ipc_copy_threads: env_num("BYTEPS_IPC_COPY_NUM_THREADS", defaults.ipc_copy_threads),
            ipc_async_copy: env_flag("BYTEPS_IPC_ENABLE_ASYNC_COPY", defaults.ipc_async_copy),
            partition_bytes: env_num("BYTEPS_PARTITION_BYTES", defaults.partition_bytes),
            local_size: env_num("BYTEPS_LOCAL_SIZE", defaults.local_size),
            node_host: env::var("DMLC_NODE_HOST").ok(),
            role: env::var("DMLC_ROLE").ok(),
        }
    }

    /// True when this process is a server (stores tensors, answers pulls).
    pub fn is_server(&self) -> bool {
        self.role.as_deref() == Some("server")
    }

    /// Partition stride rounded up so `local_size` processes tile whole
    /// pages.
    pub fn partition_bytes_aligned(&self, page_size: usize) -> usize {
        crate::encoding::align_ceil(self.partition_bytes, self.local_size * page_size)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v.trim().parse::<i64>().map(|n| n != 0).unwrap_or(default),
        Err(_) => default,
    }
}

fn env_num(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment access is process-global, so all env-dependent assertions
    // live in this single test.
    #[test]
    fn env_parsing() {
        for name in [
            "BYTEPS_ENABLE_IPC",
            "BYTEPS_IPC_COPY_NUM_THREADS",
            "BYTEPS_IPC_ENABLE_ASYNC_COPY",
            "BYTEPS_PARTITION_BYTES",
            "BYTEPS_LOCAL_SIZE",
            "DMLC_NODE_HOST",
            "DMLC_ROLE",
        ] {
            env::remove_var(name);
        }

        let cfg = Config::from_env();
        assert!(!cfg.enable_ipc);
        assert_eq!(cfg.ipc_copy_threads, 4);
        assert!(cfg.ipc_async_copy);
        assert_eq!(cfg.partition_bytes, 4_096_000);
        assert_eq!(cfg.local_size, 8);
        assert!(cfg.node_host.is_none());
        assert!(!cfg.is_server());

        env::set_var("BYTEPS_ENABLE_IPC", "1");
        env::set_var("BYTEPS_IPC_COPY_NUM_THREADS", "2");
        env::set_var("BYTEPS_IPC_ENABLE_ASYNC_COPY", "0");
        env::set_var("BYTEPS_PARTITION_BYTES", "1048576");
        env::set_var("BYTEPS_LOCAL_SIZE", "4");
        env::set_var("DMLC_ROLE", "server");

        let cfg = Config::from_env();
        assert!(cfg.enable_ipc);
        assert_eq!(cfg.ipc_copy_threads, 2);
        assert!(!cfg.ipc_async_copy);
        assert_eq!(cfg.partition_bytes, 1_048_576);
        assert_eq!(cfg.local_size, 4);
        assert!(cfg.is_server());

        // bad values fall back to defaults
        env::set_var("BYTEPS_PARTITION_BYTES", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.partition_bytes, 4_096_000);

        for name in [
            "BYTEPS_ENABLE_IPC",
            "BYTEPS_IPC_COPY_NUM_THREADS",
            "BYTEPS_IPC_ENABLE_ASYNC_COPY",
            "BYTEPS_PARTITION_BYTES",
            "BYTEPS_LOCAL_SIZE",
            "DMLC_ROLE",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn partition_alignment() {
        let cfg = Config {
            partition_bytes: 4_096_000,
            local_size: 8,
            ..Config::default()
        };
        // 8 * 4096 = 32768; 4_096_000 = 125 * 32768 exactly.
        assert_eq!(cfg.partition_bytes_aligned(4096), 4_096_000);

        let cfg = Config {
            partition_bytes: 4_000_000,
            local_size: 8,
            ..Config::default()
        };
        let aligned = cfg.partition_bytes_aligned(4096);
        assert!(aligned >= 4_000_000);
        assert_eq!(aligned % (8 * 4096), 0);
    }
}
