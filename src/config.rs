// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line configuration.
//!
//! Mirrors the construction parameters of the original `WebServer` (port,
//! trigger mode, timeout, linger, database connection, pool sizes, worker
//! count, logging), gathered here instead of a long constructor argument
//! list.

use clap::Parser;

use crate::error::ServerError;

/// Server configuration, parsed from the command line.
#[derive(Debug, Parser)]
#[command(name = "warden", about = "Single-reactor HTTP/1.1 file server")]
pub struct Config {
    /// TCP port to listen on, must be in `1024..=65535`.
    #[arg(long, default_value_t = 9190)]
    pub port: u16,

    /// Readiness trigger mode: 0 = level/level, 1 = level/edge,
    /// 2 = edge/level, 3 = edge/edge (listener/connection).
    #[arg(long, default_value_t = 3)]
    pub trigger_mode: u8,

    /// Idle-connection eviction timeout in milliseconds. `0` disables
    /// eviction entirely.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: i64,

    /// Enable `SO_LINGER{onoff=1, linger=1}` on the listening socket.
    #[arg(long, default_value_t = false)]
    pub linger: bool,

    /// Database host.
    #[arg(long, default_value = "127.0.0.1")]
    pub db_host: String,

    /// Database port.
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Database user.
    #[arg(long, default_value = "root")]
    pub db_user: String,

    /// Database password.
    #[arg(long, default_value = "")]
    pub db_password: String,

    /// Database name.
    #[arg(long, default_value = "webserver")]
    pub db_name: String,

    /// Number of pre-connected database handles held by the pool.
    #[arg(long, default_value_t = 8)]
    pub conn_pool_size: usize,

    /// Number of worker threads draining the reactor's task queue.
    #[arg(long, default_value_t = 4)]
    pub worker_count: usize,

    /// `tracing-subscriber` env-filter directive, e.g. `warden=debug`.
    #[arg(long, default_value = "warden=info")]
    pub log_filter: String,
}

/// Upper bound on simultaneously open connections.
pub const MAX_FD: usize = 65536;

/// Resolved, validated readiness trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    /// `true` if the listening socket should be armed edge-triggered.
    pub listen_edge: bool,
    /// `true` if connection sockets should be armed edge-triggered.
    pub conn_edge: bool,
}

impl Config {
    /// Validates the configuration, returning the fatal-startup error this
    /// violates if any.
    pub fn validate(&self) -> Result<(), ServerError> {
        if !(1024..=65535).contains(&self.port) {
            return Err(ServerError::PortOutOfRange(self.port));
        }
        Ok(())
    }

    /// Resolves `trigger_mode` into listener/connection edge flags. Unknown
    /// modes behave as mode 3 (edge/edge), matching the original's
    /// `default:` fallthrough.
    pub fn trigger(&self) -> TriggerConfig {
        match self.trigger_mode {
            0 => TriggerConfig { listen_edge: false, conn_edge: false },
            1 => TriggerConfig { listen_edge: false, conn_edge: true },
            2 => TriggerConfig { listen_edge: true, conn_edge: false },
            _ => TriggerConfig { listen_edge: true, conn_edge: true },
        }
    }
}
