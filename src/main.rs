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

//! CLI entry point: parses configuration, opens the database handle pool,
//! and starts the reactor.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden::config::Config;
use warden::db::{DbHandlePool, MysqlHandle};
use warden::error::ServerError;
use warden::reactor::Reactor;

fn main() -> ExitCode {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "server exited with a fatal startup error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(config: Config) -> Result<(), ServerError> {
    config.validate()?;

    let source_root = resource_root();
    tracing::info!(?source_root, port = config.port, "starting warden");

    let db_pool = open_db_pool(&config)?;
    let mut reactor = Reactor::new(&config, source_root, db_pool)?;
    reactor.run();
}

/// `<cwd>/resources/`, the root static files are served from.
fn resource_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join("resources")
}

/// Opens `conn_pool_size` connections up front and hands them to a fresh
/// [`DbHandlePool`]. Any single connection failure is fatal at startup,
/// matching the original's "DB init failure" exit path.
fn open_db_pool(config: &Config) -> Result<DbHandlePool<MysqlHandle>, ServerError> {
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(config.db_host.clone()))
        .tcp_port(config.db_port)
        .user(Some(config.db_user.clone()))
        .pass(Some(config.db_password.clone()))
        .db_name(Some(config.db_name.clone()));

    let mut handles = Vec::with_capacity(config.conn_pool_size);
    for _ in 0..config.conn_pool_size {
        let handle = MysqlHandle::connect(opts.clone().into()).map_err(ServerError::DbPoolInit)?;
        handles.push(handle);
    }
    Ok(DbHandlePool::new(handles))
}
