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

//! Error taxonomy for the server.
//!
//! Startup failures are fatal and map to a non-zero process exit code.
//! Per-connection failures never propagate out of a worker task; the worker
//! decides close-or-rearm locally and only the close/rearm outcome crosses
//! back to the reactor (see `connection` and `reactor`).

use std::io;

use thiserror::Error;

/// Fatal errors that can occur while bringing the server up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `port` was outside the `[1024, 65535]` range.
    #[error("port {0} out of range 1024..=65535")]
    PortOutOfRange(u16),

    /// Binding or listening on the configured port failed.
    #[error("failed to bind/listen: {0}")]
    Bind(#[source] io::Error),

    /// Registering the listener (or a connection) with the readiness
    /// facility failed.
    #[error("failed to register with readiness facility: {0}")]
    Registration(#[source] io::Error),

    /// The database connection pool could not be initialized.
    #[error("database pool init failed: {0}")]
    DbPoolInit(#[source] crate::db::DbError),
}

/// Errors that can occur while parsing a request off the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in the method token, or unrecognized method.
    #[error("invalid token in method")]
    Method,
    /// Invalid byte in the request target.
    #[error("invalid token in target")]
    Target,
    /// Invalid or unsupported HTTP version.
    #[error("invalid version")]
    Version,
}

/// `Result` alias for parser operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
