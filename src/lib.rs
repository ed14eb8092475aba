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

//! `warden` is a single-reactor HTTP/1.1 file server: one thread multiplexes
//! socket readiness with [`mio`], a fixed worker pool does the per-connection
//! parsing/response-building work, static files are served via zero-copy
//! `mmap`, and a tiny login/register pair of endpoints verify credentials
//! against a pooled database connection.
//!
//! The binary entry point lives in `src/main.rs`; this library exposes the
//! pieces it wires together so they can be tested and benchmarked in
//! isolation.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod http;
pub mod reactor;
pub mod timer;
pub mod worker;
