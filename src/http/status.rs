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

//! HTTP status codes this server ever emits.
//!
//! Limited to the four codes the responder can produce: success, a parse
//! failure, a permission failure, and a missing resource. Anything else a
//! future handler might want is not yet wired up to `ErrorHtml`'s fixed
//! `CODE_PATH` table, so it is left out rather than half-supported.

use std::fmt::Display;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
}

impl Status {
    /// The reason phrase as emitted on the status line.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
        }
    }

    /// The error page path substituted in for non-2xx responses, mirroring
    /// `HttpResponse::CODE_PATH`.
    pub fn error_page(&self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::BadRequest => Some("/400.html"),
            Self::Forbidden => Some("/403.html"),
            Self::NotFound => Some("/404.html"),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u16)
    }
}
