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

//! Representation of the request's HTTP version.

use std::fmt::Display;

use crate::error::ParseError;

/// HTTP/2 and HTTP/3 are out of scope; any other token is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(token: &[u8]) -> Result<Self, ParseError> {
        match token {
            b"1.0" => Ok(Self::Http10),
            b"1.1" => Ok(Self::Http11),
            _ => Err(ParseError::Version),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_1_1() {
        assert_eq!(Version::parse(b"1.1"), Ok(Version::Http11));
    }

    #[test]
    fn rejects_http2() {
        assert_eq!(Version::parse(b"2"), Err(ParseError::Version));
    }
}
