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

//! Builds the status line, headers, and mmap-backed body for a request.

use std::fs::File;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::buffer::Buffer;
use crate::http::status::Status;

/// Suffix → MIME type, with `text/plain` as the fallback for anything not
/// listed here.
const SUFFIX_TYPE: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Builds and writes an HTTP/1.1 response for one request onto `buf`,
/// holding an mmap of the served file (if any) for the duration of the
/// write.
pub struct Response {
    source_root: PathBuf,
    path: String,
    keep_alive: bool,
    code: Option<Status>,
    mapped: Option<Mmap>,
}

impl Response {
    pub fn new(source_root: PathBuf) -> Self {
        Self { source_root, path: String::new(), keep_alive: false, code: None, mapped: None }
    }

    /// Resets the response for a new request, unmapping any previously
    /// mapped file first.
    pub fn init(&mut self, path: String, keep_alive: bool, code: Option<Status>) {
        self.unmap_file();
        self.path = path;
        self.keep_alive = keep_alive;
        self.code = code;
    }

    pub fn unmap_file(&mut self) {
        self.mapped = None;
    }

    /// The mapped file body, if a file is currently mapped.
    pub fn file_bytes(&self) -> Option<&[u8]> {
        self.mapped.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.mapped.as_ref().map_or(0, |m| m.len())
    }

    /// Resolves `self.path` under `source_root`, rejecting any path that
    /// escapes it via a `..` component. Returns `None` for a rejected path,
    /// which the caller treats the same as a missing file (404).
    fn resolve_path(&self) -> Option<PathBuf> {
        let relative = self.path.trim_start_matches('/');
        if Path::new(relative).components().any(|c| matches!(c, Component::ParentDir | Component::RootDir)) {
            return None;
        }
        Some(self.source_root.join(relative))
    }

    /// Runs the full pipeline: resolve path, stat, pick a status, swap in
    /// an error page on failure, then emit the status line, headers, and
    /// body into `buf`.
    ///
    /// Stat-based classification (steps 1-4) only runs when the caller
    /// passed in a tentative `200` (or left the code unset) — a parse
    /// failure already carries a definitive code (e.g. `400`) and a path
    /// that was never resolved against anything real, so it goes straight
    /// to that code's fixed error page instead of stat'ing garbage.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        let mut code = self.code.unwrap_or(Status::Ok);

        if code == Status::Ok {
            let resolved = self.resolve_path();
            let metadata = resolved.as_ref().and_then(|p| std::fs::metadata(p).ok());
            match (&resolved, &metadata) {
                (None, _) | (_, None) => {
                    debug!(path = %self.path, "stat failed or path rejected, serving 404");
                    code = Status::NotFound;
                }
                (Some(_), Some(meta)) if meta.is_dir() => {
                    debug!(path = %self.path, "path is a directory, serving 404");
                    code = Status::NotFound;
                }
                (Some(_), Some(meta)) if !world_readable(meta) => {
                    debug!(path = %self.path, "path not world-readable, serving 403");
                    code = Status::Forbidden;
                }
                _ => {}
            }
        }

        if let Some(error_page) = code.error_page() {
            self.path = error_page.to_string();
        }
        self.code = Some(code);

        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    fn add_status_line(&self, buf: &mut Buffer) {
        let code = self.code.unwrap_or(Status::BadRequest);
        let _ = write!(buf, "HTTP/1.1 {} {}\r\n", code as u16, code.reason());
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            let _ = write!(buf, "Connection: keep-alive\r\n");
            let _ = write!(buf, "keep-alive: max=6, timeout=120\r\n");
        } else {
            let _ = write!(buf, "Connection: close\r\n");
        }
        let _ = write!(buf, "Content-type: {}\r\n", self.file_type());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let Some(resolved) = self.resolve_path() else {
            return self.error_content(buf, "File NotFound!");
        };

        let file = match File::open(&resolved) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "open failed after stat succeeded");
                return self.error_content(buf, "File NotFound!");
            }
        };

        // SAFETY: the file is opened read-only for the lifetime of the
        // mapping, which is torn down by `unmap_file` before any remap.
        match unsafe { Mmap::map(&file) } {
            Ok(mmap) => {
                let _ = write!(buf, "Content-length: {}\r\n\r\n", mmap.len());
                self.mapped = Some(mmap);
            }
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "mmap failed");
                self.error_content(buf, "File NotFound!");
            }
        }
    }

    fn error_content(&mut self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(Status::BadRequest);
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>warden</em></body></html>",
            code as u16,
            code.reason(),
            message,
        );
        let _ = write!(buf, "Content-length: {}\r\n\r\n", body.len());
        let _ = buf.write_all(body.as_bytes());
    }

    fn file_type(&self) -> &'static str {
        let Some(idx) = self.path.rfind('.') else { return "text/plain" };
        let suffix = &self.path[idx..];
        SUFFIX_TYPE.iter().find(|(s, _)| *s == suffix).map_or("text/plain", |(_, mime)| mime)
    }
}

#[cfg(unix)]
fn world_readable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o004 != 0
}

#[cfg(not(unix))]
fn world_readable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn tempdir_with(files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("warden-test-{}-{}", std::process::id(), files.len()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            let mut f = File::create(dir.join(name)).unwrap();
            f.write_all(contents.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn serves_existing_file_with_200() {
        let root = tempdir_with(&[("index.html", "hello")]);
        let mut resp = Response::new(root);
        resp.init("/index.html".to_string(), false, Some(Status::Ok));
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        let out = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(resp.file_bytes(), Some(b"hello".as_slice()));
    }

    #[test]
    fn missing_file_becomes_404() {
        let root = tempdir_with(&[]);
        let mut resp = Response::new(root);
        resp.init("/nope.html".to_string(), false, Some(Status::Ok));
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        let out = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn path_traversal_is_rejected_as_404() {
        let root = tempdir_with(&[("index.html", "hello")]);
        let mut resp = Response::new(root);
        resp.init("/../../etc/passwd".to_string(), false, Some(Status::Ok));
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        let out = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn unknown_suffix_falls_back_to_text_plain() {
        let root = tempdir_with(&[("data.bin", "x")]);
        let mut resp = Response::new(root);
        resp.init("/data.bin".to_string(), false, Some(Status::Ok));
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        let out = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(out.contains("Content-type: text/plain\r\n"));
    }

    #[test]
    fn keep_alive_headers_are_present_when_requested() {
        let root = tempdir_with(&[("index.html", "hi")]);
        let mut resp = Response::new(root);
        resp.init("/index.html".to_string(), true, Some(Status::Ok));
        let mut buf = Buffer::new(256);
        resp.make_response(&mut buf);
        let out = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(out.contains("keep-alive: max=6, timeout=120\r\n"));
    }
}
