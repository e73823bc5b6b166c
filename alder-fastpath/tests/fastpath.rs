//! Fast-path behavior against a recording connection.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use alder_base::Time;
use alder_fastpath::{Conn, Dispatch, FastPath, FastPathConfig};
use flate2::write::GzEncoder;
use flate2::Compression;

#[derive(Debug, Default)]
struct Response {
    status: Option<u16>,
    mime: Option<String>,
    body: Vec<u8>,
    content_length: Option<u64>,
    redirect: Option<String>,
}

struct TestConn {
    method: String,
    url: String,
    query: Option<String>,
    headers: HashMap<String, String>,
    accept_time: Time,
    response_headers: HashMap<String, String>,
    response: Response,
}

impl TestConn {
    fn get(url: &str) -> Self {
        TestConn {
            method: "GET".to_string(),
            url: url.to_string(),
            query: None,
            headers: HashMap::new(),
            accept_time: Time::now(),
            response_headers: HashMap::new(),
            response: Response::default(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    /// Pretend the connection was accepted later, so fresh fixture
    /// files do not trip the recent-change cache bypass.
    fn accepted_in_the_future(mut self) -> Self {
        self.accept_time = Time::new(Time::now().sec + 100, 0);
        self
    }
}

impl Conn for TestConn {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn request_header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_lowercase()).cloned()
    }

    fn accept_time(&self) -> Time {
        self.accept_time
    }

    fn set_response_header(&mut self, name: &str, value: &str) {
        self.response_headers
            .insert(name.to_string(), value.to_string());
    }

    fn return_data(&mut self, status: u16, mime: &str, body: &[u8]) -> io::Result<()> {
        self.response.status = Some(status);
        self.response.mime = Some(mime.to_string());
        self.response.body = body.to_vec();
        self.response.content_length = Some(body.len() as u64);
        Ok(())
    }

    fn return_no_body(&mut self, status: u16, mime: &str, content_length: u64) -> io::Result<()> {
        self.response.status = Some(status);
        self.response.mime = Some(mime.to_string());
        self.response.content_length = Some(content_length);
        Ok(())
    }

    fn return_open_file(
        &mut self,
        status: u16,
        mime: &str,
        mut file: File,
        content_length: u64,
    ) -> io::Result<()> {
        self.response.status = Some(status);
        self.response.mime = Some(mime.to_string());
        self.response.content_length = Some(content_length);
        file.read_to_end(&mut self.response.body)?;
        Ok(())
    }

    fn return_not_modified(&mut self) -> io::Result<()> {
        self.response.status = Some(304);
        Ok(())
    }

    fn return_status(&mut self, status: u16) -> io::Result<()> {
        self.response.status = Some(status);
        Ok(())
    }

    fn return_redirect(&mut self, location: &str) -> io::Result<()> {
        self.response.status = Some(302);
        self.response.redirect = Some(location.to_string());
        Ok(())
    }

    fn return_not_found(&mut self) -> io::Result<()> {
        self.response.status = Some(404);
        Ok(())
    }
}

fn fastpath_at(root: &Path, config: FastPathConfig) -> FastPath {
    let root = root.to_path_buf();
    FastPath::new(
        config,
        Box::new(move |url: &str| {
            let rel = url.trim_start_matches('/');
            Some(root.join(rel))
        }),
    )
}

fn write_gz(path: &Path, content: &[u8]) {
    let mut enc = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    enc.write_all(content).unwrap();
    enc.finish().unwrap();
}

#[test]
fn serves_regular_files_with_mime() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("style.css"), "body { color: red }").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());

    let mut conn = TestConn::get("/style.css").accepted_in_the_future();
    assert_eq!(fp.dispatch(&mut conn).unwrap(), Dispatch::Done);
    assert_eq!(conn.response.status, Some(200));
    assert_eq!(conn.response.body, b"body { color: red }");
    assert_eq!(conn.response.mime.as_deref(), Some("text/css"));
    assert!(conn.response_headers.contains_key("Last-Modified"));
}

#[test]
fn missing_files_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/nope.html");
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(404));
}

#[test]
fn if_modified_since_returns_304_without_a_body() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("style.css");
    std::fs::write(&path, "x").unwrap();
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    let stamp = httpdate::fmt_http_date(mtime);

    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/style.css")
        .accepted_in_the_future()
        .with_header("if-modified-since", &stamp);
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(304));
    assert!(conn.response.body.is_empty());
}

#[test]
fn if_unmodified_since_returns_412_when_newer() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("doc.html"), "x").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/doc.html")
        .accepted_in_the_future()
        .with_header("if-unmodified-since", "Fri, 01 Jan 2021 00:00:00 GMT");
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(412));
}

#[test]
fn head_sends_headers_and_length_only() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.bin"), vec![7u8; 1234]).unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/big.bin").accepted_in_the_future();
    conn.method = "HEAD".to_string();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(200));
    assert_eq!(conn.response.content_length, Some(1234));
    assert!(conn.response.body.is_empty());
}

#[test]
fn directory_without_slash_redirects_preserving_query() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/index.html"), "index body").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());

    let mut conn = TestConn::get("/docs").accepted_in_the_future();
    conn.query = Some("a=1&b=2".to_string());
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(302));
    assert_eq!(conn.response.redirect.as_deref(), Some("/docs/?a=1&b=2"));
}

#[test]
fn directory_with_slash_serves_the_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/index.html"), "index body").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());

    let mut conn = TestConn::get("/docs/").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(200));
    assert_eq!(conn.response.body, b"index body");
}

#[test]
fn directory_candidates_are_tried_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("d")).unwrap();
    std::fs::write(dir.path().join("d/index.htm"), "htm").unwrap();
    std::fs::write(dir.path().join("d/index.html"), "html").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/d/").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    // index.html precedes index.htm in the default list.
    assert_eq!(conn.response.body, b"html");
}

#[test]
fn directory_without_index_delegates_to_the_listing_hook() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("empty")).unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/empty/").accepted_in_the_future();
    match fp.dispatch(&mut conn).unwrap() {
        Dispatch::DirectoryProc { proc, dir: d } => {
            assert_eq!(proc, "_dirlist");
            assert!(d.ends_with("empty"));
        }
        other => panic!("expected directory proc, got {other:?}"),
    }
}

#[test]
fn gzip_static_is_negotiated() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("app.js");
    std::fs::write(&src, "console.log(1)").unwrap();
    write_gz(&dir.path().join("app.js.gz"), b"console.log(1)");

    let fp = fastpath_at(
        dir.path(),
        FastPathConfig {
            gzip_static: true,
            ..Default::default()
        },
    );

    // A client that accepts gzip gets the compressed body.
    let mut conn = TestConn::get("/app.js")
        .accepted_in_the_future()
        .with_header("accept-encoding", "gzip, br");
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(200));
    assert_eq!(
        conn.response_headers.get("Content-Encoding").map(String::as_str),
        Some("gzip")
    );
    assert_eq!(
        conn.response_headers.get("Vary").map(String::as_str),
        Some("Accept-Encoding")
    );
    assert_ne!(conn.response.body, b"console.log(1)");

    // A client without gzip support gets the plain body.
    let mut plain = TestConn::get("/app.js").accepted_in_the_future();
    fp.dispatch(&mut plain).unwrap();
    assert_eq!(plain.response.body, b"console.log(1)");
    assert!(plain.response_headers.get("Content-Encoding").is_none());
}

#[cfg(unix)]
#[test]
fn stale_gzip_is_refreshed_by_the_helper() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("page.html");
    let gz = dir.path().join("page.html.gz");
    write_gz(&gz, b"stale");
    std::thread::sleep(std::time::Duration::from_millis(1100));
    std::fs::write(&src, "fresh content").unwrap();

    let fp = fastpath_at(
        dir.path(),
        FastPathConfig {
            gzip_static: true,
            gzip_refresh: true,
            // Invoked as: sh -c 'cat "$0" > "$1"' source gz
            gzip_refresh_cmd: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "cat \"$0\" > \"$1\"".to_string(),
            ],
            ..Default::default()
        },
    );

    let mut conn = TestConn::get("/page.html")
        .accepted_in_the_future()
        .with_header("accept-encoding", "gzip");
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(
        conn.response_headers.get("Content-Encoding").map(String::as_str),
        Some("gzip")
    );
    assert_eq!(conn.response.body, b"fresh content");
}

#[test]
fn cache_serves_and_revalidates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");
    std::fs::write(&path, "first").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());

    let mut conn = TestConn::get("/data.txt").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.body, b"first");
    assert_eq!(fp.cache_stats().entries, 1);

    // Change the file; a different size forces an identity mismatch.
    std::fs::write(&path, "second!").unwrap();
    let mut conn = TestConn::get("/data.txt").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.body, b"second!");
    assert_eq!(fp.cache_stats().entries, 1, "entry replaced, not duplicated");
}

#[test]
fn oversized_files_bypass_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("large.bin"), vec![1u8; 4096]).unwrap();
    let fp = fastpath_at(
        dir.path(),
        FastPathConfig {
            cachemaxentry: 1024,
            ..Default::default()
        },
    );
    let mut conn = TestConn::get("/large.bin").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.body.len(), 4096);
    assert_eq!(fp.cache_stats().entries, 0);
}

#[test]
fn recently_changed_files_bypass_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hot.txt"), "just written").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    // Accept time equals now, so the file changed within a second.
    let mut conn = TestConn::get("/hot.txt");
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.body, b"just written");
    assert_eq!(fp.cache_stats().entries, 0);
}

#[test]
fn mmap_delivery_works_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("map.bin"), b"mapped bytes").unwrap();
    let fp = fastpath_at(
        dir.path(),
        FastPathConfig {
            mmap: true,
            cache: false,
            ..Default::default()
        },
    );
    let mut conn = TestConn::get("/map.bin").accepted_in_the_future();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.body, b"mapped bytes");
}

#[test]
fn unsupported_methods_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "x").unwrap();
    let fp = fastpath_at(dir.path(), FastPathConfig::default());
    let mut conn = TestConn::get("/f.txt");
    conn.method = "DELETE".to_string();
    fp.dispatch(&mut conn).unwrap();
    assert_eq!(conn.response.status, Some(404));
}
