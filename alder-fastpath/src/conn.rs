//! Connection-side interface consumed by the fast path.
//!
//! The HTTP parser and socket I/O live outside this crate; requests
//! arrive through this trait and responses leave through its return
//! methods, mirroring the driver's response primitives.

use std::fs::File;
use std::io;

use alder_base::Time;

pub trait Conn {
    fn method(&self) -> &str;

    /// Request path, percent-decoded.
    fn url(&self) -> &str;

    fn query(&self) -> Option<&str>;

    fn request_header(&self, name: &str) -> Option<String>;

    /// When the connection was accepted.
    fn accept_time(&self) -> Time;

    /// Whether the client advertises gzip support.
    fn accepts_gzip(&self) -> bool {
        self.request_header("accept-encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false)
    }

    fn set_response_header(&mut self, name: &str, value: &str);

    fn return_data(&mut self, status: u16, mime: &str, body: &[u8]) -> io::Result<()>;

    /// Headers only, with an explicit content length (HEAD requests).
    fn return_no_body(&mut self, status: u16, mime: &str, content_length: u64) -> io::Result<()>;

    /// Stream an open descriptor of known length.
    fn return_open_file(
        &mut self,
        status: u16,
        mime: &str,
        file: File,
        content_length: u64,
    ) -> io::Result<()>;

    fn return_not_modified(&mut self) -> io::Result<()>;

    fn return_status(&mut self, status: u16) -> io::Result<()>;

    fn return_redirect(&mut self, location: &str) -> io::Result<()>;

    fn return_not_found(&mut self) -> io::Result<()>;
}
