//! Response body encoding.
//!
//! Picks the exposition format from `Accept`, optionally gzips the output
//! when `Accept-Encoding` allows it, and encodes families one at a time so
//! that a single bad family does not lose the rest of the scrape.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
use tracing::error;

use crate::error::{EncodeError, MultiError};
use crate::pool::BufferPool;

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Content type of the delimited protobuf exposition format.
pub const PROTOBUF_CONTENT_TYPE: &str = prometheus::PROTOBUF_FORMAT;

const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";
const PROTOBUF_MESSAGE: &str = "io.prometheus.client.MetricFamily";

/// Exposition format of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Protobuf,
}

impl Format {
    /// Choose a format from an `Accept` header.
    ///
    /// The supported media range with the highest quality wins, earlier
    /// ranges winning ties. Wildcards select nothing; text is the fallback.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Format::Text;
        };

        let mut best: Option<(f32, Format)> = None;
        for range in accept.split(',') {
            let Some((format, q)) = parse_media_range(range) else {
                continue;
            };
            if q <= 0.0 {
                continue;
            }
            if best.is_none_or(|(best_q, _)| q > best_q) {
                best = Some((q, format));
            }
        }

        best.map(|(_, format)| format).unwrap_or_default()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Text => TEXT_CONTENT_TYPE,
            Format::Protobuf => PROTOBUF_CONTENT_TYPE,
        }
    }

    fn encode_family<W: Write>(self, mf: &MetricFamily, writer: &mut W) -> prometheus::Result<()> {
        let families = std::slice::from_ref(mf);
        match self {
            Format::Text => TextEncoder::new().encode(families, writer),
            Format::Protobuf => ProtobufEncoder::new().encode(families, writer),
        }
    }
}

/// Parse one media range, returning the format it selects and its quality.
fn parse_media_range(range: &str) -> Option<(Format, f32)> {
    let mut parts = range.split(';').map(str::trim);
    let media_type = parts.next()?.to_ascii_lowercase();

    let mut q = 1.0;
    let mut proto = None;
    let mut encoding = None;
    let mut version = None;
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "q" => q = value.parse().unwrap_or(0.0),
            "proto" => proto = Some(value),
            "encoding" => encoding = Some(value),
            "version" => version = Some(value),
            _ => {}
        }
    }

    let format = match media_type.as_str() {
        PROTOBUF_MEDIA_TYPE
            if proto == Some(PROTOBUF_MESSAGE) && encoding == Some("delimited") =>
        {
            Format::Protobuf
        }
        "text/plain" if version.is_none_or(|v| v == "0.0.4") => Format::Text,
        _ => return None,
    };
    Some((format, q))
}

/// Whether an `Accept-Encoding` header allows a gzip response.
pub fn gzip_accepted(accept_encoding: Option<&str>) -> bool {
    accept_encoding.is_some_and(|header| {
        header.split(',').map(str::trim).any(|part| {
            part == "gzip" || part.starts_with("gzip;")
        })
    })
}

/// An encoded response body.
#[derive(Debug)]
pub struct Encoded {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
    /// Families that could not be encoded and were left out of the body.
    pub errors: MultiError<EncodeError>,
}

/// Encode `families` for a request with the given `Accept` and
/// `Accept-Encoding` headers.
///
/// Families failing to encode are logged and skipped. Fails only when
/// encoding produced errors and not a single byte of output.
pub fn encode(
    pool: &BufferPool,
    families: &[MetricFamily],
    accept: Option<&str>,
    accept_encoding: Option<&str>,
) -> Result<Encoded, MultiError<EncodeError>> {
    let format = Format::negotiate(accept);
    let gzip = gzip_accepted(accept_encoding);

    let mut buf = pool.get();
    let mut errors = MultiError::new();
    let mut writer = BodyWriter::new(&mut buf, gzip);

    for mf in families {
        if let Err(source) = format.encode_family(mf, &mut writer) {
            error!(family = mf.get_name(), error = %source, "Failed to encode metric family");
            errors.push(EncodeError::Family {
                family: mf.get_name().to_string(),
                source,
            });
        }
    }

    let written = match writer.finish() {
        Ok(written) => written,
        Err(e) => {
            errors.push(EncodeError::Io(e));
            return Err(errors);
        }
    };

    if written == 0 && !errors.is_empty() {
        return Err(errors);
    }

    // The pooled buffer keeps its capacity for the next scrape.
    Ok(Encoded {
        body: buf.to_vec(),
        content_type: format.content_type(),
        content_encoding: gzip.then_some("gzip"),
        errors,
    })
}

/// Writer counting the uncompressed bytes it is given.
struct BodyWriter<'a> {
    sink: Sink<'a>,
    written: usize,
}

enum Sink<'a> {
    Plain(&'a mut Vec<u8>),
    Gzip(GzEncoder<&'a mut Vec<u8>>),
}

impl<'a> BodyWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, gzip: bool) -> Self {
        let sink = if gzip {
            Sink::Gzip(GzEncoder::new(buf, Compression::default()))
        } else {
            Sink::Plain(buf)
        };
        Self { sink, written: 0 }
    }

    /// Flush any compression trailer and return the uncompressed size.
    fn finish(self) -> io::Result<usize> {
        if let Sink::Gzip(encoder) = self.sink {
            encoder.finish()?;
        }
        Ok(self.written)
    }
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = match &mut self.sink {
            Sink::Plain(buf) => buf.write(data)?,
            Sink::Gzip(encoder) => encoder.write(data)?,
        };
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Plain(_) => Ok(()),
            Sink::Gzip(encoder) => encoder.flush(),
        }
    }
}
