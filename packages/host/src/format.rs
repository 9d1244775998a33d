//! File extension → stream factory associations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::IgnoredAny;

use mountdb_core::{Error, Result, StreamType};

/// Knows how to turn the bytes of one file format into a typed stream and
/// back.
pub trait StreamFactory: Send + Sync {
    /// Type of the stream a file of this format carries.
    fn stream_type(&self) -> StreamType;

    /// Validate raw file contents read from disk.
    fn decode(&self, raw: Vec<u8>) -> Result<Bytes>;

    /// Validate stream contents about to be written to disk.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn malformed(format: &str, message: impl fmt::Display) -> Error {
    Error::UnsupportedFormat {
        format: format.to_string(),
        message: message.to_string(),
    }
}

/// Opaque bytes.
pub struct BinaryFactory;

impl StreamFactory for BinaryFactory {
    fn stream_type(&self) -> StreamType {
        StreamType::binary()
    }

    fn decode(&self, raw: Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::from(raw))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// UTF-8 text, tagged with a configurable text-derived type.
pub struct TextFactory {
    stream_type: StreamType,
}

impl TextFactory {
    pub fn new(stream_type: StreamType) -> Self {
        Self { stream_type }
    }

    fn check(&self, data: &[u8]) -> Result<()> {
        std::str::from_utf8(data)
            .map(|_| ())
            .map_err(|e| malformed(self.stream_type.as_str(), e))
    }
}

impl StreamFactory for TextFactory {
    fn stream_type(&self) -> StreamType {
        self.stream_type.clone()
    }

    fn decode(&self, raw: Vec<u8>) -> Result<Bytes> {
        self.check(&raw)?;
        Ok(Bytes::from(raw))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.check(data)?;
        Ok(data.to_vec())
    }
}

/// JSON documents. Empty contents are accepted as a not-yet-written stream.
pub struct JsonFactory;

impl JsonFactory {
    fn check(data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        serde_json::from_slice::<IgnoredAny>(data)
            .map(|_| ())
            .map_err(|e| malformed(StreamType::JSON, e))
    }
}

impl StreamFactory for JsonFactory {
    fn stream_type(&self) -> StreamType {
        StreamType::json()
    }

    fn decode(&self, raw: Vec<u8>) -> Result<Bytes> {
        Self::check(&raw)?;
        Ok(Bytes::from(raw))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Self::check(data)?;
        Ok(data.to_vec())
    }
}

/// XML documents.
///
/// Only the envelope is checked: UTF-8 text that, past an optional byte order
/// mark and surrounding whitespace, starts with `<` and ends with `>`.
pub struct XmlFactory;

impl XmlFactory {
    fn check(data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data).map_err(|e| malformed(StreamType::XML, e))?;
        let body = text.trim_start_matches('\u{feff}').trim();
        if body.is_empty() || (body.starts_with('<') && body.ends_with('>')) {
            Ok(())
        } else {
            Err(malformed(StreamType::XML, "not an XML document"))
        }
    }
}

impl StreamFactory for XmlFactory {
    fn stream_type(&self) -> StreamType {
        StreamType::xml()
    }

    fn decode(&self, raw: Vec<u8>) -> Result<Bytes> {
        Self::check(&raw)?;
        Ok(Bytes::from(raw))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Self::check(data)?;
        Ok(data.to_vec())
    }
}

/// Extension → factory table. Extensions are matched case-insensitively.
#[derive(Clone)]
pub struct FormatTable {
    factories: BTreeMap<String, Arc<dyn StreamFactory>>,
}

impl Default for FormatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FormatTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.factories
                    .iter()
                    .map(|(ext, factory)| (ext, factory.stream_type())),
            )
            .finish()
    }
}

impl FormatTable {
    /// The default associations: `xml`, `json`, `txt`, `cfg` and `bin`.
    pub fn new() -> Self {
        let mut table = Self::empty();
        table.register("xml", XmlFactory);
        table.register("json", JsonFactory);
        table.register("txt", TextFactory::new(StreamType::text()));
        table.register("cfg", TextFactory::new(StreamType::config()));
        table.register("bin", BinaryFactory);
        table
    }

    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Associate `extension` with `factory`, replacing any previous one.
    pub fn register(&mut self, extension: &str, factory: impl StreamFactory + 'static) {
        self.factories
            .insert(extension.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// The factory for a file name, by its extension.
    pub fn for_name(&self, file_name: &str) -> Result<&Arc<dyn StreamFactory>> {
        let extension = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        self.factories
            .get(&extension)
            .ok_or_else(|| Error::UnsupportedFormat {
                message: format!("no stream factory for {}", file_name),
                format: extension,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_associations() {
        let table = FormatTable::new();
        assert_eq!(
            table.extensions().collect::<Vec<_>>(),
            vec!["bin", "cfg", "json", "txt", "xml"]
        );
        assert_eq!(
            table.for_name("settings.cfg").unwrap().stream_type(),
            StreamType::config()
        );
        assert_eq!(
            table.for_name("Layout.XML").unwrap().stream_type(),
            StreamType::xml()
        );
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let table = FormatTable::new();
        for name in ["picture.png", "README"] {
            assert!(matches!(
                table.for_name(name),
                Err(Error::UnsupportedFormat { .. })
            ));
        }
    }

    #[test]
    fn factories_validate_payloads() {
        assert!(XmlFactory.encode(b"<?xml version=\"1.0\"?><a/>").is_ok());
        assert!(XmlFactory.encode(b"  <a/>\n").is_ok());
        assert!(XmlFactory.encode(b"plain text").is_err());

        assert!(JsonFactory.encode(br#"{"a": [1, 2]}"#).is_ok());
        assert!(JsonFactory.encode(b"{").is_err());
        assert!(JsonFactory.decode(Vec::new()).is_ok());

        let text = TextFactory::new(StreamType::text());
        assert!(text.encode("héllo".as_bytes()).is_ok());
        assert!(text.decode(vec![0xff, 0xfe]).is_err());

        assert!(BinaryFactory.decode(vec![0xff, 0x00]).is_ok());
    }

    #[test]
    fn custom_factory_replaces_default() {
        let mut table = FormatTable::new();
        table.register("XML", TextFactory::new(StreamType::new("Markup")));
        assert_eq!(
            table.for_name("a.xml").unwrap().stream_type(),
            StreamType::new("Markup")
        );
    }
}
