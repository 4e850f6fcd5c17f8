use bytes::Bytes;
use micro_fetch_core::protocol::FetchError;
use mime::Mime;
use tracing::debug;

use crate::extract::{FromBody, multipart};

/// A file part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormEntry {
    Text(String),
    File(FormFile),
}

impl FormEntry {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormEntry::Text(text) => Some(text),
            FormEntry::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FormFile> {
        match self {
            FormEntry::File(file) => Some(file),
            FormEntry::Text(_) => None,
        }
    }
}

/// Ordered name/entry pairs decoded from a `multipart/form-data` or
/// `application/x-www-form-urlencoded` body. Names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    entries: Vec<(String, FormEntry)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<S: Into<String>>(&mut self, name: S, entry: FormEntry) {
        self.entries.push((name.into(), entry));
    }

    /// The first entry named `name`.
    pub fn get(&self, name: &str) -> Option<&FormEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, entry)| entry)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormEntry> + 'a {
        self.entries.iter().filter(move |(n, _)| n == name).map(|(_, entry)| entry)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for FormData {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        let entries = pairs.into_iter().map(|(name, value)| (name, FormEntry::Text(value))).collect();
        Self { entries }
    }
}

impl FromBody for FormData {
    fn from_body(bytes: Bytes, content_type: Option<&str>) -> Result<Self, FetchError> {
        let content_type = content_type.ok_or(FetchError::InvalidFormDataHeader)?;
        let mime: Mime = content_type.parse().map_err(|e| {
            debug!(content_type, cause = %e, "unparseable form data content type");
            FetchError::InvalidFormDataHeader
        })?;

        if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
            let boundary = mime.get_param(mime::BOUNDARY).ok_or(FetchError::InvalidFormDataHeader)?;
            return multipart::parse(&bytes, boundary.as_str());
        }

        if mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(&bytes).map_err(FetchError::invalid_form_data)?;
            return Ok(pairs.into_iter().collect());
        }

        Err(FetchError::InvalidFormDataHeader)
    }
}
