//! A `multipart/form-data` body parser.
//!
//! Parts are sliced out of the body without copying. Only `content-disposition` and
//! `content-type` part headers are interpreted.

use bytes::Bytes;
use micro_fetch_core::protocol::FetchError;

use crate::extract::{FormData, FormEntry, FormFile};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_BOUNDARY_LEN: usize = 70;
const DEFAULT_FILE_TYPE: &str = "text/plain";

struct PartHead {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
}

pub(crate) fn parse(body: &Bytes, boundary: &str) -> Result<FormData, FetchError> {
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(FetchError::InvalidFormDataHeader);
    }
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut form = FormData::new();
    let mut pos = find(body, delimiter, 0).ok_or_else(|| invalid("missing opening boundary"))? + delimiter.len();

    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(form);
        }
        pos = skip_padding(body, pos);
        if !body[pos..].starts_with(CRLF) {
            return Err(invalid("boundary is not followed by a line break"));
        }
        pos += CRLF.len();

        let head_end = find(body, HEADER_END, pos).ok_or_else(|| invalid("unterminated part headers"))?;
        let head = parse_head(&body[pos..head_end])?;
        pos = head_end + HEADER_END.len();

        let content_end = find_delimiter(body, delimiter, pos).ok_or_else(|| invalid("unterminated part"))?;
        let content = body.slice(pos..content_end);
        pos = content_end + CRLF.len() + delimiter.len();

        let entry = match head.file_name {
            Some(file_name) => FormEntry::File(FormFile {
                file_name,
                content_type: head.content_type.unwrap_or_else(|| DEFAULT_FILE_TYPE.to_string()),
                bytes: content,
            }),
            None => FormEntry::Text(String::from_utf8_lossy(&content).into_owned()),
        };
        form.append(head.name, entry);
    }
}

fn invalid(reason: &str) -> FetchError {
    FetchError::invalid_form_data(reason)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack.get(from..)?.windows(needle.len()).position(|window| window == needle).map(|i| i + from)
}

/// Position of the CRLF that precedes the next `delimiter`.
fn find_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut search = from;
    loop {
        let at = find(body, CRLF, search)?;
        if body[at + CRLF.len()..].starts_with(delimiter) {
            return Some(at);
        }
        search = at + 1;
    }
}

fn skip_padding(body: &[u8], mut pos: usize) -> usize {
    while matches!(body.get(pos), Some(b' ' | b'\t')) {
        pos += 1;
    }
    pos
}

fn parse_head(raw: &[u8]) -> Result<PartHead, FetchError> {
    let raw = std::str::from_utf8(raw).map_err(|e| FetchError::invalid_form_data(format!("part headers are not utf-8: {e}")))?;

    let mut disposition = None;
    let mut content_type = None;
    for line in raw.split("\r\n") {
        let (name, value) = line.split_once(':').ok_or_else(|| invalid("malformed part header"))?;
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value);
        } else if name.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    let disposition = disposition.ok_or_else(|| invalid("part has no content-disposition"))?;
    let mut params = split_params(disposition).into_iter();
    match params.next() {
        Some(kind) if kind.trim().eq_ignore_ascii_case("form-data") => {}
        _ => return Err(invalid("part disposition is not form-data")),
    }

    let mut name = None;
    let mut file_name = None;
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(unquote(value.trim())),
            "filename" => file_name = Some(unquote(value.trim())),
            _ => {}
        }
    }

    Ok(PartHead { name: name.ok_or_else(|| invalid("part has no name"))?, file_name, content_type })
}

/// Splits on `;` outside of double quotes.
fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&value[start..]);
    params
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => out.extend(chars.next()),
                    c => out.push(c),
                }
            }
            out
        }
        None => value.to_string(),
    }
}
