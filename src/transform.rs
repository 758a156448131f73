//! Transformations.
//!
//! A transformation is a pure rewriter over a string value, applied before an
//! operator sees the value. [`TransformKind::apply`] returns `None` when the
//! input needs no rewrite, which lets the per-transaction cache record a
//! "no change" outcome and lets consumers keep the original slice.
//!
//! Hash transformations (`t:md5`, `t:sha1`) emit lowercase hex digests; the
//! original emits raw digest bytes, which a UTF-8 value model cannot carry.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use md5::Md5;
use sha1::{Digest, Sha1};

/// Every transformation the engine applies. `t:none` is not listed: the
/// parser consumes it as the ignore-default-transforms switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Base64Decode,
    Base64DecodeExt,
    Base64Encode,
    CmdLine,
    CompressWhiteSpace,
    CssDecode,
    EscapeSeqDecode,
    HexDecode,
    HexEncode,
    HtmlEntityDecode,
    JsDecode,
    Length,
    Lowercase,
    Md5,
    NormalizePath,
    NormalizePathWin,
    ParityEven7Bit,
    ParityOdd7Bit,
    ParityZero7Bit,
    RemoveComments,
    RemoveCommentsChar,
    RemoveNulls,
    RemoveWhitespace,
    ReplaceComments,
    ReplaceNulls,
    Sha1,
    SqlHexDecode,
    Trim,
    TrimLeft,
    TrimRight,
    Uppercase,
    UrlDecode,
    UrlDecodeUni,
    UrlEncode,
    Utf8ToUnicode,
}

const KIND_NAMES: &[(&str, TransformKind)] = &[
    ("base64Decode", TransformKind::Base64Decode),
    ("base64DecodeExt", TransformKind::Base64DecodeExt),
    ("base64Encode", TransformKind::Base64Encode),
    ("cmdLine", TransformKind::CmdLine),
    ("compressWhitespace", TransformKind::CompressWhiteSpace),
    ("compressWhiteSpace", TransformKind::CompressWhiteSpace),
    ("cssDecode", TransformKind::CssDecode),
    ("escapeSeqDecode", TransformKind::EscapeSeqDecode),
    ("hexDecode", TransformKind::HexDecode),
    ("hexEncode", TransformKind::HexEncode),
    ("htmlEntityDecode", TransformKind::HtmlEntityDecode),
    ("jsDecode", TransformKind::JsDecode),
    ("length", TransformKind::Length),
    ("lowercase", TransformKind::Lowercase),
    ("md5", TransformKind::Md5),
    ("normalisePath", TransformKind::NormalizePath),
    ("normalizePath", TransformKind::NormalizePath),
    ("normalisePathWin", TransformKind::NormalizePathWin),
    ("normalizePathWin", TransformKind::NormalizePathWin),
    ("parityEven7bit", TransformKind::ParityEven7Bit),
    ("parityOdd7bit", TransformKind::ParityOdd7Bit),
    ("parityZero7bit", TransformKind::ParityZero7Bit),
    ("removeComments", TransformKind::RemoveComments),
    ("removeCommentsChar", TransformKind::RemoveCommentsChar),
    ("removeNulls", TransformKind::RemoveNulls),
    ("removeWhitespace", TransformKind::RemoveWhitespace),
    ("removeWhiteSpace", TransformKind::RemoveWhitespace),
    ("replaceComments", TransformKind::ReplaceComments),
    ("replaceNulls", TransformKind::ReplaceNulls),
    ("sha1", TransformKind::Sha1),
    ("sqlHexDecode", TransformKind::SqlHexDecode),
    ("trim", TransformKind::Trim),
    ("trimLeft", TransformKind::TrimLeft),
    ("trimRight", TransformKind::TrimRight),
    ("uppercase", TransformKind::Uppercase),
    ("urlDecode", TransformKind::UrlDecode),
    ("urlDecodeUni", TransformKind::UrlDecodeUni),
    ("urlEncode", TransformKind::UrlEncode),
    ("utf8toUnicode", TransformKind::Utf8ToUnicode),
];

impl TransformKind {
    pub fn from_name(name: &str) -> Option<TransformKind> {
        KIND_NAMES.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }

    pub fn name(self) -> &'static str {
        KIND_NAMES.iter().find(|(_, k)| *k == self).map(|(n, _)| *n).unwrap_or("unknown")
    }

    /// Apply the transformation. `None` means the input needs no rewrite.
    pub fn apply(self, input: &str) -> Option<String> {
        match self {
            TransformKind::Base64Decode => base64_decode(input, false),
            TransformKind::Base64DecodeExt => base64_decode(input, true),
            TransformKind::Base64Encode => Some(STANDARD.encode(input.as_bytes())),
            TransformKind::CmdLine => cmd_line(input),
            TransformKind::CompressWhiteSpace => compress_whitespace(input),
            TransformKind::CssDecode => css_decode(input),
            TransformKind::EscapeSeqDecode => escape_seq_decode(input),
            TransformKind::HexDecode => hex_decode(input),
            TransformKind::HexEncode => {
                Some(input.bytes().map(|b| format!("{b:02x}")).collect())
            }
            TransformKind::HtmlEntityDecode => html_entity_decode(input),
            TransformKind::JsDecode => js_decode(input),
            TransformKind::Length => Some(input.len().to_string()),
            TransformKind::Lowercase => {
                changed(input, input.chars().map(|c| c.to_ascii_lowercase()).collect())
            }
            TransformKind::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(input.as_bytes());
                Some(format!("{:x}", hasher.finalize()))
            }
            TransformKind::NormalizePath => normalize_path(input, false),
            TransformKind::NormalizePathWin => normalize_path(input, true),
            TransformKind::ParityEven7Bit => parity(input, Parity::Even),
            TransformKind::ParityOdd7Bit => parity(input, Parity::Odd),
            TransformKind::ParityZero7Bit => parity(input, Parity::Zero),
            TransformKind::RemoveComments => remove_comments(input),
            TransformKind::RemoveCommentsChar => remove_comments_char(input),
            TransformKind::RemoveNulls => changed(input, input.replace('\0', "")),
            TransformKind::RemoveWhitespace => {
                changed(input, input.chars().filter(|c| !c.is_whitespace()).collect())
            }
            TransformKind::ReplaceComments => replace_comments(input),
            TransformKind::ReplaceNulls => changed(input, input.replace('\0', " ")),
            TransformKind::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(input.as_bytes());
                Some(format!("{:x}", hasher.finalize()))
            }
            TransformKind::SqlHexDecode => sql_hex_decode(input),
            TransformKind::Trim => changed(input, input.trim().to_string()),
            TransformKind::TrimLeft => changed(input, input.trim_start().to_string()),
            TransformKind::TrimRight => changed(input, input.trim_end().to_string()),
            TransformKind::Uppercase => {
                changed(input, input.chars().map(|c| c.to_ascii_uppercase()).collect())
            }
            TransformKind::UrlDecode => url_decode(input, false),
            TransformKind::UrlDecodeUni => url_decode(input, true),
            TransformKind::UrlEncode => url_encode(input),
            TransformKind::Utf8ToUnicode => utf8_to_unicode(input),
        }
    }
}

fn changed(input: &str, output: String) -> Option<String> {
    if output == input { None } else { Some(output) }
}

fn base64_decode(input: &str, forgiving: bool) -> Option<String> {
    let cleaned: String = if forgiving {
        input.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')).collect()
    } else {
        input.to_string()
    };
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(cleaned.trim_end_matches('=').as_bytes()))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn compress_whitespace(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut in_ws = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(c);
            in_ws = false;
        }
    }
    changed(input, out)
}

fn url_decode(input: &str, unicode: bool) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                rewritten = true;
                i += 1;
            }
            b'%' => {
                // %uXXXX form first (IIS extension), then %XX.
                if unicode
                    && i + 5 < bytes.len()
                    && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U')
                    && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit)
                {
                    let code = u32::from_str_radix(
                        std::str::from_utf8(&bytes[i + 2..i + 6]).unwrap(),
                        16,
                    )
                    .unwrap();
                    // The low byte carries the character for the common
                    // full-width bypass encodings.
                    out.push((code & 0xff) as u8);
                    rewritten = true;
                    i += 6;
                } else if i + 2 < bytes.len()
                    && bytes[i + 1].is_ascii_hexdigit()
                    && bytes[i + 2].is_ascii_hexdigit()
                {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                    out.push(u8::from_str_radix(hex, 16).unwrap());
                    rewritten = true;
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn url_encode(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rewritten = false;
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
            rewritten = true;
        }
    }
    if rewritten { Some(out) } else { None }
}

fn hex_decode(input: &str) -> Option<String> {
    let hex: Vec<u8> = input.bytes().filter(u8::is_ascii_hexdigit).collect();
    if hex.len() < 2 {
        return None;
    }
    let mut out: Vec<u8> = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        let s = std::str::from_utf8(pair).ok()?;
        out.push(u8::from_str_radix(s, 16).ok()?);
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

fn sql_hex_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        if (bytes[i] == b'0')
            && i + 2 < bytes.len()
            && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let mut j = i + 2;
            while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                j += 1;
            }
            for pair in bytes[i + 2..j].chunks(2) {
                if pair.len() == 2 {
                    let s = std::str::from_utf8(pair).unwrap();
                    out.push(u8::from_str_radix(s, 16).unwrap());
                } else {
                    out.push(pair[0]);
                }
            }
            rewritten = true;
            i = j;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn html_entity_decode(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut rewritten = false;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let end = rest[1..].find(';').map(|i| i + 1);
        let entity = end.map(|e| &rest[1..e]);
        let decoded = entity.and_then(|name| match name {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => {
                let code = name
                    .strip_prefix("#x")
                    .or_else(|| name.strip_prefix("#X"))
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .or_else(|| name.strip_prefix('#').and_then(|d| d.parse().ok()))?;
                char::from_u32(code)
            }
        });

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end.unwrap() + 1..];
                rewritten = true;
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);

    if rewritten { Some(out) } else { None }
}

fn js_decode(input: &str) -> Option<String> {
    decode_backslash(input, true)
}

fn escape_seq_decode(input: &str) -> Option<String> {
    decode_backslash(input, false)
}

fn decode_backslash(input: &str, js: bool) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        rewritten = true;
        match bytes[i + 1] {
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b'a' => {
                out.push(0x07);
                i += 2;
            }
            b'b' => {
                out.push(0x08);
                i += 2;
            }
            b'f' => {
                out.push(0x0c);
                i += 2;
            }
            b'v' => {
                out.push(0x0b);
                i += 2;
            }
            b'x' if i + 3 < bytes.len()
                && bytes[i + 2].is_ascii_hexdigit()
                && bytes[i + 3].is_ascii_hexdigit() =>
            {
                let s = std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap();
                out.push(u8::from_str_radix(s, 16).unwrap());
                i += 4;
            }
            b'u' if js
                && i + 5 < bytes.len()
                && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit) =>
            {
                let code =
                    u32::from_str_radix(std::str::from_utf8(&bytes[i + 2..i + 6]).unwrap(), 16)
                        .unwrap();
                match char::from_u32(code) {
                    Some(_) if code < 0x100 => out.push(code as u8),
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                    None => out.push(b'?'),
                }
                i += 6;
            }
            b'0'..=b'7' => {
                let mut j = i + 1;
                let mut code: u32 = 0;
                while j < bytes.len() && j < i + 4 && (b'0'..=b'7').contains(&bytes[j]) {
                    code = code * 8 + (bytes[j] - b'0') as u32;
                    j += 1;
                }
                out.push((code & 0xff) as u8);
                i = j;
            }
            other => {
                out.push(other);
                i += 2;
            }
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn css_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        // CSS escape: up to six hex digits, optionally followed by one
        // whitespace terminator.
        let mut j = i + 1;
        while j < bytes.len() && j < i + 7 && bytes[j].is_ascii_hexdigit() {
            j += 1;
        }
        if j > i + 1 {
            let code =
                u32::from_str_radix(std::str::from_utf8(&bytes[i + 1..j]).unwrap(), 16).unwrap();
            match char::from_u32(code) {
                Some(_) if code < 0x100 => out.push(code as u8),
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
                None => out.push(b'?'),
            }
            if j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                j += 1;
            }
            rewritten = true;
            i = j;
        } else {
            // Backslash before a non-hex character drops the backslash.
            out.push(bytes[i + 1]);
            rewritten = true;
            i += 2;
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn cmd_line(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;

    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        match c {
            '\\' | '"' | '\'' | '^' => continue,
            ',' | ';' => pending_space = true,
            c if c.is_whitespace() => pending_space = true,
            '/' | '(' => {
                // Whitespace before a slash or open paren is dropped.
                pending_space = false;
                out.push(c);
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    changed(input, out)
}

fn normalize_path(input: &str, windows: bool) -> Option<String> {
    let normalized_slashes =
        if windows { input.replace('\\', "/") } else { input.to_string() };

    let absolute = normalized_slashes.starts_with('/');
    let trailing_slash = normalized_slashes.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in normalized_slashes.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(input.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }

    changed(input, out)
}

#[derive(Clone, Copy)]
enum Parity {
    Even,
    Odd,
    Zero,
}

fn parity(input: &str, parity: Parity) -> Option<String> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    for b in input.bytes() {
        let low = b & 0x7f;
        let ones = low.count_ones();
        let high = match parity {
            Parity::Zero => 0,
            Parity::Even => {
                if ones % 2 == 0 {
                    0
                } else {
                    0x80
                }
            }
            Parity::Odd => {
                if ones % 2 == 0 {
                    0x80
                } else {
                    0
                }
            }
        };
        out.push(low | high);
    }
    let rewritten = out.as_slice() != input.as_bytes();
    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn remove_comments(input: &str) -> Option<String> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            rewritten = true;
            match input[i + 2..].find("*/") {
                Some(end) => i += end + 4,
                None => break,
            }
        } else if bytes[i] == b'-' && i + 1 < bytes.len() && bytes[i + 1] == b'-' {
            rewritten = true;
            break;
        } else if bytes[i] == b'#' {
            rewritten = true;
            break;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn remove_comments_char(input: &str) -> Option<String> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut rewritten = false;

    while i < bytes.len() {
        let two = if i + 1 < bytes.len() { &bytes[i..i + 2] } else { &bytes[i..i + 1] };
        match two {
            b"/*" | b"*/" | b"--" => {
                rewritten = true;
                i += 2;
            }
            _ if bytes[i] == b'#' => {
                rewritten = true;
                i += 1;
            }
            _ => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    if rewritten { Some(String::from_utf8_lossy(&out).into_owned()) } else { None }
}

fn replace_comments(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut rewritten = false;

    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        out.push(' ');
        rewritten = true;
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);

    if rewritten { Some(out) } else { None }
}

fn utf8_to_unicode(input: &str) -> Option<String> {
    if input.is_ascii() {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let code = c as u32;
            if code <= 0xffff {
                out.push_str(&format!("%u{code:04x}"));
            } else {
                // Outside the BMP: emit a surrogate pair the way IIS does.
                let v = code - 0x10000;
                out.push_str(&format!("%u{:04x}%u{:04x}", 0xd800 + (v >> 10), 0xdc00 + (v & 0x3ff)));
            }
        }
    }
    Some(out)
}
