//! Directive & comment handling (§4.16).
//!
//! Runs before lexing proper: strips `#`-to-newline comments (a `#` inside a
//! quoted string or regex literal is not a comment start) and excises
//! `key=value` directive tokens whose key is a known time/pagination
//! keyword, recording the removed byte ranges (in original-source
//! coordinates) so parser error offsets can be mapped back for editor
//! highlighting.

const DIRECTIVE_KEYS: &[&str] = &[
    "reverse",
    "start",
    "end",
    "last",
    "limit",
    "pos",
    "source_start",
    "source_end",
    "ingest_start",
    "ingest_end",
];

/// A `[start, end)` byte range removed from the original source, in
/// original-source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub start: usize,
    pub end: usize,
}

pub struct Preprocessed {
    pub text: String,
    removals: Vec<Removal>,
}

impl Preprocessed {
    /// Maps a byte offset in the stripped text back to the original source
    /// by adding back the length of every removal preceding it.
    pub fn map_offset(&self, stripped_offset: usize) -> usize {
        let mut original = stripped_offset;
        for removal in &self.removals {
            if removal.start <= original {
                original += removal.end - removal.start;
            }
        }
        original
    }
}

/// Single pass over the original source: copies bytes into the output
/// unless they fall inside a comment or a directive token, tracking both
/// kinds of removal in original-source coordinates. Quoted strings and
/// regex literals are copied through verbatim (and exempted from directive
/// detection) so a `#`, `key=value`-shaped substring, etc. inside one is
/// left untouched.
pub fn preprocess(source: &str) -> Preprocessed {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut removals = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let rest = &source[i..];
        let c = rest.chars().next().unwrap();

        match c {
            '"' | '\'' => {
                let quote = c;
                let start = i;
                out.push(c);
                i += 1;
                while i < bytes.len() {
                    let ch = source[i..].chars().next().unwrap();
                    out.push(ch);
                    i += ch.len_utf8();
                    if ch == '\\' {
                        if let Some(escaped) = source[i..].chars().next() {
                            out.push(escaped);
                            i += escaped.len_utf8();
                        }
                        continue;
                    }
                    if ch == quote {
                        break;
                    }
                }
                let _ = start;
            }
            '/' if matches!(rest[1..].chars().next(), Some(n) if n != '/' && !n.is_whitespace()) =>
            {
                out.push(c);
                i += 1;
                while i < bytes.len() {
                    let ch = source[i..].chars().next().unwrap();
                    out.push(ch);
                    i += ch.len_utf8();
                    if ch == '\\' {
                        if let Some(escaped) = source[i..].chars().next() {
                            out.push(escaped);
                            i += escaped.len_utf8();
                        }
                        continue;
                    }
                    if ch == '/' {
                        break;
                    }
                }
            }
            '#' => {
                let start = i;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                removals.push(Removal { start, end: i });
            }
            _ if is_directive_start(source, i) => {
                let key = DIRECTIVE_KEYS
                    .iter()
                    .find(|k| rest.starts_with(**k) && rest.as_bytes().get(k.len()) == Some(&b'='))
                    .unwrap();
                let start = i;
                let mut end = i + key.len() + 1;
                while end < bytes.len() && !bytes[end].is_ascii_whitespace() {
                    end += 1;
                }
                removals.push(Removal { start, end });
                i = end;
            }
            _ => {
                out.push(c);
                i += c.len_utf8();
            }
        }
    }

    Preprocessed { text: out, removals }
}

fn is_directive_start(source: &str, idx: usize) -> bool {
    let rest = &source[idx..];
    let boundary = match source[..idx].chars().next_back() {
        None => true,
        Some(c) => !(c.is_alphanumeric() || c == '_'),
    };
    boundary
        && DIRECTIVE_KEYS
            .iter()
            .any(|k| rest.starts_with(*k) && rest.as_bytes().get(k.len()) == Some(&b'='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_comment() {
        let out = preprocess("error # trailing comment\nwarn").text;
        assert_eq!(out, "error \nwarn");
    }

    #[test]
    fn hash_inside_quotes_is_not_a_comment() {
        let out = preprocess(r#""a#b" AND c"#).text;
        assert_eq!(out, r#""a#b" AND c"#);
    }

    #[test]
    fn hash_inside_regex_is_not_a_comment() {
        let out = preprocess("/a#b/ AND c").text;
        assert_eq!(out, "/a#b/ AND c");
    }

    #[test]
    fn excises_known_directive() {
        let pre = preprocess("error limit=50 AND warn");
        assert_eq!(pre.text, "error  AND warn");
        assert!(!pre.text.contains("limit"));
    }

    #[test]
    fn directive_only_query_is_valid_after_strip() {
        let pre = preprocess("limit=50");
        assert_eq!(pre.text, "");
    }

    #[test]
    fn unknown_key_value_is_not_excised() {
        let pre = preprocess("status=200");
        assert!(pre.text.contains("status=200"));
    }

    #[test]
    fn offset_maps_back_through_directive_removal() {
        let pre = preprocess("limit=50 error");
        // "error" starts at byte 6 in the stripped text ("      error"
        // becomes " error" after the directive is excised: one leading
        // space remains from the original, so "error" is at offset 1).
        let stripped_offset = pre.text.find("error").unwrap();
        let original_offset = pre.map_offset(stripped_offset);
        assert_eq!(&"limit=50 error"[original_offset..original_offset + 5], "error");
    }
}
