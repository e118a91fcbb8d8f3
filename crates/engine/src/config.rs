//! Configuration file parser.
//!
//! Line-oriented `KEY=VALUE` format with `#` comments. The first pair on
//! a line roots any further pairs on the same line, which is how
//! multi-attribute descriptor entries are written:
//!
//! ```text
//! SCR_COPY_TYPE=XOR
//! CKPT=0 INTERVAL=1 TYPE=XOR SET_SIZE=8
//! CKPT=1 INTERVAL=10 TYPE=PARTNER
//! ```
//!
//! Keys are case-insensitive and stored upper-case.

use std::path::Path;

use kvtree::KvTree;

use crate::ScrError;

fn split_token(token: &str, lineno: usize) -> Result<(String, &str), ScrError> {
    let (key, value) = token.split_once('=').ok_or_else(|| {
        ScrError::ConfigInvalid(format!(
            "line {lineno}: expected KEY=VALUE, found '{token}'"
        ))
    })?;
    if key.is_empty() || value.is_empty() {
        return Err(ScrError::ConfigInvalid(format!(
            "line {lineno}: empty key or value in '{token}'"
        )));
    }
    Ok((key.to_ascii_uppercase(), value))
}

/// Parses configuration text into a tree.
pub fn parse(text: &str) -> Result<KvTree, ScrError> {
    let mut tree = KvTree::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };

        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };
        let (key, value) = split_token(first, lineno + 1)?;
        let root = tree.set_kv(key, value);
        for token in tokens {
            let (key, value) = split_token(token, lineno + 1)?;
            root.set_kv(key, value);
        }
    }
    Ok(tree)
}

/// Reads and parses a configuration file; a missing file is an empty
/// tree.
pub fn read(path: &Path) -> Result<KvTree, ScrError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(KvTree::new()),
        Err(source) => Err(fileio::FileIoError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_pairs_and_descriptor_lines() {
        let tree = parse(
            "# system defaults\n\
             SCR_CACHE_SIZE=2\n\
             ckpt=0 interval=1 type=XOR set_size=4  # inline comment\n\
             CKPT=1 INTERVAL=10 TYPE=PARTNER\n",
        )
        .unwrap();

        assert_eq!(tree.get_str("SCR_CACHE_SIZE"), Some("2"));
        let first = tree.get_kv("CKPT", "0").unwrap();
        assert_eq!(first.get_str("TYPE"), Some("XOR"));
        assert_eq!(first.get_str("SET_SIZE"), Some("4"));
        let second = tree.get_kv("CKPT", "1").unwrap();
        assert_eq!(second.get_str("INTERVAL"), Some("10"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(parse("JUSTAKEY\n").is_err());
        assert!(parse("KEY=\n").is_err());
    }
}
