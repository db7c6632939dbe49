//! Loader for the textual LS-8 program format
//!
//! Each line is blank, a `#` comment, or a base-2 byte literal with an
//! optional trailing comment:
//!
//! ```text
//! 10000010 # LDI r0, 8
//! ```
//!
//! Bytes are laid out in file order, starting at address 0.

use anyhow::{bail, Context, Result};

/// Parses program source into the byte image to load at address 0
pub fn parse(source: &str) -> Result<Vec<u8>> {
    let mut image = vec![];
    for (n, line) in source.lines().enumerate() {
        let s = match line.split_once('#') {
            Some((code, _comment)) => code,
            None => line,
        }
        .trim();
        if s.is_empty() {
            continue;
        }
        let v = u8::from_str_radix(s, 2).with_context(|| {
            format!("line {}: invalid byte literal {s:?}", n + 1)
        })?;
        image.push(v);
    }
    if image.len() > ls8::RAM_SIZE {
        bail!(
            "program is {} bytes, but RAM is only {} bytes",
            image.len(),
            ls8::RAM_SIZE
        );
    }
    Ok(image)
}
