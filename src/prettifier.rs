//! Condenses the JIT's `JitDisasm` listing into a per-method view.
//!
//! The raw format looks like:
//!
//! ```text
//! ; Assembly listing for method Program:MyMethod()
//! ; Emitting BLENDED_CODE for X64 with AVX - Windows
//!
//! G_M42249_IG01:
//!        0F1F440000       nop
//!
//! G_M42249_IG02:
//!        B82A000000       mov eax, 42
//!        C3               ret
//!
//! ; Total bytes of code 11, prolog size 5, PerfScore 3.50, instruction count 3
//! ; ============================================================
//! ```
//!
//! Comment blocks are dropped, code blocks are kept in order, and each method gets a
//! `; Method` header and a `; Total bytes of code:` trailer. Anything unexpected falls
//! back to the untouched listing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::ParseIntError;
use thiserror::Error;

const METHOD_MARKER: &str = "; Assembly listing for method ";
const TOTAL_BYTES_MARKER: &str = "; Total bytes of code ";

/// Where the listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrettifyMode {
    /// Output of the loader app or an AOT compiler: the listing starts with a method marker.
    #[default]
    Listing,
    /// Output of the user's own app: its stdout may precede the first method marker.
    RunApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Comment,
    Code,
}

/// A finished, immutable run of same-kind lines inside one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    method_name: String,
    kind: BlockKind,
    text: String,
}

impl Block {
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Accumulates lines for a block; [`BlockBuilder::finish`] consumes it.
#[derive(Debug)]
struct BlockBuilder {
    method_name: String,
    kind: BlockKind,
    text: String,
}

impl BlockBuilder {
    fn new(method_name: &str, kind: BlockKind, first_line: &str) -> Self {
        let mut text = String::with_capacity(64);
        text.push('\n');
        text.push_str(first_line);
        text.push('\n');
        Self {
            method_name: method_name.to_string(),
            kind,
            text,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn accepts(&self, method_name: &str, kind: BlockKind) -> bool {
        self.kind == kind && self.method_name == method_name
    }

    fn finish(self) -> Block {
        Block {
            method_name: self.method_name,
            kind: self.kind,
            text: self.text,
        }
    }
}

/// One method's code blocks plus the size from its trailer comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    pub name: String,
    pub code_blocks: Vec<Block>,
    pub total_bytes: u64,
}

#[derive(Debug, Error)]
enum FormatDrift {
    #[error("line {line:?} appears before any '{METHOD_MARKER}' marker")]
    MissingMethodMarker { line: String },

    #[error("method {method} has no '{TOTAL_BYTES_MARKER}' trailer")]
    MissingTotalBytes { method: String },

    #[error("method {method}: cannot parse code size {text:?}")]
    InvalidTotalBytes {
        method: String,
        text: String,
        #[source]
        source: ParseIntError,
    },
}

/// Condense a raw listing. With `minimal_comments == false` the listing is returned as is.
///
/// Never fails: unrecognized input is logged and returned unchanged.
pub fn prettify(raw: &str, minimal_comments: bool, mode: PrettifyMode) -> String {
    if !minimal_comments {
        return raw.to_string();
    }

    match scan_blocks(raw, mode).and_then(collect_methods) {
        Ok(methods) => render(&methods),
        Err(err) => {
            tracing::warn!("disassembly output format may have changed, showing it raw: {err}");
            raw.to_string()
        }
    }
}

fn scan_blocks(raw: &str, mode: PrettifyMode) -> Result<Vec<Block>, FormatDrift> {
    let mut blocks = Vec::new();
    let mut current: Option<BlockBuilder> = None;
    let mut method: Option<&str> = None;

    for line in raw.split(['\r', '\n', '\t']).filter(|l| !l.is_empty()) {
        if let Some(name) = line.strip_prefix(METHOD_MARKER) {
            method = Some(name);
        }
        let Some(method_name) = method else {
            match mode {
                PrettifyMode::RunApp => continue,
                PrettifyMode::Listing => {
                    return Err(FormatDrift::MissingMethodMarker {
                        line: line.to_string(),
                    })
                }
            }
        };

        let kind = if line.starts_with(';') {
            BlockKind::Comment
        } else if line.trim().is_empty() {
            continue;
        } else {
            BlockKind::Code
        };
        let forced_reset = kind == BlockKind::Code && is_label(line);

        match current.as_mut() {
            Some(block) if !forced_reset && block.accepts(method_name, kind) => {
                block.push_line(line)
            }
            _ => {
                if let Some(done) = current.take() {
                    blocks.push(done.finish());
                }
                current = Some(BlockBuilder::new(method_name, kind, line));
            }
        }
    }

    if let Some(done) = current {
        blocks.push(done.finish());
    }
    Ok(blocks)
}

/// `^\w+:`
fn is_label(line: &str) -> bool {
    let word_len = line
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(line.len());
    word_len > 0 && line[word_len..].starts_with(':')
}

fn collect_methods(blocks: Vec<Block>) -> Result<Vec<MethodRecord>, FormatDrift> {
    let mut order: Vec<(String, Vec<Block>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for block in blocks {
        match index.get(block.method_name()) {
            Some(&i) => order[i].1.push(block),
            None => {
                index.insert(block.method_name.clone(), order.len());
                order.push((block.method_name.clone(), vec![block]));
            }
        }
    }

    order
        .into_iter()
        .map(|(name, blocks)| {
            let total_bytes = parse_method_total_size(&name, &blocks)?;
            let code_blocks = blocks
                .into_iter()
                .filter(|b| b.kind == BlockKind::Code)
                .collect();
            Ok(MethodRecord {
                name,
                code_blocks,
                total_bytes,
            })
        })
        .collect()
}

/// Size from the `; Total bytes of code N, ...` trailer in the method's last comment block.
fn parse_method_total_size(method: &str, blocks: &[Block]) -> Result<u64, FormatDrift> {
    let missing = || FormatDrift::MissingTotalBytes {
        method: method.to_string(),
    };
    let trailer = blocks
        .iter()
        .rev()
        .find(|b| b.kind == BlockKind::Comment)
        .ok_or_else(missing)?;
    let start = trailer.text.find(TOTAL_BYTES_MARKER).ok_or_else(missing)? + TOTAL_BYTES_MARKER.len();
    let rest = &trailer.text[start..];
    let size = match rest.find([',', '\n']) {
        Some(end) => &rest[..end],
        None => rest,
    };
    size.trim()
        .parse::<u64>()
        .map_err(|source| FormatDrift::InvalidTotalBytes {
            method: method.to_string(),
            text: size.to_string(),
            source,
        })
}

fn render(methods: &[MethodRecord]) -> String {
    let mut out = String::new();
    for method in methods {
        out.push_str("; Method ");
        out.push_str(&method.name);
        for block in &method.code_blocks {
            out.push_str(&block.text);
        }
        out.push_str("; Total bytes of code: ");
        out.push_str(&method.total_bytes.to_string());
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_METHODS: &str = "\
; Assembly listing for method Program:Foo()
; Emitting BLENDED_CODE for X64 with AVX - Windows
; optimized code

G_M1_IG01:
       nop
G_M1_IG02:
       mov      eax, 42
       ret

; Total bytes of code 76, prolog size 5, PerfScore 41.52, instruction count 3
; ============================================================

; Assembly listing for method Program:Bar()
; optimized code

G_M2_IG01:
       xor      eax, eax
       ret

; Total bytes of code 12
";

    #[test]
    fn condenses_each_method() {
        let out = prettify(TWO_METHODS, true, PrettifyMode::Listing);
        let expected = "\
; Method Program:Foo()
G_M1_IG01:
       nop

G_M1_IG02:
       mov      eax, 42
       ret
; Total bytes of code: 76

; Method Program:Bar()
G_M2_IG01:
       xor      eax, eax
       ret
; Total bytes of code: 12

";
        assert_eq!(out, expected);
    }

    #[test]
    fn method_headers_follow_first_seen_order() {
        let out = prettify(TWO_METHODS, true, PrettifyMode::Listing);
        let headers: Vec<&str> = out.lines().filter(|l| l.starts_with("; Method ")).collect();
        assert_eq!(headers, ["; Method Program:Foo()", "; Method Program:Bar()"]);
        assert!(!out.contains("PerfScore"));
        assert!(!out.contains("optimized code"));
    }

    #[test]
    fn comments_requested_means_passthrough() {
        assert_eq!(prettify(TWO_METHODS, false, PrettifyMode::Listing), TWO_METHODS);
    }

    #[test]
    fn unknown_format_is_returned_unchanged() {
        let raw = "Unhandled exception. System.IO.FileNotFoundException\n   at Program.Main()\n";
        assert_eq!(prettify(raw, true, PrettifyMode::Listing), raw);
        assert_eq!(prettify("", true, PrettifyMode::Listing), "");
    }

    #[test]
    fn unparsable_trailer_falls_back_to_raw() {
        let raw = "; Assembly listing for method A:B()\nG_IG01:\n       ret\n; Total bytes of code lots\n";
        assert_eq!(prettify(raw, true, PrettifyMode::Listing), raw);

        let no_trailer = "; Assembly listing for method A:B()\nG_IG01:\n       ret\n";
        assert_eq!(prettify(no_trailer, true, PrettifyMode::Listing), no_trailer);
    }

    #[test]
    fn run_mode_skips_app_output_before_first_method() {
        let raw = format!("Hello from Main\n42\n{TWO_METHODS}");
        assert_eq!(prettify(&raw, true, PrettifyMode::Listing), raw);

        let out = prettify(&raw, true, PrettifyMode::RunApp);
        assert!(out.starts_with("; Method Program:Foo()"));
        assert!(!out.contains("Hello from Main"));
    }

    #[test]
    fn labels_always_start_a_new_block() {
        let blocks = scan_blocks(TWO_METHODS, PrettifyMode::Listing).unwrap();
        let code: Vec<&Block> = blocks.iter().filter(|b| b.kind() == BlockKind::Code).collect();
        assert_eq!(code.len(), 3);
        assert!(code[0].text().starts_with("\nG_M1_IG01:"));
        assert!(code[1].text().starts_with("\nG_M1_IG02:"));
        assert_eq!(code[2].method_name(), "Program:Bar()");
    }

    #[test]
    fn blocks_never_span_methods() {
        let blocks = scan_blocks(TWO_METHODS, PrettifyMode::Listing).unwrap();
        let bar_start = blocks
            .iter()
            .position(|b| b.text().contains("listing for method Program:Bar()"))
            .unwrap();
        assert_eq!(blocks[bar_start].method_name(), "Program:Bar()");
        assert!(!blocks[bar_start].text().contains("Total bytes of code 76"));
    }

    #[test]
    fn label_detection() {
        assert!(is_label("G_M42249_IG01:"));
        assert!(is_label("RWD00:  \tdq\t0000000000000000h"));
        assert!(!is_label("       mov      eax, 42"));
        assert!(!is_label(":nope"));
        assert!(!is_label("call [rax]"));
    }
}
