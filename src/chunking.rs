/// Default upper bound on chunk length, in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// URL of the page this chunk was scraped from
    pub url: String,
}

/// Split page text into chunks tagged with their source URL
pub fn split_into_chunks(text: &str, url: &str, max_chars: usize) -> Vec<TextChunk> {
    wrap_text(text, max_chars)
        .into_iter()
        .map(|text| TextChunk {
            text,
            url: url.to_string(),
        })
        .collect()
}

/// Wrap text into segments of at most `max_chars` characters.
///
/// Segments break on whitespace runs. Whitespace inside a segment is kept as-is,
/// whitespace at a break is dropped (leading whitespace of the very first segment
/// survives). A word longer than `max_chars` gets a segment of its own and is
/// split at character boundaries.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let width = max_chars.max(1);
    let mut tokens = tokenize(text);
    tokens.reverse();

    let mut lines: Vec<String> = Vec::new();

    while !tokens.is_empty() {
        let mut line: Vec<&str> = Vec::new();
        let mut line_len = 0;

        if !lines.is_empty() && tokens.last().is_some_and(|t| is_blank(t)) {
            tokens.pop();
        }

        while let Some(token) = tokens.last() {
            let len = char_len(token);
            if line_len + len <= width {
                line.push(token);
                line_len += len;
                tokens.pop();
            } else {
                break;
            }
        }

        // Only an oversize word can stall an empty line
        if line.is_empty() {
            if let Some(token) = tokens.pop() {
                let split = byte_offset(token, width);
                let (head, tail) = token.split_at(split);
                line.push(head);
                if !tail.is_empty() {
                    tokens.push(tail);
                }
            }
        }

        if line.last().is_some_and(|t| is_blank(t)) {
            line.pop();
        }

        if !line.is_empty() {
            lines.push(line.concat());
        }
    }

    lines
}

/// Alternating whitespace and non-whitespace runs
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space: Option<bool> = None;

    for (idx, ch) in text.char_indices() {
        let space = ch.is_whitespace();
        match in_space {
            Some(prev) if prev != space => {
                tokens.push(&text[start..idx]);
                start = idx;
            }
            _ => {}
        }
        in_space = Some(space);
    }
    if start < text.len() {
        tokens.push(&text[start..]);
    }

    tokens
}

fn is_blank(token: &str) -> bool {
    token.chars().all(char::is_whitespace)
}

fn char_len(token: &str) -> usize {
    token.chars().count()
}

fn byte_offset(token: &str, chars: usize) -> usize {
    token
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(token.len())
}
