//! Sentence splitting and char-safe slicing helpers

/// Split text into sentences.
///
/// Terminators are `.`, `!` and `?` followed by whitespace or end of input.
/// Blank lines also end a sentence. Terminators are kept.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }

        let mut chars = trimmed.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if matches!(c, '.' | '!' | '?') && at_boundary {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }

        if !current.is_empty() && !current.ends_with(' ') {
            current.push(' ');
        }
    }

    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }

    sentences
}

/// The first `n` characters of `text`
pub fn prefix_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The last `n` characters of `text`
pub fn suffix_chars(text: &str, n: usize) -> &str {
    let total = text.chars().count();
    if n >= total {
        return text;
    }
    match text.char_indices().nth(total - n) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Cut `prefix` back to its last sentence end.
///
/// Falls back to the last whitespace, then to the raw prefix, when no
/// boundary lies in the second half of the prefix.
pub fn cut_at_sentence_boundary(prefix: &str) -> &str {
    let half = prefix.len() / 2;
    let bytes = prefix.as_bytes();

    let sentence_end = prefix
        .char_indices()
        .filter(|&(idx, c)| {
            let next_is_space = bytes
                .get(idx + 1)
                .map_or(true, |b| b.is_ascii_whitespace());
            (matches!(c, '.' | '!' | '?') && next_is_space) || c == '\n'
        })
        .map(|(idx, c)| idx + c.len_utf8())
        .filter(|&end| end >= half)
        .last();

    if let Some(end) = sentence_end {
        return &prefix[..end];
    }

    match prefix.rfind(char::is_whitespace) {
        Some(idx) if idx >= half => &prefix[..idx],
        _ => prefix,
    }
}

/// Lowercased word terms of at least three characters, minus stop words
pub fn query_terms(text: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "the", "and", "for", "are", "was", "were", "with", "that", "this", "what", "when",
        "where", "which", "who", "how", "why", "from", "about", "into", "have", "has", "had",
        "does", "did", "can", "could", "would", "should", "you", "your", "our", "their", "its",
        "not", "but", "all", "any", "some",
    ];

    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}
