use crate::config::ChunkingConfig;

const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];
const BREAK_CHARS: [char; 8] = [',', ';', ':', ' ', '，', '；', '：', '　'];

/// Collapses runs of spaces/tabs to one space and runs of blank lines to a
/// single newline, so newlines still mark sentence boundaries.
pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .replace("\r\n", "\n")
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits into sentences ending at `. ! ? 。！？` (terminator kept) or at a newline.
pub fn split_sentences(normalized: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = normalized.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }

        current.push(ch);
        if SENTENCE_TERMINATORS.contains(&ch) {
            while let Some(next) = chars.peek() {
                if SENTENCE_TERMINATORS.contains(next) {
                    current.push(*next);
                    chars.next();
                } else {
                    break;
                }
            }
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Sentence-bounded chunking with sentence overlap between neighbours.
///
/// Output is deterministic for a given input and config; chunks at or below
/// `min_chars` after trimming are dropped.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let max_chars = config.max_chars.max(1);
    let normalized = normalize_whitespace(text);

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for sentence in split_sentences(&normalized) {
        let sentence_len = char_len(&sentence);

        if sentence_len > max_chars {
            if !current.is_empty() {
                chunks.push(current.join(" "));
                current.clear();
            }
            chunks.extend(split_long_sentence(
                &sentence,
                max_chars,
                config.split_overlap_chars,
            ));
            continue;
        }

        if !current.is_empty() && joined_len(&current) + 1 + sentence_len > max_chars {
            chunks.push(current.join(" "));

            let keep_from = current.len().saturating_sub(config.overlap_sentences);
            current.drain(..keep_from);
            while !current.is_empty() && joined_len(&current) + 1 + sentence_len > max_chars {
                current.remove(0);
            }
        }

        current.push(sentence);
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
        .into_iter()
        .filter(|chunk| char_len(chunk.trim()) > config.min_chars)
        .collect()
}

/// Splits one oversized sentence, preferring a break character in the
/// second half of each window, with a fixed character overlap.
fn split_long_sentence(sentence: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());

        if end < chars.len() {
            let floor = start + max_chars / 2;
            if let Some(position) = (floor..end).rev().find(|&index| BREAK_CHARS.contains(&chars[index])) {
                end = position + 1;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap_chars).max(start + 1);
    }

    pieces
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn joined_len(sentences: &[String]) -> usize {
    let chars: usize = sentences.iter().map(|sentence| char_len(sentence)).sum();
    chars + sentences.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(index: usize) -> String {
        format!("Sentence number {index} talks about hydraulic pressure limits in detail.")
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\n\n\nof   spacing\u{a0}here";
        assert_eq!(normalize_whitespace(input), "A lot\nof spacing here");
    }

    #[test]
    fn sentences_keep_terminators_and_split_on_newlines() {
        let sentences = split_sentences("First one. Second?! Third\n第一句。第二句！");
        assert_eq!(
            sentences,
            vec!["First one.", "Second?!", "Third", "第一句。", "第二句！"]
        );
    }

    #[test]
    fn chunks_respect_max_size_and_minimum_length() {
        let text = (0..40).map(sentence).collect::<Vec<_>>().join(" ");
        let config = ChunkingConfig::default();

        let chunks = chunk_text(&text, &config);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let len = chunk.chars().count();
            assert!(len <= config.max_chars, "chunk of {len} chars");
            assert!(chunk.trim().chars().count() > config.min_chars);
        }
    }

    #[test]
    fn neighbouring_chunks_share_overlap_sentences() {
        let text = (0..30).map(sentence).collect::<Vec<_>>().join(" ");
        let config = ChunkingConfig {
            max_chars: 300,
            ..ChunkingConfig::default()
        };

        let chunks = chunk_text(&text, &config);
        let first_sentences = split_sentences(&chunks[0]);
        let tail = &first_sentences[first_sentences.len() - 2..];

        assert!(chunks[1].starts_with(&tail.join(" ")));
    }

    #[test]
    fn short_text_is_discarded() {
        let chunks = chunk_text("Too short to matter.", &ChunkingConfig::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn long_sentence_is_split_at_break_with_char_overlap() {
        let words = (0..120).map(|i| format!("word{i:03}")).collect::<Vec<_>>();
        let long = words.join(", ");
        let config = ChunkingConfig {
            max_chars: 200,
            ..ChunkingConfig::default()
        };

        let chunks = chunk_text(&long, &config);

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[0].chars().count() <= 200);
            assert!(pair[0].ends_with(','), "split should land on a break char");
            let tail: String = pair[0]
                .chars()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(pair[1].contains(tail.trim()));
        }
    }

    #[test]
    fn unbreakable_sentence_splits_at_exact_boundary() {
        let long = "x".repeat(450);
        let config = ChunkingConfig {
            max_chars: 200,
            ..ChunkingConfig::default()
        };

        let chunks = chunk_text(&long, &config);

        assert_eq!(chunks[0].chars().count(), 200);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = (0..25).map(sentence).collect::<Vec<_>>().join("\n");
        let config = ChunkingConfig::default();
        assert_eq!(chunk_text(&text, &config), chunk_text(&text, &config));
    }
}
