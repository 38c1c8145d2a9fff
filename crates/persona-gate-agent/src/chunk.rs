//! Word-group chunking for the monolithic runner shape.
//!
//! When the runner returns only a final string, the driver synthesizes a
//! stream by splitting it into small word groups. Every byte of the input
//! survives: concatenating the returned chunks reproduces the original
//! text exactly, whitespace and newlines included.

/// Split `text` into word groups of at most `words_per_chunk` words,
/// flushing early after a sentence-ending word.
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words_per_chunk = words_per_chunk.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut word_count = 0;

    for token in tokenize(text) {
        let is_word = !token.chars().all(char::is_whitespace);
        current.push_str(token);

        if is_word {
            word_count += 1;
            let sentence_end = token.ends_with(['.', '!', '?']);
            if word_count >= words_per_chunk || sentence_end {
                chunks.push(std::mem::take(&mut current));
                word_count = 0;
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Alternating runs of whitespace and non-whitespace, covering the whole
/// input.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut prev_is_ws: Option<bool> = None;

    for (i, c) in text.char_indices() {
        let is_ws = c.is_whitespace();
        if let Some(prev) = prev_is_ws {
            if prev != is_ws {
                tokens.push(&text[start..i]);
                start = i;
            }
        }
        prev_is_ws = Some(is_ws);
    }
    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejoin(chunks: &[String]) -> String {
        chunks.concat()
    }

    #[test]
    fn rejoined_chunks_equal_the_input_exactly() {
        let text = "First sentence.  Second one\nhas a newline, and  double  spaces.\n\nDone!";
        let chunks = chunk_words(text, 4);
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn sentence_punctuation_flushes_early() {
        let chunks = chunk_words("A quick test.", 4);
        assert_eq!(chunks, vec!["A quick test."]);
        assert_eq!(rejoin(&chunks), "A quick test.");
    }

    #[test]
    fn groups_at_the_word_limit() {
        let chunks = chunk_words("one two three four five six seven eight", 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "one two three four");
        assert_eq!(chunks[1], " five six seven eight");
    }

    #[test]
    fn mid_text_sentences_split_chunks() {
        let chunks = chunk_words("Hi there. Bye", 4);
        assert_eq!(chunks, vec!["Hi there.", " Bye"]);
    }

    #[test]
    fn leading_and_trailing_whitespace_survive() {
        let text = "  padded  ";
        let chunks = chunk_words(text, 4);
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn empty_input_produces_no_chunks() {
        assert!(chunk_words("", 4).is_empty());
    }

    #[test]
    fn whitespace_only_input_is_one_chunk() {
        let chunks = chunk_words(" \n ", 4);
        assert_eq!(chunks, vec![" \n "]);
    }

    #[test]
    fn zero_word_limit_is_clamped() {
        let chunks = chunk_words("a b", 0);
        assert_eq!(rejoin(&chunks), "a b");
        assert_eq!(chunks, vec!["a", " b"]);
    }
}
