#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
}

/// Byte offset `n` characters after `byte_pos`, capped at the end of `text`.
fn advance_chars(text: &str, byte_pos: usize, n: usize) -> usize {
    text[byte_pos..]
        .char_indices()
        .nth(n)
        .map(|(offset, _)| byte_pos + offset)
        .unwrap_or(text.len())
}

/// Byte offset `n` characters before `byte_pos`, floored at 0.
fn retreat_chars(text: &str, byte_pos: usize, n: usize) -> usize {
    if n == 0 {
        return byte_pos;
    }
    text[..byte_pos]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(offset, _)| offset)
        .unwrap_or(0)
}

/// Split `text` into chunks of at most `max_chunk_size` characters, each
/// starting `overlap` characters before the previous one ended.
pub fn chunk_text(text: &str, max_chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let max_chunk_size = max_chunk_size.max(1);
    let overlap = overlap.min(max_chunk_size - 1);

    if text.chars().count() <= max_chunk_size {
        return vec![TextChunk {
            text: text.to_string(),
            chunk_index: 0,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut chunk_index = 0;

    while start < text.len() {
        let end = advance_chars(text, start, max_chunk_size);

        let actual_end = if end < text.len() {
            find_break_point(text, start, end)
        } else {
            end
        };

        let chunk_text = text[start..actual_end].trim().to_string();
        if !chunk_text.is_empty() {
            chunks.push(TextChunk {
                text: chunk_text,
                chunk_index,
            });
            chunk_index += 1;
        }

        if actual_end >= text.len() {
            break;
        }

        let next_start = retreat_chars(text, actual_end, overlap);
        start = if next_start <= start { actual_end } else { next_start };
    }

    chunks
}

/// Latest natural boundary in the back half of `start..max_end`:
/// paragraph, then line, then sentence, then word.
fn find_break_point(text: &str, start: usize, max_end: usize) -> usize {
    let segment = &text[start..max_end];
    let min_pos = segment.len() / 2;

    let candidates: [&str; 7] = ["\n\n", "\n", "؟ ", ". ", "? ", "! ", " "];
    for sentinel in candidates {
        if let Some(pos) = segment.rfind(sentinel) {
            if pos >= min_pos {
                return start + pos + sentinel.len();
            }
        }
    }
    max_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("  Tawhid  ", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Tawhid");
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text(" \n ", 100, 10).is_empty());
    }

    #[test]
    fn test_chunks_respect_character_limit() {
        let text = "La sourate Al-Fatiha est l'ouverture du Coran. ".repeat(60);
        let chunks = chunk_text(&text, 200, 40);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.text.chars().count() <= 200);
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let first = "Premier paragraphe sur la prière. ".repeat(4);
        let second = "Second paragraphe sur l'aumône. ".repeat(4);
        let text = format!("{}\n\n{}", first.trim(), second.trim());
        let chunks = chunk_text(&text, first.len() + 20, 0);
        assert_eq!(chunks[0].text, first.trim());
        assert!(chunks[1].text.starts_with("Second paragraphe"));
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let text = (0..100).map(|i| format!("mot{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = chunk_text(&text, 100, 30);
        assert!(chunks.len() > 2);
        let first_tail: String = chunks[0].text.split(' ').last().unwrap().to_string();
        assert!(chunks[1].text.contains(&first_tail));
    }

    #[test]
    fn test_arabic_text_chunking() {
        let text = "بسم الله الرحمن الرحيم. الحمد لله رب العالمين. ".repeat(30);
        let chunks = chunk_text(&text, 80, 15);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
            assert!(chunk.text.chars().count() <= 80);
        }
    }

    #[test]
    fn test_unbroken_text_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text.len(), 50);
    }

    #[test]
    fn test_overlap_larger_than_chunk_terminates() {
        let text = "a b c d e f g h i j k l m n o p q r s t u v w x y z ".repeat(10);
        let chunks = chunk_text(&text, 10, 500);
        assert!(!chunks.is_empty());
    }
}
