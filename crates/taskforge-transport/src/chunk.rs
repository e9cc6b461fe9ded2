/// Split text into chunks of at most `max_len` bytes, preferring newline
/// boundaries, then word boundaries; a hard cut only when a single line/word
/// exceeds half the limit.
pub fn split_chunks(text: &str, max_len: usize) -> Vec<String> {
    let mut src = text.trim();
    if src.is_empty() {
        return Vec::new();
    }
    let limit = max_len.max(256);
    let mut chunks = Vec::new();

    while !src.is_empty() {
        if src.len() <= limit {
            chunks.push(src.to_string());
            break;
        }

        let window_end = floor_char_boundary(src, limit + 1);
        let window = &src[..window_end];
        let mut cut = window.rfind('\n').unwrap_or(0);
        if cut < limit / 2 {
            cut = window.rfind(' ').unwrap_or(0);
        }
        if cut < limit / 2 {
            cut = floor_char_boundary(src, limit);
        }

        let chunk = src[..cut].trim();
        if chunk.is_empty() {
            let hard = floor_char_boundary(src, limit);
            chunks.push(src[..hard].to_string());
            src = src[hard..].trim_start();
        } else {
            chunks.push(chunk.to_string());
            src = src[cut..].trim_start();
        }
    }

    chunks
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(split_chunks("", 3500).is_empty());
        assert!(split_chunks("   \n  ", 3500).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = split_chunks("hello world", 3500);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let line = "x".repeat(200);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text, 256);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 256, "chunk too long: {}", chunk.len());
            assert!(!chunk.starts_with('\n'));
        }
        assert_eq!(chunks.join(" ").split_whitespace().count(), 3);
    }

    #[test]
    fn falls_back_to_word_boundaries() {
        let words = vec!["word"; 200].join(" ");
        let chunks = split_chunks(&words, 256);
        for chunk in &chunks {
            assert!(chunk.len() <= 256);
            assert!(!chunk.ends_with(' '));
        }
        let total: usize = chunks.iter().map(|c| c.split_whitespace().count()).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn hard_cut_for_unbroken_text() {
        let blob = "y".repeat(1000);
        let chunks = split_chunks(&blob, 256);
        assert!(chunks.len() >= 4);
        let total: usize = chunks.iter().map(String::len).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn limit_is_clamped_to_minimum() {
        let blob = "z".repeat(600);
        let chunks = split_chunks(&blob, 10);
        for chunk in &chunks {
            assert!(chunk.len() <= 256);
        }
    }

    #[test]
    fn respects_utf8_boundaries() {
        let blob = "é".repeat(300);
        let chunks = split_chunks(&blob, 256);
        for chunk in &chunks {
            assert!(chunk.len() <= 256);
        }
        assert_eq!(chunks.concat(), blob);
    }
}
