/// Token estimation fallback used when the generation backend exposes no
/// tokenizer. Rule of thumb: ~1.3 tokens per whitespace-separated word.
/// Never reports less than 1 so budget math stays well-defined.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    ((words as f64 * 1.3).ceil() as usize).max(1)
}
