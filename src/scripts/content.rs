use sha2::{Digest, Sha256};

/// Content address of a script body.
pub fn checksum(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

/// Keep at most `max_chars` characters of `output`, dropping from the front.
///
/// The tail of a script's output is where failures show up. Counting is by
/// character, never splitting a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> &str {
    if output.len() <= max_chars {
        return output;
    }
    if max_chars == 0 {
        return "";
    }
    match output.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &output[idx..],
        None => output,
    }
}
