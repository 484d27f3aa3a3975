//! Reassembly of tokens split across several TXT records.
//!
//! A token longer than one TXT string is published as numbered chunks:
//!
//! ```text
//! 01:eyJhbGciOiJFUzI1NiJ9.eyJlbmRwb2ludCI6
//! 02:Imh0dHBzOi8vaXNzdWVyLmV4YW1wbGUuY29tIn0.c2ln
//! ```
//!
//! Numbering starts at `00` or `01`. Chunks are concatenated in index order up to the
//! first gap. Nothing here is trusted; a badly assembled token simply fails verification.

use std::collections::BTreeMap;

/// Highest chunk index accepted (two decimal digits).
const MAX_CHUNK_INDEX: u8 = 99;

/// Parses a `NN:<chunk>` record, returning the index and the chunk.
fn parse_chunk(record: &str) -> Option<(u8, &str)> {
    let (index, chunk) = record.split_once(':')?;
    if index.len() != 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if chunk.is_empty() || chunk.contains(':') {
        return None;
    }
    let index: u8 = index.parse().ok()?;
    (index <= MAX_CHUNK_INDEX).then_some((index, chunk))
}

/// Reassembles chunked records into a single candidate token.
///
/// Returns `None` when no record looks like a chunk.
pub(crate) fn reassemble<S: AsRef<str>>(records: &[S]) -> Option<String> {
    let mut chunks: BTreeMap<u8, &str> = BTreeMap::new();
    for record in records {
        if let Some((index, chunk)) = parse_chunk(record.as_ref().trim()) {
            chunks.insert(index, chunk);
        }
    }

    let first = if chunks.contains_key(&0) { 0 } else { 1 };
    let mut token = String::new();
    for index in first..=MAX_CHUNK_INDEX {
        match chunks.get(&index) {
            Some(chunk) => token.push_str(chunk),
            None => break,
        }
    }

    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_one_based_chunks_in_index_order() {
        let records = ["02:bbb", "unrelated", "01:aaa", "03:ccc"];
        assert_eq!(reassemble(&records).as_deref(), Some("aaabbbccc"));
    }

    #[test]
    fn joins_zero_based_chunks() {
        let records = ["01:bbb", "00:aaa"];
        assert_eq!(reassemble(&records).as_deref(), Some("aaabbb"));
    }

    #[test]
    fn stops_at_first_gap() {
        let records = ["01:aaa", "02:bbb", "04:ddd"];
        assert_eq!(reassemble(&records).as_deref(), Some("aaabbb"));
    }

    #[test]
    fn ignores_non_chunk_records() {
        let records = ["eyJ.eyJ.sig", "1:x", "001:x", "ab:x", "01:", "01:a:b"];
        assert_eq!(reassemble(&records), None);
        assert_eq!(reassemble::<&str>(&[]), None);
    }

    #[test]
    fn missing_first_chunk_yields_nothing() {
        let records = ["02:bbb", "03:ccc"];
        assert_eq!(reassemble(&records), None);
    }
}
