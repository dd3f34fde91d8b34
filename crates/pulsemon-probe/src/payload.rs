// Probe payload batches.
//
// Every payload starts with `{prefix}-{index}-` and is padded with random
// alphanumerics up to its target size. The index doubles as the sequence number
// used for ordering checks and makes payloads in a batch pairwise distinct.
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::collections::HashSet;
use rand::distributions::Alphanumeric;

#[derive(Clone, Debug)]
pub struct PayloadBatch {
    prefix: String,
    payloads: Vec<Bytes>,
}

impl PayloadBatch {
    /// Build `count` payloads for each entry of `sizes`, indexed in order.
    ///
    /// A size smaller than the header yields a payload that is exactly the
    /// header.
    pub fn generate(prefix: &str, sizes: &[usize], count: usize) -> Self {
        let mut rng = rand::thread_rng();
        let mut payloads = Vec::with_capacity(sizes.len() * count);
        let mut index = 0u64;
        for &size in sizes {
            for _ in 0..count {
                let header = format!("{prefix}-{index}-");
                let mut buf = BytesMut::with_capacity(size.max(header.len()));
                buf.put_slice(header.as_bytes());
                let fill = size.saturating_sub(header.len());
                buf.extend((&mut rng).sample_iter(Alphanumeric).take(fill));
                payloads.push(buf.freeze());
                index += 1;
            }
        }
        Self {
            prefix: prefix.to_string(),
            payloads,
        }
    }

    /// Wrap caller-built payloads. They must carry `prefix` headers for
    /// ordering to be judged; a batch with repeated content is refused when
    /// measured.
    pub fn from_payloads(prefix: &str, payloads: Vec<Bytes>) -> Self {
        Self {
            prefix: prefix.to_string(),
            payloads,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn payloads(&self) -> &[Bytes] {
        &self.payloads
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.payloads.iter()
    }

    /// Position of the first payload whose content already appeared earlier.
    pub fn first_duplicate(&self) -> Option<usize> {
        let mut seen = HashSet::with_capacity(self.payloads.len());
        self.payloads.iter().position(|payload| !seen.insert(payload))
    }
}

/// Extract the sequence index from a payload carrying a `{prefix}-{index}-` header.
pub fn parse_index(prefix: &str, payload: &[u8]) -> Option<u64> {
    let rest = payload.strip_prefix(prefix.as_bytes())?.strip_prefix(b"-")?;
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || rest.get(digits) != Some(&b'-') {
        return None;
    }
    std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_indexes_across_sizes_and_pads() {
        let batch = PayloadBatch::generate("messageid", &[16, 64], 3);
        assert_eq!(batch.len(), 6);
        let lengths: Vec<usize> = batch.iter().map(|p| p.len()).collect();
        assert_eq!(lengths, vec![16, 16, 16, 64, 64, 64]);
        let indices: Vec<Option<u64>> = batch
            .iter()
            .map(|p| parse_index(batch.prefix(), p))
            .collect();
        assert_eq!(
            indices,
            vec![Some(0), Some(1), Some(2), Some(3), Some(4), Some(5)]
        );
    }

    #[test]
    fn generated_payloads_are_distinct() {
        let batch = PayloadBatch::generate("messageid", &[12, 12], 50);
        let unique: HashSet<&Bytes> = batch.iter().collect();
        assert_eq!(unique.len(), batch.len());
    }

    #[test]
    fn first_duplicate_points_at_the_repeat() {
        let batch = PayloadBatch::from_payloads(
            "messageid",
            vec![
                Bytes::from_static(b"messageid-0-a"),
                Bytes::from_static(b"messageid-1-b"),
                Bytes::from_static(b"messageid-0-a"),
            ],
        );
        assert_eq!(batch.first_duplicate(), Some(2));
        assert_eq!(
            PayloadBatch::generate("messageid", &[8], 20).first_duplicate(),
            None
        );
    }

    #[test]
    fn undersized_target_keeps_full_header() {
        let batch = PayloadBatch::generate("messageid", &[1], 1);
        assert_eq!(batch.payloads()[0], Bytes::from_static(b"messageid-0-"));
    }

    #[test]
    fn parse_index_rejects_foreign_payloads() {
        assert_eq!(parse_index("messageid", b"messageid-42-abc"), Some(42));
        assert_eq!(parse_index("messageid", b"other-42-abc"), None);
        assert_eq!(parse_index("messageid", b"messageid--abc"), None);
        assert_eq!(parse_index("messageid", b"messageid-42abc"), None);
        assert_eq!(parse_index("messageid", b"messageid-42"), None);
    }

    #[test]
    fn empty_inputs_make_empty_batch() {
        assert!(PayloadBatch::generate("messageid", &[], 5).is_empty());
        assert!(PayloadBatch::generate("messageid", &[128], 0).is_empty());
    }
}
