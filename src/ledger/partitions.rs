/// Key layout and encoding utilities for Fjall partitions
///
/// Partition structure:
/// - `batches`: batch:{batch_id} -> Batch (JSON)
/// - `jobs`: job:{batch_id}:{job_id} -> Job (JSON), grouped for prefix scans
/// - `job_index`: jidx:{job_id} -> batch_id (string)
/// - `quota`: quota:{owner_id} -> QuotaAccount (JSON)
/// - `metadata`: meta:{key} -> value (JSON/string)

/// Encode a batch key: batch:{batch_id}
pub fn encode_batch_key(batch_id: &str) -> Vec<u8> {
    format!("batch:{}", batch_id).into_bytes()
}

/// Encode a job key: job:{batch_id}:{job_id}
pub fn encode_job_key(batch_id: &str, job_id: &str) -> Vec<u8> {
    format!("job:{}:{}", batch_id, job_id).into_bytes()
}

/// Encode a job prefix for range scan: job:{batch_id}:
pub fn encode_job_prefix(batch_id: &str) -> Vec<u8> {
    format!("job:{}:", batch_id).into_bytes()
}

/// Decode a job key: job:{batch_id}:{job_id} -> (batch_id, job_id)
pub fn decode_job_key(key: &[u8]) -> Option<(String, String)> {
    let key_str = std::str::from_utf8(key).ok()?;
    let (batch_id, job_id) = key_str.strip_prefix("job:")?.split_once(':')?;
    if batch_id.is_empty() || job_id.is_empty() {
        return None;
    }
    Some((batch_id.to_string(), job_id.to_string()))
}

/// Encode a job index key: jidx:{job_id}
pub fn encode_job_index_key(job_id: &str) -> Vec<u8> {
    format!("jidx:{}", job_id).into_bytes()
}

/// Encode a quota key: quota:{owner_id}
pub fn encode_quota_key(owner_id: &str) -> Vec<u8> {
    format!("quota:{}", owner_id).into_bytes()
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_key_encoding() {
        let key = encode_batch_key("b_1");
        assert_eq!(key, b"batch:b_1");
        assert_ne!(key, encode_job_prefix("b_1"));
    }

    #[test]
    fn test_job_key_encoding() {
        let key = encode_job_key("b_1", "j_9");
        assert_eq!(key, b"job:b_1:j_9");

        let (batch_id, job_id) = decode_job_key(&key).unwrap();
        assert_eq!(batch_id, "b_1");
        assert_eq!(job_id, "j_9");

        assert!(decode_job_key(b"job:b_1:").is_none());
    }

    #[test]
    fn test_job_prefix_groups_by_batch() {
        let prefix = encode_job_prefix("b_1");
        assert_eq!(prefix, b"job:b_1:");
        assert!(encode_job_key("b_1", "x").starts_with(&prefix));
        assert!(!encode_job_key("b_10", "x").starts_with(&prefix));
    }

    #[test]
    fn test_index_and_quota_keys() {
        assert_eq!(encode_job_index_key("j_9"), b"jidx:j_9");
        assert_eq!(encode_quota_key("owner@example.com"), b"quota:owner@example.com");
        assert_eq!(encode_meta_key("last_reset"), b"meta:last_reset");
    }
}
