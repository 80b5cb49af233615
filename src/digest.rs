//! Content identity: MD5 digests and the ETag shapes derived from them.
//!
//! A blob's identity is the lowercase hex MD5 of its bytes, which S3 also
//! returns as the ETag of any single-part object. Multipart objects carry a
//! composite ETag (`<hex>-<parts>`) that cannot be compared to a digest.

/// Length of a lowercase hex MD5 digest.
pub const MD5_HEX_LEN: usize = 32;

/// Whether `s` is exactly one MD5 digest: 32 lowercase hex characters.
pub fn is_digest(s: &str) -> bool {
    s.len() == MD5_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Extract the digest from a bucket key under the given prefix.
///
/// Returns `None` when the key is outside the prefix or its remainder is
/// not digest-shaped.
pub fn digest_from_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    is_digest(rest).then_some(rest)
}

/// Whether an ETag has the multipart-composite shape: a dash followed by
/// the part count, e.g. `d41d8cd98f00b204e9800998ecf8427e-12`.
pub fn is_multipart_etag(etag: &str) -> bool {
    match etag.rsplit_once('-') {
        Some((head, parts)) => {
            !head.is_empty() && !parts.is_empty() && parts.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Lowercase hex MD5 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
