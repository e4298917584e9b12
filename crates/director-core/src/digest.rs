//! Content digests for rendered template archives.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the given bytes.
///
/// Used as the `content_sha1` of a rendered templates archive so two
/// renderings with identical content can be recognised without fetching
/// the blob.
pub fn content_sha(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest over a set of named rendered files, independent of input order.
pub fn rendered_files_sha<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut files: Vec<_> = files.into_iter().collect();
    files.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, contents) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(contents);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_sha_known_value() {
        assert_eq!(
            content_sha(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_rendered_files_sha_ignores_order() {
        let a = rendered_files_sha([("bin/ctl", &b"start"[..]), ("config.yml", &b"port: 1"[..])]);
        let b = rendered_files_sha([("config.yml", &b"port: 1"[..]), ("bin/ctl", &b"start"[..])]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rendered_files_sha_detects_rename() {
        let a = rendered_files_sha([("a", &b"x"[..])]);
        let b = rendered_files_sha([("b", &b"x"[..])]);
        assert_ne!(a, b);
    }
}
