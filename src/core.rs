use camino::Utf8PathBuf;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// Version under which cached build data is stored on disk. Bumping the
/// crate version invalidates every signature and cached product at once.
pub(crate) const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `tatara`, this serves two primary purposes:
/// 1. It fingerprints task inputs (skip hints plus upstream product
///    checksums) to decide whether a cached product can be reused.
/// 2. It fingerprints source files referenced by skip hints, so that a
///    changed file flips the signature of every task hashing it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Build-wide settings available to the engine and to every task.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Root directory for persisted signatures and cached products.
    pub cache_dir: Utf8PathBuf,
    /// When false, signatures are neither read nor written and every
    /// resolved task executes.
    pub use_cache: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".tatara"),
            use_cache: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"tatara");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_stable() {
        assert_eq!(Hash32::hash(b"abc"), Hash32::hash(b"abc"));
        assert_ne!(Hash32::hash(b"abc"), Hash32::hash(b"abd"));
    }
}
