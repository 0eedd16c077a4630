pub mod builtin;

/// Encryption provider for alias values written to the coordination store.
///
/// The cache only ever holds plaintext; everything that crosses the remote
/// store boundary goes through one of these.
pub trait AliasCipher: Send + Sync {
    /// Encrypt a plaintext alias value into an opaque payload.
    fn seal(&self, plaintext: &str) -> anyhow::Result<Vec<u8>>;

    /// Decrypt a payload previously produced by [`AliasCipher::seal`].
    fn open(&self, payload: &[u8]) -> anyhow::Result<String>;
}
