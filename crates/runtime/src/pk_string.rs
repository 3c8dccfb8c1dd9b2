//! String heap objects.
//!
//! A `PkString` is an immutable byte buffer with a cached FNV-1a hash.
//! PocketLang strings are byte strings, not Unicode text — `lower`,
//! `upper`, and `strip` only ever touch ASCII bytes, and all of them return
//! the receiver unchanged (no new allocation) when the transform is a
//! no-op, which is both an allocation-saving optimization and the reason
//! `lower(s) is s` holds when `s` has no uppercase.

use pocket_core::hash::fnv1a;

#[derive(Debug, Clone)]
pub struct PkString {
    bytes: Box<[u8]>,
    hash: u64,
}

impl PkString {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = fnv1a(&bytes);
        PkString { bytes, hash }
    }

    pub fn from_str(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec().into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lossy decode for display purposes; PocketLang strings need not be
    /// valid UTF-8 internally (`\xNN` escapes can produce arbitrary bytes).
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn concat(&self, other: &PkString) -> PkString {
        let mut bytes = Vec::with_capacity(self.len() + other.len());
        bytes.extend_from_slice(&self.bytes);
        bytes.extend_from_slice(other.as_bytes());
        PkString::new(bytes.into_boxed_slice())
    }

    /// Returns `None` when the string is already lowercase (no allocation).
    pub fn lower(&self) -> Option<PkString> {
        if self.bytes.iter().any(u8::is_ascii_uppercase) {
            let lowered: Vec<u8> = self.bytes.iter().map(|b| b.to_ascii_lowercase()).collect();
            Some(PkString::new(lowered.into_boxed_slice()))
        } else {
            None
        }
    }

    /// Returns `None` when the string is already uppercase (no allocation).
    pub fn upper(&self) -> Option<PkString> {
        if self.bytes.iter().any(u8::is_ascii_lowercase) {
            let uppered: Vec<u8> = self.bytes.iter().map(|b| b.to_ascii_uppercase()).collect();
            Some(PkString::new(uppered.into_boxed_slice()))
        } else {
            None
        }
    }

    /// Returns `None` when there is no leading/trailing ASCII whitespace to
    /// strip (no allocation).
    pub fn strip(&self) -> Option<PkString> {
        let start = self.bytes.iter().position(|b| !b.is_ascii_whitespace());
        let Some(start) = start else {
            return if self.bytes.is_empty() {
                None
            } else {
                Some(PkString::new(Vec::new().into_boxed_slice()))
            };
        };
        let end = self.bytes.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();
        if start == 0 && end == self.bytes.len() - 1 {
            None
        } else {
            Some(PkString::new(self.bytes[start..=end].to_vec().into_boxed_slice()))
        }
    }
}

impl PartialEq for PkString {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}
impl Eq for PkString {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_content() {
        let a = PkString::from_str("hello");
        let b = PkString::from_str("hello");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn lower_is_idempotent_and_identity_when_already_lower() {
        let s = PkString::from_str("already lower");
        assert!(s.lower().is_none());
        let s = PkString::from_str("MiXeD");
        let lowered = s.lower().unwrap();
        assert_eq!(lowered.as_str_lossy(), "mixed");
        assert!(lowered.lower().is_none());
    }

    #[test]
    fn upper_is_idempotent() {
        let s = PkString::from_str("MiXeD");
        let uppered = s.upper().unwrap();
        assert_eq!(uppered.as_str_lossy(), "MIXED");
        assert!(uppered.upper().is_none());
    }

    #[test]
    fn strip_trims_ascii_whitespace_both_ends() {
        let s = PkString::from_str("  hi \t\n");
        let stripped = s.strip().unwrap();
        assert_eq!(stripped.as_str_lossy(), "hi");
        assert!(stripped.strip().is_none());
    }

    #[test]
    fn strip_no_op_returns_none() {
        let s = PkString::from_str("clean");
        assert!(s.strip().is_none());
    }

    #[test]
    fn concat_allocates_fresh_string() {
        let a = PkString::from_str("foo");
        let b = PkString::from_str("bar");
        assert_eq!(a.concat(&b).as_str_lossy(), "foobar");
    }
}
