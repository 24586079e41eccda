//! Encrypted field storage.
//!
//! Every secret column in the system has the same shape: an opaque
//! ciphertext plus a short plaintext suffix index used only for masked
//! display. [`EncryptedField`] owns that pair for one named field and is
//! embedded once per secret field in each record.

use std::fmt;

use crate::engine::EncryptionEngine;
use dealvault_common::{Result, SensitiveString};

/// Mask token placed in front of the stored suffix.
pub const MASK_PREFIX: &str = "••••";

/// Indicator returned when a value exists but no safe partial can be shown.
pub const PRESENT_INDICATOR: &str = "••••••••";

/// How raw input is cleaned before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Strip all whitespace and dashes (account numbers, tax IDs).
    Compact,
    /// Trim surrounding whitespace only (passwords, notes, free text).
    Verbatim,
}

/// Static description of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name, used in audit metadata.
    pub name: &'static str,
    /// Number of trailing characters kept as the plaintext index. 0 disables it.
    pub suffix_len: usize,
    pub normalization: Normalization,
}

impl FieldSpec {
    pub const fn compact(name: &'static str, suffix_len: usize) -> Self {
        Self {
            name,
            suffix_len,
            normalization: Normalization::Compact,
        }
    }

    pub const fn verbatim(name: &'static str, suffix_len: usize) -> Self {
        Self {
            name,
            suffix_len,
            normalization: Normalization::Verbatim,
        }
    }

    /// Clean raw input according to the field's normalization.
    pub fn clean(&self, raw: &str) -> String {
        match self.normalization {
            Normalization::Compact => raw
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect(),
            Normalization::Verbatim => raw.trim().to_string(),
        }
    }

    /// Suffix index for a cleaned value.
    ///
    /// Values no longer than the suffix get no index at all, so the index can
    /// never spell out a whole secret.
    fn suffix_of(&self, cleaned: &str) -> Option<String> {
        if self.suffix_len == 0 {
            return None;
        }
        let count = cleaned.chars().count();
        if count <= self.suffix_len {
            return None;
        }
        Some(cleaned.chars().skip(count - self.suffix_len).collect())
    }
}

/// Ciphertext and suffix index for one secret field.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedField {
    spec: FieldSpec,
    ciphertext: Option<String>,
    suffix: Option<String>,
}

impl EncryptedField {
    /// An empty field.
    pub fn new(spec: FieldSpec) -> Self {
        Self {
            spec,
            ciphertext: None,
            suffix: None,
        }
    }

    /// Rebuild a field from its stored columns.
    pub fn restore(spec: FieldSpec, ciphertext: Option<String>, suffix: Option<String>) -> Self {
        Self {
            spec,
            ciphertext: ciphertext.filter(|c| !c.is_empty()),
            suffix: suffix.filter(|s| !s.is_empty()),
        }
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Encrypt and store a new value, or clear the field on blank input.
    pub fn set(&mut self, engine: &EncryptionEngine, value: Option<&str>) -> Result<()> {
        let cleaned = value.map(|raw| self.spec.clean(raw)).unwrap_or_default();
        match engine.encrypt(&cleaned)? {
            Some(ciphertext) => {
                self.suffix = self.spec.suffix_of(&cleaned);
                self.ciphertext = Some(ciphertext);
            }
            None => self.clear(),
        }
        Ok(())
    }

    /// Drop the stored value.
    pub fn clear(&mut self) {
        self.ciphertext = None;
        self.suffix = None;
    }

    /// Decrypt the stored value.
    ///
    /// # Security
    /// Exposing the result outside the process must go through an audited,
    /// permission-checked reveal. `None` means absent or unreadable.
    pub fn decrypted(&self, engine: &EncryptionEngine) -> Option<SensitiveString> {
        self.ciphertext.as_deref().and_then(|ct| engine.decrypt(ct))
    }

    /// Masked display value. Safe to log and return on error paths.
    pub fn masked(&self) -> Option<String> {
        if !self.present() {
            return None;
        }
        match &self.suffix {
            Some(suffix) if self.spec.suffix_len > 0 => Some(format!("{}{}", MASK_PREFIX, suffix)),
            _ => Some(PRESENT_INDICATOR.to_string()),
        }
    }

    /// Whether a ciphertext is stored, whether or not it is decryptable.
    pub fn present(&self) -> bool {
        self.ciphertext.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// The stored plaintext suffix index.
    pub fn last_suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// The opaque ciphertext column value, for persistence only.
    pub fn ciphertext(&self) -> Option<&str> {
        self.ciphertext.as_deref()
    }
}

impl fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField")
            .field("name", &self.spec.name)
            .field("present", &self.present())
            .field("masked", &self.masked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{MasterKey, KEY_LENGTH};
    use proptest::prelude::*;

    const ACCOUNT: FieldSpec = FieldSpec::compact("account_number", 4);
    const NOTES: FieldSpec = FieldSpec::verbatim("notes", 0);
    const SECRET: FieldSpec = FieldSpec::verbatim("secret", 4);

    fn engine() -> EncryptionEngine {
        EncryptionEngine::from_key(MasterKey::from_bytes([5u8; KEY_LENGTH]))
    }

    #[test]
    fn test_set_stores_cleaned_suffix() {
        let engine = engine();
        let mut field = EncryptedField::new(ACCOUNT);
        field.set(&engine, Some("12345-6789")).unwrap();

        assert!(field.present());
        assert_eq!(field.last_suffix(), Some("6789"));
        assert_eq!(field.masked().as_deref(), Some("••••6789"));
        assert_eq!(field.decrypted(&engine).unwrap(), "123456789");
    }

    #[test]
    fn test_compact_strips_whitespace_and_dashes() {
        let engine = engine();
        let mut field = EncryptedField::new(FieldSpec::compact("ein", 4));
        field.set(&engine, Some(" 12-34 56 789 ")).unwrap();

        assert_eq!(field.decrypted(&engine).unwrap(), "123456789");
        assert_eq!(field.masked().as_deref(), Some("••••6789"));
    }

    #[test]
    fn test_verbatim_keeps_inner_characters() {
        let engine = engine();
        let mut field = EncryptedField::new(SECRET);
        field.set(&engine, Some("  correct horse-battery  ")).unwrap();

        assert_eq!(field.decrypted(&engine).unwrap(), "correct horse-battery");
        assert_eq!(field.last_suffix(), Some("tery"));
    }

    #[test]
    fn test_blank_clears_field() {
        let engine = engine();
        let mut field = EncryptedField::new(ACCOUNT);
        field.set(&engine, Some("987654321")).unwrap();
        assert!(field.present());

        field.set(&engine, Some("")).unwrap();
        assert!(!field.present());
        assert_eq!(field.last_suffix(), None);
        assert_eq!(field.masked(), None);

        field.set(&engine, Some("987654321")).unwrap();
        field.set(&engine, None).unwrap();
        assert!(!field.present());
        assert_eq!(field.ciphertext(), None);
    }

    #[test]
    fn test_only_dashes_counts_as_blank() {
        let engine = engine();
        let mut field = EncryptedField::new(ACCOUNT);
        field.set(&engine, Some(" - - ")).unwrap();
        assert!(!field.present());
    }

    #[test]
    fn test_zero_suffix_masks_fully() {
        let engine = engine();
        let mut field = EncryptedField::new(NOTES);
        field.set(&engine, Some("door code is 4321")).unwrap();

        assert_eq!(field.last_suffix(), None);
        assert_eq!(field.masked().as_deref(), Some(PRESENT_INDICATOR));
    }

    #[test]
    fn test_short_value_gets_no_suffix() {
        let engine = engine();
        let mut field = EncryptedField::new(ACCOUNT);
        field.set(&engine, Some("1234")).unwrap();

        assert_eq!(field.last_suffix(), None);
        assert_eq!(field.masked().as_deref(), Some(PRESENT_INDICATOR));
        assert_eq!(field.decrypted(&engine).unwrap(), "1234");
    }

    #[test]
    fn test_masked_survives_undecryptable_ciphertext() {
        let field = EncryptedField::restore(
            ACCOUNT,
            Some("v1:corrupted".to_string()),
            Some("4321".to_string()),
        );

        assert!(field.present());
        assert_eq!(field.masked().as_deref(), Some("••••4321"));
        assert!(field.decrypted(&engine()).is_none());
    }

    #[test]
    fn test_restore_treats_empty_columns_as_absent() {
        let field = EncryptedField::restore(ACCOUNT, Some(String::new()), Some(String::new()));
        assert!(!field.present());
        assert_eq!(field.masked(), None);
    }

    #[test]
    fn test_debug_hides_ciphertext() {
        let engine = engine();
        let mut field = EncryptedField::new(ACCOUNT);
        field.set(&engine, Some("111122223333")).unwrap();
        let ciphertext = field.ciphertext().unwrap().to_string();

        assert!(!format!("{:?}", field).contains(&ciphertext));
    }

    proptest! {
        #[test]
        fn prop_suffix_never_reveals_whole_value(digits in "[0-9]{1,20}") {
            let engine = engine();
            let mut field = EncryptedField::new(ACCOUNT);
            field.set(&engine, Some(&digits)).unwrap();

            match field.last_suffix() {
                Some(suffix) => {
                    prop_assert_eq!(suffix.len(), 4);
                    prop_assert!(digits.len() > 4);
                    prop_assert!(digits.ends_with(suffix));
                }
                None => prop_assert!(digits.len() <= 4),
            }
        }
    }
}
