//! Alias codec: maps token fields to remote store paths.
//!
//! Every persisted field of a token lives under its own leaf:
//!
//! ```text
//! <base>/<bucket>/<token_id>          expiration
//! <base>/<bucket>/<token_id>--max     max lifetime
//! <base>/<bucket>/<token_id>--meta    metadata
//! ```
//!
//! `bucket` is the first two characters of the token id and bounds the
//! number of children per directory in stores with directory-style limits.

use crate::errors::TokenStateError;
use crate::models::token::AliasField;

pub const TOKEN_MAX_LIFETIME_POSTFIX: &str = "--max";
pub const TOKEN_META_POSTFIX: &str = "--meta";

pub const DEFAULT_BASE_PATH: &str = "/gateway/security/tokens";

/// Characters of the bare id kept in front of the ellipsis.
const DISPLAY_HEAD_CHARS: usize = 8;
const DISPLAY_TAIL_CHARS: usize = 4;
/// Bodies shorter than this are too short for the head/tail form.
const DISPLAY_MIN_CHARS: usize = 16;
const ELLIPSIS: &str = "...";
/// Shortest body for which head plus ellipsis is still shorter than the body.
const DISPLAY_HEAD_ONLY_MIN_CHARS: usize = DISPLAY_HEAD_CHARS + ELLIPSIS.len() + 1;

#[derive(Debug, Clone)]
pub struct AliasCodec {
    base: String,
}

impl AliasCodec {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn expiration_path(&self, token_id: &str) -> String {
        self.path_for(token_id, AliasField::Expiration)
    }

    pub fn max_lifetime_path(&self, token_id: &str) -> String {
        self.path_for(token_id, AliasField::MaxLifetime)
    }

    pub fn metadata_path(&self, token_id: &str) -> String {
        self.path_for(token_id, AliasField::Metadata)
    }

    /// The bucket is always derived from the bare id, never the postfixed leaf.
    pub fn path_for(&self, token_id: &str, field: AliasField) -> String {
        format!(
            "{}/{}",
            self.bucket_path(bucket(token_id)),
            alias_name(token_id, field)
        )
    }

    pub fn bucket_path(&self, bucket: &str) -> String {
        format!("{}/{}", self.base, bucket)
    }
}

/// First two characters of the token id, or the whole id when shorter.
pub fn bucket(token_id: &str) -> &str {
    match token_id.char_indices().nth(2) {
        Some((idx, _)) => &token_id[..idx],
        None => token_id,
    }
}

/// Leaf name of the alias for `field`.
pub fn alias_name(token_id: &str, field: AliasField) -> String {
    match field {
        AliasField::Expiration => token_id.to_string(),
        AliasField::MaxLifetime => format!("{token_id}{TOKEN_MAX_LIFETIME_POSTFIX}"),
        AliasField::Metadata => format!("{token_id}{TOKEN_META_POSTFIX}"),
    }
}

/// Inverse of [`alias_name`]: splits a leaf into token id and field.
pub fn parse_alias(leaf: &str) -> (&str, AliasField) {
    if let Some(id) = leaf.strip_suffix(TOKEN_META_POSTFIX) {
        (id, AliasField::Metadata)
    } else if let Some(id) = leaf.strip_suffix(TOKEN_MAX_LIFETIME_POSTFIX) {
        (id, AliasField::MaxLifetime)
    } else {
        (leaf, AliasField::Expiration)
    }
}

/// Ids become a single path segment, so they must be non-empty, slash-free
/// and must not end in an alias postfix.
pub fn validate_token_id(token_id: &str) -> Result<(), TokenStateError> {
    if token_id.is_empty() {
        return Err(TokenStateError::InvalidTokenId("empty".to_string()));
    }
    // A postfixed id would collide with another token's alias leaf.
    if token_id.contains('/') || parse_alias(token_id).1 != AliasField::Expiration {
        return Err(TokenStateError::InvalidTokenId(displayable_alias_text(
            token_id,
        )));
    }
    Ok(())
}

/// Redacted form of an alias for logs and diagnostics.
///
/// For ids of 16+ characters the output is the first 8 characters, `...`,
/// the last 4 characters, then any recognized postfix verbatim. Ids of 12 to
/// 15 characters keep the first 8 and drop the tail, so the ellipsis still
/// sits at offset 8. Ids of 8 to 11 characters keep their first half; ids
/// under 8 collapse to the ellipsis alone. The bare id never appears in
/// full.
pub fn displayable_alias_text(alias: &str) -> String {
    let (body, _) = parse_alias(alias);
    let postfix = &alias[body.len()..];

    let chars: Vec<char> = body.chars().collect();
    let n = chars.len();
    let (head, tail): (String, String) = if n >= DISPLAY_MIN_CHARS {
        (
            chars[..DISPLAY_HEAD_CHARS].iter().collect(),
            chars[n - DISPLAY_TAIL_CHARS..].iter().collect(),
        )
    } else if n >= DISPLAY_HEAD_ONLY_MIN_CHARS {
        (chars[..DISPLAY_HEAD_CHARS].iter().collect(), String::new())
    } else if n >= DISPLAY_HEAD_CHARS {
        (chars[..n / 2].iter().collect(), String::new())
    } else {
        (String::new(), String::new())
    };

    format!("{head}{ELLIPSIS}{tail}{postfix}")
}
