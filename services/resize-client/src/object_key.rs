//! Object key parsing and output key prediction.
//!
//! The issuing endpoint assigns keys of the form `q{quality}_w{width}_h{height}/{name}`.
//! The pipeline writes its result to `{prefix}q.._w.._h../{stem}.{format}`, so the
//! output location is known as soon as the upload finishes. Older deployments
//! assigned `quality{quality}/{name}` keys, which carry no dimensions.
//!
//! Derivation is pure: the same key, hint and layout always give the same result.
//! A key matching neither layout is an error, never a guess.

use crate::config::OutputConfig;
use crate::params::{clamp_dimension, clamp_quality, TransformParams};
use serde::Deserialize;
use thiserror::Error;

const CANONICAL_QUALITY_MARKER: &str = "q";
const LEGACY_QUALITY_MARKER: &str = "quality";

/// Errors from parsing an assigned key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyDerivationError {
    #[error("Object key {key:?} has no parameter segment")]
    MissingParameterSegment { key: String },

    #[error("Object key {key:?} has an empty file name")]
    EmptyName { key: String },

    #[error("Object key {key:?} matches no known naming scheme")]
    UnrecognisedLayout { key: String },
}

impl KeyDerivationError {
    /// The key that could not be derived from.
    pub fn key(&self) -> &str {
        match self {
            KeyDerivationError::MissingParameterSegment { key }
            | KeyDerivationError::EmptyName { key }
            | KeyDerivationError::UnrecognisedLayout { key } => key,
        }
    }
}

/// Rewrite applied to legacy `quality<N>/` keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyKeyStyle {
    /// `quality70/cat.png` -> `resized-q70_w50_h60/cat.jpeg`
    #[default]
    Normalized,
    /// `quality70/cat.png` -> `resized-qquality70_w50_h60/cat.jpeg`, as some
    /// deployed pipelines write it
    Verbatim,
}

/// Output naming rules of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub prefix: String,
    pub format: String,
    pub legacy_style: LegacyKeyStyle,
}

impl From<&OutputConfig> for KeyLayout {
    fn from(config: &OutputConfig) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            format: config.format.to_lowercase(),
            legacy_style: config.legacy_key_style,
        }
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::from(&OutputConfig::default())
    }
}

/// An assigned key split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey<'a> {
    /// `q{quality}_w{width}_h{height}/{name}`
    Canonical {
        segment: &'a str,
        quality: u32,
        width: u32,
        height: u32,
        name: &'a str,
    },
    /// `quality{quality}/{name}`
    Legacy {
        segment: &'a str,
        quality_digits: &'a str,
        quality: u32,
        name: &'a str,
    },
}

impl<'a> ParsedKey<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            ParsedKey::Canonical { name, .. } | ParsedKey::Legacy { name, .. } => name,
        }
    }
}

/// Where the pipeline will put the result of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Predicted output key
    pub key: String,
    /// File name stem carried over from the input key
    pub stem: String,
    /// Extension of the output format
    pub extension: String,
    /// Parameters the output was produced with
    pub params: TransformParams,
}

/// Split an assigned key into its parts.
pub fn parse_key(raw: &str) -> Result<ParsedKey<'_>, KeyDerivationError> {
    let (segment, name) = raw
        .split_once('/')
        .ok_or_else(|| KeyDerivationError::MissingParameterSegment {
            key: raw.to_string(),
        })?;

    if name.is_empty() || name.ends_with('/') {
        return Err(KeyDerivationError::EmptyName {
            key: raw.to_string(),
        });
    }

    if let Some((quality, width, height)) = parse_canonical_segment(segment) {
        return Ok(ParsedKey::Canonical {
            segment,
            quality,
            width,
            height,
            name,
        });
    }

    if let Some(digits) = segment.strip_prefix(LEGACY_QUALITY_MARKER) {
        if let Some(quality) = parse_digits(digits) {
            return Ok(ParsedKey::Legacy {
                segment,
                quality_digits: digits,
                quality,
                name,
            });
        }
    }

    Err(KeyDerivationError::UnrecognisedLayout {
        key: raw.to_string(),
    })
}

/// Predict the output key for an assigned input key.
///
/// `hint` only fills in what the key does not carry (dimensions of legacy
/// keys); parameters parsed from the key always win.
pub fn derive_output_key(
    raw: &str,
    hint: &TransformParams,
    layout: &KeyLayout,
) -> Result<DerivedKey, KeyDerivationError> {
    let parsed = parse_key(raw)?;
    let stem = file_stem(parsed.name()).to_string();
    let format = layout.format.to_lowercase();

    let (segment, params) = match parsed {
        ParsedKey::Canonical {
            segment,
            quality,
            width,
            height,
            ..
        } => (
            segment.to_string(),
            TransformParams {
                quality: clamp_quality(quality as i64),
                max_width: clamp_dimension(width as i64),
                max_height: clamp_dimension(height as i64),
            },
        ),
        ParsedKey::Legacy {
            segment,
            quality_digits,
            quality,
            ..
        } => {
            let quality_part = match layout.legacy_style {
                LegacyKeyStyle::Normalized => quality_digits,
                LegacyKeyStyle::Verbatim => segment,
            };
            (
                format!(
                    "{}{}_w{}_h{}",
                    CANONICAL_QUALITY_MARKER, quality_part, hint.max_width, hint.max_height
                ),
                TransformParams {
                    quality: clamp_quality(quality as i64),
                    max_width: hint.max_width,
                    max_height: hint.max_height,
                },
            )
        }
    };

    Ok(DerivedKey {
        key: format!("{}{}/{}.{}", layout.prefix, segment, stem, format),
        stem,
        extension: format,
        params,
    })
}

/// Name without its extension. Names without one (or dot-files) are kept whole.
pub fn file_stem(name: &str) -> &str {
    let base_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[base_start..].rfind('.') {
        None | Some(0) => name,
        Some(dot) => &name[..base_start + dot],
    }
}

fn parse_canonical_segment(segment: &str) -> Option<(u32, u32, u32)> {
    let rest = segment.strip_prefix(CANONICAL_QUALITY_MARKER)?;
    let (quality, rest) = rest.split_once("_w")?;
    let (width, height) = rest.split_once("_h")?;
    Some((
        parse_digits(quality)?,
        parse_digits(width)?,
        parse_digits(height)?,
    ))
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
