//! Transform parameter validation.
//!
//! User edits arrive as free text. Numeric input is clamped into the legal
//! range; anything unparseable leaves the last valid value in place. A
//! [`ValidationError`] is logged and never reaches the workflow.

use crate::config::TransformDefaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const MIN_DIMENSION: u32 = 1;

/// Problems with a single parameter edit.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} is not a number: {input:?}")]
    NotANumber { field: ParamField, input: String },

    #[error("{field} {requested} out of range, clamped to {applied}")]
    Clamped {
        field: ParamField,
        requested: i64,
        applied: i64,
    },
}

/// Which parameter an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamField {
    Quality,
    MaxWidth,
    MaxHeight,
}

impl fmt::Display for ParamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamField::Quality => "quality",
            ParamField::MaxWidth => "max width",
            ParamField::MaxHeight => "max height",
        };
        f.write_str(name)
    }
}

/// Legal transform parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformParams {
    /// Output quality, 1..=100
    pub quality: u8,
    /// Maximum output width in pixels, at least 1
    pub max_width: u32,
    /// Maximum output height in pixels, at least 1
    pub max_height: u32,
}

impl From<&TransformDefaults> for TransformParams {
    fn from(defaults: &TransformDefaults) -> Self {
        Self {
            quality: clamp_quality(defaults.quality as i64),
            max_width: clamp_dimension(defaults.max_width as i64),
            max_height: clamp_dimension(defaults.max_height as i64),
        }
    }
}

/// Holds the last valid parameters and applies edits to them.
#[derive(Debug, Clone)]
pub struct ParamValidator {
    current: TransformParams,
}

impl ParamValidator {
    pub fn new(initial: TransformParams) -> Self {
        Self {
            current: TransformParams {
                quality: clamp_quality(initial.quality as i64),
                max_width: clamp_dimension(initial.max_width as i64),
                max_height: clamp_dimension(initial.max_height as i64),
            },
        }
    }

    /// Current, always-legal parameters.
    pub fn params(&self) -> TransformParams {
        self.current
    }

    /// Apply a quality edit and return the resulting quality.
    pub fn apply_quality(&mut self, input: &str) -> u8 {
        if let Some(value) = parse_field(ParamField::Quality, input) {
            self.set_quality(value);
        }
        self.current.quality
    }

    pub fn set_quality(&mut self, value: i64) -> u8 {
        let applied = clamp_quality(value);
        note_clamp(ParamField::Quality, value, applied as i64);
        self.current.quality = applied;
        applied
    }

    pub fn increment_quality(&mut self) -> u8 {
        self.set_quality(self.current.quality as i64 + 1)
    }

    pub fn decrement_quality(&mut self) -> u8 {
        self.set_quality(self.current.quality as i64 - 1)
    }

    /// Apply a width edit and return the resulting width.
    pub fn apply_width(&mut self, input: &str) -> u32 {
        if let Some(value) = parse_field(ParamField::MaxWidth, input) {
            let applied = clamp_dimension(value);
            note_clamp(ParamField::MaxWidth, value, applied as i64);
            self.current.max_width = applied;
        }
        self.current.max_width
    }

    /// Apply a height edit and return the resulting height.
    pub fn apply_height(&mut self, input: &str) -> u32 {
        if let Some(value) = parse_field(ParamField::MaxHeight, input) {
            let applied = clamp_dimension(value);
            note_clamp(ParamField::MaxHeight, value, applied as i64);
            self.current.max_height = applied;
        }
        self.current.max_height
    }
}

/// Parse free-text numeric input. Fractions are truncated toward zero.
pub fn parse_number(field: ParamField, input: &str) -> Result<i64, ValidationError> {
    let trimmed = input.trim();

    if let Ok(value) = trimmed.parse::<i64>() {
        return Ok(value);
    }

    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value.trunc() as i64),
        _ => Err(ValidationError::NotANumber {
            field,
            input: input.to_string(),
        }),
    }
}

fn parse_field(field: ParamField, input: &str) -> Option<i64> {
    match parse_number(field, input) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "Ignoring parameter edit, keeping last valid value");
            None
        }
    }
}

fn note_clamp(field: ParamField, requested: i64, applied: i64) {
    if requested != applied {
        let e = ValidationError::Clamped {
            field,
            requested,
            applied,
        };
        debug!(error = %e, "Parameter clamped");
    }
}

pub fn clamp_quality(value: i64) -> u8 {
    value.clamp(MIN_QUALITY as i64, MAX_QUALITY as i64) as u8
}

pub fn clamp_dimension(value: i64) -> u32 {
    value.clamp(MIN_DIMENSION as i64, u32::MAX as i64) as u32
}
