//! Dice notation parsing and rolling
//!
//! Supports notation like "1d20+5", "2d6-1", "d100". The count may be omitted
//! ("d20" means one die). Bounds are enforced after the shape is recognised,
//! so "0d6" and "101d6" are range errors while "garbage" is a notation error.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inclusive bounds on the number of dice in one roll
pub const MIN_DICE: u32 = 1;
pub const MAX_DICE: u32 = 100;
/// Inclusive bounds on the number of sides per die
pub const MIN_SIDES: u32 = 1;
pub const MAX_SIDES: u32 = 1000;
/// Largest absolute modifier accepted
pub const MAX_MODIFIER: i64 = 10_000;

/// Error when parsing or validating a dice notation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    /// The string does not match `[count]d<sides>[+|-modifier]`
    #[error("Invalid dice notation: '{0}'")]
    InvalidNotation(String),
    /// The notation is well formed but a number is outside the allowed range
    #[error("Dice {field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: i64,
        max: i64,
    },
}

/// Who may see a roll once it is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollVisibility {
    /// Everyone in the session
    #[default]
    Public,
    /// Only the roller and the GM
    GmOnly,
}

/// A validated roll request like "2d6+3"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceNotation {
    pub count: u32,
    pub sides: u32,
    pub modifier: i64,
}

impl DiceNotation {
    /// Build a notation, enforcing the count/sides/modifier bounds
    pub fn new(count: u32, sides: u32, modifier: i64) -> Result<Self, DiceError> {
        check_range("count", count as i64, MIN_DICE as i64, MAX_DICE as i64)?;
        check_range("sides", sides as i64, MIN_SIDES as i64, MAX_SIDES as i64)?;
        check_range("modifier", modifier, -MAX_MODIFIER, MAX_MODIFIER)?;
        Ok(Self {
            count,
            sides,
            modifier,
        })
    }

    /// Parse a notation string
    pub fn parse(input: &str) -> Result<Self, DiceError> {
        let normalized = input.trim().to_ascii_lowercase();
        let invalid = || DiceError::InvalidNotation(input.trim().to_string());

        let (count_str, rest) = normalized.split_once('d').ok_or_else(invalid)?;

        let sign_pos = rest.find(['+', '-']);
        let (sides_str, modifier_part) = match sign_pos {
            Some(pos) => (&rest[..pos], Some(&rest[pos..])),
            None => (rest, None),
        };

        if !is_digits(count_str, true) || !is_digits(sides_str, false) {
            return Err(invalid());
        }

        let count = if count_str.is_empty() {
            1
        } else {
            parse_bounded("count", count_str, MIN_DICE as i64, MAX_DICE as i64)?
        };
        let sides = parse_bounded("sides", sides_str, MIN_SIDES as i64, MAX_SIDES as i64)?;

        let modifier = match modifier_part {
            None => 0,
            Some(part) => {
                let (negative, digits) = part.split_at(1);
                if !is_digits(digits, false) {
                    return Err(invalid());
                }
                let magnitude = parse_bounded("modifier", digits, 0, MAX_MODIFIER)?;
                if negative == "-" {
                    -magnitude
                } else {
                    magnitude
                }
            }
        };

        Self::new(count as u32, sides as u32, modifier)
    }

    /// Roll using the thread-local RNG
    pub fn roll(&self) -> DiceRollResult {
        self.roll_with(&mut rand::thread_rng())
    }

    /// Roll using the given RNG. Each die is drawn uniformly from `1..=sides`.
    pub fn roll_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DiceRollResult {
        let outcomes: Vec<u32> = (0..self.count)
            .map(|_| rng.gen_range(1..=self.sides))
            .collect();
        let dice_total: i64 = outcomes.iter().map(|o| *o as i64).sum();

        DiceRollResult {
            notation: *self,
            outcomes,
            modifier: self.modifier,
            total: dice_total + self.modifier,
            visibility: RollVisibility::Public,
        }
    }
}

impl fmt::Display for DiceNotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.modifier {
            0 => write!(f, "{}d{}", self.count, self.sides),
            m if m > 0 => write!(f, "{}d{}+{}", self.count, self.sides, m),
            m => write!(f, "{}d{}{}", self.count, self.sides, m),
        }
    }
}

/// Outcome of a roll, immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRollResult {
    pub notation: DiceNotation,
    /// Individual die outcomes in roll order
    pub outcomes: Vec<u32>,
    pub modifier: i64,
    /// sum(outcomes) + modifier
    pub total: i64,
    pub visibility: RollVisibility,
}

impl DiceRollResult {
    pub fn with_visibility(mut self, visibility: RollVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Format as a breakdown string (e.g., "2d6+3 [4, 5] = 12")
    pub fn breakdown(&self) -> String {
        let outcomes: Vec<String> = self.outcomes.iter().map(|o| o.to_string()).collect();
        format!("{} [{}] = {}", self.notation, outcomes.join(", "), self.total)
    }
}

/// Parse and roll in one step
pub fn roll(notation: &str) -> Result<DiceRollResult, DiceError> {
    Ok(DiceNotation::parse(notation)?.roll())
}

fn is_digits(s: &str, allow_empty: bool) -> bool {
    if s.is_empty() {
        return allow_empty;
    }
    s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse an all-digit string and bound it. Overlong numbers are range errors.
fn parse_bounded(field: &'static str, digits: &str, min: i64, max: i64) -> Result<i64, DiceError> {
    let value: i64 = digits.parse().map_err(|_| DiceError::OutOfRange {
        field,
        value: digits.to_string(),
        min,
        max,
    })?;
    check_range(field, value, min, max)?;
    Ok(value)
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), DiceError> {
    if value < min || value > max {
        return Err(DiceError::OutOfRange {
            field,
            value: value.to_string(),
            min,
            max,
        });
    }
    Ok(())
}
