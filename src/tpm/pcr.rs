use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Highest PCR index of a PC client TPM.
pub const MAX_PCR: u8 = 23;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcrBank {
    Sha1,
    Sha256,
    Sha384,
}

impl PcrBank {
    pub fn as_str(self) -> &'static str {
        match self {
            PcrBank::Sha1 => "sha1",
            PcrBank::Sha256 => "sha256",
            PcrBank::Sha384 => "sha384",
        }
    }
}

impl FromStr for PcrBank {
    type Err = PcrError;

    fn from_str(bank: &str) -> Result<Self> {
        match bank {
            "sha1" => Ok(PcrBank::Sha1),
            "sha256" => Ok(PcrBank::Sha256),
            "sha384" => Ok(PcrBank::Sha384),
            _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
        }
    }
}

/// PCRs of one bank, written `bank:slot,slot,...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PcrSelection {
    pub bank: PcrBank,
    pub slots: Vec<u8>,
}

fn parse_slot(slot: &str) -> Result<u8> {
    slot.parse::<u8>()
        .ok()
        .filter(|s| *s <= MAX_PCR && !slot.starts_with('+'))
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(expression: &str) -> Result<Self> {
        let (bank, slots) = expression
            .split_once(':')
            .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
        let bank = bank.parse()?;
        if slots.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        let mut slots = slots.split(',').map(parse_slot).collect::<Result<Vec<_>>>()?;
        slots.sort_unstable();
        slots.dedup();
        Ok(Self { bank, slots })
    }
}

impl TryFrom<String> for PcrSelection {
    type Error = PcrError;

    fn try_from(expression: String) -> Result<Self> {
        expression.parse()
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.bank.as_str())?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{slot}")?;
        }
        Ok(())
    }
}

impl From<PcrSelection> for String {
    fn from(selection: PcrSelection) -> Self {
        selection.to_string()
    }
}
