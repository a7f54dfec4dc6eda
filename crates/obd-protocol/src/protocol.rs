//! OBD-II Bus Protocol Selection for ELM327 Adapters

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Bus protocol the adapter is told to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141,
    /// ISO 14230-4 KWP (fast init)
    Kwp2000,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Can29bit500,
}

impl ObdProtocol {
    /// ELM327 AT command selecting this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::Iso9141 => "ATSP3",
            ObdProtocol::Kwp2000 => "ATSP5",
            ObdProtocol::Can11bit500 => "ATSP6",
            ObdProtocol::Can29bit500 => "ATSP7",
        }
    }

    /// Protocol search can take several seconds on the first query
    pub fn needs_search(&self) -> bool {
        matches!(self, ObdProtocol::Auto)
    }
}

impl FromStr for ObdProtocol {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "0" => Ok(ObdProtocol::Auto),
            "iso9141" | "3" => Ok(ObdProtocol::Iso9141),
            "kwp2000" | "5" => Ok(ObdProtocol::Kwp2000),
            "can11bit500" | "6" => Ok(ObdProtocol::Can11bit500),
            "can29bit500" | "7" => Ok(ObdProtocol::Can29bit500),
            other => Err(ObdError::InvalidResponse(format!("unknown protocol '{}'", other))),
        }
    }
}
