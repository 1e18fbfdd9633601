use serde::{Deserialize, Serialize};
use std::fmt;

/// CoinGecko asset identifier.
///
/// CoinGecko addresses coins by a lowercase slug (e.g. "bitcoin",
/// "wrapped-bitcoin") rather than by ticker symbol, and the same slug is
/// used as the row key in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoinId(String);

impl CoinId {
    /// Creates a new coin id.
    ///
    /// # Errors
    /// Returns an error if the id is empty or contains characters other than
    /// alphanumerics, dots, hyphens and underscores.
    pub fn new(id: impl Into<String>) -> Result<Self, CoinIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(CoinId(id))
    }

    fn validate(id: &str) -> Result<(), CoinIdError> {
        if id.is_empty() {
            return Err(CoinIdError::Empty);
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Err(CoinIdError::InvalidCharacters(id.to_string()));
        }

        Ok(())
    }

    /// Returns the id as it appears in API paths and warehouse rows.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CoinId {
    type Error = CoinIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CoinId::new(value)
    }
}

impl From<CoinId> for String {
    fn from(id: CoinId) -> Self {
        id.0
    }
}

/// Errors that can occur when creating or validating coin ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinIdError {
    /// The id is empty
    Empty,
    /// The id contains invalid characters
    InvalidCharacters(String),
}

impl fmt::Display for CoinIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinIdError::Empty => write!(f, "Coin id cannot be empty"),
            CoinIdError::InvalidCharacters(id) => {
                write!(f, "Coin id '{}' contains invalid characters", id)
            }
        }
    }
}

impl std::error::Error for CoinIdError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_id_creation_valid() {
        let id = CoinId::new("wrapped-bitcoin").unwrap();
        assert_eq!(id.as_str(), "wrapped-bitcoin");
        assert_eq!(id.to_string(), "wrapped-bitcoin");
    }

    #[test]
    fn test_coin_id_empty() {
        assert_eq!(CoinId::new("").unwrap_err(), CoinIdError::Empty);
    }

    #[test]
    fn test_coin_id_rejects_path_characters() {
        let result = CoinId::new("bitcoin/../history");
        assert!(matches!(result, Err(CoinIdError::InvalidCharacters(_))));
    }

    #[test]
    fn test_coin_id_deserialize_validates() {
        let ok: Vec<CoinId> = serde_json::from_str(r#"["bitcoin", "ethereum"]"#).unwrap();
        assert_eq!(ok.len(), 2);

        let bad: Result<Vec<CoinId>, _> = serde_json::from_str(r#"["bit coin"]"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_coin_id_ordering_is_lexicographic() {
        let mut ids = vec![
            CoinId::new("solana").unwrap(),
            CoinId::new("bitcoin").unwrap(),
            CoinId::new("ethereum").unwrap(),
        ];
        ids.sort();
        let names: Vec<&str> = ids.iter().map(CoinId::as_str).collect();
        assert_eq!(names, vec!["bitcoin", "ethereum", "solana"]);
    }
}
