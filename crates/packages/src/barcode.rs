use packledger_core::{DomainError, DomainResult};

/// Package barcode layout: fixed prefix followed by a zero-padded sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeFormat {
    prefix: String,
    digits: usize,
}

impl BarcodeFormat {
    pub fn new(prefix: impl Into<String>, digits: usize) -> DomainResult<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(DomainError::validation("barcode prefix cannot be empty"));
        }
        if digits == 0 || digits > 18 {
            return Err(DomainError::validation("barcode length must be between 1 and 18"));
        }
        Ok(Self { prefix, digits })
    }

    pub fn format(&self, sequence: u64) -> DomainResult<String> {
        let number = format!("{sequence:0width$}", width = self.digits);
        if number.len() > self.digits {
            return Err(DomainError::validation(format!(
                "barcode sequence {sequence} does not fit in {} digits",
                self.digits
            )));
        }
        Ok(format!("{}{}", self.prefix, number))
    }

    pub fn matches(&self, barcode: &str) -> bool {
        barcode
            .strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.len() == self.digits && rest.bytes().all(|b| b.is_ascii_digit()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_sequence_to_width() {
        let f = BarcodeFormat::new("PKG", 6).unwrap();
        assert_eq!(f.format(42).unwrap(), "PKG000042");
        assert!(f.matches("PKG000042"));
        assert!(!f.matches("PKG42"));
        assert!(!f.matches("BOX000042"));
    }

    #[test]
    fn overflowing_sequence_is_rejected() {
        let f = BarcodeFormat::new("P", 2).unwrap();
        assert!(f.format(99).is_ok());
        assert!(f.format(100).is_err());
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(BarcodeFormat::new("  ", 6).is_err());
        assert!(BarcodeFormat::new("P", 0).is_err());
    }
}
