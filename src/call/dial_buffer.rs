use crate::error::PhoneError;

/// Keypad characters accepted for DTMF.
pub fn validate_digit(digit: char) -> Result<char, PhoneError> {
    let digit = digit.to_ascii_uppercase();
    match digit {
        '0'..='9' | '*' | '#' | 'A'..='D' => Ok(digit),
        _ => Err(PhoneError::InvalidDigit(digit)),
    }
}

/// Digits typed on the keypad. Kept across calls until cleared.
#[derive(Debug, Default, Clone)]
pub struct DialBuffer {
    digits: String,
}

impl DialBuffer {
    pub fn push(&mut self, digit: char) {
        self.digits.push(digit);
    }

    pub fn clear(&mut self) {
        self.digits.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.digits
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_digit() {
        assert_eq!(validate_digit('5').unwrap(), '5');
        assert_eq!(validate_digit('#').unwrap(), '#');
        assert_eq!(validate_digit('b').unwrap(), 'B');
        assert_eq!(validate_digit('x'), Err(PhoneError::InvalidDigit('X')));
        assert_eq!(validate_digit(' '), Err(PhoneError::InvalidDigit(' ')));
    }

    #[test]
    fn test_buffer_appends_and_clears() {
        let mut buffer = DialBuffer::default();
        for digit in "12*#".chars() {
            buffer.push(digit);
        }
        assert_eq!(buffer.as_str(), "12*#");
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
