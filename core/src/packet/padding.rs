// Payload padding — every payload fills the packet's fixed payload region
//
// Padding format: [original_data][0x80][0x00...0x00]
// The 0x80 marker indicates start of padding.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaddingError {
    #[error("Message too large for padded region: {0}")]
    MessageTooLarge(usize),
    #[error("Invalid padding format")]
    InvalidPaddingFormat,
}

/// Pad `message` into `out`, which is filled completely.
pub fn pad_into(message: &[u8], out: &mut [u8]) -> Result<(), PaddingError> {
    if message.len() >= out.len() {
        return Err(PaddingError::MessageTooLarge(message.len()));
    }
    out[..message.len()].copy_from_slice(message);
    out[message.len()] = 0x80;
    out[message.len() + 1..].fill(0);
    Ok(())
}

/// Add padding to reach a target size
pub fn pad_message(message: &[u8], target_size: usize) -> Result<Vec<u8>, PaddingError> {
    let mut padded = vec![0u8; target_size];
    pad_into(message, &mut padded)?;
    Ok(padded)
}

/// Strip padding, borrowing the original message.
///
/// Finds the last 0x80 byte and requires everything after it to be zero.
pub fn unpad(padded: &[u8]) -> Result<&[u8], PaddingError> {
    let marker_pos = padded
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or(PaddingError::InvalidPaddingFormat)?;

    if padded[marker_pos] != 0x80 {
        return Err(PaddingError::InvalidPaddingFormat);
    }
    Ok(&padded[..marker_pos])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_unpad() {
        let padded = pad_message(b"hello-world", 64).unwrap();
        assert_eq!(padded.len(), 64);
        assert_eq!(padded[11], 0x80);
        assert_eq!(unpad(&padded).unwrap(), b"hello-world");
    }

    #[test]
    fn test_message_containing_marker() {
        let msg = [0x80, 0x00, 0x80, 0x01];
        let padded = pad_message(&msg, 16).unwrap();
        assert_eq!(unpad(&padded).unwrap(), &msg);
    }

    #[test]
    fn test_empty_message() {
        let padded = pad_message(b"", 8).unwrap();
        assert_eq!(unpad(&padded).unwrap(), b"");
    }

    #[test]
    fn test_too_large() {
        assert_eq!(
            pad_message(&[1u8; 8], 8),
            Err(PaddingError::MessageTooLarge(8))
        );
        assert!(pad_message(&[1u8; 7], 8).is_ok());
    }

    #[test]
    fn test_invalid_padding() {
        assert!(unpad(&[0u8; 16]).is_err());
        assert!(unpad(&[1, 2, 3, 0]).is_err());
    }
}
