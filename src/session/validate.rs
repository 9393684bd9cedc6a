//! Input and terminal-size contracts applied before anything reaches a PTY.

use thiserror::Error;

pub const MIN_COLS: i64 = 1;
pub const MAX_COLS: i64 = 500;
pub const MIN_ROWS: i64 = 1;
pub const MAX_ROWS: i64 = 200;

/// Longest accepted `input` payload, in characters.
pub const MAX_INPUT_LEN: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input is empty")]
    Empty,
    #[error("input is {len} characters (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("input contains a NUL byte")]
    NulByte,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("cols {0} outside {MIN_COLS}..={MAX_COLS}")]
    Cols(i64),
    #[error("rows {0} outside {MIN_ROWS}..={MAX_ROWS}")]
    Rows(i64),
}

pub fn validate_input(data: &str) -> Result<(), InputError> {
    if data.is_empty() {
        return Err(InputError::Empty);
    }
    if data.contains('\0') {
        return Err(InputError::NulByte);
    }
    // Byte length bounds the char count, so only count when it could matter.
    if data.len() > MAX_INPUT_LEN {
        let len = data.chars().count();
        if len > MAX_INPUT_LEN {
            return Err(InputError::TooLong {
                len,
                max: MAX_INPUT_LEN,
            });
        }
    }
    Ok(())
}

/// Check a requested size and narrow it to PTY dimensions `(cols, rows)`.
pub fn validate_size(cols: i64, rows: i64) -> Result<(u16, u16), SizeError> {
    let cols = u16::try_from(cols)
        .ok()
        .filter(|c| (MIN_COLS..=MAX_COLS).contains(&i64::from(*c)))
        .ok_or(SizeError::Cols(cols))?;
    let rows = u16::try_from(rows)
        .ok()
        .filter(|r| (MIN_ROWS..=MAX_ROWS).contains(&i64::from(*r)))
        .ok_or(SizeError::Rows(rows))?;
    Ok((cols, rows))
}
