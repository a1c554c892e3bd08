//! HRESULT-style result codes
//!
//! Codes are signed 32-bit values: negative means failure, zero or positive
//! means success. They are persisted verbatim by the status store, so the
//! numeric values are part of the on-disk format.

/// Success
pub const S_OK: i32 = 0;
/// Success, but nothing needed to be done
pub const S_FALSE: i32 = 1;
/// Unspecified failure
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
/// Catastrophic failure / unexpected state
pub const E_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
/// An argument was invalid
pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
/// The operation was cancelled
pub const E_ABORT: i32 = 0x8000_4004_u32 as i32;

// Configuration set errors

pub const INVALID_CONFIGURATION_FILE: i32 = 0x8A15_C001_u32 as i32;
pub const INVALID_YAML: i32 = 0x8A15_C002_u32 as i32;
pub const INVALID_FIELD_TYPE: i32 = 0x8A15_C003_u32 as i32;
pub const UNKNOWN_CONFIGURATION_FILE_VERSION: i32 = 0x8A15_C004_u32 as i32;
pub const SET_APPLY_FAILED: i32 = 0x8A15_C005_u32 as i32;
pub const DUPLICATE_IDENTIFIER: i32 = 0x8A15_C006_u32 as i32;
pub const MISSING_DEPENDENCY: i32 = 0x8A15_C007_u32 as i32;
pub const DEPENDENCY_UNSATISFIED: i32 = 0x8A15_C008_u32 as i32;
pub const ASSERTION_FAILED: i32 = 0x8A15_C009_u32 as i32;
pub const MANUALLY_SKIPPED: i32 = 0x8A15_C00A_u32 as i32;
pub const WARNING_NOT_ACCEPTED: i32 = 0x8A15_C00B_u32 as i32;
pub const SET_DEPENDENCY_CYCLE: i32 = 0x8A15_C00C_u32 as i32;
pub const INVALID_FIELD_VALUE: i32 = 0x8A15_C00D_u32 as i32;
pub const MISSING_FIELD: i32 = 0x8A15_C00E_u32 as i32;
pub const TEST_FAILED: i32 = 0x8A15_C00F_u32 as i32;
pub const TEST_NOT_RUN: i32 = 0x8A15_C010_u32 as i32;
pub const GET_FAILED: i32 = 0x8A15_C011_u32 as i32;
pub const HISTORY_ITEM_NOT_FOUND: i32 = 0x8A15_C012_u32 as i32;

/// Whether a code represents success (including `S_FALSE`)
pub const fn succeeded(code: i32) -> bool {
    code >= 0
}

/// Whether a code represents failure
pub const fn failed(code: i32) -> bool {
    code < 0
}

/// Short symbolic name for a known code, for log output
pub fn name(code: i32) -> Option<&'static str> {
    let name = match code {
        S_OK => "S_OK",
        S_FALSE => "S_FALSE",
        E_FAIL => "E_FAIL",
        E_UNEXPECTED => "E_UNEXPECTED",
        E_INVALIDARG => "E_INVALIDARG",
        E_ABORT => "E_ABORT",
        INVALID_CONFIGURATION_FILE => "INVALID_CONFIGURATION_FILE",
        INVALID_YAML => "INVALID_YAML",
        INVALID_FIELD_TYPE => "INVALID_FIELD_TYPE",
        UNKNOWN_CONFIGURATION_FILE_VERSION => "UNKNOWN_CONFIGURATION_FILE_VERSION",
        SET_APPLY_FAILED => "SET_APPLY_FAILED",
        DUPLICATE_IDENTIFIER => "DUPLICATE_IDENTIFIER",
        MISSING_DEPENDENCY => "MISSING_DEPENDENCY",
        DEPENDENCY_UNSATISFIED => "DEPENDENCY_UNSATISFIED",
        ASSERTION_FAILED => "ASSERTION_FAILED",
        MANUALLY_SKIPPED => "MANUALLY_SKIPPED",
        WARNING_NOT_ACCEPTED => "WARNING_NOT_ACCEPTED",
        SET_DEPENDENCY_CYCLE => "SET_DEPENDENCY_CYCLE",
        INVALID_FIELD_VALUE => "INVALID_FIELD_VALUE",
        MISSING_FIELD => "MISSING_FIELD",
        TEST_FAILED => "TEST_FAILED",
        TEST_NOT_RUN => "TEST_NOT_RUN",
        GET_FAILED => "GET_FAILED",
        HISTORY_ITEM_NOT_FOUND => "HISTORY_ITEM_NOT_FOUND",
        _ => return None,
    };
    Some(name)
}

/// Format a code for display: symbolic name when known, hex otherwise
pub fn describe(code: i32) -> String {
    match name(code) {
        Some(name) => format!("{name} (0x{:08X})", code as u32),
        None => format!("0x{:08X}", code as u32),
    }
}
