//! HRESULT-style status codes exchanged across the elevation boundary.

pub const S_OK: u32 = 0;
pub const S_FALSE: u32 = 1;
pub const S_REBOOT_REQUIRED: u32 = 0x0000_0BC2;
pub const S_REBOOT_INITIATED: u32 = 0x0000_0BC3;

pub const E_FAIL: u32 = 0x8000_4005;
pub const E_ABORT: u32 = 0x8000_4004;
pub const E_INVALIDARG: u32 = 0x8007_0057;
pub const E_NOTFOUND: u32 = 0x8007_0490;
pub const E_INVALIDSTATE: u32 = 0x8007_139F;
pub const E_INSTALLUSEREXIT: u32 = 0x8007_0642;

pub fn succeeded(code: u32) -> bool {
    code & 0x8000_0000 == 0
}

pub fn failed(code: u32) -> bool {
    !succeeded(code)
}

/// Maps a process exit code to a failure status. Exit code zero maps to `S_OK`.
pub fn from_exit_code(exit_code: u32) -> u32 {
    if exit_code == 0 {
        S_OK
    } else if exit_code & 0x8000_0000 != 0 {
        exit_code
    } else {
        0x8007_0000 | (exit_code & 0xFFFF)
    }
}

pub fn describe(code: u32) -> String {
    let name = match code {
        S_OK => "S_OK",
        S_FALSE => "S_FALSE",
        S_REBOOT_REQUIRED => "S_REBOOT_REQUIRED",
        S_REBOOT_INITIATED => "S_REBOOT_INITIATED",
        E_FAIL => "E_FAIL",
        E_ABORT => "E_ABORT",
        E_INVALIDARG => "E_INVALIDARG",
        E_NOTFOUND => "E_NOTFOUND",
        E_INVALIDSTATE => "E_INVALIDSTATE",
        E_INSTALLUSEREXIT => "E_INSTALLUSEREXIT",
        _ => return format!("0x{code:08x}"),
    };
    format!("{name} (0x{code:08x})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_win32_failures() {
        assert_eq!(from_exit_code(0), S_OK);
        assert_eq!(from_exit_code(5), 0x8007_0005);
        assert_eq!(from_exit_code(0x8000_4005), E_FAIL);
        assert!(failed(from_exit_code(1603)));
    }

    #[test]
    fn reboot_codes_are_successes() {
        assert!(succeeded(S_REBOOT_REQUIRED));
        assert!(succeeded(S_REBOOT_INITIATED));
        assert!(failed(E_ABORT));
        assert_eq!(describe(E_NOTFOUND), "E_NOTFOUND (0x80070490)");
        assert_eq!(describe(0x1234), "0x00001234");
    }
}
