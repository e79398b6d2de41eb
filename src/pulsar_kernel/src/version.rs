//! Kernel version
//!
//! The version components come from the package manifest.

/// The major version of the kernel.
pub const VERSION_MAJOR: u8 = parse_component(env!("CARGO_PKG_VERSION_MAJOR"));
/// The minor version of the kernel.
pub const VERSION_MINOR: u8 = parse_component(env!("CARGO_PKG_VERSION_MINOR"));
/// The patch version of the kernel.
pub const VERSION_PATCH: u8 = parse_component(env!("CARGO_PKG_VERSION_PATCH"));

const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

const fn parse_component(s: &str) -> u8 {
    let bytes = s.as_bytes();
    assert!(!bytes.is_empty(), "empty version component");
    let mut value: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        assert!(digit.is_ascii_digit(), "version component is not a number");
        value = value * 10 + (digit - b'0') as u32;
        assert!(value <= u8::MAX as u32, "version component does not fit in a byte");
        i += 1;
    }
    value as u8
}

/// Get the kernel version packed as `major << 16 | minor << 8 | patch`.
#[inline]
pub const fn version() -> u32 {
    (VERSION_MAJOR as u32) << 16 | (VERSION_MINOR as u32) << 8 | VERSION_PATCH as u32
}

/// Get the kernel version as text, e.g., `"1.2.3"`.
#[inline]
pub const fn version_string() -> &'static str {
    VERSION_STRING
}
