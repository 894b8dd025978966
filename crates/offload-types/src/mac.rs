//! MAC address type.

use std::fmt;

/// A 48-bit Ethernet MAC address.
///
/// # Examples
///
/// ```
/// use offload_types::MacAddress;
///
/// let frame = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x08, 0x00];
/// let mac = MacAddress::from_slice(&frame).unwrap();
/// assert_eq!(mac, MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
/// assert_eq!(mac.to_string(), "00:11:22:33:44:55");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The zero MAC address.
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    /// Creates a new MAC address from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Reads a MAC address from the first six bytes of a frame slice.
    ///
    /// Returns `None` if the slice is shorter than six bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddress(octets))
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}
