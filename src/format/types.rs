//! Tensor data types of the container format
//!
//! The type code enumeration is closed and versioned: three historical
//! 4-bit variants are still recognized so that diagnostics can name them,
//! but any attempt to load or produce them fails.

/// Magic number at offset 0 of every model file
pub const FILE_MAGIC: u32 = 0x6767_6d66;

/// Oldest readable file version
pub const FILE_VERSION_MIN: u32 = 100;

/// Newest readable file version
pub const FILE_VERSION_MAX: u32 = 101;

/// Version stamped on newly written full-precision files
pub const FILE_VERSION: u32 = 101;

/// The one version quantized-payload files must carry
///
/// Files whose header data type is block-quantized are rejected at any other
/// version, and the quantizer stamps this version on quantized outputs.
pub const QUANTIZED_FILE_VERSION: u32 = 100;

/// Data type of a tensor payload
///
/// Codes match the on-disk `u32` values. `Q4_1O`, `Q4_2` and `Q4_3` are
/// removed formats: they are kept so error messages can name them, and
/// [`TensorType::is_removed`] reports them.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TensorType {
    /// 32-bit IEEE 754 float
    F32 = 0,
    /// 16-bit IEEE 754 half-precision float
    F16 = 1,
    /// 4-bit blocks of 32, one f16 scale per block
    Q4_0 = 2,
    /// 4-bit blocks of 32, f16 scale and f16 minimum per block
    Q4_1 = 3,
    /// Removed 4-bit outlier format
    Q4_1O = 4,
    /// Removed 4-bit format
    Q4_2 = 5,
    /// Removed 4-bit format
    Q4_3 = 6,
    /// 5-bit blocks of 32, one f16 scale per block
    Q5_0 = 7,
    /// 5-bit blocks of 32, f16 scale and f16 minimum per block
    Q5_1 = 8,
    /// 8-bit blocks of 32, one f16 scale per block
    Q8_0 = 9,
}

/// Number of defined type codes
pub(crate) const TYPE_COUNT: u32 = 10;

impl TensorType {
    /// All defined types, in code order.
    const ALL: [TensorType; TYPE_COUNT as usize] = [
        TensorType::F32,
        TensorType::F16,
        TensorType::Q4_0,
        TensorType::Q4_1,
        TensorType::Q4_1O,
        TensorType::Q4_2,
        TensorType::Q4_3,
        TensorType::Q5_0,
        TensorType::Q5_1,
        TensorType::Q8_0,
    ];

    /// Decode an on-disk type code. Returns `None` for out-of-range codes.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The on-disk `u32` code of this type.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Canonical name, as accepted by the quantizer CLI.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TensorType::F32 => "f32",
            TensorType::F16 => "f16",
            TensorType::Q4_0 => "Q4_0",
            TensorType::Q4_1 => "Q4_1",
            TensorType::Q4_1O => "Q4_1_O",
            TensorType::Q4_2 => "Q4_2",
            TensorType::Q4_3 => "Q4_3",
            TensorType::Q5_0 => "Q5_0",
            TensorType::Q5_1 => "Q5_1",
            TensorType::Q8_0 => "Q8_0",
        }
    }

    /// Parse a canonical type name. Returns `None` for unknown names.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Whether this is one of the removed formats.
    #[must_use]
    pub fn is_removed(self) -> bool {
        matches!(self, TensorType::Q4_1O | TensorType::Q4_2 | TensorType::Q4_3)
    }

    /// Whether this type stores block-quantized data (anything but F32/F16).
    #[must_use]
    pub fn is_quantized(self) -> bool {
        !matches!(self, TensorType::F32 | TensorType::F16)
    }

    /// Elements per quantization block (1 for the scalar float types).
    #[must_use]
    pub fn block_elements(self) -> usize {
        if self.is_quantized() {
            32
        } else {
            1
        }
    }

    /// Bytes per quantization block.
    ///
    /// Removed formats report 0: their headers never pass validation, so no
    /// payload of a removed type is ever sized.
    #[must_use]
    pub fn block_bytes(self) -> usize {
        match self {
            TensorType::F32 => 4,
            TensorType::F16 => 2,
            TensorType::Q4_0 => 18,
            TensorType::Q4_1 => 20,
            TensorType::Q5_0 => 22,
            TensorType::Q5_1 => 24,
            TensorType::Q8_0 => 34,
            TensorType::Q4_1O | TensorType::Q4_2 | TensorType::Q4_3 => 0,
        }
    }

    /// Payload size in bytes of a `width x height` tensor of this type.
    ///
    /// Rows are whole blocks; widths that are not a block multiple round up
    /// to the next block boundary, matching the writer.
    #[must_use]
    pub fn payload_bytes(self, width: u64, height: u64) -> u64 {
        let blocks_per_row = width.div_ceil(self.block_elements() as u64);
        blocks_per_row * self.block_bytes() as u64 * height
    }
}

impl std::fmt::Display for TensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0..TYPE_COUNT {
            let t = TensorType::from_code(code).expect("code in range");
            assert_eq!(t.code(), code);
        }
        assert!(TensorType::from_code(TYPE_COUNT).is_none());
        assert!(TensorType::from_code(u32::MAX).is_none());
    }

    #[test]
    fn test_name_roundtrip() {
        for code in 0..TYPE_COUNT {
            let t = TensorType::from_code(code).expect("code in range");
            assert_eq!(TensorType::from_name(t.name()), Some(t));
        }
        assert!(TensorType::from_name("Q9_9").is_none());
        assert!(TensorType::from_name("F32").is_none()); // names are case-exact
    }

    #[test]
    fn test_removed_flags() {
        assert!(TensorType::Q4_1O.is_removed());
        assert!(TensorType::Q4_2.is_removed());
        assert!(TensorType::Q4_3.is_removed());
        assert!(!TensorType::Q4_0.is_removed());
        assert!(!TensorType::F32.is_removed());
    }

    #[test]
    fn test_quantized_flags() {
        assert!(!TensorType::F32.is_quantized());
        assert!(!TensorType::F16.is_quantized());
        assert!(TensorType::Q4_0.is_quantized());
        assert!(TensorType::Q8_0.is_quantized());
    }

    #[test]
    fn test_payload_bytes() {
        // 64 f32 elements = 256 bytes
        assert_eq!(TensorType::F32.payload_bytes(64, 1), 256);
        // 64 f16 elements = 128 bytes
        assert_eq!(TensorType::F16.payload_bytes(64, 1), 128);
        // two Q4_0 blocks per row, three rows
        assert_eq!(TensorType::Q4_0.payload_bytes(64, 3), 18 * 2 * 3);
        // one Q8_0 block
        assert_eq!(TensorType::Q8_0.payload_bytes(32, 1), 34);
    }

    #[test]
    fn test_payload_bytes_64_bit() {
        // A single 2-D tensor larger than 4 GiB must size without overflow.
        let bytes = TensorType::F32.payload_bytes(1 << 20, 1 << 12);
        assert_eq!(bytes, 1u64 << 34);
    }
}
