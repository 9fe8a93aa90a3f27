//! Bitfield codecs for register decode and encode
//!
//! Every named register field carries a `function` describing how the raw
//! sub-field translates to a physical value. Four functions exist:
//!
//! | Function        | Decode                                |
//! |-----------------|---------------------------------------|
//! | `scale`         | `field * scalar`                      |
//! | `log_half`      | `scalar / 2^field`                    |
//! | `7_bit_float`   | `scalar * 2^Y * (1 + Z/4)`            |
//! | `overflow`      | monotonic counter with wrap tracking  |
//!
//! The 7-bit float packs a 5-bit exponent `Y` in bits 0-4 and a 2-bit
//! mantissa `Z` in bits 5-6. Wrap accumulation for `overflow` is stateful
//! and lives with the signal that samples the counter; this module only
//! provides the per-sample arithmetic.

pub type Result<T> = std::result::Result<T, FieldError>;

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("bit range {begin}..={end} is not a valid 64-bit field")]
    InvalidRange { begin: u32, end: u32 },

    #[error("value {value} is not representable by the {function:?} codec")]
    Overflow { value: f64, function: Function },

    #[error("the {0:?} codec has no encode direction")]
    NotEncodable(Function),

    #[error("unknown field function name: {0:?}")]
    UnknownFunction(String),
}

/// Decode/encode function assigned to a register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Scale,
    LogHalf,
    SevenBitFloat,
    Overflow,
}

impl Function {
    /// Parse the function name used by the register metadata documents.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "scale" => Ok(Self::Scale),
            "log_half" => Ok(Self::LogHalf),
            "7_bit_float" => Ok(Self::SevenBitFloat),
            "overflow" => Ok(Self::Overflow),
            _ => Err(FieldError::UnknownFunction(name.to_string())),
        }
    }
}

/// Contiguous bit mask covering `begin..=end` of a 64-bit register.
pub fn field_mask(begin: u32, end: u32) -> Result<u64> {
    if begin > end || end > 63 {
        return Err(FieldError::InvalidRange { begin, end });
    }
    let width = end - begin + 1;
    if width == 64 {
        Ok(u64::MAX)
    } else {
        Ok(((1u64 << width) - 1) << begin)
    }
}

/// Extract the sub-field selected by `mask`, shifted down to bit zero.
pub fn extract(raw: u64, mask: u64, shift: u32) -> u64 {
    (raw & mask) >> shift
}

/// Decode an extracted sub-field to a physical value.
///
/// `Overflow` fields decode as a plain count here; wrap accumulation is the
/// caller's state.
pub fn decode(field: u64, function: Function, scalar: f64) -> f64 {
    match function {
        Function::Scale => field as f64 * scalar,
        Function::LogHalf => scalar / 2f64.powi(field as i32),
        Function::SevenBitFloat => {
            let exponent = field & 0x1F;
            let mantissa = (field >> 5) & 0x3;
            scalar * 2f64.powi(exponent as i32) * (1.0 + mantissa as f64 / 4.0)
        }
        Function::Overflow => field as f64,
    }
}

/// Encode a physical value into an unshifted sub-field.
///
/// The inverse of [`decode`] for the writable functions. `overflow` counters
/// are read-only by construction and have no encode direction.
pub fn encode(value: f64, function: Function, scalar: f64) -> Result<u64> {
    match function {
        Function::Scale => {
            let field = (value / scalar).round();
            if field < 0.0 || field > u64::MAX as f64 || !field.is_finite() {
                return Err(FieldError::Overflow { value, function });
            }
            Ok(field as u64)
        }
        Function::LogHalf => {
            if value <= 0.0 || scalar / value < 1.0 {
                return Err(FieldError::Overflow { value, function });
            }
            Ok((scalar / value).log2().round() as u64)
        }
        Function::SevenBitFloat => {
            let ratio = value / scalar;
            if !(ratio >= 1.0) || !ratio.is_finite() {
                return Err(FieldError::Overflow { value, function });
            }
            let mut exponent = ratio.log2().floor() as u64;
            let mut mantissa = (4.0 * (ratio / 2f64.powi(exponent as i32) - 1.0)).round() as u64;
            if mantissa == 4 {
                exponent += 1;
                mantissa = 0;
            }
            if exponent >= 0x20 {
                return Err(FieldError::Overflow { value, function });
            }
            Ok((mantissa << 5) | exponent)
        }
        Function::Overflow => Err(FieldError::NotEncodable(function)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_mask() {
        assert_eq!(field_mask(0, 0).unwrap(), 0x1);
        assert_eq!(field_mask(0, 14).unwrap(), 0x7FFF);
        assert_eq!(field_mask(16, 23).unwrap(), 0xFF0000);
        assert_eq!(field_mask(0, 63).unwrap(), u64::MAX);
        assert!(field_mask(5, 4).is_err());
        assert!(field_mask(0, 64).is_err());
    }

    #[test]
    fn test_extract() {
        let mask = field_mask(16, 23).unwrap();
        assert_eq!(extract(0xF1458321, mask, 16), 0x45);
    }

    #[test]
    fn test_scale_round_trip() {
        let scalar = 0.125;
        for field in [0u64, 1, 0x45, 0x7FFF] {
            let value = decode(field, Function::Scale, scalar);
            assert_eq!(encode(value, Function::Scale, scalar).unwrap(), field);
        }
    }

    #[test]
    fn test_log_half_round_trip() {
        let scalar = 1.0;
        assert_eq!(decode(0x2, Function::LogHalf, scalar), 0.25);
        for field in 0u64..16 {
            let value = decode(field, Function::LogHalf, scalar);
            assert_eq!(encode(value, Function::LogHalf, scalar).unwrap(), field);
        }
    }

    #[test]
    fn test_seven_bit_float_decode() {
        // Exponent 1, mantissa 2: 2^1 * 1.5 = 3.0
        assert_eq!(decode(0x41, Function::SevenBitFloat, 3.0), 9.0);
        // Exponent 0, mantissa 0
        assert_eq!(decode(0x0, Function::SevenBitFloat, 1.0), 1.0);
    }

    #[test]
    fn test_seven_bit_float_representable_round_trip() {
        for exponent in 0u64..0x20 {
            for mantissa in 0u64..4 {
                let field = (mantissa << 5) | exponent;
                let value = decode(field, Function::SevenBitFloat, 1.0);
                assert_eq!(encode(value, Function::SevenBitFloat, 1.0).unwrap(), field);
            }
        }
    }

    #[test]
    fn test_seven_bit_float_quantization_error() {
        // Any value in range lands within 25% of itself after a round trip.
        let mut value = 1.0;
        while value < 2e9 {
            let field = encode(value, Function::SevenBitFloat, 1.0).unwrap();
            let decoded = decode(field, Function::SevenBitFloat, 1.0);
            assert!(
                (decoded - value).abs() <= 0.25 * value,
                "value {value} decoded to {decoded}"
            );
            value *= 1.1;
        }
    }

    #[test]
    fn test_seven_bit_float_overflow() {
        assert!(matches!(
            encode(2f64.powi(40), Function::SevenBitFloat, 1.0),
            Err(FieldError::Overflow { .. })
        ));
        assert!(matches!(
            encode(0.5, Function::SevenBitFloat, 1.0),
            Err(FieldError::Overflow { .. })
        ));
    }

    #[test]
    fn test_overflow_not_encodable() {
        assert!(matches!(
            encode(1.0, Function::Overflow, 1.0),
            Err(FieldError::NotEncodable(Function::Overflow))
        ));
    }

    #[test]
    fn test_function_names() {
        assert_eq!(Function::from_name("scale").unwrap(), Function::Scale);
        assert_eq!(Function::from_name("log_half").unwrap(), Function::LogHalf);
        assert_eq!(
            Function::from_name("7_bit_float").unwrap(),
            Function::SevenBitFloat
        );
        assert_eq!(Function::from_name("overflow").unwrap(), Function::Overflow);
        assert!(Function::from_name("bogus").is_err());
    }
}
