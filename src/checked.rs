//! Width-narrowing conversions and byte-order swaps with runtime range checks.
//!
//! Header fields are narrow; sizes and counters in the rest of the crate are
//! not. Every narrowing on the packet-building path goes through
//! [`numeric_cast`] so an impossible value fails loudly instead of being
//! silently truncated into a header.

use std::any::type_name;
use std::fmt::Display;

use crate::error::RangeError;

/// Convert `value` to `U`, failing with [`RangeError`] if it is not
/// representable.
pub fn numeric_cast<T, U>(value: T) -> Result<U, RangeError>
where
    T: Copy + Display,
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| RangeError {
        value: value.to_string(),
        target: type_name::<U>(),
    })
}

/// Range-checked host to network order conversion for 16-bit fields.
pub fn hton16<T>(value: T) -> Result<u16, RangeError>
where
    T: Copy + Display,
    u16: TryFrom<T>,
{
    Ok(numeric_cast::<T, u16>(value)?.to_be())
}

/// Range-checked host to network order conversion for 32-bit fields.
pub fn hton32<T>(value: T) -> Result<u32, RangeError>
where
    T: Copy + Display,
    u32: TryFrom<T>,
{
    Ok(numeric_cast::<T, u32>(value)?.to_be())
}

/// Network to host order for 16-bit fields.
pub fn ntoh16(value: u16) -> u16 {
    u16::from_be(value)
}

/// Network to host order for 32-bit fields.
pub fn ntoh32(value: u32) -> u32 {
    u32::from_be(value)
}
