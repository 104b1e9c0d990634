use thiserror::Error;

/// Configuration errors reported by [`Bus::new`](crate::Bus::new).
///
/// These cover host-side setup mistakes that are detectable before any
/// device model runs. Device-model bugs discovered later (duplicate handler
/// registration, unrepresentable mapping ranges) are fatal and panic instead;
/// see the crate-level error-handling notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BusError {
    /// The configured two-level granule is not a power of two.
    #[error("two-level granule {granule:#x} is not a power of two")]
    GranuleNotPowerOfTwo {
        /// The rejected granule value.
        granule: u32,
    },
    /// The configured two-level granule is outside the supported range.
    #[error("two-level granule {granule:#x} is outside 2..=1 MiB")]
    GranuleOutOfRange {
        /// The rejected granule value.
        granule: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::BusError;

    #[test]
    fn error_messages_name_the_offending_granule() {
        let err = BusError::GranuleNotPowerOfTwo { granule: 0x300 };
        assert!(err.to_string().contains("0x300"));

        let err = BusError::GranuleOutOfRange { granule: 0x0020_0000 };
        assert!(err.to_string().contains("0x200000"));
    }
}
