/// Capacity of the records array when nothing else is configured.
pub const DEFAULT_MAX_ALLOC_COUNT: usize = 1024;

/// Bucket count when nothing else is configured. Prime, so payload
/// addresses that share their low bits still spread across buckets.
pub const DEFAULT_HASH_SIZE: usize = 127;

/// Sizing of the detector's per-run tracking index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerSettings {
    /// Upper bound on allocated nodes a heap may hold for a run to proceed.
    pub max_alloc_count: usize,
    /// Number of hash buckets. Must not exceed `u32::MAX`.
    pub hash_size: usize,
}

impl CheckerSettings {
    pub const DEFAULT: Self = Self {
        max_alloc_count: DEFAULT_MAX_ALLOC_COUNT,
        hash_size: DEFAULT_HASH_SIZE,
    };

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_alloc_count == 0 || self.hash_size == 0 {
            return Err("max_alloc_count and hash_size must be > 0");
        }
        // record links are u32 with u32::MAX as the end marker
        if self.max_alloc_count >= u32::MAX as usize {
            return Err("max_alloc_count must fit a 32-bit record index");
        }
        if self.hash_size >= u32::MAX as usize {
            return Err("hash_size must fit a 32-bit bucket index");
        }
        Ok(())
    }
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(CheckerSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let settings = CheckerSettings {
            max_alloc_count: 0,
            ..CheckerSettings::DEFAULT
        };
        assert!(settings.validate().is_err());

        let settings = CheckerSettings {
            hash_size: 0,
            ..CheckerSettings::DEFAULT
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let settings = CheckerSettings {
            max_alloc_count: u32::MAX as usize,
            ..CheckerSettings::DEFAULT
        };
        assert_eq!(
            settings.validate(),
            Err("max_alloc_count must fit a 32-bit record index")
        );
    }
}
