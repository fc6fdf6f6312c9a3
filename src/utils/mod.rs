use crate::error::Result;
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Random number utilities
pub mod random {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Create RNG with fixed seed
    pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }
}

/// Validation utilities
pub mod validation {
    use crate::error::{OctError, Result};
    use std::fmt::Display;

    /// Validate that value is in range
    pub fn in_range<T: PartialOrd + Display>(value: T, min: T, max: T, name: &str) -> Result<()> {
        if value < min || value > max {
            return Err(OctError::config(format!(
                "{} must be between {} and {}, got {}",
                name, min, max, value
            )));
        }
        Ok(())
    }

    /// Validate that value is positive
    pub fn positive<T: PartialOrd + Default + Display>(value: T, name: &str) -> Result<()> {
        if value <= T::default() {
            return Err(OctError::config(format!("{} must be positive, got {}", name, value)));
        }
        Ok(())
    }
}
