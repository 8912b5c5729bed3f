//! # Driver Configuration
//!
//! All tunables of the memory manager in one `Copy` struct. Values start from
//! [`Default`], can be adjusted with the generated `with_*` builders, and can
//! be layered from `GPU_<FIELD>` environment variables:
//!
//! ```text
//! GPU_VRAM_SIZE=268435456 GPU_SWAP_RETRIES=5 GPU_GENERATION=tesla
//! ```

use crate::generation::ChipGeneration;
use crate::layout::{VRAM_FIRST_USABLE, VRAM_RESERVED, VRAM_TAIL_RESERVED};
use config_derive::Setters;
use core::time::Duration;

/// Prefix of environment variables recognised by [`DriverConfig::from_env`].
pub const ENV_PREFIX: &str = "GPU_";

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config value for `{0}` does not parse")]
    Parse(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Driver-wide configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Setters)]
pub struct DriverConfig {
    /// Selects the page-table backend and page sizes.
    pub generation: ChipGeneration,
    /// Physical VRAM size supplied by the host.
    pub vram_size: u64,
    /// Withheld from the default budget.
    pub vram_reserved: u64,
    /// Swap trigger budget; `0` derives `vram_size - vram_reserved`, capped at
    /// [`DriverConfig::object_vram`].
    pub vram_budget: u64,
    /// Unit of eviction; `0` disables chunking (one chunk per object).
    pub chunk_size: u64,
    /// Driver-private instance memory for page tables and control pages.
    pub instance_size: u64,
    pub swap_retries: u32,
    pub swap_ops_per_client: u32,
    pub swap_max_passes: u32,
    pub pause_timeout_ms: u64,
    pub fence_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    /// Period of the background re-admission pass; `0` disables it.
    pub background_interval_ms: u64,
    /// Threads executing pause/continue tasks.
    pub workers: usize,
    pub rng_seed: u64,
    /// 0 = quiet, 1 = per-operation, 2 = per-entry tracing.
    pub debug_level: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            generation: ChipGeneration::Fermi,
            vram_size: 256 << 20,
            vram_reserved: VRAM_RESERVED,
            vram_budget: 0,
            chunk_size: 32 << 17,
            instance_size: 32 << 20,
            swap_retries: 3,
            swap_ops_per_client: 8,
            swap_max_passes: 4,
            pause_timeout_ms: 5000,
            fence_timeout_ms: 2000,
            flush_timeout_ms: 2000,
            background_interval_ms: 0,
            workers: 2,
            rng_seed: 0x5eed_c0de_0bad_f00d,
            debug_level: 0,
        }
    }
}

impl DriverConfig {
    /// VRAM left for objects once the head, the tail and instance memory are
    /// carved out.
    #[must_use]
    pub const fn object_vram(&self) -> u64 {
        self.vram_size
            .saturating_sub(VRAM_FIRST_USABLE + VRAM_TAIL_RESERVED)
            .saturating_sub(self.instance_size)
    }

    /// The budget the swap manager converges toward. Never exceeds
    /// [`DriverConfig::object_vram`], so eviction starts before the allocator
    /// runs dry.
    #[must_use]
    pub const fn effective_budget(&self) -> u64 {
        let wanted = if self.vram_budget != 0 {
            self.vram_budget
        } else {
            self.vram_size.saturating_sub(self.vram_reserved)
        };
        let usable = self.object_vram();
        if wanted < usable { wanted } else { usable }
    }

    #[inline]
    #[must_use]
    pub const fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub const fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Apply one `GPU_<FIELD>` variable. Keys without the prefix or naming an
    /// unknown field are ignored and return `Ok(false)`.
    ///
    /// # Errors
    /// [`ConfigError::Parse`] if the value does not parse into the field.
    pub fn apply_var(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let Some(field) = key.strip_prefix(ENV_PREFIX) else {
            return Ok(false);
        };
        self.apply_override(field, value).map_err(ConfigError::Parse)
    }

    /// Defaults overridden by `GPU_*` variables from `vars`. Values that do not
    /// parse are skipped with a warning.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            match config.apply_var(key.as_ref(), value.as_ref()) {
                Ok(true) => log::debug!("config: {}={}", key.as_ref(), value.as_ref()),
                Ok(false) => {}
                Err(e) => log::warn!("config: ignoring {}: {e}", key.as_ref()),
            }
        }
        config
    }

    /// Defaults overridden by the process environment.
    #[cfg(feature = "std")]
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first violated constraint.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        let large = self.generation.geometry().large_page;
        if self.vram_size <= crate::layout::VRAM_FIRST_USABLE + crate::layout::VRAM_TAIL_RESERVED {
            return Err(ConfigError::Invalid("vram_size too small"));
        }
        if self.object_vram() == 0 {
            return Err(ConfigError::Invalid("instance_size leaves no vram for objects"));
        }
        if self.vram_budget > self.object_vram() {
            return Err(ConfigError::Invalid("vram_budget exceeds usable vram"));
        }
        if self.effective_budget() == 0 {
            return Err(ConfigError::Invalid("vram budget is zero"));
        }
        if self.chunk_size % large != 0 {
            return Err(ConfigError::Invalid("chunk_size must be a multiple of the large page"));
        }
        if self.instance_size == 0 || self.instance_size % 0x1000 != 0 {
            return Err(ConfigError::Invalid("instance_size must be a non-zero page multiple"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required"));
        }
        Ok(())
    }
}
