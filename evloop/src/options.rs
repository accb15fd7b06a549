//! Loop construction options.

use crate::error::EvloopError;

/// Governs whether the loop falls back to a channel-based wake instead of
/// arming the OS poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FastPathPolicy {
    /// Use fast mode only while no file descriptor is registered; switch to
    /// the OS poller the moment one is.
    #[default]
    Auto,
    /// Always use fast mode; `register_fd` becomes a programmer error.
    Force,
    /// Never use fast mode, even with zero registered descriptors.
    Never,
}

/// Selects which of the two ingress-queue implementations backs
/// [`crate::driver::Loop::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngressBackend {
    /// The 128-slot-chunked queue ([`crate::chunked_ingress::ChunkedIngress`]):
    /// avoids a per-task node allocation in the steady-state ping-pong case
    /// via in-place cursor reset. The default.
    #[default]
    Chunked,
    /// The Michael-Scott singly-linked queue ([`crate::ingress::Ingress`]):
    /// one allocation per task, no chunk bookkeeping. Useful as a simpler
    /// baseline, or where the chunk pool's memory footprint is undesirable.
    Linked,
}

const DEFAULT_MICROTASK_RING_CAPACITY: usize = 4096;
const DEFAULT_INGRESS_CHUNK_SIZE: usize = 128;
const MIN_CHUNK_SIZE: usize = 16;
const MAX_CHUNK_SIZE: usize = 4096;
const DEFAULT_INGRESS_DRAIN_BATCH: usize = 64;

/// Construction-time configuration for [`crate::driver::Loop`].
///
/// Invalid values (non-power-of-two sizes out of range) are rejected
/// immediately by [`LoopOptions::build`] rather than silently clamped,
/// matching the "programmer error" bucket in the crate's error taxonomy.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub(crate) metrics_enabled: bool,
    pub(crate) strict_microtask_ordering: bool,
    pub(crate) fast_path_policy: FastPathPolicy,
    pub(crate) ingress_backend: IngressBackend,
    pub(crate) ingress_chunk_size: usize,
    pub(crate) microtask_ring_capacity: usize,
    pub(crate) ingress_drain_batch: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            strict_microtask_ordering: false,
            fast_path_policy: FastPathPolicy::default(),
            ingress_backend: IngressBackend::default(),
            ingress_chunk_size: DEFAULT_INGRESS_CHUNK_SIZE,
            microtask_ring_capacity: DEFAULT_MICROTASK_RING_CAPACITY,
            ingress_drain_batch: DEFAULT_INGRESS_DRAIN_BATCH,
        }
    }
}

/// Builder for [`LoopOptions`]. Chain setters, then call [`Self::build`].
#[derive(Debug, Clone, Default)]
pub struct LoopOptionsBuilder {
    opts: LoopOptions,
}

impl LoopOptionsBuilder {
    /// Starts from the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the rolling-window metrics collector.
    #[must_use]
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.opts.metrics_enabled = enabled;
        self
    }

    /// When set, microtasks scheduled from an I/O callback run immediately
    /// after that callback instead of being deferred to the next tick's
    /// microtask-drain phase.
    #[must_use]
    pub fn strict_microtask_ordering(mut self, strict: bool) -> Self {
        self.opts.strict_microtask_ordering = strict;
        self
    }

    /// Sets the fast-path policy (see [`FastPathPolicy`]).
    #[must_use]
    pub fn fast_path_policy(mut self, policy: FastPathPolicy) -> Self {
        self.opts.fast_path_policy = policy;
        self
    }

    /// Sets which ingress-queue implementation backs `submit` (see
    /// [`IngressBackend`]).
    #[must_use]
    pub fn ingress_backend(mut self, backend: IngressBackend) -> Self {
        self.opts.ingress_backend = backend;
        self
    }

    /// Sets the chunked-ingress slot count per chunk. Must be a power of
    /// two in `[16, 4096]`; validated at [`Self::build`].
    #[must_use]
    pub fn ingress_chunk_size(mut self, size: usize) -> Self {
        self.opts.ingress_chunk_size = size;
        self
    }

    /// Sets the microtask ring's capacity. Must be a power of two;
    /// validated at [`Self::build`].
    #[must_use]
    pub fn microtask_ring_capacity(mut self, capacity: usize) -> Self {
        self.opts.microtask_ring_capacity = capacity;
        self
    }

    /// Sets how many ingress tasks are drained per tick before the
    /// microtask phase begins.
    #[must_use]
    pub fn ingress_drain_batch(mut self, batch: usize) -> Self {
        self.opts.ingress_drain_batch = batch;
        self
    }

    /// Validates and finalizes the options.
    ///
    /// # Errors
    ///
    /// Returns [`EvloopError::InvalidOption`] if `ingress_chunk_size` is
    /// not a power of two in `[16, 4096]`, or if `microtask_ring_capacity`
    /// is not a power of two, or if `ingress_drain_batch` is zero.
    pub fn build(self) -> Result<LoopOptions, EvloopError> {
        let opts = self.opts;

        if !opts.ingress_chunk_size.is_power_of_two()
            || opts.ingress_chunk_size < MIN_CHUNK_SIZE
            || opts.ingress_chunk_size > MAX_CHUNK_SIZE
        {
            return Err(EvloopError::InvalidOption(format!(
                "ingress_chunk_size must be a power of two in [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}], got {}",
                opts.ingress_chunk_size
            )));
        }

        if !opts.microtask_ring_capacity.is_power_of_two() {
            return Err(EvloopError::InvalidOption(format!(
                "microtask_ring_capacity must be a power of two, got {}",
                opts.microtask_ring_capacity
            )));
        }

        if opts.ingress_drain_batch == 0 {
            return Err(EvloopError::InvalidOption(
                "ingress_drain_batch must be nonzero".to_string(),
            ));
        }

        Ok(opts)
    }
}

impl LoopOptions {
    /// Starts a new builder.
    #[must_use]
    pub fn builder() -> LoopOptionsBuilder {
        LoopOptionsBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        LoopOptions::builder().build().expect("defaults must validate");
    }

    #[test]
    fn rejects_non_power_of_two_chunk_size() {
        let err = LoopOptions::builder()
            .ingress_chunk_size(100)
            .build()
            .unwrap_err();
        assert!(matches!(err, EvloopError::InvalidOption(_)));
    }

    #[test]
    fn rejects_chunk_size_out_of_range() {
        assert!(LoopOptions::builder().ingress_chunk_size(8).build().is_err());
        assert!(LoopOptions::builder()
            .ingress_chunk_size(8192)
            .build()
            .is_err());
    }

    #[test]
    fn rejects_zero_drain_batch() {
        assert!(LoopOptions::builder()
            .ingress_drain_batch(0)
            .build()
            .is_err());
    }
}
