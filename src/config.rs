//! Runtime configuration knobs (spec §9's open questions, resolved as
//! defaults here and overridable by the front-end that builds a `Nitro`).

/// - `flush_caches_every_event`: invalidate the memory view's four caches
///   at the top of every `process_event` (§9 open question 1). Default
///   `true`; the correctness/performance trade-off of disabling it is the
///   caller's to make explicitly.
/// - `syscall_filtering`: push/pop the corresponding in-kernel selector
///   filter whenever a hook is (un)registered, so the hypervisor only
///   traps syscalls someone actually hooked.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub flush_caches_every_event: bool,
    pub syscall_filtering: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flush_caches_every_event: true,
            syscall_filtering: true,
        }
    }
}
