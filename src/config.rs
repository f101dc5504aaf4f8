/// Tunables for the clip scheduler and its readers.
#[derive(Clone, Debug)]
pub struct ClipConfig {
    /// Upper bound on decoder threads
    pub max_threads: usize,
    /// Load charged to a reader before its first frame reveals the real pixel area.
    pub placeholder_cost: u64,
    /// How long a published frame may stay unpainted before the reader auto-pauses
    pub pause_grace_ms: u64,
    /// Files up to this size are read into memory once instead of streamed
    pub in_memory_limit: u64,
    /// Largest stream accepted in silent looping mode
    pub silent_clip_max_bytes: u64,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            placeholder_cost: 320 * 240,
            pause_grace_ms: 200,
            in_memory_limit: 10 * 1024 * 1024,
            silent_clip_max_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ClipConfig {
    pub fn with_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn with_pause_grace(mut self, pause_grace_ms: u64) -> Self {
        self.pause_grace_ms = pause_grace_ms;
        self
    }
}
