//! Defaults shared by mesh services

/// Link costs per transport; lower is preferred
pub mod costs {
    /// In-process queue links
    pub const QUEUE: u32 = 1;

    /// Unix domain socket links
    pub const UNIX: u32 = 50;

    /// TCP links
    pub const TCP: u32 = 100;
}

/// Outbound connection defaults
pub mod connections {
    /// Pause between reconnection attempts (milliseconds)
    pub const RECONNECT_DELAY_MS: u64 = 1_000;

    /// Handshake timeout (milliseconds)
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
}

/// Node defaults
pub mod node {
    pub const NAME: &str = "mesh-node";

    pub const LOG_LEVEL: &str = "info";

    /// Prefix of environment variable overrides, e.g. `MESH_NODE__NAME`
    pub const ENV_PREFIX: &str = "MESH";

    /// Maximum frame payload on stream links (bytes)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}
