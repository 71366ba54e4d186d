//! Runtime configuration knobs (§6 of the design document).

/// Configuration shared by the server dispatcher, the client
/// multiplexer, and the session pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Maximum message size this side will negotiate. The session's
    /// actual `msize` is `min(client_msize, server_max, transport_mtu)`.
    pub msize: u32,
    /// Maximum number of fids a single session may have bound at once.
    pub max_fids: usize,
    /// Maximum number of outstanding tags a client multiplexer may
    /// have allocated at once.
    pub max_tags: usize,
    /// How long a client request waits for its response before the
    /// caller is woken with a timeout error.
    pub request_timeout: std::time::Duration,
    /// Number of session slots in a server's session pool.
    pub pool_size: usize,
    /// Size of each session's receive reassembly buffer.
    pub rx_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            msize: 8192,
            max_fids: 32,
            max_tags: 16,
            request_timeout: std::time::Duration::from_secs(5),
            pool_size: 16,
            rx_buffer_size: 8192,
        }
    }
}
