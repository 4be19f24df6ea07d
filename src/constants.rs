//! Global constants for probing and result comparison

// ============================================================================
// PORTS
// ============================================================================

/// Plain HTTP port used by the TCP handshake probe
pub const HTTP_PORT: u16 = 80;

/// HTTPS port; the certificate probe only runs against it
pub const HTTPS_PORT: u16 = 443;

/// First UDP destination port used by traceroute probes
pub const TRACE_BASE_PORT: u16 = 33434;

// ============================================================================
// PROBE LIMITS
// ============================================================================

/// Maximum TTL tried by traceroute
pub const MAX_HOPS: u8 = 30;

/// Receive buffer for raw ICMP sockets
pub const ICMP_RECV_BUFFER: usize = 1024;

/// Upper bound on bytes read by raw HTTP exchanges
pub const RAW_RESPONSE_LIMIT: usize = 64 * 1024;

/// Targets per output file
pub const BATCH_SIZE: usize = 10;

// ============================================================================
// REQUEST SHAPES
// ============================================================================

/// Browser-like user agent for ordinary GET requests
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (HTML, like Gecko) Chrome/97.0.4692.99 Safari/537.36";

/// Header name with deliberately mixed case for the middlebox test
pub const MIXED_CASE_HEADER: &str = "UsEr-AgEnT";

/// Header value with deliberately mixed case for the middlebox test
pub const MIXED_CASE_VALUE: &str = "MoZiLLa/5.0 (WinDoWW NT 10.0; Win64; x64) AppleWEbKIT/537.36 \
     (KHTML, like GeCko) ChROmE/58.0.3029.110 SaFAri/537.3";

/// Invented request methods for the invalid request line test
pub const INVALID_METHODS: [&str; 4] = ["FOO", "BAR", "BAZ", "QUX"];

/// Payload appended to ICMPv6 echo requests
pub const ICMPV6_PAYLOAD: &[u8; 32] = b"abcdefghijklmnopqrstuvwabcdefghi";

// ============================================================================
// SENTINELS
// ============================================================================

pub const NOT_AVAILABLE: &str = "N/A";
pub const OK: &str = "OK";
pub const FAIL: &str = "Fail";
pub const FAILED: &str = "Failed";
pub const ESTABLISHED: &str = "Established";
pub const REDIRECTED: &str = "Redirected";
pub const NOT_REDIRECTED: &str = "Not redirected";
pub const MANIPULATED: &str = "Manipulated";
pub const MANIPULATE: &str = "Manipulate";
pub const NO_MANIPULATION: &str = "No manipulation";
pub const NO_CENSORSHIP: &str = "No censorship found";

// ============================================================================
// END OF CONSTANTS
// ============================================================================
