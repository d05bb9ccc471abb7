use std::time::Duration;

/// YYYYMMDD version reported by the HTTP surface.
pub const API_VERSION: &str = "20210512";

/// Host architecture classes that queues are keyed on.
pub const ARCHITECTURES: [&str; 4] = ["x86_64", "aarch64", "ppc64le", "s390x"];

/// Environment drivers known to the system.
pub const DRIVERS: [&str; 2] = ["docker", "opennebula"];

/// Queue cost levels, cheapest first.
pub const COSTS: [u8; 5] = [0, 1, 2, 3, 4];

pub const X32_ARCHITECTURES: [&str; 4] = ["i386", "i486", "i586", "i686"];

pub const RHEL_FLAVORS: [&str; 4] = ["rhel", "fedora", "centos", "almalinux"];
pub const DEBIAN_FLAVORS: [&str; 3] = ["debian", "ubuntu", "raspbian"];

pub const ALLOWED_CHANNELS: [&str; 2] = ["stable", "beta"];

/// Exit code reported when an external command hits its timeout; reuses the
/// HTTP 408 status as a sentinel.
pub const COMMAND_TIMEOUT_EXIT_CODE: i32 = 408;

pub const DEFAULT_SSH_AUTH_METHODS: [&str; 4] = [
    "gssapi-keyex",
    "gssapi-with-mic",
    "hostbased",
    "publickey",
];

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
