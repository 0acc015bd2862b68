//! Running platform identification

/// Platform identifier of the running build, e.g. `linux-x86_64`.
///
/// Returns `None` on operating systems or architectures we do not ship for.
pub fn current_platform() -> Option<String> {
    platform_id(std::env::consts::OS, std::env::consts::ARCH)
}

/// Build a platform identifier from OS and architecture names
pub fn platform_id(os: &str, arch: &str) -> Option<String> {
    let os = match os {
        "linux" => "linux",
        "windows" => "windows",
        "macos" => "macos",
        _ => return None,
    };
    let arch = match arch {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        _ => return None,
    };
    Some(format!("{}-{}", os, arch))
}
