//! Version command

/// Print the version of the binary
pub fn version_command() {
    println!("podvisor {}", env!("CARGO_PKG_VERSION"));
}
