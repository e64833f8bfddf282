use std::path::{Path, PathBuf};

use thiserror::Error;

pub const BINARY_NAME: &str = if cfg!(windows) { "tunnel.exe" } else { "tunnel" };
/// target OS overrides, first non-empty one wins
pub const DEST_OS_ENVS: [&str; 2] = ["TUNNEL_DEST_OS", "GO_DEST_OS"];
pub const DEST_ARCH_ENVS: [&str; 2] = ["TUNNEL_DEST_ARCH", "GO_DEST_ARCH"];
/// checked in order when the target architecture is `arm`
pub const ARM_VERSION_ENVS: [&str; 3] = ["TUNNEL_DEST_ARM", "GO_DEST_ARM", "GOARM"];

#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("target arch is arm but none of TUNNEL_DEST_ARM, GO_DEST_ARM or GOARM is set")]
    MissingArmVersion,
    #[error("tunnel client binary not found at {0:?}")]
    NotFound(PathBuf),
}

/// Finds the prebuilt client under `<base>/_private/bin/<os>/<arch>[/<armv>]`,
/// using the environment of the current process.
pub fn locate(base: &Path) -> Result<PathBuf, BinaryError> {
    locate_with(base, |key| std::env::var(key).ok())
}

/// Same as [`locate`], reading overrides through `env`.
pub fn locate_with(
    base: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, BinaryError> {
    let lookup = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| env(*key).filter(|value| !value.is_empty()))
    };
    let os = lookup(&DEST_OS_ENVS[..])
        .unwrap_or_else(|| platform_os(std::env::consts::OS).to_string());
    let arch = lookup(&DEST_ARCH_ENVS[..])
        .unwrap_or_else(|| platform_arch(std::env::consts::ARCH).to_string());

    let mut dir = base.join("_private").join("bin").join(&os).join(&arch);
    if arch == "arm" {
        let version = lookup(&ARM_VERSION_ENVS[..]).ok_or(BinaryError::MissingArmVersion)?;
        dir = dir.join(version);
    }

    let path = dir.join(BINARY_NAME);
    if !path.is_file() {
        return Err(BinaryError::NotFound(path));
    }
    Ok(path)
}

// release archives of the client are laid out with Go platform names
fn platform_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn platform_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        other => other,
    }
}
