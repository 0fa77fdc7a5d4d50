use std::collections::HashSet;
use std::path::Path;

/// Launcher relative path → platform tag.
///
/// A platform counts as updateable when at least one of its launchers is
/// installed. Note the `winx` entries: the x64 Windows binaries also serve
/// arm64 machines through emulation, so they ship to every Windows install.
const LAUNCHERS: &[(&str, &str)] = &[
    ("spectra-linux-arm64", "linux-arm64"),
    ("spectra-linux-x64", "linux64"),
    ("spectra-windows-arm64.exe", "win-arm64"),
    ("spectra-windows-x64.exe", "winx"),
    ("config/strut/strut-linux-arm64", "linux-arm64"),
    ("config/strut/strut-linux-x64", "linux64"),
    ("config/strut/strut-windows-arm64.exe", "win-arm64"),
    ("config/strut/strut-windows-x64.exe", "winx"),
    ("Contents/MacOS/spectra-macos-arm64", "macos-arm64"),
    ("Contents/MacOS/spectra-macos-x64", "macosx"),
    ("Contents/MacOS/spectra-macos-universal", "macos-arm64"),
    // Legacy launcher generation.
    ("Spectra-linux32", "linux32"),
    ("Spectra-linux64", "linux64"),
    ("Contents/MacOS/Spectra-macosx", "macosx"),
    ("Spectra-win32.exe", "win32"),
    ("Spectra-win64.exe", "win64"),
];

/// Every recognized tag: concrete platforms plus the `*x` OS families.
const KNOWN_PLATFORMS: &[&str] = &[
    "linux-arm64",
    "linux32",
    "linux64",
    "linuxx",
    "macos-arm64",
    "macos64",
    "macosx",
    "win-arm64",
    "win32",
    "win64",
    "winx",
];

pub fn known() -> &'static [&'static str] {
    KNOWN_PLATFORMS
}

pub fn launchers() -> impl Iterator<Item = &'static str> {
    LAUNCHERS.iter().map(|(path, _)| *path)
}

fn in_app_bundle(filename: &str) -> bool {
    match filename.find('/') {
        Some(slash) => filename[..slash].ends_with(".app"),
        None => false,
    }
}

/// The platform a launcher file belongs to. Files inside a top-level `*.app`
/// folder all count as macOS launchers so the signed bundle stays together.
pub fn platform_for_launcher(filename: &str) -> Option<&'static str> {
    if in_app_bundle(filename) {
        return Some("macosx");
    }
    LAUNCHERS
        .iter()
        .find(|(path, _)| *path == filename)
        .map(|(_, platform)| *platform)
}

pub fn is_launcher(filename: &str) -> bool {
    platform_for_launcher(filename).is_some()
}

pub fn is_windows(platform: &str) -> bool {
    platform.starts_with("win")
}

pub fn is_macos(platform: &str) -> bool {
    platform.starts_with("macos")
}

pub fn is_linux(platform: &str) -> bool {
    platform.starts_with("linux")
}

/// Does `candidate` (a tag from the catalog) apply to `platform`?
/// Family tags (`linuxx`, `macosx`, `winx`) match every concrete platform of
/// their operating system.
pub fn matches(platform: &str, candidate: &str) -> bool {
    platform == candidate
        || ("linuxx" == candidate && is_linux(platform))
        || ("macosx" == candidate && is_macos(platform))
        || ("winx" == candidate && is_windows(platform))
}

pub fn matches_any(platforms: &HashSet<String>, candidate: &str) -> bool {
    platforms.iter().any(|platform| matches(platform, candidate))
}

/// Short platform name of the running machine, OS plus CPU architecture.
pub fn current() -> String {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "macos",
        "windows" => "win",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86" => "32",
        "x86_64" => "64",
        "aarch64" => "-arm64",
        "arm" => "-arm32",
        other => return format!("{os}-{other}"),
    };
    format!("{os}{arch}")
}

/// A platform is active if it is the running platform, one of its launchers
/// is installed, or a platform-specific `jars/` or `lib/` directory exists.
pub fn infer_active(root: Option<&Path>) -> HashSet<String> {
    let mut active = HashSet::new();
    active.insert(current());

    let Some(root) = root else {
        return active;
    };

    for (launcher, platform) in LAUNCHERS {
        if root.join(launcher).exists() {
            active.insert((*platform).to_string());
        }
    }

    for special_dir in ["jars", "lib"] {
        for platform in KNOWN_PLATFORMS {
            if root.join(special_dir).join(platform).is_dir() {
                active.insert((*platform).to_string());
            }
        }
    }

    active
}

/// Is the path platform-scoped, i.e. `jars/<tag>/...` or `lib/<tag>/...`?
/// Returns the tag when the second component is a known platform.
pub fn platform_of_path(filename: &str) -> Option<&str> {
    let rest = filename
        .strip_prefix("jars/")
        .or_else(|| filename.strip_prefix("lib/"))?;
    let tag = &rest[..rest.find('/')?];
    KNOWN_PLATFORMS.iter().find(|known| **known == tag).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_lookup() {
        assert_eq!(platform_for_launcher("spectra-linux-x64"), Some("linux64"));
        assert_eq!(
            platform_for_launcher("config/strut/strut-windows-x64.exe"),
            Some("winx")
        );
        assert_eq!(platform_for_launcher("jars/engine.jar"), None);
    }

    #[test]
    fn app_bundle_files_are_launchers() {
        assert!(is_launcher("Spectra.app/Contents/MacOS/spectra"));
        assert_eq!(
            platform_for_launcher("Spectra.app/Contents/Info.plist"),
            Some("macosx")
        );
    }

    #[test]
    fn families_match_concrete_platforms() {
        assert!(matches("linux64", "linuxx"));
        assert!(matches("macos-arm64", "macosx"));
        assert!(matches("win32", "winx"));
        assert!(!matches("linux64", "winx"));
        assert!(matches("linux64", "linux64"));
    }

    #[test]
    fn platform_scoped_paths() {
        assert_eq!(platform_of_path("jars/linux64/native.jar"), Some("linux64"));
        assert_eq!(platform_of_path("lib/win64/library.dll"), Some("win64"));
        assert_eq!(platform_of_path("jars/common.jar"), None);
        assert_eq!(platform_of_path("plugins/linux64/x.jar"), None);
    }
}
