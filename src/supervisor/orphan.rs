//! Orphan transcoder probe
//!
//! The lock file protects against two live supervisors; it cannot protect
//! against a transcoder child that outlived a crashed supervisor. Before
//! spawning, the supervisor scans the process table for a live transcoder
//! whose command line references this stream (its input URL or its
//! artifact directory) and refuses to start while one exists.

use std::path::Path;

/// Find a live transcoder process referencing any of the needles.
///
/// Matches processes whose argv0 ends with the transcoder binary name and
/// whose arguments contain one of the needle strings. Returns the first
/// matching pid.
#[cfg(unix)]
pub fn find_orphan(ffmpeg_bin: &str, needles: &[String]) -> Option<u32> {
    let bin_name = Path::new(ffmpeg_bin)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())?;

    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };

        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let argv: Vec<String> = raw
            .split(|&b| b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();

        if cmdline_matches(&argv, &bin_name, needles) {
            return Some(pid);
        }
    }

    None
}

#[cfg(not(unix))]
pub fn find_orphan(_ffmpeg_bin: &str, _needles: &[String]) -> Option<u32> {
    None
}

/// Whether an argv belongs to a transcoder serving one of the needles
fn cmdline_matches(argv: &[String], bin_name: &str, needles: &[String]) -> bool {
    let Some(argv0) = argv.first() else {
        return false;
    };

    let program = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.clone());
    if program != bin_name {
        return false;
    }

    argv.iter()
        .skip(1)
        .any(|arg| needles.iter().any(|needle| arg.contains(needle.as_str())))
}
