//! Virtual filesystem provisioner
//!
//! Walks the include manifest and builds the directory tree the compiler
//! expects under a fixed root, registering every include file as a
//! lazily-backed entry. Also supplies the two environment values the
//! compiler's driver reads to locate its runtime and standard-library
//! headers.

use super::memory::{LazyLoader, MemoryFs};
use super::{FileSystem, OpenOptions};
use std::collections::HashMap;
use std::io;

/// Root directory every manifest entry is mounted under.
pub const INCLUDE_ROOT: &str = "/includes";

/// Where the compiler's own runtime headers live inside the VFS.
pub const RUNTIME_INCLUDE: (&str, &str) = ("KEFIR_RTINC", "/includes/kefir");

/// Where the musl standard-library headers live inside the VFS. Paired with
/// the fixed `x86_64-linux-musl` target every job inherits.
pub const STDLIB_INCLUDE: (&str, &str) = ("KEFIR_MUSL_INCLUDE", "/includes/musl");

/// What provisioning actually did - used to verify idempotence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub directories_created: usize,
    pub files_registered: usize,
}

/// The fixed environment the compiler reads on startup.
pub fn compiler_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    for (key, value) in [RUNTIME_INCLUDE, STDLIB_INCLUDE] {
        env.insert(key.to_string(), value.to_string());
    }
    env
}

/// Populate `fs` from the manifest.
///
/// For each entry `a/b/x`, ensures `/includes/a` and `/includes/a/b` exist
/// (skipping segments already present, so entries sharing a parent create it
/// once) and registers `/includes/a/b/x` as a lazy file backed by the
/// resource path `a/b/x`.
pub fn provision_includes(
    fs: &mut MemoryFs,
    manifest: &[String],
    load: LazyLoader,
) -> io::Result<ProvisionReport> {
    let mut report = ProvisionReport::default();

    ensure_dir(fs, INCLUDE_ROOT, &mut report)?;

    for entry in manifest {
        if entry.is_empty() {
            continue;
        }

        let mount = format!("{}/{}", INCLUDE_ROOT, entry);

        // Create every ancestor directory, root-first.
        if let Some((dir_part, _file_name)) = mount.rsplit_once('/') {
            let mut partial = String::new();
            for segment in dir_part.split('/').filter(|s| !s.is_empty()) {
                partial.push('/');
                partial.push_str(segment);
                ensure_dir(fs, &partial, &mut report)?;
            }
        }

        fs.register_lazy(&mount, entry, load.clone())?;
        report.files_registered += 1;
    }

    Ok(report)
}

/// Create a directory if it does not already exist.
fn ensure_dir(fs: &mut MemoryFs, path: &str, report: &mut ProvisionReport) -> io::Result<()> {
    if fs.exists(path) {
        return Ok(());
    }
    fs.create_dir(path)?;
    report.directories_created += 1;
    Ok(())
}

/// Convenience used by tests and diagnostics: read a provisioned file.
pub fn read_provisioned(fs: &mut MemoryFs, path: &str) -> io::Result<Vec<u8>> {
    let handle = fs.open(path, OpenOptions::new().read(true))?;
    let size = fs.metadata(path)?.size as usize;
    let mut buf = vec![0u8; size];
    fs.read(handle, &mut buf)?;
    fs.close(handle)?;
    Ok(buf)
}
