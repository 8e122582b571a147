//! In-memory filesystem implementation
//!
//! Simple, fast, ephemeral - one instance per compiler invocation. Besides
//! plain files and directories it supports lazily-backed entries whose bytes
//! are pulled from their backing resource the first time the compiler opens
//! them, never at registration time.

use super::{DirEntry, FileHandle, FileSystem, Metadata, OpenOptions};
use crate::fetch::{FetchError, FetchResult};
use slab::Slab;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::rc::Rc;

/// Loader invoked to materialize a lazily-backed entry. The argument is the
/// entry's backing resource path.
pub type LazyLoader = Rc<dyn Fn(&str) -> FetchResult<Vec<u8>>>;

/// A file's open state
struct OpenFile {
    path: String,
    position: u64,
    readable: bool,
    writable: bool,
}

/// A stored file, lazy entry or directory
#[derive(Clone)]
enum Node {
    File(Vec<u8>),
    Lazy { resource: String, load: LazyLoader },
    Directory,
}

/// In-memory filesystem
pub struct MemoryFs {
    /// All files and directories, keyed by normalized path
    nodes: HashMap<String, Node>,
    /// Open file handles
    handles: Slab<OpenFile>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut fs = Self {
            nodes: HashMap::new(),
            handles: Slab::new(),
        };
        // Root directory always exists
        fs.nodes.insert("/".to_string(), Node::Directory);
        fs
    }

    /// Normalize a path (ensure leading slash, no trailing slash except root)
    fn normalize_path(path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        if path.len() > 1 && path.ends_with('/') {
            path[..path.len() - 1].to_string()
        } else {
            path
        }
    }

    /// Get parent directory of a path
    fn parent_path(path: &str) -> Option<String> {
        let path = Self::normalize_path(path);
        if path == "/" {
            return None;
        }
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/".to_string())
        } else {
            Some(path[..idx].to_string())
        }
    }

    /// Ensure the parent directory exists
    fn ensure_parent(&mut self, path: &str) -> io::Result<()> {
        if let Some(parent) = Self::parent_path(path) {
            if !self.nodes.contains_key(&parent) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Parent directory not found: {}", parent),
                ));
            }
        }
        Ok(())
    }

    /// Register a lazily-backed file entry.
    ///
    /// No bytes are fetched here; `load` runs on first open. The parent
    /// directory must already exist.
    pub fn register_lazy(&mut self, path: &str, resource: &str, load: LazyLoader) -> io::Result<()> {
        let path = Self::normalize_path(path);

        if self.nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Path already exists: {}", path),
            ));
        }

        self.ensure_parent(&path)?;
        self.nodes.insert(
            path,
            Node::Lazy {
                resource: resource.to_string(),
                load,
            },
        );
        Ok(())
    }

    /// True if the entry at `path` is still lazily backed (not yet fetched).
    pub fn is_lazy(&self, path: &str) -> bool {
        matches!(
            self.nodes.get(&Self::normalize_path(path)),
            Some(Node::Lazy { .. })
        )
    }

    /// Replace a lazy node with its fetched contents. No-op for other nodes.
    fn materialize(&mut self, path: &str) -> io::Result<()> {
        let (resource, load) = match self.nodes.get(path) {
            Some(Node::Lazy { resource, load }) => (resource.clone(), Rc::clone(load)),
            _ => return Ok(()),
        };

        let bytes = load(&resource).map_err(fetch_to_io)?;
        self.nodes.insert(path.to_string(), Node::File(bytes));
        Ok(())
    }
}

fn fetch_to_io(err: FetchError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn open(&mut self, path: &str, options: OpenOptions) -> io::Result<FileHandle> {
        let path = Self::normalize_path(path);

        // First open of a lazily-backed entry pulls its bytes.
        self.materialize(&path)?;

        let exists = self.nodes.contains_key(&path);

        if !exists && !options.create {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("File not found: {}", path),
            ));
        }

        if !exists {
            // Create new file
            self.ensure_parent(&path)?;
            self.nodes.insert(path.clone(), Node::File(Vec::new()));
        } else if options.truncate {
            // Truncate existing file
            if let Some(Node::File(data)) = self.nodes.get_mut(&path) {
                data.clear();
            }
        }

        // Verify it's a file, not directory
        match self.nodes.get(&path) {
            Some(Node::Directory) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Cannot open directory as file",
                ));
            }
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
            _ => {}
        }

        // Create handle
        let handle = self.handles.insert(OpenFile {
            path,
            position: 0,
            readable: options.read,
            writable: options.write,
        });

        Ok(handle)
    }

    fn close(&mut self, handle: FileHandle) -> io::Result<()> {
        if self.handles.contains(handle) {
            self.handles.remove(handle);
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid file handle",
            ))
        }
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> io::Result<usize> {
        let file = self
            .handles
            .get_mut(handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid file handle"))?;

        if !file.readable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "File not opened for reading",
            ));
        }

        let path = file.path.clone();
        let position = file.position as usize;

        let data = match self.nodes.get(&path) {
            Some(Node::File(data)) => data,
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
        };

        let available = data.len().saturating_sub(position);
        let to_read = buf.len().min(available);

        buf[..to_read].copy_from_slice(&data[position..position + to_read]);

        // Update position
        if let Some(file) = self.handles.get_mut(handle) {
            file.position += to_read as u64;
        }

        Ok(to_read)
    }

    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .handles
            .get_mut(handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid file handle"))?;

        if !file.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "File not opened for writing",
            ));
        }

        let path = file.path.clone();
        let position = file.position as usize;

        let data = match self.nodes.get_mut(&path) {
            Some(Node::File(data)) => data,
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
        };

        // Extend file if necessary
        if position + buf.len() > data.len() {
            data.resize(position + buf.len(), 0);
        }

        data[position..position + buf.len()].copy_from_slice(buf);

        // Update position
        if let Some(file) = self.handles.get_mut(handle) {
            file.position += buf.len() as u64;
        }

        Ok(buf.len())
    }

    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> io::Result<u64> {
        let file = self
            .handles
            .get_mut(handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid file handle"))?;

        let path = file.path.clone();
        let current = file.position;

        let size = match self.nodes.get(&path) {
            Some(Node::File(data)) => data.len() as u64,
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
        };

        let new_pos = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::End(n) => {
                if n >= 0 {
                    size + n as u64
                } else {
                    size.saturating_sub((-n) as u64)
                }
            }
            SeekFrom::Current(n) => {
                if n >= 0 {
                    current + n as u64
                } else {
                    current.saturating_sub((-n) as u64)
                }
            }
        };

        if let Some(file) = self.handles.get_mut(handle) {
            file.position = new_pos;
        }

        Ok(new_pos)
    }

    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        let path = Self::normalize_path(path);

        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(Metadata {
                size: data.len() as u64,
                is_dir: false,
                is_file: true,
            }),
            // Size unknown until first open; registration never fetches.
            Some(Node::Lazy { .. }) => Ok(Metadata {
                size: 0,
                is_dir: false,
                is_file: true,
            }),
            Some(Node::Directory) => Ok(Metadata {
                size: 0,
                is_dir: true,
                is_file: false,
            }),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "Path not found")),
        }
    }

    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        let path = Self::normalize_path(path);

        if self.nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Path already exists",
            ));
        }

        self.ensure_parent(&path)?;
        self.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = Self::normalize_path(path);

        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Not a directory",
                ));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "Directory not found",
                ));
            }
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let entries: Vec<DirEntry> = self
            .nodes
            .iter()
            .filter_map(|(p, node)| {
                if p == &path {
                    return None; // Skip self
                }

                // Check if this is a direct child
                if !p.starts_with(&prefix) {
                    return None;
                }

                let relative = &p[prefix.len()..];
                if relative.contains('/') {
                    return None; // Not a direct child
                }

                Some(DirEntry {
                    name: relative.to_string(),
                    is_dir: matches!(node, Node::Directory),
                })
            })
            .collect();

        Ok(entries)
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        let path = Self::normalize_path(path);

        match self.nodes.get(&path) {
            Some(Node::File(_)) | Some(Node::Lazy { .. }) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot remove directory with remove_file",
            )),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
        }
    }

    fn exists(&self, path: &str) -> bool {
        let path = Self::normalize_path(path);
        self.nodes.contains_key(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_basic_file_ops() {
        let mut fs = MemoryFs::new();

        // Create and write
        let handle = fs
            .open("/out.s", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(handle, b"ret").unwrap();
        fs.close(handle).unwrap();

        // Read back
        let handle = fs.open("/out.s", OpenOptions::new().read(true)).unwrap();
        let mut buf = [0u8; 3];
        let n = fs.read(handle, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"ret");
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_lazy_entry_fetches_on_first_open_only() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/includes").unwrap();

        let fetches = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&fetches);
        let load: LazyLoader = Rc::new(move |resource: &str| {
            counter.set(counter.get() + 1);
            Ok(format!("// {}", resource).into_bytes())
        });

        fs.register_lazy("/includes/stdio.h", "musl/stdio.h", load)
            .unwrap();

        // Registration alone performs no fetch.
        assert_eq!(fetches.get(), 0);
        assert!(fs.is_lazy("/includes/stdio.h"));

        let handle = fs
            .open("/includes/stdio.h", OpenOptions::new().read(true))
            .unwrap();
        let mut buf = [0u8; 64];
        let n = fs.read(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"// musl/stdio.h");
        fs.close(handle).unwrap();
        assert_eq!(fetches.get(), 1);

        // Second open reads the materialized bytes, no second fetch.
        let handle = fs
            .open("/includes/stdio.h", OpenOptions::new().read(true))
            .unwrap();
        fs.close(handle).unwrap();
        assert_eq!(fetches.get(), 1);
        assert!(!fs.is_lazy("/includes/stdio.h"));
    }

    #[test]
    fn test_lazy_entry_fetch_failure_surfaces_as_io_error() {
        let mut fs = MemoryFs::new();
        let load: LazyLoader = Rc::new(|resource: &str| {
            Err(crate::cache::fetch_unavailable(resource, "offline"))
        });
        fs.register_lazy("/gone.h", "gone.h", load).unwrap();

        let err = fs.open("/gone.h", OpenOptions::new().read(true));
        assert!(err.is_err());
        // Still lazy: a later open may retry.
        assert!(fs.is_lazy("/gone.h"));
    }

    #[test]
    fn test_register_lazy_requires_parent() {
        let mut fs = MemoryFs::new();
        let load: LazyLoader = Rc::new(|_| Ok(Vec::new()));
        let err = fs.register_lazy("/no/such/dir.h", "dir.h", load);
        assert!(err.is_err());
    }

    #[test]
    fn test_metadata_for_lazy_and_dir() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/includes").unwrap();
        let load: LazyLoader = Rc::new(|_| Ok(b"abc".to_vec()));
        fs.register_lazy("/includes/a.h", "a.h", load).unwrap();

        let meta = fs.metadata("/includes/a.h").unwrap();
        assert!(meta.is_file);
        assert_eq!(meta.size, 0);

        let meta = fs.metadata("/includes").unwrap();
        assert!(meta.is_dir);

        // After first open the size is real.
        let handle = fs
            .open("/includes/a.h", OpenOptions::new().read(true))
            .unwrap();
        fs.close(handle).unwrap();
        assert_eq!(fs.metadata("/includes/a.h").unwrap().size, 3);
    }
}
